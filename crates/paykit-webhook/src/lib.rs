//! Inbound payment webhooks for PayKit
//!
//! This crate turns a raw provider callback into exactly-once business
//! dispatch:
//! - Signature verification for Stripe (HMAC-SHA256) and PayPal
//!   (verification API, with a manual CRC32 + RSA-SHA256 fallback)
//! - Deduplication through an injected idempotency store
//! - Retry-wrapped routing of typed events to application handlers
//! - An axum router mapping outcomes to the status codes that drive provider
//!   redelivery
//!
//! # Example
//!
//! ```rust,ignore
//! use paykit_infra::{InMemoryIdempotencyStore, RetryConfig};
//! use paykit_webhook::{
//!     handler_fn, EventRouter, EventType, Provider, StripeSignatureVerifier,
//!     WebhookAuthenticator, WebhookProcessor,
//! };
//! use std::sync::Arc;
//!
//! let store = Arc::new(InMemoryIdempotencyStore::default());
//! let authenticator = WebhookAuthenticator::new(Provider::Stripe)
//!     .with_strategy(Arc::new(StripeSignatureVerifier::new("whsec_...")));
//! let router = EventRouter::new().on(
//!     EventType::PaymentCaptured,
//!     handler_fn(|event| async move {
//!         tracing::info!(event_id = %event.id(), "payment captured");
//!         Ok(())
//!     }),
//! );
//!
//! let processor = WebhookProcessor::builder(authenticator)
//!     .store(store)
//!     .router(router)
//!     .retry(RetryConfig::default())
//!     .build()?;
//! ```

pub mod dispatch;
pub mod events;
pub mod inbound;
pub mod processor;
pub mod signature;

pub use dispatch::*;
pub use events::*;
pub use inbound::*;
pub use processor::*;
pub use signature::*;

use thiserror::Error;

/// Webhook errors
#[derive(Error, Debug)]
pub enum WebhookError {
    #[error("Configuration error: {0}")]
    Configuration(String),
}

pub type Result<T> = std::result::Result<T, WebhookError>;
