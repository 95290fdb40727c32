//! Routing of verified events to application handlers

use async_trait::async_trait;
use paykit_infra::{is_retryable_status, Retryable};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::events::{EventType, WebhookEvent};

/// Error returned by an application handler
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The event content is unacceptable; retrying will not help
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("handler timed out")]
    Timeout,

    /// A downstream service answered with an error status
    #[error("upstream returned {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("{0}")]
    Other(String),
}

impl HandlerError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn upstream(status: u16, message: impl Into<String>) -> Self {
        Self::Upstream {
            status,
            message: message.into(),
        }
    }
}

impl Retryable for HandlerError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Transient(_) | Self::Timeout => true,
            Self::Upstream { status, .. } => is_retryable_status(*status),
            Self::Validation(_) | Self::Other(_) => false,
        }
    }
}

impl From<reqwest::Error> for HandlerError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout
        } else if let Some(status) = error.status() {
            Self::upstream(status.as_u16(), error.to_string())
        } else if error.is_connect() {
            Self::transient(error.to_string())
        } else {
            Self::Other(error.to_string())
        }
    }
}

impl From<tokio::time::error::Elapsed> for HandlerError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::Timeout
    }
}

/// Business logic for one kind of event
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &WebhookEvent) -> Result<(), HandlerError>;
}

/// Adapter turning an async closure into an [`EventHandler`]
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(WebhookEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, event: &WebhookEvent) -> Result<(), HandlerError> {
        (self.f)(event.clone()).await
    }
}

/// Wrap a closure as a shareable handler
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(WebhookEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

/// Maps event types to handlers
#[derive(Clone, Default)]
pub struct EventRouter {
    handlers: HashMap<EventType, Arc<dyn EventHandler>>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `event_type`, replacing any previous one
    pub fn on(mut self, event_type: EventType, handler: Arc<dyn EventHandler>) -> Self {
        self.register(event_type, handler);
        self
    }

    pub fn register(&mut self, event_type: EventType, handler: Arc<dyn EventHandler>) {
        info!(event_type = %event_type, "Registering event handler");
        self.handlers.insert(event_type, handler);
    }

    pub fn handles(&self, event_type: EventType) -> bool {
        self.handlers.contains_key(&event_type)
    }

    pub fn registered_types(&self) -> Vec<EventType> {
        self.handlers.keys().copied().collect()
    }

    /// Run the handler for the event's type. Events without a handler are
    /// acknowledged without side effects.
    pub async fn dispatch(&self, event: &WebhookEvent) -> Result<(), HandlerError> {
        match self.handlers.get(&event.event_type()) {
            Some(handler) => {
                debug!(
                    event_id = %event.id(),
                    event_type = %event.event_type(),
                    "Dispatching event"
                );
                handler.handle(event).await
            }
            None => {
                info!(
                    event_id = %event.id(),
                    provider = %event.provider(),
                    raw_type = event.raw_type(),
                    "No handler registered for event type, acknowledging"
                );
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRouter")
            .field("handlers", &self.registered_types())
            .finish()
    }
}
