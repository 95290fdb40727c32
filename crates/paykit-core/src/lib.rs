//! Core types and configuration for PayKit
//!
//! Shared by the infrastructure crate (retry, idempotency) and the webhook
//! crate (verification, processing).

pub mod config;
pub mod error;
pub mod time;

pub use config::*;
pub use error::*;
pub use time::{Clock, ManualClock, SystemClock};
