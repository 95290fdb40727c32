//! Resilience patterns for webhook dispatch
//!
//! The unconditional and conditional retry variants share one loop and one
//! backoff formula; classification is a separate, composable policy.

pub mod retry;

pub use retry::{
    is_retryable_error, is_retryable_status, retry, with_conditional_retry,
    with_conditional_retry_cancellable, RetryConfig, RetryError, RetryHandler, Retryable,
};
