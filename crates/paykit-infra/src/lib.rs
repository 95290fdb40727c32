//! Infrastructure for the PayKit webhook pipeline
//!
//! - [`resilience`]: bounded exponential-backoff retry with optional
//!   error classification and cancellation
//! - [`idempotency`]: processed-event bookkeeping with TTL expiry, in memory
//!   or backed by Redis

pub mod idempotency;
pub mod resilience;

pub use idempotency::{
    ClaimOutcome, IdempotencyConfig, IdempotencyStore, InMemoryIdempotencyStore,
    ProcessedEventRecord, ProcessingStatus, RedisIdempotencyStore,
};

pub use resilience::{
    is_retryable_error, is_retryable_status, retry, with_conditional_retry,
    with_conditional_retry_cancellable, RetryConfig, RetryError, RetryHandler, Retryable,
};

#[derive(Debug, thiserror::Error)]
pub enum InfraError {
    #[error("Cache error: {0}")]
    Cache(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Idempotency store error: {0}")]
    Store(String),
}

pub type Result<T> = std::result::Result<T, InfraError>;
