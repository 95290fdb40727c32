//! Retry policies
//!
//! Executes an async operation up to `max_attempts` times with capped
//! exponential backoff between attempts.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use paykit_core::RetrySettings;

/// Retry configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total number of attempts, the first one included (at least 1)
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Growth factor applied per attempt
    pub backoff_multiplier: f64,
    /// Whether to add random jitter on top of the capped delay
    pub jitter: bool,
    /// Jitter factor (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            backoff_multiplier: 2.0,
            jitter: false,
            jitter_factor: 0.25,
        }
    }
}

impl RetryConfig {
    /// Create a new retry config with the given attempt budget
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Default::default()
        }
    }

    /// A single attempt, no retries
    pub fn no_retry() -> Self {
        Self::new(1)
    }

    /// Set initial delay
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enable jitter with the given factor
    pub fn with_jitter(mut self, factor: f64) -> Self {
        self.jitter = true;
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    /// Attempt budget, never below one
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay to wait after `completed` failed attempts, before the next one.
    ///
    /// `min(initial * multiplier^(completed - 1), max)`; zero when nothing has
    /// been attempted yet.
    pub fn delay_for_attempt(&self, completed: u32) -> Duration {
        if completed == 0 {
            return Duration::ZERO;
        }

        let delay = self.capped_delay(completed);

        if self.jitter {
            self.add_jitter(delay)
        } else {
            delay
        }
    }

    /// Deterministic delays before attempts 2..=max_attempts (jitter excluded)
    pub fn backoff_schedule(&self) -> Vec<Duration> {
        (1..self.attempts()).map(|k| self.capped_delay(k)).collect()
    }

    fn capped_delay(&self, completed: u32) -> Duration {
        let multiplier = if self.backoff_multiplier.is_finite() {
            self.backoff_multiplier.max(1.0)
        } else {
            1.0
        };
        let exponent = i32::try_from(completed - 1).unwrap_or(i32::MAX);
        let nanos = self.initial_delay.as_nanos() as f64 * multiplier.powi(exponent);

        if !nanos.is_finite() || nanos >= self.max_delay.as_nanos() as f64 {
            return self.max_delay;
        }

        Duration::from_nanos(nanos.round() as u64).min(self.max_delay)
    }

    fn add_jitter(&self, delay: Duration) -> Duration {
        let jitter_range = delay.mul_f64(self.jitter_factor);
        if jitter_range.is_zero() {
            return delay;
        }

        let mut rng = rand::thread_rng();
        let jitter = rng.gen_range(Duration::ZERO..jitter_range);

        if rng.gen_bool(0.5) {
            delay + jitter
        } else {
            delay.saturating_sub(jitter)
        }
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(settings: &RetrySettings) -> Self {
        Self::new(settings.max_attempts)
            .with_initial_delay(Duration::from_millis(settings.initial_delay_ms))
            .with_max_delay(Duration::from_millis(settings.max_delay_ms))
            .with_backoff_multiplier(settings.backoff_multiplier)
    }
}

/// Failure of a retried operation. The underlying error stays reachable
/// through [`std::error::Error::source`].
#[derive(Debug, Error)]
pub enum RetryError<E: std::error::Error + 'static> {
    /// Every attempt failed
    #[error("operation failed after {attempts} attempt(s): {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: E,
    },

    /// The classifier refused to retry this error
    #[error("operation failed with a non-retryable error on attempt {attempt}: {source}")]
    NonRetryable {
        attempt: u32,
        #[source]
        source: E,
    },

    /// The caller cancelled before an attempt succeeded
    #[error("operation cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32, last_error: Option<E> },
}

impl<E: std::error::Error + 'static> RetryError<E> {
    /// Number of attempts that were started
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. } | Self::Cancelled { attempts, .. } => *attempts,
            Self::NonRetryable { attempt, .. } => *attempt,
        }
    }

    /// The last error returned by the operation, if any
    pub fn last_error(&self) -> Option<&E> {
        match self {
            Self::Exhausted { source, .. } | Self::NonRetryable { source, .. } => Some(source),
            Self::Cancelled { last_error, .. } => last_error.as_ref(),
        }
    }

    pub fn into_last_error(self) -> Option<E> {
        match self {
            Self::Exhausted { source, .. } | Self::NonRetryable { source, .. } => Some(source),
            Self::Cancelled { last_error, .. } => last_error,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Classification of errors worth retrying
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Whether an error is transient (network reset, timeout, 5xx, 429)
pub fn is_retryable_error<E: Retryable + ?Sized>(error: &E) -> bool {
    error.is_retryable()
}

/// 5xx responses and 429 Too Many Requests are transient
pub fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..=599).contains(&status)
}

impl Retryable for std::io::Error {
    fn is_retryable(&self) -> bool {
        use std::io::ErrorKind;

        matches!(
            self.kind(),
            ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::ConnectionRefused
                | ErrorKind::BrokenPipe
                | ErrorKind::TimedOut
                | ErrorKind::Interrupted
                | ErrorKind::UnexpectedEof
        )
    }
}

impl Retryable for tokio::time::error::Elapsed {
    fn is_retryable(&self) -> bool {
        true
    }
}

impl Retryable for reqwest::Error {
    fn is_retryable(&self) -> bool {
        self.is_timeout()
            || self.is_connect()
            || self
                .status()
                .map_or(false, |status| is_retryable_status(status.as_u16()))
    }
}

/// Retry executor
#[derive(Debug, Clone, Default)]
pub struct RetryHandler {
    config: RetryConfig,
}

impl RetryHandler {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Retry every error until the attempt budget is spent
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + 'static,
    {
        self.run(operation, |_: &E| true, None).await
    }

    pub async fn execute_cancellable<F, Fut, T, E>(
        &self,
        operation: F,
        cancel: &CancellationToken,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + 'static,
    {
        self.run(operation, |_: &E| true, Some(cancel)).await
    }

    /// Retry only errors accepted by `should_retry`
    pub async fn execute_if<F, Fut, T, E, P>(
        &self,
        operation: F,
        should_retry: P,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + 'static,
        P: Fn(&E) -> bool,
    {
        self.run(operation, should_retry, None).await
    }

    pub async fn execute_if_cancellable<F, Fut, T, E, P>(
        &self,
        operation: F,
        should_retry: P,
        cancel: &CancellationToken,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + 'static,
        P: Fn(&E) -> bool,
    {
        self.run(operation, should_retry, Some(cancel)).await
    }

    async fn run<F, Fut, T, E, P>(
        &self,
        mut operation: F,
        should_retry: P,
        cancel: Option<&CancellationToken>,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + 'static,
        P: Fn(&E) -> bool,
    {
        let max_attempts = self.config.attempts();
        let mut attempt = 0u32;
        let mut last_error: Option<E> = None;

        loop {
            if cancel.map_or(false, CancellationToken::is_cancelled) {
                debug!(attempts = attempt, "Retry cancelled before next attempt");
                return Err(RetryError::Cancelled {
                    attempts: attempt,
                    last_error,
                });
            }

            attempt += 1;

            let result = match cancel {
                Some(token) => tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        debug!(attempt, "Retry cancelled during attempt");
                        return Err(RetryError::Cancelled { attempts: attempt, last_error });
                    }
                    result = operation() => result,
                },
                None => operation().await,
            };

            let error = match result {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            if !should_retry(&error) {
                warn!(attempt, error = %error, "Operation failed with non-retryable error");
                return Err(RetryError::NonRetryable {
                    attempt,
                    source: error,
                });
            }

            if attempt >= max_attempts {
                warn!(attempts = attempt, error = %error, "Retry attempts exhausted");
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    source: error,
                });
            }

            let delay = self.config.delay_for_attempt(attempt);
            warn!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Attempt failed, retrying"
            );
            last_error = Some(error);

            match cancel {
                Some(token) => tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        debug!(attempts = attempt, "Retry cancelled during backoff");
                        return Err(RetryError::Cancelled { attempts: attempt, last_error });
                    }
                    _ = tokio::time::sleep(delay) => {}
                },
                None => tokio::time::sleep(delay).await,
            }
        }
    }
}

/// Retry `operation` on any error
pub async fn retry<F, Fut, T, E>(config: RetryConfig, operation: F) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::error::Error + 'static,
{
    RetryHandler::new(config).execute(operation).await
}

/// Retry `operation` only while its errors are classified as transient
pub async fn with_conditional_retry<F, Fut, T, E>(
    config: RetryConfig,
    operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::error::Error + Retryable + 'static,
{
    RetryHandler::new(config)
        .execute_if(operation, |error: &E| is_retryable_error(error))
        .await
}

pub async fn with_conditional_retry_cancellable<F, Fut, T, E>(
    config: RetryConfig,
    operation: F,
    cancel: &CancellationToken,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::error::Error + Retryable + 'static,
{
    RetryHandler::new(config)
        .execute_if_cancellable(operation, |error: &E| is_retryable_error(error), cancel)
        .await
}
