//! Webhook processing pipeline
//!
//! ```text
//! Unverified ──verify──▶ Verified ──claim──▶ Dispatching ──▶ Processed
//!     │                     │                    │
//!     ▼                     ▼                    ▼
//!  Rejected             Duplicate              Failed
//! ```
//!
//! Rejected requests never reach the idempotency store or the router.

use paykit_infra::{
    is_retryable_error, ClaimOutcome, IdempotencyStore, ProcessedEventRecord, ProcessingStatus,
    RetryConfig, RetryHandler,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dispatch::{EventRouter, HandlerError};
use crate::events::WebhookEvent;
use crate::signature::{VerificationError, WebhookAuthenticator, WebhookRequest};
use crate::{Result, WebhookError};

/// Event id reported when a request never got far enough to have one
pub const UNKNOWN_EVENT_ID: &str = "unknown";

/// Terminal state of one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingOutcome {
    /// Signature or payload rejected
    Rejected,
    /// Already handled, or being handled by a concurrent delivery
    Duplicate,
    /// Handler completed
    Processed,
    /// Handler or store failed; the provider should redeliver
    Failed,
}

impl ProcessingOutcome {
    /// Whether the provider should stop redelivering
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Duplicate | Self::Processed)
    }
}

/// Response contract returned to the HTTP layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookResult {
    pub success: bool,
    pub event_id: String,
    pub message: String,
    pub outcome: ProcessingOutcome,
    pub elapsed_ms: u64,
}

impl WebhookResult {
    fn new(
        outcome: ProcessingOutcome,
        event_id: impl Into<String>,
        message: String,
        started: Instant,
    ) -> Self {
        Self {
            success: outcome.is_success(),
            event_id: event_id.into(),
            message,
            outcome,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }

    fn rejected(error: &VerificationError, started: Instant) -> Self {
        Self::new(
            ProcessingOutcome::Rejected,
            UNKNOWN_EVENT_ID,
            format!("Webhook verification failed: {}", error),
            started,
        )
    }

    fn duplicate(event_id: &str, record: &ProcessedEventRecord, started: Instant) -> Self {
        let message = match record.status {
            ProcessingStatus::InProgress => {
                format!("Event {} is already being processed", event_id)
            }
            _ => format!("Event {} already processed", event_id),
        };
        Self::new(ProcessingOutcome::Duplicate, event_id, message, started)
    }

    fn processed(event_id: &str, started: Instant) -> Self {
        Self::new(
            ProcessingOutcome::Processed,
            event_id,
            format!("Event {} processed successfully", event_id),
            started,
        )
    }

    fn failed(event_id: &str, error: impl std::fmt::Display, started: Instant) -> Self {
        Self::new(
            ProcessingOutcome::Failed,
            event_id,
            format!("Event {} processing failed: {}", event_id, error),
            started,
        )
    }
}

/// How handler errors are retried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryMode {
    /// Retry every handler error
    Always,
    /// Retry only errors classified as transient
    #[default]
    Conditional,
}

/// Per-outcome counters
#[derive(Debug, Default)]
pub struct ProcessorStats {
    received: AtomicU64,
    rejected: AtomicU64,
    duplicates: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time copy of [`ProcessorStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub rejected: u64,
    pub duplicates: u64,
    pub processed: u64,
    pub failed: u64,
}

impl ProcessorStats {
    fn record(&self, outcome: ProcessingOutcome) {
        let counter = match outcome {
            ProcessingOutcome::Rejected => &self.rejected,
            ProcessingOutcome::Duplicate => &self.duplicates,
            ProcessingOutcome::Processed => &self.processed,
            ProcessingOutcome::Failed => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Verifies, deduplicates and dispatches webhooks for one provider
pub struct WebhookProcessor {
    authenticator: WebhookAuthenticator,
    store: Arc<dyn IdempotencyStore>,
    router: EventRouter,
    retry: RetryHandler,
    retry_mode: RetryMode,
    stats: ProcessorStats,
}

impl WebhookProcessor {
    pub fn builder(authenticator: WebhookAuthenticator) -> WebhookProcessorBuilder {
        WebhookProcessorBuilder {
            authenticator,
            store: None,
            router: EventRouter::new(),
            retry: RetryConfig::default(),
            retry_mode: RetryMode::default(),
        }
    }

    pub fn authenticator(&self) -> &WebhookAuthenticator {
        &self.authenticator
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Run a raw delivery through the whole pipeline
    pub async fn process(
        &self,
        request: &WebhookRequest,
        cancel: &CancellationToken,
    ) -> WebhookResult {
        let started = Instant::now();
        self.stats.received.fetch_add(1, Ordering::Relaxed);

        let event = match self.authenticator.authenticate(request).await {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    provider = %self.authenticator.provider(),
                    error = %e,
                    "Rejected webhook"
                );
                return self.finish(WebhookResult::rejected(&e, started));
            }
        };

        let result = self.handle_verified(&event, cancel, started).await;
        self.finish(result)
    }

    /// Run an already verified event from the deduplication step on
    pub async fn process_event(
        &self,
        event: &WebhookEvent,
        cancel: &CancellationToken,
    ) -> WebhookResult {
        let started = Instant::now();
        self.stats.received.fetch_add(1, Ordering::Relaxed);

        let result = self.handle_verified(event, cancel, started).await;
        self.finish(result)
    }

    fn finish(&self, result: WebhookResult) -> WebhookResult {
        self.stats.record(result.outcome);
        result
    }

    async fn handle_verified(
        &self,
        event: &WebhookEvent,
        cancel: &CancellationToken,
        started: Instant,
    ) -> WebhookResult {
        let event_id = event.id();
        let event_type = event.event_type().as_str();
        let key = event.idempotency_key();

        match self.store.try_claim(&key, event_type).await {
            Ok(ClaimOutcome::Claimed) => {
                debug!(event_id, event_type, "Claimed event for processing");
            }
            Ok(ClaimOutcome::Existing(record)) if record.status == ProcessingStatus::Failed => {
                let previous = record.error().unwrap_or("unknown error").to_string();
                info!(
                    event_id,
                    error = %previous,
                    "Event failed recently, deferring redelivery"
                );
                return WebhookResult::failed(
                    event_id,
                    format!("previous attempt failed: {}", previous),
                    started,
                );
            }
            Ok(ClaimOutcome::Existing(record)) => {
                info!(event_id, status = %record.status, "Duplicate webhook event");
                return WebhookResult::duplicate(event_id, &record, started);
            }
            Err(e) => {
                error!(event_id, error = %e, "Idempotency store unavailable");
                return WebhookResult::failed(
                    event_id,
                    format!("idempotency store unavailable: {}", e),
                    started,
                );
            }
        }

        let attempts = AtomicU32::new(0);
        let operation = || {
            attempts.fetch_add(1, Ordering::Relaxed);
            self.router.dispatch(event)
        };
        let dispatched = match self.retry_mode {
            RetryMode::Always => self.retry.execute_cancellable(operation, cancel).await,
            RetryMode::Conditional => {
                self.retry
                    .execute_if_cancellable(
                        operation,
                        |e: &HandlerError| is_retryable_error(e),
                        cancel,
                    )
                    .await
            }
        };
        let attempts = attempts.into_inner();

        match dispatched {
            Ok(()) => {
                let metadata = HashMap::from([
                    ("provider".to_string(), serde_json::json!(event.provider())),
                    ("raw_type".to_string(), serde_json::json!(event.raw_type())),
                    ("handler_attempts".to_string(), serde_json::json!(attempts)),
                ]);

                if let Err(e) = self.store.mark_processed(&key, event_type, metadata).await {
                    // The claim lapses after its lease, so a redelivery will run
                    // the handler again.
                    error!(event_id, error = %e, "Failed to record processed event");
                    return WebhookResult::failed(
                        event_id,
                        format!("idempotency store unavailable: {}", e),
                        started,
                    );
                }

                info!(event_id, event_type, attempts, "Webhook event processed");
                WebhookResult::processed(event_id, started)
            }
            Err(e) => {
                let message = e.to_string();
                error!(event_id, event_type, attempts, error = %message, "Webhook event failed");

                if let Err(store_error) = self.store.mark_failed(&key, event_type, &message).await {
                    // A claim left behind would answer the redelivery as a duplicate.
                    error!(event_id, error = %store_error, "Failed to record failed event");
                    if let Err(release_error) = self.store.release(&key).await {
                        error!(
                            event_id,
                            error = %release_error,
                            "Failed to release claim, redeliveries wait for its lease"
                        );
                    }
                }

                WebhookResult::failed(event_id, message, started)
            }
        }
    }
}

impl std::fmt::Debug for WebhookProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookProcessor")
            .field("authenticator", &self.authenticator)
            .field("router", &self.router)
            .field("retry", self.retry.config())
            .field("retry_mode", &self.retry_mode)
            .finish()
    }
}

/// Builder for [`WebhookProcessor`]
pub struct WebhookProcessorBuilder {
    authenticator: WebhookAuthenticator,
    store: Option<Arc<dyn IdempotencyStore>>,
    router: EventRouter,
    retry: RetryConfig,
    retry_mode: RetryMode,
}

impl WebhookProcessorBuilder {
    /// Shared idempotency store; required
    pub fn store(mut self, store: Arc<dyn IdempotencyStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Handlers for verified events
    pub fn router(mut self, router: EventRouter) -> Self {
        self.router = router;
        self
    }

    /// Backoff policy around handler dispatch
    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.retry = config;
        self
    }

    /// Which handler errors are retried
    pub fn retry_mode(mut self, mode: RetryMode) -> Self {
        self.retry_mode = mode;
        self
    }

    pub fn build(self) -> Result<WebhookProcessor> {
        let store = self.store.ok_or_else(|| {
            WebhookError::Configuration("webhook processor requires an idempotency store".to_string())
        })?;

        Ok(WebhookProcessor {
            authenticator: self.authenticator,
            store,
            router: self.router,
            retry: RetryHandler::new(self.retry),
            retry_mode: self.retry_mode,
            stats: ProcessorStats::default(),
        })
    }
}
