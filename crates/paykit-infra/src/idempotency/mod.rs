//! Processed-event bookkeeping
//!
//! Guarantees that a logical webhook event drives business side effects at
//! most once across provider redeliveries. Records expire after a
//! status-dependent TTL and expired records count as absent.
//!
//! # Storage options
//!
//! - [`InMemoryIdempotencyStore`]: one instance per process, not shared
//!   between replicas
//! - [`RedisIdempotencyStore`]: shared keystore for multi-instance deployments

pub mod memory;
pub mod redis;

pub use self::memory::InMemoryIdempotencyStore;
pub use self::redis::RedisIdempotencyStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use paykit_core::IdempotencySettings;

use crate::Result;

/// Processing status of a recorded event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    /// Claimed by a worker, handler still running
    InProgress,
    /// Handler completed
    Processed,
    /// Handler failed after all retries
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Processed => "processed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One record per event id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedEventRecord {
    pub event_id: String,
    pub event_type: String,
    /// Time of the last status change
    pub processed_at: DateTime<Utc>,
    pub status: ProcessingStatus,
    /// Opaque diagnostics; failures carry their message under `error`
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Number of times this event was claimed for processing
    #[serde(default = "default_attempts")]
    pub attempts: u32,
}

fn default_attempts() -> u32 {
    1
}

impl ProcessedEventRecord {
    pub fn new(
        event_id: &str,
        event_type: &str,
        status: ProcessingStatus,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: event_id.to_string(),
            event_type: event_type.to_string(),
            processed_at: at,
            status,
            metadata: HashMap::new(),
            attempts: 1,
        }
    }

    /// Fresh in-progress claim
    pub fn claim(event_id: &str, event_type: &str, at: DateTime<Utc>, attempts: u32) -> Self {
        Self {
            attempts,
            ..Self::new(event_id, event_type, ProcessingStatus::InProgress, at)
        }
    }

    /// Error message recorded by `mark_failed`
    pub fn error(&self) -> Option<&str> {
        self.metadata.get("error").and_then(|v| v.as_str())
    }
}

/// Result of an atomic insert-if-absent
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// No live record existed; the caller now owns processing
    Claimed,
    /// A live record already exists
    Existing(ProcessedEventRecord),
}

impl ClaimOutcome {
    pub fn is_claimed(&self) -> bool {
        matches!(self, Self::Claimed)
    }
}

/// Idempotency store configuration
#[derive(Debug, Clone)]
pub struct IdempotencyConfig {
    /// Lifetime of processed records
    pub ttl: Duration,
    /// Lifetime of failed records
    pub failed_ttl: Duration,
    /// Lease on in-progress claims
    pub claim_ttl: Duration,
    /// Upper bound on stored records (in-memory store only). New claims are
    /// refused once live records fill it.
    pub max_entries: usize,
    /// Sweep expired records every N store operations (in-memory store only)
    pub sweep_interval: u64,
    /// Key namespace (Redis store only)
    pub key_prefix: String,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(7 * 24 * 60 * 60),
            failed_ttl: Duration::from_secs(300),
            claim_ttl: Duration::from_secs(300),
            max_entries: 100_000,
            sweep_interval: 1000,
            key_prefix: "paykit:webhook:".to_string(),
        }
    }
}

impl IdempotencyConfig {
    /// Set the lifetime of processed records
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set the lifetime of failed records
    pub fn with_failed_ttl(mut self, ttl: Duration) -> Self {
        self.failed_ttl = ttl;
        self
    }

    /// Set the lease on in-progress claims
    pub fn with_claim_ttl(mut self, ttl: Duration) -> Self {
        self.claim_ttl = ttl;
        self
    }

    /// Set the record bound, at least 1
    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = max.max(1);
        self
    }

    /// Sweep every N operations; 0 disables the lazy sweep
    pub fn with_sweep_interval(mut self, every: u64) -> Self {
        self.sweep_interval = every;
        self
    }

    /// Set the Redis key namespace
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// TTL that applies to a record in `status`
    pub fn ttl_for(&self, status: ProcessingStatus) -> Duration {
        match status {
            ProcessingStatus::InProgress => self.claim_ttl,
            ProcessingStatus::Processed => self.ttl,
            ProcessingStatus::Failed => self.failed_ttl,
        }
    }

    /// A record is expired once it is older than its TTL; a zero TTL means
    /// the record never counts as live.
    pub fn is_expired(&self, record: &ProcessedEventRecord, now: DateTime<Utc>) -> bool {
        let ttl = self.ttl_for(record.status);
        if ttl.is_zero() {
            return true;
        }

        // A clock that moved backwards yields a negative age; treat it as fresh.
        let age = (now - record.processed_at).to_std().unwrap_or(Duration::ZERO);
        age > ttl
    }
}

impl From<&IdempotencySettings> for IdempotencyConfig {
    fn from(settings: &IdempotencySettings) -> Self {
        Self::default()
            .with_ttl(settings.ttl())
            .with_failed_ttl(settings.failed_ttl())
            .with_claim_ttl(settings.claim_ttl())
            .with_max_entries(settings.max_entries)
            .with_key_prefix(settings.key_prefix.clone())
    }
}

/// Storage backend for processed-event bookkeeping
///
/// Implementations must make [`IdempotencyStore::try_claim`] atomic per event
/// id: two concurrent claims for the same id must never both succeed.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// `false` if the event was never seen or its record expired. An expired
    /// record is evicted as a side effect.
    async fn has_been_processed(&self, event_id: &str) -> Result<bool>;

    /// Insert an in-progress record unless a live one exists
    async fn try_claim(&self, event_id: &str, event_type: &str) -> Result<ClaimOutcome>;

    /// Record successful processing (idempotent upsert)
    async fn mark_processed(
        &self,
        event_id: &str,
        event_type: &str,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Result<()>;

    /// Record a failed processing attempt
    async fn mark_failed(&self, event_id: &str, event_type: &str, error: &str) -> Result<()>;

    /// Drop an in-progress claim so the next delivery can claim again.
    /// Settled records are left untouched; returns whether a claim was removed.
    async fn release(&self, event_id: &str) -> Result<bool>;

    /// Live record for an event, if any
    async fn get(&self, event_id: &str) -> Result<Option<ProcessedEventRecord>>;

    /// Remove expired records, returning how many were removed
    async fn cleanup(&self) -> Result<usize>;
}
