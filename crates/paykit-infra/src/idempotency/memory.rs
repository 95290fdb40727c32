//! In-memory idempotency store
//!
//! Suitable for single-instance deployments only: records live in this
//! process and are lost on restart. Expired records are swept lazily on
//! access, never by a background task.
//!
//! At `max_entries` the store makes room by dropping expired and failed
//! records only. Live processed records and claims are never evicted, so a
//! store full of them refuses new claims with [`InfraError::Store`] and the
//! provider redelivers later.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use paykit_core::{Clock, SystemClock};

use super::{ClaimOutcome, IdempotencyConfig, IdempotencyStore, ProcessedEventRecord, ProcessingStatus};
use crate::{InfraError, Result};

pub struct InMemoryIdempotencyStore {
    records: DashMap<String, ProcessedEventRecord>,
    config: IdempotencyConfig,
    clock: Arc<dyn Clock>,
    operations: AtomicU64,
}

impl InMemoryIdempotencyStore {
    pub fn new(config: IdempotencyConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: IdempotencyConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            records: DashMap::new(),
            config,
            clock,
            operations: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    /// Number of stored records, expired ones included until swept
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.records.len();
        self.records.retain(|_, record| !self.config.is_expired(record, now));
        before.saturating_sub(self.records.len())
    }

    /// Count the operation and sweep every `sweep_interval` calls
    fn tick(&self) {
        let interval = self.config.sweep_interval;
        if interval == 0 {
            return;
        }

        let count = self.operations.fetch_add(1, Ordering::Relaxed) + 1;
        if count % interval == 0 {
            let removed = self.sweep_expired();
            if removed > 0 {
                debug!(removed, "Swept expired idempotency records");
            }
        }
    }

    /// Free a slot for a new record, evicting expired records first and then
    /// the oldest failed ones.
    fn make_room(&self) -> Result<()> {
        let max = self.config.max_entries;
        if self.records.len() < max {
            return Ok(());
        }

        let swept = self.sweep_expired();
        if self.records.len() < max {
            debug!(swept, "Swept expired records to make room");
            return Ok(());
        }

        let mut failed: Vec<(String, chrono::DateTime<chrono::Utc>)> = self
            .records
            .iter()
            .filter(|r| r.status == ProcessingStatus::Failed)
            .map(|r| (r.key().clone(), r.processed_at))
            .collect();
        failed.sort_by_key(|(_, at)| *at);

        let excess = self.records.len() + 1 - max;
        let mut evicted = 0usize;
        for (event_id, _) in failed.into_iter().take(excess) {
            if self
                .records
                .remove_if(&event_id, |_, r| r.status == ProcessingStatus::Failed)
                .is_some()
            {
                evicted += 1;
            }
        }

        if evicted > 0 {
            warn!(evicted, max, "Idempotency store at capacity, evicted failed records");
        }

        if self.records.len() < max {
            return Ok(());
        }

        warn!(
            records = self.records.len(),
            max,
            "Idempotency store full of live records, refusing new claims"
        );
        Err(InfraError::Store(format!(
            "idempotency store at capacity ({max} live records)"
        )))
    }

    fn upsert(
        &self,
        event_id: &str,
        event_type: &str,
        status: ProcessingStatus,
        metadata: HashMap<String, serde_json::Value>,
    ) {
        let now = self.clock.now();

        match self.records.entry(event_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                let record = occupied.get_mut();
                record.event_type = event_type.to_string();
                record.status = status;
                record.processed_at = now;
                record.metadata = metadata;
            }
            Entry::Vacant(vacant) => {
                let mut record = ProcessedEventRecord::new(event_id, event_type, status, now);
                record.metadata = metadata;
                vacant.insert(record);
            }
        }
    }
}

impl Default for InMemoryIdempotencyStore {
    fn default() -> Self {
        Self::new(IdempotencyConfig::default())
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn has_been_processed(&self, event_id: &str) -> Result<bool> {
        self.tick();
        let now = self.clock.now();

        if self
            .records
            .remove_if(event_id, |_, record| self.config.is_expired(record, now))
            .is_some()
        {
            debug!(event_id, "Evicted expired idempotency record");
            return Ok(false);
        }

        Ok(self.records.contains_key(event_id))
    }

    async fn try_claim(&self, event_id: &str, event_type: &str) -> Result<ClaimOutcome> {
        self.tick();
        let now = self.clock.now();

        // Concurrent first claims may each pass this check, so the bound is soft
        // by at most the number of racing claims.
        if !self.records.contains_key(event_id) {
            self.make_room()?;
        }

        // The entry guard holds the shard lock, making check-and-set atomic.
        let outcome = match self.records.entry(event_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                if self.config.is_expired(occupied.get(), now) {
                    let attempts = occupied.get().attempts.saturating_add(1);
                    occupied.insert(ProcessedEventRecord::claim(event_id, event_type, now, attempts));
                    ClaimOutcome::Claimed
                } else {
                    ClaimOutcome::Existing(occupied.get().clone())
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(ProcessedEventRecord::claim(event_id, event_type, now, 1));
                ClaimOutcome::Claimed
            }
        };

        match &outcome {
            ClaimOutcome::Claimed => {
                debug!(event_id, event_type, "Claimed event for processing");
            }
            ClaimOutcome::Existing(record) => {
                debug!(event_id, status = %record.status, "Event already recorded");
            }
        }

        Ok(outcome)
    }

    async fn mark_processed(
        &self,
        event_id: &str,
        event_type: &str,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Result<()> {
        self.tick();
        self.upsert(event_id, event_type, ProcessingStatus::Processed, metadata);
        debug!(event_id, event_type, "Event marked as processed");
        Ok(())
    }

    async fn mark_failed(&self, event_id: &str, event_type: &str, error: &str) -> Result<()> {
        self.tick();
        let mut metadata = HashMap::new();
        metadata.insert("error".to_string(), serde_json::Value::String(error.to_string()));
        self.upsert(event_id, event_type, ProcessingStatus::Failed, metadata);
        info!(event_id, event_type, error, "Event marked as failed");
        Ok(())
    }

    async fn release(&self, event_id: &str) -> Result<bool> {
        self.tick();
        let released = self
            .records
            .remove_if(event_id, |_, record| record.status == ProcessingStatus::InProgress)
            .is_some();

        if released {
            debug!(event_id, "Released in-progress claim");
        }
        Ok(released)
    }

    async fn get(&self, event_id: &str) -> Result<Option<ProcessedEventRecord>> {
        let now = self.clock.now();

        if self
            .records
            .remove_if(event_id, |_, record| self.config.is_expired(record, now))
            .is_some()
        {
            return Ok(None);
        }

        Ok(self.records.get(event_id).map(|r| r.clone()))
    }

    async fn cleanup(&self) -> Result<usize> {
        let removed = self.sweep_expired();
        if removed > 0 {
            info!(removed, remaining = self.records.len(), "Cleaned up idempotency records");
        }
        Ok(removed)
    }
}
