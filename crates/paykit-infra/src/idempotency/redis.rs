//! Redis-backed idempotency store
//!
//! Shares processed-event state between every instance behind the webhook
//! endpoint. Claims use `SET NX PX`, so the insert-if-absent is atomic on the
//! server; expiry is delegated to Redis key TTLs.

use async_trait::async_trait;
use chrono::Utc;
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{ClaimOutcome, IdempotencyConfig, IdempotencyStore, ProcessedEventRecord, ProcessingStatus};
use crate::{InfraError, Result};

/// Attempts at claim-or-read before giving up on a key that keeps vanishing
const CLAIM_ROUNDS: usize = 3;

/// Delete the key only while it still holds an in-progress claim
const RELEASE_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then
    return 0
end
local ok, record = pcall(cjson.decode, raw)
if ok and record.status == 'in_progress' then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

#[derive(Clone)]
pub struct RedisIdempotencyStore {
    connection: ConnectionManager,
    config: IdempotencyConfig,
}

impl RedisIdempotencyStore {
    pub async fn connect(url: &str, config: IdempotencyConfig) -> Result<Self> {
        info!("Connecting idempotency store to Redis at {}", url);

        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;

        info!("Redis idempotency store ready");

        Ok(Self { connection, config })
    }

    pub fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    fn key(&self, event_id: &str) -> String {
        record_key(&self.config.key_prefix, event_id)
    }

    async fn read(&self, key: &str) -> Result<Option<ProcessedEventRecord>> {
        let mut conn = self.connection.clone();
        let raw: Option<String> = conn.get(key).await?;

        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn write(&self, key: &str, record: &ProcessedEventRecord) -> Result<()> {
        let ttl = self.config.ttl_for(record.status);
        let mut conn = self.connection.clone();

        if ttl.is_zero() {
            let _: () = conn.del(key).await?;
            return Ok(());
        }

        let payload = serde_json::to_string(record)?;
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(payload)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;

        Ok(())
    }

    /// Previous attempt count, so reclaims keep counting
    async fn previous_attempts(&self, key: &str) -> u32 {
        match self.read(key).await {
            Ok(Some(record)) => record.attempts,
            Ok(None) => 1,
            Err(e) => {
                warn!(key, error = %e, "Unreadable idempotency record, resetting attempts");
                1
            }
        }
    }
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn has_been_processed(&self, event_id: &str) -> Result<bool> {
        let mut conn = self.connection.clone();
        let exists: bool = conn.exists(self.key(event_id)).await?;
        Ok(exists)
    }

    async fn try_claim(&self, event_id: &str, event_type: &str) -> Result<ClaimOutcome> {
        let key = self.key(event_id);
        let claim = ProcessedEventRecord::claim(event_id, event_type, Utc::now(), 1);
        let payload = serde_json::to_string(&claim)?;

        for _ in 0..CLAIM_ROUNDS {
            let mut conn = self.connection.clone();
            let reply: Option<String> = redis::cmd("SET")
                .arg(&key)
                .arg(&payload)
                .arg("NX")
                .arg("PX")
                .arg(ttl_millis(self.config.claim_ttl))
                .query_async(&mut conn)
                .await?;

            if reply.is_some() {
                debug!(event_id, event_type, "Claimed event in Redis");
                return Ok(ClaimOutcome::Claimed);
            }

            // The key may expire between the failed SET and this GET.
            if let Some(existing) = self.read(&key).await? {
                debug!(event_id, status = %existing.status, "Event already recorded in Redis");
                return Ok(ClaimOutcome::Existing(existing));
            }
        }

        Err(InfraError::Store(format!(
            "could not claim or read record for event {event_id}"
        )))
    }

    async fn mark_processed(
        &self,
        event_id: &str,
        event_type: &str,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Result<()> {
        let key = self.key(event_id);
        let mut record =
            ProcessedEventRecord::new(event_id, event_type, ProcessingStatus::Processed, Utc::now());
        record.metadata = metadata;
        record.attempts = self.previous_attempts(&key).await;

        self.write(&key, &record).await?;
        debug!(event_id, event_type, "Event marked as processed in Redis");
        Ok(())
    }

    async fn mark_failed(&self, event_id: &str, event_type: &str, error: &str) -> Result<()> {
        let key = self.key(event_id);
        let mut record =
            ProcessedEventRecord::new(event_id, event_type, ProcessingStatus::Failed, Utc::now());
        record
            .metadata
            .insert("error".to_string(), serde_json::Value::String(error.to_string()));
        record.attempts = self.previous_attempts(&key).await;

        self.write(&key, &record).await?;
        info!(event_id, event_type, error, "Event marked as failed in Redis");
        Ok(())
    }

    async fn release(&self, event_id: &str) -> Result<bool> {
        let mut conn = self.connection.clone();
        let removed: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(self.key(event_id))
            .invoke_async(&mut conn)
            .await?;

        if removed > 0 {
            debug!(event_id, "Released in-progress claim in Redis");
        }
        Ok(removed > 0)
    }

    async fn get(&self, event_id: &str) -> Result<Option<ProcessedEventRecord>> {
        self.read(&self.key(event_id)).await
    }

    async fn cleanup(&self) -> Result<usize> {
        // Redis expires keys on its own.
        Ok(0)
    }
}

fn record_key(prefix: &str, event_id: &str) -> String {
    format!("{}{}", prefix, event_id)
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}
