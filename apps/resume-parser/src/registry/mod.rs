//! Processing registry: at most one live orchestration per (résumé, organization).
//!
//! The registry sits on a `DeduplicationStore`. The in-memory store only
//! deduplicates within one process; the Redis store uses `SET NX PX` so every
//! instance sharing the queue group sees the same records.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub mod memory;
pub mod redis;
pub mod sweeper;

pub use memory::InMemoryDeduplicationStore;
pub use self::redis::RedisDeduplicationStore;
pub use sweeper::RegistrySweeper;

/// Dedup key: (résumé id, organization id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingKey {
    pub resume_id: String,
    pub organization_id: String,
}

impl ProcessingKey {
    pub fn new(resume_id: &str, organization_id: &str) -> Self {
        Self {
            resume_id: resume_id.to_string(),
            organization_id: organization_id.to_string(),
        }
    }
}

impl fmt::Display for ProcessingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.resume_id, self.organization_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingRecord {
    pub key: ProcessingKey,
    /// Identifies the run that created the record. A run whose record was
    /// reclaimed can not touch the record of the run that replaced it.
    pub owner: Uuid,
    pub started_at: DateTime<Utc>,
    pub content_hash: Option<String>,
    pub attempt_count: u32,
}

impl ProcessingRecord {
    pub fn new(key: ProcessingKey) -> Self {
        Self {
            key,
            owner: Uuid::new_v4(),
            started_at: Utc::now(),
            content_hash: None,
            attempt_count: 0,
        }
    }

    pub fn lease(&self) -> ProcessingLease {
        ProcessingLease {
            key: self.key.clone(),
            owner: self.owner,
        }
    }
}

/// Handed out by `begin`; required for bookkeeping and release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingLease {
    pub key: ProcessingKey,
    pub owner: Uuid,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("Record serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Storage behind the processing registry.
///
/// `try_insert` must be atomic: of two concurrent inserts for the same key,
/// exactly one returns `true`. A record older than `ttl` counts as absent.
#[async_trait]
pub trait DeduplicationStore: Send + Sync {
    async fn try_insert(&self, record: ProcessingRecord, ttl: Duration) -> Result<bool, RegistryError>;

    /// Overwrites the stored record only if it has the same owner. Returns
    /// whether it did; a missing record is left missing.
    async fn update(&self, record: &ProcessingRecord) -> Result<bool, RegistryError>;

    async fn get(&self, key: &ProcessingKey) -> Result<Option<ProcessingRecord>, RegistryError>;

    /// Deletes the record for `key` only if `owner` created it.
    async fn remove(&self, key: &ProcessingKey, owner: Uuid) -> Result<bool, RegistryError>;

    /// Deletes records older than `max_age` and returns their keys.
    async fn purge_older_than(&self, max_age: Duration) -> Result<Vec<ProcessingKey>, RegistryError>;

    async fn len(&self) -> Result<usize, RegistryError>;
}

#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// Age after which a record is treated as abandoned.
    pub processing_timeout: Duration,
    pub sweep_interval: Duration,
    pub sweep_enabled: bool,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            processing_timeout: Duration::from_secs(10 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
            sweep_enabled: true,
        }
    }
}

/// Orchestrator-facing handle over the dedup store. Cheap to clone.
#[derive(Clone)]
pub struct ProcessingRegistry {
    store: Arc<dyn DeduplicationStore>,
    settings: RegistrySettings,
}

impl ProcessingRegistry {
    pub fn new(store: Arc<dyn DeduplicationStore>, settings: RegistrySettings) -> Self {
        Self { store, settings }
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    /// Claims `key`. Returns `None` when another run already holds it.
    pub async fn begin(&self, key: &ProcessingKey) -> Result<Option<ProcessingLease>, RegistryError> {
        let record = ProcessingRecord::new(key.clone());
        let lease = record.lease();
        if !self
            .store
            .try_insert(record, self.settings.processing_timeout)
            .await?
        {
            return Ok(None);
        }
        debug!("Registered in-flight processing for {key}");
        Ok(Some(lease))
    }

    pub async fn record_content_hash(&self, lease: &ProcessingLease, hash: &str) -> Result<(), RegistryError> {
        self.modify(lease, |record| record.content_hash = Some(hash.to_string()))
            .await
    }

    pub async fn record_attempts(&self, lease: &ProcessingLease, attempts: u32) -> Result<(), RegistryError> {
        self.modify(lease, |record| record.attempt_count = attempts)
            .await
    }

    async fn modify(
        &self,
        lease: &ProcessingLease,
        change: impl FnOnce(&mut ProcessingRecord),
    ) -> Result<(), RegistryError> {
        let Some(mut record) = self.store.get(&lease.key).await? else {
            return Ok(());
        };
        if record.owner != lease.owner {
            warn!("Processing record for {} now belongs to another run", lease.key);
            return Ok(());
        }
        change(&mut record);
        self.store.update(&record).await?;
        Ok(())
    }

    pub async fn get(&self, key: &ProcessingKey) -> Result<Option<ProcessingRecord>, RegistryError> {
        self.store.get(key).await
    }

    pub async fn finish(&self, lease: &ProcessingLease) -> Result<(), RegistryError> {
        if self.store.remove(&lease.key, lease.owner).await? {
            debug!("Released processing record for {}", lease.key);
        } else {
            warn!("Processing record for {} was already reclaimed", lease.key);
        }
        Ok(())
    }

    /// Removes abandoned records so a later resubmission is not blocked forever.
    pub async fn sweep(&self) -> Result<usize, RegistryError> {
        let purged = self
            .store
            .purge_older_than(self.settings.processing_timeout)
            .await?;
        for key in &purged {
            info!("Reclaimed abandoned processing record for {key}");
        }
        Ok(purged.len())
    }

    pub async fn in_flight(&self) -> Result<usize, RegistryError> {
        self.store.len().await
    }
}
