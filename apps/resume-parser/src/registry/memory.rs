use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use super::{DeduplicationStore, ProcessingKey, ProcessingRecord, RegistryError};

#[derive(Debug)]
struct Entry {
    record: ProcessingRecord,
    inserted_at: Instant,
    ttl: Duration,
}

impl Entry {
    fn age(&self) -> Duration {
        self.inserted_at.elapsed()
    }

    fn is_expired(&self) -> bool {
        self.age() > self.ttl
    }
}

/// Single-process dedup store backed by a mutex-guarded map.
#[derive(Debug, Default)]
pub struct InMemoryDeduplicationStore {
    entries: Mutex<HashMap<ProcessingKey, Entry>>,
}

impl InMemoryDeduplicationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeduplicationStore for InMemoryDeduplicationStore {
    async fn try_insert(&self, record: ProcessingRecord, ttl: Duration) -> Result<bool, RegistryError> {
        let mut entries = self.entries.lock().await;
        if let Some(existing) = entries.get(&record.key) {
            if !existing.is_expired() {
                return Ok(false);
            }
        }
        entries.insert(
            record.key.clone(),
            Entry {
                record,
                inserted_at: Instant::now(),
                ttl,
            },
        );
        Ok(true)
    }

    async fn update(&self, record: &ProcessingRecord) -> Result<bool, RegistryError> {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(&record.key) {
            Some(entry) if entry.record.owner == record.owner => {
                entry.record = record.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, key: &ProcessingKey) -> Result<Option<ProcessingRecord>, RegistryError> {
        let entries = self.entries.lock().await;
        Ok(entries
            .get(key)
            .filter(|e| !e.is_expired())
            .map(|e| e.record.clone()))
    }

    async fn remove(&self, key: &ProcessingKey, owner: Uuid) -> Result<bool, RegistryError> {
        let mut entries = self.entries.lock().await;
        if entries.get(key).is_some_and(|e| e.record.owner == owner) {
            entries.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn purge_older_than(&self, max_age: Duration) -> Result<Vec<ProcessingKey>, RegistryError> {
        let mut entries = self.entries.lock().await;
        let stale: Vec<ProcessingKey> = entries
            .iter()
            .filter(|(_, entry)| entry.age() > max_age)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            entries.remove(key);
        }
        Ok(stale)
    }

    async fn len(&self) -> Result<usize, RegistryError> {
        let entries = self.entries.lock().await;
        Ok(entries.values().filter(|e| !e.is_expired()).count())
    }
}
