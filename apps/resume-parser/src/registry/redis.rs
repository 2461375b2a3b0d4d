use std::time::Duration;

use ::redis::aio::MultiplexedConnection;
use ::redis::{AsyncCommands, Script};
use async_trait::async_trait;
use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use super::{DeduplicationStore, ProcessingKey, ProcessingRecord, RegistryError};

const KEY_PREFIX: &str = "resume-parser:processing";

/// KEYS[1] record, ARGV[1] owner. Deletes only the caller's own record.
const DELETE_IF_OWNER: &str = r#"
local value = redis.call('GET', KEYS[1])
if value and cjson.decode(value)['owner'] == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// KEYS[1] record, ARGV[1] owner, ARGV[2] new value. Keeps the TTL.
const REPLACE_IF_OWNER: &str = r#"
local value = redis.call('GET', KEYS[1])
if value and cjson.decode(value)['owner'] == ARGV[1] then
    redis.call('SET', KEYS[1], ARGV[2], 'KEEPTTL')
    return 1
end
return 0
"#;

/// Dedup store shared by every instance in the queue group.
///
/// Records are JSON values under `resume-parser:processing:<resume>:<org>`
/// with a TTL equal to the processing timeout, so Redis expiry doubles as the
/// abandoned-record sweep.
#[derive(Clone)]
pub struct RedisDeduplicationStore {
    connection: MultiplexedConnection,
}

impl RedisDeduplicationStore {
    pub async fn connect(url: &str) -> Result<Self, RegistryError> {
        let client = ::redis::Client::open(url)?;
        let connection = client.get_multiplexed_async_connection().await?;
        info!("Redis dedup store connected");
        Ok(Self { connection })
    }

    async fn keys(&self) -> Result<Vec<String>, RegistryError> {
        let mut con = self.connection.clone();
        let mut iter = con
            .scan_match::<_, String>(format!("{KEY_PREFIX}:*"))
            .await?;
        let mut keys = Vec::new();
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }

    async fn delete_if_owner(&self, redis_key: &str, owner: Uuid) -> Result<bool, RegistryError> {
        let mut con = self.connection.clone();
        let removed: i64 = Script::new(DELETE_IF_OWNER)
            .key(redis_key)
            .arg(owner.to_string())
            .invoke_async(&mut con)
            .await?;
        Ok(removed > 0)
    }
}

fn redis_key(key: &ProcessingKey) -> String {
    format!("{KEY_PREFIX}:{}:{}", key.resume_id, key.organization_id)
}

#[async_trait]
impl DeduplicationStore for RedisDeduplicationStore {
    async fn try_insert(&self, record: ProcessingRecord, ttl: Duration) -> Result<bool, RegistryError> {
        let mut con = self.connection.clone();
        let value = serde_json::to_string(&record)?;
        let reply: Option<String> = ::redis::cmd("SET")
            .arg(redis_key(&record.key))
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut con)
            .await?;
        Ok(reply.is_some())
    }

    async fn update(&self, record: &ProcessingRecord) -> Result<bool, RegistryError> {
        let mut con = self.connection.clone();
        let value = serde_json::to_string(record)?;
        let replaced: i64 = Script::new(REPLACE_IF_OWNER)
            .key(redis_key(&record.key))
            .arg(record.owner.to_string())
            .arg(value)
            .invoke_async(&mut con)
            .await?;
        Ok(replaced > 0)
    }

    async fn get(&self, key: &ProcessingKey) -> Result<Option<ProcessingRecord>, RegistryError> {
        let mut con = self.connection.clone();
        let raw: Option<String> = con.get(redis_key(key)).await?;
        raw.map(|value| serde_json::from_str(&value))
            .transpose()
            .map_err(RegistryError::from)
    }

    async fn remove(&self, key: &ProcessingKey, owner: Uuid) -> Result<bool, RegistryError> {
        self.delete_if_owner(&redis_key(key), owner).await
    }

    async fn purge_older_than(&self, max_age: Duration) -> Result<Vec<ProcessingKey>, RegistryError> {
        let mut con = self.connection.clone();
        let mut purged = Vec::new();
        for redis_key in self.keys().await? {
            let raw: Option<String> = con.get(&redis_key).await?;
            let Some(raw) = raw else { continue };
            let record: ProcessingRecord = serde_json::from_str(&raw)?;
            let stale = (Utc::now() - record.started_at)
                .to_std()
                .map(|age| age > max_age)
                .unwrap_or(false);
            // A fresh claim may have replaced the record since the read.
            if stale && self.delete_if_owner(&redis_key, record.owner).await? {
                purged.push(record.key);
            }
        }
        Ok(purged)
    }

    async fn len(&self) -> Result<usize, RegistryError> {
        Ok(self.keys().await?.len())
    }
}
