// =============================================================================
// store/redis_store.rs - CITY DOCUMENTS AND THE VIOLATION LOG, IN REDIS
// =============================================================================
//
// Layout:
//   {cache_prefix}:{city}    STRING  JSON cache document, overwritten per scan
//   {violation_prefix}:keys  SET     "city|gas|timestamp" dedup keys
//   {violation_prefix}:log   ZSET    JSON {record + narrative}, scored by the
//                                    record time in millis so ZREVRANGE is
//                                    newest first
//
// Insert runs as one Lua script: key already present -> no-op, otherwise
// ZADD the entry and only then SADD the key. A failed log write aborts the
// script before the key lands, so the key set never claims a violation the
// log does not hold.
// =============================================================================

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{CacheStore, ViolationStore};
use crate::error::{StoreError, StoreResult};
use crate::models::{dedup_key, CacheRecord, Gas, ViolationRecord};

/// Open a managed connection, retrying every five seconds until it works or
/// shutdown is signalled. `Ok(None)` means we were told to stop first.
pub async fn connect_with_retry(
    url: &str,
    shutdown: &watch::Receiver<bool>,
) -> StoreResult<Option<ConnectionManager>> {
    let client = redis::Client::open(url)?;
    loop {
        match ConnectionManager::new(client.clone()).await {
            Ok(con) => {
                info!(url = url, "Redis connection established");
                return Ok(Some(con));
            }
            Err(e) => {
                warn!(error = %e, "Failed to connect to Redis, retrying in 5 seconds");
                tokio::time::sleep(Duration::from_secs(5)).await;
                if *shutdown.borrow() {
                    info!("Shutdown received during Redis connection retry");
                    return Ok(None);
                }
            }
        }
    }
}

#[derive(Clone)]
pub struct RedisCacheStore {
    con: ConnectionManager,
    prefix: String,
}

impl RedisCacheStore {
    pub fn new(con: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self { con, prefix: prefix.into() }
    }

    fn key(&self, city: &str) -> String {
        format!("{}:{}", self.prefix, city)
    }
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn get(&self, city: &str) -> StoreResult<Option<CacheRecord>> {
        let key = self.key(city);
        let mut con = self.con.clone();
        let raw: Option<String> = con.get(&key).await?;
        raw.map(|json| serde_json::from_str(&json).map_err(|source| StoreError::Serialization { key, source }))
            .transpose()
    }

    async fn put(&self, city: &str, record: &CacheRecord) -> StoreResult<()> {
        let key = self.key(city);
        let json = serde_json::to_string(record)
            .map_err(|source| StoreError::Serialization { key: key.clone(), source })?;
        let mut con = self.con.clone();
        let _: () = con.set(&key, json).await?;
        debug!(key = %key, "Cache document written");
        Ok(())
    }
}

/// What actually sits in the sorted set.
#[derive(Serialize, Deserialize)]
struct StoredViolation {
    #[serde(flatten)]
    record: ViolationRecord,
    #[serde(default)]
    narrative: String,
}

/// KEYS: keys set, log zset. ARGV: dedup key, score, entry JSON.
const INSERT_SCRIPT: &str = r#"
if redis.call('SISMEMBER', KEYS[1], ARGV[1]) == 1 then
    return 0
end
redis.call('ZADD', KEYS[2], ARGV[2], ARGV[3])
redis.call('SADD', KEYS[1], ARGV[1])
return 1
"#;

#[derive(Clone)]
pub struct RedisViolationStore {
    con: ConnectionManager,
    keys_key: String,
    log_key: String,
    insert_script: redis::Script,
}

impl RedisViolationStore {
    pub fn new(con: ConnectionManager, prefix: &str) -> Self {
        Self {
            con,
            keys_key: format!("{prefix}:keys"),
            log_key: format!("{prefix}:log"),
            insert_script: redis::Script::new(INSERT_SCRIPT),
        }
    }
}

#[async_trait]
impl ViolationStore for RedisViolationStore {
    async fn exists(&self, city: &str, gas: Gas, timestamp: &str) -> StoreResult<bool> {
        let mut con = self.con.clone();
        let present: bool = con.sismember(&self.keys_key, dedup_key(city, gas, timestamp)).await?;
        Ok(present)
    }

    async fn insert(&self, record: &ViolationRecord, narrative: &str) -> StoreResult<bool> {
        let key = record.dedup_key();
        let stored = StoredViolation { record: record.clone(), narrative: narrative.to_string() };
        let json = serde_json::to_string(&stored)
            .map_err(|source| StoreError::Serialization { key: key.clone(), source })?;
        let score = record.recorded_at.timestamp_millis() as f64;

        let mut con = self.con.clone();
        let added: i64 = self
            .insert_script
            .key(&self.keys_key)
            .key(&self.log_key)
            .arg(&key)
            .arg(score)
            .arg(json)
            .invoke_async(&mut con)
            .await?;
        if added == 0 {
            debug!(key = %key, "Violation already in the log, insert skipped");
        }
        Ok(added == 1)
    }

    async fn get_all(&self, limit: Option<usize>) -> StoreResult<Vec<ViolationRecord>> {
        let stop = match limit {
            Some(0) => return Ok(Vec::new()),
            Some(n) => n as isize - 1,
            None => -1,
        };
        let mut con = self.con.clone();
        let raw: Vec<String> = con.zrevrange(&self.log_key, 0, stop).await?;

        let mut records = Vec::with_capacity(raw.len());
        for json in raw {
            match serde_json::from_str::<StoredViolation>(&json) {
                Ok(stored) => records.push(stored.record),
                // One corrupt entry must not hide the rest of the history.
                Err(e) => warn!(error = %e, "Skipping undecodable violation log entry"),
            }
        }
        Ok(records)
    }
}
