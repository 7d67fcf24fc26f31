// =============================================================================
// store/mod.rs - THE TWO FILING CABINETS
// =============================================================================
//
// The engine owns no persistence of its own. It talks to two external stores
// through these traits:
//
// 1. The cache store: one document per city, keyed by city name, overwritten
//    in place on every successful scan. Last writer wins.
//
// 2. The violation store: an append-only log of violation records, queried in
//    bulk, deduplicated on (city, gas, timestamp).
//
// Constructors in the rest of the engine take `Arc<dyn CacheStore>` /
// `Arc<dyn ViolationStore>` that the composition root has already connected.
// Nobody in here opens a connection lazily.
//
// Known race: the scanner checks `exists` before `insert`. Two processes
// scanning the same pass at the same instant can both see "absent". The Redis
// backend closes most of that window by making insert idempotent on the dedup
// key, but no locking is attempted and none is promised.
// =============================================================================

pub mod memory;
pub mod redis_store;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::StoreResult;
use crate::models::{CacheRecord, Gas, ViolationRecord};

pub use memory::{MemoryCacheStore, MemoryViolationStore};
pub use redis_store::{RedisCacheStore, RedisViolationStore};

/// Per-city snapshot documents.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, city: &str) -> StoreResult<Option<CacheRecord>>;

    /// Full overwrite of the city's document.
    async fn put(&self, city: &str, record: &CacheRecord) -> StoreResult<()>;
}

/// The historical violation log.
#[async_trait]
pub trait ViolationStore: Send + Sync {
    async fn exists(&self, city: &str, gas: Gas, timestamp: &str) -> StoreResult<bool>;

    /// Append a record with its narrative. Returns `false` if the store
    /// already held a record with the same dedup key and nothing was written.
    async fn insert(&self, record: &ViolationRecord, narrative: &str) -> StoreResult<bool>;

    /// Newest first. `None` means everything.
    async fn get_all(&self, limit: Option<usize>) -> StoreResult<Vec<ViolationRecord>>;
}

/// Bucket a flat violation list by city.
pub fn group_by_city(records: Vec<ViolationRecord>) -> HashMap<String, Vec<ViolationRecord>> {
    let mut grouped: HashMap<String, Vec<ViolationRecord>> = HashMap::new();
    for record in records {
        grouped.entry(record.city.clone()).or_default().push(record);
    }
    grouped
}
