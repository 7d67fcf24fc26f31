//! In-memory store backends.
//!
//! Used by the test suite and by anyone running the engine without Redis.
//! Cache documents are kept as serialized JSON so the field-name contract is
//! exercised exactly the way a real document store would exercise it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{CacheStore, ViolationStore};
use crate::error::{StoreError, StoreResult};
use crate::models::{dedup_key, CacheRecord, Gas, ViolationRecord};

#[derive(Default)]
pub struct MemoryCacheStore {
    docs: RwLock<HashMap<String, String>>,
    unavailable: AtomicBool,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the backend going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.docs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.read().is_empty()
    }

    /// Store `json` verbatim under `city`, the way another producer might
    /// have left it.
    pub fn put_raw(&self, city: &str, json: impl Into<String>) {
        self.docs.write().insert(city.to_string(), json.into());
    }

    fn check(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(StoreError::Connection("memory cache store marked unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, city: &str) -> StoreResult<Option<CacheRecord>> {
        self.check()?;
        let docs = self.docs.read();
        match docs.get(city) {
            Some(json) => serde_json::from_str(json)
                .map(Some)
                .map_err(|source| StoreError::Serialization { key: city.to_string(), source }),
            None => Ok(None),
        }
    }

    async fn put(&self, city: &str, record: &CacheRecord) -> StoreResult<()> {
        self.check()?;
        let json = serde_json::to_string(record)
            .map_err(|source| StoreError::Serialization { key: city.to_string(), source })?;
        self.docs.write().insert(city.to_string(), json);
        Ok(())
    }
}

#[derive(Default)]
struct ViolationLog {
    /// Insertion order; newest last.
    records: Vec<(ViolationRecord, String)>,
    keys: HashSet<String>,
}

#[derive(Default)]
pub struct MemoryViolationStore {
    log: RwLock<ViolationLog>,
    unavailable: AtomicBool,
}

impl MemoryViolationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.log.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Narrative stored alongside the record with this dedup key.
    pub fn narrative_for(&self, key: &str) -> Option<String> {
        self.log
            .read()
            .records
            .iter()
            .find(|(r, _)| r.dedup_key() == key)
            .map(|(_, n)| n.clone())
    }

    fn check(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(StoreError::Connection("memory violation store marked unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ViolationStore for MemoryViolationStore {
    async fn exists(&self, city: &str, gas: Gas, timestamp: &str) -> StoreResult<bool> {
        self.check()?;
        Ok(self.log.read().keys.contains(&dedup_key(city, gas, timestamp)))
    }

    async fn insert(&self, record: &ViolationRecord, narrative: &str) -> StoreResult<bool> {
        self.check()?;
        let mut log = self.log.write();
        if !log.keys.insert(record.dedup_key()) {
            return Ok(false);
        }
        log.records.push((record.clone(), narrative.to_string()));
        Ok(true)
    }

    async fn get_all(&self, limit: Option<usize>) -> StoreResult<Vec<ViolationRecord>> {
        self.check()?;
        let log = self.log.read();
        let newest_first = log.records.iter().rev().map(|(r, _)| r.clone());
        Ok(match limit {
            Some(n) => newest_first.take(n).collect(),
            None => newest_first.collect(),
        })
    }
}
