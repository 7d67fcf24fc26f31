// =============================================================================
// dedup.rs - HAVE WE ALREADY FILED THIS VIOLATION?
// =============================================================================
//
// The same satellite pass is picked up by every scan until a newer pass lands,
// and the scheduler runs twice a day. Without a local memory every one of
// those repeat detections costs a round-trip to the violation store just to
// hear "already have it".
//
// Hybrid Bloom filter + LRU cache keyed on "city|gas|timestamp":
//
// 1. Bloom says "never seen": definitely new. Go ask the store.
// 2. Bloom says "maybe": confirm with the LRU. A hit is a known violation and
//    we skip the store. A miss is a Bloom false positive; go ask the store.
// 3. The Bloom filter rotates on an interval so it never saturates. The LRU
//    evicts on its own.
//
// This is a fast path only. The violation store stays the authority: keys are
// remembered only after the store has confirmed them (present or inserted),
// so a failed insert is retried by the next scan instead of being forgotten.
// =============================================================================

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bloomfilter::Bloom;
use lru::LruCache;
use parking_lot::RwLock;
use portable_atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

pub struct DedupEngine {
    bloom: Arc<RwLock<Bloom<String>>>,
    lru_cache: Arc<RwLock<LruCache<String, ()>>>,
    last_rotation: Arc<RwLock<Instant>>,
    rotation_interval: Duration,
    bloom_expected_items: usize,
    bloom_fp_rate: f64,
    pub stats: Arc<DedupStats>,
}

#[derive(Default)]
pub struct DedupStats {
    /// Lookups made by the violation recorder.
    pub checks: AtomicU64,
    /// Lookups answered "known" without touching the store.
    pub hits: AtomicU64,
    /// Keys remembered after the store confirmed them.
    pub remembered: AtomicU64,
    pub rotations: AtomicU64,
    /// Bloom said "maybe" and the LRU said "no".
    pub bloom_false_positives: AtomicU64,
}

impl DedupEngine {
    pub fn new(
        expected_items: u64,
        fp_rate: f64,
        lru_capacity: usize,
        rotation_interval: Duration,
    ) -> Self {
        info!(
            expected_items = expected_items,
            fp_rate = fp_rate,
            lru_capacity = lru_capacity,
            rotation_secs = rotation_interval.as_secs(),
            "Violation dedup engine initialized"
        );

        let expected = expected_items.max(1) as usize;
        let lru_size = NonZeroUsize::new(lru_capacity).unwrap_or(NonZeroUsize::MIN);

        Self {
            bloom: Arc::new(RwLock::new(Bloom::new_for_fp_rate(expected, fp_rate))),
            lru_cache: Arc::new(RwLock::new(LruCache::new(lru_size))),
            last_rotation: Arc::new(RwLock::new(Instant::now())),
            rotation_interval,
            bloom_expected_items: expected,
            bloom_fp_rate: fp_rate,
            stats: Arc::new(DedupStats::default()),
        }
    }

    /// Build from the engine configuration.
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self::new(
            config.bloom_expected_items,
            config.bloom_false_positive_rate,
            config.lru_cache_size,
            config.bloom_rotation_interval,
        )
    }

    /// `true` when this key was already confirmed by the store during the
    /// lifetime of this process (and has not been evicted since).
    pub fn is_known(&self, key: &str) -> bool {
        self.stats.checks.fetch_add(1, Ordering::Relaxed);
        self.maybe_rotate();

        let key = key.to_string();
        if !self.bloom.read().check(&key) {
            return false;
        }

        if self.lru_cache.write().get(&key).is_some() {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "Violation already known locally, store lookup skipped");
            return true;
        }

        self.stats.bloom_false_positives.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, "Bloom false positive, deferring to the store");
        false
    }

    /// Record that the store holds this key.
    pub fn remember(&self, key: &str) {
        let key = key.to_string();
        self.bloom.write().set(&key);
        self.lru_cache.write().put(key, ());
        self.stats.remembered.fetch_add(1, Ordering::Relaxed);
    }

    fn maybe_rotate(&self) {
        if self.last_rotation.read().elapsed() < self.rotation_interval {
            return;
        }

        let mut bloom = self.bloom.write();
        let mut last = self.last_rotation.write();
        // Another caller may have rotated while we waited for the locks.
        if last.elapsed() >= self.rotation_interval {
            *bloom = Bloom::new_for_fp_rate(self.bloom_expected_items, self.bloom_fp_rate);
            *last = Instant::now();
            self.stats.rotations.fetch_add(1, Ordering::Relaxed);
            info!("Dedup Bloom filter rotated");
        }
    }

    pub fn snapshot(&self) -> DedupSnapshot {
        DedupSnapshot {
            total_checks: self.stats.checks.load(Ordering::Relaxed),
            local_hits: self.stats.hits.load(Ordering::Relaxed),
            keys_remembered: self.stats.remembered.load(Ordering::Relaxed),
            bloom_rotations: self.stats.rotations.load(Ordering::Relaxed),
            bloom_false_positives: self.stats.bloom_false_positives.load(Ordering::Relaxed),
            lru_cache_size: self.lru_cache.read().len(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DedupSnapshot {
    pub total_checks: u64,
    pub local_hits: u64,
    pub keys_remembered: u64,
    pub bloom_rotations: u64,
    pub bloom_false_positives: u64,
    pub lru_cache_size: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> DedupEngine {
        DedupEngine::new(1000, 0.01, 100, Duration::from_secs(3600))
    }

    #[test]
    fn test_unseen_key_is_not_known() {
        assert!(!engine().is_known("Jubail|SO2|2024-03-01 13:20:00"));
    }

    #[test]
    fn test_remembered_key_is_known() {
        let engine = engine();
        engine.remember("Jubail|SO2|2024-03-01 13:20:00");
        assert!(engine.is_known("Jubail|SO2|2024-03-01 13:20:00"));
        assert!(!engine.is_known("Jubail|SO2|2024-03-02 13:05:00"));
        assert_eq!(engine.snapshot().local_hits, 1);
    }

    #[test]
    fn test_checking_does_not_remember() {
        let engine = engine();
        assert!(!engine.is_known("Riyadh|NO2|2024-03-01 12:40:00"));
        assert!(!engine.is_known("Riyadh|NO2|2024-03-01 12:40:00"));
    }

    #[test]
    fn test_rotation_forgets_keys() {
        let engine = DedupEngine::new(1000, 0.01, 100, Duration::ZERO);
        engine.remember("Yanbu|CO|2024-03-01 13:00:00");
        // Zero interval: the next lookup rotates first, so the Bloom filter is empty.
        assert!(!engine.is_known("Yanbu|CO|2024-03-01 13:00:00"));
        assert!(engine.snapshot().bloom_rotations >= 1);
    }
}
