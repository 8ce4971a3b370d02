//! Cache counters and statistics snapshots

use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU64, Ordering},
    time::SystemTime,
};

use serde::{Deserialize, Serialize};

use crate::category::CacheCategory;

/// Point-in-time view of the cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub invalidations: u64,
    /// Background refreshes started by stale reads
    pub refreshes: u64,
    /// Best-effort size of memory-resident values
    pub approximate_bytes: u64,
    pub memory_entries: usize,
    /// Memory-resident entries per category
    pub by_category: BTreeMap<CacheCategory, usize>,
    /// Memory-resident entries per tag
    pub by_tag: BTreeMap<String, usize>,
    /// When the counters were last reset
    pub since: SystemTime,
}

impl CacheStats {
    /// Hit rate as a percentage (0.0 to 100.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }

    pub fn miss_rate(&self) -> f64 {
        if self.hits + self.misses == 0 {
            0.0
        } else {
            100.0 - self.hit_rate()
        }
    }

    /// One-line summary for logs
    pub fn summary(&self) -> String {
        format!(
            "hits={} misses={} hit_rate={:.2}% sets={} invalidations={} refreshes={} entries={} bytes={}",
            self.hits,
            self.misses,
            self.hit_rate(),
            self.sets,
            self.invalidations,
            self.refreshes,
            self.memory_entries,
            self.approximate_bytes
        )
    }
}

/// Monotonic counters; only [`CacheMetrics::reset`] moves them backwards
#[derive(Debug)]
pub struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    invalidations: AtomicU64,
    refreshes: AtomicU64,
    since: parking_lot::Mutex<SystemTime>,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
            refreshes: AtomicU64::new(0),
            since: parking_lot::Mutex::new(SystemTime::now()),
        }
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_set(&self) {
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalidations(&self, count: u64) {
        self.invalidations.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_refresh(&self) {
        self.refreshes.fetch_add(1, Ordering::Relaxed);
    }

    /// Counter values with empty residency figures; the manager fills those in
    pub fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            refreshes: self.refreshes.load(Ordering::Relaxed),
            approximate_bytes: 0,
            memory_entries: 0,
            by_category: BTreeMap::new(),
            by_tag: BTreeMap::new(),
            since: *self.since.lock(),
        }
    }

    /// Operator reset of every counter
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.sets.store(0, Ordering::Relaxed);
        self.invalidations.store(0, Ordering::Relaxed);
        self.refreshes.store(0, Ordering::Relaxed);
        *self.since.lock() = SystemTime::now();
    }
}

impl Default for CacheMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_stats_hit_rate() {
        let mut stats = CacheMetrics::new().snapshot();
        assert_eq!(stats.hit_rate(), 0.0);
        assert_eq!(stats.miss_rate(), 0.0);

        stats.hits = 75;
        stats.misses = 25;
        assert_eq!(stats.hit_rate(), 75.0);
        assert_eq!(stats.miss_rate(), 25.0);
    }

    #[test]
    fn test_counters_accumulate_until_reset() {
        let metrics = CacheMetrics::new();
        metrics.record_hit();
        metrics.record_hit();
        metrics.record_miss();
        metrics.record_set();
        metrics.record_invalidations(3);
        metrics.record_refresh();

        let stats = metrics.snapshot();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.sets, 1);
        assert_eq!(stats.invalidations, 3);
        assert_eq!(stats.refreshes, 1);
        assert!(stats.summary().contains("hits=2"));

        metrics.reset();
        let stats = metrics.snapshot();
        assert_eq!(stats.hits + stats.misses + stats.sets + stats.invalidations, 0);
    }
}
