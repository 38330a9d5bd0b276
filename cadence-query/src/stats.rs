//! Cache usage counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads answered from a fresh entry.
    pub hits: u64,
    /// Reads that had to wait for a fetch.
    pub misses: u64,
    /// Stale reads answered immediately while a refresh ran.
    pub stale_hits: u64,
    /// Fetch executions started.
    pub fetches: u64,
    /// Callers attached to an execution already in flight.
    pub deduplicated: u64,
    /// Entries removed by garbage collection.
    pub evictions: u64,
    /// Snapshot entries installed by hydration.
    pub hydrated: u64,
    /// Snapshot entries discarded because the local entry was newer.
    pub hydration_conflicts: u64,
    /// Number of entries currently in the store.
    pub entry_count: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0), counting stale hits as hits.
    pub fn hit_rate(&self) -> f64 {
        let served = self.hits + self.stale_hits;
        let total = served + self.misses;
        if total == 0 {
            0.0
        } else {
            served as f64 / total as f64
        }
    }
}

/// Lock-free counters behind [`CacheStats`].
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) hits: AtomicU64,
    pub(crate) misses: AtomicU64,
    pub(crate) stale_hits: AtomicU64,
    pub(crate) fetches: AtomicU64,
    pub(crate) deduplicated: AtomicU64,
    pub(crate) evictions: AtomicU64,
    pub(crate) hydrated: AtomicU64,
    pub(crate) hydration_conflicts: AtomicU64,
}

impl Counters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, entry_count: u64) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stale_hits: self.stale_hits.load(Ordering::Relaxed),
            fetches: self.fetches.load(Ordering::Relaxed),
            deduplicated: self.deduplicated.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            hydrated: self.hydrated.load(Ordering::Relaxed),
            hydration_conflicts: self.hydration_conflicts.load(Ordering::Relaxed),
            entry_count,
        }
    }
}
