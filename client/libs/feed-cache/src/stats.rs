//! Statistics tracking for cache, query and mutation activity

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Point-in-time counters
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Callers attached to an already in-flight fetch
    pub deduplicated: u64,
    pub fetches: u64,
    pub fetch_errors: u64,
    /// Results dropped because a newer request superseded them
    pub discarded: u64,
    pub invalidations: u64,
    pub evictions: u64,
    pub optimistic_writes: u64,
    pub commits: u64,
    pub rollbacks: u64,
    /// Mutations ignored because an identical one was pending
    pub ignored_mutations: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    deduplicated: AtomicU64,
    fetches: AtomicU64,
    fetch_errors: AtomicU64,
    discarded: AtomicU64,
    invalidations: AtomicU64,
    evictions: AtomicU64,
    optimistic_writes: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
    ignored_mutations: AtomicU64,
}

/// Thread-safe statistics collector, cheap to clone
#[derive(Clone, Default)]
pub struct StatsCollector {
    counters: Arc<Counters>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dedup(&self) {
        self.counters.deduplicated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fetch(&self) {
        self.counters.fetches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fetch_error(&self) {
        self.counters.fetch_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discarded(&self) {
        self.counters.discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalidations(&self, count: usize) {
        self.counters
            .invalidations
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, count: usize) {
        self.counters
            .evictions
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_optimistic_writes(&self, count: usize) {
        self.counters
            .optimistic_writes
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_commit(&self) {
        self.counters.commits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rollback(&self) {
        self.counters.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ignored_mutation(&self) {
        self.counters
            .ignored_mutations
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheStats {
        let c = &self.counters;
        CacheStats {
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            deduplicated: c.deduplicated.load(Ordering::Relaxed),
            fetches: c.fetches.load(Ordering::Relaxed),
            fetch_errors: c.fetch_errors.load(Ordering::Relaxed),
            discarded: c.discarded.load(Ordering::Relaxed),
            invalidations: c.invalidations.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            optimistic_writes: c.optimistic_writes.load(Ordering::Relaxed),
            commits: c.commits.load(Ordering::Relaxed),
            rollbacks: c.rollbacks.load(Ordering::Relaxed),
            ignored_mutations: c.ignored_mutations.load(Ordering::Relaxed),
        }
    }

    /// Hit ratio over all fresh-or-miss lookups, 0.0 when nothing was read
    pub fn hit_ratio(&self) -> f64 {
        let stats = self.snapshot();
        let total = stats.hits + stats.misses;
        if total == 0 {
            0.0
        } else {
            stats.hits as f64 / total as f64
        }
    }

    pub fn reset(&self) {
        let c = &self.counters;
        for counter in [
            &c.hits,
            &c.misses,
            &c.deduplicated,
            &c.fetches,
            &c.fetch_errors,
            &c.discarded,
            &c.invalidations,
            &c.evictions,
            &c.optimistic_writes,
            &c.commits,
            &c.rollbacks,
            &c.ignored_mutations,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
