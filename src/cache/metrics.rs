//! Cache Metrics Collection
//!
//! Counters for cache-aside health: hit ratio, source-of-truth pressure and
//! rebuild activity.

use std::sync::atomic::{AtomicU64, Ordering};

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    // Reads
    hits: AtomicU64,
    null_hits: AtomicU64,
    stale_hits: AtomicU64,
    misses: AtomicU64,

    // Source of truth
    loader_calls: AtomicU64,
    loader_failures: AtomicU64,

    // Mutex mode
    lock_waits: AtomicU64,
    lock_timeouts: AtomicU64,

    // Logical mode
    rebuilds_scheduled: AtomicU64,
    rebuilds_completed: AtomicU64,
    rebuilds_failed: AtomicU64,
    rebuilds_rejected: AtomicU64,
}

impl CacheMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_null_hit(&self) {
        self.null_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_hit(&self) {
        self.stale_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_loader_call(&self) {
        self.loader_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_loader_failure(&self) {
        self.loader_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lock_wait(&self) {
        self.lock_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lock_timeout(&self) {
        self.lock_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rebuild_scheduled(&self) {
        self.rebuilds_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rebuild_completed(&self) {
        self.rebuilds_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rebuild_failed(&self) {
        self.rebuilds_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rebuild_rejected(&self) {
        self.rebuilds_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn loader_calls(&self) -> u64 {
        self.loader_calls.load(Ordering::Relaxed)
    }

    pub fn rebuilds_scheduled(&self) -> u64 {
        self.rebuilds_scheduled.load(Ordering::Relaxed)
    }

    /// Fraction of reads answered without the source of truth.
    pub fn hit_ratio(&self) -> f64 {
        let answered = (self.hits.load(Ordering::Relaxed)
            + self.null_hits.load(Ordering::Relaxed)
            + self.stale_hits.load(Ordering::Relaxed)) as f64;
        let total = answered + self.misses.load(Ordering::Relaxed) as f64;
        if total == 0.0 {
            0.0
        } else {
            answered / total
        }
    }

    /// Get a snapshot of all metrics
    pub fn snapshot(&self) -> CacheMetricsSnapshot {
        CacheMetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            null_hits: self.null_hits.load(Ordering::Relaxed),
            stale_hits: self.stale_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            loader_calls: self.loader_calls.load(Ordering::Relaxed),
            loader_failures: self.loader_failures.load(Ordering::Relaxed),
            lock_waits: self.lock_waits.load(Ordering::Relaxed),
            lock_timeouts: self.lock_timeouts.load(Ordering::Relaxed),
            rebuilds_scheduled: self.rebuilds_scheduled.load(Ordering::Relaxed),
            rebuilds_completed: self.rebuilds_completed.load(Ordering::Relaxed),
            rebuilds_failed: self.rebuilds_failed.load(Ordering::Relaxed),
            rebuilds_rejected: self.rebuilds_rejected.load(Ordering::Relaxed),
            hit_ratio: self.hit_ratio(),
        }
    }
}

/// Snapshot of cache metrics
#[derive(Debug, Clone, Default)]
pub struct CacheMetricsSnapshot {
    pub hits: u64,
    pub null_hits: u64,
    pub stale_hits: u64,
    pub misses: u64,
    pub loader_calls: u64,
    pub loader_failures: u64,
    pub lock_waits: u64,
    pub lock_timeouts: u64,
    pub rebuilds_scheduled: u64,
    pub rebuilds_completed: u64,
    pub rebuilds_failed: u64,
    pub rebuilds_rejected: u64,
    pub hit_ratio: f64,
}
