// src/core/stats.rs

//! Monotonic counters describing the middleware's behavior since startup.

use crate::core::metrics;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Shared, lock-free counters. Increments are relaxed; readers only need a
/// point-in-time snapshot, never a consistent cut across counters.
#[derive(Debug, Default)]
pub struct Stats {
    hits: AtomicU64,
    misses: AtomicU64,
    puts: AtomicU64,
    errors: AtomicU64,
    bypasses: AtomicU64,
    traffic_bytes: AtomicU64,
}

/// A serializable point-in-time copy of the counters.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub puts: u64,
    pub errors: u64,
    pub bypasses: u64,
    pub traffic_bytes: u64,
    pub hit_rate: f64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        metrics::CACHE_HITS_TOTAL.inc();
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        metrics::CACHE_MISSES_TOTAL.inc();
    }

    pub fn record_put(&self) {
        self.puts.fetch_add(1, Ordering::Relaxed);
        metrics::CACHE_PUTS_TOTAL.inc();
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        metrics::CACHE_ERRORS_TOTAL.inc();
    }

    pub fn record_bypass(&self) {
        self.bypasses.fetch_add(1, Ordering::Relaxed);
        metrics::CACHE_BYPASSES_TOTAL.inc();
    }

    pub fn record_traffic(&self, bytes: u64) {
        self.traffic_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// The fraction of lookups that were hits, or 0.0 when nothing was looked up.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        if hits + misses == 0 {
            return 0.0;
        }
        hits as f64 / (hits + misses) as f64
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            bypasses: self.bypasses.load(Ordering::Relaxed),
            traffic_bytes: self.traffic_bytes.load(Ordering::Relaxed),
            hit_rate: self.hit_rate(),
        }
    }
}
