// src/core/metrics.rs

//! Defines and registers Prometheus metrics for cache monitoring.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only
//! once globally for the entire application lifecycle.

use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, TextEncoder, register_counter, register_counter_vec,
    register_gauge,
};

lazy_static! {
    /// The total number of requests served from the cache.
    pub static ref CACHE_HITS_TOTAL: Counter =
        register_counter!("opalcache_hits_total", "Total number of cache hits.").unwrap();
    /// The total number of cacheable requests that had no stored entry.
    pub static ref CACHE_MISSES_TOTAL: Counter =
        register_counter!("opalcache_misses_total", "Total number of cache misses.").unwrap();
    /// The total number of entries written to the backing store.
    pub static ref CACHE_PUTS_TOTAL: Counter =
        register_counter!("opalcache_puts_total", "Total number of cache writes.").unwrap();
    /// The total number of store failures observed by the middleware.
    pub static ref CACHE_ERRORS_TOTAL: Counter =
        register_counter!("opalcache_errors_total", "Total number of store errors.").unwrap();
    /// The total number of requests that bypassed the cache entirely.
    pub static ref CACHE_BYPASSES_TOTAL: Counter =
        register_counter!("opalcache_bypasses_total", "Total number of cache bypasses.").unwrap();

    /// Bytes written to clients, labeled by request host.
    pub static ref TRAFFIC_BYTES_TOTAL: CounterVec = register_counter_vec!(
        "opalcache_traffic_bytes_total",
        "Bytes written to clients, labeled by host.",
        &["host"]
    )
    .unwrap();

    /// The total number of optimization jobs dropped because the queue was full.
    pub static ref OPTIMIZE_JOBS_DROPPED_TOTAL: Counter = register_counter!(
        "opalcache_optimize_jobs_dropped_total",
        "Total number of optimization jobs dropped due to a full queue."
    )
    .unwrap();

    /// The number of optimization jobs currently waiting in the queue.
    pub static ref OPTIMIZE_QUEUE_DEPTH: Gauge = register_gauge!(
        "opalcache_optimize_queue_depth",
        "Number of optimization jobs currently queued."
    )
    .unwrap();
}

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode_to_string(&metric_families).unwrap_or_default()
}
