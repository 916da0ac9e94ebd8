// src/core/events.rs

//! The event callback contract between the middleware and its host.
//!
//! The middleware reports what happened per request; what the host does with
//! the events (per-host statistics, billing, dashboards) is its own concern.

use std::sync::Arc;

/// The kind of cache event being reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEvent {
    /// A request was served from the cache.
    Hit,
    /// A request passed the gates but had no stored entry.
    Miss,
    /// A response was written to the store.
    Put,
    /// Bytes were written to the client.
    Traffic,
}

impl CacheEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheEvent::Hit => "hit",
            CacheEvent::Miss => "miss",
            CacheEvent::Put => "put",
            CacheEvent::Traffic => "traffic",
        }
    }
}

/// Invoked synchronously in the request task as `(hostname, event, bytes)`.
///
/// `bytes` is zero for hit/miss, the stored size for put, and the bytes
/// written to the client for traffic.
pub type EventCallback = Arc<dyn Fn(&str, CacheEvent, u64) + Send + Sync>;
