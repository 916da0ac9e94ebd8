// src/core/storage/meta.rs

//! The per-entry metadata record stored next to every cached body.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Returns the current wall-clock time as whole seconds since the Unix epoch.
pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Metadata describing one cached response. Persisted as compact JSON by the
/// backends that store structured data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheMeta {
    /// MIME type as received from upstream; replayed verbatim on a hit.
    pub content_type: String,
    /// "", "gzip", "br" or "identity". Drives the `Content-Encoding` header
    /// on replay and short-circuits the compress transform.
    #[serde(default)]
    pub encoding: String,
    /// Byte length of the stored body after all applied transforms.
    pub size: u64,
    /// The upstream `ETag`, if any, including its quotes.
    #[serde(default)]
    pub etag: Option<String>,
    /// The upstream status code to replay.
    pub status_code: u16,
    /// Time-to-live in seconds. Zero or negative means the entry never expires.
    pub ttl_secs: i64,
    /// Unix timestamp of the moment the entry was inserted.
    pub cached_at: u64,
    /// Additional headers preserved for replay (at minimum `Last-Modified`
    /// and `Vary` when upstream sent them).
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl CacheMeta {
    /// Whether the encoding field denotes an actually-encoded body.
    pub fn is_encoded(&self) -> bool {
        !self.encoding.is_empty() && self.encoding != "identity"
    }

    /// Seconds elapsed since the entry was inserted, measured at `now`.
    pub fn age_at(&self, now: u64) -> u64 {
        now.saturating_sub(self.cached_at)
    }

    /// Seconds elapsed since the entry was inserted.
    pub fn age(&self) -> u64 {
        self.age_at(now_unix())
    }

    /// An entry is expired once more than `ttl_secs` have passed since
    /// insertion. Entries with a non-positive TTL never expire.
    pub fn is_expired_at(&self, now: u64) -> bool {
        self.ttl_secs > 0 && self.age_at(now) > self.ttl_secs as u64
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_unix())
    }

    /// Seconds of freshness left, clamped at zero. `None` when the entry
    /// never expires.
    pub fn remaining_ttl(&self) -> Option<u64> {
        if self.ttl_secs <= 0 {
            return None;
        }
        Some((self.ttl_secs as u64).saturating_sub(self.age()))
    }
}
