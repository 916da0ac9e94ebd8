// src/core/keygen.rs

//! Deterministic fingerprinting of requests and the cacheability predicates.
//!
//! The cache key is the lowercase hex SHA-256 of an ordered, `|`-joined
//! fingerprint: scheme, host, path, the normalized query (when enabled and
//! non-empty) and one `name:value` component per configured Vary header the
//! request actually carries.

use axum::http::{HeaderMap, Method, StatusCode, header};
use sha2::{Digest, Sha256};

/// Statuses the middleware is willing to store.
const CACHEABLE_STATUS: [u16; 5] = [200, 203, 204, 301, 302];

#[derive(Debug, Clone)]
pub struct KeyGenerator {
    include_query: bool,
    case_sensitive: bool,
    vary_headers: Vec<String>,
}

impl Default for KeyGenerator {
    fn default() -> Self {
        Self {
            include_query: true,
            case_sensitive: false,
            vary_headers: vec!["Accept-Encoding".to_string()],
        }
    }
}

impl KeyGenerator {
    pub fn new(include_query: bool, case_sensitive: bool, vary_headers: Vec<String>) -> Self {
        Self {
            include_query,
            case_sensitive,
            vary_headers,
        }
    }

    /// Builds the ordered fingerprint string for one request.
    pub fn fingerprint(
        &self,
        scheme: &str,
        host: &str,
        path: &str,
        raw_query: Option<&str>,
        headers: &HeaderMap,
    ) -> String {
        let mut parts: Vec<String> = Vec::with_capacity(4 + self.vary_headers.len());
        parts.push(scheme.to_string());
        if self.case_sensitive {
            parts.push(host.to_string());
            parts.push(path.to_string());
        } else {
            parts.push(host.to_lowercase());
            parts.push(path.to_lowercase());
        }

        if self.include_query {
            if let Some(raw) = raw_query {
                if !raw.is_empty() {
                    parts.push(normalize_query(raw));
                }
            }
        }

        // Declaration order matters: the same set in a different order is a
        // different fingerprint.
        for name in &self.vary_headers {
            if let Some(value) = headers.get(name.as_str()).and_then(|v| v.to_str().ok()) {
                if !value.is_empty() {
                    parts.push(format!("{name}:{value}"));
                }
            }
        }

        parts.join("|")
    }

    /// The 64-character lowercase hex cache key for one request.
    pub fn key(
        &self,
        scheme: &str,
        host: &str,
        path: &str,
        raw_query: Option<&str>,
        headers: &HeaderMap,
    ) -> String {
        let fingerprint = self.fingerprint(scheme, host, path, raw_query, headers);
        hex::encode(Sha256::digest(fingerprint.as_bytes()))
    }
}

/// Parses a raw query string into a multimap, sorts keys (and values within
/// a key) ascending, percent-encodes both halves and rejoins the pairs. Any
/// permutation of the same pairs normalizes to the same string.
pub fn normalize_query(raw: &str) -> String {
    let mut pairs: Vec<(String, String)> = url::form_urlencoded::parse(raw.as_bytes())
        .into_owned()
        .collect();
    pairs.sort();
    let encoded: Vec<String> = pairs
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect();
    encoded.join("&")
}

/// Whether a request may be answered from (or admitted to) the cache.
pub fn is_request_cacheable(method: &Method, headers: &HeaderMap) -> bool {
    if method != Method::GET && method != Method::HEAD {
        return false;
    }
    if headers.contains_key(header::AUTHORIZATION) {
        return false;
    }
    if let Some(cc) = headers
        .get(header::CACHE_CONTROL)
        .and_then(|v| v.to_str().ok())
    {
        let cc = cc.to_ascii_lowercase();
        if cc.contains("no-cache") || cc.contains("no-store") {
            return false;
        }
    }
    true
}

/// Whether an upstream response may be stored.
pub fn is_response_cacheable(status: StatusCode, headers: &HeaderMap) -> bool {
    if !CACHEABLE_STATUS.contains(&status.as_u16()) {
        return false;
    }
    if headers.contains_key(header::SET_COOKIE) {
        return false;
    }
    if let Some(cc) = headers
        .get(header::CACHE_CONTROL)
        .and_then(|v| v.to_str().ok())
    {
        let cc = cc.to_ascii_lowercase();
        if cc.contains("no-store") || cc.contains("private") {
            return false;
        }
    }
    if let Some(pragma) = headers.get(header::PRAGMA).and_then(|v| v.to_str().ok()) {
        if pragma.trim().eq_ignore_ascii_case("no-cache") {
            return false;
        }
    }
    true
}
