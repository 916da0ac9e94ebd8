// src/core/middleware.rs

//! The request-facing half of the cache: interception, lookup, response
//! capture and storage.
//!
//! The recorder of the classic design maps onto the ownership model here as
//! [`capture_body`]: upstream's body is drained frame by frame into a buffer
//! that is replayed to the client, and a body that outgrows the cache limit
//! is stitched back together and streamed through untouched. Either way the
//! client receives exactly what upstream produced; cache faults are never
//! fatal to a request.

use crate::config::OptimizeMode;
use crate::core::events::CacheEvent;
use crate::core::keygen;
use crate::core::metrics;
use crate::core::state::AppState;
use crate::core::errors::CacheError;
use crate::core::storage::meta::{CacheMeta, now_unix};
use crate::core::storage::{BodyReader, CacheStore, reader_from_bytes};
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderName, HeaderValue, Method, StatusCode, header, response};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

/// Admin endpoints live under this prefix and are never cached.
pub const ADMIN_PREFIX: &str = "/_cache";

const X_CACHE: &str = "x-cache";

/// The axum middleware entry point. Wired with
/// `axum::middleware::from_fn_with_state`.
pub async fn cache_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    if !state.enabled || req.uri().path().starts_with(ADMIN_PREFIX) {
        return next.run(req).await;
    }

    let path = req.uri().path().to_string();
    if !keygen::is_request_cacheable(req.method(), req.headers()) || !state.path_allowed(&path)
    {
        state.stats.record_bypass();
        return next.run(req).await;
    }

    let scheme = scheme_of(&req);
    let host = host_of(&req);
    let query = req.uri().query().map(str::to_string);
    let key = state
        .keygen
        .key(&scheme, &host, &path, query.as_deref(), req.headers());

    match state.store.get(&key).await {
        Err(e) => {
            // The cache misbehaving must look like the cache being absent.
            state.stats.record_error();
            warn!(key = %key, "cache lookup failed: {e}");
            next.run(req).await
        }
        Ok(Some((body, meta))) => {
            let head_only = req.method() == Method::HEAD;
            serve_hit(&state, &host, body, meta, head_only)
        }
        Ok(None) => {
            state.stats.record_miss();
            emit(&state, &host, CacheEvent::Miss, 0);
            capture_and_cache(state, host, key, req, next).await
        }
    }
}

/// Builds the client response for a stored entry and emits hit/traffic.
/// HEAD requests replay the stored headers over an empty body.
fn serve_hit(
    state: &AppState,
    host: &str,
    body: BodyReader,
    meta: CacheMeta,
    head_only: bool,
) -> Response {
    state.stats.record_hit();
    emit(state, host, CacheEvent::Hit, 0);

    let response_body = if head_only {
        Body::empty()
    } else {
        Body::from_stream(ReaderStream::new(body))
    };
    let mut resp = Response::new(response_body);
    *resp.status_mut() = StatusCode::from_u16(meta.status_code).unwrap_or(StatusCode::OK);

    let headers = resp.headers_mut();
    headers.insert(HeaderName::from_static(X_CACHE), HeaderValue::from_static("HIT"));
    insert_header(headers, header::AGE, &meta.age().to_string());
    insert_header(headers, header::CONTENT_LENGTH, &meta.size.to_string());
    if !meta.content_type.is_empty() {
        insert_header(headers, header::CONTENT_TYPE, &meta.content_type);
    }
    if meta.is_encoded() {
        insert_header(headers, header::CONTENT_ENCODING, &meta.encoding);
    }
    if let Some(etag) = &meta.etag {
        insert_header(headers, header::ETAG, etag);
    }
    if let Some(remaining) = meta.remaining_ttl() {
        if remaining > 0 {
            insert_header(
                headers,
                header::CACHE_CONTROL,
                &format!("public, max-age={remaining}"),
            );
        }
    }
    for (name, value) in &meta.headers {
        if let Ok(name) = HeaderName::from_bytes(name.as_bytes()) {
            insert_header(headers, name, value);
        }
    }

    let written = if head_only { 0 } else { meta.size };
    state.stats.record_traffic(written);
    emit(state, host, CacheEvent::Traffic, written);
    resp
}

/// Delegates to upstream, mirrors the response to the client and stores it
/// when the response-side gates allow.
async fn capture_and_cache(
    state: Arc<AppState>,
    host: String,
    key: String,
    req: Request,
    next: Next,
) -> Response {
    let method = req.method().clone();
    let resp = next.run(req).await;
    let (mut parts, body) = resp.into_parts();
    set_miss_header(&mut parts.headers);

    // Known-oversized bodies stream straight through without buffering.
    if let Some(len) = declared_length(&parts) {
        if len > state.max_cache_size {
            return Response::from_parts(parts, body);
        }
    }

    let captured = match capture_body(body, state.max_cache_size).await {
        Ok(captured) => captured,
        Err(e) => {
            warn!(key = %key, "upstream body failed mid-stream: {e}");
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    let bytes = match captured {
        Captured::Overflow(body) => return Response::from_parts(parts, body),
        Captured::Full(bytes) => bytes,
    };
    let written = bytes.len() as u64;

    // HEAD shares its key with GET; storing its empty body would poison the
    // GET entry, so only GET responses are admitted.
    if method == Method::GET && keygen::is_response_cacheable(parts.status, &parts.headers) {
        store_response(&state, &host, &key, &parts, &bytes).await;
    }

    state.stats.record_traffic(written);
    emit(&state, &host, CacheEvent::Traffic, written);
    Response::from_parts(parts, Body::from(bytes))
}

async fn store_response(
    state: &AppState,
    host: &str,
    key: &str,
    parts: &response::Parts,
    bytes: &Bytes,
) {
    let meta = build_meta(state, parts);

    let (store_bytes, store_meta) = match (&state.mode, &state.pipeline) {
        (OptimizeMode::Sync, Some(pipeline)) => {
            match pipeline.apply_bytes(bytes.to_vec(), &meta).await {
                Ok((optimized, new_meta)) => (optimized, new_meta),
                Err(e) => {
                    // A broken transform must never cost us the entry.
                    warn!(key, "pipeline failed, caching original bytes: {e}");
                    (bytes.to_vec(), meta)
                }
            }
        }
        _ => (bytes.to_vec(), meta),
    };

    let stored = store_bytes.len() as u64;
    match state
        .store
        .put(key, reader_from_bytes(store_bytes), store_meta)
        .await
    {
        Ok(()) => {
            state.stats.record_put();
            emit(state, host, CacheEvent::Put, stored);
            if matches!(state.mode, OptimizeMode::Async) && state.pipeline.is_some() {
                if let Some(optimizer) = &state.optimizer {
                    optimizer.enqueue(key.to_string());
                }
            }
        }
        Err(CacheError::EntryTooLarge { size, limit }) => {
            debug!(key, size, limit, "response exceeds the cache limit, not stored");
        }
        Err(e) => {
            state.stats.record_error();
            warn!(key, "cache write failed: {e}");
        }
    }
}

fn build_meta(state: &AppState, parts: &response::Parts) -> CacheMeta {
    let headers = &parts.headers;
    let mut preserved = HashMap::new();
    for (name, label) in [(header::LAST_MODIFIED, "Last-Modified"), (header::VARY, "Vary")] {
        if let Some(value) = headers.get(&name).and_then(|v| v.to_str().ok()) {
            preserved.insert(label.to_string(), value.to_string());
        }
    }

    CacheMeta {
        content_type: header_str(headers, &header::CONTENT_TYPE).unwrap_or_default(),
        encoding: header_str(headers, &header::CONTENT_ENCODING).unwrap_or_default(),
        size: 0, // recomputed by the store from the bytes it consumes
        etag: header_str(headers, &header::ETAG),
        status_code: parts.status.as_u16(),
        ttl_secs: state.default_ttl_secs,
        cached_at: now_unix(),
        headers: preserved,
    }
}

fn header_str(headers: &axum::http::HeaderMap, name: &header::HeaderName) -> Option<String> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string)
}

/// The outcome of draining an upstream body against a size cap.
enum Captured {
    /// The whole body fit; it can be both stored and replayed.
    Full(Bytes),
    /// The body outgrew the cap; the consumed part and the live remainder
    /// are stitched back into one streaming body.
    Overflow(Body),
}

async fn capture_body(body: Body, cap: u64) -> Result<Captured, axum::Error> {
    let mut stream = body.into_data_stream();
    let mut buf = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if buf.len() as u64 + chunk.len() as u64 > cap {
            let head = buf.freeze();
            let rest = async_stream::stream! {
                if !head.is_empty() {
                    yield Ok::<Bytes, axum::Error>(head);
                }
                yield Ok(chunk);
                while let Some(next) = stream.next().await {
                    yield next;
                }
            };
            return Ok(Captured::Overflow(Body::from_stream(rest)));
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(Captured::Full(buf.freeze()))
}

fn declared_length(parts: &response::Parts) -> Option<u64> {
    parts
        .headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

fn set_miss_header(headers: &mut axum::http::HeaderMap) {
    headers.insert(HeaderName::from_static(X_CACHE), HeaderValue::from_static("MISS"));
}

fn insert_header(headers: &mut axum::http::HeaderMap, name: header::HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

fn scheme_of(req: &Request) -> String {
    req.headers()
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http")
        .to_string()
}

fn host_of(req: &Request) -> String {
    if let Some(host) = req.headers().get(header::HOST).and_then(|v| v.to_str().ok()) {
        return host.to_string();
    }
    req.uri().host().unwrap_or_default().to_string()
}

fn emit(state: &AppState, host: &str, event: CacheEvent, bytes: u64) {
    if event == CacheEvent::Traffic {
        metrics::TRAFFIC_BYTES_TOTAL
            .with_label_values(&[host])
            .inc_by(bytes as f64);
    }
    if let Some(callback) = &state.events {
        callback(host, event, bytes);
    }
}
