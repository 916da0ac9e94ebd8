// src/server/admin.rs

//! The administrative HTTP API: purge, purge-prefix, status, ban.
//!
//! Every endpoint is authenticated by the shared secret, presented either as
//! `Authorization: Bearer <secret>` or `?secret=<secret>`. An empty
//! configured secret bypasses authentication. Bodies are parsed by hand so
//! a malformed document is a clean `400` rather than a framework rejection.

use crate::core::errors::CacheError;
use crate::core::state::AppState;
use crate::core::storage::CacheStore;
use axum::Json;
use axum::Router;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/_cache/purge", post(purge))
        .route("/_cache/purge-prefix", post(purge_prefix))
        .route("/_cache/status", get(status))
        .route("/_cache/ban", post(ban))
}

#[derive(Deserialize)]
struct PurgeRequest {
    key: String,
}

#[derive(Deserialize)]
struct PurgePrefixRequest {
    prefix: String,
}

#[derive(Deserialize)]
struct BanRequest {
    expression: Option<String>,
    prefix: Option<String>,
}

#[derive(Serialize)]
struct StatusResponse {
    enabled: bool,
    backend: &'static str,
    mode: &'static str,
    ttl_secs: i64,
    max_cache_size: u64,
    stats: crate::core::stats::StatsSnapshot,
}

fn authorized(state: &AppState, headers: &HeaderMap, query: &HashMap<String, String>) -> bool {
    if state.admin_secret.is_empty() {
        return true;
    }
    if let Some(auth) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(token) = auth.strip_prefix("Bearer ") {
            if token == state.admin_secret {
                return true;
            }
        }
    }
    query.get("secret").map(String::as_str) == Some(state.admin_secret.as_str())
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn store_error(operation: &str, e: &CacheError) -> Response {
    warn!("admin {operation} failed: {e}");
    match e {
        CacheError::InvalidKey(_) => error_response(StatusCode::BAD_REQUEST, &e.to_string()),
        _ => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

async fn purge(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    if !authorized(&state, &headers, &query) {
        return error_response(StatusCode::UNAUTHORIZED, "unauthorized");
    }
    let request: PurgeRequest = match serde_json::from_str(&body) {
        Ok(request) => request,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, &format!("invalid body: {e}")),
    };
    match state.store.delete(&request.key).await {
        Ok(()) => {
            info!(key = %request.key, "entry purged");
            (StatusCode::OK, Json(json!({ "purged": request.key }))).into_response()
        }
        Err(e) => store_error("purge", &e),
    }
}

async fn purge_prefix(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    if !authorized(&state, &headers, &query) {
        return error_response(StatusCode::UNAUTHORIZED, "unauthorized");
    }
    let request: PurgePrefixRequest = match serde_json::from_str(&body) {
        Ok(request) => request,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, &format!("invalid body: {e}")),
    };
    match state.store.purge_prefix(&request.prefix).await {
        Ok(()) => {
            info!(prefix = %request.prefix, "prefix purged");
            (StatusCode::OK, Json(json!({ "purged_prefix": request.prefix }))).into_response()
        }
        Err(e) => store_error("purge-prefix", &e),
    }
}

async fn status(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&state, &headers, &query) {
        return error_response(StatusCode::UNAUTHORIZED, "unauthorized");
    }
    let response = StatusResponse {
        enabled: state.enabled,
        backend: state.store.backend_name(),
        mode: state.mode.as_str(),
        ttl_secs: state.default_ttl_secs,
        max_cache_size: state.max_cache_size,
        stats: state.stats.snapshot(),
    };
    (StatusCode::OK, Json(response)).into_response()
}

async fn ban(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    if !authorized(&state, &headers, &query) {
        return error_response(StatusCode::UNAUTHORIZED, "unauthorized");
    }
    let Some(varnish) = &state.varnish else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "ban is only available on the varnish backend",
        );
    };
    let request: BanRequest = match serde_json::from_str(&body) {
        Ok(request) => request,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, &format!("invalid body: {e}")),
    };
    let result = match (&request.expression, &request.prefix) {
        (Some(expression), _) => varnish.ban(expression).await,
        (None, Some(prefix)) => varnish.purge_prefix(prefix).await,
        (None, None) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "ban requires an \"expression\" or a \"prefix\"",
            );
        }
    };
    match result {
        Ok(()) => (StatusCode::OK, Json(json!({ "banned": true }))).into_response(),
        Err(e) => store_error("ban", &e),
    }
}
