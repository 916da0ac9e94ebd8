// src/server/proxy.rs

//! The upstream forwarder sitting behind the cache middleware.
//!
//! Requests that reach it (bypasses and misses) are replayed against the
//! configured origin and the origin's response is streamed back. Hop-by-hop
//! headers are stripped in both directions.

use crate::core::errors::CacheError;
use crate::core::state::AppState;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use tracing::warn;

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub async fn forward(State(state): State<Arc<AppState>>, req: Request) -> Response {
    match forward_inner(&state, req).await {
        Ok(response) => response,
        Err(e) => {
            warn!("upstream request failed: {e}");
            (StatusCode::BAD_GATEWAY, "upstream unavailable").into_response()
        }
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

async fn forward_inner(state: &AppState, req: Request) -> Result<Response, CacheError> {
    let (parts, body) = req.into_parts();

    let mut url = format!(
        "{}{}",
        state.upstream.trim_end_matches('/'),
        parts.uri.path()
    );
    if let Some(query) = parts.uri.query() {
        url.push('?');
        url.push_str(query);
    }

    let mut headers = parts.headers;
    strip_hop_by_hop(&mut headers);
    // reqwest derives Host from the URL; the inbound value must not leak.
    headers.remove(header::HOST);

    let upstream_response = state
        .http
        .request(parts.method, &url)
        .headers(headers)
        .body(reqwest::Body::wrap_stream(body.into_data_stream()))
        .send()
        .await?;

    let status = upstream_response.status();
    let mut response_headers = upstream_response.headers().clone();
    strip_hop_by_hop(&mut response_headers);

    let mut response = Response::new(Body::from_stream(upstream_response.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    Ok(response)
}
