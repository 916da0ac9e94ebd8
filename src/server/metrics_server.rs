// src/server/metrics_server.rs

//! A small HTTP server exposing Prometheus metrics on its own port.

use crate::core::metrics::gather_metrics;
use axum::{Router, http::StatusCode, response::IntoResponse, routing::get};
use std::net::SocketAddr;
use tokio::sync::broadcast;
use tracing::{error, info};

async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        gather_metrics(),
    )
}

/// Runs the metrics listener until the shutdown channel fires.
pub async fn run(port: u16, mut shutdown_rx: broadcast::Receiver<()>) {
    let app = Router::new().route("/metrics", get(metrics_handler));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Prometheus metrics server listening on http://{addr}/metrics");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind metrics server on port {port}: {e}");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_rx.recv().await.ok();
            info!("Metrics server shutting down.");
        })
        .await
    {
        error!("Metrics server error: {e}");
    }
}
