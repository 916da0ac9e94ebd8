// src/server/mod.rs

//! Server startup: builds the store, pipeline and worker pool from the
//! configuration, wires the cache middleware around the upstream forwarder,
//! and runs until a shutdown signal arrives.

pub mod admin;
mod metrics_server;
pub mod proxy;

use crate::config::{Config, OptimizeMode};
use crate::core::events::EventCallback;
use crate::core::keygen::KeyGenerator;
use crate::core::middleware::cache_middleware;
use crate::core::pipeline::build_pipeline;
use crate::core::state::AppState;
use crate::core::stats::Stats;
use crate::core::storage::{CacheStore, build_store};
use crate::core::tasks::janitor::JanitorTask;
use crate::core::tasks::optimizer::{self, WorkerConfig};
use anyhow::{Context, Result};
use axum::Router;
use axum::middleware;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// The main startup function, orchestrating all setup phases.
pub async fn run(config: Config) -> Result<()> {
    let built = build_store(&config)
        .await
        .context("failed to initialize the cache store")?;

    let (shutdown_tx, _) = broadcast::channel(1);

    let pipeline = build_pipeline(&config.optimize).map(Arc::new);
    let (optimizer_queue, optimizer_pool) = match (&config.optimize.mode, &pipeline) {
        (OptimizeMode::Async, Some(pipeline)) => {
            let worker_config = WorkerConfig {
                queue_size: config.optimize.queue_size,
                workers: config.optimize.workers,
                retry_attempts: config.optimize.retry_attempts,
                retry_delay: Duration::from_secs(config.optimize.retry_delay_secs),
            };
            let (queue, pool) = optimizer::start(
                built.store.clone(),
                pipeline.clone(),
                worker_config,
                &shutdown_tx,
            );
            (Some(queue), Some(pool))
        }
        _ => (None, None),
    };

    // The default event sink just logs; per-host byte counters already feed
    // the Prometheus registry inside the middleware.
    let events: EventCallback = Arc::new(|host, event, bytes| {
        debug!(target: "opalcache::events", host, event = event.as_str(), bytes, "cache event");
    });

    let state = Arc::new(AppState {
        enabled: config.enabled,
        store: built.store.clone(),
        varnish: built.varnish.clone(),
        keygen: KeyGenerator::new(
            config.key.include_query,
            config.key.case_sensitive,
            config.key.vary_headers.clone(),
        ),
        path_gate: config.compiled_paths()?,
        default_ttl_secs: config.ttl_secs(),
        max_cache_size: config.max_cache_size,
        mode: config.optimize.mode,
        pipeline,
        optimizer: optimizer_queue,
        stats: Stats::new(),
        events: Some(events),
        admin_secret: config.admin_secret.clone(),
        upstream: config.upstream.clone(),
        http: reqwest::Client::new(),
    });

    if let Some(fs_store) = built.fs.clone() {
        tokio::spawn(JanitorTask::new(fs_store).run(shutdown_tx.subscribe()));
    }
    if config.metrics.enabled {
        tokio::spawn(metrics_server::run(
            config.metrics.port,
            shutdown_tx.subscribe(),
        ));
    }

    let proxied = Router::new()
        .fallback(proxy::forward)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            cache_middleware,
        ));
    let app = admin::router().merge(proxied).with_state(state.clone());

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(
        backend = state.store.backend_name(),
        upstream = %config.upstream,
        "opalcache listening on http://{addr}"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .context("server error")?;

    let _ = shutdown_tx.send(());
    if let Some(pool) = optimizer_pool {
        pool.stop().await;
    }
    if let Err(e) = state.store.close().await {
        warn!("error while closing the store: {e}");
    }
    Ok(())
}
