// src/core/tasks/janitor.rs

//! A background task that sweeps expired entries out of the filesystem
//! store. Opportunistic deletion on `get` covers entries that are still
//! requested; this task bounds the disk held by entries nobody asks for
//! anymore.

use crate::core::storage::fs::FsStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// The interval at which the janitor scans the store.
const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

pub struct JanitorTask {
    store: Arc<FsStore>,
}

impl JanitorTask {
    pub fn new(store: Arc<FsStore>) -> Self {
        Self { store }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("cache janitor task started");
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        // The first tick fires immediately; skip it so startup stays quiet.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.store.sweep_expired().await {
                        Ok(0) => {}
                        Ok(removed) => debug!(removed, "janitor removed expired entries"),
                        Err(e) => warn!("janitor sweep failed: {e}"),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("cache janitor shutting down");
                    return;
                }
            }
        }
    }
}
