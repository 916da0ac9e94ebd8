// src/core/tasks/optimizer.rs

//! The background worker pool executing asynchronous optimization jobs.
//!
//! A job names one cache key. A worker re-reads the raw entry, re-applies
//! the transform pipeline and writes the result back under the same key.
//! Enqueueing never blocks a request: when the bounded queue is full the
//! job is dropped with a log line and the entry simply stays un-optimized.

use crate::core::errors::CacheError;
use crate::core::metrics;
use crate::core::pipeline::Pipeline;
use crate::core::storage::{CacheStore, read_body, reader_from_bytes};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Per-job time limit for each store round trip, independent of the request
/// that enqueued the job.
const JOB_TIMEOUT: Duration = Duration::from_secs(30);

/// One asynchronous optimization job, passed by value through the queue.
#[derive(Debug)]
pub struct OptimizeJob {
    pub key: String,
}

/// Tuning knobs for the pool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub queue_size: usize,
    pub workers: usize,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_size: 1000,
            workers: 4,
            retry_attempts: 3,
            retry_delay: Duration::from_secs(5),
        }
    }
}

/// The cheap, cloneable handle requests use to hand jobs to the pool.
#[derive(Clone)]
pub struct OptimizerQueue {
    tx: mpsc::Sender<OptimizeJob>,
}

impl OptimizerQueue {
    /// Non-blocking enqueue. Returns whether the job was accepted.
    pub fn enqueue(&self, key: String) -> bool {
        match self.tx.try_send(OptimizeJob { key }) {
            Ok(()) => {
                metrics::OPTIMIZE_QUEUE_DEPTH.inc();
                true
            }
            Err(mpsc::error::TrySendError::Full(job)) => {
                warn!(key = %job.key, "optimization queue full, dropping job");
                metrics::OPTIMIZE_JOBS_DROPPED_TOTAL.inc();
                false
            }
            Err(mpsc::error::TrySendError::Closed(job)) => {
                warn!(key = %job.key, "optimization queue closed, dropping job");
                false
            }
        }
    }
}

/// Owns the worker join handles; `stop` waits for every worker to exit.
pub struct OptimizerPool {
    handles: Vec<JoinHandle<()>>,
}

impl OptimizerPool {
    pub async fn stop(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
        info!("optimization worker pool stopped");
    }
}

/// Spawns the pool. Workers exit once the shutdown channel fires and the
/// queue is drained.
pub fn start(
    store: Arc<dyn CacheStore>,
    pipeline: Arc<Pipeline>,
    config: WorkerConfig,
    shutdown: &broadcast::Sender<()>,
) -> (OptimizerQueue, OptimizerPool) {
    let (tx, rx) = mpsc::channel(config.queue_size.max(1));
    let rx = Arc::new(Mutex::new(rx));

    let worker_count = config.workers.max(1);
    let mut handles = Vec::with_capacity(worker_count);
    for id in 0..worker_count {
        let worker = Worker {
            id,
            store: store.clone(),
            pipeline: pipeline.clone(),
            retry_attempts: config.retry_attempts.max(1),
            retry_delay: config.retry_delay,
            rx: rx.clone(),
        };
        handles.push(tokio::spawn(worker.run(shutdown.subscribe())));
    }
    info!(workers = worker_count, queue = config.queue_size, "optimization worker pool started");

    (OptimizerQueue { tx }, OptimizerPool { handles })
}

struct Worker {
    id: usize,
    store: Arc<dyn CacheStore>,
    pipeline: Arc<Pipeline>,
    retry_attempts: u32,
    retry_delay: Duration,
    rx: Arc<Mutex<mpsc::Receiver<OptimizeJob>>>,
}

impl Worker {
    async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        debug!(worker = self.id, "optimization worker started");
        loop {
            let job = {
                let mut rx = self.rx.lock().await;
                tokio::select! {
                    job = rx.recv() => job,
                    _ = shutdown_rx.recv() => {
                        // Stop accepting new jobs; drain what is buffered.
                        rx.close();
                        rx.try_recv().ok()
                    }
                }
            };
            let Some(job) = job else {
                debug!(worker = self.id, "optimization worker exiting");
                return;
            };
            metrics::OPTIMIZE_QUEUE_DEPTH.dec();
            self.process(job).await;
        }
    }

    async fn process(&self, job: OptimizeJob) {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.optimize(&job.key).await {
                Ok(true) => {
                    debug!(worker = self.id, key = %job.key, "entry optimized");
                    return;
                }
                Ok(false) => return,
                Err(e) if attempt < self.retry_attempts => {
                    warn!(worker = self.id, key = %job.key, attempt, "optimization failed, will retry: {e}");
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => {
                    warn!(worker = self.id, key = %job.key, "optimization failed permanently: {e}");
                    return;
                }
            }
        }
    }

    /// One optimization attempt. `Ok(false)` means the entry disappeared in
    /// the meantime, which is not an error and not retried.
    async fn optimize(&self, key: &str) -> Result<bool, CacheError> {
        let entry = tokio::time::timeout(JOB_TIMEOUT, self.store.get(key))
            .await
            .map_err(|_| CacheError::InvalidState("store lookup timed out".into()))??;
        let Some((body, meta)) = entry else {
            debug!(key, "entry vanished before optimization");
            return Ok(false);
        };

        let raw = read_body(body, None).await?;
        let (optimized, new_meta) = self.pipeline.apply_bytes(raw, &meta).await?;

        tokio::time::timeout(
            JOB_TIMEOUT,
            self.store.put(key, reader_from_bytes(optimized), new_meta),
        )
        .await
        .map_err(|_| CacheError::InvalidState("store write timed out".into()))??;
        Ok(true)
    }
}
