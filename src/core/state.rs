// src/core/state.rs

//! The shared state handed to every request and background task.

use crate::config::OptimizeMode;
use crate::core::events::EventCallback;
use crate::core::keygen::KeyGenerator;
use crate::core::pipeline::Pipeline;
use crate::core::stats::Stats;
use crate::core::storage::CacheStore;
use crate::core::storage::varnish::VarnishStore;
use crate::core::tasks::optimizer::OptimizerQueue;
use regex::Regex;
use std::sync::Arc;

/// Everything the middleware needs, read-only after construction. Shared as
/// one `Arc` across the request handlers, the admin API and the workers.
pub struct AppState {
    pub enabled: bool,
    pub store: Arc<dyn CacheStore>,
    /// Present only for the varnish backend; gives the admin API access to
    /// the backend-specific `ban` operation.
    pub varnish: Option<Arc<VarnishStore>>,
    pub keygen: KeyGenerator,
    /// Compiled path gate. Empty means "no gate": every path is eligible.
    pub path_gate: Vec<Regex>,
    pub default_ttl_secs: i64,
    pub max_cache_size: u64,
    pub mode: OptimizeMode,
    pub pipeline: Option<Arc<Pipeline>>,
    pub optimizer: Option<OptimizerQueue>,
    pub stats: Stats,
    pub events: Option<EventCallback>,
    pub admin_secret: String,
    pub upstream: String,
    pub http: reqwest::Client,
}

impl AppState {
    pub fn path_allowed(&self, path: &str) -> bool {
        self.path_gate.is_empty() || self.path_gate.iter().any(|re| re.is_match(path))
    }
}
