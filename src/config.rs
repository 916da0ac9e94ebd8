// src/config.rs

//! Manages middleware configuration: loading, defaulting, and validation.
//!
//! The configuration is a single JSON document loaded at startup. Every
//! field has a default so a minimal deployment only states what it changes.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::fs;

/// The backing store a deployment runs against.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Fs,
    Redis,
    Varnish,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Fs => "fs",
            Backend::Redis => "redis",
            Backend::Varnish => "varnish",
        }
    }
}

/// When the transform pipeline runs relative to the cache write.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OptimizeMode {
    Sync,
    Async,
    #[default]
    Disabled,
}

impl OptimizeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptimizeMode::Sync => "sync",
            OptimizeMode::Async => "async",
            OptimizeMode::Disabled => "disabled",
        }
    }
}

/// Settings for the filesystem backend.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FsConfig {
    #[serde(default = "default_fs_root")]
    pub root: String,
    /// Levels of two-character shard directories, 0 to 4.
    #[serde(default = "default_shard_depth")]
    pub shard_depth: usize,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            root: default_fs_root(),
            shard_depth: default_shard_depth(),
        }
    }
}

fn default_fs_root() -> String {
    "opalcache_data/entries".to_string()
}
fn default_shard_depth() -> usize {
    2
}

/// Settings for the remote key-value backend.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RedisConfig {
    #[serde(default = "default_redis_addr")]
    pub addr: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub db: i64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            addr: default_redis_addr(),
            password: String::new(),
            db: 0,
        }
    }
}

fn default_redis_addr() -> String {
    "127.0.0.1:6379".to_string()
}

/// Settings for the external HTTP-purge backend.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct VarnishConfig {
    #[serde(default)]
    pub endpoints: Vec<String>,
}

/// Settings for the transform pipeline and its worker pool.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct OptimizeConfig {
    #[serde(default)]
    pub mode: OptimizeMode,
    #[serde(default)]
    pub minify_html: bool,
    #[serde(default)]
    pub minify_css: bool,
    #[serde(default)]
    pub minify_js: bool,
    #[serde(default)]
    pub minify_json: bool,
    #[serde(default)]
    pub minify_svg: bool,
    #[serde(default)]
    pub minify_xml: bool,
    #[serde(default)]
    pub compress_brotli: bool,
    #[serde(default)]
    pub compress_gzip: bool,
    /// Bodies smaller than this skip compression entirely.
    #[serde(default = "default_compress_min_size")]
    pub compress_min_size: usize,
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
}

impl Default for OptimizeConfig {
    fn default() -> Self {
        Self {
            mode: OptimizeMode::default(),
            minify_html: false,
            minify_css: false,
            minify_js: false,
            minify_json: false,
            minify_svg: false,
            minify_xml: false,
            compress_brotli: false,
            compress_gzip: false,
            compress_min_size: default_compress_min_size(),
            queue_size: default_queue_size(),
            workers: default_workers(),
            retry_attempts: default_retry_attempts(),
            retry_delay_secs: default_retry_delay_secs(),
        }
    }
}

fn default_compress_min_size() -> usize {
    1024
}
fn default_queue_size() -> usize {
    1000
}
fn default_workers() -> usize {
    4
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_delay_secs() -> u64 {
    5
}

/// Settings for the cache key generator.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct KeyConfig {
    /// Request headers folded into the key, in declaration order.
    #[serde(default = "default_vary_headers")]
    pub vary_headers: Vec<String>,
    #[serde(default = "default_true")]
    pub include_query: bool,
    #[serde(default)]
    pub case_sensitive: bool,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            vary_headers: default_vary_headers(),
            include_query: true,
            case_sensitive: false,
        }
    }
}

fn default_vary_headers() -> Vec<String> {
    vec!["Accept-Encoding".to_string()]
}
fn default_true() -> bool {
    true
}

/// Configuration for the Prometheus metrics exporter.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct MetricsConfig {
    /// If true, an HTTP server will be started to expose Prometheus metrics.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_port() -> u16 {
    9787
}

/// The fully-defaulted middleware configuration.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub backend: Backend,
    /// Default entry TTL in seconds. Non-positive means entries never expire.
    #[serde(default = "default_ttl")]
    pub ttl: i64,
    /// The largest response body, in bytes, admitted to the cache.
    #[serde(default = "default_max_cache_size")]
    pub max_cache_size: u64,
    #[serde(default)]
    pub fs: FsConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub varnish: VarnishConfig,
    #[serde(default)]
    pub optimize: OptimizeConfig,
    /// Regex path gate; an empty list caches every path passing the other
    /// rules.
    #[serde(default)]
    pub cacheable_paths: Vec<String>,
    /// Shared secret for the admin API. Empty disables authentication.
    #[serde(default)]
    pub admin_secret: String,
    #[serde(default)]
    pub key: KeyConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// The origin every non-cached request is forwarded to.
    #[serde(default = "default_upstream")]
    pub upstream: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: Backend::default(),
            ttl: default_ttl(),
            max_cache_size: default_max_cache_size(),
            fs: FsConfig::default(),
            redis: RedisConfig::default(),
            varnish: VarnishConfig::default(),
            optimize: OptimizeConfig::default(),
            cacheable_paths: vec![],
            admin_secret: String::new(),
            key: KeyConfig::default(),
            metrics: MetricsConfig::default(),
            host: default_host(),
            port: default_port(),
            upstream: default_upstream(),
            log_level: default_log_level(),
        }
    }
}

fn default_ttl() -> i64 {
    3600
}
fn default_max_cache_size() -> u64 {
    10 * 1024 * 1024
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8686
}
fn default_upstream() -> String {
    "http://127.0.0.1:8080".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let config: Config = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse JSON from '{path}'"))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations that would fail later in confusing ways.
    pub fn validate(&self) -> Result<()> {
        if self.fs.shard_depth > crate::core::storage::fs::MAX_SHARD_DEPTH {
            bail!(
                "fs.shard_depth must be between 0 and {}",
                crate::core::storage::fs::MAX_SHARD_DEPTH
            );
        }
        if self.backend == Backend::Varnish && self.varnish.endpoints.is_empty() {
            bail!("the varnish backend requires at least one endpoint");
        }
        for pattern in &self.cacheable_paths {
            regex::Regex::new(pattern)
                .with_context(|| format!("invalid cacheable_paths pattern '{pattern}'"))?;
        }
        let upstream = url::Url::parse(&self.upstream)
            .with_context(|| format!("invalid upstream URL '{}'", self.upstream))?;
        if upstream.scheme() != "http" && upstream.scheme() != "https" {
            bail!("upstream must be an http or https URL");
        }
        Ok(())
    }

    /// The default entry TTL in seconds.
    pub fn ttl_secs(&self) -> i64 {
        self.ttl
    }

    /// The compiled path gate. `validate` has already proven the patterns.
    pub fn compiled_paths(&self) -> Result<Vec<regex::Regex>> {
        self.cacheable_paths
            .iter()
            .map(|p| {
                regex::Regex::new(p)
                    .with_context(|| format!("invalid cacheable_paths pattern '{p}'"))
            })
            .collect()
    }
}
