// src/core/storage/mod.rs

//! The cache store abstraction and its concrete backends.

pub mod fs;
pub mod meta;
pub mod redis;
pub mod varnish;

use crate::config::{Backend, Config};
use crate::core::errors::CacheError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};

pub use meta::CacheMeta;

/// An opaque, streaming cache body. The reader is owned by whoever received
/// it from `get`; dropping it releases the underlying resource.
pub type BodyReader = Box<dyn AsyncRead + Send + Unpin>;

/// The uniform contract every backend implements.
///
/// Keys are 64-character lowercase hex strings (SHA-256 of the request
/// fingerprint) and are treated as opaque here. Cancellation follows the
/// tokio model: callers drop the returned future or wrap calls in
/// `tokio::time::timeout`.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Looks up an entry. Expired entries surface as `Ok(None)` and are
    /// opportunistically deleted. On `Ok(Some(..))` the caller owns the
    /// body reader.
    async fn get(&self, key: &str) -> Result<Option<(BodyReader, CacheMeta)>, CacheError>;

    /// Consumes `body` fully and durably stores the entry. On failure no
    /// partial entry may remain visible to `get`.
    async fn put(&self, key: &str, body: BodyReader, meta: CacheMeta) -> Result<(), CacheError>;

    /// Removes an entry. Deleting a missing entry is success.
    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Best-effort bulk delete of every entry whose cache key matches
    /// `prefix`. After completion no matching entry is returned by `get`.
    async fn purge_prefix(&self, prefix: &str) -> Result<(), CacheError>;

    /// Releases held resources. Further calls on the store are undefined.
    async fn close(&self) -> Result<(), CacheError>;

    /// A short, stable backend identifier for logs and the status endpoint.
    fn backend_name(&self) -> &'static str;
}

/// Reads a body reader to completion, optionally enforcing a byte limit.
/// With a limit, exceeding it yields `CacheError::EntryTooLarge` without
/// reading further than `limit + 1` bytes.
pub async fn read_body(
    mut body: BodyReader,
    limit: Option<u64>,
) -> Result<Vec<u8>, CacheError> {
    match limit {
        None => {
            let mut buf = Vec::new();
            body.read_to_end(&mut buf).await?;
            Ok(buf)
        }
        Some(limit) => {
            let mut bounded = body.take(limit + 1);
            let mut buf = Vec::with_capacity(limit.min(64 * 1024) as usize + 1);
            bounded.read_to_end(&mut buf).await?;
            if buf.len() as u64 > limit {
                return Err(CacheError::EntryTooLarge {
                    size: buf.len() as u64,
                    limit,
                });
            }
            Ok(buf)
        }
    }
}

/// Wraps in-memory bytes as a `BodyReader`.
pub fn reader_from_bytes(bytes: Vec<u8>) -> BodyReader {
    Box::new(std::io::Cursor::new(bytes))
}

/// The stores built from one configuration. The backend-specific handles
/// are populated only when that backend is selected: `varnish` gives the
/// admin API its `ban` operation, `fs` gives the janitor its sweep target.
pub struct BuiltStore {
    pub store: Arc<dyn CacheStore>,
    pub varnish: Option<Arc<varnish::VarnishStore>>,
    pub fs: Option<Arc<fs::FsStore>>,
}

/// Instantiates the backend selected by the configuration.
pub async fn build_store(config: &Config) -> Result<BuiltStore, CacheError> {
    match config.backend {
        Backend::Fs => {
            let store = Arc::new(fs::FsStore::open(&config.fs.root, config.fs.shard_depth).await?);
            Ok(BuiltStore {
                store: store.clone(),
                varnish: None,
                fs: Some(store),
            })
        }
        Backend::Redis => {
            let store = redis::RedisStore::connect(
                &config.redis,
                config.ttl_secs(),
                config.max_cache_size,
            )
            .await?;
            Ok(BuiltStore {
                store: Arc::new(store),
                varnish: None,
                fs: None,
            })
        }
        Backend::Varnish => {
            let store = Arc::new(varnish::VarnishStore::new(&config.varnish.endpoints)?);
            Ok(BuiltStore {
                store: store.clone(),
                varnish: Some(store),
                fs: None,
            })
        }
    }
}
