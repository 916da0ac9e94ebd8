// src/core/storage/redis.rs

//! The remote key-value cache backend.
//!
//! Every entry occupies two logical keys under a namespace prefix:
//! `<prefix><key>:data` holds the raw body and `<prefix><key>:meta` holds the
//! compact-JSON metadata. Both halves are written in one pipelined round
//! trip with the same TTL, so the backend expires entries natively; an
//! expired meta observed on read is deleted opportunistically as well.

use crate::config::RedisConfig;
use crate::core::errors::CacheError;
use crate::core::storage::meta::CacheMeta;
use crate::core::storage::{BodyReader, CacheStore, read_body, reader_from_bytes};
use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::collections::HashSet;
use tracing::debug;

/// Namespace distinguishing this application's keys from everything else
/// living in the same database.
const KEY_PREFIX: &str = "opalcache:";

const DATA_SUFFIX: &str = ":data";
const META_SUFFIX: &str = ":meta";

/// How many keys one SCAN round trip asks for during a prefix purge.
const SCAN_BATCH: usize = 200;

pub struct RedisStore {
    conn: ConnectionManager,
    prefix: String,
    /// Applied when an entry's own TTL is non-positive, so nothing lingers
    /// in the remote store forever.
    fallback_ttl_secs: i64,
    max_size: u64,
}

/// Recovers the base cache key from a namespaced redis key, or `None` for
/// keys that do not belong to this store.
fn base_key<'a>(namespaced: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = namespaced.strip_prefix(prefix)?;
    rest.strip_suffix(DATA_SUFFIX)
        .or_else(|| rest.strip_suffix(META_SUFFIX))
}

impl RedisStore {
    pub async fn connect(
        config: &RedisConfig,
        fallback_ttl_secs: i64,
        max_size: u64,
    ) -> Result<Self, CacheError> {
        let url = if config.password.is_empty() {
            format!("redis://{}/{}", config.addr, config.db)
        } else {
            format!(
                "redis://:{}@{}/{}",
                urlencoding::encode(&config.password),
                config.addr,
                config.db
            )
        };
        let client = redis::Client::open(url.as_str())?;
        let conn = client.get_tokio_connection_manager().await?;
        Ok(Self {
            conn,
            prefix: KEY_PREFIX.to_string(),
            fallback_ttl_secs,
            max_size,
        })
    }

    fn data_key(&self, key: &str) -> String {
        format!("{}{}{}", self.prefix, key, DATA_SUFFIX)
    }

    fn meta_key(&self, key: &str) -> String {
        format!("{}{}{}", self.prefix, key, META_SUFFIX)
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<(BodyReader, CacheMeta)>, CacheError> {
        let mut conn = self.conn.clone();
        let (data, raw_meta): (Option<Vec<u8>>, Option<Vec<u8>>) = redis::pipe()
            .get(self.data_key(key))
            .get(self.meta_key(key))
            .query_async(&mut conn)
            .await?;

        // A missing half, whatever the cause, reads as not-found.
        let (Some(data), Some(raw_meta)) = (data, raw_meta) else {
            return Ok(None);
        };
        let meta: CacheMeta = serde_json::from_slice(&raw_meta)?;
        if meta.is_expired() {
            debug!(key, "removing expired entry");
            let _ = self.delete(key).await;
            return Ok(None);
        }
        Ok(Some((reader_from_bytes(data), meta)))
    }

    async fn put(&self, key: &str, body: BodyReader, meta: CacheMeta) -> Result<(), CacheError> {
        let data = read_body(body, Some(self.max_size)).await?;
        let mut meta = meta;
        meta.size = data.len() as u64;

        let ttl_secs = if meta.ttl_secs > 0 {
            meta.ttl_secs
        } else {
            self.fallback_ttl_secs
        };
        let raw_meta = serde_json::to_vec(&meta)?;

        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        if ttl_secs > 0 {
            pipe.set_ex(self.data_key(key), data, ttl_secs as u64)
                .ignore()
                .set_ex(self.meta_key(key), raw_meta, ttl_secs as u64)
                .ignore();
        } else {
            pipe.set(self.data_key(key), data)
                .ignore()
                .set(self.meta_key(key), raw_meta)
                .ignore();
        }
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .del(vec![self.data_key(key), self.meta_key(key)])
            .await?;
        Ok(())
    }

    async fn purge_prefix(&self, prefix: &str) -> Result<(), CacheError> {
        let pattern = format!("{}{}*", self.prefix, prefix);
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut base_keys: HashSet<String> = HashSet::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;
            for namespaced in &batch {
                if let Some(base) = base_key(namespaced, &self.prefix) {
                    base_keys.insert(base.to_string());
                }
            }
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        debug!(prefix, count = base_keys.len(), "purging matched entries");
        for key in base_keys {
            self.delete(&key).await?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), CacheError> {
        // The connection manager has no explicit shutdown; dropping the
        // store closes the multiplexed connection.
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::base_key;

    #[test]
    fn base_key_strips_namespace_and_half_suffix() {
        assert_eq!(base_key("opalcache:abc:data", "opalcache:"), Some("abc"));
        assert_eq!(base_key("opalcache:abc:meta", "opalcache:"), Some("abc"));
        assert_eq!(base_key("other:abc:data", "opalcache:"), None);
        assert_eq!(base_key("opalcache:abc", "opalcache:"), None);
    }
}
