// src/core/storage/fs.rs

//! The sharded on-disk cache backend.
//!
//! Each entry is a pair of files in a leaf directory derived from the key
//! prefix: `<root>/<k[0:2]>/<k[2:4]>/<k>.data` plus `<k>.meta` at the
//! configured shard depth. Writes go through a temp-file-then-rename
//! discipline; the meta file is renamed before the data file so that a
//! reader observing the data file always finds valid metadata.

use crate::core::errors::CacheError;
use crate::core::storage::meta::CacheMeta;
use crate::core::storage::{BodyReader, CacheStore};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// The deepest supported shard nesting. Keys are hex SHA-256, so each level
/// fans out into at most 256 subdirectories.
pub const MAX_SHARD_DEPTH: usize = 4;

const DATA_SUFFIX: &str = ".data";
const META_SUFFIX: &str = ".meta";
const TMP_SUFFIX: &str = ".tmp";

pub struct FsStore {
    root: PathBuf,
    shard_depth: usize,
}

/// Rejects anything that is not a full 64-character lowercase hex key. This
/// is the barrier that keeps user-supplied strings out of filesystem paths.
fn validate_key(key: &str) -> Result<(), CacheError> {
    if key.len() == 64
        && key
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    {
        return Ok(());
    }
    Err(CacheError::InvalidKey(key.to_string()))
}

impl FsStore {
    /// Opens (creating if needed) a store rooted at `root` with the given
    /// shard depth (0 disables sharding).
    pub async fn open(root: impl AsRef<Path>, shard_depth: usize) -> Result<Self, CacheError> {
        if shard_depth > MAX_SHARD_DEPTH {
            return Err(CacheError::InvalidState(format!(
                "shard depth {shard_depth} exceeds the maximum of {MAX_SHARD_DEPTH}"
            )));
        }
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root, shard_depth })
    }

    /// The leaf directory an entry lives in.
    fn leaf_dir(&self, key: &str) -> PathBuf {
        let mut dir = self.root.clone();
        for level in 0..self.shard_depth {
            dir.push(&key[level * 2..level * 2 + 2]);
        }
        dir
    }

    fn data_path(&self, key: &str) -> PathBuf {
        self.leaf_dir(key).join(format!("{key}{DATA_SUFFIX}"))
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.leaf_dir(key).join(format!("{key}{META_SUFFIX}"))
    }

    async fn write_entry(
        &self,
        data_tmp: &Path,
        meta_tmp: &Path,
        data_path: &Path,
        meta_path: &Path,
        mut body: BodyReader,
        mut meta: CacheMeta,
    ) -> Result<(), CacheError> {
        let mut file = tokio::fs::File::create(data_tmp).await?;
        let copied = tokio::io::copy(&mut body, &mut file).await?;
        file.flush().await?;
        drop(file);

        meta.size = copied;
        tokio::fs::write(meta_tmp, serde_json::to_vec(&meta)?).await?;

        tokio::fs::rename(meta_tmp, meta_path).await?;
        tokio::fs::rename(data_tmp, data_path).await?;
        Ok(())
    }

    /// Walks the store and deletes every expired entry. Returns how many
    /// entries were removed. Used by the janitor task; `get` already removes
    /// expired entries opportunistically.
    pub async fn sweep_expired(&self) -> Result<usize, CacheError> {
        let mut removed = 0;
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                if file_type.is_symlink() {
                    continue;
                }
                if file_type.is_dir() {
                    stack.push(entry.path());
                    continue;
                }
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                let Some(key) = name.strip_suffix(META_SUFFIX) else {
                    continue;
                };
                let meta_path = entry.path();
                let Ok(raw) = tokio::fs::read(&meta_path).await else {
                    continue;
                };
                let Ok(meta) = serde_json::from_slice::<CacheMeta>(&raw) else {
                    continue;
                };
                if meta.is_expired() {
                    let data_path = dir.join(format!("{key}{DATA_SUFFIX}"));
                    if let Err(e) = self.remove_pair(&data_path, &meta_path).await {
                        warn!(key, "janitor failed to remove expired entry: {e}");
                        continue;
                    }
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn remove_pair(&self, data_path: &Path, meta_path: &Path) -> Result<(), CacheError> {
        // Data first: a reader that still sees the data file must find meta.
        for path in [data_path, meta_path] {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CacheStore for FsStore {
    async fn get(&self, key: &str) -> Result<Option<(BodyReader, CacheMeta)>, CacheError> {
        validate_key(key)?;
        let data_path = self.data_path(key);
        let meta_path = self.meta_path(key);

        match tokio::fs::metadata(&data_path).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let raw_meta = match tokio::fs::read(&meta_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let meta: CacheMeta = serde_json::from_slice(&raw_meta)?;

        if meta.is_expired() {
            debug!(key, "removing expired entry");
            if let Err(e) = self.remove_pair(&data_path, &meta_path).await {
                warn!(key, "failed to remove expired entry: {e}");
            }
            return Ok(None);
        }

        let file = match tokio::fs::File::open(&data_path).await {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some((Box::new(file), meta)))
    }

    async fn put(&self, key: &str, body: BodyReader, meta: CacheMeta) -> Result<(), CacheError> {
        validate_key(key)?;
        let dir = self.leaf_dir(key);
        tokio::fs::create_dir_all(&dir).await?;

        let data_tmp = dir.join(format!("{key}{DATA_SUFFIX}{TMP_SUFFIX}"));
        let meta_tmp = dir.join(format!("{key}{META_SUFFIX}{TMP_SUFFIX}"));
        let data_path = self.data_path(key);
        let meta_path = self.meta_path(key);

        let result = self
            .write_entry(&data_tmp, &meta_tmp, &data_path, &meta_path, body, meta)
            .await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(&data_tmp).await;
            let _ = tokio::fs::remove_file(&meta_tmp).await;
        }
        result
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        validate_key(key)?;
        self.remove_pair(&self.data_path(key), &self.meta_path(key))
            .await
    }

    async fn purge_prefix(&self, prefix: &str) -> Result<(), CacheError> {
        // Prefixes compare against the cache key recovered from the file
        // name, never against filesystem paths. The walk ignores symlinks so
        // it can never escape the store root.
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                if file_type.is_symlink() {
                    continue;
                }
                if file_type.is_dir() {
                    stack.push(entry.path());
                    continue;
                }
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                let Some(key) = name.strip_suffix(DATA_SUFFIX) else {
                    continue;
                };
                if key.contains(prefix) {
                    let data_path = entry.path();
                    let meta_path = dir.join(format!("{key}{META_SUFFIX}"));
                    if let Err(e) = self.remove_pair(&data_path, &meta_path).await {
                        warn!(key, "purge failed to remove entry: {e}");
                    }
                }
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), CacheError> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "fs"
    }
}
