// src/core/errors.rs

//! Defines the primary error type for the entire middleware.

use thiserror::Error;

/// The main error enum, representing all possible failures within the cache
/// core. Using `thiserror` allows for clean error definitions and automatic
/// `From` trait implementations.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("HTTP client error: {0}")]
    HttpClient(String),

    #[error("JSON serialization/deserialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("entry of {size} bytes exceeds the cache limit of {limit} bytes")]
    EntryTooLarge { size: u64, limit: u64 },

    #[error("invalid cache key '{0}'")]
    InvalidKey(String),

    #[error("purge rejected by {endpoint} with status {status}")]
    PurgeRejected { endpoint: String, status: u16 },

    #[error("pipeline error: {0}")]
    Pipeline(String),

    #[error("operation not supported by this backend: {0}")]
    Unsupported(String),

    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl From<reqwest::Error> for CacheError {
    fn from(e: reqwest::Error) -> Self {
        CacheError::HttpClient(e.to_string())
    }
}
