// src/core/storage/varnish.rs

//! The external HTTP-purge backend.
//!
//! The application stores nothing itself; a fleet of upstream HTTP caches
//! does. This backend only knows how to invalidate them: single entries via
//! the `PURGE` verb and bulk sets via `BAN` requests carrying a ban header.

use crate::core::errors::CacheError;
use crate::core::storage::meta::CacheMeta;
use crate::core::storage::{BodyReader, CacheStore};
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use std::time::Duration;
use tracing::debug;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

const BAN_URL_HEADER: &str = "X-Ban-Url";
const BAN_EXPRESSION_HEADER: &str = "X-Ban-Expression";

pub struct VarnishStore {
    endpoints: Vec<String>,
    client: reqwest::Client,
}

fn verb(name: &'static [u8]) -> Result<Method, CacheError> {
    Method::from_bytes(name)
        .map_err(|e| CacheError::InvalidState(format!("invalid HTTP method: {e}")))
}

impl VarnishStore {
    pub fn new(endpoints: &[String]) -> Result<Self, CacheError> {
        if endpoints.is_empty() {
            return Err(CacheError::InvalidState(
                "varnish backend requires at least one endpoint".into(),
            ));
        }
        let client = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self {
            endpoints: endpoints
                .iter()
                .map(|e| e.trim_end_matches('/').to_string())
                .collect(),
            client,
        })
    }

    /// Sends one request to every endpoint. Every endpoint must answer with
    /// `200` or `204`; the first deviation fails the whole operation.
    async fn broadcast(
        &self,
        method: Method,
        path: Option<&str>,
        header: Option<(&'static str, String)>,
    ) -> Result<(), CacheError> {
        for endpoint in &self.endpoints {
            let url = match path {
                Some(p) => format!("{endpoint}/{p}"),
                None => endpoint.clone(),
            };
            let mut request = self.client.request(method.clone(), &url);
            if let Some((name, value)) = &header {
                request = request.header(*name, value);
            }
            let status = request.send().await?.status();
            if status != StatusCode::OK && status != StatusCode::NO_CONTENT {
                return Err(CacheError::PurgeRejected {
                    endpoint: endpoint.clone(),
                    status: status.as_u16(),
                });
            }
        }
        Ok(())
    }

    /// Broadcasts a raw ban expression to the fleet.
    pub async fn ban(&self, expression: &str) -> Result<(), CacheError> {
        debug!(expression, "broadcasting ban");
        self.broadcast(
            verb(b"BAN")?,
            None,
            Some((BAN_EXPRESSION_HEADER, expression.to_string())),
        )
        .await
    }
}

#[async_trait]
impl CacheStore for VarnishStore {
    async fn get(&self, _key: &str) -> Result<Option<(BodyReader, CacheMeta)>, CacheError> {
        Ok(None)
    }

    async fn put(
        &self,
        _key: &str,
        _body: BodyReader,
        _meta: CacheMeta,
    ) -> Result<(), CacheError> {
        // The external caches capture responses on their own; nothing to do.
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.broadcast(verb(b"PURGE")?, Some(key), None).await
    }

    async fn purge_prefix(&self, prefix: &str) -> Result<(), CacheError> {
        // The prefix lands in a regex unescaped; operators own the escaping.
        self.broadcast(
            verb(b"BAN")?,
            None,
            Some((BAN_URL_HEADER, format!("^{prefix}.*"))),
        )
        .await
    }

    async fn close(&self) -> Result<(), CacheError> {
        // Dropping the client releases its idle connections.
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "varnish"
    }
}
