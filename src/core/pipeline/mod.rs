// src/core/pipeline/mod.rs

//! The streaming transform pipeline applied to cached bodies.
//!
//! A [`Transform`] maps one `(body, meta)` pair to another; a [`Pipeline`]
//! folds an ordered list of transforms left to right. Intermediate readers
//! are dropped as each stage consumes them; the externally-supplied input is
//! only dropped once the first stage consumes it, so callers never see a
//! double close. Cancellation follows the tokio model: dropping the `apply`
//! future abandons the fold between stages.

pub mod compress;
pub mod minify;

use crate::config::OptimizeConfig;
use crate::core::errors::CacheError;
use crate::core::storage::meta::CacheMeta;
use crate::core::storage::{BodyReader, read_body, reader_from_bytes};
use async_trait::async_trait;

/// One stage of the pipeline. Implementations either fully consume the input
/// reader or hand it back unchanged; the returned meta is a value copy with
/// `size` (and possibly `encoding`) adjusted.
#[async_trait]
pub trait Transform: Send + Sync {
    fn name(&self) -> &'static str;

    async fn apply(
        &self,
        body: BodyReader,
        meta: &CacheMeta,
    ) -> Result<(BodyReader, CacheMeta), CacheError>;
}

/// An ordered chain of transforms. An empty pipeline is the identity.
#[derive(Default)]
pub struct Pipeline {
    stages: Vec<Box<dyn Transform>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stage(mut self, stage: Box<dyn Transform>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn push(&mut self, stage: Box<dyn Transform>) {
        self.stages.push(stage);
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Folds the stages over a streaming body. On a stage error the body is
    /// lost; callers that need fallback semantics keep their own copy (see
    /// [`Pipeline::apply_bytes`]).
    pub async fn apply(
        &self,
        body: BodyReader,
        meta: CacheMeta,
    ) -> Result<(BodyReader, CacheMeta), CacheError> {
        let mut body = body;
        let mut meta = meta;
        for stage in &self.stages {
            let (next_body, next_meta) = stage
                .apply(body, &meta)
                .await
                .map_err(|e| CacheError::Pipeline(format!("{}: {e}", stage.name())))?;
            body = next_body;
            meta = next_meta;
        }
        Ok((body, meta))
    }

    /// Convenience entry point for callers that already hold the body in
    /// memory. `meta.size` is refreshed even for the empty pipeline.
    pub async fn apply_bytes(
        &self,
        bytes: Vec<u8>,
        meta: &CacheMeta,
    ) -> Result<(Vec<u8>, CacheMeta), CacheError> {
        if self.stages.is_empty() {
            let mut refreshed = meta.clone();
            refreshed.size = bytes.len() as u64;
            return Ok((bytes, refreshed));
        }
        let (reader, new_meta) = self.apply(reader_from_bytes(bytes), meta.clone()).await?;
        let out = read_body(reader, None).await?;
        Ok((out, new_meta))
    }
}

/// Assembles the pipeline a configuration asks for, or `None` when nothing
/// is enabled. Minified content is decompressed first so upstream-encoded
/// bodies can still be minified; brotli wins when both compressors are on.
pub fn build_pipeline(config: &OptimizeConfig) -> Option<Pipeline> {
    let minify_any = config.minify_html
        || config.minify_css
        || config.minify_js
        || config.minify_json
        || config.minify_svg
        || config.minify_xml;

    let mut pipeline = Pipeline::new();
    if minify_any {
        pipeline.push(Box::new(compress::DecompressTransform::new()));
        pipeline.push(Box::new(minify::MinifyTransform::new(
            config.minify_html,
            config.minify_css,
            config.minify_js,
            config.minify_json,
            config.minify_svg,
            config.minify_xml,
        )));
    }
    if config.compress_brotli {
        pipeline.push(Box::new(compress::CompressTransform::new(
            compress::Algorithm::Brotli,
            compress::DEFAULT_BROTLI_QUALITY,
            config.compress_min_size,
        )));
    } else if config.compress_gzip {
        pipeline.push(Box::new(compress::CompressTransform::new(
            compress::Algorithm::Gzip,
            compress::DEFAULT_GZIP_LEVEL,
            config.compress_min_size,
        )));
    }

    if pipeline.is_empty() { None } else { Some(pipeline) }
}
