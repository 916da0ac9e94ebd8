// src/core/pipeline/compress.rs

//! Streaming gzip/brotli compression transforms with size guards.

use crate::core::errors::CacheError;
use crate::core::pipeline::Transform;
use crate::core::storage::meta::CacheMeta;
use crate::core::storage::{BodyReader, read_body, reader_from_bytes};
use async_trait::async_trait;
use flate2::Compression;
use flate2::write::GzEncoder;
use std::io::{Read, Write};

/// Bodies smaller than this are not worth the CPU or the header overhead.
pub const DEFAULT_MIN_SIZE: usize = 1024;

/// Default gzip level, the zlib "sweet spot".
pub const DEFAULT_GZIP_LEVEL: u32 = 6;

/// Default brotli quality; beyond this the gains rarely pay for the time.
pub const DEFAULT_BROTLI_QUALITY: u32 = 5;

const BROTLI_BUFFER: usize = 4096;
const BROTLI_LGWIN: u32 = 22;

/// The compression algorithm a transform applies, named by the value it
/// writes into `meta.encoding` (and ultimately `Content-Encoding`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Gzip,
    Brotli,
}

impl Algorithm {
    pub fn encoding(&self) -> &'static str {
        match self {
            Algorithm::Gzip => "gzip",
            Algorithm::Brotli => "br",
        }
    }
}

pub struct CompressTransform {
    algorithm: Algorithm,
    level: u32,
    min_size: usize,
}

impl CompressTransform {
    pub fn new(algorithm: Algorithm, level: u32, min_size: usize) -> Self {
        Self {
            algorithm,
            level,
            min_size,
        }
    }

    pub fn gzip() -> Self {
        Self::new(Algorithm::Gzip, DEFAULT_GZIP_LEVEL, DEFAULT_MIN_SIZE)
    }

    pub fn brotli() -> Self {
        Self::new(Algorithm::Brotli, DEFAULT_BROTLI_QUALITY, DEFAULT_MIN_SIZE)
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CacheError> {
        match self.algorithm {
            Algorithm::Gzip => {
                let mut encoder =
                    GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::new(self.level));
                encoder.write_all(data)?;
                Ok(encoder.finish()?)
            }
            Algorithm::Brotli => {
                let mut out = Vec::with_capacity(data.len() / 2);
                {
                    let mut writer = brotli::CompressorWriter::new(
                        &mut out,
                        BROTLI_BUFFER,
                        self.level,
                        BROTLI_LGWIN,
                    );
                    writer.write_all(data)?;
                    writer.flush()?;
                }
                Ok(out)
            }
        }
    }
}

#[async_trait]
impl Transform for CompressTransform {
    fn name(&self) -> &'static str {
        match self.algorithm {
            Algorithm::Gzip => "compress-gzip",
            Algorithm::Brotli => "compress-br",
        }
    }

    async fn apply(
        &self,
        body: BodyReader,
        meta: &CacheMeta,
    ) -> Result<(BodyReader, CacheMeta), CacheError> {
        // Already-encoded bodies pass through untouched.
        if meta.is_encoded() {
            return Ok((body, meta.clone()));
        }

        let data = read_body(body, None).await?;
        let mut new_meta = meta.clone();

        if data.len() < self.min_size {
            new_meta.size = data.len() as u64;
            return Ok((reader_from_bytes(data), new_meta));
        }

        let compressed = self.compress(&data)?;
        if compressed.len() >= data.len() {
            // No gain: keep the original and leave the encoding empty.
            new_meta.size = data.len() as u64;
            return Ok((reader_from_bytes(data), new_meta));
        }

        new_meta.size = compressed.len() as u64;
        new_meta.encoding = self.algorithm.encoding().to_string();
        Ok((reader_from_bytes(compressed), new_meta))
    }
}

/// The inverse transform: inspects `meta.encoding`, decompresses supported
/// encodings, clears the field and refreshes the size. Unknown encodings
/// pass through unchanged.
pub struct DecompressTransform;

impl DecompressTransform {
    pub fn new() -> Self {
        Self
    }
}

impl Default for DecompressTransform {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transform for DecompressTransform {
    fn name(&self) -> &'static str {
        "decompress"
    }

    async fn apply(
        &self,
        body: BodyReader,
        meta: &CacheMeta,
    ) -> Result<(BodyReader, CacheMeta), CacheError> {
        let decoded = match meta.encoding.as_str() {
            "gzip" => {
                let data = read_body(body, None).await?;
                let mut out = Vec::with_capacity(data.len() * 2);
                flate2::read::MultiGzDecoder::new(data.as_slice()).read_to_end(&mut out)?;
                out
            }
            "br" => {
                let data = read_body(body, None).await?;
                let mut out = Vec::with_capacity(data.len() * 2);
                brotli::Decompressor::new(data.as_slice(), BROTLI_BUFFER)
                    .read_to_end(&mut out)?;
                out
            }
            _ => return Ok((body, meta.clone())),
        };

        let mut new_meta = meta.clone();
        new_meta.encoding = String::new();
        new_meta.size = decoded.len() as u64;
        Ok((reader_from_bytes(decoded), new_meta))
    }
}
