//! Chunk payload compression

use crate::error::{Result, VoxError};
use flate2::read::{ZlibDecoder, ZlibEncoder};
use flate2::Compression as FlateCompression;
use serde::{Deserialize, Serialize};
use std::io::Read;

/// Compression methods a chunk payload may use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMethod {
    /// No compression
    None,
    /// zlib-wrapped deflate
    Zlib,
    /// Zstandard compression
    #[default]
    Zstd,
}

impl CompressionMethod {
    /// Zarr v2 `compressor` object for `.zarray`, `null` when uncompressed
    pub fn zarr_compressor(&self, level: CompressionLevel) -> serde_json::Value {
        match self {
            CompressionMethod::None => serde_json::Value::Null,
            CompressionMethod::Zlib => serde_json::json!({ "id": "zlib", "level": level.value() }),
            CompressionMethod::Zstd => serde_json::json!({ "id": "zstd", "level": level.value() }),
        }
    }

    /// Parse a Zarr v2 `compressor` object
    pub fn from_zarr_compressor(value: &serde_json::Value) -> Result<Self> {
        if value.is_null() {
            return Ok(CompressionMethod::None);
        }
        match value.get("id").and_then(|id| id.as_str()) {
            Some("zlib") => Ok(CompressionMethod::Zlib),
            Some("zstd") => Ok(CompressionMethod::Zstd),
            Some(other) => Err(VoxError::Decompression(format!(
                "unsupported compressor '{}'",
                other
            ))),
            None => Err(VoxError::Decompression(
                "compressor object has no id".to_string(),
            )),
        }
    }
}

/// Compression level (0-9, where 0 is no compression and 9 is maximum)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u32")]
pub struct CompressionLevel(u8);

impl From<u32> for CompressionLevel {
    fn from(level: u32) -> Self {
        Self::new(level.min(9) as u8)
    }
}

impl CompressionLevel {
    pub fn new(level: u8) -> Self {
        Self(level.min(9))
    }

    pub fn fast() -> Self {
        Self(1)
    }

    pub fn best() -> Self {
        Self(9)
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl Default for CompressionLevel {
    fn default() -> Self {
        Self(3)
    }
}

/// Trait for compression/decompression operations
pub trait Compressor: Send + Sync {
    /// Compress data
    fn compress(&self, data: &[u8], level: CompressionLevel) -> Result<Vec<u8>>;

    /// Decompress data
    fn decompress(&self, data: &[u8], expected_size: Option<usize>) -> Result<Vec<u8>>;

    /// Get the compression method
    fn method(&self) -> CompressionMethod;
}

/// No compression
#[derive(Debug, Default)]
pub struct NoneCompressor;

impl Compressor for NoneCompressor {
    fn compress(&self, data: &[u8], _level: CompressionLevel) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8], _expected_size: Option<usize>) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn method(&self) -> CompressionMethod {
        CompressionMethod::None
    }
}

/// zlib compression
#[derive(Debug, Default)]
pub struct ZlibCompressor;

impl Compressor for ZlibCompressor {
    fn compress(&self, data: &[u8], level: CompressionLevel) -> Result<Vec<u8>> {
        let mut encoder = ZlibEncoder::new(data, FlateCompression::new(level.value() as u32));
        let mut compressed = Vec::new();
        encoder
            .read_to_end(&mut compressed)
            .map_err(|e| VoxError::Compression(e.to_string()))?;
        Ok(compressed)
    }

    fn decompress(&self, data: &[u8], expected_size: Option<usize>) -> Result<Vec<u8>> {
        let mut decoder = ZlibDecoder::new(data);
        let mut decompressed = match expected_size {
            Some(size) => Vec::with_capacity(size),
            None => Vec::new(),
        };
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| VoxError::Decompression(e.to_string()))?;
        Ok(decompressed)
    }

    fn method(&self) -> CompressionMethod {
        CompressionMethod::Zlib
    }
}

/// Zstandard compression
#[derive(Debug, Default)]
pub struct ZstdCompressor;

impl Compressor for ZstdCompressor {
    fn compress(&self, data: &[u8], level: CompressionLevel) -> Result<Vec<u8>> {
        zstd::encode_all(data, level.value() as i32)
            .map_err(|e| VoxError::Compression(e.to_string()))
    }

    fn decompress(&self, data: &[u8], _expected_size: Option<usize>) -> Result<Vec<u8>> {
        zstd::decode_all(data).map_err(|e| VoxError::Decompression(e.to_string()))
    }

    fn method(&self) -> CompressionMethod {
        CompressionMethod::Zstd
    }
}

/// Get a compressor for a given method
pub fn get_compressor(method: CompressionMethod) -> Box<dyn Compressor> {
    match method {
        CompressionMethod::None => Box::new(NoneCompressor),
        CompressionMethod::Zlib => Box::new(ZlibCompressor),
        CompressionMethod::Zstd => Box::new(ZstdCompressor),
    }
}
