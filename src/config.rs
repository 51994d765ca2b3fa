//! Writer and preprocessing options, and the command-line interface.
//!
//! Options are plain serde structs with builder-style setters and can be
//! loaded from JSON. The CLI reads `VOXPACK_`-prefixed environment variables
//! as fallbacks for its flags.

use crate::compression::{CompressionLevel, CompressionMethod};
use crate::error::{Result, VoxError};
use crate::manifest::VoxelResolution;
use crate::types::MovieMode;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default store root inside a dataset
pub const DEFAULT_ROOT_PREFIX: &str = "zarr";

/// Default spatial chunk shape, `[z, y, x]`
pub const DEFAULT_CHUNK_SHAPE: [usize; 3] = [64, 64, 64];

/// Default shard size target (4 MiB)
pub const DEFAULT_TARGET_SHARD_BYTES: u64 = 4 * 1024 * 1024;

/// Default ceiling on a single decoded volume (2 GiB)
pub const DEFAULT_MAX_VOLUME_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// Worker count used when available parallelism cannot be queried
pub const FALLBACK_WORKERS: usize = 4;

/// How the chunked store is laid out and encoded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterOptions {
    pub root_prefix: String,
    /// `[z, y, x]`; clamped to each level's dimensions
    pub chunk_shape: [usize; 3],
    pub compression: CompressionMethod,
    pub compression_level: CompressionLevel,
    /// `None` disables sharding
    pub target_shard_bytes: Option<u64>,
    pub max_volume_bytes: u64,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            root_prefix: DEFAULT_ROOT_PREFIX.to_string(),
            chunk_shape: DEFAULT_CHUNK_SHAPE,
            compression: CompressionMethod::default(),
            compression_level: CompressionLevel::default(),
            target_shard_bytes: Some(DEFAULT_TARGET_SHARD_BYTES),
            max_volume_bytes: DEFAULT_MAX_VOLUME_BYTES,
        }
    }
}

impl WriterOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.root_prefix = prefix.into();
        self
    }

    pub fn with_chunk_shape(mut self, chunk_shape: [usize; 3]) -> Self {
        self.chunk_shape = chunk_shape;
        self
    }

    pub fn with_compression(mut self, method: CompressionMethod, level: CompressionLevel) -> Self {
        self.compression = method;
        self.compression_level = level;
        self
    }

    pub fn with_target_shard_bytes(mut self, target: Option<u64>) -> Self {
        self.target_shard_bytes = target;
        self
    }

    pub fn with_max_volume_bytes(mut self, ceiling: u64) -> Self {
        self.max_volume_bytes = ceiling;
        self
    }

    pub fn validate(&self) -> Result<()> {
        crate::io::validate_key(&self.root_prefix)
            .map_err(|_| VoxError::Configuration(format!("invalid root prefix '{}'", self.root_prefix)))?;
        if self.chunk_shape.contains(&0) {
            return Err(VoxError::Configuration(
                "chunk shape entries must be positive".to_string(),
            ));
        }
        if self.target_shard_bytes == Some(0) {
            return Err(VoxError::Configuration(
                "target shard size must be positive".to_string(),
            ));
        }
        if self.max_volume_bytes == 0 {
            return Err(VoxError::Configuration(
                "volume byte ceiling must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Anisotropy correction settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AnisotropyOptions {
    pub enabled: bool,
    pub voxel_resolution: Option<VoxelResolution>,
}

/// Options for a preprocessing run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessOptions {
    pub movie_mode: MovieMode,
    pub workers: usize,
    pub anisotropy: AnisotropyOptions,
    pub writer: WriterOptions,
}

impl Default for PreprocessOptions {
    fn default() -> Self {
        Self {
            movie_mode: MovieMode::default(),
            workers: default_workers(),
            anisotropy: AnisotropyOptions::default(),
            writer: WriterOptions::default(),
        }
    }
}

impl PreprocessOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_movie_mode(mut self, mode: MovieMode) -> Self {
        self.movie_mode = mode;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_anisotropy(mut self, enabled: bool, voxel_resolution: Option<VoxelResolution>) -> Self {
        self.anisotropy = AnisotropyOptions {
            enabled,
            voxel_resolution,
        };
        self
    }

    pub fn with_writer(mut self, writer: WriterOptions) -> Self {
        self.writer = writer;
        self
    }

    /// Load options from a JSON file; absent fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        let options: Self = serde_json::from_slice(&bytes)?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(VoxError::Configuration(
                "worker count must be positive".to_string(),
            ));
        }
        self.writer.validate()
    }
}

/// Available hardware parallelism, or [`FALLBACK_WORKERS`]
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(FALLBACK_WORKERS)
}

/// voxpack - multiscale chunked volume archives.
#[derive(Parser, Debug, Clone)]
#[command(name = "voxpack")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose logging (debug level).
    #[arg(short, long, global = true, default_value_t = false, env = "VOXPACK_VERBOSE")]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Import an archive, verify every digest and print a summary.
    Verify {
        archive: PathBuf,
    },

    /// Print the validated manifest of an archive.
    Manifest {
        archive: PathBuf,
    },

    /// Package a chunked store into an archive.
    Pack {
        /// Store holding the dataset: a directory or `file://` URL
        store: String,
        archive: PathBuf,
        /// Store root inside the directory
        #[arg(long, default_value = DEFAULT_ROOT_PREFIX, env = "VOXPACK_ROOT_PREFIX")]
        root_prefix: String,
    },
}
