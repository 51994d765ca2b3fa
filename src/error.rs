//! Error types for voxpack operations

use std::fmt;
use thiserror::Error;

/// A manifest validation failure, always qualified by the offending field path
/// (for example `manifest.dataset.channels[2].layers[0].zarr.scales[1].level`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Broad classification of a [`VoxError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Malformed manifest structure, wrong rank/shape/type, out-of-range values
    Validation,
    /// Digest mismatch, byte-length mismatch, missing or corrupt entries
    Integrity,
    /// Inconsistent inputs or unsupported formats
    Configuration,
    /// A hard resource ceiling was exceeded
    Resource,
    /// The operation was cancelled by the caller
    Cancelled,
    /// Storage, serialization or codec failures
    Io,
}

/// Main error type for voxpack operations
#[derive(Error, Debug)]
pub enum VoxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid manifest: {0}")]
    Validation(#[from] ValidationError),

    #[error("Digest mismatch for {path}: expected {expected}, computed {actual}")]
    DigestMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("Byte length mismatch for {path}: expected {expected} bytes, got {actual}")]
    ByteLengthMismatch {
        path: String,
        expected: usize,
        actual: usize,
    },

    #[error("Missing archive entry: {0}")]
    MissingEntry(String),

    #[error("Corrupt data: {0}")]
    Corrupt(String),

    #[error("Volume count mismatch: manifest declares {declared}, materialized {materialized}")]
    VolumeCountMismatch { declared: u64, materialized: u64 },

    #[error("Export incomplete")]
    ExportIncomplete { missing: Vec<String> },

    #[error("Unsupported manifest format: {0}")]
    UnsupportedFormat(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid dimensions: {0}")]
    InvalidDimensions(String),

    #[error("Out of bounds: {0}")]
    OutOfBounds(String),

    #[error(
        "Volume too large: {required_bytes} bytes required, ceiling is {ceiling_bytes} \
         ({width}x{height}x{depth}x{channels})"
    )]
    VolumeTooLarge {
        required_bytes: u64,
        ceiling_bytes: u64,
        width: usize,
        height: usize,
        depth: usize,
        channels: usize,
    },

    #[error("Operation aborted")]
    Aborted,

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Decompression error: {0}")]
    Decompression(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Storage backend error: {0}")]
    StorageBackend(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Volume loader error for {source_name}: {message}")]
    Loader {
        source_name: String,
        message: String,
    },
}

impl VoxError {
    /// Classify this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            VoxError::Validation(_) => ErrorCategory::Validation,
            VoxError::DigestMismatch { .. }
            | VoxError::ByteLengthMismatch { .. }
            | VoxError::MissingEntry(_)
            | VoxError::Corrupt(_)
            | VoxError::VolumeCountMismatch { .. }
            | VoxError::ExportIncomplete { .. } => ErrorCategory::Integrity,
            VoxError::UnsupportedFormat(_)
            | VoxError::Configuration(_)
            | VoxError::InvalidDimensions(_)
            | VoxError::OutOfBounds(_) => ErrorCategory::Configuration,
            VoxError::VolumeTooLarge { .. } => ErrorCategory::Resource,
            VoxError::Aborted => ErrorCategory::Cancelled,
            VoxError::Io(_)
            | VoxError::Compression(_)
            | VoxError::Decompression(_)
            | VoxError::Serialization(_)
            | VoxError::Archive(_)
            | VoxError::StorageBackend(_)
            | VoxError::NotFound(_)
            | VoxError::Loader { .. } => ErrorCategory::Io,
        }
    }

    /// True when the operation was cancelled rather than failed.
    pub fn is_aborted(&self) -> bool {
        matches!(self, VoxError::Aborted)
    }

    pub(crate) fn validation(path: impl Into<String>, message: impl Into<String>) -> Self {
        VoxError::Validation(ValidationError::new(path, message))
    }
}

/// Specialized Result type for voxpack operations
pub type Result<T> = std::result::Result<T, VoxError>;

impl From<serde_json::Error> for VoxError {
    fn from(err: serde_json::Error) -> Self {
        VoxError::Serialization(err.to_string())
    }
}

impl From<zip::result::ZipError> for VoxError {
    fn from(err: zip::result::ZipError) -> Self {
        match err {
            zip::result::ZipError::Io(e) => VoxError::Io(e),
            other => VoxError::Archive(other.to_string()),
        }
    }
}
