//! voxpack - multiscale chunked volume archives
//!
//! Preprocesses microscopy image stacks into a multiresolution chunked array
//! store and packages that store as a portable, digest-verified archive.
//!
//! # Features
//!
//! - 2D-stack and 3D movie modes with a bounded concurrent scan
//! - Anisotropy correction by trilinear (or nearest, for labels) resampling
//! - Resolution pyramids halving every axis down to 1x1x1
//! - Zarr v2 style arrays with optional sharding (`none`, `zlib`, `zstd` chunks)
//! - Strict manifest validation with path-qualified errors
//! - Zip archive export/import with per-volume SHA-256 verification,
//!   progress reporting and cooperative cancellation
//!
//! # Example
//!
//! ```rust,ignore
//! use voxpack::{import_archive, ImportOptions};
//!
//! # async fn example(bytes: Vec<u8>) -> voxpack::Result<()> {
//! let dataset = import_archive(bytes, &ImportOptions::new()).await?;
//! for layer in &dataset.layers {
//!     println!("{}: {} timepoints", layer.manifest.key, layer.volumes.len());
//! }
//! # Ok(())
//! # }
//! ```

pub mod archive;
pub mod cancel;
pub mod compression;
pub mod config;
pub mod error;
pub mod io;
pub mod layout;
pub mod manifest;
pub mod multiscale;
pub mod preprocess;
pub mod progress;
pub mod resample;
pub mod shard;
pub mod store;
pub mod tracks;
pub mod types;
pub mod utils;
pub mod validate;
pub mod volume;

// Re-exports
pub use archive::{
    export_dataset, export_dataset_to_bytes, import_archive, import_archive_stream, pack_store,
    ArchiveWriter, BufferedArchiveWriter, ExportLayer, ExportRequest, ImportOptions, ImportedDataset,
    StreamingArchiveWriter,
};
pub use cancel::CancellationToken;
pub use compression::{CompressionLevel, CompressionMethod, Compressor};
pub use config::{PreprocessOptions, WriterOptions};
pub use error::{ErrorCategory, Result, ValidationError, VoxError};
pub use io::{FileSystemStore, MemoryStore, StorageBackend, Store};
pub use manifest::{PreprocessedManifest, MANIFEST_FORMAT};
pub use preprocess::{LayerInput, PreprocessRequest, Preprocessor, VolumeLoader};
pub use progress::{ImportMilestone, ImportProgress, PreprocessProgress, ProgressCallback};
pub use store::{ChannelInfo, DatasetReader, DatasetWriter};
pub use tracks::{TrackRow, TrackSet};
pub use types::{Dims3, MovieMode, ValueRange, VolumeDataType};
pub use validate::{coerce_manifest, validate_manifest};
pub use volume::{NormalizedVolume, VolumeBuffer, VolumePayload};

/// Version of the voxpack implementation
pub const VOXPACK_VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VOXPACK_VERSION.is_empty());
        assert_eq!(MANIFEST_FORMAT, "voxpack-preprocessed-v4");
    }
}
