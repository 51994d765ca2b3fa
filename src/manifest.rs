//! Preprocessed dataset manifest
//!
//! The manifest describes a dataset as channels, each owning layers, each
//! layer owning a resolution pyramid of scale levels whose arrays live in the
//! chunked store. It is persisted as the `voxpack` attribute of the store root
//! and as `manifest.json` at the root of an archive.
//!
//! Manifests read from untrusted sources must go through
//! [`crate::validate::coerce_manifest`]; the serde derives here are for
//! writing.

use crate::types::{AxisScale, Dims3, MovieMode, ValueRange, VolumeDataType};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Format tag of the current manifest version
pub const MANIFEST_FORMAT: &str = "voxpack-preprocessed-v4";

/// Tags of earlier on-disk shapes: flat volume lists, per-channel track CSV
/// entries, per-channel named track sets. None of them can be imported.
pub const LEGACY_MANIFEST_FORMATS: [&str; 3] = [
    "voxpack-preprocessed-v1",
    "voxpack-preprocessed-v2",
    "voxpack-preprocessed-v3",
];

/// Attribute of the store root `.zattrs` holding the manifest
pub const ROOT_ATTRIBUTE: &str = "voxpack";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreprocessedManifest {
    pub format: String,
    pub generated_at: String,
    pub dataset: DatasetManifest,
}

impl PreprocessedManifest {
    /// Wrap a dataset with the current format tag and timestamp
    pub fn new(dataset: DatasetManifest) -> Self {
        Self {
            format: MANIFEST_FORMAT.to_string(),
            generated_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            dataset,
        }
    }

    pub fn layers(&self) -> impl Iterator<Item = &LayerManifest> {
        self.dataset.channels.iter().flat_map(|c| c.layers.iter())
    }

    pub fn find_layer(&self, key: &str) -> Option<&LayerManifest> {
        self.layers().find(|layer| layer.key == key)
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetManifest {
    pub movie_mode: MovieMode,
    pub total_volume_count: u64,
    pub channels: Vec<ChannelManifest>,
    #[serde(default)]
    pub track_sets: Vec<TrackSetManifest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voxel_resolution: Option<VoxelResolution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anisotropy_correction: Option<AnisotropyCorrection>,
}

/// Physical voxel spacing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoxelResolution {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub unit: String,
}

impl VoxelResolution {
    pub fn spacing(&self) -> AxisScale {
        AxisScale::new(self.x, self.y, self.z)
    }
}

/// Anisotropy correction applied before the pyramid was built
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnisotropyCorrection {
    pub enabled: bool,
    pub scale: AxisScale,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelManifest {
    pub id: String,
    pub name: String,
    pub layers: Vec<LayerManifest>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerManifest {
    pub key: String,
    pub label: String,
    pub channel_id: String,
    pub is_segmentation: bool,
    pub volume_count: u64,
    pub width: usize,
    pub height: usize,
    pub depth: usize,
    pub channels: usize,
    /// Element type of the source data the layer was normalized from
    pub data_type: VolumeDataType,
    pub normalization: Option<ValueRange>,
    pub zarr: LayerZarr,
    /// Level-0 digests, one per materialized timepoint
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<VolumeEntry>,
}

impl LayerManifest {
    pub fn dims(&self) -> Dims3 {
        Dims3::new(self.width, self.height, self.depth)
    }

    pub fn level0(&self) -> Option<&ScaleManifest> {
        self.zarr.scales.first()
    }

    /// Normalized bytes per level-0 timepoint
    pub fn volume_byte_length(&self) -> u64 {
        (self.dims().voxel_count() * self.channels) as u64
    }

    /// Label bytes per level-0 timepoint
    pub fn labels_byte_length(&self) -> u64 {
        (self.dims().voxel_count() * VolumeDataType::Uint32.size_in_bytes()) as u64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerZarr {
    pub scales: Vec<ScaleManifest>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleManifest {
    pub level: usize,
    /// `[x, y, z]` relative to level 0
    pub downsample_factor: [usize; 3],
    pub width: usize,
    pub height: usize,
    pub depth: usize,
    pub channels: usize,
    pub zarr: ScaleArrays,
}

impl ScaleManifest {
    pub fn dims(&self) -> Dims3 {
        Dims3::new(self.width, self.height, self.depth)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleArrays {
    pub data: ZarrArrayDescriptor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<ZarrArrayDescriptor>,
    pub chunk_stats: ChunkStatsArrays,
    pub histogram: ZarrArrayDescriptor,
}

impl ScaleArrays {
    pub fn all(&self) -> Vec<&ZarrArrayDescriptor> {
        let mut arrays = vec![&self.data];
        arrays.extend(self.labels.as_ref());
        arrays.extend([
            &self.chunk_stats.min,
            &self.chunk_stats.max,
            &self.chunk_stats.occupancy,
            &self.histogram,
        ]);
        arrays
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkStatsArrays {
    pub min: ZarrArrayDescriptor,
    pub max: ZarrArrayDescriptor,
    pub occupancy: ZarrArrayDescriptor,
}

/// Location and geometry of one chunked array
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZarrArrayDescriptor {
    pub path: String,
    pub shape: Vec<usize>,
    pub chunk_shape: Vec<usize>,
    pub data_type: VolumeDataType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sharding: Option<ShardingPlan>,
}

impl ZarrArrayDescriptor {
    pub fn new(
        path: impl Into<String>,
        shape: Vec<usize>,
        chunk_shape: Vec<usize>,
        data_type: VolumeDataType,
    ) -> Self {
        Self {
            path: path.into(),
            shape,
            chunk_shape,
            data_type,
            sharding: None,
        }
    }

    pub fn with_sharding(mut self, sharding: Option<ShardingPlan>) -> Self {
        self.sharding = sharding;
        self
    }

    pub fn is_sharded(&self) -> bool {
        self.sharding.as_ref().is_some_and(|s| s.enabled)
    }
}

/// How an array's chunks are packed into shard files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardingPlan {
    pub enabled: bool,
    pub target_shard_bytes: u64,
    pub shard_shape: Vec<usize>,
    pub estimated_shard_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Digest record for one level-0 timepoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeEntry {
    pub timepoint: usize,
    pub min: f64,
    pub max: f64,
    pub byte_length: u64,
    pub sha256: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels_byte_length: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels_sha256: Option<String>,
}

/// A named set of tracks stored as CSV in the archive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackSetManifest {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    pub path: String,
    pub row_count: usize,
}
