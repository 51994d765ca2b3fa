//! Chunked array store - writes and reads layer pyramids over a [`Store`]
//!
//! Layout under the root prefix (Zarr v2, `/` dimension separator):
//!
//! ```text
//! <root>/.zgroup
//! <root>/.zattrs                          {"voxpack": <manifest>}
//! <root>/<layer>/scale<n>/<array>/.zarray
//! <root>/<layer>/scale<n>/<array>/<t>/<z>/<y>/<x>[/<c>]
//! <root>/<layer>/scale<n>/<array>/shards/<t>/<z>/<y>/<x>[/<c>].shard
//! ```

use crate::compression::{get_compressor, CompressionLevel, CompressionMethod, Compressor};
use crate::config::WriterOptions;
use crate::error::{Result, VoxError};
use crate::io::Store;
use crate::layout::ChunkGrid;
use crate::manifest::{
    AnisotropyCorrection, ChannelManifest, ChunkStatsArrays, DatasetManifest, LayerManifest,
    LayerZarr, PreprocessedManifest, ScaleArrays, ScaleManifest, TrackSetManifest, VolumeEntry,
    VoxelResolution, ZarrArrayDescriptor, ROOT_ATTRIBUTE,
};
use crate::multiscale::{compute_multiscale_geometry_levels, downsample_volume, MultiscaleLevel};
use crate::shard::{
    decode_shard_entry_from_index, encode_shard_entries, get_shard_layout_for_array, locate_chunk,
    plan_sharding, verify_shard_complete, ShardIndex, ShardLayout,
};
use crate::types::{Dims3, MovieMode, ValueRange, VolumeDataType};
use crate::utils::{ceil_div, join_coords, le_bytes_to_u32s, sha256_hex, u32s_to_le_bytes, verify_sha256};
use crate::validate::{coerce_manifest, validate_manifest};
use crate::volume::{compute_histogram, occupancy, NormalizedVolume, HISTOGRAM_BINS};
use bytes::Bytes;
use ndarray::{s, ArrayView3};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

pub const ZGROUP: &str = ".zgroup";
pub const ZATTRS: &str = ".zattrs";
pub const ZARRAY: &str = ".zarray";

pub fn zgroup_key(root: &str) -> String {
    format!("{}/{}", root, ZGROUP)
}

pub fn zattrs_key(root: &str) -> String {
    format!("{}/{}", root, ZATTRS)
}

pub fn zarray_key(array_path: &str) -> String {
    format!("{}/{}", array_path, ZARRAY)
}

/// Key of an unsharded chunk
pub fn chunk_key(array_path: &str, chunk_coords: &[usize]) -> String {
    format!("{}/{}", array_path, join_coords(chunk_coords, "/"))
}

pub fn array_path(root: &str, layer_key: &str, level: usize, array: &str) -> String {
    format!("{}/{}/scale{}/{}", root, layer_key, level, array)
}

/// Zarr v2 `.zarray` document for a descriptor
pub fn zarray_metadata(
    descriptor: &ZarrArrayDescriptor,
    compression: CompressionMethod,
    level: CompressionLevel,
) -> Value {
    json!({
        "zarr_format": 2,
        "shape": descriptor.shape,
        "chunks": descriptor.chunk_shape,
        "dtype": descriptor.data_type.zarr_dtype(),
        "compressor": compression.zarr_compressor(level),
        "fill_value": 0,
        "order": "C",
        "filters": null,
        "dimension_separator": "/",
    })
}

/// Check a stored `.zarray` against its descriptor and return its compressor.
pub fn parse_zarray(bytes: &[u8], descriptor: &ZarrArrayDescriptor) -> Result<CompressionMethod> {
    let meta: Value = serde_json::from_slice(bytes)?;
    let corrupt = |what: &str| {
        VoxError::Corrupt(format!("{}: .zarray {} does not match the manifest", descriptor.path, what))
    };
    if meta.get("zarr_format").and_then(Value::as_u64) != Some(2) {
        return Err(corrupt("zarr_format"));
    }
    let dims = |field: &str| -> Option<Vec<usize>> {
        meta.get(field)?
            .as_array()?
            .iter()
            .map(|v| v.as_u64().map(|n| n as usize))
            .collect()
    };
    if dims("shape").as_deref() != Some(descriptor.shape.as_slice()) {
        return Err(corrupt("shape"));
    }
    if dims("chunks").as_deref() != Some(descriptor.chunk_shape.as_slice()) {
        return Err(corrupt("chunks"));
    }
    let dtype = meta.get("dtype").and_then(Value::as_str);
    if dtype.and_then(VolumeDataType::from_zarr_dtype) != Some(descriptor.data_type) {
        return Err(corrupt("dtype"));
    }
    CompressionMethod::from_zarr_compressor(meta.get("compressor").unwrap_or(&Value::Null))
}

/// Grid of the chunks one timepoint covers: the array with its leading time
/// axis collapsed to 1.
fn timepoint_grid(descriptor: &ZarrArrayDescriptor) -> Result<ChunkGrid> {
    let mut shape = descriptor.shape.clone();
    if shape.is_empty() {
        return Err(VoxError::InvalidDimensions(format!(
            "{} has no time axis",
            descriptor.path
        )));
    }
    shape[0] = 1;
    ChunkGrid::new(shape, descriptor.chunk_shape.clone())
}

/// The same grid measured in bytes: row-major element bytes are contiguous,
/// so widening the last axis by the element size addresses raw buffers.
fn byte_grid(grid: &ChunkGrid, element_bytes: usize) -> Result<ChunkGrid> {
    let mut shape = grid.shape().to_vec();
    let mut chunk = grid.chunk_shape().to_vec();
    if let (Some(s), Some(c)) = (shape.last_mut(), chunk.last_mut()) {
        *s *= element_bytes;
        *c *= element_bytes;
    }
    ChunkGrid::new(shape, chunk)
}

fn check_timepoint(descriptor: &ZarrArrayDescriptor, timepoint: usize) -> Result<()> {
    match descriptor.shape.first() {
        Some(&count) if timepoint < count => Ok(()),
        _ => Err(VoxError::OutOfBounds(format!(
            "timepoint {} of {} (shape {:?})",
            timepoint, descriptor.path, descriptor.shape
        ))),
    }
}

/// Human-readable name of one layer timepoint, used in integrity errors
pub fn volume_name(layer_key: &str, timepoint: usize) -> String {
    format!("{}/timepoint-{:04}", layer_key, timepoint)
}

fn f32s_to_le_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn u8s_to_bytes(values: &[u8]) -> Vec<u8> {
    values.to_vec()
}

/// Everything needed to lay out one layer before any bytes are written
#[derive(Debug, Clone)]
pub struct LayerPlan {
    pub key: String,
    pub label: String,
    pub channel_id: String,
    pub is_segmentation: bool,
    pub volume_count: usize,
    pub dims: Dims3,
    pub channels: usize,
    pub data_type: VolumeDataType,
    pub normalization: Option<ValueRange>,
}

/// Build the array descriptors of one pyramid level.
pub fn plan_scale(
    root: &str,
    plan: &LayerPlan,
    level: &MultiscaleLevel,
    options: &WriterOptions,
) -> ScaleManifest {
    let Dims3 {
        width,
        height,
        depth,
    } = level.dims;
    let count = plan.volume_count;
    let channels = plan.channels;
    let cz = options.chunk_shape[0].clamp(1, depth);
    let cy = options.chunk_shape[1].clamp(1, height);
    let cx = options.chunk_shape[2].clamp(1, width);
    let path = |array: &str| array_path(root, &plan.key, level.level, array);
    let target = options.target_shard_bytes;

    let data_shape = vec![count, depth, height, width, channels];
    let data_chunk = vec![1, cz, cy, cx, channels];
    let data_sharding = plan_sharding(&data_shape, &data_chunk, 1, target);
    let data = ZarrArrayDescriptor::new(path("data"), data_shape, data_chunk, VolumeDataType::Uint8)
        .with_sharding(data_sharding);

    let labels = plan.is_segmentation.then(|| {
        let shape = vec![count, depth, height, width];
        let chunk = vec![1, cz, cy, cx];
        let sharding = plan_sharding(&shape, &chunk, VolumeDataType::Uint32.size_in_bytes(), target);
        ZarrArrayDescriptor::new(path("labels"), shape, chunk, VolumeDataType::Uint32).with_sharding(sharding)
    });

    let grid = [ceil_div(depth, cz), ceil_div(height, cy), ceil_div(width, cx)];
    let stats = |array: &str, data_type: VolumeDataType| {
        ZarrArrayDescriptor::new(
            path(array),
            vec![count, grid[0], grid[1], grid[2]],
            vec![1, grid[0], grid[1], grid[2]],
            data_type,
        )
    };

    ScaleManifest {
        level: level.level,
        downsample_factor: level.downsample_factor,
        width,
        height,
        depth,
        channels,
        zarr: ScaleArrays {
            data,
            labels,
            chunk_stats: ChunkStatsArrays {
                min: stats("chunk_min", VolumeDataType::Uint8),
                max: stats("chunk_max", VolumeDataType::Uint8),
                occupancy: stats("chunk_occupancy", VolumeDataType::Float32),
            },
            histogram: ZarrArrayDescriptor::new(
                path("histogram"),
                vec![count, HISTOGRAM_BINS],
                vec![1, HISTOGRAM_BINS],
                VolumeDataType::Uint32,
            ),
        },
    }
}

/// Per-chunk min, max and occupancy of the data chunks of one volume.
fn chunk_statistics(
    volume: &NormalizedVolume,
    data: &ZarrArrayDescriptor,
) -> Result<(Vec<u8>, Vec<u8>, Vec<f32>)> {
    let chunk = &data.chunk_shape;
    let grid = ChunkGrid::new(
        vec![volume.depth, volume.height, volume.width],
        vec![chunk[1], chunk[2], chunk[3]],
    )?;
    let view = volume.view()?;
    let labels = match &volume.segmentation_labels {
        Some(labels) => Some(
            ArrayView3::from_shape((volume.depth, volume.height, volume.width), labels.as_slice())
                .map_err(|e| VoxError::InvalidDimensions(e.to_string()))?,
        ),
        None => None,
    };

    let total = grid.total_chunks();
    let mut mins = Vec::with_capacity(total);
    let mut maxs = Vec::with_capacity(total);
    let mut occupancies = Vec::with_capacity(total);
    for coords in grid.iter_chunk_coords() {
        let r = grid.chunk_data_range(&coords);
        let block: Vec<u8> = view
            .slice(s![r[0].0..r[0].1, r[1].0..r[1].1, r[2].0..r[2].1, ..])
            .iter()
            .copied()
            .collect();
        mins.push(block.iter().copied().min().unwrap_or(0));
        maxs.push(block.iter().copied().max().unwrap_or(0));
        let occupied = match &labels {
            Some(labels) => {
                let ids: Vec<u32> = labels
                    .slice(s![r[0].0..r[0].1, r[1].0..r[1].1, r[2].0..r[2].1])
                    .iter()
                    .copied()
                    .collect();
                occupancy(&ids, 1)
            }
            None => occupancy(&block, volume.channels),
        };
        occupancies.push(occupied);
    }
    Ok((mins, maxs, occupancies))
}

/// Dataset-level fields supplied when the writer is finished
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetInfo {
    pub movie_mode: MovieMode,
    pub channels: Vec<ChannelInfo>,
    pub track_sets: Vec<TrackSetManifest>,
    pub voxel_resolution: Option<VoxelResolution>,
    pub anisotropy_correction: Option<AnisotropyCorrection>,
}

impl DatasetInfo {
    pub fn new(movie_mode: MovieMode, channels: Vec<ChannelInfo>) -> Self {
        Self {
            movie_mode,
            channels,
            track_sets: Vec::new(),
            voxel_resolution: None,
            anisotropy_correction: None,
        }
    }

    pub fn with_track_sets(mut self, track_sets: Vec<TrackSetManifest>) -> Self {
        self.track_sets = track_sets;
        self
    }

    pub fn with_voxel_resolution(mut self, resolution: Option<VoxelResolution>) -> Self {
        self.voxel_resolution = resolution;
        self
    }

    pub fn with_anisotropy_correction(mut self, correction: Option<AnisotropyCorrection>) -> Self {
        self.anisotropy_correction = correction;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub id: String,
    pub name: String,
}

impl ChannelInfo {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Writes a dataset into a store, one layer timepoint at a time.
///
/// Geometry and array metadata are written when a layer is added; the root
/// manifest is written once by [`DatasetWriter::finish`].
pub struct DatasetWriter<S: Store + ?Sized> {
    store: Arc<S>,
    options: WriterOptions,
    compressor: Box<dyn Compressor>,
    layers: Vec<LayerManifest>,
}

impl<S: Store + ?Sized> DatasetWriter<S> {
    /// Start a dataset, writing the root group.
    pub async fn create(store: Arc<S>, options: WriterOptions) -> Result<Self> {
        options.validate()?;
        let group = serde_json::to_vec(&json!({ "zarr_format": 2 }))?;
        store.write(&zgroup_key(&options.root_prefix), &group).await?;
        Ok(Self {
            store,
            compressor: get_compressor(options.compression),
            options,
            layers: Vec::new(),
        })
    }

    pub fn options(&self) -> &WriterOptions {
        &self.options
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn layer(&self, key: &str) -> Option<&LayerManifest> {
        self.layers.iter().find(|layer| layer.key == key)
    }

    fn layer_index(&self, key: &str) -> Result<usize> {
        self.layers
            .iter()
            .position(|layer| layer.key == key)
            .ok_or_else(|| VoxError::NotFound(format!("layer '{}'", key)))
    }

    /// Lay out a layer's pyramid and write the metadata of all its arrays.
    pub async fn add_layer(&mut self, plan: LayerPlan) -> Result<&LayerManifest> {
        if plan.key.is_empty() || plan.key.contains('/') || plan.key == ".." {
            return Err(VoxError::Configuration(format!(
                "layer key '{}' cannot be used as a path segment",
                plan.key
            )));
        }
        if self.layer(&plan.key).is_some() {
            return Err(VoxError::Configuration(format!(
                "duplicate layer key '{}'",
                plan.key
            )));
        }
        if plan.volume_count == 0 || plan.dims.voxel_count() == 0 || plan.channels == 0 {
            return Err(VoxError::InvalidDimensions(format!(
                "layer '{}' needs at least one timepoint and positive dimensions",
                plan.key
            )));
        }

        let root = self.options.root_prefix.clone();
        let scales: Vec<ScaleManifest> = compute_multiscale_geometry_levels(plan.dims)
            .iter()
            .map(|level| plan_scale(&root, &plan, level, &self.options))
            .collect();

        for scale in &scales {
            for descriptor in scale.zarr.all() {
                let meta = zarray_metadata(
                    descriptor,
                    self.options.compression,
                    self.options.compression_level,
                );
                self.store
                    .write(&zarray_key(&descriptor.path), &serde_json::to_vec_pretty(&meta)?)
                    .await?;
            }
        }

        debug!(
            layer = %plan.key,
            dims = %plan.dims,
            levels = scales.len(),
            sharded = scales[0].zarr.data.is_sharded(),
            "planned layer"
        );

        let index = self.layers.len();
        self.layers.push(LayerManifest {
            key: plan.key,
            label: plan.label,
            channel_id: plan.channel_id,
            is_segmentation: plan.is_segmentation,
            volume_count: plan.volume_count as u64,
            width: plan.dims.width,
            height: plan.dims.height,
            depth: plan.dims.depth,
            channels: plan.channels,
            data_type: plan.data_type,
            normalization: plan.normalization,
            zarr: LayerZarr { scales },
            volumes: Vec::new(),
        });
        Ok(&self.layers[index])
    }

    /// Write every pyramid level of one timepoint and record its digests.
    pub async fn write_timepoint(
        &mut self,
        layer_key: &str,
        timepoint: usize,
        volume: &NormalizedVolume,
    ) -> Result<VolumeEntry> {
        let index = self.layer_index(layer_key)?;
        let layer = &self.layers[index];
        if timepoint as u64 >= layer.volume_count {
            return Err(VoxError::OutOfBounds(format!(
                "timepoint {} of layer '{}' with {} timepoints",
                timepoint, layer_key, layer.volume_count
            )));
        }
        if layer.volumes.iter().any(|v| v.timepoint == timepoint) {
            return Err(VoxError::Configuration(format!(
                "{} was already written",
                volume_name(layer_key, timepoint)
            )));
        }
        // Streaming sinks cannot seek back, so timepoints arrive in order
        if let Some(last) = layer.volumes.last().filter(|v| v.timepoint > timepoint) {
            return Err(VoxError::Configuration(format!(
                "{} written after timepoint {}",
                volume_name(layer_key, timepoint),
                last.timepoint
            )));
        }
        if volume.dims() != layer.dims() || volume.channels != layer.channels {
            return Err(VoxError::Configuration(format!(
                "{} is {}x{} but the layer is {}x{}",
                volume_name(layer_key, timepoint),
                volume.dims(),
                volume.channels,
                layer.dims(),
                layer.channels
            )));
        }
        if layer.is_segmentation != volume.segmentation_labels.is_some() {
            return Err(VoxError::Configuration(format!(
                "{}: segmentation labels must be present exactly on segmentation layers",
                volume_name(layer_key, timepoint)
            )));
        }
        let scales = layer.zarr.scales.clone();

        let labels_bytes = volume.labels_le_bytes();
        let entry = VolumeEntry {
            timepoint,
            min: volume.min,
            max: volume.max,
            byte_length: volume.normalized.len() as u64,
            sha256: sha256_hex(&volume.normalized),
            labels_byte_length: labels_bytes.as_ref().map(|b| b.len() as u64),
            labels_sha256: labels_bytes.as_deref().map(sha256_hex),
        };

        let mut downsampled: Option<NormalizedVolume> = None;
        let mut objects = 0;
        for scale in &scales {
            if scale.level > 0 {
                let source = downsampled.as_ref().unwrap_or(volume);
                downsampled = Some(downsample_volume(source, scale.dims())?);
            }
            let level_volume = downsampled.as_ref().unwrap_or(volume);
            objects += self.write_scale(scale, timepoint, level_volume).await?;
        }

        debug!(
            layer = layer_key,
            timepoint,
            levels = scales.len(),
            objects,
            "wrote timepoint"
        );

        let volumes = &mut self.layers[index].volumes;
        volumes.push(entry.clone());
        volumes.sort_by_key(|v| v.timepoint);
        Ok(entry)
    }

    async fn write_scale(
        &self,
        scale: &ScaleManifest,
        timepoint: usize,
        volume: &NormalizedVolume,
    ) -> Result<usize> {
        let arrays = &scale.zarr;
        let mut objects = self
            .write_array_timepoint(&arrays.data, timepoint, &volume.normalized, u8s_to_bytes)
            .await?;
        if let (Some(descriptor), Some(labels)) = (&arrays.labels, &volume.segmentation_labels) {
            objects += self
                .write_array_timepoint(descriptor, timepoint, labels, u32s_to_le_bytes)
                .await?;
        }

        let (mins, maxs, occupancies) = chunk_statistics(volume, &arrays.data)?;
        let stats = &arrays.chunk_stats;
        objects += self.write_array_timepoint(&stats.min, timepoint, &mins, u8s_to_bytes).await?;
        objects += self.write_array_timepoint(&stats.max, timepoint, &maxs, u8s_to_bytes).await?;
        objects += self
            .write_array_timepoint(&stats.occupancy, timepoint, &occupancies, f32s_to_le_bytes)
            .await?;

        let histogram = compute_histogram(&volume.normalized);
        objects += self
            .write_array_timepoint(&arrays.histogram, timepoint, &histogram, u32s_to_le_bytes)
            .await?;
        Ok(objects)
    }

    /// Chunk, compress and store one timepoint of an array. Sharded arrays
    /// are flushed as whole shards; the time axis is never sharded, so every
    /// shard touched here is complete once this timepoint is written.
    async fn write_array_timepoint<T>(
        &self,
        descriptor: &ZarrArrayDescriptor,
        timepoint: usize,
        values: &[T],
        to_bytes: fn(&[T]) -> Vec<u8>,
    ) -> Result<usize>
    where
        T: Copy + Default + Send + Sync,
    {
        check_timepoint(descriptor, timepoint)?;
        let grid = timepoint_grid(descriptor)?;
        let shard_layout = get_shard_layout_for_array(descriptor)?;
        let level = self.options.compression_level;

        let mut shards: BTreeMap<String, Vec<(Vec<usize>, Vec<u8>)>> = BTreeMap::new();
        let mut objects = 0;
        for coords in grid.iter_chunk_coords() {
            let chunk = grid.extract_chunk(values, &coords, T::default())?;
            let payload = self.compressor.compress(&to_bytes(&chunk), level)?;
            let mut global = coords;
            global[0] = timepoint;
            match &shard_layout {
                Some(layout) => {
                    let location = locate_chunk(layout, &descriptor.path, &global)?;
                    shards
                        .entry(location.shard_path)
                        .or_default()
                        .push((location.local_chunk_coords, payload));
                }
                None => {
                    self.store.write(&chunk_key(&descriptor.path, &global), &payload).await?;
                    objects += 1;
                }
            }
        }

        for (path, entries) in shards {
            let chunks = entries.len();
            let bytes = encode_shard_entries(descriptor.shape.len(), entries)?;
            self.store.write(&path, &bytes).await?;
            debug!(shard = %path, chunks, bytes = bytes.len(), "flushed shard");
            objects += 1;
        }
        Ok(objects)
    }

    /// Validate and persist the root manifest.
    ///
    /// Every layer must have all of its timepoints written and belong to one
    /// of `info.channels`.
    pub async fn finish(self, info: DatasetInfo) -> Result<PreprocessedManifest> {
        for layer in &self.layers {
            if layer.volumes.len() as u64 != layer.volume_count {
                return Err(VoxError::Configuration(format!(
                    "layer '{}' has {} of {} timepoints written",
                    layer.key,
                    layer.volumes.len(),
                    layer.volume_count
                )));
            }
            if !info.channels.iter().any(|c| c.id == layer.channel_id) {
                return Err(VoxError::Configuration(format!(
                    "layer '{}' references unknown channel '{}'",
                    layer.key, layer.channel_id
                )));
            }
        }

        let mut layers = self.layers;
        let mut channels = Vec::with_capacity(info.channels.len());
        for channel in info.channels {
            let (own, rest): (Vec<_>, Vec<_>) =
                layers.into_iter().partition(|layer| layer.channel_id == channel.id);
            layers = rest;
            if own.is_empty() {
                return Err(VoxError::Configuration(format!(
                    "channel '{}' has no layers",
                    channel.id
                )));
            }
            channels.push(ChannelManifest {
                id: channel.id,
                name: channel.name,
                layers: own,
            });
        }

        let total_volume_count: u64 = channels
            .iter()
            .flat_map(|c| c.layers.iter())
            .map(|layer| layer.volume_count)
            .sum();
        let manifest = PreprocessedManifest::new(DatasetManifest {
            movie_mode: info.movie_mode,
            total_volume_count,
            channels,
            track_sets: info.track_sets,
            voxel_resolution: info.voxel_resolution,
            anisotropy_correction: info.anisotropy_correction,
        });
        validate_manifest(&manifest)?;

        let mut attrs = serde_json::Map::new();
        attrs.insert(ROOT_ATTRIBUTE.to_string(), serde_json::to_value(&manifest)?);
        let attrs = serde_json::to_vec_pretty(&attrs)?;
        self.store
            .write(&zattrs_key(&self.options.root_prefix), &attrs)
            .await?;
        info!(
            total_volume_count,
            channels = manifest.dataset.channels.len(),
            "finalized dataset manifest"
        );
        Ok(manifest)
    }
}

/// Fail with an integrity error unless `volume` matches its digest record.
pub fn verify_volume_entry(name: &str, entry: &VolumeEntry, volume: &NormalizedVolume) -> Result<()> {
    verify_bytes(name, entry.byte_length, &entry.sha256, &volume.normalized)?;
    match (&entry.labels_sha256, entry.labels_byte_length, volume.labels_le_bytes()) {
        (Some(sha), Some(len), Some(bytes)) => verify_bytes(&format!("{} labels", name), len, sha, &bytes),
        (None, None, None) => Ok(()),
        _ => Err(VoxError::MissingEntry(format!("{} labels", name))),
    }
}

fn verify_bytes(name: &str, expected_len: u64, expected_sha: &str, bytes: &[u8]) -> Result<()> {
    if bytes.len() as u64 != expected_len {
        return Err(VoxError::ByteLengthMismatch {
            path: name.to_string(),
            expected: expected_len as usize,
            actual: bytes.len(),
        });
    }
    if !verify_sha256(bytes, expected_sha) {
        return Err(VoxError::DigestMismatch {
            path: name.to_string(),
            expected: expected_sha.to_string(),
            actual: sha256_hex(bytes),
        });
    }
    Ok(())
}

type ShardCache = HashMap<String, (Bytes, ShardIndex)>;

/// Reads a dataset back out of a store.
pub struct DatasetReader<S: Store + ?Sized> {
    store: Arc<S>,
    manifest: PreprocessedManifest,
}

impl<S: Store + ?Sized> DatasetReader<S> {
    pub fn new(store: Arc<S>, manifest: PreprocessedManifest) -> Self {
        Self { store, manifest }
    }

    /// Open a dataset from the manifest in the root `.zattrs`.
    pub async fn open(store: Arc<S>, root: &str) -> Result<Self> {
        let key = zattrs_key(root);
        let bytes = store.read_optional(&key).await?.ok_or_else(|| VoxError::MissingEntry(key.clone()))?;
        let attrs: Value = serde_json::from_slice(&bytes)?;
        let value = attrs
            .get(ROOT_ATTRIBUTE)
            .ok_or_else(|| VoxError::MissingEntry(format!("{} attribute '{}'", key, ROOT_ATTRIBUTE)))?;
        let manifest = coerce_manifest(value)?;
        Ok(Self::new(store, manifest))
    }

    pub fn manifest(&self) -> &PreprocessedManifest {
        &self.manifest
    }

    pub fn into_manifest(self) -> PreprocessedManifest {
        self.manifest
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    fn find_layer(&self, key: &str) -> Result<&LayerManifest> {
        self.manifest
            .find_layer(key)
            .ok_or_else(|| VoxError::NotFound(format!("layer '{}'", key)))
    }

    async fn read_required(&self, key: &str) -> Result<Bytes> {
        self.store
            .read_optional(key)
            .await?
            .ok_or_else(|| VoxError::MissingEntry(key.to_string()))
    }

    /// Compressor declared by an array's `.zarray`
    pub async fn array_compression(&self, descriptor: &ZarrArrayDescriptor) -> Result<CompressionMethod> {
        let bytes = self.read_required(&zarray_key(&descriptor.path)).await?;
        parse_zarray(&bytes, descriptor)
    }

    async fn load_shard<'c>(
        &self,
        path: &str,
        layout: &ShardLayout,
        shard_coords: &[usize],
        cache: &'c mut ShardCache,
    ) -> Result<&'c (Bytes, ShardIndex)> {
        if !cache.contains_key(path) {
            let bytes = self.read_required(path).await?;
            let index = ShardIndex::parse(&bytes)?;
            verify_shard_complete(layout, shard_coords, &index)?;
            cache.insert(path.to_string(), (bytes, index));
        }
        cache
            .get(path)
            .ok_or_else(|| VoxError::MissingEntry(path.to_string()))
    }

    /// Compressed payload of one chunk, from its own key or its shard
    async fn fetch_chunk(
        &self,
        descriptor: &ZarrArrayDescriptor,
        shard_layout: Option<&ShardLayout>,
        chunk_coords: &[usize],
        cache: &mut ShardCache,
    ) -> Result<Vec<u8>> {
        match shard_layout {
            None => Ok(self.read_required(&chunk_key(&descriptor.path, chunk_coords)).await?.to_vec()),
            Some(layout) => {
                let location = locate_chunk(layout, &descriptor.path, chunk_coords)?;
                let (bytes, index) = self
                    .load_shard(&location.shard_path, layout, &location.shard_coords, cache)
                    .await?;
                let payload =
                    decode_shard_entry_from_index(bytes, index, layout.rank(), &location.local_chunk_coords)?;
                Ok(payload.to_vec())
            }
        }
    }

    /// Decompressed bytes of one chunk
    pub async fn read_chunk(&self, descriptor: &ZarrArrayDescriptor, chunk_coords: &[usize]) -> Result<Vec<u8>> {
        let compressor = get_compressor(self.array_compression(descriptor).await?);
        let shard_layout = get_shard_layout_for_array(descriptor)?;
        let mut cache = ShardCache::new();
        let raw = self
            .fetch_chunk(descriptor, shard_layout.as_ref(), chunk_coords, &mut cache)
            .await?;
        let expected = descriptor.chunk_shape.iter().product::<usize>() * descriptor.data_type.size_in_bytes();
        decompress_chunk(compressor.as_ref(), &raw, expected, &descriptor.path, chunk_coords)
    }

    /// One timepoint of an array as little-endian element bytes, edge padding removed
    pub async fn read_array_timepoint(&self, descriptor: &ZarrArrayDescriptor, timepoint: usize) -> Result<Vec<u8>> {
        check_timepoint(descriptor, timepoint)?;
        let element_bytes = descriptor.data_type.size_in_bytes();
        let grid = timepoint_grid(descriptor)?;
        let bytes_grid = byte_grid(&grid, element_bytes)?;
        let chunk_bytes = grid.chunk_element_count() * element_bytes;
        let compressor = get_compressor(self.array_compression(descriptor).await?);
        let shard_layout = get_shard_layout_for_array(descriptor)?;

        let mut cache = ShardCache::new();
        let mut out = vec![0u8; bytes_grid.shape().iter().product()];
        for coords in grid.iter_chunk_coords() {
            let mut global = coords.clone();
            global[0] = timepoint;
            let raw = self
                .fetch_chunk(descriptor, shard_layout.as_ref(), &global, &mut cache)
                .await?;
            let chunk = decompress_chunk(compressor.as_ref(), &raw, chunk_bytes, &descriptor.path, &global)?;
            bytes_grid.place_chunk(&mut out, &coords, &chunk)?;
        }
        Ok(out)
    }

    /// Reassemble one timepoint of one pyramid level.
    pub async fn read_timepoint(&self, layer_key: &str, level: usize, timepoint: usize) -> Result<NormalizedVolume> {
        let layer = self.find_layer(layer_key)?;
        let scale = layer.zarr.scales.get(level).ok_or_else(|| {
            VoxError::OutOfBounds(format!(
                "level {} of layer '{}' with {} levels",
                level,
                layer_key,
                layer.zarr.scales.len()
            ))
        })?;

        let normalized = self.read_array_timepoint(&scale.zarr.data, timepoint).await?;
        let labels = match &scale.zarr.labels {
            Some(descriptor) => {
                let bytes = self.read_array_timepoint(descriptor, timepoint).await?;
                Some(le_bytes_to_u32s(&bytes).ok_or_else(|| {
                    VoxError::Corrupt(format!("{}: label bytes are not 32-bit aligned", descriptor.path))
                })?)
            }
            None => None,
        };

        let range = layer
            .volumes
            .iter()
            .find(|v| v.timepoint == timepoint)
            .map(|v| ValueRange::new(v.min, v.max))
            .or(layer.normalization)
            .unwrap_or(ValueRange::new(0.0, 1.0));
        NormalizedVolume::new(
            scale.width,
            scale.height,
            scale.depth,
            scale.channels,
            layer.data_type,
            range,
            normalized,
            labels,
        )
    }

    /// Check every chunk of an array is present; for sharded arrays every
    /// shard must be complete and every chunk slice in bounds. Returns the
    /// number of chunks checked.
    pub async fn verify_array(&self, descriptor: &ZarrArrayDescriptor) -> Result<usize> {
        self.array_compression(descriptor).await?;
        let grid = ChunkGrid::new(descriptor.shape.clone(), descriptor.chunk_shape.clone())?;
        let shard_layout = get_shard_layout_for_array(descriptor)?;
        let mut cache = ShardCache::new();
        let mut checked = 0;
        for coords in grid.iter_chunk_coords() {
            match &shard_layout {
                None => {
                    let key = chunk_key(&descriptor.path, &coords);
                    if !self.store.exists(&key).await? {
                        return Err(VoxError::MissingEntry(key));
                    }
                }
                Some(layout) => {
                    self.fetch_chunk(descriptor, Some(layout), &coords, &mut cache).await?;
                }
            }
            checked += 1;
        }
        Ok(checked)
    }

    /// Verify every array of one pyramid level.
    pub async fn verify_scale(&self, layer_key: &str, level: usize) -> Result<usize> {
        let layer = self.find_layer(layer_key)?;
        let scale = layer
            .zarr
            .scales
            .get(level)
            .ok_or_else(|| VoxError::OutOfBounds(format!("level {} of layer '{}'", level, layer_key)))?;
        let mut checked = 0;
        for descriptor in scale.zarr.all() {
            checked += self.verify_array(descriptor).await?;
        }
        Ok(checked)
    }
}

fn decompress_chunk(
    compressor: &dyn Compressor,
    raw: &[u8],
    expected: usize,
    array_path: &str,
    coords: &[usize],
) -> Result<Vec<u8>> {
    let chunk = compressor
        .decompress(raw, Some(expected))
        .map_err(|e| VoxError::Corrupt(format!("{} chunk {:?}: {}", array_path, coords, e)))?;
    if chunk.len() != expected {
        return Err(VoxError::Corrupt(format!(
            "{} chunk {:?} decodes to {} bytes, expected {}",
            array_path,
            coords,
            chunk.len(),
            expected
        )));
    }
    Ok(chunk)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryStore;

    fn plan(key: &str, dims: Dims3, channels: usize, count: usize, seg: bool) -> LayerPlan {
        LayerPlan {
            key: key.to_string(),
            label: key.to_string(),
            channel_id: "ch0".to_string(),
            is_segmentation: seg,
            volume_count: count,
            dims,
            channels,
            data_type: VolumeDataType::Uint8,
            normalization: (!seg).then(|| ValueRange::new(0.0, 255.0)),
        }
    }

    fn ramp(dims: Dims3, channels: usize) -> NormalizedVolume {
        let len = dims.voxel_count() * channels;
        NormalizedVolume::new(
            dims.width,
            dims.height,
            dims.depth,
            channels,
            VolumeDataType::Uint8,
            ValueRange::new(0.0, 255.0),
            (0..len).map(|i| (i * 7 % 251) as u8).collect(),
            None,
        )
        .unwrap()
    }

    fn options() -> WriterOptions {
        WriterOptions::new().with_chunk_shape([2, 2, 2])
    }

    #[test]
    fn test_plan_scale_clamps_chunks() {
        let plan = plan("a", Dims3::new(5, 3, 1), 2, 3, false);
        let level = compute_multiscale_geometry_levels(plan.dims)[0];
        let scale = plan_scale("zarr", &plan, &level, &options());
        assert_eq!(scale.zarr.data.path, "zarr/a/scale0/data");
        assert_eq!(scale.zarr.data.shape, vec![3, 1, 3, 5, 2]);
        assert_eq!(scale.zarr.data.chunk_shape, vec![1, 1, 2, 2, 2]);
        assert_eq!(scale.zarr.chunk_stats.min.shape, vec![3, 1, 2, 3]);
        assert_eq!(scale.zarr.histogram.shape, vec![3, HISTOGRAM_BINS]);
        assert!(scale.zarr.labels.is_none());
    }

    #[test]
    fn test_zarray_round_trip() {
        let desc = ZarrArrayDescriptor::new("zarr/a/scale0/labels", vec![1, 2], vec![1, 2], VolumeDataType::Uint32);
        let meta = zarray_metadata(&desc, CompressionMethod::Zlib, CompressionLevel::default());
        assert_eq!(meta["dtype"], "<u4");
        assert_eq!(meta["dimension_separator"], "/");
        let bytes = serde_json::to_vec(&meta).unwrap();
        assert_eq!(parse_zarray(&bytes, &desc).unwrap(), CompressionMethod::Zlib);

        let other = ZarrArrayDescriptor::new("x", vec![1, 3], vec![1, 2], VolumeDataType::Uint32);
        assert!(matches!(parse_zarray(&bytes, &other), Err(VoxError::Corrupt(_))));
    }

    #[tokio::test]
    async fn test_write_and_read_unsharded() {
        let store = Arc::new(MemoryStore::new());
        let dims = Dims3::new(3, 3, 2);
        let mut writer = DatasetWriter::create(store.clone(), options().with_target_shard_bytes(None))
            .await
            .unwrap();
        writer.add_layer(plan("raw", dims, 1, 2, false)).await.unwrap();

        let volumes = [ramp(dims, 1), ramp(dims, 1)];
        for (t, volume) in volumes.iter().enumerate() {
            let entry = writer.write_timepoint("raw", t, volume).await.unwrap();
            assert_eq!(entry.sha256, sha256_hex(&volume.normalized));
        }
        assert!(store.exists("zarr/raw/scale0/data/1/0/1/1/0").await.unwrap());

        let manifest = writer
            .finish(DatasetInfo::new(MovieMode::ThreeD, vec![ChannelInfo::new("ch0", "Channel")]))
            .await
            .unwrap();
        assert_eq!(manifest.dataset.total_volume_count, 2);

        let reader = DatasetReader::open(store.clone(), "zarr").await.unwrap();
        assert_eq!(reader.manifest(), &manifest);
        let back = reader.read_timepoint("raw", 0, 1).await.unwrap();
        assert_eq!(back.normalized, volumes[1].normalized);

        let layer = manifest.find_layer("raw").unwrap();
        for level in 0..layer.zarr.scales.len() {
            assert!(reader.verify_scale("raw", level).await.unwrap() > 0);
        }

        let last = layer.zarr.scales.last().unwrap();
        assert_eq!(last.dims(), Dims3::new(1, 1, 1));
        let tiny = reader.read_timepoint("raw", last.level, 0).await.unwrap();
        assert_eq!(tiny.normalized.len(), 1);
    }

    #[tokio::test]
    async fn test_sharded_segmentation_layer() {
        let store = Arc::new(MemoryStore::new());
        let dims = Dims3::new(4, 4, 1);
        let mut writer = DatasetWriter::create(store.clone(), options().with_target_shard_bytes(Some(64)))
            .await
            .unwrap();
        let layer = writer.add_layer(plan("seg", dims, 4, 1, true)).await.unwrap();
        assert!(layer.zarr.scales[0].zarr.data.is_sharded());

        let labels: Vec<u32> = (0..16).map(|i| i % 3).collect();
        let rgba: Vec<u8> = labels.iter().flat_map(|&l| [l as u8, 0, 0, 255]).collect();
        let volume = NormalizedVolume::new(
            4,
            4,
            1,
            4,
            VolumeDataType::Uint32,
            ValueRange::new(0.0, 2.0),
            rgba,
            Some(labels.clone()),
        )
        .unwrap();
        writer.write_timepoint("seg", 0, &volume).await.unwrap();
        let manifest = writer
            .finish(DatasetInfo::new(MovieMode::ThreeD, vec![ChannelInfo::new("ch0", "Channel")]))
            .await
            .unwrap();

        let keys = store.list("zarr/seg/scale0/data/shards/").await.unwrap();
        assert!(!keys.is_empty());

        let reader = DatasetReader::new(store.clone(), manifest);
        let back = reader.read_timepoint("seg", 0, 0).await.unwrap();
        assert_eq!(back.segmentation_labels.as_deref(), Some(labels.as_slice()));
        assert_eq!(back.normalized, volume.normalized);
        assert!(reader.verify_scale("seg", 0).await.is_ok());
        let entry = &reader.manifest().find_layer("seg").unwrap().volumes[0];
        verify_volume_entry("seg", entry, &back).unwrap();

        // Dropping one shard breaks verification
        store.delete(&keys[0]).await.unwrap();
        assert!(matches!(
            reader.verify_scale("seg", 0).await,
            Err(VoxError::MissingEntry(_))
        ));
    }

    #[tokio::test]
    async fn test_writer_rejects_bad_input() {
        let store = Arc::new(MemoryStore::new());
        let dims = Dims3::new(2, 2, 1);
        let mut writer = DatasetWriter::create(store, options()).await.unwrap();
        writer.add_layer(plan("a", dims, 1, 1, false)).await.unwrap();
        assert!(writer.add_layer(plan("a", dims, 1, 1, false)).await.is_err());
        assert!(writer.add_layer(plan("b/c", dims, 1, 1, false)).await.is_err());

        let wrong = ramp(Dims3::new(3, 2, 1), 1);
        assert!(matches!(
            writer.write_timepoint("a", 0, &wrong).await,
            Err(VoxError::Configuration(_))
        ));
        assert!(writer.write_timepoint("a", 1, &ramp(dims, 1)).await.is_err());
        writer.write_timepoint("a", 0, &ramp(dims, 1)).await.unwrap();
        assert!(writer.write_timepoint("a", 0, &ramp(dims, 1)).await.is_err());
    }

    #[tokio::test]
    async fn test_writer_requires_increasing_timepoints() {
        let store = Arc::new(MemoryStore::new());
        let dims = Dims3::new(2, 1, 1);
        let mut writer = DatasetWriter::create(store.clone(), options()).await.unwrap();
        writer.add_layer(plan("a", dims, 1, 3, false)).await.unwrap();
        writer.add_layer(plan("b", dims, 1, 3, false)).await.unwrap();

        writer.write_timepoint("a", 1, &ramp(dims, 1)).await.unwrap();
        let err = writer.write_timepoint("a", 0, &ramp(dims, 1)).await.unwrap_err();
        assert!(matches!(err, VoxError::Configuration(_)), "got {:?}", err);
        assert!(!store.exists("zarr/a/scale0/data/0/0/0/0/0").await.unwrap());

        // Order is tracked per layer
        writer.write_timepoint("b", 0, &ramp(dims, 1)).await.unwrap();
        writer.write_timepoint("a", 2, &ramp(dims, 1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_finish_requires_all_timepoints() {
        let store = Arc::new(MemoryStore::new());
        let mut writer = DatasetWriter::create(store, options()).await.unwrap();
        writer.add_layer(plan("a", Dims3::new(2, 1, 1), 1, 2, false)).await.unwrap();
        writer.write_timepoint("a", 0, &ramp(Dims3::new(2, 1, 1), 1)).await.unwrap();
        let err = writer
            .finish(DatasetInfo::new(MovieMode::ThreeD, vec![ChannelInfo::new("ch0", "C")]))
            .await
            .unwrap_err();
        assert!(matches!(err, VoxError::Configuration(_)));
    }

    #[test]
    fn test_verify_volume_entry() {
        let volume = ramp(Dims3::new(2, 2, 1), 1);
        let mut entry = VolumeEntry {
            timepoint: 0,
            min: 0.0,
            max: 255.0,
            byte_length: 4,
            sha256: sha256_hex(&volume.normalized),
            labels_byte_length: None,
            labels_sha256: None,
        };
        verify_volume_entry("a", &entry, &volume).unwrap();

        entry.byte_length = 5;
        assert!(matches!(
            verify_volume_entry("a", &entry, &volume),
            Err(VoxError::ByteLengthMismatch { .. })
        ));
        entry.byte_length = 4;
        entry.sha256 = "0".repeat(64);
        assert!(matches!(
            verify_volume_entry("a", &entry, &volume),
            Err(VoxError::DigestMismatch { .. })
        ));
    }
}
