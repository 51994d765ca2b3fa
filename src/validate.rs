//! Strict manifest validation.
//!
//! [`coerce_manifest`] walks an untyped JSON value and builds the typed
//! manifest, failing on the first violation with the fully qualified path of
//! the offending field.

use crate::error::{Result, ValidationError, VoxError};
use crate::manifest::{
    AnisotropyCorrection, ChannelManifest, ChunkStatsArrays, DatasetManifest, LayerManifest,
    LayerZarr, PreprocessedManifest, ScaleArrays, ScaleManifest, ShardingPlan, TrackSetManifest,
    VolumeEntry, VoxelResolution, ZarrArrayDescriptor, LEGACY_MANIFEST_FORMATS, MANIFEST_FORMAT,
};
use crate::types::{AxisScale, Dims3, MovieMode, ValueRange, VolumeDataType};
use crate::utils::ceil_div;
use crate::volume::{HISTOGRAM_BINS, SEGMENTATION_CHANNELS};
use serde_json::{Map, Value};
use std::collections::HashSet;

type Validated<T> = std::result::Result<T, ValidationError>;

/// A JSON value together with its path from the manifest root
#[derive(Clone)]
struct Node<'a> {
    value: &'a Value,
    path: String,
}

impl<'a> Node<'a> {
    fn root(value: &'a Value) -> Self {
        Self {
            value,
            path: "manifest".to_string(),
        }
    }

    fn fail<T>(&self, message: impl Into<String>) -> Validated<T> {
        Err(ValidationError::new(self.path.clone(), message))
    }

    fn object(&self) -> Validated<&'a Map<String, Value>> {
        match self.value.as_object() {
            Some(map) => Ok(map),
            None => self.fail("must be an object"),
        }
    }

    fn field(&self, name: &str) -> Validated<Node<'a>> {
        let path = format!("{}.{}", self.path, name);
        match self.object()?.get(name) {
            Some(value) => Ok(Node { value, path }),
            None => Err(ValidationError::new(path, "is required")),
        }
    }

    /// Missing and `null` both read as absent
    fn optional(&self, name: &str) -> Validated<Option<Node<'a>>> {
        match self.object()?.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => Ok(Some(Node {
                value,
                path: format!("{}.{}", self.path, name),
            })),
        }
    }

    fn str(&self) -> Validated<&'a str> {
        match self.value.as_str() {
            Some(s) => Ok(s),
            None => self.fail("must be a string"),
        }
    }

    fn non_empty_str(&self) -> Validated<&'a str> {
        let s = self.str()?;
        if s.trim().is_empty() {
            return self.fail("must not be empty");
        }
        Ok(s)
    }

    fn bool(&self) -> Validated<bool> {
        match self.value.as_bool() {
            Some(b) => Ok(b),
            None => self.fail("must be a boolean"),
        }
    }

    fn non_negative_int(&self) -> Validated<u64> {
        match self.value.as_u64() {
            Some(n) => Ok(n),
            None => self.fail("must be a non-negative integer"),
        }
    }

    fn positive_int(&self) -> Validated<u64> {
        match self.value.as_u64() {
            Some(n) if n > 0 => Ok(n),
            _ => self.fail("must be a positive integer"),
        }
    }

    fn positive_usize(&self) -> Validated<usize> {
        let n = self.positive_int()?;
        usize::try_from(n).or_else(|_| self.fail("is too large"))
    }

    fn finite_number(&self) -> Validated<f64> {
        match self.value.as_f64() {
            Some(n) if n.is_finite() => Ok(n),
            _ => self.fail("must be a finite number"),
        }
    }

    fn array(&self) -> Validated<Vec<Node<'a>>> {
        match self.value.as_array() {
            Some(items) => Ok(items
                .iter()
                .enumerate()
                .map(|(i, value)| Node {
                    value,
                    path: format!("{}[{}]", self.path, i),
                })
                .collect()),
            None => self.fail("must be an array"),
        }
    }

    fn non_empty_array(&self) -> Validated<Vec<Node<'a>>> {
        let items = self.array()?;
        if items.is_empty() {
            return self.fail("must contain at least one entry");
        }
        Ok(items)
    }

    /// Tuple of positive integers with exactly `rank` entries
    fn positive_tuple(&self, rank: usize) -> Validated<Vec<usize>> {
        let items = self.array()?;
        if items.len() != rank {
            return self.fail(format!("must have {} entries, found {}", rank, items.len()));
        }
        items.iter().map(|item| item.positive_usize()).collect()
    }

    fn data_type(&self) -> Validated<VolumeDataType> {
        let name = self.str()?;
        match VolumeDataType::parse(name) {
            Some(dt) => Ok(dt),
            None => self.fail(format!("unknown data type '{}'", name)),
        }
    }
}

/// Validate an untyped manifest value and build the typed manifest.
pub fn coerce_manifest(value: &Value) -> Validated<PreprocessedManifest> {
    let root = Node::root(value);
    root.object()?;

    let format_node = root.field("format")?;
    let format = format_node.str()?;
    if format != MANIFEST_FORMAT {
        return if LEGACY_MANIFEST_FORMATS.contains(&format) {
            format_node.fail(format!("unsupported legacy format '{}'", format))
        } else {
            format_node.fail(format!(
                "expected '{}', found '{}'",
                MANIFEST_FORMAT, format
            ))
        };
    }

    let generated_node = root.field("generatedAt")?;
    let generated_at = generated_node.str()?;
    if !is_iso8601_timestamp(generated_at) {
        return generated_node.fail("must be an ISO-8601 timestamp");
    }

    let dataset = coerce_dataset(&root.field("dataset")?)?;
    Ok(PreprocessedManifest {
        format: format.to_string(),
        generated_at: generated_at.to_string(),
        dataset,
    })
}

/// Parse and validate manifest bytes.
pub fn parse_manifest(bytes: &[u8]) -> Result<PreprocessedManifest> {
    let value: Value = serde_json::from_slice(bytes)?;
    coerce_manifest(&value).map_err(VoxError::from)
}

/// Re-validate a typed manifest, e.g. before sealing it.
pub fn validate_manifest(manifest: &PreprocessedManifest) -> Result<()> {
    let value = serde_json::to_value(manifest)?;
    coerce_manifest(&value)?;
    Ok(())
}

fn is_iso8601_timestamp(s: &str) -> bool {
    chrono::DateTime::parse_from_rfc3339(s).is_ok()
        || chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f").is_ok()
}

fn coerce_dataset(node: &Node<'_>) -> Validated<DatasetManifest> {
    node.object()?;

    let mode_node = node.field("movieMode")?;
    let movie_mode = match mode_node.str()? {
        "3d" => MovieMode::ThreeD,
        "2d" => MovieMode::TwoD,
        other => return mode_node.fail(format!("must be \"2d\" or \"3d\", found '{}'", other)),
    };

    let total_node = node.field("totalVolumeCount")?;
    let total_volume_count = total_node.positive_int()?;

    let mut channel_ids = HashSet::new();
    let mut layer_keys = HashSet::new();
    let mut channels = Vec::new();
    for channel_node in node.field("channels")?.non_empty_array()? {
        let channel = coerce_channel(&channel_node, &mut layer_keys)?;
        if !channel_ids.insert(channel.id.clone()) {
            return Err(ValidationError::new(
                format!("{}.id", channel_node.path),
                format!("duplicate channel id '{}'", channel.id),
            ));
        }
        channels.push(channel);
    }

    let mut track_sets = Vec::new();
    if let Some(tracks_node) = node.optional("trackSets")? {
        let mut ids = HashSet::new();
        for track_node in tracks_node.array()? {
            let track_set = coerce_track_set(&track_node, &channel_ids)?;
            if !ids.insert(track_set.id.clone()) {
                return Err(ValidationError::new(
                    format!("{}.id", track_node.path),
                    format!("duplicate track set id '{}'", track_set.id),
                ));
            }
            track_sets.push(track_set);
        }
    }

    let voxel_resolution = match node.optional("voxelResolution")? {
        Some(res) => Some(VoxelResolution {
            x: positive_number(&res.field("x")?)?,
            y: positive_number(&res.field("y")?)?,
            z: positive_number(&res.field("z")?)?,
            unit: res.field("unit")?.str()?.to_string(),
        }),
        None => None,
    };

    let anisotropy_correction = match node.optional("anisotropyCorrection")? {
        Some(corr) => {
            let enabled = corr.field("enabled")?.bool()?;
            let scale_node = corr.field("scale")?;
            Some(AnisotropyCorrection {
                enabled,
                scale: AxisScale::new(
                    scale_factor(&scale_node.field("x")?)?,
                    scale_factor(&scale_node.field("y")?)?,
                    scale_factor(&scale_node.field("z")?)?,
                ),
            })
        }
        None => None,
    };

    let declared: u64 = channels
        .iter()
        .flat_map(|c| c.layers.iter())
        .map(|layer| layer.volume_count)
        .sum();
    if declared != total_volume_count {
        return total_node.fail(format!(
            "is {} but layers declare {} volumes",
            total_volume_count, declared
        ));
    }

    Ok(DatasetManifest {
        movie_mode,
        total_volume_count,
        channels,
        track_sets,
        voxel_resolution,
        anisotropy_correction,
    })
}

fn positive_number(node: &Node<'_>) -> Validated<f64> {
    let n = node.finite_number()?;
    if n <= 0.0 {
        return node.fail("must be positive");
    }
    Ok(n)
}

fn scale_factor(node: &Node<'_>) -> Validated<f64> {
    let n = node.finite_number()?;
    if n < 1.0 {
        return node.fail("must be at least 1");
    }
    Ok(n)
}

fn coerce_channel(node: &Node<'_>, layer_keys: &mut HashSet<String>) -> Validated<ChannelManifest> {
    node.object()?;
    let id = node.field("id")?.non_empty_str()?.to_string();
    let name = node.field("name")?.str()?.to_string();

    let mut layers = Vec::new();
    for layer_node in node.field("layers")?.non_empty_array()? {
        let layer = coerce_layer(&layer_node, &id)?;
        if !layer_keys.insert(layer.key.clone()) {
            return Err(ValidationError::new(
                format!("{}.key", layer_node.path),
                format!("duplicate layer key '{}'", layer.key),
            ));
        }
        layers.push(layer);
    }

    Ok(ChannelManifest { id, name, layers })
}

fn coerce_layer(node: &Node<'_>, channel_id: &str) -> Validated<LayerManifest> {
    node.object()?;
    let key = node.field("key")?.non_empty_str()?.to_string();
    let label = node.field("label")?.str()?.to_string();

    let channel_node = node.field("channelId")?;
    let layer_channel = channel_node.str()?;
    if layer_channel != channel_id {
        return channel_node.fail(format!(
            "is '{}' but the layer belongs to channel '{}'",
            layer_channel, channel_id
        ));
    }

    let is_segmentation = node.field("isSegmentation")?.bool()?;
    let volume_count = node.field("volumeCount")?.positive_int()?;
    let width = node.field("width")?.positive_usize()?;
    let height = node.field("height")?.positive_usize()?;
    let depth = node.field("depth")?.positive_usize()?;
    let channels_node = node.field("channels")?;
    let channels = channels_node.positive_usize()?;
    if is_segmentation && channels != SEGMENTATION_CHANNELS {
        return channels_node.fail(format!(
            "segmentation layers must have {} channels",
            SEGMENTATION_CHANNELS
        ));
    }
    let data_type = node.field("dataType")?.data_type()?;

    let normalization = match node.optional("normalization")? {
        Some(norm) => {
            norm.object()?;
            let min = norm.field("min")?.finite_number()?;
            let max_node = norm.field("max")?;
            let max = max_node.finite_number()?;
            if min > max {
                return max_node.fail(format!("must be >= min ({})", min));
            }
            if min == max {
                return max_node.fail("degenerate range: max must exceed min");
            }
            Some(ValueRange::new(min, max))
        }
        None => None,
    };

    let mut layer = LayerManifest {
        key,
        label,
        channel_id: channel_id.to_string(),
        is_segmentation,
        volume_count,
        width,
        height,
        depth,
        channels,
        data_type,
        normalization,
        zarr: LayerZarr { scales: Vec::new() },
        volumes: Vec::new(),
    };

    let zarr_node = node.field("zarr")?;
    let mut previous: Option<(Dims3, [usize; 3])> = None;
    for (index, scale_node) in zarr_node.field("scales")?.non_empty_array()?.iter().enumerate() {
        let scale = coerce_scale(scale_node, index, previous, &layer)?;
        previous = Some((scale.dims(), scale.downsample_factor));
        layer.zarr.scales.push(scale);
    }

    if let Some(volumes_node) = node.optional("volumes")? {
        let mut seen = HashSet::new();
        for entry_node in volumes_node.array()? {
            let entry = coerce_volume_entry(&entry_node, &layer)?;
            if !seen.insert(entry.timepoint) {
                return Err(ValidationError::new(
                    format!("{}.timepoint", entry_node.path),
                    format!("duplicate timepoint {}", entry.timepoint),
                ));
            }
            layer.volumes.push(entry);
        }
    }

    Ok(layer)
}

fn coerce_scale(
    node: &Node<'_>,
    index: usize,
    previous: Option<(Dims3, [usize; 3])>,
    layer: &LayerManifest,
) -> Validated<ScaleManifest> {
    node.object()?;

    let level_node = node.field("level")?;
    let level = level_node.non_negative_int()?;
    if level != index as u64 {
        return level_node.fail(format!("expected level {}, found {}", index, level));
    }

    let factor_node = node.field("downsampleFactor")?;
    let factor = factor_node.positive_tuple(3)?;
    let width = node.field("width")?.positive_usize()?;
    let height = node.field("height")?.positive_usize()?;
    let depth = node.field("depth")?.positive_usize()?;
    let channels_node = node.field("channels")?;
    let channels = channels_node.positive_usize()?;
    let dims = Dims3::new(width, height, depth);

    let expected = match previous {
        None => layer.dims(),
        Some((prev, _)) => Dims3::new(
            prev.width.div_ceil(2),
            prev.height.div_ceil(2),
            prev.depth.div_ceil(2),
        ),
    };
    if dims != expected {
        let what = if previous.is_none() {
            "must equal the layer dimensions"
        } else {
            "must halve the previous level"
        };
        return node.fail(format!("{} {}, expected {}", dims, what, expected));
    }
    if channels != layer.channels {
        return channels_node.fail(format!(
            "is {} but the layer has {} channels",
            channels, layer.channels
        ));
    }
    // Cumulative; doubles only on axes that halved this level
    let expected_factor = match previous {
        None => [1, 1, 1],
        Some((prev, prev_factor)) => {
            let halved = [
                dims.width != prev.width,
                dims.height != prev.height,
                dims.depth != prev.depth,
            ];
            let mut next = prev_factor;
            for (axis, changed) in halved.into_iter().enumerate() {
                if changed {
                    next[axis] *= 2;
                }
            }
            next
        }
    };
    if factor != expected_factor {
        return factor_node.fail(format!("is {:?}, expected {:?}", factor, expected_factor));
    }

    let count = usize::try_from(layer.volume_count).or_else(|_| level_node.fail("volume count is too large"))?;
    let arrays_node = node.field("zarr")?;
    arrays_node.object()?;

    let data_node = arrays_node.field("data")?;
    let data = coerce_descriptor(
        &data_node,
        &[count, depth, height, width, channels],
        VolumeDataType::Uint8,
    )?;

    let labels = match arrays_node.optional("labels")? {
        Some(labels_node) => {
            if !layer.is_segmentation {
                return labels_node.fail("only segmentation layers may declare labels");
            }
            Some(coerce_descriptor(
                &labels_node,
                &[count, depth, height, width],
                VolumeDataType::Uint32,
            )?)
        }
        None if layer.is_segmentation => {
            return Err(ValidationError::new(
                format!("{}.labels", arrays_node.path),
                "is required on segmentation layers",
            ));
        }
        None => None,
    };

    let stats_shape = [
        count,
        ceil_div(depth, data.chunk_shape[1]),
        ceil_div(height, data.chunk_shape[2]),
        ceil_div(width, data.chunk_shape[3]),
    ];
    let stats_node = arrays_node.field("chunkStats")?;
    stats_node.object()?;
    let chunk_stats = ChunkStatsArrays {
        min: coerce_descriptor(&stats_node.field("min")?, &stats_shape, VolumeDataType::Uint8)?,
        max: coerce_descriptor(&stats_node.field("max")?, &stats_shape, VolumeDataType::Uint8)?,
        occupancy: coerce_descriptor(
            &stats_node.field("occupancy")?,
            &stats_shape,
            VolumeDataType::Float32,
        )?,
    };

    let histogram = coerce_descriptor(
        &arrays_node.field("histogram")?,
        &[count, HISTOGRAM_BINS],
        VolumeDataType::Uint32,
    )?;

    Ok(ScaleManifest {
        level: index,
        downsample_factor: [factor[0], factor[1], factor[2]],
        width,
        height,
        depth,
        channels,
        zarr: ScaleArrays {
            data,
            labels,
            chunk_stats,
            histogram,
        },
    })
}

fn coerce_descriptor(
    node: &Node<'_>,
    expected_shape: &[usize],
    expected_type: VolumeDataType,
) -> Validated<ZarrArrayDescriptor> {
    node.object()?;
    let path = node.field("path")?.non_empty_str()?.to_string();
    let rank = expected_shape.len();

    let shape_node = node.field("shape")?;
    let shape = shape_node.positive_tuple(rank)?;
    if shape != expected_shape {
        return shape_node.fail(format!("is {:?}, expected {:?}", shape, expected_shape));
    }
    let chunk_shape = node.field("chunkShape")?.positive_tuple(rank)?;

    let type_node = node.field("dataType")?;
    let data_type = type_node.data_type()?;
    if data_type != expected_type {
        return type_node.fail(format!("is {}, expected {}", data_type, expected_type));
    }

    let sharding = match node.optional("sharding")? {
        Some(plan) => Some(coerce_sharding(&plan, &chunk_shape)?),
        None => None,
    };

    Ok(ZarrArrayDescriptor {
        path,
        shape,
        chunk_shape,
        data_type,
        sharding,
    })
}

fn coerce_sharding(node: &Node<'_>, chunk_shape: &[usize]) -> Validated<ShardingPlan> {
    node.object()?;
    let enabled = node.field("enabled")?.bool()?;
    let target_shard_bytes = node.field("targetShardBytes")?.positive_int()?;
    let shard_node = node.field("shardShape")?;
    let shard_shape = shard_node.positive_tuple(chunk_shape.len())?;
    for (axis, (&shard, &chunk)) in shard_shape.iter().zip(chunk_shape).enumerate() {
        if shard % chunk != 0 {
            return Err(ValidationError::new(
                format!("{}[{}]", shard_node.path, axis),
                format!("{} is not a multiple of chunk size {}", shard, chunk),
            ));
        }
    }
    let estimated_shard_bytes = node.field("estimatedShardBytes")?.non_negative_int()?;
    let reason = match node.optional("reason")? {
        Some(reason) => Some(reason.str()?.to_string()),
        None => None,
    };
    Ok(ShardingPlan {
        enabled,
        target_shard_bytes,
        shard_shape,
        estimated_shard_bytes,
        reason,
    })
}

fn is_sha256_hex(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

fn coerce_volume_entry(node: &Node<'_>, layer: &LayerManifest) -> Validated<VolumeEntry> {
    node.object()?;
    let timepoint_node = node.field("timepoint")?;
    let timepoint = timepoint_node.non_negative_int()?;
    if timepoint >= layer.volume_count {
        return timepoint_node.fail(format!(
            "{} is outside the layer's {} timepoints",
            timepoint, layer.volume_count
        ));
    }

    let min = node.field("min")?.finite_number()?;
    let max_node = node.field("max")?;
    let max = max_node.finite_number()?;
    if min >= max {
        return max_node.fail(format!("must exceed min ({})", min));
    }

    let length_node = node.field("byteLength")?;
    let byte_length = length_node.non_negative_int()?;
    if byte_length != layer.volume_byte_length() {
        return length_node.fail(format!(
            "is {}, expected {}",
            byte_length,
            layer.volume_byte_length()
        ));
    }

    let digest_node = node.field("sha256")?;
    let sha256 = digest_node.str()?;
    if !is_sha256_hex(sha256) {
        return digest_node.fail("must be a 64 character hex SHA-256 digest");
    }

    let labels_byte_length = node.optional("labelsByteLength")?;
    let labels_sha256 = node.optional("labelsSha256")?;
    let (labels_byte_length, labels_sha256) = match (layer.is_segmentation, labels_byte_length, labels_sha256) {
        (true, Some(len_node), Some(sha_node)) => {
            let len = len_node.non_negative_int()?;
            if len != layer.labels_byte_length() {
                return len_node.fail(format!(
                    "is {}, expected {}",
                    len,
                    layer.labels_byte_length()
                ));
            }
            let sha = sha_node.str()?;
            if !is_sha256_hex(sha) {
                return sha_node.fail("must be a 64 character hex SHA-256 digest");
            }
            (Some(len), Some(sha.to_string()))
        }
        (true, _, _) => {
            return node.fail("segmentation volumes require labelsByteLength and labelsSha256");
        }
        (false, None, None) => (None, None),
        (false, _, _) => return node.fail("labels digests are only allowed on segmentation layers"),
    };

    Ok(VolumeEntry {
        timepoint: timepoint as usize,
        min,
        max,
        byte_length,
        sha256: sha256.to_string(),
        labels_byte_length,
        labels_sha256,
    })
}

fn coerce_track_set(node: &Node<'_>, channel_ids: &HashSet<String>) -> Validated<TrackSetManifest> {
    node.object()?;
    let id = node.field("id")?.non_empty_str()?.to_string();
    let name = node.field("name")?.str()?.to_string();
    let channel_id = match node.optional("channelId")? {
        Some(channel_node) => {
            let channel = channel_node.str()?;
            if !channel_ids.contains(channel) {
                return channel_node.fail(format!("unknown channel '{}'", channel));
            }
            Some(channel.to_string())
        }
        None => None,
    };
    let path = node.field("path")?.non_empty_str()?.to_string();
    let row_count_node = node.field("rowCount")?;
    let row_count = usize::try_from(row_count_node.non_negative_int()?)
        .or_else(|_| row_count_node.fail("is too large"))?;
    Ok(TrackSetManifest {
        id,
        name,
        channel_id,
        path,
        row_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn descriptor(path: &str, shape: Vec<usize>, chunk: Vec<usize>, dt: &str) -> Value {
        json!({ "path": path, "shape": shape, "chunkShape": chunk, "dataType": dt })
    }

    fn scale(level: usize, w: usize, h: usize, d: usize, count: usize, seg: bool) -> Value {
        let base = format!("zarr/layer/scale{}", level);
        let factor = 1usize << level;
        let mut arrays = json!({
            "data": descriptor(&format!("{base}/data"), vec![count, d, h, w, if seg { 4 } else { 1 }], vec![1, d, h, w, if seg { 4 } else { 1 }], "uint8"),
            "chunkStats": {
                "min": descriptor(&format!("{base}/chunk_min"), vec![count, 1, 1, 1], vec![1, 1, 1, 1], "uint8"),
                "max": descriptor(&format!("{base}/chunk_max"), vec![count, 1, 1, 1], vec![1, 1, 1, 1], "uint8"),
                "occupancy": descriptor(&format!("{base}/chunk_occupancy"), vec![count, 1, 1, 1], vec![1, 1, 1, 1], "float32"),
            },
            "histogram": descriptor(&format!("{base}/histogram"), vec![count, 256], vec![1, 256], "uint32"),
        });
        if seg {
            arrays["labels"] = descriptor(&format!("{base}/labels"), vec![count, d, h, w], vec![1, d, h, w], "uint32");
        }
        json!({
            "level": level,
            "downsampleFactor": [factor, 1, 1],
            "width": w,
            "height": h,
            "depth": d,
            "channels": if seg { 4 } else { 1 },
            "zarr": arrays,
        })
    }

    fn valid_manifest() -> Value {
        json!({
            "format": MANIFEST_FORMAT,
            "generatedAt": "2026-01-01T00:00:00.000Z",
            "dataset": {
                "movieMode": "3d",
                "totalVolumeCount": 2,
                "channels": [{
                    "id": "ch0",
                    "name": "Nuclei",
                    "layers": [{
                        "key": "layer",
                        "label": "Nuclei",
                        "channelId": "ch0",
                        "isSegmentation": false,
                        "volumeCount": 2,
                        "width": 2,
                        "height": 1,
                        "depth": 1,
                        "channels": 1,
                        "dataType": "uint16",
                        "normalization": { "min": 0.0, "max": 10.0 },
                        "zarr": { "scales": [scale(0, 2, 1, 1, 2, false), scale(1, 1, 1, 1, 2, false)] },
                    }],
                }],
                "trackSets": [],
            },
        })
    }

    fn error_of(value: &Value) -> ValidationError {
        coerce_manifest(value).unwrap_err()
    }

    #[test]
    fn test_valid_manifest_round_trips() {
        let manifest = coerce_manifest(&valid_manifest()).unwrap();
        assert_eq!(manifest.dataset.total_volume_count, 2);
        let layer = manifest.find_layer("layer").unwrap();
        assert_eq!(layer.zarr.scales.len(), 2);
        assert_eq!(layer.zarr.scales[1].downsample_factor, [2, 1, 1]);

        // The typed form validates again after serialization
        validate_manifest(&manifest).unwrap();

        let bytes = serde_json::to_vec(&valid_manifest()).unwrap();
        assert_eq!(parse_manifest(&bytes).unwrap(), manifest);
        assert!(matches!(parse_manifest(b"{"), Err(VoxError::Serialization(_))));
    }

    #[test]
    fn test_rejects_wrong_format() {
        let mut value = valid_manifest();
        value["format"] = json!("something-else");
        assert_eq!(error_of(&value).path, "manifest.format");

        value["format"] = json!(LEGACY_MANIFEST_FORMATS[0]);
        assert!(error_of(&value).message.contains("legacy"));
    }

    #[test]
    fn test_rejects_bad_timestamp() {
        let mut value = valid_manifest();
        value["generatedAt"] = json!("yesterday");
        assert_eq!(error_of(&value).path, "manifest.generatedAt");
    }

    #[test]
    fn test_rejects_volume_count_mismatch() {
        let mut value = valid_manifest();
        value["dataset"]["totalVolumeCount"] = json!(3);
        let err = error_of(&value);
        assert_eq!(err.path, "manifest.dataset.totalVolumeCount");

        value["dataset"]["totalVolumeCount"] = json!(0);
        assert!(error_of(&value).message.contains("positive"));
    }

    #[test]
    fn test_rejects_skipped_level() {
        let mut value = valid_manifest();
        value["dataset"]["channels"][0]["layers"][0]["zarr"]["scales"][1]["level"] = json!(2);
        let err = error_of(&value);
        assert_eq!(
            err.path,
            "manifest.dataset.channels[0].layers[0].zarr.scales[1].level"
        );
    }

    #[test]
    fn test_rejects_inconsistent_downsample_factor() {
        let path = "manifest.dataset.channels[0].layers[0].zarr.scales[1].downsampleFactor";
        let mut value = valid_manifest();
        value["dataset"]["channels"][0]["layers"][0]["zarr"]["scales"][1]["downsampleFactor"] = json!([7, 7, 7]);
        assert_eq!(error_of(&value).path, path);

        // Only x halved, so y and z keep their factor
        value["dataset"]["channels"][0]["layers"][0]["zarr"]["scales"][1]["downsampleFactor"] = json!([2, 2, 1]);
        assert_eq!(error_of(&value).path, path);

        value["dataset"]["channels"][0]["layers"][0]["zarr"]["scales"][0]["downsampleFactor"] = json!([2, 1, 1]);
        assert_eq!(
            error_of(&value).path,
            "manifest.dataset.channels[0].layers[0].zarr.scales[0].downsampleFactor"
        );
    }

    #[test]
    fn test_rejects_level0_dimension_mismatch() {
        let mut value = valid_manifest();
        value["dataset"]["channels"][0]["layers"][0]["width"] = json!(3);
        let err = error_of(&value);
        assert_eq!(err.path, "manifest.dataset.channels[0].layers[0].zarr.scales[0]");
    }

    #[test]
    fn test_rejects_duplicate_layer_keys() {
        let mut value = valid_manifest();
        let channel = value["dataset"]["channels"][0].clone();
        let mut second = channel.clone();
        second["id"] = json!("ch1");
        second["layers"][0]["channelId"] = json!("ch1");
        value["dataset"]["channels"] = json!([channel, second]);
        value["dataset"]["totalVolumeCount"] = json!(4);
        let err = error_of(&value);
        assert_eq!(err.path, "manifest.dataset.channels[1].layers[0].key");
    }

    #[test]
    fn test_rejects_bad_chunk_stats_shape() {
        let mut value = valid_manifest();
        value["dataset"]["channels"][0]["layers"][0]["zarr"]["scales"][0]["zarr"]["chunkStats"]["max"]["shape"] =
            json!([2, 1, 1, 2]);
        let err = error_of(&value);
        assert_eq!(
            err.path,
            "manifest.dataset.channels[0].layers[0].zarr.scales[0].zarr.chunkStats.max.shape"
        );
    }

    #[test]
    fn test_rejects_indivisible_shard_shape() {
        let mut value = valid_manifest();
        let data = &mut value["dataset"]["channels"][0]["layers"][0]["zarr"]["scales"][0]["zarr"]["data"];
        data["chunkShape"] = json!([1, 1, 1, 2, 1]);
        data["sharding"] = json!({
            "enabled": true,
            "targetShardBytes": 1024,
            "shardShape": [1, 1, 1, 3, 1],
            "estimatedShardBytes": 6,
        });
        let err = error_of(&value);
        assert!(err.path.ends_with("zarr.data.sharding.shardShape[3]"), "{}", err.path);
    }

    #[test]
    fn test_segmentation_requires_labels() {
        let mut value = valid_manifest();
        let layer = &mut value["dataset"]["channels"][0]["layers"][0];
        layer["isSegmentation"] = json!(true);
        layer["channels"] = json!(4);
        layer["normalization"] = Value::Null;
        layer["zarr"]["scales"] = json!([scale(0, 2, 1, 1, 2, true), scale(1, 1, 1, 1, 2, true)]);
        coerce_manifest(&value).unwrap();

        let layer = &mut value["dataset"]["channels"][0]["layers"][0];
        layer["zarr"]["scales"][1]["zarr"]
            .as_object_mut()
            .unwrap()
            .remove("labels");
        let err = error_of(&value);
        assert_eq!(
            err.path,
            "manifest.dataset.channels[0].layers[0].zarr.scales[1].zarr.labels"
        );
    }

    #[test]
    fn test_rejects_degenerate_normalization() {
        let mut value = valid_manifest();
        value["dataset"]["channels"][0]["layers"][0]["normalization"] = json!({ "min": 4.0, "max": 4.0 });
        let err = error_of(&value);
        assert_eq!(
            err.path,
            "manifest.dataset.channels[0].layers[0].normalization.max"
        );
    }

    #[test]
    fn test_volume_entries() {
        let mut value = valid_manifest();
        let digest = "ab".repeat(32);
        value["dataset"]["channels"][0]["layers"][0]["volumes"] = json!([
            { "timepoint": 0, "min": 0.0, "max": 1.0, "byteLength": 2, "sha256": digest },
        ]);
        let manifest = coerce_manifest(&value).unwrap();
        assert_eq!(manifest.layers().next().unwrap().volumes.len(), 1);

        value["dataset"]["channels"][0]["layers"][0]["volumes"][0]["sha256"] = json!("xyz");
        let err = error_of(&value);
        assert_eq!(
            err.path,
            "manifest.dataset.channels[0].layers[0].volumes[0].sha256"
        );

        value["dataset"]["channels"][0]["layers"][0]["volumes"][0]["sha256"] = json!(digest);
        value["dataset"]["channels"][0]["layers"][0]["volumes"][0]["timepoint"] = json!(2);
        assert!(error_of(&value).path.ends_with("volumes[0].timepoint"));
    }

    #[test]
    fn test_track_set_channel_must_exist() {
        let mut value = valid_manifest();
        value["dataset"]["trackSets"] = json!([
            { "id": "t", "name": "Tracks", "channelId": "nope", "path": "tracks/t.csv", "rowCount": 0 }
        ]);
        assert_eq!(error_of(&value).path, "manifest.dataset.trackSets[0].channelId");
    }

    #[test]
    fn test_missing_field_path() {
        let mut value = valid_manifest();
        value["dataset"]["channels"][0]["layers"][0]
            .as_object_mut()
            .unwrap()
            .remove("dataType");
        let err = error_of(&value);
        assert_eq!(err.path, "manifest.dataset.channels[0].layers[0].dataType");
        assert_eq!(err.message, "is required");
    }
}
