//! Volume data model: typed voxel buffers, 8-bit normalization and
//! segmentation colorization.
//!
//! Buffers are dense and row-major with channels innermost, i.e. the element
//! for voxel `(x, y, z)` and channel `c` lives at
//! `((z * height + y) * width + x) * channels + c`.

use crate::error::{Result, VoxError};
use crate::types::{Dims3, ValueRange, VolumeDataType};
use crate::utils::{fnv1a_32, u32s_to_le_bytes};
use ndarray::ArrayView4;
use num_traits::{ToPrimitive, Zero};

/// Number of bins in a per-timepoint histogram
pub const HISTOGRAM_BINS: usize = 256;

/// Channel count of a colorized segmentation volume (RGBA)
pub const SEGMENTATION_CHANNELS: usize = 4;

const SEED_MIX: u32 = 0x9e37_79b1;
const SEED_SENTINEL: u32 = 0xdead_beef;

/// Element types storable in a [`VolumeBuffer`]
pub trait VoxelElement: Copy + Send + Sync + PartialOrd + ToPrimitive + Zero + 'static {
    const DATA_TYPE: VolumeDataType;
    const SIZE: usize;

    fn as_f64(self) -> f64 {
        ToPrimitive::to_f64(&self).unwrap_or(f64::NAN)
    }

    /// Convert back from `f64`, rounding integers and saturating at the type bounds
    fn from_f64(value: f64) -> Self;

    fn read_le(bytes: &[u8]) -> Self;

    fn write_le(self, out: &mut Vec<u8>);
}

macro_rules! impl_voxel_element {
    ($t:ty, $dt:expr, $size:expr, $round:expr) => {
        impl VoxelElement for $t {
            const DATA_TYPE: VolumeDataType = $dt;
            const SIZE: usize = $size;

            fn from_f64(value: f64) -> Self {
                let value = if $round { value.round() } else { value };
                value as $t
            }

            fn read_le(bytes: &[u8]) -> Self {
                let mut raw = [0u8; $size];
                raw.copy_from_slice(&bytes[..$size]);
                <$t>::from_le_bytes(raw)
            }

            fn write_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }
        }
    };
}

impl_voxel_element!(u8, VolumeDataType::Uint8, 1, true);
impl_voxel_element!(i8, VolumeDataType::Int8, 1, true);
impl_voxel_element!(u16, VolumeDataType::Uint16, 2, true);
impl_voxel_element!(i16, VolumeDataType::Int16, 2, true);
impl_voxel_element!(u32, VolumeDataType::Uint32, 4, true);
impl_voxel_element!(i32, VolumeDataType::Int32, 4, true);
impl_voxel_element!(f32, VolumeDataType::Float32, 4, false);
impl_voxel_element!(f64, VolumeDataType::Float64, 8, false);

/// A dense buffer of one of the eight element kinds
#[derive(Debug, Clone, PartialEq)]
pub enum VolumeBuffer {
    Uint8(Vec<u8>),
    Int8(Vec<i8>),
    Uint16(Vec<u16>),
    Int16(Vec<i16>),
    Uint32(Vec<u32>),
    Int32(Vec<i32>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
}

/// Run `$body` with `$v` bound to the typed `Vec` inside a buffer.
macro_rules! dispatch {
    ($buf:expr, $v:ident => $body:expr) => {
        match $buf {
            $crate::volume::VolumeBuffer::Uint8($v) => $body,
            $crate::volume::VolumeBuffer::Int8($v) => $body,
            $crate::volume::VolumeBuffer::Uint16($v) => $body,
            $crate::volume::VolumeBuffer::Int16($v) => $body,
            $crate::volume::VolumeBuffer::Uint32($v) => $body,
            $crate::volume::VolumeBuffer::Int32($v) => $body,
            $crate::volume::VolumeBuffer::Float32($v) => $body,
            $crate::volume::VolumeBuffer::Float64($v) => $body,
        }
    };
}

/// Like `dispatch!`, rewrapping the `Vec` produced by `$body` in the same variant.
macro_rules! dispatch_map {
    ($buf:expr, $v:ident => $body:expr) => {
        match $buf {
            $crate::volume::VolumeBuffer::Uint8($v) => $crate::volume::VolumeBuffer::Uint8($body),
            $crate::volume::VolumeBuffer::Int8($v) => $crate::volume::VolumeBuffer::Int8($body),
            $crate::volume::VolumeBuffer::Uint16($v) => $crate::volume::VolumeBuffer::Uint16($body),
            $crate::volume::VolumeBuffer::Int16($v) => $crate::volume::VolumeBuffer::Int16($body),
            $crate::volume::VolumeBuffer::Uint32($v) => $crate::volume::VolumeBuffer::Uint32($body),
            $crate::volume::VolumeBuffer::Int32($v) => $crate::volume::VolumeBuffer::Int32($body),
            $crate::volume::VolumeBuffer::Float32($v) => $crate::volume::VolumeBuffer::Float32($body),
            $crate::volume::VolumeBuffer::Float64($v) => $crate::volume::VolumeBuffer::Float64($body),
        }
    };
}

pub(crate) use dispatch;
pub(crate) use dispatch_map;

fn decode_le<T: VoxelElement>(bytes: &[u8]) -> Vec<T> {
    bytes.chunks_exact(T::SIZE).map(T::read_le).collect()
}

fn encode_le<T: VoxelElement>(values: &[T]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * T::SIZE);
    for &v in values {
        v.write_le(&mut out);
    }
    out
}

fn finite_min_max<T: VoxelElement>(values: &[T]) -> Option<ValueRange> {
    let mut range: Option<(f64, f64)> = None;
    for &v in values {
        let v = v.as_f64();
        if !v.is_finite() {
            continue;
        }
        range = Some(match range {
            None => (v, v),
            Some((lo, hi)) => (lo.min(v), hi.max(v)),
        });
    }
    range.map(|(lo, hi)| ValueRange::corrected(lo, hi))
}

impl VolumeBuffer {
    /// A zero-filled buffer
    pub fn zeros(data_type: VolumeDataType, len: usize) -> Self {
        match data_type {
            VolumeDataType::Uint8 => VolumeBuffer::Uint8(vec![0; len]),
            VolumeDataType::Int8 => VolumeBuffer::Int8(vec![0; len]),
            VolumeDataType::Uint16 => VolumeBuffer::Uint16(vec![0; len]),
            VolumeDataType::Int16 => VolumeBuffer::Int16(vec![0; len]),
            VolumeDataType::Uint32 => VolumeBuffer::Uint32(vec![0; len]),
            VolumeDataType::Int32 => VolumeBuffer::Int32(vec![0; len]),
            VolumeDataType::Float32 => VolumeBuffer::Float32(vec![0.0; len]),
            VolumeDataType::Float64 => VolumeBuffer::Float64(vec![0.0; len]),
        }
    }

    /// Decode little-endian bytes
    pub fn from_le_bytes(data_type: VolumeDataType, bytes: &[u8]) -> Result<Self> {
        if bytes.len() % data_type.size_in_bytes() != 0 {
            return Err(VoxError::InvalidDimensions(format!(
                "{} bytes is not a whole number of {} elements",
                bytes.len(),
                data_type
            )));
        }
        Ok(match data_type {
            VolumeDataType::Uint8 => VolumeBuffer::Uint8(bytes.to_vec()),
            VolumeDataType::Int8 => VolumeBuffer::Int8(decode_le(bytes)),
            VolumeDataType::Uint16 => VolumeBuffer::Uint16(decode_le(bytes)),
            VolumeDataType::Int16 => VolumeBuffer::Int16(decode_le(bytes)),
            VolumeDataType::Uint32 => VolumeBuffer::Uint32(decode_le(bytes)),
            VolumeDataType::Int32 => VolumeBuffer::Int32(decode_le(bytes)),
            VolumeDataType::Float32 => VolumeBuffer::Float32(decode_le(bytes)),
            VolumeDataType::Float64 => VolumeBuffer::Float64(decode_le(bytes)),
        })
    }

    pub fn to_le_bytes(&self) -> Vec<u8> {
        dispatch!(self, v => encode_le(v))
    }

    pub fn data_type(&self) -> VolumeDataType {
        match self {
            VolumeBuffer::Uint8(_) => VolumeDataType::Uint8,
            VolumeBuffer::Int8(_) => VolumeDataType::Int8,
            VolumeBuffer::Uint16(_) => VolumeDataType::Uint16,
            VolumeBuffer::Int16(_) => VolumeDataType::Int16,
            VolumeBuffer::Uint32(_) => VolumeDataType::Uint32,
            VolumeBuffer::Int32(_) => VolumeDataType::Int32,
            VolumeBuffer::Float32(_) => VolumeDataType::Float32,
            VolumeBuffer::Float64(_) => VolumeDataType::Float64,
        }
    }

    pub fn len(&self) -> usize {
        dispatch!(self, v => v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get_f64(&self, index: usize) -> f64 {
        dispatch!(self, v => v[index].as_f64())
    }

    /// Observed finite range, widened when degenerate; `None` for an empty
    /// or all-non-finite buffer
    pub fn min_max(&self) -> Option<ValueRange> {
        dispatch!(self, v => finite_min_max(v))
    }

    /// Copy of the elements in `range`
    pub fn slice(&self, range: std::ops::Range<usize>) -> Self {
        dispatch_map!(self, v => v[range.clone()].to_vec())
    }

    /// Values of `channel` as `f64`, one per voxel
    pub fn channel_values(&self, channels: usize, channel: usize) -> Vec<f64> {
        dispatch!(self, v => v
            .iter()
            .skip(channel)
            .step_by(channels.max(1))
            .map(|x| x.as_f64())
            .collect())
    }
}

/// A decoded volume as produced by a volume loader
#[derive(Debug, Clone, PartialEq)]
pub struct VolumePayload {
    pub width: usize,
    pub height: usize,
    pub depth: usize,
    pub channels: usize,
    pub data: VolumeBuffer,
    pub min: f64,
    pub max: f64,
}

impl VolumePayload {
    /// Wrap a buffer, deriving `min`/`max` from its contents.
    pub fn new(
        width: usize,
        height: usize,
        depth: usize,
        channels: usize,
        data: VolumeBuffer,
    ) -> Result<Self> {
        let expected = width * height * depth * channels;
        if width == 0 || height == 0 || depth == 0 || channels == 0 {
            return Err(VoxError::InvalidDimensions(format!(
                "volume dimensions must be positive, got {}x{}x{}x{}",
                width, height, depth, channels
            )));
        }
        if data.len() != expected {
            return Err(VoxError::InvalidDimensions(format!(
                "expected {} elements for {}x{}x{}x{}, got {}",
                expected,
                width,
                height,
                depth,
                channels,
                data.len()
            )));
        }
        let range = data.min_max().unwrap_or(ValueRange::new(0.0, 1.0));
        Ok(Self {
            width,
            height,
            depth,
            channels,
            data,
            min: range.min,
            max: range.max,
        })
    }

    pub fn data_type(&self) -> VolumeDataType {
        self.data.data_type()
    }

    pub fn dims(&self) -> Dims3 {
        Dims3::new(self.width, self.height, self.depth)
    }

    pub fn range(&self) -> ValueRange {
        ValueRange::new(self.min, self.max)
    }

    pub fn byte_length(&self) -> u64 {
        (self.data.len() * self.data_type().size_in_bytes()) as u64
    }

    /// Fail with a resource error when the buffer exceeds `ceiling_bytes`.
    pub fn ensure_within_ceiling(&self, ceiling_bytes: u64) -> Result<()> {
        ensure_volume_within_ceiling(
            self.dims(),
            self.channels,
            self.data_type(),
            ceiling_bytes,
        )
    }

    /// One z-slice as a depth-1 volume with its own min/max.
    pub fn extract_z_slice(&self, z: usize) -> Result<Self> {
        if z >= self.depth {
            return Err(VoxError::OutOfBounds(format!(
                "slice {} of a volume with depth {}",
                z, self.depth
            )));
        }
        let plane = self.width * self.height * self.channels;
        let data = self.data.slice(z * plane..(z + 1) * plane);
        Self::new(self.width, self.height, 1, self.channels, data)
    }
}

/// Check the byte footprint of a prospective volume against a hard ceiling.
pub fn ensure_volume_within_ceiling(
    dims: Dims3,
    channels: usize,
    data_type: VolumeDataType,
    ceiling_bytes: u64,
) -> Result<()> {
    let required = (dims.voxel_count() as u64)
        .saturating_mul(channels as u64)
        .saturating_mul(data_type.size_in_bytes() as u64);
    if required > ceiling_bytes {
        return Err(VoxError::VolumeTooLarge {
            required_bytes: required,
            ceiling_bytes,
            width: dims.width,
            height: dims.height,
            depth: dims.depth,
            channels,
        });
    }
    Ok(())
}

/// A volume normalized to 8 bits per channel.
///
/// `min`/`max` keep the source range so display values can be reconstructed
/// with [`NormalizedVolume::raw_value`].
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedVolume {
    pub width: usize,
    pub height: usize,
    pub depth: usize,
    pub channels: usize,
    /// Element type of the source the volume was normalized from
    pub data_type: VolumeDataType,
    pub min: f64,
    pub max: f64,
    pub normalized: Vec<u8>,
    /// One instance id per voxel, present on segmentation layers only
    pub segmentation_labels: Option<Vec<u32>>,
}

impl NormalizedVolume {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        width: usize,
        height: usize,
        depth: usize,
        channels: usize,
        data_type: VolumeDataType,
        range: ValueRange,
        normalized: Vec<u8>,
        segmentation_labels: Option<Vec<u32>>,
    ) -> Result<Self> {
        let voxels = width * height * depth;
        if voxels == 0 || channels == 0 {
            return Err(VoxError::InvalidDimensions(format!(
                "volume dimensions must be positive, got {}x{}x{}x{}",
                width, height, depth, channels
            )));
        }
        if normalized.len() != voxels * channels {
            return Err(VoxError::InvalidDimensions(format!(
                "expected {} normalized bytes, got {}",
                voxels * channels,
                normalized.len()
            )));
        }
        if let Some(labels) = &segmentation_labels {
            if labels.len() != voxels {
                return Err(VoxError::InvalidDimensions(format!(
                    "expected {} segmentation labels, got {}",
                    voxels,
                    labels.len()
                )));
            }
        }
        let range = ValueRange::corrected(range.min, range.max);
        Ok(Self {
            width,
            height,
            depth,
            channels,
            data_type,
            min: range.min,
            max: range.max,
            normalized,
            segmentation_labels,
        })
    }

    pub fn dims(&self) -> Dims3 {
        Dims3::new(self.width, self.height, self.depth)
    }

    pub fn range(&self) -> ValueRange {
        ValueRange::new(self.min, self.max)
    }

    pub fn voxel_count(&self) -> usize {
        self.width * self.height * self.depth
    }

    /// Reconstruct the source value of a normalized byte
    pub fn raw_value(&self, normalized: u8) -> f64 {
        self.min + (normalized as f64 / 255.0) * (self.max - self.min)
    }

    /// Labels as little-endian bytes, if present
    pub fn labels_le_bytes(&self) -> Option<Vec<u8>> {
        self.segmentation_labels
            .as_deref()
            .map(u32s_to_le_bytes)
    }

    /// `(depth, height, width, channels)` view of the normalized bytes
    pub fn view(&self) -> Result<ArrayView4<'_, u8>> {
        ArrayView4::from_shape(
            (self.depth, self.height, self.width, self.channels),
            &self.normalized,
        )
        .map_err(|e| VoxError::InvalidDimensions(e.to_string()))
    }
}

fn normalize_value(value: f64, range: ValueRange) -> u8 {
    if !value.is_finite() {
        return 0;
    }
    let span = range.span();
    let t = if span > 0.0 {
        ((value - range.min) / span).clamp(0.0, 1.0)
    } else {
        0.0
    };
    (t * 255.0).round() as u8
}

/// Map a payload into the 0-255 display range using `range`.
///
/// Values outside `range` saturate; the result carries `range` as its min/max.
pub fn normalize_volume(payload: &VolumePayload, range: ValueRange) -> Result<NormalizedVolume> {
    let range = ValueRange::corrected(range.min, range.max);
    let normalized = dispatch!(&payload.data, v => v
        .iter()
        .map(|x| normalize_value(x.as_f64(), range))
        .collect::<Vec<u8>>());
    NormalizedVolume::new(
        payload.width,
        payload.height,
        payload.depth,
        payload.channels,
        payload.data_type(),
        range,
        normalized,
        None,
    )
}

/// Deterministic colorization seed for one layer and timepoint.
///
/// Never zero: a zero mix is replaced by a fixed sentinel.
pub fn segmentation_seed(layer_key: &str, timepoint: usize) -> u32 {
    let mix = (timepoint as u32).wrapping_add(1).wrapping_mul(SEED_MIX);
    let seed = fnv1a_32(layer_key) ^ mix;
    if seed == 0 {
        SEED_SENTINEL
    } else {
        seed
    }
}

/// RGB color of a non-zero label under `seed`. Components stay in 48..=255.
pub fn label_color(label: u32, seed: u32) -> [u8; 3] {
    let mut x = label.wrapping_mul(SEED_MIX) ^ seed;
    x ^= x >> 16;
    x = x.wrapping_mul(0x85eb_ca6b);
    x ^= x >> 13;
    x = x.wrapping_mul(0xc2b2_ae35);
    x ^= x >> 16;
    let lift = |b: u32| (48 + (b & 0xff) * 207 / 255) as u8;
    [lift(x), lift(x >> 8), lift(x >> 16)]
}

/// Turn a label volume (instance ids in channel 0) into an RGBA volume that
/// also owns the per-voxel labels. Label 0 is transparent background.
pub fn colorize_segmentation(
    payload: &VolumePayload,
    layer_key: &str,
    timepoint: usize,
) -> Result<NormalizedVolume> {
    let seed = segmentation_seed(layer_key, timepoint);
    let labels: Vec<u32> = payload
        .data
        .channel_values(payload.channels, 0)
        .into_iter()
        .map(|v| if v.is_finite() && v > 0.0 { v.round() as u32 } else { 0 })
        .collect();

    let mut rgba = Vec::with_capacity(labels.len() * SEGMENTATION_CHANNELS);
    for &label in &labels {
        if label == 0 {
            rgba.extend_from_slice(&[0, 0, 0, 0]);
        } else {
            let [r, g, b] = label_color(label, seed);
            rgba.extend_from_slice(&[r, g, b, 255]);
        }
    }

    let max_label = labels.iter().copied().max().unwrap_or(0);
    NormalizedVolume::new(
        payload.width,
        payload.height,
        payload.depth,
        SEGMENTATION_CHANNELS,
        payload.data_type(),
        ValueRange::corrected(0.0, max_label as f64),
        rgba,
        Some(labels),
    )
}

/// Histogram of normalized bytes over [`HISTOGRAM_BINS`] bins
pub fn compute_histogram(normalized: &[u8]) -> Vec<u32> {
    let mut bins = vec![0u32; HISTOGRAM_BINS];
    for &v in normalized {
        let bin = v as usize * HISTOGRAM_BINS / 256;
        bins[bin] = bins[bin].saturating_add(1);
    }
    bins
}

/// Fraction of voxels with any non-zero channel
pub fn occupancy<T: VoxelElement>(values: &[T], channels: usize) -> f32 {
    let channels = channels.max(1);
    let voxels = values.len() / channels;
    if voxels == 0 {
        return 0.0;
    }
    let occupied = values
        .chunks(channels)
        .filter(|voxel| voxel.iter().any(|v| !v.is_zero()))
        .count();
    occupied as f32 / voxels as f32
}
