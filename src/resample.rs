//! Anisotropy correction: rescale a volume per axis so voxel spacing becomes isotropic.

use crate::error::{Result, VoxError};
use crate::types::{AxisScale, Dims3};
use crate::volume::{dispatch_map, VolumePayload, VoxelElement};
use ndarray::ArrayView4;
use std::collections::HashMap;
use std::sync::Arc;

/// Factors within this distance of 1 count as identity
pub const IDENTITY_EPSILON: f64 = 1e-4;

/// Per-axis output/input length ratios, each >= 1
pub type AnisotropyScaleFactors = AxisScale;

/// Interpolation used when resampling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResampleMode {
    #[default]
    Trilinear,
    /// Used for label volumes, where blending ids is meaningless
    Nearest,
}

/// Scale factors that make `spacing` isotropic, or `None` when no correction applies.
///
/// Returns `None` if correction is disabled, any spacing is non-positive or
/// non-finite, or every factor is within [`IDENTITY_EPSILON`] of 1.
pub fn compute_anisotropy_scale(
    correction_enabled: bool,
    spacing: AxisScale,
) -> Option<AnisotropyScaleFactors> {
    if !correction_enabled {
        return None;
    }
    let axes = [spacing.x, spacing.y, spacing.z];
    if axes.iter().any(|s| !s.is_finite() || *s <= 0.0) {
        return None;
    }
    let min = axes.iter().copied().fold(f64::INFINITY, f64::min);
    let scale = AxisScale::new(spacing.x / min, spacing.y / min, spacing.z / min);
    let is_identity = [scale.x, scale.y, scale.z]
        .iter()
        .all(|f| (f - 1.0).abs() <= IDENTITY_EPSILON);
    if is_identity {
        None
    } else {
        Some(scale)
    }
}

fn scaled_length(length: usize, factor: f64) -> usize {
    ((length as f64 * factor).round() as usize).max(1)
}

/// Output dimensions for `dims` under `scale`
pub fn resampled_dims(dims: Dims3, scale: AnisotropyScaleFactors) -> Dims3 {
    Dims3::new(
        scaled_length(dims.width, scale.x),
        scaled_length(dims.height, scale.y),
        scaled_length(dims.depth, scale.z),
    )
}

/// Where one output index reads from along one axis
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisSample {
    pub index0: usize,
    pub index1: usize,
    pub weight: f64,
    pub nearest: usize,
}

/// Linear ramp from output indices onto `[0, source_size - 1]`
pub fn build_axis_samples(source_size: usize, target_size: usize) -> Vec<AxisSample> {
    let source_max = source_size.saturating_sub(1);
    if target_size <= 1 || source_max == 0 {
        return vec![
            AxisSample {
                index0: 0,
                index1: 0,
                weight: 0.0,
                nearest: 0,
            };
            target_size.max(1)
        ];
    }

    let step = source_max as f64 / (target_size - 1) as f64;
    (0..target_size)
        .map(|i| {
            let position = i as f64 * step;
            let index0 = (position.floor() as usize).min(source_max);
            let index1 = (index0 + 1).min(source_max);
            AxisSample {
                index0,
                index1,
                weight: position - index0 as f64,
                nearest: (position.round() as usize).min(source_max),
            }
        })
        .collect()
}

struct SampleTables {
    x: Vec<AxisSample>,
    y: Vec<AxisSample>,
    z: Vec<AxisSample>,
}

fn resample_typed<T: VoxelElement>(
    source: &[T],
    dims: Dims3,
    channels: usize,
    tables: &SampleTables,
    mode: ResampleMode,
) -> Result<Vec<T>> {
    let view = ArrayView4::from_shape((dims.depth, dims.height, dims.width, channels), source)
        .map_err(|e| VoxError::InvalidDimensions(e.to_string()))?;
    let mut out = Vec::with_capacity(tables.x.len() * tables.y.len() * tables.z.len() * channels);

    for sz in &tables.z {
        for sy in &tables.y {
            for sx in &tables.x {
                for c in 0..channels {
                    let value = match mode {
                        ResampleMode::Nearest => view[[sz.nearest, sy.nearest, sx.nearest, c]],
                        ResampleMode::Trilinear => {
                            let at = |z: usize, y: usize, x: usize| view[[z, y, x, c]].as_f64();
                            let (wx, wy, wz) = (sx.weight, sy.weight, sz.weight);
                            let c00 = at(sz.index0, sy.index0, sx.index0) * (1.0 - wx)
                                + at(sz.index0, sy.index0, sx.index1) * wx;
                            let c01 = at(sz.index0, sy.index1, sx.index0) * (1.0 - wx)
                                + at(sz.index0, sy.index1, sx.index1) * wx;
                            let c10 = at(sz.index1, sy.index0, sx.index0) * (1.0 - wx)
                                + at(sz.index1, sy.index0, sx.index1) * wx;
                            let c11 = at(sz.index1, sy.index1, sx.index0) * (1.0 - wx)
                                + at(sz.index1, sy.index1, sx.index1) * wx;
                            let c0 = c00 * (1.0 - wy) + c01 * wy;
                            let c1 = c10 * (1.0 - wy) + c11 * wy;
                            T::from_f64(c0 * (1.0 - wz) + c1 * wz)
                        }
                    };
                    out.push(value);
                }
            }
        }
    }
    Ok(out)
}

/// Resample `payload` by `scale`, recomputing min/max from the output.
///
/// The channel count is preserved. Identity output dimensions return a copy.
pub fn resample_volume(
    payload: &VolumePayload,
    scale: AnisotropyScaleFactors,
    mode: ResampleMode,
) -> Result<VolumePayload> {
    let source = payload.dims();
    let target = resampled_dims(source, scale);
    if target == source {
        return Ok(payload.clone());
    }

    let tables = SampleTables {
        x: build_axis_samples(source.width, target.width),
        y: build_axis_samples(source.height, target.height),
        z: build_axis_samples(source.depth, target.depth),
    };
    let data = dispatch_map!(&payload.data, v => resample_typed(v, source, payload.channels, &tables, mode)?);

    tracing::debug!(
        from = %source,
        to = %target,
        ?mode,
        "resampled volume"
    );
    VolumePayload::new(
        target.width,
        target.height,
        target.depth,
        payload.channels,
        data,
    )
}

/// Resampled volumes owned by their creator, keyed by layer key and timepoint.
///
/// Entries live until [`ResampleCache::invalidate`] or [`ResampleCache::clear`];
/// a lookup with a different scale or mode replaces the entry.
#[derive(Debug, Default)]
pub struct ResampleCache {
    entries: HashMap<(String, usize), CachedVolume>,
}

#[derive(Debug)]
struct CachedVolume {
    scale: AnisotropyScaleFactors,
    mode: ResampleMode,
    volume: Arc<VolumePayload>,
}

impl ResampleCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, layer_key: &str, timepoint: usize) -> Option<Arc<VolumePayload>> {
        self.entries
            .get(&(layer_key.to_string(), timepoint))
            .map(|entry| Arc::clone(&entry.volume))
    }

    pub fn get_or_resample(
        &mut self,
        layer_key: &str,
        timepoint: usize,
        payload: &VolumePayload,
        scale: AnisotropyScaleFactors,
        mode: ResampleMode,
    ) -> Result<Arc<VolumePayload>> {
        let key = (layer_key.to_string(), timepoint);
        if let Some(entry) = self.entries.get(&key) {
            if entry.scale == scale && entry.mode == mode {
                return Ok(Arc::clone(&entry.volume));
            }
        }
        let volume = Arc::new(resample_volume(payload, scale, mode)?);
        self.entries.insert(
            key,
            CachedVolume {
                scale,
                mode,
                volume: Arc::clone(&volume),
            },
        );
        Ok(volume)
    }

    pub fn invalidate(&mut self, layer_key: &str, timepoint: usize) -> bool {
        self.entries
            .remove(&(layer_key.to_string(), timepoint))
            .is_some()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::VolumeBuffer;

    #[test]
    fn test_scale_none_when_disabled_or_invalid() {
        let spacing = AxisScale::new(1.0, 1.0, 4.0);
        assert!(compute_anisotropy_scale(false, spacing).is_none());
        assert!(compute_anisotropy_scale(true, AxisScale::new(1.0, 0.0, 2.0)).is_none());
        assert!(compute_anisotropy_scale(true, AxisScale::new(1.0, f64::NAN, 2.0)).is_none());
        assert!(compute_anisotropy_scale(true, AxisScale::new(-1.0, 1.0, 2.0)).is_none());
    }

    #[test]
    fn test_scale_none_within_epsilon() {
        let spacing = AxisScale::new(0.5, 0.50004, 0.50002);
        assert!(compute_anisotropy_scale(true, spacing).is_none());
    }

    #[test]
    fn test_scale_relative_to_min_spacing() {
        let scale = compute_anisotropy_scale(true, AxisScale::new(0.5, 0.5, 2.0)).unwrap();
        assert_eq!(scale, AxisScale::new(1.0, 1.0, 4.0));
    }

    #[test]
    fn test_axis_samples() {
        let samples = build_axis_samples(3, 5);
        assert_eq!(samples.len(), 5);
        assert_eq!(samples[0].index0, 0);
        assert_eq!(samples[1].weight, 0.5);
        assert_eq!(samples[1].nearest, 1);
        assert_eq!(samples[4].index0, 2);
        assert_eq!(samples[4].index1, 2);

        for sample in build_axis_samples(1, 4) {
            assert_eq!((sample.index0, sample.weight), (0, 0.0));
        }
        assert_eq!(build_axis_samples(5, 1)[0].nearest, 0);
    }

    #[test]
    fn test_identity_resample_is_noop() {
        let payload =
            VolumePayload::new(2, 2, 1, 1, VolumeBuffer::Float32(vec![1.5, 2.5, 3.5, 4.5]))
                .unwrap();
        let out = resample_volume(&payload, AxisScale::IDENTITY, ResampleMode::Trilinear).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn test_trilinear_z_stretch() {
        let payload =
            VolumePayload::new(1, 1, 2, 1, VolumeBuffer::Uint8(vec![0, 100])).unwrap();
        let out = resample_volume(
            &payload,
            AxisScale::new(1.0, 1.0, 1.5),
            ResampleMode::Trilinear,
        )
        .unwrap();
        assert_eq!(out.depth, 3);
        assert_eq!(out.data, VolumeBuffer::Uint8(vec![0, 50, 100]));
        assert_eq!((out.min, out.max), (0.0, 100.0));
    }

    #[test]
    fn test_nearest_preserves_labels_and_channels() {
        let payload = VolumePayload::new(
            2,
            1,
            1,
            2,
            VolumeBuffer::Uint32(vec![7, 70, 9, 90]),
        )
        .unwrap();
        let out =
            resample_volume(&payload, AxisScale::new(2.0, 1.0, 1.0), ResampleMode::Nearest)
                .unwrap();
        assert_eq!(out.width, 4);
        assert_eq!(out.channels, 2);
        // positions 0, 1/3, 2/3, 1 round to 0, 0, 1, 1
        assert_eq!(
            out.data,
            VolumeBuffer::Uint32(vec![7, 70, 7, 70, 9, 90, 9, 90])
        );
    }

    #[test]
    fn test_cache_reuses_until_invalidated() {
        let payload = VolumePayload::new(1, 1, 2, 1, VolumeBuffer::Uint8(vec![0, 100])).unwrap();
        let scale = AxisScale::new(1.0, 1.0, 2.0);
        let mut cache = ResampleCache::new();

        let first = cache
            .get_or_resample("a", 0, &payload, scale, ResampleMode::Trilinear)
            .unwrap();
        let second = cache
            .get_or_resample("a", 0, &payload, scale, ResampleMode::Trilinear)
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);

        assert!(cache.invalidate("a", 0));
        assert!(cache.get("a", 0).is_none());
        assert!(cache.is_empty());
    }
}
