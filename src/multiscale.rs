//! Multiscale pyramid geometry and 2x downsampling between levels

use crate::error::{Result, VoxError};
use crate::types::Dims3;
use crate::volume::NormalizedVolume;
use ndarray::{ArrayView3, Axis};
use serde::{Deserialize, Serialize};

/// One level in the resolution pyramid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiscaleLevel {
    /// 0 = full resolution
    pub level: usize,
    pub dims: Dims3,
    /// Cumulative `[x, y, z]` factor relative to level 0
    pub downsample_factor: [usize; 3],
}

fn halve(dims: Dims3) -> Dims3 {
    Dims3::new(
        dims.width.div_ceil(2),
        dims.height.div_ceil(2),
        dims.depth.div_ceil(2),
    )
}

/// Levels from `dims` down to and including 1x1x1.
///
/// Each step halves every axis with `ceil(n / 2)`. An axis that no longer
/// changes stops doubling its downsample factor.
pub fn compute_multiscale_geometry_levels(dims: Dims3) -> Vec<MultiscaleLevel> {
    let mut levels = vec![MultiscaleLevel {
        level: 0,
        dims,
        downsample_factor: [1, 1, 1],
    }];

    let mut current = dims;
    let mut factor = [1usize, 1, 1];
    while current != Dims3::new(1, 1, 1) {
        let next = halve(current);
        if next == current {
            break;
        }
        if next.width != current.width {
            factor[0] *= 2;
        }
        if next.height != current.height {
            factor[1] *= 2;
        }
        if next.depth != current.depth {
            factor[2] *= 2;
        }
        levels.push(MultiscaleLevel {
            level: levels.len(),
            dims: next,
            downsample_factor: factor,
        });
        current = next;
    }
    levels
}

fn axis_ratio(source: usize, target: usize) -> Result<usize> {
    if target == source {
        Ok(1)
    } else if target == source.div_ceil(2) {
        Ok(2)
    } else {
        Err(VoxError::InvalidDimensions(format!(
            "cannot downsample axis of length {} to {}",
            source, target
        )))
    }
}

/// Downsample one pyramid step: box average for normalized bytes, top-left
/// sample for labels. Min/max carry over unchanged.
pub fn downsample_volume(volume: &NormalizedVolume, target: Dims3) -> Result<NormalizedVolume> {
    let source = volume.dims();
    let rx = axis_ratio(source.width, target.width)?;
    let ry = axis_ratio(source.height, target.height)?;
    let rz = axis_ratio(source.depth, target.depth)?;
    let view = volume.view()?;
    let channels = volume.channels;

    let mut normalized = Vec::with_capacity(target.voxel_count() * channels);
    for z in 0..target.depth {
        let zs = (z * rz)..((z * rz + rz).min(source.depth));
        for y in 0..target.height {
            let ys = (y * ry)..((y * ry + ry).min(source.height));
            for x in 0..target.width {
                let xs = (x * rx)..((x * rx + rx).min(source.width));
                for c in 0..channels {
                    let mut sum = 0u32;
                    let mut count = 0u32;
                    for sz in zs.clone() {
                        for sy in ys.clone() {
                            for sx in xs.clone() {
                                sum += view[[sz, sy, sx, c]] as u32;
                                count += 1;
                            }
                        }
                    }
                    normalized.push(((sum + count / 2) / count) as u8);
                }
            }
        }
    }

    let segmentation_labels = match &volume.segmentation_labels {
        Some(labels) => {
            let labels = ArrayView3::from_shape((source.depth, source.height, source.width), labels)
                .map_err(|e| VoxError::InvalidDimensions(e.to_string()))?;
            let picked = labels.slice(ndarray::s![..;rz as isize, ..;ry as isize, ..;rx as isize]);
            debug_assert_eq!(picked.len_of(Axis(0)), target.depth);
            Some(picked.iter().copied().collect())
        }
        None => None,
    };

    NormalizedVolume::new(
        target.width,
        target.height,
        target.depth,
        channels,
        volume.data_type,
        volume.range(),
        normalized,
        segmentation_labels,
    )
}
