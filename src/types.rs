//! Core data types for voxpack

use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric element kinds a volume buffer can hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeDataType {
    Uint8,
    Int8,
    Uint16,
    Int16,
    Uint32,
    Int32,
    Float32,
    Float64,
}

impl VolumeDataType {
    pub const ALL: [VolumeDataType; 8] = [
        VolumeDataType::Uint8,
        VolumeDataType::Int8,
        VolumeDataType::Uint16,
        VolumeDataType::Int16,
        VolumeDataType::Uint32,
        VolumeDataType::Int32,
        VolumeDataType::Float32,
        VolumeDataType::Float64,
    ];

    /// Size in bytes of one element
    pub fn size_in_bytes(&self) -> usize {
        match self {
            VolumeDataType::Uint8 | VolumeDataType::Int8 => 1,
            VolumeDataType::Uint16 | VolumeDataType::Int16 => 2,
            VolumeDataType::Uint32 | VolumeDataType::Int32 | VolumeDataType::Float32 => 4,
            VolumeDataType::Float64 => 8,
        }
    }

    /// Check if this is a floating point type
    pub fn is_float(&self) -> bool {
        matches!(self, VolumeDataType::Float32 | VolumeDataType::Float64)
    }

    /// Manifest spelling (`uint8`, `float32`, ...)
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeDataType::Uint8 => "uint8",
            VolumeDataType::Int8 => "int8",
            VolumeDataType::Uint16 => "uint16",
            VolumeDataType::Int16 => "int16",
            VolumeDataType::Uint32 => "uint32",
            VolumeDataType::Int32 => "int32",
            VolumeDataType::Float32 => "float32",
            VolumeDataType::Float64 => "float64",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|dt| dt.as_str() == name)
    }

    /// Zarr v2 `dtype` string (little-endian)
    pub fn zarr_dtype(&self) -> &'static str {
        match self {
            VolumeDataType::Uint8 => "|u1",
            VolumeDataType::Int8 => "|i1",
            VolumeDataType::Uint16 => "<u2",
            VolumeDataType::Int16 => "<i2",
            VolumeDataType::Uint32 => "<u4",
            VolumeDataType::Int32 => "<i4",
            VolumeDataType::Float32 => "<f4",
            VolumeDataType::Float64 => "<f8",
        }
    }

    pub fn from_zarr_dtype(dtype: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|dt| dt.zarr_dtype() == dtype)
    }
}

impl fmt::Display for VolumeDataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observed value range of a volume
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

impl ValueRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Build a range, widening a degenerate `min == max` to `max = min + 1`.
    pub fn corrected(min: f64, max: f64) -> Self {
        if min == max {
            Self { min, max: min + 1.0 }
        } else {
            Self { min, max }
        }
    }

    pub fn is_valid(&self) -> bool {
        self.min.is_finite() && self.max.is_finite() && self.min <= self.max
    }

    pub fn span(&self) -> f64 {
        self.max - self.min
    }
}

/// Spatial extent of a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dims3 {
    pub width: usize,
    pub height: usize,
    pub depth: usize,
}

impl Dims3 {
    pub fn new(width: usize, height: usize, depth: usize) -> Self {
        Self {
            width,
            height,
            depth,
        }
    }

    pub fn voxel_count(&self) -> usize {
        self.width * self.height * self.depth
    }
}

impl fmt::Display for Dims3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.width, self.height, self.depth)
    }
}

/// Per-axis scale factors (`x`, `y`, `z`)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisScale {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl AxisScale {
    pub const IDENTITY: Self = Self {
        x: 1.0,
        y: 1.0,
        z: 1.0,
    };

    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

/// How input files map onto timepoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum MovieMode {
    /// Every z-slice of every input file is one timepoint
    #[serde(rename = "2d")]
    TwoD,
    /// Every input file is one timepoint
    #[default]
    #[serde(rename = "3d")]
    ThreeD,
}

impl MovieMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MovieMode::TwoD => "2d",
            MovieMode::ThreeD => "3d",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_type_sizes() {
        assert_eq!(VolumeDataType::Uint8.size_in_bytes(), 1);
        assert_eq!(VolumeDataType::Int16.size_in_bytes(), 2);
        assert_eq!(VolumeDataType::Float32.size_in_bytes(), 4);
        assert_eq!(VolumeDataType::Float64.size_in_bytes(), 8);
    }

    #[test]
    fn test_data_type_names() {
        for dt in VolumeDataType::ALL {
            assert_eq!(VolumeDataType::parse(dt.as_str()), Some(dt));
            assert_eq!(VolumeDataType::from_zarr_dtype(dt.zarr_dtype()), Some(dt));
        }
        assert_eq!(
            serde_json::to_string(&VolumeDataType::Float32).unwrap(),
            "\"float32\""
        );
        assert_eq!(VolumeDataType::parse("uint64"), None);
    }

    #[test]
    fn test_degenerate_range_is_widened() {
        let range = ValueRange::corrected(7.0, 7.0);
        assert_eq!(range, ValueRange::new(7.0, 8.0));
        assert_eq!(ValueRange::corrected(1.0, 3.0).span(), 2.0);
    }

    #[test]
    fn test_movie_mode_serde() {
        assert_eq!(serde_json::to_string(&MovieMode::TwoD).unwrap(), "\"2d\"");
        let mode: MovieMode = serde_json::from_str("\"3d\"").unwrap();
        assert_eq!(mode, MovieMode::ThreeD);
    }
}
