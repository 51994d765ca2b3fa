//! Shard layout and codec
//!
//! A shard packs several chunks of one array into a single file:
//!
//! ```text
//! [u32 LE header length][header JSON][payload bytes...]
//! header = {"v":1,"r":<rank>,"e":[{"k":"<local coords joined by ','>","o":<offset>,"l":<length>}]}
//! ```
//!
//! Offsets are relative to the first payload byte, so one chunk can be sliced
//! out after reading only the header.

use crate::error::{Result, VoxError};
use crate::layout::ChunkGrid;
use crate::manifest::{ShardingPlan, ZarrArrayDescriptor};
use crate::utils::{ceil_div, join_coords};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Shard header version
pub const SHARD_FORMAT_VERSION: u32 = 1;

const LENGTH_PREFIX: usize = 4;

/// Per-axis chunk and shard counts of a sharded array
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardLayout {
    pub chunk_counts: Vec<usize>,
    pub chunks_per_shard: Vec<usize>,
    pub shard_counts: Vec<usize>,
}

impl ShardLayout {
    pub fn rank(&self) -> usize {
        self.chunk_counts.len()
    }

    pub fn total_shards(&self) -> usize {
        self.shard_counts.iter().product()
    }

    /// Every shard coordinate in row-major order
    pub fn iter_shard_coords(&self) -> impl Iterator<Item = Vec<usize>> + '_ {
        let strides = crate::layout::row_major_strides(&self.shard_counts);
        (0..self.total_shards()).map(move |index| {
            strides
                .iter()
                .zip(&self.shard_counts)
                .map(|(&stride, &count)| (index / stride) % count)
                .collect()
        })
    }
}

/// Where one chunk lives inside its shard
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardChunkLocation {
    pub shard_coords: Vec<usize>,
    pub local_chunk_coords: Vec<usize>,
    pub shard_path: String,
}

/// Shard layout of `descriptor`, or `None` when it is not sharded.
pub fn get_shard_layout_for_array(descriptor: &ZarrArrayDescriptor) -> Result<Option<ShardLayout>> {
    let plan = match &descriptor.sharding {
        Some(plan) if plan.enabled => plan,
        _ => return Ok(None),
    };

    let rank = descriptor.shape.len();
    if descriptor.chunk_shape.len() != rank || plan.shard_shape.len() != rank {
        return Err(VoxError::InvalidDimensions(format!(
            "{}: shard shape {:?} and chunk shape {:?} must match array rank {}",
            descriptor.path, plan.shard_shape, descriptor.chunk_shape, rank
        )));
    }

    let grid = ChunkGrid::new(descriptor.shape.clone(), descriptor.chunk_shape.clone())?;
    let mut chunks_per_shard = Vec::with_capacity(rank);
    for (axis, (&shard, &chunk)) in plan.shard_shape.iter().zip(&descriptor.chunk_shape).enumerate() {
        if shard == 0 || shard % chunk != 0 {
            return Err(VoxError::InvalidDimensions(format!(
                "{}: shard axis {} ({}) is not a multiple of chunk size {}",
                descriptor.path, axis, shard, chunk
            )));
        }
        chunks_per_shard.push(shard / chunk);
    }

    let chunk_counts = grid.chunk_counts();
    let shard_counts = chunk_counts
        .iter()
        .zip(&chunks_per_shard)
        .map(|(&count, &per)| ceil_div(count, per))
        .collect();

    Ok(Some(ShardLayout {
        chunk_counts,
        chunks_per_shard,
        shard_counts,
    }))
}

/// Store key of the shard at `shard_coords`
pub fn shard_path(array_path: &str, shard_coords: &[usize]) -> String {
    format!("{}/shards/{}.shard", array_path, join_coords(shard_coords, "/"))
}

/// Header key of a chunk within its shard
pub fn shard_entry_key(local_chunk_coords: &[usize]) -> String {
    join_coords(local_chunk_coords, ",")
}

/// Locate the shard holding `chunk_coords` and its position inside it.
pub fn get_shard_chunk_location(
    descriptor: &ZarrArrayDescriptor,
    chunk_coords: &[usize],
) -> Result<ShardChunkLocation> {
    let layout = get_shard_layout_for_array(descriptor)?.ok_or_else(|| {
        VoxError::Configuration(format!("{} is not sharded", descriptor.path))
    })?;
    locate_chunk(&layout, &descriptor.path, chunk_coords)
}

pub(crate) fn locate_chunk(
    layout: &ShardLayout,
    array_path: &str,
    chunk_coords: &[usize],
) -> Result<ShardChunkLocation> {
    if chunk_coords.len() != layout.rank() {
        return Err(VoxError::InvalidDimensions(format!(
            "chunk coordinates {:?} do not match rank {}",
            chunk_coords,
            layout.rank()
        )));
    }

    let mut shard_coords = Vec::with_capacity(layout.rank());
    let mut local_chunk_coords = Vec::with_capacity(layout.rank());
    for (axis, &coord) in chunk_coords.iter().enumerate() {
        if coord >= layout.chunk_counts[axis] {
            return Err(VoxError::OutOfBounds(format!(
                "{}: chunk coordinate {} on axis {} exceeds chunk count {}",
                array_path, coord, axis, layout.chunk_counts[axis]
            )));
        }
        let per = layout.chunks_per_shard[axis];
        let shard = coord / per;
        shard_coords.push(shard);
        local_chunk_coords.push(coord - shard * per);
    }

    Ok(ShardChunkLocation {
        shard_path: shard_path(array_path, &shard_coords),
        shard_coords,
        local_chunk_coords,
    })
}

#[derive(Debug, Serialize, Deserialize)]
struct ShardHeader {
    v: u32,
    r: usize,
    e: Vec<ShardHeaderEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ShardHeaderEntry {
    k: String,
    o: u64,
    l: u64,
}

/// Encode chunk payloads, keyed by local chunk coordinates, into shard bytes.
///
/// Entries are ordered by key so identical inputs encode identically.
pub fn encode_shard_entries(rank: usize, entries: Vec<(Vec<usize>, Vec<u8>)>) -> Result<Vec<u8>> {
    if entries.is_empty() {
        return Err(VoxError::InvalidDimensions(
            "a shard must contain at least one chunk".to_string(),
        ));
    }

    let mut keyed = BTreeMap::new();
    for (coords, payload) in entries {
        if coords.len() != rank {
            return Err(VoxError::InvalidDimensions(format!(
                "local chunk coordinates {:?} do not match shard rank {}",
                coords, rank
            )));
        }
        let key = shard_entry_key(&coords);
        if keyed.contains_key(&key) {
            return Err(VoxError::InvalidDimensions(format!(
                "duplicate shard entry '{}'",
                key
            )));
        }
        keyed.insert(key, payload);
    }

    let mut header = ShardHeader {
        v: SHARD_FORMAT_VERSION,
        r: rank,
        e: Vec::with_capacity(keyed.len()),
    };
    let mut offset = 0u64;
    for (key, payload) in &keyed {
        header.e.push(ShardHeaderEntry {
            k: key.clone(),
            o: offset,
            l: payload.len() as u64,
        });
        offset += payload.len() as u64;
    }

    let header_bytes = serde_json::to_vec(&header)?;
    let header_len = u32::try_from(header_bytes.len())
        .map_err(|_| VoxError::InvalidDimensions("shard header is too large".to_string()))?;

    let mut out = Vec::with_capacity(LENGTH_PREFIX + header_bytes.len() + offset as usize);
    out.extend_from_slice(&header_len.to_le_bytes());
    out.extend_from_slice(&header_bytes);
    for payload in keyed.values() {
        out.extend_from_slice(payload);
    }
    Ok(out)
}

/// Parsed shard header
#[derive(Debug, Clone)]
pub struct ShardIndex {
    rank: usize,
    payload_start: usize,
    entries: BTreeMap<String, (u64, u64)>,
}

impl ShardIndex {
    /// Parse the length prefix and header of shard bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let prefix: [u8; LENGTH_PREFIX] = bytes
            .get(..LENGTH_PREFIX)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| VoxError::Corrupt("shard is shorter than its length prefix".to_string()))?;
        let header_len = u32::from_le_bytes(prefix) as usize;
        let payload_start = LENGTH_PREFIX + header_len;
        let header_bytes = bytes.get(LENGTH_PREFIX..payload_start).ok_or_else(|| {
            VoxError::Corrupt(format!(
                "shard header of {} bytes exceeds shard length {}",
                header_len,
                bytes.len()
            ))
        })?;

        let header: ShardHeader = serde_json::from_slice(header_bytes)
            .map_err(|e| VoxError::Corrupt(format!("invalid shard header: {}", e)))?;
        if header.v != SHARD_FORMAT_VERSION {
            return Err(VoxError::Corrupt(format!(
                "unsupported shard header version {}",
                header.v
            )));
        }

        let mut entries = BTreeMap::new();
        for entry in header.e {
            if entries.insert(entry.k.clone(), (entry.o, entry.l)).is_some() {
                return Err(VoxError::Corrupt(format!(
                    "duplicate shard entry '{}'",
                    entry.k
                )));
            }
        }

        Ok(Self {
            rank: header.r,
            payload_start,
            entries,
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, local_chunk_coords: &[usize]) -> bool {
        self.entries.contains_key(&shard_entry_key(local_chunk_coords))
    }
}

/// Slice one chunk payload out of `bytes` using a parsed index.
pub fn decode_shard_entry_from_index<'a>(
    bytes: &'a [u8],
    index: &ShardIndex,
    rank: usize,
    local_chunk_coords: &[usize],
) -> Result<&'a [u8]> {
    if index.rank != rank || local_chunk_coords.len() != rank {
        return Err(VoxError::Corrupt(format!(
            "shard rank {} does not match expected rank {}",
            index.rank, rank
        )));
    }
    let key = shard_entry_key(local_chunk_coords);
    let &(offset, length) = index
        .entries
        .get(&key)
        .ok_or_else(|| VoxError::MissingEntry(format!("shard entry '{}'", key)))?;

    let start = (index.payload_start as u64).checked_add(offset);
    let end = start.and_then(|s| s.checked_add(length));
    match (start, end) {
        (Some(start), Some(end)) if end <= bytes.len() as u64 => {
            Ok(&bytes[start as usize..end as usize])
        }
        _ => Err(VoxError::Corrupt(format!(
            "shard entry '{}' ({} bytes at offset {}) exceeds shard length {}",
            key,
            length,
            offset,
            bytes.len()
        ))),
    }
}

/// Parse the header of `bytes` and slice out one chunk payload.
pub fn decode_shard_entry<'a>(bytes: &'a [u8], rank: usize, local_chunk_coords: &[usize]) -> Result<&'a [u8]> {
    let index = ShardIndex::parse(bytes)?;
    decode_shard_entry_from_index(bytes, &index, rank, local_chunk_coords)
}

/// Number of chunks a complete shard at `shard_coords` holds.
///
/// Edge shards hold fewer chunks than interior ones.
pub fn compute_expected_chunk_count_for_shard(layout: &ShardLayout, shard_coords: &[usize]) -> usize {
    shard_coords
        .iter()
        .enumerate()
        .map(|(axis, &coord)| {
            let per = layout.chunks_per_shard[axis];
            per.min(layout.chunk_counts[axis].saturating_sub(coord * per))
        })
        .product()
}

/// Fail unless a parsed shard holds exactly the chunks its position implies.
pub fn verify_shard_complete(layout: &ShardLayout, shard_coords: &[usize], index: &ShardIndex) -> Result<()> {
    let expected = compute_expected_chunk_count_for_shard(layout, shard_coords);
    if index.len() != expected {
        return Err(VoxError::Corrupt(format!(
            "shard {:?} holds {} chunks, expected {}",
            shard_coords,
            index.len(),
            expected
        )));
    }
    Ok(())
}

/// Spatial axes of a `[t, z, y, x, ...]` array, in the order shards grow
const GROWTH_AXES: [usize; 3] = [3, 2, 1];

/// Choose a shard shape for an array whose chunks are `element_bytes` wide.
///
/// Doubles chunks-per-shard along x, y and z in turn while the uncompressed
/// shard estimate fits `target_shard_bytes`. The time axis and any trailing
/// channel axis never grow. Returns `None` when sharding is off.
pub fn plan_sharding(
    shape: &[usize],
    chunk_shape: &[usize],
    element_bytes: usize,
    target_shard_bytes: Option<u64>,
) -> Option<ShardingPlan> {
    let target = target_shard_bytes?;
    let chunk_counts: Vec<usize> = shape
        .iter()
        .zip(chunk_shape)
        .map(|(&n, &c)| ceil_div(n, c))
        .collect();
    let chunk_bytes = (chunk_shape.iter().product::<usize>() * element_bytes) as u64;
    let mut per_shard = vec![1usize; shape.len()];
    let estimate = |per: &[usize]| chunk_bytes.saturating_mul(per.iter().product::<usize>() as u64);

    loop {
        let mut grew = false;
        for &axis in GROWTH_AXES.iter().filter(|&&axis| axis < shape.len()) {
            if per_shard[axis] >= chunk_counts[axis] {
                continue;
            }
            per_shard[axis] *= 2;
            if estimate(&per_shard) <= target {
                grew = true;
            } else {
                per_shard[axis] /= 2;
            }
        }
        if !grew {
            break;
        }
    }

    let shard_shape: Vec<usize> = per_shard.iter().zip(chunk_shape).map(|(&p, &c)| p * c).collect();
    let estimated_shard_bytes = estimate(&per_shard);
    if per_shard.iter().all(|&p| p == 1) {
        let reason = if chunk_bytes.saturating_mul(2) > target {
            "two chunks exceed the shard target size"
        } else {
            "array has a single chunk along every spatial axis"
        };
        return Some(ShardingPlan {
            enabled: false,
            target_shard_bytes: target,
            shard_shape,
            estimated_shard_bytes,
            reason: Some(reason.to_string()),
        });
    }

    Some(ShardingPlan {
        enabled: true,
        target_shard_bytes: target,
        shard_shape,
        estimated_shard_bytes,
        reason: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::VolumeDataType;
    use std::collections::HashMap;

    fn sharded(shape: Vec<usize>, chunk: Vec<usize>, shard: Vec<usize>) -> ZarrArrayDescriptor {
        ZarrArrayDescriptor::new("zarr/a/scale0/data", shape, chunk, VolumeDataType::Uint8).with_sharding(Some(
            ShardingPlan {
                enabled: true,
                target_shard_bytes: 1 << 20,
                shard_shape: shard,
                estimated_shard_bytes: 0,
                reason: None,
            },
        ))
    }

    #[test]
    fn test_layout() {
        let desc = sharded(vec![2, 10, 7], vec![1, 2, 2], vec![1, 4, 4]);
        let layout = get_shard_layout_for_array(&desc).unwrap().unwrap();
        assert_eq!(layout.chunk_counts, vec![2, 5, 4]);
        assert_eq!(layout.chunks_per_shard, vec![1, 2, 2]);
        assert_eq!(layout.shard_counts, vec![2, 3, 2]);
    }

    #[test]
    fn test_unsharded_layout_is_none() {
        let desc = ZarrArrayDescriptor::new("a", vec![4], vec![2], VolumeDataType::Uint8);
        assert!(get_shard_layout_for_array(&desc).unwrap().is_none());

        let mut disabled = sharded(vec![4], vec![2], vec![4]);
        if let Some(plan) = disabled.sharding.as_mut() {
            plan.enabled = false;
        }
        assert!(get_shard_layout_for_array(&disabled).unwrap().is_none());
    }

    #[test]
    fn test_layout_rejects_bad_plans() {
        assert!(get_shard_layout_for_array(&sharded(vec![4, 4], vec![2, 2], vec![3, 2])).is_err());
        assert!(get_shard_layout_for_array(&sharded(vec![4, 4], vec![2, 2], vec![2])).is_err());
    }

    #[test]
    fn test_chunk_location() {
        let desc = sharded(vec![2, 10, 7], vec![1, 2, 2], vec![1, 4, 4]);
        let loc = get_shard_chunk_location(&desc, &[1, 3, 2]).unwrap();
        assert_eq!(loc.shard_coords, vec![1, 1, 1]);
        assert_eq!(loc.local_chunk_coords, vec![0, 1, 0]);
        assert_eq!(loc.shard_path, "zarr/a/scale0/data/shards/1/1/1.shard");

        assert!(matches!(
            get_shard_chunk_location(&desc, &[0, 5, 0]),
            Err(VoxError::OutOfBounds(_))
        ));
    }

    #[test]
    fn test_every_chunk_maps_to_one_shard() {
        let desc = sharded(vec![3, 9, 5, 7], vec![1, 2, 2, 3], vec![1, 4, 4, 6]);
        let layout = get_shard_layout_for_array(&desc).unwrap().unwrap();
        let grid = ChunkGrid::new(desc.shape.clone(), desc.chunk_shape.clone()).unwrap();

        let mut per_shard: HashMap<Vec<usize>, Vec<Vec<usize>>> = HashMap::new();
        for coords in grid.iter_chunk_coords() {
            let loc = locate_chunk(&layout, &desc.path, &coords).unwrap();
            per_shard.entry(loc.shard_coords).or_default().push(loc.local_chunk_coords);
        }

        let mut total = 0;
        for shard in layout.iter_shard_coords() {
            let expected = compute_expected_chunk_count_for_shard(&layout, &shard);
            let locals = &per_shard[&shard];
            assert_eq!(locals.len(), expected, "shard {:?}", shard);
            total += expected;
        }
        assert_eq!(total, grid.total_chunks());
        assert_eq!(per_shard.len(), layout.total_shards());
    }

    #[test]
    fn test_encode_decode() {
        let bytes = encode_shard_entries(
            2,
            vec![(vec![1, 0], b"second".to_vec()), (vec![0, 0], b"first".to_vec())],
        )
        .unwrap();

        let header_len = u32::from_le_bytes(bytes[..4].try_into().unwrap()) as usize;
        let header: serde_json::Value = serde_json::from_slice(&bytes[4..4 + header_len]).unwrap();
        assert_eq!(header["v"], 1);
        assert_eq!(header["r"], 2);
        assert_eq!(header["e"][0]["k"], "0,0");
        assert_eq!(header["e"][1]["o"], 5);

        assert_eq!(decode_shard_entry(&bytes, 2, &[1, 0]).unwrap(), b"second");
        let index = ShardIndex::parse(&bytes).unwrap();
        assert_eq!(index.len(), 2);
        assert!(index.contains(&[0, 0]));
        assert_eq!(decode_shard_entry_from_index(&bytes, &index, 2, &[0, 0]).unwrap(), b"first");

        assert!(matches!(
            decode_shard_entry(&bytes, 2, &[1, 1]),
            Err(VoxError::MissingEntry(_))
        ));
        assert!(decode_shard_entry(&bytes, 3, &[1, 0, 0]).is_err());
    }

    #[test]
    fn test_encode_rejects_empty_and_duplicates() {
        assert!(encode_shard_entries(1, vec![]).is_err());
        assert!(encode_shard_entries(1, vec![(vec![0], vec![1]), (vec![0], vec![2])]).is_err());
    }

    #[test]
    fn test_truncated_shard_is_corrupt() {
        let bytes = encode_shard_entries(1, vec![(vec![0], vec![7; 16])]).unwrap();
        let truncated = &bytes[..bytes.len() - 4];
        assert!(matches!(
            decode_shard_entry(truncated, 1, &[0]),
            Err(VoxError::Corrupt(_))
        ));
        assert!(matches!(ShardIndex::parse(&bytes[..2]), Err(VoxError::Corrupt(_))));
    }

    #[test]
    fn test_expected_count_for_edge_shard() {
        let layout = ShardLayout {
            chunk_counts: vec![5, 3],
            chunks_per_shard: vec![2, 2],
            shard_counts: vec![3, 2],
        };
        assert_eq!(compute_expected_chunk_count_for_shard(&layout, &[0, 0]), 4);
        assert_eq!(compute_expected_chunk_count_for_shard(&layout, &[2, 0]), 2);
        assert_eq!(compute_expected_chunk_count_for_shard(&layout, &[2, 1]), 1);

        let bytes = encode_shard_entries(2, vec![(vec![0, 0], vec![1])]).unwrap();
        let index = ShardIndex::parse(&bytes).unwrap();
        assert!(verify_shard_complete(&layout, &[2, 1], &index).is_ok());
        assert!(verify_shard_complete(&layout, &[0, 0], &index).is_err());
    }

    #[test]
    fn test_plan_sharding() {
        // 1 x 8 x 8 x 8 chunks of 1 KiB each
        let shape = [1, 64, 64, 64, 1];
        let chunk = [1, 8, 8, 16, 1];
        let plan = plan_sharding(&shape, &chunk, 1, Some(8 * 1024)).unwrap();
        assert!(plan.enabled);
        assert_eq!(plan.shard_shape, vec![1, 16, 16, 32, 1]);
        assert_eq!(plan.estimated_shard_bytes, 8 * 1024);

        let single = plan_sharding(&[1, 8, 8, 8, 1], &[1, 8, 8, 8, 1], 1, Some(1 << 20)).unwrap();
        assert!(!single.enabled);
        assert!(single.reason.is_some());

        let big = plan_sharding(&shape, &chunk, 1, Some(1024)).unwrap();
        assert!(!big.enabled);

        assert!(plan_sharding(&shape, &chunk, 1, None).is_none());
    }
}
