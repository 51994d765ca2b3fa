//! Utility functions

use sha2::{Digest, Sha256};

/// SHA-256 of `data`, lowercase hex encoded
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Verify a hex SHA-256 digest (case-insensitive)
pub fn verify_sha256(data: &[u8], expected: &str) -> bool {
    sha256_hex(data).eq_ignore_ascii_case(expected)
}

/// 32-bit FNV-1a hash of a string
pub fn fnv1a_32(input: &str) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;

    input.bytes().fold(OFFSET_BASIS, |hash, byte| {
        (hash ^ byte as u32).wrapping_mul(PRIME)
    })
}

/// Integer division rounding up
pub fn ceil_div(value: usize, divisor: usize) -> usize {
    debug_assert!(divisor > 0);
    value.div_ceil(divisor)
}

/// Join coordinates with `separator`
pub fn join_coords(coords: &[usize], separator: &str) -> String {
    coords
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(separator)
}

/// Format byte size in human-readable form
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];

    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

/// Encode `u32` values as little-endian bytes
pub fn u32s_to_le_bytes(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Decode little-endian `u32` values; `None` if the length is not a multiple of 4
pub fn le_bytes_to_u32s(bytes: &[u8]) -> Option<Vec<u32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}
