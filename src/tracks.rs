//! Track sets stored as headerless CSV alongside a dataset

use crate::error::{Result, VoxError};
use crate::manifest::TrackSetManifest;

/// Columns per track row
pub const TRACK_COLUMNS: usize = 8;

/// Decimal places kept when formatting
pub const TRACK_DECIMALS: i32 = 3;

/// Archive directory holding track CSV files
pub const TRACKS_DIR: &str = "tracks";

/// One track point: `track_id, time, x, y, z, radius, value, parent_id`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackRow(pub [f64; TRACK_COLUMNS]);

impl TrackRow {
    pub fn track_id(&self) -> f64 {
        self.0[0]
    }

    pub fn time(&self) -> f64 {
        self.0[1]
    }

    pub fn position(&self) -> [f64; 3] {
        [self.0[2], self.0[3], self.0[4]]
    }
}

/// A named set of tracks, optionally bound to a channel
#[derive(Debug, Clone, PartialEq)]
pub struct TrackSet {
    pub id: String,
    pub name: String,
    pub channel_id: Option<String>,
    pub rows: Vec<TrackRow>,
}

impl TrackSet {
    pub fn new(id: impl Into<String>, name: impl Into<String>, rows: Vec<TrackRow>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            channel_id: None,
            rows,
        }
    }

    pub fn with_channel(mut self, channel_id: impl Into<String>) -> Self {
        self.channel_id = Some(channel_id.into());
        self
    }

    pub fn path(&self) -> String {
        track_set_path(&self.id)
    }

    pub fn to_csv(&self) -> Result<String> {
        format_track_csv(&self.rows)
    }

    pub fn manifest_entry(&self) -> TrackSetManifest {
        TrackSetManifest {
            id: self.id.clone(),
            name: self.name.clone(),
            channel_id: self.channel_id.clone(),
            path: self.path(),
            row_count: self.rows.len(),
        }
    }

    /// Rebuild a track set from its manifest entry and CSV text.
    pub fn from_manifest(entry: &TrackSetManifest, csv: &str) -> Result<Self> {
        let rows = parse_track_csv(csv)?;
        if rows.len() != entry.row_count {
            return Err(VoxError::Corrupt(format!(
                "{}: {} rows, manifest declares {}",
                entry.path,
                rows.len(),
                entry.row_count
            )));
        }
        Ok(Self {
            id: entry.id.clone(),
            name: entry.name.clone(),
            channel_id: entry.channel_id.clone(),
            rows,
        })
    }
}

pub fn track_set_path(id: &str) -> String {
    format!("{}/{}.csv", TRACKS_DIR, id)
}

/// Format a value with at most three decimals, trailing zeros trimmed.
/// Negative zero prints as `0`.
pub fn format_track_value(value: f64) -> String {
    let scale = 10f64.powi(TRACK_DECIMALS);
    let rounded = (value * scale).round() / scale;
    if rounded == 0.0 {
        return "0".to_string();
    }
    let text = format!("{:.*}", TRACK_DECIMALS as usize, rounded);
    let text = text.trim_end_matches('0').trim_end_matches('.');
    text.to_string()
}

pub fn format_track_csv(rows: &[TrackRow]) -> Result<String> {
    let mut out = String::new();
    for (line, row) in rows.iter().enumerate() {
        if let Some(bad) = row.0.iter().find(|v| !v.is_finite()) {
            return Err(VoxError::Configuration(format!(
                "track row {} holds non-finite value {}",
                line, bad
            )));
        }
        let fields: Vec<String> = row.0.iter().map(|&v| format_track_value(v)).collect();
        out.push_str(&fields.join(","));
        out.push('\n');
    }
    Ok(out)
}

/// Parse headerless track CSV; every non-blank line must have exactly
/// [`TRACK_COLUMNS`] numeric fields.
pub fn parse_track_csv(text: &str) -> Result<Vec<TrackRow>> {
    let mut rows = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() != TRACK_COLUMNS {
            return Err(VoxError::Corrupt(format!(
                "track CSV line {}: expected {} columns, found {}",
                index + 1,
                TRACK_COLUMNS,
                fields.len()
            )));
        }
        let mut row = [0f64; TRACK_COLUMNS];
        for (slot, field) in row.iter_mut().zip(&fields) {
            *slot = field
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or_else(|| {
                    VoxError::Corrupt(format!(
                        "track CSV line {}: '{}' is not a number",
                        index + 1,
                        field
                    ))
                })?;
        }
        rows.push(TrackRow(row));
    }
    Ok(rows)
}
