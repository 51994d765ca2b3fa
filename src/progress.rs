//! Progress reporting for preprocessing and archive import

use std::sync::Arc;

/// Caller-supplied progress observer
pub type ProgressCallback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Preprocessing progress
#[derive(Debug, Clone, PartialEq)]
pub enum PreprocessProgress {
    /// Input files probed for one layer
    Scan {
        layer_key: String,
        files_done: usize,
        files_total: usize,
    },
    /// Representative stats computed for one layer
    RepresentativeStats { layer_key: String, min: f64, max: f64 },
    /// One timepoint written for one layer
    Timepoint {
        layer_key: String,
        timepoint: usize,
        timepoints_total: usize,
    },
    /// Manifest persisted
    Finalized { total_volume_count: u64 },
}

/// Coarse import phases for multiscale datasets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportMilestone {
    Scan,
    Level0,
    Mips,
    Finalize,
}

/// Import progress
#[derive(Debug, Clone, PartialEq)]
pub enum ImportProgress {
    /// Archive bytes received so far
    Bytes {
        processed: u64,
        total: Option<u64>,
    },
    /// Volumes decoded and verified so far
    Volumes { decoded: u64, total: u64 },
    Milestone(ImportMilestone),
}

pub(crate) fn emit<E>(callback: &Option<ProgressCallback<E>>, event: E) {
    if let Some(callback) = callback {
        callback(&event);
    }
}
