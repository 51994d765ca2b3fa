//! Cooperative cancellation

use crate::error::{Result, VoxError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cloneable cancellation handle.
///
/// Every clone observes the same flag. Long-running operations poll
/// [`CancellationToken::check`] at file, slice, timepoint and archive entry
/// boundaries and unwind with [`VoxError::Aborted`] once it is raised.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// `Err(VoxError::Aborted)` once cancelled
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(VoxError::Aborted)
        } else {
            Ok(())
        }
    }
}
