use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::Error;

/// Token for cooperative cancellation.
///
/// The presentation side calls [`cancel`](Self::cancel); the worker only reads
/// the flag, between items and never in the middle of one.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Create a new cancellation token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Check if cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Returns Ok(()) to continue, Err if cancelled.
    pub fn check(&self) -> Result<(), Error> {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }
}

/// Progress counter shared with the presentation side.
///
/// Only the worker writes it; readers poll [`snapshot`](Self::snapshot).
#[derive(Clone, Debug, Default)]
pub struct ProgressCounter {
    current: Arc<AtomicU64>,
    total: Arc<AtomicU64>,
}

impl ProgressCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set(&self, current: u64, total: u64) {
        self.total.store(total, Ordering::Release);
        self.current.store(current, Ordering::Release);
    }

    /// `(current, total)` as last written by the worker.
    pub fn snapshot(&self) -> (u64, u64) {
        (
            self.current.load(Ordering::Acquire),
            self.total.load(Ordering::Acquire),
        )
    }
}
