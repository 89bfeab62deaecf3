//! Error types for favsort-core.
//!
//! Only faults that stop a whole operation are errors. Per-item problems met
//! while scanning or exporting are collected as [`crate::ScanFault`] and
//! [`crate::writer::ExportFailure`] values and reported alongside the result.

use std::path::PathBuf;

use thiserror::Error;

/// Fatal error for a scan or export run.
#[derive(Error, Debug)]
pub enum Error {
    /// The cache root or archive does not exist
    #[error("input not found: {}", path.display())]
    InputNotFound { path: PathBuf },

    /// The cache root or archive exists but cannot be opened or listed
    #[error("cannot read input {}: {source}", path.display())]
    InputUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The archive is not a readable zip container
    #[error("not a readable zip archive {}: {source}", path.display())]
    InvalidArchive {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },

    /// The export folder cannot be created
    #[error("cannot prepare destination {}: {source}", path.display())]
    Destination {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A scan was cancelled before it produced a result
    #[error("operation cancelled")]
    Cancelled,

    /// The background thread stopped without reporting a result
    #[error("background worker stopped unexpectedly")]
    WorkerPanicked,
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether this error came from a user-requested cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}
