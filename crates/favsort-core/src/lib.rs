//! Recover the display order of favorites media and export it.
//!
//! A scan reads either a messaging client's favorites cache directory
//! ([`scan_cache`]) or a zip archive ([`scan_archive`]) and returns a
//! de-duplicated [`MediaEntry`] sequence in best-effort display order:
//! explicit sequence numbers first, then modification time or archive
//! position. [`export`] copies that sequence into a date-stamped folder.
//!
//! The order is a deterministic heuristic; sources that carry no ordering
//! signal cannot be reconstructed exactly.
//!
//! For interactive callers the [`worker`] module runs the same operations on
//! a background thread and streams [`Progress`] events over a channel.

pub mod cache_scan;
pub mod cancel;
pub mod classify;
pub mod error;
pub mod extras;
pub mod fingerprint;
pub mod locate;
pub mod media;
pub mod order_hint;
pub mod reconcile;
pub mod sidecar;
pub mod worker;
pub mod writer;
pub mod zip_scan;

use std::path::{Path, PathBuf};
use std::time::Instant;

use log::info;
use serde::{Deserialize, Serialize};

pub use cancel::{CancellationToken, ProgressCounter};
pub use error::{Error, Result};
pub use media::{Confidence, Fingerprint, MediaEntry, MediaKind, OrderKey, Origin, SourceLocator};
pub use reconcile::reorder_by_modified;
pub use writer::{ExportFailure, ExportOptions, ExportSummary};

fn default_true() -> bool {
    true
}

/// Options shared by both scanners.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanOptions {
    /// Resolve the favorites folder inside a cache root before walking
    #[serde(default = "default_true")]
    pub locate_favorites: bool,
    /// Skip cover images that the client stores next to videos
    #[serde(default = "default_true")]
    pub skip_thumbnails: bool,
    /// Follow symbolic links while walking a cache directory
    #[serde(default)]
    pub follow_links: bool,
    /// Order cache files by a favorites index database when one is found
    #[serde(default = "default_true")]
    pub use_index: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            locate_favorites: true,
            skip_thumbnails: true,
            follow_links: false,
            use_index: true,
        }
    }
}

/// One progress event: `current_index` is 1-based within `total_count`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub stage: String,
    pub current_index: u64,
    pub total_count: u64,
    pub status_message: String,
}

/// Why a single file or archive entry was left out of a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "kebab-case")]
pub enum FaultReason {
    Unreadable(String),
    Empty,
    Unclassified,
    Walk(String),
}

/// A recoverable per-item scan problem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanFault {
    pub locator: String,
    #[serde(flatten)]
    pub reason: FaultReason,
}

impl std::fmt::Display for ScanFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.reason {
            FaultReason::Unreadable(e) => write!(f, "{}: unreadable ({})", self.locator, e),
            FaultReason::Empty => write!(f, "{}: empty", self.locator),
            FaultReason::Unclassified => write!(f, "{}: not a recognised media type", self.locator),
            FaultReason::Walk(e) => write!(f, "{}: cannot traverse ({})", self.locator, e),
        }
    }
}

/// Scanner output before reconciliation.
#[derive(Debug)]
pub struct RawScan {
    pub root: PathBuf,
    pub entries: Vec<MediaEntry>,
    pub faults: Vec<ScanFault>,
}

/// Ordered result of a scan.
#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    /// Located favorites folder, or the archive path
    pub root: PathBuf,
    /// Reconciled entries, sequence numbers 1..=len
    pub entries: Vec<MediaEntry>,
    pub faults: Vec<ScanFault>,
    pub duplicates_collapsed: usize,
}

/// Type alias for progress callback
pub type ProgressCallback<'c> = dyn Fn(&Progress) + Send + Sync + 'c;

struct EmitState {
    at: Instant,
    /// Highest index passed to the callback so far
    current: u64,
}

/// Throttled progress reporter: emits at most every 200ms or on completion.
///
/// Safe to share between threads. Indices reach the callback in increasing
/// order: a report at or below one already emitted is dropped.
pub struct ThrottledProgress<'a> {
    inner: &'a ProgressCallback<'a>,
    state: std::sync::Mutex<EmitState>,
}

impl<'a> ThrottledProgress<'a> {
    pub fn new(inner: &'a ProgressCallback<'a>) -> Self {
        Self {
            inner,
            state: std::sync::Mutex::new(EmitState {
                at: Instant::now()
                    .checked_sub(std::time::Duration::from_secs(1))
                    .unwrap_or_else(Instant::now),
                current: 0,
            }),
        }
    }

    /// `current` is 1-based; the final event (`current >= total`) always passes.
    pub fn report(&self, stage: &str, current: u64, total: u64, message: &str) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if current <= state.current {
            return;
        }
        let is_done = current >= total;
        if !is_done && state.at.elapsed().as_millis() < 200 {
            return;
        }
        state.at = Instant::now();
        state.current = current;
        // Held across the call so concurrent reporters cannot overtake each other
        (self.inner)(&Progress {
            stage: stage.to_string(),
            current_index: current,
            total_count: total,
            status_message: message.to_string(),
        });
    }
}

fn no_progress(_: &Progress) {}

fn finish(raw: RawScan, started: Instant) -> ScanReport {
    let reconciled = reconcile::reconcile(raw.entries);
    info!(
        "Scan of {} done: {} entries, {} duplicates collapsed, {} skipped ({:.2}s)",
        raw.root.display(),
        reconciled.entries.len(),
        reconciled.duplicates_collapsed,
        raw.faults.len(),
        started.elapsed().as_secs_f64()
    );
    ScanReport {
        root: raw.root,
        entries: reconciled.entries,
        faults: raw.faults,
        duplicates_collapsed: reconciled.duplicates_collapsed,
    }
}

/// Scan a cache directory and return its media in reconciled order.
pub fn scan_cache(root: &Path, options: &ScanOptions) -> Result<ScanReport> {
    scan_cache_with_control(root, options, &no_progress, None)
}

/// [`scan_cache`] with progress reporting and cancellation.
pub fn scan_cache_with_control(
    root: &Path,
    options: &ScanOptions,
    progress_callback: &ProgressCallback<'_>,
    cancel: Option<&CancellationToken>,
) -> Result<ScanReport> {
    let started = Instant::now();
    let tp = ThrottledProgress::new(progress_callback);
    let raw = cache_scan::scan_directory(root, options, &tp, cancel)?;
    if let Some(token) = cancel {
        token.check()?;
    }
    Ok(finish(raw, started))
}

/// Scan a zip archive and return its media in reconciled order.
pub fn scan_archive(archive: &Path, options: &ScanOptions) -> Result<ScanReport> {
    scan_archive_with_control(archive, options, &no_progress, None)
}

/// [`scan_archive`] with progress reporting and cancellation.
pub fn scan_archive_with_control(
    archive: &Path,
    options: &ScanOptions,
    progress_callback: &ProgressCallback<'_>,
    cancel: Option<&CancellationToken>,
) -> Result<ScanReport> {
    let started = Instant::now();
    let tp = ThrottledProgress::new(progress_callback);
    let raw = zip_scan::scan_archive(archive, options, &tp, cancel)?;
    if let Some(token) = cancel {
        token.check()?;
    }
    Ok(finish(raw, started))
}

/// Copy a reconciled sequence into a new date-stamped folder.
pub fn export(entries: &[MediaEntry], options: &ExportOptions) -> Result<ExportSummary> {
    writer::export(entries, options, &no_progress, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_throttled_progress_always_emits_final() {
        let seen = Mutex::new(Vec::new());
        {
            let cb = |p: &Progress| seen.lock().unwrap().push(p.current_index);
            let tp = ThrottledProgress::new(&cb);
            tp.report("scan", 1, 3, "a");
            tp.report("scan", 2, 3, "b");
            tp.report("scan", 3, 3, "c");
        }
        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.first(), Some(&1));
        assert_eq!(seen.last(), Some(&3));
        assert!(!seen.contains(&2));
    }

    #[test]
    fn test_throttled_progress_never_goes_backwards() {
        let seen = Mutex::new(Vec::new());
        {
            let cb = |p: &Progress| seen.lock().unwrap().push(p.current_index);
            let tp = ThrottledProgress::new(&cb);
            tp.report("scan", 4, 5, "late starter");
            tp.report("scan", 5, 5, "done");
            tp.report("scan", 3, 5, "straggler");
            tp.report("scan", 5, 5, "done again");
        }
        assert_eq!(seen.into_inner().unwrap(), vec![4, 5]);
    }

    #[test]
    fn test_control_variants_accept_borrowing_callbacks() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("img_1.jpg"), b"\xFF\xD8\xFFone").unwrap();
        let events = Mutex::new(Vec::new());
        let report = {
            let cb = |p: &Progress| events.lock().unwrap().push((p.current_index, p.total_count));
            scan_cache_with_control(dir.path(), &ScanOptions::default(), &cb, None).unwrap()
        };
        assert_eq!(report.entries.len(), 1);
        assert_eq!(events.into_inner().unwrap().last(), Some(&(1, 1)));
    }

    #[test]
    fn test_scan_options_defaults_from_empty_json() {
        let options: ScanOptions = serde_json::from_str("{}").unwrap();
        assert!(options.locate_favorites);
        assert!(options.skip_thumbnails);
        assert!(!options.follow_links);
        assert!(options.use_index);
    }

    #[test]
    fn test_scan_fault_display() {
        let fault = ScanFault {
            locator: "a.dat".to_string(),
            reason: FaultReason::Unclassified,
        };
        assert_eq!(fault.to_string(), "a.dat: not a recognised media type");
    }
}
