use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, info, warn};
use rayon::prelude::*;
use unicode_normalization::UnicodeNormalization;
use walkdir::WalkDir;

use crate::cancel::CancellationToken;
use crate::classify::{self, needs_signature};
use crate::error::{Error, Result};
use crate::extras;
use crate::fingerprint::{self, Sample};
use crate::locate;
use crate::media::{system_time_nanos, MediaEntry, MediaKind, OrderKey, Origin, SourceLocator};
use crate::order_hint;
use crate::sidecar::{self, SidecarIndex};
use crate::{FaultReason, RawScan, ScanFault, ScanOptions, ThrottledProgress};

/// A file that passed the name checks and still has to be sampled
struct Candidate {
    path: PathBuf,
    name: String,
}

fn check_root(root: &Path) -> Result<()> {
    if !root.exists() {
        return Err(Error::InputNotFound {
            path: root.to_path_buf(),
        });
    }
    if !root.is_dir() {
        return Err(Error::InputUnreadable {
            path: root.to_path_buf(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "not a directory"),
        });
    }
    fs::read_dir(root).map_err(|source| Error::InputUnreadable {
        path: root.to_path_buf(),
        source,
    })?;
    Ok(())
}

fn is_thumbnail(path: &Path, name: &str) -> bool {
    if extras::is_video_thumbnail(name) {
        return true;
    }
    let parent = path.parent().unwrap_or(Path::new(""));
    extras::is_cover_of_sibling(name, |sibling| parent.join(sibling).is_file())
}

/// Derive the order key from the index rank, then the filename, then the
/// parent folder name (only below `scan_root`), then the modification time.
fn order_key_for(
    path: &Path,
    name: &str,
    scan_root: &Path,
    index: Option<&SidecarIndex>,
    modified_nanos: Option<u128>,
) -> OrderKey {
    if let Some(rank) = index.and_then(|i| i.rank_of(name)) {
        return OrderKey::Indexed { rank };
    }
    let folder_token = || {
        path.parent()
            .filter(|p| *p != scan_root && p.starts_with(scan_root))
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .and_then(order_hint::sequence_token)
    };
    match order_hint::filename_token(name).or_else(folder_token) {
        Some(value) => OrderKey::Sequence {
            value,
            secondary: modified_nanos.unwrap_or(0),
        },
        None => match modified_nanos {
            Some(nanos) => OrderKey::Timestamp { nanos },
            None => OrderKey::Unordered,
        },
    }
}

fn collect_candidates(
    scan_root: &Path,
    options: &ScanOptions,
    index_path: Option<&Path>,
    faults: &mut Vec<ScanFault>,
    cancel: Option<&CancellationToken>,
) -> Result<Vec<Candidate>> {
    let mut candidates = Vec::new();
    let walker = WalkDir::new(scan_root)
        .follow_links(options.follow_links)
        .sort_by_file_name();

    for entry in walker {
        if let Some(token) = cancel {
            token.check()?;
        }
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                let locator = e
                    .path()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| scan_root.display().to_string());
                warn!("Cannot traverse {}: {}", locator, e);
                faults.push(ScanFault {
                    locator,
                    reason: FaultReason::Walk(e.to_string()),
                });
                continue;
            }
        };
        if !entry.file_type().is_file() || index_path == Some(entry.path()) {
            continue;
        }

        let name: String = entry.file_name().to_string_lossy().nfc().collect();
        if options.skip_thumbnails && is_thumbnail(entry.path(), &name) {
            debug!("Skipping video cover {}", entry.path().display());
            continue;
        }
        if !needs_signature(&name) && classify::classify(&name, None).kind == MediaKind::Unknown {
            debug!("Skipping non-media file {}", entry.path().display());
            continue;
        }
        candidates.push(Candidate {
            path: entry.into_path(),
            name,
        });
    }
    Ok(candidates)
}

/// Walk a cache directory and collect every readable media file.
///
/// The result is in discovery order (sorted walk); ordering happens in
/// [`crate::reconcile`].
pub fn scan_directory(
    root: &Path,
    options: &ScanOptions,
    progress: &ThrottledProgress,
    cancel: Option<&CancellationToken>,
) -> Result<RawScan> {
    check_root(root)?;
    let scan_root = if options.locate_favorites {
        locate::locate_favorites_root(root)
    } else {
        root.to_path_buf()
    };
    info!("Scanning cache folder {}", scan_root.display());

    let index = if options.use_index {
        sidecar::load(&scan_root)
    } else {
        None
    };

    let mut faults = Vec::new();
    let index_path = index.as_ref().map(|i| i.path.as_path());
    let candidates = collect_candidates(&scan_root, options, index_path, &mut faults, cancel)?;
    let total = candidates.len() as u64;
    info!("Found {} candidate files", total);

    // Sampling reads every file once; it doubles as the readability check
    let counter = AtomicU64::new(0);
    let samples: Vec<Option<io::Result<Sample>>> = candidates
        .par_iter()
        .map(|c| {
            if cancel.is_some_and(|t| t.is_cancelled()) {
                return None;
            }
            let sample = fingerprint::sample_file(&c.path);
            let current = counter.fetch_add(1, Ordering::Relaxed) + 1;
            progress.report("scan", current, total, &format!("Reading {}", c.name));
            Some(sample)
        })
        .collect();
    if let Some(token) = cancel {
        token.check()?;
    }

    let mut entries = Vec::with_capacity(candidates.len());
    for (discovery_index, (candidate, sample)) in candidates.into_iter().zip(samples).enumerate() {
        let locator = candidate.path.display().to_string();
        let sample = match sample {
            Some(Ok(s)) => s,
            Some(Err(e)) => {
                warn!("Skipping unreadable file {}: {}", locator, e);
                faults.push(ScanFault {
                    locator,
                    reason: FaultReason::Unreadable(e.to_string()),
                });
                continue;
            }
            None => return Err(Error::Cancelled),
        };
        if sample.fingerprint.size == 0 {
            warn!("Skipping empty file {}", locator);
            faults.push(ScanFault {
                locator,
                reason: FaultReason::Empty,
            });
            continue;
        }

        let classified = classify::classify(&candidate.name, Some(sample.head.as_slice()));
        if classified.kind == MediaKind::Unknown {
            warn!("Skipping unrecognised file {}", locator);
            faults.push(ScanFault {
                locator,
                reason: FaultReason::Unclassified,
            });
            continue;
        }

        let modified = fs::metadata(&candidate.path).and_then(|m| m.modified()).ok();
        let order_key = order_key_for(
            &candidate.path,
            &candidate.name,
            &scan_root,
            index.as_ref(),
            modified.and_then(system_time_nanos),
        );

        entries.push(MediaEntry {
            locator: SourceLocator::File {
                path: candidate.path,
            },
            name: candidate.name,
            extension: classified.extension,
            kind: classified.kind,
            order_key,
            fingerprint: sample.fingerprint,
            origin: Origin::CacheDirectory,
            modified,
            discovery_index,
            sequence_number: None,
        });
    }

    Ok(RawScan {
        root: scan_root,
        entries,
        faults,
    })
}
