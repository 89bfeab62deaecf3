use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::NaiveDate;
use filetime::FileTime;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;
use zip::result::{ZipError, ZipResult};
use zip::ZipArchive;

use crate::cancel::CancellationToken;
use crate::error::{Error, Result};
use crate::media::{MediaEntry, SourceLocator};
use crate::zip_scan::{decode_entry_name, read_local_entry};
use crate::{Progress, ProgressCallback};

const UNSAFE_CHARS: &[char] = &['\\', '/', '*', '?', ':', '"', '<', '>', '|'];

/// Where and how to export a reconciled sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportOptions {
    pub destination_root: PathBuf,
    /// Folder name under the date folder; next free number when None
    #[serde(default)]
    pub folder_name: Option<String>,
    /// Copy the source modification time onto exported files
    #[serde(default = "crate::default_true")]
    pub preserve_modified: bool,
}

impl ExportOptions {
    pub fn new(destination_root: impl Into<PathBuf>) -> Self {
        Self {
            destination_root: destination_root.into(),
            folder_name: None,
            preserve_modified: true,
        }
    }
}

/// A single entry that could not be exported.
#[derive(Debug, Clone, Serialize)]
pub struct ExportFailure {
    pub source_name: String,
    pub destination: PathBuf,
    pub reason: String,
}

/// Terminal summary of an export.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExportSummary {
    pub succeeded_count: u64,
    pub skipped_count: u64,
    pub failed_count: u64,
    pub destination_folder: PathBuf,
    /// Stopped early on request; entries after the last attempted one were not touched
    pub cancelled: bool,
    pub failures: Vec<ExportFailure>,
}

impl ExportSummary {
    /// Number of entries whose copy was started.
    pub fn attempted(&self) -> u64 {
        self.succeeded_count + self.skipped_count + self.failed_count
    }
}

/// One planned copy.
#[derive(Debug, Clone)]
pub struct PlannedCopy {
    pub sequence_number: usize,
    pub source: SourceLocator,
    pub source_name: String,
    pub destination: PathBuf,
    pub modified: Option<SystemTime>,
}

/// Every destination path of an export, fixed before any byte is written.
#[derive(Debug, Clone)]
pub struct ExportPlan {
    pub folder: PathBuf,
    pub items: Vec<PlannedCopy>,
}

/// Make a name safe for common filesystems.
///
/// Reserved characters become `_`. A name that ends up empty or hidden is
/// replaced by `file_<hash>` so it stays unique and visible.
pub fn safe_filename(name: &str) -> String {
    let normalized: String = name.nfc().collect();
    let cleaned: String = normalized
        .trim()
        .chars()
        .map(|c| if UNSAFE_CHARS.contains(&c) || c.is_control() { '_' } else { c })
        .collect();
    if cleaned.is_empty() || cleaned.starts_with('.') {
        let digest = hex::encode(Sha256::digest(normalized.as_bytes()));
        return format!("file_{}", &digest[..8]);
    }
    cleaned
}

/// Next integer after the largest purely numeric folder name in `dir`.
fn next_folder_number(dir: &Path) -> u64 {
    let Ok(entries) = fs::read_dir(dir) else {
        return 1;
    };
    entries
        .flatten()
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().to_str().and_then(|n| n.parse::<u64>().ok()))
        .max()
        .map_or(1, |n| n + 1)
}

/// Choose the export folder: `<root>/<YYYY-MM-DD>/<name or number>`.
pub fn resolve_folder(destination_root: &Path, folder_name: Option<&str>, today: NaiveDate) -> PathBuf {
    let date_dir = destination_root.join(today.format("%Y-%m-%d").to_string());

    let custom = folder_name.map(str::trim).filter(|n| !n.is_empty()).map(safe_filename);
    let Some(name) = custom else {
        return date_dir.join(next_folder_number(&date_dir).to_string());
    };

    let base = date_dir.join(&name);
    if !base.exists() {
        return base;
    }
    let mut counter = 1u32;
    loop {
        let candidate = date_dir.join(format!("{}_{}", name, counter));
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}

/// Assign a destination for every entry, in sequence order.
pub fn plan_export(entries: &[MediaEntry], options: &ExportOptions, today: NaiveDate) -> ExportPlan {
    let folder = resolve_folder(&options.destination_root, options.folder_name.as_deref(), today);
    let width = entries.len().to_string().len();

    // Use counters per base name; compared case-insensitively for case-insensitive filesystems
    let mut name_counters: HashMap<String, u32> = HashMap::new();
    let mut used: std::collections::HashSet<String> = std::collections::HashSet::new();
    let mut items = Vec::with_capacity(entries.len());

    for (i, entry) in entries.iter().enumerate() {
        let sequence_number = entry.sequence_number.unwrap_or(i + 1);
        let stem = format!("{:0width$}_{}", sequence_number, safe_filename(entry.stem()), width = width);
        let with_ext = |s: &str| {
            if entry.extension.is_empty() {
                s.to_string()
            } else {
                format!("{}.{}", s, entry.extension)
            }
        };

        let base = with_ext(&stem);
        let counter = name_counters.entry(base.to_lowercase()).or_insert(0);
        let file_name = if *counter == 0 && !used.contains(&base.to_lowercase()) {
            base
        } else {
            loop {
                *counter += 1;
                let candidate = with_ext(&format!("{}_{}", stem, counter));
                if !used.contains(&candidate.to_lowercase()) {
                    break candidate;
                }
            }
        };
        used.insert(file_name.to_lowercase());

        items.push(PlannedCopy {
            sequence_number,
            source: entry.locator.clone(),
            source_name: entry.name.clone(),
            destination: folder.join(&file_name),
            modified: entry.modified,
        });
    }

    ExportPlan { folder, items }
}

enum CopyOutcome {
    Copied,
    Skipped(String),
    Failed(String),
}

struct OpenArchive {
    path: PathBuf,
    zip: ZipArchive<File>,
    /// Local header offset to `by_index` position
    by_offset: HashMap<u64, usize>,
}

/// Keeps the most recently used archive open across consecutive entries.
#[derive(Default)]
struct ArchiveCache {
    open: Option<OpenArchive>,
}

impl ArchiveCache {
    fn get(&mut self, path: &Path) -> ZipResult<&mut OpenArchive> {
        let reuse = matches!(&self.open, Some(a) if a.path == path);
        if !reuse {
            self.open = None;
            let mut zip = ZipArchive::new(File::open(path)?)?;
            let mut by_offset = HashMap::with_capacity(zip.len());
            for i in 0..zip.len() {
                if let Ok(entry) = zip.by_index_raw(i) {
                    by_offset.insert(entry.header_start(), i);
                }
            }
            self.open = Some(OpenArchive {
                path: path.to_path_buf(),
                zip,
                by_offset,
            });
        }
        self.open.as_mut().ok_or(ZipError::FileNotFound)
    }
}

fn part_path(dest: &Path) -> PathBuf {
    let mut part = dest.as_os_str().to_owned();
    part.push(".part");
    PathBuf::from(part)
}

/// Stream into `<dest>.part`, then rename. The partial file never survives a failure.
fn write_atomically(reader: &mut impl Read, dest: &Path) -> io::Result<()> {
    let part = part_path(dest);
    let result = (|| {
        let mut out = BufWriter::new(File::create(&part)?);
        io::copy(reader, &mut out)?;
        out.flush()?;
        fs::rename(&part, dest)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&part);
    }
    result
}

fn copy_item(item: &PlannedCopy, archives: &mut ArchiveCache) -> CopyOutcome {
    match &item.source {
        SourceLocator::File { path } => {
            if !path.exists() {
                return CopyOutcome::Skipped("source no longer exists".to_string());
            }
            let mut file = match File::open(path) {
                Ok(f) => f,
                Err(e) => return CopyOutcome::Failed(e.to_string()),
            };
            match write_atomically(&mut file, &item.destination) {
                Ok(()) => CopyOutcome::Copied,
                Err(e) => CopyOutcome::Failed(e.to_string()),
            }
        }
        SourceLocator::ArchiveEntry {
            archive,
            offset,
            name,
            ..
        } => {
            if !archive.exists() {
                return CopyOutcome::Skipped("archive no longer exists".to_string());
            }
            let open = match archives.get(archive) {
                Ok(a) => a,
                Err(e) => return CopyOutcome::Failed(e.to_string()),
            };
            let copy = |path: &str, mut reader: &mut dyn Read| {
                if path != name.as_str() {
                    return CopyOutcome::Skipped("archive changed since the scan".to_string());
                }
                match write_atomically(&mut reader, &item.destination) {
                    Ok(()) => CopyOutcome::Copied,
                    Err(e) => CopyOutcome::Failed(e.to_string()),
                }
            };
            let read = match open.by_offset.get(offset) {
                Some(&i) => open
                    .zip
                    .by_index(i)
                    .map(|mut entry| copy(&decode_entry_name(entry.name_raw()), &mut entry)),
                // Shadowed by a later entry of the same name
                None => read_local_entry(archive, *offset, |info, reader| copy(&info.path, reader)),
            };
            match read {
                Ok(outcome) => outcome,
                Err(ZipError::FileNotFound) => CopyOutcome::Skipped("entry no longer exists".to_string()),
                Err(e) => CopyOutcome::Failed(e.to_string()),
            }
        }
    }
}

/// Run a plan in order, one entry at a time.
///
/// Cancellation is checked before each entry's I/O; entries already copied
/// stay in place and the summary is marked `cancelled`.
pub fn execute_plan(
    plan: &ExportPlan,
    options: &ExportOptions,
    progress: &ProgressCallback<'_>,
    cancel: Option<&CancellationToken>,
) -> Result<ExportSummary> {
    let mut summary = ExportSummary {
        destination_folder: plan.folder.clone(),
        ..Default::default()
    };
    if plan.items.is_empty() {
        info!("Nothing to export");
        return Ok(summary);
    }

    fs::create_dir_all(&plan.folder).map_err(|source| Error::Destination {
        path: plan.folder.clone(),
        source,
    })?;
    let total = plan.items.len() as u64;
    info!("Exporting {} files to {}", total, plan.folder.display());

    let mut archives = ArchiveCache::default();
    for (i, item) in plan.items.iter().enumerate() {
        if cancel.is_some_and(|t| t.is_cancelled()) {
            info!("Export cancelled after {} of {} entries", i, total);
            summary.cancelled = true;
            break;
        }
        let current = i as u64 + 1;
        progress(&Progress {
            stage: "export".to_string(),
            current_index: current,
            total_count: total,
            status_message: format!("Saving {} ({}/{})", item.source_name, current, total),
        });

        match copy_item(item, &mut archives) {
            CopyOutcome::Copied => {
                summary.succeeded_count += 1;
                if options.preserve_modified {
                    if let Some(t) = item.modified {
                        if let Err(e) = filetime::set_file_mtime(&item.destination, FileTime::from_system_time(t)) {
                            warn!("Cannot set modification time on {}: {}", item.destination.display(), e);
                        }
                    }
                }
            }
            CopyOutcome::Skipped(reason) => {
                warn!("Skipping {}: {}", item.source, reason);
                summary.skipped_count += 1;
            }
            CopyOutcome::Failed(reason) => {
                warn!("Failed to export {}: {}", item.source, reason);
                summary.failed_count += 1;
                summary.failures.push(ExportFailure {
                    source_name: item.source_name.clone(),
                    destination: item.destination.clone(),
                    reason,
                });
            }
        }
    }

    info!(
        "Export finished: {} succeeded, {} skipped, {} failed",
        summary.succeeded_count, summary.skipped_count, summary.failed_count
    );
    Ok(summary)
}

/// Plan against today's local date and execute.
pub fn export(
    entries: &[MediaEntry],
    options: &ExportOptions,
    progress: &ProgressCallback<'_>,
    cancel: Option<&CancellationToken>,
) -> Result<ExportSummary> {
    let today = chrono::Local::now().date_naive();
    let plan = plan_export(entries, options, today);
    execute_plan(&plan, options, progress, cancel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{Fingerprint, MediaKind, OrderKey, Origin};
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::tempdir;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 17).unwrap()
    }

    fn file_entry(path: &Path, seq: usize) -> MediaEntry {
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        MediaEntry {
            locator: SourceLocator::File { path: path.to_path_buf() },
            extension: name.rsplit('.').next().unwrap_or("").to_lowercase(),
            name,
            kind: MediaKind::Image,
            order_key: OrderKey::Sequence { value: seq as u64, secondary: 0 },
            fingerprint: Fingerprint {
                size: 1,
                digest: seq.to_string(),
            },
            origin: Origin::CacheDirectory,
            modified: None,
            discovery_index: seq,
            sequence_number: Some(seq),
        }
    }

    fn sources(dir: &Path, count: usize) -> Vec<MediaEntry> {
        (1..=count)
            .map(|i| {
                let path = dir.join(format!("img_{}.jpg", i));
                fs::write(&path, format!("bytes {}", i)).unwrap();
                file_entry(&path, i)
            })
            .collect()
    }

    fn quiet(_: &Progress) {}

    #[test]
    fn test_safe_filename() {
        assert_eq!(safe_filename("a:b*c?.jpg"), "a_b_c_.jpg");
        assert_eq!(safe_filename("dir/name"), "dir_name");
        let hidden = safe_filename(".hidden");
        assert!(hidden.starts_with("file_") && hidden.len() == 13);
        assert_eq!(safe_filename(""), safe_filename(""));
        // NFD "é" becomes NFC
        assert_eq!(safe_filename("e\u{301}"), "\u{e9}");
    }

    #[test]
    fn test_plan_names_are_padded_and_ordered() {
        let src = tempdir().unwrap();
        let out = tempdir().unwrap();
        let entries = sources(src.path(), 12);
        let plan = plan_export(&entries, &ExportOptions::new(out.path()), day());

        assert_eq!(plan.folder, out.path().join("2024-05-17").join("1"));
        let names: Vec<String> = plan
            .items
            .iter()
            .map(|p| p.destination.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names[0], "01_img_1.jpg");
        assert_eq!(names[11], "12_img_12.jpg");
    }

    #[test]
    fn test_plan_collision_gets_suffix() {
        let src = tempdir().unwrap();
        let out = tempdir().unwrap();
        let mut entries = sources(src.path(), 2);
        entries[1].sequence_number = Some(1);
        entries[1].name = "IMG_1.JPG".to_string();
        entries[1].extension = "jpg".to_string();

        let plan = plan_export(&entries, &ExportOptions::new(out.path()), day());
        assert_eq!(plan.items[0].destination.file_name().unwrap(), "1_img_1.jpg");
        assert_eq!(plan.items[1].destination.file_name().unwrap(), "1_IMG_1_1.jpg");
    }

    #[test]
    fn test_folder_numbering_and_custom_names() {
        let out = tempdir().unwrap();
        let date_dir = out.path().join("2024-05-17");
        fs::create_dir_all(date_dir.join("1")).unwrap();
        fs::create_dir_all(date_dir.join("3")).unwrap();
        fs::create_dir_all(date_dir.join("trip")).unwrap();
        fs::create_dir_all(date_dir.join("trip_1")).unwrap();

        assert_eq!(resolve_folder(out.path(), None, day()), date_dir.join("4"));
        assert_eq!(resolve_folder(out.path(), Some("  "), day()), date_dir.join("4"));
        assert_eq!(resolve_folder(out.path(), Some("trip"), day()), date_dir.join("trip_2"));
        assert_eq!(resolve_folder(out.path(), Some("new"), day()), date_dir.join("new"));
    }

    #[test]
    fn test_export_copies_in_order_with_events() {
        let src = tempdir().unwrap();
        let out = tempdir().unwrap();
        let entries = sources(src.path(), 3);
        let events = Mutex::new(Vec::new());
        let cb = |p: &Progress| events.lock().unwrap().push(p.current_index);

        let summary = export(&entries, &ExportOptions::new(out.path()), &cb, None).unwrap();
        assert_eq!(summary.succeeded_count, 3);
        assert_eq!(summary.attempted(), 3);
        assert!(!summary.cancelled);
        assert_eq!(events.into_inner().unwrap(), vec![1, 2, 3]);
        let copied = fs::read_to_string(summary.destination_folder.join("2_img_2.jpg")).unwrap();
        assert_eq!(copied, "bytes 2");
        assert!(!summary.destination_folder.join("2_img_2.jpg.part").exists());
    }

    #[test]
    fn test_missing_source_is_skipped() {
        let src = tempdir().unwrap();
        let out = tempdir().unwrap();
        let entries = sources(src.path(), 3);
        fs::remove_file(src.path().join("img_2.jpg")).unwrap();

        let summary = export(&entries, &ExportOptions::new(out.path()), &quiet, None).unwrap();
        assert_eq!(summary.succeeded_count, 2);
        assert_eq!(summary.skipped_count, 1);
        assert_eq!(summary.failed_count, 0);
    }

    #[test]
    fn test_unreadable_source_is_failed() {
        let src = tempdir().unwrap();
        let out = tempdir().unwrap();
        let mut entries = sources(src.path(), 2);
        // A directory exists but cannot be streamed as a file
        let dir_source = src.path().join("folder.jpg");
        fs::create_dir(&dir_source).unwrap();
        entries[1].locator = SourceLocator::File { path: dir_source };

        let summary = export(&entries, &ExportOptions::new(out.path()), &quiet, None).unwrap();
        assert_eq!(summary.succeeded_count, 1);
        assert_eq!(summary.failed_count, 1);
        assert_eq!(summary.failures[0].source_name, "img_2.jpg");
        assert!(fs::read_dir(&summary.destination_folder)
            .unwrap()
            .flatten()
            .all(|e| !e.file_name().to_string_lossy().ends_with(".part")));
    }

    #[test]
    fn test_cancel_before_start() {
        let src = tempdir().unwrap();
        let out = tempdir().unwrap();
        let entries = sources(src.path(), 3);
        let token = CancellationToken::new();
        token.cancel();
        let events = Mutex::new(0u32);
        let cb = |_: &Progress| *events.lock().unwrap() += 1;

        let summary = export(&entries, &ExportOptions::new(out.path()), &cb, Some(&token)).unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.attempted(), 0);
        assert_eq!(events.into_inner().unwrap(), 0);
    }

    #[test]
    fn test_cancel_mid_stream() {
        let src = tempdir().unwrap();
        let out = tempdir().unwrap();
        let entries = sources(src.path(), 5);
        let token = CancellationToken::new();
        let events = Mutex::new(Vec::new());
        let cb = |p: &Progress| {
            events.lock().unwrap().push(p.current_index);
            if p.current_index == 2 {
                token.cancel();
            }
        };

        let summary = export(&entries, &ExportOptions::new(out.path()), &cb, Some(&token)).unwrap();
        let events = events.into_inner().unwrap();
        assert!(summary.cancelled);
        assert_eq!(events, vec![1, 2]);
        assert!(summary.attempted() <= events.len() as u64);
        assert_eq!(summary.succeeded_count, 2);
    }

    #[test]
    fn test_empty_sequence_exports_nothing() {
        let out = tempdir().unwrap();
        let summary = export(&[], &ExportOptions::new(out.path()), &quiet, None).unwrap();
        assert_eq!(summary.attempted(), 0);
        assert!(!summary.destination_folder.exists());
    }

    #[test]
    fn test_destination_fault() {
        let src = tempdir().unwrap();
        let out = tempdir().unwrap();
        let blocker = out.path().join("not_a_dir");
        fs::write(&blocker, b"x").unwrap();
        let entries = sources(src.path(), 1);

        let err = export(&entries, &ExportOptions::new(&blocker), &quiet, None).unwrap_err();
        assert!(matches!(err, Error::Destination { .. }));
    }

    #[test]
    fn test_modification_time_preserved() {
        let src = tempdir().unwrap();
        let out = tempdir().unwrap();
        let mut entries = sources(src.path(), 1);
        entries[0].modified = Some(SystemTime::UNIX_EPOCH + Duration::from_secs(1_600_000_000));

        let summary = export(&entries, &ExportOptions::new(out.path()), &quiet, None).unwrap();
        let meta = fs::metadata(summary.destination_folder.join("1_img_1.jpg")).unwrap();
        assert_eq!(FileTime::from_last_modification_time(&meta).unix_seconds(), 1_600_000_000);
    }

    #[test]
    fn test_export_from_archive() {
        use zip::write::SimpleFileOptions;

        let src = tempdir().unwrap();
        let out = tempdir().unwrap();
        let archive = src.path().join("fav.zip");
        let mut zip = zip::ZipWriter::new(File::create(&archive).unwrap());
        zip.start_file("b.png", SimpleFileOptions::default()).unwrap();
        zip.write_all(b"\x89PNG\r\n\x1A\nbbb").unwrap();
        zip.start_file("sub/a.png", SimpleFileOptions::default()).unwrap();
        zip.write_all(b"\x89PNG\r\n\x1A\naaa").unwrap();
        zip.finish().unwrap();

        let report = crate::scan_archive(&archive, &crate::ScanOptions::default()).unwrap();
        let summary = export(&report.entries, &ExportOptions::new(out.path()), &quiet, None).unwrap();
        assert_eq!(summary.succeeded_count, 2);
        let first = fs::read(summary.destination_folder.join("1_b.png")).unwrap();
        assert_eq!(first, b"\x89PNG\r\n\x1A\nbbb");
        assert!(summary.destination_folder.join("2_a.png").exists());
    }

    #[test]
    fn test_export_entries_sharing_a_name() {
        let src = tempdir().unwrap();
        let out = tempdir().unwrap();
        let archive = src.path().join("dup.zip");
        let first: &[u8] = b"\x89PNG\r\n\x1A\nFIRST-A";
        let other: &[u8] = b"\x89PNG\r\n\x1A\nbbb";
        let second: &[u8] = b"\x89PNG\r\n\x1A\nSECOND-A";
        crate::zip_scan::fixtures::write_zip_renamed(
            &archive,
            &[("a.png", first), ("b.png", other), ("c.png", second)],
            "c.png",
            "a.png",
        );

        let report = crate::scan_archive(&archive, &crate::ScanOptions::default()).unwrap();
        let summary = export(&report.entries, &ExportOptions::new(out.path()), &quiet, None).unwrap();
        assert_eq!(summary.succeeded_count, 3);
        let folder = &summary.destination_folder;
        assert_eq!(fs::read(folder.join("1_a.png")).unwrap(), first);
        assert_eq!(fs::read(folder.join("2_b.png")).unwrap(), other);
        assert_eq!(fs::read(folder.join("3_a.png")).unwrap(), second);
    }
}
