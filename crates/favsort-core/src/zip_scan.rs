use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use std::time::SystemTime;

use chrono::{NaiveDate, TimeZone};
use encoding_rs::GBK;
use log::{debug, info, warn};
use unicode_normalization::UnicodeNormalization;
use zip::result::{ZipError, ZipResult};

use crate::cancel::CancellationToken;
use crate::classify::{self, needs_signature, Classified};
use crate::error::{Error, Result};
use crate::extras;
use crate::fingerprint::{self, Sample};
use crate::media::{MediaEntry, MediaKind, OrderKey, Origin, SourceLocator};
use crate::order_hint;
use crate::{FaultReason, RawScan, ScanFault, ScanOptions, ThrottledProgress};

/// Decode a zip entry name, trying UTF-8 first, then GBK
pub(crate) fn decode_entry_name(raw: &[u8]) -> String {
    if let Ok(s) = std::str::from_utf8(raw) {
        return s.nfc().collect();
    }

    // Archives made by Chinese-locale tools store names in GBK
    let (decoded, _, had_errors) = GBK.decode(raw);
    if !had_errors {
        return decoded.nfc().collect();
    }

    // Last resort: lossy UTF-8
    String::from_utf8_lossy(raw).nfc().collect()
}

fn zip_time_to_system(dt: zip::DateTime) -> Option<SystemTime> {
    let naive = NaiveDate::from_ymd_opt(dt.year() as i32, dt.month() as u32, dt.day() as u32)?
        .and_hms_opt(dt.hour() as u32, dt.minute() as u32, dt.second() as u32)?;
    let local = chrono::Local.from_local_datetime(&naive).single()?;
    Some(SystemTime::from(local))
}

fn file_name_of(entry_path: &str) -> &str {
    entry_path.rsplit('/').next().unwrap_or(entry_path)
}

fn parent_of(entry_path: &str) -> &str {
    entry_path.rsplit_once('/').map_or("", |(dir, _)| dir)
}

fn is_thumbnail(entry_path: &str, all_names: &HashSet<String>) -> bool {
    let filename = file_name_of(entry_path);
    if extras::is_video_thumbnail(filename) {
        return true;
    }
    let dir = parent_of(entry_path);
    extras::is_cover_of_sibling(filename, |sibling| {
        let candidate = if dir.is_empty() {
            sibling.to_string()
        } else {
            format!("{}/{}", dir, sibling)
        };
        all_names.contains(&candidate)
    })
}

const EOCD_SIGNATURE: &[u8] = b"PK\x05\x06";
const CENTRAL_HEADER_SIGNATURE: &[u8] = b"PK\x01\x02";
const EOCD_LEN: u64 = 22;
const CENTRAL_HEADER_LEN: usize = 46;

/// Header fields the scanner reads from one entry.
pub(crate) struct EntryInfo {
    /// Decoded entry path
    pub(crate) path: String,
    is_dir: bool,
    size: u64,
    crc32: u32,
    modified: Option<SystemTime>,
}

fn entry_info(entry: &zip::read::ZipFile) -> EntryInfo {
    EntryInfo {
        path: decode_entry_name(entry.name_raw()),
        is_dir: entry.is_dir(),
        size: entry.size(),
        crc32: entry.crc32(),
        modified: entry.last_modified().and_then(zip_time_to_system),
    }
}

/// Open the entry whose local header starts at `offset` and pass it to `f`.
///
/// Reaches entries that a later entry with the same name hides from the
/// zip crate's name index. Entries written with a trailing data descriptor
/// have no sizes in their local header and fail here.
pub(crate) fn read_local_entry<T>(
    archive_path: &Path,
    offset: u64,
    f: impl FnOnce(EntryInfo, &mut dyn Read) -> T,
) -> ZipResult<T> {
    let mut file = File::open(archive_path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut reader = BufReader::new(file);
    let mut entry = zip::read::read_zipfile_from_stream(&mut reader)?.ok_or(ZipError::FileNotFound)?;
    let info = entry_info(&entry);
    Ok(f(info, &mut entry))
}

/// One central directory record.
struct Record {
    /// Absolute offset of the local header
    offset: u64,
    name: String,
}

fn le_u16(buf: &[u8], at: usize) -> Option<u64> {
    let b = buf.get(at..at + 2)?;
    Some(u16::from_le_bytes([b[0], b[1]]) as u64)
}

fn le_u32(buf: &[u8], at: usize) -> Option<u64> {
    let b = buf.get(at..at + 4)?;
    Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as u64)
}

fn parse_records(directory: &[u8], shift: u64) -> Option<Vec<Record>> {
    let mut records = Vec::new();
    let mut pos = 0;
    while pos < directory.len() {
        let header = directory.get(pos..pos + CENTRAL_HEADER_LEN)?;
        if !header.starts_with(CENTRAL_HEADER_SIGNATURE) {
            return None;
        }
        let name_len = le_u16(header, 28)? as usize;
        let extra_len = le_u16(header, 30)? as usize;
        let comment_len = le_u16(header, 32)? as usize;
        let local = le_u32(header, 42)?;
        if local == u32::MAX as u64 {
            return None;
        }
        let name_start = pos + CENTRAL_HEADER_LEN;
        let raw_name = directory.get(name_start..name_start + name_len)?;
        records.push(Record {
            offset: local + shift,
            name: decode_entry_name(raw_name),
        });
        pos = name_start + name_len + extra_len + comment_len;
    }
    Some(records)
}

/// Every central directory record in listing order, repeated names included.
///
/// None for ZIP64 or malformed directories.
fn read_central_directory(archive_path: &Path) -> io::Result<Option<Vec<Record>>> {
    let mut file = File::open(archive_path)?;
    let len = file.metadata()?.len();
    let tail_len = len.min(EOCD_LEN + u16::MAX as u64);
    file.seek(SeekFrom::Start(len - tail_len))?;
    let mut tail = Vec::with_capacity(tail_len as usize);
    file.by_ref().take(tail_len).read_to_end(&mut tail)?;

    // The last signature wins; an archive comment may precede it
    let Some(at) = (0..tail.len()).rev().find(|&i| tail[i..].starts_with(EOCD_SIGNATURE)) else {
        return Ok(None);
    };
    let eocd = &tail[at..];
    let (Some(count), Some(size), Some(declared)) = (le_u16(eocd, 10), le_u32(eocd, 12), le_u32(eocd, 16))
    else {
        return Ok(None);
    };
    if count == u16::MAX as u64 || size == u32::MAX as u64 || declared == u32::MAX as u64 {
        return Ok(None);
    }

    // Bytes prepended to the archive shift every stored offset
    let eocd_pos = len - tail_len + at as u64;
    let Some(start) = eocd_pos.checked_sub(size) else {
        return Ok(None);
    };
    let Some(shift) = start.checked_sub(declared) else {
        return Ok(None);
    };
    file.seek(SeekFrom::Start(start))?;
    let mut directory = Vec::with_capacity(size as usize);
    file.take(size).read_to_end(&mut directory)?;
    Ok(parse_records(&directory, shift))
}

/// How to open a listed entry.
#[derive(Clone, Copy)]
enum Slot {
    /// Reachable through `by_index`
    Indexed(usize),
    /// Hidden behind a later entry of the same name
    Shadowed,
}

struct Listed {
    offset: u64,
    name: Option<String>,
    slot: Slot,
}

/// The archive's entries in listing order.
///
/// The zip crate keys its index by name, so an entry whose name repeats
/// later in the listing is unreachable through it. Counting the central
/// directory directly finds those; they are then opened at their offset.
fn list_entries(archive_path: &Path, archive: &mut zip::ZipArchive<File>) -> Vec<Listed> {
    let indexed: Vec<Listed> = (0..archive.len())
        .map(|i| {
            let raw = archive.by_index_raw(i).ok();
            Listed {
                offset: raw.as_ref().map_or(0, |e| e.header_start()),
                name: raw.map(|e| decode_entry_name(e.name_raw())),
                slot: Slot::Indexed(i),
            }
        })
        .collect();

    let records = match read_central_directory(archive_path) {
        Ok(Some(records)) if records.len() > indexed.len() => records,
        Ok(_) => return indexed,
        Err(e) => {
            debug!("Cannot re-read central directory of {}: {}", archive_path.display(), e);
            return indexed;
        }
    };

    let by_offset: HashMap<u64, usize> = indexed
        .iter()
        .enumerate()
        .filter(|(_, l)| l.name.is_some())
        .map(|(i, l)| (l.offset, i))
        .collect();
    let listed: Vec<Listed> = records
        .into_iter()
        .map(|r| Listed {
            slot: by_offset.get(&r.offset).map_or(Slot::Shadowed, |&i| Slot::Indexed(i)),
            offset: r.offset,
            name: Some(r.name),
        })
        .collect();
    warn!(
        "{} entries of {} share a name with a later entry",
        listed.iter().filter(|l| matches!(l.slot, Slot::Shadowed)).count(),
        archive_path.display()
    );
    listed
}

enum Outcome {
    Skipped,
    Fault(FaultReason),
    Media(Sample, Classified),
}

/// Filter, sample and classify one entry.
fn examine(
    info: &EntryInfo,
    mut reader: &mut dyn Read,
    locator: &str,
    options: &ScanOptions,
    all_names: &HashSet<String>,
) -> Outcome {
    let filename = file_name_of(&info.path);
    if info.is_dir || filename.is_empty() {
        return Outcome::Skipped;
    }
    if options.skip_thumbnails && is_thumbnail(&info.path, all_names) {
        debug!("Skipping video cover {}", locator);
        return Outcome::Skipped;
    }
    if !needs_signature(filename) && classify::classify(filename, None).kind == MediaKind::Unknown {
        debug!("Skipping non-media entry {}", locator);
        return Outcome::Skipped;
    }
    if info.size == 0 {
        warn!("Skipping empty entry {}", locator);
        return Outcome::Fault(FaultReason::Empty);
    }

    let sample = match fingerprint::sample_stream(&mut reader, info.crc32) {
        Ok(s) => s,
        Err(e) => {
            warn!("Skipping unreadable entry {}: {}", locator, e);
            return Outcome::Fault(FaultReason::Unreadable(e.to_string()));
        }
    };
    let classified = classify::classify(filename, Some(sample.head.as_slice()));
    if classified.kind == MediaKind::Unknown {
        warn!("Skipping unrecognised entry {}", locator);
        return Outcome::Fault(FaultReason::Unclassified);
    }
    Outcome::Media(sample, classified)
}

/// Enumerate a zip archive and collect every readable media entry.
///
/// Nothing is extracted to disk. Each media entry is streamed once to sample
/// its fingerprint and let the decoder verify its CRC.
pub fn scan_archive(
    archive_path: &Path,
    options: &ScanOptions,
    progress: &ThrottledProgress,
    cancel: Option<&CancellationToken>,
) -> Result<RawScan> {
    if !archive_path.exists() {
        return Err(Error::InputNotFound {
            path: archive_path.to_path_buf(),
        });
    }
    let file = File::open(archive_path).map_err(|source| Error::InputUnreadable {
        path: archive_path.to_path_buf(),
        source,
    })?;
    let mut archive = zip::ZipArchive::new(file).map_err(|source| Error::InvalidArchive {
        path: archive_path.to_path_buf(),
        source,
    })?;

    let listing = list_entries(archive_path, &mut archive);
    let total = listing.len() as u64;
    info!("Scanning archive {} ({} entries)", archive_path.display(), total);
    let all_names: HashSet<String> = listing.iter().filter_map(|l| l.name.clone()).collect();

    let mut entries = Vec::new();
    let mut faults = Vec::new();

    for (position, listed) in listing.iter().enumerate() {
        if let Some(token) = cancel {
            token.check()?;
        }
        progress.report(
            "scan",
            position as u64 + 1,
            total,
            &format!("Scanning entry {}/{}", position + 1, total),
        );

        let locator_of = |path: &str| format!("{}!{}", archive_path.display(), path);
        let read = match listed.slot {
            Slot::Indexed(i) => archive.by_index(i).map(|mut entry| {
                let info = entry_info(&entry);
                let outcome = examine(&info, &mut entry, &locator_of(&info.path), options, &all_names);
                (info, outcome)
            }),
            Slot::Shadowed => read_local_entry(archive_path, listed.offset, |info, reader| {
                let outcome = examine(&info, reader, &locator_of(&info.path), options, &all_names);
                (info, outcome)
            }),
        };

        let (info, outcome) = match read {
            Ok(read) => read,
            Err(e) => {
                let locator = match &listed.name {
                    Some(name) => locator_of(name),
                    None => format!("{}#{}", archive_path.display(), position),
                };
                warn!("Skipping unreadable entry {}: {}", locator, e);
                faults.push(ScanFault {
                    locator,
                    reason: FaultReason::Unreadable(e.to_string()),
                });
                continue;
            }
        };
        let (sample, classified) = match outcome {
            Outcome::Skipped => continue,
            Outcome::Fault(reason) => {
                faults.push(ScanFault {
                    locator: locator_of(&info.path),
                    reason,
                });
                continue;
            }
            Outcome::Media(sample, classified) => (sample, classified),
        };

        let filename = file_name_of(&info.path).to_string();
        // Listing order is append order; a weaker signal than a numeric token
        let order_key = match order_hint::filename_token(&filename) {
            Some(value) => OrderKey::Sequence {
                value,
                secondary: position as u128,
            },
            None => OrderKey::Position {
                index: position as u64,
            },
        };

        let discovery_index = entries.len();
        entries.push(MediaEntry {
            locator: SourceLocator::ArchiveEntry {
                archive: archive_path.to_path_buf(),
                index: position,
                offset: listed.offset,
                name: info.path,
            },
            name: filename,
            extension: classified.extension,
            kind: classified.kind,
            order_key,
            fingerprint: sample.fingerprint,
            origin: Origin::Archive,
            modified: info.modified,
            discovery_index,
            sequence_number: None,
        });
    }

    Ok(RawScan {
        root: archive_path.to_path_buf(),
        entries,
        faults,
    })
}
