use std::fmt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::Serialize;
use unicode_normalization::UnicodeNormalization;

/// Broad media class of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Unknown,
}

impl MediaKind {
    /// Images sort before videos when everything else ties.
    pub fn sort_rank(self) -> u8 {
        match self {
            MediaKind::Image => 0,
            MediaKind::Video => 1,
            MediaKind::Unknown => 2,
        }
    }
}

/// Which scanner produced an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Origin {
    CacheDirectory,
    Archive,
}

/// Where the bytes of an entry can be read from later.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SourceLocator {
    File { path: PathBuf },
    ArchiveEntry {
        archive: PathBuf,
        /// Position in the archive's central directory listing
        index: usize,
        /// Absolute offset of the entry's local header
        offset: u64,
        /// Decoded entry path inside the archive
        name: String,
    },
}

impl SourceLocator {
    /// Deterministic key used as the last tie-break between entries.
    pub fn tie_break_key(&self) -> (String, usize) {
        match self {
            SourceLocator::File { path } => (path.to_string_lossy().nfc().collect(), 0),
            SourceLocator::ArchiveEntry { name, index, .. } => (name.nfc().collect(), *index),
        }
    }
}

impl fmt::Display for SourceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceLocator::File { path } => write!(f, "{}", path.display()),
            SourceLocator::ArchiveEntry { archive, name, .. } => {
                write!(f, "{}!{}", archive.display(), name)
            }
        }
    }
}

/// How trustworthy an order key is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Low,
}

/// Sortable position of an entry.
///
/// Variant order is significant: the derived `Ord` puts every explicit
/// sequence number ahead of every fallback signal, whatever the values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(tag = "signal", rename_all = "kebab-case")]
pub enum OrderKey {
    /// Row rank in a favorites index database found next to the cache
    Indexed { rank: u64 },
    /// Numeric token found in the name; `secondary` breaks ties between equal tokens
    Sequence { value: u64, secondary: u128 },
    /// Modification time in nanoseconds since the Unix epoch
    Timestamp { nanos: u128 },
    /// Position in the archive listing
    Position { index: u64 },
    /// No signal at all; kept at the very end in discovery order
    Unordered,
}

impl OrderKey {
    pub fn confidence(&self) -> Confidence {
        match self {
            OrderKey::Indexed { .. } | OrderKey::Sequence { .. } => Confidence::High,
            _ => Confidence::Low,
        }
    }

    pub fn is_unordered(&self) -> bool {
        matches!(self, OrderKey::Unordered)
    }
}

/// Cheap identity proxy: byte size plus a partial content digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Fingerprint {
    pub size: u64,
    /// SHA-256 hex over the sampled bytes
    pub digest: String,
}

/// One discovered media resource.
#[derive(Debug, Clone, Serialize)]
pub struct MediaEntry {
    pub locator: SourceLocator,
    /// Just the filename, NFC-normalised
    pub name: String,
    /// Lowercase extension used on export (sniffed when the name has none)
    pub extension: String,
    pub kind: MediaKind,
    pub order_key: OrderKey,
    pub fingerprint: Fingerprint,
    pub origin: Origin,
    /// Modification time of the source, if known
    pub modified: Option<SystemTime>,
    /// Order in which the scanner met this entry
    pub discovery_index: usize,
    /// 1-based position in the reconciled sequence (None until reconciled)
    pub sequence_number: Option<usize>,
}

impl MediaEntry {
    pub fn confidence(&self) -> Confidence {
        self.order_key.confidence()
    }

    /// Filename stem without the extension.
    pub fn stem(&self) -> &str {
        Path::new(&self.name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(&self.name)
    }
}

/// Nanoseconds since the Unix epoch, or None for times before it.
pub(crate) fn system_time_nanos(t: SystemTime) -> Option<u128> {
    t.duration_since(SystemTime::UNIX_EPOCH)
        .ok()
        .map(|d| d.as_nanos())
}
