use std::cmp::Ordering;
use std::collections::HashMap;

use log::{debug, info};

use crate::media::{Fingerprint, MediaEntry};

/// Output of [`reconcile`].
#[derive(Debug)]
pub struct Reconciled {
    pub entries: Vec<MediaEntry>,
    pub duplicates_collapsed: usize,
}

/// Preference among entries sharing a fingerprint: stronger key first, then
/// earlier key value, then a stable lexical tie-break.
fn representative_order(a: &MediaEntry, b: &MediaEntry) -> Ordering {
    a.order_key
        .cmp(&b.order_key)
        .then_with(|| a.locator.tie_break_key().cmp(&b.locator.tie_break_key()))
        .then_with(|| a.discovery_index.cmp(&b.discovery_index))
}

/// Final display order.
fn display_order(a: &MediaEntry, b: &MediaEntry) -> Ordering {
    a.order_key
        .cmp(&b.order_key)
        .then_with(|| {
            // Unordered entries keep the order the scanner met them in
            if a.order_key.is_unordered() {
                a.discovery_index.cmp(&b.discovery_index)
            } else {
                Ordering::Equal
            }
        })
        .then_with(|| a.kind.sort_rank().cmp(&b.kind.sort_rank()))
        .then_with(|| a.locator.tie_break_key().cmp(&b.locator.tie_break_key()))
        .then_with(|| a.discovery_index.cmp(&b.discovery_index))
}

/// Collapse duplicate fingerprints, sort into display order and assign
/// 1-based sequence numbers.
///
/// The result depends only on the set of entries, not on their input order.
pub fn reconcile(entries: Vec<MediaEntry>) -> Reconciled {
    let total = entries.len();

    // Group by fingerprint, keep best
    let mut groups: HashMap<&Fingerprint, usize> = HashMap::new();
    for (i, entry) in entries.iter().enumerate() {
        groups
            .entry(&entry.fingerprint)
            .and_modify(|best| {
                if representative_order(entry, &entries[*best]) == Ordering::Less {
                    *best = i;
                }
            })
            .or_insert(i);
    }

    let mut keep = vec![false; total];
    for &i in groups.values() {
        keep[i] = true;
    }

    let mut survivors: Vec<MediaEntry> = Vec::with_capacity(total);
    for (entry, kept) in entries.into_iter().zip(keep) {
        if kept {
            survivors.push(entry);
        } else {
            debug!("Collapsing duplicate {}", entry.locator);
        }
    }
    let duplicates_collapsed = total - survivors.len();
    if duplicates_collapsed > 0 {
        info!("Collapsed {} duplicate entries", duplicates_collapsed);
    }

    survivors.sort_by(display_order);
    number(&mut survivors);

    Reconciled {
        entries: survivors,
        duplicates_collapsed,
    }
}

/// Re-sequence a reconciled list by modification time, oldest first.
///
/// Entries without a known time go last, keeping their current relative order.
pub fn reorder_by_modified(mut entries: Vec<MediaEntry>) -> Vec<MediaEntry> {
    entries.sort_by_key(|e| (e.modified.is_none(), e.modified));
    number(&mut entries);
    entries
}

fn number(entries: &mut [MediaEntry]) {
    for (i, entry) in entries.iter_mut().enumerate() {
        entry.sequence_number = Some(i + 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{Confidence, MediaKind, OrderKey, Origin, SourceLocator};
    use std::path::PathBuf;
    use std::time::{Duration, SystemTime};

    fn entry(name: &str, kind: MediaKind, order_key: OrderKey, digest: &str, discovery_index: usize) -> MediaEntry {
        MediaEntry {
            locator: SourceLocator::File {
                path: PathBuf::from("/fav").join(name),
            },
            name: name.to_string(),
            extension: name.rsplit('.').next().unwrap_or("").to_string(),
            kind,
            order_key,
            fingerprint: Fingerprint {
                size: 10,
                digest: digest.to_string(),
            },
            origin: Origin::CacheDirectory,
            modified: None,
            discovery_index,
            sequence_number: None,
        }
    }

    fn seq(value: u64) -> OrderKey {
        OrderKey::Sequence { value, secondary: 0 }
    }

    fn names(entries: &[MediaEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.name.as_str()).collect()
    }

    #[test]
    fn test_numeric_tokens_interleave_kinds() {
        let input = vec![
            entry("img_003.jpg", MediaKind::Image, seq(3), "a", 0),
            entry("img_001.jpg", MediaKind::Image, seq(1), "b", 1),
            entry("video_002.mp4", MediaKind::Video, seq(2), "c", 2),
        ];
        let out = reconcile(input).entries;
        assert_eq!(names(&out), vec!["img_001.jpg", "video_002.mp4", "img_003.jpg"]);
        let numbers: Vec<_> = out.iter().map(|e| e.sequence_number).collect();
        assert_eq!(numbers, vec![Some(1), Some(2), Some(3)]);
    }

    #[test]
    fn test_timestamps_order_low_confidence_entries() {
        let input = vec![
            entry("clip.mp4", MediaKind::Video, OrderKey::Timestamp { nanos: 2_000 }, "a", 0),
            entry("photo.jpg", MediaKind::Image, OrderKey::Timestamp { nanos: 1_000 }, "b", 1),
        ];
        let out = reconcile(input).entries;
        assert_eq!(names(&out), vec!["photo.jpg", "clip.mp4"]);
        assert!(out.iter().all(|e| e.confidence() == Confidence::Low));
    }

    #[test]
    fn test_high_confidence_before_low_regardless_of_value() {
        let input = vec![
            entry("early.jpg", MediaKind::Image, OrderKey::Timestamp { nanos: 0 }, "a", 0),
            entry("pos.jpg", MediaKind::Image, OrderKey::Position { index: 0 }, "b", 1),
            entry("img_999999.jpg", MediaKind::Image, seq(999_999), "c", 2),
        ];
        let out = reconcile(input).entries;
        assert_eq!(out[0].name, "img_999999.jpg");
        assert_eq!(out[0].confidence(), Confidence::High);
    }

    #[test]
    fn test_duplicate_keeps_most_trustworthy() {
        let input = vec![
            entry("copy.jpg", MediaKind::Image, OrderKey::Timestamp { nanos: 5 }, "same", 0),
            entry("img_4.jpg", MediaKind::Image, seq(4), "same", 1),
            entry("other.jpg", MediaKind::Image, OrderKey::Timestamp { nanos: 9 }, "diff", 2),
        ];
        let result = reconcile(input);
        assert_eq!(result.duplicates_collapsed, 1);
        assert_eq!(names(&result.entries), vec!["img_4.jpg", "other.jpg"]);
    }

    #[test]
    fn test_archive_duplicate_listing() {
        let archive = |name: &str, index: usize, digest: &str| {
            let mut e = entry(name, MediaKind::Image, OrderKey::Position { index: index as u64 }, digest, index);
            e.locator = SourceLocator::ArchiveEntry {
                archive: PathBuf::from("fav.zip"),
                index,
                offset: index as u64 * 64,
                name: name.to_string(),
            };
            e.origin = Origin::Archive;
            e
        };
        let input = vec![archive("a.png", 0, "a"), archive("b.png", 1, "b"), archive("a.png", 2, "a")];
        let out = reconcile(input).entries;
        assert_eq!(out.len(), 2);
        assert!(matches!(out[0].locator, SourceLocator::ArchiveEntry { index: 0, .. }));
        assert_eq!(out[1].name, "b.png");
    }

    #[test]
    fn test_result_independent_of_input_order() {
        let build = || {
            vec![
                entry("x.jpg", MediaKind::Image, OrderKey::Timestamp { nanos: 7 }, "1", 0),
                entry("y.mp4", MediaKind::Video, OrderKey::Timestamp { nanos: 7 }, "2", 1),
                entry("img_2.jpg", MediaKind::Image, seq(2), "3", 2),
                entry("dup_of_x.jpg", MediaKind::Image, OrderKey::Timestamp { nanos: 7 }, "1", 3),
                entry("img_1.jpg", MediaKind::Image, seq(1), "4", 4),
            ]
        };
        let forward = reconcile(build()).entries;
        let mut reversed_input = build();
        reversed_input.reverse();
        let reversed = reconcile(reversed_input).entries;

        assert_eq!(names(&forward), names(&reversed));
        assert_eq!(names(&forward), vec!["img_1.jpg", "img_2.jpg", "dup_of_x.jpg", "y.mp4"]);
    }

    #[test]
    fn test_exact_tie_puts_image_first() {
        let input = vec![
            entry("a.mp4", MediaKind::Video, OrderKey::Timestamp { nanos: 1 }, "v", 0),
            entry("b.jpg", MediaKind::Image, OrderKey::Timestamp { nanos: 1 }, "i", 1),
        ];
        let out = reconcile(input).entries;
        assert_eq!(names(&out), vec!["b.jpg", "a.mp4"]);
    }

    #[test]
    fn test_unordered_entries_last_in_discovery_order() {
        let input = vec![
            entry("zeta", MediaKind::Video, OrderKey::Unordered, "1", 0),
            entry("alpha", MediaKind::Image, OrderKey::Unordered, "2", 1),
            entry("late.jpg", MediaKind::Image, OrderKey::Timestamp { nanos: u128::MAX }, "3", 2),
        ];
        let out = reconcile(input).entries;
        assert_eq!(names(&out), vec!["late.jpg", "zeta", "alpha"]);
        assert!(out[2].order_key.is_unordered());
        assert_eq!(out[2].sequence_number, Some(3));
    }

    #[test]
    fn test_empty_input() {
        let result = reconcile(Vec::new());
        assert!(result.entries.is_empty());
        assert_eq!(result.duplicates_collapsed, 0);
    }

    #[test]
    fn test_reorder_by_modified() {
        let t = |secs| Some(SystemTime::UNIX_EPOCH + Duration::from_secs(secs));
        let mut a = entry("img_1.jpg", MediaKind::Image, seq(1), "1", 0);
        a.modified = t(300);
        let mut b = entry("img_2.jpg", MediaKind::Image, seq(2), "2", 1);
        b.modified = None;
        let mut c = entry("img_3.jpg", MediaKind::Image, seq(3), "3", 2);
        c.modified = t(100);

        let out = reorder_by_modified(reconcile(vec![a, b, c]).entries);
        assert_eq!(names(&out), vec!["img_3.jpg", "img_1.jpg", "img_2.jpg"]);
        assert_eq!(out[2].sequence_number, Some(3));
    }
}
