use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use unicode_normalization::UnicodeNormalization;

/// Cover images the client writes next to videos
static THUMBNAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^.*(_th|_thumb|_thumbnail|\.mp4_th|\.mov_th)\.(jpg|jpeg|png)$").unwrap()
});

/// Stem suffixes that mark a cover when a same-named video exists
const COVER_SUFFIXES: &[&str] = &["_thumb", "_th"];

const VIDEO_SIBLING_EXTENSIONS: &[&str] = &["mp4", "mov", "avi", "mkv", "wmv", "flv"];

/// Check if a filename is a video cover image by its name alone
pub fn is_video_thumbnail(filename: &str) -> bool {
    let name: String = filename.to_lowercase().nfc().collect();
    THUMBNAIL_RE.is_match(&name)
}

/// Check if `filename` is a cover image for a video that `has_sibling` reports
/// next to it. `has_sibling` receives candidate sibling filenames.
pub fn is_cover_of_sibling(filename: &str, has_sibling: impl Fn(&str) -> bool) -> bool {
    let stem = Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(filename);
    let Some(video_stem) = COVER_SUFFIXES
        .iter()
        .find_map(|suffix| stem.strip_suffix(suffix))
    else {
        return false;
    };
    VIDEO_SIBLING_EXTENSIONS
        .iter()
        .any(|ext| has_sibling(&format!("{}.{}", video_stem, ext)))
}
