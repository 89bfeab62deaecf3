use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use unicode_normalization::UnicodeNormalization;

static DIGIT_RUN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[0-9]+").unwrap());

const SEPARATORS: &[char] = &['_', '-', '.', ' ', '(', ')', '[', ']'];

fn is_boundary(c: Option<char>) -> bool {
    c.map_or(true, |c| SEPARATORS.contains(&c))
}

/// Find the explicit sequence number embedded in `text`.
///
/// A token is a run of ASCII digits bounded on both sides by the start/end of
/// the text or a separator. When several qualify the last one wins; a token
/// too large for `u64` is ignored.
pub fn sequence_token(text: &str) -> Option<u64> {
    let text: String = text.nfc().collect();
    DIGIT_RUN_RE
        .find_iter(&text)
        .filter(|m| {
            let before = text[..m.start()].chars().next_back();
            let after = text[m.end()..].chars().next();
            is_boundary(before) && is_boundary(after)
        })
        .filter_map(|m| m.as_str().parse::<u64>().ok())
        .last()
}

/// Sequence token from a filename, ignoring its extension.
pub fn filename_token(filename: &str) -> Option<u64> {
    let stem = Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(filename);
    sequence_token(stem)
}
