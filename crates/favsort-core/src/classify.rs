use std::path::Path;

use crate::media::MediaKind;

const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "bmp", "webp", "heic", "heif", "tif", "tiff",
];

const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "mov", "avi", "mkv", "wmv", "flv", "m4v", "3gp", "webm",
];

/// Extensions caches use for payloads of any type
const AMBIGUOUS_EXTENSIONS: &[&str] = &["", "dat", "tmp", "bin"];

struct Signature {
    /// (offset, bytes) pairs that must all match
    parts: &'static [(usize, &'static [u8])],
    kind: MediaKind,
    extension: &'static str,
}

// Checked top to bottom: specific ftyp brands before the generic one, BMP last.
static SIGNATURES: &[Signature] = &[
    Signature { parts: &[(0, b"\xFF\xD8\xFF")], kind: MediaKind::Image, extension: "jpg" },
    Signature { parts: &[(0, b"\x89PNG\r\n\x1A\n")], kind: MediaKind::Image, extension: "png" },
    Signature { parts: &[(0, b"GIF8")], kind: MediaKind::Image, extension: "gif" },
    Signature { parts: &[(0, b"RIFF"), (8, b"WEBP")], kind: MediaKind::Image, extension: "webp" },
    Signature { parts: &[(0, b"RIFF"), (8, b"AVI ")], kind: MediaKind::Video, extension: "avi" },
    Signature { parts: &[(0, b"\x1A\x45\xDF\xA3")], kind: MediaKind::Video, extension: "mkv" },
    Signature { parts: &[(0, b"FLV")], kind: MediaKind::Video, extension: "flv" },
    Signature { parts: &[(4, b"ftyp"), (8, b"qt  ")], kind: MediaKind::Video, extension: "mov" },
    Signature { parts: &[(4, b"ftyp"), (8, b"heic")], kind: MediaKind::Image, extension: "heic" },
    Signature { parts: &[(4, b"ftyp"), (8, b"heix")], kind: MediaKind::Image, extension: "heic" },
    Signature { parts: &[(4, b"ftyp"), (8, b"mif1")], kind: MediaKind::Image, extension: "heic" },
    Signature { parts: &[(4, b"ftyp")], kind: MediaKind::Video, extension: "mp4" },
    Signature { parts: &[(0, b"BM")], kind: MediaKind::Image, extension: "bmp" },
];

/// Result of classifying one name (and optionally its leading bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classified {
    pub kind: MediaKind,
    /// Extension to use on export; empty when unknown
    pub extension: String,
}

fn lower_extension(name: &str) -> String {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default()
}

/// Whether the name alone cannot tell what the payload is.
///
/// True for cache-style extensions and for extensions that neither the
/// media table nor `mime_guess` recognise.
pub fn needs_signature(name: &str) -> bool {
    let ext = lower_extension(name);
    if AMBIGUOUS_EXTENSIONS.contains(&ext.as_str()) {
        return true;
    }
    if IMAGE_EXTENSIONS.contains(&ext.as_str()) || VIDEO_EXTENSIONS.contains(&ext.as_str()) {
        return false;
    }
    mime_guess::from_ext(&ext).first().is_none()
}

fn by_extension(ext: &str) -> MediaKind {
    if IMAGE_EXTENSIONS.contains(&ext) {
        return MediaKind::Image;
    }
    if VIDEO_EXTENSIONS.contains(&ext) {
        return MediaKind::Video;
    }
    match mime_guess::from_ext(ext).first() {
        Some(m) if m.type_() == mime_guess::mime::IMAGE => MediaKind::Image,
        Some(m) if m.type_() == mime_guess::mime::VIDEO => MediaKind::Video,
        _ => MediaKind::Unknown,
    }
}

/// Match leading bytes against the signature table.
pub fn sniff(head: &[u8]) -> Option<(MediaKind, &'static str)> {
    SIGNATURES
        .iter()
        .find(|sig| {
            sig.parts
                .iter()
                .all(|(offset, magic)| head.get(*offset..offset + magic.len()) == Some(*magic))
        })
        .map(|sig| (sig.kind, sig.extension))
}

/// Classify a file by name, falling back to its leading bytes when the name
/// is ambiguous and `head` is given.
pub fn classify(name: &str, head: Option<&[u8]>) -> Classified {
    let ext = lower_extension(name);
    if !needs_signature(name) {
        return Classified {
            kind: by_extension(&ext),
            extension: ext,
        };
    }
    match head.and_then(sniff) {
        Some((kind, sniffed)) => Classified {
            kind,
            extension: sniffed.to_string(),
        },
        None => Classified {
            kind: MediaKind::Unknown,
            extension: ext,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_table() {
        assert_eq!(classify("img_001.JPG", None).kind, MediaKind::Image);
        assert_eq!(classify("img_001.JPG", None).extension, "jpg");
        assert_eq!(classify("clip.mov", None).kind, MediaKind::Video);
        assert_eq!(classify("notes.txt", None).kind, MediaKind::Unknown);
        assert!(!needs_signature("notes.txt"));
        assert!(!needs_signature("photo.png"));
    }

    #[test]
    fn test_ambiguous_names_use_signature() {
        assert!(needs_signature("1234567890"));
        assert!(needs_signature("blob.dat"));

        let jpeg = [0xFF, 0xD8, 0xFF, 0xE0, 0, 0x10, b'J', b'F', b'I', b'F'];
        let c = classify("blob.dat", Some(&jpeg));
        assert_eq!(c.kind, MediaKind::Image);
        assert_eq!(c.extension, "jpg");

        let c = classify("blob.dat", Some(b"plain text here"));
        assert_eq!(c.kind, MediaKind::Unknown);
        assert_eq!(classify("blob.dat", None).kind, MediaKind::Unknown);
    }

    #[test]
    fn test_iso_bmff_brands() {
        assert_eq!(sniff(b"\0\0\0\x14ftypqt  \0\0\0\0"), Some((MediaKind::Video, "mov")));
        assert_eq!(sniff(b"\0\0\0\x18ftypheic\0\0\0\0"), Some((MediaKind::Image, "heic")));
        assert_eq!(sniff(b"\0\0\0\x18ftypmp42\0\0\0\0"), Some((MediaKind::Video, "mp4")));
        assert_eq!(sniff(b"RIFF\0\0\0\0WEBPVP8 "), Some((MediaKind::Image, "webp")));
        assert_eq!(sniff(b"RIF"), None);
    }
}
