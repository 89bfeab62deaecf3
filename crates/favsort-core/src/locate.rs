use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use log::{debug, info};
use regex::Regex;
use walkdir::WalkDir;

/// Known locations of the favorites folder relative to a cache or account root
const FAVORITES_CANDIDATES: &[&[&str]] = &[
    &["Favorites"],
    &["FileStorage", "Favorites"],
    &["FileStorage", "Fav"],
    &["WeChat Files", "Favorites"],
];

static FAV_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)^fav").unwrap());
static ACCOUNT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^wxid_").unwrap());

fn dir_name(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("")
        .to_string()
}

/// Check if a folder name is itself a favorites folder
pub fn is_favorites_name(name: &str) -> bool {
    let lower = name.to_lowercase();
    lower == "favorites" || lower == "fav" || lower.starts_with("favorite")
}

fn first_candidate(base: &Path) -> Option<PathBuf> {
    FAVORITES_CANDIDATES.iter().find_map(|parts| {
        let candidate = parts.iter().fold(base.to_path_buf(), |p, part| p.join(part));
        debug!("Checking favorites candidate {}", candidate.display());
        candidate.is_dir().then_some(candidate)
    })
}

fn sorted_subdirs(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut dirs: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();
    dirs
}

/// Resolve the folder holding favorites media inside a cache root.
///
/// Falls back to `cache_root` itself when no favorites folder can be found,
/// so a user pointing directly at a media folder still gets a scan.
pub fn locate_favorites_root(cache_root: &Path) -> PathBuf {
    let name = dir_name(cache_root);
    if is_favorites_name(&name) {
        // A bare "Fav" usually sits beside the complete "Favorites" folder
        if !name.eq_ignore_ascii_case("favorites") {
            if let Some(parent) = cache_root.parent() {
                if let Some(full) = sorted_subdirs(parent)
                    .into_iter()
                    .find(|p| dir_name(p).eq_ignore_ascii_case("favorites"))
                {
                    info!("Using complete favorites folder {}", full.display());
                    return full;
                }
            }
        }
        return cache_root.to_path_buf();
    }

    if let Some(found) = first_candidate(cache_root) {
        info!("Found favorites folder {}", found.display());
        return found;
    }

    for account in sorted_subdirs(cache_root)
        .into_iter()
        .filter(|p| ACCOUNT_RE.is_match(&dir_name(p)))
    {
        if let Some(found) = first_candidate(&account) {
            info!("Found favorites folder under account {}", found.display());
            return found;
        }
    }

    let nested = WalkDir::new(cache_root)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .find(|e| e.file_type().is_dir() && FAV_RE.is_match(&e.file_name().to_string_lossy()));
    if let Some(entry) = nested {
        info!("Found possible favorites folder {}", entry.path().display());
        return entry.into_path();
    }

    info!(
        "No favorites folder below {}, scanning it directly",
        cache_root.display()
    );
    cache_root.to_path_buf()
}

/// Default cache root for the current user: the most recently used account
/// folder under `<Documents>/WeChat Files`, or that folder itself.
pub fn default_cache_root() -> Option<PathBuf> {
    let user_dirs = directories::UserDirs::new()?;
    let files_dir = user_dirs.document_dir()?.join("WeChat Files");
    if !files_dir.is_dir() {
        return None;
    }
    Some(most_recent_account(&files_dir).unwrap_or(files_dir))
}

fn most_recent_account(dir: &Path) -> Option<PathBuf> {
    sorted_subdirs(dir)
        .into_iter()
        .filter(|p| ACCOUNT_RE.is_match(&dir_name(p)))
        .filter_map(|p| {
            let modified = fs::metadata(&p).and_then(|m| m.modified()).ok()?;
            Some((modified, p))
        })
        .max_by(|a, b| a.0.cmp(&b.0))
        .map(|(_, p)| p)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_direct_candidate() {
        let dir = tempdir().unwrap();
        let fav = dir.path().join("FileStorage").join("Fav");
        fs::create_dir_all(&fav).unwrap();
        assert_eq!(locate_favorites_root(dir.path()), fav);
    }

    #[test]
    fn test_account_folder_candidate() {
        let dir = tempdir().unwrap();
        let fav = dir.path().join("wxid_abc123").join("Favorites");
        fs::create_dir_all(&fav).unwrap();
        fs::create_dir_all(dir.path().join("All Users")).unwrap();
        assert_eq!(locate_favorites_root(dir.path()), fav);
    }

    #[test]
    fn test_bare_fav_prefers_complete_sibling() {
        let dir = tempdir().unwrap();
        let fav = dir.path().join("Fav");
        let full = dir.path().join("Favorites");
        fs::create_dir_all(&fav).unwrap();
        fs::create_dir_all(&full).unwrap();
        assert_eq!(locate_favorites_root(&fav), full);
        assert_eq!(locate_favorites_root(&full), full);
    }

    #[test]
    fn test_nested_fav_folder_and_fallback() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("data").join("favcache");
        fs::create_dir_all(&nested).unwrap();
        assert_eq!(locate_favorites_root(dir.path()), nested);

        let plain = tempdir().unwrap();
        fs::write(plain.path().join("a.jpg"), b"x").unwrap();
        assert_eq!(locate_favorites_root(plain.path()), plain.path());
    }
}
