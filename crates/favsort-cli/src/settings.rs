use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use favsort_core::ScanOptions;
use serde::Deserialize;

/// Remembered paths and scan options, read from a JSON file.
///
/// Only ever read; command-line flags take precedence over every field.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub cache_path: Option<PathBuf>,
    pub archive_path: Option<PathBuf>,
    pub output_path: Option<PathBuf>,
    pub scan: ScanOptions,
}

impl Settings {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("Invalid settings file {}", path.display()))
    }

    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_settings() {
        let s = Settings::from_json(r#"{"output_path": "/tmp/out", "scan": {"skip_thumbnails": false}}"#).unwrap();
        assert_eq!(s.output_path, Some(PathBuf::from("/tmp/out")));
        assert!(s.cache_path.is_none());
        assert!(!s.scan.skip_thumbnails);
        assert!(s.scan.locate_favorites);
    }

    #[test]
    fn test_empty_and_invalid_settings() {
        let s = Settings::from_json("{}").unwrap();
        assert!(s.archive_path.is_none());
        assert!(Settings::from_json("not json").is_err());
    }
}
