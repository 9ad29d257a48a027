//! Quarantine store for rejected uploads.
//!
//! When the storage host refuses an upload (conflict, failure) the local
//! copy is the only surviving version of the user's edits. With
//! `quarantine_files.enable` set, a copy is kept under the configured
//! directory, named so multiple rejections of the same document sort
//! chronologically.

use crate::config::QuarantineFiles;
use chrono::Utc;
use std::path::{Path, PathBuf};

/// Copies rejected uploads into the quarantine directory.
#[derive(Debug, Clone, Default)]
pub struct Quarantine {
    enabled: bool,
    path: PathBuf,
}

impl Quarantine {
    pub fn from_config(config: &QuarantineFiles) -> Self {
        Self {
            enabled: config.enable && !config.path.is_empty(),
            path: PathBuf::from(&config.path),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Keep a copy of `file` for the document identified by `doc_key`.
    ///
    /// Returns the quarantined path, or `None` when disabled or the copy
    /// failed (a quarantine failure never fails the caller).
    pub fn quarantine_file(&self, doc_key: &str, file: &Path) -> Option<PathBuf> {
        if !self.enabled {
            return None;
        }
        let filename = file.file_name()?.to_string_lossy().to_string();
        let stamp = Utc::now().format("%Y%m%d_%H%M%S%.3f");
        // Flatten the doc key into a path-safe component.
        let key: String = doc_key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        let target_dir = self.path.join(key);
        if let Err(e) = std::fs::create_dir_all(&target_dir) {
            log::warn!("[quarantine] cannot create {}: {e}", target_dir.display());
            return None;
        }
        let target = target_dir.join(format!("{stamp}_{filename}"));
        match std::fs::copy(file, &target) {
            Ok(bytes) => {
                log::info!(
                    "[quarantine] kept {} bytes of rejected upload at {}",
                    bytes,
                    target.display()
                );
                Some(target)
            }
            Err(e) => {
                log::warn!("[quarantine] copy to {} failed: {e}", target.display());
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled_config(dir: &Path) -> QuarantineFiles {
        QuarantineFiles {
            enable: true,
            path: dir.to_string_lossy().to_string(),
        }
    }

    #[test]
    fn test_disabled_by_default() {
        let q = Quarantine::from_config(&QuarantineFiles::default());
        assert!(!q.is_enabled());
        assert!(q.quarantine_file("key", Path::new("/nonexistent")).is_none());
    }

    #[test]
    fn test_enable_requires_path() {
        let q = Quarantine::from_config(&QuarantineFiles {
            enable: true,
            path: String::new(),
        });
        assert!(!q.is_enabled());
    }

    #[test]
    fn test_quarantines_copy_of_file() {
        let store = tempfile::tempdir().unwrap();
        let doc = tempfile::tempdir().unwrap();
        let file = doc.path().join("report.odt");
        std::fs::write(&file, b"edited content").unwrap();

        let q = Quarantine::from_config(&enabled_config(store.path()));
        let kept = q.quarantine_file("wopi.example.com/files/1", &file).unwrap();
        assert!(kept.exists());
        assert_eq!(std::fs::read(&kept).unwrap(), b"edited content");
        assert!(kept.to_string_lossy().ends_with("_report.odt"));
        // Original stays in place.
        assert!(file.exists());
    }

    #[test]
    fn test_multiple_rejections_keep_distinct_copies() {
        let store = tempfile::tempdir().unwrap();
        let doc = tempfile::tempdir().unwrap();
        let file = doc.path().join("report.odt");
        std::fs::write(&file, b"v1").unwrap();

        let q = Quarantine::from_config(&enabled_config(store.path()));
        let first = q.quarantine_file("k", &file).unwrap();
        std::fs::write(&file, b"v2").unwrap();
        let second = q.quarantine_file("k", &file).unwrap();
        assert_ne!(first, second);
        assert!(first.exists() && second.exists());
    }
}
