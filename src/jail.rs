//! Per-document jail directories.
//!
//! Each document instance gets a directory `<child_root>/<jail_id>/` into
//! which the storage download lands. The kit sees the same file under
//! `/user/docs/<jail_id>/<filename>` inside its chroot; the broker keeps
//! both views so it can run pre-filters and uploads host-side while
//! telling the kit a jail-relative URI.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Path prefix the kit sees inside its chroot.
pub const JAILED_DOCUMENT_ROOT: &str = "/user/docs";

/// Refuse to start a download with less headroom than this.
const MIN_FREE_DISK_BYTES: u64 = 32 * 1024 * 1024;

/// One document's jail.
#[derive(Debug, Clone)]
pub struct Jail {
    id: String,
    root: PathBuf,
}

impl Jail {
    /// Create a fresh jail directory under `child_root`.
    pub fn create(child_root: &Path) -> Result<Self> {
        let id = Uuid::new_v4().simple().to_string();
        let root = child_root.join(&id);
        std::fs::create_dir_all(&root)
            .with_context(|| format!("creating jail directory {}", root.display()))?;
        log::debug!("[jail] created {}", root.display());
        Ok(Self { id, root })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Host-side jail directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Host-side path of a document file inside the jail.
    pub fn host_path(&self, filename: &str) -> PathBuf {
        self.root.join(filename)
    }

    /// The `file://` URI the kit loads, relative to its chroot.
    pub fn kit_uri(&self, filename: &str) -> String {
        use percent_encoding::{utf8_percent_encode, CONTROLS};
        // Only '#' and '?' must be escaped for a file URI path; spaces and
        // controls are escaped for robustness.
        const FILE_URI: &percent_encoding::AsciiSet =
            &CONTROLS.add(b'#').add(b'?').add(b' ');
        let encoded = utf8_percent_encode(filename, FILE_URI);
        format!("file://{JAILED_DOCUMENT_ROOT}/{}/{encoded}", self.id)
    }

    /// Remove the jail directory and everything in it.
    pub fn cleanup(&self) {
        if let Err(e) = std::fs::remove_dir_all(&self.root) {
            log::warn!("[jail] failed to remove {}: {e}", self.root.display());
        }
    }
}

/// Free bytes on the filesystem holding `path`.
#[cfg(unix)]
pub fn available_disk_space(path: &Path) -> Option<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: c_path is a valid NUL-terminated path and stat is a properly
    // sized out-parameter.
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return None;
    }
    Some(stat.f_bavail as u64 * stat.f_frsize as u64)
}

#[cfg(not(unix))]
pub fn available_disk_space(_path: &Path) -> Option<u64> {
    None
}

/// True when `path`'s filesystem has enough headroom for a download of
/// `expected_size` bytes (plus a fixed safety margin).
pub fn has_disk_space(path: &Path, expected_size: u64) -> bool {
    match available_disk_space(path) {
        Some(free) => free >= expected_size.saturating_add(MIN_FREE_DISK_BYTES),
        // Unknown filesystems get the benefit of the doubt.
        None => true,
    }
}
