//! Process-wide context shared by every document broker.
//!
//! Instead of scattering global state behind singletons, the embedding
//! server builds one `ProcessContext` at startup and hands each broker an
//! `Arc`. It carries the version string, the stable host identifier used
//! in clipboard URIs, the saved-clipboard store, and the anonymization
//! map used when logging user-identifying strings.

use crate::clipboard::SavedClipboards;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

/// Maps user-identifying strings to stable opaque aliases for logging.
///
/// The same input always maps to the same alias within one process, so
/// log correlation survives anonymization.
#[derive(Debug, Default)]
pub struct Anonymizer {
    map: Mutex<HashMap<String, String>>,
}

impl Anonymizer {
    /// Anonymize an arbitrary identifying string.
    pub fn anonymize(&self, value: &str) -> String {
        if value.is_empty() {
            return String::new();
        }
        let mut map = match self.map.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let next = map.len();
        map.entry(value.to_string())
            .or_insert_with(|| format!("#{next}"))
            .clone()
    }

    /// Anonymize the path component of a URL, keeping scheme and host.
    pub fn anonymize_url(&self, url: &str) -> String {
        match url.split_once("://") {
            Some((scheme, rest)) => match rest.split_once('/') {
                Some((host, path)) => {
                    let path = path.split('?').next().unwrap_or(path);
                    format!("{scheme}://{host}/{}", self.anonymize(path))
                }
                None => format!("{scheme}://{rest}"),
            },
            None => self.anonymize(url),
        }
    }

    /// Pre-seed a mapping (used to alias filenames to file ids).
    pub fn map_alias(&self, value: &str, alias: &str) {
        if value.is_empty() {
            return;
        }
        let mut map = match self.map.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.insert(value.to_string(), alias.to_string());
    }
}

/// Shared per-process state handed to each broker at construction.
#[derive(Debug)]
pub struct ProcessContext {
    /// Human-readable server version reported in the handshake.
    pub version: String,
    /// Stable identifier of this server instance, used in clipboard URIs
    /// so clients can route reads back to the right process.
    pub host_identifier: String,
    /// Clipboards rescued from departed sessions.
    pub saved_clipboards: SavedClipboards,
    /// Alias map for log anonymization.
    pub anonymizer: Anonymizer,
    next_doc_id: AtomicU32,
}

impl ProcessContext {
    /// Build the context. `seed` should be stable across restarts for the
    /// same installation (e.g. the child-root path).
    pub fn new(version: impl Into<String>, seed: &str) -> Self {
        Self {
            version: version.into(),
            host_identifier: host_id_for_seed(seed),
            saved_clipboards: SavedClipboards::new(),
            anonymizer: Anonymizer::default(),
            next_doc_id: AtomicU32::new(1),
        }
    }

    /// Allocate the next per-process document instance id.
    pub fn next_doc_id(&self) -> u32 {
        self.next_doc_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Generate a stable host identifier from a seed string.
///
/// SHA-256, first 16 bytes as hex: unique enough, shorter than a UUID,
/// and identical across restarts for the same seed.
pub fn host_id_for_seed(seed: &str) -> String {
    let hash = Sha256::digest(seed.as_bytes());
    hash[..16].iter().map(|b| format!("{b:02x}")).collect()
}

/// Strong random hex string of `bytes * 2` characters.
///
/// Used for clipboard keys and lock tokens, both of which act as bearer
/// secrets.
pub fn strong_random_hex(bytes: usize) -> String {
    use rand::RngCore;
    let mut buf = vec![0u8; bytes];
    rand::rng().fill_bytes(&mut buf);
    buf.iter().map(|b| format!("{b:02x}")).collect()
}
