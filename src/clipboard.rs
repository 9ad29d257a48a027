//! Process-wide store of clipboards saved from departed sessions.
//!
//! When a session disconnects we rescue its kit-side clipboard so a
//! follow-up HTTP read (authenticated by the session's clipboard key) can
//! still serve the content after the session object is gone. The store is
//! in-memory only and bounded; oldest entries fall out first.

use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Upper bound on retained clipboards; beyond this the oldest is dropped.
const MAX_SAVED_CLIPBOARDS: usize = 64;

/// Bounded map from clipboard key to saved payload.
///
/// Written only from broker threads holding the departing session; read
/// from any thread serving a clipboard HTTP request.
#[derive(Debug, Default)]
pub struct SavedClipboards {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, Bytes>,
    order: VecDeque<String>,
}

impl SavedClipboards {
    pub fn new() -> Self {
        Self::default()
    }

    /// Save `data` under every one of the session's keys (current and
    /// previous), so reads racing a key rotation still succeed.
    pub fn insert(&self, keys: &[String], data: Bytes) {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for key in keys {
            if key.is_empty() {
                continue;
            }
            if inner.entries.insert(key.clone(), data.clone()).is_none() {
                inner.order.push_back(key.clone());
            }
        }
        while inner.order.len() > MAX_SAVED_CLIPBOARDS {
            if let Some(oldest) = inner.order.pop_front() {
                inner.entries.remove(&oldest);
            }
        }
    }

    /// Look up a clipboard by key tag.
    pub fn get(&self, tag: &str) -> Option<Bytes> {
        let inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.entries.get(tag).cloned()
    }

    pub fn len(&self) -> usize {
        let inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
