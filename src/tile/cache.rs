//! Per-document tile cache and render coordination.
//!
//! Holds finished renders keyed by the cache subset of the descriptor,
//! tracks in-flight renders with weak subscriber lists, and fans a
//! finished render out to every subscriber. Eviction is approximate LRU
//! against a high-water mark the broker scales with the session count.
//!
//! The cache is owned by exactly one broker thread; every mutating call
//! asserts the calling thread. The poll loop is the sole mutator by
//! contract.

use crate::rect::Rect;
use crate::session::{SessionRef, SessionWeak};
use crate::tile::desc::{TileCacheKey, TileDesc};
use bytes::Bytes;
use std::collections::HashMap;
use std::thread::ThreadId;
use std::time::{Duration, Instant};

/// A render older than this has stalled; re-subscribing bumps the pending
/// version so the kit reissues it.
const RENDER_STALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Stream caches for non-tile renders keyed by a string name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    Font,
    Style,
    CmdValues,
    Misc,
}

impl StreamType {
    fn index(self) -> usize {
        match self {
            Self::Font => 0,
            Self::Style => 1,
            Self::CmdValues => 2,
            Self::Misc => 3,
        }
    }
}

/// A pending render: descriptor, start time, and subscribed sessions.
///
/// Subscribers are weak so a disconnecting session never waits on the
/// kit. At most one pending entry exists per cache-equal descriptor.
#[derive(Debug)]
struct TileBeingRendered {
    tile: TileDesc,
    start_time: Instant,
    subscribers: Vec<SessionWeak>,
}

impl TileBeingRendered {
    fn new(tile: TileDesc, now: Instant) -> Self {
        Self {
            tile,
            start_time: now,
            subscribers: Vec::new(),
        }
    }

    fn version(&self) -> i32 {
        self.tile.ver
    }

    fn elapsed(&self, now: Instant) -> Duration {
        now.duration_since(self.start_time)
    }

    fn is_subscribed(&self, session: &SessionRef) -> bool {
        self.subscribers
            .iter()
            .any(|weak| weak.upgrade().is_some_and(|s| std::rc::Rc::ptr_eq(&s, session)))
    }
}

#[derive(Debug)]
struct CacheEntry {
    data: Bytes,
    last_used: u64,
}

/// Content-addressed cache of rendered tiles for one document.
#[derive(Debug)]
pub struct TileCache {
    doc_url: String,
    dont_cache: bool,
    owner: Option<ThreadId>,

    cache: HashMap<TileCacheKey, CacheEntry>,
    tiles_being_rendered: HashMap<TileCacheKey, TileBeingRendered>,
    stream_caches: [HashMap<String, Bytes>; 4],

    /// Approximate cache size in bytes.
    cache_size: usize,
    /// High-water mark; eviction runs when exceeded.
    max_cache_size: usize,
    /// Monotonic use counter backing the LRU ordering.
    use_counter: u64,
}

/// Per-entry overhead added to the byte accounting.
fn item_cache_size(data: &Bytes) -> usize {
    data.len() + std::mem::size_of::<TileDesc>()
}

impl TileCache {
    pub fn new(doc_url: impl Into<String>, dont_cache: bool) -> Self {
        let doc_url = doc_url.into();
        log::info!("[tilecache] created for [{doc_url}], dont_cache={dont_cache}");
        Self {
            doc_url,
            dont_cache,
            owner: None,
            cache: HashMap::new(),
            tiles_being_rendered: HashMap::new(),
            stream_caches: Default::default(),
            cache_size: 0,
            max_cache_size: 8 * 1024 * 128,
            use_counter: 0,
        }
    }

    /// Record the sole thread allowed to mutate the cache.
    pub fn set_thread_owner(&mut self, id: ThreadId) {
        self.owner = Some(id);
    }

    fn assert_correct_thread(&self) {
        if let Some(owner) = self.owner {
            let current = std::thread::current().id();
            if current != owner {
                log::error!(
                    "[tilecache] method invoked from foreign thread {current:?}, owner is {owner:?}"
                );
                debug_assert_eq!(current, owner);
            }
        }
    }

    /// Completely clear the cache contents.
    pub fn clear(&mut self) {
        self.cache.clear();
        self.tiles_being_rendered.clear();
        for stream in &mut self.stream_caches {
            stream.clear();
        }
        self.cache_size = 0;
        log::info!("[tilecache] cleared for [{}]", self.doc_url);
    }

    /// Current approximate memory use.
    pub fn memory_size(&self) -> usize {
        self.cache_size
    }

    /// Set the high-water mark; evicts immediately when already above.
    pub fn set_max_cache_size(&mut self, max: usize) {
        self.max_cache_size = max.max(1);
        self.ensure_cache_size();
    }

    pub fn max_cache_size(&self) -> usize {
        self.max_cache_size
    }

    // ─── Lookup / store ────────────────────────────────────────────────

    /// Cached bytes for a cache-equal descriptor, bumping LRU recency.
    pub fn lookup_tile(&mut self, tile: &TileDesc) -> Option<Bytes> {
        if self.dont_cache {
            return None;
        }
        self.use_counter += 1;
        let counter = self.use_counter;
        let entry = self.cache.get_mut(&tile.cache_key())?;
        entry.last_used = counter;
        Some(entry.data.clone())
    }

    /// Store a rendered tile and fan it out to the subscribers of the
    /// matching pending entry. The first subscriber receives the tile
    /// plain; later ones carry the `renderid=cached` marker.
    pub fn save_tile_and_notify(&mut self, tile: &TileDesc, data: Bytes, now: Instant) {
        self.assert_correct_thread();

        if !self.dont_cache {
            self.use_counter += 1;
            let size = item_cache_size(&data);
            if let Some(old) = self.cache.insert(
                tile.cache_key(),
                CacheEntry {
                    data: data.clone(),
                    last_used: self.use_counter,
                },
            ) {
                self.cache_size -= item_cache_size(&old.data);
            }
            self.cache_size += size;
            self.ensure_cache_size();
        }

        let pending_version = {
            let Some(pending) = self.tiles_being_rendered.get(&tile.cache_key()) else {
                log::debug!("[tilecache] no subscribers for {}", tile.serialize("", ""));
                return;
            };
            let mut first = true;
            for weak in &pending.subscribers {
                // Expired subscribers disconnected mid-render; skip silently.
                let Some(session) = weak.upgrade() else {
                    continue;
                };
                session
                    .borrow_mut()
                    .send_rendered_tile(tile, &data, !first, now);
                first = false;
            }
            pending.version()
        };

        // A pending entry wanting a newer version than we just delivered
        // stays so the newer render reissues.
        if pending_version <= tile.ver {
            self.tiles_being_rendered.remove(&tile.cache_key());
        }
    }

    // ─── Pending renders ───────────────────────────────────────────────

    /// Subscribe `session` to the render of `tile`, creating the pending
    /// entry if needed.
    pub fn subscribe_to_tile_rendering(
        &mut self,
        tile: &TileDesc,
        session: &SessionRef,
        now: Instant,
    ) {
        self.assert_correct_thread();

        if let Some(pending) = self.tiles_being_rendered.get_mut(&tile.cache_key()) {
            if pending.is_subscribed(session) {
                pending.tile.ver = tile.ver;
                return;
            }
            pending.subscribers.push(std::rc::Rc::downgrade(session));
            if pending.elapsed(now) > RENDER_STALL_TIMEOUT {
                // Painting has stalled; reissue.
                pending.tile.ver = tile.ver;
            }
        } else {
            let mut pending = TileBeingRendered::new(tile.clone(), now);
            pending.subscribers.push(std::rc::Rc::downgrade(session));
            self.tiles_being_rendered.insert(tile.cache_key(), pending);
        }
    }

    /// Record that `tile` went to the kit for rendering, without a
    /// subscriber yet.
    pub fn register_tile_being_rendered(&mut self, tile: &TileDesc, now: Instant) {
        self.assert_correct_thread();
        if let Some(pending) = self.tiles_being_rendered.get_mut(&tile.cache_key()) {
            if pending.elapsed(now) > RENDER_STALL_TIMEOUT {
                pending.tile.ver = tile.ver;
            }
        } else {
            self.tiles_being_rendered
                .insert(tile.cache_key(), TileBeingRendered::new(tile.clone(), now));
        }
    }

    pub fn has_tile_being_rendered(&self, tile: &TileDesc) -> bool {
        self.tiles_being_rendered.contains_key(&tile.cache_key())
    }

    /// Version of the pending render, or 0 when none.
    pub fn tile_being_rendered_version(&self, tile: &TileDesc) -> i32 {
        self.tiles_being_rendered
            .get(&tile.cache_key())
            .map_or(0, TileBeingRendered::version)
    }

    /// Elapsed render time, or `None` when nothing is pending.
    pub fn tile_being_rendered_elapsed(&self, tile: &TileDesc, now: Instant) -> Option<Duration> {
        self.tiles_being_rendered
            .get(&tile.cache_key())
            .map(|pending| pending.elapsed(now))
    }

    pub fn tiles_being_rendered_count(&self) -> usize {
        self.tiles_being_rendered.len()
    }

    /// Number of pending renders `session` is subscribed to.
    pub fn count_tiles_being_rendered_for(&self, session: &SessionRef) -> usize {
        self.tiles_being_rendered
            .values()
            .filter(|pending| pending.is_subscribed(session))
            .count()
    }

    /// Drop `session` from every pending render. Entries left without
    /// subscribers are removed (thumbnail requests excepted) and their
    /// versions returned as a `canceltiles` message for the kit.
    pub fn cancel_tiles(&mut self, session: &SessionRef) -> Option<String> {
        self.assert_correct_thread();

        let mut cancelled = Vec::new();
        self.tiles_being_rendered.retain(|_, pending| {
            // Thumbnail requests carry a client id and are never cancelled.
            if pending.tile.id >= 0 {
                return true;
            }
            pending.subscribers.retain(|weak| {
                weak.upgrade()
                    .is_some_and(|s| !std::rc::Rc::ptr_eq(&s, session))
            });
            if pending.subscribers.is_empty() {
                cancelled.push(pending.version());
                false
            } else {
                true
            }
        });

        if cancelled.is_empty() {
            return None;
        }
        let versions: Vec<String> = cancelled.iter().map(ToString::to_string).collect();
        Some(format!("canceltiles {}", versions.join(",")))
    }

    // ─── Invalidation ──────────────────────────────────────────────────

    /// Parse the kit's invalidation message into `(part, area)`:
    /// `EMPTY` (all parts, whole surface), `EMPTY, <part>`, or an
    /// explicit `part=N x=X y=Y width=W height=H` rectangle.
    pub fn parse_invalidate_msg(message: &str) -> Option<(i32, Rect)> {
        let tokens = crate::protocol::tokenize(message);
        if !crate::protocol::token_matches(&tokens, 0, "invalidatetiles:") {
            return None;
        }
        if tokens.len() == 2 && tokens[1] == "EMPTY" {
            return Some((-1, Rect::all()));
        }
        if tokens.len() == 3 && tokens[1] == "EMPTY," {
            return tokens[2].parse().ok().map(|part| (part, Rect::all()));
        }
        if tokens.len() == 6 {
            let part = crate::protocol::get_token_i64(&tokens, "part")? as i32;
            let x = crate::protocol::get_token_i64(&tokens, "x")? as i32;
            let y = crate::protocol::get_token_i64(&tokens, "y")? as i32;
            let width = crate::protocol::get_token_i64(&tokens, "width")? as i32;
            let height = crate::protocol::get_token_i64(&tokens, "height")? as i32;
            return Some((part, Rect::new(x, y, width, height)));
        }
        log::error!("[tilecache] unexpected invalidatetiles request [{message}]");
        None
    }

    /// Remove every completed and pending tile intersecting `area`,
    /// filtered by part and normalized view id (negative = wildcard).
    pub fn invalidate_tiles(&mut self, part: i32, area: Rect, normalized_view_id: i32) {
        self.assert_correct_thread();
        log::trace!(
            "[tilecache] invalidating part={part} area=({},{} {}x{}) nviewid={normalized_view_id}",
            area.x,
            area.y,
            area.width,
            area.height
        );

        let matches = |tile_part: i32, nviewid: i32, x: i32, y: i32, w: i32, h: i32| {
            if part >= 0 && tile_part != part {
                return false;
            }
            if normalized_view_id >= 0 && nviewid != normalized_view_id {
                return false;
            }
            let left = area.x.max(x);
            let right = area.right().min(x.saturating_add(w));
            let top = area.y.max(y);
            let bottom = area.bottom().min(y.saturating_add(h));
            left <= right && top <= bottom
        };

        let mut removed_bytes = 0usize;
        self.cache.retain(|key, entry| {
            let keep = !matches(
                key.part(),
                key.normalized_view_id(),
                key.tile_pos_x(),
                key.tile_pos_y(),
                key.tile_width(),
                key.tile_height(),
            );
            if !keep {
                removed_bytes += item_cache_size(&entry.data);
            }
            keep
        });
        self.cache_size -= removed_bytes;

        self.tiles_being_rendered.retain(|key, _| {
            !matches(
                key.part(),
                key.normalized_view_id(),
                key.tile_pos_x(),
                key.tile_pos_y(),
                key.tile_width(),
                key.tile_height(),
            )
        });
    }

    // ─── Stream caches ─────────────────────────────────────────────────

    pub fn save_stream(&mut self, kind: StreamType, name: impl Into<String>, data: Bytes) {
        if self.dont_cache {
            return;
        }
        self.stream_caches[kind.index()].insert(name.into(), data);
    }

    pub fn lookup_stream(&self, kind: StreamType, name: &str) -> Option<Bytes> {
        self.stream_caches[kind.index()].get(name).cloned()
    }

    pub fn remove_stream(&mut self, kind: StreamType, name: &str) {
        if self.stream_caches[kind.index()].remove(name).is_some() {
            log::debug!("[tilecache] removed stream {name}");
        }
    }

    // ─── Eviction ──────────────────────────────────────────────────────

    /// Evict least-recently-used entries until back under the mark.
    fn ensure_cache_size(&mut self) {
        while self.cache_size > self.max_cache_size && !self.cache.is_empty() {
            let Some((key, _)) = self
                .cache
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, entry)| (*key, entry.last_used))
            else {
                break;
            };
            if let Some(entry) = self.cache.remove(&key) {
                self.cache_size -= item_cache_size(&entry.data);
                log::trace!("[tilecache] evicted entry, size now {}", self.cache_size);
            }
        }
    }
}
