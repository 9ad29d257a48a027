//! Tile request handling and render coordination for the broker.
//!
//! Requests are satisfied from the cache when possible; misses subscribe
//! the session to a pending render and batch a `tilecombine` to the kit.
//! Delivery to each session is throttled by its tiles-on-fly window so a
//! slow client never has the whole document queued on its socket.

use super::DocumentBroker;
use crate::rect::Rect;
use crate::session::SessionRef;
use crate::tile::{TileCache, TileCombined, TileDesc};
use bytes::Bytes;
use std::time::Instant;

/// Lower bound of the per-session tiles-on-fly window.
const TILES_ON_FLY_MIN_UPPER_LIMIT: f64 = 10.0;

/// Window used before the client reports its visible area, sized to let
/// the initial document view through.
const INITIAL_TILES_ON_FLY_LIMIT: f64 = 200.0;

impl DocumentBroker {
    /// A single `tile` request from a client.
    pub fn handle_tile_request(&mut self, mut tile: TileDesc, session: &SessionRef, now: Instant) {
        tile.ver = self.next_tile_version();
        log::trace!("[broker] tile request {}", tile.serialize("", ""));

        let cached = self.cache.as_mut().and_then(|c| c.lookup_tile(&tile));
        if let Some(data) = cached {
            session.borrow_mut().send_rendered_tile(&tile, &data, true, now);
            return;
        }

        if tile.broadcast {
            let sessions: Vec<SessionRef> = self.sessions.values().cloned().collect();
            if let Some(cache) = self.cache.as_mut() {
                for other in &sessions {
                    if !other.borrow().in_wait_disconnect() {
                        cache.subscribe_to_tile_rendering(&tile, other, now);
                    }
                }
            }
        } else if let Some(cache) = self.cache.as_mut() {
            cache.subscribe_to_tile_rendering(&tile, session, now);
        }

        self.rendered_tile_count += 1;
        self.send_to_kit(&tile.serialize("tile", ""));
    }

    /// A `tilecombine` request: serve hits, batch misses to the kit, and
    /// queue everything through the session's flow-control window.
    pub fn handle_tile_combined_request(
        &mut self,
        mut combined: TileCombined,
        session: &SessionRef,
        now: Instant,
    ) {
        log::trace!("[broker] tilecombine request for {} tiles", combined.tiles.len());

        for tile in &mut combined.tiles {
            tile.ver = self.next_tile_version();
        }

        // Pre-render misses so the kit starts painting before the window
        // lets us actually send anything.
        let mut needs_rendering: Vec<TileDesc> = Vec::new();
        if let Some(cache) = self.cache.as_mut() {
            for tile in &combined.tiles {
                if cache.lookup_tile(tile).is_none() {
                    cache.register_tile_being_rendered(tile, now);
                    needs_rendering.push(tile.clone());
                }
            }
        }
        self.rendered_tile_count += needs_rendering.len() as u32;
        if !needs_rendering.is_empty() {
            let request = TileCombined::create(needs_rendering).serialize("tilecombine", "");
            log::trace!("[broker] requesting uncached tiles: {request}");
            self.send_to_kit(&request);
        }

        // Merge into the session queue; a duplicate position updates the
        // queued descriptor in place instead of queueing twice.
        {
            let mut s = session.borrow_mut();
            let is_text = s.is_text_document();
            let queue = s.requested_tiles_mut();
            if queue.is_empty() {
                queue.extend(combined.tiles.iter().cloned());
            } else {
                for new_tile in &combined.tiles {
                    if let Some(front) = queue.front() {
                        if !is_text && front.part != new_tile.part {
                            log::warn!("[broker] different part numbers in tile requests");
                        }
                    }
                    if let Some(queued) = queue.iter_mut().find(|t| {
                        t.tile_pos_x == new_tile.tile_pos_x
                            && t.tile_pos_y == new_tile.tile_pos_y
                            && t.normalized_view_id == new_tile.normalized_view_id
                    }) {
                        queued.ver = new_tile.ver;
                        queued.old_wire_id = new_tile.old_wire_id;
                        queued.wire_id = new_tile.wire_id;
                    } else {
                        queue.push_back(new_tile.clone());
                    }
                }
            }
        }

        self.send_requested_tiles(session, now);
    }

    /// Feed the session's queued tiles through its flow-control window.
    ///
    /// Outstanding work (on the wire + being rendered) stays below
    /// `max(10, visibleTiles * 1.1)`; before the visible area is known
    /// the cap is 200 so the initial paint gets through. A tile already
    /// on the wire twice is rotated to the back of the queue until the
    /// client acknowledges a copy.
    pub fn send_requested_tiles(&mut self, session: &SessionRef, now: Instant) {
        let limit = {
            let s = session.borrow();
            let norm = s.normalized_visible_area();
            if norm.has_surface() && s.tile_width_twips() > 0 && s.tile_height_twips() > 0 {
                let cols = (norm.width + s.tile_width_twips() - 1) / s.tile_width_twips();
                let rows = (norm.height + s.tile_height_twips() - 1) / s.tile_height_twips();
                ((cols * rows) as f64 * 1.1).max(TILES_ON_FLY_MIN_UPPER_LIMIT)
            } else {
                INITIAL_TILES_ON_FLY_LIMIT
            }
        };

        session.borrow_mut().remove_outdated_tiles_on_fly(now);

        let mut needs_rendering: Vec<TileDesc> = Vec::new();
        let mut delayed = 0usize;
        loop {
            let (on_fly, queue_len) = {
                let s = session.borrow();
                (s.tiles_on_fly_count(), s.requested_tiles_len())
            };
            // When every remaining tile was delayed, stop; the next
            // tileprocessed will resume.
            if queue_len == 0 || delayed >= queue_len {
                break;
            }
            let being_rendered = self
                .cache
                .as_ref()
                .map_or(0, |c| c.count_tiles_being_rendered_for(session));
            if (on_fly + being_rendered) as f64 >= limit {
                break;
            }

            let Some(mut tile) = session.borrow_mut().requested_tiles_mut().pop_front() else {
                break;
            };

            // Two copies of this tile are already on the wire; wait for
            // a tileprocessed before sending a third.
            if session.borrow().count_identical_tiles_on_fly(&tile) >= 2 {
                session.borrow_mut().requested_tiles_mut().push_back(tile);
                delayed += 1;
                continue;
            }

            let cached = self.cache.as_mut().and_then(|c| c.lookup_tile(&tile));
            if let Some(data) = cached {
                session.borrow_mut().send_rendered_tile(&tile, &data, true, now);
                continue;
            }

            let (pending, pending_version) = self.cache.as_ref().map_or((false, 0), |c| {
                (
                    c.has_tile_being_rendered(&tile),
                    c.tile_being_rendered_version(&tile),
                )
            });
            if !pending || pending_version < tile.ver {
                tile.ver = self.next_tile_version();
                self.rendered_tile_count += 1;
                needs_rendering.push(tile.clone());
            }
            if let Some(cache) = self.cache.as_mut() {
                cache.subscribe_to_tile_rendering(&tile, session, now);
            }
        }

        if !needs_rendering.is_empty() {
            let request = TileCombined::create(needs_rendering).serialize("tilecombine", "");
            log::trace!("[broker] residual tilecombine: {request}");
            self.send_to_kit(&request);
        }
    }

    /// `canceltiles` from a client: clear its queues and drop its render
    /// subscriptions, telling the kit about versions nobody wants.
    pub fn cancel_tile_requests(&mut self, session: &SessionRef, _now: Instant) {
        {
            let mut s = session.borrow_mut();
            s.clear_tiles_on_fly();
            s.requested_tiles_mut().clear();
            s.reset_wire_id_map();
        }
        let cancel_msg = self.cache.as_mut().and_then(|c| c.cancel_tiles(session));
        if let Some(message) = cancel_msg {
            log::debug!("[broker] forwarding {message}");
            self.send_to_kit(&message);
        }
    }

    /// A `tile:` response frame from the kit.
    pub(crate) fn handle_tile_response(&mut self, data: &[u8], now: Instant) {
        let first_line = crate::protocol::first_line(data).to_string();
        let Some(payload) = crate::protocol::payload_after_first_line(data) else {
            log::warn!("[broker] dropping empty tile response: {first_line}");
            return;
        };
        if payload.is_empty() {
            // Re-issued later if anyone still wants it.
            log::warn!("[broker] dropping empty tile response: {first_line}");
            return;
        }
        match TileDesc::parse(&first_line) {
            Ok(tile) => {
                let bytes = Bytes::copy_from_slice(payload);
                if let Some(cache) = self.cache.as_mut() {
                    cache.save_tile_and_notify(&tile, bytes, now);
                }
            }
            Err(e) => log::error!("[broker] bad tile response [{first_line}]: {e}"),
        }
    }

    /// A `tilecombine:` response frame: payload is the concatenation of
    /// the tiles' bytes, each sized by its `imgsize` column entry.
    pub(crate) fn handle_tile_combined_response(&mut self, data: &[u8], now: Instant) {
        let first_line = crate::protocol::first_line(data).to_string();
        let Some(payload) = crate::protocol::payload_after_first_line(data) else {
            log::warn!("[broker] dropping empty tilecombine response: {first_line}");
            return;
        };
        match TileCombined::parse(&first_line) {
            Ok(combined) => {
                let mut offset = 0usize;
                for tile in &combined.tiles {
                    let size = tile.img_size.max(0) as usize;
                    let Some(chunk) = payload.get(offset..offset + size) else {
                        log::error!(
                            "[broker] tilecombine payload too short at offset {offset} for {first_line}"
                        );
                        return;
                    };
                    if let Some(cache) = self.cache.as_mut() {
                        cache.save_tile_and_notify(tile, Bytes::copy_from_slice(chunk), now);
                    }
                    offset += size;
                }
            }
            Err(e) => log::error!("[broker] bad tilecombine response [{first_line}]: {e}"),
        }
    }

    /// Kit invalidation for `session`'s view: drop the covered cache
    /// entries, then re-request the now-stale tiles inside the visible
    /// area, carrying each tile's last wire id for client-side matching.
    pub(crate) fn handle_tile_invalidation(
        &mut self,
        message: &str,
        session: &SessionRef,
        now: Instant,
    ) {
        let Some((msg_part, area)) = TileCache::parse_invalidate_msg(message) else {
            return;
        };
        let nviewid = session.borrow().canonical_view_id();
        if let Some(cache) = self.cache.as_mut() {
            cache.invalidate_tiles(msg_part, area, nviewid);
        }

        let invalid_tiles = {
            let s = session.borrow();
            if !s.has_view_metrics() {
                return;
            }
            let norm = s.normalized_visible_area();
            if !norm.intersects(&area) {
                return;
            }
            // Without an explicit part the client's current one applies.
            let part = if msg_part < 0 { s.selected_part() } else { msg_part };
            if part != s.selected_part() && !s.is_text_document() {
                return;
            }

            let tw = s.tile_width_twips();
            let th = s.tile_height_twips();
            let mut invalid = Vec::new();
            for row in (norm.top() / th)..=(norm.bottom() / th) {
                for col in (norm.left() / tw)..=(norm.right() / tw) {
                    let tile_rect = Rect::new(col * tw, row * th, tw, th);
                    if !area.intersects(&tile_rect) {
                        continue;
                    }
                    let Ok(mut tile) = TileDesc::new(
                        nviewid,
                        part,
                        s.tile_width_pixel(),
                        s.tile_height_pixel(),
                        col * tw,
                        row * th,
                        tw,
                        th,
                        -1,
                        0,
                        -1,
                        false,
                    ) else {
                        continue;
                    };
                    tile.old_wire_id = s.last_sent_wire_id(&tile.generate_id()).unwrap_or(0);
                    invalid.push(tile);
                }
            }
            invalid
        };

        if !invalid_tiles.is_empty() {
            let mut combined = TileCombined::create(invalid_tiles);
            combined.set_normalized_view_id(nviewid);
            self.handle_tile_combined_request(combined, session, now);
        }
    }
}
