//! Client session: one connected editor view of a document.
//!
//! A session is owned by its document broker (strong `Rc` in the broker's
//! id map) and referenced weakly by pending tile renders, so teardown is
//! never blocked by an in-flight render. The socket layer holds the
//! receiving end of the session's outbound channel; everything the core
//! wants to say to the client goes through [`ClientSession::send_text_frame`]
//! or the binary variants.
//!
//! # State machine
//!
//! ```text
//! Detached --attach--> Loading --kit status--> Live --disconnect--> WaitDisconnect --ack|20s--> removed
//! ```

use crate::rect::Rect;
use crate::storage::FileInfo;
use crate::tile::{TileDesc, TileWireId};
use bytes::Bytes;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::{Rc, Weak};
use std::sync::mpsc;
use std::time::{Duration, Instant};

/// Strong session handle, shared between the broker map and call sites.
pub type SessionRef = Rc<RefCell<ClientSession>>;
/// Weak handle held by pending tile renders.
pub type SessionWeak = Weak<RefCell<ClientSession>>;

/// How long a session may linger in `WaitDisconnect` waiting for the
/// kit's handshake before it is hard-removed.
pub const WAIT_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// Entries on the tiles-on-fly list older than this are forgotten; the
/// client will re-request or the area will be re-invalidated.
pub const TILE_ROUNDTRIP_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, not yet added to a broker.
    Detached,
    /// Attached; the kit has not confirmed the view yet.
    Loading,
    /// The kit sent `status:` for this view.
    Live,
    /// Disconnecting; lingering to rescue the clipboard.
    WaitDisconnect,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Detached => "detached",
            Self::Loading => "loading",
            Self::Live => "live",
            Self::WaitDisconnect => "wait_disconnect",
        }
    }
}

/// One connected editor client.
#[derive(Debug)]
pub struct ClientSession {
    id: String,
    /// Exact URI (including query / access token) the client connected with.
    public_uri: String,
    read_only: bool,
    document_owner: bool,
    state: SessionState,
    last_state_time: Instant,

    /// WOPI file info snapshot; drives the input filter.
    wopi_info: Option<FileInfo>,
    user_id: String,
    user_name: String,
    watermark_text: String,

    /// View id assigned by the kit; -1 until `status:` arrives.
    kit_view_id: i32,
    /// Canonical view id shared by sessions with identical view state.
    canonical_view_id: i32,
    is_text_document: bool,

    visible_area: Rect,
    selected_part: i32,
    tile_width_pixel: i32,
    tile_height_pixel: i32,
    tile_width_twips: i32,
    tile_height_twips: i32,

    /// Host header the client connected through; used for clipboard
    /// URIs. Untrusted, display-only.
    host_no_trust: String,

    /// Current and previous clipboard keys; rotated periodically.
    clipboard_keys: [String; 2],
    /// Parked clipboard HTTP sockets awaiting content.
    clip_sockets: Vec<mpsc::Sender<Vec<u8>>>,
    /// Most recent clipboard payload from the kit, kept so the content
    /// survives into the process-wide store if the session is removed.
    last_clipboard: Option<Bytes>,

    /// Tiles queued for this session, pending the flow-control window.
    requested_tiles: VecDeque<TileDesc>,
    /// Tile ids sent and not yet acknowledged by `tileprocessed`.
    tiles_on_fly: VecDeque<(String, Instant)>,
    /// Last wire id sent per tile id, inside the visible area.
    wire_ids: HashMap<String, TileWireId>,

    outbox: mpsc::Sender<Vec<u8>>,
}

impl ClientSession {
    pub fn new(
        id: impl Into<String>,
        public_uri: impl Into<String>,
        read_only: bool,
        outbox: mpsc::Sender<Vec<u8>>,
        now: Instant,
    ) -> Self {
        let mut session = Self {
            id: id.into(),
            public_uri: public_uri.into(),
            read_only,
            document_owner: false,
            state: SessionState::Detached,
            last_state_time: now,
            wopi_info: None,
            user_id: String::new(),
            user_name: String::new(),
            watermark_text: String::new(),
            kit_view_id: -1,
            canonical_view_id: 0,
            is_text_document: false,
            visible_area: Rect::default(),
            selected_part: -1,
            tile_width_pixel: 0,
            tile_height_pixel: 0,
            tile_width_twips: 0,
            tile_height_twips: 0,
            host_no_trust: "localhost".to_string(),
            clipboard_keys: [String::new(), String::new()],
            clip_sockets: Vec::new(),
            last_clipboard: None,
            requested_tiles: VecDeque::new(),
            tiles_on_fly: VecDeque::new(),
            wire_ids: HashMap::new(),
            outbox,
        };
        session.rotate_clipboard_key(false, now);
        session
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn public_uri(&self) -> &str {
        &self.public_uri
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Demote to read-only and tell the client.
    pub fn set_read_only(&mut self) {
        self.read_only = true;
        self.send_text_frame("perm: readonly");
    }

    pub fn is_document_owner(&self) -> bool {
        self.document_owner
    }

    pub fn set_document_owner(&mut self, owner: bool) {
        self.document_owner = owner;
    }

    pub fn is_view_loaded(&self) -> bool {
        self.state == SessionState::Live
    }

    pub fn in_wait_disconnect(&self) -> bool {
        self.state == SessionState::WaitDisconnect
    }

    /// Usable for saving: loaded, writable, not on the way out.
    pub fn is_writable(&self) -> bool {
        !self.read_only && self.state == SessionState::Live
    }

    pub fn wopi_info(&self) -> Option<&FileInfo> {
        self.wopi_info.as_ref()
    }

    pub fn set_wopi_info(&mut self, info: FileInfo) {
        self.wopi_info = Some(info);
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    pub fn set_user(&mut self, user_id: impl Into<String>, user_name: impl Into<String>) {
        self.user_id = user_id.into();
        self.user_name = user_name.into();
    }

    pub fn watermark_text(&self) -> &str {
        &self.watermark_text
    }

    pub fn set_watermark_text(&mut self, text: impl Into<String>) {
        self.watermark_text = text.into();
    }

    pub fn kit_view_id(&self) -> i32 {
        self.kit_view_id
    }

    pub fn canonical_view_id(&self) -> i32 {
        self.canonical_view_id
    }

    pub fn set_canonical_view_id(&mut self, id: i32) {
        self.canonical_view_id = id;
    }

    pub fn is_text_document(&self) -> bool {
        self.is_text_document
    }

    pub fn host_no_trust(&self) -> &str {
        &self.host_no_trust
    }

    /// Record the Host header the client connected through.
    pub fn set_host_no_trust(&mut self, host: impl Into<String>) {
        self.host_no_trust = host.into();
    }

    pub fn selected_part(&self) -> i32 {
        self.selected_part
    }

    // ─── State machine ─────────────────────────────────────────────────

    fn set_state(&mut self, new_state: SessionState, now: Instant) {
        log::trace!(
            "session [{}]: {} -> {}",
            self.id,
            self.state.as_str(),
            new_state.as_str()
        );
        // Incoming messages can race our disconnect; never leave
        // WaitDisconnect once entered.
        if self.state == SessionState::WaitDisconnect && new_state != SessionState::WaitDisconnect {
            log::warn!(
                "session [{}]: refusing transition out of wait_disconnect to {}",
                self.id,
                new_state.as_str()
            );
            return;
        }
        self.state = new_state;
        self.last_state_time = now;
    }

    /// The broker attached us; the kit load is on its way.
    pub fn mark_loading(&mut self, now: Instant) {
        self.set_state(SessionState::Loading, now);
    }

    /// The kit's `status:` arrived for this view.
    pub fn mark_live(&mut self, kit_view_id: i32, is_text_document: bool, part: i32, now: Instant) {
        self.kit_view_id = kit_view_id;
        self.is_text_document = is_text_document;
        if self.selected_part < 0 {
            self.selected_part = part;
        }
        self.set_state(SessionState::Live, now);
    }

    /// Begin disconnecting. Returns true when the kit handshake
    /// (`getclipboard` + `disconnect`) should be performed, false when
    /// the session can be removed immediately.
    pub fn start_disconnect(&mut self, now: Instant) -> bool {
        if self.state == SessionState::Live {
            self.set_state(SessionState::WaitDisconnect, now);
            return true;
        }
        if self.state != SessionState::WaitDisconnect {
            self.set_state(SessionState::WaitDisconnect, now);
        }
        false
    }

    /// True after 20 s in `WaitDisconnect` without a kit ack.
    pub fn stale_wait_disconnect(&self, now: Instant) -> bool {
        self.state == SessionState::WaitDisconnect
            && now.duration_since(self.last_state_time) >= WAIT_DISCONNECT_TIMEOUT
    }

    // ─── Input filter ──────────────────────────────────────────────────

    /// Whether a client message is allowed through to the kit.
    ///
    /// Read-only sessions may only signal activity and search; WOPI
    /// disable flags drop copy/print/export commands.
    pub fn filter_message(&self, message: &str) -> bool {
        let tokens = crate::protocol::tokenize(message);
        let Some(&command) = tokens.first() else {
            return false;
        };

        let disable_copy = self.wopi_info.as_ref().is_some_and(|w| w.disable_copy);
        let disable_print = self.wopi_info.as_ref().is_some_and(|w| w.disable_print);
        let disable_export = self.wopi_info.as_ref().is_some_and(|w| w.disable_export);

        if command == "downloadas" {
            let Some(id) = crate::protocol::get_token_string(&tokens, "id") else {
                log::warn!("session [{}]: downloadas without id", self.id);
                return false;
            };
            if id == "print" && disable_print {
                log::warn!("session [{}]: print disabled by storage host", self.id);
                return false;
            }
            if id == "export" && disable_export {
                log::warn!("session [{}]: export disabled by storage host", self.id);
                return false;
            }
            return !self.read_only;
        }

        if (command == "gettextselection" || command == ".uno:Copy") && disable_copy {
            log::warn!("session [{}]: copy disabled by storage host", self.id);
            return false;
        }

        if self.read_only {
            // By default nothing is allowed in read-only mode.
            return match command {
                "userinactive" | "useractive" | "saveas" => true,
                "uno" => crate::protocol::token_matches(&tokens, 1, ".uno:ExecuteSearch"),
                _ => false,
            };
        }

        true
    }

    // ─── Clipboard keys ────────────────────────────────────────────────

    /// Rotate the key pair: current becomes previous, a fresh key is
    /// generated. No-op while disconnecting or when copy is disabled.
    pub fn rotate_clipboard_key(&mut self, notify_client: bool, _now: Instant) {
        if self.wopi_info.as_ref().is_some_and(|w| w.disable_copy) {
            return;
        }
        if self.state == SessionState::WaitDisconnect {
            return;
        }
        self.clipboard_keys[1] = std::mem::take(&mut self.clipboard_keys[0]);
        self.clipboard_keys[0] = crate::context::strong_random_hex(16);
        log::trace!(
            "session [{}]: clipboard key rotated to {}",
            self.id,
            &self.clipboard_keys[0][..8]
        );
        if notify_client {
            let frame = format!("clipboardkey: {}", self.clipboard_keys[0]);
            self.send_text_frame(&frame);
        }
    }

    pub fn current_clipboard_key(&self) -> &str {
        &self.clipboard_keys[0]
    }

    pub fn clipboard_keys(&self) -> [String; 2] {
        self.clipboard_keys.clone()
    }

    /// True when `tag` is the current or previous key.
    pub fn matches_clipboard_keys(&self, _view_id: &str, tag: &str) -> bool {
        if tag.is_empty() {
            log::error!("session [{}]: empty clipboard tag", self.id);
            return false;
        }
        self.clipboard_keys.iter().any(|k| k == tag)
    }

    /// URL on `server_base` from which this session's clipboard can be
    /// read, carrying enough identity to authenticate the request.
    pub fn clipboard_uri(
        &self,
        server_base: &str,
        wopi_src: &str,
        server_id: &str,
        encode: bool,
    ) -> Option<String> {
        if self.wopi_info.as_ref().is_some_and(|w| w.disable_copy) {
            return None;
        }
        use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
        // Match JS encodeURIComponent for the embedded WOPISrc.
        const COMPONENT: &AsciiSet = &CONTROLS
            .add(b' ')
            .add(b',')
            .add(b'/')
            .add(b'?')
            .add(b':')
            .add(b'@')
            .add(b'&')
            .add(b'=')
            .add(b'+')
            .add(b'$')
            .add(b'#')
            .add(b'%');
        let encoded_src = utf8_percent_encode(wopi_src, COMPONENT).to_string();
        let meta = format!(
            "{server_base}/clipboard?WOPISrc={encoded_src}&ServerId={server_id}&ViewId={}&Tag={}",
            self.kit_view_id, self.clipboard_keys[0]
        );
        if !encode {
            return Some(meta);
        }
        Some(utf8_percent_encode(&meta, COMPONENT).to_string())
    }

    /// Park a clipboard HTTP socket until content arrives from the kit.
    pub fn park_clipboard_socket(&mut self, socket: mpsc::Sender<Vec<u8>>) {
        self.clip_sockets.push(socket);
    }

    pub fn parked_clipboard_sockets(&self) -> usize {
        self.clip_sockets.len()
    }

    /// Clipboard content arrived from the kit: remember it, then serve
    /// every parked socket and release them.
    pub fn clipboard_arrived(&mut self, data: &Bytes) {
        if !data.is_empty() {
            self.last_clipboard = Some(data.clone());
        }
        if self.clip_sockets.is_empty() {
            return;
        }
        let response = build_clipboard_response(data);
        for socket in self.clip_sockets.drain(..) {
            let _ = socket.send(response.clone());
        }
    }

    /// Hand over the cached clipboard payload, if any.
    pub fn take_last_clipboard(&mut self) -> Option<Bytes> {
        self.last_clipboard.take()
    }

    // ─── Visible area and zoom ─────────────────────────────────────────

    /// Any view-state change invalidates the wire-id map so freshly
    /// requested tiles are not deduplicated against stale versions.
    pub fn set_visible_area(&mut self, area: Rect) {
        if area != self.visible_area {
            self.visible_area = area;
            self.reset_wire_id_map();
        }
    }

    pub fn visible_area(&self) -> Rect {
        self.visible_area
    }

    pub fn normalized_visible_area(&self) -> Rect {
        self.visible_area.normalized()
    }

    pub fn set_client_zoom(
        &mut self,
        tile_width_pixel: i32,
        tile_height_pixel: i32,
        tile_width_twips: i32,
        tile_height_twips: i32,
    ) {
        let changed = self.tile_width_pixel != tile_width_pixel
            || self.tile_height_pixel != tile_height_pixel
            || self.tile_width_twips != tile_width_twips
            || self.tile_height_twips != tile_height_twips;
        self.tile_width_pixel = tile_width_pixel;
        self.tile_height_pixel = tile_height_pixel;
        self.tile_width_twips = tile_width_twips;
        self.tile_height_twips = tile_height_twips;
        if changed {
            self.reset_wire_id_map();
        }
    }

    pub fn set_selected_part(&mut self, part: i32) {
        if self.selected_part != part {
            self.selected_part = part;
            self.reset_wire_id_map();
        }
    }

    pub fn tile_width_twips(&self) -> i32 {
        self.tile_width_twips
    }

    pub fn tile_height_twips(&self) -> i32 {
        self.tile_height_twips
    }

    pub fn tile_width_pixel(&self) -> i32 {
        self.tile_width_pixel
    }

    pub fn tile_height_pixel(&self) -> i32 {
        self.tile_height_pixel
    }

    /// True when we know enough view state to compute re-requests.
    pub fn has_view_metrics(&self) -> bool {
        self.visible_area.has_surface()
            && self.tile_width_pixel > 0
            && self.tile_height_pixel > 0
            && self.tile_width_twips > 0
            && self.tile_height_twips > 0
            && (self.selected_part >= 0 || self.is_text_document)
    }

    // ─── Tile flow control ─────────────────────────────────────────────

    pub fn requested_tiles_mut(&mut self) -> &mut VecDeque<TileDesc> {
        &mut self.requested_tiles
    }

    pub fn requested_tiles_len(&self) -> usize {
        self.requested_tiles.len()
    }

    pub fn add_tile_on_fly(&mut self, tile: &TileDesc, now: Instant) {
        self.tiles_on_fly.push_back((tile.generate_id(), now));
    }

    pub fn clear_tiles_on_fly(&mut self) {
        self.tiles_on_fly.clear();
    }

    pub fn tiles_on_fly_count(&self) -> usize {
        self.tiles_on_fly.len()
    }

    /// Forget entries older than the round-trip timeout. The list is
    /// ordered by send time, so only the front needs checking.
    pub fn remove_outdated_tiles_on_fly(&mut self, now: Instant) {
        while let Some((id, sent)) = self.tiles_on_fly.front() {
            if now.duration_since(*sent) > TILE_ROUNDTRIP_TIMEOUT {
                log::warn!(
                    "session [{}]: tile {} dropped from tiles-on-fly, tileprocessed never arrived",
                    self.id,
                    id
                );
                self.tiles_on_fly.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn count_identical_tiles_on_fly(&self, tile: &TileDesc) -> usize {
        let id = tile.generate_id();
        self.tiles_on_fly.iter().filter(|(on_fly, _)| *on_fly == id).count()
    }

    /// `tileprocessed tile=<id>`: release one flow-control slot.
    pub fn tile_processed(&mut self, tile_id: &str) {
        if let Some(pos) = self.tiles_on_fly.iter().position(|(id, _)| id == tile_id) {
            self.tiles_on_fly.remove(pos);
        } else {
            log::debug!(
                "session [{}]: tileprocessed for unknown tile {}",
                self.id,
                tile_id
            );
        }
    }

    pub fn reset_wire_id_map(&mut self) {
        self.wire_ids.clear();
    }

    pub fn last_sent_wire_id(&self, tile_id: &str) -> Option<TileWireId> {
        self.wire_ids.get(tile_id).copied()
    }

    /// Bookkeeping for every tile put on the wire (or suppressed as a
    /// duplicate): remember the wire id for tiles inside the visible
    /// area, and track the round trip unless deduplicated.
    pub fn trace_tile_by_send(&mut self, tile: &TileDesc, deduplicated: bool, now: Instant) {
        let tile_id = tile.generate_id();
        if let Some(entry) = self.wire_ids.get_mut(&tile_id) {
            *entry = tile.wire_id;
        } else if self.visible_area.has_surface()
            && tile.tile_pos_x >= self.visible_area.left()
            && tile.tile_pos_x <= self.visible_area.right()
            && tile.tile_pos_y >= self.visible_area.top()
            && tile.tile_pos_y <= self.visible_area.bottom()
        {
            self.wire_ids.insert(tile_id, tile.wire_id);
        }
        if !deduplicated {
            self.add_tile_on_fly(tile, now);
        }
    }

    // ─── Outbound ──────────────────────────────────────────────────────

    /// Queue a text frame for the client.
    pub fn send_text_frame(&self, message: &str) {
        log::trace!(
            "session [{}] ← {}",
            self.id,
            crate::protocol::abbreviate(message, 120)
        );
        if self.outbox.send(message.as_bytes().to_vec()).is_err() {
            log::debug!("session [{}]: outbound socket gone", self.id);
        }
    }

    /// Queue a binary frame for the client.
    pub fn send_binary_frame(&self, payload: Vec<u8>) {
        if self.outbox.send(payload).is_err() {
            log::debug!("session [{}]: outbound socket gone", self.id);
        }
    }

    /// Send an `error:` frame and log it.
    pub fn send_error(&self, cmd: &str, kind: &str) {
        log::error!("session [{}]: error cmd={cmd} kind={kind}", self.id);
        self.send_text_frame(&format!("error: cmd={cmd} kind={kind}"));
    }

    /// Deliver a rendered tile, suppressing wire-id duplicates.
    ///
    /// Returns true when bytes actually went on the wire.
    pub fn send_rendered_tile(
        &mut self,
        tile: &TileDesc,
        data: &Bytes,
        from_cache: bool,
        now: Instant,
    ) -> bool {
        let tile_id = tile.generate_id();
        let deduplicated =
            tile.wire_id != 0 && self.last_sent_wire_id(&tile_id) == Some(tile.wire_id);
        if !deduplicated {
            let suffix = if from_cache { " renderid=cached" } else { "" };
            let header = tile.serialize("tile:", suffix);
            let mut frame = Vec::with_capacity(header.len() + 1 + data.len());
            frame.extend_from_slice(header.as_bytes());
            frame.push(b'\n');
            frame.extend_from_slice(data);
            self.send_binary_frame(frame);
        } else {
            log::trace!(
                "session [{}]: tile {} deduplicated by wire id {}",
                self.id,
                tile_id,
                tile.wire_id
            );
        }
        self.trace_tile_by_send(tile, deduplicated, now);
        !deduplicated
    }

    /// Rewrite copied-content payloads to carry our clipboard origin so
    /// paste in another document can fetch the rich content.
    pub fn post_process_copy_payload(&self, payload: &str, clipboard_uri: &str) -> String {
        let meta = format!("<meta name=\"origin\" content=\"{clipboard_uri}\"/>\n");
        if let Some(pos) = payload.find("<head>") {
            let insert_at = pos + "<head>".len();
            let mut out = String::with_capacity(payload.len() + meta.len());
            out.push_str(&payload[..insert_at]);
            out.push_str(&meta);
            out.push_str(&payload[insert_at..]);
            return out;
        }
        payload.to_string()
    }
}

/// Minimal HTTP response wrapping clipboard bytes for a parked socket.
pub fn build_clipboard_response(data: &Bytes) -> Vec<u8> {
    let header = format!(
        "HTTP/1.1 200 OK\r\nUser-Agent: DocbrokerWOPI\r\nContent-Length: {}\r\nContent-Type: application/octet-stream\r\nX-Content-Type-Options: nosniff\r\n\r\n",
        data.len()
    );
    let mut response = Vec::with_capacity(header.len() + data.len());
    response.extend_from_slice(header.as_bytes());
    response.extend_from_slice(data);
    response
}

/// Minimal HTTP 400 for unmatched clipboard requests.
pub fn build_clipboard_not_found() -> Vec<u8> {
    b"HTTP/1.1 400 Bad Request\r\nUser-Agent: DocbrokerWOPI\r\nContent-Length: 0\r\n\r\n".to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_session() -> (ClientSession, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel();
        let session = ClientSession::new(
            "s1",
            "https://wopi.example/files/1?access_token=t",
            false,
            tx,
            Instant::now(),
        );
        (session, rx)
    }

    fn wopi_info(disable_copy: bool, disable_print: bool, disable_export: bool) -> FileInfo {
        FileInfo {
            base_file_name: "doc.odt".to_string(),
            disable_copy,
            disable_print,
            disable_export,
            ..FileInfo::default()
        }
    }

    fn tile(x: i32, y: i32, ver: i32, wid: TileWireId) -> TileDesc {
        let mut t = TileDesc::new(0, 0, 256, 256, x, y, 3840, 3840, ver, 0, -1, false).unwrap();
        t.wire_id = wid;
        t
    }

    #[test]
    fn test_state_machine_happy_path() {
        let (mut s, _rx) = test_session();
        let now = Instant::now();
        assert_eq!(s.state(), SessionState::Detached);
        s.mark_loading(now);
        assert_eq!(s.state(), SessionState::Loading);
        s.mark_live(3, true, 0, now);
        assert_eq!(s.state(), SessionState::Live);
        assert_eq!(s.kit_view_id(), 3);
        assert!(s.is_text_document());
        assert!(s.start_disconnect(now), "live sessions handshake with the kit");
        assert_eq!(s.state(), SessionState::WaitDisconnect);
    }

    #[test]
    fn test_wait_disconnect_is_sticky() {
        let (mut s, _rx) = test_session();
        let now = Instant::now();
        s.mark_loading(now);
        s.mark_live(1, false, 0, now);
        s.start_disconnect(now);
        s.mark_live(2, false, 0, now);
        assert_eq!(s.state(), SessionState::WaitDisconnect);
    }

    #[test]
    fn test_stale_wait_disconnect_after_timeout() {
        let (mut s, _rx) = test_session();
        let t0 = Instant::now();
        s.mark_loading(t0);
        s.mark_live(1, false, 0, t0);
        s.start_disconnect(t0);
        assert!(!s.stale_wait_disconnect(t0 + Duration::from_secs(19)));
        assert!(s.stale_wait_disconnect(t0 + Duration::from_secs(20)));
    }

    #[test]
    fn test_loading_session_disconnects_immediately() {
        let (mut s, _rx) = test_session();
        let now = Instant::now();
        s.mark_loading(now);
        assert!(!s.start_disconnect(now));
    }

    #[test]
    fn test_filter_read_only_allow_list() {
        let (mut s, _rx) = test_session();
        s.read_only = true;
        assert!(s.filter_message("useractive"));
        assert!(s.filter_message("userinactive"));
        assert!(s.filter_message("saveas url=x"));
        assert!(s.filter_message("uno .uno:ExecuteSearch"));
        assert!(!s.filter_message("uno .uno:Bold"));
        assert!(!s.filter_message("key type=input char=97 key=0"));
        assert!(!s.filter_message("paste mimetype=text/plain"));
    }

    #[test]
    fn test_filter_disable_copy() {
        let (mut s, _rx) = test_session();
        s.set_wopi_info(wopi_info(true, false, false));
        assert!(!s.filter_message("gettextselection mimetype=text/plain"));
        assert!(!s.filter_message(".uno:Copy"));
        assert!(s.filter_message("key type=input char=97 key=0"));
    }

    #[test]
    fn test_filter_disable_print_and_export() {
        let (mut s, _rx) = test_session();
        s.set_wopi_info(wopi_info(false, true, true));
        assert!(!s.filter_message("downloadas name=x id=print format=pdf"));
        assert!(!s.filter_message("downloadas name=x id=export format=pdf"));
        assert!(s.filter_message("downloadas name=x id=anything format=odt"));
        assert!(!s.filter_message("downloadas name=x"));
    }

    #[test]
    fn test_clipboard_key_rotation_keeps_previous() {
        let (mut s, rx) = test_session();
        let now = Instant::now();
        let key0 = s.current_clipboard_key().to_string();
        assert_eq!(key0.len(), 32);

        s.rotate_clipboard_key(true, now);
        let key1 = s.current_clipboard_key().to_string();
        assert_ne!(key0, key1);
        assert!(s.matches_clipboard_keys("", &key0), "previous key still valid");
        assert!(s.matches_clipboard_keys("", &key1));
        let frame = rx.try_recv().unwrap();
        assert!(String::from_utf8(frame).unwrap().starts_with("clipboardkey: "));

        s.rotate_clipboard_key(false, now);
        assert!(!s.matches_clipboard_keys("", &key0), "two rotations invalidate");
        assert!(!s.matches_clipboard_keys("", ""));
    }

    #[test]
    fn test_clipboard_rotation_stops_on_disconnect() {
        let (mut s, _rx) = test_session();
        let now = Instant::now();
        s.mark_loading(now);
        s.mark_live(1, false, 0, now);
        s.start_disconnect(now);
        let key = s.current_clipboard_key().to_string();
        s.rotate_clipboard_key(false, now);
        assert_eq!(s.current_clipboard_key(), key);
    }

    #[test]
    fn test_clipboard_uri_contains_identity() {
        let (mut s, _rx) = test_session();
        s.mark_loading(Instant::now());
        s.mark_live(7, false, 0, Instant::now());
        let uri = s
            .clipboard_uri("https://office.example", "https://wopi.example/files/1", "srv1", false)
            .unwrap();
        assert!(uri.starts_with("https://office.example/clipboard?WOPISrc="));
        assert!(uri.contains("https%3A%2F%2Fwopi.example%2Ffiles%2F1"));
        assert!(uri.contains("&ServerId=srv1"));
        assert!(uri.contains("&ViewId=7"));
        assert!(uri.contains(&format!("&Tag={}", s.current_clipboard_key())));
    }

    #[test]
    fn test_clipboard_uri_denied_when_copy_disabled() {
        let (mut s, _rx) = test_session();
        s.set_wopi_info(wopi_info(true, false, false));
        assert!(s.clipboard_uri("https://h", "https://w/f/1", "srv", false).is_none());
    }

    #[test]
    fn test_clipboard_arrival_serves_parked_sockets() {
        let (mut s, _rx) = test_session();
        let (sock_tx, sock_rx) = mpsc::channel();
        s.park_clipboard_socket(sock_tx);
        s.clipboard_arrived(&Bytes::from_static(b"clip-data"));
        let response = sock_rx.try_recv().unwrap();
        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 200 OK"));
        assert!(text.contains("Content-Length: 9"));
        assert!(text.ends_with("clip-data"));
        assert_eq!(s.parked_clipboard_sockets(), 0);
    }

    #[test]
    fn test_clipboard_arrival_caches_payload_for_rescue() {
        let (mut s, _rx) = test_session();
        // Cached even when no socket is waiting.
        s.clipboard_arrived(&Bytes::from_static(b"rescued"));
        assert_eq!(s.take_last_clipboard().unwrap(), Bytes::from_static(b"rescued"));
        assert!(s.take_last_clipboard().is_none(), "handed over exactly once");

        // Empty deliveries don't clobber the cache with nothing.
        s.clipboard_arrived(&Bytes::new());
        assert!(s.take_last_clipboard().is_none());
    }

    #[test]
    fn test_visible_area_change_clears_wire_ids() {
        let (mut s, _rx) = test_session();
        let now = Instant::now();
        s.set_visible_area(Rect::new(0, 0, 15360, 15360));
        let t = tile(0, 0, 1, 42);
        s.trace_tile_by_send(&t, false, now);
        assert_eq!(s.last_sent_wire_id(&t.generate_id()), Some(42));

        s.set_visible_area(Rect::new(0, 3840, 15360, 15360));
        assert_eq!(s.last_sent_wire_id(&t.generate_id()), None);
    }

    #[test]
    fn test_zoom_change_clears_wire_ids() {
        let (mut s, _rx) = test_session();
        s.set_visible_area(Rect::new(0, 0, 15360, 15360));
        s.trace_tile_by_send(&tile(0, 0, 1, 9), false, Instant::now());
        s.set_client_zoom(256, 256, 1920, 1920);
        assert!(s.last_sent_wire_id("0:0:0:3840:3840:0").is_none());
    }

    #[test]
    fn test_tiles_on_fly_roundtrip_and_timeout() {
        let (mut s, _rx) = test_session();
        let t0 = Instant::now();
        let t = tile(0, 0, 1, 0);
        s.add_tile_on_fly(&t, t0);
        s.add_tile_on_fly(&t, t0);
        assert_eq!(s.tiles_on_fly_count(), 2);
        assert_eq!(s.count_identical_tiles_on_fly(&t), 2);

        s.tile_processed(&t.generate_id());
        assert_eq!(s.tiles_on_fly_count(), 1);

        s.remove_outdated_tiles_on_fly(t0 + TILE_ROUNDTRIP_TIMEOUT + Duration::from_millis(1));
        assert_eq!(s.tiles_on_fly_count(), 0);
    }

    #[test]
    fn test_send_rendered_tile_dedups_by_wire_id() {
        let (mut s, rx) = test_session();
        let now = Instant::now();
        s.set_visible_area(Rect::new(0, 0, 15360, 15360));
        let t = tile(0, 0, 1, 77);
        let data = Bytes::from_static(b"png-bytes");

        assert!(s.send_rendered_tile(&t, &data, false, now));
        let frame = rx.try_recv().unwrap();
        assert!(frame.starts_with(b"tile: nviewid=0"));
        assert!(frame.ends_with(b"png-bytes"));

        // Same wire id again: suppressed, but no on-fly slot is consumed.
        assert!(!s.send_rendered_tile(&t, &data, false, now));
        assert!(rx.try_recv().is_err());
        assert_eq!(s.tiles_on_fly_count(), 1);
    }

    #[test]
    fn test_send_rendered_tile_cached_marker() {
        let (mut s, rx) = test_session();
        let t = tile(0, 0, 1, 5);
        s.send_rendered_tile(&t, &Bytes::from_static(b"x"), true, Instant::now());
        let frame = rx.try_recv().unwrap();
        let text = String::from_utf8_lossy(&frame);
        assert!(text.contains(" renderid=cached\n"));
    }

    #[test]
    fn test_post_process_copy_payload_injects_origin() {
        let (s, _rx) = test_session();
        let html = "<html><head><style/></head><body>hi</body></html>";
        let out = s.post_process_copy_payload(html, "https://h/clipboard?Tag=k");
        assert!(out.contains("<head><meta name=\"origin\" content=\"https://h/clipboard?Tag=k\"/>"));
        // Non-HTML payloads pass through untouched.
        let plain = "just text";
        assert_eq!(s.post_process_copy_payload(plain, "u"), plain);
    }

    #[test]
    fn test_set_read_only_notifies_client() {
        let (mut s, rx) = test_session();
        s.set_read_only();
        assert_eq!(rx.try_recv().unwrap(), b"perm: readonly");
        assert!(s.is_read_only());
    }
}
