//! Document broker: the per-document coordinator.
//!
//! One broker owns one open document end to end: it admits client
//! sessions, spawns and talks to the rendering kit, loads the file from
//! storage into the jail, routes messages both ways, orchestrates the
//! save → upload pipeline, keeps the WOPI lock fresh, and tears the
//! whole thing down when the last session leaves.
//!
//! ```text
//!            ┌──────────────────────┐
//!            │   DocumentBroker     │
//!            │  - owns all state    │
//!            │  - single poll thread│
//!            └──────────┬───────────┘
//!                       │
//!        ┌──────────────┼──────────────┐
//!        ▼              ▼              ▼
//!    sessions        kit process    WOPI storage
//!  (editor views)   (renders)      (authoritative file)
//! ```
//!
//! Every mutation happens on the broker's poll thread; cross-thread work
//! arrives as [`BrokerEvent`]s (see `events`) and async storage results
//! are delivered back through the same channel.

pub mod events;
pub mod poll;
mod tiles;

pub use events::{BrokerCallback, BrokerEvent};
pub use poll::DocBrokerHandle;

use crate::config::Config;
use crate::context::ProcessContext;
use crate::jail::Jail;
use crate::kit::KitProcess;
use crate::quarantine::Quarantine;
use crate::rect::Rect;
use crate::session::{ClientSession, SessionRef, SessionState};
use crate::storage::{
    Authorization, LockContext, LockResult, SaveTarget, UploadAttributes, UploadOutcome,
    WopiStorage,
};
use crate::tile::TileCache;
use anyhow::{Context as _, Result};
use bytes::Bytes;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Kit command round-trip allowance (save acknowledgement, renders).
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between autosave checks.
const AUTOSAVE_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Interval between clipboard key rotations.
const CLIPBOARD_ROTATION_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// How long to keep waiting for a kit process at startup.
const KIT_SPAWN_DEADLINE_MULTIPLIER: u32 = 5;

/// Characters escaped when embedding values in wire messages (matches JS
/// `encodeURIComponent`).
const COMPONENT_ESCAPE: &AsciiSet = &percent_encoding::CONTROLS
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
    .add(b'%')
    .add(b'"');

/// Derive the canonical document key from a public URI.
///
/// The key is the URL-encoded URI path with host and query dropped, so
/// host aliases pointing at the same file share one broker.
pub fn doc_key_from_uri(uri: &str) -> String {
    let after_scheme = uri.split_once("://").map_or(uri, |(_, rest)| rest);
    let path_and_query = match after_scheme.find('/') {
        Some(pos) => &after_scheme[pos..],
        None => "/",
    };
    let path = path_and_query.split('?').next().unwrap_or("/");
    let decoded = percent_decode_str(path).decode_utf8_lossy();
    const KEY_SET: &AsciiSet = &NON_ALPHANUMERIC
        .remove(b'/')
        .remove(b'.')
        .remove(b'-')
        .remove(b'_')
        .remove(b'~');
    utf8_percent_encode(&decoded, KEY_SET).to_string()
}

fn encode_component(value: &str) -> String {
    utf8_percent_encode(value, COMPONENT_ESCAPE).to_string()
}

/// Per-session load options parsed from the client's `load` message.
#[derive(Debug, Clone, Default)]
pub struct LoadParams {
    pub part: Option<i32>,
    pub password: String,
    pub lang: String,
    pub watermark_text: String,
    pub options: String,
}

/// The per-document coordinator. See the module docs.
pub struct DocumentBroker {
    uri_public: String,
    doc_key: String,
    doc_id: u32,
    config: Arc<Config>,
    ctx: Arc<ProcessContext>,
    poll_tx: mpsc::Sender<BrokerEvent>,

    sessions: HashMap<String, SessionRef>,
    kit: Option<KitProcess>,
    storage: Option<WopiStorage>,
    lock_ctx: LockContext,
    cache: Option<TileCache>,
    jail: Option<Jail>,
    quarantine: Quarantine,

    /// Filename of the document inside the jail.
    filename: String,
    /// True once the file landed in the jail.
    storage_loaded: bool,
    /// True when the jail content came from a template source.
    template_loaded: bool,
    /// True once the kit confirmed the first view.
    is_loaded: bool,
    is_modified: bool,
    document_changed_in_storage: bool,
    mark_to_destroy: bool,
    close_request: bool,
    close_reason: String,
    stop_flag: bool,
    /// Set when modified content could not be uploaded before unload.
    data_loss: bool,

    /// Storage timestamp snapshot taken at first load; the conflict
    /// anchor.
    document_last_modified_time: Option<chrono::DateTime<chrono::Utc>>,

    /// Monotonic render version; every issued tile gets a fresh one.
    tile_version: i32,
    rendered_tile_count: u32,
    cursor: Rect,
    kit_dirty_kb: Option<u64>,
    initial_settings: HashSet<String>,

    thread_start: Instant,
    last_activity_time: Instant,
    last_save_time: Instant,
    last_save_request_time: Option<Instant>,
    last_save_response_time: Option<Instant>,
    last_upload_request_time: Option<Instant>,
    last_autosave_check_time: Instant,
    last_clipboard_rotation_time: Instant,

    /// An async PutFile is in flight; no second upload may start.
    upload_in_flight: bool,
    /// Target filename of a client-requested rename, consumed by the
    /// next successful save.
    pending_rename: Option<String>,
    pending_version_restore: bool,
    /// Attributes captured when the save was issued, applied to the
    /// upload that follows the kit's acknowledgement.
    next_upload_attribs: UploadAttributes,
    consecutive_upload_failures: u32,
    /// Convert-to documents carry a hard lifetime cap.
    limit_life: Option<Duration>,
}

impl std::fmt::Debug for DocumentBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentBroker")
            .field("doc_key", &self.doc_key)
            .field("doc_id", &self.doc_id)
            .field("sessions", &self.sessions.len())
            .field("is_loaded", &self.is_loaded)
            .field("is_modified", &self.is_modified)
            .finish_non_exhaustive()
    }
}

impl DocumentBroker {
    pub fn new(
        uri_public: impl Into<String>,
        config: Arc<Config>,
        ctx: Arc<ProcessContext>,
        poll_tx: mpsc::Sender<BrokerEvent>,
        now: Instant,
    ) -> Self {
        let uri_public = uri_public.into();
        let doc_key = doc_key_from_uri(&uri_public);
        let doc_id = ctx.next_doc_id();
        log::info!(
            "[broker] created for docKey [{doc_key}] docId {doc_id} uri [{}]",
            ctx.anonymizer.anonymize_url(&uri_public)
        );
        let quarantine = Quarantine::from_config(&config.quarantine_files);
        Self {
            uri_public,
            doc_key,
            doc_id,
            config,
            ctx,
            poll_tx,
            sessions: HashMap::new(),
            kit: None,
            storage: None,
            lock_ctx: LockContext::default(),
            cache: None,
            jail: None,
            quarantine,
            filename: String::new(),
            storage_loaded: false,
            template_loaded: false,
            is_loaded: false,
            is_modified: false,
            document_changed_in_storage: false,
            mark_to_destroy: false,
            close_request: false,
            close_reason: String::new(),
            stop_flag: false,
            data_loss: false,
            document_last_modified_time: None,
            tile_version: 0,
            rendered_tile_count: 0,
            cursor: Rect::default(),
            kit_dirty_kb: None,
            initial_settings: HashSet::new(),
            thread_start: now,
            last_activity_time: now,
            last_save_time: now,
            last_save_request_time: None,
            last_save_response_time: None,
            last_upload_request_time: None,
            last_autosave_check_time: now,
            last_clipboard_rotation_time: now,
            upload_in_flight: false,
            pending_rename: None,
            pending_version_restore: false,
            next_upload_attribs: UploadAttributes::default(),
            consecutive_upload_failures: 0,
            limit_life: None,
        }
    }

    /// Cap the broker's lifetime (convert-to documents).
    pub fn set_life_limit(&mut self, limit: Duration) {
        self.limit_life = Some(limit);
    }

    pub fn doc_key(&self) -> &str {
        &self.doc_key
    }

    pub fn doc_id(&self) -> u32 {
        self.doc_id
    }

    pub fn public_uri(&self) -> &str {
        &self.uri_public
    }

    pub fn is_loaded(&self) -> bool {
        self.is_loaded
    }

    pub fn is_modified(&self) -> bool {
        self.is_modified
    }

    pub fn is_marked_to_destroy(&self) -> bool {
        self.mark_to_destroy
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn rendered_tile_count(&self) -> u32 {
        self.rendered_tile_count
    }

    pub fn lock_context(&self) -> &LockContext {
        &self.lock_ctx
    }

    pub fn cursor(&self) -> Rect {
        self.cursor
    }

    /// True when modified content was dropped at unload; the hook tests
    /// and operators watch.
    pub fn had_data_loss(&self) -> bool {
        self.data_loss
    }

    pub fn should_stop(&self) -> bool {
        self.stop_flag
    }

    pub fn close_reason(&self) -> &str {
        &self.close_reason
    }

    /// Inject a kit handle (pre-spawned or loopback for tests).
    pub fn set_kit(&mut self, kit: KitProcess) {
        self.kit = Some(kit);
    }

    /// Last `procmemstats:` dirty-memory report from the kit, in KiB.
    pub fn kit_dirty_kb(&self) -> Option<u64> {
        self.kit_dirty_kb
    }

    /// The storage copy changed beneath us (detected at load or upload).
    pub fn document_changed_in_storage(&self) -> bool {
        self.document_changed_in_storage
    }

    fn set_modified(&mut self, value: bool) {
        if self.is_modified != value {
            log::debug!("[broker] docKey [{}] modified: {value}", self.doc_key);
            self.is_modified = value;
        }
    }

    /// A save request was issued and not yet acknowledged by the kit.
    fn is_saving(&self) -> bool {
        match (self.last_save_request_time, self.last_save_response_time) {
            (Some(request), Some(response)) => request > response,
            (Some(_), None) => true,
            _ => false,
        }
    }

    /// Anything worth uploading: the kit said modified, or activity
    /// happened after the last save.
    fn is_possibly_modified(&self) -> bool {
        self.is_modified || self.last_activity_time > self.last_save_time
    }

    // ─── Event dispatch ────────────────────────────────────────────────

    /// Apply one poll event. Returns false when the loop should stop.
    pub fn handle_event(&mut self, event: BrokerEvent, now: Instant) -> bool {
        match event {
            BrokerEvent::AddSession {
                id,
                uri,
                read_only,
                outbox,
            } => {
                if let Err(e) = self.add_session(&id, &uri, read_only, outbox, now) {
                    log::error!("[broker] failed to add session [{id}]: {e:#}");
                }
            }
            BrokerEvent::RemoveSession { id } => self.remove_session(&id, now),
            BrokerEvent::ClientMessage { session_id, data } => {
                self.handle_client_message(&session_id, &data, now);
            }
            BrokerEvent::KitMessage(data) => self.handle_kit_message(&data, now),
            BrokerEvent::KitExited => self.handle_kit_exited(),
            BrokerEvent::UploadComplete {
                session_id,
                outcome,
                is_save_as,
                is_rename,
            } => self.handle_upload_complete(&session_id, outcome, is_save_as, is_rename, now),
            BrokerEvent::ClipboardRequest {
                view_id,
                tag,
                socket,
            } => self.handle_clipboard_request(&view_id, &tag, socket),
            BrokerEvent::CloseDocument { reason } => self.close_document(&reason),
            BrokerEvent::Callback(callback) => callback(self),
            BrokerEvent::Wakeup => {}
            BrokerEvent::Stop => {
                self.stop("stopped");
                return false;
            }
        }
        !self.stop_flag
    }

    // ─── Session lifecycle ─────────────────────────────────────────────

    /// Admit a new session. The kit is requested on the first one.
    pub fn add_session(
        &mut self,
        id: &str,
        uri: &str,
        read_only: bool,
        outbox: mpsc::Sender<Vec<u8>>,
        now: Instant,
    ) -> Result<SessionRef> {
        if self.mark_to_destroy {
            anyhow::bail!("document marked to destroy, not admitting [{id}]");
        }
        if self.sessions.is_empty() && self.kit.is_none() && !self.ensure_kit(now) {
            self.broadcast_message("error: cmd=load kind=docloadtimeout");
            self.stop("kit unavailable");
            anyhow::bail!("no kit process for docKey [{}]", self.doc_key);
        }

        let session = Rc::new(RefCell::new(ClientSession::new(
            id, uri, read_only, outbox, now,
        )));
        self.sessions.insert(id.to_string(), Rc::clone(&session));
        log::info!(
            "[broker] session [{id}] added to docKey [{}], {} sessions now",
            self.doc_key,
            self.sessions.len()
        );
        Ok(session)
    }

    /// Bounded wait for a kit process.
    fn ensure_kit(&mut self, _now: Instant) -> bool {
        let deadline = Instant::now() + COMMAND_TIMEOUT * KIT_SPAWN_DEADLINE_MULTIPLIER;
        loop {
            match KitProcess::spawn(&self.config.kit.command, self.poll_tx.clone()) {
                Ok(kit) => {
                    self.kit = Some(kit);
                    return true;
                }
                Err(e) => {
                    log::warn!("[broker] kit spawn failed: {e:#}");
                    if Instant::now() >= deadline {
                        return false;
                    }
                    std::thread::sleep(Duration::from_millis(250));
                }
            }
        }
    }

    pub fn session(&self, id: &str) -> Option<SessionRef> {
        self.sessions.get(id).cloned()
    }

    /// Client socket went away (or the client asked to leave).
    pub fn remove_session(&mut self, id: &str, now: Instant) {
        let Some(session) = self.sessions.get(id).cloned() else {
            return;
        };

        // The last writable session saves on the way out.
        if !self.have_another_editable_session(id) {
            self.mark_to_destroy = true;
            if self.is_possibly_modified() && session.borrow().is_writable() {
                log::info!(
                    "[broker] last editable session [{id}] leaving docKey [{}], saving",
                    self.doc_key
                );
                self.auto_save(true, false, now);
            }
        }

        self.cancel_tile_requests(&session, now);

        let needs_handshake = session.borrow_mut().start_disconnect(now);
        if needs_handshake {
            // Rescue the clipboard, then ask the kit to drop the view.
            self.forward_to_kit(id, "getclipboard");
            self.forward_to_kit(id, "disconnect");
        } else {
            self.final_remove_session(id);
        }
    }

    /// Hard-remove: drop the session object and its kit view.
    pub fn final_remove_session(&mut self, id: &str) {
        if let Some(session) = self.sessions.remove(id) {
            // Rescue the last clipboard content the kit delivered so HTTP
            // reads authenticated by this session's keys keep working.
            let mut s = session.borrow_mut();
            if let Some(payload) = s.take_last_clipboard() {
                self.ctx.saved_clipboards.insert(&s.clipboard_keys(), payload);
            }
            drop(s);
            log::info!(
                "[broker] session [{id}] removed from docKey [{}], {} left",
                self.doc_key,
                self.sessions.len()
            );
        }
        if self.sessions.is_empty() {
            self.mark_to_destroy = true;
        }
    }

    fn have_another_editable_session(&self, excluding: &str) -> bool {
        self.sessions.iter().any(|(id, session)| {
            id != excluding && {
                let s = session.borrow();
                !s.is_read_only() && !s.in_wait_disconnect()
            }
        })
    }

    /// The session to issue saves and lock refreshes with: prefer the
    /// document owner, else any writable loaded session, else the first.
    fn writable_session_id(&self) -> Option<String> {
        let mut chosen: Option<(String, bool)> = None;
        for (id, session) in &self.sessions {
            let s = session.borrow();
            if s.is_document_owner() {
                return Some(id.clone());
            }
            let writable = s.is_writable();
            match &chosen {
                None => chosen = Some((id.clone(), writable)),
                Some((_, false)) if writable => chosen = Some((id.clone(), true)),
                _ => {}
            }
        }
        chosen.map(|(id, _)| id)
    }

    // ─── Client input ──────────────────────────────────────────────────

    /// One framed message from a client session.
    pub fn handle_client_message(&mut self, session_id: &str, data: &[u8], now: Instant) {
        let Some(session) = self.sessions.get(session_id).cloned() else {
            log::warn!("[broker] message for unknown session [{session_id}]");
            return;
        };
        let message = String::from_utf8_lossy(data).to_string();
        let first_line = message.lines().next().unwrap_or("").to_string();
        let tokens = crate::protocol::tokenize(&first_line);
        let Some(&command) = tokens.first() else {
            return;
        };

        log::trace!(
            "[broker] [{session_id}] → {}",
            crate::protocol::abbreviate(&first_line, 120)
        );

        if !session.borrow().filter_message(&first_line) {
            session.borrow().send_error(command, "unauthorized");
            return;
        }

        self.last_activity_time = now;

        match command {
            "loolclient" => self.handle_hello(&session),
            "load" => {
                let params = LoadParams {
                    part: crate::protocol::get_token_i64(&tokens, "part").map(|p| p as i32),
                    password: crate::protocol::get_token_string(&tokens, "password")
                        .unwrap_or_default()
                        .to_string(),
                    lang: crate::protocol::get_token_string(&tokens, "lang")
                        .unwrap_or_default()
                        .to_string(),
                    watermark_text: crate::protocol::get_token_string(&tokens, "watermarkText")
                        .map(|w| percent_decode_str(w).decode_utf8_lossy().to_string())
                        .unwrap_or_default(),
                    options: crate::protocol::get_token_string(&tokens, "options")
                        .unwrap_or_default()
                        .to_string(),
                };
                if let Err(e) = self.load_document(&session, &params, now) {
                    log::error!(
                        "[broker] load failed for docKey [{}]: {e:#}",
                        self.doc_key
                    );
                    session.borrow().send_text_frame("loadstorage: failed");
                    self.stop("load failed");
                }
            }
            "tile" => match crate::tile::TileDesc::parse_tokens(&tokens[1..]) {
                Ok(desc) => self.handle_tile_request(desc, &session, now),
                Err(e) => {
                    log::warn!("[broker] bad tile request: {e}");
                    session.borrow().send_error("tile", "invalid");
                }
            },
            "tilecombine" => match crate::tile::TileCombined::parse_tokens(&tokens[1..]) {
                Ok(combined) => self.handle_tile_combined_request(combined, &session, now),
                Err(e) => {
                    log::warn!("[broker] bad tilecombine request: {e}");
                    session.borrow().send_error("tilecombine", "invalid");
                }
            },
            "tileprocessed" => {
                if let Some(tile_id) = crate::protocol::get_token_string(&tokens, "tile") {
                    session.borrow_mut().tile_processed(tile_id);
                }
                self.send_requested_tiles(&session, now);
            }
            "canceltiles" => self.cancel_tile_requests(&session, now),
            "clientvisiblearea" => {
                let x = crate::protocol::get_token_i64(&tokens, "x").unwrap_or(0) as i32;
                let y = crate::protocol::get_token_i64(&tokens, "y").unwrap_or(0) as i32;
                let width = crate::protocol::get_token_i64(&tokens, "width").unwrap_or(0) as i32;
                let height = crate::protocol::get_token_i64(&tokens, "height").unwrap_or(0) as i32;
                session.borrow_mut().set_visible_area(Rect::new(x, y, width, height));
                self.forward_to_kit(session_id, &first_line);
            }
            "clientzoom" => {
                let twp =
                    crate::protocol::get_token_i64(&tokens, "tilepixelwidth").unwrap_or(0) as i32;
                let thp =
                    crate::protocol::get_token_i64(&tokens, "tilepixelheight").unwrap_or(0) as i32;
                let twt =
                    crate::protocol::get_token_i64(&tokens, "tiletwipwidth").unwrap_or(0) as i32;
                let tht =
                    crate::protocol::get_token_i64(&tokens, "tiletwipheight").unwrap_or(0) as i32;
                session.borrow_mut().set_client_zoom(twp, thp, twt, tht);
                self.forward_to_kit(session_id, &first_line);
            }
            "setclientpart" | "selectclientpart" => {
                if let Some(part) = crate::protocol::get_token_i64(&tokens, "part") {
                    session.borrow_mut().set_selected_part(part as i32);
                }
                self.forward_to_kit(session_id, &first_line);
            }
            "save" => {
                let dont_terminate_edit =
                    crate::protocol::get_token_i64(&tokens, "dontTerminateEdit").unwrap_or(0) != 0;
                let dont_save_if_unmodified =
                    crate::protocol::get_token_i64(&tokens, "dontSaveIfUnmodified").unwrap_or(0)
                        != 0;
                let extended_data = crate::protocol::get_token_string(&tokens, "extendedData")
                    .unwrap_or_default()
                    .to_string();
                self.send_uno_save(
                    session_id,
                    dont_terminate_edit,
                    dont_save_if_unmodified,
                    false,
                    false,
                    &extended_data,
                    now,
                );
            }
            "savetostorage" => {
                let force = crate::protocol::get_token_i64(&tokens, "force").unwrap_or(0) != 0;
                self.upload_to_storage(session_id, true, "", force, now);
            }
            "renamefile" => {
                let Some(filename) = crate::protocol::get_token_string(&tokens, "filename") else {
                    session.borrow().send_error("renamefile", "invalid");
                    return;
                };
                let decoded = percent_decode_str(filename).decode_utf8_lossy().to_string();
                self.pending_rename = Some(decoded);
                // Flush edits first; the upload after the save carries the
                // RENAME_FILE override.
                self.send_uno_save(session_id, true, false, false, false, "", now);
            }
            "saveas" => {
                self.forward_to_kit(session_id, &first_line);
            }
            "closedocument" => {
                let is_owner = session.borrow().is_document_owner();
                let owner_termination = session
                    .borrow()
                    .wopi_info()
                    .is_some_and(|w| w.enable_owner_termination);
                if is_owner && owner_termination {
                    for (id, other) in &self.sessions {
                        if id != session_id {
                            other.borrow().send_text_frame("close: ownertermination");
                        }
                    }
                    self.close_document("ownertermination");
                } else {
                    self.remove_session(session_id, now);
                }
            }
            "versionrestore" => {
                if crate::protocol::token_matches(&tokens, 1, "prerestore") {
                    self.pending_version_restore = true;
                    if !self.auto_save(true, false, now) {
                        // Nothing to flush; acknowledge immediately.
                        self.pending_version_restore = false;
                        self.broadcast_message("close: versionrestore: prerestore_ack");
                    }
                }
            }
            "ping" => {
                session
                    .borrow()
                    .send_text_frame(&format!("pong rendercount={}", self.rendered_tile_count));
            }
            "useractive" | "userinactive" => {
                self.forward_to_kit(session_id, &first_line);
            }
            "commandvalues" => {
                let cmd = crate::protocol::get_token_string(&tokens, "command").unwrap_or("");
                let cached = self.cache.as_ref().and_then(|c| {
                    c.lookup_stream(crate::tile::StreamType::CmdValues, cmd)
                });
                if let Some(data) = cached {
                    let mut frame = b"commandvalues: ".to_vec();
                    frame.extend_from_slice(&data);
                    session.borrow().send_binary_frame(frame);
                } else {
                    self.forward_to_kit(session_id, &first_line);
                }
            }
            "renderfont" => {
                let font = crate::protocol::get_token_string(&tokens, "font").unwrap_or("");
                let cached = self
                    .cache
                    .as_ref()
                    .and_then(|c| c.lookup_stream(crate::tile::StreamType::Font, font));
                if let Some(data) = cached {
                    let mut frame = format!("renderfont: {font}\n").into_bytes();
                    frame.extend_from_slice(&data);
                    session.borrow().send_binary_frame(frame);
                } else {
                    self.forward_to_kit(session_id, &first_line);
                }
            }
            // Everything else (key, mouse, textinput, paste, selecttext,
            // uno, status, ...) goes to the kit unchanged.
            _ => {
                // The full message can be multi-line (paste payloads).
                self.forward_to_kit(session_id, &message);
            }
        }
    }

    /// Capability handshake reply.
    fn handle_hello(&mut self, session: &SessionRef) {
        let s = session.borrow();
        let server_info = serde_json::json!({
            "Version": self.ctx.version,
            "Id": self.ctx.host_identifier,
        });
        s.send_text_frame(&format!("loolserver {server_info}"));
        s.send_text_frame("lokitversion {\"ProductName\":\"docbroker kit\"}");
        let host = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        s.send_text_frame(&format!("osinfo {} {host}", std::env::consts::OS));
        s.send_text_frame(&format!("clipboardkey: {}", s.current_clipboard_key()));
    }

    // ─── Document load ─────────────────────────────────────────────────

    /// Load the document for `session`: CheckFileInfo, conflict check,
    /// download into the jail, lock, and the kit-side view load.
    pub fn load_document(
        &mut self,
        session: &SessionRef,
        params: &LoadParams,
        now: Instant,
    ) -> Result<()> {
        if self.mark_to_destroy {
            anyhow::bail!("will not load into a document marked to destroy");
        }

        let session_id = session.borrow().id().to_string();
        session.borrow_mut().mark_loading(now);

        let first_instance = self.storage.is_none();
        if first_instance {
            let storage = WopiStorage::new(
                session.borrow().public_uri().to_string(),
                self.config.connection_timeout(),
                self.config.storage.wopi.is_legacy_server,
                self.ctx.host_identifier.clone(),
            )
            .context("creating WOPI storage")?;
            self.storage = Some(storage);
        }

        let auth = Authorization::from_uri(session.borrow().public_uri());
        let storage = self.storage.as_mut().expect("storage created above");
        let mut info = match storage.check_file_info(&auth) {
            Ok(info) => info,
            Err(crate::storage::StorageError::Unauthorized) => {
                session.borrow().send_error("internal", "unauthorized");
                anyhow::bail!("CheckFileInfo unauthorized");
            }
            Err(e) => return Err(e).context("CheckFileInfo"),
        };

        if info.supports_locks {
            self.lock_ctx.init_supports_locks();
        }

        // Global watermark override beats the per-document one.
        if !self.config.watermark.text.is_empty() {
            info.watermark_text = self.config.watermark.text.clone();
        }

        // Conflict check against the snapshot from first load.
        if first_instance {
            self.document_last_modified_time = info.modified_time;
        } else if let (Some(snapshot), Some(current)) =
            (self.document_last_modified_time, info.modified_time)
        {
            if snapshot != current {
                log::warn!(
                    "[broker] docKey [{}] changed in storage behind our back",
                    self.doc_key
                );
                self.document_changed_in_storage = true;
                let message = if self.is_modified {
                    "error: cmd=storage kind=documentconflict"
                } else {
                    "close: documentconflict"
                };
                self.broadcast_message(message);
            }
        }

        // Apply the session-side view of the file info.
        {
            let mut s = session.borrow_mut();
            s.set_user(info.user_id.clone(), info.username.clone());
            let watermark = if params.watermark_text.is_empty() {
                info.watermark_text.clone()
            } else {
                params.watermark_text.clone()
            };
            s.set_watermark_text(watermark);
            if info.user_id == info.owner_id && !info.owner_id.is_empty() {
                s.set_document_owner(true);
            }
            if !info.user_can_write {
                s.set_read_only();
            }
            s.set_wopi_info(info.clone());
        }

        // UI-relevant host properties, sent before the kit load so the
        // client can post messages to its parent frame even when the
        // load fails.
        let wopi_msg = serde_json::json!({
            "BaseFileName": info.base_file_name,
            "PostMessageOrigin": info.post_message_origin,
            "TemplateSaveAs": info.template_save_as,
            "TemplateSource": info.template_source,
            "HidePrintOption": info.hide_print_option || info.disable_print,
            "HideSaveOption": info.hide_save_option,
            "HideExportOption": info.hide_export_option || info.disable_export,
            "DisablePrint": info.disable_print,
            "DisableExport": info.disable_export,
            "DisableCopy": info.disable_copy,
            "DisableInactiveMessages": info.disable_inactive_messages,
            "UserCanNotWriteRelative": info.user_can_not_write_relative,
            "EnableInsertRemoteImage": info.enable_insert_remote_image,
            "EnableShare": info.enable_share,
            "HideUserList": info.hide_user_list,
            "SupportsRename": info.supports_rename,
            "UserCanRename": info.user_can_rename,
            "BreadcrumbDocName": info.breadcrumb_doc_name,
            "EnableOwnerTermination": info.enable_owner_termination,
        });
        session.borrow().send_text_frame(&format!("wopi: {wopi_msg}"));

        // Fetch the file into the jail once.
        if !self.storage_loaded {
            let jail = Jail::create(&self.config.child_root).context("creating jail")?;
            let host_path = jail.host_path(&info.base_file_name);
            let template = (!info.template_source.is_empty()).then_some(info.template_source.as_str());
            let storage = self.storage.as_mut().expect("storage exists");
            match storage.download_document(
                &auth,
                &host_path,
                info.size.max(0) as u64,
                template,
            ) {
                Ok(_) => {}
                Err(crate::storage::StorageError::DiskFull) => {
                    session.borrow().send_error("internal", "diskfull");
                    anyhow::bail!("disk full while downloading");
                }
                Err(e) => return Err(e).context("GetFile"),
            }
            self.template_loaded = template.is_some();
            self.filename = info.base_file_name.clone();

            // Pre-filter hook: convert unsupported formats in place.
            self.filename = run_prefilters(&self.config, &jail, &self.filename)?;

            self.jail = Some(jail);
            self.storage_loaded = true;

            let mut cache = TileCache::new(self.uri_public.clone(), false);
            cache.set_thread_owner(std::thread::current().id());
            self.cache = Some(cache);

            // Take the document lock; a failure is logged, not fatal.
            let storage = self.storage.as_ref().expect("storage exists");
            match storage.update_lock_state(
                &auth,
                &mut self.lock_ctx,
                true,
                &UploadAttributes::default(),
                now,
            ) {
                LockResult::Ok | LockResult::Unsupported => {}
                LockResult::Unauthorized => {
                    log::error!("[broker] lock unauthorized for docKey [{}]", self.doc_key);
                }
                LockResult::Failed(reason) => {
                    log::error!("[broker] failed to lock docKey [{}]: {reason}", self.doc_key);
                }
            }
        }

        // Introduce the session to the kit (once per session id) and
        // load the view.
        let jail = self.jail.as_ref().expect("jail exists");
        let kit_uri = jail.kit_uri(&self.filename);
        let jail_root = jail.root().display().to_string();
        let anon_jail = self.ctx.anonymizer.anonymize(&jail_root);
        let intro = format!("session-{session_id}");
        if !self.is_initial_setting_set(&intro) {
            self.set_initial_setting(&intro);
            self.send_to_kit(&format!(
                "session {session_id} {} {}",
                self.doc_key, self.doc_id
            ));
        }

        let mut load_msg = format!("load url={kit_uri} jail={jail_root} xjail={anon_jail}");
        {
            let s = session.borrow();
            if !s.user_name().is_empty() {
                load_msg.push_str(&format!(" author={}", encode_component(s.user_name())));
            }
            if let Some(part) = params.part {
                load_msg.push_str(&format!(" part={part}"));
            }
            if !params.password.is_empty() {
                load_msg.push_str(&format!(" password={}", params.password));
            }
            if !params.lang.is_empty() {
                load_msg.push_str(&format!(" lang={}", params.lang));
            }
            if !s.watermark_text().is_empty() {
                load_msg.push_str(&format!(
                    " watermarkText={} watermarkOpacity={}",
                    encode_component(s.watermark_text()),
                    self.config.watermark.opacity
                ));
            }
            if !params.options.is_empty() {
                load_msg.push_str(&format!(" options={}", params.options));
            }
            if self.template_loaded {
                load_msg.push_str(&format!(
                    " template={}",
                    encode_component(&info.template_source)
                ));
            }
        }
        self.forward_to_kit(&session_id, &load_msg);
        Ok(())
    }

    // ─── Kit output ────────────────────────────────────────────────────

    /// One frame from the kit's stdout.
    pub fn handle_kit_message(&mut self, data: &[u8], now: Instant) {
        let first_line = crate::protocol::first_line(data).to_string();
        let tokens = crate::protocol::tokenize(&first_line);
        let Some(&command) = tokens.first() else {
            return;
        };

        match command {
            "tile:" => self.handle_tile_response(data, now),
            "tilecombine:" => self.handle_tile_combined_response(data, now),
            "errortoall:" => {
                let cmd = crate::protocol::get_token_string(&tokens, "cmd").unwrap_or("internal");
                let kind = crate::protocol::get_token_string(&tokens, "kind").unwrap_or("unknown");
                self.broadcast_message(&format!("error: cmd={cmd} kind={kind}"));
            }
            "procmemstats:" => {
                self.kit_dirty_kb = crate::protocol::get_token_i64(&tokens, "dirty")
                    .and_then(|v| u64::try_from(v).ok());
            }
            "client-all" => {
                let inner_offset = (command.len() + 1).min(data.len());
                let inner = data[inner_offset..].to_vec();
                for session in self.sessions.values().cloned().collect::<Vec<_>>() {
                    self.route_kit_to_session(&session, &inner, now);
                }
            }
            _ if command.starts_with("client-") => {
                let session_id = &command["client-".len()..];
                let inner_offset = (command.len() + 1).min(data.len());
                let inner = data[inner_offset..].to_vec();
                if let Some(session) = self.sessions.get(session_id).cloned() {
                    self.route_kit_to_session(&session, &inner, now);
                } else {
                    log::debug!("[broker] kit message for departed session [{session_id}]");
                }
            }
            _ => {
                log::debug!(
                    "[broker] unhandled kit message: {}",
                    crate::protocol::abbreviate(&first_line, 80)
                );
            }
        }
    }

    /// Kit output addressed to one session: the output filter.
    fn route_kit_to_session(&mut self, session: &SessionRef, data: &[u8], now: Instant) {
        let first_line = crate::protocol::first_line(data).to_string();
        let tokens = crate::protocol::tokenize(&first_line);
        let Some(&command) = tokens.first() else {
            return;
        };
        let session_id = session.borrow().id().to_string();

        match command {
            "status:" => {
                let view_id = crate::protocol::get_token_i64(&tokens, "viewid").unwrap_or(0) as i32;
                let doc_type = crate::protocol::get_token_string(&tokens, "type").unwrap_or("");
                let part = crate::protocol::get_token_i64(&tokens, "current").unwrap_or(0) as i32;
                {
                    let mut s = session.borrow_mut();
                    s.mark_live(view_id, doc_type == "text", part, now);
                    s.set_canonical_view_id(view_id);
                }
                let first_view = !self.is_loaded;
                self.is_loaded = true;
                session.borrow().send_binary_frame(data.to_vec());
                if first_view && self.template_loaded {
                    // A template-instantiated document exists only in the
                    // jail; persist it right away.
                    self.send_uno_save(&session_id, true, false, false, false, "", now);
                }
            }
            "unocommandresult:" => {
                session.borrow().send_binary_frame(data.to_vec());
                self.handle_uno_command_result(&session_id, &first_line, now);
            }
            "statechanged:" => {
                if first_line.contains(".uno:ModifiedStatus=true") {
                    self.set_modified(true);
                } else if first_line.contains(".uno:ModifiedStatus=false") {
                    self.set_modified(false);
                }
                session.borrow().send_binary_frame(data.to_vec());
            }
            "invalidatetiles:" => {
                // Invalidation travels to the client before any tile
                // bytes for the affected area.
                session.borrow().send_binary_frame(data.to_vec());
                self.handle_tile_invalidation(&first_line, session, now);
            }
            "invalidatecursor:" => {
                if let Some(rect) = parse_cursor_rectangle(&first_line) {
                    self.cursor = rect;
                }
                session.borrow().send_binary_frame(data.to_vec());
            }
            "setpart:" => {
                if let Some(part) = crate::protocol::get_token_i64(&tokens, "part") {
                    session.borrow_mut().set_selected_part(part as i32);
                }
                session.borrow().send_binary_frame(data.to_vec());
            }
            "renderfont:" => {
                if let (Some(cache), Some(font)) = (self.cache.as_mut(), tokens.get(1)) {
                    if let Some(payload) = crate::protocol::payload_after_first_line(data) {
                        cache.save_stream(
                            crate::tile::StreamType::Font,
                            *font,
                            Bytes::copy_from_slice(payload),
                        );
                    }
                }
                session.borrow().send_binary_frame(data.to_vec());
            }
            "commandvalues:" => {
                if let Some(cache) = self.cache.as_mut() {
                    if let Some(payload) = crate::protocol::payload_after_first_line(data) {
                        if let Ok(json) =
                            serde_json::from_slice::<serde_json::Value>(payload)
                        {
                            if let Some(name) =
                                json.get("commandName").and_then(|v| v.as_str())
                            {
                                cache.save_stream(
                                    crate::tile::StreamType::CmdValues,
                                    name,
                                    Bytes::copy_from_slice(payload),
                                );
                            }
                        }
                    }
                }
                session.borrow().send_binary_frame(data.to_vec());
            }
            "textselectioncontent:" => {
                let rewritten = self.rewrite_copy_payload(session, data);
                session.borrow().send_binary_frame(rewritten);
            }
            "clipboardcontent:" => {
                let payload = crate::protocol::payload_after_first_line(data)
                    .map(Bytes::copy_from_slice)
                    .unwrap_or_default();
                let in_wait_disconnect = session.borrow().in_wait_disconnect();
                session.borrow_mut().clipboard_arrived(&payload);
                if in_wait_disconnect && !payload.is_empty() {
                    // The session is going away; park the content in the
                    // process-wide store for later HTTP reads.
                    let keys = session.borrow().clipboard_keys();
                    self.ctx.saved_clipboards.insert(&keys, payload);
                }
            }
            "disconnected:" => {
                self.final_remove_session(&session_id);
            }
            "error:" => {
                session.borrow().send_binary_frame(data.to_vec());
                let cmd = crate::protocol::get_token_string(&tokens, "cmd").unwrap_or("");
                let kind = crate::protocol::get_token_string(&tokens, "kind").unwrap_or("");
                if cmd == "load" && kind == "faileddocloading" {
                    self.broadcast_message("error: cmd=load kind=faileddocloading");
                    self.stop("failed doc loading");
                }
            }
            "saveas:" => {
                self.handle_kit_save_as(&session_id, &tokens, now);
            }
            // Unknown kit output is forwarded unchanged.
            _ => session.borrow().send_binary_frame(data.to_vec()),
        }
    }

    /// Inject the clipboard origin meta tag into copied content.
    fn rewrite_copy_payload(&self, session: &SessionRef, data: &[u8]) -> Vec<u8> {
        let s = session.borrow();
        let wopi_src = self.uri_public.split('?').next().unwrap_or("");
        let server_base = format!("http://{}", s.host_no_trust());
        let Some(clipboard_uri) = s.clipboard_uri(
            &server_base,
            wopi_src,
            &self.ctx.host_identifier,
            true,
        ) else {
            return data.to_vec();
        };
        let text = String::from_utf8_lossy(data);
        s.post_process_copy_payload(&text, &clipboard_uri).into_bytes()
    }

    fn handle_uno_command_result(&mut self, session_id: &str, first_line: &str, now: Instant) {
        let json_part = first_line
            .split_once(' ')
            .map(|(_, rest)| rest)
            .unwrap_or("");
        let Ok(result) = serde_json::from_str::<serde_json::Value>(json_part) else {
            log::warn!("[broker] unparsable unocommandresult: {json_part}");
            return;
        };
        let command = result
            .get("commandName")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        if command != ".uno:Save" {
            return;
        }
        let success = result
            .get("success")
            .map(|v| v.as_bool().unwrap_or(v.as_str() == Some("true")))
            .unwrap_or(false);
        let result_value = result
            .get("result")
            .map(|r| {
                r.get("value")
                    .and_then(|v| v.as_str())
                    .unwrap_or_else(|| r.as_str().unwrap_or(""))
                    .to_string()
            })
            .unwrap_or_default();
        self.upload_to_storage(session_id, success, &result_value, false, now);
    }

    /// Kit finished a SaveAs: upload the produced file under a new name.
    fn handle_kit_save_as(&mut self, session_id: &str, tokens: &[&str], now: Instant) {
        let Some(url) = crate::protocol::get_token_string(tokens, "url") else {
            log::warn!("[broker] saveas: without url");
            return;
        };
        let filename = crate::protocol::get_token_string(tokens, "filename")
            .map(|f| percent_decode_str(f).decode_utf8_lossy().to_string())
            .unwrap_or_else(|| self.filename.clone());

        // The kit reports a jailed file:// URI; map it back to the host.
        let jailed_name = url.rsplit('/').next().unwrap_or(&filename);
        let jailed_name = percent_decode_str(jailed_name).decode_utf8_lossy().to_string();
        let Some(jail) = self.jail.as_ref() else {
            return;
        };
        let host_path = jail.host_path(&jailed_name);
        self.start_upload(
            session_id,
            host_path,
            Some(SaveTarget {
                filename,
                is_rename: false,
            }),
            false,
            now,
        );
    }

    fn handle_kit_exited(&mut self) {
        log::warn!("[broker] kit exited for docKey [{}]", self.doc_key);
        if self.is_possibly_modified() {
            self.data_loss = true;
            log::error!(
                "[broker] kit died with unsaved changes on docKey [{}]",
                self.doc_key
            );
        }
        self.broadcast_message("error: cmd=load kind=faileddocloading");
        self.stop("kit exited");
    }

    // ─── Save / upload orchestration ───────────────────────────────────

    /// Issue `.uno:Save` through a writable session when the document
    /// needs it. Returns true when a save request went out.
    pub fn auto_save(&mut self, force: bool, dont_save_if_unmodified: bool, now: Instant) -> bool {
        if self.sessions.is_empty() || self.storage.is_none() || !self.is_loaded {
            return false;
        }
        if !force && !self.is_modified {
            return false;
        }
        let Some(session_id) = self.writable_session_id() else {
            log::warn!("[broker] no writable session to save docKey [{}]", self.doc_key);
            return false;
        };

        if force {
            // As good as a user-issued save: flag isAutosave=false so the
            // host treats it as a real checkpoint.
            self.send_uno_save(&session_id, true, dont_save_if_unmodified, false, true, "", now)
        } else {
            let idle_for = now.duration_since(self.last_activity_time);
            let since_last_save = now.duration_since(self.last_save_time);
            let idle_save = Duration::from_secs(self.config.per_document.idlesave_duration_secs);
            let auto_save = Duration::from_secs(self.config.per_document.autosave_duration_secs);
            let due = (idle_save > Duration::ZERO && idle_for >= idle_save)
                || (auto_save > Duration::ZERO && since_last_save >= auto_save);
            if !due {
                return false;
            }
            self.send_uno_save(&session_id, true, true, true, false, "", now)
        }
    }

    /// Send `.uno:Save` to the kit via `session_id`. At most one save is
    /// in flight per document.
    #[allow(clippy::too_many_arguments)]
    pub fn send_uno_save(
        &mut self,
        session_id: &str,
        dont_terminate_edit: bool,
        dont_save_if_unmodified: bool,
        is_autosave: bool,
        is_exit_save: bool,
        extended_data: &str,
        now: Instant,
    ) -> bool {
        if !self.sessions.contains_key(session_id) {
            log::error!("[broker] cannot save docKey [{}]: no such session", self.doc_key);
            return false;
        }
        if self.is_saving()
            && self
                .last_save_request_time
                .is_some_and(|t| now.duration_since(t) <= COMMAND_TIMEOUT)
        {
            log::debug!("[broker] save already in flight for docKey [{}]", self.doc_key);
            return false;
        }
        let min_gap = Duration::from_millis(self.config.per_document.min_time_between_saves_ms);
        if let Some(last) = self.last_save_request_time {
            if now.duration_since(last) < min_gap {
                log::trace!("[broker] save rate-limited for docKey [{}]", self.doc_key);
                return false;
            }
        }

        let mut args = serde_json::Map::new();
        if dont_terminate_edit {
            args.insert(
                "DontTerminateEdit".to_string(),
                serde_json::json!({ "type": "boolean", "value": true }),
            );
        }
        if dont_save_if_unmodified {
            args.insert(
                "DontSaveIfUnmodified".to_string(),
                serde_json::json!({ "type": "boolean", "value": true }),
            );
        }
        let command = format!("uno .uno:Save {}", serde_json::Value::Object(args));

        self.next_upload_attribs = UploadAttributes {
            user_modified: self.is_modified,
            autosave: is_autosave,
            exit_save: is_exit_save,
            forced: false,
            extended_data: extended_data.to_string(),
        };
        self.forward_to_kit(session_id, &command);
        self.last_save_request_time = Some(now);
        log::info!("[broker] save requested for docKey [{}] via [{session_id}]", self.doc_key);
        true
    }

    /// The kit acknowledged (or refused) the save; upload accordingly.
    pub fn upload_to_storage(
        &mut self,
        session_id: &str,
        success: bool,
        result: &str,
        force: bool,
        now: Instant,
    ) {
        self.last_save_response_time = Some(now);

        let is_rename = self.pending_rename.is_some();

        // Core skipped the write because nothing changed; that is a
        // successful save.
        if !success && result == "unmodified" && !is_rename && !force {
            log::debug!("[broker] save skipped, docKey [{}] unmodified", self.doc_key);
            self.last_save_time = now;
            self.wakeup();
            return;
        }

        let Some(session) = self.sessions.get(session_id).cloned() else {
            log::error!(
                "[broker] session [{session_id}] gone, not uploading docKey [{}]",
                self.doc_key
            );
            return;
        };

        if !success && !force {
            session.borrow().send_error("storage", "savefailed");
            return;
        }

        let mut force = force;
        if !force && self.mark_to_destroy && self.config.per_document.always_save_on_exit {
            log::debug!("[broker] always_save_on_exit: forcing upload");
            force = true;
        }

        let save_target = self.pending_rename.take().map(|filename| SaveTarget {
            filename,
            is_rename: true,
        });
        let Some(jail) = self.jail.as_ref() else {
            log::error!("[broker] no jail to upload from for docKey [{}]", self.doc_key);
            return;
        };
        let path = jail.host_path(&self.filename);
        self.start_upload(session_id, path, save_target, force, now);
    }

    /// Kick off the async PutFile. The outcome comes back as an
    /// [`BrokerEvent::UploadComplete`] on the poll.
    fn start_upload(
        &mut self,
        session_id: &str,
        path: std::path::PathBuf,
        save_target: Option<SaveTarget>,
        force: bool,
        now: Instant,
    ) {
        if self.upload_in_flight {
            log::warn!("[broker] upload already in flight for docKey [{}]", self.doc_key);
            return;
        }
        let auth = match self.sessions.get(session_id) {
            Some(session) => Authorization::from_uri(session.borrow().public_uri()),
            None => return,
        };
        let min_gap = Duration::from_millis(self.config.per_document.min_time_between_uploads_ms);
        if let Some(last) = self.last_upload_request_time {
            if now.duration_since(last) < min_gap && !force {
                log::trace!("[broker] upload rate-limited for docKey [{}]", self.doc_key);
                return;
            }
        }
        let Some(storage) = self.storage.as_ref() else {
            return;
        };
        let mut attribs = self.next_upload_attribs.clone();
        attribs.forced = force;
        let is_save_as = save_target.as_ref().is_some_and(|t| !t.is_rename);
        let is_rename = save_target.as_ref().is_some_and(|t| t.is_rename);
        let request = storage.make_upload_request(&auth, &self.lock_ctx, attribs, path, save_target);

        self.upload_in_flight = true;
        self.last_upload_request_time = Some(now);

        let poll_tx = self.poll_tx.clone();
        let session_id = session_id.to_string();
        WopiStorage::upload_async(request, move |outcome| {
            let _ = poll_tx.send(BrokerEvent::UploadComplete {
                session_id,
                outcome,
                is_save_as,
                is_rename,
            });
        });
    }

    /// Async PutFile finished; apply the outcome.
    pub fn handle_upload_complete(
        &mut self,
        session_id: &str,
        outcome: UploadOutcome,
        is_save_as: bool,
        is_rename: bool,
        now: Instant,
    ) {
        self.upload_in_flight = false;
        let session = self.sessions.get(session_id).cloned();

        match outcome {
            UploadOutcome::Ok {
                new_modified_time,
                save_as,
            } => {
                self.consecutive_upload_failures = 0;
                if is_rename || is_save_as {
                    if let (Some(result), Some(session)) = (save_as, session.as_ref()) {
                        let encoded_name = encode_component(&result.name);
                        let frame = if is_rename {
                            format!("renamefile: filename={encoded_name} url={}", result.url)
                        } else {
                            let anon = self.ctx.anonymizer.anonymize(&result.name);
                            format!(
                                "saveas: url={} filename={encoded_name} xfilename={anon}",
                                result.url
                            )
                        };
                        session.borrow().send_text_frame(&frame);
                    }
                } else {
                    // Stored and acknowledged; advance the conflict anchor.
                    let parsed = new_modified_time
                        .as_deref()
                        .and_then(crate::storage::parse_wopi_timestamp);
                    if parsed.is_some() {
                        self.document_last_modified_time = parsed;
                    }
                    if let Some(storage) = self.storage.as_mut() {
                        storage.set_last_modified_time(new_modified_time);
                    }
                    self.set_modified(false);
                    self.document_changed_in_storage = false;
                    self.last_save_time = now;
                    log::info!("[broker] upload ok for docKey [{}]", self.doc_key);
                }
                if self.pending_version_restore {
                    self.pending_version_restore = false;
                    self.broadcast_message("close: versionrestore: prerestore_ack");
                }
                self.wakeup();
            }
            UploadOutcome::TooLarge => {
                self.quarantine_current();
                self.broadcast_message("error: cmd=storage kind=savediskfull");
            }
            UploadOutcome::Unauthorized => {
                if let Some(session) = session.as_ref() {
                    session.borrow().send_error("storage", "saveunauthorized");
                }
            }
            UploadOutcome::Conflict | UploadOutcome::DocChanged => {
                log::error!("[broker] document changed in storage during upload");
                self.document_changed_in_storage = true;
                self.quarantine_current();
                let message = if self.is_modified {
                    "error: cmd=storage kind=documentconflict"
                } else {
                    "close: documentconflict"
                };
                self.broadcast_message(message);
            }
            UploadOutcome::Failed(reason) => {
                log::error!(
                    "[broker] upload failed for docKey [{}]: {reason}",
                    self.doc_key
                );
                self.consecutive_upload_failures += 1;
                if let Some(storage) = self.storage.as_mut() {
                    // Can no longer trust the stored timestamp.
                    storage.mark_modified_time_unsafe();
                }
                if self.consecutive_upload_failures
                    >= self.config.per_document.limit_store_failures
                {
                    self.quarantine_current();
                    self.data_loss = self.is_possibly_modified();
                }
                if let Some(session) = session.as_ref() {
                    let kind = if is_rename { "renamefailed" } else { "savefailed" };
                    session.borrow().send_error("storage", kind);
                }
            }
        }

        // A close was waiting on this upload.
        if (self.close_request || self.mark_to_destroy) && !self.is_saving() {
            let reason = if self.close_reason.is_empty() {
                "saved".to_string()
            } else {
                self.close_reason.clone()
            };
            self.stop(&reason);
        }
    }

    fn quarantine_current(&self) {
        if let Some(jail) = self.jail.as_ref() {
            let path = jail.host_path(&self.filename);
            self.quarantine.quarantine_file(&self.doc_key, &path);
        }
    }

    /// Refresh the WOPI lock using any writable session's authorization.
    fn refresh_lock(&mut self, now: Instant) {
        let Some(session_id) = self.writable_session_id() else {
            log::error!("[broker] no session to refresh lock with");
            return;
        };
        let Some(session) = self.sessions.get(&session_id) else {
            return;
        };
        let auth = Authorization::from_uri(session.borrow().public_uri());
        let Some(storage) = self.storage.as_ref() else {
            return;
        };
        match storage.update_lock_state(&auth, &mut self.lock_ctx, true, &UploadAttributes::default(), now)
        {
            LockResult::Ok | LockResult::Unsupported => {}
            other => log::error!("[broker] lock refresh failed: {other:?}"),
        }
    }

    /// Release the lock on the way down.
    fn release_lock(&mut self, now: Instant) {
        if !self.lock_ctx.is_locked() {
            return;
        }
        let Some(session_id) = self.writable_session_id() else {
            return;
        };
        let Some(session) = self.sessions.get(&session_id) else {
            return;
        };
        let auth = Authorization::from_uri(session.borrow().public_uri());
        if let Some(storage) = self.storage.as_ref() {
            match storage.update_lock_state(
                &auth,
                &mut self.lock_ctx,
                false,
                &UploadAttributes::default(),
                now,
            ) {
                LockResult::Ok | LockResult::Unsupported => {}
                other => log::error!("[broker] unlock failed: {other:?}"),
            }
        }
    }

    // ─── Clipboard HTTP ────────────────────────────────────────────────

    /// A parked clipboard HTTP request: route to the session whose keys
    /// match, else serve from the process-wide store.
    pub fn handle_clipboard_request(
        &mut self,
        view_id: &str,
        tag: &str,
        socket: mpsc::Sender<Vec<u8>>,
    ) {
        let target = self
            .sessions
            .values()
            .find(|s| s.borrow().matches_clipboard_keys(view_id, tag))
            .cloned();
        if let Some(session) = target {
            let live = session.borrow().state() == SessionState::Live;
            let id = session.borrow().id().to_string();
            session.borrow_mut().park_clipboard_socket(socket);
            if live {
                self.forward_to_kit(&id, "getclipboard");
            }
            // WaitDisconnect sessions already have a getclipboard in
            // flight from the disconnect handshake.
            return;
        }

        // No live session: the content may have been rescued already.
        if let Some(saved) = self.ctx.saved_clipboards.get(tag) {
            let _ = socket.send(crate::session::build_clipboard_response(&saved));
        } else {
            log::error!("[broker] no clipboard for tag {tag}");
            let _ = socket.send(crate::session::build_clipboard_not_found());
        }
    }

    // ─── Periodic work ─────────────────────────────────────────────────

    /// One scheduler tick. Returns false when the broker should stop.
    pub fn tick(&mut self, now: Instant) -> bool {
        if self.stop_flag {
            return false;
        }

        // Tile cache high-water mark scales with the audience.
        if let Some(cache) = self.cache.as_mut() {
            cache.set_max_cache_size(8 * 1024 * 128 * self.sessions.len().max(1));
        }

        // Load deadline.
        let limit_load = Duration::from_secs(self.config.per_document.limit_load_secs);
        if !self.is_loaded
            && !self.sessions.is_empty()
            && limit_load > Duration::ZERO
            && now.duration_since(self.thread_start) > limit_load
        {
            log::error!("[broker] docKey [{}] took too long to load", self.doc_key);
            self.broadcast_message("error: cmd=load kind=docloadtimeout");
            if let Some(kit) = self.kit.as_mut() {
                kit.terminate();
            }
            self.stop("load timed out");
            return false;
        }

        // Convert-to life limit.
        if let Some(limit) = self.limit_life {
            if now.duration_since(self.thread_start) > limit {
                log::warn!("[broker] docKey [{}] convert lifetime exceeded", self.doc_key);
                self.broadcast_message("error: cmd=load kind=docexpired");
                if let Some(kit) = self.kit.as_mut() {
                    kit.terminate();
                }
                self.stop("convert expired");
                return false;
            }
        }

        // Lock refresh.
        if self.storage.is_some() && self.lock_ctx.needs_refresh(now) {
            self.refresh_lock(now);
        }

        // While a save is pending and fresh, just wait.
        if self.is_saving() {
            if self
                .last_save_request_time
                .is_some_and(|t| now.duration_since(t) <= COMMAND_TIMEOUT)
            {
                return true;
            }
            log::error!(
                "[broker] save for docKey [{}] is stuck, no kit response in {}s",
                self.doc_key,
                COMMAND_TIMEOUT.as_secs()
            );
            self.last_save_response_time = Some(now);
            if self.is_possibly_modified() {
                self.data_loss = true;
            }
        }

        // Upload retry with backoff; the final attempt skips the guard.
        if self.consecutive_upload_failures > 0
            && self.consecutive_upload_failures < self.config.per_document.limit_store_failures
            && !self.upload_in_flight
            && self.is_possibly_modified()
        {
            let min_gap =
                Duration::from_millis(self.config.per_document.min_time_between_uploads_ms.max(500));
            if self
                .last_upload_request_time
                .is_none_or(|t| now.duration_since(t) >= min_gap)
            {
                let force = self.consecutive_upload_failures + 1
                    >= self.config.per_document.limit_store_failures;
                if let Some(session_id) = self.writable_session_id() {
                    log::info!(
                        "[broker] retrying upload for docKey [{}] (attempt {}, force={force})",
                        self.doc_key,
                        self.consecutive_upload_failures + 1
                    );
                    self.upload_to_storage(&session_id, true, "", force, now);
                }
            }
        }

        // Close request: flush and stop.
        if self.close_request {
            if self.upload_in_flight {
                return true;
            }
            if !self.auto_save(self.is_possibly_modified(), false, now) {
                let reason = self.close_reason.clone();
                self.stop(&reason);
                return false;
            }
            return true;
        }

        // Periodic autosave.
        if now.duration_since(self.last_autosave_check_time) >= AUTOSAVE_CHECK_INTERVAL {
            self.last_autosave_check_time = now;
            self.auto_save(false, true, now);
        }

        // Hard-remove sessions whose disconnect handshake never came.
        let stale: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.borrow().stale_wait_disconnect(now))
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            log::warn!("[broker] session [{id}] failed its disconnect handshake, removing");
            self.final_remove_session(&id);
        }

        // Clipboard key rotation.
        if now.duration_since(self.last_clipboard_rotation_time) >= CLIPBOARD_ROTATION_INTERVAL {
            self.last_clipboard_rotation_time = now;
            for session in self.sessions.values() {
                session.borrow_mut().rotate_clipboard_key(true, now);
            }
        }

        // Idle unload.
        let idle_timeout = Duration::from_secs(self.config.per_document.idle_timeout_secs);
        if self.is_loaded
            && idle_timeout > Duration::ZERO
            && now.duration_since(self.last_activity_time) >= idle_timeout
        {
            log::info!("[broker] docKey [{}] idle, unloading", self.doc_key);
            if !self.auto_save(self.is_possibly_modified(), false, now) {
                self.stop("idle");
                return false;
            }
            self.close_request = true;
            self.close_reason = "idle".to_string();
            return true;
        }

        // Nothing left to serve.
        if self.sessions.is_empty() && (self.is_loaded || self.mark_to_destroy) {
            if !self.upload_in_flight {
                self.stop("dead");
                return false;
            }
        }

        true
    }

    /// Ask the document to save and shut down.
    pub fn close_document(&mut self, reason: &str) {
        log::info!("[broker] closing docKey [{}]: {reason}", self.doc_key);
        self.close_request = true;
        self.close_reason = reason.to_string();
        self.wakeup();
    }

    fn stop(&mut self, reason: &str) {
        if !self.stop_flag {
            log::info!("[broker] stopping docKey [{}]: {reason}", self.doc_key);
            self.stop_flag = true;
            if self.close_reason.is_empty() {
                self.close_reason = reason.to_string();
            }
        }
    }

    /// Final teardown after the poll loop exits.
    pub fn shutdown(&mut self, now: Instant) {
        if self.is_possibly_modified() && !self.upload_in_flight {
            self.data_loss = true;
            log::error!(
                "[broker] docKey [{}] stopping while modified; content not uploaded",
                self.doc_key
            );
        }
        self.release_lock(now);
        if let Some(kit) = self.kit.as_mut() {
            kit.terminate();
        }
        self.kit = None;
        if let Some(cache) = self.cache.as_mut() {
            cache.clear();
        }
        if let Some(jail) = self.jail.take() {
            jail.cleanup();
        }
        // Rescue remaining clipboards before the sessions go away.
        for session in self.sessions.values() {
            let mut s = session.borrow_mut();
            if let Some(payload) = s.take_last_clipboard() {
                self.ctx.saved_clipboards.insert(&s.clipboard_keys(), payload);
            }
        }
        self.sessions.clear();
        log::info!("[broker] docKey [{}] destroyed", self.doc_key);
    }

    // ─── Messaging plumbing ────────────────────────────────────────────

    /// Send a raw control message to the kit.
    fn send_to_kit(&self, message: &str) {
        if let Some(kit) = self.kit.as_ref() {
            kit.send_text(message);
        } else {
            log::warn!("[broker] no kit to send [{}]", crate::protocol::abbreviate(message, 60));
        }
    }

    /// Frame a client-originated message for one kit view.
    pub fn forward_to_kit(&self, session_id: &str, message: &str) {
        self.send_to_kit(&format!("child-{session_id} {message}"));
    }

    /// Send a text frame to every session.
    pub fn broadcast_message(&self, message: &str) {
        for session in self.sessions.values() {
            session.borrow().send_text_frame(message);
        }
    }

    fn wakeup(&self) {
        let _ = self.poll_tx.send(BrokerEvent::Wakeup);
    }

    pub(crate) fn has_pending_upload(&self) -> bool {
        self.upload_in_flight
    }

    /// Settings already pushed to the kit, sent only once per document.
    pub fn is_initial_setting_set(&self, name: &str) -> bool {
        self.initial_settings.contains(name)
    }

    pub fn set_initial_setting(&mut self, name: &str) {
        self.initial_settings.insert(name.to_string());
    }

    pub(crate) fn next_tile_version(&mut self) -> i32 {
        self.tile_version += 1;
        self.tile_version
    }
}

/// Run the configured pre-filter (if any matches the extension) and
/// return the resulting filename inside the jail.
fn run_prefilters(config: &Config, jail: &Jail, filename: &str) -> Result<String> {
    let Some(extension) = filename.rsplit('.').next() else {
        return Ok(filename.to_string());
    };
    for plugin in &config.prefilters {
        if !plugin.extension.eq_ignore_ascii_case(extension) {
            continue;
        }
        let input = jail.host_path(filename);
        let output_name = format!("{filename}.{}", plugin.new_extension);
        let output = jail.host_path(&output_name);

        let command_line = plugin
            .command_line
            .replace("@INPUT@", &input.display().to_string())
            .replace("@OUTPUT@", &output.display().to_string());
        let mut parts = command_line.split_whitespace();
        let Some(program) = parts.next() else {
            continue;
        };
        let status = std::process::Command::new(program)
            .args(parts)
            .status()
            .with_context(|| format!("running prefilter for .{extension}"))?;
        if !status.success() {
            anyhow::bail!(
                "prefilter for .{extension} failed with {status}"
            );
        }
        log::info!("[broker] prefilter converted {filename} -> {output_name}");
        return Ok(output_name);
    }
    Ok(filename.to_string())
}

/// Parse `invalidatecursor: {"rectangle":"x, y, w, h", ...}`.
fn parse_cursor_rectangle(first_line: &str) -> Option<Rect> {
    let json_part = first_line.split_once(' ')?.1;
    let value: serde_json::Value = serde_json::from_str(json_part).ok()?;
    let rect_str = value.get("rectangle")?.as_str()?;
    let parts: Vec<i32> = rect_str
        .split(',')
        .map(str::trim)
        .filter_map(|p| p.parse().ok())
        .collect();
    if parts.len() != 4 {
        return None;
    }
    Some(Rect::new(parts[0], parts[1], parts[2], parts[3]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doc_key_ignores_host_and_query() {
        let a = doc_key_from_uri("https://alias-one/wopi/files/42?access_token=abc");
        let b = doc_key_from_uri("http://alias-two:9980/wopi/files/42");
        assert_eq!(a, b);
        assert_eq!(a, "/wopi/files/42");
    }

    #[test]
    fn test_doc_key_encodes_path() {
        let key = doc_key_from_uri("https://h/wopi/files/report%20final.odt");
        assert_eq!(key, "/wopi/files/report%20final.odt");
    }

    #[test]
    fn test_doc_keys_differ_per_document() {
        assert_ne!(
            doc_key_from_uri("https://h/wopi/files/1"),
            doc_key_from_uri("https://h/wopi/files/2")
        );
    }

    #[test]
    fn test_parse_cursor_rectangle() {
        let rect = parse_cursor_rectangle(
            "invalidatecursor: {\"viewId\":\"0\",\"rectangle\":\"3999, 1418, 0, 298\"}",
        )
        .unwrap();
        assert_eq!(rect, Rect::new(3999, 1418, 0, 298));
        assert!(parse_cursor_rectangle("invalidatecursor: nonsense").is_none());
    }
}
