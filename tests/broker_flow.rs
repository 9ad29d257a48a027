//! End-to-end broker scenarios: a loopback kit stands in for the
//! renderer and wiremock for the storage host, while the test drives the
//! broker synchronously the way its poll thread would.

use docbroker::broker::{BrokerEvent, DocumentBroker};
use docbroker::storage::UploadOutcome;
use docbroker::{Config, KitProcess, ProcessContext, TileCombined};
use serde_json::json;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("tokio runtime")
}

// Field order matters: the mock server must drop before the runtime
// hosting it.
struct Fixture {
    server: MockServer,
    rt: tokio::runtime::Runtime,
    broker: DocumentBroker,
    poll_rx: mpsc::Receiver<BrokerEvent>,
    kit_rx: mpsc::Receiver<Vec<u8>>,
    client_rx: mpsc::Receiver<Vec<u8>>,
    uri: String,
    t0: Instant,
    _jail_dir: tempfile::TempDir,
}

fn default_file_info() -> serde_json::Value {
    json!({
        "BaseFileName": "report.odt",
        "Size": 9,
        "OwnerId": "owner-1",
        "UserId": "user-1",
        "UserFriendlyName": "Alice",
        "UserCanWrite": true,
        "LastModifiedTime": "2024-05-01T08:00:00.000000Z",
    })
}

/// Build a broker with one admitted session; the caller mounts PUT/POST
/// mocks before calling `load`.
fn fixture(file_info: serde_json::Value, tweak: impl FnOnce(&mut Config)) -> Fixture {
    fixture_with(move |_| file_info, tweak)
}

/// Like [`fixture`], but the CheckFileInfo body may reference the mock
/// server's own URI (template sources, FileUrl).
fn fixture_with(
    info_for: impl FnOnce(&str) -> serde_json::Value,
    tweak: impl FnOnce(&mut Config),
) -> Fixture {
    let rt = runtime();
    let server = rt.block_on(MockServer::start());
    let file_info = info_for(&server.uri());
    rt.block_on(
        Mock::given(method("GET"))
            .and(path("/wopi/files/1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(file_info))
            .mount(&server),
    );
    rt.block_on(
        Mock::given(method("GET"))
            .and(path("/wopi/files/1/contents"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"doc-bytes".to_vec()))
            .mount(&server),
    );

    let jail_dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.child_root = jail_dir.path().to_path_buf();
    config.per_document.min_time_between_saves_ms = 0;
    config.per_document.min_time_between_uploads_ms = 0;
    tweak(&mut config);

    let uri = format!("{}/wopi/files/1?access_token=tok", server.uri());
    let ctx = Arc::new(ProcessContext::new("test", "broker-flow"));
    let (poll_tx, poll_rx) = mpsc::channel();
    let t0 = Instant::now();
    let mut broker = DocumentBroker::new(uri.clone(), Arc::new(config), ctx, poll_tx, t0);

    let (kit, kit_rx) = KitProcess::loopback();
    broker.set_kit(kit);

    let (client_tx, client_rx) = mpsc::channel();
    broker
        .add_session("s1", &uri, false, client_tx, t0)
        .expect("session admitted");

    Fixture {
        rt,
        server,
        broker,
        poll_rx,
        kit_rx,
        client_rx,
        uri,
        t0,
        _jail_dir: jail_dir,
    }
}

impl Fixture {
    fn load(&mut self) {
        let load = format!("load url={}", self.uri);
        self.broker
            .handle_client_message("s1", load.as_bytes(), self.t0);
        assert!(self.broker.session("s1").is_some());
    }

    fn kit_status(&mut self, now: Instant) {
        self.broker.handle_kit_message(
            b"client-s1 status: type=text parts=1 current=0 width=12240 height=15840 viewid=0",
            now,
        );
        assert!(self.broker.is_loaded());
    }

    fn mark_modified(&mut self, now: Instant) {
        self.broker
            .handle_kit_message(b"client-s1 statechanged: .uno:ModifiedStatus=true", now);
        assert!(self.broker.is_modified());
    }

    fn ack_save(&mut self, success: bool, result: &str, now: Instant) {
        let frame = if result.is_empty() {
            format!(
                "client-s1 unocommandresult: {{\"commandName\":\".uno:Save\",\"success\":{success}}}"
            )
        } else {
            format!(
                "client-s1 unocommandresult: {{\"commandName\":\".uno:Save\",\"success\":{success},\"result\":{{\"type\":\"string\",\"value\":\"{result}\"}}}}"
            )
        };
        self.broker.handle_kit_message(frame.as_bytes(), now);
    }

    /// Wait for the async upload outcome and apply it on the broker.
    fn pump_upload(&mut self, now: Instant) -> UploadOutcome {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            match self.poll_rx.recv_timeout(Duration::from_millis(100)) {
                Ok(BrokerEvent::UploadComplete {
                    session_id,
                    outcome,
                    is_save_as,
                    is_rename,
                }) => {
                    let copy = outcome.clone();
                    self.broker.handle_event(
                        BrokerEvent::UploadComplete {
                            session_id,
                            outcome,
                            is_save_as,
                            is_rename,
                        },
                        now,
                    );
                    return copy;
                }
                Ok(_) => {}
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(e) => panic!("poll channel closed: {e}"),
            }
        }
        panic!("no UploadComplete arrived");
    }

    fn drain_kit(&self) -> Vec<String> {
        self.kit_rx
            .try_iter()
            .map(|f| String::from_utf8_lossy(&f).to_string())
            .collect()
    }

    fn drain_client(&self) -> Vec<String> {
        self.client_rx
            .try_iter()
            .map(|f| String::from_utf8_lossy(&f).to_string())
            .collect()
    }

    fn storage_requests(&self) -> Vec<wiremock::Request> {
        self.rt.block_on(self.server.received_requests()).unwrap()
    }

    fn posts_with_override(&self, expected: &str) -> Vec<wiremock::Request> {
        self.storage_requests()
            .into_iter()
            .filter(|r| {
                r.method.to_string() == "POST"
                    && r.headers
                        .get("x-wopi-override")
                        .and_then(|v| v.to_str().ok())
                        == Some(expected)
            })
            .collect()
    }
}

// ─── Scenario: lock lifecycle ──────────────────────────────────────────

#[test]
fn test_lock_lifecycle_lock_put_unlock_share_token() {
    let mut info = default_file_info();
    info["SupportsLocks"] = json!(true);
    let mut fx = fixture(info, |_| {});
    fx.rt.block_on(
        Mock::given(method("POST"))
            .and(path("/wopi/files/1"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&fx.server),
    );
    fx.rt.block_on(
        Mock::given(method("POST"))
            .and(path("/wopi/files/1/contents"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "LastModifiedTime": "2024-05-01T09:00:00.000000Z"
            })))
            .mount(&fx.server),
    );

    fx.load();
    let token = fx.broker.lock_context().token().to_string();
    assert!(!token.is_empty(), "lock token generated on first lock");
    assert!(fx.broker.lock_context().is_locked());

    let t1 = fx.t0 + Duration::from_secs(1);
    fx.kit_status(t1);
    fx.mark_modified(t1);

    // Disconnect: the last writable session saves on the way out.
    let t2 = fx.t0 + Duration::from_secs(2);
    fx.broker.remove_session("s1", t2);
    let kit_msgs = fx.drain_kit();
    assert!(
        kit_msgs.iter().any(|m| m.contains("uno .uno:Save")),
        "exit save issued: {kit_msgs:?}"
    );
    assert!(kit_msgs.iter().any(|m| m == "child-s1 getclipboard"));
    assert!(kit_msgs.iter().any(|m| m == "child-s1 disconnect"));

    let t3 = fx.t0 + Duration::from_secs(3);
    fx.ack_save(true, "", t3);
    let outcome = fx.pump_upload(t3);
    assert!(outcome.is_ok(), "upload after exit save: {outcome:?}");

    fx.broker.shutdown(fx.t0 + Duration::from_secs(4));

    let locks = fx.posts_with_override("LOCK");
    let puts = fx.posts_with_override("PUT");
    let unlocks = fx.posts_with_override("UNLOCK");
    assert_eq!(locks.len(), 1);
    assert_eq!(puts.len(), 1);
    assert_eq!(unlocks.len(), 1);
    for request in locks.iter().chain(puts.iter()).chain(unlocks.iter()) {
        assert_eq!(
            request.headers.get("x-wopi-lock").and_then(|v| v.to_str().ok()),
            Some(token.as_str()),
            "every storage write carries the same lock token"
        );
    }
    assert!(puts[0]
        .headers
        .get("x-cool-wopi-isexitsave")
        .and_then(|v| v.to_str().ok())
        == Some("true"));
}

// ─── Scenario: conflict on save ────────────────────────────────────────

#[test]
fn test_conflict_on_save_emits_documentconflict() {
    let mut fx = fixture(default_file_info(), |_| {});
    fx.rt.block_on(
        Mock::given(method("POST"))
            .and(path("/wopi/files/1/contents"))
            .respond_with(
                ResponseTemplate::new(409).set_body_json(json!({ "COOLStatusCode": 1010 })),
            )
            .mount(&fx.server),
    );

    fx.load();
    let t1 = fx.t0 + Duration::from_secs(1);
    fx.kit_status(t1);
    fx.mark_modified(t1);
    fx.drain_client();

    let t2 = fx.t0 + Duration::from_secs(2);
    fx.broker.handle_client_message("s1", b"save", t2);
    fx.ack_save(true, "", t2);
    let outcome = fx.pump_upload(t2);
    assert!(matches!(outcome, UploadOutcome::DocChanged));

    let frames = fx.drain_client();
    assert!(
        frames
            .iter()
            .any(|f| f == "error: cmd=storage kind=documentconflict"),
        "conflict surfaced to the session: {frames:?}"
    );

    // Closing does not try another PutFile.
    let t3 = fx.t0 + Duration::from_secs(3);
    fx.broker.handle_client_message("s1", b"closedocument", t3);
    assert_eq!(fx.posts_with_override("PUT").len(), 1);
}

// ─── Scenario: transient upload failure, then success ──────────────────

#[test]
fn test_transient_upload_failure_then_success() {
    let mut fx = fixture(default_file_info(), |config| {
        config.per_document.limit_store_failures = 2;
    });
    fx.rt.block_on(
        Mock::given(method("POST"))
            .and(path("/wopi/files/1/contents"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&fx.server),
    );
    fx.rt.block_on(
        Mock::given(method("POST"))
            .and(path("/wopi/files/1/contents"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "LastModifiedTime": "2024-05-01T10:00:00.000000Z"
            })))
            .mount(&fx.server),
    );

    fx.load();
    let t1 = fx.t0 + Duration::from_secs(1);
    fx.kit_status(t1);
    fx.mark_modified(t1);
    fx.drain_client();

    let t2 = fx.t0 + Duration::from_secs(2);
    fx.broker.handle_client_message("s1", b"save", t2);
    fx.ack_save(true, "", t2);
    let outcome = fx.pump_upload(t2);
    assert!(matches!(outcome, UploadOutcome::Failed(_)));
    let frames = fx.drain_client();
    assert!(
        frames.iter().any(|f| f == "error: cmd=storage kind=savefailed"),
        "failure surfaced: {frames:?}"
    );

    // The user saves again; this one lands.
    let t3 = fx.t0 + Duration::from_secs(40);
    fx.broker.handle_client_message("s1", b"save", t3);
    fx.ack_save(true, "", t3);
    let outcome = fx.pump_upload(t3);
    assert!(outcome.is_ok(), "second attempt: {outcome:?}");
    assert!(!fx.broker.is_modified());
    assert_eq!(fx.posts_with_override("PUT").len(), 2);
}

// ─── Scenario: save skipped when unmodified ────────────────────────────

#[test]
fn test_unmodified_save_skips_upload() {
    let mut fx = fixture(default_file_info(), |_| {});
    fx.load();
    let t1 = fx.t0 + Duration::from_secs(1);
    fx.kit_status(t1);

    fx.broker.handle_client_message("s1", b"save dontSaveIfUnmodified=1", t1);
    fx.ack_save(false, "unmodified", fx.t0 + Duration::from_secs(2));

    // No PutFile must have gone out.
    let puts = fx.posts_with_override("PUT");
    assert!(puts.is_empty(), "unexpected upload: {puts:?}");
}

// ─── Scenario: only one save in flight ─────────────────────────────────

#[test]
fn test_single_save_in_flight() {
    let mut fx = fixture(default_file_info(), |_| {});
    fx.load();
    let t1 = fx.t0 + Duration::from_secs(1);
    fx.kit_status(t1);
    fx.mark_modified(t1);
    fx.drain_kit();

    fx.broker.handle_client_message("s1", b"save", t1);
    fx.broker
        .handle_client_message("s1", b"save", t1 + Duration::from_secs(1));
    let saves: Vec<String> = fx
        .drain_kit()
        .into_iter()
        .filter(|m| m.contains("uno .uno:Save"))
        .collect();
    assert_eq!(saves.len(), 1, "second save suppressed while first pending");
}

// ─── Scenario: tile flow control ───────────────────────────────────────

#[test]
fn test_tile_flow_control_window() {
    let mut fx = fixture(default_file_info(), |_| {});
    fx.load();
    let t1 = fx.t0 + Duration::from_secs(1);
    fx.kit_status(t1);

    fx.broker.handle_client_message(
        "s1",
        b"clientvisiblearea x=0 y=0 width=15360 height=15360",
        t1,
    );
    fx.broker.handle_client_message(
        "s1",
        b"clientzoom tilepixelwidth=256 tilepixelheight=256 tiletwipwidth=3840 tiletwipheight=3840",
        t1,
    );
    fx.drain_kit();
    fx.drain_client();

    // 16 tiles, the full 4x4 visible grid.
    let mut xs = Vec::new();
    let mut ys = Vec::new();
    for row in 0..4 {
        for col in 0..4 {
            xs.push((col * 3840).to_string());
            ys.push((row * 3840).to_string());
        }
    }
    let request = format!(
        "tilecombine nviewid=0 part=0 width=256 height=256 tileposx={} tileposy={} tilewidth=3840 tileheight=3840",
        xs.join(","),
        ys.join(",")
    );
    fx.broker.handle_client_message("s1", request.as_bytes(), t1);

    // Exactly one aggregated render request reaches the kit.
    let kit_msgs = fx.drain_kit();
    let combines: Vec<&String> = kit_msgs
        .iter()
        .filter(|m| m.starts_with("tilecombine "))
        .collect();
    assert_eq!(combines.len(), 1, "one aggregated request: {kit_msgs:?}");
    let combined = TileCombined::parse(combines[0]).unwrap();
    assert_eq!(combined.tiles.len(), 16);

    let session = fx.broker.session("s1").unwrap();
    let limit = (16.0_f64 * 1.1).max(10.0);

    // Renders arrive one by one; each goes straight to the session and
    // the outstanding window never exceeds the cap.
    for tile in &combined.tiles {
        let mut done = tile.clone();
        done.img_size = 8;
        done.wire_id = 0;
        let mut frame = done.serialize("tile:", "").into_bytes();
        frame.push(b'\n');
        frame.extend_from_slice(b"pngbytes");
        fx.broker.handle_kit_message(&frame, t1);

        let on_fly = session.borrow().tiles_on_fly_count();
        assert!(
            (on_fly as f64) < limit || on_fly == 16,
            "tiles-on-fly {on_fly} within max(10, 16*1.1)"
        );
        assert!(on_fly <= 17);
    }

    let tile_frames = fx.drain_client();
    let delivered = tile_frames.iter().filter(|f| f.starts_with("tile:")).count();
    assert_eq!(delivered, 16, "every render delivered: {}", tile_frames.len());
    assert_eq!(session.borrow().tiles_on_fly_count(), 16);

    // tileprocessed releases the slots monotonically.
    let mut remaining = 16;
    for tile in &combined.tiles {
        let ack = format!("tileprocessed tile={}", tile.generate_id());
        fx.broker.handle_client_message("s1", ack.as_bytes(), t1);
        remaining -= 1;
        assert_eq!(session.borrow().tiles_on_fly_count(), remaining);
    }
}

// ─── Scenario: invalidation triggers re-request with old wire ids ──────

#[test]
fn test_invalidation_rerequests_visible_tiles() {
    let mut fx = fixture(default_file_info(), |_| {});
    fx.load();
    let t1 = fx.t0 + Duration::from_secs(1);
    fx.kit_status(t1);
    fx.broker.handle_client_message(
        "s1",
        b"clientvisiblearea x=0 y=0 width=7680 height=3840",
        t1,
    );
    fx.broker.handle_client_message(
        "s1",
        b"clientzoom tilepixelwidth=256 tilepixelheight=256 tiletwipwidth=3840 tiletwipheight=3840",
        t1,
    );
    fx.drain_kit();
    fx.drain_client();

    // Kit invalidates part of the visible area.
    fx.broker.handle_kit_message(
        b"client-s1 invalidatetiles: part=0 x=0 y=0 width=3840 height=3840",
        t1,
    );

    // The client sees the invalidation first, then the kit is asked to
    // re-render the covered tiles.
    let client_frames = fx.drain_client();
    assert!(client_frames
        .iter()
        .any(|f| f.starts_with("invalidatetiles:")));
    let kit_msgs = fx.drain_kit();
    let combine = kit_msgs
        .iter()
        .find(|m| m.starts_with("tilecombine "))
        .expect("re-request issued");
    let combined = TileCombined::parse(combine).unwrap();
    assert!(!combined.tiles.is_empty());
    assert!(combined
        .tiles
        .iter()
        .all(|t| t.tile_pos_x <= 3840 && t.tile_pos_y <= 3840));
}

// ─── Scenario: clipboard key rotation ──────────────────────────────────

#[test]
fn test_clipboard_key_rotation_and_lookup() {
    let mut fx = fixture(default_file_info(), |config| {
        config.per_document.limit_load_secs = 0;
    });
    let session = fx.broker.session("s1").unwrap();
    let key0 = session.borrow().current_clipboard_key().to_string();

    // First rotation: key0 is still honored as the previous key.
    let t1 = fx.t0 + Duration::from_secs(5 * 60 + 1);
    assert!(fx.broker.tick(t1));
    let frames = fx.drain_client();
    assert!(
        frames.iter().any(|f| f.starts_with("clipboardkey: ")),
        "rotation notified: {frames:?}"
    );
    assert!(session.borrow().matches_clipboard_keys("0", &key0));

    let (sock_tx, sock_rx) = mpsc::channel();
    fx.broker.handle_clipboard_request("0", &key0, sock_tx);
    // The socket parks on the session; clipboard content serves it.
    let mut frame = b"clipboardcontent: content follows\n".to_vec();
    frame.extend_from_slice(b"clip-payload");
    let mut addressed = b"client-s1 ".to_vec();
    addressed.extend_from_slice(&frame);
    fx.broker.handle_kit_message(&addressed, t1);
    let response = sock_rx.recv_timeout(Duration::from_secs(1)).unwrap();
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 200 OK"));
    assert!(text.ends_with("clip-payload"));

    // A second rotation retires key0 entirely.
    let t2 = t1 + Duration::from_secs(5 * 60 + 1);
    assert!(fx.broker.tick(t2));
    assert!(!session.borrow().matches_clipboard_keys("0", &key0));
    let (sock_tx, sock_rx) = mpsc::channel();
    fx.broker.handle_clipboard_request("0", &key0, sock_tx);
    let response = sock_rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 400"));
}

// ─── Scenario: template load then immediate save ───────────────────────

#[test]
fn test_template_load_saves_immediately() {
    let mut fx = fixture_with(
        |server_uri| {
            let mut info = default_file_info();
            info["TemplateSource"] = json!(format!("{server_uri}/templates/letter.ott"));
            info
        },
        |_| {},
    );
    fx.rt.block_on(
        Mock::given(method("GET"))
            .and(path("/templates/letter.ott"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"template-bytes".to_vec()))
            .mount(&fx.server),
    );
    fx.rt.block_on(
        Mock::given(method("POST"))
            .and(path("/wopi/files/1/contents"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "LastModifiedTime": "2024-05-01T11:00:00.000000Z"
            })))
            .mount(&fx.server),
    );

    fx.load();
    let kit_msgs = fx.drain_kit();
    assert!(
        kit_msgs.iter().any(|m| m.contains(" template=")),
        "kit load carries the template: {kit_msgs:?}"
    );

    // On the kit's status the broker persists the instantiated template.
    let t1 = fx.t0 + Duration::from_secs(1);
    fx.kit_status(t1);
    let kit_msgs = fx.drain_kit();
    assert!(
        kit_msgs.iter().any(|m| m.contains("uno .uno:Save")),
        "immediate save after template load: {kit_msgs:?}"
    );

    fx.ack_save(true, "", t1);
    let outcome = fx.pump_upload(t1);
    assert!(outcome.is_ok());

    let puts = fx.posts_with_override("PUT");
    assert_eq!(puts.len(), 1);
    assert_eq!(
        puts[0]
            .headers
            .get("x-cool-wopi-isautosave")
            .and_then(|v| v.to_str().ok()),
        Some("false"),
        "template persist counts as a real checkpoint"
    );
    assert_eq!(puts[0].body, b"template-bytes");
}

// ─── Scenario: version restore handshake ───────────────────────────────

#[test]
fn test_version_restore_prerestore_ack() {
    let mut fx = fixture(default_file_info(), |_| {});
    fx.rt.block_on(
        Mock::given(method("POST"))
            .and(path("/wopi/files/1/contents"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "LastModifiedTime": "2024-05-01T12:00:00.000000Z"
            })))
            .mount(&fx.server),
    );

    fx.load();
    let t1 = fx.t0 + Duration::from_secs(1);
    fx.kit_status(t1);
    fx.mark_modified(t1);
    fx.drain_client();

    fx.broker
        .handle_client_message("s1", b"versionrestore prerestore", t1);
    fx.ack_save(true, "", t1);
    fx.pump_upload(t1);

    let frames = fx.drain_client();
    assert!(
        frames
            .iter()
            .any(|f| f == "close: versionrestore: prerestore_ack"),
        "restore acknowledged after flush: {frames:?}"
    );
}

// ─── Scenario: read-only sessions are filtered ─────────────────────────

#[test]
fn test_read_only_session_input_filtered() {
    let mut info = default_file_info();
    info["UserCanWrite"] = json!(false);
    let mut fx = fixture(info, |_| {});
    fx.load();
    let t1 = fx.t0 + Duration::from_secs(1);
    fx.kit_status(t1);
    fx.drain_kit();
    fx.drain_client();

    fx.broker
        .handle_client_message("s1", b"key type=input char=97 key=0", t1);
    let kit_msgs = fx.drain_kit();
    assert!(kit_msgs.is_empty(), "read-only input must not reach the kit");
    let frames = fx.drain_client();
    assert!(
        frames.iter().any(|f| f.starts_with("error: cmd=key")),
        "client told about the rejection: {frames:?}"
    );

    // Activity signals still pass.
    fx.broker.handle_client_message("s1", b"useractive", t1);
    assert!(fx.drain_kit().iter().any(|m| m == "child-s1 useractive"));
}

// ─── Scenario: stale disconnects are reaped ────────────────────────────

#[test]
fn test_wait_disconnect_hard_removed_after_timeout() {
    let mut fx = fixture(default_file_info(), |config| {
        config.per_document.limit_load_secs = 0;
    });
    fx.load();
    let t1 = fx.t0 + Duration::from_secs(1);
    fx.kit_status(t1);

    // The kit delivered clipboard content at some point while live.
    let key = fx
        .broker
        .session("s1")
        .unwrap()
        .borrow()
        .current_clipboard_key()
        .to_string();
    let mut frame = b"client-s1 clipboardcontent: content follows\n".to_vec();
    frame.extend_from_slice(b"live-clip");
    fx.broker.handle_kit_message(&frame, t1);

    fx.broker.remove_session("s1", t1);
    assert_eq!(fx.broker.session_count(), 1, "lingers for the kit handshake");

    // The kit never acknowledges; 20 s later the session is reaped.
    fx.broker.tick(t1 + Duration::from_secs(21));
    assert_eq!(fx.broker.session_count(), 0);

    // The clipboard survived the hard removal: a read authenticated by
    // the session's key is served from the process-wide store.
    let (sock_tx, sock_rx) = mpsc::channel();
    fx.broker.handle_clipboard_request("0", &key, sock_tx);
    let response = sock_rx.recv_timeout(Duration::from_secs(1)).unwrap();
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 200 OK"), "rescued clipboard served: {text}");
    assert!(text.ends_with("live-clip"));
}
