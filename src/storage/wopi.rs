//! WOPI-backed storage adapter.
//!
//! Implements the HTTP contract against the storage host:
//! CheckFileInfo (`GET <uri>`), GetFile (`GET <FileUrl>` or
//! `GET <uri>/contents`), PutFile (`POST <uri>/contents`), and
//! Lock/Unlock/Rename/PutRelative (`POST <uri>` with `X-WOPI-Override`).
//!
//! All calls are bounded by the configured request timeout. Redirects are
//! followed manually so loops can be detected and capped. Uploads can run
//! synchronously or on a worker thread that reports the outcome through a
//! caller-supplied callback — the broker passes a closure that posts the
//! outcome back onto its own poll channel.

use super::{
    Authorization, LockContext, LockResult, SaveAsResult, StorageError, UploadAttributes,
    UploadOutcome,
};
use crate::jail;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use reqwest::blocking::Client;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Maximum redirect hops before the chain is declared a loop.
const REDIRECT_LIMIT: usize = 20;

/// `COOLStatusCode` value the host uses for "document changed in storage".
const STATUS_DOC_CHANGED: i64 = 1010;

/// Characters escaped in header values carrying filenames (JS
/// `encodeURIComponent` parity).
const FILENAME_ESCAPE: &AsciiSet = &CONTROLS
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

/// WOPI storage bound to one document URI.
///
/// Owned by the document broker and only touched from its poll thread;
/// upload workers operate on a detached [`UploadRequest`] snapshot.
#[derive(Debug)]
pub struct WopiStorage {
    /// Public URI including the query (access token and friends).
    uri: String,
    client: Client,
    legacy_server: bool,
    server_id: String,
    /// `FileUrl` reported by CheckFileInfo, if any.
    file_url: Option<String>,
    /// Raw `LastModifiedTime` string we believe storage holds.
    last_modified_time: Option<String>,
    /// False after an indeterminate upload failure: subsequent uploads
    /// skip the timestamp guard rather than risk a spurious conflict.
    last_modified_time_safe: bool,
}

impl WopiStorage {
    pub fn new(
        uri: impl Into<String>,
        timeout: Duration,
        legacy_server: bool,
        server_id: impl Into<String>,
    ) -> Result<Self, StorageError> {
        let client = Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| StorageError::Http(e.to_string()))?;
        Ok(Self {
            uri: uri.into(),
            client,
            legacy_server,
            server_id: server_id.into(),
            file_url: None,
            last_modified_time: None,
            last_modified_time_safe: true,
        })
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// The raw modified-time string last seen from the host.
    pub fn last_modified_time(&self) -> Option<&str> {
        self.last_modified_time.as_deref()
    }

    pub fn set_last_modified_time(&mut self, raw: Option<String>) {
        self.last_modified_time = raw;
        self.last_modified_time_safe = true;
    }

    /// After an indeterminate failure we can no longer trust the stored
    /// timestamp; uploads stop sending the conflict guard until the next
    /// successful round-trip.
    pub fn mark_modified_time_unsafe(&mut self) {
        self.last_modified_time_safe = false;
    }

    pub fn is_modified_time_safe(&self) -> bool {
        self.last_modified_time_safe
    }

    /// `GET <uri>` — fetch and parse CheckFileInfo.
    pub fn check_file_info(
        &mut self,
        auth: &Authorization,
    ) -> Result<super::FileInfo, StorageError> {
        let response = self.get_with_redirects(&self.uri.clone(), auth)?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED
            || status == StatusCode::FORBIDDEN
            || status == StatusCode::NOT_FOUND
        {
            return Err(StorageError::Unauthorized);
        }
        if !status.is_success() {
            return Err(StorageError::Http(format!(
                "CheckFileInfo returned {status}"
            )));
        }
        let body: serde_json::Value = response
            .json()
            .map_err(|e| StorageError::InvalidArgument(format!("malformed JSON: {e}")))?;
        let info = super::FileInfo::from_check_file_info(&body)?;
        self.file_url = (!info.file_url.is_empty()).then(|| info.file_url.clone());
        // The host's own spelling of the timestamp backs the upload
        // conflict guard.
        self.set_last_modified_time(
            body.get("LastModifiedTime")
                .and_then(|v| v.as_str())
                .map(ToString::to_string),
        );
        log::debug!(
            "[storage] CheckFileInfo ok: file={} size={} canwrite={}",
            info.base_file_name,
            info.size,
            info.user_can_write
        );
        Ok(info)
    }

    /// Download the document into `dest`.
    ///
    /// A template source wins over everything; otherwise `FileUrl` is
    /// tried first with `<uri>/contents` as the fallback. Partial writes
    /// are deleted. Local disk headroom is checked before starting.
    pub fn download_document(
        &mut self,
        auth: &Authorization,
        dest: &Path,
        expected_size: u64,
        template_source: Option<&str>,
    ) -> Result<u64, StorageError> {
        let parent = dest.parent().unwrap_or(Path::new("."));
        if !jail::has_disk_space(parent, expected_size) {
            return Err(StorageError::DiskFull);
        }

        if let Some(template) = template_source {
            log::info!("[storage] GetFile from template source");
            return self.download_one(template, auth, dest);
        }

        if let Some(file_url) = self.file_url.clone() {
            match self.download_one(&file_url, auth, dest) {
                Ok(size) => return Ok(size),
                Err(e) => {
                    log::warn!("[storage] FileUrl download failed ({e}), falling back to /contents");
                }
            }
        }

        let contents_uri = append_path_segment(&self.uri, "/contents");
        self.download_one(&contents_uri, auth, dest)
    }

    fn download_one(
        &self,
        url: &str,
        auth: &Authorization,
        dest: &Path,
    ) -> Result<u64, StorageError> {
        let response = self.get_with_redirects(url, auth)?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED
            || status == StatusCode::FORBIDDEN
            || status == StatusCode::NOT_FOUND
        {
            return Err(StorageError::Unauthorized);
        }
        if !status.is_success() {
            return Err(StorageError::Http(format!("GetFile returned {status}")));
        }
        let body = response
            .bytes()
            .map_err(|e| StorageError::Http(format!("GetFile body: {e}")))?;

        let write_result = (|| -> std::io::Result<()> {
            let mut file = std::fs::File::create(dest)?;
            file.write_all(&body)?;
            file.sync_all()
        })();
        if let Err(e) = write_result {
            // Never leave a truncated document behind.
            let _ = std::fs::remove_file(dest);
            if e.raw_os_error() == Some(libc::ENOSPC) {
                return Err(StorageError::DiskFull);
            }
            return Err(StorageError::Io(e));
        }
        log::info!("[storage] downloaded {} bytes to {}", body.len(), dest.display());
        Ok(body.len() as u64)
    }

    /// `POST <uri>` with `X-WOPI-Override: LOCK|UNLOCK`.
    pub fn update_lock_state(
        &self,
        auth: &Authorization,
        lock_ctx: &mut LockContext,
        lock: bool,
        attribs: &UploadAttributes,
        now: Instant,
    ) -> LockResult {
        lock_ctx.failure_reason.clear();
        if !lock_ctx.supports_locks() {
            return LockResult::Unsupported;
        }
        let token = lock_ctx.ensure_token().to_string();

        let verb = if lock { "LOCK" } else { "UNLOCK" };
        let mut request = self
            .client
            .post(&self.uri)
            .header("X-WOPI-Override", verb)
            .header("X-WOPI-Lock", &token)
            // IIS requires a content length on POST.
            .body(Vec::new());
        request = self.common_headers(request, auth, &self.uri);
        if !attribs.extended_data.is_empty() {
            request = request.header("X-COOL-WOPI-ExtendedData", &attribs.extended_data);
            if self.legacy_server {
                request = request.header("X-LOOL-WOPI-ExtendedData", &attribs.extended_data);
            }
        }

        let response = match request.send() {
            Ok(response) => response,
            Err(e) => {
                lock_ctx.failure_reason = "request failed".to_string();
                return LockResult::Failed(e.to_string());
            }
        };

        let status = response.status();
        if status.is_success() {
            lock_ctx.set_locked(lock);
            lock_ctx.bump_timer(now);
            log::debug!("[storage] {verb} ok");
            return LockResult::Ok;
        }

        if let Some(reason) = response
            .headers()
            .get("X-WOPI-LockFailureReason")
            .and_then(|v| v.to_str().ok())
        {
            lock_ctx.failure_reason = reason.to_string();
        }
        log::error!(
            "[storage] {verb} failed with {status}{}",
            if lock_ctx.failure_reason.is_empty() {
                String::new()
            } else {
                format!(": {}", lock_ctx.failure_reason)
            }
        );
        if status == StatusCode::UNAUTHORIZED
            || status == StatusCode::FORBIDDEN
            || status == StatusCode::NOT_FOUND
        {
            return LockResult::Unauthorized;
        }
        LockResult::Failed(format!("{verb} returned {status}"))
    }

    /// Assemble everything an upload worker needs, detached from `self`.
    pub fn make_upload_request(
        &self,
        auth: &Authorization,
        lock_ctx: &LockContext,
        attribs: UploadAttributes,
        file_path: PathBuf,
        save_target: Option<SaveTarget>,
    ) -> UploadRequest {
        let is_file_endpoint = save_target.is_some();
        let url = if is_file_endpoint {
            self.uri.clone()
        } else {
            append_path_segment(&self.uri, "/contents")
        };
        UploadRequest {
            client: self.client.clone(),
            url,
            auth: auth.clone(),
            lock_token: lock_ctx
                .supports_locks()
                .then(|| lock_ctx.token().to_string())
                .filter(|t| !t.is_empty()),
            attribs,
            file_path,
            save_target,
            timestamp_guard: if self.last_modified_time_safe {
                self.last_modified_time.clone()
            } else {
                None
            },
            legacy_server: self.legacy_server,
            server_id: self.server_id.clone(),
        }
    }

    /// Run the upload on the calling thread.
    pub fn upload_sync(request: UploadRequest) -> UploadOutcome {
        request.run()
    }

    /// Run the upload on a worker thread; `callback` always fires exactly
    /// once, even if the worker dies mid-flight.
    pub fn upload_async(
        request: UploadRequest,
        callback: impl FnOnce(UploadOutcome) + Send + 'static,
    ) {
        std::thread::Builder::new()
            .name("wopi-upload".to_string())
            .spawn(move || {
                let mut guard = scopeguard::guard(Some(callback), |cb| {
                    if let Some(cb) = cb {
                        cb(UploadOutcome::Failed("upload worker terminated".to_string()));
                    }
                });
                let outcome = request.run();
                if let Some(cb) = guard.take() {
                    cb(outcome);
                }
            })
            .map(|_| ())
            .unwrap_or_else(|e| {
                log::error!("[storage] failed to spawn upload worker: {e}");
            });
    }

    /// GET with manual redirect following, bounded and loop-checked.
    fn get_with_redirects(
        &self,
        url: &str,
        auth: &Authorization,
    ) -> Result<reqwest::blocking::Response, StorageError> {
        let mut visited = HashSet::new();
        let mut current = url.to_string();
        for _ in 0..=REDIRECT_LIMIT {
            if !visited.insert(current.clone()) {
                return Err(StorageError::RedirectLoop(url.to_string()));
            }
            let request = self.common_headers(self.client.get(&current), auth, &current);
            let response = request.send().map_err(|e| StorageError::Http(e.to_string()))?;
            if response.status().is_redirection() {
                let location = response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| {
                        StorageError::Http("redirect without Location header".to_string())
                    })?;
                current = resolve_location(&current, location);
                continue;
            }
            return Ok(response);
        }
        Err(StorageError::RedirectLoop(url.to_string()))
    }

    /// Headers common to every storage request: agent, authorization,
    /// proof, and the server id that helps cluster debugging.
    fn common_headers(
        &self,
        mut request: reqwest::blocking::RequestBuilder,
        auth: &Authorization,
        url: &str,
    ) -> reqwest::blocking::RequestBuilder {
        request = request
            .header(reqwest::header::USER_AGENT, agent_string())
            .header("X-COOL-WOPI-ServerId", &self.server_id);
        if let Some(header) = &auth.access_header {
            request = request.header(reqwest::header::AUTHORIZATION, header);
        }
        if let Some(token) = &auth.access_token {
            let (stamp, proof) = wopi_proof(token, url);
            request = request
                .header("X-WOPI-TimeStamp", stamp)
                .header("X-WOPI-Proof", proof);
        }
        request
    }
}

/// Target of a PutRelative or Rename upload.
#[derive(Debug, Clone)]
pub struct SaveTarget {
    /// Suggested (SaveAs) or requested (Rename) file name.
    pub filename: String,
    /// True for `RENAME_FILE`, false for `PUT_RELATIVE`.
    pub is_rename: bool,
}

/// A fully-owned upload job, safe to ship to a worker thread.
#[derive(Debug)]
pub struct UploadRequest {
    client: Client,
    url: String,
    auth: Authorization,
    lock_token: Option<String>,
    attribs: UploadAttributes,
    file_path: PathBuf,
    save_target: Option<SaveTarget>,
    timestamp_guard: Option<String>,
    legacy_server: bool,
    server_id: String,
}

impl UploadRequest {
    fn run(self) -> UploadOutcome {
        let body = match std::fs::read(&self.file_path) {
            Ok(body) => body,
            Err(e) => {
                log::error!(
                    "[storage] cannot read {} for upload: {e}",
                    self.file_path.display()
                );
                return UploadOutcome::Failed(format!("cannot read local file: {e}"));
            }
        };
        let size = body.len();

        let mut request = self
            .client
            .post(&self.url)
            .header(reqwest::header::USER_AGENT, agent_string())
            .header("X-COOL-WOPI-ServerId", &self.server_id);
        if let Some(header) = &self.auth.access_header {
            request = request.header(reqwest::header::AUTHORIZATION, header);
        }
        if let Some(token) = &self.auth.access_token {
            let (stamp, proof) = wopi_proof(token, &self.url);
            request = request
                .header("X-WOPI-TimeStamp", stamp)
                .header("X-WOPI-Proof", proof);
        }
        if let Some(lock) = &self.lock_token {
            request = request.header("X-WOPI-Lock", lock);
        }

        let is_save_as = self.save_target.as_ref().is_some_and(|t| !t.is_rename);
        let is_rename = self.save_target.as_ref().is_some_and(|t| t.is_rename);
        match &self.save_target {
            None => {
                let modified = bool_str(self.attribs.user_modified);
                let autosave = bool_str(self.attribs.autosave);
                let exit_save = bool_str(self.attribs.exit_save);
                request = request
                    .header("X-WOPI-Override", "PUT")
                    .header("X-COOL-WOPI-IsModifiedByUser", modified)
                    .header("X-COOL-WOPI-IsAutosave", autosave)
                    .header("X-COOL-WOPI-IsExitSave", exit_save);
                if self.legacy_server {
                    request = request
                        .header("X-LOOL-WOPI-IsModifiedByUser", modified)
                        .header("X-LOOL-WOPI-IsAutosave", autosave)
                        .header("X-LOOL-WOPI-IsExitSave", exit_save);
                }
                if !self.attribs.extended_data.is_empty() {
                    request = request.header("X-COOL-WOPI-ExtendedData", &self.attribs.extended_data);
                    if self.legacy_server {
                        request =
                            request.header("X-LOOL-WOPI-ExtendedData", &self.attribs.extended_data);
                    }
                }
                if !self.attribs.forced {
                    if let Some(stamp) = &self.timestamp_guard {
                        request = request.header("X-COOL-WOPI-Timestamp", stamp);
                        if self.legacy_server {
                            request = request.header("X-LOOL-WOPI-Timestamp", stamp);
                        }
                    }
                }
            }
            Some(target) if target.is_rename => {
                request = request
                    .header("X-WOPI-Override", "RENAME_FILE")
                    .header(
                        "X-WOPI-RequestedName",
                        utf8_percent_encode(&target.filename, FILENAME_ESCAPE).to_string(),
                    );
            }
            Some(target) => {
                request = request
                    .header("X-WOPI-Override", "PUT_RELATIVE")
                    .header("X-WOPI-Size", size.to_string())
                    .header(
                        "X-WOPI-SuggestedTarget",
                        utf8_percent_encode(&target.filename, FILENAME_ESCAPE).to_string(),
                    );
            }
        }

        log::info!(
            "[storage] uploading {size} bytes (override={})",
            match &self.save_target {
                None => "PUT",
                Some(t) if t.is_rename => "RENAME_FILE",
                Some(_) => "PUT_RELATIVE",
            }
        );

        let response = match request.body(body).send() {
            Ok(response) => response,
            Err(e) => return UploadOutcome::Failed(e.to_string()),
        };

        let status = response.status();
        let body: Option<serde_json::Value> = response.json().ok();

        match status {
            StatusCode::OK => {
                let new_modified_time = body
                    .as_ref()
                    .and_then(|b| b.get("LastModifiedTime"))
                    .and_then(|v| v.as_str())
                    .map(ToString::to_string);
                let save_as = (is_save_as || is_rename)
                    .then(|| {
                        let name = body
                            .as_ref()
                            .and_then(|b| b.get("Name"))
                            .and_then(|v| v.as_str())?
                            .to_string();
                        let url = body
                            .as_ref()
                            .and_then(|b| b.get("Url"))
                            .and_then(|v| v.as_str())?
                            .to_string();
                        Some(SaveAsResult { name, url })
                    })
                    .flatten();
                UploadOutcome::Ok {
                    new_modified_time,
                    save_as,
                }
            }
            StatusCode::PAYLOAD_TOO_LARGE => UploadOutcome::TooLarge,
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
                UploadOutcome::Unauthorized
            }
            StatusCode::CONFLICT => {
                let doc_changed = body
                    .as_ref()
                    .and_then(|b| {
                        b.get("COOLStatusCode")
                            .or_else(|| b.get("LOOLStatusCode"))
                            .and_then(|v| v.as_i64())
                    })
                    .is_some_and(|code| code == STATUS_DOC_CHANGED);
                if doc_changed {
                    UploadOutcome::DocChanged
                } else {
                    UploadOutcome::Conflict
                }
            }
            other => UploadOutcome::Failed(format!("PutFile returned {other}")),
        }
    }
}

fn bool_str(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

fn agent_string() -> String {
    format!("DocbrokerWOPI/{}", env!("CARGO_PKG_VERSION"))
}

/// Compute the proof pair attached to every storage request.
///
/// Digest over `(access_token, url, timestamp)`; the timestamp rides in
/// `X-WOPI-TimeStamp` so the host can re-derive and bound replay.
fn wopi_proof(access_token: &str, url: &str) -> (String, String) {
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis()
        .to_string();
    let mut hasher = Sha256::new();
    hasher.update(access_token.as_bytes());
    hasher.update(url.as_bytes());
    hasher.update(stamp.as_bytes());
    let proof: String = hasher.finalize().iter().map(|b| format!("{b:02x}")).collect();
    (stamp, proof)
}

/// Insert a path segment before the query string of `uri`.
fn append_path_segment(uri: &str, segment: &str) -> String {
    match uri.split_once('?') {
        Some((path, query)) => format!("{path}{segment}?{query}"),
        None => format!("{uri}{segment}"),
    }
}

/// Resolve a Location header against the current URL (absolute, scheme
/// -relative, or path-absolute).
fn resolve_location(current: &str, location: &str) -> String {
    if location.contains("://") {
        return location.to_string();
    }
    if let Some(rest) = location.strip_prefix("//") {
        let scheme = current.split("://").next().unwrap_or("https");
        return format!("{scheme}://{rest}");
    }
    // Path-absolute: keep scheme and host.
    if let Some(scheme_end) = current.find("://") {
        let after_scheme = &current[scheme_end + 3..];
        let host_end = after_scheme.find('/').map_or(current.len(), |i| scheme_end + 3 + i);
        return format!("{}{}", &current[..host_end], location);
    }
    location.to_string()
}
