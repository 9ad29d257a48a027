//! Storage abstraction for the document host.
//!
//! The broker talks to the host that owns the authoritative file through
//! five operations: CheckFileInfo, GetFile, PutFile, Lock, and Unlock.
//! This module owns the data model of that contract — the parsed file
//! info snapshot, lock state, upload attributes, and the tagged outcome
//! enums — while `wopi` implements the HTTP specifics.

pub mod wopi;

pub use wopi::{SaveTarget, UploadRequest, WopiStorage};

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Error surface of the storage adapter.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Malformed CheckFileInfo response (bad JSON, missing `BaseFileName`).
    #[error("invalid CheckFileInfo response: {0}")]
    InvalidArgument(String),
    /// Redirect chain exceeded the limit or revisited a URL.
    #[error("redirect loop fetching {0}")]
    RedirectLoop(String),
    /// The host rejected our token (401/403/404).
    #[error("storage authorization failed")]
    Unauthorized,
    /// Not enough local disk for the download.
    #[error("insufficient disk space")]
    DiskFull,
    /// Transport or unexpected-status failure.
    #[error("storage http failure: {0}")]
    Http(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Three-valued flag for host properties that distinguish "absent" from
/// "false" (change-tracking controls).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriState {
    #[default]
    Unset,
    False,
    True,
}

impl TriState {
    fn from_json(value: Option<bool>) -> Self {
        match value {
            None => Self::Unset,
            Some(false) => Self::False,
            Some(true) => Self::True,
        }
    }
}

/// Parsed CheckFileInfo snapshot.
///
/// `modified_time` is the authoritative freshness anchor: conflict
/// detection compares it against the value seen at first load.
#[derive(Debug, Clone, Default)]
pub struct FileInfo {
    pub base_file_name: String,
    pub size: i64,
    pub owner_id: String,
    pub modified_time: Option<DateTime<Utc>>,
    pub user_id: String,
    pub username: String,
    /// Extra info per user (mail, avatar links), raw JSON.
    pub user_extra_info: String,
    pub user_can_write: bool,
    pub post_message_origin: String,
    pub watermark_text: String,
    pub template_save_as: String,
    pub template_source: String,
    /// Alternative download URL; preferred over `<uri>/contents`.
    pub file_url: String,
    pub supports_locks: bool,
    pub supports_rename: bool,
    pub user_can_rename: bool,
    pub disable_print: bool,
    pub disable_export: bool,
    pub disable_copy: bool,
    pub disable_inactive_messages: bool,
    pub enable_owner_termination: bool,
    pub hide_print_option: bool,
    pub hide_save_option: bool,
    pub hide_export_option: bool,
    pub hide_user_list: bool,
    pub user_can_not_write_relative: bool,
    pub enable_insert_remote_image: bool,
    pub enable_share: bool,
    pub breadcrumb_doc_name: String,
    pub hide_change_tracking_controls: TriState,
    pub disable_change_tracking_record: TriState,
    pub disable_change_tracking_show: TriState,
}

impl FileInfo {
    /// Parse the CheckFileInfo JSON body.
    ///
    /// Hosts are sloppy about types, so booleans also accept the strings
    /// "true"/"false". `BaseFileName` is the only hard requirement.
    pub fn from_check_file_info(body: &Value) -> Result<Self, StorageError> {
        let obj = body
            .as_object()
            .ok_or_else(|| StorageError::InvalidArgument("not a JSON object".into()))?;

        let base_file_name = json_string(obj, "BaseFileName")
            .filter(|name| !name.is_empty())
            .ok_or_else(|| StorageError::InvalidArgument("missing BaseFileName".into()))?;

        let mut username = json_string(obj, "UserFriendlyName").unwrap_or_default();
        let user_id = json_string(obj, "UserId").unwrap_or_default();
        if username.is_empty() {
            // UserFriendlyName is optional in the WOPI spec but the kit
            // needs an author name; fall back to something stable.
            username = "UnknownUser".to_string();
            if !user_id.is_empty() {
                username.push('_');
                username.push_str(&user_id);
            }
        }

        Ok(Self {
            base_file_name,
            size: json_i64(obj, "Size").unwrap_or(0),
            owner_id: json_string(obj, "OwnerId").unwrap_or_default(),
            modified_time: json_string(obj, "LastModifiedTime")
                .as_deref()
                .and_then(parse_wopi_timestamp),
            user_id,
            username,
            user_extra_info: obj
                .get("UserExtraInfo")
                .map(ToString::to_string)
                .unwrap_or_default(),
            user_can_write: json_bool(obj, "UserCanWrite").unwrap_or(false),
            post_message_origin: json_string(obj, "PostMessageOrigin").unwrap_or_default(),
            watermark_text: json_string(obj, "WatermarkText").unwrap_or_default(),
            template_save_as: json_string(obj, "TemplateSaveAs").unwrap_or_default(),
            template_source: json_string(obj, "TemplateSource").unwrap_or_default(),
            file_url: json_string(obj, "FileUrl").unwrap_or_default(),
            supports_locks: json_bool(obj, "SupportsLocks").unwrap_or(false),
            supports_rename: json_bool(obj, "SupportsRename").unwrap_or(false),
            user_can_rename: json_bool(obj, "UserCanRename").unwrap_or(false),
            disable_print: json_bool(obj, "DisablePrint").unwrap_or(false),
            disable_export: json_bool(obj, "DisableExport").unwrap_or(false),
            disable_copy: json_bool(obj, "DisableCopy").unwrap_or(false),
            disable_inactive_messages: json_bool(obj, "DisableInactiveMessages").unwrap_or(false),
            enable_owner_termination: json_bool(obj, "EnableOwnerTermination").unwrap_or(false),
            hide_print_option: json_bool(obj, "HidePrintOption").unwrap_or(false),
            hide_save_option: json_bool(obj, "HideSaveOption").unwrap_or(false),
            hide_export_option: json_bool(obj, "HideExportOption").unwrap_or(false),
            hide_user_list: json_bool(obj, "HideUserList").unwrap_or(false),
            user_can_not_write_relative: json_bool(obj, "UserCanNotWriteRelative").unwrap_or(false),
            enable_insert_remote_image: json_bool(obj, "EnableInsertRemoteImage").unwrap_or(false),
            enable_share: json_bool(obj, "EnableShare").unwrap_or(false),
            breadcrumb_doc_name: json_string(obj, "BreadcrumbDocName").unwrap_or_default(),
            hide_change_tracking_controls: TriState::from_json(json_bool(
                obj,
                "HideChangeTrackingControls",
            )),
            disable_change_tracking_record: TriState::from_json(json_bool(
                obj,
                "DisableChangeTrackingRecord",
            )),
            disable_change_tracking_show: TriState::from_json(json_bool(
                obj,
                "DisableChangeTrackingShow",
            )),
        })
    }
}

/// Parse a WOPI `LastModifiedTime` (ISO-8601).
pub fn parse_wopi_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn json_string(obj: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    match obj.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn json_bool(obj: &serde_json::Map<String, Value>, key: &str) -> Option<bool> {
    match obj.get(key)? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.as_str() {
            "true" | "True" => Some(true),
            "false" | "False" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn json_i64(obj: &serde_json::Map<String, Value>, key: &str) -> Option<i64> {
    match obj.get(key)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Authorization material extracted from a session's public URI.
///
/// `access_token` rides along in the query string of every storage
/// request (the public URI already carries it); `access_header` is an
/// explicit `Authorization` header value some integrations use instead.
#[derive(Debug, Clone, Default)]
pub struct Authorization {
    pub access_token: Option<String>,
    pub access_header: Option<String>,
}

impl Authorization {
    /// Extract from the query parameters of `uri`.
    pub fn from_uri(uri: &str) -> Self {
        let mut auth = Self::default();
        let Some((_, query)) = uri.split_once('?') else {
            return auth;
        };
        for pair in query.split('&') {
            let (name, value) = match pair.split_once('=') {
                Some(pair) => pair,
                None => continue,
            };
            let value = percent_encoding::percent_decode_str(value)
                .decode_utf8()
                .map(|v| v.to_string())
                .unwrap_or_else(|_| value.to_string());
            match name {
                "access_token" if auth.access_token.is_none() => auth.access_token = Some(value),
                "access_header" if auth.access_header.is_none() => auth.access_header = Some(value),
                _ => {}
            }
        }
        auth
    }
}

/// Per-document WOPI lock state.
///
/// Invariant: `is_locked` implies a non-empty token. The token is
/// generated once per document on the first lock request and preserved
/// across refreshes until unlock.
#[derive(Debug, Clone)]
pub struct LockContext {
    supports_locks: bool,
    is_locked: bool,
    token: String,
    last_refresh: Option<Instant>,
    refresh_interval: Duration,
    /// `X-WOPI-LockFailureReason` from the most recent failed request.
    pub failure_reason: String,
}

/// Refresh cadence for held locks.
const LOCK_REFRESH_INTERVAL: Duration = Duration::from_secs(10 * 60);

impl Default for LockContext {
    fn default() -> Self {
        Self::new(LOCK_REFRESH_INTERVAL)
    }
}

impl LockContext {
    pub fn new(refresh_interval: Duration) -> Self {
        Self {
            supports_locks: false,
            is_locked: false,
            token: String::new(),
            last_refresh: None,
            refresh_interval,
            failure_reason: String::new(),
        }
    }

    /// Called once after CheckFileInfo.
    pub fn init_supports_locks(&mut self) {
        self.supports_locks = true;
    }

    pub fn supports_locks(&self) -> bool {
        self.supports_locks
    }

    pub fn is_locked(&self) -> bool {
        self.is_locked
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// The lock token, generating it on first use.
    pub fn ensure_token(&mut self) -> &str {
        if self.token.is_empty() {
            self.token = crate::context::strong_random_hex(16);
        }
        &self.token
    }

    pub(crate) fn set_locked(&mut self, locked: bool) {
        debug_assert!(!locked || !self.token.is_empty());
        self.is_locked = locked;
    }

    /// True when a held lock is due for a refresh.
    pub fn needs_refresh(&self, now: Instant) -> bool {
        self.supports_locks
            && self.is_locked
            && self
                .last_refresh
                .is_none_or(|last| now.duration_since(last) >= self.refresh_interval)
    }

    /// Record a successful lock/unlock/refresh round-trip.
    pub fn bump_timer(&mut self, now: Instant) {
        self.last_refresh = Some(now);
    }
}

/// Attributes accompanying a save, carried through to PutFile headers.
#[derive(Debug, Clone, Default)]
pub struct UploadAttributes {
    /// The user actually changed the document since the last upload.
    pub user_modified: bool,
    /// This upload came from the autosave timer, not a user action.
    pub autosave: bool,
    /// This upload happens because the document is closing.
    pub exit_save: bool,
    /// Skip the timestamp conflict guard.
    pub forced: bool,
    /// Opaque host-defined payload from the client's save request.
    pub extended_data: String,
}

/// Name and URL the host reports for SaveAs/Rename results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveAsResult {
    pub name: String,
    pub url: String,
}

/// Result of a PutFile (or PutRelative/Rename) round-trip.
#[derive(Debug, Clone)]
pub enum UploadOutcome {
    /// Stored; carries the host's new modification time (raw, as the
    /// host spelled it), and the new name/URL for SaveAs/Rename.
    Ok {
        new_modified_time: Option<String>,
        save_as: Option<SaveAsResult>,
    },
    /// 413: the host refuses a file this large.
    TooLarge,
    /// 401/403/404: expired or invalid token.
    Unauthorized,
    /// 409 without a recognizable reason.
    Conflict,
    /// 409 with `COOLStatusCode == DOC_CHANGED`: the file changed in
    /// storage behind our back.
    DocChanged,
    /// Transport failure or unexpected status; retryable.
    Failed(String),
}

impl UploadOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }
}

/// Result of a lock or unlock request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockResult {
    Ok,
    /// The host does not support locking; treated as success.
    Unsupported,
    Unauthorized,
    Failed(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_file_info_requires_base_file_name() {
        let err = FileInfo::from_check_file_info(&json!({ "Size": 10 })).unwrap_err();
        assert!(matches!(err, StorageError::InvalidArgument(_)));
        let err = FileInfo::from_check_file_info(&json!("not an object")).unwrap_err();
        assert!(matches!(err, StorageError::InvalidArgument(_)));
    }

    #[test]
    fn test_file_info_parses_documented_fields() {
        let info = FileInfo::from_check_file_info(&json!({
            "BaseFileName": "report.odt",
            "Size": 4096,
            "OwnerId": "owner-1",
            "UserId": "user-7",
            "UserFriendlyName": "Alice",
            "UserCanWrite": true,
            "LastModifiedTime": "2024-03-01T10:15:30.000000Z",
            "PostMessageOrigin": "https://host.example",
            "SupportsLocks": true,
            "DisableCopy": "true",
            "HideChangeTrackingControls": true,
        }))
        .unwrap();
        assert_eq!(info.base_file_name, "report.odt");
        assert_eq!(info.size, 4096);
        assert_eq!(info.username, "Alice");
        assert!(info.user_can_write);
        assert!(info.supports_locks);
        assert!(info.disable_copy, "string booleans must parse");
        assert!(info.modified_time.is_some());
        assert_eq!(info.hide_change_tracking_controls, TriState::True);
        assert_eq!(info.disable_change_tracking_record, TriState::Unset);
    }

    #[test]
    fn test_file_info_username_fallback() {
        let info = FileInfo::from_check_file_info(&json!({
            "BaseFileName": "a.odt",
            "UserId": "u1",
        }))
        .unwrap();
        assert_eq!(info.username, "UnknownUser_u1");
    }

    #[test]
    fn test_authorization_prefers_access_token() {
        let auth =
            Authorization::from_uri("https://w/files/1?access_token=tok123&access_header=Bearer%20xyz");
        assert_eq!(auth.access_token.as_deref(), Some("tok123"));
        assert_eq!(auth.access_header.as_deref(), Some("Bearer xyz"));
        let none = Authorization::from_uri("https://w/files/1");
        assert!(none.access_token.is_none() && none.access_header.is_none());
    }

    #[test]
    fn test_lock_context_token_generated_once() {
        let mut ctx = LockContext::default();
        ctx.init_supports_locks();
        let token = ctx.ensure_token().to_string();
        assert_eq!(token.len(), 32);
        assert_eq!(ctx.ensure_token(), token, "token must be stable across refreshes");
    }

    #[test]
    fn test_lock_needs_refresh_cadence() {
        let mut ctx = LockContext::new(Duration::from_secs(60));
        ctx.init_supports_locks();
        let t0 = Instant::now();
        assert!(!ctx.needs_refresh(t0), "unlocked contexts never refresh");
        ctx.ensure_token();
        ctx.set_locked(true);
        assert!(ctx.needs_refresh(t0), "locked with no refresh yet");
        ctx.bump_timer(t0);
        assert!(!ctx.needs_refresh(t0 + Duration::from_secs(30)));
        assert!(ctx.needs_refresh(t0 + Duration::from_secs(61)));
    }

    #[test]
    fn test_parse_wopi_timestamp() {
        assert!(parse_wopi_timestamp("2024-03-01T10:15:30Z").is_some());
        assert!(parse_wopi_timestamp("2024-03-01T10:15:30.123456+01:00").is_some());
        assert!(parse_wopi_timestamp("yesterday").is_none());
    }
}
