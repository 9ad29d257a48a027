//! Configuration loading.
//!
//! Reads the broker configuration from a JSON file, fills in defaults for
//! everything that is absent, and applies environment-variable overrides.
//! Section names mirror the dotted keys operators know
//! (`per_document.idle_timeout_secs`, `net.connection_timeout_secs`, ...).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use std::{env, fs};

/// Per-document lifecycle tunables.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct PerDocument {
    /// Unload the document after this much inactivity.
    pub idle_timeout_secs: u64,
    /// Seconds of user inactivity that trigger an autosave.
    pub idlesave_duration_secs: u64,
    /// Seconds between forced autosaves while actively edited.
    pub autosave_duration_secs: u64,
    /// Seconds to complete the initial load before the document is aborted.
    pub limit_load_secs: u64,
    /// Lifetime cap for convert-to documents.
    pub limit_convert_secs: u64,
    /// Max consecutive upload failures before giving up on the document.
    pub limit_store_failures: u32,
    /// Force a save on unload even when the document looks unmodified.
    pub always_save_on_exit: bool,
    /// Rate limit between save requests to the kit.
    pub min_time_between_saves_ms: u64,
    /// Rate limit between upload attempts to storage.
    pub min_time_between_uploads_ms: u64,
}

impl Default for PerDocument {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 3600,
            idlesave_duration_secs: 30,
            autosave_duration_secs: 300,
            limit_load_secs: 100,
            limit_convert_secs: 100,
            limit_store_failures: 5,
            always_save_on_exit: false,
            min_time_between_saves_ms: 500,
            min_time_between_uploads_ms: 5000,
        }
    }
}

/// Network-level settings for storage-host HTTP.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct Net {
    /// Connect/request timeout for HTTP calls, in seconds.
    pub connection_timeout_secs: u64,
}

impl Default for Net {
    fn default() -> Self {
        Self {
            connection_timeout_secs: 30,
        }
    }
}

/// Global watermark override.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct Watermark {
    /// When non-empty, overrides the per-document watermark text.
    pub text: String,
    /// Opacity passed along with the watermark text.
    pub opacity: f64,
}

/// Feature-lock host list.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct FeatureLock {
    /// Enables the read-only/disabled-command host list.
    pub locked_hosts_allow: bool,
}

/// Quarantine of rejected uploads.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct QuarantineFiles {
    /// Keep copies of uploads the storage host rejected.
    pub enable: bool,
    /// Directory for the quarantine store.
    pub path: String,
}

/// WOPI storage compatibility knobs.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct WopiCfg {
    /// Also emit `X-LOOL-WOPI-*` headers alongside `X-COOL-WOPI-*`.
    pub is_legacy_server: bool,
}

/// Storage section.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct StorageCfg {
    pub wopi: WopiCfg,
}

/// Server-side config group expiry.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct ServersideConfig {
    /// Seconds before unused config groups are discarded.
    pub idle_timeout_secs: u64,
}

impl Default for ServersideConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 3600,
        }
    }
}

/// A document pre-filter: converts `.extension` files into
/// `.new_extension` before handing them to the kit.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct Prefilter {
    pub extension: String,
    pub new_extension: String,
    /// Command line containing `@INPUT@` and `@OUTPUT@` placeholders.
    pub command_line: String,
}

/// Kit process settings.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct KitCfg {
    /// Command (argv) used to spawn the rendering kit.
    pub command: Vec<String>,
}

impl Default for KitCfg {
    fn default() -> Self {
        Self {
            command: vec!["dockit".to_string()],
        }
    }
}

/// Full broker configuration.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct Config {
    pub per_document: PerDocument,
    pub net: Net,
    pub watermark: Watermark,
    pub feature_lock: FeatureLock,
    pub quarantine_files: QuarantineFiles,
    pub storage: StorageCfg,
    pub serverside_config: ServersideConfig,
    pub prefilters: Vec<Prefilter>,
    pub kit: KitCfg,
    /// Root directory under which per-document jails are created.
    pub child_root: PathBuf,
}

impl Config {
    /// Load from an explicit path, or the default location when `None`.
    ///
    /// A missing file yields the defaults; a malformed file is an error.
    pub fn load(path: Option<&PathBuf>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::load_from_file(p)
                .with_context(|| format!("loading config from {}", p.display()))?,
            None => {
                let default_path = Self::default_path()?;
                if default_path.exists() {
                    Self::load_from_file(&default_path)
                        .with_context(|| format!("loading config from {}", default_path.display()))?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env_overrides();
        if config.child_root.as_os_str().is_empty() {
            config.child_root = env::temp_dir().join("docbroker-jails");
        }
        Ok(config)
    }

    fn load_from_file(path: &PathBuf) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let config = serde_json::from_str(&raw)?;
        Ok(config)
    }

    /// Default config file location: `<platform config dir>/docbroker/config.json`.
    pub fn default_path() -> Result<PathBuf> {
        let dir = if let Ok(dir) = env::var("DOCBROKER_CONFIG_DIR") {
            PathBuf::from(dir)
        } else {
            dirs::config_dir()
                .context("could not determine config directory")?
                .join("docbroker")
        };
        Ok(dir.join("config.json"))
    }

    /// Environment variables override the file for a few operational knobs.
    fn apply_env_overrides(&mut self) {
        if let Ok(root) = env::var("DOCBROKER_CHILD_ROOT") {
            self.child_root = PathBuf::from(root);
        }
        if let Ok(secs) = env::var("DOCBROKER_CONNECTION_TIMEOUT_SECS") {
            if let Ok(secs) = secs.parse() {
                self.net.connection_timeout_secs = secs;
            }
        }
        if let Ok(v) = env::var("DOCBROKER_ALWAYS_SAVE_ON_EXIT") {
            self.per_document.always_save_on_exit = v == "1" || v.eq_ignore_ascii_case("true");
        }
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.net.connection_timeout_secs)
    }
}
