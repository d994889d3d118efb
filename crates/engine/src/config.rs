//! Engine configuration.
//!
//! Stored as JSON at `<config dir>/driftbox/config.json`. Every field has a
//! default, so a missing or partial file is fine; an unreadable one is
//! logged and replaced by defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use driftbox_session::{RefreshConfig, config_dir};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Backend base URL, without a trailing slash.
    pub api_base_url: String,
    /// Default root for downloads.
    pub download_root: PathBuf,
    /// Transfer record table.
    pub store_path: PathBuf,
    /// Directory of per-content-key upload checkpoints.
    pub checkpoint_dir: PathBuf,
    pub credentials_path: PathBuf,
    /// Upload chunk size in bytes.
    pub chunk_size: usize,
    pub progress_interval_ms: u64,
    pub refresh_cooldown_ms: u64,
    pub refresh_wait_timeout_ms: u64,
    /// Renew the bearer token this many seconds before it expires.
    pub refresh_lead_secs: u64,
    /// First segment of every content key.
    pub content_key_prefix: String,
    pub request_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let data = data_dir();
        Self {
            api_base_url: "http://127.0.0.1:8080".into(),
            download_root: default_download_root(),
            store_path: data.join("transfers.json"),
            checkpoint_dir: data.join("checkpoints"),
            credentials_path: data.join("credentials.json"),
            chunk_size: driftbox_transfer::DEFAULT_CHUNK_SIZE,
            progress_interval_ms: 500,
            refresh_cooldown_ms: 3_000,
            refresh_wait_timeout_ms: 10_000,
            refresh_lead_secs: 60,
            content_key_prefix: "sha256".into(),
            request_timeout_secs: 30,
        }
    }
}

impl EngineConfig {
    /// Loads the config from its default location.
    pub fn load() -> Self {
        match config_path() {
            Some(path) => Self::load_from(&path),
            None => {
                warn!("no config directory available, using defaults");
                Self::default()
            }
        }
    }

    /// Loads the config from `path`, falling back to defaults.
    pub fn load_from(path: &Path) -> Self {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no config file, using defaults");
                return Self::default();
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read config, using defaults");
                return Self::default();
            }
        };
        match serde_json::from_str(&content) {
            Ok(config) => config,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to parse config, using defaults");
                Self::default()
            }
        }
    }

    pub fn save_to(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(path, json)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn refresh_config(&self) -> RefreshConfig {
        RefreshConfig {
            cooldown: Duration::from_millis(self.refresh_cooldown_ms),
            wait_timeout: Duration::from_millis(self.refresh_wait_timeout_ms),
            lead_time: Duration::from_secs(self.refresh_lead_secs),
        }
    }
}

/// Default config file location.
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("driftbox").join("config.json"))
}

fn data_dir() -> PathBuf {
    config_dir()
        .map(|d| d.join("driftbox"))
        .unwrap_or_else(|| PathBuf::from(".driftbox"))
}

fn default_download_root() -> PathBuf {
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."));
    home.join("Downloads").join("driftbox")
}
