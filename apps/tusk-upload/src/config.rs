//! Uploader configuration management.
//!
//! Configuration is stored as TOML:
//! - Linux: `~/.config/tusk/upload.toml`
//! - Windows: `%APPDATA%/tusk/upload.toml`
//!
//! Credentials are never stored here; `token_env` names the environment
//! variable the bearer token is read from.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tusk_client::{ChunkSize, RetryPolicy, UploadOptions};

/// Uploader configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Where uploads are created.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Bytes per PATCH request (0 = whole file in one request).
    #[serde(default)]
    pub chunk_size: u64,

    /// Backoff delays in milliseconds, one per consecutive failure.
    #[serde(default = "default_retry_delays")]
    pub retry_delays_ms: Vec<u64>,

    /// Environment variable holding the bearer token.
    #[serde(default = "default_token_env")]
    pub token_env: String,

    /// Send `Upload-Checksum` with every chunk.
    #[serde(default)]
    pub checksums: bool,

    /// Resume uploads recorded by earlier runs.
    #[serde(default = "default_true")]
    pub resume: bool,

    /// Ask the server to delete an upload when it is discarded.
    #[serde(default = "default_true")]
    pub terminate_on_discard: bool,

    /// Seconds a request may go without progress.
    #[serde(default = "default_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Where upload URLs are remembered between runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_path: Option<PathBuf>,

    /// Extra `Upload-Metadata` entries. `filename` is added automatically.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

fn default_endpoint() -> String {
    "http://localhost:1080/files/".into()
}

fn default_retry_delays() -> Vec<u64> {
    vec![0, 1000, 3000, 5000]
}

fn default_token_env() -> String {
    "TUSK_TOKEN".into()
}

fn default_true() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            chunk_size: 0,
            retry_delays_ms: default_retry_delays(),
            token_env: default_token_env(),
            checksums: false,
            resume: default_true(),
            terminate_on_discard: default_true(),
            request_timeout_secs: default_timeout_secs(),
            store_path: None,
            metadata: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Loads configuration.
    ///
    /// An explicit path must exist. Without one, the default location is
    /// used and created with default values on first run.
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = explicit {
            return Self::load_from(path);
        }

        let path = config_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            let config = Config::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read {}: {e}", path.display()))?;
        let config: Config = toml::from_str(&content)?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// URL store location, defaulting next to the config file.
    pub fn store_path(&self) -> anyhow::Result<PathBuf> {
        match &self.store_path {
            Some(p) => Ok(p.clone()),
            None => Ok(config_dir()?.join("uploads.json")),
        }
    }

    /// Session options for this configuration. Headers are added by the caller.
    pub fn upload_options(&self) -> UploadOptions {
        let mut options = UploadOptions::new(self.endpoint.clone())
            .with_chunk_size(ChunkSize::bytes(self.chunk_size))
            .with_retry(RetryPolicy::from_millis(&self.retry_delays_ms))
            .with_checksums(self.checksums)
            .with_terminate_on_discard(self.terminate_on_discard)
            .with_request_timeout(Duration::from_secs(self.request_timeout_secs));
        for (key, value) in &self.metadata {
            options = options.with_metadata(key.clone(), value.clone());
        }
        options
    }
}

fn config_dir() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        Ok(PathBuf::from(home).join(".config").join("tusk"))
    }

    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        Ok(PathBuf::from(appdata).join("tusk"))
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        Ok(PathBuf::from("/tmp/tusk"))
    }
}

/// Returns the platform-specific configuration file path.
fn config_path() -> anyhow::Result<PathBuf> {
    Ok(config_dir()?.join("upload.toml"))
}
