//! Node configuration
//!
//! One immutable value, loaded from `config.json` at startup and passed
//! by handle to every component. A missing file is created with defaults;
//! an unusable public host is fatal here and nowhere else.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

use crate::net::host::normalize_host;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("`host` must be set to this node's public address")]
    MissingHost,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// This node's public address, as peers reach it.
    pub host: String,
    pub identity_path: PathBuf,
    pub storage: StorageConfig,
    pub network: NetworkConfig,
    pub sync: SyncConfig,
    pub rate_limits: RateLimitsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: String::new(),
            identity_path: PathBuf::from("./privatekey.pem"),
            storage: StorageConfig::default(),
            network: NetworkConfig::default(),
            sync: SyncConfig::default(),
            rate_limits: RateLimitsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub files_dir: PathBuf,
    pub max_storage_gb: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/db"),
            files_dir: PathBuf::from("./data/files"),
            max_storage_gb: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub timeout_ms: u64,
    pub broadcast_concurrency: usize,
    /// Talk to peers over plain HTTP. Development only.
    pub insecure_http: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 15_000,
            broadcast_concurrency: 10,
            insecure_http: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// How often the gossip timer fires, and how old a peer's last sync
    /// must be before it is due again.
    pub interval_secs: u64,
    pub page_limit: usize,
    pub files: FileSyncConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: 600,
            page_limit: 500,
            files: FileSyncConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileSyncConfig {
    pub enabled: bool,
    /// Latency budget for a holder to count as reachable.
    pub ping_budget_ms: u64,
    /// Replicate while coverage is at or below this percentage.
    pub coverage_target_percent: u32,
    pub max_size_mb: u64,
}

impl Default for FileSyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ping_budget_ms: 500,
            coverage_target_percent: 50,
            max_size_mb: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitsConfig {
    pub window_ms: u64,
    pub ip_limit: u32,
    pub signature_limit: u32,
    pub trust_proxy: bool,
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            ip_limit: 30,
            signature_limit: 120,
            trust_proxy: true,
        }
    }
}

impl Config {
    /// Load the config, writing a default file when none exists. The
    /// `host` field is validated and stored in normalized form.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            let default = Self::default();
            std::fs::write(path, serde_json::to_string_pretty(&default)?)?;
            info!("wrote default config to {}", path.display());
        }

        let raw = std::fs::read_to_string(path)?;
        let mut config: Config = serde_json::from_str(&raw)?;

        let host = normalize_host(&config.host).ok_or(ConfigError::MissingHost)?;
        config.host = host;
        Ok(config)
    }

    /// Base URL for reaching a peer.
    pub fn peer_url(&self, host: &str, path: &str) -> String {
        let scheme = if self.network.insecure_http {
            "http"
        } else {
            "https"
        };
        format!("{scheme}://{host}{path}")
    }

    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.network.timeout_ms)
    }

    /// Limiter settings for the inbound request layer.
    pub fn rate_limit_config(&self) -> crate::net::RateLimitConfig {
        crate::net::RateLimitConfig {
            window: std::time::Duration::from_millis(self.rate_limits.window_ms),
            ip_limit: self.rate_limits.ip_limit,
            signature_limit: self.rate_limits.signature_limit,
            trust_proxy: self.rate_limits.trust_proxy,
        }
    }

    pub fn sync_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sync.interval_secs)
    }

    pub fn ping_budget(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.sync.files.ping_budget_ms)
    }

    pub fn max_file_bytes(&self) -> u64 {
        self.sync.files.max_size_mb * 1024 * 1024
    }

    pub fn max_storage_bytes(&self) -> u64 {
        self.storage.max_storage_gb * 1024 * 1024 * 1024
    }
}
