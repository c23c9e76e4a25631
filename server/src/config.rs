//! Server configuration

use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Storage driver kinds that can be configured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// Append-only raw-trade log (trade format)
    Files,
    /// OHLCV bar store (point format)
    Bars,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen host
    pub host: String,
    /// Listen port; 0 means none configured
    pub port: u16,
    /// Enable trade collection into the persistence buffer
    pub collect: bool,
    /// Storage drivers in order; the first is primary for the API
    pub storage: Vec<StorageKind>,
    /// Directory holding driver state
    pub storage_dir: PathBuf,
    /// Native bucket width of the bar store, ms
    pub bar_resolution: u64,
    /// Interval between wall-clock-aligned flushes, ms
    pub backup_interval: u64,
    /// Enable WebSocket fan-out
    pub broadcast: bool,
    /// Merge same-(timestamp, side) bursts before broadcasting
    pub broadcast_aggr: bool,
    /// Debounced broadcast tick, ms; 0 disables debouncing.
    /// Mutually exclusive with `broadcast_aggr`.
    pub broadcast_debounce: u64,
    /// Enable the historical HTTP API
    pub api: bool,
    /// Enable per-IP rate limiting
    pub enable_rate_limit: bool,
    /// Rate limit window, ms
    pub rate_limit_time_window: u64,
    /// Requests allowed per window
    pub rate_limit_max: u32,
    /// Origin allow pattern (regex); unset allows any origin
    pub origin: Option<String>,
    /// Maximum number of bars a point-format query may span
    pub max_fetch_length: u64,
    /// Activity monitor tick, ms
    pub monitor_interval: u64,
    /// Base stall threshold before rate adaptation, ms
    pub reconnection_threshold: u64,
    /// Pairs to subscribe on startup
    pub pairs: Vec<String>,
    /// Newline-delimited banned IP list, reloaded on change
    pub banned_ips_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            collect: true,
            storage: vec![StorageKind::Files],
            storage_dir: PathBuf::from("./data"),
            bar_resolution: 10_000,
            backup_interval: 10_000,
            broadcast: true,
            broadcast_aggr: true,
            broadcast_debounce: 0,
            api: true,
            enable_rate_limit: false,
            rate_limit_time_window: 15_000,
            rate_limit_max: 30,
            origin: None,
            max_fetch_length: 100_000,
            monitor_interval: 10_000,
            reconnection_threshold: 60_000,
            pairs: Vec::new(),
            banned_ips_path: PathBuf::from("./banned.txt"),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// The address the HTTP server binds
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Reject configurations the server cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.api && self.port == 0 {
            anyhow::bail!("historical API is enabled but no port is configured");
        }
        if self.broadcast_aggr && self.broadcast_debounce > 0 {
            anyhow::bail!("broadcast_aggr and broadcast_debounce are mutually exclusive");
        }
        if self.backup_interval == 0 {
            anyhow::bail!("backup_interval must be positive");
        }
        Ok(())
    }
}
