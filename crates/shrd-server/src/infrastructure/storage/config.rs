//! TOML configuration for the shared device server.
//!
//! # Example
//!
//! ```toml
//! [server]
//! bind_address = "0.0.0.0"
//! port = 3990
//! log_level = "info"
//!
//! [sharing]
//! max_sessions = 8
//! idle_timeout_secs = 0      # 0 never reaps idle sessions
//! poll_interval_ms = 500
//!
//! [[devices]]
//! devnum = "0190"
//! kind = "ckd"
//! path = "/var/lib/shrd/3390.img"
//! units = 150
//! unit_size = 56832
//! ```
//!
//! Every field has a default, so a missing file or a partial one still
//! yields a usable configuration.  A device without `path` is kept in memory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shrd_core::protocol::DEFAULT_PORT;
use shrd_core::domain::device::DevAddrError;
use shrd_core::{DevAddr, DevNum, DeviceKind};
use thiserror::Error;

use crate::infrastructure::registry::SharingSettings;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A device entry is unusable.
    #[error("invalid device entry {devnum}: {reason}")]
    InvalidDevice { devnum: String, reason: String },
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ListenConfig,
    #[serde(default)]
    pub sharing: SharingConfig,
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
}

/// Listener and process settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListenConfig {
    /// IP address to bind to.  `"0.0.0.0"` binds all interfaces.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// `tracing` level used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Entries kept in the request trace ring; 0 disables tracing.
    #[serde(default)]
    pub trace_size: usize,
}

/// Sharing parameters, see [`SharingSettings`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SharingConfig {
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Seconds a session may stay idle; 0 keeps idle sessions forever.
    #[serde(default)]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_purge_list_capacity")]
    pub purge_list_capacity: usize,
    #[serde(default = "default_cache_slots")]
    pub cache_slots: usize,
    #[serde(default = "default_compression_level")]
    pub compression_level: u8,
}

/// One device offered for sharing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceEntry {
    /// Device number in hex, e.g. `"0190"` or `"0:0190"`.
    pub devnum: String,
    pub kind: DeviceKind,
    /// Image file; absent means an in-memory device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Number of tracks (CKD) or blocks (FBA).
    pub units: u32,
    /// Bytes per track or block.
    pub unit_size: u32,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_max_sessions() -> usize {
    8
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_purge_list_capacity() -> usize {
    16
}
fn default_cache_slots() -> usize {
    64
}
fn default_compression_level() -> u8 {
    9
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            log_level: default_log_level(),
            trace_size: 0,
        }
    }
}

impl Default for SharingConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            idle_timeout_secs: 0,
            poll_interval_ms: default_poll_interval_ms(),
            purge_list_capacity: default_purge_list_capacity(),
            cache_slots: default_cache_slots(),
            compression_level: default_compression_level(),
        }
    }
}

impl SharingConfig {
    pub fn to_settings(&self) -> SharingSettings {
        SharingSettings {
            max_sessions: self.max_sessions,
            idle_timeout: (self.idle_timeout_secs > 0)
                .then(|| Duration::from_secs(self.idle_timeout_secs)),
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            purge_list_capacity: self.purge_list_capacity,
            cache_slots: self.cache_slots,
            compression_level: self.compression_level.min(9),
        }
    }
}

impl DeviceEntry {
    /// Parses `devnum`, accepting an optional `lcss:` prefix.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidDevice`] for a malformed address or a
    /// zero-sized geometry.
    pub fn devnum(&self) -> Result<DevNum, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidDevice {
            devnum: self.devnum.clone(),
            reason,
        };
        let addr: DevAddr = self.devnum.parse().map_err(|e: DevAddrError| invalid(e.to_string()))?;
        if self.units == 0 || self.unit_size == 0 {
            return Err(invalid("units and unit_size must be non-zero".into()));
        }
        Ok(addr.devnum)
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Loads the configuration at `path`, returning the defaults if the file
/// does not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: &Path) -> Result<ServerConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ServerConfig::default()),
        Err(e) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Writes `config` to `path`, creating the parent directory if needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] or [`ConfigError::Serialize`].
pub fn save_config(path: &Path, config: &ServerConfig) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
