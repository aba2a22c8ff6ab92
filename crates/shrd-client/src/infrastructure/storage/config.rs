//! TOML configuration for the shared device client.
//!
//! ```toml
//! [remote]
//! host = "dasd-host.example"
//! port = 3990
//! devnum = "0190"
//!
//! [retry]
//! max_retries = 10
//! retry_delay_ms = 100
//!
//! [compression]
//! enabled = true
//! level = 6
//!
//! [cache]
//! slots = 64
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shrd_core::domain::device::DevAddrError;
use shrd_core::protocol::DEFAULT_PORT;
use shrd_core::DevAddr;
use thiserror::Error;

use crate::infrastructure::network::EngineConfig;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error(transparent)]
    Device(#[from] DevAddrError),
}

// ── Config schema types ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub compression: CompressionConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

/// Which server and device to use.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Device address on the server, `[lcss:]devnum` in hex.
    #[serde(default = "default_devnum")]
    pub devnum: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompressionConfig {
    #[serde(default)]
    pub enabled: bool,
    /// zlib level 1-9.
    #[serde(default = "default_level")]
    pub level: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    #[serde(default = "default_slots")]
    pub slots: usize,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_devnum() -> String {
    "0:0000".to_string()
}
fn default_max_retries() -> u32 {
    10
}
fn default_retry_delay_ms() -> u64 {
    100
}
fn default_level() -> u8 {
    6
}
fn default_slots() -> usize {
    64
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            devnum: default_devnum(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            level: default_level(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            slots: default_slots(),
        }
    }
}

impl ClientConfig {
    /// Builds the request engine settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Device`] if `remote.devnum` is malformed.
    pub fn engine_config(&self) -> Result<EngineConfig, ConfigError> {
        let addr: DevAddr = self.remote.devnum.parse()?;
        Ok(EngineConfig {
            addr: format!("{}:{}", self.remote.host, self.remote.port),
            devnum: addr.devnum,
            max_retries: self.retry.max_retries,
            retry_delay: Duration::from_millis(self.retry.retry_delay_ms),
            compression_level: self.compression.enabled.then_some(self.compression.level.min(9)),
        })
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Loads the configuration at `path`, or the defaults if it does not exist.
///
/// # Errors
///
/// [`ConfigError::Io`] for file-system errors other than "not found",
/// [`ConfigError::Parse`] for malformed TOML.
pub fn load_config(path: &Path) -> Result<ClientConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ClientConfig::default()),
        Err(e) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Writes `config` to `path`.
///
/// # Errors
///
/// [`ConfigError::Io`] or [`ConfigError::Serialize`].
pub fn save_config(path: &Path, config: &ClientConfig) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}
