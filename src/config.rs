//! Application configuration
//!
//! Loaded from a TOML file in the platform config directory. Every field has
//! a default, so a partial (or missing) file is fine.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::ConfigError;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub link: LinkConfig,
    pub bridge: BridgeConfig,
}

/// Socket and retry-loop parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LinkConfig {
    /// Listen port for DIRECT mode
    pub port: u16,
    /// Interface the DIRECT listener binds to
    pub bind_address: IpAddr,
    /// How long one accept attempt waits for a peer
    pub accept_timeout_ms: u64,
    /// How long one tunnel connect attempt waits
    pub connect_timeout_ms: u64,
    /// Socket read/write timeout while connected
    pub io_timeout_ms: u64,
    /// Maximum bytes read from the socket per chunk
    pub chunk_size: usize,
    /// Device discovery / reconnect poll interval
    pub poll_interval_ms: u64,
    /// Backoff when the socket or queue has nothing to move
    pub idle_backoff_ms: u64,
    /// Backoff after a failed write
    pub write_backoff_ms: u64,
    /// Consecutive timed-out writes tolerated before the link is dropped
    pub max_write_retries: u32,
    /// Upper bound on waiting for a worker thread to exit
    pub join_timeout_ms: u64,
    /// Drop the oldest queued chunk beyond this many (unbounded if unset)
    pub max_queued_chunks: Option<usize>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind_address: IpAddr::from([0, 0, 0, 0]),
            accept_timeout_ms: ACCEPT_TIMEOUT_MS,
            connect_timeout_ms: CONNECT_TIMEOUT_MS,
            io_timeout_ms: IO_TIMEOUT_MS,
            chunk_size: CHUNK_SIZE,
            poll_interval_ms: POLL_INTERVAL_MS,
            idle_backoff_ms: IDLE_BACKOFF_MS,
            write_backoff_ms: WRITE_BACKOFF_MS,
            max_write_retries: MAX_WRITE_RETRIES,
            join_timeout_ms: JOIN_TIMEOUT_MS,
            max_queued_chunks: None,
        }
    }
}

impl LinkConfig {
    /// How long one accept attempt waits for a peer
    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms)
    }

    /// How long one tunnel connect attempt waits
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Socket read/write timeout
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    /// Pause between discovery polls
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Pause after an empty read or dequeue
    pub fn idle_backoff(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_ms)
    }

    /// Pause after a timed-out write
    pub fn write_backoff(&self) -> Duration {
        Duration::from_millis(self.write_backoff_ms)
    }

    /// Longest wait for a thread to stop
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

/// External device-bridge (adb) settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    /// Path or name of the adb executable
    pub adb_path: PathBuf,
    /// Port on this machine the forward listens on
    pub local_port: u16,
    /// Port on the device the forward targets
    pub remote_port: u16,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            adb_path: PathBuf::from("adb"),
            local_port: DEFAULT_PORT,
            remote_port: DEFAULT_PORT,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the platform config directory, or fall back to defaults
    /// when no config file exists yet
    pub fn load_or_default() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) if path.exists() => {
                tracing::info!("Loading config from {}", path.display());
                Self::load(path)
            }
            _ => Ok(Self::default()),
        }
    }

    /// Write configuration as TOML
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let text = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Read {
                path: parent.display().to_string(),
                source,
            })?;
        }
        std::fs::write(path, text).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })
    }

    /// `<config dir>/audio-link/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "audio-link").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Reject values that would make the retry or pump loops spin or stall
    pub fn validate(&self) -> Result<(), ConfigError> {
        let link = &self.link;
        if link.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be positive".into()));
        }
        for (name, value) in [
            ("accept_timeout_ms", link.accept_timeout_ms),
            ("connect_timeout_ms", link.connect_timeout_ms),
            ("io_timeout_ms", link.io_timeout_ms),
            ("poll_interval_ms", link.poll_interval_ms),
            ("join_timeout_ms", link.join_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be positive", name)));
            }
        }
        if link.max_queued_chunks == Some(0) {
            return Err(ConfigError::Invalid("max_queued_chunks must be positive".into()));
        }
        Ok(())
    }
}
