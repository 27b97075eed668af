//! Configuration system for Roomlink
//!
//! Supports TOML configuration files with sensible defaults.
//! Configuration is loaded from:
//! - macOS: ~/Library/Application Support/roomlink/config.toml
//! - Linux: ~/.config/roomlink/config.toml
//! - Windows: %APPDATA%/roomlink/config.toml

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::ids::ROOM_ID_LENGTH;
use crate::{
    CHUNK_SIZE, FILE_EXPIRY_SECS, MAX_PAYLOAD_BYTES, MESSAGE_HISTORY_LIMIT, ROOM_EXPIRY_SECS,
};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Signal server settings
    pub signal: SignalConfig,
    /// Peer client settings
    pub client: ClientConfig,
}

/// Signal server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    /// Signal server port
    pub port: u16,
    /// Bind address
    pub bind: IpAddr,
    /// Room inactivity before the sweep removes it, in seconds
    pub room_expiry_secs: u64,
    /// Interval between room sweeps, in seconds
    pub room_sweep_interval_secs: u64,
    /// Chat messages retained per room
    pub message_history_limit: usize,
    /// Age at which a stored file expires, in seconds
    pub file_expiry_secs: u64,
    /// Interval between file sweeps, in seconds
    pub file_sweep_interval_secs: u64,
    /// Largest accepted upload
    pub max_upload_bytes: u64,
    /// Blob directory (None = in-memory blob store)
    pub blob_dir: Option<PathBuf>,
    /// Room id draws before the id is lengthened
    pub room_id_attempts: u32,
    /// Length of generated room ids
    pub room_id_length: usize,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            room_expiry_secs: ROOM_EXPIRY_SECS,
            room_sweep_interval_secs: 60 * 60,
            message_history_limit: MESSAGE_HISTORY_LIMIT,
            file_expiry_secs: FILE_EXPIRY_SECS,
            file_sweep_interval_secs: 60 * 60,
            max_upload_bytes: MAX_PAYLOAD_BYTES,
            blob_dir: None,
            room_id_attempts: 8,
            room_id_length: ROOM_ID_LENGTH,
        }
    }
}

impl SignalConfig {
    pub fn room_expiry_ms(&self) -> u64 {
        self.room_expiry_secs.saturating_mul(1000)
    }

    pub fn file_expiry_ms(&self) -> u64 {
        self.file_expiry_secs.saturating_mul(1000)
    }
}

/// Peer client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// WebSocket URL of the signal server
    pub signal_url: String,
    /// Stall timeout for an unanswered local offer (0 = disabled)
    pub negotiation_timeout_secs: u64,
    /// Transfer chunk size in bytes
    pub chunk_size: usize,
    /// Largest payload sent or accepted over a direct channel
    pub max_transfer_bytes: u64,
    /// STUN/TURN urls for the direct transport
    pub ice_servers: Vec<String>,
    /// Where files received from peers are written
    pub download_dir: PathBuf,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            signal_url: "ws://127.0.0.1:3000".into(),
            negotiation_timeout_secs: 30,
            chunk_size: CHUNK_SIZE,
            max_transfer_bytes: MAX_PAYLOAD_BYTES,
            ice_servers: vec![
                "stun:stun.l.google.com:19302".into(),
                "stun:stun.cloudflare.com:3478".into(),
            ],
            download_dir: PathBuf::from("."),
        }
    }
}

impl ClientConfig {
    pub fn negotiation_timeout(&self) -> Option<Duration> {
        match self.negotiation_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Self {
        match Self::default_path() {
            Some(path) => Self::load_from(&path).unwrap_or_else(|e| {
                warn!("Failed to load config from {:?}: {}, using defaults", path, e);
                Self::default()
            }),
            None => {
                debug!("No config directory found, using defaults");
                Self::default()
            }
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "roomlink", "roomlink")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Generate a sample configuration file content
    pub fn sample() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}

/// Configuration errors
#[derive(Debug, Clone)]
pub enum ConfigError {
    /// I/O error
    Io(String),
    /// Parse error
    Parse(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "I/O error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}
