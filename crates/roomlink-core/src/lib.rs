//! Roomlink Core - Shared types, protocol definitions, and configuration
//!
//! This crate contains the foundational types used by both the signal
//! server and the peer client. It has no dependencies on networking code.

pub mod config;
pub mod error;
pub mod ids;
pub mod path;
pub mod transfer;
pub mod types;

pub use config::{ClientConfig, Config, ConfigError, SignalConfig};
pub use error::*;
pub use types::*;

/// Transfer chunk size in bytes (16 KB)
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Largest payload accepted for upload or direct transfer (50 MB)
pub const MAX_PAYLOAD_BYTES: u64 = 50 * 1024 * 1024;

/// Number of chat messages retained per room
pub const MESSAGE_HISTORY_LIMIT: usize = 100;

/// Inactivity after which a room is swept (48 hours)
pub const ROOM_EXPIRY_SECS: u64 = 48 * 60 * 60;

/// Age after which a stored file expires (7 days)
pub const FILE_EXPIRY_SECS: u64 = 7 * 24 * 60 * 60;

/// Maximum filename length in bytes
pub const MAX_FILENAME_LEN: usize = 255;
