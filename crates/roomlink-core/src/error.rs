//! Error types shared by the signal server and the peer client

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Protocol-level errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("deserialization failed: {0}")]
    Deserialization(String),

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: u64, max: u64 },

    #[error("invalid file name: {0}")]
    InvalidName(String),
}

impl From<bincode::Error> for ProtocolError {
    fn from(e: bincode::Error) -> Self {
        ProtocolError::Deserialization(e.to_string())
    }
}

/// Wire error codes (sent to clients inside `error` events)
///
/// Every failure in the system falls into one of these four classes. None
/// of them is fatal to the relay or the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Unexpected or malformed signaling message; logged and dropped
    ProtocolViolation,
    /// Room, file or peer absent
    NotFound,
    /// Payload exceeds a configured cap; rejected before any state exists
    ResourceLimit,
    /// Storage write/delete failure; the user may retry
    TransientIo,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::ProtocolViolation => "protocol_violation",
            ErrorCode::NotFound => "not_found",
            ErrorCode::ResourceLimit => "resource_limit",
            ErrorCode::TransientIo => "transient_io",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&ProtocolError> for ErrorCode {
    fn from(e: &ProtocolError) -> Self {
        match e {
            ProtocolError::Serialization(_) => ErrorCode::ProtocolViolation,
            ProtocolError::Deserialization(_) => ErrorCode::ProtocolViolation,
            ProtocolError::PayloadTooLarge { .. } => ErrorCode::ResourceLimit,
            ProtocolError::InvalidName(_) => ErrorCode::ProtocolViolation,
        }
    }
}
