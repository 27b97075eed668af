//! Core type definitions for Roomlink
//!
//! These types travel over the signaling channel and are shared by the
//! server and the client.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Connection id assigned to a peer by the signal server
pub type PeerId = String;

/// Short code identifying a room
pub type RoomId = String;

/// Current wall-clock time in unix milliseconds
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Kind of a session description
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Session description exchanged during negotiation
///
/// The relay treats the `sdp` body as opaque.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Network reachability descriptor
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }
}

/// A chat message stored in a room's history
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Client-chosen message id
    pub id: String,
    pub text: String,
    /// Connection id of the sender
    pub sender_id: PeerId,
    /// Author id that survives reconnects (browser-local identity)
    #[serde(default)]
    pub persistent_author_id: Option<String>,
    /// Unix millis; client-supplied or server time
    pub sent_at: u64,
}

/// File metadata announced by a client after uploading to the blob store
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub id: String,
    pub name: String,
    pub size: u64,
    #[serde(default)]
    pub media_type: Option<String>,
}

/// A shared file as recorded in a room's history
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: String,
    pub name: String,
    pub size: u64,
    #[serde(default)]
    pub media_type: Option<String>,
    /// Where the bytes can be fetched from the blob store
    pub retrieval_handle: String,
    pub uploaded_at: u64,
    pub expires_at: u64,
    pub sharing_peer_id: PeerId,
}

impl FileRecord {
    /// Retrieval handle for a blob stored under `name`
    pub fn handle_for(name: &str) -> String {
        format!("/download/{}", name)
    }

    /// Build a record from client metadata, stamped at `now`
    pub fn from_info(info: FileInfo, sharing_peer_id: &str, now: u64, expiry_ms: u64) -> Self {
        let retrieval_handle = Self::handle_for(&info.name);
        Self {
            id: info.id,
            name: info.name,
            size: info.size,
            media_type: info.media_type,
            retrieval_handle,
            uploaded_at: now,
            expires_at: now.saturating_add(expiry_ms),
            sharing_peer_id: sharing_peer_id.to_string(),
        }
    }
}

/// A file record annotated at read time with its expiry status
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileView {
    #[serde(flatten)]
    pub record: FileRecord,
    pub is_expired: bool,
}
