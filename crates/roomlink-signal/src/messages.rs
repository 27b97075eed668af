//! Signal protocol messages
//!
//! JSON over WebSocket, one message per text frame, tagged by `type`.

use serde::{Deserialize, Serialize};

use roomlink_core::{
    ChatMessage, ErrorCode, FileInfo, FileRecord, FileView, IceCandidate, PeerId, RoomId,
    SessionDescription,
};

/// Messages sent by a client to the signal server
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Create a new room with the sender as its only member
    CreateRoom,

    /// Join an existing room
    JoinRoom { room_id: RoomId },

    /// Leave every room the sender is in
    LeaveRoom,

    /// Post a chat message to a room
    SendMessage {
        room_id: RoomId,
        message: String,
        #[serde(default)]
        timestamp: Option<u64>,
        id: String,
        #[serde(default)]
        persistent_user_id: Option<String>,
    },

    /// Session offer for `peer_id`
    Offer {
        room_id: RoomId,
        peer_id: PeerId,
        offer: SessionDescription,
    },

    /// Session answer for `peer_id`
    Answer {
        room_id: RoomId,
        peer_id: PeerId,
        answer: SessionDescription,
    },

    /// Reachability candidate for `peer_id`
    IceCandidate {
        room_id: RoomId,
        peer_id: PeerId,
        candidate: IceCandidate,
    },

    /// Announce a file uploaded to the blob store
    FileShared { room_id: RoomId, file_info: FileInfo },

    /// Remove a shared file from the room and the blob store
    FileRemoveRequest {
        room_id: RoomId,
        file_id: String,
        file_name: String,
    },

    /// Client-side diagnostics to be written to the server log
    ClientLog {
        #[serde(default)]
        level: LogLevel,
        message: String,
    },

    /// Ping for keepalive
    Ping { timestamp: u64 },
}

/// Messages sent by the signal server to a client
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Sent once on connect with the connection id assigned to the client
    Welcome { peer_id: PeerId },

    RoomCreated { room_id: RoomId },

    RoomJoined { room_id: RoomId },

    MessageHistory { messages: Vec<ChatMessage> },

    FileHistory { files: Vec<FileView> },

    /// Another peer is reachable through the room
    NewPeer { peer_id: PeerId },

    /// A peer left the room
    PeerDisconnect { peer_id: PeerId },

    ReceiveMessage(ChatMessage),

    /// Relayed offer; `peer_id` is the sender
    Offer {
        peer_id: PeerId,
        offer: SessionDescription,
    },

    /// Relayed answer; `peer_id` is the sender
    Answer {
        peer_id: PeerId,
        answer: SessionDescription,
    },

    /// Relayed candidate; `peer_id` is the sender
    IceCandidate {
        peer_id: PeerId,
        candidate: IceCandidate,
    },

    NewFileRecord(FileRecord),

    FileRemoved {
        file_id: String,
        file_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<RemovalReason>,
    },

    /// Error response
    Error { code: ErrorCode, message: String },

    /// Pong response
    Pong { timestamp: u64 },
}

/// Why a file disappeared without an explicit request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemovalReason {
    Expired,
}

/// Severity of a client-reported log line
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[default]
    Info,
    Warn,
    Error,
}

impl ClientMessage {
    /// Parse from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl ServerMessage {
    /// Create an error message
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }

    /// Parse from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
