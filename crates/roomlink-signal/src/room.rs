//! Room state for the signal server

use roomlink_core::{PeerId, RoomId};

use crate::history::{FileLog, MessageLog};

/// A room where peers can discover each other and share history
///
/// All mutation goes through the registry, which holds each room behind its
/// own lock. Timestamps are unix milliseconds.
#[derive(Debug)]
pub struct Room {
    /// Room id (short code)
    pub id: RoomId,

    /// Peer that created the room
    creator_id: PeerId,

    /// Current members in join order
    roster: Vec<PeerId>,

    /// When the room was created
    created_at: u64,

    /// Last activity time
    last_activity: u64,

    /// Bounded chat history
    pub messages: MessageLog,

    /// Shared file records
    pub files: FileLog,

    /// Set by the sweep once the room has been removed from the registry
    closed: bool,
}

impl Room {
    /// Create a new room with `creator_id` as its only member
    pub fn new(id: RoomId, creator_id: PeerId, history_limit: usize, now: u64) -> Self {
        Self {
            id,
            roster: vec![creator_id.clone()],
            creator_id,
            created_at: now,
            last_activity: now,
            messages: MessageLog::new(history_limit),
            files: FileLog::new(),
            closed: false,
        }
    }

    /// Add a peer to the room. Returns false if it was already a member.
    pub fn add_peer(&mut self, peer_id: &str) -> bool {
        if self.contains(peer_id) {
            return false;
        }
        self.roster.push(peer_id.to_string());
        true
    }

    /// Remove a peer from the room. Returns false if it was not a member.
    pub fn remove_peer(&mut self, peer_id: &str) -> bool {
        let before = self.roster.len();
        self.roster.retain(|p| p != peer_id);
        self.roster.len() != before
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.roster.iter().any(|p| p == peer_id)
    }

    /// Get all peer IDs
    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.roster.clone()
    }

    /// Peer IDs other than `peer_id`
    pub fn others(&self, peer_id: &str) -> Vec<PeerId> {
        self.roster.iter().filter(|p| *p != peer_id).cloned().collect()
    }

    /// Number of peers in the room
    pub fn peer_count(&self) -> usize {
        self.roster.len()
    }

    /// Check if the room is empty
    pub fn is_empty(&self) -> bool {
        self.roster.is_empty()
    }

    pub fn creator_id(&self) -> &str {
        &self.creator_id
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn last_activity(&self) -> u64 {
        self.last_activity
    }

    /// Check if the room has been idle for longer than `timeout_ms`
    pub fn is_idle(&self, now: u64, timeout_ms: u64) -> bool {
        now.saturating_sub(self.last_activity) > timeout_ms
    }

    /// Update last activity time
    pub fn touch(&mut self, now: u64) {
        self.last_activity = self.last_activity.max(now);
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
