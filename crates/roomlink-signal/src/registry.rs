//! Session registry: room lifecycle, membership, and history
//!
//! Each room lives behind its own mutex, so events for one room are
//! serialized while distinct rooms proceed in parallel. The room map itself
//! is only held long enough to clone a room handle; no room lock is ever
//! acquired while a map shard is locked.
//!
//! The sweep removes a room while holding its lock and marks it closed, so
//! an event that raced the sweep and already holds the handle sees the room
//! as gone instead of mutating a detached copy.
//!
//! All timestamps are unix milliseconds supplied by the caller.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info};

use roomlink_core::ids::{generate_room_id, normalize_room_id};
use roomlink_core::{
    ChatMessage, ErrorCode, FileInfo, FileRecord, FileView, PeerId, RoomId, SignalConfig,
};

use crate::history::StorageIndex;
use crate::room::Room;

/// Registry errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("room {0} not found")]
    RoomNotFound(RoomId),

    #[error("could not allocate a room id: {0}")]
    IdAllocation(String),
}

impl From<&RegistryError> for ErrorCode {
    fn from(e: &RegistryError) -> Self {
        match e {
            RegistryError::RoomNotFound(_) => ErrorCode::NotFound,
            RegistryError::IdAllocation(_) => ErrorCode::TransientIo,
        }
    }
}

/// A chat message as submitted by a client
#[derive(Debug, Clone)]
pub struct MessageDraft {
    pub id: String,
    pub text: String,
    /// Client timestamp; server time is used when absent
    pub sent_at: Option<u64>,
    pub persistent_author_id: Option<String>,
}

/// What a joining peer receives
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub room_id: RoomId,
    /// Members other than the joiner, in join order
    pub existing_peers: Vec<PeerId>,
    pub messages: Vec<ChatMessage>,
    pub files: Vec<FileView>,
}

/// A room a departing peer was removed from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub room_id: RoomId,
    pub remaining: Vec<PeerId>,
}

/// A file record dropped from a room, with the members to notify
#[derive(Debug, Clone)]
pub struct RemovedFile {
    pub room_id: RoomId,
    pub record: FileRecord,
    pub roster: Vec<PeerId>,
}

/// In-memory registry of live rooms
pub struct SessionRegistry {
    rooms: DashMap<RoomId, Arc<Mutex<Room>>>,
    storage: StorageIndex,
    config: SignalConfig,
}

impl SessionRegistry {
    pub fn new(config: SignalConfig) -> Self {
        Self {
            rooms: DashMap::new(),
            storage: StorageIndex::new(),
            config,
        }
    }

    pub fn config(&self) -> &SignalConfig {
        &self.config
    }

    /// Create a room with `creator` as its only member
    ///
    /// Retries on id collision; after `room_id_attempts` draws at one length
    /// the id grows by a character.
    pub fn create_room(&self, creator: &str, now: u64) -> Result<RoomId, RegistryError> {
        let attempts = self.config.room_id_attempts.max(1);

        for attempt in 0..attempts * 2 {
            let len = self.config.room_id_length + (attempt / attempts) as usize;
            let id = generate_room_id(len).map_err(|e| RegistryError::IdAllocation(e.to_string()))?;

            match self.rooms.entry(id.clone()) {
                Entry::Occupied(_) => {
                    debug!("Room id collision on {}, retrying", id);
                }
                Entry::Vacant(slot) => {
                    let room = Room::new(
                        id.clone(),
                        creator.to_string(),
                        self.config.message_history_limit,
                        now,
                    );
                    slot.insert(Arc::new(Mutex::new(room)));
                    info!("Room created: {} by {}", id, creator);
                    return Ok(id);
                }
            }
        }

        Err(RegistryError::IdAllocation("id space exhausted".into()))
    }

    /// Add `caller` to a room and return its history
    ///
    /// Joining twice is harmless. Records whose storage is gone are pruned
    /// from the room before the history is returned.
    pub fn join_room(
        &self,
        room_id: &str,
        caller: &str,
        now: u64,
    ) -> Result<JoinOutcome, RegistryError> {
        self.with_room(room_id, |room| {
            room.add_peer(caller);
            room.touch(now);

            let pruned = room.files.retain_stored(&self.storage);
            if pruned > 0 {
                debug!("Pruned {} unbacked file records from room {}", pruned, room.id);
            }

            JoinOutcome {
                room_id: room.id.clone(),
                existing_peers: room.others(caller),
                messages: room.messages.to_vec(),
                files: self
                    .storage
                    .annotate(&room.files, now, self.config.file_expiry_ms()),
            }
        })
    }

    /// Remove `peer` from every room it belongs to
    ///
    /// Rooms are never deleted for becoming empty; only the sweep deletes.
    pub fn leave(&self, peer: &str, now: u64) -> Vec<Departure> {
        let mut departures = Vec::new();

        for (room_id, handle) in self.snapshot() {
            let mut room = handle.lock();
            if room.is_closed() || !room.remove_peer(peer) {
                continue;
            }
            room.touch(now);
            debug!("Peer {} removed from room {}", peer, room_id);
            departures.push(Departure {
                room_id,
                remaining: room.peer_ids(),
            });
        }

        departures
    }

    /// Bump a room's activity. Returns false if the room does not exist.
    pub fn record_activity(&self, room_id: &str, now: u64) -> bool {
        self.with_room(room_id, |room| room.touch(now)).is_ok()
    }

    /// Append a chat message and return it with the room's roster
    pub fn post_message(
        &self,
        room_id: &str,
        sender: &str,
        draft: MessageDraft,
        now: u64,
    ) -> Result<(ChatMessage, Vec<PeerId>), RegistryError> {
        self.with_room(room_id, |room| {
            room.touch(now);
            let message = ChatMessage {
                id: draft.id,
                text: draft.text,
                sender_id: sender.to_string(),
                persistent_author_id: draft.persistent_author_id,
                sent_at: draft.sent_at.unwrap_or(now),
            };
            room.messages.push(message.clone());
            (message, room.peer_ids())
        })
    }

    /// Record a shared file and stamp its storage time
    pub fn share_file(
        &self,
        room_id: &str,
        sharer: &str,
        info: FileInfo,
        now: u64,
    ) -> Result<(FileRecord, Vec<PeerId>), RegistryError> {
        let expiry_ms = self.config.file_expiry_ms();
        self.with_room(room_id, |room| {
            room.touch(now);
            let record = FileRecord::from_info(info, sharer, now, expiry_ms);
            self.storage.record(&record.name, now);
            room.files.insert(record.clone());
            (record, room.peer_ids())
        })
    }

    /// Look up a file record without changing anything
    pub fn find_file(
        &self,
        room_id: &str,
        file_id: &str,
    ) -> Result<Option<FileRecord>, RegistryError> {
        self.with_room(room_id, |room| room.files.get(file_id).cloned())
    }

    /// Drop a file record and its storage timestamp
    pub fn remove_file(&self, room_id: &str, file_id: &str, now: u64) -> Option<RemovedFile> {
        self.with_room(room_id, |room| {
            room.touch(now);
            let record = room.files.remove(file_id)?;
            self.storage.remove(&record.name);
            Some(RemovedFile {
                room_id: room.id.clone(),
                record,
                roster: room.peer_ids(),
            })
        })
        .ok()
        .flatten()
    }

    /// Names of stored files older than the expiry window
    pub fn expired_files(&self, now: u64) -> Vec<String> {
        self.storage.expired(now, self.config.file_expiry_ms())
    }

    /// Drop every record stored under `name` from every room
    pub fn purge_file(&self, name: &str) -> Vec<RemovedFile> {
        let mut removed = Vec::new();

        for (room_id, handle) in self.snapshot() {
            let mut room = handle.lock();
            if room.is_closed() {
                continue;
            }
            let roster = room.peer_ids();
            for record in room.files.remove_by_name(name) {
                removed.push(RemovedFile {
                    room_id: room_id.clone(),
                    record,
                    roster: roster.clone(),
                });
            }
        }

        self.storage.remove(name);
        removed
    }

    /// Remove every room idle for longer than the expiry threshold
    pub fn sweep_expired(&self, now: u64) -> Vec<RoomId> {
        let timeout_ms = self.config.room_expiry_ms();
        let mut removed = Vec::new();

        for (room_id, handle) in self.snapshot() {
            let mut room = handle.lock();
            if room.is_closed() || !room.is_idle(now, timeout_ms) {
                continue;
            }

            room.close();
            self.rooms
                .remove_if(&room_id, |_, current| Arc::ptr_eq(current, &handle));
            info!(
                "Room {} removed (idle for {} min)",
                room_id,
                now.saturating_sub(room.last_activity()) / 60_000
            );
            removed.push(room_id);
        }

        removed
    }

    /// Current roster of a room
    pub fn roster(&self, room_id: &str) -> Option<Vec<PeerId>> {
        self.with_room(room_id, |room| room.peer_ids()).ok()
    }

    /// Current message history of a room
    pub fn messages(&self, room_id: &str) -> Option<Vec<ChatMessage>> {
        self.with_room(room_id, |room| room.messages.to_vec()).ok()
    }

    pub fn contains(&self, room_id: &str) -> bool {
        self.rooms.contains_key(&normalize_room_id(room_id))
    }

    /// Get room count (for monitoring)
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Number of distinct stored file names
    pub fn stored_file_count(&self) -> usize {
        self.storage.len()
    }

    /// Run `f` with exclusive access to a live room
    ///
    /// The id is normalized first, so every operation accepts the same
    /// spellings as a join.
    fn with_room<T>(
        &self,
        room_id: &str,
        f: impl FnOnce(&mut Room) -> T,
    ) -> Result<T, RegistryError> {
        let room_id = normalize_room_id(room_id);
        let handle = self
            .rooms
            .get(&room_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| RegistryError::RoomNotFound(room_id.clone()))?;

        let mut room = handle.lock();
        if room.is_closed() {
            return Err(RegistryError::RoomNotFound(room_id));
        }
        Ok(f(&mut room))
    }

    fn snapshot(&self) -> Vec<(RoomId, Arc<Mutex<Room>>)> {
        self.rooms
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect()
    }
}
