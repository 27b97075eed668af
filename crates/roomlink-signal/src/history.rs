//! Per-room message and file history
//!
//! Messages are kept in a bounded log. File records are kept until removed
//! explicitly or until the file sweep finds their storage timestamp too old.
//! Whether a record is still backed by storage is answered by the
//! [`StorageIndex`], which is shared by all rooms and keyed by file name.

use std::collections::VecDeque;

use dashmap::DashMap;

use roomlink_core::{ChatMessage, FileRecord, FileView};

/// Bounded chat log, oldest message evicted first
#[derive(Debug)]
pub struct MessageLog {
    limit: usize,
    entries: VecDeque<ChatMessage>,
}

impl MessageLog {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            entries: VecDeque::with_capacity(limit.min(256)),
        }
    }

    /// Append a message, returning the evicted one if the log was full
    pub fn push(&mut self, message: ChatMessage) -> Option<ChatMessage> {
        self.entries.push_back(message);
        if self.entries.len() > self.limit {
            self.entries.pop_front()
        } else {
            None
        }
    }

    /// Messages in insertion order
    pub fn to_vec(&self) -> Vec<ChatMessage> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// File records shared in a room, keyed by file id
#[derive(Debug, Default)]
pub struct FileLog {
    records: Vec<FileRecord>,
}

impl FileLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a record. A record with the same id is replaced in place.
    pub fn insert(&mut self, record: FileRecord) {
        match self.records.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record,
            None => self.records.push(record),
        }
    }

    pub fn get(&self, file_id: &str) -> Option<&FileRecord> {
        self.records.iter().find(|r| r.id == file_id)
    }

    pub fn remove(&mut self, file_id: &str) -> Option<FileRecord> {
        let index = self.records.iter().position(|r| r.id == file_id)?;
        Some(self.records.remove(index))
    }

    /// Remove every record stored under `name`
    pub fn remove_by_name(&mut self, name: &str) -> Vec<FileRecord> {
        let mut removed = Vec::new();
        self.records.retain(|r| {
            if r.name == name {
                removed.push(r.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    /// Drop records whose backing storage no longer exists
    pub fn retain_stored(&mut self, storage: &StorageIndex) -> usize {
        let before = self.records.len();
        self.records.retain(|r| storage.contains(&r.name));
        before - self.records.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Physical storage timestamps by file name, shared by all rooms
#[derive(Debug, Default)]
pub struct StorageIndex {
    stored_at: DashMap<String, u64>,
}

impl StorageIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `name` was (re)stored at `now`
    pub fn record(&self, name: &str, now: u64) {
        self.stored_at.insert(name.to_string(), now);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.stored_at.contains_key(name)
    }

    pub fn stored_at(&self, name: &str) -> Option<u64> {
        self.stored_at.get(name).map(|t| *t)
    }

    pub fn remove(&self, name: &str) -> bool {
        self.stored_at.remove(name).is_some()
    }

    /// Whether the stored copy of `name` is older than the expiry window.
    /// Unknown names count as expired.
    pub fn is_expired(&self, name: &str, now: u64, expiry_ms: u64) -> bool {
        match self.stored_at(name) {
            Some(t) => now.saturating_sub(t) > expiry_ms,
            None => true,
        }
    }

    /// Names whose stored copy has expired
    pub fn expired(&self, now: u64, expiry_ms: u64) -> Vec<String> {
        self.stored_at
            .iter()
            .filter(|e| now.saturating_sub(*e.value()) > expiry_ms)
            .map(|e| e.key().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.stored_at.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stored_at.is_empty()
    }

    /// Annotate a room's records with their expiry status as of `now`
    pub fn annotate(&self, files: &FileLog, now: u64, expiry_ms: u64) -> Vec<FileView> {
        files
            .iter()
            .map(|record| FileView {
                record: record.clone(),
                is_expired: self.is_expired(&record.name, now, expiry_ms),
            })
            .collect()
    }
}
