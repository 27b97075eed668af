//! Typed dispatch of client events
//!
//! The hub ties the registry, the relay, and the blob store together. Each
//! connection feeds its decoded [`ClientMessage`]s to [`SignalHub::handle`];
//! replies and notifications leave through the relay. Nothing here depends
//! on the socket, so the whole protocol can be driven from tests.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use roomlink_core::path::validate_file_name;
use roomlink_core::{now_millis, ErrorCode, FileInfo};

use crate::blob::{BlobError, BlobStore};
use crate::messages::{ClientMessage, LogLevel, RemovalReason, ServerMessage};
use crate::registry::{MessageDraft, RegistryError, SessionRegistry};
use crate::relay::Relay;

/// Signal server state shared by all connections
pub struct SignalHub {
    registry: Arc<SessionRegistry>,
    relay: Arc<Relay>,
    blobs: Arc<dyn BlobStore>,
}

impl SignalHub {
    pub fn new(registry: Arc<SessionRegistry>, blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            registry,
            relay: Arc::new(Relay::new()),
            blobs,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn relay(&self) -> &Relay {
        &self.relay
    }

    /// Register a new connection and greet it with its peer id
    pub fn connect(&self, peer_id: &str) -> mpsc::UnboundedReceiver<ServerMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.relay.register(peer_id, tx);
        self.relay.send_to(
            peer_id,
            ServerMessage::Welcome {
                peer_id: peer_id.to_string(),
            },
        );
        debug!("Peer {} connected", peer_id);
        rx
    }

    /// Tear down a connection and notify the rooms it was in
    pub fn disconnect(&self, peer_id: &str) {
        self.relay.unregister(peer_id);
        self.leave_all(peer_id, now_millis());
        debug!("Peer {} disconnected", peer_id);
    }

    /// Handle one decoded client event
    pub async fn handle(&self, peer_id: &str, msg: ClientMessage) {
        self.handle_at(peer_id, msg, now_millis()).await
    }

    /// Handle one decoded client event at an explicit time
    pub async fn handle_at(&self, peer_id: &str, msg: ClientMessage, now: u64) {
        match msg {
            ClientMessage::CreateRoom => match self.registry.create_room(peer_id, now) {
                Ok(room_id) => {
                    self.relay
                        .send_to(peer_id, ServerMessage::RoomCreated { room_id });
                }
                Err(e) => self.reply_error(peer_id, &e),
            },

            ClientMessage::JoinRoom { room_id } => self.join(peer_id, &room_id, now),

            ClientMessage::LeaveRoom => self.leave_all(peer_id, now),

            ClientMessage::SendMessage {
                room_id,
                message,
                timestamp,
                id,
                persistent_user_id,
            } => {
                let draft = MessageDraft {
                    id,
                    text: message,
                    sent_at: timestamp,
                    persistent_author_id: persistent_user_id,
                };
                match self.registry.post_message(&room_id, peer_id, draft, now) {
                    Ok((message, roster)) => {
                        debug!("Message {} from {} in room {}", message.id, peer_id, room_id);
                        self.relay
                            .broadcast(&roster, &ServerMessage::ReceiveMessage(message));
                    }
                    Err(e) => self.reply_error(peer_id, &e),
                }
            }

            ClientMessage::Offer {
                room_id,
                peer_id: target,
                offer,
            } => self.forward(
                &room_id,
                peer_id,
                &target,
                ServerMessage::Offer {
                    peer_id: peer_id.to_string(),
                    offer,
                },
                now,
            ),

            ClientMessage::Answer {
                room_id,
                peer_id: target,
                answer,
            } => self.forward(
                &room_id,
                peer_id,
                &target,
                ServerMessage::Answer {
                    peer_id: peer_id.to_string(),
                    answer,
                },
                now,
            ),

            ClientMessage::IceCandidate {
                room_id,
                peer_id: target,
                candidate,
            } => self.forward(
                &room_id,
                peer_id,
                &target,
                ServerMessage::IceCandidate {
                    peer_id: peer_id.to_string(),
                    candidate,
                },
                now,
            ),

            ClientMessage::FileShared { room_id, file_info } => {
                self.share_file(peer_id, &room_id, file_info, now)
            }

            ClientMessage::FileRemoveRequest {
                room_id,
                file_id,
                file_name,
            } => {
                self.remove_file(peer_id, &room_id, &file_id, &file_name, now)
                    .await
            }

            ClientMessage::ClientLog { level, message } => match level {
                LogLevel::Error => error!("[client {}] {}", peer_id, message),
                LogLevel::Warn => warn!("[client {}] {}", peer_id, message),
                LogLevel::Info => info!("[client {}] {}", peer_id, message),
            },

            ClientMessage::Ping { timestamp } => {
                self.relay.send_to(peer_id, ServerMessage::Pong { timestamp });
            }
        }
    }

    fn join(&self, peer_id: &str, room_id: &str, now: u64) {
        let outcome = match self.registry.join_room(room_id, peer_id, now) {
            Ok(outcome) => outcome,
            Err(e) => {
                debug!("Peer {} failed to join {}: {}", peer_id, room_id, e);
                self.relay.send_to(
                    peer_id,
                    ServerMessage::error(
                        ErrorCode::from(&e),
                        "Invalid or unknown room code. Check it and try again.",
                    ),
                );
                return;
            }
        };

        self.relay.send_to(
            peer_id,
            ServerMessage::RoomJoined {
                room_id: outcome.room_id.clone(),
            },
        );

        if !outcome.messages.is_empty() {
            self.relay.send_to(
                peer_id,
                ServerMessage::MessageHistory {
                    messages: outcome.messages,
                },
            );
        }

        if !outcome.files.is_empty() {
            self.relay
                .send_to(peer_id, ServerMessage::FileHistory { files: outcome.files });
        }

        for other in &outcome.existing_peers {
            self.relay.send_to(
                other,
                ServerMessage::NewPeer {
                    peer_id: peer_id.to_string(),
                },
            );
            self.relay.send_to(
                peer_id,
                ServerMessage::NewPeer {
                    peer_id: other.clone(),
                },
            );
        }

        info!("Peer {} joined room {}", peer_id, outcome.room_id);
    }

    fn leave_all(&self, peer_id: &str, now: u64) {
        for departure in self.registry.leave(peer_id, now) {
            self.relay.broadcast(
                &departure.remaining,
                &ServerMessage::PeerDisconnect {
                    peer_id: peer_id.to_string(),
                },
            );
            info!("Peer {} left room {}", peer_id, departure.room_id);
        }
    }

    fn forward(&self, room_id: &str, from: &str, to: &str, msg: ServerMessage, now: u64) {
        self.registry.record_activity(room_id, now);
        if self.relay.send_to(to, msg) {
            debug!("Relayed signal {} -> {} in room {}", from, to, room_id);
        }
    }

    fn share_file(&self, peer_id: &str, room_id: &str, info: FileInfo, now: u64) {
        if let Err(e) = validate_file_name(&info.name) {
            warn!("Rejected file-shared from {}: {}", peer_id, e);
            self.relay
                .send_to(peer_id, ServerMessage::error(ErrorCode::from(&e), e.to_string()));
            return;
        }

        let max = self.registry.config().max_upload_bytes;
        if info.size > max {
            self.relay.send_to(
                peer_id,
                ServerMessage::error(
                    ErrorCode::ResourceLimit,
                    format!("File too large: {} bytes (max {})", info.size, max),
                ),
            );
            return;
        }

        match self.registry.share_file(room_id, peer_id, info, now) {
            Ok((record, roster)) => {
                info!("File '{}' shared in room {}", record.name, room_id);
                self.relay
                    .broadcast(&roster, &ServerMessage::NewFileRecord(record));
            }
            Err(e) => self.reply_error(peer_id, &e),
        }
    }

    /// Delete the blob first; the record is dropped only once storage is gone
    async fn remove_file(
        &self,
        peer_id: &str,
        room_id: &str,
        file_id: &str,
        file_name: &str,
        now: u64,
    ) {
        let record = match self.registry.find_file(room_id, file_id) {
            Ok(Some(record)) => record,
            Ok(None) | Err(RegistryError::RoomNotFound(_)) => {
                debug!(
                    "Remove request for unknown file {} ({}) in room {}",
                    file_id, file_name, room_id
                );
                return;
            }
            Err(e) => {
                self.reply_error(peer_id, &e);
                return;
            }
        };

        match self.blobs.delete(&record.name).await {
            Ok(()) | Err(BlobError::NotFound(_)) => {}
            Err(e) => {
                warn!("Failed to delete blob {}: {}", record.name, e);
                self.relay
                    .send_to(peer_id, ServerMessage::error(ErrorCode::from(&e), e.to_string()));
                return;
            }
        }

        if let Some(removed) = self.registry.remove_file(room_id, file_id, now) {
            info!("File '{}' removed from room {}", removed.record.name, room_id);
            self.relay.broadcast(
                &removed.roster,
                &ServerMessage::FileRemoved {
                    file_id: removed.record.id,
                    file_name: removed.record.name,
                    reason: None,
                },
            );
        }
    }

    /// Remove idle rooms. Members are assumed gone, so nobody is notified.
    pub fn sweep_rooms(&self, now: u64) -> usize {
        self.registry.sweep_expired(now).len()
    }

    /// Delete expired blobs and drop their records from every room
    pub async fn sweep_files(&self, now: u64) -> usize {
        let expired = self.registry.expired_files(now);
        if expired.is_empty() {
            return 0;
        }

        debug!("Checking {} expired files", expired.len());
        let mut removed = 0;

        for name in expired {
            match self.blobs.delete(&name).await {
                Ok(()) | Err(BlobError::NotFound(_)) => {}
                Err(e) => {
                    error!("Failed to delete expired blob {}: {}", name, e);
                    continue;
                }
            }

            for entry in self.registry.purge_file(&name) {
                self.relay.broadcast(
                    &entry.roster,
                    &ServerMessage::FileRemoved {
                        file_id: entry.record.id,
                        file_name: entry.record.name,
                        reason: Some(RemovalReason::Expired),
                    },
                );
            }
            removed += 1;
        }

        info!("File sweep removed {} expired files", removed);
        removed
    }

    fn reply_error(&self, peer_id: &str, e: &RegistryError) {
        self.relay
            .send_to(peer_id, ServerMessage::error(ErrorCode::from(e), e.to_string()));
    }

    /// Number of connected peers
    pub fn peer_count(&self) -> usize {
        self.relay.peer_count()
    }

    /// Number of live rooms
    pub fn room_count(&self) -> usize {
        self.registry.room_count()
    }
}
