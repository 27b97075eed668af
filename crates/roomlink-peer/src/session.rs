//! One client's view of a room
//!
//! Ties the signal connection, the per-peer negotiations, and direct file
//! transfer together. Every server event is routed to the [`PeerManager`]
//! before it is handed to the caller, so negotiation runs as long as the
//! caller keeps calling [`RoomSession::next_event`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use roomlink_core::ids::random_hex;
use roomlink_core::path::validate_file_name;
use roomlink_core::transfer::{ReceivedFile, TransferError};
use roomlink_core::{now_millis, ClientConfig, ErrorCode, PeerId, ProtocolError, RoomId};
use roomlink_signal::messages::LogLevel;
use roomlink_signal::{ClientMessage, ServerMessage};

use crate::peer_manager::{PeerEvent, PeerManager};
use crate::rendezvous::{RendezvousError, SignalClient};
use crate::transfer::TransferSession;
use crate::transport::{DataChannel, TransportFactory};

/// Session errors
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("not in a room")]
    NotInRoom,

    #[error(transparent)]
    Signal(#[from] RendezvousError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<&SessionError> for ErrorCode {
    fn from(e: &SessionError) -> Self {
        match e {
            SessionError::NotInRoom => ErrorCode::NotFound,
            SessionError::Signal(e) => ErrorCode::from(e),
            SessionError::Protocol(e) => ErrorCode::from(e),
            SessionError::Io(_) => ErrorCode::TransientIo,
        }
    }
}

/// What the session reports to its owner
#[derive(Debug)]
pub enum SessionEvent {
    /// Any event from the signal server (chat, history, files, roster)
    Server(ServerMessage),
    /// A direct channel to this peer is open
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
    FileReceived { from: PeerId, file: ReceivedFile },
}

struct PeerLink {
    channel: Arc<dyn DataChannel>,
    receiver: JoinHandle<()>,
}

/// A signal connection plus direct links to the other members of its room
pub struct RoomSession {
    client: SignalClient,
    manager: PeerManager,
    peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    files_tx: mpsc::UnboundedSender<(PeerId, ReceivedFile)>,
    files_rx: mpsc::UnboundedReceiver<(PeerId, ReceivedFile)>,
    links: HashMap<PeerId, PeerLink>,
    config: ClientConfig,
    room_id: Option<RoomId>,
}

impl RoomSession {
    pub fn new(client: SignalClient, factory: Arc<dyn TransportFactory>, config: ClientConfig) -> Self {
        let (manager, peer_events) = PeerManager::new(
            client.peer_id(),
            factory,
            Arc::new(client.sender()),
            config.negotiation_timeout(),
        );
        let (files_tx, files_rx) = mpsc::unbounded_channel();

        Self {
            client,
            manager,
            peer_events,
            files_tx,
            files_rx,
            links: HashMap::new(),
            config,
            room_id: None,
        }
    }

    pub fn peer_id(&self) -> &str {
        self.client.peer_id()
    }

    pub fn room_id(&self) -> Option<&str> {
        self.room_id.as_deref()
    }

    /// Peers with an open direct channel, sorted
    pub fn connected_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.links.keys().cloned().collect();
        peers.sort();
        peers
    }

    pub async fn create_room(&mut self) -> Result<RoomId, SessionError> {
        let room_id = self.client.create_room().await?;
        self.enter(&room_id);
        Ok(room_id)
    }

    pub async fn join_room(&mut self, code: &str) -> Result<RoomId, SessionError> {
        let room_id = self.client.join_room(code).await?;
        self.enter(&room_id);
        Ok(room_id)
    }

    fn enter(&mut self, room_id: &str) {
        // Setup helpers consume the reply, so the manager is told here
        self.manager.handle_server_message(&ServerMessage::RoomJoined {
            room_id: room_id.to_string(),
        });
        self.room_id = Some(room_id.to_string());
    }

    /// Post a chat message to the room
    pub fn send_message(&self, text: &str) -> Result<(), SessionError> {
        let room_id = self.room_id.clone().ok_or(SessionError::NotInRoom)?;
        let id = random_hex(8).map_err(|e| SessionError::Io(e.to_string()))?;
        self.client.send(ClientMessage::SendMessage {
            room_id,
            message: text.to_string(),
            timestamp: Some(now_millis()),
            id,
            persistent_user_id: None,
        })?;
        Ok(())
    }

    /// Send a file to every connected peer
    pub async fn send_file(
        &self,
        name: &str,
        media_type: Option<&str>,
        data: &[u8],
    ) -> Vec<(PeerId, Result<String, TransferError>)> {
        let mut results = Vec::new();
        for peer_id in self.connected_peers() {
            let Some(link) = self.links.get(&peer_id) else {
                continue;
            };
            let session = TransferSession::new(link.channel.clone(), &self.config);
            let result = session.send_file(name, media_type, data).await;
            results.push((peer_id, result));
        }
        results
    }

    /// Next event for the owner. `None` once the signal connection is gone.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        tokio::select! {
            msg = self.client.recv() => {
                let msg = msg?;
                self.manager.handle_server_message(&msg);
                Some(SessionEvent::Server(msg))
            }
            Some(event) = self.peer_events.recv() => Some(self.on_peer_event(event)),
            Some((from, file)) = self.files_rx.recv() => Some(SessionEvent::FileReceived { from, file }),
        }
    }

    /// Tear down every direct link and leave the room
    pub fn leave(&mut self) {
        self.manager.close_all();
        for (_, link) in self.links.drain() {
            link.receiver.abort();
        }
        if let Some(room_id) = self.room_id.take() {
            let _ = self.client.send(ClientMessage::ClientLog {
                level: LogLevel::Info,
                message: format!("leaving room {}", room_id),
            });
            let _ = self.client.send(ClientMessage::LeaveRoom);
        }
    }

    fn on_peer_event(&mut self, event: PeerEvent) -> SessionEvent {
        match event {
            PeerEvent::Connected { peer_id, channel } => {
                let receiver = spawn_receiver(
                    peer_id.clone(),
                    channel.clone(),
                    &self.config,
                    self.files_tx.clone(),
                );
                if let Some(old) = self.links.insert(peer_id.clone(), PeerLink { channel, receiver }) {
                    old.receiver.abort();
                }
                info!("Direct link to {} is up", peer_id);
                SessionEvent::PeerConnected(peer_id)
            }
            PeerEvent::Disconnected { peer_id } => {
                if let Some(link) = self.links.remove(&peer_id) {
                    link.receiver.abort();
                }
                SessionEvent::PeerDisconnected(peer_id)
            }
        }
    }
}

impl Drop for RoomSession {
    fn drop(&mut self) {
        for link in self.links.values() {
            link.receiver.abort();
        }
    }
}

fn spawn_receiver(
    peer_id: PeerId,
    channel: Arc<dyn DataChannel>,
    config: &ClientConfig,
    files: mpsc::UnboundedSender<(PeerId, ReceivedFile)>,
) -> JoinHandle<()> {
    let mut session = TransferSession::new(channel, config);
    tokio::spawn(async move {
        while let Some(file) = session.recv_file().await {
            if files.send((peer_id.clone(), file)).is_err() {
                break;
            }
        }
        debug!("Channel from {} closed", peer_id);
    })
}

/// Write a received file into `dir` under its announced name
pub async fn save_file(dir: &Path, file: &ReceivedFile) -> Result<PathBuf, SessionError> {
    validate_file_name(&file.descriptor.name)?;
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| SessionError::Io(e.to_string()))?;

    let path = dir.join(&file.descriptor.name);
    tokio::fs::write(&path, &file.data)
        .await
        .map_err(|e| SessionError::Io(e.to_string()))?;
    Ok(path)
}
