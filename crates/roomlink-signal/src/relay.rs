//! Directed forwarding between connected peers
//!
//! The relay knows only which peers are connected and how to reach them.
//! Delivery is best-effort: a message for a peer that has gone away is
//! dropped without retry.

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

use roomlink_core::PeerId;

use crate::messages::ServerMessage;

/// Outgoing queue of a connected peer
pub type PeerSender = mpsc::UnboundedSender<ServerMessage>;

/// Connected peers by connection id
#[derive(Default)]
pub struct Relay {
    peers: DashMap<PeerId, PeerSender>,
}

impl Relay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connected peer
    pub fn register(&self, peer_id: &str, sender: PeerSender) {
        self.peers.insert(peer_id.to_string(), sender);
    }

    /// Forget a peer. Returns false if it was not registered.
    pub fn unregister(&self, peer_id: &str) -> bool {
        self.peers.remove(peer_id).is_some()
    }

    pub fn is_connected(&self, peer_id: &str) -> bool {
        self.peers.contains_key(peer_id)
    }

    /// Get peer count (for monitoring)
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Deliver `msg` to one peer. Returns false if it was dropped.
    pub fn send_to(&self, peer_id: &str, msg: ServerMessage) -> bool {
        let sender = match self.peers.get(peer_id) {
            Some(s) => s.value().clone(),
            None => {
                debug!("Dropping message for disconnected peer {}", peer_id);
                return false;
            }
        };

        if sender.send(msg).is_err() {
            debug!("Dropping message for closed peer {}", peer_id);
            return false;
        }
        true
    }

    /// Deliver a copy of `msg` to each listed peer. Returns how many were delivered.
    pub fn broadcast(&self, peers: &[PeerId], msg: &ServerMessage) -> usize {
        peers
            .iter()
            .filter(|peer_id| self.send_to(peer_id, msg.clone()))
            .count()
    }
}
