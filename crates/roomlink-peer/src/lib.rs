//! Roomlink Peer - Client side of room negotiation and direct transfer
//!
//! This crate provides:
//! - A WebSocket client for the signal server
//! - Perfect negotiation of one direct transport per remote peer
//! - Chunked file transfer over the resulting data channel
//! - A WebRTC transport and a [`RoomSession`] that wires it all together
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 SignalClient (WebSocket)                    │
//! │  reader task ──► ServerMessage      ClientMessage ◄── writer│
//! └─────────────────────────────┬───────────────────────────────┘
//!                               │ new-peer / offer / answer / candidate
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       PeerManager                           │
//! │  one task + inbox per remote peer, each owning a            │
//! │  NegotiationEngine and its PeerTransport                    │
//! └─────────────────────────────┬───────────────────────────────┘
//!                               │ PeerEvent::Connected(channel)
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │            TransferSession (one per data channel)           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The transport itself is pluggable through [`TransportFactory`]; candidate
//! gathering and the direct path are its concern. [`WebRtcFactory`] is the
//! production transport. [`RoomSession`] drives the whole stack from one
//! event loop.

pub mod negotiation;
pub mod peer_manager;
pub mod rendezvous;
pub mod rtc;
pub mod session;
pub mod transfer;
pub mod transport;

#[cfg(test)]
mod mock;

pub use negotiation::{
    is_polite, NegotiationEngine, NegotiationError, NegotiationEvent, PeerConnectionState, Phase,
};
pub use peer_manager::{PeerEvent, PeerManager};
pub use rendezvous::{RendezvousError, SignalClient};
pub use rtc::WebRtcFactory;
pub use session::{save_file, RoomSession, SessionError, SessionEvent};
pub use transfer::TransferSession;
pub use transport::{
    DataChannel, PeerTransport, SignalSink, TransportError, TransportEvent, TransportFactory,
};
