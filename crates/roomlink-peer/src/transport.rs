//! Peer transport abstraction
//!
//! The negotiation engine drives a direct transport it never sees the
//! inside of. Anything that can produce and apply session descriptions and
//! reachability candidates, then open a reliable ordered channel, can be
//! plugged in here. Candidate gathering is the transport's job.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use roomlink_core::{ErrorCode, IceCandidate, SessionDescription};
use roomlink_signal::ClientMessage;

/// Errors from transport operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Invalid description: {0}")]
    InvalidDescription(String),
    #[error("Candidate rejected: {0}")]
    CandidateRejected(String),
    #[error("Send failed: {0}")]
    SendFailed(String),
    #[error("Not connected")]
    NotConnected,
    #[error("Closed")]
    Closed,
}

impl From<&TransportError> for ErrorCode {
    fn from(e: &TransportError) -> Self {
        match e {
            TransportError::InvalidDescription(_) | TransportError::CandidateRejected(_) => {
                ErrorCode::ProtocolViolation
            }
            TransportError::NotConnected | TransportError::Closed => ErrorCode::NotFound,
            TransportError::ConnectionFailed(_) | TransportError::SendFailed(_) => {
                ErrorCode::TransientIo
            }
        }
    }
}

/// Events raised by a transport on its own
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A local candidate was gathered and should reach the remote peer
    LocalCandidate(IceCandidate),
    /// The direct path is up
    Connected,
    /// The direct path failed or was closed by the remote side
    Disconnected,
}

/// One direct connection to one remote peer
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Produce a local offer
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    /// Produce an answer to the applied remote offer
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(&self, desc: SessionDescription)
        -> Result<(), TransportError>;

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError>;

    /// Discard the pending local offer
    async fn rollback(&self) -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Open the data channel once connected
    async fn open_channel(&self) -> Result<Arc<dyn DataChannel>, TransportError>;

    async fn close(&self);
}

/// Creates one transport per remote peer
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Create a transport for `remote_id`. Spontaneous events go to `events`.
    async fn create(
        &self,
        remote_id: &str,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Box<dyn PeerTransport>, TransportError>;
}

/// Reliable ordered channel between two peers
#[async_trait]
pub trait DataChannel: Send + Sync {
    /// Send data to the peer
    async fn send(&self, data: Vec<u8>) -> Result<(), TransportError>;

    /// Receive data from the peer
    async fn recv(&self) -> Option<Vec<u8>>;

    /// Check if the channel is open
    fn is_open(&self) -> bool;

    /// Close the channel
    async fn close(&self);
}

/// Outgoing half of the signaling connection
pub trait SignalSink: Send + Sync {
    fn send(&self, msg: ClientMessage) -> Result<(), TransportError>;
}

impl SignalSink for mpsc::UnboundedSender<ClientMessage> {
    fn send(&self, msg: ClientMessage) -> Result<(), TransportError> {
        mpsc::UnboundedSender::send(self, msg).map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl<T: DataChannel + ?Sized> DataChannel for Arc<T> {
    async fn send(&self, data: Vec<u8>) -> Result<(), TransportError> {
        (**self).send(data).await
    }

    async fn recv(&self) -> Option<Vec<u8>> {
        (**self).recv().await
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    async fn close(&self) {
        (**self).close().await
    }
}
