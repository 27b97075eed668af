//! WebSocket client for the signal server
//!
//! Connects, waits for the server's `welcome` to learn our peer id, then
//! splits the socket into a writer task fed by a channel and a reader
//! task feeding decoded events back. Room setup helpers wait for the
//! matching reply and keep anything else that arrives in the meantime.

use std::collections::VecDeque;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use roomlink_core::{ErrorCode, PeerId, RoomId};
use roomlink_signal::{ClientMessage, ServerMessage};

/// Timeout for WebSocket operations
const WS_TIMEOUT: Duration = Duration::from_secs(30);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Rendezvous errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RendezvousError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Timeout waiting for signal server")]
    Timeout,

    #[error("Server error ({code}): {message}")]
    Server { code: ErrorCode, message: String },

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Signal connection closed")]
    Closed,
}

impl From<&RendezvousError> for ErrorCode {
    fn from(e: &RendezvousError) -> Self {
        match e {
            RendezvousError::Server { code, .. } => *code,
            RendezvousError::WebSocket(_) => ErrorCode::ProtocolViolation,
            RendezvousError::ConnectionFailed(_)
            | RendezvousError::Timeout
            | RendezvousError::Closed => ErrorCode::TransientIo,
        }
    }
}

/// Live connection to the signal server
pub struct SignalClient {
    peer_id: PeerId,
    outgoing: mpsc::UnboundedSender<ClientMessage>,
    incoming: mpsc::UnboundedReceiver<ServerMessage>,
    pending: VecDeque<ServerMessage>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl SignalClient {
    /// Connect and wait for the server to assign our peer id
    pub async fn connect(signal_url: &str) -> Result<Self, RendezvousError> {
        let mut ws = connect_ws(signal_url).await?;

        let peer_id = match recv_message(&mut ws).await? {
            ServerMessage::Welcome { peer_id } => peer_id,
            other => {
                return Err(RendezvousError::WebSocket(format!(
                    "expected welcome, got {:?}",
                    other
                )))
            }
        };
        info!("Connected to signal server as {}", peer_id);

        let (mut ws_sender, mut ws_receiver) = ws.split();
        let (outgoing, mut outbox) = mpsc::unbounded_channel::<ClientMessage>();
        let (inbox, incoming) = mpsc::unbounded_channel();

        let writer = tokio::spawn(async move {
            while let Some(msg) = outbox.recv().await {
                let json = match msg.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("Failed to encode client message: {}", e);
                        continue;
                    }
                };
                if ws_sender.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_receiver.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        debug!("WebSocket error: {:?}", e);
                        break;
                    }
                };
                match ServerMessage::from_json(&text) {
                    Ok(msg) => {
                        if inbox.send(msg).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Ignoring malformed server event: {}", e),
                }
            }
            debug!("Signal connection closed");
        });

        Ok(Self {
            peer_id,
            outgoing,
            incoming,
            pending: VecDeque::new(),
            writer,
            reader,
        })
    }

    /// Our connection id as assigned by the server
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Handle for sending events from other tasks
    pub fn sender(&self) -> mpsc::UnboundedSender<ClientMessage> {
        self.outgoing.clone()
    }

    pub fn send(&self, msg: ClientMessage) -> Result<(), RendezvousError> {
        self.outgoing.send(msg).map_err(|_| RendezvousError::Closed)
    }

    /// Next event from the server. `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        if let Some(msg) = self.pending.pop_front() {
            return Some(msg);
        }
        self.incoming.recv().await
    }

    /// Create a room and return its code
    pub async fn create_room(&mut self) -> Result<RoomId, RendezvousError> {
        self.send(ClientMessage::CreateRoom)?;
        self.wait_for(|msg| match msg {
            ServerMessage::RoomCreated { room_id } => Some(room_id.clone()),
            _ => None,
        })
        .await
    }

    /// Join a room by code
    ///
    /// History and new-peer events that follow the reply stay queued for
    /// [`recv`](Self::recv).
    pub async fn join_room(&mut self, room_id: &str) -> Result<RoomId, RendezvousError> {
        self.send(ClientMessage::JoinRoom {
            room_id: room_id.to_string(),
        })?;
        self.wait_for(|msg| match msg {
            ServerMessage::RoomJoined { room_id } => Some(room_id.clone()),
            _ => None,
        })
        .await
    }

    async fn wait_for<T>(
        &mut self,
        mut matches: impl FnMut(&ServerMessage) -> Option<T>,
    ) -> Result<T, RendezvousError> {
        let mut skipped = VecDeque::new();

        let result = loop {
            let msg = match timeout(WS_TIMEOUT, self.incoming.recv()).await {
                Ok(Some(msg)) => msg,
                Ok(None) => break Err(RendezvousError::Closed),
                Err(_) => break Err(RendezvousError::Timeout),
            };

            if let Some(value) = matches(&msg) {
                break Ok(value);
            }
            if let ServerMessage::Error { code, message } = msg {
                break Err(RendezvousError::Server { code, message });
            }
            skipped.push_back(msg);
        };

        self.pending.extend(skipped);
        result
    }
}

impl Drop for SignalClient {
    fn drop(&mut self) {
        self.writer.abort();
        self.reader.abort();
    }
}

/// Connect to the WebSocket signal server
async fn connect_ws(signal_url: &str) -> Result<WsStream, RendezvousError> {
    let url = Url::parse(signal_url).map_err(|e| RendezvousError::ConnectionFailed(e.to_string()))?;

    debug!("Connecting to signal server: {}", url);

    match timeout(WS_TIMEOUT, connect_async(url.as_str())).await {
        Ok(Ok((ws, _response))) => Ok(ws),
        Ok(Err(e)) => Err(RendezvousError::ConnectionFailed(e.to_string())),
        Err(_) => Err(RendezvousError::Timeout),
    }
}

/// Receive a message from the WebSocket
async fn recv_message(ws: &mut WsStream) -> Result<ServerMessage, RendezvousError> {
    loop {
        match timeout(WS_TIMEOUT, ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                return ServerMessage::from_json(&text)
                    .map_err(|e| RendezvousError::WebSocket(e.to_string()));
            }
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => return Err(RendezvousError::Closed),
            Ok(Some(Err(e))) => return Err(RendezvousError::WebSocket(e.to_string())),
            // Ignore non-text messages (ping/pong/binary)
            Ok(Some(Ok(_))) => continue,
            Err(_) => return Err(RendezvousError::Timeout),
        }
    }
}
