//! WebSocket signal server implementation

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use roomlink_core::ids::generate_peer_id;
use roomlink_core::{now_millis, ErrorCode, SignalConfig};

use crate::blob::BlobStore;
use crate::hub::SignalHub;
use crate::messages::{ClientMessage, ServerMessage};
use crate::registry::SessionRegistry;
use crate::STATS_INTERVAL_SECS;

/// Signal server state
pub struct SignalServer {
    hub: Arc<SignalHub>,
    config: SignalConfig,
}

impl SignalServer {
    pub fn new(config: SignalConfig, blobs: Arc<dyn BlobStore>) -> Self {
        let registry = Arc::new(SessionRegistry::new(config.clone()));
        Self {
            hub: Arc::new(SignalHub::new(registry, blobs)),
            config,
        }
    }

    pub fn hub(&self) -> &Arc<SignalHub> {
        &self.hub
    }

    /// Start the signal server
    pub async fn serve(&self, addr: SocketAddr) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        info!("Signal server listening on {}", addr);
        self.serve_listener(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve_listener(&self, listener: TcpListener) -> Result<(), std::io::Error> {
        self.spawn_maintenance();

        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let hub = self.hub.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, hub).await {
                    debug!("Connection error from {}: {:?}", peer_addr, e);
                }
            });
        }
    }

    fn spawn_maintenance(&self) {
        // Room sweep
        let hub = self.hub.clone();
        let every = Duration::from_secs(self.config.room_sweep_interval_secs.max(1));
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(every).await;
                let removed = hub.sweep_rooms(now_millis());
                if removed > 0 {
                    info!("Room sweep removed {} idle rooms", removed);
                }
            }
        });

        // File sweep
        let hub = self.hub.clone();
        let every = Duration::from_secs(self.config.file_sweep_interval_secs.max(1));
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(every).await;
                hub.sweep_files(now_millis()).await;
            }
        });

        // Stats
        let hub = self.hub.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(STATS_INTERVAL_SECS)).await;
                info!(
                    "Stats: {} rooms, {} peers, {} stored files",
                    hub.room_count(),
                    hub.peer_count(),
                    hub.registry().stored_file_count()
                );
            }
        });
    }

    /// Get room count (for monitoring)
    pub fn room_count(&self) -> usize {
        self.hub.room_count()
    }

    /// Get peer count (for monitoring)
    pub fn peer_count(&self) -> usize {
        self.hub.peer_count()
    }
}

/// Handle a single connection (HTTP or WebSocket)
async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    hub: Arc<SignalHub>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Peek at the first bytes to detect HTTP vs WebSocket
    let mut peek_buf = [0u8; 4];
    stream.peek(&mut peek_buf).await?;

    // Plain GET without an upgrade header is a health check
    if &peek_buf == b"GET " && !is_upgrade_request(&stream).await? {
        return handle_http_request(&mut stream, &hub).await;
    }

    let ws_stream = accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let peer_id = generate_peer_id()?;
    debug!("New connection from {} as {}", peer_addr, peer_id);

    let mut outbox = hub.connect(&peer_id);

    let writer = tokio::spawn(async move {
        while let Some(msg) = outbox.recv().await {
            let json = match msg.to_json() {
                Ok(json) => json,
                Err(e) => {
                    error!("Failed to encode server message: {}", e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    while let Some(msg) = ws_receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("WebSocket error: {:?}", e);
                break;
            }
        };

        match ClientMessage::from_json(&text) {
            Ok(request) => hub.handle(&peer_id, request).await,
            Err(e) => {
                warn!("Malformed event from {}: {}", peer_id, e);
                hub.relay().send_to(
                    &peer_id,
                    ServerMessage::error(
                        ErrorCode::ProtocolViolation,
                        format!("Invalid message: {}", e),
                    ),
                );
            }
        }
    }

    // Cleanup on disconnect
    hub.disconnect(&peer_id);
    writer.abort();

    debug!("Connection closed: {}", peer_id);
    Ok(())
}

/// Check whether a pending GET request asks for a WebSocket upgrade
async fn is_upgrade_request(stream: &TcpStream) -> Result<bool, std::io::Error> {
    let mut buf = vec![0u8; 2048];
    let n = stream.peek(&mut buf).await?;
    let head = String::from_utf8_lossy(&buf[..n]).to_ascii_lowercase();
    Ok(head.contains("upgrade: websocket"))
}

/// Handle an HTTP request (for health checks)
async fn handle_http_request(
    stream: &mut TcpStream,
    hub: &SignalHub,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Read the HTTP request
    let mut buf = vec![0u8; 1024];
    let n = stream.read(&mut buf).await?;
    let request = String::from_utf8_lossy(&buf[..n]);

    // Parse the request path
    let path = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/");

    let (status, body) = http_response(path, hub);

    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );

    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

fn http_response(path: &str, hub: &SignalHub) -> (&'static str, String) {
    let rooms = hub.room_count();
    let peers = hub.peer_count();

    match path {
        "/health" => (
            "200 OK",
            format!(
                r#"{{"status":"healthy","rooms":{},"peers":{}}}"#,
                rooms, peers
            ),
        ),
        "/stats" => (
            "200 OK",
            format!(
                r#"{{"rooms":{},"peers":{},"stored_files":{}}}"#,
                rooms,
                peers,
                hub.registry().stored_file_count()
            ),
        ),
        _ => ("404 Not Found", r#"{"error":"not found"}"#.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::{BlobLimits, MemoryBlobStore};
    use tokio_tungstenite::connect_async;

    fn server() -> SignalServer {
        let config = SignalConfig::default();
        let blobs = Arc::new(MemoryBlobStore::new(BlobLimits {
            max_bytes: config.max_upload_bytes,
            expiry_ms: config.file_expiry_ms(),
        }));
        SignalServer::new(config, blobs)
    }

    #[test]
    fn test_server_creation() {
        let server = server();
        assert_eq!(server.room_count(), 0);
        assert_eq!(server.peer_count(), 0);
    }

    #[test]
    fn test_http_routes() {
        let server = server();
        let (status, body) = http_response("/health", server.hub());
        assert_eq!(status, "200 OK");
        assert!(body.contains(r#""status":"healthy""#));

        let (_, body) = http_response("/stats", server.hub());
        assert!(body.contains(r#""stored_files":0"#));

        let (status, _) = http_response("/nope", server.hub());
        assert_eq!(status, "404 Not Found");
    }

    async fn next_event<S>(ws: &mut S) -> ServerMessage
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return ServerMessage::from_json(&text).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("connection ended: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_websocket_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = server();
        let hub = server.hub().clone();
        tokio::spawn(async move {
            let _ = server.serve_listener(listener).await;
        });

        let url = format!("ws://{}", addr);
        let (mut a, _) = connect_async(&url).await.unwrap();
        let a_id = match next_event(&mut a).await {
            ServerMessage::Welcome { peer_id } => peer_id,
            other => panic!("expected welcome, got {:?}", other),
        };

        a.send(Message::Text(ClientMessage::CreateRoom.to_json().unwrap()))
            .await
            .unwrap();
        let room_id = match next_event(&mut a).await {
            ServerMessage::RoomCreated { room_id } => room_id,
            other => panic!("expected room-created, got {:?}", other),
        };

        let (mut b, _) = connect_async(&url).await.unwrap();
        next_event(&mut b).await;
        let join = ClientMessage::JoinRoom { room_id: room_id.clone() };
        b.send(Message::Text(join.to_json().unwrap())).await.unwrap();

        assert_eq!(next_event(&mut b).await, ServerMessage::RoomJoined { room_id });
        assert_eq!(
            next_event(&mut b).await,
            ServerMessage::NewPeer { peer_id: a_id }
        );
        assert!(matches!(next_event(&mut a).await, ServerMessage::NewPeer { .. }));

        b.send(Message::Text("{not json".into())).await.unwrap();
        assert!(matches!(
            next_event(&mut b).await,
            ServerMessage::Error { code: ErrorCode::ProtocolViolation, .. }
        ));

        b.close(None).await.unwrap();
        assert!(matches!(
            next_event(&mut a).await,
            ServerMessage::PeerDisconnect { .. }
        ));
        assert_eq!(hub.peer_count(), 1);
    }
}
