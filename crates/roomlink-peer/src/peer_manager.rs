//! Per-peer negotiation tasks
//!
//! Every remote peer gets its own task owning a [`NegotiationEngine`] and
//! an inbox. Events for one pair are handled to completion in arrival
//! order; distinct pairs run concurrently. The manager only routes
//! signaling events to the right inbox and reports pair lifecycle to the
//! application.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use roomlink_core::{PeerId, RoomId};
use roomlink_signal::ServerMessage;

use crate::negotiation::{is_polite, NegotiationEngine, NegotiationError, NegotiationEvent, Phase};
use crate::transport::{DataChannel, SignalSink, TransportEvent, TransportFactory};

/// Lifecycle of a remote peer as seen by the application
pub enum PeerEvent {
    /// Direct channel is open
    Connected {
        peer_id: PeerId,
        channel: Arc<dyn DataChannel>,
    },
    /// The peer left or its negotiation was torn down
    Disconnected { peer_id: PeerId },
}

impl std::fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerEvent::Connected { peer_id, .. } => {
                f.debug_struct("Connected").field("peer_id", peer_id).finish()
            }
            PeerEvent::Disconnected { peer_id } => f
                .debug_struct("Disconnected")
                .field("peer_id", peer_id)
                .finish(),
        }
    }
}

struct PeerHandle {
    inbox: mpsc::UnboundedSender<NegotiationEvent>,
    task: JoinHandle<()>,
}

impl PeerHandle {
    /// The task drops its inbox when it exits
    fn is_live(&self) -> bool {
        !self.inbox.is_closed()
    }
}

/// Routes signaling events to per-peer negotiation tasks
pub struct PeerManager {
    local_id: PeerId,
    room_id: RwLock<Option<RoomId>>,
    factory: Arc<dyn TransportFactory>,
    sink: Arc<dyn SignalSink>,
    peers: DashMap<PeerId, PeerHandle>,
    stall_timeout: Option<Duration>,
    events: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerManager {
    pub fn new(
        local_id: &str,
        factory: Arc<dyn TransportFactory>,
        sink: Arc<dyn SignalSink>,
        stall_timeout: Option<Duration>,
    ) -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let manager = Self {
            local_id: local_id.to_string(),
            room_id: RwLock::new(None),
            factory,
            sink,
            peers: DashMap::new(),
            stall_timeout,
            events,
        };
        (manager, rx)
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn room_id(&self) -> Option<RoomId> {
        self.room_id.read().clone()
    }

    /// Number of peers with a live negotiation task
    pub fn peer_count(&self) -> usize {
        self.peers.iter().filter(|p| p.value().is_live()).count()
    }

    pub fn has_peer(&self, peer_id: &str) -> bool {
        self.peers
            .get(peer_id)
            .map(|p| p.value().is_live())
            .unwrap_or(false)
    }

    /// Route one server event. Events unrelated to negotiation are ignored.
    pub fn handle_server_message(&self, msg: &ServerMessage) {
        match msg {
            ServerMessage::RoomCreated { room_id } | ServerMessage::RoomJoined { room_id } => {
                *self.room_id.write() = Some(room_id.clone());
            }

            ServerMessage::NewPeer { peer_id } => {
                self.ensure_peer(peer_id);
                if !is_polite(&self.local_id, peer_id) {
                    self.dispatch(peer_id, NegotiationEvent::NegotiationNeeded);
                }
            }

            ServerMessage::Offer { peer_id, offer } => {
                self.ensure_peer(peer_id);
                self.dispatch(peer_id, NegotiationEvent::RemoteOffer(offer.clone()));
            }

            ServerMessage::Answer { peer_id, answer } => {
                self.dispatch(peer_id, NegotiationEvent::RemoteAnswer(answer.clone()));
            }

            ServerMessage::IceCandidate { peer_id, candidate } => {
                self.ensure_peer(peer_id);
                self.dispatch(peer_id, NegotiationEvent::RemoteCandidate(candidate.clone()));
            }

            ServerMessage::PeerDisconnect { peer_id } => self.remove_peer(peer_id),

            _ => {}
        }
    }

    /// Tear down the negotiation with `peer_id`
    pub fn remove_peer(&self, peer_id: &str) {
        if let Some((_, handle)) = self.peers.remove(peer_id) {
            // The task exits after handling Close; dropping the inbox ends it otherwise
            let _ = handle.inbox.send(NegotiationEvent::Close);
            drop(handle.task);
            debug!("Removed peer {}", peer_id);
        }
    }

    /// Tear down every negotiation
    pub fn close_all(&self) {
        let ids: Vec<PeerId> = self.peers.iter().map(|p| p.key().clone()).collect();
        for id in ids {
            self.remove_peer(&id);
        }
    }

    fn dispatch(&self, peer_id: &str, event: NegotiationEvent) {
        match self.peers.get(peer_id) {
            Some(handle) => {
                if handle.inbox.send(event).is_err() {
                    debug!("Negotiation task for {} has exited", peer_id);
                }
            }
            None => debug!("Dropping negotiation event for unknown peer {}", peer_id),
        }
    }

    /// Start a task for `peer_id` unless a live one exists. A task that has
    /// exited is replaced so negotiation can start over.
    fn ensure_peer(&self, peer_id: &str) {
        if peer_id == self.local_id {
            warn!("Ignoring negotiation with ourselves");
            return;
        }

        match self.peers.entry(peer_id.to_string()) {
            Entry::Occupied(mut entry) => {
                if !entry.get().is_live() {
                    debug!("Negotiation task for {} had exited, restarting", peer_id);
                    entry.insert(self.spawn_pair(peer_id));
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(self.spawn_pair(peer_id));
            }
        }
    }

    fn spawn_pair(&self, peer_id: &str) -> PeerHandle {
        let (inbox, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_pair(
            PairContext {
                local_id: self.local_id.clone(),
                remote_id: peer_id.to_string(),
                room_id: self.room_id().unwrap_or_default(),
                factory: self.factory.clone(),
                sink: self.sink.clone(),
                stall_timeout: self.stall_timeout,
                events: self.events.clone(),
            },
            rx,
        ));
        debug!("Started negotiation task for {}", peer_id);
        PeerHandle { inbox, task }
    }
}

impl Drop for PeerManager {
    fn drop(&mut self) {
        for entry in self.peers.iter() {
            entry.value().task.abort();
        }
    }
}

struct PairContext {
    local_id: PeerId,
    remote_id: PeerId,
    room_id: RoomId,
    factory: Arc<dyn TransportFactory>,
    sink: Arc<dyn SignalSink>,
    stall_timeout: Option<Duration>,
    events: mpsc::UnboundedSender<PeerEvent>,
}

async fn run_pair(ctx: PairContext, mut inbox: mpsc::UnboundedReceiver<NegotiationEvent>) {
    let (transport_tx, mut transport_rx) = mpsc::unbounded_channel();
    let transport = match ctx.factory.create(&ctx.remote_id, transport_tx).await {
        Ok(t) => t,
        Err(e) => {
            error!("Failed to create transport for {}: {}", ctx.remote_id, e);
            let _ = ctx.events.send(PeerEvent::Disconnected {
                peer_id: ctx.remote_id,
            });
            return;
        }
    };

    let mut engine = NegotiationEngine::new(
        &ctx.local_id,
        &ctx.remote_id,
        &ctx.room_id,
        transport,
        ctx.sink.clone(),
    );
    let mut offered_at: Option<Instant> = None;
    let mut channel_open = false;

    loop {
        let deadline = match (ctx.stall_timeout, offered_at) {
            (Some(timeout), Some(at)) => Some(at + timeout),
            _ => None,
        };

        let event = tokio::select! {
            ev = inbox.recv() => match ev {
                Some(ev) => ev,
                None => NegotiationEvent::Close,
            },
            Some(ev) = transport_rx.recv() => match ev {
                TransportEvent::LocalCandidate(c) => NegotiationEvent::LocalCandidate(c),
                TransportEvent::Connected => NegotiationEvent::TransportConnected,
                TransportEvent::Disconnected => NegotiationEvent::Close,
            },
            _ = stall(deadline) => {
                if let Err(e) = engine.restart_stalled().await {
                    warn!("Failed to restart negotiation with {}: {}", ctx.remote_id, e);
                }
                offered_at = Some(Instant::now());
                continue;
            }
        };

        let connected_event = event == NegotiationEvent::TransportConnected;

        match engine.handle(event).await {
            Ok(()) => {}
            Err(NegotiationError::Closed) => break,
            Err(NegotiationError::SinkClosed) => {
                warn!("Signaling connection gone, stopping negotiation with {}", ctx.remote_id);
                engine.close().await;
            }
            Err(e) => warn!("Negotiation with {}: {}", ctx.remote_id, e),
        }

        if engine.phase() == Phase::Closed {
            break;
        }

        offered_at = match engine.phase() {
            Phase::HaveLocalOffer => offered_at.or_else(|| Some(Instant::now())),
            _ => None,
        };

        if connected_event && !channel_open {
            match engine.transport().open_channel().await {
                Ok(channel) => {
                    channel_open = true;
                    let _ = ctx.events.send(PeerEvent::Connected {
                        peer_id: ctx.remote_id.clone(),
                        channel,
                    });
                }
                Err(e) => warn!("Failed to open channel to {}: {}", ctx.remote_id, e),
            }
        }
    }

    let _ = ctx.events.send(PeerEvent::Disconnected {
        peer_id: ctx.remote_id,
    });
}

async fn stall(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockFactory, MockNetwork, TransportOp};
    use roomlink_core::{IceCandidate, SdpType, SessionDescription};
    use roomlink_signal::ClientMessage;

    struct Client {
        manager: Arc<PeerManager>,
        outbox: mpsc::UnboundedReceiver<ClientMessage>,
        events: mpsc::UnboundedReceiver<PeerEvent>,
    }

    fn client(id: &str, net: &Arc<MockNetwork>, stall: Option<Duration>) -> Client {
        let (sink, outbox) = mpsc::unbounded_channel();
        let (manager, events) = PeerManager::new(
            id,
            Arc::new(MockFactory::new(id, net.clone())),
            Arc::new(sink),
            stall,
        );
        Client {
            manager: Arc::new(manager),
            outbox,
            events,
        }
    }

    /// Relay a client's outgoing signals the way the server does
    fn relay(from: &str, msg: ClientMessage) -> Option<(PeerId, ServerMessage)> {
        let sender = from.to_string();
        match msg {
            ClientMessage::Offer { peer_id, offer, .. } => {
                Some((peer_id, ServerMessage::Offer { peer_id: sender, offer }))
            }
            ClientMessage::Answer { peer_id, answer, .. } => {
                Some((peer_id, ServerMessage::Answer { peer_id: sender, answer }))
            }
            ClientMessage::IceCandidate {
                peer_id, candidate, ..
            } => Some((
                peer_id,
                ServerMessage::IceCandidate {
                    peer_id: sender,
                    candidate,
                },
            )),
            _ => None,
        }
    }

    /// Pump signals between two clients until both report a channel
    async fn connect_pair(a: &mut Client, b: &mut Client) -> (Arc<dyn DataChannel>, Arc<dyn DataChannel>) {
        let mut chan_a = None;
        let mut chan_b = None;

        while chan_a.is_none() || chan_b.is_none() {
            tokio::select! {
                Some(msg) = a.outbox.recv() => {
                    if let Some((_, ev)) = relay(a.manager.local_id(), msg) {
                        b.manager.handle_server_message(&ev);
                    }
                }
                Some(msg) = b.outbox.recv() => {
                    if let Some((_, ev)) = relay(b.manager.local_id(), msg) {
                        a.manager.handle_server_message(&ev);
                    }
                }
                Some(PeerEvent::Connected { channel, .. }) = a.events.recv() => chan_a = Some(channel),
                Some(PeerEvent::Connected { channel, .. }) = b.events.recv() => chan_b = Some(channel),
            }
        }

        (chan_a.unwrap(), chan_b.unwrap())
    }

    fn joined(c: &Client, room: &str) {
        c.manager.handle_server_message(&ServerMessage::RoomJoined {
            room_id: room.into(),
        });
    }

    #[tokio::test]
    async fn test_create_join_scenario_connects() {
        let net = MockNetwork::new();
        let mut a = client("aaaa", &net, None);
        let mut b = client("bbbb", &net, None);

        a.manager.handle_server_message(&ServerMessage::RoomCreated {
            room_id: "r00m42".into(),
        });
        joined(&b, "r00m42");

        // the join fans out to both sides
        a.manager
            .handle_server_message(&ServerMessage::NewPeer { peer_id: "bbbb".into() });
        b.manager
            .handle_server_message(&ServerMessage::NewPeer { peer_id: "aaaa".into() });

        let (chan_a, chan_b) = tokio::time::timeout(Duration::from_secs(5), connect_pair(&mut a, &mut b))
            .await
            .expect("pair did not connect");

        chan_a.send(b"hello".to_vec()).await.unwrap();
        assert_eq!(chan_b.recv().await.unwrap(), b"hello");

        // only the impolite side offered
        assert!(net.ops("aaaa", "bbbb").contains(&TransportOp::CreateOffer));
        assert!(!net.ops("bbbb", "aaaa").contains(&TransportOp::CreateOffer));
        assert_eq!(net.violations(), 0);
        assert_eq!(a.manager.room_id().as_deref(), Some("r00m42"));
    }

    #[tokio::test]
    async fn test_signals_carry_room_and_target() {
        let net = MockNetwork::new();
        let mut a = client("a", &net, None);
        joined(&a, "room1");

        a.manager
            .handle_server_message(&ServerMessage::NewPeer { peer_id: "b".into() });

        match a.outbox.recv().await.unwrap() {
            ClientMessage::Offer { room_id, peer_id, offer } => {
                assert_eq!(room_id, "room1");
                assert_eq!(peer_id, "b");
                assert_eq!(offer.kind, SdpType::Offer);
            }
            other => panic!("expected offer, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_polite_side_waits_for_offer() {
        let net = MockNetwork::new();
        let mut b = client("b", &net, None);

        b.manager
            .handle_server_message(&ServerMessage::NewPeer { peer_id: "a".into() });
        assert!(b.manager.has_peer("a"));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(b.outbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_candidates_before_offer_are_queued() {
        let net = MockNetwork::new();
        let mut b = client("b", &net, None);

        for c in ["c1", "c2"] {
            b.manager.handle_server_message(&ServerMessage::IceCandidate {
                peer_id: "a".into(),
                candidate: IceCandidate::new(c),
            });
        }
        b.manager.handle_server_message(&ServerMessage::Offer {
            peer_id: "a".into(),
            offer: SessionDescription::offer("o"),
        });

        // the answer is sent after the queue is flushed
        loop {
            if let ClientMessage::Answer { .. } = b.outbox.recv().await.unwrap() {
                break;
            }
        }

        let ops = net.ops("b", "a");
        assert_eq!(
            &ops[..3],
            &[
                TransportOp::SetRemote(SdpType::Offer),
                TransportOp::AddCandidate("c1".into()),
                TransportOp::AddCandidate("c2".into()),
            ]
        );
        assert_eq!(net.violations(), 0);
    }

    #[tokio::test]
    async fn test_peer_disconnect_tears_down() {
        let net = MockNetwork::new();
        let mut a = client("a", &net, None);

        a.manager
            .handle_server_message(&ServerMessage::NewPeer { peer_id: "b".into() });
        a.manager
            .handle_server_message(&ServerMessage::PeerDisconnect { peer_id: "b".into() });
        assert_eq!(a.manager.peer_count(), 0);

        match a.events.recv().await.unwrap() {
            PeerEvent::Disconnected { peer_id } => assert_eq!(peer_id, "b"),
            other => panic!("expected disconnect, got {:?}", other),
        }
        assert_eq!(net.ops("a", "b").last(), Some(&TransportOp::Close));

        // a late answer for the removed peer is dropped
        a.manager.handle_server_message(&ServerMessage::Answer {
            peer_id: "b".into(),
            answer: SessionDescription::answer("late"),
        });
        assert_eq!(a.manager.peer_count(), 0);
    }

    #[tokio::test]
    async fn test_exited_task_is_replaced() {
        let net = MockNetwork::new();
        net.fail_creates(1);
        let mut b = client("b", &net, None);

        b.manager
            .handle_server_message(&ServerMessage::NewPeer { peer_id: "a".into() });
        match b.events.recv().await.unwrap() {
            PeerEvent::Disconnected { peer_id } => assert_eq!(peer_id, "a"),
            other => panic!("expected disconnect, got {:?}", other),
        }
        assert!(!b.manager.has_peer("a"));
        assert_eq!(b.manager.peer_count(), 0);

        // a fresh offer starts a new task that answers it
        b.manager.handle_server_message(&ServerMessage::Offer {
            peer_id: "a".into(),
            offer: SessionDescription::offer("o"),
        });
        assert!(b.manager.has_peer("a"));

        let answered = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let ClientMessage::Answer { peer_id, .. } = b.outbox.recv().await.unwrap() {
                    break peer_id;
                }
            }
        })
        .await
        .expect("offer was not answered");
        assert_eq!(answered, "a");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_offer_is_retried() {
        let net = MockNetwork::new();
        let mut a = client("a", &net, Some(Duration::from_secs(30)));

        a.manager
            .handle_server_message(&ServerMessage::NewPeer { peer_id: "b".into() });

        let mut offers = 0;
        while offers < 2 {
            if let ClientMessage::Offer { .. } = a.outbox.recv().await.unwrap() {
                offers += 1;
            }
        }
        assert!(net.ops("a", "b").contains(&TransportOp::Rollback));
    }
}
