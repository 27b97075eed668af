//! Perfect negotiation for one remote peer
//!
//! Each side of a pair derives the same roles from the two peer ids: the
//! side with the smaller id is impolite and initiates, the other is polite
//! and yields on an offer collision. Both run the same state machine, so
//! simultaneous offers always resolve to the impolite peer's offer.
//!
//! Candidates that arrive before a remote description are queued and
//! applied in arrival order once it is set; a candidate the transport
//! rejects is logged and skipped. Unexpected messages are
//! reported as `ProtocolViolation` and leave the state untouched; nothing
//! here is fatal except an explicit close.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use roomlink_core::{ErrorCode, IceCandidate, PeerId, RoomId, SessionDescription};
use roomlink_signal::ClientMessage;

use crate::transport::{PeerTransport, SignalSink, TransportError};

/// Negotiation errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("negotiation closed")]
    Closed,

    #[error("signaling connection closed")]
    SinkClosed,
}

impl From<&NegotiationError> for ErrorCode {
    fn from(e: &NegotiationError) -> Self {
        match e {
            NegotiationError::ProtocolViolation(_) => ErrorCode::ProtocolViolation,
            NegotiationError::Transport(t) => ErrorCode::from(t),
            NegotiationError::Closed => ErrorCode::NotFound,
            NegotiationError::SinkClosed => ErrorCode::TransientIo,
        }
    }
}

/// Negotiation phase of a peer pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    HaveLocalOffer,
    /// Remote answer applied or local answer sent; waiting for the transport
    AnswerPending,
    Connected,
    Closed,
}

impl Phase {
    /// No local offer outstanding
    pub fn is_stable(self) -> bool {
        matches!(self, Phase::Idle | Phase::AnswerPending | Phase::Connected)
    }
}

/// Input to the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationEvent {
    /// Start (or restart) an offer
    NegotiationNeeded,
    RemoteOffer(SessionDescription),
    RemoteAnswer(SessionDescription),
    RemoteCandidate(IceCandidate),
    /// Candidate gathered by our transport
    LocalCandidate(IceCandidate),
    TransportConnected,
    Close,
}

/// Impolite iff our id sorts before theirs
pub fn is_polite(local_id: &str, remote_id: &str) -> bool {
    local_id > remote_id
}

/// Per-pair negotiation state
#[derive(Debug, Clone)]
pub struct PeerConnectionState {
    pub polite: bool,
    pub phase: Phase,
    pub local_offer: Option<SessionDescription>,
    pub remote_description_set: bool,
    pub queued_candidates: Vec<IceCandidate>,
    /// Set once the transport has reported a connection
    pub connected_once: bool,
}

impl PeerConnectionState {
    pub fn new(polite: bool) -> Self {
        Self {
            polite,
            phase: Phase::Idle,
            local_offer: None,
            remote_description_set: false,
            queued_candidates: Vec::new(),
            connected_once: false,
        }
    }

    /// Stable phase to return to after an offer is settled
    fn settled_phase(&self) -> Phase {
        if self.connected_once {
            Phase::Connected
        } else {
            Phase::AnswerPending
        }
    }
}

/// Drives one transport through perfect negotiation
pub struct NegotiationEngine {
    local_id: PeerId,
    remote_id: PeerId,
    room_id: RoomId,
    state: PeerConnectionState,
    transport: Box<dyn PeerTransport>,
    sink: Arc<dyn SignalSink>,
}

impl NegotiationEngine {
    pub fn new(
        local_id: &str,
        remote_id: &str,
        room_id: &str,
        transport: Box<dyn PeerTransport>,
        sink: Arc<dyn SignalSink>,
    ) -> Self {
        let polite = is_polite(local_id, remote_id);
        debug!(
            "Negotiation {} -> {} ({})",
            local_id,
            remote_id,
            if polite { "polite" } else { "impolite" }
        );
        Self {
            local_id: local_id.to_string(),
            remote_id: remote_id.to_string(),
            room_id: room_id.to_string(),
            state: PeerConnectionState::new(polite),
            transport,
            sink,
        }
    }

    pub fn state(&self) -> &PeerConnectionState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn transport(&self) -> &dyn PeerTransport {
        self.transport.as_ref()
    }

    /// Apply one event
    pub async fn handle(&mut self, event: NegotiationEvent) -> Result<(), NegotiationError> {
        if self.state.phase == Phase::Closed {
            return Err(NegotiationError::Closed);
        }

        match event {
            NegotiationEvent::NegotiationNeeded => self.offer().await,
            NegotiationEvent::RemoteOffer(offer) => self.on_offer(offer).await,
            NegotiationEvent::RemoteAnswer(answer) => self.on_answer(answer).await,
            NegotiationEvent::RemoteCandidate(candidate) => self.on_candidate(candidate).await,
            NegotiationEvent::LocalCandidate(candidate) => {
                self.signal(ClientMessage::IceCandidate {
                    room_id: self.room_id.clone(),
                    peer_id: self.remote_id.clone(),
                    candidate,
                })
            }
            NegotiationEvent::TransportConnected => {
                if self.state.remote_description_set {
                    self.flush_candidates().await;
                }
                if !self.state.connected_once {
                    info!("Connected to peer {}", self.remote_id);
                }
                self.state.connected_once = true;
                if self.state.phase.is_stable() {
                    self.state.phase = Phase::Connected;
                }
                Ok(())
            }
            NegotiationEvent::Close => {
                self.close().await;
                Ok(())
            }
        }
    }

    /// Roll back an offer that never got an answer and offer again
    pub async fn restart_stalled(&mut self) -> Result<(), NegotiationError> {
        if self.state.phase != Phase::HaveLocalOffer {
            return Ok(());
        }
        warn!("Offer to {} stalled, restarting negotiation", self.remote_id);
        self.rollback().await?;
        self.offer().await
    }

    /// Tear down and discard all buffered state
    pub async fn close(&mut self) {
        if self.state.phase == Phase::Closed {
            return;
        }
        self.transport.close().await;
        self.state.phase = Phase::Closed;
        self.state.local_offer = None;
        self.state.queued_candidates.clear();
        debug!("Negotiation with {} closed", self.remote_id);
    }

    async fn offer(&mut self) -> Result<(), NegotiationError> {
        if !self.state.phase.is_stable() {
            debug!("Offer to {} already pending", self.remote_id);
            return Ok(());
        }

        let offer = self.transport.create_offer().await?;
        self.transport.set_local_description(offer.clone()).await?;
        self.state.phase = Phase::HaveLocalOffer;
        self.state.local_offer = Some(offer.clone());

        debug!("Sending offer {} -> {}", self.local_id, self.remote_id);
        self.signal(ClientMessage::Offer {
            room_id: self.room_id.clone(),
            peer_id: self.remote_id.clone(),
            offer,
        })
    }

    async fn on_offer(&mut self, offer: SessionDescription) -> Result<(), NegotiationError> {
        if self.state.phase == Phase::HaveLocalOffer {
            if !self.state.polite {
                debug!("Ignoring colliding offer from {}", self.remote_id);
                return Ok(());
            }
            debug!("Offer collision with {}, rolling back", self.remote_id);
            self.rollback().await?;
        }

        self.transport.set_remote_description(offer).await?;
        self.state.remote_description_set = true;
        self.flush_candidates().await;

        let answer = self.transport.create_answer().await?;
        self.transport.set_local_description(answer.clone()).await?;
        self.state.phase = self.state.settled_phase();

        debug!("Sending answer {} -> {}", self.local_id, self.remote_id);
        self.signal(ClientMessage::Answer {
            room_id: self.room_id.clone(),
            peer_id: self.remote_id.clone(),
            answer,
        })
    }

    async fn on_answer(&mut self, answer: SessionDescription) -> Result<(), NegotiationError> {
        if self.state.phase != Phase::HaveLocalOffer {
            return Err(NegotiationError::ProtocolViolation(format!(
                "answer from {} in phase {:?}",
                self.remote_id, self.state.phase
            )));
        }

        self.transport.set_remote_description(answer).await?;
        self.state.remote_description_set = true;
        self.state.local_offer = None;
        self.state.phase = self.state.settled_phase();
        self.flush_candidates().await;
        Ok(())
    }

    async fn on_candidate(&mut self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        if !self.state.remote_description_set {
            self.state.queued_candidates.push(candidate);
            return Ok(());
        }
        self.apply_candidate(candidate).await;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), NegotiationError> {
        self.transport.rollback().await?;
        self.state.local_offer = None;
        self.state.phase = if self.state.connected_once {
            Phase::Connected
        } else if self.state.remote_description_set {
            Phase::AnswerPending
        } else {
            Phase::Idle
        };
        Ok(())
    }

    /// Apply queued candidates in arrival order
    async fn flush_candidates(&mut self) {
        let queued = std::mem::take(&mut self.state.queued_candidates);
        if !queued.is_empty() {
            debug!("Applying {} queued candidates from {}", queued.len(), self.remote_id);
        }
        for candidate in queued {
            self.apply_candidate(candidate).await;
        }
    }

    /// A rejected candidate is dropped; the rest still apply
    async fn apply_candidate(&mut self, candidate: IceCandidate) {
        if let Err(e) = self.transport.add_ice_candidate(candidate).await {
            warn!("Dropping candidate from {}: {}", self.remote_id, e);
        }
    }

    fn signal(&self, msg: ClientMessage) -> Result<(), NegotiationError> {
        self.sink.send(msg).map_err(|_| NegotiationError::SinkClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockNetwork, MockTransport, TransportOp};
    use crate::transport::TransportEvent;
    use roomlink_core::SdpType;
    use tokio::sync::mpsc;

    struct Side {
        engine: NegotiationEngine,
        outbox: mpsc::UnboundedReceiver<ClientMessage>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    }

    fn side(local: &str, remote: &str, network: &Arc<MockNetwork>) -> Side {
        let (sink_tx, outbox) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let transport = MockTransport::new(local, remote, network.clone(), events_tx);
        Side {
            engine: NegotiationEngine::new(local, remote, "room42", Box::new(transport), Arc::new(sink_tx)),
            outbox,
            events,
        }
    }

    fn sent(rx: &mut mpsc::UnboundedReceiver<ClientMessage>) -> Vec<ClientMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    /// Feed transport events back into the engine, as the pair task does
    async fn pump_transport(side: &mut Side) {
        while let Ok(ev) = side.events.try_recv() {
            let ev = match ev {
                TransportEvent::LocalCandidate(c) => NegotiationEvent::LocalCandidate(c),
                TransportEvent::Connected => NegotiationEvent::TransportConnected,
                TransportEvent::Disconnected => continue,
            };
            side.engine.handle(ev).await.unwrap();
        }
    }

    fn offers(msgs: &[ClientMessage]) -> Vec<SessionDescription> {
        msgs.iter()
            .filter_map(|m| match m {
                ClientMessage::Offer { offer, .. } => Some(offer.clone()),
                _ => None,
            })
            .collect()
    }

    fn answers(msgs: &[ClientMessage]) -> Vec<SessionDescription> {
        msgs.iter()
            .filter_map(|m| match m {
                ClientMessage::Answer { answer, .. } => Some(answer.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_politeness_is_complementary() {
        assert!(!is_polite("a1", "b2"));
        assert!(is_polite("b2", "a1"));
    }

    #[tokio::test]
    async fn test_offer_answer_reaches_connected() {
        let net = MockNetwork::new();
        let mut a = side("a", "b", &net);
        let mut b = side("b", "a", &net);

        a.engine.handle(NegotiationEvent::NegotiationNeeded).await.unwrap();
        assert_eq!(a.engine.phase(), Phase::HaveLocalOffer);
        pump_transport(&mut a).await;

        let from_a = sent(&mut a.outbox);
        let offer = offers(&from_a).remove(0);
        assert!(matches!(&from_a[1], ClientMessage::IceCandidate { peer_id, .. } if peer_id == "b"));

        b.engine.handle(NegotiationEvent::RemoteOffer(offer)).await.unwrap();
        assert_eq!(b.engine.phase(), Phase::AnswerPending);
        let answer = answers(&sent(&mut b.outbox)).remove(0);

        a.engine.handle(NegotiationEvent::RemoteAnswer(answer)).await.unwrap();
        assert_eq!(a.engine.phase(), Phase::AnswerPending);

        pump_transport(&mut a).await;
        pump_transport(&mut b).await;
        assert_eq!(a.engine.phase(), Phase::Connected);
        assert_eq!(b.engine.phase(), Phase::Connected);
        assert_eq!(net.violations(), 0);
    }

    #[tokio::test]
    async fn test_glare_keeps_impolite_offer() {
        let net = MockNetwork::new();
        let mut a = side("a", "b", &net);
        let mut b = side("b", "a", &net);
        assert!(!a.engine.state().polite);
        assert!(b.engine.state().polite);

        a.engine.handle(NegotiationEvent::NegotiationNeeded).await.unwrap();
        b.engine.handle(NegotiationEvent::NegotiationNeeded).await.unwrap();
        let offer_a = offers(&sent(&mut a.outbox)).remove(0);
        let offer_b = offers(&sent(&mut b.outbox)).remove(0);

        // both offers cross in flight
        a.engine.handle(NegotiationEvent::RemoteOffer(offer_b)).await.unwrap();
        b.engine.handle(NegotiationEvent::RemoteOffer(offer_a)).await.unwrap();

        assert_eq!(a.engine.phase(), Phase::HaveLocalOffer);
        assert!(a.engine.state().local_offer.is_some());
        assert!(!net.ops("a", "b").contains(&TransportOp::SetRemote(SdpType::Offer)));

        let b_ops = net.ops("b", "a");
        let rollback = b_ops.iter().position(|op| *op == TransportOp::Rollback).unwrap();
        let accept = b_ops
            .iter()
            .position(|op| *op == TransportOp::SetRemote(SdpType::Offer))
            .unwrap();
        assert!(rollback < accept);

        let answer = answers(&sent(&mut b.outbox)).remove(0);
        a.engine.handle(NegotiationEvent::RemoteAnswer(answer)).await.unwrap();

        pump_transport(&mut a).await;
        pump_transport(&mut b).await;
        assert_eq!(a.engine.phase(), Phase::Connected);
        assert_eq!(b.engine.phase(), Phase::Connected);
    }

    #[tokio::test]
    async fn test_early_candidates_wait_for_remote_description() {
        let candidates: Vec<_> = (0..4).map(|i| IceCandidate::new(format!("c{}", i))).collect();

        // every split of the candidates around the offer
        for early in 0..=candidates.len() {
            let net = MockNetwork::new();
            let mut b = side("b", "a", &net);

            for c in &candidates[..early] {
                b.engine
                    .handle(NegotiationEvent::RemoteCandidate(c.clone()))
                    .await
                    .unwrap();
            }
            assert_eq!(b.engine.state().queued_candidates.len(), early);

            b.engine
                .handle(NegotiationEvent::RemoteOffer(SessionDescription::offer("o")))
                .await
                .unwrap();

            for c in &candidates[early..] {
                b.engine
                    .handle(NegotiationEvent::RemoteCandidate(c.clone()))
                    .await
                    .unwrap();
            }

            let ops = net.ops("b", "a");
            let set_remote = ops
                .iter()
                .position(|op| *op == TransportOp::SetRemote(SdpType::Offer))
                .unwrap();
            let applied: Vec<_> = ops
                .iter()
                .enumerate()
                .filter_map(|(i, op)| match op {
                    TransportOp::AddCandidate(c) => Some((i, c.clone())),
                    _ => None,
                })
                .collect();

            assert!(applied.iter().all(|(i, _)| *i > set_remote));
            let order: Vec<_> = applied.into_iter().map(|(_, c)| c).collect();
            assert_eq!(order, vec!["c0", "c1", "c2", "c3"]);
            assert_eq!(net.violations(), 0);
        }
    }

    #[tokio::test]
    async fn test_rejected_candidate_does_not_block_answer() {
        let net = MockNetwork::new();
        net.reject_candidate("bad");
        let mut b = side("b", "a", &net);

        for c in ["c0", "bad", "c2", "c3"] {
            b.engine
                .handle(NegotiationEvent::RemoteCandidate(IceCandidate::new(c)))
                .await
                .unwrap();
        }
        b.engine
            .handle(NegotiationEvent::RemoteOffer(SessionDescription::offer("o")))
            .await
            .unwrap();

        assert_eq!(b.engine.phase(), Phase::AnswerPending);
        assert_eq!(answers(&sent(&mut b.outbox)).len(), 1);
        assert!(b.engine.state().queued_candidates.is_empty());

        // a rejected candidate after the offer is dropped too
        b.engine
            .handle(NegotiationEvent::RemoteCandidate(IceCandidate::new("bad")))
            .await
            .unwrap();
        b.engine
            .handle(NegotiationEvent::RemoteCandidate(IceCandidate::new("c4")))
            .await
            .unwrap();

        let applied: Vec<_> = net
            .ops("b", "a")
            .into_iter()
            .filter_map(|op| match op {
                TransportOp::AddCandidate(c) => Some(c),
                _ => None,
            })
            .collect();
        assert_eq!(applied, vec!["c0", "c2", "c3", "c4"]);
    }

    #[tokio::test]
    async fn test_answer_in_wrong_state_is_dropped() {
        let net = MockNetwork::new();
        let mut a = side("a", "b", &net);

        let err = a
            .engine
            .handle(NegotiationEvent::RemoteAnswer(SessionDescription::answer("x")))
            .await
            .unwrap_err();
        assert!(matches!(err, NegotiationError::ProtocolViolation(_)));
        assert_eq!(ErrorCode::from(&err), ErrorCode::ProtocolViolation);
        assert_eq!(a.engine.phase(), Phase::Idle);

        // negotiation still works afterwards
        a.engine.handle(NegotiationEvent::NegotiationNeeded).await.unwrap();
        assert_eq!(a.engine.phase(), Phase::HaveLocalOffer);
    }

    #[tokio::test]
    async fn test_renegotiation_keeps_connected() {
        let net = MockNetwork::new();
        let mut b = side("b", "a", &net);

        b.engine
            .handle(NegotiationEvent::RemoteOffer(SessionDescription::offer("o1")))
            .await
            .unwrap();
        pump_transport(&mut b).await;
        assert_eq!(b.engine.phase(), Phase::Connected);

        b.engine
            .handle(NegotiationEvent::RemoteOffer(SessionDescription::offer("o2")))
            .await
            .unwrap();
        assert_eq!(b.engine.phase(), Phase::Connected);
        assert_eq!(answers(&sent(&mut b.outbox)).len(), 2);
    }

    #[tokio::test]
    async fn test_stalled_offer_restarts() {
        let net = MockNetwork::new();
        let mut a = side("a", "b", &net);

        a.engine.restart_stalled().await.unwrap();
        assert!(net.ops("a", "b").is_empty());

        a.engine.handle(NegotiationEvent::NegotiationNeeded).await.unwrap();
        a.engine.restart_stalled().await.unwrap();

        assert_eq!(a.engine.phase(), Phase::HaveLocalOffer);
        assert_eq!(offers(&sent(&mut a.outbox)).len(), 2);
        assert_eq!(
            net.ops("a", "b")
                .into_iter()
                .filter(|op| *op == TransportOp::Rollback)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_close_discards_state() {
        let net = MockNetwork::new();
        let mut b = side("b", "a", &net);

        b.engine
            .handle(NegotiationEvent::RemoteCandidate(IceCandidate::new("c0")))
            .await
            .unwrap();
        b.engine.handle(NegotiationEvent::Close).await.unwrap();

        assert_eq!(b.engine.phase(), Phase::Closed);
        assert!(b.engine.state().queued_candidates.is_empty());
        assert_eq!(net.ops("b", "a"), vec![TransportOp::Close]);
        assert_eq!(
            b.engine.handle(NegotiationEvent::NegotiationNeeded).await,
            Err(NegotiationError::Closed)
        );
    }
}
