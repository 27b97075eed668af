//! In-memory transport for tests
//!
//! Records every description and candidate operation per peer pair, and
//! rejects (and counts) any candidate applied before a remote description.
//! Individual candidates and transport creation can be made to fail.
//! Two mock transports on the same [`MockNetwork`] report `Connected` once
//! both descriptions are in place and share a linked data channel.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use roomlink_core::{IceCandidate, SdpType, SessionDescription};

use crate::transport::{
    DataChannel, PeerTransport, TransportError, TransportEvent, TransportFactory,
};

/// One recorded transport call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportOp {
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpType),
    SetRemote(SdpType),
    Rollback,
    AddCandidate(String),
    Close,
}

type Ops = Arc<Mutex<Vec<TransportOp>>>;

/// Shared state for every mock transport in a test
#[derive(Default)]
pub struct MockNetwork {
    ops: Mutex<HashMap<(String, String), Ops>>,
    channels: Mutex<HashMap<(String, String), Arc<MockDataChannel>>>,
    violations: AtomicUsize,
    rejected: Mutex<HashSet<String>>,
    create_failures: AtomicUsize,
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Operations recorded by `local`'s transport towards `remote`
    pub fn ops(&self, local: &str, remote: &str) -> Vec<TransportOp> {
        self.ops
            .lock()
            .get(&(local.to_string(), remote.to_string()))
            .map(|ops| ops.lock().clone())
            .unwrap_or_default()
    }

    /// Candidates applied before a remote description, across all transports
    pub fn violations(&self) -> usize {
        self.violations.load(Ordering::SeqCst)
    }

    /// Every transport refuses this candidate
    pub fn reject_candidate(&self, candidate: &str) {
        self.rejected.lock().insert(candidate.to_string());
    }

    /// The next `n` transport creations fail
    pub fn fail_creates(&self, n: usize) {
        self.create_failures.store(n, Ordering::SeqCst);
    }

    fn take_create_failure(&self) -> bool {
        self.create_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn ops_for(&self, local: &str, remote: &str) -> Ops {
        self.ops
            .lock()
            .entry((local.to_string(), remote.to_string()))
            .or_default()
            .clone()
    }

    /// Hand out one end of the channel between `local` and `remote`
    fn channel(&self, local: &str, remote: &str) -> Arc<MockDataChannel> {
        let mut channels = self.channels.lock();
        if let Some(end) = channels.remove(&(local.to_string(), remote.to_string())) {
            return end;
        }
        let (ours, theirs) = MockDataChannel::pair();
        channels.insert((remote.to_string(), local.to_string()), theirs);
        ours
    }
}

/// Factory producing mock transports for one local peer
pub struct MockFactory {
    local_id: String,
    network: Arc<MockNetwork>,
}

impl MockFactory {
    pub fn new(local_id: &str, network: Arc<MockNetwork>) -> Self {
        Self {
            local_id: local_id.to_string(),
            network,
        }
    }
}

#[async_trait]
impl TransportFactory for MockFactory {
    async fn create(
        &self,
        remote_id: &str,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Box<dyn PeerTransport>, TransportError> {
        if self.network.take_create_failure() {
            return Err(TransportError::ConnectionFailed("mock create failure".into()));
        }
        Ok(Box::new(MockTransport::new(
            &self.local_id,
            remote_id,
            self.network.clone(),
            events,
        )))
    }
}

#[derive(Default)]
struct Descriptions {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    connected: bool,
}

/// Transport that only records what it is asked to do
pub struct MockTransport {
    local_id: String,
    remote_id: String,
    network: Arc<MockNetwork>,
    ops: Ops,
    events: mpsc::UnboundedSender<TransportEvent>,
    state: Mutex<Descriptions>,
}

impl MockTransport {
    pub fn new(
        local_id: &str,
        remote_id: &str,
        network: Arc<MockNetwork>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        Self {
            local_id: local_id.to_string(),
            remote_id: remote_id.to_string(),
            ops: network.ops_for(local_id, remote_id),
            network,
            events,
            state: Mutex::new(Descriptions::default()),
        }
    }

    fn record(&self, op: TransportOp) {
        self.ops.lock().push(op);
    }

    fn check_connected(&self) {
        let mut state = self.state.lock();
        let complete = matches!(
            (&state.local, &state.remote),
            (Some(l), Some(r)) if l.kind != r.kind
        );
        if complete && !state.connected {
            state.connected = true;
            let _ = self.events.send(TransportEvent::Connected);
        }
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.record(TransportOp::CreateOffer);
        Ok(SessionDescription::offer(format!(
            "offer {} -> {}",
            self.local_id, self.remote_id
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.record(TransportOp::CreateAnswer);
        let has_offer = matches!(
            &self.state.lock().remote,
            Some(d) if d.kind == SdpType::Offer
        );
        if !has_offer {
            return Err(TransportError::InvalidDescription(
                "no remote offer to answer".into(),
            ));
        }
        Ok(SessionDescription::answer(format!(
            "answer {} -> {}",
            self.local_id, self.remote_id
        )))
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.record(TransportOp::SetLocal(desc.kind));
        self.state.lock().local = Some(desc);
        let _ = self.events.send(TransportEvent::LocalCandidate(IceCandidate::new(
            format!("candidate:{}", self.local_id),
        )));
        self.check_connected();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.record(TransportOp::SetRemote(desc.kind));
        {
            let mut state = self.state.lock();
            let offered = matches!(&state.local, Some(d) if d.kind == SdpType::Offer);
            if desc.kind == SdpType::Answer && !offered {
                return Err(TransportError::InvalidDescription(
                    "answer without a local offer".into(),
                ));
            }
            if desc.kind == SdpType::Offer && offered {
                return Err(TransportError::InvalidDescription(
                    "offer while a local offer is pending".into(),
                ));
            }
            state.remote = Some(desc);
        }
        self.check_connected();
        Ok(())
    }

    async fn rollback(&self) -> Result<(), TransportError> {
        self.record(TransportOp::Rollback);
        let mut state = self.state.lock();
        if matches!(&state.local, Some(d) if d.kind == SdpType::Offer) {
            state.local = None;
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        if self.state.lock().remote.is_none() {
            self.network.violations.fetch_add(1, Ordering::SeqCst);
            return Err(TransportError::CandidateRejected(
                "candidate before remote description".into(),
            ));
        }
        if self.network.rejected.lock().contains(&candidate.candidate) {
            return Err(TransportError::CandidateRejected(candidate.candidate));
        }
        self.record(TransportOp::AddCandidate(candidate.candidate));
        Ok(())
    }

    async fn open_channel(&self) -> Result<Arc<dyn DataChannel>, TransportError> {
        if !self.state.lock().connected {
            return Err(TransportError::NotConnected);
        }
        let channel: Arc<dyn DataChannel> = self.network.channel(&self.local_id, &self.remote_id);
        Ok(channel)
    }

    async fn close(&self) {
        self.record(TransportOp::Close);
    }
}

/// One end of an in-memory channel
pub struct MockDataChannel {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    open: AtomicBool,
}

impl MockDataChannel {
    /// Create two linked ends
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        let a = Arc::new(Self {
            tx: tx_b,
            rx: tokio::sync::Mutex::new(rx_a),
            open: AtomicBool::new(true),
        });
        let b = Arc::new(Self {
            tx: tx_a,
            rx: tokio::sync::Mutex::new(rx_b),
            open: AtomicBool::new(true),
        });
        (a, b)
    }
}

#[async_trait]
impl DataChannel for MockDataChannel {
    async fn send(&self, data: Vec<u8>) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        self.tx
            .send(data)
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn recv(&self) -> Option<Vec<u8>> {
        self.rx.lock().await.recv().await
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}
