//! WebRTC transport
//!
//! Wraps the webrtc crate behind [`PeerTransport`]. The impolite side of a
//! pair creates the data channel before its first offer; the polite side
//! picks it up when it arrives. Either way the channel is handed out by
//! [`PeerTransport::open_channel`] once it has opened.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, warn};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use roomlink_core::{IceCandidate, PeerId, SdpType, SessionDescription};

use crate::negotiation::is_polite;
use crate::transport::{
    DataChannel, PeerTransport, TransportError, TransportEvent, TransportFactory,
};

/// Label of the single data channel between two peers
pub const DATA_CHANNEL_LABEL: &str = "roomlink";

/// How long `open_channel` waits for the data channel after connecting
const CHANNEL_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

type OpenedChannel = Option<Arc<RTCDataChannel>>;
type Inbound = Arc<Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>>;

fn failed(e: webrtc::Error) -> TransportError {
    TransportError::ConnectionFailed(e.to_string())
}

fn invalid(e: webrtc::Error) -> TransportError {
    TransportError::InvalidDescription(e.to_string())
}

/// Creates one WebRTC peer connection per remote peer
pub struct WebRtcFactory {
    local_id: PeerId,
    ice_servers: Vec<String>,
}

impl WebRtcFactory {
    pub fn new(local_id: &str, ice_servers: Vec<String>) -> Self {
        Self {
            local_id: local_id.to_string(),
            ice_servers,
        }
    }

    async fn new_connection(&self) -> Result<Arc<RTCPeerConnection>, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(failed)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(failed)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        api.new_peer_connection(config)
            .await
            .map(Arc::new)
            .map_err(failed)
    }
}

#[async_trait]
impl TransportFactory for WebRtcFactory {
    async fn create(
        &self,
        remote_id: &str,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Box<dyn PeerTransport>, TransportError> {
        let connection = self.new_connection().await?;

        let (opened_tx, opened_rx) = watch::channel::<OpenedChannel>(None);
        let opened_tx = Arc::new(opened_tx);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let inbound: Inbound = Arc::new(Mutex::new(Some(inbound_tx)));

        let candidate_events = events.clone();
        connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send(TransportEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_m_line_index: init.sdp_mline_index,
                        }));
                    }
                    Err(e) => warn!("Failed to encode local candidate: {}", e),
                }
            })
        }));

        let peer = remote_id.to_string();
        connection.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = events.clone();
            let peer = peer.clone();
            Box::pin(async move {
                debug!("Connection to {} is {:?}", peer, state);
                match state {
                    RTCPeerConnectionState::Connected => {
                        let _ = events.send(TransportEvent::Connected);
                    }
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                        let _ = events.send(TransportEvent::Disconnected);
                    }
                    _ => {}
                }
            })
        }));

        if is_polite(&self.local_id, remote_id) {
            let opened_tx = opened_tx.clone();
            let inbound = inbound.clone();
            connection.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let opened_tx = opened_tx.clone();
                let inbound = inbound.clone();
                Box::pin(async move {
                    if dc.label() == DATA_CHANNEL_LABEL {
                        attach_channel(&dc, inbound, opened_tx);
                    } else {
                        debug!("Ignoring data channel '{}'", dc.label());
                    }
                })
            }));
        } else {
            let init = RTCDataChannelInit {
                ordered: Some(true),
                ..Default::default()
            };
            let dc = connection
                .create_data_channel(DATA_CHANNEL_LABEL, Some(init))
                .await
                .map_err(failed)?;
            attach_channel(&dc, inbound, opened_tx);
        }

        Ok(Box::new(WebRtcTransport {
            connection,
            last_offer: Mutex::new(None),
            opened: opened_rx,
            inbound: Mutex::new(Some(inbound_rx)),
        }))
    }
}

/// Route a channel's messages into `inbound` and publish it once open
fn attach_channel(dc: &Arc<RTCDataChannel>, inbound: Inbound, opened: Arc<watch::Sender<OpenedChannel>>) {
    let on_message = inbound.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let inbound = on_message.clone();
        Box::pin(async move {
            if let Some(tx) = inbound.lock().as_ref() {
                let _ = tx.send(msg.data.to_vec());
            }
        })
    }));

    // Dropping the sender ends the receiving side
    dc.on_close(Box::new(move || {
        let inbound = inbound.clone();
        Box::pin(async move {
            inbound.lock().take();
        })
    }));

    let open_dc = dc.clone();
    let on_open = opened.clone();
    dc.on_open(Box::new(move || {
        Box::pin(async move {
            let _ = on_open.send(Some(open_dc));
        })
    }));

    if dc.ready_state() == RTCDataChannelState::Open {
        let _ = opened.send(Some(dc.clone()));
    }
}

/// One WebRTC peer connection
pub struct WebRtcTransport {
    connection: Arc<RTCPeerConnection>,
    /// Body of the last local offer, needed to roll it back
    last_offer: Mutex<Option<String>>,
    opened: watch::Receiver<OpenedChannel>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    match desc.kind {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp).map_err(invalid),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp).map_err(invalid),
        SdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp).map_err(invalid),
        SdpType::Rollback => Err(TransportError::InvalidDescription(
            "rollback is not a description".into(),
        )),
    }
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription, TransportError> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(TransportError::InvalidDescription(format!(
            "unexpected {:?} description",
            other
        ))),
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self.connection.create_offer(None).await.map_err(failed)?;
        from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self.connection.create_answer(None).await.map_err(invalid)?;
        from_rtc(answer)
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        let offer = (desc.kind == SdpType::Offer).then(|| desc.sdp.clone());
        self.connection
            .set_local_description(to_rtc(desc)?)
            .await
            .map_err(invalid)?;
        if offer.is_some() {
            *self.last_offer.lock() = offer;
        }
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.connection
            .set_remote_description(to_rtc(desc)?)
            .await
            .map_err(invalid)
    }

    async fn rollback(&self) -> Result<(), TransportError> {
        let Some(sdp) = self.last_offer.lock().take() else {
            return Ok(());
        };
        // A rollback must carry a body; the pending offer's is reused
        let mut desc = RTCSessionDescription::default();
        desc.sdp_type = RTCSdpType::Rollback;
        desc.sdp = sdp;
        self.connection
            .set_local_description(desc)
            .await
            .map_err(invalid)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_m_line_index,
            ..Default::default()
        };
        self.connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| TransportError::CandidateRejected(e.to_string()))
    }

    async fn open_channel(&self) -> Result<Arc<dyn DataChannel>, TransportError> {
        let mut opened = self.opened.clone();
        let dc = {
            let ready = timeout(CHANNEL_OPEN_TIMEOUT, opened.wait_for(|dc| dc.is_some()))
                .await
                .map_err(|_| TransportError::ConnectionFailed("data channel did not open".into()))?
                .map_err(|_| TransportError::Closed)?;
            ready.clone()
        }
        .ok_or(TransportError::NotConnected)?;

        let inbound = self
            .inbound
            .lock()
            .take()
            .ok_or_else(|| TransportError::ConnectionFailed("data channel already taken".into()))?;

        let channel: Arc<dyn DataChannel> = Arc::new(WebRtcDataChannel {
            dc,
            inbound: tokio::sync::Mutex::new(inbound),
        });
        Ok(channel)
    }

    async fn close(&self) {
        if let Err(e) = self.connection.close().await {
            debug!("Error closing peer connection: {}", e);
        }
    }
}

/// Data channel of a [`WebRtcTransport`]
pub struct WebRtcDataChannel {
    dc: Arc<RTCDataChannel>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

#[async_trait]
impl DataChannel for WebRtcDataChannel {
    async fn send(&self, data: Vec<u8>) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        self.dc
            .send(&Bytes::from(data))
            .await
            .map(|_| ())
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn recv(&self) -> Option<Vec<u8>> {
        self.inbound.lock().await.recv().await
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn close(&self) {
        let _ = self.dc.close().await;
    }
}
