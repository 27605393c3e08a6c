//! Media session seam
//!
//! [`MediaPeer`](crate::MediaPeer) drives negotiation through the
//! [`MediaSession`] trait and learns about transport activity from a stream
//! of [`SessionEvent`]s. [`WebRtcSessionFactory`] backs both with a
//! `webrtc` peer connection.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

use crate::config::SfuConfig;
use crate::error::{Result, SfuError};
use crate::signal::{IceCandidate, SdpType, SessionDescription};
use crate::track::InboundTrack;
use crate::types::PeerId;

/// Transport connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl From<RTCPeerConnectionState> for ConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Connecting => Self::Connecting,
            RTCPeerConnectionState::Connected => Self::Connected,
            RTCPeerConnectionState::Disconnected => Self::Disconnected,
            RTCPeerConnectionState::Failed => Self::Failed,
            RTCPeerConnectionState::Closed => Self::Closed,
            _ => Self::New,
        }
    }
}

/// Something the transport did on its own
pub enum SessionEvent {
    /// A locally gathered ICE candidate to trickle to the client
    LocalCandidate(IceCandidate),
    /// The client started publishing a track
    RemoteTrack(Arc<dyn InboundTrack>),
    /// The transport wants a fresh offer
    NegotiationNeeded,
    StateChanged(ConnectionState),
}

impl std::fmt::Debug for SessionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            Self::RemoteTrack(t) => f.debug_tuple("RemoteTrack").field(&t.id()).finish(),
            Self::NegotiationNeeded => f.write_str("NegotiationNeeded"),
            Self::StateChanged(s) => f.debug_tuple("StateChanged").field(s).finish(),
        }
    }
}

/// One participant's server-side media session
#[async_trait]
pub trait MediaSession: Send + Sync {
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    /// Create an answer to the current remote offer and apply it locally
    async fn create_answer(&self) -> Result<SessionDescription>;

    /// Create an offer and apply it locally
    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn add_track(&self, track: Arc<TrackLocalStaticRTP>) -> Result<()>;

    /// Whether an offer can be started right now: the previous exchange has
    /// completed and the client has described its side at least once
    async fn can_offer(&self) -> bool;

    async fn close(&self) -> Result<()>;
}

pub type SessionEvents = mpsc::UnboundedReceiver<SessionEvent>;

#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create_session(&self, peer_id: &PeerId)
        -> Result<(Arc<dyn MediaSession>, SessionEvents)>;
}

/// Builds sessions on `webrtc` peer connections
pub struct WebRtcSessionFactory {
    api: API,
    rtc_config: RTCConfiguration,
}

impl WebRtcSessionFactory {
    pub fn new(config: &SfuConfig) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let mut setting_engine = SettingEngine::default();
        if let Some((min, max)) = config.udp_port_range {
            let ephemeral = EphemeralUDP::new(min, max)
                .map_err(|e| SfuError::Session(format!("invalid UDP port range: {e}")))?;
            setting_engine.set_udp_network(UDPNetwork::Ephemeral(ephemeral));
            info!(udp_port_min = min, udp_port_max = max, "WebRTC UDP port range");
        }
        if !config.nat_1to1_ips.is_empty() {
            setting_engine.set_nat_1to1_ips(config.nat_1to1_ips.clone(), RTCIceCandidateType::Host);
        }

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: config.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };

        Ok(Self { api, rtc_config })
    }
}

#[async_trait]
impl SessionFactory for WebRtcSessionFactory {
    async fn create_session(
        &self,
        peer_id: &PeerId,
    ) -> Result<(Arc<dyn MediaSession>, SessionEvents)> {
        let pc = Arc::new(self.api.new_peer_connection(self.rtc_config.clone()).await?);
        let (tx, rx) = mpsc::unbounded_channel();

        let candidate_tx = tx.clone();
        let candidate_peer = peer_id.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = candidate_tx.clone();
            let peer_id = candidate_peer.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!(peer_id = %peer_id, "ICE gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(SessionEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(e) => warn!(peer_id = %peer_id, error = %e, "Failed to encode ICE candidate"),
                }
            })
        }));

        let track_tx = tx.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let _ = track_tx.send(SessionEvent::RemoteTrack(track));
            Box::pin(async {})
        }));

        let negotiation_tx = tx.clone();
        pc.on_negotiation_needed(Box::new(move || {
            let _ = negotiation_tx.send(SessionEvent::NegotiationNeeded);
            Box::pin(async {})
        }));

        let state_tx = tx;
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let _ = state_tx.send(SessionEvent::StateChanged(state.into()));
            Box::pin(async {})
        }));

        let session: Arc<dyn MediaSession> = Arc::new(WebRtcSession { pc });
        Ok((session, rx))
    }
}

struct WebRtcSession {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl MediaSession for WebRtcSession {
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let desc = match desc.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(desc.sdp)?,
            SdpType::Answer => RTCSessionDescription::answer(desc.sdp)?,
            SdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp)?,
            SdpType::Rollback => {
                return Err(SfuError::Session("rollback is not supported".to_string()))
            }
        };
        self.pc.set_remote_description(desc).await?;
        Ok(())
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await?;
        let sdp = answer.sdp.clone();
        self.pc.set_local_description(answer).await?;
        Ok(SessionDescription::answer(sdp))
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.pc.create_offer(None).await?;
        let sdp = offer.sdp.clone();
        self.pc.set_local_description(offer).await?;
        Ok(SessionDescription::offer(sdp))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn add_track(&self, track: Arc<TrackLocalStaticRTP>) -> Result<()> {
        let sender = self
            .pc
            .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        // RTCP has to be read for interceptors (NACK, reports) to run
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while sender.read(&mut rtcp_buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn can_offer(&self) -> bool {
        self.pc.signaling_state() == RTCSignalingState::Stable
            && self.pc.remote_description().await.is_some()
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        Ok(())
    }
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    //! In-memory session used by relay tests

    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    pub struct FakeSession {
        pub closed: AtomicBool,
        pub has_remote: AtomicBool,
        pub offer_outstanding: AtomicBool,
        pub tracks: Mutex<Vec<String>>,
        pub candidates: Mutex<Vec<IceCandidate>>,
        pub offers: AtomicUsize,
    }

    impl FakeSession {
        pub fn track_ids(&self) -> Vec<String> {
            self.tracks.lock().clone()
        }

        pub fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MediaSession for FakeSession {
        async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
            if desc.sdp.is_empty() {
                return Err(SfuError::Session("empty sdp".to_string()));
            }
            if desc.sdp_type == SdpType::Answer {
                self.offer_outstanding.store(false, Ordering::SeqCst);
            }
            self.has_remote.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn create_answer(&self) -> Result<SessionDescription> {
            Ok(SessionDescription::answer("fake-answer"))
        }

        async fn create_offer(&self) -> Result<SessionDescription> {
            self.offers.fetch_add(1, Ordering::SeqCst);
            self.offer_outstanding.store(true, Ordering::SeqCst);
            Ok(SessionDescription::offer("fake-offer"))
        }

        async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
            self.candidates.lock().push(candidate);
            Ok(())
        }

        async fn add_track(&self, track: Arc<TrackLocalStaticRTP>) -> Result<()> {
            self.tracks.lock().push(track.id().to_string());
            Ok(())
        }

        async fn can_offer(&self) -> bool {
            self.has_remote.load(Ordering::SeqCst) && !self.offer_outstanding.load(Ordering::SeqCst)
        }

        async fn close(&self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Hands out [`FakeSession`]s and keeps the event senders so tests can
    /// play the transport's part
    #[derive(Default)]
    pub struct FakeFactory {
        pub sessions: Mutex<Vec<(PeerId, Arc<FakeSession>, mpsc::UnboundedSender<SessionEvent>)>>,
        pub fail: AtomicBool,
    }

    impl FakeFactory {
        /// Most recent session created for `peer_id`
        pub fn session(&self, peer_id: &str) -> Option<Arc<FakeSession>> {
            self.sessions
                .lock()
                .iter()
                .rev()
                .find(|(id, _, _)| id.as_str() == peer_id)
                .map(|(_, session, _)| Arc::clone(session))
        }

        pub fn events(&self, peer_id: &str) -> Option<mpsc::UnboundedSender<SessionEvent>> {
            self.sessions
                .lock()
                .iter()
                .rev()
                .find(|(id, _, _)| id.as_str() == peer_id)
                .map(|(_, _, tx)| tx.clone())
        }
    }

    #[async_trait]
    impl SessionFactory for FakeFactory {
        async fn create_session(
            &self,
            peer_id: &PeerId,
        ) -> Result<(Arc<dyn MediaSession>, SessionEvents)> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(SfuError::Session("session construction failed".to_string()));
            }
            let session = Arc::new(FakeSession::default());
            let (tx, rx) = mpsc::unbounded_channel();
            self.sessions
                .lock()
                .push((peer_id.clone(), Arc::clone(&session), tx));
            Ok((session, rx))
        }
    }
}
