//! Media tracks: the inbound side published by a peer and the forwarded
//! mirror fanned out to everybody else in the room.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;
use webrtc::track::track_remote::TrackRemote;
use webrtc::util::marshal::MarshalSize;

use crate::error::Result;
use crate::types::{PeerId, TrackId};

/// Media track kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl From<RTPCodecType> for TrackKind {
    fn from(codec_type: RTPCodecType) -> Self {
        match codec_type {
            RTPCodecType::Audio => Self::Audio,
            _ => Self::Video,
        }
    }
}

/// A track received from a publishing peer
#[async_trait]
pub trait InboundTrack: Send + Sync {
    fn id(&self) -> TrackId;

    fn stream_id(&self) -> String;

    fn kind(&self) -> TrackKind;

    fn codec(&self) -> RTCRtpCodecCapability;

    /// Next RTP packet; an error means the track has ended
    async fn read_rtp(&self) -> Result<Packet>;
}

#[async_trait]
impl InboundTrack for TrackRemote {
    fn id(&self) -> TrackId {
        TrackId::new(TrackRemote::id(self))
    }

    fn stream_id(&self) -> String {
        TrackRemote::stream_id(self)
    }

    fn kind(&self) -> TrackKind {
        TrackKind::from(TrackRemote::kind(self))
    }

    fn codec(&self) -> RTCRtpCodecCapability {
        TrackRemote::codec(self).capability
    }

    async fn read_rtp(&self) -> Result<Packet> {
        let (packet, _attributes) = TrackRemote::read_rtp(self).await?;
        Ok(packet)
    }
}

/// Forwarding counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackStats {
    pub packets_forwarded: u64,
    pub bytes_forwarded: u64,
}

#[derive(Default)]
struct TrackCounters {
    packets: AtomicU64,
    bytes: AtomicU64,
}

/// Server-side mirror of one published track.
///
/// The mirror is added to every other peer in the room; a single
/// forwarding task copies RTP from the source until the source ends or
/// the room cancels the track.
#[derive(Clone)]
pub struct ForwardedTrack {
    id: TrackId,
    source: PeerId,
    kind: TrackKind,
    local: Arc<TrackLocalStaticRTP>,
    cancel: CancellationToken,
    counters: Arc<TrackCounters>,
}

impl std::fmt::Debug for ForwardedTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardedTrack")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("kind", &self.kind)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl ForwardedTrack {
    /// Create a mirror with the same codec, track id and stream id as `remote`
    pub fn mirror(source: PeerId, remote: &dyn InboundTrack) -> Self {
        let id = remote.id();
        let local = Arc::new(TrackLocalStaticRTP::new(
            remote.codec(),
            id.to_string(),
            remote.stream_id(),
        ));

        Self {
            id,
            source,
            kind: remote.kind(),
            local,
            cancel: CancellationToken::new(),
            counters: Arc::new(TrackCounters::default()),
        }
    }

    #[must_use]
    pub const fn id(&self) -> &TrackId {
        &self.id
    }

    #[must_use]
    pub const fn source(&self) -> &PeerId {
        &self.source
    }

    #[must_use]
    pub const fn kind(&self) -> TrackKind {
        self.kind
    }

    #[must_use]
    pub fn local(&self) -> Arc<TrackLocalStaticRTP> {
        Arc::clone(&self.local)
    }

    /// Stop the forwarding task; it exits within one read cycle
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    #[must_use]
    pub fn stats(&self) -> TrackStats {
        TrackStats {
            packets_forwarded: self.counters.packets.load(Ordering::Relaxed),
            bytes_forwarded: self.counters.bytes.load(Ordering::Relaxed),
        }
    }

    /// Spawn the task copying packets from `remote` into the mirror
    pub(crate) fn spawn_forwarding(&self, remote: Arc<dyn InboundTrack>) -> JoinHandle<()> {
        let track = self.clone();
        tokio::spawn(async move { track.forward(remote).await })
    }

    async fn forward(self, remote: Arc<dyn InboundTrack>) {
        info!(
            source_id = %self.source,
            track_id = %self.id,
            kind = ?self.kind,
            "Track forwarding started"
        );

        loop {
            let packet = tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    debug!(source_id = %self.source, track_id = %self.id, "Track forwarding cancelled");
                    break;
                }
                read = remote.read_rtp() => match read {
                    Ok(packet) => packet,
                    Err(e) => {
                        debug!(source_id = %self.source, track_id = %self.id, error = %e, "Source track ended");
                        break;
                    }
                },
            };

            let size = packet.marshal_size() as u64;
            if let Err(e) = self.local.write_rtp(&packet).await {
                debug!(source_id = %self.source, track_id = %self.id, error = %e, "Mirror write failed");
                break;
            }

            self.counters.packets.fetch_add(1, Ordering::Relaxed);
            self.counters.bytes.fetch_add(size, Ordering::Relaxed);
        }

        let stats = self.stats();
        info!(
            source_id = %self.source,
            track_id = %self.id,
            packets = stats.packets_forwarded,
            bytes = stats.bytes_forwarded,
            "Track forwarding stopped"
        );
    }
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use super::*;
    use crate::error::SfuError;
    use tokio::sync::{mpsc, Mutex};
    use webrtc::api::media_engine::MIME_TYPE_OPUS;

    /// Inbound track fed from a channel; dropping the sender ends it
    pub struct ChannelTrack {
        id: TrackId,
        kind: TrackKind,
        packets: Mutex<mpsc::UnboundedReceiver<Packet>>,
    }

    impl ChannelTrack {
        pub fn new(id: &str, kind: TrackKind) -> (Arc<Self>, mpsc::UnboundedSender<Packet>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let track = Arc::new(Self {
                id: TrackId::from(id),
                kind,
                packets: Mutex::new(rx),
            });
            (track, tx)
        }
    }

    #[async_trait]
    impl InboundTrack for ChannelTrack {
        fn id(&self) -> TrackId {
            self.id.clone()
        }

        fn stream_id(&self) -> String {
            format!("stream-{}", self.id)
        }

        fn kind(&self) -> TrackKind {
            self.kind
        }

        fn codec(&self) -> RTCRtpCodecCapability {
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            }
        }

        async fn read_rtp(&self) -> Result<Packet> {
            self.packets
                .lock()
                .await
                .recv()
                .await
                .ok_or_else(|| SfuError::Session("track ended".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ChannelTrack;
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;

    fn packet(seq: u16) -> Packet {
        let mut packet = Packet::default();
        packet.header.version = 2;
        packet.header.sequence_number = seq;
        packet.payload = Bytes::from_static(&[1, 2, 3, 4]);
        packet
    }

    #[test]
    fn test_track_kind_from_codec_type() {
        assert_eq!(TrackKind::from(RTPCodecType::Audio), TrackKind::Audio);
        assert_eq!(TrackKind::from(RTPCodecType::Video), TrackKind::Video);
    }

    #[test]
    fn test_mirror_keeps_ids() {
        let (remote, _tx) = ChannelTrack::new("mic", TrackKind::Audio);
        let track = ForwardedTrack::mirror(PeerId::from("p1"), remote.as_ref());

        assert_eq!(track.id().as_str(), "mic");
        assert_eq!(track.source().as_str(), "p1");
        assert_eq!(track.kind(), TrackKind::Audio);
        assert!(!track.is_cancelled());
    }

    #[tokio::test]
    async fn test_forwarding_counts_packets_until_source_ends() {
        let (remote, tx) = ChannelTrack::new("mic", TrackKind::Audio);
        let track = ForwardedTrack::mirror(PeerId::from("p1"), remote.as_ref());
        let handle = track.spawn_forwarding(remote);

        tx.send(packet(1)).unwrap();
        tx.send(packet(2)).unwrap();
        drop(tx);

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(track.stats().packets_forwarded, 2);
        assert!(track.stats().bytes_forwarded > 0);
    }

    #[tokio::test]
    async fn test_cancel_stops_forwarding() {
        let (remote, _tx) = ChannelTrack::new("cam", TrackKind::Video);
        let track = ForwardedTrack::mirror(PeerId::from("p1"), remote.as_ref());
        let handle = track.spawn_forwarding(remote);

        track.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(track.is_cancelled());
        assert_eq!(track.stats().packets_forwarded, 0);
    }
}
