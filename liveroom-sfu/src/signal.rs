//! Signaling payloads exchanged with the client and the per-peer outbound
//! signal channel.
//!
//! Every [`MediaPeer`](crate::MediaPeer) owns one [`SignalSender`]. The
//! connection that created the peer holds the receiving half and relays
//! whatever arrives to its client. When the connection goes away the
//! channel closes and further signals are dropped quietly.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::types::PeerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// `{type, sdp}` as produced by `RTCPeerConnection.localDescription` in browsers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    /// The signal relaying this description, if it is an offer or answer
    #[must_use]
    pub fn into_signal(self) -> Option<Signal> {
        match self.sdp_type {
            SdpType::Offer => Some(Signal::Offer { sdp: self.sdp }),
            SdpType::Answer => Some(Signal::Answer { sdp: self.sdp }),
            SdpType::Pranswer | SdpType::Rollback => None,
        }
    }
}

/// Browser `RTCIceCandidateInit` JSON
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Server to client signal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Signal {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate(IceCandidate),
}

impl Signal {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::Candidate(_) => "candidate",
        }
    }
}

/// Sending half of a peer's signal channel
#[derive(Debug, Clone)]
pub struct SignalSender {
    peer_id: PeerId,
    tx: mpsc::Sender<Signal>,
}

impl SignalSender {
    /// Create a bounded signal channel for `peer_id`
    #[must_use]
    pub fn channel(peer_id: PeerId, capacity: usize) -> (Self, mpsc::Receiver<Signal>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { peer_id, tx }, rx)
    }

    /// Queue a signal without waiting.
    ///
    /// Returns `false` when the signal was dropped, either because the
    /// receiving connection is gone or because it is not keeping up.
    pub fn send(&self, signal: Signal) -> bool {
        match self.tx.try_send(signal) {
            Ok(()) => true,
            Err(TrySendError::Full(signal)) => {
                warn!(
                    peer_id = %self.peer_id,
                    kind = signal.kind(),
                    "Signal channel full, dropping signal"
                );
                false
            }
            Err(TrySendError::Closed(signal)) => {
                debug!(
                    peer_id = %self.peer_id,
                    kind = signal.kind(),
                    "Signal channel closed, connection is gone"
                );
                false
            }
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Whether both senders feed the same receiver
    #[must_use]
    pub fn same_channel(&self, other: &Self) -> bool {
        self.tx.same_channel(&other.tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_signal_wire_shape() {
        let answer = Signal::Answer { sdp: "v=0".into() };
        assert_eq!(
            serde_json::to_value(&answer).unwrap(),
            json!({"type": "answer", "sdp": "v=0"})
        );

        let candidate = Signal::Candidate(IceCandidate {
            candidate: "candidate:1 1 udp 1 10.0.0.1 5000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        });
        assert_eq!(
            serde_json::to_value(&candidate).unwrap(),
            json!({
                "type": "candidate",
                "candidate": "candidate:1 1 udp 1 10.0.0.1 5000 typ host",
                "sdpMid": "0",
                "sdpMLineIndex": 0
            })
        );
    }

    #[test]
    fn test_browser_candidate_decodes() {
        let candidate: IceCandidate = serde_json::from_value(json!({
            "candidate": "candidate:2 1 udp 2 192.168.1.2 6000 typ host",
            "sdpMid": "1",
            "sdpMLineIndex": 1,
            "usernameFragment": "abcd"
        }))
        .unwrap();
        assert_eq!(candidate.sdp_mline_index, Some(1));
        assert_eq!(candidate.username_fragment.as_deref(), Some("abcd"));
    }

    #[test]
    fn test_description_into_signal() {
        assert_eq!(
            SessionDescription::offer("o").into_signal(),
            Some(Signal::Offer { sdp: "o".into() })
        );
        let rollback = SessionDescription {
            sdp_type: SdpType::Rollback,
            sdp: String::new(),
        };
        assert_eq!(rollback.into_signal(), None);
    }

    #[tokio::test]
    async fn test_send_after_receiver_dropped_is_noop() {
        let (sender, rx) = SignalSender::channel(PeerId::from("p1"), 4);
        drop(rx);

        assert!(sender.is_closed());
        assert!(!sender.send(Signal::Offer { sdp: "x".into() }));
    }

    #[tokio::test]
    async fn test_full_channel_drops() {
        let (sender, mut rx) = SignalSender::channel(PeerId::from("p1"), 1);

        assert!(sender.send(Signal::Offer { sdp: "1".into() }));
        assert!(!sender.send(Signal::Offer { sdp: "2".into() }));
        assert_eq!(rx.recv().await, Some(Signal::Offer { sdp: "1".into() }));
    }

    #[test]
    fn test_same_channel() {
        let (sender, _rx) = SignalSender::channel(PeerId::from("p1"), 4);
        let (other, _other_rx) = SignalSender::channel(PeerId::from("p1"), 4);

        assert!(sender.same_channel(&sender.clone()));
        assert!(!sender.same_channel(&other));
    }
}
