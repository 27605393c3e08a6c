//! Liveroom SFU (Selective Forwarding Unit)
//!
//! Every participant publishes its microphone, camera or screen once; the
//! server mirrors each published track to all other participants of the
//! room and renegotiates their sessions so the new media shows up.
//!
//! ## Architecture
//!
//! - **`RelayManager`**: room id to [`ConferenceRoom`], created lazily and
//!   retired once its last media peer leaves
//! - **`ConferenceRoom`**: media peers, forwarded tracks and conference-mode
//!   state of one room
//! - **`MediaPeer`**: one participant's media session plus its outbound
//!   signal channel
//! - **`ForwardedTrack`**: server-side mirror of a published track with its
//!   own cancellation token
//! - **`MediaSession` / `SessionFactory`**: the transport seam, implemented
//!   on `webrtc` peer connections by [`WebRtcSessionFactory`]
//!
//! ## Usage
//!
//! ```rust,ignore
//! use liveroom_sfu::{RelayManager, SfuConfig, SignalSender, SessionDescription};
//!
//! let relay = RelayManager::with_webrtc(SfuConfig::default())?;
//! let (signals, mut outbound) = SignalSender::channel("42".into(), 64);
//! relay
//!     .handle_offer(&"7".into(), &"42".into(), SessionDescription::offer(sdp), false, signals)
//!     .await?;
//! while let Some(signal) = outbound.recv().await {
//!     // relay `signal` to the client
//! }
//! ```

mod conference;
mod config;
mod error;
mod manager;
mod peer;
mod room;
mod session;
mod signal;
mod track;
mod types;

pub use conference::ConferenceState;
pub use config::SfuConfig;
pub use error::{Result, SfuError};
pub use manager::{ManagerStats, RelayManager};
pub use peer::MediaPeer;
pub use room::{ConferenceRoom, Departure, RoomStats};
pub use session::{
    ConnectionState, MediaSession, SessionEvent, SessionEvents, SessionFactory, WebRtcSessionFactory,
};
pub use signal::{IceCandidate, SdpType, SessionDescription, Signal, SignalSender};
pub use track::{ForwardedTrack, InboundTrack, TrackKind, TrackStats};
pub use types::{PeerId, RoomId, TrackId};

/// Network-free sessions and tracks for driving the relay in tests
#[cfg(any(test, feature = "testing"))]
pub mod testing {
    pub use crate::session::testing::{FakeFactory, FakeSession};
    pub use crate::track::testing::ChannelTrack;
}
