use thiserror::Error;

use crate::types::{PeerId, RoomId};

#[derive(Error, Debug)]
pub enum SfuError {
    #[error("room not found: {0}")]
    RoomNotFound(RoomId),

    #[error("peer not found: {0}")]
    PeerNotFound(PeerId),

    /// The room emptied and was retired while the caller held a handle to it
    #[error("room retired: {0}")]
    RoomRetired(RoomId),

    #[error("maximum number of rooms reached")]
    RoomLimitReached,

    #[error("maximum number of peers reached for room {0}")]
    PeerLimitReached(RoomId),

    #[error("webrtc error: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("media session error: {0}")]
    Session(String),
}

impl SfuError {
    /// Late signaling for a peer or room that is already gone
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::RoomNotFound(_) | Self::PeerNotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, SfuError>;
