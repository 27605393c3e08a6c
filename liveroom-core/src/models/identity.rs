use serde::{Deserialize, Serialize};

use super::{ParticipantId, RoomId, UserId};

/// Who is on the other end of a connection.
///
/// Established once from a verified token and never changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// `None` for anonymous guests
    pub user_id: Option<UserId>,
    pub room_id: RoomId,
    pub participant_id: ParticipantId,
    pub display_name: String,
    pub is_anonymous: bool,
    /// Creator of the room; the only one allowed to run the stage
    pub is_room_owner: bool,
}
