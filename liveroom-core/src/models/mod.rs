pub mod engagement;
pub mod id;
pub mod identity;

pub use engagement::*;
pub use id::{MessageId, ParticipantId, QuestionId, RoomId, UserId};
pub use identity::Identity;
