//! Chat, Q&A and leaderboard payloads
//!
//! These are produced by the engagement usecases and broadcast to rooms
//! exactly as serialized here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{MessageId, ParticipantId, QuestionId, RoomId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub id: ParticipantId,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub room_id: RoomId,
    pub participant: ParticipantInfo,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessageResponse {
    pub message: ChatMessage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuestionStatus {
    Pending,
    Answered,
    Highlighted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub id: QuestionId,
    pub room_id: RoomId,
    pub participant: ParticipantInfo,
    pub content: String,
    pub upvote_count: u32,
    pub status: QuestionStatus,
    pub is_validated_by_presenter: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct XpEarned {
    pub points: u32,
    pub new_total: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitQuestionResponse {
    pub question: Question,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub xp_earned: Option<XpEarned>,
}

/// Vote tally of a question after an upvote change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionUpvoteInfo {
    pub id: QuestionId,
    pub upvote_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpvoteResponse {
    pub question: QuestionUpvoteInfo,
    /// XP credited to the question's author
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient_xp: Option<XpEarned>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub rank: u32,
    pub participant: ParticipantInfo,
    pub xp_score: u32,
    pub is_anonymous: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MyRank {
    pub rank: u32,
    pub xp_score: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Leaderboard {
    pub leaderboard: Vec<LeaderboardEntry>,
    pub my_rank: Option<MyRank>,
    pub total_participants: usize,
}
