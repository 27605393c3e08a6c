//! Chat, Q&A and XP usecases invoked by the realtime layer
//!
//! The realtime core only needs the [`EngagementService`] seam; the
//! persistence-backed implementation lives with the CRUD application.
//! [`InMemoryEngagement`] keeps everything in process memory and is what a
//! standalone relay runs with.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::models::{
    ChatMessage, Identity, Leaderboard, LeaderboardEntry, MessageId, MyRank, ParticipantId,
    ParticipantInfo, Question, QuestionId, QuestionStatus, QuestionUpvoteInfo, RoomId,
    SendMessageResponse, SubmitQuestionResponse, UpvoteResponse, XpEarned,
};
use crate::{Error, Result};

/// XP for posting a chat message
pub const XP_SEND_MESSAGE: u32 = 1;
/// XP for asking a question
pub const XP_SUBMIT_QUESTION: u32 = 10;
/// XP credited to a question's author per upvote
pub const XP_RECEIVE_UPVOTE: u32 = 3;

/// Longest accepted message or question, in characters
pub const MAX_CONTENT_CHARS: usize = 1000;

#[async_trait]
pub trait EngagementService: Send + Sync {
    async fn send_message(&self, sender: &Identity, content: &str) -> Result<SendMessageResponse>;

    async fn submit_question(
        &self,
        author: &Identity,
        content: &str,
    ) -> Result<SubmitQuestionResponse>;

    async fn upvote_question(
        &self,
        voter: &Identity,
        question_id: QuestionId,
    ) -> Result<UpvoteResponse>;

    async fn remove_upvote(
        &self,
        voter: &Identity,
        question_id: QuestionId,
    ) -> Result<UpvoteResponse>;

    async fn leaderboard(&self, viewer: &Identity) -> Result<Leaderboard>;
}

/// Validate user supplied text and return it trimmed
pub fn validate_content(content: &str) -> Result<&str> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidInput("Content must not be empty".to_string()));
    }
    if trimmed.chars().count() > MAX_CONTENT_CHARS {
        return Err(Error::InvalidInput(format!(
            "Content must be at most {MAX_CONTENT_CHARS} characters"
        )));
    }
    Ok(trimmed)
}

struct ParticipantRecord {
    display_name: String,
    is_anonymous: bool,
    xp: u32,
}

struct QuestionRecord {
    question: Question,
    voters: HashSet<ParticipantId>,
}

#[derive(Default)]
struct EngagementState {
    next_message_id: u64,
    next_question_id: u64,
    participants: HashMap<(RoomId, ParticipantId), ParticipantRecord>,
    questions: HashMap<QuestionId, QuestionRecord>,
}

impl EngagementState {
    fn participant(&mut self, identity: &Identity) -> &mut ParticipantRecord {
        self.participants
            .entry((identity.room_id, identity.participant_id))
            .or_insert_with(|| ParticipantRecord {
                display_name: identity.display_name.clone(),
                is_anonymous: identity.is_anonymous,
                xp: 0,
            })
    }

    fn award(&mut self, identity: &Identity, points: u32) -> XpEarned {
        let record = self.participant(identity);
        record.xp = record.xp.saturating_add(points);
        XpEarned {
            points,
            new_total: record.xp,
        }
    }

    fn adjust(&mut self, room_id: RoomId, participant_id: ParticipantId, delta: i64) -> u32 {
        let Some(record) = self.participants.get_mut(&(room_id, participant_id)) else {
            return 0;
        };
        record.xp = if delta >= 0 {
            record.xp.saturating_add(u32::try_from(delta).unwrap_or(u32::MAX))
        } else {
            record
                .xp
                .saturating_sub(u32::try_from(-delta).unwrap_or(u32::MAX))
        };
        record.xp
    }

    fn question_in_room(
        &mut self,
        room_id: RoomId,
        question_id: QuestionId,
    ) -> Result<&mut QuestionRecord> {
        self.questions
            .get_mut(&question_id)
            .filter(|record| record.question.room_id == room_id)
            .ok_or_else(|| Error::NotFound(format!("Question {question_id} not found")))
    }
}

/// Process-local engagement store
#[derive(Default)]
pub struct InMemoryEngagement {
    state: Mutex<EngagementState>,
}

impl InMemoryEngagement {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EngagementService for InMemoryEngagement {
    async fn send_message(&self, sender: &Identity, content: &str) -> Result<SendMessageResponse> {
        let content = validate_content(content)?;
        let mut state = self.state.lock();

        state.next_message_id += 1;
        let id = MessageId::new(state.next_message_id);
        let earned = state.award(sender, XP_SEND_MESSAGE);

        debug!(
            room_id = %sender.room_id,
            participant_id = %sender.participant_id,
            message_id = %id,
            xp_total = earned.new_total,
            "Chat message stored"
        );

        Ok(SendMessageResponse {
            message: ChatMessage {
                id,
                room_id: sender.room_id,
                participant: ParticipantInfo {
                    id: sender.participant_id,
                    display_name: sender.display_name.clone(),
                },
                content: content.to_string(),
                created_at: Utc::now(),
            },
        })
    }

    async fn submit_question(
        &self,
        author: &Identity,
        content: &str,
    ) -> Result<SubmitQuestionResponse> {
        let content = validate_content(content)?;
        let mut state = self.state.lock();

        state.next_question_id += 1;
        let id = QuestionId::new(state.next_question_id);
        let question = Question {
            id,
            room_id: author.room_id,
            participant: ParticipantInfo {
                id: author.participant_id,
                display_name: author.display_name.clone(),
            },
            content: content.to_string(),
            upvote_count: 0,
            status: QuestionStatus::Pending,
            is_validated_by_presenter: false,
            created_at: Utc::now(),
        };
        state.questions.insert(
            id,
            QuestionRecord {
                question: question.clone(),
                voters: HashSet::new(),
            },
        );
        let earned = state.award(author, XP_SUBMIT_QUESTION);

        Ok(SubmitQuestionResponse {
            question,
            xp_earned: Some(earned),
        })
    }

    async fn upvote_question(
        &self,
        voter: &Identity,
        question_id: QuestionId,
    ) -> Result<UpvoteResponse> {
        let mut state = self.state.lock();
        state.participant(voter);

        let record = state.question_in_room(voter.room_id, question_id)?;
        if record.question.participant.id == voter.participant_id {
            return Err(Error::InvalidInput("Cannot upvote own question".to_string()));
        }
        if !record.voters.insert(voter.participant_id) {
            return Err(Error::AlreadyExists("Already voted".to_string()));
        }
        record.question.upvote_count += 1;
        let info = QuestionUpvoteInfo {
            id: question_id,
            upvote_count: record.question.upvote_count,
        };
        let author = record.question.participant.id;

        let new_total = state.adjust(voter.room_id, author, i64::from(XP_RECEIVE_UPVOTE));

        Ok(UpvoteResponse {
            question: info,
            recipient_xp: Some(XpEarned {
                points: XP_RECEIVE_UPVOTE,
                new_total,
            }),
        })
    }

    async fn remove_upvote(
        &self,
        voter: &Identity,
        question_id: QuestionId,
    ) -> Result<UpvoteResponse> {
        let mut state = self.state.lock();

        let record = state.question_in_room(voter.room_id, question_id)?;
        if !record.voters.remove(&voter.participant_id) {
            return Err(Error::NotFound("Vote not found".to_string()));
        }
        record.question.upvote_count = record.question.upvote_count.saturating_sub(1);
        let info = QuestionUpvoteInfo {
            id: question_id,
            upvote_count: record.question.upvote_count,
        };
        let author = record.question.participant.id;

        state.adjust(voter.room_id, author, -i64::from(XP_RECEIVE_UPVOTE));

        Ok(UpvoteResponse {
            question: info,
            recipient_xp: None,
        })
    }

    async fn leaderboard(&self, viewer: &Identity) -> Result<Leaderboard> {
        let mut state = self.state.lock();
        state.participant(viewer);

        let mut ranked: Vec<_> = state
            .participants
            .iter()
            .filter(|((room_id, _), _)| *room_id == viewer.room_id)
            .map(|((_, participant_id), record)| (*participant_id, record))
            .collect();
        ranked.sort_by(|(a_id, a), (b_id, b)| b.xp.cmp(&a.xp).then(a_id.cmp(b_id)));

        let mut my_rank = None;
        let mut entries = Vec::with_capacity(ranked.len());
        for (rank, (participant_id, record)) in (1u32..).zip(ranked) {
            if participant_id == viewer.participant_id {
                my_rank = Some(MyRank {
                    rank,
                    xp_score: record.xp,
                });
            }
            entries.push(LeaderboardEntry {
                rank,
                participant: ParticipantInfo {
                    id: participant_id,
                    display_name: record.display_name.clone(),
                },
                xp_score: record.xp,
                is_anonymous: record.is_anonymous,
            });
        }

        Ok(Leaderboard {
            total_participants: entries.len(),
            leaderboard: entries,
            my_rank,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(room: u64, participant: u64, name: &str) -> Identity {
        Identity {
            user_id: None,
            room_id: RoomId::new(room),
            participant_id: ParticipantId::new(participant),
            display_name: name.to_string(),
            is_anonymous: true,
            is_room_owner: false,
        }
    }

    #[test]
    fn test_validate_content() {
        assert_eq!(validate_content("  hi  ").unwrap(), "hi");
        assert!(validate_content("   ").is_err());
        assert!(validate_content(&"x".repeat(MAX_CONTENT_CHARS)).is_ok());
        assert!(validate_content(&"x".repeat(MAX_CONTENT_CHARS + 1)).is_err());
    }

    #[tokio::test]
    async fn test_message_awards_xp() {
        let service = InMemoryEngagement::new();
        let alice = member(1, 1, "alice");

        let sent = service.send_message(&alice, "hello").await.unwrap();
        assert_eq!(sent.message.content, "hello");
        assert_eq!(sent.message.participant.id, alice.participant_id);

        let board = service.leaderboard(&alice).await.unwrap();
        assert_eq!(board.total_participants, 1);
        assert_eq!(board.leaderboard[0].xp_score, XP_SEND_MESSAGE);
        assert_eq!(board.my_rank.unwrap().rank, 1);
    }

    #[tokio::test]
    async fn test_upvote_flow() {
        let service = InMemoryEngagement::new();
        let author = member(1, 1, "author");
        let voter = member(1, 2, "voter");

        let submitted = service.submit_question(&author, "why?").await.unwrap();
        let qid = submitted.question.id;
        assert_eq!(submitted.xp_earned.unwrap().new_total, XP_SUBMIT_QUESTION);

        let upvoted = service.upvote_question(&voter, qid).await.unwrap();
        assert_eq!(upvoted.question.upvote_count, 1);
        assert_eq!(
            upvoted.recipient_xp.unwrap().new_total,
            XP_SUBMIT_QUESTION + XP_RECEIVE_UPVOTE
        );

        assert!(matches!(
            service.upvote_question(&voter, qid).await,
            Err(Error::AlreadyExists(_))
        ));
        assert!(matches!(
            service.upvote_question(&author, qid).await,
            Err(Error::InvalidInput(_))
        ));

        let removed = service.remove_upvote(&voter, qid).await.unwrap();
        assert_eq!(removed.question.upvote_count, 0);
        assert!(matches!(
            service.remove_upvote(&voter, qid).await,
            Err(Error::NotFound(_))
        ));

        let board = service.leaderboard(&author).await.unwrap();
        assert_eq!(board.leaderboard[0].participant.id, author.participant_id);
        assert_eq!(board.leaderboard[0].xp_score, XP_SUBMIT_QUESTION);
    }

    #[tokio::test]
    async fn test_questions_are_room_scoped() {
        let service = InMemoryEngagement::new();
        let author = member(1, 1, "author");
        let outsider = member(2, 5, "outsider");

        let qid = service.submit_question(&author, "q").await.unwrap().question.id;
        assert!(matches!(
            service.upvote_question(&outsider, qid).await,
            Err(Error::NotFound(_))
        ));

        let board = service.leaderboard(&outsider).await.unwrap();
        assert_eq!(board.total_participants, 1);
        assert_eq!(board.leaderboard[0].participant.id, outsider.participant_id);
    }

    #[tokio::test]
    async fn test_leaderboard_ordering() {
        let service = InMemoryEngagement::new();
        let quiet = member(1, 1, "quiet");
        let chatty = member(1, 2, "chatty");

        service.send_message(&quiet, "one").await.unwrap();
        service.submit_question(&chatty, "two").await.unwrap();

        let board = service.leaderboard(&quiet).await.unwrap();
        let order: Vec<_> = board.leaderboard.iter().map(|e| e.participant.id).collect();
        assert_eq!(order, vec![chatty.participant_id, quiet.participant_id]);
        assert_eq!(board.my_rank.unwrap().rank, 2);
    }
}
