//! Wire envelope and event catalog
//!
//! Every frame in either direction is a JSON object `{"event", "data"}`.
//! Inbound frames are decoded in two steps: the envelope first, then the
//! payload into the type its event name calls for.

use axum::extract::ws::Utf8Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::value::RawValue;

use liveroom_core::models::{ParticipantId, QuestionId};
use liveroom_sfu::{IceCandidate, SessionDescription};

/// Event names
pub mod events {
    // Room
    pub const ROOM_USER_JOINED: &str = "room:user_joined";
    pub const ROOM_USER_LEFT: &str = "room:user_left";

    // Chat
    pub const MESSAGE_SEND: &str = "message:send";
    pub const CHAT_TYPING: &str = "chat:typing";

    // Q&A
    pub const QUESTION_SUBMIT: &str = "question:submit";
    pub const QUESTION_UPVOTE: &str = "question:upvote";
    pub const QUESTION_REMOVE_UPVOTE: &str = "question:remove_upvote";
    pub const QUESTION_CREATED: &str = "question:created";
    pub const QUESTION_UPVOTED: &str = "question:upvoted";

    // Leaderboard
    pub const LEADERBOARD_REQUEST: &str = "leaderboard:request";
    pub const LEADERBOARD_UPDATED: &str = "leaderboard:updated";

    // WebRTC signaling
    pub const WEBRTC_OFFER: &str = "webrtc:offer";
    pub const WEBRTC_ANSWER: &str = "webrtc:answer";
    pub const WEBRTC_CANDIDATE: &str = "webrtc:candidate";

    // Conference stage
    pub const CONFERENCE_START: &str = "conference:start";
    pub const CONFERENCE_STOP: &str = "conference:stop";
    pub const CONFERENCE_STARTED: &str = "conference:started";
    pub const CONFERENCE_ENDED: &str = "conference:ended";
    pub const CONFERENCE_STATE: &str = "conference:state";
    pub const CONFERENCE_JOIN: &str = "conference:join";
    pub const CONFERENCE_LEAVE: &str = "conference:leave";
    pub const CONFERENCE_JOINED: &str = "conference:joined";
    pub const CONFERENCE_LEFT: &str = "conference:left";
    pub const RAISE_HAND: &str = "conference:raise_hand";
    pub const LOWER_HAND: &str = "conference:lower_hand";
    pub const HAND_RAISED: &str = "conference:hand_raised";
    pub const HAND_LOWERED: &str = "conference:hand_lowered";
    pub const PROMOTE_SPEAKER: &str = "conference:promote";
    pub const DEMOTE_SPEAKER: &str = "conference:demote";
    pub const SPEAKER_PROMOTED: &str = "conference:promoted";
    pub const SPEAKER_DEMOTED: &str = "conference:demoted";

    pub const ERROR: &str = "error";

    /// Events accepted from clients
    pub const INBOUND: &[&str] = &[
        MESSAGE_SEND,
        CHAT_TYPING,
        LEADERBOARD_REQUEST,
        QUESTION_SUBMIT,
        QUESTION_UPVOTE,
        QUESTION_REMOVE_UPVOTE,
        WEBRTC_OFFER,
        WEBRTC_ANSWER,
        WEBRTC_CANDIDATE,
        CONFERENCE_START,
        CONFERENCE_STOP,
        CONFERENCE_JOIN,
        CONFERENCE_LEAVE,
        RAISE_HAND,
        LOWER_HAND,
        PROMOTE_SPEAKER,
        DEMOTE_SPEAKER,
    ];
}

/// Inbound envelope with the payload left undecoded
#[derive(Debug, Deserialize)]
pub struct RawEnvelope {
    pub event: String,
    #[serde(default)]
    pub data: Option<Box<RawValue>>,
}

#[derive(Debug, Serialize)]
struct OutboundEnvelope<'a, T: Serialize> {
    event: &'a str,
    data: &'a T,
}

/// Encode an outbound frame
pub fn encode<T: Serialize>(event: &str, data: &T) -> serde_json::Result<Utf8Bytes> {
    let json = serde_json::to_string(&OutboundEnvelope { event, data })?;
    Ok(Utf8Bytes::from(json))
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ContentPayload {
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct TypingPayload {
    #[serde(default)]
    pub is_typing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct QuestionPayload {
    pub question_id: QuestionId,
}

/// `webrtc:offer` data; `renegotiate` marks an offer for an existing session
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OfferPayload {
    pub sdp: String,
    #[serde(default)]
    pub renegotiate: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct TargetPayload {
    #[serde(deserialize_with = "participant_from_string_or_number")]
    pub participant_id: ParticipantId,
}

/// Browsers send participant ids as strings, other clients as numbers
fn participant_from_string_or_number<'de, D>(deserializer: D) -> Result<ParticipantId, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(u64),
        Text(String),
    }

    match Repr::deserialize(deserializer)? {
        Repr::Number(n) => Ok(ParticipantId::new(n)),
        Repr::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

/// A decoded inbound event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    MessageSend(ContentPayload),
    ChatTyping(TypingPayload),
    LeaderboardRequest,
    QuestionSubmit(ContentPayload),
    QuestionUpvote(QuestionPayload),
    QuestionRemoveUpvote(QuestionPayload),
    WebrtcOffer(OfferPayload),
    WebrtcAnswer(SessionDescription),
    WebrtcCandidate(IceCandidate),
    ConferenceStart,
    ConferenceStop,
    ConferenceJoin,
    ConferenceLeave,
    RaiseHand,
    LowerHand,
    PromoteSpeaker(TargetPayload),
    DemoteSpeaker(TargetPayload),
    /// Not understood by this server; ignored
    Unknown(String),
}

impl ClientEvent {
    /// Decode a raw frame
    pub fn decode(frame: &[u8]) -> serde_json::Result<Self> {
        let envelope: RawEnvelope = serde_json::from_slice(frame)?;
        Self::from_envelope(envelope)
    }

    pub fn from_envelope(envelope: RawEnvelope) -> serde_json::Result<Self> {
        let data = envelope.data.as_deref();

        Ok(match envelope.event.as_str() {
            events::MESSAGE_SEND => Self::MessageSend(payload(data)?),
            events::CHAT_TYPING => Self::ChatTyping(payload(data)?),
            events::LEADERBOARD_REQUEST => Self::LeaderboardRequest,
            events::QUESTION_SUBMIT => Self::QuestionSubmit(payload(data)?),
            events::QUESTION_UPVOTE => Self::QuestionUpvote(payload(data)?),
            events::QUESTION_REMOVE_UPVOTE => Self::QuestionRemoveUpvote(payload(data)?),
            events::WEBRTC_OFFER => Self::WebrtcOffer(payload(data)?),
            events::WEBRTC_ANSWER => Self::WebrtcAnswer(payload(data)?),
            events::WEBRTC_CANDIDATE => Self::WebrtcCandidate(payload(data)?),
            events::CONFERENCE_START => Self::ConferenceStart,
            events::CONFERENCE_STOP => Self::ConferenceStop,
            events::CONFERENCE_JOIN => Self::ConferenceJoin,
            events::CONFERENCE_LEAVE => Self::ConferenceLeave,
            events::RAISE_HAND => Self::RaiseHand,
            events::LOWER_HAND => Self::LowerHand,
            events::PROMOTE_SPEAKER => Self::PromoteSpeaker(payload(data)?),
            events::DEMOTE_SPEAKER => Self::DemoteSpeaker(payload(data)?),
            _ => Self::Unknown(envelope.event),
        })
    }

    /// Event name for logs and metrics
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::MessageSend(_) => events::MESSAGE_SEND,
            Self::ChatTyping(_) => events::CHAT_TYPING,
            Self::LeaderboardRequest => events::LEADERBOARD_REQUEST,
            Self::QuestionSubmit(_) => events::QUESTION_SUBMIT,
            Self::QuestionUpvote(_) => events::QUESTION_UPVOTE,
            Self::QuestionRemoveUpvote(_) => events::QUESTION_REMOVE_UPVOTE,
            Self::WebrtcOffer(_) => events::WEBRTC_OFFER,
            Self::WebrtcAnswer(_) => events::WEBRTC_ANSWER,
            Self::WebrtcCandidate(_) => events::WEBRTC_CANDIDATE,
            Self::ConferenceStart => events::CONFERENCE_START,
            Self::ConferenceStop => events::CONFERENCE_STOP,
            Self::ConferenceJoin => events::CONFERENCE_JOIN,
            Self::ConferenceLeave => events::CONFERENCE_LEAVE,
            Self::RaiseHand => events::RAISE_HAND,
            Self::LowerHand => events::LOWER_HAND,
            Self::PromoteSpeaker(_) => events::PROMOTE_SPEAKER,
            Self::DemoteSpeaker(_) => events::DEMOTE_SPEAKER,
            Self::Unknown(name) => name,
        }
    }
}

fn payload<T: DeserializeOwned>(data: Option<&RawValue>) -> serde_json::Result<T> {
    serde_json::from_str(data.map_or("null", RawValue::get))
}

#[cfg(test)]
mod tests {
    use super::*;
    use liveroom_sfu::SdpType;
    use serde_json::json;

    fn decode(value: serde_json::Value) -> serde_json::Result<ClientEvent> {
        ClientEvent::decode(value.to_string().as_bytes())
    }

    #[test]
    fn test_encode_envelope() {
        let frame = encode(events::CHAT_TYPING, &json!({"participant_id": 3, "is_typing": true})).unwrap();
        let value: serde_json::Value = serde_json::from_str(frame.as_str()).unwrap();
        assert_eq!(
            value,
            json!({"event": "chat:typing", "data": {"participant_id": 3, "is_typing": true}})
        );
    }

    #[test]
    fn test_decode_chat_and_questions() {
        assert_eq!(
            decode(json!({"event": "message:send", "data": {"content": "hi"}})).unwrap(),
            ClientEvent::MessageSend(ContentPayload { content: "hi".into() })
        );
        assert_eq!(
            decode(json!({"event": "chat:typing", "data": {"is_typing": true}})).unwrap(),
            ClientEvent::ChatTyping(TypingPayload { is_typing: true })
        );
        assert_eq!(
            decode(json!({"event": "question:submit", "data": {"content": "why?"}})).unwrap(),
            ClientEvent::QuestionSubmit(ContentPayload { content: "why?".into() })
        );
        assert_eq!(
            decode(json!({"event": "question:upvote", "data": {"question_id": 9}})).unwrap(),
            ClientEvent::QuestionUpvote(QuestionPayload { question_id: QuestionId::new(9) })
        );
        assert_eq!(
            decode(json!({"event": "question:remove_upvote", "data": {"question_id": 9}})).unwrap(),
            ClientEvent::QuestionRemoveUpvote(QuestionPayload { question_id: QuestionId::new(9) })
        );
        assert_eq!(
            decode(json!({"event": "leaderboard:request"})).unwrap(),
            ClientEvent::LeaderboardRequest
        );
    }

    #[test]
    fn test_decode_signaling() {
        let offer = decode(json!({
            "event": "webrtc:offer",
            "data": {"type": "offer", "sdp": "v=0", "renegotiate": true, "reason": "screen"}
        }))
        .unwrap();
        assert_eq!(
            offer,
            ClientEvent::WebrtcOffer(OfferPayload {
                sdp: "v=0".into(),
                renegotiate: true,
                reason: Some("screen".into()),
            })
        );

        let answer = decode(json!({"event": "webrtc:answer", "data": {"type": "answer", "sdp": "v=0"}})).unwrap();
        match answer {
            ClientEvent::WebrtcAnswer(desc) => assert_eq!(desc.sdp_type, SdpType::Answer),
            other => panic!("unexpected {other:?}"),
        }

        let candidate = decode(json!({
            "event": "webrtc:candidate",
            "data": {"candidate": "candidate:1", "sdpMid": "0", "sdpMLineIndex": 0}
        }))
        .unwrap();
        assert!(matches!(candidate, ClientEvent::WebrtcCandidate(c) if c.sdp_mid.as_deref() == Some("0")));
    }

    #[test]
    fn test_decode_conference_controls() {
        for (name, expected) in [
            ("conference:start", ClientEvent::ConferenceStart),
            ("conference:stop", ClientEvent::ConferenceStop),
            ("conference:join", ClientEvent::ConferenceJoin),
            ("conference:leave", ClientEvent::ConferenceLeave),
            ("conference:raise_hand", ClientEvent::RaiseHand),
            ("conference:lower_hand", ClientEvent::LowerHand),
        ] {
            assert_eq!(decode(json!({"event": name, "data": {}})).unwrap(), expected);
        }

        let promote = decode(json!({"event": "conference:promote", "data": {"participant_id": "12"}})).unwrap();
        assert_eq!(
            promote,
            ClientEvent::PromoteSpeaker(TargetPayload { participant_id: ParticipantId::new(12) })
        );
        let demote = decode(json!({"event": "conference:demote", "data": {"participant_id": 12}})).unwrap();
        assert_eq!(
            demote,
            ClientEvent::DemoteSpeaker(TargetPayload { participant_id: ParticipantId::new(12) })
        );
    }

    #[test]
    fn test_unknown_event_is_kept_by_name() {
        let event = decode(json!({"event": "poll:vote", "data": {"option": 1}})).unwrap();
        assert_eq!(event, ClientEvent::Unknown("poll:vote".into()));
        assert_eq!(event.name(), "poll:vote");
    }

    #[test]
    fn test_malformed_payloads_fail() {
        assert!(decode(json!({"event": "message:send", "data": {"text": "hi"}})).is_err());
        assert!(decode(json!({"event": "question:upvote"})).is_err());
        assert!(decode(json!({"event": "conference:promote", "data": {"participant_id": "abc"}})).is_err());
        assert!(ClientEvent::decode(b"not json").is_err());
    }
}
