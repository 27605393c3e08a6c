//! Inbound event dispatch
//!
//! Decodes each frame, runs the matching usecase or relay operation and
//! answers with either a room broadcast or a frame for the caller only.
//! Failures never reach the room; the caller gets an `error` event.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use liveroom_core::models::{Identity, LeaderboardEntry, ParticipantId, QuestionUpvoteInfo};
use liveroom_core::service::EngagementService;
use liveroom_sfu::{
    ConferenceRoom, ConferenceState, IceCandidate, PeerId, RelayManager, SessionDescription,
    SfuError, Signal, SignalSender,
};

use super::connection::{Connection, ConnectionId};
use super::hub::ConnectionRegistry;
use super::message::{events, ClientEvent, RawEnvelope};
use crate::observability::metrics;

/// Receives every inbound frame of a connection, in order
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, conn: &Arc<Connection>, frame: &[u8]);

    /// Called once after the connection has been unregistered
    async fn on_disconnect(&self, conn: &Arc<Connection>);
}

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("invalid message: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("{0}")]
    Unauthorized(String),

    #[error(transparent)]
    Relay(#[from] SfuError),

    #[error(transparent)]
    Usecase(#[from] liveroom_core::Error),
}

impl RouterError {
    /// Text shown to the client; server-side details stay in the logs
    fn client_message(&self) -> String {
        match self {
            Self::Usecase(e) if !e.is_client_error() => "Internal server error".to_string(),
            Self::Relay(SfuError::WebRtc(_) | SfuError::Session(_)) => {
                "Media session error".to_string()
            }
            other => other.to_string(),
        }
    }
}

type RouterResult<T = ()> = Result<T, RouterError>;

#[derive(Debug, Serialize)]
struct ErrorPayload<'a> {
    event: &'a str,
    message: String,
}

#[derive(Debug, Serialize)]
struct TypingBroadcast {
    participant_id: ParticipantId,
    is_typing: bool,
}

#[derive(Debug, Serialize)]
struct LeaderboardBroadcast<'a> {
    leaderboard: &'a [LeaderboardEntry],
    total_participants: usize,
}

#[derive(Debug, Serialize)]
struct UpvoteBroadcast {
    question: QuestionUpvoteInfo,
    participant_id: ParticipantId,
    action: &'static str,
}

#[derive(Debug, Serialize)]
struct StateReply {
    #[serde(flatten)]
    state: ConferenceState,
    is_room_owner: bool,
}

#[derive(Debug, Serialize)]
struct StagePayload<'a> {
    participant_id: &'a PeerId,
    #[serde(skip_serializing_if = "Option::is_none")]
    is_room_owner: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<i64>,
}

impl<'a> StagePayload<'a> {
    const fn of(participant_id: &'a PeerId) -> Self {
        Self {
            participant_id,
            is_room_owner: None,
            timestamp: None,
        }
    }
}

/// Routes client events to the engagement usecases and the media relay
pub struct EventRouter {
    registry: ConnectionRegistry,
    relay: Arc<RelayManager>,
    engagement: Arc<dyn EngagementService>,
    signals: DashMap<ConnectionId, SignalSender>,
    signal_buffer: usize,
}

impl EventRouter {
    pub fn new(
        registry: ConnectionRegistry,
        relay: Arc<RelayManager>,
        engagement: Arc<dyn EngagementService>,
    ) -> Self {
        let signal_buffer = relay.config().signal_buffer;
        Self {
            registry,
            relay,
            engagement,
            signals: DashMap::new(),
            signal_buffer,
        }
    }

    async fn dispatch(&self, conn: &Arc<Connection>, event: ClientEvent) -> RouterResult {
        let identity = conn.identity();

        match event {
            ClientEvent::MessageSend(payload) => {
                let response = self.engagement.send_message(identity, &payload.content).await?;
                self.broadcast(identity, events::MESSAGE_SEND, &response.message)?;
                self.broadcast_leaderboard(identity).await
            }
            ClientEvent::ChatTyping(payload) => self.broadcast(
                identity,
                events::CHAT_TYPING,
                &TypingBroadcast {
                    participant_id: identity.participant_id,
                    is_typing: payload.is_typing,
                },
            ),
            ClientEvent::LeaderboardRequest => {
                let leaderboard = self.engagement.leaderboard(identity).await?;
                reply(conn, events::LEADERBOARD_UPDATED, &leaderboard);
                Ok(())
            }
            ClientEvent::QuestionSubmit(payload) => {
                let response = self
                    .engagement
                    .submit_question(identity, &payload.content)
                    .await?;
                self.broadcast(identity, events::QUESTION_CREATED, &response)?;
                self.broadcast_leaderboard(identity).await
            }
            ClientEvent::QuestionUpvote(payload) => {
                let response = self
                    .engagement
                    .upvote_question(identity, payload.question_id)
                    .await?;
                self.broadcast_upvote(identity, response.question, "add")?;
                self.broadcast_leaderboard(identity).await
            }
            ClientEvent::QuestionRemoveUpvote(payload) => {
                let response = self
                    .engagement
                    .remove_upvote(identity, payload.question_id)
                    .await?;
                self.broadcast_upvote(identity, response.question, "remove")?;
                self.broadcast_leaderboard(identity).await
            }
            ClientEvent::WebrtcOffer(payload) => {
                debug!(
                    connection_id = %conn.id(),
                    renegotiate = payload.renegotiate,
                    reason = payload.reason.as_deref().unwrap_or(""),
                    "Received offer"
                );
                let signals = self.signal_sender(conn);
                self.relay
                    .handle_offer(
                        &relay_room(identity),
                        &peer_id(identity),
                        SessionDescription::offer(payload.sdp),
                        payload.renegotiate,
                        signals,
                    )
                    .await?;
                Ok(())
            }
            ClientEvent::WebrtcAnswer(answer) => {
                let result = self
                    .relay
                    .handle_answer(&relay_room(identity), &peer_id(identity), answer)
                    .await;
                ignore_late_signal(conn, result)
            }
            ClientEvent::WebrtcCandidate(candidate) => {
                let result = self
                    .relay
                    .handle_candidate(&relay_room(identity), &peer_id(identity), candidate)
                    .await;
                ignore_late_signal(conn, result)
            }
            ClientEvent::ConferenceStart => self.start_conference(conn).await,
            ClientEvent::ConferenceStop => self.stop_conference(identity).await,
            ClientEvent::ConferenceJoin => self.join_conference(conn).await,
            ClientEvent::ConferenceLeave => {
                let peer = peer_id(identity);
                self.broadcast(identity, events::CONFERENCE_LEFT, &StagePayload::of(&peer))
            }
            ClientEvent::RaiseHand => {
                let peer = peer_id(identity);
                let timestamp = chrono::Utc::now().timestamp();
                let room = self.conference_room(identity)?;
                room.raise_hand(&peer, timestamp).await;
                self.broadcast(
                    identity,
                    events::HAND_RAISED,
                    &StagePayload {
                        timestamp: Some(timestamp),
                        ..StagePayload::of(&peer)
                    },
                )
            }
            ClientEvent::LowerHand => {
                let peer = peer_id(identity);
                if let Some(room) = self.relay.get_room(&relay_room(identity)) {
                    room.lower_hand(&peer).await;
                }
                self.broadcast(identity, events::HAND_LOWERED, &StagePayload::of(&peer))
            }
            ClientEvent::PromoteSpeaker(target) => {
                let target = PeerId::new(target.participant_id.to_string());
                let room = self.conference_room(identity)?;
                if !room.promote_speaker(&peer_id(identity), &target).await {
                    return Err(RouterError::Unauthorized(
                        "Only the conference host can promote speakers".to_string(),
                    ));
                }
                self.broadcast(identity, events::SPEAKER_PROMOTED, &StagePayload::of(&target))
            }
            ClientEvent::DemoteSpeaker(target) => {
                let target = PeerId::new(target.participant_id.to_string());
                let room = self.conference_room(identity)?;
                if !room.demote_speaker(&peer_id(identity), &target).await {
                    return Err(RouterError::Unauthorized(
                        "Only the conference host can demote speakers".to_string(),
                    ));
                }
                self.broadcast(identity, events::SPEAKER_DEMOTED, &StagePayload::of(&target))
            }
            ClientEvent::Unknown(name) => {
                debug!(connection_id = %conn.id(), event = %name, "Ignoring unknown event");
                Ok(())
            }
        }
    }

    async fn start_conference(&self, conn: &Arc<Connection>) -> RouterResult {
        let identity = conn.identity();
        if !identity.is_room_owner {
            return Err(RouterError::Unauthorized(
                "Only the room owner can start the conference".to_string(),
            ));
        }

        let room = self.conference_room(identity)?;
        if room.start_conference(&peer_id(identity)).await {
            let state = room.conference_state().await;
            self.broadcast(identity, events::CONFERENCE_STARTED, &state)
        } else {
            let state = room.conference_state().await;
            reply(conn, events::CONFERENCE_STATE, &StateReply { state, is_room_owner: true });
            Ok(())
        }
    }

    async fn stop_conference(&self, identity: &Identity) -> RouterResult {
        let unauthorized = || {
            RouterError::Unauthorized("Only the conference host can stop the conference".to_string())
        };
        if !identity.is_room_owner {
            return Err(unauthorized());
        }

        let room_id = relay_room(identity);
        let room = self.relay.get_room(&room_id).ok_or_else(unauthorized)?;
        if !room.stop_conference(&peer_id(identity)).await {
            return Err(unauthorized());
        }

        self.broadcast(identity, events::CONFERENCE_ENDED, &ConferenceState::default())?;
        self.relay.release_if_idle(&room_id).await;
        Ok(())
    }

    async fn join_conference(&self, conn: &Arc<Connection>) -> RouterResult {
        let identity = conn.identity();
        let state = match self.relay.get_room(&relay_room(identity)) {
            Some(room) => room.conference_state().await,
            None => ConferenceState::default(),
        };
        reply(
            conn,
            events::CONFERENCE_STATE,
            &StateReply {
                state,
                is_room_owner: identity.is_room_owner,
            },
        );

        let peer = peer_id(identity);
        self.broadcast(
            identity,
            events::CONFERENCE_JOINED,
            &StagePayload {
                is_room_owner: Some(identity.is_room_owner),
                ..StagePayload::of(&peer)
            },
        )
    }

    fn conference_room(&self, identity: &Identity) -> RouterResult<Arc<ConferenceRoom>> {
        Ok(self.relay.get_or_create_room(&relay_room(identity))?)
    }

    fn broadcast<T: Serialize>(&self, identity: &Identity, event: &str, data: &T) -> RouterResult {
        self.registry
            .broadcast_event(identity.room_id, event, data)
            .map_err(|e| RouterError::Usecase(e.into()))
    }

    async fn broadcast_leaderboard(&self, identity: &Identity) -> RouterResult {
        let leaderboard = self.engagement.leaderboard(identity).await?;
        self.broadcast(
            identity,
            events::LEADERBOARD_UPDATED,
            &LeaderboardBroadcast {
                leaderboard: &leaderboard.leaderboard,
                total_participants: leaderboard.total_participants,
            },
        )
    }

    fn broadcast_upvote(
        &self,
        identity: &Identity,
        question: QuestionUpvoteInfo,
        action: &'static str,
    ) -> RouterResult {
        self.broadcast(
            identity,
            events::QUESTION_UPVOTED,
            &UpvoteBroadcast {
                question,
                participant_id: identity.participant_id,
                action,
            },
        )
    }

    /// The connection's signal channel, created with its forwarder on first use
    fn signal_sender(&self, conn: &Arc<Connection>) -> SignalSender {
        self.signals
            .entry(conn.id().to_string())
            .or_insert_with(|| {
                let (sender, rx) =
                    SignalSender::channel(peer_id(conn.identity()), self.signal_buffer);
                tokio::spawn(forward_signals(Arc::clone(conn), rx));
                sender
            })
            .clone()
    }
}

#[async_trait]
impl MessageHandler for EventRouter {
    async fn handle(&self, conn: &Arc<Connection>, frame: &[u8]) {
        let envelope: RawEnvelope = match serde_json::from_slice(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                count("invalid", "error");
                report(conn, "unknown", &RouterError::Decode(e));
                return;
            }
        };

        let name = envelope.event.clone();
        let result = match ClientEvent::from_envelope(envelope) {
            Ok(event) => self.dispatch(conn, event).await,
            Err(e) => Err(RouterError::Decode(e)),
        };

        let label = if events::INBOUND.contains(&name.as_str()) {
            name.as_str()
        } else {
            "unknown"
        };
        match result {
            Ok(()) => count(label, "ok"),
            Err(e) => {
                count(label, "error");
                report(conn, &name, &e);
            }
        }
    }

    async fn on_disconnect(&self, conn: &Arc<Connection>) {
        let identity = conn.identity();
        let room_id = relay_room(identity);

        // Only a connection that negotiated media can own a peer
        let Some((_, signals)) = self.signals.remove(conn.id()) else {
            self.relay.release_if_idle(&room_id).await;
            return;
        };

        let departure = self
            .relay
            .remove_owned_peer(&room_id, &peer_id(identity), &signals)
            .await;
        if departure.ended_conference {
            if let Err(e) = self.broadcast(identity, events::CONFERENCE_ENDED, &ConferenceState::default()) {
                warn!(connection_id = %conn.id(), error = %e, "Failed to announce conference end");
            }
        }
    }
}

/// Relay signals for one connection until the peer or the connection goes away
async fn forward_signals(conn: Arc<Connection>, mut rx: mpsc::Receiver<Signal>) {
    loop {
        let signal = tokio::select! {
            () = conn.closed() => break,
            signal = rx.recv() => match signal {
                Some(signal) => signal,
                None => break,
            },
        };

        let sent = match signal {
            Signal::Offer { sdp } => {
                conn.send_event(events::WEBRTC_OFFER, &SessionDescription::offer(sdp))
            }
            Signal::Answer { sdp } => {
                conn.send_event(events::WEBRTC_ANSWER, &SessionDescription::answer(sdp))
            }
            Signal::Candidate(candidate) => {
                conn.send_event::<IceCandidate>(events::WEBRTC_CANDIDATE, &candidate)
            }
        };
        if let Err(e) = sent {
            warn!(connection_id = %conn.id(), error = %e, "Failed to relay signal");
        }
    }
    debug!(connection_id = %conn.id(), "Signal forwarder stopped");
}

fn relay_room(identity: &Identity) -> liveroom_sfu::RoomId {
    liveroom_sfu::RoomId::new(identity.room_id.to_string())
}

fn peer_id(identity: &Identity) -> PeerId {
    PeerId::new(identity.participant_id.to_string())
}

fn ignore_late_signal(conn: &Connection, result: liveroom_sfu::Result<()>) -> RouterResult {
    match result {
        Err(e) if e.is_not_found() => {
            debug!(connection_id = %conn.id(), error = %e, "Dropping signal for missing peer");
            Ok(())
        }
        other => Ok(other?),
    }
}

fn reply<T: Serialize>(conn: &Connection, event: &str, data: &T) {
    if let Err(e) = conn.send_event(event, data) {
        warn!(connection_id = %conn.id(), event, error = %e, "Failed to send reply");
    }
}

fn report(conn: &Connection, event: &str, error: &RouterError) {
    match error {
        RouterError::Usecase(e) if !e.is_client_error() => {
            warn!(connection_id = %conn.id(), event, error = %e, "Event failed");
        }
        RouterError::Relay(e) => {
            warn!(connection_id = %conn.id(), event, error = %e, "Relay operation failed");
        }
        _ => {
            info!(connection_id = %conn.id(), event, error = %error, "Rejected event");
        }
    }

    reply(
        conn,
        events::ERROR,
        &ErrorPayload {
            event,
            message: error.client_message(),
        },
    );
}

fn count(event: &str, outcome: &str) {
    metrics::WEBSOCKET_EVENTS_TOTAL
        .with_label_values(&[event, outcome])
        .inc();
}
