//! Conference room: the media peers of one application room, the tracks
//! they publish and the room's conference-mode state.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::conference::ConferenceState;
use crate::error::{Result, SfuError};
use crate::peer::MediaPeer;
use crate::session::{ConnectionState, SessionEvent, SessionEvents, SessionFactory};
use crate::signal::SignalSender;
use crate::track::{ForwardedTrack, InboundTrack};
use crate::types::{PeerId, RoomId};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomStats {
    pub peer_count: usize,
    pub track_count: usize,
    pub conference_active: bool,
    pub packets_forwarded: u64,
    pub bytes_forwarded: u64,
}

/// What a peer's departure changed in its room
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Departure {
    /// A media peer was removed and closed
    pub removed: bool,
    /// The departing peer hosted the conference, which is now over
    pub ended_conference: bool,
}

#[derive(Default)]
struct RoomState {
    peers: HashMap<PeerId, Arc<MediaPeer>>,
    tracks: Vec<ForwardedTrack>,
    conference: ConferenceState,
}

impl RoomState {
    /// Cancel and drop every track published by `source`
    fn purge_tracks(&mut self, source: &PeerId) -> usize {
        let before = self.tracks.len();
        self.tracks.retain(|track| {
            if track.source() == source {
                track.cancel();
                false
            } else {
                true
            }
        });
        before - self.tracks.len()
    }
}

pub struct ConferenceRoom {
    id: RoomId,
    factory: Arc<dyn SessionFactory>,
    max_peers: usize,
    state: RwLock<RoomState>,
    /// Set under the state lock once the room is empty and handed back to
    /// the manager; joins against a retired room fail with `RoomRetired`
    retired: AtomicBool,
}

impl std::fmt::Debug for ConferenceRoom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConferenceRoom")
            .field("id", &self.id)
            .field("max_peers", &self.max_peers)
            .field("retired", &self.is_retired())
            .finish_non_exhaustive()
    }
}

impl ConferenceRoom {
    pub fn new(id: RoomId, factory: Arc<dyn SessionFactory>, max_peers: usize) -> Arc<Self> {
        Arc::new(Self {
            id,
            factory,
            max_peers,
            state: RwLock::new(RoomState::default()),
            retired: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub const fn id(&self) -> &RoomId {
        &self.id
    }

    /// Create a media peer for `peer_id`, replacing any earlier one, and
    /// subscribe it to every track already forwarded in the room
    pub async fn join(self: &Arc<Self>, peer_id: PeerId, signals: SignalSender) -> Result<Arc<MediaPeer>> {
        let (session, events) = self.factory.create_session(&peer_id).await?;
        let peer = Arc::new(MediaPeer::new(peer_id.clone(), session, signals));

        let (replaced, subscribed) = {
            let mut state = self.state.write().await;

            if let Err(e) = self.admit(&state, &peer_id) {
                drop(state);
                peer.close().await;
                return Err(e);
            }

            let replaced = state.peers.remove(&peer_id);
            if replaced.is_some() {
                let purged = state.purge_tracks(&peer_id);
                debug!(room_id = %self.id, peer_id = %peer_id, purged, "Replacing existing peer");
            }

            state.peers.insert(peer_id.clone(), Arc::clone(&peer));

            let mut subscribed = 0;
            for track in &state.tracks {
                match peer.add_track(track.local()).await {
                    Ok(()) => subscribed += 1,
                    Err(e) => warn!(
                        room_id = %self.id,
                        peer_id = %peer_id,
                        track_id = %track.id(),
                        error = %e,
                        "Failed to subscribe peer to existing track"
                    ),
                }
            }

            (replaced, subscribed)
        };

        self.spawn_event_loop(&peer, events);

        if let Some(old) = replaced {
            old.close().await;
        }

        if subscribed > 0 {
            if let Err(e) = peer.negotiate().await {
                warn!(room_id = %self.id, peer_id = %peer_id, error = %e, "Initial negotiation failed");
            }
        }

        info!(
            room_id = %self.id,
            peer_id = %peer_id,
            subscribed_tracks = subscribed,
            "Peer joined room"
        );

        Ok(peer)
    }

    fn admit(&self, state: &RoomState, peer_id: &PeerId) -> Result<()> {
        if self.is_retired() {
            return Err(SfuError::RoomRetired(self.id.clone()));
        }
        if self.max_peers > 0
            && !state.peers.contains_key(peer_id)
            && state.peers.len() >= self.max_peers
        {
            warn!(
                room_id = %self.id,
                current_peers = state.peers.len(),
                max_peers = self.max_peers,
                "Peer limit reached for room"
            );
            return Err(SfuError::PeerLimitReached(self.id.clone()));
        }
        Ok(())
    }

    /// Remove a peer with its tracks, raised hand and speaker slot.
    /// Returns whether a media peer was present.
    pub async fn leave(&self, peer_id: &PeerId) -> bool {
        self.depart(peer_id, None).await.removed
    }

    /// Like [`leave`](Self::leave), but only when the current peer signals
    /// through `owner`; a peer that was replaced by a newer connection of the
    /// same participant stays in the room
    pub async fn leave_owned(&self, peer_id: &PeerId, owner: &SignalSender) -> Departure {
        self.depart(peer_id, Some(owner)).await
    }

    async fn depart(&self, peer_id: &PeerId, owner: Option<&SignalSender>) -> Departure {
        let (removed, ended_conference) = {
            let mut state = self.state.write().await;

            if let Some(owner) = owner {
                let owned = state
                    .peers
                    .get(peer_id)
                    .is_some_and(|peer| peer.signals_to(owner));
                if !owned {
                    debug!(room_id = %self.id, peer_id = %peer_id, "Peer is held by another connection, keeping it");
                    return Departure::default();
                }
            }

            let removed = state.peers.remove(peer_id);
            let purged = state.purge_tracks(peer_id);
            let ended_conference = state.conference.remove_participant(peer_id);
            if purged > 0 {
                debug!(room_id = %self.id, peer_id = %peer_id, purged, "Stopped tracks of departing peer");
            }
            (removed, ended_conference)
        };

        if ended_conference {
            info!(room_id = %self.id, host_id = %peer_id, "Conference ended, host left");
        }

        let removed = match removed {
            Some(peer) => {
                peer.close().await;
                info!(room_id = %self.id, peer_id = %peer_id, "Peer left room");
                true
            }
            None => false,
        };

        Departure {
            removed,
            ended_conference,
        }
    }

    /// Mirror `remote` to every other peer in the room
    pub async fn broadcast_track(&self, source: &PeerId, remote: Arc<dyn InboundTrack>) {
        self.fan_out(source, None, remote).await;
    }

    async fn fan_out(&self, source: &PeerId, publisher: Option<&Arc<MediaPeer>>, remote: Arc<dyn InboundTrack>) {
        let track = ForwardedTrack::mirror(source.clone(), remote.as_ref());

        let targets: Vec<Arc<MediaPeer>> = {
            let mut state = self.state.write().await;
            let current = state.peers.get(source);
            let still_here = match (current, publisher) {
                (Some(current), Some(publisher)) => Arc::ptr_eq(current, publisher),
                (Some(_), None) => true,
                (None, _) => false,
            };
            if !still_here {
                debug!(
                    room_id = %self.id,
                    source_id = %source,
                    track_id = %track.id(),
                    "Ignoring track from a peer no longer in the room"
                );
                return;
            }

            state.tracks.push(track.clone());
            state
                .peers
                .iter()
                .filter(|(id, _)| *id != source)
                .map(|(_, peer)| Arc::clone(peer))
                .collect()
        };

        info!(
            room_id = %self.id,
            source_id = %source,
            track_id = %track.id(),
            kind = ?track.kind(),
            subscribers = targets.len(),
            "Broadcasting new track"
        );

        for peer in targets {
            if let Err(e) = peer.add_track(track.local()).await {
                warn!(room_id = %self.id, peer_id = %peer.id(), error = %e, "Failed to add track to peer");
                continue;
            }
            if let Err(e) = peer.negotiate().await {
                warn!(room_id = %self.id, peer_id = %peer.id(), error = %e, "Renegotiation for new track failed");
            }
        }

        track.spawn_forwarding(remote);
    }

    fn spawn_event_loop(self: &Arc<Self>, peer: &Arc<MediaPeer>, events: SessionEvents) {
        let room = Arc::downgrade(self);
        let peer = Arc::clone(peer);
        tokio::spawn(run_peer_events(room, peer, events));
    }

    pub async fn get_peer(&self, peer_id: &PeerId) -> Option<Arc<MediaPeer>> {
        self.state.read().await.peers.get(peer_id).cloned()
    }

    pub async fn peer_count(&self) -> usize {
        self.state.read().await.peers.len()
    }

    pub async fn track_count(&self) -> usize {
        self.state.read().await.tracks.len()
    }

    pub async fn forwarded_tracks(&self) -> Vec<ForwardedTrack> {
        self.state.read().await.tracks.clone()
    }

    pub async fn start_conference(&self, host: &PeerId) -> bool {
        let started = self.state.write().await.conference.start(host);
        if started {
            info!(room_id = %self.id, host_id = %host, "Conference started");
        }
        started
    }

    pub async fn stop_conference(&self, participant: &PeerId) -> bool {
        let stopped = self.state.write().await.conference.stop(participant);
        if stopped {
            info!(room_id = %self.id, host_id = %participant, "Conference stopped");
        }
        stopped
    }

    pub async fn raise_hand(&self, participant: &PeerId, timestamp: i64) {
        self.state.write().await.conference.raise_hand(participant, timestamp);
    }

    pub async fn lower_hand(&self, participant: &PeerId) -> bool {
        self.state.write().await.conference.lower_hand(participant)
    }

    pub async fn promote_speaker(&self, host: &PeerId, participant: &PeerId) -> bool {
        self.state.write().await.conference.promote(host, participant)
    }

    pub async fn demote_speaker(&self, host: &PeerId, participant: &PeerId) -> bool {
        self.state.write().await.conference.demote(host, participant)
    }

    pub async fn is_host(&self, participant: &PeerId) -> bool {
        self.state.read().await.conference.is_host(participant)
    }

    pub async fn is_speaker(&self, participant: &PeerId) -> bool {
        self.state.read().await.conference.is_speaker(participant)
    }

    pub async fn conference_state(&self) -> ConferenceState {
        self.state.read().await.conference.clone()
    }

    pub async fn stats(&self) -> RoomStats {
        let state = self.state.read().await;
        let (packets_forwarded, bytes_forwarded) = state
            .tracks
            .iter()
            .map(ForwardedTrack::stats)
            .fold((0, 0), |(p, b), s| (p + s.packets_forwarded, b + s.bytes_forwarded));

        RoomStats {
            peer_count: state.peers.len(),
            track_count: state.tracks.len(),
            conference_active: state.conference.is_active,
            packets_forwarded,
            bytes_forwarded,
        }
    }

    #[must_use]
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// Retire the room once its peer map is empty; conference state goes
    /// with it
    pub async fn retire_if_idle(&self) -> bool {
        let state = self.state.write().await;
        if !state.peers.is_empty() {
            return false;
        }
        self.retired.store(true, Ordering::SeqCst);
        debug!(room_id = %self.id, "Room retired");
        true
    }

    /// Close every peer and stop every track
    pub async fn close_all(&self) {
        let peers: Vec<Arc<MediaPeer>> = {
            let mut state = self.state.write().await;
            self.retired.store(true, Ordering::SeqCst);
            for track in state.tracks.drain(..) {
                track.cancel();
            }
            state.conference = ConferenceState::default();
            state.peers.drain().map(|(_, peer)| peer).collect()
        };

        for peer in &peers {
            peer.close().await;
        }
        info!(room_id = %self.id, closed_peers = peers.len(), "Room closed");
    }
}

async fn run_peer_events(room: Weak<ConferenceRoom>, peer: Arc<MediaPeer>, mut events: SessionEvents) {
    let shutdown = peer.shutdown_token();

    loop {
        let event = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            SessionEvent::LocalCandidate(candidate) => peer.send_candidate(candidate),
            SessionEvent::RemoteTrack(remote) => {
                let Some(room) = room.upgrade() else { break };
                info!(room_id = %room.id, peer_id = %peer.id(), track_id = %remote.id(), "Track received");
                room.fan_out(peer.id(), Some(&peer), remote).await;
            }
            SessionEvent::NegotiationNeeded => {
                if let Err(e) = peer.negotiate().await {
                    warn!(peer_id = %peer.id(), error = %e, "Negotiation failed");
                }
            }
            SessionEvent::StateChanged(ConnectionState::Failed) => {
                warn!(peer_id = %peer.id(), "Peer connection failed");
            }
            SessionEvent::StateChanged(state) => {
                debug!(peer_id = %peer.id(), state = ?state, "Peer connection state changed");
            }
        }
    }

    debug!(peer_id = %peer.id(), "Peer event loop stopped");
}
