//! Relay manager - room registry and signaling entry point
//!
//! One [`RelayManager`] is created at startup and shared by every
//! connection. Rooms are created on first use and retired as soon as their
//! last media peer leaves.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::SfuConfig;
use crate::error::{Result, SfuError};
use crate::peer::MediaPeer;
use crate::room::{ConferenceRoom, Departure};
use crate::session::{SessionFactory, WebRtcSessionFactory};
use crate::signal::{IceCandidate, SessionDescription, SignalSender};
use crate::types::{PeerId, RoomId};

/// A join racing with room retirement is retried on a fresh room this many times
const JOIN_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerStats {
    pub rooms: usize,
    pub peers: usize,
    pub tracks: usize,
}

pub struct RelayManager {
    config: SfuConfig,
    factory: Arc<dyn SessionFactory>,
    rooms: Mutex<HashMap<RoomId, Arc<ConferenceRoom>>>,
}

impl RelayManager {
    pub fn new(config: SfuConfig, factory: Arc<dyn SessionFactory>) -> Arc<Self> {
        info!(
            ice_servers = config.ice_servers.len(),
            max_rooms = config.max_rooms,
            max_peers_per_room = config.max_peers_per_room,
            "Relay manager initialized"
        );

        Arc::new(Self {
            config,
            factory,
            rooms: Mutex::new(HashMap::new()),
        })
    }

    /// Manager backed by real `webrtc` peer connections
    pub fn with_webrtc(config: SfuConfig) -> Result<Arc<Self>> {
        let factory = Arc::new(WebRtcSessionFactory::new(&config)?);
        Ok(Self::new(config, factory))
    }

    #[must_use]
    pub const fn config(&self) -> &SfuConfig {
        &self.config
    }

    /// Get or create a room
    pub fn get_or_create_room(&self, room_id: &RoomId) -> Result<Arc<ConferenceRoom>> {
        let mut rooms = self.rooms.lock();

        if let Some(room) = rooms.get(room_id) {
            if !room.is_retired() {
                return Ok(Arc::clone(room));
            }
            rooms.remove(room_id);
        }

        if self.config.max_rooms > 0 && rooms.len() >= self.config.max_rooms {
            warn!(
                current_rooms = rooms.len(),
                max_rooms = self.config.max_rooms,
                "Room limit reached"
            );
            return Err(SfuError::RoomLimitReached);
        }

        let room = ConferenceRoom::new(
            room_id.clone(),
            Arc::clone(&self.factory),
            self.config.max_peers_per_room,
        );
        rooms.insert(room_id.clone(), Arc::clone(&room));

        info!(room_id = %room_id, total_rooms = rooms.len(), "Created new room");
        Ok(room)
    }

    #[must_use]
    pub fn get_room(&self, room_id: &RoomId) -> Option<Arc<ConferenceRoom>> {
        self.rooms
            .lock()
            .get(room_id)
            .filter(|room| !room.is_retired())
            .cloned()
    }

    pub async fn create_peer(
        &self,
        room_id: &RoomId,
        peer_id: &PeerId,
        signals: SignalSender,
    ) -> Result<Arc<MediaPeer>> {
        let mut attempt = 1;
        loop {
            let room = self.get_or_create_room(room_id)?;
            match room.join(peer_id.clone(), signals.clone()).await {
                Err(SfuError::RoomRetired(_)) if attempt < JOIN_ATTEMPTS => {
                    debug!(room_id = %room_id, peer_id = %peer_id, attempt, "Room retired during join, retrying");
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Apply a client offer.
    ///
    /// A renegotiation offer goes to the existing peer; any other offer
    /// starts a fresh media peer, replacing one that may already exist.
    pub async fn handle_offer(
        &self,
        room_id: &RoomId,
        peer_id: &PeerId,
        offer: SessionDescription,
        renegotiate: bool,
        signals: SignalSender,
    ) -> Result<()> {
        if renegotiate {
            if let Some(peer) = self.find_peer(room_id, peer_id).await {
                debug!(room_id = %room_id, peer_id = %peer_id, "Applying renegotiation offer");
                return peer.handle_offer(offer).await;
            }
        }

        let peer = self.create_peer(room_id, peer_id, signals).await?;
        peer.handle_offer(offer).await
    }

    pub async fn handle_answer(
        &self,
        room_id: &RoomId,
        peer_id: &PeerId,
        answer: SessionDescription,
    ) -> Result<()> {
        self.peer(room_id, peer_id).await?.handle_answer(answer).await
    }

    pub async fn handle_candidate(
        &self,
        room_id: &RoomId,
        peer_id: &PeerId,
        candidate: IceCandidate,
    ) -> Result<()> {
        self.peer(room_id, peer_id).await?.handle_candidate(candidate).await
    }

    /// Drop a participant's media peer and release the room if it is now empty
    pub async fn remove_peer(&self, room_id: &RoomId, peer_id: &PeerId) -> Departure {
        self.depart(room_id, peer_id, None).await
    }

    /// Drop the participant's media peer only if it still signals through
    /// `owner`; a reconnect that already replaced the peer keeps it
    pub async fn remove_owned_peer(
        &self,
        room_id: &RoomId,
        peer_id: &PeerId,
        owner: &SignalSender,
    ) -> Departure {
        self.depart(room_id, peer_id, Some(owner)).await
    }

    async fn depart(&self, room_id: &RoomId, peer_id: &PeerId, owner: Option<&SignalSender>) -> Departure {
        let Some(room) = self.get_room(room_id) else {
            debug!(room_id = %room_id, peer_id = %peer_id, "Room not found when removing peer");
            return Departure::default();
        };

        let departure = match owner {
            Some(owner) => room.leave_owned(peer_id, owner).await,
            None => Departure {
                removed: room.leave(peer_id).await,
                ..Departure::default()
            },
        };
        self.release_room(room).await;
        departure
    }

    /// Remove the room if it has no media peers
    pub async fn release_if_idle(&self, room_id: &RoomId) -> bool {
        match self.get_room(room_id) {
            Some(room) => self.release_room(room).await,
            None => false,
        }
    }

    async fn release_room(&self, room: Arc<ConferenceRoom>) -> bool {
        if !room.retire_if_idle().await {
            return false;
        }

        let mut rooms = self.rooms.lock();
        if rooms
            .get(room.id())
            .is_some_and(|current| Arc::ptr_eq(current, &room))
        {
            rooms.remove(room.id());
            info!(room_id = %room.id(), total_rooms = rooms.len(), "Removed idle room");
        }
        true
    }

    async fn find_peer(&self, room_id: &RoomId, peer_id: &PeerId) -> Option<Arc<MediaPeer>> {
        let room = self.get_room(room_id)?;
        room.get_peer(peer_id).await
    }

    async fn peer(&self, room_id: &RoomId, peer_id: &PeerId) -> Result<Arc<MediaPeer>> {
        let room = self
            .get_room(room_id)
            .ok_or_else(|| SfuError::RoomNotFound(room_id.clone()))?;
        room.get_peer(peer_id)
            .await
            .ok_or_else(|| SfuError::PeerNotFound(peer_id.clone()))
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.lock().len()
    }

    pub async fn stats(&self) -> ManagerStats {
        let rooms: Vec<Arc<ConferenceRoom>> = self.rooms.lock().values().cloned().collect();

        let mut stats = ManagerStats {
            rooms: rooms.len(),
            ..Default::default()
        };
        for room in rooms {
            let room_stats = room.stats().await;
            stats.peers += room_stats.peer_count;
            stats.tracks += room_stats.track_count;
        }
        stats
    }

    /// Close every room; used on graceful shutdown
    pub async fn shutdown(&self) {
        let rooms: Vec<Arc<ConferenceRoom>> = self.rooms.lock().drain().map(|(_, room)| room).collect();
        info!(rooms = rooms.len(), "Shutting down relay manager");

        for room in rooms {
            room.close_all().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::FakeFactory;
    use crate::signal::Signal;
    use crate::track::testing::ChannelTrack;
    use crate::track::TrackKind;
    use tokio::sync::mpsc;

    fn manager(config: SfuConfig) -> (Arc<RelayManager>, Arc<FakeFactory>) {
        let factory = Arc::new(FakeFactory::default());
        (RelayManager::new(config, factory.clone()), factory)
    }

    fn signals(id: &str) -> (SignalSender, mpsc::Receiver<Signal>) {
        SignalSender::channel(PeerId::from(id), 16)
    }

    #[tokio::test]
    async fn test_offer_creates_room_and_peer() {
        let (manager, _factory) = manager(SfuConfig::default());
        let room_id = RoomId::from("1");
        let (tx, mut rx) = signals("10");

        manager
            .handle_offer(&room_id, &PeerId::from("10"), SessionDescription::offer("o"), false, tx)
            .await
            .unwrap();

        assert_eq!(manager.room_count(), 1);
        assert!(matches!(rx.try_recv().unwrap(), Signal::Answer { .. }));
        assert_eq!(
            manager.stats().await,
            ManagerStats {
                rooms: 1,
                peers: 1,
                tracks: 0
            }
        );
    }

    #[tokio::test]
    async fn test_renegotiation_reuses_peer() {
        let (manager, factory) = manager(SfuConfig::default());
        let room_id = RoomId::from("1");
        let peer_id = PeerId::from("10");
        let (tx, mut rx) = signals("10");

        manager
            .handle_offer(&room_id, &peer_id, SessionDescription::offer("o1"), false, tx.clone())
            .await
            .unwrap();
        let first = factory.session("10").unwrap();

        manager
            .handle_offer(&room_id, &peer_id, SessionDescription::offer("o2"), true, tx)
            .await
            .unwrap();

        assert!(Arc::ptr_eq(&first, &factory.session("10").unwrap()));
        assert!(!first.is_closed());
        assert!(matches!(rx.try_recv().unwrap(), Signal::Answer { .. }));
        assert!(matches!(rx.try_recv().unwrap(), Signal::Answer { .. }));
    }

    #[tokio::test]
    async fn test_fresh_offer_replaces_peer() {
        let (manager, factory) = manager(SfuConfig::default());
        let room_id = RoomId::from("1");
        let peer_id = PeerId::from("10");
        let (tx, _rx) = signals("10");

        manager
            .handle_offer(&room_id, &peer_id, SessionDescription::offer("o1"), false, tx.clone())
            .await
            .unwrap();
        let first = factory.session("10").unwrap();

        manager
            .handle_offer(&room_id, &peer_id, SessionDescription::offer("o2"), false, tx)
            .await
            .unwrap();

        assert!(first.is_closed());
        assert_eq!(manager.stats().await.peers, 1);
    }

    #[tokio::test]
    async fn test_answer_and_candidate_for_unknown_peer() {
        let (manager, _factory) = manager(SfuConfig::default());
        let room_id = RoomId::from("1");
        let peer_id = PeerId::from("10");

        let err = manager
            .handle_answer(&room_id, &peer_id, SessionDescription::answer("a"))
            .await
            .unwrap_err();
        assert!(matches!(err, SfuError::RoomNotFound(_)));
        assert_eq!(manager.room_count(), 0);

        manager.get_or_create_room(&room_id).unwrap();
        let err = manager
            .handle_candidate(&room_id, &peer_id, IceCandidate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SfuError::PeerNotFound(_)));
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_remove_last_peer_retires_room() {
        let (manager, factory) = manager(SfuConfig::default());
        let room_id = RoomId::from("1");
        let (tx, _rx) = signals("10");

        let room = manager.get_or_create_room(&room_id).unwrap();
        manager.create_peer(&room_id, &PeerId::from("10"), tx).await.unwrap();

        manager.remove_peer(&room_id, &PeerId::from("10")).await;

        assert_eq!(manager.room_count(), 0);
        assert!(room.is_retired());
        assert!(factory.session("10").unwrap().is_closed());

        // Removing again is harmless
        manager.remove_peer(&room_id, &PeerId::from("10")).await;
    }

    #[tokio::test]
    async fn test_room_with_active_conference_is_removed_when_empty() {
        let (manager, _factory) = manager(SfuConfig::default());
        let room_id = RoomId::from("1");
        let host = PeerId::from("10");
        let (tx, _rx) = signals("10");

        manager.create_peer(&room_id, &host, tx.clone()).await.unwrap();
        let room = manager.get_room(&room_id).unwrap();
        room.start_conference(&host).await;

        let departure = manager.remove_owned_peer(&room_id, &host, &tx).await;
        assert!(departure.removed);
        assert!(departure.ended_conference);
        assert_eq!(manager.room_count(), 0);
        assert!(room.is_retired());
    }

    #[tokio::test]
    async fn test_empty_room_with_conference_is_released() {
        let (manager, _factory) = manager(SfuConfig::default());
        let room_id = RoomId::from("1");

        let room = manager.get_or_create_room(&room_id).unwrap();
        room.start_conference(&PeerId::from("10")).await;

        assert!(manager.release_if_idle(&room_id).await);
        assert_eq!(manager.room_count(), 0);
    }

    #[tokio::test]
    async fn test_stale_disconnect_keeps_reconnected_peer() {
        let (manager, factory) = manager(SfuConfig::default());
        let room_id = RoomId::from("1");
        let peer_id = PeerId::from("5");
        let (old_tx, _old_rx) = signals("5");
        let (new_tx, mut new_rx) = signals("5");

        manager
            .handle_offer(&room_id, &peer_id, SessionDescription::offer("o1"), false, old_tx.clone())
            .await
            .unwrap();
        manager
            .handle_offer(&room_id, &peer_id, SessionDescription::offer("o2"), false, new_tx)
            .await
            .unwrap();
        let live = factory.session("5").unwrap();

        let departure = manager.remove_owned_peer(&room_id, &peer_id, &old_tx).await;

        assert_eq!(departure, Departure::default());
        assert!(!live.is_closed());
        assert_eq!(manager.room_count(), 1);
        assert!(matches!(new_rx.try_recv().unwrap(), Signal::Answer { .. }));
    }

    #[tokio::test]
    async fn test_join_after_retirement_uses_fresh_room() {
        let (manager, _factory) = manager(SfuConfig::default());
        let room_id = RoomId::from("1");

        let stale = manager.get_or_create_room(&room_id).unwrap();
        assert!(stale.retire_if_idle().await);

        let (tx, _rx) = signals("10");
        manager.create_peer(&room_id, &PeerId::from("10"), tx).await.unwrap();

        let fresh = manager.get_room(&room_id).unwrap();
        assert!(!Arc::ptr_eq(&stale, &fresh));
        assert_eq!(fresh.peer_count().await, 1);
    }

    #[tokio::test]
    async fn test_room_limit() {
        let (manager, _factory) = manager(SfuConfig {
            max_rooms: 1,
            ..Default::default()
        });

        manager.get_or_create_room(&RoomId::from("1")).unwrap();
        manager.get_or_create_room(&RoomId::from("1")).unwrap();
        let err = manager.get_or_create_room(&RoomId::from("2")).unwrap_err();
        assert!(matches!(err, SfuError::RoomLimitReached));
    }

    #[tokio::test]
    async fn test_tracks_flow_between_peers_of_same_room() {
        let (manager, factory) = manager(SfuConfig::default());
        let room_id = RoomId::from("1");
        let (tx1, _rx1) = signals("1");
        let (tx2, _rx2) = signals("2");
        manager.create_peer(&room_id, &PeerId::from("1"), tx1).await.unwrap();
        manager.create_peer(&room_id, &PeerId::from("2"), tx2).await.unwrap();

        let (remote, _tx) = ChannelTrack::new("screen", TrackKind::Video);
        let room = manager.get_room(&room_id).unwrap();
        room.broadcast_track(&PeerId::from("1"), remote).await;

        assert_eq!(factory.session("2").unwrap().track_ids(), vec!["screen"]);
        assert_eq!(manager.stats().await.tracks, 1);
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let (manager, factory) = manager(SfuConfig::default());
        let (tx, _rx) = signals("1");
        manager
            .create_peer(&RoomId::from("1"), &PeerId::from("1"), tx)
            .await
            .unwrap();

        manager.shutdown().await;

        assert_eq!(manager.room_count(), 0);
        assert!(factory.session("1").unwrap().is_closed());
    }
}
