//! Connection registry
//!
//! Owns room membership. Register, unregister and broadcast each have their
//! own channel; one task consumes all of them, so membership changes and
//! fan-out never interleave and no lock guards the maps.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::Utf8Bytes;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use liveroom_core::models::{ParticipantId, RoomId, UserId};

use super::connection::{Connection, ConnectionId, SendError};
use super::message::{encode, events};
use crate::observability::metrics;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub connections: usize,
    pub rooms: usize,
}

/// `room:user_joined` / `room:user_left` data
#[derive(Debug, Clone, Serialize)]
pub struct PresencePayload {
    pub participant_id: ParticipantId,
    pub user_id: Option<UserId>,
    pub display_name: String,
    pub is_anonymous: bool,
}

impl PresencePayload {
    fn of(conn: &Connection) -> Self {
        let identity = conn.identity();
        Self {
            participant_id: identity.participant_id,
            user_id: identity.user_id,
            display_name: identity.display_name.clone(),
            is_anonymous: identity.is_anonymous,
        }
    }
}

enum Control {
    Stats(oneshot::Sender<HubStats>),
    CloseAll,
}

struct Broadcast {
    room_id: RoomId,
    frame: Utf8Bytes,
}

/// Handle to the registry task; cheap to clone
#[derive(Clone)]
pub struct ConnectionRegistry {
    register: mpsc::UnboundedSender<Arc<Connection>>,
    unregister: mpsc::UnboundedSender<Arc<Connection>>,
    broadcast: mpsc::UnboundedSender<Broadcast>,
    control: mpsc::UnboundedSender<Control>,
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("running", &!self.control.is_closed())
            .finish()
    }
}

impl ConnectionRegistry {
    /// Spawn the registry task. It stops once every handle is dropped.
    #[must_use]
    pub fn spawn() -> Self {
        let (register, register_rx) = mpsc::unbounded_channel();
        let (unregister, unregister_rx) = mpsc::unbounded_channel();
        let (broadcast, broadcast_rx) = mpsc::unbounded_channel();
        let (control, control_rx) = mpsc::unbounded_channel();

        tokio::spawn(run(Inbox {
            register: register_rx,
            unregister: unregister_rx,
            broadcast: broadcast_rx,
            control: control_rx,
        }));

        Self {
            register,
            unregister,
            broadcast,
            control,
        }
    }

    pub fn register(&self, conn: Arc<Connection>) {
        if self.register.send(conn).is_err() {
            debug!("Connection registry stopped, dropping register");
        }
    }

    /// Remove a connection and close it. Unknown connections are ignored.
    pub fn unregister(&self, conn: &Arc<Connection>) {
        if self.unregister.send(Arc::clone(conn)).is_err() {
            debug!("Connection registry stopped, dropping unregister");
        }
    }

    /// Queue `frame` for every connection in `room_id`
    pub fn broadcast(&self, room_id: RoomId, frame: Utf8Bytes) {
        if self.broadcast.send(Broadcast { room_id, frame }).is_err() {
            debug!(room_id = %room_id, "Connection registry stopped, dropping broadcast");
        }
    }

    pub fn broadcast_event<T: Serialize>(
        &self,
        room_id: RoomId,
        event: &str,
        data: &T,
    ) -> serde_json::Result<()> {
        self.broadcast(room_id, encode(event, data)?);
        Ok(())
    }

    /// Connection and room counts, after every command queued before it
    pub async fn stats(&self) -> HubStats {
        let (tx, rx) = oneshot::channel();
        if self.control.send(Control::Stats(tx)).is_err() {
            return HubStats::default();
        }
        rx.await.unwrap_or_default()
    }

    /// Close every connection; their pumps then unregister them
    pub fn close_all(&self) {
        let _ = self.control.send(Control::CloseAll);
    }
}

struct Inbox {
    register: mpsc::UnboundedReceiver<Arc<Connection>>,
    unregister: mpsc::UnboundedReceiver<Arc<Connection>>,
    broadcast: mpsc::UnboundedReceiver<Broadcast>,
    control: mpsc::UnboundedReceiver<Control>,
}

#[derive(Default)]
struct Registry {
    connections: HashMap<ConnectionId, Arc<Connection>>,
    rooms: HashMap<RoomId, HashMap<ConnectionId, Arc<Connection>>>,
}

async fn run(mut inbox: Inbox) {
    let mut registry = Registry::default();

    // Biased so a connection's register is always applied before its
    // unregister, and control queries observe everything queued before them.
    loop {
        tokio::select! {
            biased;
            Some(conn) = inbox.register.recv() => registry.register(conn),
            Some(conn) = inbox.unregister.recv() => registry.unregister(&conn),
            Some(Broadcast { room_id, frame }) = inbox.broadcast.recv() => {
                registry.broadcast(room_id, &frame);
            }
            Some(control) = inbox.control.recv() => match control {
                Control::Stats(reply) => {
                    let _ = reply.send(registry.stats());
                }
                Control::CloseAll => registry.close_all(),
            },
            else => break,
        }
        registry.update_gauges();
    }

    debug!("Connection registry stopped");
}

impl Registry {
    fn register(&mut self, conn: Arc<Connection>) {
        let room_id = conn.identity().room_id;
        let id = conn.id().to_string();

        self.connections.insert(id.clone(), Arc::clone(&conn));
        self.rooms
            .entry(room_id)
            .or_default()
            .insert(id, Arc::clone(&conn));

        info!(
            connection_id = %conn.id(),
            room_id = %room_id,
            participant_id = %conn.identity().participant_id,
            room_size = self.rooms.get(&room_id).map_or(0, HashMap::len),
            "Client registered"
        );

        self.announce(room_id, events::ROOM_USER_JOINED, &conn);
    }

    fn unregister(&mut self, conn: &Arc<Connection>) {
        if self.connections.remove(conn.id()).is_none() {
            return;
        }
        let room_id = conn.identity().room_id;

        // Members, the leaving one included, see the departure
        self.announce(room_id, events::ROOM_USER_LEFT, conn);

        if let Some(members) = self.rooms.get_mut(&room_id) {
            members.remove(conn.id());
            if members.is_empty() {
                self.rooms.remove(&room_id);
            }
        }
        conn.close();

        info!(
            connection_id = %conn.id(),
            room_id = %room_id,
            participant_id = %conn.identity().participant_id,
            "Client unregistered"
        );
    }

    fn announce(&self, room_id: RoomId, event: &str, conn: &Connection) {
        match encode(event, &PresencePayload::of(conn)) {
            Ok(frame) => self.broadcast(room_id, &frame),
            Err(e) => warn!(error = %e, event, "Failed to encode presence event"),
        }
    }

    fn broadcast(&self, room_id: RoomId, frame: &Utf8Bytes) {
        let Some(members) = self.rooms.get(&room_id) else {
            return;
        };

        for conn in members.values() {
            match conn.send(frame.clone()) {
                Ok(()) => {}
                Err(SendError::Full) => {
                    metrics::WEBSOCKET_FRAMES_DROPPED_TOTAL.inc();
                    warn!(
                        connection_id = %conn.id(),
                        room_id = %room_id,
                        "Outbound queue full, dropping frame"
                    );
                }
                Err(e) => {
                    debug!(connection_id = %conn.id(), error = %e, "Skipping closed connection");
                }
            }
        }
    }

    fn stats(&self) -> HubStats {
        HubStats {
            connections: self.connections.len(),
            rooms: self.rooms.len(),
        }
    }

    fn close_all(&self) {
        info!(connections = self.connections.len(), "Closing all connections");
        for conn in self.connections.values() {
            conn.close();
        }
    }

    fn update_gauges(&self) {
        metrics::WEBSOCKET_CONNECTIONS_ACTIVE.set(i64::try_from(self.connections.len()).unwrap_or(i64::MAX));
        metrics::ROOMS_ACTIVE.set(i64::try_from(self.rooms.len()).unwrap_or(i64::MAX));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use liveroom_core::models::Identity;
    use serde_json::{json, Value};

    fn identity(room: u64, participant: u64) -> Identity {
        Identity {
            user_id: None,
            room_id: RoomId::new(room),
            participant_id: ParticipantId::new(participant),
            display_name: format!("guest-{participant}"),
            is_anonymous: true,
            is_room_owner: false,
        }
    }

    fn frames(rx: &mut mpsc::Receiver<Utf8Bytes>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(serde_json::from_str(frame.as_str()).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_register_announces_join_to_room() {
        let registry = ConnectionRegistry::spawn();
        let (alice, mut alice_rx) = Connection::new(identity(1, 10), 16);
        let (bob, mut bob_rx) = Connection::new(identity(1, 11), 16);

        registry.register(alice);
        registry.register(bob);
        assert_eq!(registry.stats().await, HubStats { connections: 2, rooms: 1 });

        let alice_frames = frames(&mut alice_rx);
        assert_eq!(alice_frames.len(), 2);
        assert_eq!(alice_frames[1]["event"], "room:user_joined");
        assert_eq!(alice_frames[1]["data"]["participant_id"], 11);

        // The newcomer sees its own join
        let bob_frames = frames(&mut bob_rx);
        assert_eq!(bob_frames.len(), 1);
        assert_eq!(bob_frames[0]["data"]["display_name"], "guest-11");
    }

    #[tokio::test]
    async fn test_broadcast_is_scoped_to_room() {
        let registry = ConnectionRegistry::spawn();
        let (a, mut a_rx) = Connection::new(identity(1, 1), 16);
        let (b, mut b_rx) = Connection::new(identity(2, 2), 16);
        registry.register(a);
        registry.register(b);
        registry.stats().await;
        frames(&mut a_rx);
        frames(&mut b_rx);

        registry
            .broadcast_event(RoomId::new(1), "message:send", &json!({"content": "hi"}))
            .unwrap();
        registry.broadcast_event(RoomId::new(9), "message:send", &json!({})).unwrap();
        registry.stats().await;

        assert_eq!(frames(&mut a_rx).len(), 1);
        assert!(frames(&mut b_rx).is_empty());
    }

    #[tokio::test]
    async fn test_unregister_announces_before_removal() {
        let registry = ConnectionRegistry::spawn();
        let (a, mut a_rx) = Connection::new(identity(1, 1), 16);
        let (b, mut b_rx) = Connection::new(identity(1, 2), 16);
        registry.register(Arc::clone(&a));
        registry.register(Arc::clone(&b));
        registry.stats().await;
        frames(&mut a_rx);
        frames(&mut b_rx);

        registry.unregister(&b);
        let stats = registry.stats().await;
        assert_eq!(stats, HubStats { connections: 1, rooms: 1 });

        let seen = frames(&mut a_rx);
        assert_eq!(seen[0]["event"], "room:user_left");
        assert_eq!(seen[0]["data"]["participant_id"], 2);

        // The leaver got the frame before its queue was closed
        assert_eq!(frames(&mut b_rx)[0]["event"], "room:user_left");
        assert!(b.is_closed());
        assert!(!a.is_closed());
    }

    #[tokio::test]
    async fn test_unregister_unknown_and_twice_is_noop() {
        let registry = ConnectionRegistry::spawn();
        let (a, mut a_rx) = Connection::new(identity(1, 1), 16);
        let (stranger, _rx) = Connection::new(identity(1, 2), 16);

        registry.register(Arc::clone(&a));
        registry.unregister(&stranger);
        registry.stats().await;
        frames(&mut a_rx);

        registry.unregister(&a);
        registry.unregister(&a);
        assert_eq!(registry.stats().await, HubStats::default());
        assert_eq!(frames(&mut a_rx).len(), 1);
    }

    #[tokio::test]
    async fn test_slow_consumer_drops_without_blocking_others() {
        let registry = ConnectionRegistry::spawn();
        let (slow, mut slow_rx) = Connection::new(identity(1, 1), 1);
        let (fast, mut fast_rx) = Connection::new(identity(1, 2), 64);
        registry.register(Arc::clone(&slow));
        registry.stats().await;
        frames(&mut slow_rx);
        registry.register(Arc::clone(&fast));
        registry.stats().await;
        frames(&mut fast_rx);

        // slow still holds the user_joined frame for fast
        for i in 0..5 {
            registry
                .broadcast_event(RoomId::new(1), "message:send", &json!({"n": i}))
                .unwrap();
        }
        registry.stats().await;

        assert_eq!(frames(&mut fast_rx).len(), 5);
        assert_eq!(frames(&mut slow_rx).len(), 1);
        assert!(!slow.is_closed());
    }

    #[tokio::test]
    async fn test_close_all_closes_connections() {
        let registry = ConnectionRegistry::spawn();
        let (a, _a_rx) = Connection::new(identity(1, 1), 4);
        let (b, _b_rx) = Connection::new(identity(2, 2), 4);
        registry.register(Arc::clone(&a));
        registry.register(Arc::clone(&b));

        registry.close_all();
        registry.stats().await;

        assert!(a.is_closed());
        assert!(b.is_closed());
    }
}
