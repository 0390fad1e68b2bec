//! Connection registry - live connections, private user channels, session rooms
//!
//! Maps authenticated identities to their open connections and tracks room
//! membership plus a short per-room message cache. Everything here is derived,
//! process-local state; the session store stays authoritative.

use crate::protocol::ServerMessage;
use crate::session::{ChatMessage, SessionId, UserId};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Most-recent messages mirrored per live room (optimization only)
pub const ROOM_CACHE_CAP: usize = 50;

/// Typed broadcast-group identifier for one session's live room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoomId(SessionId);

impl RoomId {
    pub fn session(&self) -> SessionId {
        self.0
    }
}

impl From<SessionId> for RoomId {
    fn from(id: SessionId) -> Self {
        Self(id)
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "room/{}", self.0)
    }
}

/// One live, authenticated connection
struct Connection {
    user: UserId,
    name: String,
    sender: mpsc::Sender<ServerMessage>,
}

/// In-memory tracking for one live room
#[derive(Default)]
struct Room {
    /// Connection id -> joined user
    members: HashMap<Uuid, UserId>,
    /// Recent chat mirror, capped at [`ROOM_CACHE_CAP`]
    recent: VecDeque<ChatMessage>,
}

#[derive(Default)]
struct RegistryInner {
    connections: HashMap<Uuid, Connection>,
    /// User -> all of their connection ids (multiple tabs allowed)
    users: HashMap<UserId, HashSet<Uuid>>,
    rooms: HashMap<RoomId, Room>,
}

/// A room the disconnecting connection was removed from, with the new count
pub struct RoomDeparture {
    pub room: RoomId,
    pub user: UserId,
    pub name: String,
    pub live_count: usize,
}

/// Registry of live connections and room membership
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: RwLock<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind an authenticated identity to a new connection
    pub async fn register(
        &self,
        user: UserId,
        name: String,
        sender: mpsc::Sender<ServerMessage>,
    ) -> Uuid {
        let conn_id = Uuid::new_v4();
        let mut inner = self.inner.write().await;
        inner.users.entry(user.clone()).or_default().insert(conn_id);
        inner.connections.insert(conn_id, Connection { user, name, sender });
        conn_id
    }

    /// Drop a connection, removing it from every room it joined
    ///
    /// Returns the rooms it was evicted from so the caller can broadcast
    /// user-left events. Best-effort cleanup; nothing persisted is touched.
    pub async fn unregister(&self, conn_id: Uuid) -> Vec<RoomDeparture> {
        let mut inner = self.inner.write().await;

        let Some(conn) = inner.connections.remove(&conn_id) else {
            return Vec::new();
        };

        if let Some(set) = inner.users.get_mut(&conn.user) {
            set.remove(&conn_id);
            if set.is_empty() {
                inner.users.remove(&conn.user);
            }
        }

        let mut departures = Vec::new();
        inner.rooms.retain(|room_id, room| {
            if room.members.remove(&conn_id).is_some() {
                departures.push(RoomDeparture {
                    room: *room_id,
                    user: conn.user.clone(),
                    name: conn.name.clone(),
                    live_count: room.members.len(),
                });
            }
            !room.members.is_empty()
        });

        departures
    }

    /// Identity bound to a connection, if it is still registered
    pub async fn identity(&self, conn_id: Uuid) -> Option<(UserId, String)> {
        self.inner
            .read()
            .await
            .connections
            .get(&conn_id)
            .map(|c| (c.user.clone(), c.name.clone()))
    }

    /// Add a connection to a room; returns the new live count
    pub async fn join_room(&self, room: RoomId, conn_id: Uuid) -> usize {
        let mut inner = self.inner.write().await;
        let user = inner
            .connections
            .get(&conn_id)
            .map(|c| c.user.clone());
        let Some(user) = user else { return 0 };
        let entry = inner.rooms.entry(room).or_default();
        entry.members.insert(conn_id, user);
        entry.members.len()
    }

    /// Remove a connection from a room
    ///
    /// Returns the remaining live count, or None if the connection was not a
    /// member. An emptied room's tracking entry is discarded entirely.
    pub async fn leave_room(&self, room: RoomId, conn_id: Uuid) -> Option<usize> {
        let mut inner = self.inner.write().await;
        let entry = inner.rooms.get_mut(&room)?;
        entry.members.remove(&conn_id)?;
        let count = entry.members.len();
        if count == 0 {
            inner.rooms.remove(&room);
        }
        Some(count)
    }

    /// Whether a connection has joined a room
    pub async fn is_room_member(&self, room: RoomId, conn_id: Uuid) -> bool {
        self.inner
            .read()
            .await
            .rooms
            .get(&room)
            .is_some_and(|r| r.members.contains_key(&conn_id))
    }

    /// Current live-participant count for a room
    pub async fn room_count(&self, room: RoomId) -> usize {
        self.inner
            .read()
            .await
            .rooms
            .get(&room)
            .map_or(0, |r| r.members.len())
    }

    /// Mirror a chat message into the room's short-lived cache
    pub async fn cache_message(&self, room: RoomId, message: ChatMessage) {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.rooms.get_mut(&room) {
            entry.recent.push_back(message);
            while entry.recent.len() > ROOM_CACHE_CAP {
                entry.recent.pop_front();
            }
        }
    }

    /// Recent messages cached for a room
    pub async fn recent_messages(&self, room: RoomId) -> Vec<ChatMessage> {
        self.inner
            .read()
            .await
            .rooms
            .get(&room)
            .map_or_else(Vec::new, |r| r.recent.iter().cloned().collect())
    }

    /// Send to one specific connection
    pub async fn send_to_connection(&self, conn_id: Uuid, msg: ServerMessage) {
        let sender = self
            .inner
            .read()
            .await
            .connections
            .get(&conn_id)
            .map(|c| c.sender.clone());
        if let Some(sender) = sender {
            if sender.send(msg).await.is_err() {
                tracing::warn!("Failed to send to connection {}", conn_id);
            }
        }
    }

    /// Deliver to every connection the user currently holds
    pub async fn send_to_user(&self, user: &UserId, msg: ServerMessage) {
        let senders: Vec<_> = {
            let inner = self.inner.read().await;
            inner
                .users
                .get(user)
                .into_iter()
                .flatten()
                .filter_map(|id| inner.connections.get(id).map(|c| c.sender.clone()))
                .collect()
        };
        for sender in senders {
            if sender.send(msg.clone()).await.is_err() {
                tracing::warn!("Failed to send to a connection of user {}", user);
            }
        }
    }

    /// Broadcast to every member of a room, optionally excluding one connection
    pub async fn broadcast_room(&self, room: RoomId, msg: ServerMessage, exclude: Option<Uuid>) {
        let senders: Vec<_> = {
            let inner = self.inner.read().await;
            let Some(entry) = inner.rooms.get(&room) else {
                return;
            };
            entry
                .members
                .keys()
                .filter(|id| Some(**id) != exclude)
                .filter_map(|id| inner.connections.get(id).map(|c| c.sender.clone()))
                .collect()
        };
        for sender in senders {
            if sender.send(msg.clone()).await.is_err() {
                tracing::warn!("Failed to broadcast to a member of {}", room);
            }
        }
    }

    /// Broadcast to every live connection (sweeper announcements; room
    /// membership may be empty when the session flips state)
    pub async fn broadcast_all(&self, msg: ServerMessage) {
        let senders: Vec<_> = {
            let inner = self.inner.read().await;
            inner
                .connections
                .values()
                .map(|c| c.sender.clone())
                .collect()
        };
        for sender in senders {
            if sender.send(msg.clone()).await.is_err() {
                tracing::warn!("Failed to broadcast to a connection");
            }
        }
    }
}
