use crate::metrics;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc::UnboundedSender, RwLock};
use uuid::Uuid;

pub mod bridge;
pub mod dispatcher;
pub mod events;
pub mod message_types;
pub mod presence;

use events::ServerEvent;

/// Unique identifier for one realtime connection
///
/// A user who reconnects gets a new id, which lets a late disconnect of the
/// old socket be told apart from the live one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub fn user_room(user_id: Uuid) -> String {
    format!("user:{user_id}")
}

pub fn conversation_room(conversation_id: Uuid) -> String {
    format!("conversation:{conversation_id}")
}

const CONVERSATION_ROOM_PREFIX: &str = "conversation:";

struct Connection {
    user_id: Uuid,
    sender: UnboundedSender<String>,
}

#[derive(Default)]
struct RegistryState {
    connections: HashMap<ConnectionId, Connection>,
    // Single slot per user; the most recent connection wins
    users: HashMap<Uuid, ConnectionId>,
    rooms: HashMap<String, HashSet<ConnectionId>>,
}

impl RegistryState {
    fn leave(&mut self, connection_id: ConnectionId, room: &str) -> bool {
        let Some(members) = self.rooms.get_mut(room) else {
            return false;
        };
        let removed = members.remove(&connection_id);
        if members.is_empty() {
            self.rooms.remove(room);
        }
        removed
    }

    fn send_all(&self, frame: &str) {
        for connection in self.connections.values() {
            let _ = connection.sender.send(frame.to_string());
        }
    }
}

/// Process-local map of live connections, users and rooms
///
/// Cloning shares the same underlying state.
#[derive(Default, Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<RegistryState>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an authenticated connection: record it as the user's current
    /// connection, join the personal room and announce the user as online
    pub async fn connect(&self, user_id: Uuid, sender: UnboundedSender<String>) -> ConnectionId {
        let connection_id = ConnectionId::new();
        let mut guard = self.inner.write().await;

        guard
            .connections
            .insert(connection_id, Connection { user_id, sender });
        if let Some(previous) = guard.users.insert(user_id, connection_id) {
            tracing::debug!(%user_id, %previous, current = %connection_id, "user reconnected");
        }
        guard
            .rooms
            .entry(user_room(user_id))
            .or_default()
            .insert(connection_id);

        if let Some(frame) = presence::presence_frame(user_id, true) {
            guard.send_all(&frame);
        }
        metrics::connection_opened();

        tracing::info!(%user_id, %connection_id, "realtime connection registered");
        connection_id
    }

    /// Drop the connection and its room memberships. The user mapping is only
    /// cleared, and `user:offline` only announced, when it still points at this
    /// connection. Returns whether the user went offline.
    pub async fn disconnect(&self, connection_id: ConnectionId) -> bool {
        let mut guard = self.inner.write().await;

        let Some(connection) = guard.connections.remove(&connection_id) else {
            return false;
        };
        metrics::connection_closed();

        let rooms: Vec<String> = guard
            .rooms
            .iter()
            .filter(|(_, members)| members.contains(&connection_id))
            .map(|(room, _)| room.clone())
            .collect();
        for room in rooms {
            guard.leave(connection_id, &room);
        }

        let user_id = connection.user_id;
        if guard.users.get(&user_id) != Some(&connection_id) {
            tracing::debug!(%user_id, %connection_id, "stale connection closed");
            return false;
        }
        guard.users.remove(&user_id);

        if let Some(frame) = presence::presence_frame(user_id, false) {
            guard.send_all(&frame);
        }
        tracing::info!(%user_id, %connection_id, "user went offline");
        true
    }

    pub async fn is_online(&self, user_id: Uuid) -> bool {
        self.inner.read().await.users.contains_key(&user_id)
    }

    pub async fn lookup_connection(&self, user_id: Uuid) -> Option<ConnectionId> {
        self.inner.read().await.users.get(&user_id).copied()
    }

    pub async fn online_users(&self) -> Vec<Uuid> {
        self.inner.read().await.users.keys().copied().collect()
    }

    pub async fn join_room(&self, connection_id: ConnectionId, room: &str) {
        let mut guard = self.inner.write().await;
        if !guard.connections.contains_key(&connection_id) {
            return;
        }
        guard
            .rooms
            .entry(room.to_string())
            .or_default()
            .insert(connection_id);
    }

    pub async fn leave_room(&self, connection_id: ConnectionId, room: &str) -> bool {
        self.inner.write().await.leave(connection_id, room)
    }

    /// Leave every conversation room except `keep`; returns the rooms left
    pub async fn leave_conversation_rooms(
        &self,
        connection_id: ConnectionId,
        keep: &str,
    ) -> Vec<String> {
        let mut guard = self.inner.write().await;
        let rooms: Vec<String> = guard
            .rooms
            .iter()
            .filter(|(room, members)| {
                room.starts_with(CONVERSATION_ROOM_PREFIX)
                    && room.as_str() != keep
                    && members.contains(&connection_id)
            })
            .map(|(room, _)| room.clone())
            .collect();
        for room in &rooms {
            guard.leave(connection_id, room);
        }
        rooms
    }

    pub async fn rooms_of(&self, connection_id: ConnectionId) -> Vec<String> {
        let guard = self.inner.read().await;
        guard
            .rooms
            .iter()
            .filter(|(_, members)| members.contains(&connection_id))
            .map(|(room, _)| room.clone())
            .collect()
    }

    pub async fn room_size(&self, room: &str) -> usize {
        let guard = self.inner.read().await;
        guard.rooms.get(room).map(|m| m.len()).unwrap_or(0)
    }

    /// Deliver a frame to one connection; false if it is gone
    pub async fn send_to(&self, connection_id: ConnectionId, frame: String) -> bool {
        let guard = self.inner.read().await;
        guard
            .connections
            .get(&connection_id)
            .map(|c| c.sender.send(frame).is_ok())
            .unwrap_or(false)
    }

    pub async fn send_event(&self, connection_id: ConnectionId, event: &ServerEvent) -> bool {
        match event.to_frame() {
            Ok(frame) => self.send_to(connection_id, frame).await,
            Err(e) => {
                tracing::error!(error = %e, event = event.event_name(), "failed to encode event");
                false
            }
        }
    }

    /// Broadcast to every connection in `room`, optionally skipping one.
    /// Connections whose receiver is gone are pruned from the room.
    pub async fn broadcast_room(
        &self,
        room: &str,
        frame: &str,
        except: Option<ConnectionId>,
    ) -> usize {
        let mut guard = self.inner.write().await;
        let Some(members) = guard.rooms.get(room) else {
            return 0;
        };

        let mut delivered = 0;
        let mut dead = Vec::new();
        for connection_id in members.iter().filter(|id| Some(**id) != except) {
            match guard.connections.get(connection_id) {
                Some(c) if c.sender.send(frame.to_string()).is_ok() => delivered += 1,
                _ => dead.push(*connection_id),
            }
        }

        if !dead.is_empty() {
            tracing::debug!(room, dead = dead.len(), "pruned dead connections from room");
            for connection_id in dead {
                guard.leave(connection_id, room);
            }
        }
        delivered
    }
}
