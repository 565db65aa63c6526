//! Conversation rooms.
//!
//! A room records which users currently have a conversation open, and on
//! which connection. Group messages are pushed only to joined members;
//! direct messages go by registry mapping alone.
//!
//! Membership is keyed by user and tagged with the connection that joined,
//! so cleanup of a replaced connection leaves a rejoin by the new one intact.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use murmur_core::{ConnectionId, ConversationId, UserId};

/// Members of a single conversation room.
pub struct Room {
    members: RwLock<HashMap<UserId, ConnectionId>>,
}

impl Default for Room {
    fn default() -> Self {
        Self::new()
    }
}

impl Room {
    pub fn new() -> Self {
        Self {
            members: RwLock::new(HashMap::new()),
        }
    }

    /// Add or re-tag a member. Returns `true` if the user was not joined.
    pub async fn join(&self, user_id: UserId, connection_id: ConnectionId) -> bool {
        self.members
            .write()
            .await
            .insert(user_id, connection_id)
            .is_none()
    }

    /// Remove a member if it joined through `connection_id`.
    pub async fn leave(&self, user_id: &UserId, connection_id: &ConnectionId) -> bool {
        let mut members = self.members.write().await;
        match members.get(user_id) {
            Some(current) if current == connection_id => {
                members.remove(user_id);
                true
            }
            _ => false,
        }
    }

    pub async fn has_member(&self, user_id: &UserId) -> bool {
        self.members.read().await.contains_key(user_id)
    }

    /// The connection `user_id` joined through, if joined.
    pub async fn connection_of(&self, user_id: &UserId) -> Option<ConnectionId> {
        self.members.read().await.get(user_id).copied()
    }

    pub async fn members(&self) -> Vec<UserId> {
        self.members.read().await.keys().copied().collect()
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }
}

/// Maps conversation ids to rooms.
pub struct RoomManager {
    rooms: RwLock<HashMap<ConversationId, Arc<Room>>>,
}

impl Default for RoomManager {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomManager {
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
        }
    }

    /// Get or create the room for `conversation_id`.
    pub async fn get_or_create(&self, conversation_id: ConversationId) -> Arc<Room> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(&conversation_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(&conversation_id) {
            return room.clone();
        }

        let room = Arc::new(Room::new());
        rooms.insert(conversation_id, room.clone());
        room
    }

    pub async fn get(&self, conversation_id: &ConversationId) -> Option<Arc<Room>> {
        self.rooms.read().await.get(conversation_id).cloned()
    }

    /// Join a room. Joining twice is a no-op apart from re-tagging the connection.
    pub async fn join(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        connection_id: ConnectionId,
    ) -> bool {
        // Holding the map lock keeps remove_if_empty from dropping the room
        // between lookup and insert.
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .entry(conversation_id)
            .or_insert_with(|| Arc::new(Room::new()))
            .clone();
        room.join(user_id, connection_id).await
    }

    pub async fn leave(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
        connection_id: &ConnectionId,
    ) -> bool {
        let left = match self.get(conversation_id).await {
            Some(room) => room.leave(user_id, connection_id).await,
            None => false,
        };
        if left {
            self.remove_if_empty(conversation_id).await;
        }
        left
    }

    /// Remove `user_id` from every room it joined through `connection_id`.
    ///
    /// Returns the conversations that were left.
    pub async fn leave_all(
        &self,
        user_id: &UserId,
        connection_id: &ConnectionId,
    ) -> Vec<ConversationId> {
        let rooms: Vec<(ConversationId, Arc<Room>)> = self
            .rooms
            .read()
            .await
            .iter()
            .map(|(id, room)| (*id, room.clone()))
            .collect();

        let mut left = Vec::new();
        for (conversation_id, room) in rooms {
            if room.leave(user_id, connection_id).await {
                self.remove_if_empty(&conversation_id).await;
                left.push(conversation_id);
            }
        }
        left
    }

    pub async fn is_joined(&self, conversation_id: &ConversationId, user_id: &UserId) -> bool {
        match self.get(conversation_id).await {
            Some(room) => room.has_member(user_id).await,
            None => false,
        }
    }

    pub async fn joined_connection(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
    ) -> Option<ConnectionId> {
        match self.get(conversation_id).await {
            Some(room) => room.connection_of(user_id).await,
            None => None,
        }
    }

    /// Remove an empty room.
    pub async fn remove_if_empty(&self, conversation_id: &ConversationId) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(conversation_id) {
            if room.member_count().await == 0 {
                rooms.remove(conversation_id);
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_conversations(&self) -> Vec<ConversationId> {
        self.rooms.read().await.keys().copied().collect()
    }
}
