//! Delivery coordinator: the server-side handling of sends and acks.
//!
//! Every operation persists first and pushes second. A push that cannot be
//! queued (recipient offline, stale connection, full queue) is a normal
//! outcome; the message stays in the store and is picked up by the
//! recipient's next history fetch.
//!
//! ```text
//! handle_send        validate → append → push MessageReceived → (caller replies MessageConfirmed)
//! handle_*_ack       authorize → add receipt → escalate status → push StatusUpdated to sender
//! ```

use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use murmur_core::{
    unix_millis, ChatMessage, ConnectionId, Conversation, ConversationId, ErrorKind, MessageId,
    MessageStatus, ServerFrame, UserId,
};

use crate::directory::ConversationDirectory;
use crate::registry::ConnectionRegistry;
use crate::rooms::RoomManager;
use crate::store::{MessageStore, StoreError};

/// Default upper bound on message content, in characters.
pub const DEFAULT_MAX_CONTENT_LEN: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("Invalid request: {0}")]
    Validation(String),
    #[error("Not allowed: {0}")]
    Auth(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Persistence failed: {0}")]
    Persistence(String),
}

impl DeliveryError {
    /// Wire category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DeliveryError::Validation(_) => ErrorKind::Validation,
            DeliveryError::Auth(_) => ErrorKind::Auth,
            DeliveryError::NotFound(_) => ErrorKind::NotFound,
            DeliveryError::Persistence(_) => ErrorKind::Persistence,
        }
    }

    pub fn to_frame(&self, correlation_id: Option<Uuid>) -> ServerFrame {
        ServerFrame::error(self.kind(), self.to_string(), correlation_id)
    }
}

impl From<StoreError> for DeliveryError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => DeliveryError::NotFound(format!("message {id}")),
            other => DeliveryError::Persistence(other.to_string()),
        }
    }
}

/// Result of a successful send.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    /// The message as persisted.
    pub message: ChatMessage,
    /// Recipients whose queue accepted the `MessageReceived` push.
    pub pushed_to: Vec<UserId>,
}

/// Result of a delivery or read acknowledgment.
#[derive(Debug, Clone)]
pub struct AckOutcome {
    pub message: ChatMessage,
    /// A new receipt was recorded.
    pub receipt_added: bool,
    /// The aggregate status advanced.
    pub status_changed: bool,
    /// `StatusUpdated` was queued for the sender.
    pub sender_notified: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckKind {
    Delivered,
    Read,
}

pub struct DeliveryCoordinator {
    store: Arc<dyn MessageStore>,
    conversations: Arc<dyn ConversationDirectory>,
    registry: Arc<ConnectionRegistry>,
    rooms: Arc<RoomManager>,
    max_content_len: usize,
}

impl DeliveryCoordinator {
    pub fn new(
        store: Arc<dyn MessageStore>,
        conversations: Arc<dyn ConversationDirectory>,
        registry: Arc<ConnectionRegistry>,
        rooms: Arc<RoomManager>,
    ) -> Self {
        Self {
            store,
            conversations,
            registry,
            rooms,
            max_content_len: DEFAULT_MAX_CONTENT_LEN,
        }
    }

    pub fn with_max_content_len(mut self, max_content_len: usize) -> Self {
        self.max_content_len = max_content_len;
        self
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }

    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    // ─── Send ─────────────────────────────────────────────────────────

    /// Persist a new message and push it to reachable recipients.
    ///
    /// Direct messages go to the other participant whenever they are
    /// registered. Group messages go only to members currently joined to
    /// the conversation room. The sender's confirmation is the caller's
    /// reply and is not pushed here.
    pub async fn handle_send(
        &self,
        sender: UserId,
        conversation_id: ConversationId,
        content: &str,
        correlation_id: Option<Uuid>,
    ) -> Result<SendOutcome, DeliveryError> {
        if content.trim().is_empty() {
            return Err(DeliveryError::Validation("message content is empty".into()));
        }
        if content.chars().count() > self.max_content_len {
            return Err(DeliveryError::Validation(format!(
                "message content exceeds {} characters",
                self.max_content_len
            )));
        }

        let conversation = self.participant_conversation(&sender, &conversation_id)?;
        let message = ChatMessage::new(&conversation, sender, content, correlation_id, unix_millis());

        if let Err(e) = self.store.append(&message) {
            log::error!("Failed to persist message {} in {conversation_id}: {e}", message.id);
            return Err(e.into());
        }
        log::debug!("Persisted message {} from {sender} in {conversation_id}", message.id);

        let recipients = self.reachable_recipients(&conversation, &sender).await;
        let frame = ServerFrame::MessageReceived {
            message: message.clone(),
        };
        let pushed_to = self.push_to_all(&recipients, &frame).await;

        Ok(SendOutcome { message, pushed_to })
    }

    // ─── Acknowledgments ──────────────────────────────────────────────

    /// Record that `recipient` received `message_id`. Idempotent.
    pub async fn handle_delivery_ack(
        &self,
        recipient: UserId,
        message_id: MessageId,
    ) -> Result<AckOutcome, DeliveryError> {
        self.acknowledge(recipient, message_id, AckKind::Delivered).await
    }

    /// Record that `recipient` read `message_id`, backfilling the delivery
    /// receipt. Idempotent.
    pub async fn handle_read_ack(
        &self,
        recipient: UserId,
        message_id: MessageId,
    ) -> Result<AckOutcome, DeliveryError> {
        self.acknowledge(recipient, message_id, AckKind::Read).await
    }

    async fn acknowledge(
        &self,
        recipient: UserId,
        message_id: MessageId,
        kind: AckKind,
    ) -> Result<AckOutcome, DeliveryError> {
        let message = self.store.get(&message_id)?;
        let conversation = self.participant_conversation(&recipient, &message.conversation_id)?;

        if recipient == message.sender {
            return Ok(AckOutcome {
                message,
                receipt_added: false,
                status_changed: false,
                sender_notified: false,
            });
        }

        let now = unix_millis();
        let receipt = match kind {
            AckKind::Delivered => self.store.add_delivery_receipt(&message_id, recipient, now),
            AckKind::Read => self.store.add_read_receipt(&message_id, recipient, now),
        }
        .inspect_err(|e| log::error!("Failed to record {kind:?} receipt for {message_id}: {e}"))?;

        let target = if conversation.is_group() {
            receipt.message.status_for_members(&conversation.participants)
        } else {
            match kind {
                AckKind::Delivered => MessageStatus::Delivered,
                AckKind::Read => MessageStatus::Read,
            }
        };

        let (message, status_changed) = if target > receipt.message.status {
            let update = self.store.set_status(&message_id, target)?;
            (update.message, update.changed)
        } else {
            (receipt.message, false)
        };

        let mut sender_notified = false;
        if status_changed {
            log::debug!("Message {message_id} is now {}", message.status);
            let frame = ServerFrame::StatusUpdated {
                message_id,
                conversation_id: message.conversation_id,
                status: message.status,
            };
            if let Some(bytes) = encode_frame(&frame) {
                sender_notified = self.registry.push(&message.sender, bytes).await;
            }
        }

        Ok(AckOutcome {
            message,
            receipt_added: receipt.changed,
            status_changed,
            sender_notified,
        })
    }

    // ─── History & rooms ──────────────────────────────────────────────

    /// Messages of a conversation in append order.
    pub async fn handle_fetch_history(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
    ) -> Result<Vec<ChatMessage>, DeliveryError> {
        self.participant_conversation(&user_id, &conversation_id)?;
        Ok(self.store.find_by_conversation(&conversation_id)?)
    }

    pub async fn join_room(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
        conversation_id: ConversationId,
    ) -> Result<bool, DeliveryError> {
        self.participant_conversation(&user_id, &conversation_id)?;
        let joined = self.rooms.join(conversation_id, user_id, connection_id).await;
        if joined {
            log::debug!("{user_id} joined room {conversation_id}");
        }
        Ok(joined)
    }

    pub async fn leave_room(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
        conversation_id: ConversationId,
    ) -> bool {
        let left = self
            .rooms
            .leave(&conversation_id, &user_id, &connection_id)
            .await;
        if left {
            log::debug!("{user_id} left room {conversation_id}");
        }
        left
    }

    // ─── Ephemeral signals ────────────────────────────────────────────

    /// Forward a typing indicator. Nothing is persisted.
    pub async fn relay_typing(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
    ) -> Result<usize, DeliveryError> {
        let conversation = self.participant_conversation(&user_id, &conversation_id)?;
        let recipients = self.reachable_recipients(&conversation, &user_id).await;
        let frame = ServerFrame::PeerTyping {
            conversation_id,
            user_id,
        };
        Ok(self.push_to_all(&recipients, &frame).await.len())
    }

    /// Tell every user sharing a conversation with `user_id` whether it is
    /// online. Returns how many pushes were queued.
    pub async fn announce_presence(&self, user_id: UserId, online: bool) -> usize {
        let contacts: HashSet<UserId> = self
            .conversations
            .conversations_of(&user_id)
            .iter()
            .flat_map(|c| c.others(&user_id).collect::<Vec<_>>())
            .collect();
        let contacts: Vec<UserId> = contacts.into_iter().collect();

        let frame = ServerFrame::PresenceChanged { user_id, online };
        self.push_to_all(&contacts, &frame).await.len()
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn participant_conversation(
        &self,
        user_id: &UserId,
        conversation_id: &ConversationId,
    ) -> Result<Conversation, DeliveryError> {
        let conversation = self
            .conversations
            .conversation(conversation_id)
            .ok_or_else(|| DeliveryError::NotFound(format!("conversation {conversation_id}")))?;
        if !conversation.is_participant(user_id) {
            return Err(DeliveryError::Auth(format!(
                "{user_id} is not a participant of {conversation_id}"
            )));
        }
        Ok(conversation)
    }

    async fn reachable_recipients(&self, conversation: &Conversation, sender: &UserId) -> Vec<UserId> {
        let others: Vec<UserId> = conversation.others(sender).collect();
        if !conversation.is_group() {
            return others;
        }
        // A join only counts for the connection that made it; a replacement
        // connection has to join again.
        let mut joined = Vec::with_capacity(others.len());
        for user in others {
            let Some(tag) = self.rooms.joined_connection(&conversation.id, &user).await else {
                continue;
            };
            if self.registry.lookup(&user).await == Some(tag) {
                joined.push(user);
            }
        }
        joined
    }

    /// Encode once, push to each user. Returns the users whose queue took it.
    async fn push_to_all(&self, users: &[UserId], frame: &ServerFrame) -> Vec<UserId> {
        let Some(bytes) = encode_frame(frame) else {
            return Vec::new();
        };
        let mut pushed = Vec::with_capacity(users.len());
        for user in users {
            if self.registry.push(user, bytes.clone()).await {
                pushed.push(*user);
            } else {
                log::trace!("{user} not reachable for {}", frame.name());
            }
        }
        pushed
    }
}

pub(crate) fn encode_frame(frame: &ServerFrame) -> Option<Arc<Vec<u8>>> {
    match frame.encode() {
        Ok(bytes) => Some(Arc::new(bytes)),
        Err(e) => {
            log::error!("Failed to encode {} frame: {e}", frame.name());
            None
        }
    }
}
