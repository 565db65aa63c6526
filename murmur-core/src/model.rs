//! Chat domain model.
//!
//! A [`ChatMessage`] carries its own receipt sets so that the message store
//! can apply delivery/read acknowledgments as a single read-modify-write.
//! Status only ever moves forward: `Sent < Delivered < Read`.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use uuid::Uuid;

pub type UserId = Uuid;
pub type ConversationId = Uuid;
pub type MessageId = Uuid;
pub type ConnectionId = Uuid;

/// Milliseconds since the unix epoch.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Delivery status of a message, ordered by progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageStatus {
    Sent = 0,
    Delivered = 1,
    Read = 2,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
        }
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A per-user acknowledgment with the time it was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub user_id: UserId,
    pub at_ms: u64,
}

/// Who a message is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Recipient {
    Direct(UserId),
    Group(ConversationId),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConversationKind {
    Direct,
    Group { name: String },
}

/// A conversation and its current participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub kind: ConversationKind,
    pub participants: Vec<UserId>,
}

impl Conversation {
    /// One-to-one conversation between two users.
    pub fn direct(a: UserId, b: UserId) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: ConversationKind::Direct,
            participants: vec![a, b],
        }
    }

    /// Group conversation. Duplicate members are collapsed.
    pub fn group(name: impl Into<String>, members: impl IntoIterator<Item = UserId>) -> Self {
        let mut participants: Vec<UserId> = Vec::new();
        for member in members {
            if !participants.contains(&member) {
                participants.push(member);
            }
        }
        Self {
            id: Uuid::new_v4(),
            kind: ConversationKind::Group { name: name.into() },
            participants,
        }
    }

    /// Same as [`Conversation::direct`] / [`Conversation::group`] with a fixed id.
    pub fn with_id(mut self, id: ConversationId) -> Self {
        self.id = id;
        self
    }

    pub fn is_group(&self) -> bool {
        matches!(self.kind, ConversationKind::Group { .. })
    }

    pub fn is_participant(&self, user_id: &UserId) -> bool {
        self.participants.contains(user_id)
    }

    /// Every participant except `user_id`.
    pub fn others<'a>(&'a self, user_id: &'a UserId) -> impl Iterator<Item = UserId> + 'a {
        self.participants.iter().copied().filter(move |p| p != user_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub email: String,
    pub display_name: String,
}

impl User {
    pub fn new(email: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            email: email.into(),
            display_name: display_name.into(),
        }
    }
}

/// A persisted chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender: UserId,
    pub recipient: Recipient,
    pub content: String,
    pub status: MessageStatus,
    pub created_at_ms: u64,
    pub delivered_to: Vec<Receipt>,
    pub read_by: Vec<Receipt>,
    /// Token chosen by the sending client, echoed back so it can match
    /// its optimistic entry exactly.
    pub correlation_id: Option<Uuid>,
}

impl ChatMessage {
    /// Build a fresh message in `conversation` with status `Sent`.
    ///
    /// The sender counts as having read their own message.
    pub fn new(
        conversation: &Conversation,
        sender: UserId,
        content: impl Into<String>,
        correlation_id: Option<Uuid>,
        now_ms: u64,
    ) -> Self {
        let recipient = if conversation.is_group() {
            Recipient::Group(conversation.id)
        } else {
            let other = conversation.others(&sender).next().unwrap_or(sender);
            Recipient::Direct(other)
        };
        Self {
            id: Uuid::new_v4(),
            conversation_id: conversation.id,
            sender,
            recipient,
            content: content.into(),
            status: MessageStatus::Sent,
            created_at_ms: now_ms,
            delivered_to: Vec::new(),
            read_by: vec![Receipt {
                user_id: sender,
                at_ms: now_ms,
            }],
            correlation_id,
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self.recipient, Recipient::Group(_))
    }

    pub fn was_delivered_to(&self, user_id: &UserId) -> bool {
        self.delivered_to.iter().any(|r| &r.user_id == user_id)
    }

    pub fn was_read_by(&self, user_id: &UserId) -> bool {
        self.read_by.iter().any(|r| &r.user_id == user_id)
    }

    /// Add a delivery receipt. Returns `false` if `user_id` already had one.
    pub fn record_delivery(&mut self, user_id: UserId, at_ms: u64) -> bool {
        if self.was_delivered_to(&user_id) {
            return false;
        }
        self.delivered_to.push(Receipt { user_id, at_ms });
        true
    }

    /// Add a read receipt, backfilling the delivery receipt if it was skipped.
    ///
    /// Returns `false` if `user_id` had already read the message.
    pub fn record_read(&mut self, user_id: UserId, at_ms: u64) -> bool {
        self.record_delivery(user_id, at_ms);
        if self.was_read_by(&user_id) {
            return false;
        }
        self.read_by.push(Receipt { user_id, at_ms });
        true
    }

    /// Move status forward to `status`. Never regresses.
    ///
    /// Returns `true` if the status changed.
    pub fn escalate(&mut self, status: MessageStatus) -> bool {
        if status > self.status {
            self.status = status;
            true
        } else {
            false
        }
    }

    /// Status implied by the receipts of `members` (the sender is ignored).
    ///
    /// `Read` once every other member read it, `Delivered` once every other
    /// member received it, `Sent` otherwise.
    pub fn status_for_members(&self, members: &[UserId]) -> MessageStatus {
        let mut others = members.iter().filter(|m| **m != self.sender).peekable();
        if others.peek().is_none() {
            return MessageStatus::Sent;
        }
        let others: Vec<&UserId> = others.collect();
        if others.iter().all(|m| self.was_read_by(m)) {
            MessageStatus::Read
        } else if others.iter().all(|m| self.was_delivered_to(m)) {
            MessageStatus::Delivered
        } else {
            MessageStatus::Sent
        }
    }
}
