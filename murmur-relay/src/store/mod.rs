//! Message persistence.
//!
//! The store is the single source of truth for message content and status.
//! Registry and room state are caches rebuilt from live connections.
//!
//! ```text
//! ┌────────────────────┐   append / modify   ┌───────────────────────────────┐
//! │DeliveryCoordinator │ ──────────────────► │ MessageStore                  │
//! └────────────────────┘                     │  RocksMessageStore            │
//!                                            │   CF "messages"  id → record  │
//!                                            │   CF "conversation_index"     │
//!                                            │      conv ‖ seq → id          │
//!                                            │   CF "meta"      seq counter  │
//!                                            │  MemoryMessageStore (tests,   │
//!                                            │   no storage path)            │
//!                                            └───────────────────────────────┘
//! ```

pub mod memory;
pub mod rocks;

use thiserror::Error;

use murmur_core::{ChatMessage, ConversationId, MessageId, MessageStatus, UserId};

pub use memory::MemoryMessageStore;
pub use rocks::{RocksMessageStore, StoreConfig};

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Message not found: {0}")]
    NotFound(MessageId),
    #[error("Message already exists: {0}")]
    Duplicate(MessageId),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Result of a read-modify-write on one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreUpdate {
    /// The message after the update.
    pub message: ChatMessage,
    /// Whether anything was written.
    pub changed: bool,
}

/// Durable message log keyed by conversation.
///
/// Implementations serialize `modify` calls so concurrent acknowledgments
/// cannot lose each other's receipts.
pub trait MessageStore: Send + Sync {
    /// Append a new message. Fails with `Duplicate` if the id exists.
    fn append(&self, message: &ChatMessage) -> Result<(), StoreError>;

    fn get(&self, message_id: &MessageId) -> Result<ChatMessage, StoreError>;

    /// Messages of a conversation in append order.
    fn find_by_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<ChatMessage>, StoreError>;

    /// Apply `f` to the stored message; persist only when it returns `true`.
    fn modify(
        &self,
        message_id: &MessageId,
        f: &mut dyn FnMut(&mut ChatMessage) -> bool,
    ) -> Result<StoreUpdate, StoreError>;

    fn add_delivery_receipt(
        &self,
        message_id: &MessageId,
        user_id: UserId,
        at_ms: u64,
    ) -> Result<StoreUpdate, StoreError> {
        self.modify(message_id, &mut |m: &mut ChatMessage| m.record_delivery(user_id, at_ms))
    }

    /// Also backfills the delivery receipt.
    fn add_read_receipt(
        &self,
        message_id: &MessageId,
        user_id: UserId,
        at_ms: u64,
    ) -> Result<StoreUpdate, StoreError> {
        self.modify(message_id, &mut |m: &mut ChatMessage| m.record_read(user_id, at_ms))
    }

    /// Escalate status. Writes that would move status backwards are no-ops.
    fn set_status(
        &self,
        message_id: &MessageId,
        status: MessageStatus,
    ) -> Result<StoreUpdate, StoreError> {
        self.modify(message_id, &mut |m: &mut ChatMessage| m.escalate(status))
    }
}
