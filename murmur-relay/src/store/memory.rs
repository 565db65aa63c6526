//! In-memory message store, used when no storage path is configured.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use murmur_core::{ChatMessage, ConversationId, MessageId};

use super::{MessageStore, StoreError, StoreUpdate};

#[derive(Default)]
struct Inner {
    messages: HashMap<MessageId, ChatMessage>,
    by_conversation: HashMap<ConversationId, Vec<MessageId>>,
}

#[derive(Default)]
pub struct MemoryMessageStore {
    inner: Mutex<Inner>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn message_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .messages
            .len()
    }
}

impl MessageStore for MemoryMessageStore {
    fn append(&self, message: &ChatMessage) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.messages.contains_key(&message.id) {
            return Err(StoreError::Duplicate(message.id));
        }
        inner
            .by_conversation
            .entry(message.conversation_id)
            .or_default()
            .push(message.id);
        inner.messages.insert(message.id, message.clone());
        Ok(())
    }

    fn get(&self, message_id: &MessageId) -> Result<ChatMessage, StoreError> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .messages
            .get(message_id)
            .cloned()
            .ok_or(StoreError::NotFound(*message_id))
    }

    fn find_by_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let ids = match inner.by_conversation.get(conversation_id) {
            Some(ids) => ids,
            None => return Ok(Vec::new()),
        };
        Ok(ids
            .iter()
            .filter_map(|id| inner.messages.get(id).cloned())
            .collect())
    }

    fn modify(
        &self,
        message_id: &MessageId,
        f: &mut dyn FnMut(&mut ChatMessage) -> bool,
    ) -> Result<StoreUpdate, StoreError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let message = inner
            .messages
            .get_mut(message_id)
            .ok_or(StoreError::NotFound(*message_id))?;
        let changed = f(message);
        Ok(StoreUpdate {
            message: message.clone(),
            changed,
        })
    }
}
