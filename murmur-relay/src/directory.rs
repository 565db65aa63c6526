//! User and conversation directory.
//!
//! The relay only reads from the directory; the in-memory implementation
//! is populated from a seed file at startup or directly by tests.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use thiserror::Error;

use murmur_core::{Conversation, ConversationId, ConversationKind, User, UserId};

/// Lookup of registered users.
pub trait UserDirectory: Send + Sync {
    fn find_by_id(&self, user_id: &UserId) -> Option<User>;
    fn find_by_email(&self, email: &str) -> Option<User>;
}

/// Lookup of conversations and their participants.
pub trait ConversationDirectory: Send + Sync {
    fn conversation(&self, conversation_id: &ConversationId) -> Option<Conversation>;
    /// Every conversation `user_id` participates in.
    fn conversations_of(&self, user_id: &UserId) -> Vec<Conversation>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectoryError {
    #[error("Unknown user: {0}")]
    UnknownUser(String),
    #[error("Unknown conversation: {0}")]
    UnknownConversation(ConversationId),
    #[error("E-mail already registered: {0}")]
    DuplicateEmail(String),
    #[error("Direct conversation needs exactly two distinct participants")]
    InvalidDirect,
    #[error("Conversation {0} is not a group")]
    NotAGroup(ConversationId),
}

#[derive(Default)]
pub struct InMemoryDirectory {
    users: RwLock<HashMap<UserId, User>>,
    conversations: RwLock<HashMap<ConversationId, Conversation>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user. E-mails are unique, compared case-insensitively.
    pub fn add_user(&self, user: User) -> Result<UserId, DirectoryError> {
        let mut users = self.users.write().unwrap_or_else(PoisonError::into_inner);
        if users
            .values()
            .any(|u| u.email.eq_ignore_ascii_case(&user.email))
        {
            return Err(DirectoryError::DuplicateEmail(user.email));
        }
        let id = user.id;
        users.insert(id, user);
        Ok(id)
    }

    /// Register a conversation after checking its participants exist.
    pub fn add_conversation(
        &self,
        conversation: Conversation,
    ) -> Result<ConversationId, DirectoryError> {
        {
            let users = self.users.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(missing) = conversation
                .participants
                .iter()
                .find(|p| !users.contains_key(*p))
            {
                return Err(DirectoryError::UnknownUser(missing.to_string()));
            }
        }
        if conversation.kind == ConversationKind::Direct
            && (conversation.participants.len() != 2
                || conversation.participants[0] == conversation.participants[1])
        {
            return Err(DirectoryError::InvalidDirect);
        }

        let id = conversation.id;
        self.conversations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, conversation);
        Ok(id)
    }

    /// Add a member to a group. Adding an existing member is a no-op.
    pub fn add_member(
        &self,
        conversation_id: &ConversationId,
        user_id: UserId,
    ) -> Result<(), DirectoryError> {
        if self.find_by_id(&user_id).is_none() {
            return Err(DirectoryError::UnknownUser(user_id.to_string()));
        }
        let mut conversations = self
            .conversations
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let conversation = conversations
            .get_mut(conversation_id)
            .ok_or(DirectoryError::UnknownConversation(*conversation_id))?;
        if !conversation.is_group() {
            return Err(DirectoryError::NotAGroup(*conversation_id));
        }
        if !conversation.participants.contains(&user_id) {
            conversation.participants.push(user_id);
        }
        Ok(())
    }

    /// Remove a member from a group. Returns `true` if it was a member.
    pub fn remove_member(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
    ) -> Result<bool, DirectoryError> {
        let mut conversations = self
            .conversations
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let conversation = conversations
            .get_mut(conversation_id)
            .ok_or(DirectoryError::UnknownConversation(*conversation_id))?;
        if !conversation.is_group() {
            return Err(DirectoryError::NotAGroup(*conversation_id));
        }
        let before = conversation.participants.len();
        conversation.participants.retain(|p| p != user_id);
        Ok(conversation.participants.len() != before)
    }

    pub fn user_count(&self) -> usize {
        self.users.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn conversation_count(&self) -> usize {
        self.conversations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl UserDirectory for InMemoryDirectory {
    fn find_by_id(&self, user_id: &UserId) -> Option<User> {
        self.users
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user_id)
            .cloned()
    }

    fn find_by_email(&self, email: &str) -> Option<User> {
        self.users
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .cloned()
    }
}

impl ConversationDirectory for InMemoryDirectory {
    fn conversation(&self, conversation_id: &ConversationId) -> Option<Conversation> {
        self.conversations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(conversation_id)
            .cloned()
    }

    fn conversations_of(&self, user_id: &UserId) -> Vec<Conversation> {
        self.conversations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|c| c.is_participant(user_id))
            .cloned()
            .collect()
    }
}
