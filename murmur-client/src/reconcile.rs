//! Optimistic timeline reconciliation.
//!
//! A sent message shows up immediately as `Pending` under a provisional id.
//! The relay echoes the client's correlation token in `MessageConfirmed`,
//! and the pending entry is replaced in place by the authoritative copy.
//!
//! ```text
//!            begin_send               confirm (correlation id)
//!   ───────────────► Pending ─────────────────────────► Confirmed
//!                      │  ▲                                ▲
//!        fail / lost   │  │ retry (fresh ids,              │ load_history
//!        transport     ▼  │ same position)                 │ (token found)
//!                     Failed ──────────────────────────────┘
//! ```
//!
//! Status updates only touch confirmed entries. One that races ahead of
//! its confirmation is buffered by message id until the entry appears or
//! the buffer window expires.

use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

use murmur_core::{ChatMessage, ConversationId, MessageId, MessageStatus, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    #[error("No timeline entry with id {0}")]
    UnknownEntry(Uuid),
    #[error("Entry {0} has not failed")]
    NotFailed(Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Pending,
    Confirmed,
    Failed,
}

/// One line of a conversation timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineEntry {
    /// Provisional id until confirmed, then the message id.
    pub id: Uuid,
    pub correlation_id: Option<Uuid>,
    pub conversation_id: ConversationId,
    pub sender: UserId,
    pub content: String,
    pub created_at_ms: u64,
    pub status: MessageStatus,
    pub state: EntryState,
}

impl TimelineEntry {
    fn confirmed(message: &ChatMessage) -> Self {
        Self {
            id: message.id,
            correlation_id: message.correlation_id,
            conversation_id: message.conversation_id,
            sender: message.sender,
            content: message.content.clone(),
            created_at_ms: message.created_at_ms,
            status: message.status,
            state: EntryState::Confirmed,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.state == EntryState::Confirmed
    }

    /// Adopt the authoritative copy, never moving status backwards.
    fn absorb(&mut self, message: &ChatMessage) {
        let status = self.status.max(message.status);
        let was_confirmed = self.is_confirmed();
        *self = Self::confirmed(message);
        if was_confirmed {
            self.status = status;
        }
    }
}

/// A message the caller should put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub provisional_id: Uuid,
    pub correlation_id: Uuid,
    pub conversation_id: ConversationId,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    /// A pending or failed entry was replaced in place.
    Replaced,
    /// No matching entry; the message was appended.
    Appended,
    /// The message was already on the timeline.
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusApplied {
    Applied,
    /// The entry already had this status or a later one.
    Unchanged,
    /// No confirmed entry yet; held until one appears.
    Buffered,
}

#[derive(Debug, Clone, Copy)]
struct BufferedStatus {
    status: MessageStatus,
    received_at_ms: u64,
}

/// Per-conversation timelines of one user.
#[derive(Debug)]
pub struct Reconciler {
    user_id: UserId,
    timelines: HashMap<ConversationId, Vec<TimelineEntry>>,
    buffered: HashMap<MessageId, BufferedStatus>,
    buffer_window_ms: u64,
}

impl Reconciler {
    pub fn new(user_id: UserId, buffer_window_ms: u64) -> Self {
        Self {
            user_id,
            timelines: HashMap::new(),
            buffered: HashMap::new(),
            buffer_window_ms,
        }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn entries(&self, conversation_id: &ConversationId) -> &[TimelineEntry] {
        self.timelines
            .get(conversation_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Record a new outgoing message as `Pending`.
    pub fn begin_send(
        &mut self,
        conversation_id: ConversationId,
        content: impl Into<String>,
        now_ms: u64,
    ) -> OutgoingMessage {
        let outgoing = OutgoingMessage {
            provisional_id: Uuid::new_v4(),
            correlation_id: Uuid::new_v4(),
            conversation_id,
            content: content.into(),
        };
        self.timelines
            .entry(conversation_id)
            .or_default()
            .push(TimelineEntry {
                id: outgoing.provisional_id,
                correlation_id: Some(outgoing.correlation_id),
                conversation_id,
                sender: self.user_id,
                content: outgoing.content.clone(),
                created_at_ms: now_ms,
                status: MessageStatus::Sent,
                state: EntryState::Pending,
            });
        outgoing
    }

    /// Apply the relay's confirmation of our own message.
    pub fn confirm(&mut self, message: &ChatMessage, correlation_id: Uuid) -> Confirmation {
        let timeline = self.timelines.entry(message.conversation_id).or_default();

        let outcome = if timeline.iter().any(|e| e.is_confirmed() && e.id == message.id) {
            Confirmation::Duplicate
        } else if let Some(entry) = timeline
            .iter_mut()
            .find(|e| !e.is_confirmed() && e.correlation_id == Some(correlation_id))
        {
            entry.absorb(message);
            Confirmation::Replaced
        } else {
            timeline.push(TimelineEntry::confirmed(message));
            Confirmation::Appended
        };

        self.drain_buffered(&message.conversation_id, &message.id);
        outcome
    }

    /// Add a message from another participant. Returns `false` for a
    /// duplicate delivery.
    pub fn receive(&mut self, message: &ChatMessage) -> bool {
        let timeline = self.timelines.entry(message.conversation_id).or_default();
        if timeline.iter().any(|e| e.is_confirmed() && e.id == message.id) {
            return false;
        }
        timeline.push(TimelineEntry::confirmed(message));
        self.drain_buffered(&message.conversation_id, &message.id);
        true
    }

    /// Apply a status update to a confirmed entry, or buffer it.
    pub fn apply_status(
        &mut self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        status: MessageStatus,
        now_ms: u64,
    ) -> StatusApplied {
        if let Some(entry) = self.confirmed_entry_mut(conversation_id, message_id) {
            if status > entry.status {
                entry.status = status;
                return StatusApplied::Applied;
            }
            return StatusApplied::Unchanged;
        }

        let slot = self.buffered.entry(*message_id).or_insert(BufferedStatus {
            status,
            received_at_ms: now_ms,
        });
        if status > slot.status {
            slot.status = status;
        }
        slot.received_at_ms = now_ms;
        StatusApplied::Buffered
    }

    /// Mark the pending entry carrying `correlation_id` as failed.
    ///
    /// Returns its provisional id.
    pub fn fail(&mut self, correlation_id: &Uuid) -> Option<Uuid> {
        self.timelines
            .values_mut()
            .flat_map(|t| t.iter_mut())
            .find(|e| e.state == EntryState::Pending && e.correlation_id.as_ref() == Some(correlation_id))
            .map(|e| {
                e.state = EntryState::Failed;
                e.id
            })
    }

    /// Fail every pending entry, e.g. after the transport dropped.
    pub fn fail_all_pending(&mut self) -> Vec<TimelineEntry> {
        let mut failed = Vec::new();
        for entry in self.timelines.values_mut().flat_map(|t| t.iter_mut()) {
            if entry.state == EntryState::Pending {
                entry.state = EntryState::Failed;
                failed.push(entry.clone());
            }
        }
        failed
    }

    /// Re-enter `Pending` with fresh ids at the same timeline position.
    pub fn retry(&mut self, provisional_id: &Uuid, now_ms: u64) -> Result<OutgoingMessage, ReconcileError> {
        let entry = self
            .timelines
            .values_mut()
            .flat_map(|t| t.iter_mut())
            .find(|e| !e.is_confirmed() && &e.id == provisional_id)
            .ok_or(ReconcileError::UnknownEntry(*provisional_id))?;
        if entry.state != EntryState::Failed {
            return Err(ReconcileError::NotFailed(*provisional_id));
        }

        let outgoing = OutgoingMessage {
            provisional_id: Uuid::new_v4(),
            correlation_id: Uuid::new_v4(),
            conversation_id: entry.conversation_id,
            content: entry.content.clone(),
        };
        entry.id = outgoing.provisional_id;
        entry.correlation_id = Some(outgoing.correlation_id);
        entry.created_at_ms = now_ms;
        entry.state = EntryState::Pending;
        Ok(outgoing)
    }

    /// Merge an authoritative history of one conversation.
    ///
    /// History order wins. Local entries matched by id or correlation
    /// token take the server copy (status never regresses); unmatched
    /// pending and failed entries stay at the end in their prior order.
    pub fn load_history(&mut self, conversation_id: ConversationId, history: &[ChatMessage]) {
        let mut local = self.timelines.remove(&conversation_id).unwrap_or_default();
        let mut merged = Vec::with_capacity(history.len() + local.len());

        for message in history {
            let matched = local.iter().position(|e| {
                (e.is_confirmed() && e.id == message.id)
                    || (!e.is_confirmed()
                        && e.correlation_id.is_some()
                        && e.correlation_id == message.correlation_id)
            });
            match matched {
                Some(idx) => {
                    let mut entry = local.remove(idx);
                    entry.absorb(message);
                    merged.push(entry);
                }
                None => merged.push(TimelineEntry::confirmed(message)),
            }
        }
        merged.extend(local.into_iter().filter(|e| !e.is_confirmed()));
        self.timelines.insert(conversation_id, merged);

        for message in history {
            self.drain_buffered(&conversation_id, &message.id);
        }
    }

    /// Drop buffered updates older than the window. Returns how many.
    pub fn prune_buffered(&mut self, now_ms: u64) -> usize {
        let window = self.buffer_window_ms;
        let before = self.buffered.len();
        self.buffered
            .retain(|_, b| now_ms.saturating_sub(b.received_at_ms) <= window);
        before - self.buffered.len()
    }

    pub fn buffered_count(&self) -> usize {
        self.buffered.len()
    }

    pub fn pending_count(&self) -> usize {
        self.timelines
            .values()
            .flat_map(|t| t.iter())
            .filter(|e| e.state == EntryState::Pending)
            .count()
    }

    fn confirmed_entry_mut(
        &mut self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Option<&mut TimelineEntry> {
        self.timelines
            .get_mut(conversation_id)?
            .iter_mut()
            .find(|e| e.is_confirmed() && &e.id == message_id)
    }

    fn drain_buffered(&mut self, conversation_id: &ConversationId, message_id: &MessageId) {
        let Some(buffered) = self.buffered.remove(message_id) else {
            return;
        };
        if let Some(entry) = self.confirmed_entry_mut(conversation_id, message_id) {
            entry.status = entry.status.max(buffered.status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_core::Conversation;

    const WINDOW_MS: u64 = 10_000;

    struct Fixture {
        me: UserId,
        peer: UserId,
        conv: Conversation,
        reconciler: Reconciler,
    }

    fn fixture() -> Fixture {
        let me = Uuid::new_v4();
        let peer = Uuid::new_v4();
        Fixture {
            me,
            peer,
            conv: Conversation::direct(me, peer),
            reconciler: Reconciler::new(me, WINDOW_MS),
        }
    }

    impl Fixture {
        /// What the relay would persist for `outgoing`.
        fn persisted(&self, outgoing: &OutgoingMessage) -> ChatMessage {
            ChatMessage::new(
                &self.conv,
                self.me,
                outgoing.content.clone(),
                Some(outgoing.correlation_id),
                5_000,
            )
        }

        fn from_peer(&self, content: &str) -> ChatMessage {
            ChatMessage::new(&self.conv, self.peer, content, None, 5_000)
        }
    }

    #[test]
    fn test_pending_then_confirmed_in_place() {
        let mut f = fixture();
        let first = f.reconciler.begin_send(f.conv.id, "hi", 1_000);
        f.reconciler.begin_send(f.conv.id, "second", 1_001);

        let entries = f.reconciler.entries(&f.conv.id);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].state, EntryState::Pending);
        assert_eq!(entries[0].status, MessageStatus::Sent);

        let persisted = f.persisted(&first);
        assert_eq!(
            f.reconciler.confirm(&persisted, first.correlation_id),
            Confirmation::Replaced
        );

        let entries = f.reconciler.entries(&f.conv.id);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, persisted.id);
        assert_eq!(entries[0].state, EntryState::Confirmed);
        assert_eq!(entries[1].content, "second");
        assert_eq!(f.reconciler.pending_count(), 1);
    }

    #[test]
    fn test_confirm_twice_is_duplicate() {
        let mut f = fixture();
        let out = f.reconciler.begin_send(f.conv.id, "hi", 0);
        let persisted = f.persisted(&out);

        f.reconciler.confirm(&persisted, out.correlation_id);
        assert_eq!(
            f.reconciler.confirm(&persisted, out.correlation_id),
            Confirmation::Duplicate
        );
        assert_eq!(f.reconciler.entries(&f.conv.id).len(), 1);
    }

    #[test]
    fn test_confirm_without_pending_appends() {
        let mut f = fixture();
        let other_tab = OutgoingMessage {
            provisional_id: Uuid::new_v4(),
            correlation_id: Uuid::new_v4(),
            conversation_id: f.conv.id,
            content: "from elsewhere".into(),
        };
        let persisted = f.persisted(&other_tab);
        assert_eq!(
            f.reconciler.confirm(&persisted, other_tab.correlation_id),
            Confirmation::Appended
        );
    }

    #[test]
    fn test_receive_dedups() {
        let mut f = fixture();
        let msg = f.from_peer("hello");
        assert!(f.reconciler.receive(&msg));
        assert!(!f.reconciler.receive(&msg));
        assert_eq!(f.reconciler.entries(&f.conv.id).len(), 1);
    }

    #[test]
    fn test_status_never_applies_to_pending() {
        let mut f = fixture();
        let out = f.reconciler.begin_send(f.conv.id, "hi", 0);

        // Addressed by provisional id: nothing confirmed matches
        assert_eq!(
            f.reconciler
                .apply_status(&f.conv.id, &out.provisional_id, MessageStatus::Read, 0),
            StatusApplied::Buffered
        );
        assert_eq!(f.reconciler.entries(&f.conv.id)[0].status, MessageStatus::Sent);
    }

    #[test]
    fn test_status_before_confirmation_is_buffered_then_applied() {
        let mut f = fixture();
        let out = f.reconciler.begin_send(f.conv.id, "hi", 0);
        let persisted = f.persisted(&out);

        assert_eq!(
            f.reconciler
                .apply_status(&f.conv.id, &persisted.id, MessageStatus::Delivered, 100),
            StatusApplied::Buffered
        );
        assert_eq!(f.reconciler.buffered_count(), 1);

        f.reconciler.confirm(&persisted, out.correlation_id);
        assert_eq!(f.reconciler.entries(&f.conv.id)[0].status, MessageStatus::Delivered);
        assert_eq!(f.reconciler.buffered_count(), 0);
    }

    #[test]
    fn test_status_is_monotonic() {
        let mut f = fixture();
        let out = f.reconciler.begin_send(f.conv.id, "hi", 0);
        let persisted = f.persisted(&out);
        f.reconciler.confirm(&persisted, out.correlation_id);

        let id = persisted.id;
        assert_eq!(
            f.reconciler.apply_status(&f.conv.id, &id, MessageStatus::Read, 0),
            StatusApplied::Applied
        );
        assert_eq!(
            f.reconciler.apply_status(&f.conv.id, &id, MessageStatus::Delivered, 0),
            StatusApplied::Unchanged
        );
        assert_eq!(f.reconciler.entries(&f.conv.id)[0].status, MessageStatus::Read);
    }

    #[test]
    fn test_buffer_window_pruning() {
        let mut f = fixture();
        let unknown = Uuid::new_v4();
        f.reconciler
            .apply_status(&f.conv.id, &unknown, MessageStatus::Delivered, 1_000);

        assert_eq!(f.reconciler.prune_buffered(1_000 + WINDOW_MS), 0);
        assert_eq!(f.reconciler.prune_buffered(1_001 + WINDOW_MS), 1);
        assert_eq!(f.reconciler.buffered_count(), 0);
    }

    #[test]
    fn test_fail_and_retry_keeps_position() {
        let mut f = fixture();
        let first = f.reconciler.begin_send(f.conv.id, "one", 0);
        f.reconciler.begin_send(f.conv.id, "two", 1);

        assert_eq!(f.reconciler.fail(&first.correlation_id), Some(first.provisional_id));
        assert_eq!(f.reconciler.entries(&f.conv.id)[0].state, EntryState::Failed);

        let retried = f.reconciler.retry(&first.provisional_id, 10).unwrap();
        assert_ne!(retried.provisional_id, first.provisional_id);
        assert_ne!(retried.correlation_id, first.correlation_id);
        assert_eq!(retried.content, "one");

        let entries = f.reconciler.entries(&f.conv.id);
        assert_eq!(entries[0].id, retried.provisional_id);
        assert_eq!(entries[0].state, EntryState::Pending);

        // The stale correlation token no longer matches anything
        assert_eq!(f.reconciler.fail(&first.correlation_id), None);
    }

    #[test]
    fn test_retry_errors() {
        let mut f = fixture();
        let out = f.reconciler.begin_send(f.conv.id, "x", 0);
        assert_eq!(
            f.reconciler.retry(&out.provisional_id, 0),
            Err(ReconcileError::NotFailed(out.provisional_id))
        );
        let unknown = Uuid::new_v4();
        assert_eq!(
            f.reconciler.retry(&unknown, 0),
            Err(ReconcileError::UnknownEntry(unknown))
        );
    }

    #[test]
    fn test_transport_loss_fails_pending_only() {
        let mut f = fixture();
        let a = f.reconciler.begin_send(f.conv.id, "a", 0);
        f.reconciler.begin_send(f.conv.id, "b", 0);
        f.reconciler.confirm(&f.persisted(&a), a.correlation_id);

        let failed = f.reconciler.fail_all_pending();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].content, "b");
        assert_eq!(f.reconciler.pending_count(), 0);
    }

    #[test]
    fn test_history_confirms_failed_entry_by_token() {
        let mut f = fixture();
        let out = f.reconciler.begin_send(f.conv.id, "did it arrive?", 0);
        f.reconciler.fail_all_pending();

        // The relay did persist it before the socket dropped
        let persisted = f.persisted(&out);
        let earlier = f.from_peer("earlier");
        f.reconciler.load_history(f.conv.id, &[earlier.clone(), persisted.clone()]);

        let entries = f.reconciler.entries(&f.conv.id);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, earlier.id);
        assert_eq!(entries[1].id, persisted.id);
        assert_eq!(entries[1].state, EntryState::Confirmed);
    }

    #[test]
    fn test_history_never_regresses_status() {
        let mut f = fixture();
        let out = f.reconciler.begin_send(f.conv.id, "hi", 0);
        let persisted = f.persisted(&out);
        f.reconciler.confirm(&persisted, out.correlation_id);
        f.reconciler
            .apply_status(&f.conv.id, &persisted.id, MessageStatus::Read, 0);

        // Stale snapshot still says Sent
        f.reconciler.load_history(f.conv.id, &[persisted]);
        assert_eq!(f.reconciler.entries(&f.conv.id)[0].status, MessageStatus::Read);
    }

    #[test]
    fn test_history_keeps_unmatched_pending_at_end() {
        let mut f = fixture();
        let out = f.reconciler.begin_send(f.conv.id, "in flight", 0);
        let msg = f.from_peer("old");
        f.reconciler.load_history(f.conv.id, &[msg]);

        let entries = f.reconciler.entries(&f.conv.id);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].id, out.provisional_id);
        assert_eq!(entries[1].state, EntryState::Pending);
    }

    #[test]
    fn test_history_applies_buffered_status() {
        let mut f = fixture();
        let msg = f.from_peer("hi");
        f.reconciler
            .apply_status(&f.conv.id, &msg.id, MessageStatus::Read, 0);
        f.reconciler.load_history(f.conv.id, &[msg]);
        assert_eq!(f.reconciler.entries(&f.conv.id)[0].status, MessageStatus::Read);
    }
}
