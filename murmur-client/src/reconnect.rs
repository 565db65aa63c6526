//! Connection lifecycle as a pure state machine.
//!
//! The controller never touches a socket. Each event returns the actions
//! the caller should perform next, so the whole policy is testable without
//! a runtime.

use std::collections::BTreeSet;
use std::time::Duration;

use murmur_core::ConversationId;

/// Exponential backoff with a cap and an attempt limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// Failed attempts tolerated before giving up.
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            cap,
            max_attempts,
        }
    }

    /// Delay before retry `attempt` (1-indexed): `min(base * 2^(attempt-1), cap)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 2_u64.saturating_pow(attempt.saturating_sub(1));
        let base_ms = u64::try_from(self.base.as_millis()).unwrap_or(u64::MAX);
        let cap_ms = u64::try_from(self.cap.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(base_ms.saturating_mul(multiplier).min(cap_ms))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30), 8)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// `attempt` is 0 for the first connect, then the retry number.
    Connecting { attempt: u32 },
    Connected,
    /// Unable to connect. Left only through `reset`.
    GaveUp,
    /// Torn down by the application. Terminal.
    Cancelled,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectAction {
    Connect { attempt: u32 },
    Wait { attempt: u32, delay: Duration },
    AnnouncePresence,
    JoinRoom(ConversationId),
    FetchHistory(ConversationId),
    LeaveRoom(ConversationId),
    GiveUp,
}

#[derive(Debug)]
pub struct ReconnectController {
    policy: ReconnectPolicy,
    state: ConnectionState,
    retries: u32,
    open_rooms: BTreeSet<ConversationId>,
}

impl ReconnectController {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            state: ConnectionState::Disconnected,
            retries: 0,
            open_rooms: BTreeSet::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn open_rooms(&self) -> impl Iterator<Item = &ConversationId> {
        self.open_rooms.iter()
    }

    /// Begin the first connection attempt.
    pub fn start(&mut self) -> Vec<ReconnectAction> {
        match self.state {
            ConnectionState::Disconnected => {
                self.state = ConnectionState::Connecting { attempt: 0 };
                vec![ReconnectAction::Connect { attempt: 0 }]
            }
            _ => Vec::new(),
        }
    }

    /// The handshake succeeded. Resynchronize every open room.
    pub fn on_connected(&mut self) -> Vec<ReconnectAction> {
        if !matches!(self.state, ConnectionState::Connecting { .. }) {
            return Vec::new();
        }
        self.state = ConnectionState::Connected;
        self.retries = 0;

        let mut actions = Vec::with_capacity(1 + self.open_rooms.len() * 2);
        actions.push(ReconnectAction::AnnouncePresence);
        for room in &self.open_rooms {
            actions.push(ReconnectAction::JoinRoom(*room));
            actions.push(ReconnectAction::FetchHistory(*room));
        }
        actions
    }

    pub fn on_connect_failed(&mut self) -> Vec<ReconnectAction> {
        if !matches!(self.state, ConnectionState::Connecting { .. }) {
            return Vec::new();
        }
        self.schedule_retry()
    }

    /// An established connection was lost.
    pub fn on_disconnected(&mut self) -> Vec<ReconnectAction> {
        if self.state != ConnectionState::Connected {
            return Vec::new();
        }
        self.schedule_retry()
    }

    /// A `Wait` has elapsed.
    pub fn on_retry_elapsed(&mut self) -> Vec<ReconnectAction> {
        if self.state != ConnectionState::Disconnected || self.retries == 0 {
            return Vec::new();
        }
        self.state = ConnectionState::Connecting {
            attempt: self.retries,
        };
        vec![ReconnectAction::Connect {
            attempt: self.retries,
        }]
    }

    /// The relay refused our credentials; retrying cannot help.
    pub fn on_auth_rejected(&mut self) -> Vec<ReconnectAction> {
        if self.state == ConnectionState::Cancelled {
            return Vec::new();
        }
        self.state = ConnectionState::GaveUp;
        vec![ReconnectAction::GiveUp]
    }

    /// Manual reconnect: clears the retry budget and connects now.
    pub fn reset(&mut self) -> Vec<ReconnectAction> {
        match self.state {
            ConnectionState::Cancelled | ConnectionState::Connected => Vec::new(),
            _ => {
                self.retries = 0;
                self.state = ConnectionState::Connecting { attempt: 0 };
                vec![ReconnectAction::Connect { attempt: 0 }]
            }
        }
    }

    pub fn cancel(&mut self) {
        self.state = ConnectionState::Cancelled;
    }

    /// Track a room to rejoin after reconnects. Emits a join when live.
    pub fn open_room(&mut self, conversation_id: ConversationId) -> Vec<ReconnectAction> {
        let added = self.open_rooms.insert(conversation_id);
        if added && self.state.is_connected() {
            vec![
                ReconnectAction::JoinRoom(conversation_id),
                ReconnectAction::FetchHistory(conversation_id),
            ]
        } else {
            Vec::new()
        }
    }

    pub fn close_room(&mut self, conversation_id: &ConversationId) -> Vec<ReconnectAction> {
        let removed = self.open_rooms.remove(conversation_id);
        if removed && self.state.is_connected() {
            vec![ReconnectAction::LeaveRoom(*conversation_id)]
        } else {
            Vec::new()
        }
    }

    fn schedule_retry(&mut self) -> Vec<ReconnectAction> {
        if self.retries >= self.policy.max_attempts {
            self.state = ConnectionState::GaveUp;
            return vec![ReconnectAction::GiveUp];
        }
        self.retries += 1;
        self.state = ConnectionState::Disconnected;
        vec![ReconnectAction::Wait {
            attempt: self.retries,
            delay: self.policy.delay_for_attempt(self.retries),
        }]
    }
}
