//! Connection registry: which live connection a user is reachable on.
//!
//! One connection per user. A newer registration silently replaces the old
//! one; the old socket stays open but no longer receives pushes. Removal is
//! conditional on the connection id so a late disconnect of a replaced
//! socket cannot evict the fresh mapping.
//!
//! Each entry carries the connection's outbound queue. Pushes use
//! `try_send` and never wait on a slow peer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

use murmur_core::{ConnectionId, UserId};

/// Outbound queue of one connection; frames are pre-encoded.
pub type Outbox = mpsc::Sender<Arc<Vec<u8>>>;

#[derive(Debug, Clone)]
struct Registration {
    connection_id: ConnectionId,
    outbox: Outbox,
}

/// Push counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushStats {
    pub pushes_sent: u64,
    /// Target offline, queue full, or queue closed.
    pub pushes_dropped: u64,
    pub online_users: usize,
}

struct AtomicPushStats {
    pushes_sent: AtomicU64,
    pushes_dropped: AtomicU64,
}

pub struct ConnectionRegistry {
    entries: RwLock<HashMap<UserId, Registration>>,
    stats: AtomicPushStats,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            stats: AtomicPushStats {
                pushes_sent: AtomicU64::new(0),
                pushes_dropped: AtomicU64::new(0),
            },
        }
    }

    /// Map `user_id` to `connection_id`, replacing any previous mapping.
    ///
    /// Returns the replaced connection id, if it differs from the new one.
    pub async fn register(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
        outbox: Outbox,
    ) -> Option<ConnectionId> {
        let mut entries = self.entries.write().await;
        let previous = entries.insert(
            user_id,
            Registration {
                connection_id,
                outbox,
            },
        );
        previous
            .map(|p| p.connection_id)
            .filter(|id| *id != connection_id)
    }

    /// Current connection of `user_id`, or `None` if not reachable.
    pub async fn lookup(&self, user_id: &UserId) -> Option<ConnectionId> {
        self.entries
            .read()
            .await
            .get(user_id)
            .map(|r| r.connection_id)
    }

    /// Outbound queue of the user's current connection.
    pub async fn route(&self, user_id: &UserId) -> Option<Outbox> {
        self.entries
            .read()
            .await
            .get(user_id)
            .map(|r| r.outbox.clone())
    }

    /// Remove the mapping only if it still points at `connection_id`.
    ///
    /// Returns `true` if an entry was removed.
    pub async fn unregister(&self, user_id: &UserId, connection_id: &ConnectionId) -> bool {
        let mut entries = self.entries.write().await;
        match entries.get(user_id) {
            Some(current) if current.connection_id == *connection_id => {
                entries.remove(user_id);
                true
            }
            _ => false,
        }
    }

    /// Queue `frame` on the user's connection without waiting.
    ///
    /// Returns `false` when the user is offline or the queue cannot take
    /// the frame. That is an expected outcome, not an error.
    pub async fn push(&self, user_id: &UserId, frame: Arc<Vec<u8>>) -> bool {
        let delivered = match self.route(user_id).await {
            Some(outbox) => match outbox.try_send(frame) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    log::warn!("Outbound queue full for user {user_id}, push dropped");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    log::debug!("Outbound queue closed for user {user_id}");
                    false
                }
            },
            None => false,
        };

        let counter = if delivered {
            &self.stats.pushes_sent
        } else {
            &self.stats.pushes_dropped
        };
        counter.fetch_add(1, Ordering::Relaxed);
        delivered
    }

    pub async fn is_online(&self, user_id: &UserId) -> bool {
        self.entries.read().await.contains_key(user_id)
    }

    pub async fn online_users(&self) -> Vec<UserId> {
        self.entries.read().await.keys().copied().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn stats(&self) -> PushStats {
        PushStats {
            pushes_sent: self.stats.pushes_sent.load(Ordering::Relaxed),
            pushes_dropped: self.stats.pushes_dropped.load(Ordering::Relaxed),
            online_users: self.len().await,
        }
    }
}
