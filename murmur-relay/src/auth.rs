//! Bearer token authority.
//!
//! Tokens are opaque random strings bound to a user id, optionally expiring
//! after a fixed lifetime. Verification happens once, during the WebSocket
//! upgrade.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

use murmur_core::UserId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("Unknown token")]
    UnknownToken,
    #[error("Token expired")]
    Expired,
    #[error("Token does not belong to user {0}")]
    UserMismatch(UserId),
}

/// Issues and validates credentials bound to a user id.
pub trait Authenticator: Send + Sync {
    fn issue_token(&self, user_id: UserId) -> String;
    fn verify_token(&self, token: &str) -> Result<UserId, AuthError>;

    /// Verify `token` and check it was issued to `claimed`.
    fn authenticate(&self, claimed: &UserId, token: &str) -> Result<UserId, AuthError> {
        let user_id = self.verify_token(token)?;
        if &user_id != claimed {
            return Err(AuthError::UserMismatch(*claimed));
        }
        Ok(user_id)
    }

    /// Drop credentials that can no longer verify. Returns how many went.
    fn purge_expired(&self) -> usize {
        0
    }
}

#[derive(Debug, Clone, Copy)]
struct IssuedToken {
    user_id: UserId,
    issued_at: Instant,
}

/// In-process token table.
pub struct TokenAuthority {
    tokens: RwLock<HashMap<String, IssuedToken>>,
    ttl: Option<Duration>,
}

impl Default for TokenAuthority {
    fn default() -> Self {
        Self::new(None)
    }
}

impl TokenAuthority {
    /// `ttl = None` means tokens never expire.
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            tokens: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn token_count(&self) -> usize {
        self.tokens
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Authenticator for TokenAuthority {
    fn issue_token(&self, user_id: UserId) -> String {
        let token = format!(
            "{}{}",
            Uuid::new_v4().simple(),
            Uuid::new_v4().simple()
        );
        self.tokens
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                token.clone(),
                IssuedToken {
                    user_id,
                    issued_at: Instant::now(),
                },
            );
        token
    }

    fn verify_token(&self, token: &str) -> Result<UserId, AuthError> {
        let issued = self
            .tokens
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(token)
            .copied()
            .ok_or(AuthError::UnknownToken)?;

        if let Some(ttl) = self.ttl {
            if issued.issued_at.elapsed() > ttl {
                return Err(AuthError::Expired);
            }
        }
        Ok(issued.user_id)
    }

    fn purge_expired(&self) -> usize {
        let Some(ttl) = self.ttl else {
            return 0;
        };
        let mut tokens = self.tokens.write().unwrap_or_else(PoisonError::into_inner);
        let before = tokens.len();
        tokens.retain(|_, t| t.issued_at.elapsed() <= ttl);
        before - tokens.len()
    }
}
