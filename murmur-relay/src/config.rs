//! Relay settings and seed data.
//!
//! Both are plain JSON files. Missing keys fall back to defaults.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use murmur_core::{Conversation, User, UserId};

use crate::coordinator::DEFAULT_MAX_CONTENT_LEN;
use crate::directory::{DirectoryError, InMemoryDirectory, UserDirectory};

pub const DEFAULT_CONFIG_PATH: &str = "murmur.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Invalid seed data: {0}")]
    Directory(#[from] DirectoryError),
}

/// Relay server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Outbound queue capacity per connection
    pub outbox_capacity: usize,
    /// WebSocket ping interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Maximum message length in characters
    pub max_content_len: usize,
    /// RocksDB directory (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Token lifetime in seconds (None = never expire)
    pub token_ttl_secs: Option<u64>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            outbox_capacity: 256,
            heartbeat_interval_secs: 30,
            max_content_len: DEFAULT_MAX_CONTENT_LEN,
            storage_path: None,
            token_ttl_secs: None,
        }
    }
}

impl RelayConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn token_ttl(&self) -> Option<Duration> {
        self.token_ttl_secs.map(Duration::from_secs)
    }

    /// Period of the expired-token sweep; `None` when tokens never expire.
    pub fn token_sweep_interval(&self) -> Option<Duration> {
        self.token_ttl().map(|ttl| ttl.max(Duration::from_secs(1)))
    }

    /// Load from a JSON file. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            log::info!("Config file {} not found; using defaults", path.display());
            return Ok(Self::default());
        }
        read_json(path)
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| ConfigError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// A user entry in the seed file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedUser {
    /// Fixed id; generated when absent.
    #[serde(default)]
    pub id: Option<UserId>,
    pub email: String,
    pub display_name: String,
}

/// A conversation entry in the seed file. Participants are e-mails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SeedConversation {
    Direct {
        #[serde(default)]
        id: Option<Uuid>,
        participants: [String; 2],
    },
    Group {
        #[serde(default)]
        id: Option<Uuid>,
        name: String,
        participants: Vec<String>,
    },
}

/// Users and conversations loaded into the directory at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedFile {
    #[serde(default)]
    pub users: Vec<SeedUser>,
    #[serde(default)]
    pub conversations: Vec<SeedConversation>,
}

impl SeedFile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        read_json(path.as_ref())
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Register every user and conversation. Returns the seeded users.
    pub fn apply(&self, directory: &InMemoryDirectory) -> Result<Vec<User>, ConfigError> {
        let mut users = Vec::with_capacity(self.users.len());
        for seed in &self.users {
            let mut user = User::new(seed.email.clone(), seed.display_name.clone());
            if let Some(id) = seed.id {
                user.id = id;
            }
            directory.add_user(user.clone())?;
            users.push(user);
        }

        let resolve = |email: &String| -> Result<UserId, DirectoryError> {
            directory
                .find_by_email(email)
                .map(|u| u.id)
                .ok_or_else(|| DirectoryError::UnknownUser(email.clone()))
        };

        for seed in &self.conversations {
            let conversation = match seed {
                SeedConversation::Direct { id, participants } => {
                    let conversation =
                        Conversation::direct(resolve(&participants[0])?, resolve(&participants[1])?);
                    with_optional_id(conversation, *id)
                }
                SeedConversation::Group {
                    id,
                    name,
                    participants,
                } => {
                    let members = participants
                        .iter()
                        .map(&resolve)
                        .collect::<Result<Vec<_>, _>>()?;
                    with_optional_id(Conversation::group(name.clone(), members), *id)
                }
            };
            let conversation_id = directory.add_conversation(conversation)?;
            log::debug!("Seeded conversation {conversation_id}");
        }

        log::info!(
            "Seeded {} users and {} conversations",
            self.users.len(),
            self.conversations.len()
        );
        Ok(users)
    }
}

fn with_optional_id(conversation: Conversation, id: Option<Uuid>) -> Conversation {
    match id {
        Some(id) => conversation.with_id(id),
        None => conversation,
    }
}
