//! # murmur-relay — real-time message delivery server
//!
//! Bridges WebSocket chat events to a persistent message store and pushes
//! messages and delivery/read status to whichever participants are online.
//!
//! ## Architecture
//!
//! ```text
//!   ws connection task (one per user)
//!         │  ClientFrame
//!         ▼
//! ┌───────────────────┐  append / receipts  ┌──────────────┐
//! │DeliveryCoordinator│ ──────────────────► │ MessageStore │
//! └─────────┬─────────┘                     │ (RocksDB or  │
//!           │ lookup / route                │  in-memory)  │
//!           ▼                               └──────────────┘
//! ┌───────────────────┐     ┌─────────────┐
//! │ConnectionRegistry │     │ RoomManager │
//! │ user → connection │     │ joined rooms│
//! └─────────┬─────────┘     └─────────────┘
//!           │ try_send (fire-and-forget)
//!           ▼
//!   recipient's outbound queue → ws writer
//! ```
//!
//! ## Modules
//!
//! - [`registry`] — user → live connection mapping with conditional removal
//! - [`rooms`] — conversation rooms a connection has joined
//! - [`store`] — message persistence (RocksDB, in-memory)
//! - [`directory`] — users and conversations
//! - [`auth`] — bearer token issue/verify
//! - [`coordinator`] — send, delivery ack and read ack handling
//! - [`server`] — WebSocket accept loop and per-connection tasks
//! - [`config`] — relay settings and seed data

pub mod auth;
pub mod config;
pub mod coordinator;
pub mod directory;
pub mod registry;
pub mod rooms;
pub mod server;
pub mod store;

pub use auth::{AuthError, Authenticator, TokenAuthority};
pub use config::{ConfigError, RelayConfig, SeedFile};
pub use coordinator::{AckOutcome, DeliveryCoordinator, DeliveryError, SendOutcome};
pub use directory::{ConversationDirectory, DirectoryError, InMemoryDirectory, UserDirectory};
pub use registry::{ConnectionRegistry, Outbox, PushStats};
pub use rooms::{Room, RoomManager};
pub use server::{RelayServer, ServerStats};
pub use store::{MemoryMessageStore, MessageStore, RocksMessageStore, StoreConfig, StoreError, StoreUpdate};
