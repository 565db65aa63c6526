//! # murmur-core — shared model and wire protocol for Murmur chat delivery
//!
//! Both the relay and the client depend on this crate so that the message
//! model and the frame encoding can never drift apart.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ClientFrame (bincode)   ┌─────────────┐
//! │ ChatClient  │ ────────────────────────► │ RelayServer │
//! │ (per user)  │ ◄──────────────────────── │ (central)   │
//! └──────┬──────┘   ServerFrame (bincode)   └──────┬──────┘
//!        │                                         │
//!        ▼                                         ▼
//! ┌─────────────┐                           ┌─────────────┐
//! │ Timeline    │                           │ MessageStore│
//! │ (optimistic)│                           │ (authority) │
//! └─────────────┘                           └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`model`] — messages, receipts, conversations, users
//! - [`protocol`] — frames exchanged over the WebSocket and the handshake query

pub mod model;
pub mod protocol;

pub use model::{
    unix_millis, ChatMessage, Conversation, ConversationId, ConversationKind, ConnectionId,
    MessageId, MessageStatus, Receipt, Recipient, User, UserId,
};
pub use protocol::{
    ClientFrame, ErrorKind, HandshakeError, HandshakeParams, ProtocolError, ServerFrame,
};
