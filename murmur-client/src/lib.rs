//! # murmur-client — chat client for the Murmur relay
//!
//! ## Modules
//!
//! - [`reconcile`] — optimistic timeline: pending, confirmed and failed sends
//! - [`reconnect`] — backoff policy and connection state machine
//! - [`client`] — WebSocket client driving both

pub mod client;
pub mod reconcile;
pub mod reconnect;

pub use client::{ChatClient, ChatEvent, ClientConfig, ClientError};
pub use reconcile::{
    Confirmation, EntryState, OutgoingMessage, ReconcileError, Reconciler, StatusApplied,
    TimelineEntry,
};
pub use reconnect::{ConnectionState, ReconnectAction, ReconnectController, ReconnectPolicy};
