//! Binary frame protocol between chat clients and the relay.
//!
//! Every WebSocket binary message carries exactly one frame, bincode-encoded
//! with the standard configuration:
//!
//! ```text
//! ┌──────────────┬─────────────────────────────┐
//! │ variant tag  │ variant fields              │
//! │ varint       │ bincode standard encoding   │
//! └──────────────┴─────────────────────────────┘
//! ```
//!
//! The handshake is carried in the upgrade request query string:
//! `ws://host:port/?user_id=<uuid>&token=<bearer>`.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::model::{ChatMessage, ConnectionId, ConversationId, MessageId, MessageStatus, UserId};

/// Wire-level error category reported back to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Missing or invalid fields.
    Validation,
    /// Caller is not allowed to perform the action.
    Auth,
    /// Referenced message or conversation does not exist.
    NotFound,
    /// The message store rejected the write.
    Persistence,
}

/// Frames sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientFrame {
    JoinRoom {
        conversation_id: ConversationId,
    },
    LeaveRoom {
        conversation_id: ConversationId,
    },
    SendMessage {
        conversation_id: ConversationId,
        content: String,
        correlation_id: Uuid,
    },
    AckDelivered {
        message_id: MessageId,
    },
    AckRead {
        message_id: MessageId,
    },
    FetchHistory {
        conversation_id: ConversationId,
    },
    AnnouncePresence,
    Typing {
        conversation_id: ConversationId,
    },
    Ping,
}

/// Frames sent by the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerFrame {
    /// Handshake accepted.
    Welcome {
        user_id: UserId,
        connection_id: ConnectionId,
    },
    /// The sender's own message, as persisted.
    MessageConfirmed {
        message: ChatMessage,
        correlation_id: Uuid,
    },
    /// A message from another participant.
    MessageReceived {
        message: ChatMessage,
    },
    StatusUpdated {
        message_id: MessageId,
        conversation_id: ConversationId,
        status: MessageStatus,
    },
    History {
        conversation_id: ConversationId,
        messages: Vec<ChatMessage>,
    },
    PresenceChanged {
        user_id: UserId,
        online: bool,
    },
    PeerTyping {
        conversation_id: ConversationId,
        user_id: UserId,
    },
    Error {
        kind: ErrorKind,
        message: String,
        /// Set when the failing frame was a `SendMessage`.
        correlation_id: Option<Uuid>,
    },
    Pong,
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

impl ClientFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }

    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinRoom { .. } => "join_room",
            Self::LeaveRoom { .. } => "leave_room",
            Self::SendMessage { .. } => "send_message",
            Self::AckDelivered { .. } => "ack_delivered",
            Self::AckRead { .. } => "ack_read",
            Self::FetchHistory { .. } => "fetch_history",
            Self::AnnouncePresence => "announce_presence",
            Self::Typing { .. } => "typing",
            Self::Ping => "ping",
        }
    }
}

impl ServerFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }

    pub fn error(kind: ErrorKind, message: impl Into<String>, correlation_id: Option<Uuid>) -> Self {
        Self::Error {
            kind,
            message: message.into(),
            correlation_id,
        }
    }

    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Welcome { .. } => "welcome",
            Self::MessageConfirmed { .. } => "message_confirmed",
            Self::MessageReceived { .. } => "message_received",
            Self::StatusUpdated { .. } => "status_updated",
            Self::History { .. } => "history",
            Self::PresenceChanged { .. } => "presence_changed",
            Self::PeerTyping { .. } => "peer_typing",
            Self::Error { .. } => "error",
            Self::Pong => "pong",
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection timeout")]
    Timeout,
    #[error("Handshake rejected with HTTP status {0}")]
    HandshakeRejected(u16),
}

/// Identity presented by a client when upgrading to a WebSocket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeParams {
    pub user_id: UserId,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    #[error("handshake is missing user_id")]
    MissingUserId,
    #[error("handshake user_id is not a valid id")]
    InvalidUserId,
    #[error("handshake is missing a bearer token")]
    MissingToken,
    #[error("handshake token is not valid percent-encoded UTF-8")]
    InvalidToken,
}

impl HandshakeParams {
    pub fn new(user_id: UserId, token: impl Into<String>) -> Self {
        Self {
            user_id,
            token: token.into(),
        }
    }

    /// Parse `user_id` and `token` from an upgrade request query string.
    pub fn from_query(query: Option<&str>) -> Result<Self, HandshakeError> {
        let mut user_id = None;
        let mut token = None;
        for pair in query.unwrap_or_default().split('&') {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            match key {
                "user_id" if !value.is_empty() => user_id = Some(value),
                "token" if !value.is_empty() => token = Some(value),
                _ => {}
            }
        }

        let user_id = user_id.ok_or(HandshakeError::MissingUserId)?;
        let user_id = Uuid::parse_str(user_id).map_err(|_| HandshakeError::InvalidUserId)?;
        let token = token.ok_or(HandshakeError::MissingToken)?;
        let token = urlencoding::decode(token).map_err(|_| HandshakeError::InvalidToken)?;
        Ok(Self::new(user_id, token))
    }

    /// Full connection URL for `base` (e.g. `ws://127.0.0.1:9090`).
    ///
    /// The token is percent-encoded.
    pub fn url(&self, base: &str) -> String {
        format!(
            "{}/?user_id={}&token={}",
            base.trim_end_matches('/'),
            self.user_id,
            urlencoding::encode(&self.token)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Conversation;

    #[test]
    fn test_send_message_roundtrip() {
        let frame = ClientFrame::SendMessage {
            conversation_id: Uuid::new_v4(),
            content: "hi".into(),
            correlation_id: Uuid::new_v4(),
        };
        let decoded = ClientFrame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoded.name(), "send_message");
    }

    #[test]
    fn test_confirmed_frame_carries_message() {
        let a = Uuid::new_v4();
        let conv = Conversation::direct(a, Uuid::new_v4());
        let correlation_id = Uuid::new_v4();
        let message = ChatMessage::new(&conv, a, "hello", Some(correlation_id), 42);

        let frame = ServerFrame::MessageConfirmed {
            message: message.clone(),
            correlation_id,
        };
        match ServerFrame::decode(&frame.encode().unwrap()).unwrap() {
            ServerFrame::MessageConfirmed {
                message: decoded,
                correlation_id: cid,
            } => {
                assert_eq!(decoded, message);
                assert_eq!(cid, correlation_id);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(ClientFrame::decode(&garbage).is_err());
        assert!(ServerFrame::decode(&garbage).is_err());
    }

    #[test]
    fn test_error_frame_helper() {
        let frame = ServerFrame::error(ErrorKind::Validation, "empty", None);
        assert_eq!(
            frame,
            ServerFrame::Error {
                kind: ErrorKind::Validation,
                message: "empty".into(),
                correlation_id: None,
            }
        );
    }

    #[test]
    fn test_handshake_query_parse() {
        let id = Uuid::new_v4();
        let query = format!("user_id={id}&token=abc123");
        let params = HandshakeParams::from_query(Some(&query)).unwrap();
        assert_eq!(params.user_id, id);
        assert_eq!(params.token, "abc123");
    }

    #[test]
    fn test_handshake_missing_user_id() {
        assert_eq!(
            HandshakeParams::from_query(Some("token=abc")),
            Err(HandshakeError::MissingUserId)
        );
        assert_eq!(
            HandshakeParams::from_query(None),
            Err(HandshakeError::MissingUserId)
        );
        assert_eq!(
            HandshakeParams::from_query(Some("user_id=&token=abc")),
            Err(HandshakeError::MissingUserId)
        );
    }

    #[test]
    fn test_handshake_invalid_user_id_and_token() {
        assert_eq!(
            HandshakeParams::from_query(Some("user_id=bob&token=abc")),
            Err(HandshakeError::InvalidUserId)
        );
        let id = Uuid::new_v4();
        assert_eq!(
            HandshakeParams::from_query(Some(&format!("user_id={id}"))),
            Err(HandshakeError::MissingToken)
        );
    }

    #[test]
    fn test_handshake_url_roundtrip() {
        let params = HandshakeParams::new(Uuid::new_v4(), "tok");
        let url = params.url("ws://127.0.0.1:9090/");
        let query = url.split_once('?').map(|(_, q)| q);
        assert_eq!(HandshakeParams::from_query(query).unwrap(), params);
        assert!(url.starts_with("ws://127.0.0.1:9090/?"));
    }

    #[test]
    fn test_handshake_token_with_reserved_characters() {
        let params = HandshakeParams::new(Uuid::new_v4(), "a&b=c#d%e f+/");
        let url = params.url("ws://127.0.0.1:9090");
        assert!(!url.contains('#'));
        let query = url.split_once('?').map(|(_, q)| q);
        assert_eq!(HandshakeParams::from_query(query).unwrap(), params);
    }

    #[test]
    fn test_handshake_rejects_malformed_token_encoding() {
        let id = Uuid::new_v4();
        assert_eq!(
            HandshakeParams::from_query(Some(&format!("user_id={id}&token=%FF%FE"))),
            Err(HandshakeError::InvalidToken)
        );
        let params = HandshakeParams::from_query(Some(&format!("user_id={id}&token=a%2Bb"))).unwrap();
        assert_eq!(params.token, "a+b");
    }
}
