//! WebSocket relay server.
//!
//! ```text
//! TCP accept ──► upgrade (user_id + token checked) ──► connection task
//!                                                       │
//!     ┌─────────────────────────────────────────────────┤ select!
//!     ▼                       ▼                         ▼
//! ClientFrame ──► dispatch   outbound queue ──► ws    heartbeat ping
//!     │            │
//!     └─ reply ◄───┘ (MessageConfirmed, History, Error, Pong)
//! ```
//!
//! One task per connection. A user has at most one registered connection;
//! a newer connection replaces the mapping and the older socket stays open
//! without receiving pushes until it disconnects.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use murmur_core::{
    ClientFrame, ConnectionId, ErrorKind, HandshakeError, HandshakeParams, ServerFrame, UserId,
};

use crate::auth::Authenticator;
use crate::config::RelayConfig;
use crate::coordinator::DeliveryCoordinator;
use crate::directory::ConversationDirectory;
use crate::registry::ConnectionRegistry;
use crate::rooms::RoomManager;
use crate::store::{MemoryMessageStore, MessageStore, RocksMessageStore, StoreConfig, StoreError};

type ConnectionResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_handshakes: u64,
    /// Connections whose registry entry was taken over by a newer one.
    pub replaced_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
}

#[derive(Clone)]
struct ConnectionContext {
    coordinator: Arc<DeliveryCoordinator>,
    authenticator: Arc<dyn Authenticator>,
    stats: Arc<RwLock<ServerStats>>,
    outbox_capacity: usize,
    heartbeat_interval: Duration,
}

pub struct RelayServer {
    config: RelayConfig,
    coordinator: Arc<DeliveryCoordinator>,
    authenticator: Arc<dyn Authenticator>,
    stats: Arc<RwLock<ServerStats>>,
}

impl RelayServer {
    /// Create a relay; opens RocksDB when `storage_path` is set.
    pub fn new(
        config: RelayConfig,
        conversations: Arc<dyn ConversationDirectory>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Result<Self, StoreError> {
        let store: Arc<dyn MessageStore> = match &config.storage_path {
            Some(path) => Arc::new(RocksMessageStore::open(StoreConfig::at(path))?),
            None => Arc::new(MemoryMessageStore::new()),
        };
        Ok(Self::with_store(config, store, conversations, authenticator))
    }

    pub fn with_store(
        config: RelayConfig,
        store: Arc<dyn MessageStore>,
        conversations: Arc<dyn ConversationDirectory>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        let coordinator = DeliveryCoordinator::new(
            store,
            conversations,
            Arc::new(ConnectionRegistry::new()),
            Arc::new(RoomManager::new()),
        )
        .with_max_content_len(config.max_content_len);

        Self {
            config,
            coordinator: Arc::new(coordinator),
            authenticator,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Bind the configured address and serve until an accept error.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.run_on(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn run_on(&self, listener: TcpListener) -> std::io::Result<()> {
        log::info!("Relay listening on {}", listener.local_addr()?);

        if let Some(period) = self.config.token_sweep_interval() {
            tokio::spawn(sweep_expired_tokens(self.authenticator.clone(), period));
        }

        let ctx = ConnectionContext {
            coordinator: self.coordinator.clone(),
            authenticator: self.authenticator.clone(),
            stats: self.stats.clone(),
            outbox_capacity: self.config.outbox_capacity.max(1),
            heartbeat_interval: self.config.heartbeat_interval(),
        };

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let ctx = ctx.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, ctx).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        ctx: ConnectionContext,
    ) -> ConnectionResult {
        let mut handshake: Option<Result<UserId, (StatusCode, String)>> = None;
        let authenticator = ctx.authenticator.clone();
        let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            let outcome = authorize(req.uri().query(), authenticator.as_ref());
            let result = match &outcome {
                Ok(_) => Ok(resp),
                Err((status, reason)) => {
                    let mut rejection = ErrorResponse::new(Some(reason.clone()));
                    *rejection.status_mut() = *status;
                    Err(rejection)
                }
            };
            handshake = Some(outcome);
            result
        };

        let accepted = tokio_tungstenite::accept_hdr_async(stream, callback).await;
        let (ws_stream, user_id) = match (accepted, handshake) {
            (Ok(ws), Some(Ok(user_id))) => (ws, user_id),
            (_, Some(Err((status, reason)))) => {
                log::info!("Handshake from {addr} rejected ({status}): {reason}");
                ctx.stats.write().await.rejected_handshakes += 1;
                return Ok(());
            }
            (Err(e), _) => return Err(e.into()),
            (Ok(_), None) => return Err("handshake callback did not run".into()),
        };
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let connection_id: ConnectionId = Uuid::new_v4();
        let (outbox_tx, mut outbox_rx) = mpsc::channel::<Arc<Vec<u8>>>(ctx.outbox_capacity);
        let registry = ctx.coordinator.registry().clone();
        if let Some(previous) = registry.register(user_id, connection_id, outbox_tx).await {
            log::info!("User {user_id} reconnected; connection {previous} no longer receives pushes");
            ctx.stats.write().await.replaced_connections += 1;
        }
        log::info!("User {user_id} connected from {addr} as {connection_id}");

        {
            let mut s = ctx.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut heartbeat = tokio::time::interval_at(
            tokio::time::Instant::now() + ctx.heartbeat_interval,
            ctx.heartbeat_interval,
        );
        let mut outbox_open = true;

        let outcome = async {
            let welcome = ServerFrame::Welcome {
                user_id,
                connection_id,
            };
            ws_sender
                .send(Message::Binary(welcome.encode()?.into()))
                .await?;

            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                {
                                    let mut s = ctx.stats.write().await;
                                    s.total_frames += 1;
                                    s.total_bytes += data.len() as u64;
                                }
                                let replies = match ClientFrame::decode(&data) {
                                    Ok(frame) => {
                                        log::trace!("{user_id}: {}", frame.name());
                                        dispatch(&ctx.coordinator, user_id, connection_id, frame).await
                                    }
                                    Err(e) => {
                                        log::warn!("Failed to decode frame from {addr}: {e}");
                                        vec![ServerFrame::error(ErrorKind::Validation, e.to_string(), None)]
                                    }
                                };
                                for reply in replies {
                                    ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                }
                            }

                            Some(Ok(Message::Text(_))) => {
                                let reply = ServerFrame::error(
                                    ErrorKind::Validation,
                                    "text frames are not supported",
                                    None,
                                );
                                ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                            }

                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection {connection_id} of {user_id} closed");
                                break;
                            }

                            Some(Err(e)) => {
                                log::warn!("WebSocket error from {addr}: {e}");
                                break;
                            }

                            _ => {}
                        }
                    }

                    pushed = outbox_rx.recv(), if outbox_open => {
                        match pushed {
                            Some(bytes) => {
                                ws_sender.send(Message::Binary(bytes.to_vec().into())).await?;
                            }
                            // Registry entry was replaced by a newer connection
                            None => outbox_open = false,
                        }
                    }

                    _ = heartbeat.tick() => {
                        ws_sender.send(Message::Ping(Vec::new().into())).await?;
                    }
                }
            }
            Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
        }
        .await;

        // Cleanup runs for clean and failed exits alike
        let left = ctx.coordinator.rooms().leave_all(&user_id, &connection_id).await;
        if !left.is_empty() {
            log::debug!("{user_id} left {} rooms on disconnect", left.len());
        }
        if registry.unregister(&user_id, &connection_id).await {
            ctx.coordinator.announce_presence(user_id, false).await;
        }
        {
            let mut s = ctx.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }

        outcome
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &Arc<DeliveryCoordinator> {
        &self.coordinator
    }

    pub fn authenticator(&self) -> &Arc<dyn Authenticator> {
        &self.authenticator
    }
}

/// Check the upgrade query: 400 for a missing or malformed user id,
/// 401 for a missing or rejected token.
fn authorize(
    query: Option<&str>,
    authenticator: &dyn Authenticator,
) -> Result<UserId, (StatusCode, String)> {
    let params = HandshakeParams::from_query(query).map_err(|e| {
        let status = match e {
            HandshakeError::MissingToken | HandshakeError::InvalidToken => {
                StatusCode::UNAUTHORIZED
            }
            HandshakeError::MissingUserId | HandshakeError::InvalidUserId => StatusCode::BAD_REQUEST,
        };
        (status, e.to_string())
    })?;
    authenticator
        .authenticate(&params.user_id, &params.token)
        .map_err(|e| (StatusCode::UNAUTHORIZED, e.to_string()))
}

/// Purge expired credentials every `period`.
async fn sweep_expired_tokens(authenticator: Arc<dyn Authenticator>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    // The first tick completes immediately
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let purged = authenticator.purge_expired();
        if purged > 0 {
            log::debug!("Purged {purged} expired tokens");
        }
    }
}

/// Handle one client frame; returns the frames to send back on this
/// connection.
async fn dispatch(
    coordinator: &DeliveryCoordinator,
    user_id: UserId,
    connection_id: ConnectionId,
    frame: ClientFrame,
) -> Vec<ServerFrame> {
    match frame {
        ClientFrame::JoinRoom { conversation_id } => {
            match coordinator.join_room(user_id, connection_id, conversation_id).await {
                Ok(_) => Vec::new(),
                Err(e) => vec![e.to_frame(None)],
            }
        }

        ClientFrame::LeaveRoom { conversation_id } => {
            coordinator
                .leave_room(user_id, connection_id, conversation_id)
                .await;
            Vec::new()
        }

        ClientFrame::SendMessage {
            conversation_id,
            content,
            correlation_id,
        } => {
            match coordinator
                .handle_send(user_id, conversation_id, &content, Some(correlation_id))
                .await
            {
                Ok(outcome) => vec![ServerFrame::MessageConfirmed {
                    message: outcome.message,
                    correlation_id,
                }],
                Err(e) => {
                    log::debug!("Send from {user_id} rejected: {e}");
                    vec![e.to_frame(Some(correlation_id))]
                }
            }
        }

        ClientFrame::AckDelivered { message_id } => {
            match coordinator.handle_delivery_ack(user_id, message_id).await {
                Ok(_) => Vec::new(),
                Err(e) => vec![e.to_frame(None)],
            }
        }

        ClientFrame::AckRead { message_id } => {
            match coordinator.handle_read_ack(user_id, message_id).await {
                Ok(_) => Vec::new(),
                Err(e) => vec![e.to_frame(None)],
            }
        }

        ClientFrame::FetchHistory { conversation_id } => {
            match coordinator.handle_fetch_history(user_id, conversation_id).await {
                Ok(messages) => vec![ServerFrame::History {
                    conversation_id,
                    messages,
                }],
                Err(e) => vec![e.to_frame(None)],
            }
        }

        ClientFrame::AnnouncePresence => {
            coordinator.announce_presence(user_id, true).await;
            Vec::new()
        }

        ClientFrame::Typing { conversation_id } => {
            match coordinator.relay_typing(user_id, conversation_id).await {
                Ok(_) => Vec::new(),
                Err(e) => vec![e.to_frame(None)],
            }
        }

        ClientFrame::Ping => vec![ServerFrame::Pong],
    }
}
