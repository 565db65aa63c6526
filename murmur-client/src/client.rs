//! WebSocket chat client.
//!
//! Provides:
//! - Connection lifecycle driven by [`ReconnectController`]
//! - Optimistic sends reconciled by [`Reconciler`]
//! - Automatic delivery acks, and read acks for the active conversation
//!
//! A supervisor task owns the socket. Each session spawns a writer task fed
//! by an outgoing channel; the supervisor reads frames until the connection
//! drops, then follows the controller's next actions.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use uuid::Uuid;

use murmur_core::{
    unix_millis, ChatMessage, ClientFrame, ConnectionId, ConversationId, ErrorKind,
    HandshakeParams, MessageId, MessageStatus, ProtocolError, ServerFrame, UserId,
};

use crate::reconcile::{ReconcileError, Reconciler, StatusApplied, TimelineEntry};
use crate::reconnect::{ConnectionState, ReconnectAction, ReconnectController, ReconnectPolicy};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay base URL, e.g. `ws://127.0.0.1:9090`
    pub server_url: String,
    pub user_id: UserId,
    pub token: String,
    pub reconnect: ReconnectPolicy,
    /// How long a status update may wait for its message to appear
    pub status_buffer_window: Duration,
    /// Outgoing frame queue capacity
    pub outbox_capacity: usize,
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>, user_id: UserId, token: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            user_id,
            token: token.into(),
            reconnect: ReconnectPolicy::default(),
            status_buffer_window: Duration::from_secs(10),
            outbox_capacity: 256,
        }
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }
}

/// Events emitted by the chat client.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    /// Handshake accepted by the relay
    Connected { connection_id: ConnectionId },
    /// Connection lost
    Disconnected,
    /// Waiting `delay` before retry `attempt`
    Reconnecting { attempt: u32, delay: Duration },
    /// Retries exhausted. Call `reconnect_now` to try again.
    Unreachable,
    /// The relay refused our credentials (HTTP status)
    AuthRejected { status: u16 },
    MessageReceived { message: ChatMessage },
    MessageConfirmed {
        message: ChatMessage,
        correlation_id: Uuid,
    },
    /// An optimistic send did not make it. Retry with `retry_message`.
    SendFailed {
        provisional_id: Uuid,
        correlation_id: Uuid,
        kind: Option<ErrorKind>,
        reason: String,
    },
    StatusUpdated {
        conversation_id: ConversationId,
        message_id: MessageId,
        status: MessageStatus,
    },
    HistoryLoaded {
        conversation_id: ConversationId,
        count: usize,
    },
    PresenceChanged { user_id: UserId, online: bool },
    PeerTyping {
        conversation_id: ConversationId,
        user_id: UserId,
    },
    /// A relay error not tied to one of our sends
    ServerError { kind: ErrorKind, message: String },
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Not connected to the relay")]
    NotConnected,
    #[error("Client already started")]
    AlreadyStarted,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
}

/// State shared between the client handle and its supervisor task.
struct Shared {
    config: ClientConfig,
    reconciler: Mutex<Reconciler>,
    controller: Mutex<ReconnectController>,
    outgoing: RwLock<Option<mpsc::Sender<Vec<u8>>>>,
    active_conversation: RwLock<Option<ConversationId>>,
    event_tx: mpsc::Sender<ChatEvent>,
    wake: Notify,
}

impl Shared {
    fn emit(&self, event: ChatEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            log::warn!("Dropping client event: {e}");
        }
    }

    async fn send_frame(&self, frame: &ClientFrame) -> Result<(), ClientError> {
        let bytes = frame.encode()?;
        let tx = self
            .outgoing
            .read()
            .await
            .clone()
            .ok_or(ClientError::NotConnected)?;
        tx.send(bytes).await.map_err(|_| ClientError::NotConnected)?;
        log::trace!("Sent {}", frame.name());
        Ok(())
    }

    async fn perform(&self, actions: Vec<ReconnectAction>) {
        for action in actions {
            let frame = match action {
                ReconnectAction::AnnouncePresence => ClientFrame::AnnouncePresence,
                ReconnectAction::JoinRoom(conversation_id) => ClientFrame::JoinRoom { conversation_id },
                ReconnectAction::LeaveRoom(conversation_id) => ClientFrame::LeaveRoom { conversation_id },
                ReconnectAction::FetchHistory(conversation_id) => {
                    ClientFrame::FetchHistory { conversation_id }
                }
                other => {
                    log::debug!("Ignoring {other:?} outside the supervisor");
                    continue;
                }
            };
            if let Err(e) = self.send_frame(&frame).await {
                log::debug!("Could not send {}: {e}", frame.name());
            }
        }
    }

    /// Put a reconciled send on the wire, failing the entry if we can't.
    async fn dispatch(&self, provisional_id: Uuid, frame: ClientFrame, correlation_id: Uuid) {
        if let Err(e) = self.send_frame(&frame).await {
            self.reconciler.lock().await.fail(&correlation_id);
            self.emit(ChatEvent::SendFailed {
                provisional_id,
                correlation_id,
                kind: None,
                reason: e.to_string(),
            });
        }
    }

    async fn handle_frame(&self, frame: ServerFrame) {
        let me = self.config.user_id;
        match frame {
            ServerFrame::Welcome { connection_id, .. } => {
                log::info!("Connected as {me} ({connection_id})");
                self.emit(ChatEvent::Connected { connection_id });
            }
            ServerFrame::MessageConfirmed {
                message,
                correlation_id,
            } => {
                let outcome = self.reconciler.lock().await.confirm(&message, correlation_id);
                log::debug!("Message {} confirmed: {outcome:?}", message.id);
                self.emit(ChatEvent::MessageConfirmed {
                    message,
                    correlation_id,
                });
            }
            ServerFrame::MessageReceived { message } => {
                if !self.reconciler.lock().await.receive(&message) {
                    log::trace!("Duplicate message {}", message.id);
                    return;
                }
                let message_id = message.id;
                let is_active = *self.active_conversation.read().await == Some(message.conversation_id);
                self.emit(ChatEvent::MessageReceived { message });

                let ack = if is_active {
                    ClientFrame::AckRead { message_id }
                } else {
                    ClientFrame::AckDelivered { message_id }
                };
                if let Err(e) = self.send_frame(&ack).await {
                    log::debug!("Could not ack {message_id}: {e}");
                }
            }
            ServerFrame::StatusUpdated {
                message_id,
                conversation_id,
                status,
            } => {
                let applied = self.reconciler.lock().await.apply_status(
                    &conversation_id,
                    &message_id,
                    status,
                    unix_millis(),
                );
                if applied == StatusApplied::Applied {
                    self.emit(ChatEvent::StatusUpdated {
                        conversation_id,
                        message_id,
                        status,
                    });
                }
            }
            ServerFrame::History {
                conversation_id,
                messages,
            } => {
                self.reconciler.lock().await.load_history(conversation_id, &messages);
                let is_active = *self.active_conversation.read().await == Some(conversation_id);

                let acks: Vec<ClientFrame> = messages
                    .iter()
                    .filter(|m| m.sender != me)
                    .filter_map(|m| {
                        if is_active && !m.was_read_by(&me) {
                            Some(ClientFrame::AckRead { message_id: m.id })
                        } else if !m.was_delivered_to(&me) {
                            Some(ClientFrame::AckDelivered { message_id: m.id })
                        } else {
                            None
                        }
                    })
                    .collect();
                for ack in &acks {
                    if let Err(e) = self.send_frame(ack).await {
                        log::debug!("Could not ack history: {e}");
                        break;
                    }
                }

                self.emit(ChatEvent::HistoryLoaded {
                    conversation_id,
                    count: messages.len(),
                });
            }
            ServerFrame::PresenceChanged { user_id, online } => {
                self.emit(ChatEvent::PresenceChanged { user_id, online });
            }
            ServerFrame::PeerTyping {
                conversation_id,
                user_id,
            } => {
                self.emit(ChatEvent::PeerTyping {
                    conversation_id,
                    user_id,
                });
            }
            ServerFrame::Error {
                kind,
                message,
                correlation_id,
            } => {
                let failed = match correlation_id {
                    Some(cid) => self.reconciler.lock().await.fail(&cid).map(|pid| (pid, cid)),
                    None => None,
                };
                match failed {
                    Some((provisional_id, correlation_id)) => {
                        log::warn!("Send {correlation_id} rejected: {message}");
                        self.emit(ChatEvent::SendFailed {
                            provisional_id,
                            correlation_id,
                            kind: Some(kind),
                            reason: message,
                        });
                    }
                    None => {
                        log::warn!("Relay error ({kind:?}): {message}");
                        self.emit(ChatEvent::ServerError { kind, message });
                    }
                }
            }
            ServerFrame::Pong => log::trace!("Pong"),
        }
    }
}

/// The chat client.
///
/// Manages one WebSocket connection to the relay, reconnecting with
/// backoff, and keeps an optimistic timeline per conversation.
pub struct ChatClient {
    shared: Arc<Shared>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<ChatEvent>>,

    /// Socket supervisor, once started
    supervisor: Option<JoinHandle<()>>,
}

impl ChatClient {
    pub fn new(config: ClientConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        let reconciler = Reconciler::new(
            config.user_id,
            u64::try_from(config.status_buffer_window.as_millis()).unwrap_or(u64::MAX),
        );
        let controller = ReconnectController::new(config.reconnect);
        Self {
            shared: Arc::new(Shared {
                config,
                reconciler: Mutex::new(reconciler),
                controller: Mutex::new(controller),
                outgoing: RwLock::new(None),
                active_conversation: RwLock::new(None),
                event_tx,
                wake: Notify::new(),
            }),
            event_rx: Some(event_rx),
            supervisor: None,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ChatEvent>> {
        self.event_rx.take()
    }

    pub fn user_id(&self) -> UserId {
        self.shared.config.user_id
    }

    pub fn server_url(&self) -> &str {
        &self.shared.config.server_url
    }

    /// Start connecting in the background.
    ///
    /// Progress is reported through [`ChatEvent`]s.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        if self.supervisor.is_some() {
            return Err(ClientError::AlreadyStarted);
        }
        let actions = self.shared.controller.lock().await.start();
        let shared = self.shared.clone();
        self.supervisor = Some(tokio::spawn(supervise(shared, actions.into())));
        Ok(())
    }

    /// Send a message optimistically. Returns the provisional id.
    ///
    /// The entry shows up as pending right away. If the frame cannot be
    /// handed to the relay, the entry fails and `SendFailed` is emitted.
    pub async fn send_message(
        &self,
        conversation_id: ConversationId,
        content: impl Into<String>,
    ) -> Result<Uuid, ClientError> {
        let outgoing = self
            .shared
            .reconciler
            .lock()
            .await
            .begin_send(conversation_id, content, unix_millis());
        let frame = ClientFrame::SendMessage {
            conversation_id,
            content: outgoing.content,
            correlation_id: outgoing.correlation_id,
        };
        self.shared
            .dispatch(outgoing.provisional_id, frame, outgoing.correlation_id)
            .await;
        Ok(outgoing.provisional_id)
    }

    /// Resend a failed message. Returns its new provisional id.
    pub async fn retry_message(&self, provisional_id: Uuid) -> Result<Uuid, ClientError> {
        let outgoing = self
            .shared
            .reconciler
            .lock()
            .await
            .retry(&provisional_id, unix_millis())?;
        let frame = ClientFrame::SendMessage {
            conversation_id: outgoing.conversation_id,
            content: outgoing.content,
            correlation_id: outgoing.correlation_id,
        };
        self.shared
            .dispatch(outgoing.provisional_id, frame, outgoing.correlation_id)
            .await;
        Ok(outgoing.provisional_id)
    }

    /// Make `conversation_id` the active one: join its room, load its
    /// history and mark what arrives in it as read.
    ///
    /// The previously active conversation's room is left first.
    pub async fn open_conversation(&self, conversation_id: ConversationId) {
        let previous = self
            .shared
            .active_conversation
            .write()
            .await
            .replace(conversation_id);

        let actions = {
            let mut controller = self.shared.controller.lock().await;
            let mut actions = match previous {
                Some(previous) if previous != conversation_id => controller.close_room(&previous),
                _ => Vec::new(),
            };
            actions.extend(controller.open_room(conversation_id));
            actions
        };
        self.shared.perform(actions).await;
    }

    pub async fn close_conversation(&self, conversation_id: ConversationId) {
        {
            let mut active = self.shared.active_conversation.write().await;
            if *active == Some(conversation_id) {
                *active = None;
            }
        }
        let actions = self.shared.controller.lock().await.close_room(&conversation_id);
        self.shared.perform(actions).await;
    }

    pub async fn mark_read(&self, message_id: MessageId) -> Result<(), ClientError> {
        self.shared.send_frame(&ClientFrame::AckRead { message_id }).await
    }

    pub async fn send_typing(&self, conversation_id: ConversationId) -> Result<(), ClientError> {
        self.shared.send_frame(&ClientFrame::Typing { conversation_id }).await
    }

    pub async fn send_ping(&self) -> Result<(), ClientError> {
        self.shared.send_frame(&ClientFrame::Ping).await
    }

    /// Snapshot of a conversation's timeline.
    pub async fn timeline(&self, conversation_id: ConversationId) -> Vec<TimelineEntry> {
        self.shared
            .reconciler
            .lock()
            .await
            .entries(&conversation_id)
            .to_vec()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.shared.controller.lock().await.state()
    }

    /// Skip the current backoff wait, or leave the gave-up state.
    pub async fn reconnect_now(&self) {
        if self.supervisor.is_none() {
            return;
        }
        let state = self.shared.controller.lock().await.state();
        if matches!(state, ConnectionState::Disconnected | ConnectionState::GaveUp) {
            self.shared.wake.notify_one();
        }
    }

    /// Tear down the connection and suppress every pending retry.
    pub async fn shutdown(&mut self) {
        self.shared.controller.lock().await.cancel();
        *self.shared.outgoing.write().await = None;
        if let Some(handle) = self.supervisor.take() {
            handle.abort();
        }
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        if let Some(handle) = self.supervisor.take() {
            handle.abort();
        }
    }
}

async fn supervise(shared: Arc<Shared>, mut queue: VecDeque<ReconnectAction>) {
    loop {
        let Some(action) = queue.pop_front() else {
            if shared.controller.lock().await.state() == ConnectionState::Cancelled {
                return;
            }
            shared.wake.notified().await;
            queue.extend(shared.controller.lock().await.reset());
            continue;
        };

        match action {
            ReconnectAction::Connect { attempt } => {
                queue.extend(run_session(&shared, attempt).await);
            }
            ReconnectAction::Wait { attempt, delay } => {
                log::info!("Reconnecting in {delay:?} (attempt {attempt})");
                shared.emit(ChatEvent::Reconnecting { attempt, delay });
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        queue.extend(shared.controller.lock().await.on_retry_elapsed());
                    }
                    _ = shared.wake.notified() => {
                        queue.extend(shared.controller.lock().await.reset());
                    }
                }
            }
            ReconnectAction::GiveUp => {
                log::warn!("Unable to connect to {}", shared.config.server_url);
                shared.emit(ChatEvent::Unreachable);
            }
            other => shared.perform(vec![other]).await,
        }
    }
}

/// One connection attempt and, if it succeeds, the session until it drops.
///
/// Returns the controller's follow-up actions.
async fn run_session(shared: &Shared, attempt: u32) -> Vec<ReconnectAction> {
    let config = &shared.config;
    let url = HandshakeParams::new(config.user_id, config.token.clone()).url(&config.server_url);

    let ws_stream = match tokio_tungstenite::connect_async(url.as_str()).await {
        Ok((ws_stream, _)) => ws_stream,
        Err(WsError::Http(response)) if matches!(response.status().as_u16(), 400 | 401) => {
            let status = response.status().as_u16();
            log::warn!("Relay rejected handshake with HTTP {status}");
            shared.controller.lock().await.on_auth_rejected();
            shared.emit(ChatEvent::AuthRejected { status });
            return Vec::new();
        }
        Err(e) => {
            log::debug!("Connect attempt {attempt} failed: {e}");
            return shared.controller.lock().await.on_connect_failed();
        }
    };

    let (mut ws_writer, mut ws_reader) = ws_stream.split();

    // Writer task: forward outgoing channel to WebSocket
    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(config.outbox_capacity.max(1));
    let writer = tokio::spawn(async move {
        while let Some(data) = out_rx.recv().await {
            if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_writer.close().await;
    });
    *shared.outgoing.write().await = Some(out_tx);

    let actions = shared.controller.lock().await.on_connected();
    shared.perform(actions).await;

    let mut prune = tokio::time::interval(config.status_buffer_window.max(Duration::from_millis(100)));
    loop {
        tokio::select! {
            msg = ws_reader.next() => match msg {
                Some(Ok(Message::Binary(data))) => match ServerFrame::decode(&data) {
                    Ok(frame) => {
                        log::trace!("Received {}", frame.name());
                        shared.handle_frame(frame).await;
                    }
                    Err(e) => log::warn!("Dropping undecodable frame: {e}"),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    log::debug!("Connection error: {e}");
                    break;
                }
                Some(Ok(_)) => {}
            },
            _ = prune.tick() => {
                let pruned = shared.reconciler.lock().await.prune_buffered(unix_millis());
                if pruned > 0 {
                    log::debug!("Pruned {pruned} stale status updates");
                }
            }
        }
    }

    // Connection lost
    *shared.outgoing.write().await = None;
    writer.abort();

    let failed = shared.reconciler.lock().await.fail_all_pending();
    for entry in failed {
        if let Some(correlation_id) = entry.correlation_id {
            shared.emit(ChatEvent::SendFailed {
                provisional_id: entry.id,
                correlation_id,
                kind: None,
                reason: "connection lost".to_string(),
            });
        }
    }
    shared.emit(ChatEvent::Disconnected);
    shared.controller.lock().await.on_disconnected()
}
