//! End-to-end delivery tests.
//!
//! These tests start a real relay on a free port and connect real
//! `ChatClient`s, verifying the full send / ack / status pipeline.

use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

use murmur_client::{ChatClient, ChatEvent, ClientConfig, ConnectionState, EntryState};
use murmur_core::{Conversation, ConversationId, ErrorKind, MessageStatus, User};
use murmur_relay::{
    Authenticator, InMemoryDirectory, MemoryMessageStore, RelayConfig, RelayServer,
    TokenAuthority,
};

struct TestRelay {
    server: Arc<RelayServer>,
    directory: Arc<InMemoryDirectory>,
    authority: Arc<TokenAuthority>,
    url: String,
    alice: User,
    bob: User,
    conversation: Conversation,
}

impl TestRelay {
    fn group(&self, name: &str) -> ConversationId {
        self.directory
            .add_conversation(Conversation::group(name, [self.alice.id, self.bob.id]))
            .unwrap()
    }

    fn client(&self, user: &User) -> ChatClient {
        let token = self.authority.issue_token(user.id);
        ChatClient::new(ClientConfig::new(&self.url, user.id, token))
    }

    /// Connect `user` and wait for the relay's welcome.
    async fn connected(&self, user: &User) -> (ChatClient, mpsc::Receiver<ChatEvent>) {
        let mut client = self.client(user);
        let mut events = client.take_event_rx().unwrap();
        client.connect().await.unwrap();
        wait_for(&mut events, |e| matches!(e, ChatEvent::Connected { .. })).await;
        (client, events)
    }
}

/// Start a relay with Alice, Bob and their direct conversation.
async fn start_relay() -> TestRelay {
    let directory = Arc::new(InMemoryDirectory::new());
    let alice = User::new("alice@example.com", "Alice");
    let bob = User::new("bob@example.com", "Bob");
    directory.add_user(alice.clone()).unwrap();
    directory.add_user(bob.clone()).unwrap();
    let conversation = Conversation::direct(alice.id, bob.id);
    directory.add_conversation(conversation.clone()).unwrap();

    let authority = Arc::new(TokenAuthority::new(None));
    let server = Arc::new(RelayServer::with_store(
        RelayConfig::default(),
        Arc::new(MemoryMessageStore::new()),
        directory.clone(),
        authority.clone(),
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let relay = server.clone();
    tokio::spawn(async move {
        relay.run_on(listener).await.unwrap();
    });

    TestRelay {
        server,
        directory,
        authority,
        url,
        alice,
        bob,
        conversation,
    }
}

/// Receive events until one matches, failing after two seconds.
async fn wait_for(
    events: &mut mpsc::Receiver<ChatEvent>,
    mut predicate: impl FnMut(&ChatEvent) -> bool,
) -> ChatEvent {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match timeout(remaining, events.recv()).await {
            Ok(Some(event)) if predicate(&event) => return event,
            Ok(Some(_)) => continue,
            Ok(None) => panic!("Event channel closed"),
            Err(_) => panic!("Timed out waiting for event"),
        }
    }
}

/// Assert no matching event shows up within `window`.
async fn assert_quiet(
    events: &mut mpsc::Receiver<ChatEvent>,
    window: Duration,
    mut predicate: impl FnMut(&ChatEvent) -> bool,
) {
    let deadline = tokio::time::Instant::now() + window;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match timeout(remaining, events.recv()).await {
            Ok(Some(event)) if predicate(&event) => panic!("Unexpected event: {event:?}"),
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => return,
        }
    }
}

fn is_status(status: MessageStatus) -> impl FnMut(&ChatEvent) -> bool {
    move |e| matches!(e, ChatEvent::StatusUpdated { status: s, .. } if *s == status)
}

#[tokio::test]
async fn test_both_connected_send_and_deliver() {
    let relay = start_relay().await;
    let conv = relay.conversation.id;
    let (alice, mut alice_events) = relay.connected(&relay.alice).await;
    let (bob, mut bob_events) = relay.connected(&relay.bob).await;

    let provisional_id = alice.send_message(conv, "hi").await.unwrap();

    let confirmed = wait_for(&mut alice_events, |e| {
        matches!(e, ChatEvent::MessageConfirmed { .. })
    })
    .await;
    let ChatEvent::MessageConfirmed { message, .. } = confirmed else {
        unreachable!()
    };
    assert_eq!(message.content, "hi");
    assert_eq!(message.sender, relay.alice.id);

    let received = wait_for(&mut bob_events, |e| {
        matches!(e, ChatEvent::MessageReceived { .. })
    })
    .await;
    assert_eq!(
        received,
        ChatEvent::MessageReceived {
            message: message.clone()
        }
    );

    // Bob's client acks delivery automatically
    wait_for(&mut alice_events, is_status(MessageStatus::Delivered)).await;

    let timeline = alice.timeline(conv).await;
    assert_eq!(timeline.len(), 1);
    assert_ne!(timeline[0].id, provisional_id);
    assert_eq!(timeline[0].id, message.id);
    assert_eq!(timeline[0].state, EntryState::Confirmed);
    assert_eq!(timeline[0].status, MessageStatus::Delivered);

    assert_eq!(bob.timeline(conv).await.len(), 1);
}

#[tokio::test]
async fn test_offline_recipient_catches_up_on_reconnect() {
    let relay = start_relay().await;
    let conv = relay.conversation.id;
    let (alice, mut alice_events) = relay.connected(&relay.alice).await;

    alice.send_message(conv, "are you there?").await.unwrap();
    wait_for(&mut alice_events, |e| {
        matches!(e, ChatEvent::MessageConfirmed { .. })
    })
    .await;
    assert_eq!(alice.timeline(conv).await[0].status, MessageStatus::Sent);

    // Bob comes online with the conversation open
    let mut bob = relay.client(&relay.bob);
    let mut bob_events = bob.take_event_rx().unwrap();
    bob.open_conversation(conv).await;
    bob.connect().await.unwrap();

    let loaded = wait_for(&mut bob_events, |e| {
        matches!(e, ChatEvent::HistoryLoaded { .. })
    })
    .await;
    assert_eq!(
        loaded,
        ChatEvent::HistoryLoaded {
            conversation_id: conv,
            count: 1
        }
    );
    let timeline = bob.timeline(conv).await;
    assert_eq!(timeline.len(), 1);
    assert_eq!(timeline[0].content, "are you there?");

    // Reading from history goes straight to Read
    wait_for(&mut alice_events, is_status(MessageStatus::Read)).await;
    assert_eq!(alice.timeline(conv).await[0].status, MessageStatus::Read);

    let stored = relay
        .server
        .coordinator()
        .store()
        .find_by_conversation(&conv)
        .unwrap();
    assert!(stored[0].was_delivered_to(&relay.bob.id));
    assert!(stored[0].was_read_by(&relay.bob.id));
}

#[tokio::test]
async fn test_double_read_ack_is_idempotent() {
    let relay = start_relay().await;
    let conv = relay.conversation.id;
    let (alice, mut alice_events) = relay.connected(&relay.alice).await;
    let (bob, mut bob_events) = relay.connected(&relay.bob).await;

    alice.send_message(conv, "read me").await.unwrap();
    let ChatEvent::MessageReceived { message } = wait_for(&mut bob_events, |e| {
        matches!(e, ChatEvent::MessageReceived { .. })
    })
    .await
    else {
        unreachable!()
    };
    wait_for(&mut alice_events, is_status(MessageStatus::Delivered)).await;

    bob.mark_read(message.id).await.unwrap();
    bob.mark_read(message.id).await.unwrap();

    wait_for(&mut alice_events, is_status(MessageStatus::Read)).await;
    assert_quiet(&mut alice_events, Duration::from_millis(300), |e| {
        matches!(e, ChatEvent::StatusUpdated { .. })
    })
    .await;

    let stored = relay.server.coordinator().store().get(&message.id).unwrap();
    assert_eq!(stored.status, MessageStatus::Read);
    assert_eq!(
        stored
            .read_by
            .iter()
            .filter(|r| r.user_id == relay.bob.id)
            .count(),
        1
    );
}

#[tokio::test]
async fn test_rejected_send_fails_entry() {
    let relay = start_relay().await;
    let conv = relay.conversation.id;
    let (alice, mut alice_events) = relay.connected(&relay.alice).await;

    let provisional_id = alice.send_message(conv, "   ").await.unwrap();
    let failed = wait_for(&mut alice_events, |e| {
        matches!(e, ChatEvent::SendFailed { .. })
    })
    .await;
    match failed {
        ChatEvent::SendFailed {
            provisional_id: id,
            kind,
            ..
        } => {
            assert_eq!(id, provisional_id);
            assert_eq!(kind, Some(ErrorKind::Validation));
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert_eq!(alice.timeline(conv).await[0].state, EntryState::Failed);
}

#[tokio::test]
async fn test_handshake_rejections() {
    let relay = start_relay().await;

    let missing_user = tokio_tungstenite::connect_async(format!("{}/?token=abc", relay.url)).await;
    match missing_user {
        Err(tokio_tungstenite::tungstenite::Error::Http(resp)) => {
            assert_eq!(resp.status().as_u16(), 400)
        }
        other => panic!("expected HTTP 400, got {other:?}"),
    }

    let bad_token = tokio_tungstenite::connect_async(format!(
        "{}/?user_id={}&token=forged",
        relay.url, relay.alice.id
    ))
    .await;
    match bad_token {
        Err(tokio_tungstenite::tungstenite::Error::Http(resp)) => {
            assert_eq!(resp.status().as_u16(), 401)
        }
        other => panic!("expected HTTP 401, got {other:?}"),
    }

    // Bob's token presented as Alice
    let token = relay.authority.issue_token(relay.bob.id);
    let mut client = ChatClient::new(ClientConfig::new(&relay.url, relay.alice.id, token));
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    let event = wait_for(&mut events, |e| matches!(e, ChatEvent::AuthRejected { .. })).await;
    assert_eq!(event, ChatEvent::AuthRejected { status: 401 });
    assert_eq!(client.connection_state().await, ConnectionState::GaveUp);

    assert!(relay.server.stats().await.rejected_handshakes >= 3);
}

#[tokio::test]
async fn test_newer_connection_takes_over() {
    let relay = start_relay().await;
    let conv = relay.conversation.id;
    let (alice, mut alice_events) = relay.connected(&relay.alice).await;
    let (mut stale, mut stale_events) = relay.connected(&relay.bob).await;
    let (_fresh, mut fresh_events) = relay.connected(&relay.bob).await;

    alice.send_message(conv, "which tab?").await.unwrap();
    wait_for(&mut fresh_events, |e| {
        matches!(e, ChatEvent::MessageReceived { .. })
    })
    .await;
    assert_quiet(&mut stale_events, Duration::from_millis(300), |e| {
        matches!(e, ChatEvent::MessageReceived { .. })
    })
    .await;

    // The stale connection closing must not evict the fresh one
    stale.shutdown().await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    let registry = relay.server.coordinator().registry();
    assert!(registry.is_online(&relay.bob.id).await);
    assert_quiet(&mut alice_events, Duration::from_millis(200), |e| {
        matches!(e, ChatEvent::PresenceChanged { online: false, .. })
    })
    .await;
}

#[tokio::test]
async fn test_presence_and_typing() {
    let relay = start_relay().await;
    let conv = relay.conversation.id;
    let (_alice, mut alice_events) = relay.connected(&relay.alice).await;
    let (mut bob, _bob_events) = relay.connected(&relay.bob).await;

    let online = wait_for(&mut alice_events, |e| {
        matches!(e, ChatEvent::PresenceChanged { .. })
    })
    .await;
    assert_eq!(
        online,
        ChatEvent::PresenceChanged {
            user_id: relay.bob.id,
            online: true
        }
    );

    bob.send_typing(conv).await.unwrap();
    let typing = wait_for(&mut alice_events, |e| matches!(e, ChatEvent::PeerTyping { .. })).await;
    assert_eq!(
        typing,
        ChatEvent::PeerTyping {
            conversation_id: conv,
            user_id: relay.bob.id
        }
    );

    bob.shutdown().await;
    let offline = wait_for(&mut alice_events, |e| {
        matches!(e, ChatEvent::PresenceChanged { online: false, .. })
    })
    .await;
    assert_eq!(
        offline,
        ChatEvent::PresenceChanged {
            user_id: relay.bob.id,
            online: false
        }
    );
}

#[tokio::test]
async fn test_switching_conversation_leaves_previous_room() {
    let relay = start_relay().await;
    let first = relay.group("first");
    let second = relay.group("second");
    let (alice, mut alice_events) = relay.connected(&relay.alice).await;
    let (bob, mut bob_events) = relay.connected(&relay.bob).await;

    alice.open_conversation(first).await;
    wait_for(&mut alice_events, |e| {
        matches!(e, ChatEvent::HistoryLoaded { conversation_id, .. } if *conversation_id == first)
    })
    .await;
    let rooms = relay.server.coordinator().rooms();
    assert!(rooms.is_joined(&first, &relay.alice.id).await);

    alice.open_conversation(second).await;
    wait_for(&mut alice_events, |e| {
        matches!(e, ChatEvent::HistoryLoaded { conversation_id, .. } if *conversation_id == second)
    })
    .await;
    assert!(!rooms.is_joined(&first, &relay.alice.id).await);
    assert!(rooms.is_joined(&second, &relay.alice.id).await);

    // Messages in the room that was left are no longer pushed
    bob.send_message(first, "still there?").await.unwrap();
    wait_for(&mut bob_events, |e| {
        matches!(e, ChatEvent::MessageConfirmed { .. })
    })
    .await;
    assert_quiet(&mut alice_events, Duration::from_millis(300), |e| {
        matches!(e, ChatEvent::MessageReceived { .. })
    })
    .await;
}
