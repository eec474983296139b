//! Integration tests for the classroom relay
//!
//! These tests spin up a real relay and connect clients (raw sockets and
//! `WsBroker`) to verify joins, broadcasts, presence and row-change fan-out.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use classroom_realtime::broker::{
    Broker, BrokerEvent, ChannelSpec, PresencePayload, SubscribeStatus, TypingPayload,
};
use classroom_realtime::models::{AuthUser, NewConversation, NewParticipant, Profile};
use classroom_realtime::{
    ChannelManager, ChannelNotifier, RealtimeConfig, SqliteStorage, Storage, WsBroker,
};
use classroom_relay::RelayState;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Start a test relay on a random available port
async fn start_test_relay(state: RelayState) -> (u16, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let state = Arc::new(state);

    let handle = tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let ws_stream = tokio_tungstenite::accept_async(stream).await.unwrap();
            let state = state.clone();
            tokio::spawn(async move {
                classroom_relay::handle_connection(ws_stream, state).await;
            });
        }
    });

    // Give relay time to start
    tokio::time::sleep(Duration::from_millis(50)).await;

    (port, handle)
}

async fn broker(port: u16, user_id: &str) -> WsBroker {
    WsBroker::connect(
        &format!("ws://127.0.0.1:{}", port),
        user_id,
        None,
        REQUEST_TIMEOUT,
    )
    .await
    .expect("Failed to connect broker")
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<BrokerEvent>) -> BrokerEvent {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("Timeout waiting for event")
        .expect("Event stream closed")
}

fn presence(user_id: &str, name: &str) -> PresencePayload {
    PresencePayload {
        user_id: user_id.to_string(),
        full_name: Some(name.to_string()),
        email: None,
        avatar_url: None,
        role: None,
        online_at: Utc::now(),
        current_page: Some("/".to_string()),
        status_text: "On the dashboard".to_string(),
    }
}

#[tokio::test]
async fn test_client_connects_and_authenticates() {
    let (port, relay) = start_test_relay(RelayState::new()).await;

    let (ws_stream, _) = connect_async(&format!("ws://127.0.0.1:{}", port))
        .await
        .expect("Failed to connect");
    let (mut write, mut read) = ws_stream.split();
    write
        .send(Message::Text(
            json!({"type": "connect", "user_id": "user1"}).to_string().into(),
        ))
        .await
        .unwrap();

    let response = timeout(Duration::from_secs(5), read.next())
        .await
        .expect("Timeout waiting for auth")
        .expect("Stream closed")
        .expect("Read error");
    if let Message::Text(text) = response {
        let msg: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(msg["type"], "auth_response");
        assert_eq!(msg["success"], true);
    } else {
        panic!("Expected text message");
    }

    relay.abort();
}

#[tokio::test]
async fn test_broadcast_reaches_other_members_only() {
    let (port, relay) = start_test_relay(RelayState::new()).await;
    let alice = broker(port, "alice").await;
    let bob = broker(port, "bob").await;

    let mut alice_sub = alice.subscribe(ChannelSpec::new("typing")).await.unwrap();
    let mut bob_sub = bob.subscribe(ChannelSpec::new("typing")).await.unwrap();
    assert_eq!(alice_sub.status, SubscribeStatus::Subscribed);
    assert_eq!(bob_sub.status, SubscribeStatus::Subscribed);

    let payload = TypingPayload {
        conversation_id: "c1".to_string(),
        user_id: "alice".to_string(),
        user_name: "Alice".to_string(),
        is_typing: true,
    };
    alice
        .send(&alice_sub.channel, "typing", serde_json::to_value(&payload).unwrap())
        .await
        .unwrap();

    match next_event(&mut bob_sub.events).await {
        BrokerEvent::Broadcast { event, payload } => {
            assert_eq!(event, "typing");
            assert_eq!(payload["user_id"], "alice");
            assert_eq!(payload["is_typing"], true);
        }
        other => panic!("Expected broadcast, got {:?}", other),
    }

    // Sender does not hear its own broadcast
    let own = timeout(Duration::from_millis(200), alice_sub.events.recv()).await;
    assert!(own.is_err(), "Sender received its own broadcast");

    relay.abort();
}

#[tokio::test]
async fn test_presence_join_state_and_leave() {
    let (port, relay) = start_test_relay(RelayState::new()).await;
    let alice = broker(port, "alice").await;
    let bob = broker(port, "bob").await;

    let alice_sub = alice
        .subscribe(ChannelSpec::new("online-users").with_presence_key("alice"))
        .await
        .unwrap();
    alice
        .track(&alice_sub.channel, &presence("alice", "Alice"))
        .await
        .unwrap();

    let mut bob_sub = bob
        .subscribe(ChannelSpec::new("online-users").with_presence_key("bob"))
        .await
        .unwrap();
    let state = bob.presence_state(&bob_sub.channel).await.unwrap();
    assert_eq!(state.len(), 1);
    assert_eq!(state["alice"][0].display_name(), "Alice");

    // Alice drops off; bob sees the leave
    alice.disconnect();
    loop {
        match next_event(&mut bob_sub.events).await {
            BrokerEvent::PresenceLeave { key, left_presences } => {
                assert_eq!(key, "alice");
                assert_eq!(left_presences.len(), 1);
                break;
            }
            _ => continue,
        }
    }
    assert!(bob.presence_state(&bob_sub.channel).await.unwrap().is_empty());

    relay.abort();
}

#[tokio::test]
async fn test_published_row_change_fans_out() {
    let (port, relay) = start_test_relay(RelayState::new()).await;
    let listener = broker(port, "alice").await;
    let mut sub = listener.subscribe(ChannelSpec::new("messages")).await.unwrap();

    // A storage-side forwarder injecting a row change
    let (ws_stream, _) = connect_async(&format!("ws://127.0.0.1:{}", port))
        .await
        .unwrap();
    let (mut write, mut read) = ws_stream.split();
    write
        .send(Message::Text(
            json!({"type": "connect", "user_id": "db-forwarder"}).to_string().into(),
        ))
        .await
        .unwrap();
    let _auth = read.next().await;
    write
        .send(Message::Text(
            json!({
                "type": "publish",
                "topic": "messages",
                "event": {"type": "insert", "table": "messages", "new": {"id": "m1"}}
            })
            .to_string()
            .into(),
        ))
        .await
        .unwrap();

    match next_event(&mut sub.events).await {
        BrokerEvent::Insert { table, new } => {
            assert_eq!(table, "messages");
            assert_eq!(new["id"], "m1");
        }
        other => panic!("Expected insert, got {:?}", other),
    }

    relay.abort();
}

#[tokio::test]
async fn test_unsubscribed_channel_stops_receiving() {
    let (port, relay) = start_test_relay(RelayState::new()).await;
    let alice = broker(port, "alice").await;
    let bob = broker(port, "bob").await;

    let alice_sub = alice.subscribe(ChannelSpec::new("typing")).await.unwrap();
    let mut bob_sub = bob.subscribe(ChannelSpec::new("typing")).await.unwrap();
    bob.unsubscribe(&bob_sub.channel).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    alice
        .send(
            &alice_sub.channel,
            "typing",
            json!({"conversation_id": "c1", "user_id": "alice", "user_name": "Alice", "is_typing": true}),
        )
        .await
        .unwrap();

    let received = timeout(Duration::from_millis(200), bob_sub.events.recv()).await;
    assert!(!matches!(received, Ok(Some(BrokerEvent::Broadcast { .. }))));

    relay.abort();
}

#[tokio::test]
async fn test_chat_between_managers_over_relay() {
    let (port, relay) = start_test_relay(RelayState::new()).await;
    let url = format!("ws://127.0.0.1:{}", port);

    let alice = AuthUser::new(Profile::new("alice", "Alice"));
    let bob = AuthUser::new(Profile::new("bob", "Bob"));
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    storage.upsert_profile(&alice.profile).unwrap();
    storage.upsert_profile(&bob.profile).unwrap();
    let conversation = storage
        .insert_conversation(NewConversation {
            name: None,
            is_group: false,
            created_by: "alice".to_string(),
        })
        .await
        .unwrap();
    storage
        .insert_participants(&[
            NewParticipant {
                conversation_id: conversation.id.clone(),
                user_id: "alice".to_string(),
            },
            NewParticipant {
                conversation_id: conversation.id.clone(),
                user_id: "bob".to_string(),
            },
        ])
        .await
        .unwrap();

    let mut managers = Vec::new();
    for user in [&alice, &bob] {
        let broker = WsBroker::connect(&url, &user.id, None, REQUEST_TIMEOUT)
            .await
            .unwrap();
        let (notifier, notes) = ChannelNotifier::new();
        let mut manager = ChannelManager::new(
            Arc::new(broker),
            storage.clone(),
            Arc::new(notifier),
            RealtimeConfig::default(),
        );
        manager.connect(user.clone()).await.unwrap();
        managers.push((manager, notes));
    }
    let (mut bob_manager, _bob_notes) = managers.pop().unwrap();
    let (mut alice_manager, _alice_notes) = managers.pop().unwrap();

    bob_manager.drain(Duration::from_millis(100)).await;
    alice_manager.drain(Duration::from_millis(100)).await;
    assert!(alice_manager.presence().is_online("bob"));

    alice_manager
        .conversations_mut()
        .send_message(&conversation.id, "hello over the wire")
        .await
        .unwrap();
    bob_manager.drain(Duration::from_millis(200)).await;

    let received = bob_manager.conversations().messages(&conversation.id).unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].content, "hello over the wire");
    assert_eq!(bob_manager.conversations().unread_count(&conversation.id), 1);

    alice_manager.disconnect().await;
    bob_manager.drain(Duration::from_millis(100)).await;
    assert!(!bob_manager.presence().is_online("alice"));

    bob_manager.disconnect().await;
    relay.abort();
}
