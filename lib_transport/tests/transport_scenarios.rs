//! # Transport Scenario Tests
//!
//! End-to-end runs of the coordinator against an in-process Socket.IO server
//! and an in-memory REST API.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;

use common::{next_event, next_message_id, wire_message, MockApi, MockSocketServer};
use lib_transport::configs::{ChannelConfig, PollingConfig};
use lib_transport::core::{Latency, SendRoute, StaticSession};
use lib_transport::{
    ConnectionQuality, ConnectionState, TransportConfig, TransportCoordinator, TransportEvent, TransportMode,
};

fn state(quality: ConnectionQuality) -> ConnectionState {
    let latency = match quality {
        ConnectionQuality::Excellent => Latency::Millis(90),
        ConnectionQuality::Good => Latency::Millis(350),
        ConnectionQuality::Poor => Latency::Millis(1_200),
        ConnectionQuality::Offline => Latency::Unreachable,
    };
    ConnectionState::new(quality, latency, false, 0)
}

fn config(socket_url: &str) -> TransportConfig {
    TransportConfig {
        socket_url: socket_url.to_string(),
        channel: ChannelConfig {
            connect_timeout_ms: 1_000,
            reconnect_initial_ms: 50,
            reconnect_max_ms: 100,
            setup_failure_threshold: 3,
            adaptive_timing: false,
            ..ChannelConfig::default()
        },
        polling: PollingConfig {
            interval_ms: 50,
            ..PollingConfig::default()
        },
        ..TransportConfig::default()
    }
}

fn coordinator(
    server: &MockSocketServer,
    api: Arc<MockApi>,
    quality: ConnectionQuality,
) -> (Arc<TransportCoordinator>, watch::Sender<ConnectionState>) {
    let (state_tx, state_rx) = watch::channel(state(quality));
    let coordinator = TransportCoordinator::new(
        config(&server.url),
        Arc::new(StaticSession::new("secret-token", 1)),
        api,
        state_rx,
    );
    (Arc::new(coordinator), state_tx)
}

async fn wait_mode(coordinator: &TransportCoordinator, mode: TransportMode) {
    let mut rx = coordinator.subscribe_mode();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|m| *m == Some(mode)))
        .await
        .expect("mode not reached")
        .expect("mode publisher dropped");
}

#[tokio::test]
async fn channel_to_polling_handoff_delivers_only_unseen_ids() {
    let mut server = MockSocketServer::start().await;
    let api = MockApi::new();
    let (coordinator, state_tx) = coordinator(&server, Arc::clone(&api), ConnectionQuality::Excellent);
    let mut events = coordinator.take_events().unwrap();
    coordinator.start();

    next_event(&mut events, |e| *e == TransportEvent::ChannelConnected).await;
    server.expect_frame(|f| f.starts_with(r#"42["join""#)).await;

    server.push_event("new_message", wire_message(42));
    assert_eq!(next_message_id(&mut events).await, 42);
    assert_eq!(coordinator.watermark(), 42);

    api.script_poll(vec![40, 42, 43]);
    state_tx.send_replace(state(ConnectionQuality::Poor));
    wait_mode(&coordinator, TransportMode::Polling).await;

    assert_eq!(next_message_id(&mut events).await, 43);
    assert_eq!(api.poll_cursors.lock().unwrap()[0], 42);

    coordinator.report_error("end-marker");
    loop {
        match next_event(&mut events, |_| true).await {
            TransportEvent::Message(msg) => panic!("redelivered message {}", msg.id),
            TransportEvent::Error(m) if m == "end-marker" => break,
            _ => {}
        }
    }
    coordinator.shutdown().await;
}

#[tokio::test]
async fn credential_rides_in_the_query_and_join_follows_every_reconnect() {
    let mut server = MockSocketServer::start().await;
    let (coordinator, _state_tx) = coordinator(&server, MockApi::new(), ConnectionQuality::Good);
    let mut events = coordinator.take_events().unwrap();
    coordinator.start();

    next_event(&mut events, |e| *e == TransportEvent::ChannelConnected).await;
    let (first, join) = server.expect_frame(|f| f.starts_with("42")).await;
    assert_eq!(first, 0);
    assert_eq!(join, r#"42["join",{"user_id":"secret-token"}]"#);

    server.drop_connection();
    next_event(&mut events, |e| *e == TransportEvent::ChannelDisconnected).await;
    next_event(&mut events, |e| *e == TransportEvent::ChannelConnected).await;
    let (second, join) = server.expect_frame(|f| f.starts_with("42")).await;
    assert_eq!(second, 1);
    assert_eq!(join, r#"42["join",{"user_id":"secret-token"}]"#);

    let uris = server.uris.lock().unwrap().clone();
    assert_eq!(uris.len(), 2);
    for uri in uris {
        assert!(uri.contains("access_token=secret-token"), "{uri}");
        assert!(uri.contains("user_id=1"), "{uri}");
        assert!(uri.contains("EIO=4"), "{uri}");
    }
    assert_eq!(coordinator.mode(), Some(TransportMode::PersistentChannel));
    coordinator.shutdown().await;
}

#[tokio::test]
async fn channel_session_carries_sends_typing_and_pongs() {
    let mut server = MockSocketServer::start().await;
    let api = MockApi::new();
    let (coordinator, _state_tx) = coordinator(&server, Arc::clone(&api), ConnectionQuality::Excellent);
    let mut events = coordinator.take_events().unwrap();
    coordinator.start();
    next_event(&mut events, |e| *e == TransportEvent::ChannelConnected).await;

    let route = coordinator
        .send_message(7, "hello", Some("https://cdn.example/a.jpg".to_string()))
        .await
        .unwrap();
    assert_eq!(route, SendRoute::Channel);
    let (_, frame) = server.expect_frame(|f| f.starts_with(r#"42["private_message""#)).await;
    assert!(frame.contains(r#""to_id":7"#), "{frame}");
    assert!(frame.contains(r#""media_url":"https://cdn.example/a.jpg""#), "{frame}");
    assert!(api.sent.lock().unwrap().is_empty());

    coordinator.send_typing(7, true).await.unwrap();
    let (_, frame) = server.expect_frame(|f| f.starts_with(r#"42["typing""#)).await;
    assert!(frame.contains(r#""is_typing":200"#), "{frame}");

    server.push("2");
    server.expect_frame(|f| f == "3").await;
    coordinator.shutdown().await;
}

#[tokio::test]
async fn malformed_and_auxiliary_events_do_not_break_dispatch() {
    let server = MockSocketServer::start().await;
    let (coordinator, _state_tx) = coordinator(&server, MockApi::new(), ConnectionQuality::Excellent);
    let mut events = coordinator.take_events().unwrap();
    coordinator.start();
    next_event(&mut events, |e| *e == TransportEvent::ChannelConnected).await;

    server.push_event("new_message", json!({ "text": "no id" }));
    server.push("42[not json");
    server.push_event(
        "user_status_change",
        json!({ "online_users": r#"<div id="online_5"></div><div id="online_6"></div>"#, "offline_users": "garbage" }),
    );
    server.push_event("typing", json!({ "sender_id": 7, "is_typing": 200 }));
    server.push_event("private_message", wire_message(50));
    // The server emits both names for the same message.
    server.push_event("new_message", wire_message(50));
    server.push_event("private_message", wire_message(51));

    let presence = next_event(&mut events, |e| matches!(e, TransportEvent::Presence { .. })).await;
    assert_eq!(presence, TransportEvent::Presence { user_id: 5, online: true });
    let presence = next_event(&mut events, |e| matches!(e, TransportEvent::Presence { .. })).await;
    assert_eq!(presence, TransportEvent::Presence { user_id: 6, online: true });
    let typing = next_event(&mut events, |e| matches!(e, TransportEvent::Typing { .. })).await;
    assert_eq!(typing, TransportEvent::Typing { sender_id: 7, is_typing: true });

    assert_eq!(next_message_id(&mut events).await, 50);
    assert_eq!(next_message_id(&mut events).await, 51);
    coordinator.shutdown().await;
}

#[tokio::test]
async fn refused_channel_degrades_to_polling_with_an_error() {
    let server = MockSocketServer::start_refusing().await;
    let api = MockApi::new();
    let (coordinator, _state_tx) = coordinator(&server, Arc::clone(&api), ConnectionQuality::Excellent);
    let mut events = coordinator.take_events().unwrap();
    coordinator.start();

    let unavailable = next_event(&mut events, |e| matches!(e, TransportEvent::ChannelUnavailable { .. })).await;
    assert!(matches!(unavailable, TransportEvent::ChannelUnavailable { attempts: 3, .. }));
    next_event(&mut events, |e| matches!(e, TransportEvent::Error(_))).await;
    wait_mode(&coordinator, TransportMode::Polling).await;
    assert!(server.connection_count() >= 3);

    let route = coordinator.send_message(9, "via rest", None).await.unwrap();
    assert_eq!(route, SendRoute::Rest);
    assert_eq!(api.sent.lock().unwrap()[0].recipient_id, 9);
    coordinator.shutdown().await;
}

#[tokio::test]
async fn pushed_messages_arriving_out_of_order_are_all_delivered() {
    let mut server = MockSocketServer::start().await;
    let (coordinator, _state_tx) = coordinator(&server, MockApi::new(), ConnectionQuality::Excellent);
    let mut events = coordinator.take_events().unwrap();
    coordinator.start();

    next_event(&mut events, |e| *e == TransportEvent::ChannelConnected).await;
    server.expect_frame(|f| f.starts_with(r#"42["join""#)).await;

    server.push_event("private_message", wire_message(101));
    server.push_event("private_message", wire_message(100));
    assert_eq!(next_message_id(&mut events).await, 101);
    assert_eq!(next_message_id(&mut events).await, 100);
    assert_eq!(coordinator.watermark(), 101);
    coordinator.shutdown().await;
}

#[tokio::test]
async fn silent_server_is_dropped_while_the_client_keeps_sending() {
    let mut server = MockSocketServer::start_with_ping(100, 100).await;
    let mut config = config(&server.url);
    config.channel.ping_timeout_ms = 300;
    let (_state_tx, state_rx) = watch::channel(state(ConnectionQuality::Excellent));
    let coordinator = Arc::new(TransportCoordinator::new(
        config,
        Arc::new(StaticSession::new("secret-token", 1)),
        MockApi::new(),
        state_rx,
    ));
    let mut events = coordinator.take_events().unwrap();
    coordinator.start();

    next_event(&mut events, |e| *e == TransportEvent::ChannelConnected).await;
    server.expect_frame(|f| f.starts_with(r#"42["join""#)).await;

    // Outbound traffic must not keep a dead session alive.
    let typing = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move {
            loop {
                let _ = coordinator.send_typing(7, true).await;
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        })
    };
    next_event(&mut events, |e| *e == TransportEvent::ChannelDisconnected).await;
    typing.abort();
    coordinator.shutdown().await;
}
