/// Connection lifecycle tests: heartbeat, reconnect, shutdown and timer hygiene
mod common;

use common::{settle, FakeTransport, BASE_URL};
use matchlink_core::realtime::{ConnectionConfig, ConnectionEvent, ConnectionManager, InboundFrame, OutboundFrame, TimerState};
use matchlink_core::ConnectionStatus;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::time::sleep;

fn manager(transport: &Arc<FakeTransport>) -> ConnectionManager {
    ConnectionManager::new(ConnectionConfig::new(BASE_URL), transport.clone())
}

async fn open(transport: &Arc<FakeTransport>) -> ConnectionManager {
    let connection = manager(transport);
    connection.connect("tok").await;
    settle().await;
    assert_eq!(connection.status(), ConnectionStatus::Open);
    connection
}

#[tokio::test(start_paused = true)]
async fn test_connect_opens_socket_with_token_endpoint() {
    let transport = FakeTransport::new();
    let connection = manager(&transport);
    assert_eq!(connection.status(), ConnectionStatus::Disconnected);

    connection.connect("secret token").await;
    assert_eq!(connection.status(), ConnectionStatus::Connecting);
    settle().await;

    assert_eq!(connection.status(), ConnectionStatus::Open);
    assert_eq!(transport.urls(), vec!["wss://api.example.com/ws?token=secret%20token"]);
    assert!(connection.auto_connect().await);
    assert_eq!(
        connection.timers().await,
        TimerState { heartbeat: true, reconnect: false }
    );
}

#[tokio::test(start_paused = true)]
async fn test_connect_is_idempotent_while_live() {
    let transport = FakeTransport::new();
    let connection = manager(&transport);
    connection.connect("tok").await;
    connection.connect("tok").await;
    settle().await;
    connection.connect("tok").await;
    settle().await;
    assert_eq!(transport.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_pings_every_interval() {
    let transport = FakeTransport::new();
    let _connection = open(&transport).await;
    let mut socket = transport.take_socket();

    sleep(Duration::from_secs(29)).await;
    assert!(socket.drain_types().is_empty());

    sleep(Duration::from_secs(2)).await;
    assert_eq!(socket.drain_types(), vec!["ping"]);

    sleep(Duration::from_secs(30)).await;
    assert_eq!(socket.drain_types(), vec!["ping"]);
}

#[tokio::test(start_paused = true)]
async fn test_unexpected_close_reconnects_and_rejoins() {
    let transport = FakeTransport::new();
    let connection = open(&transport).await;
    let mut first = transport.take_socket();
    connection.join("b").await;
    connection.join("a").await;
    assert_eq!(first.drain_types(), vec!["join", "join"]);

    let mut events = connection.subscribe();
    first.close("server restart");
    settle().await;

    assert_eq!(connection.status(), ConnectionStatus::Disconnected);
    assert_eq!(
        connection.timers().await,
        TimerState { heartbeat: false, reconnect: true }
    );
    assert!(first.is_closed());
    match events.try_recv() {
        Ok(ConnectionEvent::Closed { reason, will_reconnect }) => {
            assert_eq!(reason.as_deref(), Some("server restart"));
            assert!(will_reconnect);
        }
        other => panic!("expected close event, got {:?}", other),
    }

    sleep(Duration::from_secs(4)).await;
    assert_eq!(transport.attempts(), 1);
    sleep(Duration::from_secs(2)).await;
    assert_eq!(transport.attempts(), 2);
    assert_eq!(connection.status(), ConnectionStatus::Open);

    let mut second = transport.take_socket();
    let frames = second.drain_sent();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0], json!({"type": "join", "conversation_id": "a"}));
    assert_eq!(frames[1], json!({"type": "join", "conversation_id": "b"}));
    assert_eq!(
        connection.timers().await,
        TimerState { heartbeat: true, reconnect: false }
    );
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_cancels_pending_reconnect() {
    let transport = FakeTransport::new();
    let connection = open(&transport).await;
    let socket = transport.take_socket();

    socket.close("network");
    settle().await;
    assert!(connection.timers().await.reconnect);

    connection.disconnect().await;
    assert_eq!(connection.timers().await, TimerState::default());
    assert!(!connection.auto_connect().await);

    sleep(Duration::from_secs(30)).await;
    assert_eq!(transport.attempts(), 1);
    assert_eq!(connection.status(), ConnectionStatus::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_manual_disconnect_does_not_reconnect() {
    let transport = FakeTransport::new();
    let connection = open(&transport).await;
    let mut socket = transport.take_socket();

    connection.disconnect().await;
    settle().await;
    assert!(socket.is_closed());
    assert_eq!(connection.status(), ConnectionStatus::Disconnected);
    assert_eq!(connection.timers().await, TimerState::default());

    sleep(Duration::from_secs(60)).await;
    assert_eq!(transport.attempts(), 1);
    assert!(socket.drain_types().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_construction_failure_schedules_reconnect() {
    let transport = FakeTransport::new();
    transport.set_failing(true);
    let connection = manager(&transport);

    connection.connect("tok").await;
    settle().await;
    assert_eq!(connection.status(), ConnectionStatus::Disconnected);
    assert_eq!(
        connection.timers().await,
        TimerState { heartbeat: false, reconnect: true }
    );

    transport.set_failing(false);
    sleep(Duration::from_secs(6)).await;
    assert_eq!(transport.attempts(), 2);
    assert_eq!(connection.status(), ConnectionStatus::Open);
}

#[tokio::test(start_paused = true)]
async fn test_send_dropped_unless_open() {
    let transport = FakeTransport::new();
    let connection = manager(&transport);
    let read = OutboundFrame::Read {
        conversation_id: "c1".to_string(),
        message_id: "9".into(),
    };
    assert!(!connection.send(&read).await);

    connection.connect("tok").await;
    assert!(!connection.send(&read).await);
    settle().await;

    assert!(connection.send(&read).await);
    let mut socket = transport.take_socket();
    assert_eq!(
        socket.drain_sent(),
        vec![json!({"type": "read", "conversation_id": "c1", "message_id": "9"})]
    );
}

#[tokio::test(start_paused = true)]
async fn test_error_frame_recorded_without_closing() {
    let transport = FakeTransport::new();
    let connection = open(&transport).await;
    let socket = transport.take_socket();
    let mut events = connection.subscribe();

    socket.push_json(json!({"type": "error", "payload": {"message": "rate limited"}}));
    settle().await;

    assert_eq!(connection.last_error().as_deref(), Some("rate limited"));
    assert_eq!(connection.status(), ConnectionStatus::Open);
    match events.try_recv() {
        Ok(ConnectionEvent::Frame(InboundFrame::Error { message })) => assert_eq!(message, "rate limited"),
        other => panic!("expected error frame, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_garbage_frames_are_dropped() {
    let transport = FakeTransport::new();
    let connection = open(&transport).await;
    let socket = transport.take_socket();
    let mut events = connection.subscribe();

    socket.push_text("not json at all");
    socket.push_text(r#"{"payload": {}}"#);
    socket.push_json(json!({"type": "typing", "payload": {}}));
    socket.push_json(json!({"type": "pong"}));
    settle().await;

    assert_eq!(connection.status(), ConnectionStatus::Open);
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));

    socket.push_json(json!({"type": "message", "conversation_id": 5, "payload": {"message_id": 1, "body": "hi"}}));
    settle().await;
    match events.try_recv() {
        Ok(ConnectionEvent::Frame(InboundFrame::Message(event))) => {
            assert_eq!(event.conversation_id.as_deref(), Some("5"));
        }
        other => panic!("expected message frame, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_frame_receiver_keeps_every_frame() {
    let transport = FakeTransport::new();
    let connection = open(&transport).await;
    let mut stale = connection.frame_receiver();
    let mut frames = connection.frame_receiver();
    let socket = transport.take_socket();

    for id in 0..600 {
        socket.push_json(json!({"type": "read", "conversation_id": "c1", "payload": {"message_id": id}}));
    }
    socket.push_json(json!({"type": "pong"}));
    settle().await;

    let mut received = 0;
    while let Ok(frame) = frames.try_recv() {
        assert!(matches!(frame, InboundFrame::Read(_)));
        received += 1;
    }
    assert_eq!(received, 600);
    // Replaced feeds end
    assert!(stale.recv().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_blocks_capability_reenable() {
    let transport = FakeTransport::new();
    let connection = open(&transport).await;

    connection.shutdown().await;
    assert_eq!(connection.status(), ConnectionStatus::Disconnected);
    assert!(!connection.auto_connect().await);
    assert!(!connection.capability_enabled().await);

    connection.set_capability_enabled(true).await;
    settle().await;
    assert!(!connection.capability_enabled().await);
    assert_eq!(transport.attempts(), 1);

    // Only an explicit connect brings it back
    connection.connect("tok").await;
    settle().await;
    assert_eq!(connection.status(), ConnectionStatus::Open);
    assert_eq!(transport.attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_capability_toggle_closes_and_reopens() {
    let transport = FakeTransport::new();
    let connection = open(&transport).await;
    let mut first = transport.take_socket();

    connection.set_capability_enabled(false).await;
    settle().await;
    assert!(first.is_closed());
    assert_eq!(connection.status(), ConnectionStatus::Disconnected);
    assert_eq!(connection.timers().await, TimerState::default());
    assert!(connection.auto_connect().await);

    sleep(Duration::from_secs(30)).await;
    assert_eq!(transport.attempts(), 1);

    connection.set_capability_enabled(true).await;
    settle().await;
    assert_eq!(connection.status(), ConnectionStatus::Open);
    assert_eq!(transport.attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_token_rotation_reopens_and_ignores_stale_socket() {
    let transport = FakeTransport::new();
    let connection = open(&transport).await;
    let mut old = transport.take_socket();

    connection.update_token("fresh").await;
    settle().await;
    assert_eq!(connection.status(), ConnectionStatus::Open);
    assert!(old.is_closed());
    let mut new = transport.take_socket();
    assert!(new.url.ends_with("token=fresh"));

    // Only the new socket's heartbeat is running
    sleep(Duration::from_secs(31)).await;
    assert!(old.drain_types().is_empty());
    assert_eq!(new.drain_types(), vec!["ping"]);

    // A late close from the superseded socket changes nothing
    old.close("late");
    settle().await;
    assert_eq!(connection.status(), ConnectionStatus::Open);
    assert!(!connection.timers().await.reconnect);

    // Same token again is a no-op
    connection.update_token("fresh").await;
    settle().await;
    assert_eq!(transport.attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_cycles_leave_no_timers() {
    let transport = FakeTransport::new();
    let connection = manager(&transport);

    for round in 0..5 {
        connection.connect("tok").await;
        settle().await;
        assert_eq!(connection.status(), ConnectionStatus::Open, "round {}", round);
        connection.disconnect().await;
        assert_eq!(connection.timers().await, TimerState::default());
    }

    sleep(Duration::from_secs(120)).await;
    assert_eq!(transport.attempts(), 5);
    assert_eq!(connection.status(), ConnectionStatus::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_status_transitions_are_observable() {
    let transport = FakeTransport::new();
    let connection = manager(&transport);
    let mut status = connection.watch_status();

    connection.connect("tok").await;
    assert_eq!(*status.borrow_and_update(), ConnectionStatus::Connecting);
    settle().await;
    assert!(status.has_changed().unwrap());
    assert_eq!(*status.borrow_and_update(), ConnectionStatus::Open);

    connection.leave("never-joined").await;
    assert!(connection.joined_conversations().await.is_empty());
}
