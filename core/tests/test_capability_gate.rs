/// Capability gate tests: soft/hard stop, token loss and rotation
mod common;

use common::{settle, FakeTransport, BASE_URL};
use matchlink_core::realtime::{ConnectionConfig, ConnectionManager, PushEvent};
use matchlink_core::{AccountStatus, CapabilityGate, ConnectionStatus, ConversationStore, GateTransition, StoreEvent};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::time::sleep;

struct Harness {
    transport: Arc<FakeTransport>,
    connection: ConnectionManager,
    store: Arc<RwLock<ConversationStore>>,
    events: broadcast::Receiver<StoreEvent>,
    gate: CapabilityGate,
}

fn harness() -> Harness {
    let transport = FakeTransport::new();
    let connection = ConnectionManager::new(ConnectionConfig::new(BASE_URL), transport.clone());
    let store = Arc::new(RwLock::new(ConversationStore::default()));
    let (tx, events) = broadcast::channel(16);
    let gate = CapabilityGate::new(connection.clone(), Arc::clone(&store), tx);
    Harness {
        transport,
        connection,
        store,
        events,
        gate,
    }
}

async fn enable(h: &Harness) {
    assert_eq!(h.gate.set_token(Some("tok".to_string())).await, GateTransition::Unchanged);
    assert_eq!(h.gate.set_messaging_capability(true).await, GateTransition::Enabled);
    settle().await;
    assert_eq!(h.connection.status(), ConnectionStatus::Open);
}

async fn seed_store(h: &Harness) {
    h.store
        .write()
        .await
        .process_incoming_message(&PushEvent::new("c1", json!({"message_id": 1, "body": "hi"})));
    h.connection.join("c1").await;
}

#[tokio::test(start_paused = true)]
async fn test_enable_requires_all_signals() {
    let h = harness();
    assert_eq!(h.gate.set_messaging_capability(true).await, GateTransition::Unchanged);
    assert_eq!(h.gate.set_lifecycle_loading(true).await, GateTransition::Unchanged);
    assert_eq!(h.gate.set_token(Some("tok".to_string())).await, GateTransition::Unchanged);
    assert!(!h.gate.is_enabled().await);
    assert_eq!(h.transport.attempts(), 0);

    assert_eq!(h.gate.set_lifecycle_loading(false).await, GateTransition::Enabled);
    settle().await;
    assert!(h.gate.is_enabled().await);
    assert_eq!(h.connection.status(), ConnectionStatus::Open);
}

#[tokio::test(start_paused = true)]
async fn test_soft_stop_keeps_state_and_resumes() {
    let mut h = harness();
    enable(&h).await;
    seed_store(&h).await;
    let mut socket = h.transport.take_socket();

    assert_eq!(
        h.gate.set_account_status(AccountStatus::Deactivated).await,
        GateTransition::SoftStop
    );
    settle().await;
    assert!(socket.is_closed());
    assert_eq!(h.connection.status(), ConnectionStatus::Disconnected);
    assert!(h.store.read().await.get("c1").is_some());
    assert!(h.events.try_recv().is_err());

    sleep(Duration::from_secs(30)).await;
    assert_eq!(h.transport.attempts(), 1);

    assert_eq!(
        h.gate.set_account_status(AccountStatus::Activated).await,
        GateTransition::Enabled
    );
    settle().await;
    assert_eq!(h.connection.status(), ConnectionStatus::Open);
    let mut resumed = h.transport.take_socket();
    assert_eq!(resumed.drain_types(), vec!["join"]);
}

#[tokio::test(start_paused = true)]
async fn test_hard_stop_shuts_down_and_wipes() {
    let mut h = harness();
    enable(&h).await;
    seed_store(&h).await;

    assert_eq!(h.gate.set_app_shell_accessible(false).await, GateTransition::HardStop);
    settle().await;

    assert_eq!(h.connection.status(), ConnectionStatus::Disconnected);
    assert!(!h.connection.capability_enabled().await);
    assert!(h.store.read().await.is_empty());
    assert!(h.connection.joined_conversations().await.is_empty());
    assert!(matches!(h.events.try_recv(), Ok(StoreEvent::Reset)));

    sleep(Duration::from_secs(30)).await;
    assert_eq!(h.transport.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_token_loss_wipes_state() {
    let mut h = harness();
    enable(&h).await;
    seed_store(&h).await;

    let ticket = h.gate.request_ticket().await.expect("enabled gate issues tickets");

    assert_eq!(h.gate.set_token(None).await, GateTransition::SoftStop);
    settle().await;

    assert!(!ticket.is_current());
    assert_eq!(h.connection.status(), ConnectionStatus::Disconnected);
    assert!(h.store.read().await.is_empty());
    assert!(h.connection.joined_conversations().await.is_empty());
    assert!(matches!(h.events.try_recv(), Ok(StoreEvent::Reset)));
}

#[tokio::test(start_paused = true)]
async fn test_token_rotation_reconnects_with_new_credential() {
    let h = harness();
    enable(&h).await;
    let _old = h.transport.take_socket();

    assert_eq!(
        h.gate.set_token(Some("rotated".to_string())).await,
        GateTransition::TokenRotated
    );
    settle().await;

    assert_eq!(h.connection.status(), ConnectionStatus::Open);
    let new = h.transport.take_socket();
    assert!(new.url.ends_with("token=rotated"));
    assert_eq!(h.gate.signals().await.token.as_deref(), Some("rotated"));
}

#[tokio::test(start_paused = true)]
async fn test_request_ticket_tracks_capability() {
    let h = harness();
    assert!(h.gate.request_ticket().await.is_none());

    enable(&h).await;
    let ticket = h.gate.request_ticket().await.expect("enabled gate issues tickets");
    assert!(ticket.is_current());

    h.gate.set_messaging_capability(false).await;
    assert!(!ticket.is_current());
    assert!(h.gate.request_ticket().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_token_is_shared_with_rest_clients() {
    let h = harness();
    let mut token = h.gate.watch_token();
    assert!(token.borrow().is_none());

    enable(&h).await;
    assert_eq!(token.borrow_and_update().as_deref(), Some("tok"));

    h.gate.set_token(Some("rotated".to_string())).await;
    assert!(token.has_changed().unwrap());
    assert_eq!(token.borrow_and_update().as_deref(), Some("rotated"));

    // Re-publishing the same signals is not a change
    h.gate.set_messaging_capability(true).await;
    assert!(!token.has_changed().unwrap());

    h.gate.set_token(None).await;
    assert!(token.borrow().is_none());
}
