/// Messaging session: wires the connection, store, gate and REST client together
use crate::api::MessagingApi;
use crate::capability_gate::{CapabilityGate, RequestTicket};
use crate::conversation_store::{ConversationState, ConversationStore};
use crate::error::{Result, SyncError};
use crate::messenger_types::{ConnectionStatus, Message, MessageId, ParticipantId, StoreEvent};
use crate::normalizer::{self, DEFAULT_MIME_TYPE};
use crate::realtime::connection::{ConnectionConfig, ConnectionManager};
use crate::realtime::protocol::{InboundFrame, OutboundFrame};
use crate::realtime::transport::Transport;
use crate::reconciler::{self, ConversationList};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

const STORE_EVENT_CAPACITY: usize = 256;

/// One signed-in user's realtime messaging session
#[derive(Clone)]
pub struct MessagingSession {
    connection: ConnectionManager,
    store: Arc<RwLock<ConversationStore>>,
    gate: Arc<CapabilityGate>,
    api: Option<Arc<dyn MessagingApi>>,
    events: broadcast::Sender<StoreEvent>,
    dispatcher: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl MessagingSession {
    /// Create a session and start its frame dispatcher. Must run inside a Tokio runtime.
    pub fn new(
        config: ConnectionConfig,
        ledger_capacity: usize,
        transport: Arc<dyn Transport>,
        api: Option<Arc<dyn MessagingApi>>,
    ) -> Self {
        let connection = ConnectionManager::new(config, transport);
        let store = Arc::new(RwLock::new(ConversationStore::new(ledger_capacity)));
        let (events, _) = broadcast::channel(STORE_EVENT_CAPACITY);
        let gate = Arc::new(CapabilityGate::new(
            connection.clone(),
            Arc::clone(&store),
            events.clone(),
        ));

        let dispatcher = tokio::spawn(run_dispatcher(
            Arc::clone(&store),
            events.clone(),
            connection.frame_receiver(),
            connection.watch_status(),
        ));

        Self {
            connection,
            store,
            gate,
            api,
            events,
            dispatcher: Arc::new(Mutex::new(Some(dispatcher))),
        }
    }

    /// Attach the REST client, typically one built from `gate().watch_token()`
    pub fn with_api(mut self, api: Arc<dyn MessagingApi>) -> Self {
        self.api = Some(api);
        self
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn gate(&self) -> &CapabilityGate {
        &self.gate
    }

    pub fn store(&self) -> Arc<RwLock<ConversationStore>> {
        Arc::clone(&self.store)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub async fn conversation(&self, conversation_id: &str) -> Option<Arc<ConversationState>> {
        self.store.read().await.get(conversation_id)
    }

    pub async fn set_current_user(&self, user: Option<ParticipantId>) {
        self.store.write().await.set_current_user(user);
    }

    // ─── Conversation actions ────────────────────────────────────────────────

    /// Show `body` immediately as a pending message and push it to the server.
    ///
    /// The returned message carries the generated `client_msg_id` that the
    /// server echo will be matched on.
    pub async fn send_message(
        &self,
        conversation_id: &str,
        body: &str,
        mime_type: Option<&str>,
    ) -> Result<Message> {
        if !self.gate.is_enabled().await {
            return Err(SyncError::Connection("Messaging is not enabled".to_string()));
        }

        let client_msg_id = Uuid::new_v4().to_string();
        let mime_type = mime_type.unwrap_or(DEFAULT_MIME_TYPE);
        let raw = json!({
            "client_msg_id": client_msg_id,
            "body": body,
            "mime_type": mime_type,
        });

        let message = self.store.write().await.add_local_message(conversation_id, &raw);
        self.changed(conversation_id);

        let frame = OutboundFrame::SendMessage {
            conversation_id: conversation_id.to_string(),
            client_msg_id,
            body: body.to_string(),
            mime_type: mime_type.to_string(),
        };
        if !self.connection.send(&frame).await {
            debug!("Message for {} queued locally, socket not open", conversation_id);
        }
        Ok(message)
    }

    /// Mark read locally and tell the server
    pub async fn mark_read(&self, conversation_id: &str, message_id: MessageId) -> bool {
        let changed = self
            .store
            .write()
            .await
            .mark_read(conversation_id, message_id.clone());
        if changed {
            self.changed(conversation_id);
        }
        self.connection
            .send(&OutboundFrame::Read {
                conversation_id: conversation_id.to_string(),
                message_id,
            })
            .await;
        changed
    }

    /// Make `conversation_id` the open conversation, join its room and load history
    pub async fn open_conversation(&self, conversation_id: &str) -> Result<()> {
        let previous = {
            let mut store = self.store.write().await;
            let previous = store.active_conversation().map(str::to_string);
            store.set_active_conversation(Some(conversation_id.to_string()));
            previous
        };
        if let Some(previous) = previous.filter(|p| p != conversation_id) {
            self.changed(&previous);
        }
        self.changed(conversation_id);
        self.connection.join(conversation_id).await;

        if self.api.is_some() {
            self.load_history(conversation_id).await?;
        }
        Ok(())
    }

    pub async fn close_conversation(&self, conversation_id: &str) {
        self.connection.leave(conversation_id).await;
        let cleared = {
            let mut store = self.store.write().await;
            store.active_conversation() == Some(conversation_id) && store.set_active_conversation(None)
        };
        if cleared {
            self.changed(conversation_id);
        }
    }

    // ─── REST hydration ──────────────────────────────────────────────────────

    /// Fetch the conversation list, hydrate the store and return the reconciled list
    pub async fn refresh_conversations(&self) -> Result<ConversationList> {
        let api = self.api()?;
        let mut ticket = self.ticket().await?;
        let response = ticket.run(api.fetch_conversations()).await?;

        let snapshots = normalizer::snapshots_from_response(&response);
        let changed = {
            let mut store = self.store.write().await;
            Self::still_current(&ticket)?;
            store.hydrate(&snapshots)
        };
        info!(
            "Hydrated {} conversations ({} changed)",
            snapshots.len(),
            changed.len()
        );
        for conversation_id in &changed {
            self.changed(conversation_id);
        }

        let list = reconciler::list_from_response(&response);
        Ok(self.reconcile(&list).await)
    }

    /// Replace a conversation's messages with its fetched history
    pub async fn load_history(&self, conversation_id: &str) -> Result<bool> {
        let api = self.api()?;
        let mut ticket = self.ticket().await?;
        let response = ticket.run(api.fetch_history(conversation_id)).await?;

        let messages = normalizer::extract_history(&response);
        let changed = {
            let mut store = self.store.write().await;
            Self::still_current(&ticket)?;
            store.set_history(conversation_id, &messages)
        };
        debug!("Loaded {} messages for {}", messages.len(), conversation_id);
        if changed {
            self.changed(conversation_id);
        }
        Ok(changed)
    }

    pub async fn fetch_profile(&self, user_id: &str) -> Result<Value> {
        let api = self.api()?;
        let mut ticket = self.ticket().await?;
        ticket.run(api.fetch_profile(user_id)).await
    }

    /// Patch a REST-shaped list with realtime facts from the store
    pub async fn reconcile(&self, list: &ConversationList) -> ConversationList {
        let store = self.store.read().await;
        reconciler::reconcile(list, &store)
    }

    /// Stop the connection for good and the dispatcher with it
    pub async fn shutdown(&self) {
        self.connection.shutdown().await;
        if let Some(handle) = self.dispatcher.lock().await.take() {
            handle.abort();
        }
        info!("Messaging session stopped");
    }

    fn api(&self) -> Result<Arc<dyn MessagingApi>> {
        self.api
            .clone()
            .ok_or_else(|| SyncError::Config("No REST API configured".to_string()))
    }

    async fn ticket(&self) -> Result<RequestTicket> {
        self.gate.request_ticket().await.ok_or(SyncError::Cancelled)
    }

    /// Stale once the gate has closed the scope the ticket was issued in,
    /// e.g. while this response waited on a wipe's store lock.
    fn still_current(ticket: &RequestTicket) -> Result<()> {
        if ticket.is_current() {
            Ok(())
        } else {
            debug!("Discarding response from a closed capability scope");
            Err(SyncError::Cancelled)
        }
    }

    fn changed(&self, conversation_id: &str) {
        let _ = self.events.send(StoreEvent::ConversationChanged {
            conversation_id: conversation_id.to_string(),
        });
    }
}

// ─── Frame dispatch ──────────────────────────────────────────────────────────

async fn run_dispatcher(
    store: Arc<RwLock<ConversationStore>>,
    events: broadcast::Sender<StoreEvent>,
    mut frames: mpsc::UnboundedReceiver<InboundFrame>,
    mut status: watch::Receiver<ConnectionStatus>,
) {
    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Some(frame) => apply_frame(&store, &events, frame).await,
                None => break,
            },
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *status.borrow_and_update();
                let _ = events.send(StoreEvent::ConnectionStatus { status: current });
            }
        }
    }
    debug!("Frame dispatcher exiting");
}

async fn apply_frame(
    store: &RwLock<ConversationStore>,
    events: &broadcast::Sender<StoreEvent>,
    frame: InboundFrame,
) {
    let (event, changed) = match frame {
        InboundFrame::Message(event) => {
            let changed = store.write().await.process_incoming_message(&event);
            (event, changed)
        }
        InboundFrame::ConversationUpdated(event) => {
            let changed = store.write().await.process_conversation_update(&event);
            (event, changed)
        }
        InboundFrame::Read(event) => {
            let changed = store.write().await.process_read_receipt(&event);
            (event, changed)
        }
        InboundFrame::Error { message } => {
            let _ = events.send(StoreEvent::ServerError { message });
            return;
        }
        InboundFrame::Pong | InboundFrame::Unknown(_) => return,
    };

    if let (true, Some(conversation_id)) = (changed, event.conversation_id) {
        let _ = events.send(StoreEvent::ConversationChanged { conversation_id });
    }
}
