/// Capability gate: derives "messaging connectivity allowed" from external signals
/// and drives the connection manager and store resets from it.
use crate::conversation_store::ConversationStore;
use crate::error::{Result, SyncError};
use crate::messenger_types::StoreEvent;
use crate::realtime::connection::ConnectionManager;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tracing::{debug, info};

/// Account lifecycle as reported by the account service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccountStatus {
    #[default]
    Unknown,
    Activated,
    Deactivated,
}

impl AccountStatus {
    /// Parse the lifecycle status string (`activated` / `deactivated`)
    pub fn from_lifecycle(status: &str) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "activated" | "active" => AccountStatus::Activated,
            "deactivated" => AccountStatus::Deactivated,
            _ => AccountStatus::Unknown,
        }
    }
}

/// Every input the gate derives its decision from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilitySignals {
    pub messaging_capability: bool,
    pub account_status: AccountStatus,
    pub lifecycle_loading: bool,
    pub app_shell_accessible: bool,
    pub token: Option<String>,
}

impl Default for CapabilitySignals {
    fn default() -> Self {
        Self {
            messaging_capability: false,
            account_status: AccountStatus::Unknown,
            lifecycle_loading: false,
            app_shell_accessible: true,
            token: None,
        }
    }
}

impl CapabilitySignals {
    pub fn effective_enabled(&self) -> bool {
        self.messaging_capability
            && self.account_status != AccountStatus::Deactivated
            && !self.lifecycle_loading
            && self.app_shell_accessible
            && self.token.is_some()
    }
}

/// What a signal change did to connectivity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateTransition {
    Unchanged,
    /// Became enabled, connect issued
    Enabled,
    /// Disabled while the app shell is still accessible; resumable
    SoftStop,
    /// Disabled because the app shell became inaccessible
    HardStop,
    /// Still enabled, credentials rotated
    TokenRotated,
}

/// Permission to run a REST request tied to the current capability epoch
pub struct RequestTicket {
    epoch: u64,
    rx: watch::Receiver<u64>,
}

impl RequestTicket {
    /// False once capability has been turned off since the ticket was issued
    pub fn is_current(&self) -> bool {
        *self.rx.borrow() == self.epoch
    }

    /// Run `request`, aborting it if capability turns off mid-flight.
    ///
    /// A result that arrives after cancellation is discarded as `Cancelled`.
    pub async fn run<T, F>(&mut self, request: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if !self.is_current() {
            return Err(SyncError::Cancelled);
        }
        let epoch = self.epoch;
        let outcome = {
            let rx = &mut self.rx;
            tokio::select! {
                result = request => Some(result),
                _ = Self::cancelled(rx, epoch) => None,
            }
        };

        match outcome {
            Some(result) => {
                let value = result?;
                if self.is_current() {
                    Ok(value)
                } else {
                    debug!("Discarding late response from a cancelled request");
                    Err(SyncError::Cancelled)
                }
            }
            None => Err(SyncError::Cancelled),
        }
    }

    async fn cancelled(rx: &mut watch::Receiver<u64>, epoch: u64) {
        loop {
            if *rx.borrow() != epoch {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

struct GateState {
    signals: CapabilitySignals,
    enabled: bool,
}

/// Recomputes effective connectivity whenever an input signal changes
pub struct CapabilityGate {
    connection: ConnectionManager,
    store: Arc<RwLock<ConversationStore>>,
    events: broadcast::Sender<StoreEvent>,
    state: Mutex<GateState>,
    scope: watch::Sender<u64>,
    token: watch::Sender<Option<String>>,
}

impl CapabilityGate {
    pub fn new(
        connection: ConnectionManager,
        store: Arc<RwLock<ConversationStore>>,
        events: broadcast::Sender<StoreEvent>,
    ) -> Self {
        let (scope, _) = watch::channel(0);
        let (token, _) = watch::channel(None);
        Self {
            connection,
            store,
            events,
            state: Mutex::new(GateState {
                signals: CapabilitySignals::default(),
                enabled: false,
            }),
            scope,
            token,
        }
    }

    pub async fn signals(&self) -> CapabilitySignals {
        self.state.lock().await.signals.clone()
    }

    /// Current session token, for clients that authenticate outside the socket
    pub fn watch_token(&self) -> watch::Receiver<Option<String>> {
        self.token.subscribe()
    }

    pub async fn is_enabled(&self) -> bool {
        self.state.lock().await.enabled
    }

    /// Ticket for a capability-scoped REST request; `None` while disabled
    pub async fn request_ticket(&self) -> Option<RequestTicket> {
        if !self.state.lock().await.enabled {
            return None;
        }
        let rx = self.scope.subscribe();
        let epoch = *rx.borrow();
        Some(RequestTicket { epoch, rx })
    }

    pub async fn set_messaging_capability(&self, allowed: bool) -> GateTransition {
        self.update(|s| s.messaging_capability = allowed).await
    }

    pub async fn set_account_status(&self, status: AccountStatus) -> GateTransition {
        self.update(|s| s.account_status = status).await
    }

    pub async fn set_lifecycle_loading(&self, loading: bool) -> GateTransition {
        self.update(|s| s.lifecycle_loading = loading).await
    }

    pub async fn set_app_shell_accessible(&self, accessible: bool) -> GateTransition {
        self.update(|s| s.app_shell_accessible = accessible).await
    }

    pub async fn set_token(&self, token: Option<String>) -> GateTransition {
        self.update(|s| s.token = token).await
    }

    /// Apply a signal change and act on the resulting transition
    pub async fn update<F>(&self, change: F) -> GateTransition
    where
        F: FnOnce(&mut CapabilitySignals),
    {
        let mut state = self.state.lock().await;
        let previous_token = state.signals.token.clone();
        let was_enabled = state.enabled;

        change(&mut state.signals);
        let now_enabled = state.signals.effective_enabled();
        state.enabled = now_enabled;
        let token_lost = previous_token.is_some() && state.signals.token.is_none();
        self.token.send_if_modified(|shared| {
            if *shared == state.signals.token {
                return false;
            }
            *shared = state.signals.token.clone();
            true
        });

        // Close the request scope before any wipe
        if token_lost || (was_enabled && !now_enabled) {
            self.scope.send_modify(|epoch| *epoch += 1);
        }

        let transition = match (was_enabled, now_enabled) {
            (true, false) => {
                if state.signals.app_shell_accessible {
                    self.connection.disconnect().await;
                    GateTransition::SoftStop
                } else {
                    self.connection.shutdown().await;
                    GateTransition::HardStop
                }
            }
            (false, true) => match state.signals.token.as_deref() {
                Some(token) => {
                    self.connection.connect(token).await;
                    GateTransition::Enabled
                }
                None => GateTransition::Unchanged,
            },
            (true, true) if previous_token != state.signals.token => {
                if let Some(token) = state.signals.token.as_deref() {
                    self.connection.update_token(token).await;
                }
                GateTransition::TokenRotated
            }
            _ => GateTransition::Unchanged,
        };

        if token_lost || transition == GateTransition::HardStop {
            if token_lost {
                info!("Session token gone, wiping conversation state");
            }
            self.wipe().await;
        }

        if transition != GateTransition::Unchanged {
            info!("Capability gate transition: {:?}", transition);
        }
        transition
    }

    async fn wipe(&self) {
        self.store.write().await.reset();
        self.connection.clear_joined().await;
        let _ = self.events.send(StoreEvent::Reset);
    }
}
