/// Connection lifecycle: one persistent socket per session
///
/// `Disconnected --connect--> Connecting --open--> Open --close--> Disconnected`.
/// An unexpected close while `auto_connect && capability_enabled` arms a single
/// fixed-delay reconnect. Heartbeat and reconnect timers are task handles that
/// are aborted on every transition away from `Open`/`Connecting`, and every
/// socket carries a generation number so callbacks from a superseded socket are
/// ignored.
use crate::messenger_types::ConnectionStatus;
use crate::realtime::protocol::{InboundFrame, OutboundFrame};
use crate::realtime::transport::{SocketChannels, SocketEvent, Transport};
use std::collections::HashSet;
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Injected connection settings
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server base address, e.g. `https://api.example.com`
    pub base_url: String,
    pub heartbeat_interval: Duration,
    pub reconnect_delay: Duration,
}

impl ConnectionConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

/// Build `<base>/ws?token=<credential>`, mapping http(s) bases to ws(s)
pub fn build_endpoint(base_url: &str, token: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        base.to_string()
    };
    format!("{}/ws?token={}", base, urlencoding::encode(token))
}

/// Lifecycle notifications for subscribers
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Opened,
    Frame(InboundFrame),
    Closed {
        reason: Option<String>,
        will_reconnect: bool,
    },
}

/// Which timers are currently armed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimerState {
    pub heartbeat: bool,
    pub reconnect: bool,
}

struct ConnectionInner {
    status: ConnectionStatus,
    auto_connect: bool,
    capability_enabled: bool,
    /// Set by `shutdown`; only an explicit `connect` clears it
    shut_down: bool,
    last_token: Option<String>,
    /// Token the live (or in-flight) socket was opened with
    connected_token: Option<String>,
    joined: HashSet<String>,
    generation: u64,
    outgoing: Option<mpsc::UnboundedSender<String>>,
    connect_task: Option<JoinHandle<()>>,
    reader_task: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

impl ConnectionInner {
    fn new() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            auto_connect: false,
            capability_enabled: true,
            shut_down: false,
            last_token: None,
            connected_token: None,
            joined: HashSet::new(),
            generation: 0,
            outgoing: None,
            connect_task: None,
            reader_task: None,
            heartbeat: None,
            reconnect: None,
        }
    }
}

fn abort(handle: &mut Option<JoinHandle<()>>) {
    if let Some(h) = handle.take() {
        h.abort();
    }
}

/// Owner of the single realtime connection
#[derive(Clone)]
pub struct ConnectionManager {
    config: Arc<ConnectionConfig>,
    transport: Arc<dyn Transport>,
    inner: Arc<Mutex<ConnectionInner>>,
    events: broadcast::Sender<ConnectionEvent>,
    frames: Arc<std::sync::Mutex<Option<mpsc::UnboundedSender<InboundFrame>>>>,
    status_tx: Arc<watch::Sender<ConnectionStatus>>,
    last_error_tx: Arc<watch::Sender<Option<String>>>,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig, transport: Arc<dyn Transport>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        let (last_error_tx, _) = watch::channel(None);
        Self {
            config: Arc::new(config),
            transport,
            inner: Arc::new(Mutex::new(ConnectionInner::new())),
            events,
            frames: Arc::new(std::sync::Mutex::new(None)),
            status_tx: Arc::new(status_tx),
            last_error_tx: Arc::new(last_error_tx),
        }
    }

    // ─── Observers ───────────────────────────────────────────────────────────

    pub fn status(&self) -> ConnectionStatus {
        *self.status_tx.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    /// Last server-pushed `error` frame
    pub fn last_error(&self) -> Option<String> {
        self.last_error_tx.borrow().clone()
    }

    pub fn watch_last_error(&self) -> watch::Receiver<Option<String>> {
        self.last_error_tx.subscribe()
    }

    /// Lifecycle and frame notifications. Slow observers may lag and miss events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Lossless feed of every inbound frame for a single consumer.
    ///
    /// A second call replaces the previous feed, whose receiver then ends.
    pub fn frame_receiver(&self) -> mpsc::UnboundedReceiver<InboundFrame> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.frames.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        rx
    }

    pub async fn timers(&self) -> TimerState {
        let inner = self.inner.lock().await;
        TimerState {
            heartbeat: inner.heartbeat.is_some(),
            reconnect: inner.reconnect.is_some(),
        }
    }

    pub async fn auto_connect(&self) -> bool {
        self.inner.lock().await.auto_connect
    }

    pub async fn capability_enabled(&self) -> bool {
        self.inner.lock().await.capability_enabled
    }

    pub async fn joined_conversations(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        let mut ids: Vec<String> = inner.joined.iter().cloned().collect();
        ids.sort();
        ids
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────────

    /// Open the connection with `token`. No-op while already connecting or open.
    pub async fn connect(&self, token: &str) {
        let mut inner = self.inner.lock().await;
        if matches!(inner.status, ConnectionStatus::Connecting | ConnectionStatus::Open) {
            debug!("connect() ignored, connection already {:?}", inner.status);
            return;
        }

        inner.auto_connect = true;
        inner.last_token = Some(token.to_string());
        if inner.shut_down {
            info!("Explicit connect after shutdown, re-enabling connectivity");
            inner.shut_down = false;
            inner.capability_enabled = true;
        }
        abort(&mut inner.reconnect);

        if inner.capability_enabled {
            self.open_locked(&mut inner);
        } else {
            debug!("Capability disabled, deferring connect");
        }
    }

    /// Soft stop: close and stay closed until the next explicit `connect`
    pub async fn disconnect(&self) {
        let mut inner = self.inner.lock().await;
        inner.auto_connect = false;
        let was_live = self.close_locked(&mut inner);
        drop(inner);

        info!("Realtime connection disconnected");
        if was_live {
            self.emit_closed(Some("disconnected".to_string()), false);
        }
    }

    /// Hard stop: like `disconnect` and capability stays off for this manager
    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        inner.auto_connect = false;
        inner.capability_enabled = false;
        inner.shut_down = true;
        let was_live = self.close_locked(&mut inner);
        drop(inner);

        info!("Realtime connection shut down");
        if was_live {
            self.emit_closed(Some("shutdown".to_string()), false);
        }
    }

    /// Gate connectivity without touching `auto_connect`
    pub async fn set_capability_enabled(&self, enabled: bool) {
        let mut inner = self.inner.lock().await;
        if enabled && inner.shut_down {
            warn!("Capability enable ignored after shutdown; call connect() explicitly");
            return;
        }
        if inner.capability_enabled == enabled {
            return;
        }
        inner.capability_enabled = enabled;

        if !enabled {
            let was_live = self.close_locked(&mut inner);
            drop(inner);
            info!("Messaging capability disabled, connection closed");
            if was_live {
                self.emit_closed(Some("capability disabled".to_string()), false);
            }
        } else if inner.auto_connect && inner.status == ConnectionStatus::Disconnected {
            info!("Messaging capability enabled, reopening connection");
            self.open_locked(&mut inner);
        }
    }

    /// Rotate credentials. A live socket cannot swap tokens, so it is reopened.
    pub async fn update_token(&self, token: &str) {
        let mut inner = self.inner.lock().await;
        if inner.last_token.as_deref() == Some(token) {
            return;
        }
        inner.last_token = Some(token.to_string());

        let live = matches!(inner.status, ConnectionStatus::Connecting | ConnectionStatus::Open);
        if !inner.auto_connect || !live || inner.connected_token.as_deref() == Some(token) {
            return;
        }

        info!("Token rotated, reconnecting");
        self.close_locked(&mut inner);
        if inner.capability_enabled {
            self.open_locked(&mut inner);
        }
    }

    // ─── Egress ──────────────────────────────────────────────────────────────

    /// Fire-and-forget. Dropped silently unless the socket is open.
    pub async fn send(&self, frame: &OutboundFrame) -> bool {
        let inner = self.inner.lock().await;
        Self::send_locked(&inner, frame)
    }

    /// Subscribe to a conversation; remembered across reconnects
    pub async fn join(&self, conversation_id: &str) {
        let mut inner = self.inner.lock().await;
        inner.joined.insert(conversation_id.to_string());
        Self::send_locked(
            &inner,
            &OutboundFrame::Join {
                conversation_id: conversation_id.to_string(),
            },
        );
    }

    pub async fn leave(&self, conversation_id: &str) {
        let mut inner = self.inner.lock().await;
        inner.joined.remove(conversation_id);
        Self::send_locked(
            &inner,
            &OutboundFrame::Leave {
                conversation_id: conversation_id.to_string(),
            },
        );
    }

    /// Forget every joined conversation (session wipe)
    pub async fn clear_joined(&self) {
        self.inner.lock().await.joined.clear();
    }

    fn send_locked(inner: &ConnectionInner, frame: &OutboundFrame) -> bool {
        if inner.status != ConnectionStatus::Open {
            debug!("Dropping {} while {:?}", frame, inner.status);
            return false;
        }
        let Some(outgoing) = inner.outgoing.as_ref() else {
            return false;
        };
        match frame.to_text() {
            Ok(text) => outgoing.send(text).is_ok(),
            Err(e) => {
                warn!("Failed to serialize {}: {}", frame, e);
                false
            }
        }
    }

    // ─── Internals ───────────────────────────────────────────────────────────

    fn set_status(&self, inner: &mut ConnectionInner, status: ConnectionStatus) {
        if inner.status != status {
            debug!("Connection {:?} -> {:?}", inner.status, status);
            inner.status = status;
            self.status_tx.send_replace(status);
        }
    }

    fn emit_closed(&self, reason: Option<String>, will_reconnect: bool) {
        let _ = self.events.send(ConnectionEvent::Closed {
            reason,
            will_reconnect,
        });
    }

    fn open_locked(&self, inner: &mut ConnectionInner) {
        let Some(token) = inner.last_token.clone() else {
            warn!("Cannot open connection without a token");
            return;
        };

        inner.generation += 1;
        let generation = inner.generation;
        abort(&mut inner.reconnect);
        self.set_status(inner, ConnectionStatus::Connecting);

        let url = build_endpoint(&self.config.base_url, &token);
        inner.connected_token = Some(token);
        info!("Connecting to {} (attempt #{})", self.config.base_url, generation);

        let manager = self.clone();
        inner.connect_task = Some(tokio::spawn(async move {
            match manager.transport.connect(&url).await {
                Ok(socket) => manager.on_open(generation, socket).await,
                Err(e) => {
                    warn!("Socket construction failed: {}", e);
                    manager.on_close(generation, Some(e.to_string())).await;
                }
            }
        }));
    }

    /// Tear down the live socket and its timers. Returns true if one was live.
    fn close_locked(&self, inner: &mut ConnectionInner) -> bool {
        inner.generation += 1;
        abort(&mut inner.reconnect);
        abort(&mut inner.heartbeat);
        abort(&mut inner.connect_task);
        abort(&mut inner.reader_task);
        inner.connected_token = None;

        let was_live = inner.status != ConnectionStatus::Disconnected;
        if was_live {
            self.set_status(inner, ConnectionStatus::Closing);
        }
        inner.outgoing = None;
        self.set_status(inner, ConnectionStatus::Disconnected);
        was_live
    }

    async fn on_open(&self, generation: u64, socket: SocketChannels) {
        let mut inner = self.inner.lock().await;
        if inner.generation != generation || inner.status != ConnectionStatus::Connecting {
            debug!("Discarding superseded socket #{}", generation);
            return;
        }

        inner.connect_task = None;
        abort(&mut inner.reconnect);
        inner.outgoing = Some(socket.outgoing.clone());
        self.set_status(&mut inner, ConnectionStatus::Open);

        // Room membership does not survive a reconnect
        let mut rejoin: Vec<&String> = inner.joined.iter().collect();
        rejoin.sort();
        for conversation_id in rejoin {
            let frame = OutboundFrame::Join {
                conversation_id: conversation_id.clone(),
            };
            if let Ok(text) = frame.to_text() {
                let _ = socket.outgoing.send(text);
            }
        }

        inner.heartbeat = Some(self.spawn_heartbeat(socket.outgoing));

        let manager = self.clone();
        inner.reader_task = Some(tokio::spawn(manager.read_loop(generation, socket.incoming)));
        let joined = inner.joined.len();
        drop(inner);

        info!("Realtime connection open (rejoined {} conversations)", joined);
        let _ = self.events.send(ConnectionEvent::Opened);
    }

    fn spawn_heartbeat(&self, outgoing: mpsc::UnboundedSender<String>) -> JoinHandle<()> {
        let period = self.config.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Ok(ping) = OutboundFrame::Ping.to_text() else {
                    break;
                };
                if outgoing.send(ping).is_err() {
                    break;
                }
            }
        })
    }

    async fn read_loop(self, generation: u64, mut incoming: mpsc::UnboundedReceiver<SocketEvent>) {
        while let Some(event) = incoming.recv().await {
            match event {
                SocketEvent::Text(text) => self.handle_text(&text),
                SocketEvent::Closed(reason) => {
                    self.on_close(generation, reason).await;
                    return;
                }
            }
        }
        self.on_close(generation, None).await;
    }

    fn handle_text(&self, text: &str) {
        match InboundFrame::parse(text) {
            Ok(InboundFrame::Pong) => debug!("Received pong"),
            Ok(InboundFrame::Unknown(kind)) => debug!("Ignoring unknown frame type: {}", kind),
            Ok(frame) => {
                if let InboundFrame::Error { message } = &frame {
                    warn!("Server error frame: {}", message);
                    self.last_error_tx.send_replace(Some(message.clone()));
                }
                if let Some(tx) = self.frames.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
                    let _ = tx.send(frame.clone());
                }
                let _ = self.events.send(ConnectionEvent::Frame(frame));
            }
            Err(e) => warn!("Dropping unparseable frame: {}", e),
        }
    }

    async fn on_close(&self, generation: u64, reason: Option<String>) {
        let mut inner = self.inner.lock().await;
        if inner.generation != generation {
            debug!("Ignoring close of superseded socket #{}", generation);
            return;
        }

        // Called from the connect or reader task itself; drop those handles without aborting
        inner.connect_task = None;
        inner.reader_task = None;
        abort(&mut inner.heartbeat);
        inner.outgoing = None;
        inner.connected_token = None;
        self.set_status(&mut inner, ConnectionStatus::Disconnected);

        let will_reconnect = inner.auto_connect && inner.capability_enabled;
        if will_reconnect {
            self.schedule_reconnect(&mut inner);
        }
        drop(inner);

        warn!(
            "Realtime connection closed ({}), reconnect: {}",
            reason.as_deref().unwrap_or("no reason"),
            will_reconnect
        );
        self.emit_closed(reason, will_reconnect);
    }

    fn schedule_reconnect(&self, inner: &mut ConnectionInner) {
        abort(&mut inner.reconnect);
        let delay = self.config.reconnect_delay;
        let manager = self.clone();
        inner.reconnect = Some(tokio::spawn(async move {
            sleep(delay).await;
            manager.reconnect_now().await;
        }));
    }

    async fn reconnect_now(&self) {
        let mut inner = self.inner.lock().await;
        // This task is the reconnect timer; release its handle
        inner.reconnect = None;
        if inner.status != ConnectionStatus::Disconnected
            || !inner.auto_connect
            || !inner.capability_enabled
        {
            return;
        }
        info!("Reconnecting after {:?}", self.config.reconnect_delay);
        self.open_locked(&mut inner);
    }
}
