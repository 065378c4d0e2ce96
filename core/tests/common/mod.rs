//! Shared test doubles: in-memory socket transport and canned REST API
#![allow(dead_code)]

use async_trait::async_trait;
use matchlink_core::api::MessagingApi;
use matchlink_core::realtime::{SocketChannels, SocketEvent, Transport};
use matchlink_core::{Result, SyncError};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

pub const BASE_URL: &str = "https://api.example.com";

/// Let spawned tasks run to idle (time is paused in these tests)
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

/// Server side of one fake socket
pub struct FakeSocket {
    pub url: String,
    sent: mpsc::UnboundedReceiver<String>,
    push: mpsc::UnboundedSender<SocketEvent>,
    buffered: Vec<String>,
    closed: bool,
}

impl FakeSocket {
    fn pump(&mut self) {
        loop {
            match self.sent.try_recv() {
                Ok(text) => self.buffered.push(text),
                Err(TryRecvError::Empty) => return,
                Err(TryRecvError::Disconnected) => {
                    self.closed = true;
                    return;
                }
            }
        }
    }

    /// Every frame the client wrote since the last drain
    pub fn drain_sent(&mut self) -> Vec<Value> {
        self.pump();
        self.buffered
            .drain(..)
            .map(|text| serde_json::from_str(&text).expect("client sent invalid JSON"))
            .collect()
    }

    /// `type` of every frame the client wrote since the last drain
    pub fn drain_types(&mut self) -> Vec<String> {
        self.drain_sent()
            .iter()
            .map(|frame| frame["type"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    /// The client dropped its end
    pub fn is_closed(&mut self) -> bool {
        self.pump();
        self.closed
    }

    pub fn push_text(&self, text: &str) {
        let _ = self.push.send(SocketEvent::Text(text.to_string()));
    }

    pub fn push_json(&self, frame: Value) {
        self.push_text(&frame.to_string());
    }

    /// Server-side close
    pub fn close(&self, reason: &str) {
        let _ = self.push.send(SocketEvent::Closed(Some(reason.to_string())));
    }
}

/// Transport that hands out in-memory sockets
#[derive(Default)]
pub struct FakeTransport {
    sockets: Mutex<VecDeque<FakeSocket>>,
    urls: Mutex<Vec<String>>,
    attempts: AtomicUsize,
    failing: AtomicBool,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make subsequent connects fail during construction
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }

    /// Oldest socket not yet taken by the test
    pub fn take_socket(&self) -> FakeSocket {
        self.sockets
            .lock()
            .unwrap()
            .pop_front()
            .expect("no socket was opened")
    }

    pub fn pending_sockets(&self) -> usize {
        self.sockets.lock().unwrap().len()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(&self, url: &str) -> Result<SocketChannels> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().unwrap().push(url.to_string());
        if self.failing.load(Ordering::SeqCst) {
            return Err(SyncError::Connection("connection refused".to_string()));
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        self.sockets.lock().unwrap().push_back(FakeSocket {
            url: url.to_string(),
            sent: out_rx,
            push: in_tx,
            buffered: Vec::new(),
            closed: false,
        });
        Ok(SocketChannels {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}

/// REST API serving canned JSON, optionally slow
#[derive(Default)]
pub struct FakeApi {
    pub conversations: Value,
    pub histories: HashMap<String, Value>,
    pub delay: Option<Duration>,
    pub calls: AtomicUsize,
}

impl FakeApi {
    async fn respond(&self, value: Option<Value>) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        value.ok_or_else(|| SyncError::Http("404 Not Found".to_string()))
    }
}

#[async_trait]
impl MessagingApi for FakeApi {
    async fn fetch_conversations(&self) -> Result<Value> {
        self.respond(Some(self.conversations.clone())).await
    }

    async fn fetch_history(&self, conversation_id: &str) -> Result<Value> {
        self.respond(self.histories.get(conversation_id).cloned()).await
    }

    async fn fetch_profile(&self, user_id: &str) -> Result<Value> {
        self.respond(Some(serde_json::json!({"id": user_id}))).await
    }
}
