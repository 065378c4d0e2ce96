/// Socket transport seam: production WebSocket client and the channel pair it exposes
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tracing::debug;

/// Something that happened on an open socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// A text frame arrived
    Text(String),
    /// The socket is gone; carries the close reason when known
    Closed(Option<String>),
}

/// An open socket, reduced to two channels.
///
/// Dropping every clone of `outgoing` closes the socket.
pub struct SocketChannels {
    pub outgoing: mpsc::UnboundedSender<String>,
    pub incoming: mpsc::UnboundedReceiver<SocketEvent>,
}

/// Opens sockets for the connection manager
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<SocketChannels>;
}

/// WebSocket transport over `tokio-tungstenite`
pub struct WsTransport {
    connect_timeout: Duration,
}

impl WsTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, url: &str) -> Result<SocketChannels> {
        let (ws_stream, _response) = timeout(self.connect_timeout, tokio_tungstenite::connect_async(url))
            .await
            .map_err(|_| SyncError::Timeout("WebSocket connect timeout".to_string()))?
            .map_err(|e| SyncError::Connection(format!("WebSocket connect failed: {}", e)))?;

        let (mut write, mut read) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<SocketEvent>();

        // Write pump: ends (and closes the socket) once every sender is dropped
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = write.send(WsMessage::Text(text)).await {
                    debug!("WebSocket write failed: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
        });

        // Read pump
        tokio::spawn(async move {
            let reason = loop {
                match read.next().await {
                    Some(Ok(WsMessage::Text(text))) => {
                        if in_tx.send(SocketEvent::Text(text)).is_err() {
                            return;
                        }
                    }
                    Some(Ok(WsMessage::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => {
                            if in_tx.send(SocketEvent::Text(text)).is_err() {
                                return;
                            }
                        }
                        Err(_) => debug!("Dropping non-UTF-8 binary frame"),
                    },
                    Some(Ok(WsMessage::Close(frame))) => {
                        break frame.map(|f| f.reason.to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Some(e.to_string()),
                    None => break None,
                }
            };
            let _ = in_tx.send(SocketEvent::Closed(reason));
        });

        Ok(SocketChannels {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}
