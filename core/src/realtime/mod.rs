/// Realtime push channel: wire frames, socket transport, connection lifecycle
pub mod connection;
pub mod protocol;
pub mod transport;

pub use connection::{ConnectionConfig, ConnectionEvent, ConnectionManager, TimerState};
pub use protocol::{InboundFrame, OutboundFrame, PushEvent};
pub use transport::{SocketChannels, SocketEvent, Transport, WsTransport};
