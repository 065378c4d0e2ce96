/// Shared types for the messaging layer
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Server-assigned message identifier.
///
/// Ids arrive as strings or numbers depending on the endpoint. Unsigned
/// integer ids compare numerically (`"9" < "10"`) and sort before every
/// non-numeric id; non-numeric ids compare lexicographically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn numeric(&self) -> Option<u64> {
        self.0.parse().ok()
    }
}

impl Ord for MessageId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.numeric(), other.numeric()) {
            (Some(a), Some(b)) => a.cmp(&b).then_with(|| self.0.cmp(&other.0)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for MessageId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Sender / receiver identity. Numeric when the wire value coerces, raw otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParticipantId {
    Number(i64),
    Text(String),
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParticipantId::Number(n) => write!(f, "{}", n),
            ParticipantId::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for ParticipantId {
    fn from(n: i64) -> Self {
        ParticipantId::Number(n)
    }
}

/// One canonical chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub conversation_id: String,
    /// Present once the server has confirmed the message
    pub message_id: Option<MessageId>,
    /// Client-generated idempotency key for optimistic sends
    pub client_msg_id: Option<String>,
    pub sender_id: Option<ParticipantId>,
    pub receiver_id: Option<ParticipantId>,
    pub body: String,
    pub mime_type: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub pending: bool,
}

impl Message {
    /// Confirmed by the server (has an id and is no longer pending)
    pub fn is_confirmed(&self) -> bool {
        self.message_id.is_some() && !self.pending
    }
}

/// REST-derived summary of one conversation, fed to hydration
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationSnapshot {
    pub id: String,
    /// Raw messages, normalized on hydration
    pub messages: Option<Vec<serde_json::Value>>,
    pub last_read: Option<MessageId>,
    pub unread_count: Option<u32>,
    pub blocked: Option<bool>,
}

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// No socket
    Disconnected,
    /// Socket construction in flight
    Connecting,
    /// Socket open, heartbeat running
    Open,
    /// Socket is being torn down
    Closing,
}

/// Real-time events for UI subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreEvent {
    /// Conversation state changed (new reference in the store)
    ConversationChanged { conversation_id: String },
    /// Connection moved to a new lifecycle state
    ConnectionStatus { status: ConnectionStatus },
    /// Server pushed an `error` frame
    ServerError { message: String },
    /// All conversation state was wiped (logout / revocation)
    Reset,
}
