/// Wire frames exchanged over the realtime socket
use crate::error::{Result, SyncError};
use crate::messenger_types::MessageId;
use crate::normalizer;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Push event addressed to one conversation
#[derive(Debug, Clone, PartialEq)]
pub struct PushEvent {
    /// Resolved from the frame, then the payload. `None` means the event is unroutable.
    pub conversation_id: Option<String>,
    pub payload: Value,
}

impl PushEvent {
    pub fn new(conversation_id: impl Into<String>, payload: Value) -> Self {
        Self {
            conversation_id: Some(conversation_id.into()),
            payload,
        }
    }
}

/// Frames the server pushes to us
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Message(PushEvent),
    ConversationUpdated(PushEvent),
    Read(PushEvent),
    Error { message: String },
    Pong,
    /// Unrecognized `type`; logged and ignored
    Unknown(String),
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    conversation_id: Option<Value>,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    message: Option<Value>,
}

impl InboundFrame {
    /// Parse a text frame. Fails only when the text is not a typed JSON object.
    pub fn parse(text: &str) -> Result<Self> {
        let mut raw: RawFrame = serde_json::from_str(text)?;
        let kind = std::mem::take(&mut raw.kind);
        let event = |raw: RawFrame| PushEvent {
            conversation_id: normalizer::resolve_conversation_id(
                raw.conversation_id.as_ref(),
                &raw.payload,
            ),
            payload: raw.payload,
        };

        Ok(match kind.as_str() {
            "message" => InboundFrame::Message(event(raw)),
            "conversation_updated" => InboundFrame::ConversationUpdated(event(raw)),
            "read" => InboundFrame::Read(event(raw)),
            "error" => InboundFrame::Error {
                message: error_text(&raw.payload, raw.message.as_ref()),
            },
            "pong" => InboundFrame::Pong,
            "" => return Err(SyncError::Protocol("frame without type".to_string())),
            other => InboundFrame::Unknown(other.to_string()),
        })
    }

    pub fn frame_type(&self) -> &str {
        match self {
            InboundFrame::Message(_) => "message",
            InboundFrame::ConversationUpdated(_) => "conversation_updated",
            InboundFrame::Read(_) => "read",
            InboundFrame::Error { .. } => "error",
            InboundFrame::Pong => "pong",
            InboundFrame::Unknown(kind) => kind,
        }
    }
}

fn error_text(payload: &Value, top_level: Option<&Value>) -> String {
    payload
        .get("message")
        .or_else(|| payload.get("error"))
        .and_then(Value::as_str)
        .or_else(|| payload.as_str())
        .or_else(|| top_level.and_then(Value::as_str))
        .unwrap_or("unknown server error")
        .to_string()
}

/// Frames we send to the server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum OutboundFrame {
    /// Subscribe to a conversation's push events
    #[serde(rename = "join")]
    Join { conversation_id: String },

    /// Drop a conversation subscription
    #[serde(rename = "leave")]
    Leave { conversation_id: String },

    /// Read receipt up to a message
    #[serde(rename = "read")]
    Read {
        conversation_id: String,
        message_id: MessageId,
    },

    /// New outgoing chat message
    #[serde(rename = "send_message")]
    SendMessage {
        conversation_id: String,
        client_msg_id: String,
        body: String,
        mime_type: String,
    },

    /// Keepalive
    #[serde(rename = "ping")]
    Ping,
}

impl OutboundFrame {
    /// Serialize to a JSON text frame
    pub fn to_text(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn frame_type(&self) -> &'static str {
        match self {
            OutboundFrame::Join { .. } => "join",
            OutboundFrame::Leave { .. } => "leave",
            OutboundFrame::Read { .. } => "read",
            OutboundFrame::SendMessage { .. } => "send_message",
            OutboundFrame::Ping => "ping",
        }
    }
}

impl fmt::Display for OutboundFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OutboundFrame({})", self.frame_type())
    }
}
