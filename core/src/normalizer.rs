/// Message normalization: turns heterogeneous wire payloads into canonical records
///
/// Every field resolves through an ordered alias table (see [`aliases`]); the
/// first present, non-null value wins. Nothing in here panics or errors on
/// malformed input, missing or garbage fields degrade to documented defaults.
use crate::messenger_types::{ConversationSnapshot, Message, MessageId, ParticipantId};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Value};

pub const DEFAULT_MIME_TYPE: &str = "text/plain";

/// Maximum nesting walked when searching for a conversation array
const MAX_LIST_DEPTH: usize = 8;

/// Epoch values above this are treated as milliseconds
const MILLIS_THRESHOLD: i64 = 1_000_000_000_000;

/// Ordered alias tables, highest priority first
pub mod aliases {
    pub const MESSAGE_ID: &[&str] = &["message_id", "id", "ID", "MessageID", "MessageId"];
    pub const CLIENT_MSG_ID: &[&str] = &["client_msg_id", "clientMsgId", "clientMsgID", "temp_id", "tempId"];
    pub const SENDER_ID: &[&str] = &["sender_id", "senderId", "SenderID", "SenderId", "from_id", "fromId"];
    pub const SENDER_HOLDERS: &[&str] = &["sender", "user", "author"];
    pub const RECEIVER_ID: &[&str] = &[
        "receiver_id",
        "receiverId",
        "ReceiverID",
        "ReceiverId",
        "recipient_id",
        "recipientId",
        "to_id",
        "toId",
    ];
    pub const RECEIVER_HOLDERS: &[&str] = &["receiver", "recipient"];
    /// Keys tried inside a nested participant object
    pub const NESTED_ID: &[&str] = &["id", "user_id", "userId"];
    pub const BODY: &[&str] = &["body", "message", "text", "content", "Body", "Message"];
    pub const MIME_TYPE: &[&str] = &["mime_type", "mimeType", "MimeType"];
    pub const TIMESTAMP: &[&str] = &["timestamp", "created_at", "createdAt", "sent_at", "sentAt"];
    /// Wrapper keys under which a payload may nest its message object
    pub const MESSAGE_WRAPPER: &[&str] = &["message", "last_message"];
    pub const CONVERSATION_ID: &[&str] = &["conversation_id", "conversationId", "ConversationID", "ConversationId"];
    /// Conversation id inside a REST list entry (the entry's own id comes first)
    pub const SNAPSHOT_ID: &[&str] = &["id", "conversation_id", "conversationId", "ID"];
    pub const LAST_READ: &[&str] = &["last_read_message_id", "lastReadMessageId", "last_read", "lastRead"];
    pub const UNREAD_COUNT: &[&str] = &["unread_count", "unreadCount", "unread"];
    pub const BLOCKED: &[&str] = &["blocked", "is_blocked", "isBlocked"];
    /// Containers that may hold the conversation array in a list response
    pub const LIST_CONTAINERS: &[&str] = &["conversations", "data", "results", "items"];
    pub const HISTORY_CONTAINERS: &[&str] = &["messages", "data"];
}

/// Per-call overrides applied after alias resolution
#[derive(Debug, Clone, Default)]
pub struct NormalizeOverrides {
    pub pending: Option<bool>,
    pub client_msg_id: Option<String>,
    pub sender_id: Option<ParticipantId>,
}

impl NormalizeOverrides {
    /// Overrides for a locally-created optimistic message
    pub fn optimistic() -> Self {
        Self {
            pending: Some(true),
            ..Default::default()
        }
    }
}

/// Normalize one raw message-shaped value
pub fn normalize(conversation_id: &str, raw: &Value, overrides: &NormalizeOverrides) -> Message {
    let raw = unwrap_message_payload(raw);

    let sender_id = overrides
        .sender_id
        .clone()
        .or_else(|| resolve_participant(raw, aliases::SENDER_ID, aliases::SENDER_HOLDERS));

    Message {
        conversation_id: conversation_id.to_string(),
        message_id: first_string(raw, aliases::MESSAGE_ID).map(MessageId::from),
        client_msg_id: overrides
            .client_msg_id
            .clone()
            .or_else(|| first_string(raw, aliases::CLIENT_MSG_ID)),
        sender_id,
        receiver_id: resolve_participant(raw, aliases::RECEIVER_ID, aliases::RECEIVER_HOLDERS),
        body: first_text(raw, aliases::BODY).unwrap_or_default(),
        mime_type: first_text(raw, aliases::MIME_TYPE).unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string()),
        timestamp: first_present(raw, aliases::TIMESTAMP).and_then(parse_timestamp),
        pending: overrides.pending.unwrap_or(false),
    }
}

/// Normalize a fetched history array
pub fn normalize_history(conversation_id: &str, raws: &[Value]) -> Vec<Message> {
    let overrides = NormalizeOverrides::default();
    raws.iter()
        .map(|raw| normalize(conversation_id, raw, &overrides))
        .collect()
}

/// Returns the nested message object when the payload wraps one
pub fn unwrap_message_payload(payload: &Value) -> &Value {
    for key in aliases::MESSAGE_WRAPPER {
        if let Some(inner @ Value::Object(_)) = payload.get(*key) {
            return inner;
        }
    }
    payload
}

/// Resolve the conversation an event belongs to.
///
/// The frame-level id wins; otherwise the payload (or its wrapped message) is searched.
pub fn resolve_conversation_id(frame_id: Option<&Value>, payload: &Value) -> Option<String> {
    frame_id
        .and_then(scalar_to_string)
        .or_else(|| first_string(payload, aliases::CONVERSATION_ID))
        .or_else(|| first_string(unwrap_message_payload(payload), aliases::CONVERSATION_ID))
}

/// Find the conversation array in a list response of unknown shape
pub fn extract_conversation_list(value: &Value) -> Option<&Vec<Value>> {
    find_array(value, aliases::LIST_CONTAINERS, 0)
}

/// Find the message array in a history response (bare array or `{messages: [...]}`)
pub fn extract_history(value: &Value) -> Vec<Value> {
    find_array(value, aliases::HISTORY_CONTAINERS, 0)
        .cloned()
        .unwrap_or_default()
}

fn find_array<'a>(value: &'a Value, keys: &[&str], depth: usize) -> Option<&'a Vec<Value>> {
    if let Value::Array(items) = value {
        return Some(items);
    }
    if depth >= MAX_LIST_DEPTH {
        return None;
    }
    let obj = value.as_object()?;
    for key in keys {
        match obj.get(*key) {
            Some(Value::Array(items)) => return Some(items),
            Some(nested @ Value::Object(_)) => {
                if let Some(found) = find_array(nested, keys, depth + 1) {
                    return Some(found);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse one REST list entry into a hydration snapshot. `None` without a usable id.
pub fn snapshot_from_value(value: &Value) -> Option<ConversationSnapshot> {
    let id = first_string(value, aliases::SNAPSHOT_ID)?;
    Some(ConversationSnapshot {
        id,
        messages: value.get("messages").and_then(Value::as_array).cloned(),
        last_read: first_string(value, aliases::LAST_READ).map(MessageId::from),
        unread_count: first_present(value, aliases::UNREAD_COUNT).and_then(parse_count),
        blocked: first_present(value, aliases::BLOCKED).and_then(Value::as_bool),
    })
}

/// Parse every entry of a list response; entries without an id are skipped
pub fn snapshots_from_response(value: &Value) -> Vec<ConversationSnapshot> {
    extract_conversation_list(value)
        .map(|items| items.iter().filter_map(snapshot_from_value).collect())
        .unwrap_or_default()
}

/// Parse a timestamp from RFC3339, a naive `YYYY-MM-DD HH:MM:SS` string, or an epoch
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_timestamp_str(s.trim()),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
            .and_then(from_epoch),
        _ => None,
    }
}

fn parse_timestamp_str(s: &str) -> Option<DateTime<Utc>> {
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    s.parse::<i64>().ok().and_then(from_epoch)
}

fn from_epoch(n: i64) -> Option<DateTime<Utc>> {
    if n.unsigned_abs() > MILLIS_THRESHOLD.unsigned_abs() {
        DateTime::from_timestamp_millis(n)
    } else {
        DateTime::from_timestamp(n, 0)
    }
}

pub(crate) fn parse_count(value: &Value) -> Option<u32> {
    let n = match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?,
        Value::String(s) => s.trim().parse::<i64>().ok()?,
        _ => return None,
    };
    Some(n.clamp(0, u32::MAX as i64) as u32)
}

/// First key whose value is present and not null
pub fn first_present<'a>(raw: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    let obj: &Map<String, Value> = raw.as_object()?;
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .find(|v| !v.is_null())
}

/// First key holding a string or number, rendered as a non-empty string
pub(crate) fn first_string(raw: &Value, keys: &[&str]) -> Option<String> {
    let obj = raw.as_object()?;
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .find_map(scalar_to_string)
}

/// First key holding a string value (objects under the same key are skipped)
fn first_text(raw: &Value, keys: &[&str]) -> Option<String> {
    let obj = raw.as_object()?;
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .find_map(|v| v.as_str().map(str::to_string))
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn resolve_participant(raw: &Value, flat: &[&str], holders: &[&str]) -> Option<ParticipantId> {
    if let Some(id) = first_present(raw, flat).and_then(coerce_participant) {
        return Some(id);
    }
    let obj = raw.as_object()?;
    holders
        .iter()
        .filter_map(|h| obj.get(*h))
        .filter(|holder| holder.is_object())
        .find_map(|holder| first_present(holder, aliases::NESTED_ID).and_then(coerce_participant))
}

fn coerce_participant(value: &Value) -> Option<ParticipantId> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
            .map(ParticipantId::Number)
            .or_else(|| Some(ParticipantId::Text(n.to_string()))),
        Value::String(s) if !s.is_empty() => Some(
            s.trim()
                .parse::<i64>()
                .map(ParticipantId::Number)
                .unwrap_or_else(|_| ParticipantId::Text(s.clone())),
        ),
        _ => None,
    }
}
