/// Realtime patch reconciler: folds push-derived facts back into the REST-shaped list
use crate::conversation_store::{ConversationState, ConversationStore};
use crate::messenger_types::{Message, MessageId, ParticipantId};
use crate::normalizer::{self, NormalizeOverrides};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Canonical keys owned by [`ConversationListItem`]; everything else is REST-only
const OWN_KEYS: &[&str] = &[
    "id",
    "unread_count",
    "last_read_message_id",
    "last_message_id",
    "last_message_body",
    "last_message_mime_type",
    "last_message_at",
];

/// One row of the conversation list as the UI consumes it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationListItem {
    pub id: String,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default)]
    pub last_read_message_id: Option<MessageId>,
    #[serde(default)]
    pub last_message_id: Option<MessageId>,
    #[serde(default)]
    pub last_message_body: Option<String>,
    #[serde(default)]
    pub last_message_mime_type: Option<String>,
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
    /// REST-only fields (profile, avatar, match metadata...) preserved verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Shared, identity-comparable list
pub type ConversationList = Arc<Vec<Arc<ConversationListItem>>>;

impl ConversationListItem {
    /// Build a list row from a REST conversation entry. `None` without an id.
    pub fn from_value(value: &Value) -> Option<Self> {
        let snapshot = normalizer::snapshot_from_value(value)?;
        let obj = value.as_object()?;

        let last_message = obj
            .get("last_message")
            .filter(|v| v.is_object())
            .map(|raw| normalizer::normalize(&snapshot.id, raw, &NormalizeOverrides::default()));

        let flat_string = |key: &str| obj.get(key).and_then(Value::as_str).map(str::to_string);

        let mut extra = obj.clone();
        for key in OWN_KEYS {
            extra.remove(*key);
        }

        Some(Self {
            id: snapshot.id,
            unread_count: snapshot.unread_count.unwrap_or(0),
            last_read_message_id: snapshot.last_read,
            last_message_id: match &last_message {
                Some(m) => m.message_id.clone(),
                None => normalizer::first_string(value, &["last_message_id"]).map(MessageId::from),
            },
            last_message_body: match &last_message {
                Some(m) => Some(m.body.clone()),
                None => flat_string("last_message_body"),
            },
            last_message_mime_type: match &last_message {
                Some(m) => Some(m.mime_type.clone()),
                None => flat_string("last_message_mime_type"),
            },
            last_message_at: match &last_message {
                Some(m) => m.timestamp,
                None => obj.get("last_message_at").and_then(normalizer::parse_timestamp),
            },
            extra,
        })
    }
}

/// Build a list from a REST list response of any documented shape
pub fn list_from_response(value: &Value) -> ConversationList {
    let items = normalizer::extract_conversation_list(value)
        .map(|items| {
            items
                .iter()
                .filter_map(ConversationListItem::from_value)
                .map(Arc::new)
                .collect()
        })
        .unwrap_or_default();
    Arc::new(items)
}

/// Patch `list` with the store's view.
///
/// Returns the very same `Arc` when nothing differs, so callers can skip work
/// with `Arc::ptr_eq`. Unchanged rows keep their own `Arc` too.
pub fn reconcile(list: &ConversationList, store: &ConversationStore) -> ConversationList {
    let active = store.active_conversation();
    let current_user = store.current_user();
    let mut patched: Option<Vec<Arc<ConversationListItem>>> = None;

    for (idx, item) in list.iter().enumerate() {
        let state = store.get(&item.id);
        let is_active = active == Some(item.id.as_str());
        if let Some(next) = patch_item(item, state.as_deref(), is_active, current_user) {
            let rows = patched.get_or_insert_with(|| (**list).clone());
            rows[idx] = Arc::new(next);
        }
    }

    match patched {
        Some(rows) => Arc::new(rows),
        None => Arc::clone(list),
    }
}

fn patch_item(
    item: &ConversationListItem,
    state: Option<&ConversationState>,
    is_active: bool,
    current_user: Option<&ParticipantId>,
) -> Option<ConversationListItem> {
    let mut next: Option<ConversationListItem> = None;

    let unread = if is_active {
        Some(0)
    } else {
        state.map(|s| s.derived_unread(current_user))
    };
    if let Some(unread) = unread.filter(|u| *u != item.unread_count) {
        next.get_or_insert_with(|| item.clone()).unread_count = unread;
    }

    let Some(state) = state else {
        return next;
    };

    if let Some(last_read) = &state.last_read {
        if item.last_read_message_id.as_ref().map_or(true, |cur| last_read > cur) {
            next.get_or_insert_with(|| item.clone()).last_read_message_id = Some(last_read.clone());
        }
    }

    if let Some(latest) = latest_confirmed(state) {
        if latest.message_id != item.last_message_id {
            let row = next.get_or_insert_with(|| item.clone());
            row.last_message_id = latest.message_id.clone();
            row.last_message_body = Some(latest.body.clone());
            row.last_message_mime_type = Some(latest.mime_type.clone());
            row.last_message_at = latest.timestamp;
        }
    }

    next
}

fn latest_confirmed(state: &ConversationState) -> Option<&Message> {
    state.messages.iter().rev().find(|m| m.message_id.is_some())
}
