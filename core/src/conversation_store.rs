/// Conversation state reducer
///
/// Merges REST snapshots, full history fetches, push events and optimistic
/// local writes into one view per conversation. State is held as
/// `Arc<ConversationState>`; an operation that changes nothing leaves the
/// stored `Arc` (and its `messages` `Arc`) untouched so callers can detect
/// change with `Arc::ptr_eq`.
use crate::messenger_types::{ConversationSnapshot, Message, MessageId, ParticipantId};
use crate::normalizer::{self, aliases, NormalizeOverrides, DEFAULT_MIME_TYPE};
use crate::realtime::protocol::PushEvent;
use lru::LruCache;
use serde_json::Value;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

pub const DEFAULT_LEDGER_CAPACITY: usize = 5_000;

/// Message-id keys that mark a conversation update as carrying a message.
/// A bare `id` is excluded there, it usually names the conversation.
const UPDATE_MESSAGE_ID: &[&str] = &["message_id", "MessageID", "MessageId"];

/// State of one conversation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationState {
    /// Chronological; message ids are unique when present
    pub messages: Arc<Vec<Message>>,
    /// Never decreases for the lifetime of the conversation
    pub last_read: Option<MessageId>,
    /// Explicit count from the server, if any
    pub unread_count: Option<u32>,
    pub blocked: bool,
}

impl ConversationState {
    /// Last message in the list
    pub fn latest_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Explicit count when the server supplied one, otherwise computed
    pub fn derived_unread(&self, current_user: Option<&ParticipantId>) -> u32 {
        self.unread_count
            .unwrap_or_else(|| compute_unread(self, self.last_read.as_ref(), current_user))
    }
}

/// Count confirmed messages from other participants newer than `last_read`.
///
/// With no `last_read` every such message counts.
pub fn compute_unread(
    conversation: &ConversationState,
    last_read: Option<&MessageId>,
    current_user: Option<&ParticipantId>,
) -> u32 {
    let count = conversation
        .messages
        .iter()
        .filter(|m| !m.pending)
        .filter(|m| match (current_user, m.sender_id.as_ref()) {
            (Some(me), Some(sender)) => me != sender,
            _ => true,
        })
        .filter(|m| match (m.message_id.as_ref(), last_read) {
            (Some(id), Some(read)) => id > read,
            (Some(_), None) => true,
            (None, _) => false,
        })
        .count();
    count.min(u32::MAX as usize) as u32
}

/// Bounded ledger of message ids already applied
struct ProcessedIds {
    cache: LruCache<MessageId, ()>,
}

impl ProcessedIds {
    fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(capacity),
        }
    }

    fn contains(&self, id: &MessageId) -> bool {
        self.cache.contains(id)
    }

    fn record(&mut self, id: MessageId) {
        self.cache.put(id, ());
    }

    fn clear(&mut self) {
        self.cache.clear();
    }

    fn len(&self) -> usize {
        self.cache.len()
    }
}

/// Reducer holding every known conversation
pub struct ConversationStore {
    conversations: HashMap<String, Arc<ConversationState>>,
    processed: ProcessedIds,
    current_user: Option<ParticipantId>,
    active_conversation: Option<String>,
    revision: u64,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new(DEFAULT_LEDGER_CAPACITY)
    }
}

impl ConversationStore {
    /// Create a store whose processed-id ledger holds at most `ledger_capacity` ids
    pub fn new(ledger_capacity: usize) -> Self {
        Self {
            conversations: HashMap::new(),
            processed: ProcessedIds::new(ledger_capacity),
            current_user: None,
            active_conversation: None,
            revision: 0,
        }
    }

    pub fn get(&self, conversation_id: &str) -> Option<Arc<ConversationState>> {
        self.conversations.get(conversation_id).cloned()
    }

    pub fn conversation_ids(&self) -> Vec<String> {
        self.conversations.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    /// Bumped on every state change, untouched by no-ops
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn processed_len(&self) -> usize {
        self.processed.len()
    }

    pub fn is_processed(&self, message_id: &MessageId) -> bool {
        self.processed.contains(message_id)
    }

    pub fn set_current_user(&mut self, user: Option<ParticipantId>) {
        self.current_user = user;
    }

    pub fn current_user(&self) -> Option<&ParticipantId> {
        self.current_user.as_ref()
    }

    /// Select the conversation the user has open. Returns true if the selection changed.
    pub fn set_active_conversation(&mut self, conversation_id: Option<String>) -> bool {
        if self.active_conversation == conversation_id {
            return false;
        }
        self.active_conversation = conversation_id;
        self.revision += 1;
        true
    }

    pub fn active_conversation(&self) -> Option<&str> {
        self.active_conversation.as_deref()
    }

    /// Unread count as the UI should show it; the open conversation always reads 0
    pub fn unread_count(&self, conversation_id: &str) -> u32 {
        if self.active_conversation.as_deref() == Some(conversation_id) {
            return 0;
        }
        self.conversations
            .get(conversation_id)
            .map(|c| c.derived_unread(self.current_user.as_ref()))
            .unwrap_or(0)
    }

    /// Merge REST-derived summaries. Returns the ids whose state changed.
    pub fn hydrate(&mut self, snapshots: &[ConversationSnapshot]) -> Vec<String> {
        let mut changed = Vec::new();

        for snapshot in snapshots {
            let existing = self.conversations.get(&snapshot.id).cloned();
            let is_new = existing.is_none();
            let current = existing.unwrap_or_default();
            let mut next = (*current).clone();
            let mut dirty = false;

            if let Some(raw) = &snapshot.messages {
                let messages = self.history_messages(&current, &snapshot.id, raw);
                if *current.messages != messages {
                    next.messages = Arc::new(messages);
                    dirty = true;
                }
            }

            if let Some(last_read) = &snapshot.last_read {
                if current.last_read.as_ref().map_or(true, |cur| last_read > cur) {
                    next.last_read = Some(last_read.clone());
                    dirty = true;
                }
            }

            if snapshot.unread_count.is_some() && snapshot.unread_count != current.unread_count {
                next.unread_count = snapshot.unread_count;
                dirty = true;
            }

            if let Some(blocked) = snapshot.blocked {
                if blocked != current.blocked {
                    next.blocked = blocked;
                    dirty = true;
                }
            }

            if dirty || is_new {
                self.commit(&snapshot.id, next);
                changed.push(snapshot.id.clone());
            }
        }

        changed
    }

    /// Replace the message list with a full history fetch.
    ///
    /// Every id is recorded as processed so a later push echo is ignored.
    /// Optimistic messages the history does not echo stay at the end.
    pub fn set_history(&mut self, conversation_id: &str, raw_messages: &[Value]) -> bool {
        let current = self.conversations.get(conversation_id).cloned().unwrap_or_default();
        let messages = self.history_messages(&current, conversation_id, raw_messages);

        if *current.messages == messages && self.conversations.contains_key(conversation_id) {
            return false;
        }

        let mut next = (*current).clone();
        next.messages = Arc::new(messages);
        self.commit(conversation_id, next);
        true
    }

    /// Append an optimistic message shown before the server confirms it
    pub fn add_local_message(&mut self, conversation_id: &str, raw: &Value) -> Message {
        let mut message = normalizer::normalize(conversation_id, raw, &NormalizeOverrides::optimistic());
        message.message_id = None;
        if message.sender_id.is_none() {
            message.sender_id = self.current_user.clone();
        }
        if message.client_msg_id.is_none() {
            message.client_msg_id = Some(Uuid::new_v4().to_string());
        }

        let current = self.conversations.get(conversation_id).cloned().unwrap_or_default();
        let mut messages = (*current.messages).clone();
        messages.push(message.clone());

        let mut next = (*current).clone();
        next.messages = Arc::new(messages);
        self.commit(conversation_id, next);
        message
    }

    /// Apply a pushed `message` event
    pub fn process_incoming_message(&mut self, event: &PushEvent) -> bool {
        let Some(conversation_id) = event.conversation_id.as_deref() else {
            debug!("Dropping message event without conversation id");
            return false;
        };

        let message = normalizer::normalize(conversation_id, &event.payload, &NormalizeOverrides::default());
        let current = self.conversations.get(conversation_id).cloned();
        let is_new = current.is_none();
        let current = current.unwrap_or_default();

        match self.upsert_message(&current, message) {
            Some(messages) => {
                let mut next = (*current).clone();
                next.messages = messages;
                self.commit(conversation_id, next);
                true
            }
            None if is_new => {
                self.commit(conversation_id, ConversationState::default());
                true
            }
            None => false,
        }
    }

    /// Apply a pushed `conversation_updated` event
    pub fn process_conversation_update(&mut self, event: &PushEvent) -> bool {
        let Some(conversation_id) = event.conversation_id.as_deref() else {
            debug!("Dropping conversation update without conversation id");
            return false;
        };

        let existing = self.conversations.get(conversation_id).cloned();
        let is_new = existing.is_none();
        let current = existing.unwrap_or_default();
        let mut next = (*current).clone();
        let mut dirty = false;

        if let Some(raw) = embedded_message(&event.payload) {
            let message = normalizer::normalize(conversation_id, raw, &NormalizeOverrides::default());
            if let Some(messages) = self.upsert_message(&current, message) {
                next.messages = messages;
                dirty = true;
            }
        }

        if let Some(last_read) = normalizer::first_string(&event.payload, aliases::LAST_READ).map(MessageId::from) {
            if current.last_read.as_ref().map_or(true, |cur| &last_read > cur) {
                next.last_read = Some(last_read);
                dirty = true;
            }
        }

        let unread = normalizer::first_present(&event.payload, aliases::UNREAD_COUNT)
            .and_then(normalizer::parse_count);
        if unread.is_some() && unread != current.unread_count {
            next.unread_count = unread;
            dirty = true;
        }

        if dirty || is_new {
            self.commit(conversation_id, next);
        }
        dirty || is_new
    }

    /// Apply a pushed `read` receipt
    pub fn process_read_receipt(&mut self, event: &PushEvent) -> bool {
        let Some(conversation_id) = event.conversation_id.as_deref() else {
            debug!("Dropping read receipt without conversation id");
            return false;
        };
        let read_id = normalizer::first_string(&event.payload, aliases::LAST_READ)
            .or_else(|| normalizer::first_string(&event.payload, aliases::MESSAGE_ID));
        let Some(read_id) = read_id.map(MessageId::from) else {
            debug!("Read receipt for {} carries no message id", conversation_id);
            return false;
        };
        self.raise_last_read(conversation_id, read_id, false)
    }

    /// Optimistically mark a conversation read up to `message_id`.
    ///
    /// The caller emits the outbound `read` frame.
    pub fn mark_read(&mut self, conversation_id: &str, message_id: MessageId) -> bool {
        self.raise_last_read(conversation_id, message_id, true)
    }

    pub fn set_blocked(&mut self, conversation_id: &str, blocked: bool) -> bool {
        let current = self.conversations.get(conversation_id).cloned().unwrap_or_default();
        if current.blocked == blocked && self.conversations.contains_key(conversation_id) {
            return false;
        }
        let mut next = (*current).clone();
        next.blocked = blocked;
        self.commit(conversation_id, next);
        true
    }

    /// Wipe all conversations, the processed ledger and the open selection
    pub fn reset(&mut self) {
        self.conversations.clear();
        self.processed.clear();
        self.active_conversation = None;
        self.revision += 1;
    }

    fn raise_last_read(&mut self, conversation_id: &str, read_id: MessageId, clear_unread: bool) -> bool {
        let current = self.conversations.get(conversation_id).cloned().unwrap_or_default();
        if current.last_read.as_ref().is_some_and(|cur| &read_id <= cur) {
            return false;
        }
        let mut next = (*current).clone();
        next.last_read = Some(read_id);
        if clear_unread {
            next.unread_count = None;
        }
        self.commit(conversation_id, next);
        true
    }

    /// Reconcile one server message into the list. `None` when nothing changed.
    fn upsert_message(&mut self, current: &ConversationState, message: Message) -> Option<Arc<Vec<Message>>> {
        if let Some(id) = &message.message_id {
            if self.processed.contains(id) {
                debug!("Message {} already processed, ignoring re-delivery", id);
                return None;
            }
            self.processed.record(id.clone());
        }

        let existing_idx = message
            .message_id
            .as_ref()
            .and_then(|id| current.messages.iter().position(|m| m.message_id.as_ref() == Some(id)));

        if let Some(idx) = existing_idx {
            let merged = merge_message(&current.messages[idx], message);
            if merged == current.messages[idx] {
                return None;
            }
            let mut messages = (*current.messages).clone();
            messages[idx] = merged;
            return Some(Arc::new(messages));
        }

        let mut messages = (*current.messages).clone();
        match find_placeholder(&messages, &message) {
            Some(idx) if message.message_id.is_none() => {
                // No server id yet: the placeholder stays pending
                let mut merged = merge_message(&messages[idx], message);
                merged.pending = true;
                if merged == messages[idx] {
                    return None;
                }
                messages[idx] = merged;
            }
            Some(idx) => {
                debug!("Confirmed optimistic message in {}", message.conversation_id);
                let mut confirmed = message;
                if confirmed.client_msg_id.is_none() {
                    confirmed.client_msg_id = messages[idx].client_msg_id.clone();
                }
                confirmed.pending = false;
                messages[idx] = confirmed;
            }
            None => messages.push(message),
        }
        Some(Arc::new(messages))
    }

    /// Normalize a REST page: ids deduplicated and recorded as processed,
    /// then the optimistic messages it does not echo appended.
    fn history_messages(&mut self, current: &ConversationState, conversation_id: &str, raw: &[Value]) -> Vec<Message> {
        let mut messages = dedupe_by_id(normalizer::normalize_history(conversation_id, raw));
        for id in messages.iter().filter_map(|m| m.message_id.clone()) {
            self.processed.record(id);
        }

        let still_pending: Vec<Message> = current
            .messages
            .iter()
            .filter(|m| m.pending)
            .filter(|m| {
                !messages
                    .iter()
                    .any(|h| h.client_msg_id.is_some() && h.client_msg_id == m.client_msg_id)
            })
            .cloned()
            .collect();
        messages.extend(still_pending);
        messages
    }

    fn commit(&mut self, conversation_id: &str, state: ConversationState) {
        self.conversations
            .insert(conversation_id.to_string(), Arc::new(state));
        self.revision += 1;
    }
}

/// Collapse repeated message ids. The last copy wins and takes the slot of the first.
fn dedupe_by_id(messages: Vec<Message>) -> Vec<Message> {
    let mut slots: HashMap<MessageId, usize> = HashMap::new();
    let mut out: Vec<Message> = Vec::with_capacity(messages.len());
    for message in messages {
        match message.message_id.as_ref().and_then(|id| slots.get(id).copied()) {
            Some(idx) => out[idx] = message,
            None => {
                if let Some(id) = &message.message_id {
                    slots.insert(id.clone(), out.len());
                }
                out.push(message);
            }
        }
    }
    out
}

/// The message carried by a conversation update, if any
fn embedded_message(payload: &Value) -> Option<&Value> {
    let unwrapped = normalizer::unwrap_message_payload(payload);
    if !std::ptr::eq(unwrapped, payload) {
        return Some(unwrapped);
    }
    normalizer::first_present(payload, UPDATE_MESSAGE_ID).map(|_| payload)
}

/// Locate the optimistic placeholder an incoming message confirms.
///
/// `client_msg_id` wins; otherwise the oldest pending message with the same
/// sender and identical body. Two identical in-flight bodies from one sender
/// cannot be told apart by that fallback; the oldest is taken.
fn find_placeholder(messages: &[Message], incoming: &Message) -> Option<usize> {
    if let Some(client_id) = &incoming.client_msg_id {
        if let Some(idx) = messages
            .iter()
            .position(|m| m.pending && m.client_msg_id.as_ref() == Some(client_id))
        {
            return Some(idx);
        }
    }

    messages.iter().position(|m| {
        m.pending
            && m.body == incoming.body
            && match (&m.sender_id, &incoming.sender_id) {
                (Some(a), Some(b)) => a == b,
                (None, _) => true,
                (Some(_), None) => false,
            }
    })
}

/// Field-by-field merge; absent incoming fields keep the stored value
fn merge_message(existing: &Message, incoming: Message) -> Message {
    Message {
        conversation_id: existing.conversation_id.clone(),
        message_id: incoming.message_id.or_else(|| existing.message_id.clone()),
        client_msg_id: incoming.client_msg_id.or_else(|| existing.client_msg_id.clone()),
        sender_id: incoming.sender_id.or_else(|| existing.sender_id.clone()),
        receiver_id: incoming.receiver_id.or_else(|| existing.receiver_id.clone()),
        body: if incoming.body.is_empty() {
            existing.body.clone()
        } else {
            incoming.body
        },
        mime_type: if incoming.mime_type == DEFAULT_MIME_TYPE {
            existing.mime_type.clone()
        } else {
            incoming.mime_type
        },
        timestamp: incoming.timestamp.or(existing.timestamp),
        pending: false,
    }
}
