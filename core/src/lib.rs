/// MatchLink messaging core - realtime conversation sync
///
/// Keeps one persistent push connection per session, normalizes loosely-shaped
/// server payloads, deduplicates optimistic sends against their echoes and
/// patches the REST conversation list with realtime facts.

pub mod error;
pub mod config;
pub mod messenger_types;
pub mod normalizer;
pub mod conversation_store;
pub mod realtime;
pub mod capability_gate;
pub mod reconciler;
pub mod api;
pub mod session;

pub use error::{Result, SyncError};
pub use config::Config;
pub use messenger_types::{ConnectionStatus, ConversationSnapshot, Message, MessageId, ParticipantId, StoreEvent};
pub use conversation_store::{ConversationState, ConversationStore};
pub use capability_gate::{AccountStatus, CapabilityGate, CapabilitySignals, GateTransition};
pub use reconciler::{ConversationList, ConversationListItem};
pub use api::{HttpApi, MessagingApi};
pub use session::MessagingSession;
