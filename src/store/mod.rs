//! Storage abstraction layer.
//!
//! The concrete durable engine is an external collaborator; the runtime only
//! depends on these traits. [`MemoryStore`] implements all of them and backs
//! the tests and the default binary wiring.

mod memory;

pub use memory::MemoryStore;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::agent::OutcomeStatus;
use crate::error::StoreError;

/// A persisted command consumed by the action dispatcher.
///
/// Actions are append-only; the core only ever flips `processed` to true.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub action_id: Uuid,
    #[serde(rename = "type")]
    pub action_type: String,
    pub actor: String,
    pub payload: Value,
    pub session_id: Option<String>,
    pub processed: bool,
    pub created_at: DateTime<Utc>,
}

impl Action {
    pub fn new(action_type: impl Into<String>, actor: impl Into<String>, payload: Value) -> Self {
        Self {
            action_id: Uuid::new_v4(),
            action_type: action_type.into(),
            actor: actor.into(),
            payload,
            session_id: None,
            processed: false,
            created_at: Utc::now(),
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// Lifecycle status of an agent session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Starting,
    Running,
    Paused,
    Stopping,
    Stopped,
    Error,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Latest persisted snapshot of an agent session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStateSnapshot {
    pub agent_id: String,
    pub session_id: Option<String>,
    pub status: AgentStatus,
    pub iteration: u64,
    pub result: Option<String>,
    pub context: Map<String, Value>,
    pub history: Option<Value>,
    pub updated_at: DateTime<Utc>,
}

/// Partial update applied by [`StateStore::upsert`]. `None` fields are left
/// untouched.
#[derive(Debug, Clone, Default)]
pub struct StateUpdate {
    pub status: Option<AgentStatus>,
    pub iteration: Option<u64>,
    pub result: Option<String>,
    /// Merged into the stored context per key.
    pub context: Option<Map<String, Value>>,
    pub history: Option<Value>,
}

impl StateUpdate {
    pub fn status(status: AgentStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = Some(context);
        self
    }
}

/// One persisted loop iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub agent_id: String,
    pub session_id: String,
    pub iteration: u64,
    pub status: OutcomeStatus,
    pub text: Option<String>,
    pub data: Option<Value>,
    pub state: Option<Value>,
    pub guidance: Option<Value>,
    pub notes: Option<String>,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Status of a shared conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Active,
    Ended,
    Archived,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub conversation_id: Uuid,
    pub title: String,
    pub status: ConversationStatus,
    pub created_at: DateTime<Utc>,
}

/// An agent session enrolled in a conversation. Unique per
/// (conversation_id, agent_id, session_id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub conversation_id: Uuid,
    pub agent_id: String,
    pub session_id: String,
    pub persona_config: Value,
    pub joined_at: DateTime<Utc>,
}

/// An append-only conversation message. `created_at` doubles as the fan-out
/// cursor, so the store keeps it monotonic per conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: Uuid,
    pub conversation_id: Uuid,
    pub author_id: String,
    pub role: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub reply_to: Option<Uuid>,
    pub meta: Value,
}

/// Fields for appending a message; id and timestamp are store-assigned.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: Uuid,
    pub author_id: String,
    pub role: String,
    pub text: String,
    pub reply_to: Option<Uuid>,
    pub meta: Value,
}

/// Durable command queue. At-least-once fetch semantics; the dispatcher's
/// in-flight set compensates for overlapping polls.
#[async_trait]
pub trait ActionQueue: Send + Sync {
    async fn enqueue(&self, action: Action) -> Result<(), StoreError>;

    /// Fetch all unprocessed actions in creation order.
    async fn fetch_unprocessed(&self) -> Result<Vec<Action>, StoreError>;

    async fn mark_processed(&self, action_id: Uuid) -> Result<(), StoreError>;
}

/// Agent/session state store.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn upsert(
        &self,
        agent_id: &str,
        session_id: Option<&str>,
        update: StateUpdate,
    ) -> Result<(), StoreError>;

    /// Latest snapshot; with no session id, the most recently updated
    /// snapshot for the agent.
    async fn get(
        &self,
        agent_id: &str,
        session_id: Option<&str>,
    ) -> Result<Option<AgentStateSnapshot>, StoreError>;
}

/// Append-only step history store.
#[async_trait]
pub trait StepStore: Send + Sync {
    async fn append(&self, step: StepRecord) -> Result<(), StoreError>;

    async fn list(&self, agent_id: &str, session_id: &str)
    -> Result<Vec<StepRecord>, StoreError>;
}

/// Conversation and participant store.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create_conversation(&self, title: &str) -> Result<Conversation, StoreError>;

    async fn set_status(
        &self,
        conversation_id: Uuid,
        status: ConversationStatus,
    ) -> Result<(), StoreError>;

    /// Insert-if-absent. Returns true when a new row was inserted.
    async fn add_participant_if_absent(&self, participant: Participant)
    -> Result<bool, StoreError>;

    async fn list_participants(
        &self,
        conversation_id: Uuid,
    ) -> Result<Vec<Participant>, StoreError>;

    async fn list_active_conversations(&self) -> Result<Vec<Conversation>, StoreError>;
}

/// Message store.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn append_message(&self, message: NewMessage) -> Result<Message, StoreError>;

    /// Messages in one conversation strictly newer than the cursor, oldest
    /// first. With no cursor, from the beginning.
    async fn list_messages_since(
        &self,
        conversation_id: Uuid,
        cursor: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError>;

    /// Messages across all conversations strictly newer than the cursor,
    /// oldest first. Used by the fan-out reconciler.
    async fn list_new_messages(
        &self,
        cursor: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError>;

    /// Timestamp of the newest message anywhere, for cursor bootstrap.
    async fn latest_message_at(&self) -> Result<Option<DateTime<Utc>>, StoreError>;
}

/// The store handles the runtime is wired with.
#[derive(Clone)]
pub struct Stores {
    pub actions: Arc<dyn ActionQueue>,
    pub state: Arc<dyn StateStore>,
    pub steps: Arc<dyn StepStore>,
    pub conversations: Arc<dyn ConversationStore>,
    pub messages: Arc<dyn MessageStore>,
}

impl Stores {
    /// All five stores backed by one shared in-memory instance.
    pub fn in_memory() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            actions: store.clone(),
            state: store.clone(),
            steps: store.clone(),
            conversations: store.clone(),
            messages: store,
        }
    }
}
