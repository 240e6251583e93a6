//! In-memory store backing tests and the default binary wiring.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreError;

use super::{
    Action, ActionQueue, AgentStateSnapshot, AgentStatus, Conversation, ConversationStatus,
    ConversationStore, Message, MessageStore, NewMessage, Participant, StateStore, StateUpdate,
    StepRecord, StepStore,
};

#[derive(Default)]
struct Inner {
    actions: Vec<Action>,
    // keyed by (agent_id, session_id)
    state: HashMap<(String, Option<String>), AgentStateSnapshot>,
    steps: Vec<StepRecord>,
    conversations: HashMap<Uuid, Conversation>,
    participants: Vec<Participant>,
    messages: Vec<Message>,
    last_message_at: Option<DateTime<Utc>>,
}

/// One shared instance implements every store trait.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ActionQueue for MemoryStore {
    async fn enqueue(&self, action: Action) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.actions.push(action);
        Ok(())
    }

    async fn fetch_unprocessed(&self) -> Result<Vec<Action>, StoreError> {
        let inner = self.inner.read().await;
        let mut out: Vec<Action> = inner
            .actions
            .iter()
            .filter(|a| !a.processed)
            .cloned()
            .collect();
        out.sort_by_key(|a| a.created_at);
        Ok(out)
    }

    async fn mark_processed(&self, action_id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if let Some(action) = inner.actions.iter_mut().find(|a| a.action_id == action_id) {
            action.processed = true;
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn upsert(
        &self,
        agent_id: &str,
        session_id: Option<&str>,
        update: StateUpdate,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let key = (agent_id.to_string(), session_id.map(String::from));
        let snapshot = inner.state.entry(key).or_insert_with(|| AgentStateSnapshot {
            agent_id: agent_id.to_string(),
            session_id: session_id.map(String::from),
            status: AgentStatus::Starting,
            iteration: 0,
            result: None,
            context: Default::default(),
            history: None,
            updated_at: Utc::now(),
        });
        if let Some(status) = update.status {
            snapshot.status = status;
        }
        if let Some(iteration) = update.iteration {
            snapshot.iteration = iteration;
        }
        if let Some(result) = update.result {
            snapshot.result = Some(result);
        }
        if let Some(context) = update.context {
            // Merged per key so a partial writer (for example the guidance
            // breadcrumb) cannot wipe the engine's snapshot.
            for (k, v) in context {
                snapshot.context.insert(k, v);
            }
        }
        if let Some(history) = update.history {
            snapshot.history = Some(history);
        }
        snapshot.updated_at = Utc::now();
        Ok(())
    }

    async fn get(
        &self,
        agent_id: &str,
        session_id: Option<&str>,
    ) -> Result<Option<AgentStateSnapshot>, StoreError> {
        let inner = self.inner.read().await;
        match session_id {
            Some(sid) => Ok(inner
                .state
                .get(&(agent_id.to_string(), Some(sid.to_string())))
                .cloned()),
            None => Ok(inner
                .state
                .values()
                .filter(|s| s.agent_id == agent_id)
                .max_by_key(|s| s.updated_at)
                .cloned()),
        }
    }
}

#[async_trait]
impl StepStore for MemoryStore {
    async fn append(&self, step: StepRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.steps.push(step);
        Ok(())
    }

    async fn list(
        &self,
        agent_id: &str,
        session_id: &str,
    ) -> Result<Vec<StepRecord>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .steps
            .iter()
            .filter(|s| s.agent_id == agent_id && s.session_id == session_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn create_conversation(&self, title: &str) -> Result<Conversation, StoreError> {
        let conversation = Conversation {
            conversation_id: Uuid::new_v4(),
            title: title.to_string(),
            status: ConversationStatus::Active,
            created_at: Utc::now(),
        };
        let mut inner = self.inner.write().await;
        inner
            .conversations
            .insert(conversation.conversation_id, conversation.clone());
        Ok(conversation)
    }

    async fn set_status(
        &self,
        conversation_id: Uuid,
        status: ConversationStatus,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let conversation = inner
            .conversations
            .get_mut(&conversation_id)
            .ok_or_else(|| StoreError::NotFound(format!("conversation {conversation_id}")))?;
        conversation.status = status;
        Ok(())
    }

    async fn add_participant_if_absent(
        &self,
        participant: Participant,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        let exists = inner.participants.iter().any(|p| {
            p.conversation_id == participant.conversation_id
                && p.agent_id == participant.agent_id
                && p.session_id == participant.session_id
        });
        if exists {
            return Ok(false);
        }
        inner.participants.push(participant);
        Ok(true)
    }

    async fn list_participants(
        &self,
        conversation_id: Uuid,
    ) -> Result<Vec<Participant>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .participants
            .iter()
            .filter(|p| p.conversation_id == conversation_id)
            .cloned()
            .collect())
    }

    async fn list_active_conversations(&self) -> Result<Vec<Conversation>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .conversations
            .values()
            .filter(|c| c.status == ConversationStatus::Active)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn append_message(&self, message: NewMessage) -> Result<Message, StoreError> {
        let mut inner = self.inner.write().await;
        // Timestamps are the fan-out cursor, so keep them strictly monotonic
        // even when two appends land in the same clock tick.
        let mut created_at = Utc::now();
        if let Some(last) = inner.last_message_at {
            if created_at <= last {
                created_at = last + ChronoDuration::milliseconds(1);
            }
        }
        inner.last_message_at = Some(created_at);
        let message = Message {
            message_id: Uuid::new_v4(),
            conversation_id: message.conversation_id,
            author_id: message.author_id,
            role: message.role,
            text: message.text,
            created_at,
            reply_to: message.reply_to,
            meta: message.meta,
        };
        inner.messages.push(message.clone());
        Ok(message)
    }

    async fn list_messages_since(
        &self,
        conversation_id: Uuid,
        cursor: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let inner = self.inner.read().await;
        let mut out: Vec<Message> = inner
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .filter(|m| cursor.is_none_or(|c| m.created_at > c))
            .cloned()
            .collect();
        out.sort_by_key(|m| m.created_at);
        out.truncate(limit);
        Ok(out)
    }

    async fn list_new_messages(
        &self,
        cursor: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let inner = self.inner.read().await;
        let mut out: Vec<Message> = inner
            .messages
            .iter()
            .filter(|m| cursor.is_none_or(|c| m.created_at > c))
            .cloned()
            .collect();
        out.sort_by_key(|m| m.created_at);
        out.truncate(limit);
        Ok(out)
    }

    async fn latest_message_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.last_message_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn mark_processed_removes_action_from_fetch() {
        let store = MemoryStore::new();
        let action = Action::new("agent_pause", "test", json!({"agent_id": "a"}));
        let id = action.action_id;
        store.enqueue(action).await.unwrap();

        assert_eq!(store.fetch_unprocessed().await.unwrap().len(), 1);
        assert_ok!(store.mark_processed(id).await);
        assert!(store.fetch_unprocessed().await.unwrap().is_empty());
        // Marking an id that is not queued is tolerated.
        assert_ok!(store.mark_processed(Uuid::new_v4()).await);
    }

    #[tokio::test]
    async fn state_get_without_session_returns_latest() {
        let store = MemoryStore::new();
        store
            .upsert("a", Some("s1"), StateUpdate::status(AgentStatus::Stopped))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store
            .upsert("a", Some("s2"), StateUpdate::status(AgentStatus::Running))
            .await
            .unwrap();

        let snapshot = store.get("a", None).await.unwrap().unwrap();
        assert_eq!(snapshot.session_id.as_deref(), Some("s2"));
        assert_eq!(snapshot.status, AgentStatus::Running);
    }

    #[tokio::test]
    async fn participant_insert_is_idempotent() {
        let store = MemoryStore::new();
        let conversation = store.create_conversation("room").await.unwrap();
        let participant = Participant {
            conversation_id: conversation.conversation_id,
            agent_id: "a".into(),
            session_id: "s1".into(),
            persona_config: json!({}),
            joined_at: Utc::now(),
        };
        assert!(store
            .add_participant_if_absent(participant.clone())
            .await
            .unwrap());
        assert!(!store.add_participant_if_absent(participant).await.unwrap());
        assert_eq!(
            store
                .list_participants(conversation.conversation_id)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn message_timestamps_are_strictly_increasing() {
        let store = MemoryStore::new();
        let conversation = store.create_conversation("room").await.unwrap();
        let mut prev: Option<DateTime<Utc>> = None;
        for i in 0..5 {
            let message = store
                .append_message(NewMessage {
                    conversation_id: conversation.conversation_id,
                    author_id: "a".into(),
                    role: "user".into(),
                    text: format!("m{i}"),
                    reply_to: None,
                    meta: json!({}),
                })
                .await
                .unwrap();
            if let Some(p) = prev {
                assert!(message.created_at > p);
            }
            prev = Some(message.created_at);
        }
    }

    #[tokio::test]
    async fn cursor_filters_are_strict() {
        let store = MemoryStore::new();
        let conversation = store.create_conversation("room").await.unwrap();
        let first = store
            .append_message(NewMessage {
                conversation_id: conversation.conversation_id,
                author_id: "a".into(),
                role: "user".into(),
                text: "one".into(),
                reply_to: None,
                meta: json!({}),
            })
            .await
            .unwrap();
        let second = store
            .append_message(NewMessage {
                conversation_id: conversation.conversation_id,
                author_id: "b".into(),
                role: "user".into(),
                text: "two".into(),
                reply_to: None,
                meta: json!({}),
            })
            .await
            .unwrap();

        let newer = store
            .list_messages_since(conversation.conversation_id, Some(first.created_at), 10)
            .await
            .unwrap();
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].message_id, second.message_id);

        let none = store
            .list_new_messages(Some(second.created_at), 10)
            .await
            .unwrap();
        assert!(none.is_empty());
    }
}
