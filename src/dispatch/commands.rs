//! Action types, payload shapes, and producer helpers.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::{Action, ActionQueue};

pub const CREATE_AGENT: &str = "create_agent";
pub const DESTROY_AGENT: &str = "agent_destroy";
pub const PAUSE_AGENT: &str = "agent_pause";
pub const RESUME_AGENT: &str = "agent_resume";
pub const INTERRUPT_AGENT: &str = "agent_interrupt";

pub fn is_known_action_type(action_type: &str) -> bool {
    matches!(
        action_type,
        CREATE_AGENT | DESTROY_AGENT | PAUSE_AGENT | RESUME_AGENT | INTERRUPT_AGENT
    )
}

/// Payload of a `create_agent` action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateAgentPayload {
    pub agent_id: String,
    #[serde(default)]
    pub agent_type: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<Uuid>,
    #[serde(default)]
    pub persona_config: Option<Map<String, Value>>,
    #[serde(default)]
    pub initial_subject: Option<String>,
    #[serde(default)]
    pub loop_interval_ms: Option<u64>,
}

impl CreateAgentPayload {
    /// Explicit type wins; otherwise a conversation implies a persona and
    /// anything else defaults to the joke behavior.
    pub fn effective_agent_type(&self) -> String {
        match &self.agent_type {
            Some(t) => t.clone(),
            None if self.conversation_id.is_some() => "persona".to_string(),
            None => "joke".to_string(),
        }
    }
}

/// Target reference for destroy/pause/resume actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRefPayload {
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Payload of an `agent_interrupt` action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterruptPayload {
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub guidance: Option<Value>,
}

/// Enqueue a create. Mints and returns the session id so the caller can
/// address the agent before the dispatcher picks the action up.
pub async fn enqueue_create_agent(
    queue: &dyn ActionQueue,
    actor: &str,
    mut payload: CreateAgentPayload,
) -> Result<String, StoreError> {
    let session_id = payload
        .session_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    payload.session_id = Some(session_id.clone());
    let action = Action::new(CREATE_AGENT, actor, serde_json::to_value(&payload)?)
        .with_session(session_id.clone());
    queue.enqueue(action).await?;
    Ok(session_id)
}

pub async fn enqueue_destroy(
    queue: &dyn ActionQueue,
    actor: &str,
    agent_id: Option<&str>,
    session_id: Option<&str>,
) -> Result<(), StoreError> {
    enqueue_ref(queue, DESTROY_AGENT, actor, agent_id, session_id).await
}

pub async fn enqueue_pause(
    queue: &dyn ActionQueue,
    actor: &str,
    agent_id: Option<&str>,
    session_id: Option<&str>,
) -> Result<(), StoreError> {
    enqueue_ref(queue, PAUSE_AGENT, actor, agent_id, session_id).await
}

pub async fn enqueue_resume(
    queue: &dyn ActionQueue,
    actor: &str,
    agent_id: Option<&str>,
    session_id: Option<&str>,
) -> Result<(), StoreError> {
    enqueue_ref(queue, RESUME_AGENT, actor, agent_id, session_id).await
}

pub async fn enqueue_interrupt(
    queue: &dyn ActionQueue,
    actor: &str,
    agent_id: Option<&str>,
    session_id: Option<&str>,
    guidance: Value,
) -> Result<(), StoreError> {
    let payload = json!({
        "agent_id": agent_id,
        "session_id": session_id,
        "guidance": guidance,
    });
    let mut action = Action::new(INTERRUPT_AGENT, actor, payload);
    if let Some(sid) = session_id {
        action = action.with_session(sid);
    }
    queue.enqueue(action).await
}

async fn enqueue_ref(
    queue: &dyn ActionQueue,
    action_type: &str,
    actor: &str,
    agent_id: Option<&str>,
    session_id: Option<&str>,
) -> Result<(), StoreError> {
    let payload = json!({
        "agent_id": agent_id,
        "session_id": session_id,
    });
    let mut action = Action::new(action_type, actor, payload);
    if let Some(sid) = session_id {
        action = action.with_session(sid);
    }
    queue.enqueue(action).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn agent_type_defaulting_follows_the_conversation() {
        let with_conversation = CreateAgentPayload {
            agent_id: "a".into(),
            agent_type: None,
            session_id: None,
            conversation_id: Some(Uuid::new_v4()),
            persona_config: None,
            initial_subject: None,
            loop_interval_ms: None,
        };
        assert_eq!(with_conversation.effective_agent_type(), "persona");

        let bare = CreateAgentPayload {
            conversation_id: None,
            ..with_conversation.clone()
        };
        assert_eq!(bare.effective_agent_type(), "joke");

        let explicit = CreateAgentPayload {
            agent_type: Some("persona".into()),
            ..bare
        };
        assert_eq!(explicit.effective_agent_type(), "persona");
    }

    #[tokio::test]
    async fn create_producer_mints_and_stamps_the_session() {
        let store = crate::store::MemoryStore::new();
        let session = enqueue_create_agent(
            &store,
            "test",
            CreateAgentPayload {
                agent_id: "a".into(),
                agent_type: Some("joke".into()),
                session_id: None,
                conversation_id: None,
                persona_config: None,
                initial_subject: None,
                loop_interval_ms: None,
            },
        )
        .await
        .unwrap();

        let actions = store.fetch_unprocessed().await.unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].action_type, CREATE_AGENT);
        assert_eq!(actions[0].session_id.as_deref(), Some(session.as_str()));
        assert_eq!(actions[0].payload["session_id"], json!(session));
    }
}
