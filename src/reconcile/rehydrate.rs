//! Rehydration: restart participants of active conversations that have no
//! live session, and restore their read cursor from persisted state.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::dispatch::commands::{self, CreateAgentPayload};
use crate::error::StoreError;
use crate::registry::AgentRegistry;
use crate::store::{ActionQueue, ConversationStore, StateStore};

const ACTOR: &str = "rehydrator";

pub struct RehydrationReconciler {
    conversations: Arc<dyn ConversationStore>,
    state: Arc<dyn StateStore>,
    queue: Arc<dyn ActionQueue>,
    registry: Arc<AgentRegistry>,
    poll_interval: Duration,
    /// Sessions already queued for restart, so a slow dispatcher does not
    /// get the same create twice.
    handled: HashSet<String>,
}

impl RehydrationReconciler {
    pub fn new(
        conversations: Arc<dyn ConversationStore>,
        state: Arc<dyn StateStore>,
        queue: Arc<dyn ActionQueue>,
        registry: Arc<AgentRegistry>,
        config: &RuntimeConfig,
    ) -> Self {
        Self {
            conversations,
            state,
            queue,
            registry,
            poll_interval: config.rehydrate_interval,
            handled: HashSet::new(),
        }
    }

    pub async fn run(mut self) {
        info!(interval = ?self.poll_interval, "rehydration reconciler started");
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = self.poll_once().await {
                warn!(error = %err, "rehydration sweep failed");
            }
        }
    }

    /// One sweep over active conversations.
    pub async fn poll_once(&mut self) -> Result<(), StoreError> {
        for conversation in self.conversations.list_active_conversations().await? {
            let participants = self
                .conversations
                .list_participants(conversation.conversation_id)
                .await?;
            for participant in participants {
                if self.handled.contains(&participant.session_id)
                    || self.registry.is_live(&participant.session_id).await
                {
                    continue;
                }

                let persona_config = match &participant.persona_config {
                    Value::Object(map) => Some(map.clone()),
                    _ => None,
                };
                commands::enqueue_create_agent(
                    self.queue.as_ref(),
                    ACTOR,
                    CreateAgentPayload {
                        agent_id: participant.agent_id.clone(),
                        agent_type: Some("persona".into()),
                        session_id: Some(participant.session_id.clone()),
                        conversation_id: Some(conversation.conversation_id),
                        persona_config,
                        initial_subject: None,
                        loop_interval_ms: None,
                    },
                )
                .await?;

                // Restore the read cursor so the restarted agent does not
                // re-reply to messages it already handled.
                let snapshot = self
                    .state
                    .get(&participant.agent_id, Some(participant.session_id.as_str()))
                    .await?;
                if let Some(last_seen) = snapshot
                    .as_ref()
                    .and_then(|s| s.context.get("last_seen_iso"))
                    .and_then(Value::as_str)
                {
                    commands::enqueue_interrupt(
                        self.queue.as_ref(),
                        ACTOR,
                        Some(participant.agent_id.as_str()),
                        Some(participant.session_id.as_str()),
                        json!({"type": "rehydrate", "last_seen_iso": last_seen}),
                    )
                    .await?;
                }

                self.handled.insert(participant.session_id.clone());
                debug!(
                    agent_id = %participant.agent_id,
                    session_id = %participant.session_id,
                    conversation_id = %conversation.conversation_id,
                    "rehydration queued"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    use crate::store::{
        AgentStatus, MemoryStore, Participant, StateUpdate, Stores,
    };
    use crate::tools::ToolRegistry;

    #[tokio::test]
    async fn dead_participants_are_queued_for_restart_with_cursor() {
        let store = Arc::new(MemoryStore::new());
        let stores = Stores {
            actions: store.clone(),
            state: store.clone(),
            steps: store.clone(),
            conversations: store.clone(),
            messages: store.clone(),
        };
        let registry = Arc::new(AgentRegistry::new(
            stores,
            Arc::new(ToolRegistry::with_builtins()),
            RuntimeConfig::default(),
        ));

        let conversation = store.create_conversation("room").await.unwrap();
        store
            .add_participant_if_absent(Participant {
                conversation_id: conversation.conversation_id,
                agent_id: "pia".into(),
                session_id: "pia-s1".into(),
                persona_config: json!({"name": "Pia"}),
                joined_at: Utc::now(),
            })
            .await
            .unwrap();
        let mut context = serde_json::Map::new();
        context.insert("last_seen_iso".into(), json!("2026-08-01T10:00:00+00:00"));
        store
            .upsert(
                "pia",
                Some("pia-s1"),
                StateUpdate::status(AgentStatus::Stopped).with_context(context),
            )
            .await
            .unwrap();

        let mut reconciler = RehydrationReconciler::new(
            store.clone(),
            store.clone(),
            store.clone(),
            registry,
            &RuntimeConfig::default(),
        );
        reconciler.poll_once().await.unwrap();
        // The second sweep must not duplicate the restart.
        reconciler.poll_once().await.unwrap();

        let actions = store.fetch_unprocessed().await.unwrap();
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].action_type, commands::CREATE_AGENT);
        assert_eq!(actions[0].payload["session_id"], json!("pia-s1"));
        assert_eq!(actions[0].payload["agent_type"], json!("persona"));
        assert_eq!(actions[1].action_type, commands::INTERRUPT_AGENT);
        assert_eq!(actions[1].payload["guidance"]["type"], json!("rehydrate"));
        assert_eq!(
            actions[1].payload["guidance"]["last_seen_iso"],
            json!("2026-08-01T10:00:00+00:00")
        );
    }
}
