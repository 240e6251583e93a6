//! Durable action-queue dispatcher.
//!
//! Polls the queue, routes each unprocessed action to a registry operation
//! on its own task, and marks it processed when handling finishes. A shared
//! in-flight set keeps overlapping polls from double-dispatching an action
//! whose handler is still running.

pub mod commands;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::registry::{AgentRegistry, CreateAgentRequest};
use crate::store::{Action, ActionQueue};

use commands::{AgentRefPayload, CreateAgentPayload, InterruptPayload};

pub struct ActionDispatcher {
    queue: Arc<dyn ActionQueue>,
    registry: Arc<AgentRegistry>,
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
    poll_interval: Duration,
}

impl ActionDispatcher {
    pub fn new(
        queue: Arc<dyn ActionQueue>,
        registry: Arc<AgentRegistry>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            queue,
            registry,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            poll_interval,
        }
    }

    /// Poll forever. Fetch failures are logged and retried next interval.
    pub async fn run(&self) {
        info!(interval = ?self.poll_interval, "action dispatcher started");
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = self.poll_once().await {
                warn!(error = %err, "action poll failed");
            }
        }
    }

    /// One fetch-and-dispatch pass. Handlers run concurrently; this returns
    /// as soon as every fetched action is either spawned or skipped.
    pub async fn poll_once(&self) -> Result<(), crate::error::StoreError> {
        let actions = self.queue.fetch_unprocessed().await?;
        for action in actions {
            let action_id = action.action_id;
            {
                // Claim before spawning so a second poll in the same window
                // can never see the action as unclaimed.
                let mut in_flight = self.in_flight.lock().await;
                if !in_flight.insert(action_id) {
                    continue;
                }
            }

            if !commands::is_known_action_type(&action.action_type) {
                warn!(
                    action_id = %action_id,
                    action_type = %action.action_type,
                    "unknown action type, marking processed"
                );
                if let Err(err) = self.queue.mark_processed(action_id).await {
                    warn!(action_id = %action_id, error = %err, "mark_processed failed");
                }
                self.in_flight.lock().await.remove(&action_id);
                continue;
            }

            let queue = self.queue.clone();
            let registry = self.registry.clone();
            let in_flight = self.in_flight.clone();
            tokio::spawn(async move {
                debug!(action_id = %action_id, action_type = %action.action_type, "dispatching");
                if let Err(err) = handle_action(&registry, &action).await {
                    error!(
                        action_id = %action_id,
                        action_type = %action.action_type,
                        error = %err,
                        "action handler failed"
                    );
                }
                if let Err(err) = queue.mark_processed(action_id).await {
                    warn!(action_id = %action_id, error = %err, "mark_processed failed");
                }
                in_flight.lock().await.remove(&action_id);
            });
        }
        Ok(())
    }
}

/// Route one action to its registry operation.
///
/// Malformed payloads return an error; the caller still marks the action
/// processed so it cannot wedge the queue.
async fn handle_action(
    registry: &AgentRegistry,
    action: &Action,
) -> Result<(), crate::error::AgentError> {
    match action.action_type.as_str() {
        commands::CREATE_AGENT => {
            let payload: CreateAgentPayload = serde_json::from_value(action.payload.clone())?;
            let agent_type = payload.effective_agent_type();
            registry
                .create(CreateAgentRequest {
                    agent_id: payload.agent_id,
                    agent_type,
                    session_id: payload
                        .session_id
                        .or_else(|| action.session_id.clone()),
                    conversation_id: payload.conversation_id,
                    persona_config: payload.persona_config,
                    initial_subject: payload.initial_subject,
                    loop_interval: payload
                        .loop_interval_ms
                        .map(Duration::from_millis),
                })
                .await?;
            Ok(())
        }
        commands::DESTROY_AGENT => {
            let payload: AgentRefPayload = serde_json::from_value(action.payload.clone())?;
            registry
                .destroy(payload.agent_id.as_deref(), payload.session_id.as_deref())
                .await;
            Ok(())
        }
        commands::PAUSE_AGENT => {
            let payload: AgentRefPayload = serde_json::from_value(action.payload.clone())?;
            registry
                .pause(payload.agent_id.as_deref(), payload.session_id.as_deref())
                .await;
            Ok(())
        }
        commands::RESUME_AGENT => {
            let payload: AgentRefPayload = serde_json::from_value(action.payload.clone())?;
            registry
                .resume(payload.agent_id.as_deref(), payload.session_id.as_deref())
                .await;
            Ok(())
        }
        commands::INTERRUPT_AGENT => {
            let payload: InterruptPayload = serde_json::from_value(action.payload.clone())?;
            registry
                .interrupt(
                    payload.agent_id.as_deref(),
                    payload.session_id.as_deref(),
                    payload.guidance.unwrap_or(Value::Null),
                )
                .await;
            Ok(())
        }
        other => Err(crate::error::AgentError::MalformedPayload(format!(
            "unroutable action type '{other}'"
        ))),
    }
}
