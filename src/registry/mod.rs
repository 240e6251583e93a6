//! Agent lifecycle registry.
//!
//! Owns the session map and runs every lifecycle transition: create with
//! session minting, pause/resume, interrupt delivery, and grace-then-abort
//! destroy. Lookups resolve session id first, then the agent's latest live
//! session, then a legacy alias by bare agent id.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value, json};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agent::{AgentEngine, EngineConfig, JokeAgent, PersonaAgent};
use crate::config::RuntimeConfig;
use crate::error::AgentError;
use crate::store::{AgentStatus, Participant, StateUpdate, Stores};
use crate::sync::EngineControls;
use crate::tools::ToolRegistry;

/// Live handle to a running (or just-finished) agent session.
pub struct AgentHandle {
    pub agent_id: String,
    pub session_id: String,
    pub agent_type: String,
    pub conversation_id: Option<Uuid>,
    pub controls: Arc<EngineControls>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl AgentHandle {
    /// Whether the engine task is still running.
    pub fn is_live(&self) -> bool {
        self.task
            .lock()
            .map(|guard| guard.as_ref().is_some_and(|t| !t.is_finished()))
            .unwrap_or(false)
    }

    fn take_task(&self) -> Option<JoinHandle<()>> {
        self.task.lock().ok().and_then(|mut guard| guard.take())
    }
}

/// Request to create and start a new agent session.
#[derive(Debug, Clone, Default)]
pub struct CreateAgentRequest {
    pub agent_id: String,
    pub agent_type: String,
    /// Preserved when given (rehydration), minted otherwise.
    pub session_id: Option<String>,
    pub conversation_id: Option<Uuid>,
    pub persona_config: Option<Map<String, Value>>,
    pub initial_subject: Option<String>,
    pub loop_interval: Option<Duration>,
}

#[derive(Default)]
struct RegistryInner {
    /// session_id -> handle
    sessions: HashMap<String, Arc<AgentHandle>>,
    /// agent_id -> most recently created session_id
    latest: HashMap<String, String>,
    /// bare agent_id alias for callers without a session id
    legacy: HashMap<String, Arc<AgentHandle>>,
}

pub struct AgentRegistry {
    inner: RwLock<RegistryInner>,
    stores: Stores,
    tools: Arc<ToolRegistry>,
    config: RuntimeConfig,
}

impl AgentRegistry {
    pub fn new(stores: Stores, tools: Arc<ToolRegistry>, config: RuntimeConfig) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            stores,
            tools,
            config,
        }
    }

    /// Create and start a session. Returns the session id, which is the
    /// requested one, a minted one, or the existing one on a duplicate.
    pub async fn create(&self, request: CreateAgentRequest) -> Result<String, AgentError> {
        let session_id = request
            .session_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        {
            let inner = self.inner.read().await;
            if let Some(existing) = inner.sessions.get(&session_id) {
                if existing.agent_type != request.agent_type {
                    warn!(
                        session_id = %session_id,
                        existing = %existing.agent_type,
                        requested = %request.agent_type,
                        "duplicate create with conflicting agent type, keeping existing"
                    );
                } else {
                    info!(session_id = %session_id, "duplicate create skipped");
                }
                return Ok(session_id);
            }
        }

        let behavior: Box<dyn crate::agent::AgentBehavior> = match request.agent_type.as_str() {
            "persona" => {
                let conversation_id = request.conversation_id.ok_or_else(|| {
                    AgentError::MalformedPayload(
                        "persona agent requires a conversation_id".into(),
                    )
                })?;
                Box::new(PersonaAgent::new(
                    request.agent_id.clone(),
                    conversation_id,
                    request.persona_config.clone().unwrap_or_default(),
                    self.stores.conversations.clone(),
                    self.stores.messages.clone(),
                ))
            }
            "joke" => Box::new(JokeAgent::new(
                request.initial_subject.clone().unwrap_or_else(|| "chickens".into()),
            )),
            other => return Err(AgentError::UnknownAgentType(other.to_string())),
        };

        let controls = Arc::new(EngineControls::new());
        let engine_config = EngineConfig {
            loop_interval: request.loop_interval.unwrap_or(self.config.loop_interval),
            tool_timeout: self.config.tool_timeout,
            ..Default::default()
        };
        let engine = AgentEngine::new(
            request.agent_id.clone(),
            session_id.clone(),
            behavior,
            controls.clone(),
            engine_config,
            self.stores.clone(),
            self.tools.clone(),
        );

        {
            // Re-check under the write lock: a racing create for the same
            // session must not spawn a second engine.
            let mut inner = self.inner.write().await;
            if inner.sessions.contains_key(&session_id) {
                info!(session_id = %session_id, "duplicate create lost the race, skipped");
                return Ok(session_id);
            }

            let task_agent = request.agent_id.clone();
            let task_session = session_id.clone();
            let task = tokio::spawn(async move {
                if let Err(err) = engine.run().await {
                    error!(
                        agent_id = %task_agent,
                        session_id = %task_session,
                        error = %err,
                        "agent run ended with error"
                    );
                }
            });

            let handle = Arc::new(AgentHandle {
                agent_id: request.agent_id.clone(),
                session_id: session_id.clone(),
                agent_type: request.agent_type.clone(),
                conversation_id: request.conversation_id,
                controls,
                task: std::sync::Mutex::new(Some(task)),
            });
            inner.sessions.insert(session_id.clone(), handle.clone());
            inner
                .latest
                .insert(request.agent_id.clone(), session_id.clone());
            inner.legacy.insert(request.agent_id.clone(), handle);
        }

        // Conversation enrollment; on first insert the other live
        // participants are told the roster changed.
        if request.agent_type == "persona" {
            if let Some(conversation_id) = request.conversation_id {
                let inserted = self
                    .stores
                    .conversations
                    .add_participant_if_absent(Participant {
                        conversation_id,
                        agent_id: request.agent_id.clone(),
                        session_id: session_id.clone(),
                        persona_config: request
                            .persona_config
                            .map(Value::Object)
                            .unwrap_or_else(|| json!({})),
                        joined_at: Utc::now(),
                    })
                    .await;
                match inserted {
                    Ok(true) => {
                        self.broadcast_roster_change(conversation_id, &request.agent_id)
                            .await;
                    }
                    Ok(false) => {}
                    Err(err) => {
                        warn!(
                            agent_id = %request.agent_id,
                            error = %err,
                            "participant enrollment failed"
                        );
                    }
                }
            }
        }

        info!(
            agent_id = %request.agent_id,
            session_id = %session_id,
            agent_type = %request.agent_type,
            "agent created"
        );
        Ok(session_id)
    }

    /// Nudge live co-participants of a conversation to refresh their roster.
    async fn broadcast_roster_change(&self, conversation_id: Uuid, joined_agent: &str) {
        let inner = self.inner.read().await;
        for handle in inner.sessions.values() {
            if handle.conversation_id == Some(conversation_id)
                && handle.agent_id != joined_agent
                && handle.is_live()
            {
                handle
                    .controls
                    .interrupt(json!({"type": "participants_changed"}));
            }
        }
    }

    /// Stop a session: cooperative stop, grace wait, abort on overrun. The
    /// registry entry is removed and terminal state persisted regardless of
    /// how the task ended. Unknown targets are a benign no-op.
    pub async fn destroy(&self, agent_id: Option<&str>, session_id: Option<&str>) {
        let Some((resolved_session, handle)) = self.resolve(agent_id, session_id).await else {
            debug!(?agent_id, ?session_id, "destroy target not found");
            match agent_id {
                Some(id) => self.persist_stopped(id, session_id).await,
                // The state store is keyed by agent id, so a session-only
                // miss has nothing to write under.
                None => debug!(?session_id, "no agent id, terminal state not persisted"),
            }
            return;
        };

        self.persist_status(&handle, AgentStatus::Stopping).await;

        // A paused loop never reaches its stop check, so open the gate first.
        if handle.controls.pause.is_paused() {
            handle.controls.resume();
        }
        handle.controls.request_stop();

        if let Some(mut task) = handle.take_task() {
            match tokio::time::timeout(self.config.destroy_grace, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(session_id = %resolved_session, error = %err, "agent task panicked");
                }
                Err(_) => {
                    warn!(
                        session_id = %resolved_session,
                        grace = ?self.config.destroy_grace,
                        "agent did not stop within grace, aborting"
                    );
                    task.abort();
                    if let Err(err) = task.await {
                        if !err.is_cancelled() {
                            warn!(session_id = %resolved_session, error = %err, "abort join failed");
                        }
                    }
                }
            }
        }

        {
            let mut inner = self.inner.write().await;
            inner.sessions.remove(&resolved_session);
            if inner.latest.get(&handle.agent_id) == Some(&resolved_session) {
                inner.latest.remove(&handle.agent_id);
            }
            let legacy_matches = inner
                .legacy
                .get(&handle.agent_id)
                .is_some_and(|h| h.session_id == resolved_session);
            if legacy_matches {
                inner.legacy.remove(&handle.agent_id);
            }
        }

        self.persist_stopped(&handle.agent_id, Some(resolved_session.as_str()))
            .await;
        info!(
            agent_id = %handle.agent_id,
            session_id = %resolved_session,
            "agent destroyed"
        );
    }

    /// Terminal persist for a destroyed session. The engine records its own
    /// end timestamp when it exits cleanly; an aborted task never gets
    /// there, so stamp one here unless the snapshot already carries it.
    async fn persist_stopped(&self, agent_id: &str, session_id: Option<&str>) {
        let already_ended = matches!(
            self.stores.state.get(agent_id, session_id).await,
            Ok(Some(snapshot)) if snapshot.context.contains_key("ended_at")
        );
        let mut update = StateUpdate::status(AgentStatus::Stopped);
        if !already_ended {
            let mut context = Map::new();
            context.insert("ended_at".into(), Value::String(Utc::now().to_rfc3339()));
            update = update.with_context(context);
        }
        if let Err(err) = self.stores.state.upsert(agent_id, session_id, update).await {
            warn!(agent_id = %agent_id, error = %err, "failed to persist terminal state");
        }
    }

    /// Pause a session. Unknown targets log and do nothing.
    pub async fn pause(&self, agent_id: Option<&str>, session_id: Option<&str>) {
        let Some((_, handle)) = self.resolve(agent_id, session_id).await else {
            debug!(?agent_id, ?session_id, "pause target not found");
            return;
        };
        handle.controls.pause();
        self.persist_status(&handle, AgentStatus::Paused).await;
        info!(agent_id = %handle.agent_id, session_id = %handle.session_id, "agent paused");
    }

    /// Resume a session. Takes effect immediately, not on the next timer tick.
    pub async fn resume(&self, agent_id: Option<&str>, session_id: Option<&str>) {
        let Some((_, handle)) = self.resolve(agent_id, session_id).await else {
            debug!(?agent_id, ?session_id, "resume target not found");
            return;
        };
        handle.controls.resume();
        self.persist_status(&handle, AgentStatus::Running).await;
        info!(agent_id = %handle.agent_id, session_id = %handle.session_id, "agent resumed");
    }

    /// Deliver guidance to a session and wake it.
    pub async fn interrupt(
        &self,
        agent_id: Option<&str>,
        session_id: Option<&str>,
        guidance: Value,
    ) {
        let Some((_, handle)) = self.resolve(agent_id, session_id).await else {
            debug!(?agent_id, ?session_id, "interrupt target not found");
            return;
        };
        handle.controls.interrupt(guidance.clone());
        let mut context = Map::new();
        context.insert("last_guidance".into(), guidance);
        let update = StateUpdate::default().with_context(context);
        if let Err(err) = self
            .stores
            .state
            .upsert(&handle.agent_id, Some(handle.session_id.as_str()), update)
            .await
        {
            warn!(agent_id = %handle.agent_id, error = %err, "failed to persist guidance crumb");
        }
        debug!(agent_id = %handle.agent_id, session_id = %handle.session_id, "interrupt queued");
    }

    /// Whether a session is present and its engine task still running.
    pub async fn is_live(&self, session_id: &str) -> bool {
        let inner = self.inner.read().await;
        inner
            .sessions
            .get(session_id)
            .is_some_and(|h| h.is_live())
    }

    pub async fn live_session_ids(&self) -> Vec<String> {
        let inner = self.inner.read().await;
        inner
            .sessions
            .values()
            .filter(|h| h.is_live())
            .map(|h| h.session_id.clone())
            .collect()
    }

    /// Destroy every registered session, concurrently so total shutdown
    /// time is bounded by one grace period, not one per agent.
    pub async fn shutdown(&self) {
        let sessions: Vec<String> = {
            let inner = self.inner.read().await;
            inner.sessions.keys().cloned().collect()
        };
        futures::future::join_all(
            sessions
                .iter()
                .map(|session_id| self.destroy(None, Some(session_id.as_str()))),
        )
        .await;
    }

    /// Resolve a target: exact session id, then the agent's latest live
    /// session, then the legacy alias.
    async fn resolve(
        &self,
        agent_id: Option<&str>,
        session_id: Option<&str>,
    ) -> Option<(String, Arc<AgentHandle>)> {
        let inner = self.inner.read().await;
        if let Some(sid) = session_id {
            if let Some(handle) = inner.sessions.get(sid) {
                return Some((sid.to_string(), handle.clone()));
            }
        }
        if let Some(id) = agent_id {
            if let Some(sid) = inner.latest.get(id) {
                if let Some(handle) = inner.sessions.get(sid) {
                    if handle.is_live() {
                        return Some((sid.clone(), handle.clone()));
                    }
                }
            }
            if let Some(handle) = inner.legacy.get(id) {
                return Some((handle.session_id.clone(), handle.clone()));
            }
        }
        None
    }

    async fn persist_status(&self, handle: &AgentHandle, status: AgentStatus) {
        if let Err(err) = self
            .stores
            .state
            .upsert(
                &handle.agent_id,
                Some(handle.session_id.as_str()),
                StateUpdate::status(status),
            )
            .await
        {
            warn!(agent_id = %handle.agent_id, error = %err, "failed to persist status");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StateStore;

    fn registry() -> AgentRegistry {
        AgentRegistry::new(
            Stores::in_memory(),
            Arc::new(ToolRegistry::with_builtins()),
            RuntimeConfig {
                destroy_grace: Duration::from_secs(1),
                ..Default::default()
            },
        )
    }

    fn joke_request(agent_id: &str) -> CreateAgentRequest {
        CreateAgentRequest {
            agent_id: agent_id.into(),
            agent_type: "joke".into(),
            loop_interval: Some(Duration::from_millis(20)),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_mints_a_session_and_registers_it() {
        let registry = registry();
        let session = registry.create(joke_request("j1")).await.unwrap();
        assert!(registry.is_live(&session).await);
        registry.destroy(None, Some(session.as_str())).await;
        assert!(!registry.is_live(&session).await);
    }

    #[tokio::test]
    async fn duplicate_create_is_a_no_op() {
        let registry = registry();
        let mut request = joke_request("j1");
        request.session_id = Some("fixed".into());
        let first = registry.create(request.clone()).await.unwrap();
        let second = registry.create(request).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(registry.live_session_ids().await.len(), 1);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_agent_type_is_rejected() {
        let registry = registry();
        let mut request = joke_request("j1");
        request.agent_type = "mystery".into();
        let err = registry.create(request).await.unwrap_err();
        assert!(matches!(err, AgentError::UnknownAgentType(_)));
    }

    #[tokio::test]
    async fn destroy_of_unknown_target_is_benign() {
        let registry = registry();
        registry.destroy(Some("ghost"), None).await;
        let snapshot = registry
            .stores
            .state
            .get("ghost", None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.status, AgentStatus::Stopped);
        assert!(snapshot.context.contains_key("ended_at"));
    }

    #[tokio::test]
    async fn grace_overrun_aborts_the_task_and_still_finalizes_state() {
        let registry = AgentRegistry::new(
            Stores::in_memory(),
            Arc::new(ToolRegistry::with_builtins()),
            RuntimeConfig {
                destroy_grace: Duration::from_millis(50),
                ..Default::default()
            },
        );

        // A task that never observes the stop flag.
        let task = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        let handle = Arc::new(AgentHandle {
            agent_id: "stuck".into(),
            session_id: "stuck-s1".into(),
            agent_type: "joke".into(),
            conversation_id: None,
            controls: Arc::new(EngineControls::new()),
            task: std::sync::Mutex::new(Some(task)),
        });
        {
            let mut inner = registry.inner.write().await;
            inner.sessions.insert("stuck-s1".into(), handle.clone());
            inner.latest.insert("stuck".into(), "stuck-s1".into());
            inner.legacy.insert("stuck".into(), handle);
        }

        let started = std::time::Instant::now();
        registry.destroy(None, Some("stuck-s1")).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!registry.is_live("stuck-s1").await);

        let snapshot = registry
            .stores
            .state
            .get("stuck", Some("stuck-s1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.status, AgentStatus::Stopped);
        assert!(snapshot.context.contains_key("ended_at"));
    }

    #[tokio::test]
    async fn resolve_falls_back_to_agent_id() {
        let registry = registry();
        let session = registry.create(joke_request("j1")).await.unwrap();
        registry.pause(Some("j1"), None).await;
        let snapshot = registry
            .stores
            .state
            .get("j1", Some(session.as_str()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.status, AgentStatus::Paused);
        registry.shutdown().await;
    }
}
