//! The cooperative loop engine.
//!
//! One engine drives one agent session: wait, drain interrupts, tick the
//! behavior, dispatch its intent, persist the step and state snapshot,
//! repeat. Stop requests are honored at the top of each iteration and again
//! after the idle wait, never mid-tick.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::AgentError;
use crate::store::{AgentStatus, StateUpdate, StepRecord, Stores};
use crate::sync::EngineControls;
use crate::tools::ToolRegistry;

use super::intent::execute_intent;
use super::outcome::{StepOutcome, normalize_guidance};

/// Mutable view of the engine's context map handed to a ticking behavior.
pub struct TickContext<'a> {
    context: &'a mut Map<String, Value>,
}

impl<'a> TickContext<'a> {
    pub(crate) fn new(context: &'a mut Map<String, Value>) -> Self {
        Self { context }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.context.get(key)
    }

    pub fn set(&mut self, key: &str, value: Value) {
        self.context.insert(key.to_string(), value);
    }

    /// Merge a map of deltas, last writer wins per key.
    pub fn merge(&mut self, deltas: Map<String, Value>) {
        for (k, v) in deltas {
            self.context.insert(k, v);
        }
    }

    pub fn snapshot(&self) -> Map<String, Value> {
        self.context.clone()
    }
}

/// Domain logic plugged into an engine.
///
/// The engine owns scheduling, control flow, and persistence; the behavior
/// owns what a tick means and how guidance is interpreted.
#[async_trait]
pub trait AgentBehavior: Send + Sync {
    fn agent_type(&self) -> &'static str;

    /// Context seeded before the first iteration.
    fn initial_context(&self) -> Map<String, Value> {
        Map::new()
    }

    /// One-time setup. An error here aborts the run before any iteration.
    async fn on_start(&mut self) -> Result<Option<Value>, AgentError> {
        Ok(None)
    }

    /// Best-effort teardown after the loop exits.
    async fn on_stop(&mut self) {}

    async fn tick(
        &mut self,
        iteration: u64,
        ctx: &mut TickContext<'_>,
    ) -> Result<StepOutcome, AgentError>;

    /// Apply one normalized guidance payload. Returns optional context
    /// deltas. Runs before the tick that observes the guidance.
    async fn apply_guidance(
        &mut self,
        _guidance: &Value,
        _ctl: &EngineControls,
    ) -> Result<Option<Map<String, Value>>, AgentError> {
        Ok(None)
    }

    /// Conversation this behavior participates in, if any.
    fn conversation_id(&self) -> Option<Uuid> {
        None
    }

    /// Read cursor into the conversation, for stale-reply checks.
    fn last_seen(&self) -> Option<DateTime<Utc>> {
        None
    }

    /// Called after a reply was actually delivered.
    fn note_spoke(&mut self, _at: DateTime<Utc>) {}

    /// Whether the loop should keep running after a tick error.
    fn continue_on_error(&self, _err: &AgentError) -> bool {
        true
    }
}

/// Hook that rewrites raw guidance before normalization. The default
/// engine passes guidance through untouched.
#[async_trait]
pub trait GuidanceInterpreter: Send + Sync {
    async fn interpret(&self, raw: &Value) -> Result<Value, AgentError>;
}

/// Hook that turns tool results into reply text.
pub trait ReplyComposer: Send + Sync {
    fn compose(&self, tool_results: &[super::intent::ToolCallResult]) -> String;
}

/// Per-engine tuning knobs.
#[derive(Clone)]
pub struct EngineConfig {
    pub loop_interval: Duration,
    pub tool_timeout: Duration,
    /// Persist the raw guidance payload on the step record.
    pub persist_guidance_raw: bool,
    /// Persist the normalized guidance alongside the raw payload.
    pub persist_guidance_normalized: bool,
    pub interpreter: Option<Arc<dyn GuidanceInterpreter>>,
    pub composer: Option<Arc<dyn ReplyComposer>>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            loop_interval: Duration::from_secs(3),
            tool_timeout: Duration::from_secs(12),
            persist_guidance_raw: true,
            persist_guidance_normalized: true,
            interpreter: None,
            composer: None,
        }
    }
}

impl EngineConfig {
    pub fn with_loop_interval(mut self, interval: Duration) -> Self {
        self.loop_interval = interval;
        self
    }
}

/// A single agent session's loop engine.
pub struct AgentEngine {
    pub agent_id: String,
    pub session_id: String,
    behavior: Box<dyn AgentBehavior>,
    controls: Arc<EngineControls>,
    config: EngineConfig,
    stores: Stores,
    tools: Arc<ToolRegistry>,
    context: Map<String, Value>,
    iteration: u64,
    last_result: Option<String>,
}

impl AgentEngine {
    pub fn new(
        agent_id: impl Into<String>,
        session_id: impl Into<String>,
        behavior: Box<dyn AgentBehavior>,
        controls: Arc<EngineControls>,
        config: EngineConfig,
        stores: Stores,
        tools: Arc<ToolRegistry>,
    ) -> Self {
        let context = behavior.initial_context();
        Self {
            agent_id: agent_id.into(),
            session_id: session_id.into(),
            behavior,
            controls,
            config,
            stores,
            tools,
            context,
            iteration: 0,
            last_result: None,
        }
    }

    /// Run the loop to completion. Returns only after the stop flag is
    /// observed or a fatal error ends the run.
    pub async fn run(mut self) -> Result<(), AgentError> {
        info!(
            agent_id = %self.agent_id,
            session_id = %self.session_id,
            agent_type = self.behavior.agent_type(),
            "agent starting"
        );
        self.persist_state(AgentStatus::Starting).await;

        match self.behavior.on_start().await {
            Ok(Some(seed)) => {
                if let Value::Object(map) = seed {
                    for (k, v) in map {
                        self.context.insert(k, v);
                    }
                }
            }
            Ok(None) => {}
            Err(err) => {
                error!(agent_id = %self.agent_id, error = %err, "agent start failed");
                self.persist_state(AgentStatus::Error).await;
                return Err(err);
            }
        }
        self.persist_state(AgentStatus::Running).await;

        let mut terminal = AgentStatus::Stopped;
        let mut run_result = Ok(());

        loop {
            if self.controls.stop.is_set() {
                break;
            }
            self.controls.wake.wait_for(self.config.loop_interval).await;
            if self.controls.pause.is_paused() {
                self.persist_state(AgentStatus::Paused).await;
                self.controls.pause.wait_open().await;
            }
            if self.controls.stop.is_set() {
                break;
            }

            let guidance_record = self.drain_interrupts().await;

            let started = Instant::now();
            let mut ctx = TickContext::new(&mut self.context);
            let mut outcome = match self.behavior.tick(self.iteration, &mut ctx).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(
                        agent_id = %self.agent_id,
                        iteration = self.iteration,
                        error = %err,
                        "tick failed"
                    );
                    let fatal = !self.behavior.continue_on_error(&err);
                    let outcome = StepOutcome::error(err.to_string());
                    self.finish_iteration(outcome, guidance_record, started)
                        .await;
                    if fatal {
                        terminal = AgentStatus::Error;
                        run_result = Err(err);
                        break;
                    }
                    continue;
                }
            };

            outcome = execute_intent(
                outcome,
                self.behavior.as_mut(),
                &self.agent_id,
                &self.session_id,
                &self.controls,
                &self.config,
                &self.stores,
                &self.tools,
            )
            .await;

            if let Some(deltas) = outcome.state.take() {
                for (k, v) in deltas.clone() {
                    self.context.insert(k, v);
                }
                outcome.state = Some(deltas);
            }

            self.finish_iteration(outcome, guidance_record, started).await;
        }

        self.behavior.on_stop().await;
        self.context.insert(
            "ended_at".into(),
            Value::String(Utc::now().to_rfc3339()),
        );
        self.persist_state(terminal).await;
        info!(
            agent_id = %self.agent_id,
            session_id = %self.session_id,
            iterations = self.iteration,
            status = %terminal,
            "agent exited"
        );
        run_result
    }

    /// Drain queued guidance, apply each item, and return the record of
    /// what was consumed for the upcoming step.
    async fn drain_interrupts(&mut self) -> Option<Value> {
        let drained = self.controls.interrupts.drain().await;
        if drained.is_empty() {
            return None;
        }
        let mut last_record = None;
        for raw in drained {
            let interpreted = match &self.config.interpreter {
                Some(interpreter) => match interpreter.interpret(&raw).await {
                    Ok(v) => v,
                    Err(err) => {
                        warn!(
                            agent_id = %self.agent_id,
                            error = %err,
                            "guidance interpreter failed, skipping item"
                        );
                        continue;
                    }
                },
                None => raw.clone(),
            };
            let normalized = normalize_guidance(&interpreted);
            match self
                .behavior
                .apply_guidance(&normalized, &self.controls)
                .await
            {
                Ok(Some(deltas)) => {
                    for (k, v) in deltas {
                        self.context.insert(k, v);
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(
                        agent_id = %self.agent_id,
                        error = %err,
                        "guidance application failed, skipping item"
                    );
                    continue;
                }
            }
            debug!(agent_id = %self.agent_id, "guidance applied");
            let mut record = Map::new();
            if self.config.persist_guidance_raw {
                record.insert("raw".into(), raw);
            }
            if self.config.persist_guidance_normalized {
                record.insert("normalized".into(), normalized);
            }
            if !record.is_empty() {
                last_record = Some(Value::Object(record));
            }
        }
        last_record
    }

    async fn finish_iteration(
        &mut self,
        mut outcome: StepOutcome,
        guidance_record: Option<Value>,
        started: Instant,
    ) {
        if outcome.latency_ms.is_none() {
            outcome.latency_ms = Some(started.elapsed().as_millis() as u64);
        }
        if outcome.guidance.is_none() {
            outcome.guidance = guidance_record;
        }
        self.last_result = outcome.text.clone().or_else(|| outcome.error.clone());

        let step = StepRecord {
            agent_id: self.agent_id.clone(),
            session_id: self.session_id.clone(),
            iteration: self.iteration,
            status: outcome.status,
            text: outcome.text,
            data: outcome.data,
            state: outcome.state.map(Value::Object),
            guidance: outcome.guidance,
            notes: outcome.notes,
            latency_ms: outcome.latency_ms,
            error: outcome.error,
            created_at: Utc::now(),
        };
        if let Err(err) = self.stores.steps.append(step).await {
            warn!(agent_id = %self.agent_id, error = %err, "failed to persist step");
        }

        self.persist_state(AgentStatus::Running).await;
        self.iteration += 1;
    }

    /// Persist a state snapshot. Persistence failures never kill the loop.
    async fn persist_state(&self, status: AgentStatus) {
        let mut context = self.context.clone();
        context.insert("paused".into(), json!(self.controls.pause.is_paused()));
        let update = StateUpdate {
            status: Some(status),
            iteration: Some(self.iteration),
            result: self.last_result.clone(),
            context: Some(context),
            ..Default::default()
        };
        if let Err(err) = self
            .stores
            .state
            .upsert(&self.agent_id, Some(self.session_id.as_str()), update)
            .await
        {
            warn!(agent_id = %self.agent_id, error = %err, "failed to persist state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::JokeAgent;
    use crate::store::StateStore;

    fn joke_engine(stores: Stores, controls: Arc<EngineControls>) -> AgentEngine {
        AgentEngine::new(
            "j1",
            "j1-s1",
            Box::new(JokeAgent::new("cats")),
            controls,
            EngineConfig::default().with_loop_interval(Duration::from_millis(10)),
            stores,
            Arc::new(ToolRegistry::new()),
        )
    }

    // run() must yield a future that can be handed to tokio::spawn.
    #[tokio::test]
    async fn run_future_moves_across_tasks() {
        let controls = Arc::new(EngineControls::new());
        let engine = joke_engine(Stores::in_memory(), controls.clone());
        let task = tokio::spawn(engine.run());
        controls.request_stop();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn latest_step_text_lands_on_the_state_snapshot() {
        let stores = Stores::in_memory();
        let controls = Arc::new(EngineControls::new());
        let task = tokio::spawn(joke_engine(stores.clone(), controls.clone()).run());
        tokio::time::sleep(Duration::from_millis(150)).await;
        controls.request_stop();
        task.await.unwrap().unwrap();

        let snapshot = stores.state.get("j1", Some("j1-s1")).await.unwrap().unwrap();
        let result = snapshot.result.expect("step result persisted");
        assert!(result.contains("cats"), "{result}");
    }
}
