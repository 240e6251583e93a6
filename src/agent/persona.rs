//! Conversation participant behavior.
//!
//! A persona agent follows one conversation through a `last_seen` cursor,
//! replies to messages it has not authored, and honors a small guidance
//! vocabulary for steering from outside the loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::AgentError;
use crate::store::{ConversationStore, Message, MessageStore};
use crate::sync::EngineControls;

use super::engine::{AgentBehavior, TickContext};
use super::outcome::StepOutcome;

const DEFAULT_COOLDOWN: Duration = Duration::from_secs(2);
const PARTICIPANTS_REFRESH: Duration = Duration::from_secs(5);
const FETCH_LIMIT: usize = 50;

pub struct PersonaAgent {
    agent_id: String,
    conversation_id: Uuid,
    persona_config: Map<String, Value>,
    conversations: Arc<dyn ConversationStore>,
    messages: Arc<dyn MessageStore>,

    last_seen: Option<DateTime<Utc>>,
    last_spoke_at: Option<Instant>,
    cooldown: Duration,
    force_tick: bool,

    participants: HashMap<String, Value>,
    participants_last_fetch: Option<Instant>,
}

impl PersonaAgent {
    pub fn new(
        agent_id: impl Into<String>,
        conversation_id: Uuid,
        persona_config: Map<String, Value>,
        conversations: Arc<dyn ConversationStore>,
        messages: Arc<dyn MessageStore>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            conversation_id,
            persona_config,
            conversations,
            messages,
            last_seen: None,
            last_spoke_at: None,
            cooldown: DEFAULT_COOLDOWN,
            force_tick: false,
            participants: HashMap::new(),
            participants_last_fetch: None,
        }
    }

    fn persona_name(&self) -> &str {
        self.persona_config
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or(&self.agent_id)
    }

    fn tone(&self) -> &str {
        self.persona_config
            .get("tone")
            .and_then(Value::as_str)
            .unwrap_or("neutral")
    }

    fn in_cooldown(&self) -> bool {
        match self.last_spoke_at {
            Some(at) => at.elapsed() < self.cooldown,
            None => false,
        }
    }

    /// Refresh the cached roster if stale, merging it into the context.
    async fn refresh_participants(&mut self, ctx: &mut TickContext<'_>, force: bool) {
        let stale = force
            || self
                .participants_last_fetch
                .is_none_or(|at| at.elapsed() >= PARTICIPANTS_REFRESH);
        if !stale {
            return;
        }
        match self.conversations.list_participants(self.conversation_id).await {
            Ok(roster) => {
                self.participants = roster
                    .into_iter()
                    .map(|p| {
                        (
                            p.agent_id.clone(),
                            json!({"session_id": p.session_id, "persona_config": p.persona_config}),
                        )
                    })
                    .collect();
                self.participants_last_fetch = Some(Instant::now());
                ctx.set(
                    "participants",
                    Value::Object(self.participants.clone().into_iter().collect()),
                );
                ctx.set("participants_count", json!(self.participants.len()));
            }
            Err(err) => {
                warn!(agent_id = %self.agent_id, error = %err, "participant refresh failed");
            }
        }
    }

    fn compose_reply(&self, last: &Message) -> String {
        let mut reply = format!(
            "[{} | tone={}] {}",
            self.persona_name(),
            self.tone(),
            last.text
        );
        let others: Vec<&str> = self
            .participants
            .keys()
            .map(String::as_str)
            .filter(|id| *id != self.agent_id)
            .collect();
        if !others.is_empty() {
            let mut sorted = others;
            sorted.sort_unstable();
            reply.push_str(&format!(" (p.s. hello {})", sorted.join(", ")));
        }
        reply
    }

    fn silent(&self, reason: &str) -> StepOutcome {
        StepOutcome::ok().with_data(json!({
            "intent": {"type": "silent", "reason": reason}
        }))
    }
}

#[async_trait]
impl AgentBehavior for PersonaAgent {
    fn agent_type(&self) -> &'static str {
        "persona"
    }

    fn initial_context(&self) -> Map<String, Value> {
        let mut ctx = Map::new();
        ctx.insert("conversation_id".into(), json!(self.conversation_id));
        ctx.insert(
            "persona_config".into(),
            Value::Object(self.persona_config.clone()),
        );
        ctx
    }

    async fn tick(
        &mut self,
        _iteration: u64,
        ctx: &mut TickContext<'_>,
    ) -> Result<StepOutcome, AgentError> {
        self.refresh_participants(ctx, false).await;

        let new = self
            .messages
            .list_messages_since(self.conversation_id, self.last_seen, FETCH_LIMIT)
            .await
            .map_err(AgentError::Store)?;

        if new.is_empty() {
            let mut outcome = StepOutcome::ok();
            outcome.status = super::outcome::OutcomeStatus::Info;
            outcome.set_state("idle", json!(true));
            return Ok(outcome);
        }

        let last = new[new.len() - 1].clone();
        self.last_seen = Some(last.created_at);
        ctx.set("last_seen_iso", json!(last.created_at.to_rfc3339()));
        ctx.set("last_msg_id", json!(last.message_id));

        if last.author_id == self.agent_id {
            return Ok(self.silent("seen_self"));
        }
        if self.in_cooldown() && !self.force_tick {
            return Ok(self.silent("cooldown"));
        }
        self.force_tick = false;

        let reply = self.compose_reply(&last);
        Ok(StepOutcome::ok().with_data(json!({
            "intent": {"type": "speak", "text": reply},
            "reply_to": last.message_id,
        })))
    }

    async fn apply_guidance(
        &mut self,
        guidance: &Value,
        ctl: &EngineControls,
    ) -> Result<Option<Map<String, Value>>, AgentError> {
        let Some(map) = guidance.as_object() else {
            return Ok(None);
        };
        let kind = map.get("type").and_then(Value::as_str).unwrap_or("");
        let mut deltas = Map::new();
        match kind {
            "rehydrate" | "set_last_seen" => {
                let iso = map
                    .get("last_seen_iso")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        AgentError::Guidance("rehydrate without last_seen_iso".into())
                    })?;
                let at = DateTime::parse_from_rfc3339(iso)
                    .map_err(|e| AgentError::Guidance(format!("bad last_seen_iso: {e}")))?
                    .with_timezone(&Utc);
                self.last_seen = Some(at);
                deltas.insert("last_seen_iso".into(), json!(iso));
                debug!(agent_id = %self.agent_id, last_seen = iso, "cursor restored");
            }
            "participants_changed" => {
                self.participants_last_fetch = None;
                deltas.insert("participants_stale".into(), json!(true));
            }
            "set_tone" => {
                if let Some(tone) = map.get("tone").and_then(Value::as_str) {
                    self.persona_config.insert("tone".into(), json!(tone));
                    deltas.insert("tone".into(), json!(tone));
                }
            }
            "speak_now" => {
                self.force_tick = true;
            }
            "set_cooldown" => {
                if let Some(seconds) = map.get("seconds").and_then(Value::as_f64) {
                    if seconds >= 0.0 {
                        self.cooldown = Duration::from_secs_f64(seconds);
                        deltas.insert("cooldown_seconds".into(), json!(seconds));
                    }
                }
            }
            "new_message" => {
                self.force_tick = true;
                if let Some(id) = map.get("message_id") {
                    deltas.insert("pending_message_id".into(), id.clone());
                }
            }
            "stop" => {
                ctl.request_stop();
            }
            other => {
                debug!(agent_id = %self.agent_id, kind = other, "unrecognized guidance ignored");
            }
        }
        if deltas.is_empty() {
            Ok(None)
        } else {
            Ok(Some(deltas))
        }
    }

    fn conversation_id(&self) -> Option<Uuid> {
        Some(self.conversation_id)
    }

    fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.last_seen
    }

    fn note_spoke(&mut self, _at: DateTime<Utc>) {
        self.last_spoke_at = Some(Instant::now());
        self.force_tick = false;
    }
}
