//! Standalone quip-producing behavior.
//!
//! Mostly a steering target for interrupt and lifecycle tests: the subject
//! can be changed mid-run through guidance, either structured or free text.

use serde_json::{Map, Value, json};

use async_trait::async_trait;

use crate::error::AgentError;
use crate::sync::EngineControls;

use super::engine::{AgentBehavior, TickContext};
use super::outcome::StepOutcome;

pub struct JokeAgent {
    subject: String,
}

impl JokeAgent {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
        }
    }

    /// Pull a subject out of free-text guidance. Accepts "subject: X" and
    /// "about X" anywhere in the text; the subject comes back lowercased.
    ///
    /// Marker search and slicing both happen on the lowercased copy:
    /// lowercasing can change byte lengths, so an index found there is not
    /// a valid boundary in the original.
    fn subject_from_text(text: &str) -> Option<String> {
        let lower = text.to_lowercase();
        for marker in ["subject:", "about "] {
            if let Some(pos) = lower.find(marker) {
                let rest = lower[pos + marker.len()..].trim();
                if !rest.is_empty() {
                    return Some(rest.to_string());
                }
            }
        }
        None
    }
}

#[async_trait]
impl AgentBehavior for JokeAgent {
    fn agent_type(&self) -> &'static str {
        "joke"
    }

    fn initial_context(&self) -> Map<String, Value> {
        let mut ctx = Map::new();
        ctx.insert("subject".into(), json!(self.subject));
        ctx
    }

    async fn tick(
        &mut self,
        iteration: u64,
        ctx: &mut TickContext<'_>,
    ) -> Result<StepOutcome, AgentError> {
        ctx.set("subject", json!(self.subject));
        let quip = format!(
            "Why did the {} cross the road? Iteration {} still doesn't know.",
            self.subject, iteration
        );
        Ok(StepOutcome::ok().with_data(json!({
            "intent": {"type": "speak", "text": quip},
            "subject": self.subject,
        })))
    }

    async fn apply_guidance(
        &mut self,
        guidance: &Value,
        _ctl: &EngineControls,
    ) -> Result<Option<Map<String, Value>>, AgentError> {
        let Some(map) = guidance.as_object() else {
            return Ok(None);
        };
        let new_subject = match map.get("subject").and_then(Value::as_str) {
            Some(subject) => Some(subject.to_string()),
            None => map
                .get("_raw_text")
                .and_then(Value::as_str)
                .and_then(Self::subject_from_text),
        };
        match new_subject {
            Some(subject) => {
                self.subject = subject.clone();
                let mut deltas = Map::new();
                deltas.insert("subject".into(), json!(subject));
                Ok(Some(deltas))
            }
            None => Ok(None),
        }
    }
}
