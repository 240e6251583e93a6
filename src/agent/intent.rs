//! Intent execution: side effects requested by a tick's outcome.

use chrono::Utc;
use serde_json::{Value, json};
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, warn};

use crate::store::{NewMessage, Stores};
use crate::sync::EngineControls;
use crate::tools::ToolRegistry;

use super::engine::{AgentBehavior, EngineConfig};
use super::outcome::{Intent, OutcomeStatus, ParsedIntent, StepOutcome, ToolRequest, parse_intent};

/// One tool call's result, in request order. Failures and timeouts are
/// result-shaped, never errors.
#[derive(Debug, Clone)]
pub struct ToolCallResult {
    pub name: String,
    pub result: Value,
}

/// Apply the outcome's intent, if any, and return the adjusted outcome.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn execute_intent(
    mut outcome: StepOutcome,
    behavior: &mut dyn AgentBehavior,
    agent_id: &str,
    session_id: &str,
    controls: &EngineControls,
    config: &EngineConfig,
    stores: &Stores,
    tools: &ToolRegistry,
) -> StepOutcome {
    let intent = match parse_intent(outcome.data.as_ref()) {
        ParsedIntent::None => return outcome,
        ParsedIntent::Known(intent) => intent,
        ParsedIntent::Unknown { kind } => {
            outcome.push_note(&format!("unrecognized intent type '{kind}'"));
            return outcome;
        }
        ParsedIntent::Invalid(reason) => {
            outcome.push_note(&format!("undecodable intent: {reason}"));
            return outcome;
        }
    };

    match intent {
        Intent::Silent { reason } => {
            outcome.text = None;
            outcome.status = OutcomeStatus::Info;
            outcome.set_state("silent", json!(true));
            if let Some(reason) = reason {
                outcome.set_state("silent_reason", json!(reason));
            }
            outcome
        }
        Intent::Speak { text, mode: _ } => {
            deliver_reply(outcome, text, behavior, agent_id, session_id, stores).await
        }
        Intent::CallTool { tools: requests, execution } => {
            if let Some(mode) = execution.as_deref() {
                if mode != "inline" {
                    let mut out = StepOutcome::error(format!(
                        "unsupported tool execution mode '{mode}'"
                    ));
                    out.data = outcome.data;
                    return out;
                }
            }

            let results = run_tools(requests, tools, config).await;
            outcome.data.get_or_insert_with(|| json!({}));
            if let Some(Value::Object(map)) = outcome.data.as_mut() {
                map.insert(
                    "tool_results".into(),
                    Value::Array(
                        results
                            .iter()
                            .map(|r| json!({"name": r.name, "result": r.result}))
                            .collect(),
                    ),
                );
            }

            // A message that arrived while tools ran makes the pending
            // reply stale. Keep the results, skip the delivery.
            if let Some(conversation_id) = behavior.conversation_id() {
                let newer = stores
                    .messages
                    .list_messages_since(conversation_id, behavior.last_seen(), 1)
                    .await;
                match newer {
                    Ok(messages) if !messages.is_empty() => {
                        debug!(agent_id, "new message during tool run, reply suppressed");
                        outcome.text = None;
                        outcome.status = OutcomeStatus::Info;
                        outcome.set_state("race_avoided", json!(true));
                        return outcome;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(agent_id, error = %err, "stale-reply check failed");
                    }
                }
            }

            let text = match &config.composer {
                Some(composer) => composer.compose(&results),
                None => compose_default(&results),
            };
            deliver_reply(outcome, text, behavior, agent_id, session_id, stores).await
        }
        Intent::Stop { reason } => {
            controls.request_stop();
            outcome.set_state("stopping", json!(true));
            if let Some(reason) = reason {
                outcome.set_state("stop_reason", json!(reason));
            }
            outcome
        }
    }
}

/// Set the outcome text and, for conversation participants, append the
/// reply as a message.
async fn deliver_reply(
    mut outcome: StepOutcome,
    text: String,
    behavior: &mut dyn AgentBehavior,
    agent_id: &str,
    session_id: &str,
    stores: &Stores,
) -> StepOutcome {
    if let Some(conversation_id) = behavior.conversation_id() {
        let append = stores
            .messages
            .append_message(NewMessage {
                conversation_id,
                author_id: agent_id.to_string(),
                role: "assistant".to_string(),
                text: text.clone(),
                reply_to: None,
                meta: json!({"session_id": session_id}),
            })
            .await;
        match append {
            Ok(message) => {
                behavior.note_spoke(message.created_at);
                outcome.set_state("last_msg_id", json!(message.message_id));
            }
            Err(err) => {
                warn!(agent_id, error = %err, "failed to append reply message");
                outcome.push_note("reply message not persisted");
            }
        }
    } else {
        behavior.note_spoke(Utc::now());
    }
    outcome.text = Some(text);
    outcome.status = OutcomeStatus::Ok;
    outcome
}

/// Run all requested tools concurrently under one shared deadline.
///
/// Results come back in request order. An unknown tool, a failure, or a
/// call still pending at the deadline each produce an error-shaped result.
async fn run_tools(
    requests: Vec<ToolRequest>,
    registry: &ToolRegistry,
    config: &EngineConfig,
) -> Vec<ToolCallResult> {
    let deadline = Instant::now() + config.tool_timeout;
    let mut results: Vec<ToolCallResult> = requests
        .iter()
        .map(|r| ToolCallResult {
            name: r.name.clone(),
            result: json!({"error": "timeout"}),
        })
        .collect();

    let mut set: JoinSet<(usize, Value)> = JoinSet::new();
    for (idx, request) in requests.into_iter().enumerate() {
        match registry.get(&request.name) {
            Some(tool) => {
                set.spawn(async move {
                    let result = match tool.execute(request.args).await {
                        Ok(value) => value,
                        Err(err) => json!({"error": err.to_string()}),
                    };
                    (idx, result)
                });
            }
            None => {
                results[idx].result = json!({"error": "unknown_tool"});
            }
        }
    }

    loop {
        tokio::select! {
            joined = set.join_next() => {
                match joined {
                    Some(Ok((idx, result))) => results[idx].result = result,
                    Some(Err(err)) => {
                        warn!(error = %err, "tool task failed");
                    }
                    None => break,
                }
            }
            _ = sleep_until(deadline) => {
                set.abort_all();
                break;
            }
        }
    }
    results
}

fn compose_default(results: &[ToolCallResult]) -> String {
    results
        .iter()
        .map(|r| {
            let rendered = match &r.result {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            format!("{}: {}", r.name, rendered)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    use crate::tools::{Tool, ToolError};

    struct SleepTool(Duration);

    #[async_trait]
    impl Tool for SleepTool {
        fn name(&self) -> &str {
            "sleep"
        }

        async fn execute(&self, _args: Value) -> Result<Value, ToolError> {
            tokio::time::sleep(self.0).await;
            Ok(json!("done"))
        }
    }

    #[tokio::test]
    async fn tools_run_under_a_shared_deadline() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(crate::tools::EchoTool));
        registry.register(Arc::new(SleepTool(Duration::from_secs(10))));

        let config = EngineConfig {
            tool_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let requests = vec![
            ToolRequest {
                name: "sleep".into(),
                args: json!({}),
            },
            ToolRequest {
                name: "echo".into(),
                args: json!({"message": "fast"}),
            },
            ToolRequest {
                name: "missing".into(),
                args: json!({}),
            },
        ];

        let results = run_tools(requests, &registry, &config).await;
        assert_eq!(results[0].result, json!({"error": "timeout"}));
        assert_eq!(results[1].result, json!("fast"));
        assert_eq!(results[2].result, json!({"error": "unknown_tool"}));
    }

    #[test]
    fn default_composer_joins_name_value_lines() {
        let results = vec![
            ToolCallResult {
                name: "echo".into(),
                result: json!("hi"),
            },
            ToolCallResult {
                name: "clock".into(),
                result: json!({"now": "t"}),
            },
        ];
        assert_eq!(compose_default(&results), "echo: hi\nclock: {\"now\":\"t\"}");
    }
}
