//! Step outcomes, structured intents, and guidance normalization.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Coarse status of one loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    #[default]
    Ok,
    Error,
    Info,
}

impl std::fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Error => write!(f, "error"),
            Self::Info => write!(f, "info"),
        }
    }
}

/// Everything one tick produced. Persisted as a step record after the
/// engine runs intent dispatch over it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepOutcome {
    pub status: OutcomeStatus,
    pub text: Option<String>,
    pub data: Option<Value>,
    /// Deltas merged into the engine's context map.
    pub state: Option<Map<String, Value>>,
    pub notes: Option<String>,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
    /// Guidance consumed this iteration, attached by the engine.
    pub guidance: Option<Value>,
}

impl StepOutcome {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn info(text: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Info,
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Error,
            error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_state(mut self, state: Map<String, Value>) -> Self {
        self.state = Some(state);
        self
    }

    /// Append to the notes field, separating entries with "; ".
    pub fn push_note(&mut self, note: &str) {
        match &mut self.notes {
            Some(existing) => {
                existing.push_str("; ");
                existing.push_str(note);
            }
            None => self.notes = Some(note.to_string()),
        }
    }

    /// Merge a single key into the state deltas.
    pub fn set_state(&mut self, key: &str, value: Value) {
        self.state
            .get_or_insert_with(Map::new)
            .insert(key.to_string(), value);
    }
}

/// One tool invocation requested by a `call_tool` intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRequest {
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

/// A structured intent emitted in `data.intent`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Intent {
    /// Deliberately produce no output this iteration.
    Silent {
        #[serde(default)]
        reason: Option<String>,
    },
    /// Emit text; for conversation participants, also append a message.
    Speak {
        text: String,
        #[serde(default)]
        mode: Option<String>,
    },
    /// Run the named tools concurrently, then compose a reply.
    CallTool {
        tools: Vec<ToolRequest>,
        /// Only "inline" is supported; anything else is a hard error.
        #[serde(default)]
        execution: Option<String>,
    },
    /// Request the engine's own cooperative stop.
    Stop {
        #[serde(default)]
        reason: Option<String>,
    },
}

/// Result of looking for an intent in an outcome's data.
#[derive(Debug)]
pub enum ParsedIntent {
    None,
    Known(Intent),
    /// Recognizable shape but an unrecognized type tag. Passed through
    /// untouched with a note.
    Unknown { kind: String },
    /// `data.intent` present but not decodable. Noted, never fatal.
    Invalid(String),
}

/// Extract the intent, if any, from an outcome's data payload.
pub fn parse_intent(data: Option<&Value>) -> ParsedIntent {
    let Some(intent) = data.and_then(|d| d.get("intent")) else {
        return ParsedIntent::None;
    };
    let Some(kind) = intent.get("type").and_then(Value::as_str) else {
        return ParsedIntent::Invalid("intent without a string 'type' field".into());
    };
    match kind {
        "silent" | "speak" | "call_tool" | "stop" => {
            match serde_json::from_value::<Intent>(intent.clone()) {
                Ok(intent) => ParsedIntent::Known(intent),
                Err(err) => ParsedIntent::Invalid(err.to_string()),
            }
        }
        other => ParsedIntent::Unknown {
            kind: other.to_string(),
        },
    }
}

/// Normalize raw guidance into a map the behaviors can interpret.
///
/// Objects pass through, null stays null, and any scalar is wrapped as
/// `{"_raw_text": <stringified>}` so free-text guidance still reaches
/// the behavior's keyword parsing.
pub fn normalize_guidance(raw: &Value) -> Value {
    match raw {
        Value::Object(_) | Value::Null => raw.clone(),
        Value::String(s) => json!({ "_raw_text": s }),
        other => json!({ "_raw_text": other.to_string() }),
    }
}
