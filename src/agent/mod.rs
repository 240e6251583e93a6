//! Agent engines and behaviors.

pub mod engine;
pub mod intent;
pub mod joke;
pub mod outcome;
pub mod persona;

pub use engine::{
    AgentBehavior, AgentEngine, EngineConfig, GuidanceInterpreter, ReplyComposer, TickContext,
};
pub use intent::ToolCallResult;
pub use joke::JokeAgent;
pub use outcome::{
    Intent, OutcomeStatus, ParsedIntent, StepOutcome, ToolRequest, normalize_guidance,
    parse_intent,
};
pub use persona::PersonaAgent;
