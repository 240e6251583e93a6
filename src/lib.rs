//! Concurrent looping-agent runtime.
//!
//! Agents are cooperative loops driven by per-session engines: each
//! iteration waits, drains steering interrupts, ticks a pluggable behavior,
//! executes the resulting intent, and persists a step record. A lifecycle
//! registry owns the sessions, a dispatcher drains a durable action queue
//! into registry operations, and two reconcilers keep shared conversations
//! converged: fan-out turns new messages into participant interrupts, and
//! rehydration restarts participants that died with their read cursor
//! restored.

pub mod agent;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod reconcile;
pub mod registry;
pub mod store;
pub mod sync;
pub mod tools;

pub use agent::{AgentBehavior, AgentEngine, EngineConfig, StepOutcome};
pub use config::RuntimeConfig;
pub use dispatch::ActionDispatcher;
pub use error::{AgentError, StoreError};
pub use reconcile::{FanoutReconciler, RehydrationReconciler};
pub use registry::{AgentRegistry, CreateAgentRequest};
pub use store::Stores;
pub use sync::EngineControls;
pub use tools::ToolRegistry;
