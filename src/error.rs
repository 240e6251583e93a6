//! Error types shared across the runtime.

use thiserror::Error;

/// Error type for the storage layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Error type for agent engines, behaviors, and lifecycle operations.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Tick failed: {0}")]
    Tick(String),

    #[error("Guidance error: {0}")]
    Guidance(String),

    #[error("Unknown agent type: {0}")]
    UnknownAgentType(String),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Tool(#[from] crate::tools::ToolError),
}

impl From<serde_json::Error> for AgentError {
    fn from(err: serde_json::Error) -> Self {
        AgentError::MalformedPayload(err.to_string())
    }
}
