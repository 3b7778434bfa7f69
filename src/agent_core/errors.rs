//! Agent Core error types.

use thiserror::Error;

/// Errors raised by the agent loop itself and by the in-process meta-tools.
///
/// Backend failures stay `McpError`; provider failures stay `InferenceError`.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Invalid agent configuration (zero iteration cap and the like).
    #[error("invalid agent config: {reason}")]
    InvalidConfig { reason: String },

    /// A `bridge__*` name that no meta-tool answers to.
    #[error("unknown meta-tool '{name}'")]
    UnknownMetaTool { name: String },

    /// Tool arguments did not parse, or did not match a meta-tool schema.
    #[error("invalid arguments for '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },

    /// Serialization error.
    #[error("serialization error: {reason}")]
    SerializationError { reason: String },
}

impl AgentError {
    /// Stable snake_case tag for structured error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::InvalidConfig { .. } => "config_error",
            AgentError::UnknownMetaTool { .. } => "unknown_tool_error",
            AgentError::InvalidArguments { .. } => "invalid_arguments_error",
            AgentError::SerializationError { .. } => "serialization_error",
        }
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::SerializationError {
            reason: e.to_string(),
        }
    }
}
