//! MCP bridge error types.
//!
//! One enum covers the whole plumbing path from the router down to the
//! transport. `kind()` gives a stable tag that is surfaced to the model in
//! structured tool-error turns.

use thiserror::Error;

/// Errors that can occur while spawning, talking to, or routing between
/// backend tool servers.
#[derive(Debug, Error)]
pub enum McpError {
    /// The backend executable could not be started.
    #[error("failed to spawn backend '{name}': {reason}")]
    SpawnFailed { name: String, reason: String },

    /// The `initialize` exchange failed or timed out.
    #[error("backend '{name}' handshake failed: {reason}")]
    HandshakeFailed { name: String, reason: String },

    /// The backend answered with something that is not valid protocol.
    #[error("protocol error from backend '{name}': {reason}")]
    Protocol { name: String, reason: String },

    /// Writing a request to the backend's stdin failed.
    #[error("transport write to '{server}' failed: {reason}")]
    TransportWrite { server: String, reason: String },

    /// The backend's output stream closed while a response was outstanding.
    #[error("transport to '{server}' closed")]
    TransportClosed { server: String },

    /// An active backend died underneath a call. The next dispatch reconnects.
    #[error("backend '{name}' crashed: {reason}")]
    BackendCrashed { name: String, reason: String },

    /// No descriptor with this name is known to the registry.
    #[error("unknown backend: '{name}'")]
    UnknownBackend { name: String },

    /// The backend is connected but does not offer this tool.
    #[error("backend '{server}' has no tool '{tool}'")]
    UnknownTool { server: String, tool: String },

    /// The namespaced name cannot be split into backend and local parts.
    #[error("malformed tool name '{name}': {reason}")]
    MalformedToolName { name: String, reason: String },

    /// The backend ran the tool and reported failure.
    #[error("tool '{tool}' failed: {message}")]
    ToolExecution {
        tool: String,
        message: String,
        payload: serde_json::Value,
    },

    /// A request did not complete within its deadline.
    #[error("'{operation}' on '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        operation: String,
        timeout_ms: u64,
    },

    /// A call was attempted on a connection that is not in `connected` state.
    #[error("backend '{name}' is not connected")]
    NotConnected { name: String },

    /// The registry was shut down; no new connections are made.
    #[error("connection registry is shut down")]
    RegistryShutDown,

    /// Configuration error (bad servers file, invalid backend name).
    #[error("config error: {reason}")]
    ConfigError { reason: String },
}

impl McpError {
    /// Stable snake_case tag for structured error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            McpError::SpawnFailed { .. } => "backend_spawn_error",
            McpError::HandshakeFailed { .. } => "backend_handshake_error",
            McpError::Protocol { .. } => "backend_protocol_error",
            McpError::TransportWrite { .. } => "transport_write_error",
            McpError::TransportClosed { .. } => "transport_closed_error",
            McpError::BackendCrashed { .. } => "backend_crashed_error",
            McpError::UnknownBackend { .. } => "unknown_backend_error",
            McpError::UnknownTool { .. } => "unknown_tool_error",
            McpError::MalformedToolName { .. } => "malformed_tool_name_error",
            McpError::ToolExecution { .. } => "tool_execution_error",
            McpError::Timeout { .. } => "tool_timeout_error",
            McpError::NotConnected { .. } => "not_connected_error",
            McpError::RegistryShutDown => "registry_shut_down_error",
            McpError::ConfigError { .. } => "config_error",
        }
    }

    /// Whether a later dispatch of the same tool may succeed without operator
    /// intervention.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            McpError::BackendCrashed { .. }
                | McpError::TransportClosed { .. }
                | McpError::Timeout { .. }
                | McpError::ToolExecution { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags_are_snake_case() {
        let errors = [
            McpError::UnknownBackend { name: "x".into() },
            McpError::MalformedToolName {
                name: "x".into(),
                reason: "r".into(),
            },
            McpError::RegistryShutDown,
        ];
        for err in &errors {
            let kind = err.kind();
            assert!(kind.chars().all(|c| c.is_ascii_lowercase() || c == '_'));
        }
    }

    #[test]
    fn test_crash_is_recoverable_spawn_is_not() {
        assert!(McpError::BackendCrashed {
            name: "fs".into(),
            reason: "exit".into()
        }
        .is_recoverable());
        assert!(!McpError::SpawnFailed {
            name: "fs".into(),
            reason: "enoent".into()
        }
        .is_recoverable());
    }

    #[test]
    fn test_display_includes_names() {
        let err = McpError::UnknownTool {
            server: "demo".into(),
            tool: "nope".into(),
        };
        assert_eq!(err.to_string(), "backend 'demo' has no tool 'nope'");
    }
}
