//! Shared types for the agent core.
//!
//! Run inputs and outputs, and the audit record kept for every tool
//! invocation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::mcp_client::McpError;

use super::errors::AgentError;
use super::tokens::truncate_tool_result;

// ─── Run Input ──────────────────────────────────────────────────────────────

/// Editor context folded into the system prompt. Advisory text only; never
/// checked against the filesystem.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunContext {
    #[serde(default)]
    pub workspace_folders: Vec<String>,
    #[serde(default)]
    pub open_files: Vec<String>,
    #[serde(default)]
    pub current_file: Option<String>,
    #[serde(default)]
    pub selection: Option<String>,
}

// ─── Run Output ─────────────────────────────────────────────────────────────

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// The provider returned a final answer.
    Completed,
    /// The iteration cap was reached without a final answer.
    IterationLimit,
    /// The provider call failed.
    ProviderError,
    /// The run was cancelled by the caller.
    Cancelled,
}

/// Result of one agent run. Always well-formed, whatever the outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub run_id: String,
    pub success: bool,
    pub answer: String,
    pub tool_invocation_records: Vec<ToolInvocationRecord>,
    pub iteration_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub outcome: RunOutcome,
}

// ─── Tool Invocations ───────────────────────────────────────────────────────

/// Structured failure surfaced to the model and kept in the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolErrorPayload {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
    /// Backend-reported detail for tool execution errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ToolErrorPayload {
    pub fn from_mcp(err: &McpError, suggestions: Vec<String>) -> Self {
        let details = match err {
            McpError::ToolExecution { payload, .. } if !payload.is_null() => Some(payload.clone()),
            _ => None,
        };
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
            suggestions,
            details,
        }
    }

    pub fn from_agent(err: &AgentError, suggestions: Vec<String>) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
            suggestions,
            details: None,
        }
    }

    /// Apply the tool-result cap to an error. The message is truncated like a
    /// result; details that do not fit are dropped, since the message already
    /// carries the backend's text. A `max_len` of zero disables the cap.
    pub fn capped(mut self, max_len: usize) -> Self {
        if max_len == 0 {
            return self;
        }
        self.message = truncate_tool_result(&self.message, max_len);
        let details_len = self.details.as_ref().map_or(0, |d| d.to_string().len());
        if details_len > max_len {
            self.details = None;
        }
        self
    }

    /// The tool-result turn content: `{"error": {kind, message, tool, suggestions}}`.
    pub fn to_turn_content(&self, tool: &str) -> String {
        let mut error = serde_json::json!({
            "kind": self.kind,
            "message": self.message,
            "tool": tool,
            "suggestions": self.suggestions,
        });
        if let Some(details) = &self.details {
            error["details"] = details.clone();
        }
        serde_json::json!({ "error": error }).to_string()
    }
}

/// One tool invocation made during a run. Never mutated after it is pushed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocationRecord {
    pub call_id: String,
    pub tool: String,
    pub arguments: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolErrorPayload>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl ToolInvocationRecord {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}
