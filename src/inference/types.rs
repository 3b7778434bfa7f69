//! Provider-neutral conversation types.
//!
//! The agent loop speaks these; each provider binding translates them to its
//! own wire format.

use serde::{Deserialize, Serialize};

use crate::mcp_client::ToolSpec;

/// One request from the model to run a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolRequest {
    /// Provider-assigned call id, echoed back in the tool result.
    pub id: String,
    /// Namespaced tool name as offered to the model.
    pub tool_name: String,
    /// Parsed arguments. When the model's JSON did not parse, this holds the
    /// raw text and `argument_error` says why.
    pub arguments: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub argument_error: Option<String>,
}

impl ToolRequest {
    pub fn new(id: impl Into<String>, tool_name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            tool_name: tool_name.into(),
            arguments,
            argument_error: None,
        }
    }

    /// A request whose arguments were not valid JSON. It still gets a tool
    /// result turn so the model can retry.
    pub fn with_invalid_arguments(
        id: impl Into<String>,
        tool_name: impl Into<String>,
        raw: &str,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            tool_name: tool_name.into(),
            arguments: serde_json::Value::String(raw.to_string()),
            argument_error: Some(reason.into()),
        }
    }

    /// Arguments as the JSON text to replay to a provider. Unparsed
    /// arguments are sent back exactly as the model wrote them.
    pub fn arguments_json(&self) -> String {
        match (&self.argument_error, &self.arguments) {
            (Some(_), serde_json::Value::String(raw)) => raw.clone(),
            _ => self.arguments.to_string(),
        }
    }
}

/// A turn of the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Turn {
    User {
        text: String,
    },
    Assistant {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_requests: Vec<ToolRequest>,
    },
    ToolResult {
        call_id: String,
        tool_name: String,
        content: String,
        is_error: bool,
    },
}

/// What the provider decided.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    /// A final answer; the run ends.
    Final { text: String },
    /// One or more tool calls, optionally with accompanying text.
    ToolRequests {
        text: Option<String>,
        requests: Vec<ToolRequest>,
    },
}

/// Everything a provider needs for one completion call.
#[derive(Debug, Clone, Copy)]
pub struct CompletionRequest<'a> {
    pub system_prompt: &'a str,
    pub history: &'a [Turn],
    pub tools: &'a [ToolSpec],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_turn_serialization_is_tagged_by_role() {
        let turn = Turn::ToolResult {
            call_id: "c1".into(),
            tool_name: "demo__add".into(),
            content: "8".into(),
            is_error: false,
        };
        let json = serde_json::to_value(&turn).unwrap();
        assert_eq!(json["role"], "tool_result");
        assert_eq!(json["call_id"], "c1");
    }

    #[test]
    fn test_assistant_turn_omits_empty_fields() {
        let turn = Turn::Assistant {
            text: None,
            tool_requests: vec![],
        };
        let json = serde_json::to_string(&turn).unwrap();
        assert_eq!(json, r#"{"role":"assistant"}"#);
    }

    #[test]
    fn test_invalid_arguments_replay_raw_text() {
        let request = ToolRequest::with_invalid_arguments("c1", "demo__add", "{\"a\":5,", "EOF");
        assert_eq!(request.arguments_json(), "{\"a\":5,");
        let valid = ToolRequest::new("c2", "demo__add", serde_json::json!({"a": 5}));
        assert_eq!(valid.arguments_json(), r#"{"a":5}"#);
        assert!(serde_json::to_value(&valid).unwrap().get("argumentError").is_none());
    }
}
