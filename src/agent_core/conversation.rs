//! Conversation state for a single run.
//!
//! Turns are append-only and live only as long as the run. Nothing here is
//! persisted.

use crate::inference::types::{ToolRequest, Turn};

use super::tokens::estimate_turn_tokens;

#[derive(Debug, Clone, Default)]
pub struct ConversationState {
    turns: Vec<Turn>,
}

impl ConversationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a conversation with the user's prompt.
    pub fn with_prompt(prompt: &str) -> Self {
        let mut state = Self::new();
        state.add_user_message(prompt);
        state
    }

    pub fn add_user_message(&mut self, text: &str) {
        self.turns.push(Turn::User {
            text: text.to_string(),
        });
    }

    /// Record the assistant's tool requests (and any text that came with them).
    pub fn add_tool_requests(&mut self, text: Option<String>, requests: Vec<ToolRequest>) {
        self.turns.push(Turn::Assistant {
            text,
            tool_requests: requests,
        });
    }

    pub fn add_assistant_message(&mut self, text: &str) {
        self.turns.push(Turn::Assistant {
            text: Some(text.to_string()),
            tool_requests: Vec::new(),
        });
    }

    pub fn add_tool_result(&mut self, call_id: &str, tool_name: &str, content: String, is_error: bool) {
        self.turns.push(Turn::ToolResult {
            call_id: call_id.to_string(),
            tool_name: tool_name.to_string(),
            content,
            is_error,
        });
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn estimated_tokens(&self) -> u32 {
        self.turns.iter().map(estimate_turn_tokens).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_turn_order_is_preserved() {
        let mut state = ConversationState::with_prompt("what is 5+3");
        state.add_tool_requests(
            None,
            vec![ToolRequest {
                id: "c1".into(),
                tool_name: "demo__add".into(),
                arguments: serde_json::json!({"a": 5, "b": 3}),
                argument_error: None,
            }],
        );
        state.add_tool_result("c1", "demo__add", "8".into(), false);
        state.add_assistant_message("8");

        assert_eq!(state.len(), 4);
        assert!(matches!(state.turns()[0], Turn::User { .. }));
        assert!(matches!(
            &state.turns()[2],
            Turn::ToolResult { call_id, is_error: false, .. } if call_id == "c1"
        ));
        assert!(state.estimated_tokens() > 0);
    }
}
