//! Token estimation and result truncation.
//!
//! Uses character-based heuristics calibrated for LLM tokenizers:
//! - English prose: ~3.2 chars/token (conservative, overestimates)
//! - JSON/structured content: ~2.8 chars/token
//!
//! Estimates are only used for logging the size of each provider call.

use crate::inference::types::Turn;
use crate::mcp_client::ToolSpec;

// ─── Constants ──────────────────────────────────────────────────────────────

/// Average characters per token for English prose.
const CHARS_PER_TOKEN: f64 = 3.2;

/// Average characters per token for JSON/structured content.
const JSON_CHARS_PER_TOKEN: f64 = 2.8;

/// Per-turn overhead (role label, formatting tokens).
const TURN_OVERHEAD_TOKENS: u32 = 4;

/// Overhead for tool call JSON structure (per call).
const TOOL_CALL_OVERHEAD_TOKENS: u32 = 10;

// ─── UTF-8 Safe Truncation ──────────────────────────────────────────────────

/// Truncate a string to at most `max_bytes` bytes on a valid UTF-8 char boundary.
///
/// If the byte at `max_bytes` is inside a multi-byte character, the slice is
/// shortened to the preceding character boundary.
pub fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Cap a rendered tool result at `max_len` bytes, appending a marker that
/// says how much was dropped. A `max_len` of zero disables the cap.
pub fn truncate_tool_result(text: &str, max_len: usize) -> String {
    if max_len == 0 || text.len() <= max_len {
        return text.to_string();
    }
    let kept = truncate_utf8(text, max_len);
    format!(
        "{kept}\n[truncated: {} of {} bytes omitted]",
        text.len() - kept.len(),
        text.len()
    )
}

// ─── Estimation ─────────────────────────────────────────────────────────────

/// Estimate the token count for a string of natural language text.
pub fn estimate_tokens(text: &str) -> u32 {
    let chars = text.len() as f64;
    (chars / CHARS_PER_TOKEN).ceil() as u32
}

/// Estimate the token count for JSON/structured content.
pub fn estimate_json_tokens(json_text: &str) -> u32 {
    let chars = json_text.len() as f64;
    (chars / JSON_CHARS_PER_TOKEN).ceil() as u32
}

/// Estimate the token count for one conversation turn.
pub fn estimate_turn_tokens(turn: &Turn) -> u32 {
    let mut total = TURN_OVERHEAD_TOKENS;
    match turn {
        Turn::User { text } => total += estimate_tokens(text),
        Turn::Assistant {
            text,
            tool_requests,
        } => {
            if let Some(text) = text {
                total += estimate_tokens(text);
            }
            for request in tool_requests {
                total += TOOL_CALL_OVERHEAD_TOKENS;
                total += estimate_tokens(&request.tool_name);
                total += estimate_json_tokens(&request.arguments.to_string());
            }
        }
        Turn::ToolResult { call_id, content, .. } => {
            total += estimate_tokens(call_id);
            total += estimate_json_tokens(content);
        }
    }
    total
}

/// Estimate the full prompt size of one provider call.
pub fn estimate_request_tokens(system_prompt: &str, history: &[Turn], tools: &[ToolSpec]) -> u32 {
    let system = TURN_OVERHEAD_TOKENS + estimate_tokens(system_prompt);
    let turns: u32 = history.iter().map(estimate_turn_tokens).sum();
    let schemas = serde_json::to_string(tools).unwrap_or_default();
    system + turns + estimate_json_tokens(&schemas)
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::types::ToolRequest;

    #[test]
    fn test_estimate_tokens_empty() {
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn test_estimate_tokens_short() {
        // "hello" = 5 chars → ceil(5/3.2) = 2
        assert_eq!(estimate_tokens("hello"), 2);
    }

    #[test]
    fn test_estimate_json_tokens() {
        // 16 chars → ceil(16/2.8) = 6
        let json = r#"{"path": "/tmp"}"#;
        assert_eq!(estimate_json_tokens(json), 6);
    }

    #[test]
    fn test_estimate_turn_tokens_user() {
        let turn = Turn::User {
            text: "Hello, world!".into(), // 13 chars → 5
        };
        assert_eq!(estimate_turn_tokens(&turn), 9);
    }

    #[test]
    fn test_estimate_turn_tokens_with_tool_requests() {
        let turn = Turn::Assistant {
            text: None,
            tool_requests: vec![ToolRequest {
                id: "call_1".into(),
                tool_name: "filesystem__list_dir".into(),
                arguments: serde_json::json!({"path": "/tmp"}),
                argument_error: None,
            }],
        };
        assert!(estimate_turn_tokens(&turn) > TURN_OVERHEAD_TOKENS + TOOL_CALL_OVERHEAD_TOKENS);
    }

    #[test]
    fn test_estimate_request_tokens_counts_everything() {
        let history = vec![Turn::User { text: "hi".into() }];
        let bare = estimate_request_tokens("sys", &history, &[]);
        let tools = vec![ToolSpec {
            name: "demo__add".into(),
            description: "Add two numbers".into(),
            input_schema: serde_json::json!({"type": "object"}),
        }];
        assert!(estimate_request_tokens("sys", &history, &tools) > bare);
    }

    #[test]
    fn test_truncate_utf8_ascii() {
        assert_eq!(truncate_utf8("hello world", 5), "hello");
    }

    #[test]
    fn test_truncate_utf8_within_multibyte() {
        // '═' is U+2550, encoded as 3 bytes
        let text = "═══";
        assert_eq!(truncate_utf8(text, 4), "═");
        assert_eq!(truncate_utf8(text, 6), "══");
    }

    #[test]
    fn test_truncate_utf8_no_truncation_needed() {
        assert_eq!(truncate_utf8("short", 100), "short");
    }

    #[test]
    fn test_truncate_tool_result_marks_omission() {
        let text = "é".repeat(10); // 20 bytes
        let out = truncate_tool_result(&text, 5);
        assert!(out.starts_with("éé\n"));
        assert!(out.ends_with("[truncated: 16 of 20 bytes omitted]"));
        assert_eq!(truncate_tool_result("short", 100), "short");
        assert_eq!(truncate_tool_result(&text, 0), text);
    }
}
