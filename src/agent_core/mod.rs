//! Agent Core: the orchestration layer of the bridge.
//!
//! Submodules:
//! - `agent_loop`: Drives a run through provider calls and tool batches
//! - `tool_router`: Dispatches namespaced tool calls to backends
//! - `meta_tools`: In-process `bridge__*` tools for managing backends
//! - `conversation`: Per-run conversation state
//! - `prompt`: System prompt and context rendering
//! - `tokens`: Token estimation and UTF-8 safe truncation
//! - `types`: Run inputs, results, and invocation records
//! - `errors`: Agent-level error types

pub mod agent_loop;
pub mod conversation;
pub mod errors;
pub mod meta_tools;
pub mod prompt;
pub mod tokens;
pub mod tool_router;
pub mod types;

// Re-exports for convenience
pub use agent_loop::{AgentConfig, AgentLoop};
pub use conversation::ConversationState;
pub use errors::AgentError;
pub use tool_router::{DispatchOutcome, ToolRouter};
pub use types::{RunContext, RunOutcome, RunResult, ToolErrorPayload, ToolInvocationRecord};
