//! Completion providers: the model side of the agent loop.
//!
//! This module handles:
//! - The provider-neutral conversation types (`Turn`, `Completion`)
//! - The `CompletionProvider` trait and its construction from config
//! - OpenAI Chat Completions and Anthropic Messages bindings
//! - Retry with exponential backoff on transient HTTP failures
//!
//! Switching providers is a config change, not a code change.

pub mod anthropic;
pub mod config;
pub mod errors;
pub mod openai;
pub mod provider;
pub mod types;

pub use config::{ProviderConfig, ProviderKind};
pub use errors::InferenceError;
pub use provider::{build_provider, CompletionProvider};
pub use types::{Completion, CompletionRequest, ToolRequest, Turn};
