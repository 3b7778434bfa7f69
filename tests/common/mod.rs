#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use mcp_bridge::inference::{
    Completion, CompletionProvider, CompletionRequest, InferenceError, ToolRequest, Turn,
};
use mcp_bridge::mcp_client::{ConnectionOptions, ConnectionRegistry, ServerDescriptor};

pub const DEMO_SERVER: &str = env!("CARGO_BIN_EXE_demo-tool-server");

/// A backend running the demo server under `name`.
pub fn demo_backend(name: &str) -> ServerDescriptor {
    ServerDescriptor::new(name, DEMO_SERVER, &[])
}

/// A backend whose executable does not exist.
pub fn missing_backend(name: &str) -> ServerDescriptor {
    ServerDescriptor::new(name, "/nonexistent/bin/mcp-server-that-is-not-there", &[])
}

pub fn test_options() -> ConnectionOptions {
    ConnectionOptions {
        handshake_timeout: Duration::from_secs(10),
        shutdown_grace: Duration::from_millis(500),
        call_timeout: Some(Duration::from_secs(10)),
        ..ConnectionOptions::default()
    }
}

pub fn registry(descriptors: Vec<ServerDescriptor>) -> Arc<ConnectionRegistry> {
    Arc::new(ConnectionRegistry::new(descriptors, test_options()).unwrap())
}

pub fn tool_call(id: &str, tool: &str, arguments: serde_json::Value) -> Completion {
    Completion::ToolRequests {
        text: None,
        requests: vec![ToolRequest::new(id, tool, arguments)],
    }
}

pub fn final_answer(text: &str) -> Completion {
    Completion::Final { text: text.into() }
}

/// Replays canned completions and remembers the history it was shown.
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Completion>>,
    seen: Mutex<Vec<Vec<Turn>>>,
    seen_tools: Mutex<Vec<Vec<String>>>,
}

impl ScriptedProvider {
    pub fn new(script: Vec<Completion>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            seen: Mutex::new(Vec::new()),
            seen_tools: Mutex::new(Vec::new()),
        })
    }

    /// History passed on each call, in call order.
    pub fn seen(&self) -> Vec<Vec<Turn>> {
        self.seen.lock().unwrap().clone()
    }

    /// Tool names offered on each call, in call order.
    pub fn seen_tools(&self) -> Vec<Vec<String>> {
        self.seen_tools.lock().unwrap().clone()
    }

    /// Tool result turns from the most recent call.
    pub fn last_tool_results(&self) -> Vec<(String, String, bool)> {
        let seen = self.seen.lock().unwrap();
        seen.last()
            .map(|turns| {
                turns
                    .iter()
                    .filter_map(|t| match t {
                        Turn::ToolResult {
                            tool_name,
                            content,
                            is_error,
                            ..
                        } => Some((tool_name.clone(), content.clone(), *is_error)),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: CompletionRequest<'_>) -> Result<Completion, InferenceError> {
        self.seen.lock().unwrap().push(request.history.to_vec());
        self.seen_tools
            .lock()
            .unwrap()
            .push(request.tools.iter().map(|t| t.name.clone()).collect());
        Ok(self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| final_answer("done")))
    }
}
