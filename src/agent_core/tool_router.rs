//! ToolRouter: dispatches model tool calls to backend servers.
//!
//! The router is the bridge between the model's tool call decisions and the
//! connection registry. It handles:
//! - Splitting namespaced names into backend and local tool
//! - Lazy activation of the target backend (through the registry)
//! - Concurrent dispatch of a batch, with results in request order
//! - "Did you mean" suggestions for unknown or malformed names

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};

use crate::mcp_client::{
    CallToolResult, ConnectionRegistry, McpError, NamespacedTool, ToolCatalog, ToolFilter,
    ToolName, ToolSpec,
};

/// How many similar names to offer with an unknown-tool error.
const MAX_SUGGESTIONS: usize = 3;

/// One dispatched call with its timing.
#[derive(Debug)]
pub struct DispatchOutcome {
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub result: Result<CallToolResult, McpError>,
}

#[derive(Clone)]
pub struct ToolRouter {
    registry: Arc<ConnectionRegistry>,
}

impl ToolRouter {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    // ─── Catalog ────────────────────────────────────────────────────────

    /// Flattened view of every tool on every active backend.
    pub fn catalog(&self) -> ToolCatalog {
        self.registry.catalog()
    }

    pub fn search(&self, filter: &ToolFilter) -> Vec<NamespacedTool> {
        self.catalog().search(filter)
    }

    pub fn tool_specs(&self) -> Vec<ToolSpec> {
        self.catalog().tool_specs()
    }

    // ─── Dispatch ───────────────────────────────────────────────────────

    /// Route one call. The only path through which a call may connect a
    /// backend on demand.
    pub async fn dispatch(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<CallToolResult, McpError> {
        let tool_name = ToolName::parse(name)?;
        tracing::debug!(tool = %tool_name, "dispatching tool call");
        self.registry
            .call_tool(tool_name.backend(), tool_name.local(), arguments)
            .await
    }

    /// Dispatch a batch concurrently. Outcomes come back in request order and
    /// the whole batch finishes before this returns.
    pub async fn dispatch_batch(&self, calls: &[(String, serde_json::Value)]) -> Vec<DispatchOutcome> {
        let futures = calls.iter().map(|(name, arguments)| async move {
            let started_at = Utc::now();
            let start = Instant::now();
            let result = self.dispatch(name, arguments.clone()).await;
            let duration_ms = start.elapsed().as_millis() as u64;

            match &result {
                Ok(r) => tracing::info!(tool = %name, duration_ms, is_error = r.is_error, "tool call finished"),
                Err(e) => tracing::warn!(tool = %name, duration_ms, kind = e.kind(), error = %e, "tool call failed"),
            }

            DispatchOutcome {
                started_at,
                duration_ms,
                result,
            }
        });
        futures::future::join_all(futures).await
    }

    /// Catalog names close to `name`, for errors where the model likely
    /// misspelled a tool.
    pub fn suggestions_for(&self, name: &str, err: &McpError) -> Vec<String> {
        match err {
            McpError::UnknownTool { .. }
            | McpError::MalformedToolName { .. }
            | McpError::UnknownBackend { .. } => {
                self.catalog().find_similar(name, MAX_SUGGESTIONS)
            }
            _ => Vec::new(),
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
