//! One backend's session: process, transport, and tool snapshot.
//!
//! A `BackendConnection` walks the state machine
//! `unconnected → connecting → connected → disconnecting → disconnected`.
//! Spawning, the `initialize` handshake, and tool enumeration happen in
//! `connect`; the tool list is captured once and never refreshed for the
//! lifetime of the connection.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncBufReadExt;
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::transport::{extract_result, StdioTransport};
use super::types::{
    CallToolResult, InitializeResult, ListToolsResult, ServerDescriptor, ServerIdentity,
    ToolDescriptor, ToolInventory, PROTOCOL_VERSION,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Default bound on spawn + `initialize` + `tools/list`.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Time a backend gets to exit after stdin closes before it is killed.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Default deadline for a single `tools/call`.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Stderr lines retained for error messages.
const STDERR_TAIL_LINES: usize = 20;

/// Upper bound on `tools/list` pages, guards against a cursor loop.
const MAX_TOOL_PAGES: usize = 100;

// ─── Options ─────────────────────────────────────────────────────────────────

/// Knobs shared by every connection a registry opens.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub handshake_timeout: Duration,
    pub shutdown_grace: Duration,
    /// `None` disables the per-call deadline.
    pub call_timeout: Option<Duration>,
    /// Working directory for backends without their own `cwd`.
    pub working_dir: Option<PathBuf>,
    pub client_name: String,
    pub client_version: String,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            call_timeout: Some(DEFAULT_CALL_TIMEOUT),
            working_dir: None,
            client_name: env!("CARGO_PKG_NAME").to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

// ─── State ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Unconnected,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// Ring buffer of the most recent stderr lines.
#[derive(Clone, Default)]
struct StderrTail(Arc<Mutex<VecDeque<String>>>);

impl StderrTail {
    fn push(&self, line: String) {
        let mut lines = self.0.lock().unwrap_or_else(|p| p.into_inner());
        if lines.len() == STDERR_TAIL_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    fn snapshot(&self) -> String {
        let lines = self.0.lock().unwrap_or_else(|p| p.into_inner());
        let joined = lines.iter().cloned().collect::<Vec<_>>().join("\n");
        if joined.len() > 2000 {
            format!(
                "{}...(truncated)",
                crate::agent_core::tokens::truncate_utf8(&joined, 2000)
            )
        } else {
            joined
        }
    }
}

// ─── BackendConnection ───────────────────────────────────────────────────────

/// A live backend process with its transport and tool snapshot.
pub struct BackendConnection {
    descriptor: ServerDescriptor,
    options: ConnectionOptions,
    state: Mutex<ConnectionState>,
    child: tokio::sync::Mutex<Option<Child>>,
    pid: Option<u32>,
    transport: Option<StdioTransport>,
    identity: ServerIdentity,
    inventory: ToolInventory,
    stderr_tail: StderrTail,
    stderr_task: Option<JoinHandle<()>>,
    connected_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for BackendConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendConnection")
            .field("name", &self.descriptor.name)
            .field("state", &self.state())
            .field("pid", &self.pid)
            .field("tools", &self.inventory.tools().len())
            .finish()
    }
}

impl BackendConnection {
    pub fn new(descriptor: ServerDescriptor, options: ConnectionOptions) -> Self {
        Self {
            descriptor,
            options,
            state: Mutex::new(ConnectionState::Unconnected),
            child: tokio::sync::Mutex::new(None),
            pid: None,
            transport: None,
            identity: ServerIdentity::default(),
            inventory: ToolInventory::NotAdvertised,
            stderr_tail: StderrTail::default(),
            stderr_task: None,
            connected_at: None,
        }
    }

    // ─── Accessors ───────────────────────────────────────────────────────

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &ServerDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, next: ConnectionState) -> ConnectionState {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        std::mem::replace(&mut *state, next)
    }

    pub fn identity(&self) -> &ServerIdentity {
        &self.identity
    }

    pub fn inventory(&self) -> &ToolInventory {
        &self.inventory
    }

    pub fn tools(&self) -> &[ToolDescriptor] {
        self.inventory.tools()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        self.connected_at
    }

    /// Connected and the transport is still readable.
    pub fn is_alive(&self) -> bool {
        self.state() == ConnectionState::Connected
            && self.transport.as_ref().is_some_and(|t| !t.is_closed())
    }

    pub fn protocol_violations(&self) -> u64 {
        self.transport
            .as_ref()
            .map(StdioTransport::protocol_violations)
            .unwrap_or(0)
    }

    /// Future that resolves when the backend's output stream closes.
    pub fn closed_signal(&self) -> Option<impl std::future::Future<Output = ()> + Send + 'static> {
        self.transport.as_ref().map(StdioTransport::closed)
    }

    // ─── Connect ─────────────────────────────────────────────────────────

    /// Spawn the backend, run the handshake, and capture its tools.
    ///
    /// On any failure the process is killed and the connection returns to
    /// `unconnected`.
    pub async fn connect(&mut self) -> Result<(), McpError> {
        let current = self.state();
        if current != ConnectionState::Unconnected {
            return Err(McpError::Protocol {
                name: self.name().to_string(),
                reason: format!("connect called in state {current:?}"),
            });
        }
        self.set_state(ConnectionState::Connecting);

        match self.spawn_and_negotiate().await {
            Ok(()) => {
                self.connected_at = Some(Utc::now());
                self.set_state(ConnectionState::Connected);
                tracing::info!(
                    server = %self.name(),
                    pid = ?self.pid,
                    tools = self.tools().len(),
                    tools_advertised = !matches!(self.inventory, ToolInventory::NotAdvertised),
                    "backend connected"
                );
                Ok(())
            }
            Err(e) => {
                self.abandon().await;
                self.set_state(ConnectionState::Unconnected);
                tracing::warn!(server = %self.name(), error = %e, "backend connect failed");
                Err(e)
            }
        }
    }

    async fn spawn_and_negotiate(&mut self) -> Result<(), McpError> {
        let name = self.descriptor.name.clone();
        let mut child = self.spawn_process()?;
        self.pid = child.id();

        let stdin = child.stdin.take().ok_or(McpError::SpawnFailed {
            name: name.clone(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or(McpError::SpawnFailed {
            name: name.clone(),
            reason: "failed to capture stdout".into(),
        })?;
        if let Some(stderr) = child.stderr.take() {
            self.stderr_task = Some(spawn_stderr_drain(
                &name,
                stderr,
                self.stderr_tail.clone(),
            ));
        }
        *self.child.lock().await = Some(child);

        let transport = StdioTransport::new(&name, stdin, stdout);
        let handshake = negotiate(
            &transport,
            &name,
            &self.options.client_name,
            &self.options.client_version,
        );
        let outcome = tokio::time::timeout(self.options.handshake_timeout, handshake).await;
        self.transport = Some(transport);

        let (identity, mut inventory) = match outcome {
            Ok(Ok(negotiated)) => negotiated,
            Ok(Err(e)) => return Err(self.with_stderr_context(e).await),
            Err(_) => {
                let e = McpError::HandshakeFailed {
                    name: name.clone(),
                    reason: format!(
                        "timed out after {}ms",
                        self.options.handshake_timeout.as_millis()
                    ),
                };
                return Err(self.with_stderr_context(e).await);
            }
        };

        if let (ToolInventory::Listed(tools), Some(category)) =
            (&mut inventory, self.descriptor.category.as_ref())
        {
            for tool in tools.iter_mut().filter(|t| t.category.is_none()) {
                tool.category = Some(category.clone());
            }
        }

        self.identity = identity;
        self.inventory = inventory;
        Ok(())
    }

    fn spawn_process(&self) -> Result<Child, McpError> {
        let mut cmd = Command::new(&self.descriptor.command);
        cmd.args(&self.descriptor.args);

        // Inherited environment plus the descriptor's overrides.
        cmd.envs(&self.descriptor.env);

        let effective_dir = self
            .descriptor
            .cwd
            .as_ref()
            .map(PathBuf::from)
            .or_else(|| self.options.working_dir.clone());
        if let Some(dir) = effective_dir {
            cmd.current_dir(dir);
        }

        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        tracing::debug!(
            server = %self.descriptor.name,
            command = %self.descriptor.command,
            args = ?self.descriptor.args,
            "spawning backend"
        );

        cmd.spawn().map_err(|e| McpError::SpawnFailed {
            name: self.descriptor.name.clone(),
            reason: format!("{}: {e}", self.descriptor.command),
        })
    }

    /// Kill the process and tear down the transport after a failed connect.
    async fn abandon(&mut self) {
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.kill().await;
        }
        if let Some(transport) = self.transport.take() {
            transport.shutdown().await;
        }
    }

    /// Attach the backend's last stderr lines to a handshake failure.
    async fn with_stderr_context(&mut self, err: McpError) -> McpError {
        // Killing closes stderr, which lets the drain task finish.
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.kill().await;
        }
        if let Some(task) = self.stderr_task.take() {
            let _ = tokio::time::timeout(Duration::from_millis(500), task).await;
        }

        let stderr = self.stderr_tail.snapshot();
        if !stderr.is_empty() {
            tracing::warn!(server = %self.name(), stderr = %stderr, "backend stderr captured on failure");
        }
        let suffix = format_stderr_suffix(&stderr);
        let name = self.name().to_string();

        match err {
            McpError::HandshakeFailed { reason, .. } => McpError::HandshakeFailed {
                name,
                reason: format!("{reason}{suffix}"),
            },
            McpError::TransportClosed { .. } | McpError::TransportWrite { .. } => {
                McpError::HandshakeFailed {
                    name,
                    reason: format!("backend exited during handshake{suffix}"),
                }
            }
            McpError::Protocol { reason, .. } => McpError::Protocol {
                name,
                reason: format!("{reason}{suffix}"),
            },
            other => other,
        }
    }

    // ─── Calls ───────────────────────────────────────────────────────────

    /// Invoke a tool by its local name.
    pub async fn call_tool(
        &self,
        local_name: &str,
        arguments: serde_json::Value,
    ) -> Result<CallToolResult, McpError> {
        let transport = match (&self.transport, self.state()) {
            (Some(t), ConnectionState::Connected) => t,
            _ => {
                return Err(McpError::NotConnected {
                    name: self.name().to_string(),
                })
            }
        };

        if self.inventory.find(local_name).is_none() {
            return Err(McpError::UnknownTool {
                server: self.name().to_string(),
                tool: local_name.to_string(),
            });
        }

        let arguments = if arguments.is_null() {
            serde_json::json!({})
        } else {
            arguments
        };
        let params = serde_json::json!({
            "name": local_name,
            "arguments": arguments,
        });

        let request = transport.request("tools/call", Some(params));
        let response = match self.options.call_timeout {
            Some(limit) => tokio::time::timeout(limit, request).await.map_err(|_| {
                McpError::Timeout {
                    server: self.name().to_string(),
                    operation: format!("tools/call {local_name}"),
                    timeout_ms: limit.as_millis() as u64,
                }
            })??,
            None => request.await?,
        };

        let value = extract_result(response).map_err(|rpc| McpError::ToolExecution {
            tool: local_name.to_string(),
            message: format!("[{}] {}", rpc.code, rpc.message),
            payload: serde_json::json!({
                "code": rpc.code,
                "message": rpc.message,
                "data": rpc.data,
            }),
        })?;

        let result: CallToolResult =
            serde_json::from_value(value.clone()).map_err(|e| McpError::Protocol {
                name: self.name().to_string(),
                reason: format!("malformed tools/call result: {e}"),
            })?;

        if result.is_error {
            return Err(McpError::ToolExecution {
                tool: local_name.to_string(),
                message: result.text(),
                payload: value,
            });
        }

        Ok(result)
    }

    // ─── Disconnect ──────────────────────────────────────────────────────

    /// Close stdin, wait out the grace period, then kill. Never hangs.
    pub async fn disconnect(&self) {
        let previous = self.set_state(ConnectionState::Disconnecting);
        if matches!(
            previous,
            ConnectionState::Unconnected
                | ConnectionState::Disconnecting
                | ConnectionState::Disconnected
        ) {
            self.set_state(previous);
            return;
        }

        if let Some(transport) = &self.transport {
            transport.close_write().await;
        }

        let mut child_slot = self.child.lock().await;
        if let Some(child) = child_slot.as_mut() {
            match tokio::time::timeout(self.options.shutdown_grace, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!(server = %self.name(), status = %status, "backend exited");
                }
                _ => {
                    tracing::warn!(
                        server = %self.name(),
                        grace_ms = self.options.shutdown_grace.as_millis() as u64,
                        "backend did not exit in time, killing"
                    );
                    let _ = child.kill().await;
                }
            }
        }
        *child_slot = None;
        drop(child_slot);

        if let Some(transport) = &self.transport {
            transport.shutdown().await;
        }
        self.set_state(ConnectionState::Disconnected);
        tracing::info!(server = %self.name(), "backend disconnected");
    }

    /// Record that the backend went away on its own. Returns `true` when the
    /// connection was live, i.e. this was a crash rather than an orderly
    /// disconnect.
    pub async fn mark_crashed(&self) -> bool {
        {
            let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            if *state != ConnectionState::Connected {
                return false;
            }
            *state = ConnectionState::Disconnected;
        }

        let mut child_slot = self.child.lock().await;
        if let Some(child) = child_slot.as_mut() {
            match child.try_wait() {
                Ok(Some(status)) => {
                    tracing::warn!(server = %self.name(), status = %status, "backend exited unexpectedly");
                }
                _ => {
                    // Output closed but the process lingers.
                    let _ = child.kill().await;
                }
            }
        }
        *child_slot = None;
        true
    }

    /// Last stderr lines, for status output.
    pub fn stderr_tail(&self) -> String {
        self.stderr_tail.snapshot()
    }
}

// ─── Handshake ───────────────────────────────────────────────────────────────

/// `initialize` → `notifications/initialized` → `tools/list` (when the
/// backend advertises tools).
async fn negotiate(
    transport: &StdioTransport,
    name: &str,
    client_name: &str,
    client_version: &str,
) -> Result<(ServerIdentity, ToolInventory), McpError> {
    let params = serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {"name": client_name, "version": client_version},
    });

    let response = transport.request("initialize", Some(params)).await?;
    let result = extract_result(response).map_err(|rpc| McpError::HandshakeFailed {
        name: name.to_string(),
        reason: format!("initialize rejected [{}]: {}", rpc.code, rpc.message),
    })?;
    let init: InitializeResult =
        serde_json::from_value(result).map_err(|e| McpError::Protocol {
            name: name.to_string(),
            reason: format!("failed to parse initialize response: {e}"),
        })?;

    transport.notify("notifications/initialized", None).await?;

    let identity = ServerIdentity {
        name: init.server_info.as_ref().and_then(|i| i.name.clone()),
        version: init.server_info.as_ref().and_then(|i| i.version.clone()),
        protocol_version: init.protocol_version.clone(),
        capabilities: init.capabilities.clone(),
    };

    if !init.advertises_tools() {
        tracing::info!(server = %name, "backend does not advertise tools");
        return Ok((identity, ToolInventory::NotAdvertised));
    }

    let tools = list_tools(transport, name).await?;
    Ok((identity, ToolInventory::Listed(tools)))
}

/// Fetch every page of `tools/list`, dropping unusable entries.
async fn list_tools(transport: &StdioTransport, name: &str) -> Result<Vec<ToolDescriptor>, McpError> {
    let mut tools: Vec<ToolDescriptor> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut cursor: Option<String> = None;

    for _ in 0..MAX_TOOL_PAGES {
        let params = cursor
            .as_ref()
            .map(|c| serde_json::json!({ "cursor": c }));
        let response = transport.request("tools/list", params).await?;
        let value = extract_result(response).map_err(|rpc| McpError::Protocol {
            name: name.to_string(),
            reason: format!("tools/list failed [{}]: {}", rpc.code, rpc.message),
        })?;
        let page: ListToolsResult =
            serde_json::from_value(value).map_err(|e| McpError::Protocol {
                name: name.to_string(),
                reason: format!("malformed tools/list result: {e}"),
            })?;

        for tool in page.tools {
            if tool.name.is_empty() {
                tracing::warn!(server = %name, "skipping tool with empty name");
                continue;
            }
            if !seen.insert(tool.name.clone()) {
                tracing::warn!(server = %name, tool = %tool.name, "duplicate tool name, keeping first");
                continue;
            }
            tools.push(tool);
        }

        match page.next_cursor {
            Some(next) if !next.is_empty() => cursor = Some(next),
            _ => return Ok(tools),
        }
    }

    Err(McpError::Protocol {
        name: name.to_string(),
        reason: format!("tools/list did not terminate after {MAX_TOOL_PAGES} pages"),
    })
}

fn spawn_stderr_drain(name: &str, stderr: ChildStderr, tail: StderrTail) -> JoinHandle<()> {
    let name = name.to_string();
    tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(server = %name, line = %line, "backend stderr");
            tail.push(line);
        }
    })
}

/// Format a stderr suffix for error messages (empty string if no stderr).
fn format_stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(" | stderr: {}", stderr.trim())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
