//! Shared types for the MCP bridge.
//!
//! JSON-RPC 2.0 message types, MCP protocol structures, and the backend
//! descriptors loaded from configuration.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// MCP protocol revision announced in `initialize`.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response message (success or error).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub jsonrpc: String,
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Any line a backend may write: a response to one of our requests, a
/// request of its own, or a notification.
#[derive(Debug, Clone, Deserialize)]
pub struct IncomingMessage {
    #[serde(default)]
    pub id: Option<serde_json::Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<serde_json::Value>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

// ─── MCP Protocol Types ──────────────────────────────────────────────────────

/// Result of the `initialize` request.
#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResult {
    #[serde(default, rename = "protocolVersion")]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: serde_json::Value,
    #[serde(default, rename = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

impl InitializeResult {
    /// Whether the backend advertises the `tools` capability.
    pub fn advertises_tools(&self) -> bool {
        self.capabilities
            .get("tools")
            .map(|v| !v.is_null())
            .unwrap_or(false)
    }
}

/// Server info returned in the initialize response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

/// What a backend told us about itself during the handshake.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ServerIdentity {
    pub name: Option<String>,
    pub version: Option<String>,
    pub protocol_version: Option<String>,
    pub capabilities: serde_json::Value,
}

/// One page of `tools/list`.
#[derive(Debug, Clone, Deserialize)]
pub struct ListToolsResult {
    pub tools: Vec<ToolDescriptor>,
    #[serde(default, rename = "nextCursor")]
    pub next_cursor: Option<String>,
}

/// A tool as declared by its backend, under its local (un-namespaced) name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(
        default = "default_input_schema",
        rename = "inputSchema",
        alias = "input_schema"
    )]
    pub input_schema: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default)]
    pub priority: i32,
}

fn default_input_schema() -> serde_json::Value {
    serde_json::json!({"type": "object", "properties": {}})
}

/// Tool snapshot taken at connect time.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolInventory {
    /// `tools/list` succeeded; the list may be empty.
    Listed(Vec<ToolDescriptor>),
    /// The backend did not advertise the tools capability.
    NotAdvertised,
}

impl ToolInventory {
    pub fn tools(&self) -> &[ToolDescriptor] {
        match self {
            ToolInventory::Listed(tools) => tools,
            ToolInventory::NotAdvertised => &[],
        }
    }

    pub fn find(&self, local_name: &str) -> Option<&ToolDescriptor> {
        self.tools().iter().find(|t| t.name == local_name)
    }
}

/// A single item of a `tools/call` result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentItem {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(default, rename = "mimeType")]
        mime_type: Option<String>,
    },
    Audio {
        data: String,
        #[serde(default, rename = "mimeType")]
        mime_type: Option<String>,
    },
    Resource {
        resource: serde_json::Value,
    },
    #[serde(other)]
    Unsupported,
}

impl ContentItem {
    /// Render an item as model-readable text. Binary payloads become a size
    /// placeholder.
    pub fn render(&self) -> String {
        match self {
            ContentItem::Text { text } => text.clone(),
            ContentItem::Image { data, .. } => format!("[image: {} bytes]", base64_len(data)),
            ContentItem::Audio { data, .. } => format!("[audio: {} bytes]", base64_len(data)),
            ContentItem::Resource { resource } => {
                if let Some(text) = resource.get("text").and_then(|t| t.as_str()) {
                    text.to_string()
                } else if let Some(uri) = resource.get("uri").and_then(|u| u.as_str()) {
                    format!("[resource: {uri}]")
                } else {
                    "[resource]".to_string()
                }
            }
            ContentItem::Unsupported => "[unsupported content]".to_string(),
        }
    }
}

/// Decoded size of a base64 payload, without decoding it.
fn base64_len(data: &str) -> usize {
    let trimmed = data.trim_end_matches('=');
    trimmed.len() * 3 / 4
}

/// Result of `tools/call`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ContentItem>,
    #[serde(default, rename = "isError")]
    pub is_error: bool,
    #[serde(
        default,
        rename = "structuredContent",
        skip_serializing_if = "Option::is_none"
    )]
    pub structured_content: Option<serde_json::Value>,
}

impl CallToolResult {
    /// Join all content items into one text block.
    pub fn text(&self) -> String {
        if self.content.is_empty() {
            return match &self.structured_content {
                Some(value) => value.to_string(),
                None => "(no output)".to_string(),
            };
        }
        self.content
            .iter()
            .map(ContentItem::render)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

// ─── Configuration ───────────────────────────────────────────────────────────

/// Server entry from a `mcp-servers.json` style file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Per-server working directory (overrides the global working_dir).
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub disabled: bool,
    /// Transport kind; only `stdio` (or absent) is supported.
    #[serde(default, rename = "type")]
    pub transport: Option<String>,
}

impl ServerConfig {
    pub fn is_stdio(&self) -> bool {
        matches!(self.transport.as_deref(), None | Some("stdio"))
    }
}

/// Top-level MCP servers configuration file. Accepts both the `servers` and
/// the `mcpServers` spelling.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct McpServersConfig {
    #[serde(default, alias = "mcpServers")]
    pub servers: HashMap<String, ServerConfig>,
}

/// Immutable description of how to launch one backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerDescriptor {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub tags: Vec<String>,
}

impl ServerDescriptor {
    /// Minimal descriptor for a command line.
    pub fn new(name: &str, command: &str, args: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: HashMap::new(),
            cwd: None,
            description: None,
            category: None,
            tags: Vec::new(),
        }
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_category(mut self, category: &str) -> Self {
        self.category = Some(category.to_string());
        self
    }

    pub fn from_config(name: &str, config: ServerConfig) -> Self {
        Self {
            name: name.to_string(),
            command: config.command,
            args: config.args,
            env: config.env,
            cwd: config.cwd,
            description: config.description,
            category: config.category,
            tags: config.tags,
        }
    }
}

// ─── Standard Error Codes ────────────────────────────────────────────────────

/// Well-known JSON-RPC error codes.
pub mod error_codes {
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_rpc_request_serialization() {
        let req = JsonRpcRequest::new(1, "initialize", None);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"id\":1"));
        assert!(json.contains("\"method\":\"initialize\""));
        assert!(!json.contains("params"));
    }

    #[test]
    fn test_incoming_message_classifies_request_vs_response() {
        let resp: IncomingMessage =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":3,"result":{}}"#).unwrap();
        assert!(resp.method.is_none());
        assert_eq!(resp.id, Some(serde_json::json!(3)));

        let ping: IncomingMessage =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":"srv-1","method":"ping"}"#).unwrap();
        assert_eq!(ping.method.as_deref(), Some("ping"));
    }

    #[test]
    fn test_tool_descriptor_defaults() {
        let tool: ToolDescriptor = serde_json::from_str(r#"{"name": "add"}"#).unwrap();
        assert_eq!(tool.description, "");
        assert_eq!(tool.priority, 0);
        assert_eq!(tool.input_schema["type"], "object");
    }

    #[test]
    fn test_tools_capability_detection() {
        let with: InitializeResult =
            serde_json::from_str(r#"{"capabilities":{"tools":{}}}"#).unwrap();
        let without: InitializeResult =
            serde_json::from_str(r#"{"capabilities":{"resources":{}}}"#).unwrap();
        assert!(with.advertises_tools());
        assert!(!without.advertises_tools());
    }

    #[test]
    fn test_call_result_text_joins_and_renders_binary() {
        let result: CallToolResult = serde_json::from_value(serde_json::json!({
            "content": [
                {"type": "text", "text": "line one"},
                {"type": "image", "data": "AAAA", "mimeType": "image/png"},
                {"type": "text", "text": "line two"}
            ]
        }))
        .unwrap();
        assert_eq!(result.text(), "line one\n[image: 3 bytes]\nline two");
        assert!(!result.is_error);
    }

    #[test]
    fn test_call_result_empty_content() {
        let result = CallToolResult::default();
        assert_eq!(result.text(), "(no output)");
    }

    #[test]
    fn test_servers_file_accepts_mcp_servers_key() {
        let json = r#"{"mcpServers": {"git": {"command": "uvx", "args": ["mcp-server-git"]}}}"#;
        let cfg: McpServersConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.servers["git"].command, "uvx");
        assert!(cfg.servers["git"].is_stdio());
    }

    #[test]
    fn test_http_entries_are_not_stdio() {
        let json = r#"{"servers": {"remote": {"type": "http", "url": "https://x"}}}"#;
        let cfg: McpServersConfig = serde_json::from_str(json).unwrap();
        assert!(!cfg.servers["remote"].is_stdio());
    }
}
