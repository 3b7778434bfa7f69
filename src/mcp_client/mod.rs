//! MCP client side of the bridge: JSON-RPC over stdio to many backend tool
//! servers.
//!
//! This module handles:
//! - Line-delimited JSON-RPC transport with a background reader
//! - Backend process lifecycle (spawn, handshake, disconnect, crash)
//! - The registry of known and active backends with lazy connects
//! - The namespaced tool catalog and search
//! - Discovery of backends from a servers directory and servers file

pub mod catalog;
pub mod connection;
pub mod discovery;
pub mod errors;
pub mod registry;
pub mod transport;
pub mod types;

pub use catalog::{NamespacedTool, ToolCatalog, ToolFilter, ToolName, ToolSpec, TOOL_NAME_SEPARATOR};
pub use connection::{BackendConnection, ConnectionOptions, ConnectionState};
pub use errors::McpError;
pub use registry::{BridgeStatus, ConnectionRegistry};
pub use types::{CallToolResult, ServerDescriptor, ToolDescriptor, ToolInventory};
