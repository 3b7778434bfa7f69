//! In-process `bridge__*` tools that let the model manage backends itself.
//!
//! These never touch a backend process directly; everything goes through the
//! router and its registry. Results are JSON text, failures are structured
//! error payloads like any other tool failure.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::mcp_client::{ToolFilter, ToolSpec, TOOL_NAME_SEPARATOR};

use super::errors::AgentError;
use super::tool_router::ToolRouter;
use super::types::ToolErrorPayload;

/// Namespace reserved for meta-tools. No backend may use it.
pub const META_NAMESPACE: &str = "bridge";

const LIST_SERVERS: &str = "bridge__list_servers";
const ACTIVATE_SERVER: &str = "bridge__activate_server";
const DEACTIVATE_SERVER: &str = "bridge__deactivate_server";
const SEARCH_TOOLS: &str = "bridge__search_tools";
const STATUS: &str = "bridge__status";

/// Tool names listed after an activation.
const ACTIVATION_PREVIEW: usize = 15;

pub fn is_meta_tool(name: &str) -> bool {
    name.strip_prefix(META_NAMESPACE)
        .is_some_and(|rest| rest.starts_with(TOOL_NAME_SEPARATOR))
}

#[derive(Debug, Deserialize)]
struct ServerArgs {
    #[serde(alias = "server_name", alias = "server")]
    name: String,
}

/// Schemas offered to the provider alongside the catalog.
pub fn meta_tool_specs() -> Vec<ToolSpec> {
    let server_arg = json!({
        "type": "object",
        "properties": {
            "name": {"type": "string", "description": "Backend server name"}
        },
        "required": ["name"]
    });

    vec![
        ToolSpec {
            name: LIST_SERVERS.into(),
            description: "List every configured tool server, whether it is active, and how many tools it offers.".into(),
            input_schema: json!({"type": "object", "properties": {}}),
        },
        ToolSpec {
            name: ACTIVATE_SERVER.into(),
            description: "Start a configured tool server so its tools become available.".into(),
            input_schema: server_arg.clone(),
        },
        ToolSpec {
            name: DEACTIVATE_SERVER.into(),
            description: "Stop an active tool server and remove its tools.".into(),
            input_schema: server_arg,
        },
        ToolSpec {
            name: SEARCH_TOOLS.into(),
            description: "Search the tools of active servers by category, tags (all must match), server, or name pattern (* and ? wildcards).".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "category": {"type": "string"},
                    "tags": {"type": "array", "items": {"type": "string"}},
                    "backends": {"type": "array", "items": {"type": "string"}},
                    "name_pattern": {"type": "string"},
                    "limit": {"type": "integer", "minimum": 1}
                }
            }),
        },
        ToolSpec {
            name: STATUS.into(),
            description: "Report bridge health: uptime, memory, spawn attempts, and the state of every configured server.".into(),
            input_schema: json!({"type": "object", "properties": {}}),
        },
    ]
}

/// Run a meta-tool. `Ok` carries the JSON text handed back to the model.
pub async fn execute(router: &ToolRouter, name: &str, arguments: &Value) -> Result<String, ToolErrorPayload> {
    let output = match name {
        LIST_SERVERS => Ok(list_servers(router).await),
        ACTIVATE_SERVER => activate_server(router, name, arguments).await,
        DEACTIVATE_SERVER => deactivate_server(router, name, arguments).await,
        SEARCH_TOOLS => search_tools(router, name, arguments),
        STATUS => bridge_status(router).await,
        _ => {
            let err = AgentError::UnknownMetaTool {
                name: name.to_string(),
            };
            let suggestions = meta_tool_specs()
                .into_iter()
                .map(|s| s.name)
                .collect();
            Err(ToolErrorPayload::from_agent(&err, suggestions))
        }
    }?;
    Ok(output.to_string())
}

fn parse_args<T: serde::de::DeserializeOwned>(tool: &str, arguments: &Value) -> Result<T, ToolErrorPayload> {
    let value = if arguments.is_null() {
        json!({})
    } else {
        arguments.clone()
    };
    serde_json::from_value(value).map_err(|e| {
        ToolErrorPayload::from_agent(
            &AgentError::InvalidArguments {
                tool: tool.to_string(),
                reason: e.to_string(),
            },
            Vec::new(),
        )
    })
}

async fn list_servers(router: &ToolRouter) -> Value {
    let status = router.registry().status().await;
    let servers: Vec<Value> = status
        .backends
        .iter()
        .map(|b| {
            json!({
                "name": b.name,
                "active": b.active,
                "description": b.description,
                "category": b.category,
                "toolCount": b.tool_count,
            })
        })
        .collect();
    json!({
        "servers": servers,
        "activeCount": status.active_count,
        "knownCount": status.backends.len(),
    })
}

async fn activate_server(router: &ToolRouter, tool: &str, arguments: &Value) -> Result<Value, ToolErrorPayload> {
    let args: ServerArgs = parse_args(tool, arguments)?;
    let registry = router.registry();
    let already_active = registry.is_active(&args.name);

    let conn = registry.ensure_connected(&args.name).await.map_err(|e| {
        let suggestions = if registry.is_known(&args.name) {
            Vec::new()
        } else {
            registry.list_known_backends()
        };
        ToolErrorPayload::from_mcp(&e, suggestions)
    })?;

    let names: Vec<String> = router
        .catalog()
        .entries()
        .iter()
        .filter(|e| e.name.backend() == conn.name())
        .map(|e| e.name.to_string())
        .collect();

    tracing::info!(server = %args.name, tools = names.len(), "backend activated by model");
    Ok(json!({
        "activated": args.name,
        "alreadyActive": already_active,
        "toolCount": names.len(),
        "tools": names.iter().take(ACTIVATION_PREVIEW).collect::<Vec<_>>(),
    }))
}

async fn deactivate_server(router: &ToolRouter, tool: &str, arguments: &Value) -> Result<Value, ToolErrorPayload> {
    let args: ServerArgs = parse_args(tool, arguments)?;
    let registry = router.registry();
    if !registry.is_known(&args.name) {
        let err = crate::mcp_client::McpError::UnknownBackend { name: args.name };
        return Err(ToolErrorPayload::from_mcp(&err, registry.list_known_backends()));
    }

    let was_active = registry.is_active(&args.name);
    registry.disconnect(&args.name).await;
    tracing::info!(server = %args.name, was_active, "backend deactivated by model");
    Ok(json!({
        "deactivated": args.name,
        "wasActive": was_active,
    }))
}

fn search_tools(router: &ToolRouter, tool: &str, arguments: &Value) -> Result<Value, ToolErrorPayload> {
    let filter: ToolFilter = parse_args(tool, arguments)?;
    let hits = router.search(&filter);
    let tools: Vec<Value> = hits
        .iter()
        .map(|hit| {
            json!({
                "name": hit.name.to_string(),
                "description": hit.tool.description,
                "category": hit.tool.category,
                "tags": hit.tool.tags,
                "priority": hit.tool.priority,
            })
        })
        .collect();
    Ok(json!({ "count": tools.len(), "tools": tools }))
}

async fn bridge_status(router: &ToolRouter) -> Result<Value, ToolErrorPayload> {
    let status = router.registry().status().await;
    serde_json::to_value(&status).map_err(|e| {
        ToolErrorPayload::from_agent(
            &AgentError::SerializationError {
                reason: e.to_string(),
            },
            Vec::new(),
        )
    })
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::mcp_client::{ConnectionOptions, ConnectionRegistry, ServerDescriptor};

    fn router() -> ToolRouter {
        let registry = ConnectionRegistry::new(
            vec![
                ServerDescriptor::new("docker", "/nonexistent/docker-server", &[]),
                ServerDescriptor::new("git", "/nonexistent/git-server", &[]).with_category("vcs"),
            ],
            ConnectionOptions::default(),
        )
        .unwrap();
        ToolRouter::new(Arc::new(registry))
    }

    #[test]
    fn test_is_meta_tool() {
        assert!(is_meta_tool("bridge__list_servers"));
        assert!(is_meta_tool("bridge__anything"));
        assert!(!is_meta_tool("bridgework__x"));
        assert!(!is_meta_tool("demo__add"));
    }

    #[test]
    fn test_specs_are_namespaced() {
        for spec in meta_tool_specs() {
            assert!(is_meta_tool(&spec.name), "{}", spec.name);
            assert_eq!(spec.input_schema["type"], "object");
        }
    }

    #[tokio::test]
    async fn test_list_servers() {
        let router = router();
        let out = execute(&router, LIST_SERVERS, &Value::Null).await.unwrap();
        let value: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["knownCount"], 2);
        assert_eq!(value["activeCount"], 0);
        assert_eq!(value["servers"][1]["name"], "git");
        assert_eq!(value["servers"][1]["category"], "vcs");
    }

    #[tokio::test]
    async fn test_activate_unknown_server_suggests_known_ones() {
        let router = router();
        let err = execute(&router, ACTIVATE_SERVER, &json!({"name": "kubernetes"}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, "unknown_backend_error");
        assert_eq!(err.suggestions, vec!["docker", "git"]);
        assert_eq!(router.registry().spawn_attempts(), 0);
    }

    #[tokio::test]
    async fn test_activate_spawn_failure() {
        let router = router();
        let err = execute(&router, ACTIVATE_SERVER, &json!({"server_name": "docker"}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, "backend_spawn_error");
    }

    #[tokio::test]
    async fn test_missing_argument() {
        let router = router();
        let err = execute(&router, DEACTIVATE_SERVER, &json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, "invalid_arguments_error");
    }

    #[tokio::test]
    async fn test_deactivate_inactive_is_ok() {
        let router = router();
        let out = execute(&router, DEACTIVATE_SERVER, &json!({"name": "git"}))
            .await
            .unwrap();
        let value: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["wasActive"], false);
    }

    #[tokio::test]
    async fn test_search_with_nothing_active() {
        let router = router();
        let out = execute(&router, SEARCH_TOOLS, &json!({"tags": ["x"], "limit": 5}))
            .await
            .unwrap();
        let value: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["count"], 0);
    }

    #[tokio::test]
    async fn test_status_reports_registry_snapshot() {
        let router = router();
        let out = execute(&router, STATUS, &json!({})).await.unwrap();
        let value: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["pid"], std::process::id());
        assert_eq!(value["activeCount"], 0);
        assert_eq!(value["spawnAttempts"], 0);
        assert_eq!(value["backends"].as_array().unwrap().len(), 2);
        assert_eq!(value["backends"][0]["name"], "docker");
        assert_eq!(value["backends"][0]["active"], false);
        assert!(value["uptimeSecs"].is_u64());
    }

    #[tokio::test]
    async fn test_unknown_meta_tool() {
        let router = router();
        let err = execute(&router, "bridge__reboot", &json!({})).await.unwrap_err();
        assert_eq!(err.kind, "unknown_tool_error");
        assert!(err.suggestions.contains(&LIST_SERVERS.to_string()));
    }
}
