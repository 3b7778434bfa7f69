//! Minimal stdio MCP server used by the integration tests and for trying the
//! bridge by hand.
//!
//! Speaks line-delimited JSON-RPC on stdin/stdout. Requests are handled
//! concurrently, so responses may come back out of order.
//!
//! Environment knobs:
//! - `DEMO_SERVER_HANDSHAKE_DELAY_MS`: sleep before answering `initialize`
//! - `DEMO_SERVER_NO_TOOLS`: do not advertise the tools capability
//! - `DEMO_SERVER_NOISE`: print a non-JSON banner line on stdout at startup

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};
use tokio::sync::Mutex;

const PROTOCOL_VERSION: &str = "2024-11-05";

type SharedStdout = Arc<Mutex<Stdout>>;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("DEMO_SERVER_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let stdout: SharedStdout = Arc::new(Mutex::new(tokio::io::stdout()));
    if std::env::var_os("DEMO_SERVER_NOISE").is_some() {
        write_line(&stdout, "demo-tool-server starting up").await?;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let message: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring unparseable line");
                continue;
            }
        };

        let Some(method) = message.get("method").and_then(Value::as_str).map(String::from) else {
            continue;
        };
        // Notifications carry no id and get no answer.
        let Some(id) = message.get("id").cloned() else {
            tracing::debug!(method = %method, "notification");
            continue;
        };
        let params = message.get("params").cloned().unwrap_or(Value::Null);

        let stdout = Arc::clone(&stdout);
        tokio::spawn(async move {
            let response = match handle(&method, params).await {
                Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
                Err((code, message)) => json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": code, "message": message}
                }),
            };
            if let Err(e) = write_line(&stdout, &response.to_string()).await {
                tracing::error!(error = %e, "failed to write response");
            }
        });
    }

    tracing::debug!("stdin closed, exiting");
    Ok(())
}

async fn write_line(stdout: &SharedStdout, line: &str) -> std::io::Result<()> {
    let mut out = stdout.lock().await;
    out.write_all(line.as_bytes()).await?;
    out.write_all(b"\n").await?;
    out.flush().await
}

async fn handle(method: &str, params: Value) -> Result<Value, (i64, String)> {
    match method {
        "initialize" => {
            if let Some(ms) = env_u64("DEMO_SERVER_HANDSHAKE_DELAY_MS") {
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            let capabilities = if std::env::var_os("DEMO_SERVER_NO_TOOLS").is_some() {
                json!({})
            } else {
                json!({"tools": {}})
            };
            Ok(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": capabilities,
                "serverInfo": {"name": "demo-tool-server", "version": env!("CARGO_PKG_VERSION")}
            }))
        }
        "ping" => Ok(json!({})),
        "tools/list" => Ok(json!({ "tools": tool_list() })),
        "tools/call" => {
            let name = params
                .get("name")
                .and_then(Value::as_str)
                .ok_or((-32602, "missing tool name".to_string()))?
                .to_string();
            let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
            call(&name, &arguments).await
        }
        other => Err((-32601, format!("method not found: {other}"))),
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn tool(name: &str, description: &str, category: &str, tags: &[&str], properties: Value, required: &[&str]) -> Value {
    json!({
        "name": name,
        "description": description,
        "inputSchema": {"type": "object", "properties": properties, "required": required},
        "category": category,
        "tags": tags,
    })
}

fn tool_list() -> Vec<Value> {
    let number_pair = json!({"a": {"type": "number"}, "b": {"type": "number"}});
    vec![
        tool("add", "Add two numbers", "math", &["arithmetic"], number_pair.clone(), &["a", "b"]),
        tool("multiply", "Multiply two numbers", "math", &["arithmetic"], number_pair, &["a", "b"]),
        tool(
            "echo",
            "Return the given text unchanged",
            "text",
            &["debug"],
            json!({"text": {"type": "string"}}),
            &["text"],
        ),
        tool(
            "analyze_text",
            "Count characters, words and lines in a text",
            "text",
            &["analysis"],
            json!({"text": {"type": "string"}}),
            &["text"],
        ),
        tool("current_time", "Current UTC time in RFC 3339", "time", &[], json!({}), &[]),
        tool(
            "fail",
            "Always reports a tool failure",
            "debug",
            &["debug"],
            json!({"message": {"type": "string"}}),
            &[],
        ),
        tool(
            "sleep",
            "Sleep for the given milliseconds, then answer",
            "debug",
            &["debug"],
            json!({"ms": {"type": "integer"}}),
            &["ms"],
        ),
        tool(
            "crash",
            "Exit the server process immediately",
            "debug",
            &["debug"],
            json!({"code": {"type": "integer"}}),
            &[],
        ),
        tool("rpc_error", "Answer with a JSON-RPC error", "debug", &["debug"], json!({}), &[]),
    ]
}

fn text_result(text: String) -> Value {
    json!({"content": [{"type": "text", "text": text}]})
}

fn number_arg(arguments: &Value, key: &str) -> Result<f64, (i64, String)> {
    arguments
        .get(key)
        .and_then(Value::as_f64)
        .ok_or((-32602, format!("argument '{key}' must be a number")))
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

async fn call(name: &str, arguments: &Value) -> Result<Value, (i64, String)> {
    match name {
        "add" | "multiply" => {
            let a = number_arg(arguments, "a")?;
            let b = number_arg(arguments, "b")?;
            let value = if name == "add" { a + b } else { a * b };
            let mut result = text_result(format_number(value));
            result["structuredContent"] = json!({ "result": value });
            Ok(result)
        }
        "echo" => {
            let text = arguments.get("text").and_then(Value::as_str).unwrap_or_default();
            Ok(text_result(text.to_string()))
        }
        "analyze_text" => {
            let text = arguments.get("text").and_then(Value::as_str).unwrap_or_default();
            let analysis = json!({
                "characters": text.chars().count(),
                "words": text.split_whitespace().count(),
                "lines": text.lines().count(),
            });
            Ok(text_result(analysis.to_string()))
        }
        "current_time" => Ok(text_result(chrono::Utc::now().to_rfc3339())),
        "fail" => {
            let message = arguments
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("requested failure");
            Ok(json!({"content": [{"type": "text", "text": message}], "isError": true}))
        }
        "sleep" => {
            let ms = arguments.get("ms").and_then(Value::as_u64).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(text_result(format!("slept {ms}ms")))
        }
        "crash" => {
            let code = arguments.get("code").and_then(Value::as_i64).unwrap_or(3) as i32;
            eprintln!("demo-tool-server: crashing on request with code {code}");
            std::process::exit(code);
        }
        "rpc_error" => Err((-32000, "demo failure".to_string())),
        other => Err((-32602, format!("unknown tool: {other}"))),
    }
}
