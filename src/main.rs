use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use mcp_bridge::agent_core::{AgentLoop, RunContext};
use mcp_bridge::config::{find_settings_path, BridgeSettings};
use mcp_bridge::inference::build_provider;
use mcp_bridge::mcp_client::{ConnectionRegistry, ToolFilter, ToolName};
use mcp_bridge::{init_tracing, LogOptions};

#[derive(Parser)]
#[command(name = "mcp-bridge", version, about = "Aggregate MCP tool servers behind one agent loop")]
struct Cli {
    /// Settings file (default: mcp-bridge.yaml in the current directory or a parent)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List configured backends and whether they are active
    Servers,

    /// Connect backends and list or search their tools
    Tools {
        /// Backends to connect first (all configured backends if omitted)
        #[arg(short, long, value_delimiter = ',')]
        server: Vec<String>,

        /// Only tools in this category
        #[arg(long)]
        category: Option<String>,

        /// Only tools carrying every one of these tags
        #[arg(long, value_delimiter = ',')]
        tag: Vec<String>,

        /// Name pattern, `*` and `?` wildcards
        #[arg(long)]
        pattern: Option<String>,

        #[arg(long)]
        limit: Option<usize>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Call one namespaced tool directly (e.g. `demo__add '{"a":1,"b":2}'`)
    Call {
        tool: String,

        /// Arguments as a JSON object
        #[arg(default_value = "{}")]
        arguments: String,
    },

    /// Run the agent loop on a prompt
    Run {
        prompt: String,

        /// Workspace folder (repeatable)
        #[arg(long)]
        workspace: Vec<String>,

        /// Open file (repeatable)
        #[arg(long)]
        open_file: Vec<String>,

        #[arg(long)]
        current_file: Option<String>,

        /// Selected text to include as context
        #[arg(long)]
        selection: Option<String>,

        /// Override agent.max_iterations
        #[arg(long)]
        max_iterations: Option<u32>,

        /// Print the full run result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show registry status after connecting the auto-connect backends
    Status {
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let log_options = LogOptions {
        log_file: cli.log_file.clone(),
        json: cli.log_json,
        default_filter: None,
    };
    if let Err(e) = init_tracing(&log_options) {
        eprintln!("failed to initialize logging: {e}");
    }

    match run_cli(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = format!("{e:#}"), "command failed");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run_cli(cli: Cli) -> Result<ExitCode> {
    let cwd = std::env::current_dir().context("failed to read current directory")?;
    let settings_path = find_settings_path(cli.config.as_deref(), &cwd);
    let mut settings = BridgeSettings::load(&settings_path)
        .with_context(|| format!("failed to load settings from {}", settings_path.display()))?;

    let descriptors = settings
        .load_descriptors()
        .context("failed to resolve backend configuration")?;
    let registry = Arc::new(
        ConnectionRegistry::new(descriptors, settings.connection_options())
            .context("invalid backend configuration")?
            .with_auto_connect(settings.auto_connect.clone()),
    );

    let outcome = match cli.command {
        Command::Servers => list_servers(&registry).await,
        Command::Tools {
            server,
            category,
            tag,
            pattern,
            limit,
            json,
        } => {
            let filter = ToolFilter {
                category,
                tags: tag,
                backends: None,
                name_pattern: pattern,
                limit,
            };
            list_tools(&registry, server, &filter, json).await
        }
        Command::Call { tool, arguments } => call_tool(&registry, &tool, &arguments).await,
        Command::Run {
            prompt,
            workspace,
            open_file,
            current_file,
            selection,
            max_iterations,
            json,
        } => {
            if let Some(cap) = max_iterations {
                settings.agent.max_iterations = cap;
            }
            let context = RunContext {
                workspace_folders: workspace,
                open_files: open_file,
                current_file,
                selection,
            };
            run_agent(&registry, &settings, &prompt, &context, json).await
        }
        Command::Status { json } => show_status(&registry, json).await,
    };

    registry.shutdown().await;
    outcome
}

async fn list_servers(registry: &ConnectionRegistry) -> Result<ExitCode> {
    let status = registry.status().await;
    if status.backends.is_empty() {
        println!("no backends configured");
        return Ok(ExitCode::SUCCESS);
    }
    for backend in &status.backends {
        println!(
            "{:<24} {:<8} {:<12} {}",
            backend.name,
            if backend.active { "active" } else { "idle" },
            backend.category.as_deref().unwrap_or("-"),
            backend.description.as_deref().unwrap_or(""),
        );
    }
    Ok(ExitCode::SUCCESS)
}

async fn list_tools(
    registry: &ConnectionRegistry,
    servers: Vec<String>,
    filter: &ToolFilter,
    json: bool,
) -> Result<ExitCode> {
    let targets = if servers.is_empty() {
        registry.list_known_backends()
    } else {
        servers
    };

    let attempts = targets.iter().map(|name| async move {
        (name.as_str(), registry.ensure_connected(name).await)
    });
    for (name, outcome) in futures::future::join_all(attempts).await {
        if let Err(e) = outcome {
            eprintln!("warning: could not connect '{name}': {e}");
        }
    }

    let hits = registry.catalog().search(filter);
    if json {
        let tools: Vec<serde_json::Value> = hits
            .iter()
            .map(|hit| {
                serde_json::json!({
                    "name": hit.name,
                    "description": hit.tool.description,
                    "category": hit.tool.category,
                    "tags": hit.tool.tags,
                    "inputSchema": hit.tool.input_schema,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&tools)?);
    } else {
        for hit in &hits {
            println!("{:<40} {}", hit.name.to_string(), hit.tool.description);
        }
        println!("{} tool(s)", hits.len());
    }
    Ok(ExitCode::SUCCESS)
}

async fn call_tool(registry: &ConnectionRegistry, tool: &str, raw_args: &str) -> Result<ExitCode> {
    let name = ToolName::parse(tool)?;
    let arguments: serde_json::Value =
        serde_json::from_str(raw_args).context("tool arguments must be a JSON object")?;

    let result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            eprintln!("interrupted");
            return Ok(ExitCode::from(130));
        }
        result = registry.call_tool(name.backend(), name.local(), arguments) => result,
    };

    match result {
        Ok(result) => {
            println!("{}", result.text());
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            eprintln!("{} ({})", e, e.kind());
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn run_agent(
    registry: &Arc<ConnectionRegistry>,
    settings: &BridgeSettings,
    prompt: &str,
    context: &RunContext,
    json: bool,
) -> Result<ExitCode> {
    for (name, e) in registry.connect_defaults().await {
        tracing::warn!(server = %name, error = %e, "auto-connect failed, continuing");
    }

    let provider = build_provider(&settings.provider).context("failed to configure model provider")?;
    let agent = AgentLoop::new(Arc::clone(registry), provider, settings.agent.clone())?;

    let cancel = CancellationToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received, cancelling run");
                cancel.cancel();
            }
        })
    };

    let result = agent.run_with_cancellation(prompt, context, cancel).await;
    watcher.abort();

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        for record in &result.tool_invocation_records {
            let status = if record.succeeded() { "ok" } else { "error" };
            eprintln!("[{status}] {} ({}ms)", record.tool, record.duration_ms);
        }
        println!("{}", result.answer);
    }

    Ok(if result.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn show_status(registry: &ConnectionRegistry, json: bool) -> Result<ExitCode> {
    for (name, e) in registry.connect_defaults().await {
        eprintln!("warning: could not connect '{name}': {e}");
    }
    let status = registry.status().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(ExitCode::SUCCESS);
    }

    println!(
        "pid {}  uptime {}s  active {}/{}  tools {}  spawns {}",
        status.pid,
        status.uptime_secs,
        status.active_count,
        status.backends.len(),
        status.tool_count,
        status.spawn_attempts,
    );
    if let Some(bytes) = status.memory_bytes {
        println!("memory {:.1} MiB", bytes as f64 / (1024.0 * 1024.0));
    }
    for backend in status.backends.iter().filter(|b| b.active) {
        println!(
            "  {:<24} pid {:<8} tools {:<4} since {}",
            backend.name,
            backend.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
            backend.tool_count,
            backend
                .connected_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "-".into()),
        );
    }
    Ok(ExitCode::SUCCESS)
}
