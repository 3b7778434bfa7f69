//! Backend discovery: turn a servers directory and a servers file into
//! `ServerDescriptor`s.
//!
//! Directories named `<name>-server` under the servers directory are picked
//! up by convention (`server.py` → Python, `package.json` → TypeScript).
//! Entries from the servers file fully replace discovered ones.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::errors::McpError;
use super::types::{McpServersConfig, ServerConfig, ServerDescriptor};

/// Suffix a directory needs to be discovered as a backend.
const SERVER_DIR_SUFFIX: &str = "-server";

// ─── Language Detection ──────────────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
enum ServerLanguage {
    TypeScript,
    Python,
}

fn detect_language(server_dir: &Path) -> Option<ServerLanguage> {
    if server_dir.join("package.json").exists() {
        Some(ServerLanguage::TypeScript)
    } else if server_dir.join("server.py").exists() {
        Some(ServerLanguage::Python)
    } else {
        None
    }
}

// ─── Platform Helpers ────────────────────────────────────────────────────────

/// Windows requires `npx.cmd` because `npx` is a batch script.
fn default_npx_command() -> &'static str {
    if cfg!(target_os = "windows") {
        "npx.cmd"
    } else {
        "npx"
    }
}

/// macOS 12.3+ ships only `python3`; Windows installs `python.exe`.
fn default_python_command() -> &'static str {
    if cfg!(target_os = "windows") {
        "python"
    } else {
        "python3"
    }
}

fn ts_config(server_dir: &Path) -> ServerConfig {
    ServerConfig {
        command: default_npx_command().to_string(),
        args: vec!["tsx".to_string(), "src/index.ts".to_string()],
        cwd: Some(server_dir.to_string_lossy().into_owned()),
        ..ServerConfig::default()
    }
}

fn py_config(server_dir: &Path) -> ServerConfig {
    ServerConfig {
        command: default_python_command().to_string(),
        args: vec![server_dir.join("server.py").to_string_lossy().into_owned()],
        ..ServerConfig::default()
    }
}

// ─── Discovery ──────────────────────────────────────────────────────────────

/// Scan `servers_dir` for `<name>-server` directories.
///
/// Returns an empty map if the directory doesn't exist.
pub fn discover_servers(servers_dir: &Path) -> HashMap<String, ServerConfig> {
    let mut configs = HashMap::new();

    let entries = match std::fs::read_dir(servers_dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!(
                path = %servers_dir.display(),
                error = %e,
                "servers directory not readable, skipping discovery"
            );
            return configs;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }

        let Some(dir_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if dir_name.starts_with('_') || dir_name.starts_with('.') {
            continue;
        }
        let Some(name) = dir_name.strip_suffix(SERVER_DIR_SUFFIX) else {
            continue;
        };
        if name.is_empty() {
            continue;
        }

        if let Some(language) = detect_language(&path) {
            let config = match language {
                ServerLanguage::TypeScript => ts_config(&path),
                ServerLanguage::Python => py_config(&path),
            };
            tracing::debug!(server = %name, language = ?language, "discovered backend");
            configs.insert(name.to_string(), config);
        }
    }

    configs
}

// ─── Servers File ───────────────────────────────────────────────────────────

/// Load a servers file. A missing file is an empty configuration.
pub fn load_servers_file(path: &Path) -> Result<McpServersConfig, McpError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path = %path.display(), "servers file not found");
            return Ok(McpServersConfig::default());
        }
        Err(e) => {
            return Err(McpError::ConfigError {
                reason: format!("failed to read {}: {e}", path.display()),
            })
        }
    };

    let interpolated = crate::config::interpolate_env_vars(&raw);
    serde_json::from_str(&interpolated).map_err(|e| McpError::ConfigError {
        reason: format!("failed to parse {}: {e}", path.display()),
    })
}

// ─── Merge ──────────────────────────────────────────────────────────────────

/// Override entries fully replace discovered entries of the same name.
pub fn merge_configs(
    mut discovered: HashMap<String, ServerConfig>,
    overrides: HashMap<String, ServerConfig>,
) -> HashMap<String, ServerConfig> {
    for (name, override_config) in overrides {
        discovered.insert(name, override_config);
    }
    discovered
}

/// Resolve a relative script argument against the servers directory when the
/// file exists there.
fn resolve_script_arg(config: &mut ServerConfig, servers_dir: Option<&Path>) {
    let (Some(dir), Some(first)) = (servers_dir, config.args.first_mut()) else {
        return;
    };
    if first.starts_with('-') || Path::new(first.as_str()).is_absolute() {
        return;
    }
    let candidate: PathBuf = dir.join(first.as_str());
    if candidate.is_file() {
        *first = candidate.to_string_lossy().into_owned();
    }
}

/// Turn merged configs into descriptors, sorted by name. Disabled and
/// non-stdio entries are dropped.
pub fn build_descriptors(
    configs: HashMap<String, ServerConfig>,
    servers_dir: Option<&Path>,
) -> Vec<ServerDescriptor> {
    let mut descriptors: Vec<ServerDescriptor> = configs
        .into_iter()
        .filter_map(|(name, mut config)| {
            if config.disabled {
                tracing::debug!(server = %name, "backend disabled in config");
                return None;
            }
            if !config.is_stdio() {
                tracing::warn!(
                    server = %name,
                    transport = ?config.transport,
                    "only stdio backends are supported, skipping"
                );
                return None;
            }
            resolve_script_arg(&mut config, servers_dir);
            Some(ServerDescriptor::from_config(&name, config))
        })
        .collect();
    descriptors.sort_by(|a, b| a.name.cmp(&b.name));
    descriptors
}

// ─── Tests ──────────────────────────────────────────────────────────────────
