//! Bridge settings loading and validation.
//!
//! Reads `mcp-bridge.yaml` and resolves environment variables. The settings
//! file points at the servers file (JSON, `mcpServers` map) and the servers
//! directory used for discovery, and carries the connection, agent and
//! provider sections.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::agent_core::AgentConfig;
use crate::inference::ProviderConfig;
use crate::mcp_client::discovery::{build_descriptors, discover_servers, load_servers_file, merge_configs};
use crate::mcp_client::{ConnectionOptions, ServerDescriptor};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Settings file searched for when no path is given.
pub const SETTINGS_FILE_NAME: &str = "mcp-bridge.yaml";

/// Servers file used when the settings do not name one.
pub const DEFAULT_SERVERS_FILE: &str = "mcp-servers.json";

/// Env var naming the settings file.
pub const SETTINGS_PATH_ENV: &str = "MCP_BRIDGE_CONFIG";

/// Env var overriding `auto_connect` (comma-separated backend names).
pub const AUTO_CONNECT_ENV: &str = "MCP_AUTO_CONNECT";

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("invalid setting: {reason}")]
    Invalid { reason: String },
}

// ─── Public Types ────────────────────────────────────────────────────────────

/// Backend process timeouts (`connection:` section).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    pub handshake_timeout_secs: u64,
    pub shutdown_grace_secs: u64,
    /// Per-call deadline. `null` or `0` disables it.
    pub call_timeout_secs: Option<u64>,
    /// Working directory for backends that do not set their own `cwd`.
    pub working_dir: Option<PathBuf>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        let defaults = ConnectionOptions::default();
        Self {
            handshake_timeout_secs: defaults.handshake_timeout.as_secs(),
            shutdown_grace_secs: defaults.shutdown_grace.as_secs(),
            call_timeout_secs: defaults.call_timeout.map(|d| d.as_secs()),
            working_dir: None,
        }
    }
}

/// Top-level settings (mirrors `mcp-bridge.yaml`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    /// JSON servers file. Relative paths resolve against the settings file.
    pub servers_file: Option<PathBuf>,
    /// Directory scanned for `<name>-server` backends.
    pub servers_dir: Option<PathBuf>,
    /// Backends connected at startup.
    pub auto_connect: Vec<String>,
    pub connection: ConnectionSettings,
    pub agent: AgentConfig,
    pub provider: ProviderConfig,
    /// Directory of the settings file, for resolving relative paths.
    #[serde(skip)]
    base_dir: Option<PathBuf>,
}

impl BridgeSettings {
    /// Load settings from `path`. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "settings file not found, using defaults");
                let mut settings = Self {
                    base_dir: path.parent().map(Path::to_path_buf),
                    ..Self::default()
                };
                settings.apply_auto_connect_override(std::env::var(AUTO_CONNECT_ENV).ok());
                return Ok(settings);
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })
            }
        };

        let mut settings = Self::parse(&raw, path)?;
        settings.apply_auto_connect_override(std::env::var(AUTO_CONNECT_ENV).ok());
        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings text. `origin` is used for error messages and for
    /// resolving relative paths.
    pub fn parse(raw: &str, origin: &Path) -> Result<Self, ConfigError> {
        let interpolated = interpolate_env_vars(raw);
        // An empty document deserializes to unit, not a map.
        let mut settings: BridgeSettings = if interpolated.trim().is_empty() {
            BridgeSettings::default()
        } else {
            serde_yaml::from_str(&interpolated).map_err(|e| ConfigError::Parse {
                path: origin.display().to_string(),
                reason: e.to_string(),
            })?
        };
        settings.base_dir = origin.parent().map(Path::to_path_buf);
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.max_iterations == 0 {
            return Err(ConfigError::Invalid {
                reason: "agent.max_iterations must be at least 1".into(),
            });
        }
        if self.connection.handshake_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                reason: "connection.handshake_timeout_secs must be at least 1".into(),
            });
        }
        Ok(())
    }

    /// `MCP_AUTO_CONNECT=a,b` replaces the configured list; empty clears it.
    pub fn apply_auto_connect_override(&mut self, raw: Option<String>) {
        let Some(raw) = raw else {
            return;
        };
        self.auto_connect = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        tracing::debug!(auto_connect = ?self.auto_connect, "auto-connect overridden from environment");
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        let expanded = PathBuf::from(expand_tilde(&path.to_string_lossy()));
        if expanded.is_absolute() {
            return expanded;
        }
        match &self.base_dir {
            Some(base) if !base.as_os_str().is_empty() => base.join(expanded),
            _ => expanded,
        }
    }

    pub fn servers_file_path(&self) -> PathBuf {
        let file = self
            .servers_file
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SERVERS_FILE));
        self.resolve(&file)
    }

    pub fn servers_dir_path(&self) -> Option<PathBuf> {
        self.servers_dir.as_deref().map(|d| self.resolve(d))
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        let c = &self.connection;
        ConnectionOptions {
            handshake_timeout: Duration::from_secs(c.handshake_timeout_secs),
            shutdown_grace: Duration::from_secs(c.shutdown_grace_secs),
            call_timeout: c
                .call_timeout_secs
                .filter(|s| *s > 0)
                .map(Duration::from_secs),
            working_dir: c.working_dir.as_deref().map(|d| self.resolve(d)),
            ..ConnectionOptions::default()
        }
    }

    /// Discover, load and merge backends into descriptors.
    pub fn load_descriptors(&self) -> Result<Vec<ServerDescriptor>, ConfigError> {
        let servers_dir = self.servers_dir_path();
        let discovered = match &servers_dir {
            Some(dir) => discover_servers(dir),
            None => Default::default(),
        };

        let servers_file = self.servers_file_path();
        let overrides = load_servers_file(&servers_file).map_err(|e| ConfigError::Parse {
            path: servers_file.display().to_string(),
            reason: e.to_string(),
        })?;

        let discovered_count = discovered.len();
        let merged = merge_configs(discovered, overrides.servers);
        let descriptors = build_descriptors(merged, servers_dir.as_deref());

        tracing::info!(
            discovered = discovered_count,
            servers_file = %servers_file.display(),
            backends = ?descriptors.iter().map(|d| d.name.as_str()).collect::<Vec<_>>(),
            "backend configuration resolved"
        );
        Ok(descriptors)
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate the settings file.
///
/// Order: explicit path, `MCP_BRIDGE_CONFIG`, then `mcp-bridge.yaml` in
/// `start` or any parent. Falls back to `start/mcp-bridge.yaml`, which may
/// not exist.
pub fn find_settings_path(explicit: Option<&Path>, start: &Path) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    if let Ok(path) = std::env::var(SETTINGS_PATH_ENV) {
        if !path.trim().is_empty() {
            return PathBuf::from(expand_tilde(&path));
        }
    }

    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(SETTINGS_FILE_NAME);
        if candidate.is_file() {
            return candidate;
        }
        if !dir.pop() {
            break;
        }
    }
    start.join(SETTINGS_FILE_NAME)
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
pub fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    if let Some((var_name, default)) = expr.split_once(":-") {
        match std::env::var(var_name) {
            Ok(value) if !value.is_empty() => value,
            _ => expand_tilde(default),
        }
    } else {
        std::env::var(expr).unwrap_or_default()
    }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
