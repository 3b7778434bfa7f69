//! Connection registry: the single owner of backend connections.
//!
//! Holds the immutable set of known `ServerDescriptor`s and the ordered set
//! of active connections. Responsibilities:
//! - Lazy, single-flight connects (one per-name async lock)
//! - Orderly disconnects and bridge shutdown
//! - Crash detection: a watcher per connection evicts backends whose output
//!   stream closes outside an orderly disconnect
//! - The derived tool catalog and a status report
//!
//! Share it as `Arc<ConnectionRegistry>`; every method takes `&self`.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::catalog::{validate_backend_name, ToolCatalog};
use super::connection::{BackendConnection, ConnectionOptions};
use super::errors::McpError;
use super::types::{CallToolResult, ServerDescriptor};

/// Backend names that cannot be configured. `bridge` namespaces the
/// in-process meta-tools.
pub const RESERVED_BACKEND_NAMES: &[&str] = &["bridge"];

type ActiveSet = Arc<RwLock<Vec<Arc<BackendConnection>>>>;

// ─── Status ──────────────────────────────────────────────────────────────────

/// Per-backend line of the status report.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendStatus {
    pub name: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub active: bool,
    pub tool_count: usize,
    pub pid: Option<u32>,
    pub connected_at: Option<DateTime<Utc>>,
}

/// Snapshot of the bridge for operators and the `bridge__list_servers` and
/// `bridge__status` meta-tools.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeStatus {
    pub uptime_secs: u64,
    pub pid: u32,
    /// Resident memory of the bridge process in bytes, when available.
    pub memory_bytes: Option<u64>,
    pub active_count: usize,
    pub tool_count: usize,
    pub spawn_attempts: u64,
    pub backends: Vec<BackendStatus>,
}

// ─── ConnectionRegistry ──────────────────────────────────────────────────────

pub struct ConnectionRegistry {
    descriptors: BTreeMap<String, ServerDescriptor>,
    options: ConnectionOptions,
    auto_connect: Vec<String>,
    /// Active connections in activation order.
    active: ActiveSet,
    connect_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// Flipped under the `active` write lock.
    shut_down: AtomicBool,
    spawn_attempts: AtomicU64,
    started_at: Instant,
}

impl ConnectionRegistry {
    /// Build a registry from descriptors. Names must be unique, satisfy the
    /// namespacing rule, and not be reserved.
    pub fn new(
        descriptors: Vec<ServerDescriptor>,
        options: ConnectionOptions,
    ) -> Result<Self, McpError> {
        let mut by_name = BTreeMap::new();
        for descriptor in descriptors {
            validate_backend_name(&descriptor.name).map_err(|reason| McpError::ConfigError {
                reason: format!("invalid backend name '{}': {reason}", descriptor.name),
            })?;
            if RESERVED_BACKEND_NAMES.contains(&descriptor.name.as_str()) {
                return Err(McpError::ConfigError {
                    reason: format!("backend name '{}' is reserved", descriptor.name),
                });
            }
            if descriptor.command.trim().is_empty() {
                return Err(McpError::ConfigError {
                    reason: format!("backend '{}' has no command", descriptor.name),
                });
            }
            if by_name.contains_key(&descriptor.name) {
                return Err(McpError::ConfigError {
                    reason: format!("duplicate backend name '{}'", descriptor.name),
                });
            }
            by_name.insert(descriptor.name.clone(), descriptor);
        }

        tracing::info!(
            known = by_name.len(),
            backends = ?by_name.keys().collect::<Vec<_>>(),
            "connection registry initialized"
        );

        Ok(Self {
            descriptors: by_name,
            options,
            auto_connect: Vec::new(),
            active: Arc::new(RwLock::new(Vec::new())),
            connect_locks: Mutex::new(HashMap::new()),
            shut_down: AtomicBool::new(false),
            spawn_attempts: AtomicU64::new(0),
            started_at: Instant::now(),
        })
    }

    /// Backends to connect in [`connect_defaults`](Self::connect_defaults).
    pub fn with_auto_connect(mut self, names: Vec<String>) -> Self {
        self.auto_connect = names;
        self
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    fn read_active(&self) -> RwLockReadGuard<'_, Vec<Arc<BackendConnection>>> {
        self.active.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write_active(&self) -> RwLockWriteGuard<'_, Vec<Arc<BackendConnection>>> {
        self.active.write().unwrap_or_else(|p| p.into_inner())
    }

    fn connect_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.connect_locks.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(locks.entry(name.to_string()).or_default())
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    // ─── Queries ─────────────────────────────────────────────────────────

    /// All configured backend names, sorted.
    pub fn list_known_backends(&self) -> Vec<String> {
        self.descriptors.keys().cloned().collect()
    }

    /// Active backend names in activation order.
    pub fn list_active_backends(&self) -> Vec<String> {
        self.read_active()
            .iter()
            .map(|c| c.name().to_string())
            .collect()
    }

    pub fn is_known(&self, name: &str) -> bool {
        self.descriptors.contains_key(name)
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.read_active().iter().any(|c| c.name() == name)
    }

    pub fn descriptor(&self, name: &str) -> Option<&ServerDescriptor> {
        self.descriptors.get(name)
    }

    pub fn connection(&self, name: &str) -> Option<Arc<BackendConnection>> {
        self.read_active()
            .iter()
            .find(|c| c.name() == name)
            .cloned()
    }

    /// Number of process spawns attempted so far.
    pub fn spawn_attempts(&self) -> u64 {
        self.spawn_attempts.load(Ordering::SeqCst)
    }

    /// Current catalog, rebuilt from the active connections.
    pub fn catalog(&self) -> ToolCatalog {
        let active = self.read_active();
        ToolCatalog::from_backends(active.iter().map(|c| (c.name(), c.tools())))
    }

    // ─── Connect ─────────────────────────────────────────────────────────

    /// Return the live connection for `name`, connecting first if needed.
    ///
    /// Concurrent callers for the same name share one connect attempt and
    /// receive the same connection.
    pub async fn ensure_connected(&self, name: &str) -> Result<Arc<BackendConnection>, McpError> {
        if self.is_shut_down() {
            return Err(McpError::RegistryShutDown);
        }
        let descriptor = self
            .descriptors
            .get(name)
            .ok_or_else(|| McpError::UnknownBackend {
                name: name.to_string(),
            })?;

        if let Some(conn) = self.live_connection(name) {
            return Ok(conn);
        }

        let lock = self.connect_lock(name);
        let _guard = lock.lock().await;

        // Another caller may have finished while we waited.
        if let Some(conn) = self.live_connection(name) {
            return Ok(conn);
        }
        if self.is_shut_down() {
            return Err(McpError::RegistryShutDown);
        }

        self.spawn_attempts.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();
        let mut conn = BackendConnection::new(descriptor.clone(), self.options.clone());
        conn.connect().await?;
        let conn = Arc::new(conn);

        let admitted = {
            let mut active = self.write_active();
            if self.is_shut_down() {
                false
            } else {
                active.push(Arc::clone(&conn));
                true
            }
        };
        if !admitted {
            conn.disconnect().await;
            return Err(McpError::RegistryShutDown);
        }

        self.watch(&conn);
        tracing::info!(
            server = %name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            active = self.read_active().len(),
            "backend activated"
        );
        Ok(conn)
    }

    /// Active connection that is still usable. A dead one is evicted.
    fn live_connection(&self, name: &str) -> Option<Arc<BackendConnection>> {
        let conn = self.connection(name)?;
        if conn.is_alive() {
            return Some(conn);
        }
        self.evict(&conn);
        None
    }

    /// Remove a specific connection from the active set.
    fn evict(&self, conn: &Arc<BackendConnection>) -> bool {
        evict_from(&self.active, conn)
    }

    /// Spawn the crash watcher for a freshly activated connection.
    fn watch(&self, conn: &Arc<BackendConnection>) {
        let Some(closed) = conn.closed_signal() else {
            return;
        };
        let active = Arc::clone(&self.active);
        let weak = Arc::downgrade(conn);

        tokio::spawn(async move {
            closed.await;
            let Some(conn) = weak.upgrade() else {
                return;
            };
            if conn.mark_crashed().await {
                evict_from(&active, &conn);
                tracing::warn!(
                    server = %conn.name(),
                    stderr = %conn.stderr_tail(),
                    "backend crashed, removed from active set"
                );
            }
        });
    }

    /// Connect the configured auto-connect subset concurrently.
    ///
    /// Returns the backends that failed (partial startup is fine).
    pub async fn connect_defaults(&self) -> Vec<(String, McpError)> {
        let names: Vec<&String> = self
            .auto_connect
            .iter()
            .filter(|name| {
                let known = self.is_known(name);
                if !known {
                    tracing::warn!(server = %name, "auto-connect backend is not configured, skipping");
                }
                known
            })
            .collect();

        let attempts = names.iter().map(|name| async move {
            (name.to_string(), self.ensure_connected(name).await)
        });

        futures::future::join_all(attempts)
            .await
            .into_iter()
            .filter_map(|(name, outcome)| outcome.err().map(|e| (name, e)))
            .collect()
    }

    // ─── Calls ───────────────────────────────────────────────────────────

    /// Connect if needed, then invoke `local_name` on `backend`.
    ///
    /// A transport closing underneath the call evicts the backend and is
    /// reported as `BackendCrashed`.
    pub async fn call_tool(
        &self,
        backend: &str,
        local_name: &str,
        arguments: serde_json::Value,
    ) -> Result<CallToolResult, McpError> {
        let conn = self.ensure_connected(backend).await?;

        match conn.call_tool(local_name, arguments).await {
            Err(McpError::TransportClosed { .. }) => {
                conn.mark_crashed().await;
                self.evict(&conn);
                let stderr = conn.stderr_tail();
                let reason = if stderr.is_empty() {
                    "transport closed during tools/call".to_string()
                } else {
                    format!("transport closed during tools/call | stderr: {}", stderr.trim())
                };
                tracing::warn!(server = %backend, tool = %local_name, "backend crashed mid-call");
                Err(McpError::BackendCrashed {
                    name: backend.to_string(),
                    reason,
                })
            }
            other => other,
        }
    }

    // ─── Disconnect ──────────────────────────────────────────────────────

    /// Disconnect one backend. Idempotent; waits for an in-flight connect of
    /// the same name to finish first.
    pub async fn disconnect(&self, name: &str) {
        let lock = self.connect_lock(name);
        let _guard = lock.lock().await;

        let removed = {
            let mut active = self.write_active();
            active
                .iter()
                .position(|c| c.name() == name)
                .map(|idx| active.remove(idx))
        };
        if let Some(conn) = removed {
            conn.disconnect().await;
        }
    }

    /// Disconnect every active backend concurrently.
    pub async fn disconnect_all(&self) {
        let names = self.list_active_backends();
        futures::future::join_all(names.iter().map(|n| self.disconnect(n))).await;
    }

    /// Refuse further connects and disconnect everything. Idempotent.
    pub async fn shutdown(&self) {
        let drained: Vec<Arc<BackendConnection>> = {
            let mut active = self.write_active();
            if self.shut_down.swap(true, Ordering::SeqCst) && active.is_empty() {
                return;
            }
            active.drain(..).collect()
        };

        tracing::info!(count = drained.len(), "shutting down connection registry");
        futures::future::join_all(drained.iter().map(|c| c.disconnect())).await;
    }

    // ─── Status ──────────────────────────────────────────────────────────

    pub async fn status(&self) -> BridgeStatus {
        let catalog = self.catalog();
        let backends: Vec<BackendStatus> = self
            .descriptors
            .values()
            .map(|d| {
                let conn = self.connection(&d.name);
                BackendStatus {
                    name: d.name.clone(),
                    description: d.description.clone(),
                    category: d.category.clone(),
                    active: conn.is_some(),
                    tool_count: catalog.tools_for_backend(&d.name),
                    pid: conn.as_ref().and_then(|c| c.pid()),
                    connected_at: conn.as_ref().and_then(|c| c.connected_at()),
                }
            })
            .collect();

        let memory_bytes = tokio::task::spawn_blocking(process_memory_bytes)
            .await
            .ok()
            .flatten();

        BridgeStatus {
            uptime_secs: self.started_at.elapsed().as_secs(),
            pid: std::process::id(),
            memory_bytes,
            active_count: backends.iter().filter(|b| b.active).count(),
            tool_count: catalog.len(),
            spawn_attempts: self.spawn_attempts(),
            backends,
        }
    }
}

fn evict_from(active: &ActiveSet, conn: &Arc<BackendConnection>) -> bool {
    let mut guard = active.write().unwrap_or_else(|p| p.into_inner());
    let before = guard.len();
    guard.retain(|c| !Arc::ptr_eq(c, conn));
    before != guard.len()
}

/// Resident memory of this process.
fn process_memory_bytes() -> Option<u64> {
    let mut sys = sysinfo::System::new_all();
    sys.refresh_all();
    let pid = sysinfo::Pid::from_u32(std::process::id());
    sys.process(pid).map(|p| p.memory())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
