//! JSON-RPC over stdio transport.
//!
//! Handles low-level communication with one backend process:
//! - Writing line-delimited JSON-RPC requests and notifications to stdin
//! - A background reader task that owns stdout and dispatches each response
//!   to the caller waiting on its correlation id
//! - Answering the few requests a backend may send us (`ping`)
//! - Failing every outstanding request when the stream closes
//!
//! The transport is generic over any async byte streams so it can run over
//! in-memory pipes as well as child-process stdio.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, MutexGuard};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::types::{error_codes, IncomingMessage, JsonRpcError, JsonRpcRequest, JsonRpcResponse};

// ─── Request ID Generator ────────────────────────────────────────────────────

/// Global monotonic request ID counter.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a unique request ID.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

// ─── Shared State ────────────────────────────────────────────────────────────

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type Slot = oneshot::Sender<Result<JsonRpcResponse, McpError>>;

/// Correlation table. `closed` lives under the same lock as the slots so a
/// slot can never be registered after the final drain.
#[derive(Default)]
struct PendingTable {
    closed: bool,
    slots: HashMap<u64, Slot>,
}

struct Shared {
    server_name: String,
    writer: Mutex<Option<BoxedWriter>>,
    pending: std::sync::Mutex<PendingTable>,
    violations: AtomicU64,
    closed_tx: watch::Sender<bool>,
}

impl Shared {
    fn table(&self) -> MutexGuard<'_, PendingTable> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn write_line(&self, line: &str) -> Result<(), McpError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| McpError::TransportWrite {
            server: self.server_name.clone(),
            reason: "stdin already closed".into(),
        })?;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| McpError::TransportWrite {
                server: self.server_name.clone(),
                reason: format!("failed to write to stdin: {e}"),
            })?;
        writer.flush().await.map_err(|e| McpError::TransportWrite {
            server: self.server_name.clone(),
            reason: format!("failed to flush stdin: {e}"),
        })
    }

    fn record_violation(&self, reason: &str) {
        self.violations.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(server = %self.server_name, reason, "protocol violation");
    }

    /// Resolve every outstanding request with `TransportClosed`.
    fn close_pending(&self) {
        let drained: Vec<Slot> = {
            let mut table = self.table();
            table.closed = true;
            table.slots.drain().map(|(_, slot)| slot).collect()
        };
        if !drained.is_empty() {
            tracing::debug!(
                server = %self.server_name,
                pending = drained.len(),
                "failing outstanding requests on close"
            );
        }
        for slot in drained {
            let _ = slot.send(Err(McpError::TransportClosed {
                server: self.server_name.clone(),
            }));
        }
        self.closed_tx.send_replace(true);
    }

    /// Route one stdout line. Returns the reply owed to the backend when the
    /// line was a request.
    fn handle_line(&self, line: &str) -> Option<String> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }

        let message: IncomingMessage = match serde_json::from_str(trimmed) {
            Ok(m) => m,
            Err(_) => {
                // Backends frequently print log output on stdout.
                tracing::debug!(
                    server = %self.server_name,
                    line = %truncate_for_log(trimmed),
                    "skipping non-JSON output"
                );
                return None;
            }
        };

        match (message.method, message.id) {
            (Some(method), Some(id)) => return Some(server_request_reply(&method, id)),
            (Some(method), None) => {
                tracing::debug!(server = %self.server_name, method = %method, "backend notification");
            }
            (None, Some(id)) => self.resolve(id, message.result, message.error),
            (None, None) => self.record_violation("message has neither id nor method"),
        }
        None
    }

    fn resolve(
        &self,
        id: serde_json::Value,
        result: Option<serde_json::Value>,
        error: Option<JsonRpcError>,
    ) {
        let Some(numeric_id) = id.as_u64() else {
            self.record_violation("response id is not a request id we issue");
            return;
        };

        let slot = self.table().slots.remove(&numeric_id);
        match slot {
            Some(slot) => {
                let _ = slot.send(Ok(JsonRpcResponse {
                    jsonrpc: "2.0".into(),
                    id: numeric_id,
                    result,
                    error,
                }));
            }
            None => self.record_violation("response for unknown or abandoned request id"),
        }
    }

    async fn send_reply(&self, line: &str) {
        if let Err(e) = self.write_line(line).await {
            tracing::debug!(server = %self.server_name, error = %e, "failed to answer backend request");
        }
    }
}

/// Our answer to a request the backend sent us: `ping` gets an empty result,
/// anything else is method-not-found.
fn server_request_reply(method: &str, id: serde_json::Value) -> String {
    let reply = if method == "ping" {
        serde_json::json!({"jsonrpc": "2.0", "id": id, "result": {}})
    } else {
        serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {
                "code": error_codes::METHOD_NOT_FOUND,
                "message": format!("client does not handle '{method}'"),
            }
        })
    };
    let mut line = reply.to_string();
    line.push('\n');
    line
}

async fn read_loop(shared: Arc<Shared>, reader: BoxedReader) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if let Some(reply) = shared.handle_line(&line) {
                    // Written off the reader so a busy stdin never stalls response routing.
                    let shared = Arc::clone(&shared);
                    tokio::spawn(async move { shared.send_reply(&reply).await });
                }
            }
            Ok(None) => {
                tracing::debug!(server = %shared.server_name, "backend stdout closed");
                break;
            }
            Err(e) => {
                tracing::warn!(server = %shared.server_name, error = %e, "backend stdout read failed");
                break;
            }
        }
    }
    shared.close_pending();
}

fn truncate_for_log(line: &str) -> &str {
    crate::agent_core::tokens::truncate_utf8(line, 200)
}

// ─── Pending Response ────────────────────────────────────────────────────────

/// Handle to one in-flight request. Dropping it before completion releases
/// its correlation slot.
pub struct PendingResponse {
    id: u64,
    rx: oneshot::Receiver<Result<JsonRpcResponse, McpError>>,
    shared: Arc<Shared>,
}

impl PendingResponse {
    /// Wait for the matching response.
    pub async fn wait(mut self) -> Result<JsonRpcResponse, McpError> {
        match (&mut self.rx).await {
            Ok(outcome) => outcome,
            Err(_) => Err(McpError::TransportClosed {
                server: self.shared.server_name.clone(),
            }),
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        self.shared.table().slots.remove(&self.id);
    }
}

// ─── Transport ───────────────────────────────────────────────────────────────

/// Bi-directional JSON-RPC transport with a background reader.
pub struct StdioTransport {
    shared: Arc<Shared>,
    reader_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl StdioTransport {
    /// Create a transport and start its reader task. Must be called inside a
    /// Tokio runtime.
    pub fn new<W, R>(server_name: &str, writer: W, reader: R) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        let (closed_tx, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            server_name: server_name.to_string(),
            writer: Mutex::new(Some(Box::new(writer))),
            pending: std::sync::Mutex::new(PendingTable::default()),
            violations: AtomicU64::new(0),
            closed_tx,
        });

        let task = tokio::spawn(read_loop(Arc::clone(&shared), Box::new(reader)));

        Self {
            shared,
            reader_task: std::sync::Mutex::new(Some(task)),
        }
    }

    pub fn server_name(&self) -> &str {
        &self.shared.server_name
    }

    /// Write a request and return a handle to await its response.
    ///
    /// The slot is registered before the write so a fast reply cannot race
    /// past it.
    pub async fn send(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<PendingResponse, McpError> {
        let id = next_request_id();
        let req = JsonRpcRequest::new(id, method, params);

        let mut json = serde_json::to_string(&req).map_err(|e| McpError::TransportWrite {
            server: self.shared.server_name.clone(),
            reason: format!("failed to serialize request: {e}"),
        })?;
        json.push('\n');

        let (tx, rx) = oneshot::channel();
        {
            let mut table = self.shared.table();
            if table.closed {
                return Err(McpError::TransportWrite {
                    server: self.shared.server_name.clone(),
                    reason: "transport is closed".into(),
                });
            }
            table.slots.insert(id, tx);
        }

        let pending = PendingResponse {
            id,
            rx,
            shared: Arc::clone(&self.shared),
        };

        // On failure `pending` drops here and frees the slot.
        self.shared.write_line(&json).await?;
        Ok(pending)
    }

    /// Send a request and wait for the matching response.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        self.send(method, params).await?.wait().await
    }

    /// Send a JSON-RPC notification (no response expected).
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        let mut notification = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
        });
        if let Some(params) = params {
            notification["params"] = params;
        }

        let mut json = notification.to_string();
        json.push('\n');
        self.shared.write_line(&json).await
    }

    /// Whether the read side has closed.
    pub fn is_closed(&self) -> bool {
        self.shared.table().closed
    }

    /// Resolves once the read side has closed (stream end, read error, or
    /// `shutdown`).
    pub fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.shared.closed_tx.subscribe();
        async move {
            let _ = rx.wait_for(|closed| *closed).await;
        }
    }

    /// Number of requests still waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.shared.table().slots.len()
    }

    /// Responses that matched no outstanding request, and other ignored
    /// protocol violations.
    pub fn protocol_violations(&self) -> u64 {
        self.shared.violations.load(Ordering::Relaxed)
    }

    /// Close the write side. A well-behaved backend exits on stdin EOF.
    pub async fn close_write(&self) {
        let writer = self.shared.writer.lock().await.take();
        if let Some(mut writer) = writer {
            let _ = writer.shutdown().await;
        }
    }

    /// Close both directions and fail anything still outstanding.
    pub async fn shutdown(&self) {
        self.close_write().await;
        self.abort_reader();
        self.shared.close_pending();
    }

    fn abort_reader(&self) {
        let task = self
            .reader_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.abort_reader();
        self.shared.close_pending();
    }
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response.
pub fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, JsonRpcError> {
    if let Some(err) = response.error {
        return Err(err);
    }

    response.result.ok_or(JsonRpcError {
        code: error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    type ServerLines = tokio::io::Lines<BufReader<ReadHalf<DuplexStream>>>;

    /// Transport wired to an in-memory fake backend.
    fn pipe() -> (StdioTransport, ServerLines, WriteHalf<DuplexStream>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);
        let transport = StdioTransport::new("fake", client_write, client_read);
        (transport, BufReader::new(server_read).lines(), server_write)
    }

    async fn read_request(lines: &mut ServerLines) -> serde_json::Value {
        let line = lines.next_line().await.unwrap().unwrap();
        serde_json::from_str(&line).unwrap()
    }

    async fn reply(writer: &mut WriteHalf<DuplexStream>, value: serde_json::Value) {
        let mut line = value.to_string();
        line.push('\n');
        writer.write_all(line.as_bytes()).await.unwrap();
    }

    #[test]
    fn test_next_request_id_is_monotonic() {
        let id1 = next_request_id();
        let id2 = next_request_id();
        assert!(id2 > id1);
    }

    #[test]
    fn test_extract_result_error() {
        let resp = JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: 1,
            result: None,
            error: Some(JsonRpcError {
                code: -32601,
                message: "Method not found".into(),
                data: None,
            }),
        };
        let err = extract_result(resp).unwrap_err();
        assert_eq!(err.code, -32601);
        assert_eq!(err.message, "Method not found");
    }

    #[test]
    fn test_extract_result_missing_both() {
        let resp = JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: 1,
            result: None,
            error: None,
        };
        assert_eq!(extract_result(resp).unwrap_err().code, error_codes::INTERNAL_ERROR);
    }

    #[tokio::test]
    async fn test_out_of_order_responses_are_matched_by_id() {
        let (transport, mut lines, mut writer) = pipe();

        let first = transport.send("slow", None).await.unwrap();
        let second = transport.send("fast", None).await.unwrap();

        let req_a = read_request(&mut lines).await;
        let req_b = read_request(&mut lines).await;

        // Answer in reverse order.
        reply(&mut writer, serde_json::json!({"jsonrpc":"2.0","id":req_b["id"],"result":"b"})).await;
        reply(&mut writer, serde_json::json!({"jsonrpc":"2.0","id":req_a["id"],"result":"a"})).await;

        let a = first.wait().await.unwrap();
        let b = second.wait().await.unwrap();
        assert_eq!(a.result, Some(serde_json::json!("a")));
        assert_eq!(b.result, Some(serde_json::json!("b")));
        assert_eq!(transport.protocol_violations(), 0);
    }

    #[tokio::test]
    async fn test_unmatched_response_is_counted_not_fatal() {
        let (transport, mut lines, mut writer) = pipe();

        let pending = transport.send("tools/list", None).await.unwrap();
        let req = read_request(&mut lines).await;

        reply(&mut writer, serde_json::json!({"jsonrpc":"2.0","id":u64::MAX,"result":{}})).await;
        reply(&mut writer, serde_json::json!({"jsonrpc":"2.0","id":req["id"],"result":{"ok":true}})).await;

        let resp = pending.wait().await.unwrap();
        assert_eq!(resp.result.unwrap()["ok"], true);
        assert_eq!(transport.protocol_violations(), 1);
    }

    #[tokio::test]
    async fn test_non_json_lines_are_skipped() {
        let (transport, mut lines, mut writer) = pipe();

        let pending = transport.send("initialize", None).await.unwrap();
        let req = read_request(&mut lines).await;
        writer.write_all(b"starting up...\n\n").await.unwrap();
        reply(&mut writer, serde_json::json!({"jsonrpc":"2.0","id":req["id"],"result":{}})).await;

        assert!(pending.wait().await.is_ok());
        assert_eq!(transport.protocol_violations(), 0);
    }

    #[tokio::test]
    async fn test_stream_close_fails_pending_requests() {
        let (transport, lines, writer) = pipe();

        let pending = transport.send("tools/call", None).await.unwrap();
        drop(lines);
        drop(writer);

        let err = pending.wait().await.unwrap_err();
        assert!(matches!(err, McpError::TransportClosed { .. }));

        transport.closed().await;
        assert!(transport.is_closed());
        let err = transport.send("tools/call", None).await.err().unwrap();
        assert!(matches!(err, McpError::TransportWrite { .. }));
        assert_eq!(transport.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_pending_releases_slot() {
        let (transport, _lines, _writer) = pipe();

        let pending = transport.send("tools/call", None).await.unwrap();
        assert_eq!(transport.pending_count(), 1);
        drop(pending);
        assert_eq!(transport.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_late_response_after_timeout_is_a_violation() {
        let (transport, mut lines, mut writer) = pipe();

        let timed_out = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            transport.request("slow", None),
        )
        .await;
        assert!(timed_out.is_err());
        assert_eq!(transport.pending_count(), 0);

        let req = read_request(&mut lines).await;
        reply(&mut writer, serde_json::json!({"jsonrpc":"2.0","id":req["id"],"result":{}})).await;

        // Round-trip a second request to be sure the late reply was processed.
        let pending = transport.send("next", None).await.unwrap();
        let next = read_request(&mut lines).await;
        reply(&mut writer, serde_json::json!({"jsonrpc":"2.0","id":next["id"],"result":{}})).await;
        pending.wait().await.unwrap();

        assert_eq!(transport.protocol_violations(), 1);
    }

    #[tokio::test]
    async fn test_ping_from_backend_is_answered() {
        let (_transport, mut lines, mut writer) = pipe();

        reply(&mut writer, serde_json::json!({"jsonrpc":"2.0","id":"srv-7","method":"ping"})).await;
        let answer = read_request(&mut lines).await;
        assert_eq!(answer["id"], "srv-7");
        assert_eq!(answer["result"], serde_json::json!({}));
    }

    #[tokio::test]
    async fn test_ping_does_not_block_response_routing() {
        let (transport, mut lines, mut writer) = pipe();

        let pending = transport.send("tools/call", None).await.unwrap();
        let req = read_request(&mut lines).await;

        // Simulate a write stuck on a full stdin pipe.
        let stdin = transport.shared.writer.lock().await;
        reply(&mut writer, serde_json::json!({"jsonrpc":"2.0","id":"srv-1","method":"ping"})).await;
        reply(&mut writer, serde_json::json!({"jsonrpc":"2.0","id":req["id"],"result":{"ok":true}})).await;

        let resp = tokio::time::timeout(std::time::Duration::from_secs(2), pending.wait())
            .await
            .expect("response routed while stdin was busy")
            .unwrap();
        assert_eq!(resp.result.unwrap()["ok"], true);

        drop(stdin);
        let answer = read_request(&mut lines).await;
        assert_eq!(answer["id"], "srv-1");
    }

    #[tokio::test]
    async fn test_unknown_backend_request_gets_method_not_found() {
        let (_transport, mut lines, mut writer) = pipe();

        reply(
            &mut writer,
            serde_json::json!({"jsonrpc":"2.0","id":5,"method":"sampling/createMessage"}),
        )
        .await;
        let answer = read_request(&mut lines).await;
        assert_eq!(answer["error"]["code"], error_codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_notify_omits_id() {
        let (transport, mut lines, _writer) = pipe();

        transport
            .notify("notifications/initialized", None)
            .await
            .unwrap();
        let msg = read_request(&mut lines).await;
        assert_eq!(msg["method"], "notifications/initialized");
        assert!(msg.get("id").is_none());
        assert!(msg.get("params").is_none());
    }

    #[tokio::test]
    async fn test_shutdown_fails_pending_and_closes() {
        let (transport, _lines, _writer) = pipe();

        let pending = transport.send("tools/call", None).await.unwrap();
        transport.shutdown().await;

        assert!(matches!(
            pending.wait().await,
            Err(McpError::TransportClosed { .. })
        ));
        assert!(transport.is_closed());
    }
}
