mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;

use common::{demo_backend, missing_backend, registry, test_options};
use mcp_bridge::mcp_client::{ConnectionRegistry, ToolFilter, ToolInventory};

#[tokio::test]
async fn test_concurrent_connects_share_one_spawn() {
    let registry = registry(vec![demo_backend("demo")]);

    let attempts = (0..8).map(|_| registry.ensure_connected("demo"));
    let conns: Vec<_> = futures::future::join_all(attempts)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    assert_eq!(registry.spawn_attempts(), 1);
    assert!(conns.iter().all(|c| Arc::ptr_eq(c, &conns[0])));
    assert_eq!(registry.list_active_backends(), vec!["demo"]);

    registry.shutdown().await;
}

#[tokio::test]
async fn test_inactive_dispatch_connects_then_calls() {
    let registry = registry(vec![demo_backend("demo")]);
    assert!(!registry.is_active("demo"));

    let result = registry
        .call_tool("demo", "add", json!({"a": 3, "b": 5}))
        .await
        .unwrap();

    assert_eq!(result.text(), "8");
    assert_eq!(result.structured_content, Some(json!({"result": 8.0})));
    assert_eq!(registry.spawn_attempts(), 1);
    assert!(registry.is_active("demo"));

    registry.shutdown().await;
}

#[tokio::test]
async fn test_catalog_is_namespaced_and_searchable() {
    let registry = registry(vec![demo_backend("demo"), demo_backend("other")]);
    registry.ensure_connected("demo").await.unwrap();

    let catalog = registry.catalog();
    let names = catalog.names();
    assert!(names.contains(&"demo__add".to_string()));
    assert!(names.contains(&"demo__analyze_text".to_string()));
    assert!(names.iter().all(|n| n.starts_with("demo__")));

    let math = catalog.search(&ToolFilter {
        category: Some("math".into()),
        ..ToolFilter::default()
    });
    let math_names: Vec<String> = math.iter().map(|t| t.name.to_string()).collect();
    assert_eq!(math_names.len(), 2);
    assert!(math_names.contains(&"demo__multiply".to_string()));

    let pattern = catalog.search(&ToolFilter {
        name_pattern: Some("*__ec?o".into()),
        ..ToolFilter::default()
    });
    assert_eq!(pattern.len(), 1);

    registry.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_removes_tools_and_next_call_reconnects() {
    let registry = registry(vec![demo_backend("demo")]);
    registry.ensure_connected("demo").await.unwrap();
    assert!(!registry.catalog().is_empty());

    registry.disconnect("demo").await;
    assert!(!registry.is_active("demo"));
    assert!(registry.catalog().is_empty());

    // Idempotent.
    registry.disconnect("demo").await;

    let result = registry
        .call_tool("demo", "echo", json!({"text": "again"}))
        .await
        .unwrap();
    assert_eq!(result.text(), "again");
    assert_eq!(registry.spawn_attempts(), 2);

    registry.shutdown().await;
}

#[tokio::test]
async fn test_crash_is_reported_and_evicted() {
    let registry = registry(vec![demo_backend("demo")]);
    let first = registry.ensure_connected("demo").await.unwrap();

    let err = registry
        .call_tool("demo", "crash", json!({"code": 3}))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "backend_crashed_error");
    assert!(err.is_recoverable());
    assert!(!registry.is_active("demo"));
    assert!(!first.is_alive());

    let result = registry
        .call_tool("demo", "add", json!({"a": 1, "b": 1}))
        .await
        .unwrap();
    assert_eq!(result.text(), "2");
    assert_eq!(registry.spawn_attempts(), 2);

    let second = registry.connection("demo").unwrap();
    assert!(!Arc::ptr_eq(&first, &second));

    registry.shutdown().await;
}

#[tokio::test]
async fn test_handshake_timeout() {
    let mut options = test_options();
    options.handshake_timeout = Duration::from_millis(300);
    let registry = ConnectionRegistry::new(
        vec![demo_backend("slow").with_env("DEMO_SERVER_HANDSHAKE_DELAY_MS", "5000")],
        options,
    )
    .unwrap();

    let started = Instant::now();
    let err = registry.ensure_connected("slow").await.unwrap_err();
    assert_eq!(err.kind(), "backend_handshake_error");
    assert!(started.elapsed() < Duration::from_secs(4));
    assert!(!registry.is_active("slow"));
}

#[tokio::test]
async fn test_spawn_failure_leaves_nothing_active() {
    let registry = registry(vec![missing_backend("docker")]);
    let err = registry.ensure_connected("docker").await.unwrap_err();
    assert_eq!(err.kind(), "backend_spawn_error");
    assert_eq!(registry.spawn_attempts(), 1);
    assert!(registry.list_active_backends().is_empty());
}

#[tokio::test]
async fn test_unknown_backend_spawns_nothing() {
    let registry = registry(vec![demo_backend("demo")]);
    let err = registry
        .call_tool("kubernetes", "get_pods", json!({}))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "unknown_backend_error");
    assert_eq!(registry.spawn_attempts(), 0);
}

#[tokio::test]
async fn test_backend_without_tools_capability() {
    let registry = registry(vec![demo_backend("quiet").with_env("DEMO_SERVER_NO_TOOLS", "1")]);
    let conn = registry.ensure_connected("quiet").await.unwrap();

    assert_eq!(conn.inventory(), &ToolInventory::NotAdvertised);
    assert_eq!(registry.catalog().tools_for_backend("quiet"), 0);

    let err = registry
        .call_tool("quiet", "add", json!({"a": 1, "b": 2}))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "unknown_tool_error");

    registry.shutdown().await;
}

#[tokio::test]
async fn test_tool_failures_keep_backend_active() {
    let registry = registry(vec![demo_backend("demo")]);

    let err = registry
        .call_tool("demo", "fail", json!({"message": "disk full"}))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "tool_execution_error");
    assert!(err.to_string().contains("disk full"));

    let err = registry
        .call_tool("demo", "rpc_error", json!({}))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "tool_execution_error");

    assert!(registry.is_active("demo"));
    assert_eq!(registry.spawn_attempts(), 1);

    registry.shutdown().await;
}

#[tokio::test]
async fn test_call_timeout_does_not_kill_backend() {
    let mut options = test_options();
    options.call_timeout = Some(Duration::from_millis(200));
    let registry = ConnectionRegistry::new(vec![demo_backend("demo")], options).unwrap();

    let err = registry
        .call_tool("demo", "sleep", json!({"ms": 2000}))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "tool_timeout_error");
    assert!(registry.is_active("demo"));

    let result = registry
        .call_tool("demo", "multiply", json!({"a": 6, "b": 7}))
        .await
        .unwrap();
    assert_eq!(result.text(), "42");

    registry.shutdown().await;
}

#[tokio::test]
async fn test_out_of_order_responses_are_correlated() {
    let registry = registry(vec![demo_backend("demo")]);

    let (slow, fast) = tokio::join!(
        registry.call_tool("demo", "sleep", json!({"ms": 300})),
        registry.call_tool("demo", "echo", json!({"text": "fast"})),
    );
    assert_eq!(slow.unwrap().text(), "slept 300ms");
    assert_eq!(fast.unwrap().text(), "fast");
    assert_eq!(registry.spawn_attempts(), 1);

    registry.shutdown().await;
}

#[tokio::test]
async fn test_non_json_stdout_lines_are_skipped() {
    let registry = registry(vec![demo_backend("noisy").with_env("DEMO_SERVER_NOISE", "1")]);
    let result = registry
        .call_tool("noisy", "echo", json!({"text": "hi"}))
        .await
        .unwrap();
    assert_eq!(result.text(), "hi");

    registry.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_refuses_new_connections() {
    let registry = registry(vec![demo_backend("demo")]);
    registry.ensure_connected("demo").await.unwrap();

    registry.shutdown().await;
    assert!(registry.list_active_backends().is_empty());

    let err = registry.ensure_connected("demo").await.unwrap_err();
    assert_eq!(err.kind(), "registry_shut_down_error");

    // Idempotent.
    registry.shutdown().await;
}

#[tokio::test]
async fn test_status_reports_active_backends() {
    let registry = registry(vec![demo_backend("demo"), missing_backend("docker")]);
    registry.ensure_connected("demo").await.unwrap();

    let status = registry.status().await;
    assert_eq!(status.active_count, 1);
    assert_eq!(status.backends.len(), 2);
    let demo = status.backends.iter().find(|b| b.name == "demo").unwrap();
    assert!(demo.active);
    assert!(demo.pid.is_some());
    assert!(demo.tool_count > 0);
    let docker = status.backends.iter().find(|b| b.name == "docker").unwrap();
    assert!(!docker.active);

    registry.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_all_keeps_registry_usable() {
    let registry = registry(vec![demo_backend("alpha"), demo_backend("beta")]);
    registry.ensure_connected("alpha").await.unwrap();
    registry.ensure_connected("beta").await.unwrap();
    assert_eq!(registry.list_active_backends(), vec!["alpha", "beta"]);

    registry.disconnect_all().await;
    assert!(registry.list_active_backends().is_empty());
    assert!(registry.catalog().is_empty());

    // Unlike shutdown, later dispatches may connect again.
    registry.ensure_connected("beta").await.unwrap();
    assert_eq!(registry.spawn_attempts(), 3);

    registry.shutdown().await;
}
