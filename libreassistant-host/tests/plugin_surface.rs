//! Plugin management surface tests: discovery, approval, lifecycle errors.

use axum::http::StatusCode;
use axum_test::TestServer;
use serde_json::json;
use std::path::Path;
use std::time::Duration;

use libreassistant_host::config::Config;
use libreassistant_host::server::{build_router, AppState};

fn write_manifest(root: &Path, id: &str, entrypoint: &str, port: u16, permissions: &str) {
    let dir = root.join(id);
    std::fs::create_dir(&dir).unwrap();
    std::fs::write(
        dir.join("plugin.toml"),
        format!(
            r#"
id = "{id}"
name = "{id}"
version = "0.1.0"
description = "integration test plugin"
author = "tests"
entrypoint = "{entrypoint}"
port = {port}
permissions = {permissions}
"#
        ),
    )
    .unwrap();
}

fn state_for(root: &Path) -> AppState {
    let mut config = Config::default();
    config.plugins.root = root.to_path_buf();
    config.plugins.auto_start = false;
    config.plugins.readiness_deadline = Duration::from_millis(300);
    config.plugins.stop_deadline = Duration::from_millis(300);
    let state = AppState::from_config(config);
    state.registry.scan().unwrap();
    state
}

#[tokio::test]
async fn discovered_plugin_is_listed_with_metadata() {
    let root = tempfile::tempdir().unwrap();
    write_manifest(root.path(), "search", "sleep 30", 42401, r#"["network"]"#);

    let server = TestServer::new(build_router(state_for(root.path()))).unwrap();
    let response = server.get("/plugins").await;
    assert_eq!(response.status_code(), StatusCode::OK);

    let body = response.json::<serde_json::Value>();
    let plugins = body["plugins"].as_array().unwrap();
    assert_eq!(plugins.len(), 1);
    assert_eq!(plugins[0]["id"], "search");
    assert_eq!(plugins[0]["state"], "discovered");
    assert_eq!(plugins[0]["declared_port"], 42401);
    assert_eq!(plugins[0]["permissions"][0], "network");
    assert_eq!(plugins[0]["granted"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn approve_grants_declared_permissions() {
    let root = tempfile::tempdir().unwrap();
    write_manifest(root.path(), "search", "sleep 30", 42402, r#"["network"]"#);

    let server = TestServer::new(build_router(state_for(root.path()))).unwrap();

    let response = server.post("/plugins/search/approve").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body = response.json::<serde_json::Value>();
    assert_eq!(body["plugin"]["state"], "approved");

    let listing = server.get("/plugins").await.json::<serde_json::Value>();
    assert_eq!(listing["plugins"][0]["granted"][0], "network");
}

#[tokio::test]
async fn approve_with_unknown_capability_is_rejected() {
    let root = tempfile::tempdir().unwrap();
    write_manifest(root.path(), "search", "sleep 30", 42403, "[]");

    let server = TestServer::new(build_router(state_for(root.path()))).unwrap();
    let response = server
        .post("/plugins/search/approve")
        .json(&json!({"permissions": ["root-access"]}))
        .await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn start_before_approval_conflicts() {
    let root = tempfile::tempdir().unwrap();
    write_manifest(root.path(), "search", "sleep 30", 42404, "[]");

    let server = TestServer::new(build_router(state_for(root.path()))).unwrap();
    let response = server.post("/plugins/search/start").await;
    assert_eq!(response.status_code(), StatusCode::CONFLICT);
    let body = response.json::<serde_json::Value>();
    assert_eq!(body["error"]["type"], "invalid_transition");
}

#[tokio::test]
async fn readiness_failure_surfaces_and_clear_recovers() {
    let root = tempfile::tempdir().unwrap();
    // Never serves /health, so the short readiness deadline trips.
    write_manifest(root.path(), "mute", "sleep 30", 42405, "[]");

    let server = TestServer::new(build_router(state_for(root.path()))).unwrap();
    server.post("/plugins/mute/approve").await.assert_status_ok();

    let response = server.post("/plugins/mute/start").await;
    assert_eq!(response.status_code(), StatusCode::BAD_GATEWAY);
    let body = response.json::<serde_json::Value>();
    assert_eq!(body["error"]["type"], "readiness_timeout");

    let status = server.get("/plugins/mute/status").await.json::<serde_json::Value>();
    assert_eq!(status["plugin"]["state"], "failed");
    assert!(status["plugin"]["last_error"].is_string());

    let response = server.post("/plugins/mute/clear").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body = response.json::<serde_json::Value>();
    assert_eq!(body["plugin"]["state"], "stopped");
}

#[tokio::test]
async fn occupied_port_start_conflicts() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let root = tempfile::tempdir().unwrap();
    write_manifest(root.path(), "clash", "sleep 30", port, "[]");

    let server = TestServer::new(build_router(state_for(root.path()))).unwrap();
    server.post("/plugins/clash/approve").await.assert_status_ok();

    let response = server.post("/plugins/clash/start").await;
    assert_eq!(response.status_code(), StatusCode::CONFLICT);
    let body = response.json::<serde_json::Value>();
    assert_eq!(body["error"]["type"], "port_in_use");
}

#[tokio::test]
async fn stop_without_process_is_a_noop() {
    let root = tempfile::tempdir().unwrap();
    write_manifest(root.path(), "search", "sleep 30", 42406, "[]");

    let server = TestServer::new(build_router(state_for(root.path()))).unwrap();
    let response = server.post("/plugins/search/stop").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body = response.json::<serde_json::Value>();
    assert_eq!(body["plugin"]["state"], "discovered");
}

#[tokio::test]
async fn rescan_picks_up_new_manifests() {
    let root = tempfile::tempdir().unwrap();
    write_manifest(root.path(), "first", "sleep 30", 42407, "[]");

    let server = TestServer::new(build_router(state_for(root.path()))).unwrap();
    let listing = server.get("/plugins").await.json::<serde_json::Value>();
    assert_eq!(listing["plugins"].as_array().unwrap().len(), 1);

    write_manifest(root.path(), "second", "sleep 30", 42408, "[]");
    let response = server.post("/plugins/rescan").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.json::<serde_json::Value>()["plugins"], 2);

    let listing = server.get("/plugins").await.json::<serde_json::Value>();
    assert_eq!(listing["plugins"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn invalid_manifests_are_reported_not_fatal() {
    let root = tempfile::tempdir().unwrap();
    write_manifest(root.path(), "good", "sleep 30", 42409, "[]");
    let bad = root.path().join("bad");
    std::fs::create_dir(&bad).unwrap();
    std::fs::write(bad.join("plugin.toml"), "id = \"BAD ID\"").unwrap();

    let server = TestServer::new(build_router(state_for(root.path()))).unwrap();
    let body = server.get("/plugins").await.json::<serde_json::Value>();
    assert_eq!(body["plugins"].as_array().unwrap().len(), 1);
    assert_eq!(body["scan_errors"].as_array().unwrap().len(), 1);
}
