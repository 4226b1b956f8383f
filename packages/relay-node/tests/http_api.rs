//! End-to-end tests over the HTTP surface using a stub core binary and
//! in-process request dispatch.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use relay_node::config::NodeConfig;
use relay_node::controller::Controller;
use relay_node::router::build_router;

const STUB_SCRIPT: &str = r#"#!/bin/sh
if [ "$1" = "version" ]; then
    echo "sing-box version 1.9.3 (stub)"
    exit 0
fi
exec sleep 30
"#;

fn write_stub_core(dir: &Path) -> PathBuf {
    let path = dir.join("sing-box-stub");
    std::fs::write(&path, STUB_SCRIPT).expect("write stub script");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("mark stub executable");
    }
    path
}

fn test_controller(dir: &Path) -> Arc<Controller> {
    let executable = write_stub_core(dir);
    Controller::new(NodeConfig::for_tests(&executable, dir))
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("build request")
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("read body")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("json body")
}

fn start_request_body() -> Value {
    let config = json!({
        "inbounds": [
            {"tag": "vmess-in", "type": "vmess", "listen": "0.0.0.0", "listen_port": 8080, "users": []}
        ]
    });
    json!({
        "backend_type": "sing_box",
        "config": config.to_string(),
        "users": [
            {"email": "alice", "inbounds": ["vmess-in"], "vmess": {"id": "3c9ef1c8-0000-0000-0000-000000000001"}}
        ],
        "exclude_inbounds": [],
        "keep_alive": 0
    })
}

#[tokio::test]
async fn base_reports_no_session_before_start() {
    let dir = tempfile::tempdir().expect("tempdir");
    let router = build_router(test_controller(dir.path()));

    let response = router
        .oneshot(Request::get("/base").body(Body::empty()).expect("request"))
        .await
        .expect("dispatch");
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    assert_eq!(body["started"], json!(false));
    assert_eq!(body["core_version"], json!(""));
    assert_eq!(body["node_version"], json!(env!("CARGO_PKG_VERSION")));
}

#[tokio::test]
async fn start_sync_stop_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let controller = test_controller(dir.path());
    let router = build_router(controller.clone());

    let response = router
        .clone()
        .oneshot(json_request("POST", "/start", start_request_body()))
        .await
        .expect("dispatch start");
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["started"], json!(true));
    assert_eq!(body["core_version"], json!("1.9.3"));

    let users = json!([
        {"email": "bob", "inbounds": ["vmess-in"], "vmess": {"id": "3c9ef1c8-0000-0000-0000-000000000002"}}
    ]);
    let response = router
        .clone()
        .oneshot(json_request("POST", "/users/sync", users))
        .await
        .expect("dispatch users sync");
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let user = json!(
        {"email": "carol", "inbounds": ["vmess-in"], "vmess": {"id": "3c9ef1c8-0000-0000-0000-000000000003"}}
    );
    let response = router
        .clone()
        .oneshot(json_request("POST", "/user/sync", user))
        .await
        .expect("dispatch user sync");
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = router
        .clone()
        .oneshot(json_request("POST", "/stop", json!({})))
        .await
        .expect("dispatch stop");
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = router
        .oneshot(Request::get("/base").body(Body::empty()).expect("request"))
        .await
        .expect("dispatch base");
    let body = json_body(response).await;
    assert_eq!(body["started"], json!(false));
}

#[tokio::test]
async fn unknown_backend_type_is_a_client_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let router = build_router(test_controller(dir.path()));

    let mut body = start_request_body();
    body["backend_type"] = json!("wireguard");
    let response = router
        .oneshot(json_request("POST", "/start", body))
        .await
        .expect("dispatch");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let problem = json_body(response).await;
    assert_eq!(problem["type"], json!("urn:relay-node:error:invalid_backend_type"));
}

#[tokio::test]
async fn malformed_core_config_is_a_client_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let router = build_router(test_controller(dir.path()));

    let mut body = start_request_body();
    body["config"] = json!("{\"outbounds\": []}");
    let response = router
        .oneshot(json_request("POST", "/start", body))
        .await
        .expect("dispatch");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let problem = json_body(response).await;
    assert_eq!(problem["type"], json!("urn:relay-node:error:config_invalid"));
}

#[tokio::test]
async fn sync_without_session_is_a_conflict() {
    let dir = tempfile::tempdir().expect("tempdir");
    let router = build_router(test_controller(dir.path()));

    let response = router
        .clone()
        .oneshot(json_request("POST", "/users/sync", json!([])))
        .await
        .expect("dispatch");
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = router
        .oneshot(Request::get("/stats/backend").body(Body::empty()).expect("request"))
        .await
        .expect("dispatch");
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn stop_without_session_succeeds() {
    let dir = tempfile::tempdir().expect("tempdir");
    let router = build_router(test_controller(dir.path()));

    let response = router
        .oneshot(json_request("POST", "/stop", json!({})))
        .await
        .expect("dispatch");
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn api_key_gates_every_route() {
    let dir = tempfile::tempdir().expect("tempdir");
    let executable = write_stub_core(dir.path());
    let key = uuid::Uuid::new_v4();
    let mut cfg = NodeConfig::for_tests(&executable, dir.path());
    cfg.api_key = Some(key);
    let router = build_router(Controller::new(cfg));

    let response = router
        .clone()
        .oneshot(Request::get("/base").body(Body::empty()).expect("request"))
        .await
        .expect("dispatch");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = router
        .oneshot(
            Request::get("/base")
                .header("x-api-key", key.to_string())
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("dispatch");
    assert_eq!(response.status(), StatusCode::OK);
}
