//! Router-level tests exercising both API surfaces in-process.

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::sync::Arc;
use tower::util::ServiceExt;

use skiff_proto::NODE_TOKEN_HEADER;
use skiff_store::Store;

use crate::config::PanelConfig;
use crate::{AppState, build_router};

const ADMIN_TOKEN: &str = "test-operator-token";

async fn test_app() -> (Router, AppState) {
    let store = Store::open_in_memory().await.expect("store");
    let config: PanelConfig = serde_yaml::from_str(&format!(
        "admin_token: \"{ADMIN_TOKEN}\"\n"
    ))
    .expect("config");
    let state = AppState::new(store, Arc::new(config));
    (build_router(state.clone()), state)
}

fn admin_req(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {ADMIN_TOKEN}"))
        .header(header::CONTENT_TYPE, "application/json");
    match body {
        Some(value) => builder
            .body(Body::from(serde_json::to_vec(&value).expect("body")))
            .expect("request"),
        None => builder.body(Body::empty()).expect("request"),
    }
}

fn node_req(method: &str, uri: &str, token: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(NODE_TOKEN_HEADER, token)
        .header(header::CONTENT_TYPE, "application/json");
    match body {
        Some(value) => builder
            .body(Body::from(serde_json::to_vec(&value).expect("body")))
            .expect("request"),
        None => builder.body(Body::empty()).expect("request"),
    }
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.expect("body").to_bytes();
    serde_json::from_slice(&bytes).expect("json body")
}

async fn create_node(router: &Router) -> String {
    let response = router
        .clone()
        .oneshot(admin_req(
            "POST",
            "/admin/nodes",
            Some(json!({ "display_name": "edge-1", "host": "198.51.100.10", "port": 8443 })),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    body["data"]["id"].as_str().expect("node id").to_string()
}

async fn issue_token(router: &Router, node_id: &str) -> String {
    let response = router
        .clone()
        .oneshot(admin_req(
            "POST",
            &format!("/admin/nodes/{node_id}/token"),
            None,
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    body["data"]["secret"].as_str().expect("secret").to_string()
}

fn heartbeat_body(forwarder_alive: bool) -> Value {
    json!({
        "metrics": {
            "cpu_pct": 10.0, "mem_pct": 20.0, "disk_pct": 30.0,
            "active_conns": 1, "up_delta_bytes": 0, "down_delta_bytes": 0,
            "forwarder_alive": forwarder_alive, "uptime_secs": 60
        },
        "agent_version": "0.1.0"
    })
}

#[tokio::test]
async fn admin_surface_requires_bearer_token() {
    let (router, _state) = test_app().await;
    let response = router
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/admin/nodes")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = json_body(response).await;
    assert_eq!(body["error"]["code"], "TokenInvalid");
}

#[tokio::test]
async fn register_heartbeat_and_fetch_empty_config() {
    let (router, _state) = test_app().await;
    let node_id = create_node(&router).await;
    let secret = issue_token(&router, &node_id).await;

    // Register with the issued token.
    let response = router
        .clone()
        .oneshot(node_req(
            "POST",
            "/node/register",
            &secret,
            Some(json!({
                "token": secret,
                "agent_version": "0.1.0",
                "hostname": "edge-1",
                "os": "linux",
                "arch": "x86_64"
            })),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["data"]["node_id"], node_id.as_str());

    // First heartbeat puts the node online and carries a fingerprint.
    let response = router
        .clone()
        .oneshot(node_req(
            "POST",
            "/node/heartbeat",
            &secret,
            Some(heartbeat_body(true)),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["data"]["status"], "online");
    let fingerprint = body["data"]["fingerprint"].as_str().expect("fp").to_string();

    // Fetch the config: zero inbounds, direct + block outbounds.
    let response = router
        .clone()
        .oneshot(node_req("GET", "/node/config", &secret, None))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["data"]["fingerprint"], fingerprint.as_str());
    let config: Value =
        serde_json::from_str(body["data"]["config"].as_str().expect("config")).expect("json");
    assert_eq!(config["inbounds"].as_array().expect("arr").len(), 0);
    assert_eq!(config["outbounds"][0]["tag"], "direct");
    assert_eq!(config["outbounds"][1]["tag"], "block");

    // If-None-Match short-circuits without bytes.
    let request = Request::builder()
        .method("GET")
        .uri("/node/config")
        .header(NODE_TOKEN_HEADER, &secret)
        .header(header::IF_NONE_MATCH, &fingerprint)
        .body(Body::empty())
        .expect("request");
    let response = router.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
}

#[tokio::test]
async fn port_conflict_blocks_delivery_and_heartbeat_fingerprint() {
    let (router, _state) = test_app().await;
    let node_id = create_node(&router).await;
    let secret = issue_token(&router, &node_id).await;

    // User assigned, two proxies on the same port.
    let response = router
        .clone()
        .oneshot(admin_req("POST", "/admin/users", Some(json!({}))))
        .await
        .expect("response");
    let user_id = json_body(response).await["data"]["id"]
        .as_str()
        .expect("user id")
        .to_string();
    router
        .clone()
        .oneshot(admin_req(
            "POST",
            "/admin/assignments",
            Some(json!({ "user_id": user_id, "node_id": node_id })),
        ))
        .await
        .expect("response");
    for credential in ["cred-a", "cred-b"] {
        let response = router
            .clone()
            .oneshot(admin_req(
                "POST",
                "/admin/proxies",
                Some(json!({
                    "user_id": user_id,
                    "node_id": node_id,
                    "protocol": "vless",
                    "listen_port": 8080,
                    "settings": { "credential": credential }
                })),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    // Config fetch surfaces the conflict with both proxy ids.
    let response = router
        .clone()
        .oneshot(node_req("GET", "/node/config", &secret, None))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body = json_body(response).await;
    assert_eq!(body["error"]["code"], "ConflictingPorts");
    assert_eq!(body["error"]["details"]["proxies"].as_array().expect("arr").len(), 2);

    // Heartbeat still succeeds but carries no fingerprint.
    let response = router
        .clone()
        .oneshot(node_req(
            "POST",
            "/node/heartbeat",
            &secret,
            Some(heartbeat_body(true)),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert!(body["data"]["fingerprint"].is_null());
}

#[tokio::test]
async fn rotation_rejects_old_token() {
    let (router, _state) = test_app().await;
    let node_id = create_node(&router).await;
    let old_secret = issue_token(&router, &node_id).await;
    let new_secret = issue_token(&router, &node_id).await;

    let response = router
        .clone()
        .oneshot(node_req(
            "POST",
            "/node/heartbeat",
            &old_secret,
            Some(heartbeat_body(true)),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = router
        .clone()
        .oneshot(node_req(
            "POST",
            "/node/heartbeat",
            &new_secret,
            Some(heartbeat_body(true)),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn traffic_batches_are_idempotent_through_the_api() {
    let (router, _state) = test_app().await;
    let node_id = create_node(&router).await;
    let secret = issue_token(&router, &node_id).await;

    let response = router
        .clone()
        .oneshot(admin_req("POST", "/admin/users", Some(json!({}))))
        .await
        .expect("response");
    let user_id = json_body(response).await["data"]["id"]
        .as_str()
        .expect("user id")
        .to_string();

    let batch = json!({
        "batch_id": "batch-0001",
        "samples": [{
            "user_id": user_id,
            "up_bytes": 1000,
            "down_bytes": 2000,
            "recorded_at": chrono::Utc::now()
        }]
    });

    for (round, expect_dup) in [(1, false), (2, true)] {
        let response = router
            .clone()
            .oneshot(node_req(
                "POST",
                "/node/traffic",
                &secret,
                Some(batch.clone()),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK, "round {round}");
        let body = json_body(response).await;
        assert_eq!(body["data"]["duplicate"], expect_dup, "round {round}");
    }

    // The aggregate equals one submission.
    let response = router
        .clone()
        .oneshot(admin_req(
            "GET",
            &format!("/admin/users/{user_id}/timeline?bucket=hour"),
            None,
        ))
        .await
        .expect("response");
    let body = json_body(response).await;
    let total: i64 = body["data"]
        .as_array()
        .expect("buckets")
        .iter()
        .map(|b| b["up_bytes"].as_i64().unwrap_or(0) + b["down_bytes"].as_i64().unwrap_or(0))
        .sum();
    assert_eq!(total, 3000);
}

#[tokio::test]
async fn command_roundtrip_through_heartbeat() {
    let (router, _state) = test_app().await;
    let node_id = create_node(&router).await;
    let secret = issue_token(&router, &node_id).await;

    let response = router
        .clone()
        .oneshot(admin_req(
            "POST",
            &format!("/admin/nodes/{node_id}/commands"),
            Some(json!({ "kind": "restart_forwarder" })),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let command_id = json_body(response).await["data"]["id"]
        .as_str()
        .expect("command id")
        .to_string();

    // Delivered on the next heartbeat.
    let response = router
        .clone()
        .oneshot(node_req(
            "POST",
            "/node/heartbeat",
            &secret,
            Some(heartbeat_body(true)),
        ))
        .await
        .expect("response");
    let body = json_body(response).await;
    assert_eq!(body["data"]["commands"][0]["id"], command_id.as_str());
    assert_eq!(body["data"]["commands"][0]["kind"], "restart_forwarder");

    // Agent posts the result; the command completes.
    let response = router
        .clone()
        .oneshot(node_req(
            "POST",
            "/node/command/result",
            &secret,
            Some(json!({
                "command_id": command_id,
                "success": true,
                "output": { "restarted": true },
                "duration_ms": 420
            })),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let response = router
        .clone()
        .oneshot(admin_req("GET", &format!("/admin/commands/{command_id}"), None))
        .await
        .expect("response");
    let body = json_body(response).await;
    assert_eq!(body["data"]["status"], "completed");
    assert_eq!(body["data"]["success"], true);
}

#[tokio::test]
async fn cluster_summary_counts_states() {
    let (router, _state) = test_app().await;
    let node_id = create_node(&router).await;
    let secret = issue_token(&router, &node_id).await;

    router
        .clone()
        .oneshot(node_req(
            "POST",
            "/node/heartbeat",
            &secret,
            Some(heartbeat_body(false)),
        ))
        .await
        .expect("response");

    let response = router
        .clone()
        .oneshot(admin_req("GET", "/admin/cluster/summary", None))
        .await
        .expect("response");
    let body = json_body(response).await;
    assert_eq!(body["data"]["total"], 1);
    assert_eq!(body["data"]["degraded"], 1);
}

#[tokio::test]
async fn deploy_endpoints_require_configuration() {
    let (router, _state) = test_app().await;
    let node_id = create_node(&router).await;

    let response = router
        .clone()
        .oneshot(admin_req(
            "POST",
            &format!("/admin/nodes/{node_id}/deploy"),
            Some(json!({
                "host": "203.0.113.4",
                "username": "root",
                "credential": { "kind": "password", "password": "pw" }
            })),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["error"]["code"], "InvalidRequest");
}
