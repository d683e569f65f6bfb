//! Route contract tests driven through the router

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use registry_core::{InstanceStatus, RegistryEngine};
use registry_server::{build_router, RegistryConfig};

fn app_with(config: RegistryConfig) -> (Router, Arc<RegistryEngine>) {
    let mut core = config.core_config();
    // Router tests exercise the HTTP contract; probes stay quiet
    core.probe.enabled = false;
    let engine = Arc::new(RegistryEngine::new(core).unwrap());
    let router = build_router(Arc::new(config), Arc::clone(&engine));
    (router, engine)
}

fn app() -> (Router, Arc<RegistryEngine>) {
    app_with(RegistryConfig::default())
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn put(uri: &str) -> Request<Body> {
    Request::builder()
        .method("PUT")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn delete(uri: &str) -> Request<Body> {
    Request::builder()
        .method("DELETE")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn registration(instance_id: &str, zone: &str, version: &str) -> Value {
    json!({
        "instanceId": instance_id,
        "host": "10.0.0.1",
        "port": 8080,
        "metadata": {"zone": zone, "version": version}
    })
}

#[tokio::test]
async fn register_then_discover() {
    let (router, _engine) = app();
    let (status, body) = send(
        &router,
        post_json(
            "/api/v1/registry/services/catalog/instances",
            json!({
                "serviceId": "catalog",
                "instanceId": "c-1",
                "host": "10.0.0.1",
                "port": 8080,
                "metadata": {"version": "1.0.0", "zone": "us-east-1a"}
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["serviceId"], "catalog");
    assert_eq!(body["instanceId"], "c-1");
    assert_eq!(body["status"], "STARTING");

    let (status, body) = send(&router, get("/api/v1/discovery/services/catalog/instances")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["serviceId"], "catalog");
    assert_eq!(body["totalInstances"], 1);
    assert_eq!(body["instances"][0]["metadata"]["zone"], "us-east-1a");
}

#[tokio::test]
async fn register_rejects_invalid_payloads() {
    let (router, _engine) = app();
    let (status, body) = send(
        &router,
        post_json(
            "/api/v1/registry/services/svc/instances",
            json!({"instanceId": "bad id", "host": "10.0.0.1", "port": 8080}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_001");
    assert_eq!(body["path"], "/api/v1/registry/services/svc/instances");
    assert!(body["timestamp"].is_string());

    // body serviceId contradicting the path is rejected before the store
    let (status, body) = send(
        &router,
        post_json(
            "/api/v1/registry/services/svc/instances",
            json!({"serviceId": "other", "instanceId": "i", "host": "10.0.0.1", "port": 8080}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_001");
}

#[tokio::test]
async fn heartbeat_contract() {
    let (router, _engine) = app();
    let (status, body) = send(
        &router,
        put("/api/v1/registry/services/ghost/instances/i/heartbeat"),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "REGISTRY_002");

    send(
        &router,
        post_json(
            "/api/v1/registry/services/svc/instances",
            registration("i-1", "z", "1"),
        ),
    )
    .await;
    let (status, body) = send(
        &router,
        put("/api/v1/registry/services/svc/instances/i-1/heartbeat"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "UP");
}

#[tokio::test]
async fn deregister_is_idempotent() {
    let (router, _engine) = app();
    // S6: deleting something that never existed is still 204
    let (status, body) = send(&router, delete("/api/v1/registry/services/z/instances/q")).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(body, Value::Null);

    send(
        &router,
        post_json(
            "/api/v1/registry/services/z/instances",
            registration("q", "z", "1"),
        ),
    )
    .await;
    let (status, _) = send(&router, delete("/api/v1/registry/services/z/instances/q")).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(&router, delete("/api/v1/registry/services/z/instances/q")).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn discovery_filters_by_zone_version_and_health() {
    let (router, engine) = app();
    for (id, zone, version) in [
        ("a", "us-east-1a", "1.0.0"),
        ("b", "us-east-1b", "1.0.0"),
        ("c", "us-west-1a", "1.1.0"),
    ] {
        send(
            &router,
            post_json(
                "/api/v1/registry/services/svc/instances",
                registration(id, zone, version),
            ),
        )
        .await;
    }
    engine.renew("svc", "a").unwrap();
    engine.renew("svc", "b").unwrap();
    engine
        .update_status("svc", "c", InstanceStatus::Down, "test")
        .unwrap();

    let (status, body) = send(
        &router,
        get("/api/v1/discovery/services/svc/instances?healthyOnly=true&zone=us-east-1a&version=1.0.0"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["totalInstances"], 1);
    assert_eq!(body["instances"][0]["instanceId"], "a");

    let (_, body) = send(
        &router,
        get("/api/v1/discovery/services/svc/instances?status=INVALID"),
    )
    .await;
    assert_eq!(body["totalInstances"], 0);

    let (_, body) = send(
        &router,
        get("/api/v1/discovery/services/svc/healthy-instances"),
    )
    .await;
    assert_eq!(body["totalInstances"], 2);
}

#[tokio::test]
async fn catalog_totals_reflect_health_filter() {
    let (router, engine) = app();
    send(
        &router,
        post_json(
            "/api/v1/registry/services/alive/instances",
            registration("a-1", "z", "1"),
        ),
    )
    .await;
    send(
        &router,
        post_json(
            "/api/v1/registry/services/dead/instances",
            registration("d-1", "z", "1"),
        ),
    )
    .await;
    engine.renew("alive", "a-1").unwrap();
    engine
        .update_status("dead", "d-1", InstanceStatus::Down, "test")
        .unwrap();

    let (_, body) = send(&router, get("/api/v1/discovery/catalog")).await;
    assert_eq!(body["totalServices"], 2);
    assert_eq!(body["totalInstances"], 2);

    let (_, body) = send(&router, get("/api/v1/discovery/catalog?healthyOnly=true")).await;
    assert_eq!(body["totalServices"], 1);
    assert_eq!(body["totalInstances"], 1);
    assert!(body["services"]["dead"].is_null());
}

#[tokio::test]
async fn malformed_service_id_is_rejected_on_discovery_reads() {
    let (router, _engine) = app();
    let long_id = "x".repeat(101);
    let (status, body) = send(
        &router,
        get(&format!("/api/v1/discovery/services/{long_id}/instances")),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_001");
}

#[tokio::test]
async fn management_endpoints() {
    let (router, engine) = app();
    let (status, body) = send(&router, post_json("/api/v1/management/cleanup", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let (status, _) = send(&router, get("/api/v1/management/instances/s/i")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    send(
        &router,
        post_json(
            "/api/v1/registry/services/s/instances",
            registration("i", "z", "1"),
        ),
    )
    .await;
    engine.renew("s", "i").unwrap();

    let (status, body) = send(&router, get("/api/v1/management/instances/s/i")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["instanceId"], "i");

    let (status, body) = send(&router, get("/api/v1/management/instances/s/i/history")).await;
    assert_eq!(status, StatusCode::OK);
    // The renew recorded STARTING -> UP
    assert_eq!(body["history"][0]["previousStatus"], "STARTING");
    assert_eq!(body["history"][0]["status"], "UP");
}

#[tokio::test]
async fn actuator_endpoints_respond() {
    let (router, _engine) = app();
    let (status, body) = send(&router, get("/actuator/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "UP");

    let (status, body) = send(&router, get("/actuator/info")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "registry-server");

    let (status, _) = send(&router, get("/management/info")).await;
    assert_eq!(status, StatusCode::OK);

    let response = router
        .clone()
        .oneshot(get("/actuator/prometheus"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("registry_uptime_seconds"));
}

fn secured_config() -> RegistryConfig {
    let mut config = RegistryConfig::default();
    config.security.enabled = true;
    config.security.api_key = "0123456789abcdef".to_string();
    config
}

#[tokio::test]
async fn auth_rejects_missing_key_with_contract_envelope() {
    let (router, _engine) = app_with(secured_config());
    let request = Request::builder()
        .uri("/api/v1/registry/services")
        .header("X-Forwarded-For", "10.1.2.3")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&router, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "AUTH_001");
    assert_eq!(body["message"], "API key authentication required");
    assert_eq!(body["path"], "/api/v1/registry/services");
    assert_eq!(body["details"]["remote_address"], "10.1.2.3");
    assert!(body["details"]["hint"].is_string());
}

#[tokio::test]
async fn auth_accepts_header_and_query_key() {
    let (router, _engine) = app_with(secured_config());

    let request = Request::builder()
        .uri("/api/v1/registry/services")
        .header("X-Registry-API-Key", "0123456789abcdef")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&router, request).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(
        &router,
        get("/api/v1/registry/services?api_key=0123456789abcdef"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let request = Request::builder()
        .uri("/api/v1/registry/services")
        .header("X-Registry-API-Key", "wrong-key-wrong-key")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&router, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn public_paths_bypass_auth() {
    let (router, _engine) = app_with(secured_config());
    for path in [
        "/actuator/health",
        "/actuator/info",
        "/actuator/prometheus",
        "/management/info",
    ] {
        let (status, _) = send(&router, get(path)).await;
        assert_eq!(status, StatusCode::OK, "path {path} should be public");
    }
}

fn clustered_config() -> RegistryConfig {
    let mut config = RegistryConfig::default();
    config.cluster.enabled = true;
    config
}

#[tokio::test]
async fn cluster_routes_absent_when_disabled() {
    let (router, _engine) = app();
    let (status, _) = send(&router, get("/api/v1/cluster/status")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cluster_event_ingestion_and_membership() {
    let (router, engine) = app_with(clustered_config());

    // Inbound replicated REGISTER from a peer
    let instance = json!({
        "serviceId": "x", "instanceId": "1", "host": "10.0.0.9", "port": 8080,
        "secure": false, "status": "UP", "metadata": {},
        "registrationTime": "2026-08-01T10:00:00.000Z",
        "lastHeartbeat": "2026-08-01T10:00:00.000Z"
    });
    let event = json!({
        "eventId": "e-1", "type": "REGISTER", "serviceId": "x", "instanceId": "1",
        "instance": instance, "timestamp": "2026-08-01T10:00:00.000Z",
        "originNodeId": "peer-node:8761"
    });
    let (status, body) = send(&router, post_json("/api/v1/cluster/events", event)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert!(engine.store().get_instance("x", "1").is_some());

    let (status, body) = send(&router, get("/api/v1/cluster/status")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["totalNodes"], 1);
    assert_eq!(body["healthyNodes"], 1);
    assert_eq!(body["currentNode"]["status"], "UP");

    let (status, body) = send(&router, get("/api/v1/cluster/current-node")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["nodeId"], "localhost:8761");

    let (_, body) = send(&router, get("/api/v1/cluster/health")).await;
    assert_eq!(body["status"], "UP");
    assert_eq!(body["needsFailover"], false);

    // Join a peer, then the table lists two nodes
    let node = json!({
        "nodeId": "peer-node:8762", "host": "127.0.0.1", "port": 8762,
        "status": "UP", "lastSeen": "2026-08-01T10:00:00.000Z", "metadata": {}
    });
    let (status, _) = send(&router, post_json("/api/v1/cluster/join", node)).await;
    assert_eq!(status, StatusCode::OK);
    let (_, body) = send(&router, get("/api/v1/cluster/nodes")).await;
    assert_eq!(body.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn sse_streams_advertise_event_stream_content_type() {
    let (router, _engine) = app_with(clustered_config());
    for path in [
        "/api/v1/events/services/svc/stream",
        "/api/v1/events/health/stream",
        "/api/v1/cluster/events/stream",
    ] {
        let response = router.clone().oneshot(get(path)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(content_type.starts_with("text/event-stream"), "path {path}");
    }
}
