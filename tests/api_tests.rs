// HTTP API tests - poking the router with oneshot requests, no sockets harmed.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use vm_lifecycle_manager::api::{create_router, AppState};
use vm_lifecycle_manager::config::{generate_default_config, Settings};
use vm_lifecycle_manager::core::lifecycle::{PROVISION_DELAY, STARTUP_DELAY};
use vm_lifecycle_manager::core::{
    InMemoryVmRepository, LifecycleSimulator, StatsSampler, VmRepository, VmService,
};
use vm_lifecycle_manager::monitoring::ApiMetrics;

fn test_settings() -> Settings {
    let mut settings = generate_default_config();
    settings.rate_limit.enabled = false;
    settings
}

fn app_with(settings: Settings) -> (Router, Arc<VmService>) {
    let repo: Arc<dyn VmRepository> = Arc::new(InMemoryVmRepository::new());
    let simulator = LifecycleSimulator::new(Arc::clone(&repo), StatsSampler::default());
    let service = Arc::new(VmService::new(repo, settings.limits.clone(), simulator));
    let metrics = ApiMetrics::new().unwrap();
    let state = Arc::new(AppState::new(
        Arc::clone(&service),
        Arc::new(settings),
        metrics,
    ));
    (create_router(state), service)
}

fn app() -> (Router, Arc<VmService>) {
    app_with(test_settings())
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn put_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(Method::PUT)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn post_empty(uri: &str) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn vm_body(name: &str) -> Value {
    json!({
        "name": name,
        "description": "from the api tests",
        "cpu_cores": 2,
        "ram_mb": 4096,
        "disk_gb": 50,
        "image_name": "debian:12",
        "labels": { "team": "infra" }
    })
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };
    (status, body)
}

async fn create(app: &Router, name: &str) -> String {
    let (status, body) = send(app, post_json("/api/v1/vms", vm_body(name))).await;
    assert_eq!(status, StatusCode::CREATED, "{}", body);
    body["data"]["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn health_carries_request_id_and_security_headers() {
    let (app, _) = app();
    let response = app.clone().oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let headers = response.headers();
    assert!(headers.contains_key("x-request-id"));
    assert_eq!(headers["x-content-type-options"], "nosniff");
    assert_eq!(headers["x-frame-options"], "DENY");
    assert_eq!(headers["referrer-policy"], "strict-origin-when-cross-origin");

    let body: Value =
        serde_json::from_slice(&to_bytes(response.into_body(), usize::MAX).await.unwrap()).unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "vm-lifecycle-manager");
}

#[tokio::test]
async fn oversized_body_is_413_and_still_tagged() {
    let mut settings = test_settings();
    settings.server.body_limit_bytes = 64;
    let (app, _) = app_with(settings);

    let payload = vm_body(&"x".repeat(100)).to_string();
    let req = Request::builder()
        .method(Method::POST)
        .uri("/api/v1/vms")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::CONTENT_LENGTH, payload.len())
        .body(Body::from(payload))
        .unwrap();
    let response = app.clone().oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert!(response.headers().contains_key("x-request-id"));
    assert_eq!(response.headers()["x-content-type-options"], "nosniff");

    let (status, _) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn probes_and_version() {
    let (app, _) = app();
    let (status, body) = send(&app, get("/ready")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["checks"]["database"], "ok");

    let (status, body) = send(&app, get("/live")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "alive");

    let (_, body) = send(&app, get("/version")).await;
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(body["environment"], "debug");
}

#[tokio::test]
async fn create_returns_201_with_pending_vm() {
    let (app, _) = app();
    let req = Request::builder()
        .method(Method::POST)
        .uri("/api/v1/vms")
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-request-id", "req-abc")
        .body(Body::from(vm_body("api-vm").to_string()))
        .unwrap();

    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["request_id"], "req-abc");
    assert_eq!(body["message"], "VM created successfully");
    assert_eq!(body["data"]["status"], "pending");
    assert_eq!(body["data"]["created_by"], "system");
    assert_eq!(body["data"]["spec"]["cpu_cores"], 2);
    assert_eq!(body["data"]["uptime_seconds"], 0);
    assert_eq!(body["data"]["labels"]["team"], "infra");
}

#[tokio::test]
async fn duplicate_name_is_409() {
    let (app, _) = app();
    create(&app, "twin").await;
    let (status, body) = send(&app, post_json("/api/v1/vms", vm_body("twin"))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "ALREADY_EXISTS");
}

#[tokio::test]
async fn malformed_and_invalid_bodies_are_400() {
    let (app, _) = app();

    let req = Request::builder()
        .method(Method::POST)
        .uri("/api/v1/vms")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_FAILED");

    let mut tiny = vm_body("tiny");
    tiny["ram_mb"] = json!(64);
    let (status, body) = send(&app, post_json("/api/v1/vms", tiny)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_FAILED");
    assert!(body["error"]["details"].as_str().unwrap().contains("ram_mb"));
}

#[tokio::test]
async fn resource_limit_is_422() {
    let mut settings = test_settings();
    settings.limits.max_cpu_cores = 1;
    let (app, _) = app_with(settings);

    let (status, body) = send(&app, post_json("/api/v1/vms", vm_body("too-big"))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["code"], "RESOURCE_EXCEEDED");
    assert_eq!(body["error"]["context"]["requested"], 2);
    assert_eq!(body["error"]["context"]["limit"], 1);
}

#[tokio::test]
async fn bad_and_unknown_ids() {
    let (app, _) = app();
    let (status, body) = send(&app, get("/api/v1/vms/not-a-uuid")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "INVALID_INPUT");

    let ghost = uuid::Uuid::new_v4();
    let (status, body) = send(&app, get(&format!("/api/v1/vms/{}", ghost))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn lookup_by_name() {
    let (app, _) = app();
    let id = create(&app, "named-one").await;
    let (status, body) = send(&app, get("/api/v1/vms/by-name/named-one")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["id"], id.as_str());
}

#[tokio::test]
async fn start_while_pending_is_409_with_context() {
    let (app, _) = app();
    let id = create(&app, "not-yet").await;

    let (status, body) = send(&app, post_empty(&format!("/api/v1/vms/{}/start", id))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "INVALID_VM_STATE");
    assert_eq!(body["error"]["context"]["current_status"], "pending");
    assert_eq!(body["error"]["context"]["required_status"], "stopped");
}

#[tokio::test(start_paused = true)]
async fn lifecycle_over_http() {
    let (app, _) = app();
    let id = create(&app, "http-vm").await;
    tokio::time::sleep(PROVISION_DELAY + Duration::from_millis(10)).await;

    let (status, body) = send(&app, post_empty(&format!("/api/v1/vms/{}/start", id))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["message"], "VM start operation initiated");
    assert_eq!(body["vm_id"], id.as_str());

    tokio::time::sleep(STARTUP_DELAY + Duration::from_millis(10)).await;
    let (_, body) = send(&app, get(&format!("/api/v1/vms/{}", id))).await;
    assert_eq!(body["data"]["status"], "running");

    let (status, body) = send(&app, get(&format!("/api/v1/vms/{}/stats", id))).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"]["last_stats_update"].is_string());

    // Running VMs cannot be edited or deleted.
    let (status, _) = send(
        &app,
        put_json(&format!("/api/v1/vms/{}", id), json!({ "cpu_cores": 4 })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = send(
        &app,
        post_json(&format!("/api/v1/vms/{}/stop", id), json!({ "force": true })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["message"], "VM stop operation initiated");

    let (_, body) = send(&app, get(&format!("/api/v1/vms/{}", id))).await;
    assert_eq!(body["data"]["status"], "stopped");

    let (status, body) = send(
        &app,
        put_json(&format!("/api/v1/vms/{}", id), json!({ "cpu_cores": 4 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["spec"]["cpu_cores"], 4);

    let delete = Request::builder()
        .method(Method::DELETE)
        .uri(format!("/api/v1/vms/{}", id))
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, delete).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "VM deleted successfully");

    let (status, _) = send(&app, get(&format!("/api/v1/vms/{}", id))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn list_and_summary() {
    let (app, service) = app();
    service.seed_sample_vms().await.unwrap();

    let (status, body) = send(&app, get("/api/v1/vms?status=running&limit=2&sort_by=name&sort_order=asc")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["pagination"]["total"], 3);
    assert_eq!(body["data"]["pagination"]["total_pages"], 2);
    assert_eq!(body["data"]["vms"].as_array().unwrap().len(), 2);

    let (status, body) = send(&app, get("/api/v1/vms?status=exploded")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_FAILED");

    let (status, body) = send(&app, get("/api/v1/stats/summary")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["vms"]["total"], 6);
    assert_eq!(body["data"]["vms"]["running"], 3);
    assert!(body["request_id"].is_string());
}

#[tokio::test]
async fn api_key_required_when_enabled() {
    let mut settings = test_settings();
    settings.auth.enabled = true;
    settings.auth.api_keys = vec!["s3cret".into()];
    let (app, _) = app_with(settings);

    let (status, body) = send(&app, get("/api/v1/vms")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "UNAUTHORIZED");

    let wrong = Request::builder()
        .uri("/api/v1/vms")
        .header("X-API-Key", "nope")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, wrong).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "INVALID_TOKEN");

    let create = Request::builder()
        .method(Method::POST)
        .uri("/api/v1/vms")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::AUTHORIZATION, "Bearer s3cret")
        .body(Body::from(vm_body("authed").to_string()))
        .unwrap();
    let (status, body) = send(&app, create).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["created_by"], "api-user");

    // Probes stay open.
    let (status, _) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn rate_limit_kicks_in() {
    let mut settings = test_settings();
    settings.rate_limit.enabled = true;
    settings.rate_limit.requests_per_second = 1;
    settings.rate_limit.burst = 2;
    let (app, _) = app_with(settings);

    assert_eq!(send(&app, get("/live")).await.0, StatusCode::OK);
    assert_eq!(send(&app, get("/live")).await.0, StatusCode::OK);
    let (status, body) = send(&app, get("/live")).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"]["code"], "RATE_LIMIT_EXCEEDED");
    assert_eq!(body["retry_after"], "60");
}

#[tokio::test]
async fn unknown_route_is_json_404() {
    let (app, _) = app();
    let (status, body) = send(&app, get("/api/v1/nope")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn metrics_endpoint_exposes_counters() {
    let (app, service) = app();
    service.seed_sample_vms().await.unwrap();
    send(&app, get("/health")).await;
    create(&app, "metered").await;

    let response = app.clone().oneshot(get("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let text = String::from_utf8(
        to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec(),
    )
    .unwrap();
    assert!(text.contains("vm_manager_http_requests_total"));
    assert!(text.contains(r#"vm_manager_vm_operations_total{operation="create",outcome="success"} 1"#));
    assert!(text.contains(r#"vm_manager_vms{status="total"} 7"#));
}
