//! HTTP surface tests: routing, status codes, error mapping, and the
//! bearer-token gate with its loopback bypass.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::connect_info::ConnectInfo;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use nexus_server::api::{self, health::HealthCache, AppState};
use nexus_server::gpu::GpuProbe;
use serde_json::{json, Value};
use tower::ServiceExt;

use common::{source_tarball, test_config, test_pool};

const TEST_TOKEN: &str = "test-token-123";

const LOOPBACK: ([u8; 4], u16) = ([127, 0, 0, 1], 40000);
const REMOTE: ([u8; 4], u16) = ([203, 0, 113, 9], 40000);

async fn test_app(home: &std::path::Path) -> Router {
    let pool = test_pool(home).await;
    let config = test_config(home, 2);
    let state = AppState {
        pool,
        config: Arc::new(config),
        probe: Arc::new(GpuProbe::new(Some(2))),
        token: Arc::new(TEST_TOKEN.to_string()),
        health_cache: Arc::new(HealthCache::default()),
    };
    api::create_router(state)
}

fn request(method: &str, uri: &str, peer: ([u8; 4], u16), body: Body) -> Request<Body> {
    let mut request = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(body)
        .unwrap();
    request
        .extensions_mut()
        .insert(ConnectInfo(SocketAddr::from(peer)));
    request
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_loopback_bypasses_auth() {
    let home = tempfile::tempdir().unwrap();
    let app = test_app(home.path()).await;

    let response = app
        .oneshot(request("GET", "/v1/server/status", LOOPBACK, Body::empty()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let status = json_body(response).await;
    assert_eq!(status["gpu_count"], 2);
    assert_eq!(status["node_name"], "test-node");
}

#[tokio::test]
async fn test_remote_requests_require_bearer_token() {
    let home = tempfile::tempdir().unwrap();
    let app = test_app(home.path()).await;

    let response = app
        .clone()
        .oneshot(request("GET", "/v1/jobs", REMOTE, Body::empty()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let mut bad = request("GET", "/v1/jobs", REMOTE, Body::empty());
    bad.headers_mut().insert(
        header::AUTHORIZATION,
        "Bearer wrong-token".parse().unwrap(),
    );
    let response = app.clone().oneshot(bad).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let mut good = request("GET", "/v1/jobs", REMOTE, Body::empty());
    good.headers_mut().insert(
        header::AUTHORIZATION,
        format!("Bearer {TEST_TOKEN}").parse().unwrap(),
    );
    let response = app.oneshot(good).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_job_lifecycle_over_http() {
    let home = tempfile::tempdir().unwrap();
    let app = test_app(home.path()).await;

    // Upload the artifact the job will reference.
    let response = app
        .clone()
        .oneshot(request(
            "POST",
            "/v1/artifacts",
            LOOPBACK,
            Body::from(source_tarball()),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let artifact = json_body(response).await;
    let artifact_id = artifact["artifact_id"].as_str().unwrap().to_string();

    // Submit.
    let body = json!({
        "command": "echo hi",
        "user": "u",
        "artifact_id": artifact_id,
        "git_repo_url": "",
        "git_tag": "",
        "git_branch": "",
    });
    let response = app
        .clone()
        .oneshot(request(
            "POST",
            "/v1/jobs",
            LOOPBACK,
            Body::from(body.to_string()),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let job = json_body(response).await;
    let id = job["id"].as_str().unwrap().to_string();
    assert_eq!(job["status"], "queued");
    assert_eq!(job["num_gpus"], 1);

    // Visible in the queued listing.
    let response = app
        .clone()
        .oneshot(request(
            "GET",
            "/v1/jobs?status=queued",
            LOOPBACK,
            Body::empty(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let listed = json_body(response).await;
    assert!(listed
        .as_array()
        .unwrap()
        .iter()
        .any(|j| j["id"] == id.as_str()));

    // Queued jobs can be edited.
    let response = app
        .clone()
        .oneshot(request(
            "PATCH",
            &format!("/v1/jobs/{id}"),
            LOOPBACK,
            Body::from(json!({"priority": 7}).to_string()),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["priority"], 7);

    // Killing a queued job is a state conflict.
    let response = app
        .clone()
        .oneshot(request(
            "POST",
            &format!("/v1/jobs/{id}/kill"),
            LOOPBACK,
            Body::empty(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    // Logs exist (empty) even before start.
    let response = app
        .clone()
        .oneshot(request(
            "GET",
            &format!("/v1/jobs/{id}/logs"),
            LOOPBACK,
            Body::empty(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["logs"], "");

    // Delete, then it is gone.
    let response = app
        .clone()
        .oneshot(request(
            "DELETE",
            &format!("/v1/jobs/{id}"),
            LOOPBACK,
            Body::empty(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .oneshot(request(
            "GET",
            &format!("/v1/jobs/{id}"),
            LOOPBACK,
            Body::empty(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_invalid_job_request_is_rejected() {
    let home = tempfile::tempdir().unwrap();
    let app = test_app(home.path()).await;

    let body = json!({
        "command": "  ",
        "user": "u",
        "artifact_id": "a",
        "git_repo_url": "",
        "git_tag": "",
        "git_branch": "",
    });
    let response = app
        .oneshot(request(
            "POST",
            "/v1/jobs",
            LOOPBACK,
            Body::from(body.to_string()),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(json_body(response).await["error"]
        .as_str()
        .unwrap()
        .contains("command"));
}

#[tokio::test]
async fn test_gpu_listing_and_blacklist_endpoints() {
    let home = tempfile::tempdir().unwrap();
    let app = test_app(home.path()).await;

    let response = app
        .clone()
        .oneshot(request("GET", "/v1/gpus", LOOPBACK, Body::empty()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let gpus = json_body(response).await;
    assert_eq!(gpus.as_array().unwrap().len(), 2);
    assert_eq!(gpus[0]["is_blacklisted"], false);

    let response = app
        .clone()
        .oneshot(request(
            "PUT",
            "/v1/gpus/0/blacklist",
            LOOPBACK,
            Body::empty(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let status = json_body(response).await;
    assert_eq!(status["blacklisted"], true);
    assert_eq!(status["changed"], true);

    // Second PUT is a no-op.
    let response = app
        .clone()
        .oneshot(request(
            "PUT",
            "/v1/gpus/0/blacklist",
            LOOPBACK,
            Body::empty(),
        ))
        .await
        .unwrap();
    assert_eq!(json_body(response).await["changed"], false);

    let response = app
        .clone()
        .oneshot(request("GET", "/v1/gpus", LOOPBACK, Body::empty()))
        .await
        .unwrap();
    let gpus = json_body(response).await;
    assert_eq!(gpus[0]["is_blacklisted"], true);

    let response = app
        .oneshot(request(
            "DELETE",
            "/v1/gpus/0/blacklist",
            LOOPBACK,
            Body::empty(),
        ))
        .await
        .unwrap();
    let status = json_body(response).await;
    assert_eq!(status["blacklisted"], false);
    assert_eq!(status["changed"], true);
}

#[tokio::test]
async fn test_health_endpoint_detail_levels() {
    let home = tempfile::tempdir().unwrap();
    let app = test_app(home.path()).await;

    let response = app
        .clone()
        .oneshot(request("GET", "/v1/health", LOOPBACK, Body::empty()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let health = json_body(response).await;
    assert!(health["status"].is_string());
    assert!(health["score"].is_number());
    assert!(health.get("disk").is_none());

    let response = app
        .oneshot(request(
            "GET",
            "/v1/health?detailed=true",
            LOOPBACK,
            Body::empty(),
        ))
        .await
        .unwrap();
    let health = json_body(response).await;
    assert!(health["disk"]["total"].is_number());
    assert!(health["system"]["cpu_percent"].is_number());
}
