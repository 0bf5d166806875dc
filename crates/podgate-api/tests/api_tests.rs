//! Integration tests for the REST handlers.
//!
//! These drive the router directly with `oneshot`, without a socket.

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use http_body_util::BodyExt;
use podgate_api::{AppState, create_router};
use podgate_core::engine::PullOptions;
use podgate_core::{ChannelWriter, Engine, MemoryEngine};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

/// Creates an engine with `references` already pulled into the local store.
async fn engine_with(references: &[&str]) -> Arc<MemoryEngine> {
    let engine = Arc::new(MemoryEngine::with_demo_registry());
    for reference in references {
        let (progress, _rx) = ChannelWriter::new(32);
        engine
            .pull(
                &CancellationToken::new(),
                reference,
                &PullOptions::default(),
                &progress,
            )
            .await
            .expect("Failed to pull test image");
    }
    engine
}

fn app(engine: &Arc<MemoryEngine>) -> Router {
    create_router(AppState::new(engine.clone()))
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            request = request.header("content-type", "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };
    let response = app
        .clone()
        .oneshot(request.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };
    (status, json)
}

// ============================================================================
// System API Tests
// ============================================================================

#[tokio::test]
async fn test_ping() {
    let engine = engine_with(&[]).await;
    let app = app(&engine);

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/_ping").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["api-version"], podgate_api::API_VERSION);
    assert_eq!(
        response.headers()["libpod-api-version"],
        podgate_api::LIBPOD_API_VERSION
    );
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"OK");

    let response = app
        .oneshot(
            Request::builder()
                .method(Method::HEAD)
                .uri("/libpod/_ping")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_version() {
    let engine = engine_with(&[]).await;
    let (status, json) = send(&app(&engine), Method::GET, "/version", None).await;

    assert_eq!(status, StatusCode::OK);
    assert!(json.get("Version").is_some());
    assert_eq!(json["ApiVersion"], podgate_api::API_VERSION);
    assert_eq!(json["MinAPIVersion"], podgate_api::MIN_API_VERSION);
    assert!(json.get("Os").is_some());
    assert!(json.get("Arch").is_some());
}

#[tokio::test]
async fn test_versioned_prefixes() {
    let engine = engine_with(&[]).await;
    let app = app(&engine);

    for uri in ["/v1.41/version", "/v1.24/_ping", "/v4.0.0/libpod/info"] {
        let (status, _) = send(&app, Method::GET, uri, None).await;
        assert_eq!(status, StatusCode::OK, "{uri}");
    }
}

#[tokio::test]
async fn test_info() {
    let engine = engine_with(&["alpine"]).await;
    let (status, json) = send(&app(&engine), Method::GET, "/info", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["Containers"], 0);
    assert_eq!(json["Images"], 1);
    assert!(json.get("ServerVersion").is_some());
    assert!(json.get("NCPU").is_some());
}

#[tokio::test]
async fn test_unknown_endpoint_returns_error_model() {
    let engine = engine_with(&[]).await;
    let (status, json) = send(&app(&engine), Method::GET, "/no/such/thing", None).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["response"], 404);
    assert!(json["cause"].is_string());
    assert!(json["message"].as_str().unwrap().contains("/no/such/thing"));
}

// ============================================================================
// Container API Tests
// ============================================================================

#[tokio::test]
async fn test_list_containers_empty() {
    let engine = engine_with(&[]).await;
    let (status, json) = send(&app(&engine), Method::GET, "/containers/json", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json, json!([]));
}

#[tokio::test]
async fn test_container_lifecycle() {
    let engine = engine_with(&["alpine"]).await;
    let app = app(&engine);

    let (status, created) = send(
        &app,
        Method::POST,
        "/containers/create?name=web",
        Some(json!({ "Image": "alpine", "Cmd": ["sleep", "60"] })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = created["Id"].as_str().unwrap().to_string();

    let (status, _) = send(&app, Method::POST, "/containers/web/start", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, inspect) = send(&app, Method::GET, "/containers/web/json", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(inspect["Id"], id);
    assert_eq!(inspect["State"]["Running"], true);

    let (_, list) = send(&app, Method::GET, "/containers/json", None).await;
    assert_eq!(list.as_array().unwrap().len(), 1);

    let (status, _) = send(&app, Method::POST, "/containers/web/stop?t=1", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    // Stopped containers only show up with all=1.
    let (_, list) = send(&app, Method::GET, "/containers/json", None).await;
    assert_eq!(list, json!([]));
    let (_, list) = send(&app, Method::GET, "/containers/json?all=1", None).await;
    assert_eq!(list.as_array().unwrap().len(), 1);

    let (status, _) = send(&app, Method::DELETE, "/containers/web", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, error) = send(&app, Method::GET, "/containers/web/json", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error["cause"], "no such container");
}

#[tokio::test]
async fn test_create_container_validation() {
    let engine = engine_with(&[]).await;
    let app = app(&engine);

    let (status, error) = send(&app, Method::POST, "/containers/create", Some(json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error["response"], 400);

    let (status, _) = send(
        &app,
        Method::POST,
        "/containers/create",
        Some(json!({ "Image": "busybox" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_bad_query_is_rejected() {
    let engine = engine_with(&[]).await;
    let (status, error) = send(&app(&engine), Method::GET, "/containers/json?all=maybe", None).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error["response"], 400);
}

#[tokio::test]
async fn test_libpod_container_in_pod() {
    let engine = engine_with(&["alpine"]).await;
    let app = app(&engine);

    let (status, pod) = send(
        &app,
        Method::POST,
        "/libpod/pods/create",
        Some(json!({ "name": "stack", "labels": { "tier": "web" } })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(pod["Id"].is_string());

    let (status, _) = send(
        &app,
        Method::POST,
        "/libpod/containers/create",
        Some(json!({ "image": "alpine", "name": "app", "pod": "stack", "env": { "B": "2", "A": "1" } })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, _) = send(&app, Method::GET, "/libpod/containers/app/exists", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(&app, Method::GET, "/libpod/containers/nope/exists", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, pods) = send(&app, Method::GET, "/libpod/pods/json", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(pods[0]["Name"], "stack");

    let (status, report) = send(&app, Method::DELETE, "/libpod/containers/app", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(report[0]["Id"].is_string());
}

// ============================================================================
// Image API Tests
// ============================================================================

#[tokio::test]
async fn test_list_images() {
    let engine = engine_with(&["alpine", "quay.io/podman/hello"]).await;
    let app = app(&engine);

    let (status, images) = send(&app, Method::GET, "/images/json", None).await;
    assert_eq!(status, StatusCode::OK);
    let images = images.as_array().unwrap();
    assert_eq!(images.len(), 2);
    assert!(images[0]["Id"].as_str().unwrap().starts_with("sha256:"));

    let (status, images) = send(&app, Method::GET, "/libpod/images/json", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(images.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_inspect_image_with_slashes() {
    let engine = engine_with(&["quay.io/podman/hello"]).await;
    let app = app(&engine);

    let (status, image) = send(&app, Method::GET, "/images/quay.io/podman/hello/json", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(image["RepoTags"], json!(["quay.io/podman/hello:latest"]));
    assert_eq!(image["RootFS"]["Layers"].as_array().unwrap().len(), 2);

    let (status, _) = send(&app, Method::GET, "/libpod/images/quay.io/podman/hello/exists", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, error) = send(&app, Method::GET, "/images/fedora/json", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error["cause"], "no such image");
}

#[tokio::test]
async fn test_tag_and_remove_image() {
    let engine = engine_with(&["busybox"]).await;
    let app = app(&engine);

    let (status, _) = send(&app, Method::POST, "/images/busybox/tag?repo=mine/box&tag=v1", None).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, image) = send(&app, Method::GET, "/libpod/images/mine/box:v1/json", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(image["RepoTags"].as_array().unwrap().len(), 2);

    let (status, _) = send(&app, Method::POST, "/images/busybox/tag", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, report) = send(&app, Method::DELETE, "/libpod/images/busybox", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["Deleted"].as_array().unwrap().len(), 1);
    assert_eq!(report["Untagged"].as_array().unwrap().len(), 2);

    let (status, _) = send(&app, Method::DELETE, "/images/busybox", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
