//! System endpoints: ping, version, info.

use crate::api::AppState;
use crate::error::{ApiError, Result};
use crate::types::{SystemInfoResponse, VersionComponent, VersionResponse};
use axum::Json;
use axum::extract::State;
use axum::http::{HeaderName, HeaderValue, Uri, header};
use axum::response::{IntoResponse, Response};
use podgate_core::engine::SystemInfo;

/// `GET|HEAD /_ping`.
pub async fn ping() -> Response {
    (
        [
            (
                HeaderName::from_static("api-version"),
                HeaderValue::from_static(crate::API_VERSION),
            ),
            (
                HeaderName::from_static("libpod-api-version"),
                HeaderValue::from_static(crate::LIBPOD_API_VERSION),
            ),
            (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
            (header::PRAGMA, HeaderValue::from_static("no-cache")),
        ],
        "OK",
    )
        .into_response()
}

/// `GET /version`.
pub async fn version(State(state): State<AppState>) -> Result<Json<VersionResponse>> {
    let engine = state.engine().version().await?;
    Ok(Json(VersionResponse {
        components: vec![VersionComponent {
            name: "Podgate Engine".to_string(),
            version: engine.version.clone(),
        }],
        version: engine.version,
        api_version: crate::API_VERSION.to_string(),
        min_api_version: crate::MIN_API_VERSION.to_string(),
        git_commit: engine.git_commit,
        os: engine.os,
        arch: engine.arch,
        kernel_version: engine.kernel_version,
    }))
}

/// `GET /info`.
pub async fn info(State(state): State<AppState>) -> Result<Json<SystemInfoResponse>> {
    let info = state.engine().info().await?;
    let version = state.engine().version().await?;
    Ok(Json(SystemInfoResponse {
        id: info.hostname.clone(),
        name: info.hostname,
        containers: info.containers,
        containers_running: info.containers_running,
        containers_paused: info.containers_paused,
        containers_stopped: info.containers_stopped,
        images: info.images,
        server_version: version.version,
        operating_system: info.os.clone(),
        os_type: info.os,
        architecture: info.arch,
        ncpu: info.cpus,
        mem_total: info.mem_total,
        kernel_version: info.kernel_version,
    }))
}

/// `GET /libpod/info`.
pub async fn libpod_info(State(state): State<AppState>) -> Result<Json<SystemInfo>> {
    Ok(Json(state.engine().info().await?))
}

/// Fallback for unknown endpoints.
pub async fn not_found(uri: Uri) -> ApiError {
    ApiError::NotFound(format!("no such endpoint: {}", uri.path()))
}
