//! Pod endpoints.

use crate::api::AppState;
use crate::error::Result;
use crate::extract::ApiJson;
use crate::types::IdResponse;
use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use podgate_core::engine::{PodSpec, PodSummary};

/// `GET /libpod/pods/json`.
pub async fn list_pods(State(state): State<AppState>) -> Result<Json<Vec<PodSummary>>> {
    Ok(Json(state.engine().list_pods().await?))
}

/// `POST /libpod/pods/create`.
pub async fn create_pod(
    State(state): State<AppState>,
    ApiJson(spec): ApiJson<PodSpec>,
) -> Result<(StatusCode, Json<IdResponse>)> {
    let id = state.engine().create_pod(spec).await?;
    Ok((StatusCode::CREATED, Json(IdResponse { id })))
}
