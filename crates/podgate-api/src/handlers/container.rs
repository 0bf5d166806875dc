//! Container endpoints.

use super::{rfc3339, rfc3339_or_zero};
use crate::api::AppState;
use crate::dispatch::RequestForm;
use crate::error::{ApiError, Result};
use crate::extract::{ApiJson, ApiQuery, flexible_bool, flexible_opt_bool};
use crate::idle::IdleTimer;
use crate::stream::{DisconnectPolicy, Operation, StreamProtocol, chunk_text, ndjson_response};
use crate::types::{
    ContainerConfigResponse, ContainerCreateRequest, ContainerCreateResponse,
    ContainerInspectResponse, ContainerStateResponse, ContainerSummary, CpuStats, CpuUsage,
    DockerStats, MemoryStats, NetworkStats, PidsStats, RmReport, StatsReport,
};
use axum::Json;
use axum::extract::{Extension, Path, State};
use axum::http::StatusCode;
use axum::response::Response;
use chrono::{DateTime, Utc};
use podgate_core::ChannelWriter;
use podgate_core::engine::{ContainerDetails, ContainerSpec, ContainerState, ContainerStats};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Interval between Docker stats samples.
const DOCKER_STATS_INTERVAL: Duration = Duration::from_secs(1);

/// Default stop timeout, in seconds.
const DEFAULT_STOP_TIMEOUT: u64 = 10;

// ============================================================================
// Listing and inspection
// ============================================================================

/// List containers query parameters.
#[derive(Debug, Deserialize)]
pub struct ListContainersQuery {
    /// Include stopped containers.
    #[serde(default, deserialize_with = "flexible_bool")]
    pub all: bool,
    /// Return at most this many containers.
    pub limit: Option<usize>,
}

/// `GET /containers/json`.
pub async fn list_containers(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<ListContainersQuery>,
) -> Result<Json<Vec<ContainerSummary>>> {
    let mut containers = state.engine().list_containers(query.all).await?;
    truncate(&mut containers, query.limit);

    let summaries = containers
        .into_iter()
        .map(|c| ContainerSummary {
            names: c.names.iter().map(|n| format!("/{n}")).collect(),
            command: c.command.join(" "),
            created: c.created.timestamp(),
            state: c.state.to_string(),
            status: format_status(c.state, None),
            id: c.id,
            image: c.image,
            image_id: c.image_id,
            labels: c.labels,
        })
        .collect();
    Ok(Json(summaries))
}

/// `GET /libpod/containers/json`.
pub async fn libpod_list_containers(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<ListContainersQuery>,
) -> Result<Json<Vec<podgate_core::engine::ContainerSummary>>> {
    let mut containers = state.engine().list_containers(query.all).await?;
    truncate(&mut containers, query.limit);
    Ok(Json(containers))
}

/// `GET /containers/{name}/json`.
pub async fn inspect_container(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ContainerInspectResponse>> {
    let c = state.engine().inspect_container(&name).await?;
    Ok(Json(docker_inspect(c)))
}

/// `GET /libpod/containers/{name}/json`.
pub async fn libpod_inspect_container(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ContainerDetails>> {
    Ok(Json(state.engine().inspect_container(&name).await?))
}

/// `GET /libpod/containers/{name}/exists`.
pub async fn container_exists(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode> {
    state.engine().inspect_container(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn docker_inspect(c: ContainerDetails) -> ContainerInspectResponse {
    ContainerInspectResponse {
        state: ContainerStateResponse {
            status: c.state.to_string(),
            running: c.state == ContainerState::Running,
            paused: c.state == ContainerState::Paused,
            exit_code: c.exit_code.unwrap_or(0),
            started_at: rfc3339_or_zero(c.started_at),
            finished_at: rfc3339_or_zero(c.finished_at),
        },
        config: ContainerConfigResponse {
            image: c.image.clone(),
            cmd: c.command,
            env: c.env,
            labels: c.labels,
        },
        id: c.id,
        name: format!("/{}", c.name),
        created: rfc3339(c.created),
        image: c.image_id,
    }
}

fn format_status(state: ContainerState, exit_code: Option<i32>) -> String {
    match state {
        ContainerState::Created => "Created".to_string(),
        ContainerState::Running => "Up".to_string(),
        ContainerState::Paused => "Up (Paused)".to_string(),
        ContainerState::Stopped | ContainerState::Exited => {
            exit_code.map_or_else(|| "Exited".to_string(), |code| format!("Exited ({code})"))
        }
    }
}

fn truncate<T>(items: &mut Vec<T>, limit: Option<usize>) {
    if let Some(limit) = limit.filter(|l| *l > 0) {
        items.truncate(limit);
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Create container query parameters.
#[derive(Debug, Deserialize)]
pub struct CreateContainerQuery {
    /// Container name.
    pub name: Option<String>,
}

/// `POST /containers/create`.
pub async fn create_container(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<CreateContainerQuery>,
    ApiJson(body): ApiJson<ContainerCreateRequest>,
) -> Result<(StatusCode, Json<ContainerCreateResponse>)> {
    if body.image.is_empty() {
        return Err(ApiError::BadRequest("no image specified".to_string()));
    }
    let id = state
        .engine()
        .create_container(ContainerSpec {
            name: query.name.filter(|n| !n.is_empty()),
            image: body.image,
            command: body.cmd.unwrap_or_default(),
            env: body.env.unwrap_or_default(),
            labels: body.labels.unwrap_or_default(),
            pod: None,
        })
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(ContainerCreateResponse {
            id,
            warnings: Vec::new(),
        }),
    ))
}

/// libpod container create body.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SpecGenerator {
    pub name: Option<String>,
    pub image: String,
    pub command: Vec<String>,
    pub env: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    pub pod: Option<String>,
}

/// `POST /libpod/containers/create`.
pub async fn libpod_create_container(
    State(state): State<AppState>,
    ApiJson(spec): ApiJson<SpecGenerator>,
) -> Result<(StatusCode, Json<ContainerCreateResponse>)> {
    if spec.image.is_empty() {
        return Err(ApiError::BadRequest("no image specified".to_string()));
    }
    let mut env: Vec<String> = spec.env.into_iter().map(|(k, v)| format!("{k}={v}")).collect();
    env.sort();

    let id = state
        .engine()
        .create_container(ContainerSpec {
            name: spec.name,
            image: spec.image,
            command: spec.command,
            env,
            labels: spec.labels,
            pod: spec.pod,
        })
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(ContainerCreateResponse {
            id,
            warnings: Vec::new(),
        }),
    ))
}

/// `POST /containers/{name}/start`.
pub async fn start_container(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode> {
    state.engine().start_container(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Stop container query parameters.
#[derive(Debug, Deserialize)]
pub struct StopContainerQuery {
    /// Seconds to wait before killing.
    pub t: Option<u64>,
    /// libpod spelling of `t`.
    pub timeout: Option<u64>,
}

/// `POST /containers/{name}/stop`.
pub async fn stop_container(
    State(state): State<AppState>,
    Path(name): Path<String>,
    ApiQuery(query): ApiQuery<StopContainerQuery>,
) -> Result<StatusCode> {
    let seconds = query.t.or(query.timeout).unwrap_or(DEFAULT_STOP_TIMEOUT);
    state
        .engine()
        .stop_container(&name, Duration::from_secs(seconds))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Remove container query parameters.
#[derive(Debug, Deserialize)]
pub struct RemoveContainerQuery {
    /// Remove even if running.
    #[serde(default, deserialize_with = "flexible_bool")]
    pub force: bool,
}

/// `DELETE /containers/{name}`.
pub async fn remove_container(
    State(state): State<AppState>,
    Path(name): Path<String>,
    ApiQuery(query): ApiQuery<RemoveContainerQuery>,
) -> Result<StatusCode> {
    state.engine().remove_container(&name, query.force).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `DELETE /libpod/containers/{name}`.
pub async fn libpod_remove_container(
    State(state): State<AppState>,
    Path(name): Path<String>,
    ApiQuery(query): ApiQuery<RemoveContainerQuery>,
) -> Result<Json<Vec<RmReport>>> {
    let id = state.engine().inspect_container(&name).await?.id;
    state.engine().remove_container(&name, query.force).await?;
    Ok(Json(vec![RmReport { id, err: None }]))
}

// ============================================================================
// Stats
// ============================================================================

/// libpod stats query parameters. `containers` may repeat and is read from
/// the request form.
#[derive(Debug, Deserialize)]
pub struct LibpodStatsQuery {
    /// Keep sampling until the client disconnects.
    #[serde(default, deserialize_with = "flexible_opt_bool")]
    pub stream: Option<bool>,
    /// Seconds between samples.
    pub interval: Option<i64>,
}

/// `GET /libpod/containers/stats`.
///
/// Streams `{"Error":null,"Stats":[...]}` lines. A disconnect stops the
/// sampling loop.
pub async fn libpod_stats(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<LibpodStatsQuery>,
    form: RequestForm,
    idle: Option<Extension<IdleTimer>>,
) -> Result<Response> {
    let interval = query.interval.unwrap_or(5);
    if interval < 1 {
        return Err(ApiError::BadRequest(format!(
            "interval must be greater than 0, got {interval}"
        )));
    }
    let interval = Duration::from_secs(interval.unsigned_abs());
    let stream = query.stream.unwrap_or(true);
    let names: Vec<String> = form
        .get_all("containers")
        .into_iter()
        .map(str::to_string)
        .collect();

    // Unknown containers are a 404, not an in-band error.
    state.engine().container_stats(&names).await?;

    let engine = Arc::clone(state.engine());
    let (progress, progress_rx) = ChannelWriter::new(state.stream_buffer());
    let (errors, errors_rx) = ChannelWriter::new(state.stream_buffer());
    let operation = Operation::spawn(DisconnectPolicy::Cancel, move |cancel| async move {
        loop {
            match engine.container_stats(&names).await {
                Ok(stats) => match serde_json::to_vec(&stats) {
                    Ok(line) => {
                        if progress.write(&line).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = errors.write_str(&e.to_string()).await;
                        break;
                    }
                },
                Err(e) => {
                    let _ = errors.write_str(&e.to_string()).await;
                    break;
                }
            }
            if !stream {
                break;
            }
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(interval) => {}
            }
        }
    });

    Ok(ndjson_response(
        LibpodStats,
        progress_rx,
        Some(errors_rx),
        operation,
        idle.map(|Extension(idle)| idle),
    ))
}

struct LibpodStats;

impl StreamProtocol for LibpodStats {
    type Event = StatsReport;
    type Outcome = ();

    fn on_progress(&mut self, chunk: &[u8]) -> Option<StatsReport> {
        match serde_json::from_slice::<Vec<ContainerStats>>(chunk) {
            Ok(stats) => Some(StatsReport {
                error: None,
                stats: Some(stats),
            }),
            Err(e) => Some(StatsReport {
                error: Some(format!("decode stats sample: {e}")),
                stats: None,
            }),
        }
    }

    fn on_error(&mut self, chunk: &[u8]) -> Option<StatsReport> {
        Some(StatsReport {
            error: Some(chunk_text(chunk)),
            stats: None,
        })
    }

    fn on_complete(&mut self, (): ()) -> Vec<StatsReport> {
        Vec::new()
    }
}

/// Docker stats query parameters.
#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    /// Keep sampling until the client disconnects.
    #[serde(default, deserialize_with = "flexible_opt_bool")]
    pub stream: Option<bool>,
    /// Return a single sample without waiting for a second one.
    #[serde(rename = "one-shot", default, deserialize_with = "flexible_bool")]
    pub one_shot: bool,
}

/// `GET /containers/{name}/stats`.
///
/// Streams one Docker stats object per second. A disconnect stops the
/// sampling loop.
pub async fn container_stats(
    State(state): State<AppState>,
    Path(name): Path<String>,
    ApiQuery(query): ApiQuery<StatsQuery>,
    idle: Option<Extension<IdleTimer>>,
) -> Result<Response> {
    let names = vec![name];
    state.engine().container_stats(&names).await?;
    let stream = query.stream.unwrap_or(true) && !query.one_shot;
    let cpus = state.engine().info().await.map_or(1, |info| info.cpus);

    let engine = Arc::clone(state.engine());
    let (progress, progress_rx) = ChannelWriter::new(state.stream_buffer());
    let operation = Operation::spawn(DisconnectPolicy::Cancel, move |cancel| async move {
        let mut previous: Option<DockerStats> = None;
        loop {
            let sample = match engine.container_stats(&names).await {
                Ok(mut samples) if !samples.is_empty() => samples.swap_remove(0),
                Ok(_) => break,
                Err(e) => {
                    tracing::debug!(error = %e, "stats sampling stopped");
                    break;
                }
            };
            let stats = docker_stats(&sample, Utc::now(), previous.as_ref(), cpus);
            match serde_json::to_vec(&stats) {
                Ok(line) => {
                    if progress.write(&line).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to encode stats sample");
                    break;
                }
            }
            previous = Some(stats);
            if !stream {
                break;
            }
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(DOCKER_STATS_INTERVAL) => {}
            }
        }
    });

    Ok(ndjson_response(
        DockerStatsLines,
        progress_rx,
        None,
        operation,
        idle.map(|Extension(idle)| idle),
    ))
}

struct DockerStatsLines;

impl StreamProtocol for DockerStatsLines {
    type Event = DockerStats;
    type Outcome = ();

    fn on_progress(&mut self, chunk: &[u8]) -> Option<DockerStats> {
        serde_json::from_slice(chunk)
            .map_err(|e| tracing::warn!(error = %e, "dropping malformed stats sample"))
            .ok()
    }

    fn on_error(&mut self, _chunk: &[u8]) -> Option<DockerStats> {
        None
    }

    fn on_complete(&mut self, (): ()) -> Vec<DockerStats> {
        Vec::new()
    }
}

fn docker_stats(
    sample: &ContainerStats,
    read: DateTime<Utc>,
    previous: Option<&DockerStats>,
    cpus: usize,
) -> DockerStats {
    let (preread, precpu_stats) = previous.map_or_else(
        || (rfc3339_or_zero(None), CpuStats::default()),
        |p| (p.read.clone(), p.cpu_stats.clone()),
    );
    DockerStats {
        read: rfc3339(read),
        preread,
        id: sample.container_id.clone(),
        name: format!("/{}", sample.name),
        pids_stats: PidsStats {
            current: sample.pids,
        },
        cpu_stats: CpuStats {
            cpu_usage: CpuUsage {
                total_usage: sample.cpu_nano,
            },
            system_cpu_usage: sample.system_nano,
            online_cpus: cpus,
        },
        precpu_stats,
        memory_stats: MemoryStats {
            usage: sample.mem_usage,
            limit: sample.mem_limit,
        },
        networks: HashMap::from([(
            "eth0".to_string(),
            NetworkStats {
                rx_bytes: sample.net_input,
                tx_bytes: sample.net_output,
            },
        )]),
    }
}
