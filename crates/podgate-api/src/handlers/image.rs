//! Image endpoints, including the streaming pull and push.
//!
//! Image names may contain slashes (`quay.io/podman/hello`), so routes
//! under `/images/` capture the rest of the path and split off the action
//! suffix here.

use super::rfc3339;
use crate::api::AppState;
use crate::auth;
use crate::dispatch::RequestForm;
use crate::error::{ApiError, Result};
use crate::extract::{ApiQuery, flexible_bool, flexible_opt_bool};
use crate::idle::IdleTimer;
use crate::stream::{DisconnectPolicy, Operation, StreamProtocol, chunk_text, ndjson_response};
use crate::types::{
    ImageDeleteResponse, ImageInspectResponse, ImageRemoveReport, ImageSummary, JsonMessage,
    PullReport, PushReport, PushResult, RootFs,
};
use axum::Json;
use axum::extract::{Extension, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use podgate_core::engine::{ImageDetails, PullOptions, PushOptions};
use podgate_core::{ChannelWriter, ImageReference};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

// ============================================================================
// Listing, inspection, removal, tagging
// ============================================================================

/// `GET /images/json`.
pub async fn list_images(State(state): State<AppState>) -> Result<Json<Vec<ImageSummary>>> {
    let images = state.engine().list_images().await?;
    Ok(Json(
        images
            .into_iter()
            .map(|i| ImageSummary {
                id: format!("sha256:{}", i.id),
                parent_id: String::new(),
                repo_digests: i
                    .repo_tags
                    .iter()
                    .filter_map(|t| t.rsplit_once(':').map(|(repo, _)| format!("{repo}@{}", i.digest)))
                    .collect(),
                repo_tags: i.repo_tags,
                created: i.created.timestamp(),
                size: i.size,
                labels: HashMap::new(),
                containers: -1,
            })
            .collect(),
    ))
}

/// `GET /libpod/images/json`.
pub async fn libpod_list_images(
    State(state): State<AppState>,
) -> Result<Json<Vec<podgate_core::engine::ImageSummary>>> {
    Ok(Json(state.engine().list_images().await?))
}

/// `GET /images/{name}/json`.
pub async fn get_image(State(state): State<AppState>, Path(path): Path<String>) -> Result<Response> {
    match split_action(&path, &["json"]) {
        Some((name, "json")) => {
            let image = state.engine().inspect_image(name).await?;
            Ok(Json(docker_inspect(image)).into_response())
        }
        _ => Err(no_such_endpoint(&path)),
    }
}

/// `GET /libpod/images/{name}/json` and `GET /libpod/images/{name}/exists`.
pub async fn libpod_get_image(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> Result<Response> {
    match split_action(&path, &["json", "exists"]) {
        Some((name, "json")) => Ok(Json(state.engine().inspect_image(name).await?).into_response()),
        Some((name, "exists")) => {
            state.engine().inspect_image(name).await?;
            Ok(StatusCode::NO_CONTENT.into_response())
        }
        _ => Err(no_such_endpoint(&path)),
    }
}

/// Remove image query parameters.
#[derive(Debug, Deserialize)]
pub struct RemoveImageQuery {
    /// Remove even if containers use the image.
    #[serde(default, deserialize_with = "flexible_bool")]
    pub force: bool,
}

/// `DELETE /images/{name}`.
pub async fn remove_image(
    State(state): State<AppState>,
    Path(name): Path<String>,
    ApiQuery(query): ApiQuery<RemoveImageQuery>,
) -> Result<Json<Vec<ImageDeleteResponse>>> {
    let tags = state.engine().inspect_image(&name).await?.repo_tags;
    let deleted = state.engine().remove_image(&name, query.force).await?;

    let untagged = tags.into_iter().map(|t| ImageDeleteResponse {
        untagged: Some(t),
        deleted: None,
    });
    let deleted = deleted.into_iter().map(|id| ImageDeleteResponse {
        untagged: None,
        deleted: Some(format!("sha256:{id}")),
    });
    Ok(Json(untagged.chain(deleted).collect()))
}

/// `DELETE /libpod/images/{name}`.
pub async fn libpod_remove_image(
    State(state): State<AppState>,
    Path(name): Path<String>,
    ApiQuery(query): ApiQuery<RemoveImageQuery>,
) -> Result<Json<ImageRemoveReport>> {
    let untagged = state.engine().inspect_image(&name).await?.repo_tags;
    let deleted = state.engine().remove_image(&name, query.force).await?;
    Ok(Json(ImageRemoveReport {
        deleted,
        untagged,
        ..ImageRemoveReport::default()
    }))
}

/// Tag image query parameters.
#[derive(Debug, Deserialize)]
pub struct TagQuery {
    /// Target repository.
    pub repo: Option<String>,
    /// Target tag.
    pub tag: Option<String>,
}

async fn tag_image(state: &AppState, name: &str, query: TagQuery) -> Result<StatusCode> {
    let repo = query
        .repo
        .filter(|r| !r.is_empty())
        .ok_or_else(|| ApiError::BadRequest("missing 'repo' parameter".to_string()))?;
    let tag = query.tag.filter(|t| !t.is_empty());
    let tag = tag.as_deref().unwrap_or(podgate_core::reference::DEFAULT_TAG);
    state.engine().tag_image(name, &repo, tag).await?;
    Ok(StatusCode::CREATED)
}

fn docker_inspect(image: ImageDetails) -> ImageInspectResponse {
    ImageInspectResponse {
        id: format!("sha256:{}", image.id),
        repo_digests: image
            .repo_tags
            .iter()
            .filter_map(|t| t.rsplit_once(':').map(|(repo, _)| format!("{repo}@{}", image.digest)))
            .collect(),
        repo_tags: image.repo_tags,
        created: rfc3339(image.created),
        size: image.size,
        architecture: image.architecture,
        os: image.os,
        root_fs: RootFs {
            kind: "layers".to_string(),
            layers: image.layers,
        },
    }
}

/// Splits `name/action` when `action` is one of `actions`.
fn split_action<'a>(path: &'a str, actions: &[&'static str]) -> Option<(&'a str, &'static str)> {
    let (name, action) = path.rsplit_once('/')?;
    if name.is_empty() {
        return None;
    }
    actions.iter().copied().find(|a| *a == action).map(|a| (name, a))
}

fn no_such_endpoint(path: &str) -> ApiError {
    ApiError::NotFound(format!("no such endpoint: /images/{path}"))
}

// ============================================================================
// POST dispatch
// ============================================================================

/// `POST /images/{name}/push` and `POST /images/{name}/tag`.
pub async fn post_image(
    State(state): State<AppState>,
    Path(path): Path<String>,
    headers: HeaderMap,
    form: RequestForm,
    idle: Option<Extension<IdleTimer>>,
) -> Result<Response> {
    match split_action(&path, &["push", "tag"]) {
        Some((name, "push")) => {
            let query: CompatPushQuery = decode_form(&form)?;
            compat_push(&state, name, query, &headers, &form, idle).await
        }
        Some((name, "tag")) => Ok(tag_image(&state, name, decode_form(&form)?)
            .await?
            .into_response()),
        _ => Err(no_such_endpoint(&path)),
    }
}

/// `POST /libpod/images/{name}/push` and `POST /libpod/images/{name}/tag`.
pub async fn libpod_post_image(
    State(state): State<AppState>,
    Path(path): Path<String>,
    headers: HeaderMap,
    form: RequestForm,
    idle: Option<Extension<IdleTimer>>,
) -> Result<Response> {
    match split_action(&path, &["push", "tag"]) {
        Some((name, "push")) => {
            let query: LibpodPushQuery = decode_form(&form)?;
            libpod_push(&state, name, query, &headers, &form, idle).await
        }
        Some((name, "tag")) => Ok(tag_image(&state, name, decode_form(&form)?)
            .await?
            .into_response()),
        _ => Err(no_such_endpoint(&path)),
    }
}

/// Decodes typed parameters from the already-parsed form, ignoring keys the
/// type does not know and keeping the first of repeated ones.
fn decode_form<T: serde::de::DeserializeOwned>(form: &RequestForm) -> Result<T> {
    let mut seen = std::collections::HashSet::new();
    let pairs: Vec<&(String, String)> = form.0.iter().filter(|(k, _)| seen.insert(k.as_str())).collect();
    let encoded = serde_urlencoded::to_string(pairs)
        .map_err(|e| ApiError::BadRequest(format!("failed to parse query parameters: {e}")))?;
    serde_urlencoded::from_str(&encoded)
        .map_err(|e| ApiError::BadRequest(format!("failed to parse query parameters: {e}")))
}

// ============================================================================
// Pull
// ============================================================================

/// libpod pull query parameters.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LibpodPullQuery {
    /// Image to pull.
    pub reference: Option<String>,
    /// Pull every tag of the repository.
    #[serde(default, deserialize_with = "flexible_bool")]
    pub all_tags: bool,
    /// Suppress progress lines.
    #[serde(default, deserialize_with = "flexible_bool")]
    pub quiet: bool,
    /// Verify registry TLS certificates.
    #[serde(default, deserialize_with = "flexible_opt_bool")]
    pub tls_verify: Option<bool>,
    pub os: Option<String>,
    pub arch: Option<String>,
    pub variant: Option<String>,
}

/// What a libpod pull produced.
#[derive(Debug, Default)]
pub struct PullOutcome {
    /// Ids of the pulled images, in pull order.
    pub images: Vec<String>,
    /// Error that ended the pull.
    pub fatal: Option<String>,
}

/// `POST /libpod/images/pull`.
///
/// Streams `{"stream"}` progress and `{"error"}` per-tag failures, then
/// either `{"images":[...]}` followed by `{"id":...}` or a final
/// `{"error"}`. The pull keeps running if the client disconnects.
pub async fn libpod_pull(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<LibpodPullQuery>,
    headers: HeaderMap,
    form: RequestForm,
    idle: Option<Extension<IdleTimer>>,
) -> Result<Response> {
    let reference = query
        .reference
        .filter(|r| !r.is_empty())
        .ok_or_else(|| ApiError::BadRequest("reference parameter cannot be empty".to_string()))?;
    let parsed = ImageReference::parse(&reference)?;
    let credentials = auth::credentials(&headers, &form)?;

    let mut options = PullOptions {
        tls_verify: query.tls_verify,
        platform: platform(query.os.as_deref(), query.arch.as_deref(), query.variant.as_deref()),
        ..PullOptions::default()
    };
    credentials.apply_pull(&mut options);

    let engine = Arc::clone(state.engine());
    let all_tags = query.all_tags;
    let (progress, progress_rx) = ChannelWriter::new(state.stream_buffer());
    let (errors, errors_rx) = ChannelWriter::new(state.stream_buffer());
    let operation = Operation::spawn(DisconnectPolicy::Detach, move |cancel| async move {
        // Keeps a temporary auth file alive until the pull is done.
        let _credentials = credentials;
        let mut outcome = PullOutcome::default();

        let references = if all_tags {
            let repository = parsed.repository();
            match engine.list_tags(&repository, &options).await {
                Ok(tags) => tags.iter().map(|tag| parsed.with_tag(tag).to_string()).collect(),
                Err(e) => {
                    outcome.fatal = Some(e.to_string());
                    return outcome;
                }
            }
        } else {
            vec![parsed.to_string()]
        };

        for reference in &references {
            if cancel.is_cancelled() {
                outcome.fatal = Some("pull cancelled".to_string());
                break;
            }
            match engine.pull(&cancel, reference, &options, &progress).await {
                Ok(id) => outcome.images.push(id),
                Err(e) if all_tags => {
                    tracing::debug!(reference = %reference, error = %e, "tag pull failed");
                    let _ = errors.write_str(&format!("{reference}: {e}\n")).await;
                }
                Err(e) => {
                    outcome.fatal = Some(e.to_string());
                    break;
                }
            }
        }

        if all_tags && outcome.images.is_empty() && outcome.fatal.is_none() {
            outcome.fatal = Some(format!("no tags of {} could be pulled", parsed.repository()));
        }
        outcome
    });

    Ok(ndjson_response(
        LibpodPull { quiet: query.quiet },
        progress_rx,
        Some(errors_rx),
        operation,
        idle.map(|Extension(idle)| idle),
    ))
}

/// Wire format of `POST /libpod/images/pull`.
#[derive(Debug)]
pub struct LibpodPull {
    /// Drop progress lines.
    pub quiet: bool,
}

impl StreamProtocol for LibpodPull {
    type Event = PullReport;
    type Outcome = PullOutcome;

    fn on_progress(&mut self, chunk: &[u8]) -> Option<PullReport> {
        (!self.quiet).then(|| PullReport {
            stream: Some(String::from_utf8_lossy(chunk).into_owned()),
            ..PullReport::default()
        })
    }

    fn on_error(&mut self, chunk: &[u8]) -> Option<PullReport> {
        Some(PullReport {
            error: Some(chunk_text(chunk)),
            ..PullReport::default()
        })
    }

    fn on_complete(&mut self, outcome: PullOutcome) -> Vec<PullReport> {
        if let Some(error) = outcome.fatal {
            return vec![PullReport {
                error: Some(error),
                ..PullReport::default()
            }];
        }
        let first = outcome.images.first().cloned();
        vec![
            PullReport {
                images: Some(outcome.images),
                ..PullReport::default()
            },
            PullReport {
                id: first,
                ..PullReport::default()
            },
        ]
    }
}

/// Docker pull query parameters.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompatPullQuery {
    /// Image to pull.
    pub from_image: Option<String>,
    /// Tag; overrides a tag in `fromImage`.
    pub tag: Option<String>,
    /// `os/arch[/variant]`.
    pub platform: Option<String>,
}

/// `POST /images/create?fromImage=...`.
///
/// Streams Docker `{"status"}` messages; failures are reported in-band as
/// `{"error","errorDetail"}`. The pull keeps running if the client
/// disconnects.
pub async fn pull_image(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<CompatPullQuery>,
    headers: HeaderMap,
    form: RequestForm,
    idle: Option<Extension<IdleTimer>>,
) -> Result<Response> {
    let from_image = query
        .from_image
        .filter(|i| !i.is_empty())
        .ok_or_else(|| ApiError::BadRequest("fromImage parameter is required".to_string()))?;
    let mut parsed = ImageReference::parse(&from_image)?;
    if let Some(tag) = query.tag.filter(|t| !t.is_empty()) {
        parsed = ImageReference::parse(&format!("{}:{tag}", parsed.repository()))?;
    }
    let credentials = auth::credentials(&headers, &form)?;

    let mut options = PullOptions {
        platform: query.platform.filter(|p| !p.is_empty()),
        ..PullOptions::default()
    };
    credentials.apply_pull(&mut options);

    let engine = Arc::clone(state.engine());
    let reference = parsed.to_string();
    let (progress, progress_rx) = ChannelWriter::new(state.stream_buffer());
    let operation = Operation::spawn(DisconnectPolicy::Detach, move |cancel| async move {
        let _credentials = credentials;
        engine
            .pull(&cancel, &reference, &options, &progress)
            .await
            .map(|id| (id, reference))
            .map_err(|e| e.to_string())
    });

    Ok(ndjson_response(
        CompatPull,
        progress_rx,
        None,
        operation,
        idle.map(|Extension(idle)| idle),
    ))
}

/// Wire format of `POST /images/create`.
#[derive(Debug)]
pub struct CompatPull;

impl StreamProtocol for CompatPull {
    type Event = JsonMessage;
    /// Image id and the reference it was stored under.
    type Outcome = std::result::Result<(String, String), String>;

    fn on_progress(&mut self, chunk: &[u8]) -> Option<JsonMessage> {
        Some(JsonMessage::status(chunk_text(chunk)))
    }

    fn on_error(&mut self, chunk: &[u8]) -> Option<JsonMessage> {
        Some(JsonMessage::error(chunk_text(chunk)))
    }

    fn on_complete(&mut self, outcome: Self::Outcome) -> Vec<JsonMessage> {
        match outcome {
            Ok((id, reference)) => vec![
                JsonMessage::status(format!("Digest: sha256:{id}")),
                JsonMessage::status(format!("Status: Downloaded newer image for {reference}")),
            ],
            Err(message) => vec![JsonMessage::error(message)],
        }
    }
}

fn platform(os: Option<&str>, arch: Option<&str>, variant: Option<&str>) -> Option<String> {
    let parts: Vec<&str> = [os, arch, variant]
        .into_iter()
        .map(|p| p.unwrap_or_default())
        .collect();
    if parts.iter().all(|p| p.is_empty()) {
        return None;
    }
    let os = if parts[0].is_empty() { "linux" } else { parts[0] };
    let arch = if parts[1].is_empty() { std::env::consts::ARCH } else { parts[1] };
    Some(if parts[2].is_empty() {
        format!("{os}/{arch}")
    } else {
        format!("{os}/{arch}/{}", parts[2])
    })
}

// ============================================================================
// Push
// ============================================================================

/// libpod push query parameters.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LibpodPushQuery {
    /// Where to push; defaults to the image name.
    pub destination: Option<String>,
    /// Verify registry TLS certificates.
    #[serde(default, deserialize_with = "flexible_opt_bool")]
    pub tls_verify: Option<bool>,
    /// Manifest format.
    pub format: Option<String>,
    /// Suppress progress lines.
    #[serde(default, deserialize_with = "flexible_bool")]
    pub quiet: bool,
}

async fn libpod_push(
    state: &AppState,
    name: &str,
    query: LibpodPushQuery,
    headers: &HeaderMap,
    form: &RequestForm,
    idle: Option<Extension<IdleTimer>>,
) -> Result<Response> {
    state.engine().inspect_image(name).await?;
    let destination = query
        .destination
        .filter(|d| !d.is_empty())
        .unwrap_or_else(|| name.to_string());
    let destination = ImageReference::parse(&destination)?.to_string();
    let credentials = auth::credentials(headers, form)?;

    let mut options = PushOptions {
        tls_verify: query.tls_verify,
        format: query.format.filter(|f| !f.is_empty()),
        ..PushOptions::default()
    };
    credentials.apply_push(&mut options);

    let engine = Arc::clone(state.engine());
    let source = name.to_string();
    let (progress, progress_rx) = ChannelWriter::new(state.stream_buffer());
    let operation = Operation::spawn(DisconnectPolicy::Detach, move |cancel| async move {
        let _credentials = credentials;
        engine
            .push(&cancel, &source, &destination, &options, &progress)
            .await
            .map_err(|e| e.to_string())
    });

    Ok(ndjson_response(
        LibpodPush { quiet: query.quiet },
        progress_rx,
        None,
        operation,
        idle.map(|Extension(idle)| idle),
    ))
}

/// Wire format of `POST /libpod/images/{name}/push`.
#[derive(Debug)]
pub struct LibpodPush {
    /// Drop progress lines.
    pub quiet: bool,
}

impl StreamProtocol for LibpodPush {
    type Event = PushReport;
    /// Manifest digest.
    type Outcome = std::result::Result<String, String>;

    fn on_progress(&mut self, chunk: &[u8]) -> Option<PushReport> {
        (!self.quiet).then(|| PushReport {
            stream: Some(String::from_utf8_lossy(chunk).into_owned()),
            ..PushReport::default()
        })
    }

    fn on_error(&mut self, chunk: &[u8]) -> Option<PushReport> {
        Some(PushReport {
            error: Some(chunk_text(chunk)),
            ..PushReport::default()
        })
    }

    fn on_complete(&mut self, outcome: Self::Outcome) -> Vec<PushReport> {
        vec![match outcome {
            Ok(digest) => PushReport {
                manifest_digest: Some(digest),
                ..PushReport::default()
            },
            Err(error) => PushReport {
                error: Some(error),
                ..PushReport::default()
            },
        }]
    }
}

/// Docker push query parameters.
#[derive(Debug, Deserialize)]
pub struct CompatPushQuery {
    /// Tag to push; the whole repository's `latest` when absent.
    pub tag: Option<String>,
}

async fn compat_push(
    state: &AppState,
    name: &str,
    query: CompatPushQuery,
    headers: &HeaderMap,
    form: &RequestForm,
    idle: Option<Extension<IdleTimer>>,
) -> Result<Response> {
    let reference = match query.tag.filter(|t| !t.is_empty()) {
        Some(tag) => ImageReference::parse(&format!("{}:{tag}", ImageReference::parse(name)?.repository()))?,
        None => ImageReference::parse(name)?,
    };
    let image = state.engine().inspect_image(&reference.to_string()).await?;
    let credentials = auth::credentials(headers, form)?;

    let mut options = PushOptions::default();
    credentials.apply_push(&mut options);

    let engine = Arc::clone(state.engine());
    let destination = reference.to_string();
    let (progress, progress_rx) = ChannelWriter::new(state.stream_buffer());
    let operation = Operation::spawn(DisconnectPolicy::Detach, move |cancel| async move {
        let _credentials = credentials;
        engine
            .push(&cancel, &destination, &destination, &options, &progress)
            .await
            .map_err(|e| e.to_string())
    });

    Ok(ndjson_response(
        CompatPush {
            tag: reference.tag,
            size: image.size,
        },
        progress_rx,
        None,
        operation,
        idle.map(|Extension(idle)| idle),
    ))
}

/// Wire format of `POST /images/{name}/push`.
#[derive(Debug)]
pub struct CompatPush {
    tag: String,
    size: u64,
}

impl StreamProtocol for CompatPush {
    type Event = JsonMessage;
    /// Manifest digest.
    type Outcome = std::result::Result<String, String>;

    fn on_progress(&mut self, chunk: &[u8]) -> Option<JsonMessage> {
        Some(JsonMessage::status(chunk_text(chunk)))
    }

    fn on_error(&mut self, chunk: &[u8]) -> Option<JsonMessage> {
        Some(JsonMessage::error(chunk_text(chunk)))
    }

    fn on_complete(&mut self, outcome: Self::Outcome) -> Vec<JsonMessage> {
        match outcome {
            Ok(digest) => vec![
                JsonMessage::status(format!("{}: digest: {digest} size: {}", self.tag, self.size)),
                JsonMessage {
                    aux: Some(PushResult {
                        tag: self.tag.clone(),
                        digest,
                        size: self.size,
                    }),
                    ..JsonMessage::default()
                },
            ],
            Err(message) => vec![JsonMessage::error(message)],
        }
    }
}
