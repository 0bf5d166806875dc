//! The container engine interface the API layer delegates to.
//!
//! Everything behind this trait (OCI runtime invocation, image storage,
//! networking) is outside the API service. The service only relies on two
//! properties of long-running operations: they report progress through a
//! [`ChannelWriter`], and they stop when their [`CancellationToken`] fires.

use crate::channel::ChannelWriter;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Abstract container engine.
#[async_trait]
pub trait Engine: Send + Sync + 'static {
    // ------------------------------------------------------------------
    // System
    // ------------------------------------------------------------------

    /// Returns host and store information.
    async fn info(&self) -> Result<SystemInfo>;

    /// Returns engine version information.
    async fn version(&self) -> Result<VersionInfo>;

    // ------------------------------------------------------------------
    // Containers
    // ------------------------------------------------------------------

    /// Lists containers; stopped ones only when `all` is set.
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>>;

    /// Creates a container and returns its id.
    async fn create_container(&self, spec: ContainerSpec) -> Result<String>;

    /// Returns full details of one container.
    async fn inspect_container(&self, name_or_id: &str) -> Result<ContainerDetails>;

    /// Starts a container.
    async fn start_container(&self, name_or_id: &str) -> Result<()>;

    /// Stops a container, killing it after `timeout`.
    async fn stop_container(&self, name_or_id: &str, timeout: Duration) -> Result<()>;

    /// Removes a container.
    async fn remove_container(&self, name_or_id: &str, force: bool) -> Result<()>;

    /// Samples resource usage. An empty `names_or_ids` means every running
    /// container.
    async fn container_stats(&self, names_or_ids: &[String]) -> Result<Vec<ContainerStats>>;

    // ------------------------------------------------------------------
    // Images
    // ------------------------------------------------------------------

    /// Lists local images.
    async fn list_images(&self) -> Result<Vec<ImageSummary>>;

    /// Returns full details of one local image.
    async fn inspect_image(&self, name_or_id: &str) -> Result<ImageDetails>;

    /// Removes a local image, returning the ids that were deleted.
    async fn remove_image(&self, name_or_id: &str, force: bool) -> Result<Vec<String>>;

    /// Adds `repo:tag` to a local image.
    async fn tag_image(&self, name_or_id: &str, repo: &str, tag: &str) -> Result<()>;

    /// Lists the tags a registry knows for `repository`.
    async fn list_tags(&self, repository: &str, options: &PullOptions) -> Result<Vec<String>>;

    /// Pulls `reference`, writing human-readable progress lines to
    /// `progress`. Returns the image id.
    async fn pull(
        &self,
        cancel: &CancellationToken,
        reference: &str,
        options: &PullOptions,
        progress: &ChannelWriter,
    ) -> Result<String>;

    /// Pushes local image `source` to `destination`, writing progress lines to
    /// `progress`. Returns the manifest digest.
    async fn push(
        &self,
        cancel: &CancellationToken,
        source: &str,
        destination: &str,
        options: &PushOptions,
        progress: &ChannelWriter,
    ) -> Result<String>;

    // ------------------------------------------------------------------
    // Pods
    // ------------------------------------------------------------------

    /// Lists pods.
    async fn list_pods(&self) -> Result<Vec<PodSummary>>;

    /// Creates a pod and returns its id.
    async fn create_pod(&self, spec: PodSpec) -> Result<String>;
}

/// Host and store information.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SystemInfo {
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub kernel_version: String,
    pub cpus: usize,
    pub mem_total: u64,
    pub containers: usize,
    pub containers_running: usize,
    pub containers_paused: usize,
    pub containers_stopped: usize,
    pub images: usize,
    pub pods: usize,
}

/// Engine version information.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VersionInfo {
    pub version: String,
    pub api_version: String,
    pub min_api_version: String,
    pub git_commit: String,
    pub os: String,
    pub arch: String,
    pub kernel_version: String,
    pub built: i64,
}

/// Container lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Stopped,
    Exited,
}

impl ContainerState {
    /// Returns the state as a lowercase string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Exited => "exited",
        }
    }
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters for creating a container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: Option<String>,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub pod: Option<String>,
}

/// One entry of a container listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerSummary {
    pub id: String,
    pub names: Vec<String>,
    pub image: String,
    pub image_id: String,
    pub command: Vec<String>,
    pub created: DateTime<Utc>,
    pub state: ContainerState,
    pub labels: HashMap<String, String>,
    pub pod: Option<String>,
}

/// Full container details.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerDetails {
    pub id: String,
    pub name: String,
    pub image: String,
    pub image_id: String,
    pub command: Vec<String>,
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    pub created: DateTime<Utc>,
    pub state: ContainerState,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub pod: Option<String>,
}

/// A single resource-usage sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerStats {
    #[serde(rename = "ContainerID")]
    pub container_id: String,
    pub name: String,
    pub cpu: f64,
    pub cpu_nano: u64,
    pub system_nano: u64,
    pub mem_usage: u64,
    pub mem_limit: u64,
    pub mem_perc: f64,
    pub net_input: u64,
    pub net_output: u64,
    pub block_input: u64,
    pub block_output: u64,
    #[serde(rename = "PIDs")]
    pub pids: u64,
}

/// One entry of an image listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageSummary {
    pub id: String,
    pub repo_tags: Vec<String>,
    pub digest: String,
    pub created: DateTime<Utc>,
    pub size: u64,
}

/// Full image details.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageDetails {
    pub id: String,
    pub repo_tags: Vec<String>,
    pub digest: String,
    pub created: DateTime<Utc>,
    pub size: u64,
    pub architecture: String,
    pub os: String,
    pub layers: Vec<String>,
}

/// Parameters for creating a pod.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodSpec {
    pub name: Option<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// One entry of a pod listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PodSummary {
    pub id: String,
    pub name: String,
    pub created: DateTime<Utc>,
    pub status: String,
    pub containers: Vec<String>,
    pub labels: HashMap<String, String>,
}

/// Credentials for one registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryAuth {
    pub username: String,
    pub password: String,
}

/// Options for [`Engine::pull`] and [`Engine::list_tags`].
#[derive(Debug, Clone, Default)]
pub struct PullOptions {
    /// Inline credentials for the target registry.
    pub credentials: Option<RegistryAuth>,
    /// Path to an `auth.json` holding credentials for several registries.
    pub authfile: Option<PathBuf>,
    /// `Some(false)` skips TLS verification; `None` keeps the engine default.
    pub tls_verify: Option<bool>,
    /// Requested platform, `os/arch[/variant]`.
    pub platform: Option<String>,
}

/// Options for [`Engine::push`].
#[derive(Debug, Clone, Default)]
pub struct PushOptions {
    pub credentials: Option<RegistryAuth>,
    pub authfile: Option<PathBuf>,
    pub tls_verify: Option<bool>,
    /// Manifest format (`oci`, `v2s2`, `v2s1`).
    pub format: Option<String>,
}
