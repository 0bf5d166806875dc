//! In-memory engine.
//!
//! `MemoryEngine` keeps containers, images and pods in process memory and
//! simulates a registry with a fixed catalogue of [`RegistryImage`]s. It backs
//! the daemon's demo mode and the API test suites; it honours the same
//! contracts a real backend must: progress goes to the supplied
//! [`ChannelWriter`] and long-running calls stop when cancelled.

use crate::channel::ChannelWriter;
use crate::engine::{
    ContainerDetails, ContainerSpec, ContainerState, ContainerStats, ContainerSummary, Engine, ImageDetails,
    ImageSummary, PodSpec, PodSummary, PullOptions, PushOptions, SystemInfo, VersionInfo,
};
use crate::error::{EngineError, Result};
use crate::reference::ImageReference;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Engine version reported by the in-memory backend.
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// An image the simulated registry can serve.
#[derive(Debug, Clone)]
pub struct RegistryImage {
    /// Layer digests, in order.
    pub layers: Vec<String>,
    /// Image config blob; its digest becomes the image id.
    pub config: String,
    /// Compressed size in bytes.
    pub size: u64,
    /// Artificial latency per copied layer.
    pub layer_delay: Duration,
    /// When set, pulls of this image fail with this message after the
    /// manifest lookup.
    pub failure: Option<String>,
}

impl RegistryImage {
    /// Builds a registry entry with `layer_count` synthetic layers derived
    /// from `seed`.
    #[must_use]
    pub fn synthetic(seed: &str, layer_count: usize) -> Self {
        let layers = (0..layer_count)
            .map(|i| format!("sha256:{}", sha256_hex(&format!("{seed}/layer/{i}"))))
            .collect();
        Self {
            layers,
            config: format!("{{\"seed\":\"{seed}\"}}"),
            size: 1024 * 1024 * (layer_count as u64 + 1),
            layer_delay: Duration::ZERO,
            failure: None,
        }
    }

    /// Sets the artificial per-layer latency.
    #[must_use]
    pub const fn with_layer_delay(mut self, delay: Duration) -> Self {
        self.layer_delay = delay;
        self
    }

    /// Makes every pull of this image fail with `message`.
    #[must_use]
    pub fn with_failure(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    fn image_id(&self) -> String {
        sha256_hex(&self.config)
    }
}

#[derive(Debug, Clone)]
struct StoredImage {
    id: String,
    tags: Vec<String>,
    layers: Vec<String>,
    size: u64,
    created: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct StoredContainer {
    id: String,
    name: String,
    image: String,
    image_id: String,
    command: Vec<String>,
    env: Vec<String>,
    labels: HashMap<String, String>,
    created: DateTime<Utc>,
    state: ContainerState,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    exit_code: Option<i32>,
    pod: Option<String>,
}

#[derive(Debug, Clone)]
struct StoredPod {
    id: String,
    name: String,
    created: DateTime<Utc>,
    labels: HashMap<String, String>,
}

#[derive(Debug, Default)]
struct State {
    /// Fully qualified reference -> registry image.
    registry: BTreeMap<String, RegistryImage>,
    images: Vec<StoredImage>,
    containers: Vec<StoredContainer>,
    pods: Vec<StoredPod>,
}

/// In-memory [`Engine`] implementation.
#[derive(Debug, Default)]
pub struct MemoryEngine {
    state: RwLock<State>,
    samples: AtomicU64,
}

impl MemoryEngine {
    /// Creates an engine with an empty registry and store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an engine whose registry serves a few well-known images.
    #[must_use]
    pub fn with_demo_registry() -> Self {
        let registry = [
            ("docker.io/library/alpine:latest", 1),
            ("docker.io/library/alpine:3.20", 1),
            ("docker.io/library/busybox:latest", 1),
            ("quay.io/podman/hello:latest", 2),
            ("registry.fedoraproject.org/fedora:latest", 3),
        ]
        .into_iter()
        .map(|(reference, layers)| {
            (
                reference.to_string(),
                RegistryImage::synthetic(reference, layers),
            )
        })
        .collect();

        Self {
            state: RwLock::new(State {
                registry,
                ..State::default()
            }),
            samples: AtomicU64::new(0),
        }
    }

    /// Adds an image to the simulated registry.
    ///
    /// # Errors
    ///
    /// Returns an error if `reference` is malformed.
    pub async fn add_registry_image(&self, reference: &str, image: RegistryImage) -> Result<()> {
        let reference = ImageReference::parse(reference)?;
        self.state
            .write()
            .await
            .registry
            .insert(reference.to_string(), image);
        Ok(())
    }

    /// Returns true if the registry has `reference`.
    pub async fn registry_has(&self, reference: &str) -> bool {
        let Ok(reference) = ImageReference::parse(reference) else {
            return false;
        };
        self.state
            .read()
            .await
            .registry
            .contains_key(&reference.to_string())
    }
}

#[async_trait]
impl Engine for MemoryEngine {
    async fn info(&self) -> Result<SystemInfo> {
        let state = self.state.read().await;
        let count = |s: ContainerState| state.containers.iter().filter(|c| c.state == s).count();
        Ok(SystemInfo {
            hostname: hostname(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            kernel_version: String::new(),
            cpus: std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get),
            mem_total: 0,
            containers: state.containers.len(),
            containers_running: count(ContainerState::Running),
            containers_paused: count(ContainerState::Paused),
            containers_stopped: count(ContainerState::Exited) + count(ContainerState::Stopped),
            images: state.images.len(),
            pods: state.pods.len(),
        })
    }

    async fn version(&self) -> Result<VersionInfo> {
        Ok(VersionInfo {
            version: ENGINE_VERSION.to_string(),
            api_version: String::new(),
            min_api_version: String::new(),
            git_commit: String::new(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            kernel_version: String::new(),
            built: 0,
        })
    }

    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>> {
        let state = self.state.read().await;
        Ok(state
            .containers
            .iter()
            .filter(|c| all || c.state == ContainerState::Running)
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                names: vec![c.name.clone()],
                image: c.image.clone(),
                image_id: c.image_id.clone(),
                command: c.command.clone(),
                created: c.created,
                state: c.state,
                labels: c.labels.clone(),
                pod: c.pod.clone(),
            })
            .collect())
    }

    async fn create_container(&self, spec: ContainerSpec) -> Result<String> {
        let mut state = self.state.write().await;

        let image = find_image(&state.images, &spec.image)
            .ok_or_else(|| EngineError::ImageNotFound(spec.image.clone()))?
            .clone();

        let pod = match &spec.pod {
            Some(name) => Some(
                find_pod(&state.pods, name)
                    .ok_or_else(|| EngineError::PodNotFound(name.clone()))?
                    .id
                    .clone(),
            ),
            None => None,
        };

        let id = random_id();
        let name = spec.name.unwrap_or_else(|| format!("podgate_{}", &id[..8]));
        if state.containers.iter().any(|c| c.name == name) {
            return Err(EngineError::Conflict(format!(
                "the container name {name:?} is already in use"
            )));
        }

        state.containers.push(StoredContainer {
            id: id.clone(),
            name,
            image: spec.image,
            image_id: image.id,
            command: spec.command,
            env: spec.env,
            labels: spec.labels,
            created: Utc::now(),
            state: ContainerState::Created,
            started_at: None,
            finished_at: None,
            exit_code: None,
            pod,
        });
        Ok(id)
    }

    async fn inspect_container(&self, name_or_id: &str) -> Result<ContainerDetails> {
        let state = self.state.read().await;
        let c = find_container(&state.containers, name_or_id)
            .ok_or_else(|| EngineError::ContainerNotFound(name_or_id.to_string()))?;
        Ok(ContainerDetails {
            id: c.id.clone(),
            name: c.name.clone(),
            image: c.image.clone(),
            image_id: c.image_id.clone(),
            command: c.command.clone(),
            env: c.env.clone(),
            labels: c.labels.clone(),
            created: c.created,
            state: c.state,
            started_at: c.started_at,
            finished_at: c.finished_at,
            exit_code: c.exit_code,
            pod: c.pod.clone(),
        })
    }

    async fn start_container(&self, name_or_id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let c = find_container_mut(&mut state.containers, name_or_id)
            .ok_or_else(|| EngineError::ContainerNotFound(name_or_id.to_string()))?;
        if c.state != ContainerState::Running {
            c.state = ContainerState::Running;
            c.started_at = Some(Utc::now());
            c.finished_at = None;
            c.exit_code = None;
        }
        Ok(())
    }

    async fn stop_container(&self, name_or_id: &str, _timeout: Duration) -> Result<()> {
        let mut state = self.state.write().await;
        let c = find_container_mut(&mut state.containers, name_or_id)
            .ok_or_else(|| EngineError::ContainerNotFound(name_or_id.to_string()))?;
        if c.state == ContainerState::Running || c.state == ContainerState::Paused {
            c.state = ContainerState::Exited;
            c.finished_at = Some(Utc::now());
            c.exit_code = Some(0);
        }
        Ok(())
    }

    async fn remove_container(&self, name_or_id: &str, force: bool) -> Result<()> {
        let mut state = self.state.write().await;
        let index = state
            .containers
            .iter()
            .position(|c| matches_container(c, name_or_id))
            .ok_or_else(|| EngineError::ContainerNotFound(name_or_id.to_string()))?;
        if state.containers[index].state == ContainerState::Running && !force {
            return Err(EngineError::Conflict(format!(
                "cannot remove container {name_or_id} as it is running"
            )));
        }
        state.containers.remove(index);
        Ok(())
    }

    async fn container_stats(&self, names_or_ids: &[String]) -> Result<Vec<ContainerStats>> {
        let state = self.state.read().await;
        let selected: Vec<&StoredContainer> = if names_or_ids.is_empty() {
            state
                .containers
                .iter()
                .filter(|c| c.state == ContainerState::Running)
                .collect()
        } else {
            names_or_ids
                .iter()
                .map(|n| {
                    find_container(&state.containers, n)
                        .ok_or_else(|| EngineError::ContainerNotFound(n.clone()))
                })
                .collect::<Result<_>>()?
        };

        let sample = self.samples.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(selected.into_iter().map(|c| sample_stats(c, sample)).collect())
    }

    async fn list_images(&self) -> Result<Vec<ImageSummary>> {
        let state = self.state.read().await;
        Ok(state
            .images
            .iter()
            .map(|i| ImageSummary {
                id: i.id.clone(),
                repo_tags: i.tags.clone(),
                digest: format!("sha256:{}", i.id),
                created: i.created,
                size: i.size,
            })
            .collect())
    }

    async fn inspect_image(&self, name_or_id: &str) -> Result<ImageDetails> {
        let state = self.state.read().await;
        let i = find_image(&state.images, name_or_id)
            .ok_or_else(|| EngineError::ImageNotFound(name_or_id.to_string()))?;
        Ok(ImageDetails {
            id: i.id.clone(),
            repo_tags: i.tags.clone(),
            digest: format!("sha256:{}", i.id),
            created: i.created,
            size: i.size,
            architecture: std::env::consts::ARCH.to_string(),
            os: "linux".to_string(),
            layers: i.layers.clone(),
        })
    }

    async fn remove_image(&self, name_or_id: &str, force: bool) -> Result<Vec<String>> {
        let mut state = self.state.write().await;
        let index = state
            .images
            .iter()
            .position(|i| matches_image(i, name_or_id))
            .ok_or_else(|| EngineError::ImageNotFound(name_or_id.to_string()))?;
        let id = state.images[index].id.clone();

        let users: Vec<String> = state
            .containers
            .iter()
            .filter(|c| c.image_id == id)
            .map(|c| c.id.clone())
            .collect();
        if !users.is_empty() && !force {
            return Err(EngineError::Conflict(format!(
                "image used by {}: image is in use by a container",
                users.join(", ")
            )));
        }
        state.containers.retain(|c| c.image_id != id);
        state.images.remove(index);
        Ok(vec![id])
    }

    async fn tag_image(&self, name_or_id: &str, repo: &str, tag: &str) -> Result<()> {
        let target = ImageReference::parse(&format!("{repo}:{tag}"))?.to_string();
        let mut state = self.state.write().await;
        for image in &mut state.images {
            image.tags.retain(|t| t != &target);
        }
        let image = state
            .images
            .iter_mut()
            .find(|i| matches_image(i, name_or_id))
            .ok_or_else(|| EngineError::ImageNotFound(name_or_id.to_string()))?;
        image.tags.push(target);
        Ok(())
    }

    async fn list_tags(&self, repository: &str, _options: &PullOptions) -> Result<Vec<String>> {
        let repository = ImageReference::parse(repository)?.repository();
        let prefix = format!("{repository}:");
        let state = self.state.read().await;
        let tags: Vec<String> = state
            .registry
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
            .collect();
        if tags.is_empty() {
            return Err(EngineError::ReferenceNotFound(repository));
        }
        Ok(tags)
    }

    async fn pull(
        &self,
        cancel: &CancellationToken,
        reference: &str,
        _options: &PullOptions,
        progress: &ChannelWriter,
    ) -> Result<String> {
        let reference = ImageReference::parse(reference)?;
        report(progress, &format!("Trying to pull {reference}...\n")).await;

        let image = self
            .state
            .read()
            .await
            .registry
            .get(&reference.to_string())
            .cloned()
            .ok_or_else(|| EngineError::ReferenceNotFound(reference.to_string()))?;

        if let Some(message) = &image.failure {
            return Err(EngineError::Internal(format!(
                "reading manifest {} in {}: {message}",
                reference.tag,
                reference.repository()
            )));
        }

        report(progress, "Getting image source signatures\n").await;
        for layer in &image.layers {
            copy_delay(cancel, image.layer_delay).await?;
            report(progress, &format!("Copying blob {}\n", short_digest(layer))).await;
        }

        let id = image.image_id();
        report(progress, &format!("Copying config {}\n", &id[..10])).await;
        report(progress, "Writing manifest to image destination\n").await;
        report(progress, "Storing signatures\n").await;

        let tag = reference.to_string();
        let mut state = self.state.write().await;
        for existing in &mut state.images {
            existing.tags.retain(|t| t != &tag);
        }
        if let Some(existing) = state.images.iter_mut().find(|i| i.id == id) {
            existing.tags.push(tag);
        } else {
            state.images.push(StoredImage {
                id: id.clone(),
                tags: vec![tag],
                layers: image.layers.clone(),
                size: image.size,
                created: Utc::now(),
            });
        }
        state.images.retain(|i| !i.tags.is_empty());
        tracing::debug!(
            reference_id = %crate::trace::current_reference_id(),
            image = %id,
            "image pulled"
        );
        Ok(id)
    }

    async fn push(
        &self,
        cancel: &CancellationToken,
        source: &str,
        destination: &str,
        _options: &PushOptions,
        progress: &ChannelWriter,
    ) -> Result<String> {
        let destination = ImageReference::parse(destination)?;
        let image = {
            let state = self.state.read().await;
            find_image(&state.images, source)
                .ok_or_else(|| EngineError::ImageNotFound(source.to_string()))?
                .clone()
        };

        report(progress, "Getting image source signatures\n").await;
        for layer in &image.layers {
            copy_delay(cancel, Duration::ZERO).await?;
            report(progress, &format!("Copying blob {}\n", short_digest(layer))).await;
        }
        report(progress, &format!("Copying config {}\n", &image.id[..10])).await;
        report(progress, "Writing manifest to image destination\n").await;

        let digest = format!("sha256:{}", sha256_hex(&format!("{}@{destination}", image.id)));
        self.state.write().await.registry.insert(
            destination.to_string(),
            RegistryImage {
                layers: image.layers.clone(),
                config: format!("{{\"pushed\":\"{}\"}}", image.id),
                size: image.size,
                layer_delay: Duration::ZERO,
                failure: None,
            },
        );
        Ok(digest)
    }

    async fn list_pods(&self) -> Result<Vec<PodSummary>> {
        let state = self.state.read().await;
        Ok(state
            .pods
            .iter()
            .map(|p| {
                let members: Vec<&StoredContainer> = state
                    .containers
                    .iter()
                    .filter(|c| c.pod.as_deref() == Some(p.id.as_str()))
                    .collect();
                let status = if members.iter().any(|c| c.state == ContainerState::Running) {
                    "Running"
                } else if members.is_empty() {
                    "Created"
                } else {
                    "Exited"
                };
                PodSummary {
                    id: p.id.clone(),
                    name: p.name.clone(),
                    created: p.created,
                    status: status.to_string(),
                    containers: members.iter().map(|c| c.id.clone()).collect(),
                    labels: p.labels.clone(),
                }
            })
            .collect())
    }

    async fn create_pod(&self, spec: PodSpec) -> Result<String> {
        let mut state = self.state.write().await;
        let id = random_id();
        let name = spec.name.unwrap_or_else(|| format!("pod_{}", &id[..8]));
        if state.pods.iter().any(|p| p.name == name) {
            return Err(EngineError::Conflict(format!(
                "the pod name {name:?} is already in use"
            )));
        }
        state.pods.push(StoredPod {
            id: id.clone(),
            name,
            created: Utc::now(),
            labels: spec.labels,
        });
        Ok(id)
    }
}

/// Writes a progress line, ignoring a consumer that has gone away: a pull
/// keeps populating local storage even if nobody watches it.
async fn report(progress: &ChannelWriter, line: &str) {
    if progress.write_str(line).await.is_err() {
        tracing::trace!("progress consumer gone, dropping line");
    }
}

async fn copy_delay(cancel: &CancellationToken, delay: Duration) -> Result<()> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(EngineError::Cancelled),
        () = tokio::time::sleep(delay) => Ok(()),
    }
}

fn sample_stats(c: &StoredContainer, sample: u64) -> ContainerStats {
    let running = c.state == ContainerState::Running;
    let scale = if running { sample } else { 0 };
    let mem_limit = 512 * 1024 * 1024;
    let mem_usage = if running { 8 * 1024 * 1024 + (scale % 16) * 4096 } else { 0 };
    #[allow(clippy::cast_precision_loss)]
    let mem_perc = mem_usage as f64 / mem_limit as f64 * 100.0;
    ContainerStats {
        container_id: c.id.clone(),
        name: c.name.clone(),
        cpu: if running { 0.5 } else { 0.0 },
        cpu_nano: scale * 5_000_000,
        system_nano: sample * 1_000_000_000,
        mem_usage,
        mem_limit,
        mem_perc,
        net_input: scale * 128,
        net_output: scale * 64,
        block_input: 0,
        block_output: 0,
        pids: u64::from(running),
    }
}

fn find_image<'a>(images: &'a [StoredImage], name_or_id: &str) -> Option<&'a StoredImage> {
    images.iter().find(|i| matches_image(i, name_or_id))
}

fn matches_image(image: &StoredImage, name_or_id: &str) -> bool {
    let id = name_or_id.strip_prefix("sha256:").unwrap_or(name_or_id);
    if id.len() >= 3 && image.id.starts_with(id) {
        return true;
    }
    ImageReference::parse(name_or_id)
        .is_ok_and(|r| image.tags.iter().any(|t| *t == r.to_string()))
}

fn find_container<'a>(containers: &'a [StoredContainer], name_or_id: &str) -> Option<&'a StoredContainer> {
    containers.iter().find(|c| matches_container(c, name_or_id))
}

fn find_container_mut<'a>(
    containers: &'a mut [StoredContainer],
    name_or_id: &str,
) -> Option<&'a mut StoredContainer> {
    containers.iter_mut().find(|c| matches_container(c, name_or_id))
}

fn matches_container(c: &StoredContainer, name_or_id: &str) -> bool {
    let name = name_or_id.trim_start_matches('/');
    c.name == name || (name.len() >= 3 && c.id.starts_with(name))
}

fn find_pod<'a>(pods: &'a [StoredPod], name_or_id: &str) -> Option<&'a StoredPod> {
    pods.iter()
        .find(|p| p.name == name_or_id || (name_or_id.len() >= 3 && p.id.starts_with(name_or_id)))
}

fn random_id() -> String {
    format!(
        "{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    )
}

fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

fn short_digest(digest: &str) -> &str {
    let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
    &hex[..hex.len().min(12)]
}

fn hostname() -> String {
    std::fs::read_to_string("/etc/hostname")
        .map(|h| h.trim().to_string())
        .unwrap_or_else(|_| "localhost".to_string())
}
