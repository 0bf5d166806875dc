//! API router.
//!
//! Every endpoint is declared once in [`routes`] and served both at the root
//! and under each supported version prefix (`/v1.41/...`, `/v4.0.0/...`).
//! Docker-compatible endpoints live at the top level; libpod endpoints under
//! `/libpod`.

use crate::handlers::{container, image, pod, system};
use axum::Router;
use axum::handler::Handler;
use axum::routing::{MethodFilter, MethodRouter, on};
use podgate_core::Engine;
use std::sync::Arc;

/// Application state shared with handlers.
#[derive(Clone)]
pub struct AppState {
    engine: Arc<dyn Engine>,
    stream_buffer: usize,
}

impl AppState {
    /// Creates state around `engine`, with unbuffered streaming bridges.
    #[must_use]
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self {
            engine,
            stream_buffer: 0,
        }
    }

    /// Sets the channel capacity of streaming bridges.
    #[must_use]
    pub const fn with_stream_buffer(mut self, capacity: usize) -> Self {
        self.stream_buffer = capacity;
        self
    }

    /// The engine behind the API.
    #[must_use]
    pub const fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    /// Channel capacity of streaming bridges.
    #[must_use]
    pub const fn stream_buffer(&self) -> usize {
        self.stream_buffer
    }
}

/// One endpoint: method, path template and handler.
pub struct Route {
    /// HTTP method.
    pub method: MethodFilter,
    /// Path template, relative to the version prefix.
    pub path: &'static str,
    handler: MethodRouter<AppState>,
}

impl Route {
    fn new<H, T>(method: MethodFilter, path: &'static str, handler: H) -> Self
    where
        H: Handler<T, AppState>,
        T: 'static,
    {
        Self {
            method,
            path,
            handler: on(method, handler),
        }
    }
}

/// The endpoint table.
#[must_use]
pub fn routes() -> Vec<Route> {
    use MethodFilter as M;

    vec![
        // System
        Route::new(M::GET, "/_ping", system::ping),
        Route::new(M::HEAD, "/_ping", system::ping),
        Route::new(M::GET, "/version", system::version),
        Route::new(M::GET, "/info", system::info),
        Route::new(M::GET, "/libpod/_ping", system::ping),
        Route::new(M::HEAD, "/libpod/_ping", system::ping),
        Route::new(M::GET, "/libpod/version", system::version),
        Route::new(M::GET, "/libpod/info", system::libpod_info),
        // Containers
        Route::new(M::GET, "/containers/json", container::list_containers),
        Route::new(M::POST, "/containers/create", container::create_container),
        Route::new(M::GET, "/containers/{name}/json", container::inspect_container),
        Route::new(M::POST, "/containers/{name}/start", container::start_container),
        Route::new(M::POST, "/containers/{name}/stop", container::stop_container),
        Route::new(M::GET, "/containers/{name}/stats", container::container_stats),
        Route::new(M::DELETE, "/containers/{name}", container::remove_container),
        Route::new(M::GET, "/libpod/containers/json", container::libpod_list_containers),
        Route::new(M::POST, "/libpod/containers/create", container::libpod_create_container),
        Route::new(M::GET, "/libpod/containers/stats", container::libpod_stats),
        Route::new(M::GET, "/libpod/containers/{name}/json", container::libpod_inspect_container),
        Route::new(M::GET, "/libpod/containers/{name}/exists", container::container_exists),
        Route::new(M::POST, "/libpod/containers/{name}/start", container::start_container),
        Route::new(M::POST, "/libpod/containers/{name}/stop", container::stop_container),
        Route::new(M::DELETE, "/libpod/containers/{name}", container::libpod_remove_container),
        // Images; names may contain slashes, so the rest of the path is
        // matched by the image handlers.
        Route::new(M::GET, "/images/json", image::list_images),
        Route::new(M::POST, "/images/create", image::pull_image),
        Route::new(M::GET, "/images/{*path}", image::get_image),
        Route::new(M::POST, "/images/{*path}", image::post_image),
        Route::new(M::DELETE, "/images/{*path}", image::remove_image),
        Route::new(M::GET, "/libpod/images/json", image::libpod_list_images),
        Route::new(M::POST, "/libpod/images/pull", image::libpod_pull),
        Route::new(M::GET, "/libpod/images/{*path}", image::libpod_get_image),
        Route::new(M::POST, "/libpod/images/{*path}", image::libpod_post_image),
        Route::new(M::DELETE, "/libpod/images/{*path}", image::libpod_remove_image),
        // Pods
        Route::new(M::GET, "/libpod/pods/json", pod::list_pods),
        Route::new(M::POST, "/libpod/pods/create", pod::create_pod),
    ]
}

/// Version prefixes the table is also served under.
fn version_prefixes() -> Vec<String> {
    (24..=44)
        .map(|minor| format!("/v1.{minor}"))
        .chain(["/v3.0.0", "/v4.0.0", "/v5.0.0"].map(String::from))
        .collect()
}

fn table_router() -> Router<AppState> {
    routes()
        .into_iter()
        .fold(Router::new(), |router, route| {
            router.route(route.path, route.handler)
        })
}

/// Creates the API router with all endpoints.
#[must_use]
pub fn create_router(state: AppState) -> Router {
    let router = version_prefixes()
        .iter()
        .fold(table_router(), |router, prefix| {
            router.nest(prefix, table_router())
        });
    router.fallback(system::not_found).with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn no_duplicate_endpoints() {
        let mut seen = HashSet::new();
        for route in routes() {
            assert!(
                seen.insert((format!("{:?}", route.method), route.path)),
                "duplicate route {:?} {}",
                route.method,
                route.path
            );
        }
    }

    #[test]
    fn prefixes_cover_docker_and_libpod_versions() {
        let prefixes = version_prefixes();
        assert!(prefixes.contains(&"/v1.24".to_string()));
        assert!(prefixes.contains(&"/v1.41".to_string()));
        assert!(prefixes.contains(&"/v4.0.0".to_string()));
    }
}
