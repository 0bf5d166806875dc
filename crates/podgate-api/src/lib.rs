//! # podgate-api
//!
//! Docker-compatible and libpod REST API server for podgate.
//!
//! This crate owns everything between the socket and the [`Engine`]:
//!
//! - [`listener`]: acquiring the listening socket, including sockets passed
//!   in by a service manager (`LISTEN_PID`/`LISTEN_FDS`)
//! - [`server`]: the accept loop, graceful shutdown and the idle timer that
//!   stops a socket-activated service once nobody talks to it
//! - [`dispatch`]: per-request middleware (reference id, form parsing, panic
//!   recovery)
//! - [`stream`]: the NDJSON multiplexer behind pull, push and stats
//!
//! ## Compatibility
//!
//! Serves Docker Engine API v1.41 (down to v1.24) and libpod API v4,
//! both at the root and under versioned prefixes.
//!
//! ## Architecture
//!
//! ```text
//! client ──► ApiListener ──► ApiServer ──► dispatch ──► Router ──► Engine
//!                               │                          │
//!                               ▼                          ▼
//!                           IdleTimer               stream::multiplex
//! ```
//!
//! [`Engine`]: podgate_core::Engine

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
// Wire types mirror the Docker and libpod field sets.
#![allow(clippy::missing_docs_in_private_items)]

pub mod api;
pub mod auth;
pub mod dispatch;
pub mod error;
pub mod extract;
pub mod handlers;
pub mod idle;
pub mod listener;
pub mod server;
pub mod stream;
pub mod types;

pub use api::{AppState, create_router};
pub use error::{ApiError, Result};
pub use server::{ApiServer, ServerConfig, ServerHandle};

/// Docker API version.
pub const API_VERSION: &str = "1.41";

/// Minimum supported Docker API version.
pub const MIN_API_VERSION: &str = "1.24";

/// libpod API version.
pub const LIBPOD_API_VERSION: &str = "4.0.0";
