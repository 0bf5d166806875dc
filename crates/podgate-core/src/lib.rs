//! # podgate-core
//!
//! Shared building blocks for the podgate API service.
//!
//! This crate holds everything the HTTP layer talks to but does not own:
//!
//! - [`Engine`]: the abstract container engine the API delegates to
//! - [`ChannelWriter`]: the byte-writer-to-channel bridge used to stream
//!   progress out of long-running engine calls
//! - [`MemoryEngine`]: an in-memory engine used by the daemon's demo backend
//!   and by tests
//! - [`Config`]: layered service configuration
//!
//! ## Architecture
//!
//! ```text
//! HTTP client ──► podgate-api ──► Engine (trait) ──► MemoryEngine / real backend
//!                     ▲                │
//!                     └── ChannelWriter ◄┘  (progress, errors)
//! ```

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod memory;
pub mod reference;
pub mod trace;

pub use channel::{ChannelError, ChannelReceiver, ChannelWriter};
pub use config::{Config, LoggingConfig, ServiceConfig};
pub use engine::Engine;
pub use error::{EngineError, Result};
pub use memory::{MemoryEngine, RegistryImage};
pub use reference::ImageReference;
