//! Error types for engine operations.

use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors returned by [`Engine`](crate::Engine) implementations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Container not found.
    #[error("no such container: {0}")]
    ContainerNotFound(String),

    /// Image not found in local storage.
    #[error("no such image: {0}")]
    ImageNotFound(String),

    /// Pod not found.
    #[error("no such pod: {0}")]
    PodNotFound(String),

    /// Reference could not be resolved in any registry.
    #[error("{0}: image not known to registry")]
    ReferenceNotFound(String),

    /// Malformed argument (reference, name, option).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Name or state conflict.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The operation's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// Progress could not be delivered.
    #[error(transparent)]
    Channel(#[from] crate::channel::ChannelError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Returns true if the error means the addressed object does not exist.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::ContainerNotFound(_)
                | Self::ImageNotFound(_)
                | Self::PodNotFound(_)
                | Self::ReferenceNotFound(_)
        )
    }
}
