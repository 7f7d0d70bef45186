//! Error types for the lifecycle engine.

use std::path::PathBuf;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the lifecycle engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Precondition Errors
    // =========================================================================
    /// Container not found.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// Container already started.
    #[error("container already started: {0}")]
    ContainerAlreadyExists(String),

    /// Parent of a nested container does not exist.
    #[error("parent container does not exist: {0}")]
    ParentNotFound(String),

    /// Parent of a nested container is being destroyed.
    #[error("parent container {0} is being destroyed")]
    ParentDestroying(String),

    /// Operation is only valid for root containers.
    #[error("operation requires a root container, got nested container {0}")]
    NotRootContainer(String),

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    /// Container launch failed or was aborted by a concurrent destroy.
    #[error("failed to launch container '{id}': {reason}")]
    LaunchFailed { id: String, reason: String },

    /// Container destroy failed. The container stays in the registry so
    /// the stuck state remains observable.
    #[error("failed to destroy container '{id}': {reason}")]
    DestroyFailed { id: String, reason: String },

    /// Recovery of persisted containers failed.
    #[error("recovery failed: {0}")]
    Recovery(String),

    // =========================================================================
    // Checkpoint Errors
    // =========================================================================
    /// A runtime-directory checkpoint could not be written or read.
    #[error("checkpoint failed at {path}: {reason}")]
    Checkpoint { path: PathBuf, reason: String },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal lock poisoned.
    #[error("internal lock poisoned")]
    LockPoisoned,

    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns true if this is a not found error.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ContainerNotFound(_))
    }

    /// Returns true if this error came from the destroy path.
    #[must_use]
    pub fn is_destroy_failure(&self) -> bool {
        matches!(self, Self::DestroyFailed { .. })
    }
}
