//! Session manager error types.

use thiserror::Error;

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors that can occur while provisioning or tearing down a session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Every display id in the pool is held. This is a capacity signal, not
    /// a transient fault; callers should surface "at capacity" rather than
    /// retry.
    #[error("session pool at capacity ({capacity} sessions)")]
    Exhausted { capacity: usize },

    /// The overlay filesystem could not be mounted or unmounted.
    #[error("overlay mount failed: {0}")]
    Mount(String),

    /// A display-stack process failed to start or become ready.
    #[error("display stack spawn failed: {0}")]
    Spawn(String),

    /// Archiving or restoring an upper-layer snapshot failed.
    #[error("layer snapshot failed: {0}")]
    Archive(String),

    /// A freshly generated routing token collided with a published one.
    #[error("routing token collision")]
    RoutingConflict,

    /// A session with this id is already registered.
    #[error("session already exists: {0}")]
    AlreadyExists(String),

    /// No session with this id is registered.
    #[error("session not found: {0}")]
    NotFound(String),

    /// The session reached the terminal failed state.
    #[error("session failed: {0}")]
    Failed(String),

    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// Whether the error indicates the pool is at capacity.
    pub fn is_capacity(&self) -> bool {
        matches!(self, SessionError::Exhausted { .. })
    }
}
