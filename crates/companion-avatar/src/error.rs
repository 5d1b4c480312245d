//! Error types for the avatar animation engine

use thiserror::Error;

/// Result type alias for animation operations
pub type AnimationResult<T> = Result<T, AnimationError>;

/// Errors that can occur while loading or animating a character
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AnimationError {
    #[error("Character is not loaded")]
    NotLoaded,

    #[error("Character is not ready: {0}")]
    NotReady(String),

    #[error("Character load failed: {0}")]
    LoadFailure(String),

    #[error("Clip not found: {0}")]
    ClipNotFound(String),

    #[error("Character has no idle clips")]
    NoIdleClips,

    #[error("Morph target not found: {0}")]
    MorphTargetNotFound(String),

    #[error("Character handle is stale (character was replaced or disposed)")]
    StaleCharacter,

    #[error("Scene error: {0}")]
    Scene(String),
}

impl AnimationError {
    /// Errors the caller should log and treat as a no-op, leaving the avatar
    /// in its last good pose.
    pub fn is_benign(&self) -> bool {
        matches!(self, AnimationError::ClipNotFound(_) | AnimationError::NoIdleClips)
    }
}
