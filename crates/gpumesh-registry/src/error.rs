//! Error types for the room registry.

use thiserror::Error;

/// Result type alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors that can occur while merging replicated state.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to decode update: {0}")]
    Decode(String),

    #[error("failed to apply update: {0}")]
    Apply(String),
}
