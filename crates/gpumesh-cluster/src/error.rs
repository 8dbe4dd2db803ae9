//! Error types for election and mesh coordination.

use thiserror::Error;

use gpumesh_core::TransportError;
use gpumesh_registry::RegistryError;

/// Result type alias for cluster operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Errors that can occur during cluster coordination.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The registry holds no candidates at all.
    #[error("no members to elect an admin from")]
    NoMembers,

    #[error("this node is not the room admin")]
    NotAdmin,

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}
