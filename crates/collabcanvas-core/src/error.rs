//! Error types shared across the engine.

use crate::shapes::{LockDescriptor, ShapeId};
use thiserror::Error;

/// Errors raised by a remote collection backend.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RemoteError {
    #[error("Remote connection closed")]
    Disconnected,
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Remote rejected request: {0}")]
    Rejected(String),
}

impl From<serde_json::Error> for RemoteError {
    fn from(e: serde_json::Error) -> Self {
        RemoteError::Serialization(e.to_string())
    }
}

/// Result type for remote operations.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Refusals produced by the lock protocol.
///
/// These are ordinary outcomes, not failures: a refused claim or mutation
/// simply leaves the shape with its current owner.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LockError {
    #[error("Shape {shape_id} is locked by {}", owner.user_id)]
    HeldBy {
        shape_id: ShapeId,
        owner: LockDescriptor,
    },
    #[error("Shape not found: {0}")]
    NotFound(ShapeId),
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid value for {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}
