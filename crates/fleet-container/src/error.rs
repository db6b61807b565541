//! Resource container error types.

use std::time::Duration;

use thiserror::Error;

use fleet_core::PropertyError;

/// Errors surfaced by the container and its backends.
///
/// Backend failures reach the caller unchanged; the container performs no
/// retries of its own.
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid resource: {0}")]
    Validation(String),

    /// `resource_id` is set when the id was known before the backend call;
    /// compute may exist under it and should be released.
    #[error("scale-out of {resource} timed out after {elapsed:?}")]
    ScaleOutTimeout {
        resource: String,
        resource_id: Option<String>,
        elapsed: Duration,
    },

    #[error("scale-out failed: {0}")]
    ScaleOutFailure(String),

    #[error("release of {resource_id} timed out after {elapsed:?}")]
    ReleaseTimeout {
        resource_id: String,
        elapsed: Duration,
    },

    #[error("terminate failed: {0}")]
    TerminateFailure(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<PropertyError> for ContainerError {
    fn from(e: PropertyError) -> Self {
        ContainerError::Configuration(e.to_string())
    }
}

pub type ContainerResult<T> = Result<T, ContainerError>;
