use fleet_container::ContainerError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("resource in group {group} has no id and cannot be tracked")]
    MissingResourceId { group: String },

    #[error(transparent)]
    Container(#[from] ContainerError),
}

pub type ReconcileResult<T> = Result<T, ReconcileError>;
