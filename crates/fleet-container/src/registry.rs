//! Backend selection by configured name.

use std::sync::Arc;

use crate::backend::ContainerBackend;
use crate::backends::{
    ExternalJobBackend, KubernetesBackend, LocalBackend, MemoryBackend, external_job, kubernetes,
    local, memory,
};
use crate::command::CommandRunner;
use crate::error::{ContainerError, ContainerResult};

/// Names accepted by [`create_backend`].
pub const BACKEND_KINDS: [&str; 4] = [local::KIND, kubernetes::KIND, external_job::KIND, memory::KIND];

/// Create the backend registered under `kind`.
pub fn create_backend(kind: &str) -> ContainerResult<Arc<dyn ContainerBackend>> {
    match kind {
        local::KIND => Ok(Arc::new(LocalBackend::new())),
        kubernetes::KIND => Ok(Arc::new(KubernetesBackend::default())),
        external_job::KIND => Ok(Arc::new(ExternalJobBackend::default())),
        memory::KIND => Ok(Arc::new(MemoryBackend::new())),
        other => Err(unknown_kind(other)),
    }
}

/// Like [`create_backend`], but CLI-driven backends use `runner`.
pub fn create_backend_with_runner(
    kind: &str,
    runner: Arc<dyn CommandRunner>,
) -> ContainerResult<Arc<dyn ContainerBackend>> {
    match kind {
        kubernetes::KIND => Ok(Arc::new(KubernetesBackend::new(runner))),
        external_job::KIND => Ok(Arc::new(ExternalJobBackend::new(runner))),
        other => create_backend(other),
    }
}

fn unknown_kind(kind: &str) -> ContainerError {
    ContainerError::Configuration(format!(
        "unknown container backend {kind:?} (expected one of: {})",
        BACKEND_KINDS.join(", ")
    ))
}
