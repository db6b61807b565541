//! Concrete execution backends.

pub mod external_job;
pub mod kubernetes;
pub mod local;
pub mod memory;

pub use external_job::ExternalJobBackend;
pub use kubernetes::KubernetesBackend;
pub use local::LocalBackend;
pub use memory::MemoryBackend;
