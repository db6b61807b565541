//! fleet-container — the resource container abstraction for optimizer workers.
//!
//! A [`ResourceContainer`] turns a [`fleet_core::Resource`] request into a
//! running optimizer worker on some execution backend, reports its status
//! and releases it. The container owns the backend-agnostic parts (worker
//! command line, exported environment, endpoint fallback, identity and
//! timeouts); a [`ContainerBackend`] only creates, queries and terminates
//! compute.
//!
//! Backends are selected by name through [`registry::create_backend`]:
//! `local`, `kubernetes`, `external-job` and `memory`.

pub mod args;
pub mod backend;
pub mod backends;
pub mod command;
pub mod container;
pub mod env;
pub mod error;
pub mod registry;

pub use args::{StartupArgs, build_startup_arguments};
pub use backend::{BoxFuture, ContainerBackend, ContainerContext, LaunchSpec, TimedOp};
pub use command::{CommandOutput, CommandRunner, CommandSpec, ProcessRunner};
pub use container::ResourceContainer;
pub use error::{ContainerError, ContainerResult};
pub use registry::{BACKEND_KINDS, create_backend, create_backend_with_runner};
