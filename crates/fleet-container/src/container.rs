//! Resource container — backend-agnostic request shaping.
//!
//! The `ResourceContainer` is what a scheduler talks to. It:
//! - Validates resource requests before any backend call
//! - Resolves identity, endpoint, worker arguments and exported environment
//! - Delegates the physical work to a [`ContainerBackend`], bounded by timeouts
//! - Reports status as an explicit [`ObservedStatus`], never as an error

use std::sync::Arc;

use tracing::{debug, info, warn};

use fleet_core::{ContainerProperties, ObservedStatus, Resource, StartupFacts};

use crate::args::{self, StartupArgs};
use crate::backend::{ContainerBackend, ContainerContext, LaunchSpec, TimedOp};
use crate::env;
use crate::error::{ContainerError, ContainerResult};
use crate::registry;

/// A named container bound to one backend.
///
/// Cheap to share behind an `Arc`; all request methods take `&self`.
pub struct ResourceContainer {
    context: Arc<ContainerContext>,
    backend: Arc<dyn ContainerBackend>,
}

impl ResourceContainer {
    /// Initialize a container with its configuration and backend.
    ///
    /// Fails with `ContainerError::Configuration` when `ams.home` or
    /// `ams.optimizing.uri` is absent, or the backend rejects the properties.
    pub fn init(
        name: impl Into<String>,
        properties: ContainerProperties,
        backend: Arc<dyn ContainerBackend>,
    ) -> ContainerResult<Self> {
        let context = build_context(name.into(), properties, backend.as_ref())?;
        info!(
            container = %context.name,
            backend = backend.kind(),
            "resource container initialized"
        );
        Ok(Self {
            context: Arc::new(context),
            backend,
        })
    }

    /// Initialize a container whose backend is selected by registry name.
    pub fn from_kind(
        name: impl Into<String>,
        kind: &str,
        properties: ContainerProperties,
    ) -> ContainerResult<Self> {
        let backend = registry::create_backend(kind)?;
        Self::init(name, properties, backend)
    }

    /// Replace the configuration. Requests already running keep the
    /// configuration they started with.
    pub fn reinit(
        &mut self,
        name: impl Into<String>,
        properties: ContainerProperties,
    ) -> ContainerResult<()> {
        let context = build_context(name.into(), properties, self.backend.as_ref())?;
        info!(container = %context.name, "resource container reconfigured");
        self.context = Arc::new(context);
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.context.name
    }

    pub fn backend_kind(&self) -> &'static str {
        self.backend.kind()
    }

    pub fn context(&self) -> &Arc<ContainerContext> {
        &self.context
    }

    /// Request one worker slot.
    ///
    /// The input resource is not modified; merge the returned facts with
    /// [`Resource::merged_with`]. When the backend does not allocate ids and
    /// the resource has none, the container generates one and reports it
    /// in `StartupFacts::resource_id`. Identity-assigning backends reject
    /// resources that already carry an id.
    pub async fn request_resource(&self, resource: &Resource) -> ContainerResult<StartupFacts> {
        args::validate_resource(resource)?;
        if resource.has_id() && self.backend.assigns_identity() {
            return Err(ContainerError::Validation(format!(
                "backend {} assigns resource ids; request for group {} carries id {}",
                self.backend.kind(),
                resource.group_name,
                resource.resource_id
            )));
        }

        let mut launch_resource = resource.clone();
        let generated_id = if !resource.has_id() && !self.backend.assigns_identity() {
            let id = generate_resource_id();
            launch_resource.resource_id = id.clone();
            Some(id)
        } else {
            None
        };

        let arguments = self.build_startup_arguments(&launch_resource)?;
        let launch = LaunchSpec {
            optimizing_uri: self.optimizing_uri(&launch_resource).to_string(),
            arguments,
            environment: self.exported_variables(),
            resource: launch_resource,
        };

        let known_id = launch
            .resource
            .has_id()
            .then(|| launch.resource.resource_id.clone());
        let label = known_id
            .clone()
            .unwrap_or_else(|| format!("{}/<unassigned>", launch.resource.group_name));
        let timeout = self.backend.scale_out_timeout(&self.context);

        debug!(
            container = %self.context.name,
            resource = %label,
            group = %launch.resource.group_name,
            args = %launch.arguments,
            "scaling out"
        );

        let mut facts = tokio::time::timeout(timeout, self.backend.do_scale_out(&self.context, &launch))
            .await
            .map_err(|_| ContainerError::ScaleOutTimeout {
                resource: label.clone(),
                resource_id: known_id.clone(),
                elapsed: timeout,
            })??;

        if facts.resource_id.as_deref().is_none_or(str::is_empty) {
            facts.resource_id = generated_id.or_else(|| resource.has_id().then(|| resource.resource_id.clone()));
        }

        info!(
            container = %self.context.name,
            resource_id = facts.resource_id.as_deref().unwrap_or(""),
            group = %resource.group_name,
            threads = resource.thread_count,
            "resource scaled out"
        );
        Ok(facts)
    }

    /// Release a worker slot. Unknown or already released ids succeed.
    pub async fn release_resource(&self, resource_id: &str) -> ContainerResult<()> {
        if resource_id.is_empty() {
            return Ok(());
        }
        let timeout = self.backend.terminate_timeout(&self.context);
        tokio::time::timeout(timeout, self.backend.terminate(&self.context, resource_id))
            .await
            .map_err(|_| ContainerError::ReleaseTimeout {
                resource_id: resource_id.to_string(),
                elapsed: timeout,
            })??;
        info!(container = %self.context.name, %resource_id, "resource released");
        Ok(())
    }

    /// Current backend view of a resource. Never fails: ids that were
    /// never requested, unsupported queries and timeouts yield `Unknown`.
    pub async fn get_status(&self, resource_id: &str) -> ObservedStatus {
        if resource_id.is_empty() {
            return ObservedStatus::Unknown;
        }
        let timeout = self.backend.status_timeout(&self.context);
        match tokio::time::timeout(timeout, self.backend.query_status(&self.context, resource_id)).await {
            Ok(status) => status,
            Err(_) => {
                warn!(%resource_id, ?timeout, "status query timed out");
                ObservedStatus::Unknown
            }
        }
    }

    /// `export NAME=value` statements for `export.`-prefixed properties.
    pub fn export_environment(&self) -> Vec<String> {
        env::export_statements(&self.context.properties)
    }

    /// Exported variables as `(NAME, value)` pairs.
    pub fn exported_variables(&self) -> Vec<(String, String)> {
        env::exported_variables(&self.context.properties)
    }

    /// Endpoint for `resource`: its override, else the container default.
    pub fn optimizing_uri<'a>(&'a self, resource: &'a Resource) -> &'a str {
        args::optimizing_uri(&self.context.optimizing_uri, resource)
    }

    /// Worker command line for `resource`. Pure.
    pub fn build_startup_arguments(&self, resource: &Resource) -> ContainerResult<StartupArgs> {
        args::build_startup_arguments(&self.context.optimizing_uri, resource)
    }
}

fn build_context(
    name: String,
    properties: ContainerProperties,
    backend: &dyn ContainerBackend,
) -> ContainerResult<ContainerContext> {
    let context = ContainerContext::new(name, properties)?;
    for op in TimedOp::ALL {
        context.configured_timeout(backend.kind(), op)?;
    }
    backend.validate(&context)?;
    Ok(context)
}

fn generate_resource_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
