//! Backend contract — the physical side of a resource container.
//!
//! A backend only creates, queries and terminates compute. Argument and
//! environment shaping, identity and timeouts are handled by
//! [`crate::ResourceContainer`], which hands every call the shared
//! [`ContainerContext`].

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use fleet_core::{
    ContainerProperties, ObservedStatus, Resource, StartupFacts, keys, parse_duration,
};

use crate::args::StartupArgs;
use crate::env;
use crate::error::{ContainerError, ContainerResult};

/// Boxed future alias used by the dyn-compatible backend trait.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub const DEFAULT_SCALE_OUT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_TERMINATE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_STATUS_TIMEOUT: Duration = Duration::from_secs(10);

/// Timed backend operations. Each reads `<kind>.<op>-timeout` from the
/// container properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimedOp {
    ScaleOut,
    Terminate,
    Status,
}

impl TimedOp {
    pub const ALL: [TimedOp; 3] = [TimedOp::ScaleOut, TimedOp::Terminate, TimedOp::Status];

    fn suffix(self) -> &'static str {
        match self {
            TimedOp::ScaleOut => "scale-out-timeout",
            TimedOp::Terminate => "terminate-timeout",
            TimedOp::Status => "status-timeout",
        }
    }

    fn default_timeout(self) -> Duration {
        match self {
            TimedOp::ScaleOut => DEFAULT_SCALE_OUT_TIMEOUT,
            TimedOp::Terminate => DEFAULT_TERMINATE_TIMEOUT,
            TimedOp::Status => DEFAULT_STATUS_TIMEOUT,
        }
    }
}

/// Read-only container configuration shared with every backend call.
#[derive(Debug, Clone)]
pub struct ContainerContext {
    pub name: String,
    /// Value of `ams.home`.
    pub home: String,
    /// Container-wide default for `ams.optimizing.uri`.
    pub optimizing_uri: String,
    pub properties: ContainerProperties,
}

impl ContainerContext {
    /// Build a context, failing when `ams.home` or `ams.optimizing.uri` is
    /// missing or an `export.` key names no variable.
    pub fn new(name: impl Into<String>, properties: ContainerProperties) -> ContainerResult<Self> {
        let home = properties.require(keys::AMS_HOME)?.to_string();
        let optimizing_uri = properties.require(keys::AMS_OPTIMIZER_URI)?.to_string();
        env::validate_exports(&properties)?;
        Ok(Self {
            name: name.into(),
            home,
            optimizing_uri,
            properties,
        })
    }

    /// Timeout for `op` on backend `kind`.
    pub fn timeout(&self, kind: &str, op: TimedOp) -> Duration {
        self.configured_timeout(kind, op)
            .ok()
            .flatten()
            .unwrap_or(op.default_timeout())
    }

    /// The configured timeout, `None` when unset, or an error when unparsable.
    pub fn configured_timeout(&self, kind: &str, op: TimedOp) -> ContainerResult<Option<Duration>> {
        let key = format!("{kind}.{}", op.suffix());
        match self.properties.get_non_empty(&key) {
            None => Ok(None),
            Some(raw) => parse_duration(raw).map(Some).ok_or_else(|| {
                ContainerError::Configuration(format!("invalid duration for {key}: {raw:?}"))
            }),
        }
    }
}

/// Everything a backend needs to launch one worker.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// The request. Its id is empty only for identity-assigning backends.
    pub resource: Resource,
    /// Endpoint the worker reports to.
    pub optimizing_uri: String,
    pub arguments: StartupArgs,
    /// Exported variables, `(NAME, value)`.
    pub environment: Vec<(String, String)>,
}

impl LaunchSpec {
    pub fn resource_id(&self) -> &str {
        &self.resource.resource_id
    }

    pub fn group(&self) -> &str {
        &self.resource.group_name
    }
}

/// One execution backend (local process, Kubernetes pod, external job...).
///
/// Implementations must be safe to call concurrently for different
/// resources. They never retry on their own.
pub trait ContainerBackend: Send + Sync {
    /// Registry name, also the prefix of backend-specific property keys.
    fn kind(&self) -> &'static str;

    /// Check backend-specific configuration at container init.
    fn validate(&self, _ctx: &ContainerContext) -> ContainerResult<()> {
        Ok(())
    }

    /// Whether the backend allocates resource ids itself. When false the
    /// container generates one before scale-out.
    fn assigns_identity(&self) -> bool {
        false
    }

    /// Bound on `do_scale_out` (`<kind>.scale-out-timeout`).
    fn scale_out_timeout(&self, ctx: &ContainerContext) -> Duration {
        ctx.timeout(self.kind(), TimedOp::ScaleOut)
    }

    /// Bound on `terminate` (`<kind>.terminate-timeout`).
    fn terminate_timeout(&self, ctx: &ContainerContext) -> Duration {
        ctx.timeout(self.kind(), TimedOp::Terminate)
    }

    /// Bound on `query_status` (`<kind>.status-timeout`).
    fn status_timeout(&self, ctx: &ContainerContext) -> Duration {
        ctx.timeout(self.kind(), TimedOp::Status)
    }

    /// Create the compute unit and report what was observed.
    fn do_scale_out<'a>(
        &'a self,
        ctx: &'a ContainerContext,
        launch: &'a LaunchSpec,
    ) -> BoxFuture<'a, ContainerResult<StartupFacts>>;

    /// Best-effort termination. Unknown or already-dead ids are not errors.
    fn terminate<'a>(
        &'a self,
        ctx: &'a ContainerContext,
        resource_id: &'a str,
    ) -> BoxFuture<'a, ContainerResult<()>>;

    /// Live status. Backends without a status query keep this default.
    fn query_status<'a>(
        &'a self,
        _ctx: &'a ContainerContext,
        _resource_id: &'a str,
    ) -> BoxFuture<'a, ObservedStatus> {
        Box::pin(async { ObservedStatus::Unknown })
    }
}
