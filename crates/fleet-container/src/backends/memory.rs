//! In-process backend — a dry-run target and a scriptable test double.
//!
//! Nothing is launched. Each scale-out records a [`MemoryLaunch`] that
//! reports `Running` until a test kills it, makes it vanish, or the
//! container releases it.

use std::time::Duration;

use tokio::sync::Mutex;
use tracing::debug;

use fleet_core::{ObservedStatus, Resource, StartupFacts, epoch_millis, keys};

use crate::backend::{BoxFuture, ContainerBackend, ContainerContext, LaunchSpec};
use crate::error::{ContainerError, ContainerResult};

pub const KIND: &str = "memory";

/// Fact key: sequence number of the in-memory slot.
pub const SLOT_KEY: &str = "memory.slot";

/// A recorded launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryLaunch {
    pub resource_id: String,
    pub resource: Resource,
    pub optimizing_uri: String,
    /// Rendered worker command line.
    pub arguments: String,
    pub environment: Vec<(String, String)>,
    pub status: ObservedStatus,
}

#[derive(Debug, Default)]
struct MemoryState {
    launches: Vec<MemoryLaunch>,
    next_slot: u64,
    fail_next: Option<String>,
    delay: Option<Duration>,
    terminated: Vec<String>,
}

/// Scriptable in-memory backend.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    assigns_identity: bool,
    reports_status: bool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            reports_status: true,
            ..Self::default()
        }
    }

    /// Allocate ids (`mem-<n>`) instead of letting the container generate them.
    pub fn with_assigned_identity(mut self) -> Self {
        self.assigns_identity = true;
        self
    }

    /// Behave like a backend that has no status query.
    pub fn without_status(mut self) -> Self {
        self.reports_status = false;
        self
    }

    /// Fail the next scale-out with `ScaleOutFailure(message)`.
    pub async fn fail_next_scale_out(&self, message: impl Into<String>) {
        self.state.lock().await.fail_next = Some(message.into());
    }

    /// Sleep this long inside every scale-out, after the slot is recorded.
    pub async fn delay_scale_out(&self, delay: Duration) {
        self.state.lock().await.delay = Some(delay);
    }

    /// Simulate the worker dying.
    pub async fn kill(&self, resource_id: &str) -> bool {
        self.set_status(resource_id, ObservedStatus::Dead).await
    }

    /// Simulate the backend losing track of the worker.
    pub async fn vanish(&self, resource_id: &str) -> bool {
        self.set_status(resource_id, ObservedStatus::Unknown).await
    }

    /// Bring a worker back to `Running`.
    pub async fn revive(&self, resource_id: &str) -> bool {
        self.set_status(resource_id, ObservedStatus::Running).await
    }

    /// All launches that have not been terminated.
    pub async fn launches(&self) -> Vec<MemoryLaunch> {
        self.state.lock().await.launches.clone()
    }

    /// Launches currently reporting `Running`.
    pub async fn running_count(&self) -> usize {
        self.state
            .lock()
            .await
            .launches
            .iter()
            .filter(|l| l.status == ObservedStatus::Running)
            .count()
    }

    /// Ids terminated so far, in order.
    pub async fn terminated(&self) -> Vec<String> {
        self.state.lock().await.terminated.clone()
    }

    async fn set_status(&self, resource_id: &str, status: ObservedStatus) -> bool {
        let mut state = self.state.lock().await;
        match state.launches.iter_mut().find(|l| l.resource_id == resource_id) {
            Some(launch) => {
                launch.status = status;
                true
            }
            None => false,
        }
    }
}

impl ContainerBackend for MemoryBackend {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn assigns_identity(&self) -> bool {
        self.assigns_identity
    }

    fn do_scale_out<'a>(
        &'a self,
        _ctx: &'a ContainerContext,
        launch: &'a LaunchSpec,
    ) -> BoxFuture<'a, ContainerResult<StartupFacts>> {
        Box::pin(async move {
            // The slot exists before the (optional) slow acknowledgement, like
            // a real backend whose compute starts before the call returns.
            let (resource_id, slot, delay) = {
                let mut state = self.state.lock().await;
                if let Some(message) = state.fail_next.take() {
                    return Err(ContainerError::ScaleOutFailure(message));
                }
                state.next_slot += 1;
                let slot = state.next_slot;
                let resource_id = if launch.resource.has_id() {
                    launch.resource.resource_id.clone()
                } else {
                    format!("mem-{slot}")
                };
                state.launches.push(MemoryLaunch {
                    resource_id: resource_id.clone(),
                    resource: launch.resource.clone(),
                    optimizing_uri: launch.optimizing_uri.clone(),
                    arguments: launch.arguments.to_string(),
                    environment: launch.environment.clone(),
                    status: ObservedStatus::Running,
                });
                (resource_id, slot, state.delay)
            };
            debug!(%resource_id, slot, "memory slot launched");

            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            let mut facts = StartupFacts::new()
                .with_property(SLOT_KEY, slot.to_string())
                .with_property(keys::STARTED_AT, epoch_millis().to_string());
            if self.assigns_identity {
                facts.resource_id = Some(resource_id);
            }
            Ok(facts)
        })
    }

    fn terminate<'a>(
        &'a self,
        _ctx: &'a ContainerContext,
        resource_id: &'a str,
    ) -> BoxFuture<'a, ContainerResult<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let before = state.launches.len();
            state.launches.retain(|l| l.resource_id != resource_id);
            if state.launches.len() < before {
                state.terminated.push(resource_id.to_string());
            } else {
                debug!(%resource_id, "terminate of unknown memory slot ignored");
            }
            Ok(())
        })
    }

    fn query_status<'a>(
        &'a self,
        _ctx: &'a ContainerContext,
        resource_id: &'a str,
    ) -> BoxFuture<'a, ObservedStatus> {
        Box::pin(async move {
            if !self.reports_status {
                return ObservedStatus::Unknown;
            }
            self.state
                .lock()
                .await
                .launches
                .iter()
                .find(|l| l.resource_id == resource_id)
                .map(|l| l.status)
                .unwrap_or(ObservedStatus::Unknown)
        })
    }
}
