//! Local backend — one child process per resource on this host.
//!
//! The worker is started as `<launcher> <startup args>` with the exported
//! variables in its environment and stdout/stderr appended to a per-resource
//! log file. Child handles are kept only to answer status and terminate;
//! dropping the backend kills every worker it still holds.
//!
//! Properties:
//! - `local.launcher`: worker executable (default `<ams.home>/bin/optimizer.sh`)
//! - `local.log-dir`: log directory (default `<ams.home>/logs`)

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::fs::OpenOptions;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use fleet_core::{ObservedStatus, StartupFacts, epoch_millis, keys};

use crate::backend::{BoxFuture, ContainerBackend, ContainerContext, LaunchSpec};
use crate::error::{ContainerError, ContainerResult};

pub const KIND: &str = "local";

pub const LAUNCHER_KEY: &str = "local.launcher";
pub const LOG_DIR_KEY: &str = "local.log-dir";

/// Fact keys reported after scale-out.
pub const PID_KEY: &str = "local.pid";
pub const LOG_FILE_KEY: &str = "local.log-file";

/// Spawns optimizer workers as local child processes.
#[derive(Debug, Default)]
pub struct LocalBackend {
    /// resource_id → running (or exited, not yet released) child.
    children: Mutex<HashMap<String, Child>>,
}

impl LocalBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn launcher(ctx: &ContainerContext) -> String {
        ctx.properties
            .get_non_empty(LAUNCHER_KEY)
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}/bin/optimizer.sh", ctx.home))
    }

    fn log_dir(ctx: &ContainerContext) -> PathBuf {
        ctx.properties
            .get_non_empty(LOG_DIR_KEY)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(&ctx.home).join("logs"))
    }
}

impl ContainerBackend for LocalBackend {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn do_scale_out<'a>(
        &'a self,
        ctx: &'a ContainerContext,
        launch: &'a LaunchSpec,
    ) -> BoxFuture<'a, ContainerResult<StartupFacts>> {
        Box::pin(async move {
            let resource_id = launch.resource_id();

            let launcher = Self::launcher(ctx);
            let log_dir = Self::log_dir(ctx);
            tokio::fs::create_dir_all(&log_dir).await?;
            let log_path = log_dir.join(format!(
                "optimizer-{}-{}.log",
                launch.group(),
                resource_id
            ));
            let stdout = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_path)
                .await?
                .into_std()
                .await;
            let stderr = stdout.try_clone()?;

            // Held from the duplicate check until the child is stored: there is
            // no await between spawn and insert, so a cancelled scale-out never
            // leaves a process without a handle.
            let mut children = self.children.lock().await;
            if let Some(existing) = children.get_mut(resource_id)
                && matches!(existing.try_wait(), Ok(None))
            {
                return Err(ContainerError::ScaleOutFailure(format!(
                    "resource {resource_id} already has a running process"
                )));
            }

            let child = Command::new(&launcher)
                .args(launch.arguments.argv())
                .envs(
                    launch
                        .environment
                        .iter()
                        .map(|(k, v)| (k.as_str(), v.as_str())),
                )
                .stdin(Stdio::null())
                .stdout(Stdio::from(stdout))
                .stderr(Stdio::from(stderr))
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| {
                    ContainerError::ScaleOutFailure(format!("failed to spawn {launcher}: {e}"))
                })?;

            let pid = child.id().unwrap_or_default();
            children.insert(resource_id.to_string(), child);
            drop(children);

            info!(%resource_id, pid, %launcher, log = %log_path.display(), "local optimizer started");

            Ok(StartupFacts::new()
                .with_property(PID_KEY, pid.to_string())
                .with_property(LOG_FILE_KEY, log_path.display().to_string())
                .with_property(keys::STARTED_AT, epoch_millis().to_string()))
        })
    }

    fn terminate<'a>(
        &'a self,
        _ctx: &'a ContainerContext,
        resource_id: &'a str,
    ) -> BoxFuture<'a, ContainerResult<()>> {
        Box::pin(async move {
            let mut children = self.children.lock().await;
            let Some(child) = children.get_mut(resource_id) else {
                debug!(%resource_id, "no local process to terminate");
                return Ok(());
            };

            if let Ok(Some(status)) = child.try_wait() {
                debug!(%resource_id, %status, "local process already exited");
            } else if let Err(e) = child.kill().await {
                // Keep the handle so a later release can try again.
                warn!(%resource_id, error = %e, "failed to kill local process");
                return Err(ContainerError::TerminateFailure(format!(
                    "kill {resource_id}: {e}"
                )));
            }
            children.remove(resource_id);
            Ok(())
        })
    }

    fn query_status<'a>(
        &'a self,
        _ctx: &'a ContainerContext,
        resource_id: &'a str,
    ) -> BoxFuture<'a, ObservedStatus> {
        Box::pin(async move {
            let mut children = self.children.lock().await;
            let Some(child) = children.get_mut(resource_id) else {
                return ObservedStatus::Unknown;
            };
            match child.try_wait() {
                Ok(None) => ObservedStatus::Running,
                Ok(Some(status)) => {
                    debug!(%resource_id, %status, "local process exited");
                    ObservedStatus::Dead
                }
                Err(e) => {
                    warn!(%resource_id, error = %e, "failed to poll local process");
                    ObservedStatus::Unknown
                }
            }
        })
    }
}
