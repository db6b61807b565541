//! External job scheduler backend (YARN-style application submission).
//!
//! The job scheduler allocates the id, so this backend reports it in the
//! startup facts instead of receiving one. Commands are whitespace-split
//! templates:
//!
//! - `external-job.submit-command` (required): `{home}`, `{group}`,
//!   `{threads}` and a standalone `{args}` token for the worker arguments
//! - `external-job.id-pattern`: regex locating the job id in submit output
//!   (default `application_\d+_\d+`)
//! - `external-job.status-command`: default `yarn application -status {id}`
//! - `external-job.kill-command`: default `yarn application -kill {id}`

use std::sync::Arc;

use regex::Regex;
use tracing::{debug, info, warn};

use fleet_core::{ObservedStatus, StartupFacts, epoch_millis, keys};

use crate::backend::{BoxFuture, ContainerBackend, ContainerContext, LaunchSpec};
use crate::command::{CommandOutput, CommandRunner, CommandSpec, ProcessRunner, expand_template};
use crate::error::{ContainerError, ContainerResult};

pub const KIND: &str = "external-job";

pub const SUBMIT_COMMAND_KEY: &str = "external-job.submit-command";
pub const ID_PATTERN_KEY: &str = "external-job.id-pattern";
pub const STATUS_COMMAND_KEY: &str = "external-job.status-command";
pub const KILL_COMMAND_KEY: &str = "external-job.kill-command";

/// Fact key carrying the scheduler-assigned job id.
pub const JOB_ID_KEY: &str = "external-job.id";

const DEFAULT_ID_PATTERN: &str = r"application_\d+_\d+";
const DEFAULT_STATUS_COMMAND: &str = "yarn application -status {id}";
const DEFAULT_KILL_COMMAND: &str = "yarn application -kill {id}";

pub struct ExternalJobBackend {
    runner: Arc<dyn CommandRunner>,
}

impl Default for ExternalJobBackend {
    fn default() -> Self {
        Self::new(Arc::new(ProcessRunner))
    }
}

impl ExternalJobBackend {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn id_pattern(ctx: &ContainerContext) -> ContainerResult<Regex> {
        let raw = ctx.properties.get_or(ID_PATTERN_KEY, DEFAULT_ID_PATTERN);
        Regex::new(raw).map_err(|e| {
            ContainerError::Configuration(format!("invalid {ID_PATTERN_KEY} {raw:?}: {e}"))
        })
    }

    fn job_command(ctx: &ContainerContext, key: &str, default: &str, job_id: &str) -> Option<CommandSpec> {
        let template = ctx.properties.get_non_empty(key).unwrap_or(default);
        CommandSpec::from_argv(expand_template(
            template,
            &[("id", job_id), ("home", ctx.home.as_str())],
            &[],
        ))
    }
}

/// Map a job scheduler state to an observation.
pub fn job_state_status(state: &str) -> ObservedStatus {
    match state {
        "NEW" | "NEW_SAVING" | "SUBMITTED" | "ACCEPTED" | "RUNNING" => ObservedStatus::Running,
        "FINISHED" | "FAILED" | "KILLED" => ObservedStatus::Dead,
        _ => ObservedStatus::Unknown,
    }
}

/// Extract the `State : X` value from a status report.
pub fn parse_state(report: &str) -> Option<String> {
    let state_re = Regex::new(r"(?im)^\s*state\s*:\s*([A-Z_]+)").ok()?;
    state_re
        .captures(report)
        .map(|caps| caps[1].to_ascii_uppercase())
}

/// Kill output that means the job is already gone.
fn already_gone(output: &CommandOutput) -> bool {
    let text = output.combined().to_ascii_lowercase();
    text.contains("not found")
        || text.contains("doesn't exist")
        || text.contains("does not exist")
        || text.contains("already finished")
        || text.contains("has already")
}

impl ContainerBackend for ExternalJobBackend {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn validate(&self, ctx: &ContainerContext) -> ContainerResult<()> {
        ctx.properties.require(SUBMIT_COMMAND_KEY)?;
        Self::id_pattern(ctx)?;
        Ok(())
    }

    fn assigns_identity(&self) -> bool {
        true
    }

    fn do_scale_out<'a>(
        &'a self,
        ctx: &'a ContainerContext,
        launch: &'a LaunchSpec,
    ) -> BoxFuture<'a, ContainerResult<StartupFacts>> {
        Box::pin(async move {
            let template = ctx.properties.require(SUBMIT_COMMAND_KEY)?;
            let threads = launch.resource.thread_count.to_string();
            let argv = expand_template(
                template,
                &[
                    ("home", ctx.home.as_str()),
                    ("group", launch.group()),
                    ("threads", threads.as_str()),
                ],
                launch.arguments.argv(),
            );
            let spec = CommandSpec::from_argv(argv)
                .ok_or_else(|| {
                    ContainerError::Configuration(format!("{SUBMIT_COMMAND_KEY} is empty"))
                })?
                .envs(&launch.environment);

            let output = self.runner.run(&spec).await.map_err(|e| {
                ContainerError::ScaleOutFailure(format!("failed to run {}: {e}", spec.program))
            })?;
            if !output.success() {
                return Err(ContainerError::ScaleOutFailure(format!(
                    "job submission for group {} exited with {:?}: {}",
                    launch.group(),
                    output.code,
                    output.stderr.trim()
                )));
            }

            let pattern = Self::id_pattern(ctx)?;
            let job_id = pattern
                .find(&output.combined())
                .map(|m| m.as_str().to_string())
                .ok_or_else(|| {
                    ContainerError::ScaleOutFailure(format!(
                        "no job id matching {} in submit output",
                        pattern.as_str()
                    ))
                })?;

            info!(%job_id, group = %launch.group(), "optimizer job submitted");

            Ok(StartupFacts::new()
                .with_resource_id(job_id.clone())
                .with_property(JOB_ID_KEY, job_id)
                .with_property(keys::STARTED_AT, epoch_millis().to_string()))
        })
    }

    fn terminate<'a>(
        &'a self,
        ctx: &'a ContainerContext,
        resource_id: &'a str,
    ) -> BoxFuture<'a, ContainerResult<()>> {
        Box::pin(async move {
            let spec = Self::job_command(ctx, KILL_COMMAND_KEY, DEFAULT_KILL_COMMAND, resource_id)
                .ok_or_else(|| {
                    ContainerError::Configuration(format!("{KILL_COMMAND_KEY} is empty"))
                })?;
            let output = self.runner.run(&spec).await.map_err(|e| {
                ContainerError::TerminateFailure(format!("failed to run {}: {e}", spec.program))
            })?;

            if output.success() {
                debug!(%resource_id, "job killed");
                Ok(())
            } else if already_gone(&output) {
                debug!(%resource_id, "job already gone");
                Ok(())
            } else {
                warn!(%resource_id, stderr = %output.stderr.trim(), "job kill failed");
                Err(ContainerError::TerminateFailure(format!(
                    "kill of {resource_id} exited with {:?}: {}",
                    output.code,
                    output.stderr.trim()
                )))
            }
        })
    }

    fn query_status<'a>(
        &'a self,
        ctx: &'a ContainerContext,
        resource_id: &'a str,
    ) -> BoxFuture<'a, ObservedStatus> {
        Box::pin(async move {
            let Some(spec) =
                Self::job_command(ctx, STATUS_COMMAND_KEY, DEFAULT_STATUS_COMMAND, resource_id)
            else {
                return ObservedStatus::Unknown;
            };
            match self.runner.run(&spec).await {
                Ok(output) if output.success() => parse_state(&output.stdout)
                    .map(|state| job_state_status(&state))
                    .unwrap_or(ObservedStatus::Unknown),
                Ok(output) => {
                    debug!(%resource_id, code = ?output.code, "job status unavailable");
                    ObservedStatus::Unknown
                }
                Err(e) => {
                    warn!(%resource_id, error = %e, "failed to run job status command");
                    ObservedStatus::Unknown
                }
            }
        })
    }
}
