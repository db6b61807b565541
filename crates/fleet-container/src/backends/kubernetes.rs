//! Kubernetes backend — one Pod per resource, driven through `kubectl`.
//!
//! Properties:
//! - `kubernetes.image` (required): worker image
//! - `kubernetes.namespace`: target namespace (default `default`)
//! - `kubernetes.kubeconfig`: passed as `--kubeconfig` when set
//! - `kubernetes.kubectl`: kubectl binary (default `kubectl`)
//! - `kubernetes.launcher`: entrypoint inside the image (default `<ams.home>/bin/optimizer.sh`)
//! - `kubernetes.cpu` / `kubernetes.memory`: resource limits and requests

use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{debug, info, warn};

use fleet_core::{ObservedStatus, StartupFacts, epoch_millis, keys};

use crate::backend::{BoxFuture, ContainerBackend, ContainerContext, LaunchSpec};
use crate::command::{CommandOutput, CommandRunner, CommandSpec, ProcessRunner};
use crate::error::{ContainerError, ContainerResult};

pub const KIND: &str = "kubernetes";

pub const IMAGE_KEY: &str = "kubernetes.image";
pub const NAMESPACE_KEY: &str = "kubernetes.namespace";
pub const KUBECONFIG_KEY: &str = "kubernetes.kubeconfig";
pub const KUBECTL_KEY: &str = "kubernetes.kubectl";
pub const LAUNCHER_KEY: &str = "kubernetes.launcher";
pub const CPU_KEY: &str = "kubernetes.cpu";
pub const MEMORY_KEY: &str = "kubernetes.memory";

/// Fact keys reported after scale-out.
pub const POD_NAME_KEY: &str = "kubernetes.pod-name";
pub const POD_NAMESPACE_KEY: &str = "kubernetes.namespace";

const DEFAULT_NAMESPACE: &str = "default";
const POD_NAME_PREFIX: &str = "optimizer-";
const MAX_NAME_LEN: usize = 63;
const DIGEST_LEN: usize = 8;

pub struct KubernetesBackend {
    runner: Arc<dyn CommandRunner>,
}

impl Default for KubernetesBackend {
    fn default() -> Self {
        Self::new(Arc::new(ProcessRunner))
    }
}

impl KubernetesBackend {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn namespace(ctx: &ContainerContext) -> &str {
        ctx.properties.get_or(NAMESPACE_KEY, DEFAULT_NAMESPACE)
    }

    /// `kubectl [--kubeconfig <path>] -n <namespace>` prefix for every call.
    fn kubectl(ctx: &ContainerContext) -> CommandSpec {
        let mut spec = CommandSpec::new(ctx.properties.get_or(KUBECTL_KEY, "kubectl"));
        if let Some(kubeconfig) = ctx.properties.get_non_empty(KUBECONFIG_KEY) {
            spec = spec.args(["--kubeconfig", kubeconfig]);
        }
        spec.args(["-n", Self::namespace(ctx)])
    }

    async fn run(&self, spec: &CommandSpec) -> std::io::Result<CommandOutput> {
        self.runner.run(spec).await
    }
}

/// Pod name for a resource id: lowercase alphanumerics and `-`, at most 63 chars.
///
/// Ids that are already valid name segments map verbatim. Any other id
/// (rewritten characters, too long, trailing `-`) gets a digest of the raw
/// id appended, so distinct ids never share a Pod.
pub fn pod_name(resource_id: &str) -> String {
    let sanitized = sanitize(resource_id);
    let plain = format!("{POD_NAME_PREFIX}{sanitized}");
    if sanitized == resource_id && plain.len() <= MAX_NAME_LEN && !plain.ends_with('-') {
        return plain;
    }

    let digest = uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, resource_id.as_bytes())
        .simple()
        .to_string();
    let mut name = plain;
    name.truncate(MAX_NAME_LEN - DIGEST_LEN - 1);
    format!("{}-{}", name.trim_end_matches('-'), &digest[..DIGEST_LEN])
}

/// Label values allow `[a-z0-9A-Z._-]`, at most 63 chars, alphanumeric at both ends.
fn label_value(raw: &str) -> String {
    let mut value: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect();
    value.truncate(MAX_NAME_LEN);
    value
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect()
}

/// Render the Pod manifest for `launch`.
pub fn pod_manifest(ctx: &ContainerContext, launch: &LaunchSpec) -> ContainerResult<Value> {
    let image = ctx.properties.require(IMAGE_KEY)?;
    let launcher = ctx
        .properties
        .get_non_empty(LAUNCHER_KEY)
        .map(str::to_string)
        .unwrap_or_else(|| format!("{}/bin/optimizer.sh", ctx.home));

    let mut command = vec![launcher];
    command.extend(launch.arguments.argv().iter().cloned());

    let env: Vec<Value> = launch
        .environment
        .iter()
        .map(|(name, value)| json!({ "name": name, "value": value }))
        .collect();

    let mut limits = serde_json::Map::new();
    if let Some(cpu) = ctx.properties.get_non_empty(CPU_KEY) {
        limits.insert("cpu".into(), json!(cpu));
    }
    if let Some(memory) = ctx.properties.get_non_empty(MEMORY_KEY) {
        limits.insert("memory".into(), json!(memory));
    }

    Ok(json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": pod_name(launch.resource_id()),
            "namespace": KubernetesBackend::namespace(ctx),
            "labels": {
                "app": "optimizer",
                "optimizer/container": label_value(&ctx.name),
                "optimizer/group": label_value(launch.group()),
                "optimizer/resource-id": label_value(launch.resource_id()),
            },
        },
        "spec": {
            "restartPolicy": "Never",
            "containers": [{
                "name": "optimizer",
                "image": image,
                "command": command,
                "env": env,
                "resources": {
                    "limits": Value::Object(limits.clone()),
                    "requests": Value::Object(limits),
                },
            }],
        },
    }))
}

/// Map a Pod phase to an observation.
pub fn phase_status(phase: &str) -> ObservedStatus {
    match phase.trim() {
        "Pending" | "Running" => ObservedStatus::Running,
        "Succeeded" | "Failed" => ObservedStatus::Dead,
        _ => ObservedStatus::Unknown,
    }
}

impl ContainerBackend for KubernetesBackend {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn validate(&self, ctx: &ContainerContext) -> ContainerResult<()> {
        ctx.properties.require(IMAGE_KEY)?;
        Ok(())
    }

    fn do_scale_out<'a>(
        &'a self,
        ctx: &'a ContainerContext,
        launch: &'a LaunchSpec,
    ) -> BoxFuture<'a, ContainerResult<StartupFacts>> {
        Box::pin(async move {
            let manifest = pod_manifest(ctx, launch)?;
            let name = pod_name(launch.resource_id());
            let namespace = Self::namespace(ctx);

            let spec = Self::kubectl(ctx)
                .args(["apply", "-f", "-"])
                .stdin(manifest.to_string());
            let output = self.run(&spec).await.map_err(|e| {
                ContainerError::ScaleOutFailure(format!("failed to run kubectl: {e}"))
            })?;
            if !output.success() {
                return Err(ContainerError::ScaleOutFailure(format!(
                    "kubectl apply for pod {name} failed: {}",
                    output.stderr.trim()
                )));
            }

            info!(resource_id = %launch.resource_id(), pod = %name, %namespace, "optimizer pod created");

            Ok(StartupFacts::new()
                .with_property(POD_NAME_KEY, name)
                .with_property(POD_NAMESPACE_KEY, namespace)
                .with_property(keys::STARTED_AT, epoch_millis().to_string()))
        })
    }

    fn terminate<'a>(
        &'a self,
        ctx: &'a ContainerContext,
        resource_id: &'a str,
    ) -> BoxFuture<'a, ContainerResult<()>> {
        Box::pin(async move {
            let name = pod_name(resource_id);
            let spec = Self::kubectl(ctx).args(["delete", "pod", name.as_str(), "--ignore-not-found"]);
            let output = self.run(&spec).await.map_err(|e| {
                ContainerError::TerminateFailure(format!("failed to run kubectl: {e}"))
            })?;
            if !output.success() {
                warn!(%resource_id, pod = %name, stderr = %output.stderr.trim(), "pod delete failed");
                return Err(ContainerError::TerminateFailure(format!(
                    "kubectl delete pod {name} failed: {}",
                    output.stderr.trim()
                )));
            }
            debug!(%resource_id, pod = %name, "pod deleted");
            Ok(())
        })
    }

    fn query_status<'a>(
        &'a self,
        ctx: &'a ContainerContext,
        resource_id: &'a str,
    ) -> BoxFuture<'a, ObservedStatus> {
        Box::pin(async move {
            let name = pod_name(resource_id);
            let spec = Self::kubectl(ctx).args([
                "get",
                "pod",
                name.as_str(),
                "-o",
                "jsonpath={.status.phase}",
            ]);
            match self.run(&spec).await {
                Ok(output) if output.success() => phase_status(&output.stdout),
                Ok(output) => {
                    debug!(%resource_id, pod = %name, stderr = %output.stderr.trim(), "pod not found");
                    ObservedStatus::Unknown
                }
                Err(e) => {
                    warn!(%resource_id, error = %e, "failed to run kubectl");
                    ObservedStatus::Unknown
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use fleet_core::{ContainerProperties, Resource};

    use super::*;
    use crate::args::build_startup_arguments;

    /// Records every command and replays scripted outputs.
    #[derive(Default)]
    struct RecordingRunner {
        calls: Mutex<Vec<CommandSpec>>,
        replies: Mutex<VecDeque<CommandOutput>>,
    }

    impl RecordingRunner {
        fn reply(&self, code: i32, stdout: &str, stderr: &str) {
            self.replies.lock().unwrap().push_back(CommandOutput {
                code: Some(code),
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            });
        }

        fn calls(&self) -> Vec<CommandSpec> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl CommandRunner for RecordingRunner {
        fn run<'a>(&'a self, spec: &'a CommandSpec) -> BoxFuture<'a, std::io::Result<CommandOutput>> {
            self.calls.lock().unwrap().push(spec.clone());
            let reply = self.replies.lock().unwrap().pop_front().unwrap_or(CommandOutput {
                code: Some(0),
                ..CommandOutput::default()
            });
            Box::pin(async move { Ok(reply) })
        }
    }

    fn ctx(extra: &[(&str, &str)]) -> ContainerContext {
        let mut props = vec![
            (keys::AMS_HOME, "/opt/ams"),
            (keys::AMS_OPTIMIZER_URI, "thrift://ams:1260"),
            (IMAGE_KEY, "registry/optimizer:1.0"),
            ("export.JAVA_HOME", "/usr/lib/jvm"),
        ];
        props.extend_from_slice(extra);
        ContainerContext::new("k8s", ContainerProperties::from_iter(props)).unwrap()
    }

    fn launch(id: &str) -> LaunchSpec {
        let resource = Resource::new("Group_A", 4).with_id(id);
        LaunchSpec {
            arguments: build_startup_arguments("thrift://ams:1260", &resource).unwrap(),
            optimizing_uri: "thrift://ams:1260".to_string(),
            environment: vec![("JAVA_HOME".to_string(), "/usr/lib/jvm".to_string())],
            resource,
        }
    }

    fn dns_safe(name: &str) -> bool {
        name.len() <= MAX_NAME_LEN
            && name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            && !name.ends_with('-')
    }

    #[test]
    fn pod_names_are_dns_safe() {
        assert_eq!(pod_name("a8f0c2d1"), "optimizer-a8f0c2d1");
        assert_eq!(pod_name("worker-1"), "optimizer-worker-1");

        let rewritten = pod_name("Res_ID.1");
        assert!(rewritten.starts_with("optimizer-res-id-1-"));
        assert_eq!(rewritten.len(), "optimizer-res-id-1-".len() + DIGEST_LEN);
        assert_eq!(rewritten, pod_name("Res_ID.1"));

        let long = pod_name(&"x".repeat(100));
        assert_eq!(long.len(), 63);
        for name in [rewritten, long, pod_name("ends-"), pod_name("ünïcode")] {
            assert!(dns_safe(&name), "{name}");
        }
        assert_eq!(label_value("-Group A!-"), "Group-A");
    }

    #[test]
    fn distinct_ids_get_distinct_pods() {
        let ids = [
            "worker.1".to_string(),
            "worker-1".to_string(),
            "Worker_1".to_string(),
            "worker_1".to_string(),
            "worker-1-".to_string(),
            format!("{}a", "w".repeat(60)),
            format!("{}b", "w".repeat(60)),
        ];
        let names: std::collections::HashSet<String> = ids.iter().map(|id| pod_name(id)).collect();
        assert_eq!(names.len(), ids.len());
    }

    #[test]
    fn manifest_carries_image_command_env_and_limits() {
        let ctx = ctx(&[(NAMESPACE_KEY, "opt"), (CPU_KEY, "2"), (MEMORY_KEY, "4Gi")]);
        let manifest = pod_manifest(&ctx, &launch("r1")).unwrap();

        assert_eq!(manifest["metadata"]["name"], "optimizer-r1");
        assert_eq!(manifest["metadata"]["namespace"], "opt");
        assert_eq!(manifest["metadata"]["labels"]["optimizer/group"], "Group_A");
        let container = &manifest["spec"]["containers"][0];
        assert_eq!(container["image"], "registry/optimizer:1.0");
        assert_eq!(
            container["command"],
            json!([
                "/opt/ams/bin/optimizer.sh", "-a", "thrift://ams:1260", "-p", "4", "-g", "Group_A",
                "-id", "r1"
            ])
        );
        assert_eq!(container["env"][0]["name"], "JAVA_HOME");
        assert_eq!(container["resources"]["limits"]["memory"], "4Gi");
        assert_eq!(container["resources"]["requests"]["cpu"], "2");
    }

    #[test]
    fn image_is_required() {
        let props = ContainerProperties::from_iter([
            (keys::AMS_HOME, "/opt/ams"),
            (keys::AMS_OPTIMIZER_URI, "thrift://ams:1260"),
        ]);
        let ctx = ContainerContext::new("k8s", props).unwrap();
        assert!(matches!(
            KubernetesBackend::default().validate(&ctx),
            Err(ContainerError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn scale_out_applies_manifest() {
        let runner = Arc::new(RecordingRunner::default());
        let backend = KubernetesBackend::new(runner.clone());
        let ctx = ctx(&[(KUBECONFIG_KEY, "/etc/kube/config")]);

        let facts = backend.do_scale_out(&ctx, &launch("r1")).await.unwrap();
        assert_eq!(facts.get(POD_NAME_KEY), Some("optimizer-r1"));
        assert_eq!(facts.get(POD_NAMESPACE_KEY), Some("default"));
        assert!(facts.resource_id.is_none());

        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0].display(),
            "kubectl --kubeconfig /etc/kube/config -n default apply -f -"
        );
        let applied: Value = serde_json::from_str(calls[0].stdin.as_deref().unwrap()).unwrap();
        assert_eq!(applied["kind"], "Pod");
    }

    #[tokio::test]
    async fn failed_apply_is_scale_out_failure() {
        let runner = Arc::new(RecordingRunner::default());
        runner.reply(1, "", "forbidden: exceeded quota");
        let backend = KubernetesBackend::new(runner);
        let err = backend.do_scale_out(&ctx(&[]), &launch("r1")).await.unwrap_err();
        assert!(matches!(err, ContainerError::ScaleOutFailure(ref m) if m.contains("exceeded quota")));
    }

    #[tokio::test]
    async fn status_follows_pod_phase() {
        let runner = Arc::new(RecordingRunner::default());
        runner.reply(0, "Pending", "");
        runner.reply(0, "Running", "");
        runner.reply(0, "Failed", "");
        runner.reply(1, "", "Error from server (NotFound): pods \"optimizer-r1\" not found");
        let backend = KubernetesBackend::new(runner.clone());
        let ctx = ctx(&[]);

        assert_eq!(backend.query_status(&ctx, "r1").await, ObservedStatus::Running);
        assert_eq!(backend.query_status(&ctx, "r1").await, ObservedStatus::Running);
        assert_eq!(backend.query_status(&ctx, "r1").await, ObservedStatus::Dead);
        assert_eq!(backend.query_status(&ctx, "r1").await, ObservedStatus::Unknown);
        assert_eq!(
            runner.calls()[0].display(),
            "kubectl -n default get pod optimizer-r1 -o jsonpath={.status.phase}"
        );
    }

    #[tokio::test]
    async fn terminate_ignores_missing_pods() {
        let runner = Arc::new(RecordingRunner::default());
        let backend = KubernetesBackend::new(runner.clone());
        backend.terminate(&ctx(&[]), "r1").await.unwrap();
        assert_eq!(
            runner.calls()[0].display(),
            "kubectl -n default delete pod optimizer-r1 --ignore-not-found"
        );

        runner.reply(1, "", "connection refused");
        assert!(matches!(
            backend.terminate(&ctx(&[]), "r1").await,
            Err(ContainerError::TerminateFailure(_))
        ));
    }

    #[test]
    fn phases() {
        assert_eq!(phase_status("Succeeded"), ObservedStatus::Dead);
        assert_eq!(phase_status(""), ObservedStatus::Unknown);
        assert_eq!(phase_status("Unknown"), ObservedStatus::Unknown);
    }
}
