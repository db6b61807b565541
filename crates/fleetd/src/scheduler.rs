//! Static-parallelism scheduler: keeps each configured group at its
//! worker count and answers the reconciler's replacement requests.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use fleet_container::ContainerError;
use fleet_core::{GroupSection, Resource, ResourceId, ResourceStatus};
use fleet_reconcile::{Reconciler, ReplacementRequest};

pub struct GroupScheduler {
    reconciler: Arc<Reconciler>,
    /// group name → configuration.
    groups: BTreeMap<String, GroupSection>,
}

impl GroupScheduler {
    pub fn new(reconciler: Arc<Reconciler>, groups: Vec<GroupSection>) -> Self {
        Self {
            reconciler,
            groups: groups.into_iter().map(|g| (g.name.clone(), g)).collect(),
        }
    }

    /// Register group targets and launch every group's workers.
    /// Returns the number of workers launched; failures are logged.
    pub async fn start(&self) -> usize {
        let mut launched = 0;
        for group in self.groups.values() {
            self.reconciler
                .set_target(group.name.as_str(), group.parallelism)
                .await;
            launched += self.launch_many(group, group.parallelism).await;
        }
        info!(launched, groups = self.groups.len(), "initial scale-out finished");
        launched
    }

    /// Launch `request.missing` workers for the requested group. Launches
    /// that fail are handed back to the reconciler, which asks again on a
    /// later round while the group is below target.
    pub async fn replace(&self, request: ReplacementRequest) -> usize {
        let Some(group) = self.groups.get(&request.group) else {
            warn!(group = %request.group, "replacement requested for unknown group");
            self.reconciler
                .replacements_abandoned(&request.group, request.missing)
                .await;
            return 0;
        };
        let launched = self.launch_many(group, request.missing).await;
        let failed = request.missing.saturating_sub(launched as u32);
        self.reconciler
            .replacements_abandoned(&group.name, failed)
            .await;
        launched
    }

    /// Answer replacement requests until `shutdown` fires or the channel closes.
    pub async fn serve(
        &self,
        mut requests: mpsc::UnboundedReceiver<ReplacementRequest>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                request = requests.recv() => {
                    let Some(request) = request else {
                        debug!("replacement channel closed");
                        break;
                    };
                    self.replace(request).await;
                }
                _ = shutdown.changed() => {
                    debug!("scheduler shutting down");
                    break;
                }
            }
        }
    }

    async fn launch_many(&self, group: &GroupSection, count: u32) -> usize {
        let mut launched = 0;
        for _ in 0..count {
            match self.launch(group).await {
                Ok(resource_id) => {
                    debug!(%resource_id, group = %group.name, "worker launched");
                    launched += 1;
                }
                Err(e) => warn!(group = %group.name, error = %e, "worker launch failed"),
            }
        }
        launched
    }

    async fn launch(&self, group: &GroupSection) -> anyhow::Result<ResourceId> {
        let request = group.resource();
        let container = self.reconciler.container();
        let facts = match container.request_resource(&request).await {
            Ok(facts) => facts,
            Err(ContainerError::ScaleOutTimeout {
                resource_id: Some(resource_id),
                elapsed,
                ..
            }) => {
                // The worker may have started under this id; do not leave it behind.
                self.reclaim_timed_out(&request, resource_id).await;
                anyhow::bail!("scale-out for group {} timed out after {elapsed:?}", group.name);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("scale-out for group {}", group.name));
            }
        };
        let resource = request.merged_with(&facts);
        let resource_id = resource.resource_id.clone();
        self.reconciler.track(resource).await?;
        Ok(resource_id)
    }

    /// Release whatever a timed-out scale-out may have started. When the
    /// release fails too, the resource is tracked as dead so the reconciler
    /// keeps retrying it.
    async fn reclaim_timed_out(&self, request: &Resource, resource_id: ResourceId) {
        match self.reconciler.container().release_resource(&resource_id).await {
            Ok(()) => debug!(%resource_id, group = %request.group_name, "timed-out scale-out released"),
            Err(e) => {
                warn!(%resource_id, error = %e, "release after scale-out timeout failed, handing to reconciler");
                let mut dead = request.clone().with_id(resource_id);
                dead.status = ResourceStatus::Dead;
                if let Err(e) = self.reconciler.track(dead).await {
                    warn!(error = %e, "could not track timed-out resource");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use fleet_container::ResourceContainer;
    use fleet_container::backends::MemoryBackend;
    use fleet_core::{ContainerProperties, keys};
    use fleet_reconcile::ReconcilerConfig;

    use super::*;

    fn group(name: &str, parallelism: u32) -> GroupSection {
        GroupSection {
            name: name.to_string(),
            parallelism,
            thread_count: 2,
            properties: HashMap::new(),
        }
    }

    fn scheduler(backend: Arc<MemoryBackend>, groups: Vec<GroupSection>) -> GroupScheduler {
        scheduler_with(backend, groups, &[])
    }

    fn scheduler_with(
        backend: Arc<MemoryBackend>,
        groups: Vec<GroupSection>,
        extra: &[(&str, &str)],
    ) -> GroupScheduler {
        let mut props = vec![
            (keys::AMS_HOME, "/opt/ams"),
            (keys::AMS_OPTIMIZER_URI, "thrift://ams:1260"),
        ];
        props.extend_from_slice(extra);
        let props = ContainerProperties::from_iter(props);
        let container = Arc::new(ResourceContainer::init("test", props, backend).unwrap());
        let reconciler = Arc::new(Reconciler::new(container, ReconcilerConfig::default()));
        GroupScheduler::new(reconciler, groups)
    }

    #[tokio::test]
    async fn start_fills_every_group() {
        let backend = Arc::new(MemoryBackend::new());
        let s = scheduler(backend.clone(), vec![group("a", 2), group("b", 1)]);
        assert_eq!(s.start().await, 3);
        assert_eq!(backend.running_count().await, 3);
        assert_eq!(s.reconciler.target("a").await, Some(2));
        assert_eq!(s.reconciler.live_count("b").await, 1);
    }

    #[tokio::test]
    async fn failed_launch_is_not_tracked() {
        let backend = Arc::new(MemoryBackend::new());
        backend.fail_next_scale_out("no capacity").await;
        let s = scheduler(backend.clone(), vec![group("a", 2)]);
        assert_eq!(s.start().await, 1);
        assert_eq!(s.reconciler.tracked().await.len(), 1);
    }

    #[tokio::test]
    async fn failed_initial_launch_is_made_up_later() {
        let backend = Arc::new(MemoryBackend::new());
        backend.fail_next_scale_out("no capacity").await;
        let s = scheduler(backend.clone(), vec![group("a", 2)]);
        assert_eq!(s.start().await, 1);

        let report = s.reconciler.reconcile_once().await;
        assert_eq!(
            report.replacements,
            vec![ReplacementRequest {
                group: "a".to_string(),
                missing: 1
            }]
        );
        assert_eq!(s.replace(report.replacements[0].clone()).await, 1);
        assert_eq!(s.reconciler.live_count("a").await, 2);
        assert_eq!(s.reconciler.in_flight("a").await, 0);
        assert!(s.reconciler.reconcile_once().await.replacements.is_empty());
    }

    #[tokio::test]
    async fn failed_replacement_is_requested_again() {
        let backend = Arc::new(MemoryBackend::new());
        let s = scheduler(backend.clone(), vec![group("a", 1)]);
        s.reconciler.set_target("a", 1).await;

        let request = s.reconciler.reconcile_once().await.replacements.remove(0);
        backend.fail_next_scale_out("no capacity").await;
        assert_eq!(s.replace(request).await, 0);
        assert_eq!(s.reconciler.in_flight("a").await, 0);

        let again = s.reconciler.reconcile_once().await.replacements;
        assert_eq!(again.len(), 1);
        assert_eq!(s.replace(again[0].clone()).await, 1);
        assert_eq!(backend.running_count().await, 1);
    }

    #[tokio::test]
    async fn timed_out_launch_is_released() {
        let backend = Arc::new(MemoryBackend::new());
        backend.delay_scale_out(std::time::Duration::from_secs(30)).await;
        let s = scheduler_with(
            backend.clone(),
            vec![group("a", 1)],
            &[("memory.scale-out-timeout", "20ms")],
        );
        assert_eq!(s.start().await, 0);

        // The slot had started under the generated id; it is gone again.
        let terminated = backend.terminated().await;
        assert_eq!(terminated.len(), 1);
        assert_eq!(terminated[0].len(), 32);
        assert!(backend.launches().await.is_empty());
        assert!(s.reconciler.tracked().await.is_empty());
    }

    #[tokio::test]
    async fn replacements_for_known_groups_only() {
        let backend = Arc::new(MemoryBackend::new());
        let s = scheduler(backend.clone(), vec![group("a", 1)]);
        let launched = s
            .replace(ReplacementRequest {
                group: "a".to_string(),
                missing: 2,
            })
            .await;
        assert_eq!(launched, 2);
        let ignored = s
            .replace(ReplacementRequest {
                group: "zzz".to_string(),
                missing: 1,
            })
            .await;
        assert_eq!(ignored, 0);
    }

    #[tokio::test]
    async fn serve_handles_requests_until_channel_closes() {
        let backend = Arc::new(MemoryBackend::new());
        let s = scheduler(backend.clone(), vec![group("a", 1)]);
        let (tx, rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        tx.send(ReplacementRequest {
            group: "a".to_string(),
            missing: 1,
        })
        .unwrap();
        drop(tx);

        s.serve(rx, shutdown_rx).await;
        assert_eq!(backend.running_count().await, 1);
    }
}
