//! Status reconciler — periodic polling, reclamation and replacement.
//!
//! Each round queries every tracked resource concurrently, feeds the
//! observation into that resource's [`StatusTracker`] and acts on the
//! verdict. A resource declared dead is released through the container
//! and untracked; a failed release leaves it tracked as `Dead` and is
//! retried on the next round without querying it again.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use fleet_container::{BoxFuture, ResourceContainer};
use fleet_core::{ObservedStatus, ReconcilerSection, Resource, ResourceId, ResourceStatus};

use crate::error::{ReconcileError, ReconcileResult};
use crate::tracker::{Liveness, StatusTracker};

/// Asks the scheduler for `missing` new workers in `group`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplacementRequest {
    pub group: String,
    pub missing: u32,
}

/// Callback invoked once per replacement request.
///
/// The scheduler typically forwards the request to its own task; the
/// reconciler awaits the returned future before continuing the round.
pub type ReplacementCallback = Arc<dyn Fn(ReplacementRequest) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct ReconcilerConfig {
    pub poll_interval: Duration,
    pub dead_threshold: u32,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            dead_threshold: 3,
        }
    }
}

impl From<&ReconcilerSection> for ReconcilerConfig {
    fn from(section: &ReconcilerSection) -> Self {
        Self {
            poll_interval: section.poll_interval(),
            dead_threshold: section.dead_threshold,
        }
    }
}

/// Outcome of one reconcile round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Resources whose status was queried.
    pub observed: usize,
    /// Resources that moved from `Requested` to `Running`.
    pub became_running: Vec<ResourceId>,
    /// Resources that crossed the dead threshold this round.
    pub declared_dead: Vec<ResourceId>,
    /// Released and untracked resources, with status `Released`.
    pub reclaimed: Vec<Resource>,
    /// Dead resources whose release failed; retried next round.
    pub release_failures: Vec<ResourceId>,
    pub replacements: Vec<ReplacementRequest>,
}

struct Tracked {
    resource: Resource,
    tracker: StatusTracker,
}

/// Watches tracked resources through a [`ResourceContainer`].
pub struct Reconciler {
    container: Arc<ResourceContainer>,
    config: ReconcilerConfig,
    /// resource_id → tracked resource.
    tracked: RwLock<HashMap<ResourceId, Tracked>>,
    /// group → desired live workers.
    targets: RwLock<HashMap<String, u32>>,
    /// group → replacements requested but not yet tracked or abandoned.
    in_flight: RwLock<HashMap<String, u32>>,
    on_replacement: Option<ReplacementCallback>,
}

impl Reconciler {
    pub fn new(container: Arc<ResourceContainer>, config: ReconcilerConfig) -> Self {
        Self {
            container,
            config,
            tracked: RwLock::new(HashMap::new()),
            targets: RwLock::new(HashMap::new()),
            in_flight: RwLock::new(HashMap::new()),
            on_replacement: None,
        }
    }

    /// Set the callback that receives replacement requests.
    pub fn with_callback(mut self, callback: ReplacementCallback) -> Self {
        self.on_replacement = Some(callback);
        self
    }

    pub fn container(&self) -> &Arc<ResourceContainer> {
        &self.container
    }

    pub fn config(&self) -> ReconcilerConfig {
        self.config
    }

    /// Start watching a resource. The resource must carry its id; tracking
    /// an id twice replaces the earlier entry and its counters. A live
    /// resource fills one outstanding replacement of its group.
    pub async fn track(&self, resource: Resource) -> ReconcileResult<()> {
        if !resource.has_id() {
            return Err(ReconcileError::MissingResourceId {
                group: resource.group_name,
            });
        }
        let resource_id = resource.resource_id.clone();
        debug!(%resource_id, group = %resource.group_name, "tracking resource");
        if resource.status.is_live() {
            self.settle_in_flight(&resource.group_name, 1).await;
        }
        self.tracked.write().await.insert(
            resource_id,
            Tracked {
                resource,
                tracker: StatusTracker::new(self.config.dead_threshold),
            },
        );
        Ok(())
    }

    /// Stop watching a resource without releasing it.
    pub async fn untrack(&self, resource_id: &str) -> Option<Resource> {
        let removed = self.tracked.write().await.remove(resource_id);
        if removed.is_some() {
            debug!(%resource_id, "resource untracked");
        }
        removed.map(|t| t.resource)
    }

    /// Desired number of live workers for `group`.
    pub async fn set_target(&self, group: impl Into<String>, target: u32) {
        let group = group.into();
        debug!(%group, target, "group target set");
        self.targets.write().await.insert(group, target);
    }

    pub async fn target(&self, group: &str) -> Option<u32> {
        self.targets.read().await.get(group).copied()
    }

    /// Replacements requested for `group` that have not been answered yet.
    pub async fn in_flight(&self, group: &str) -> u32 {
        self.in_flight.read().await.get(group).copied().unwrap_or(0)
    }

    /// The scheduler gave up on `count` requested replacements (launch
    /// failed or timed out). The group is re-evaluated next round.
    pub async fn replacements_abandoned(&self, group: &str, count: u32) {
        if count > 0 {
            debug!(%group, count, "replacements abandoned");
            self.settle_in_flight(group, count).await;
        }
    }

    async fn settle_in_flight(&self, group: &str, count: u32) {
        let mut in_flight = self.in_flight.write().await;
        if let Some(pending) = in_flight.get_mut(group) {
            *pending = pending.saturating_sub(count);
            if *pending == 0 {
                in_flight.remove(group);
            }
        }
    }

    /// Snapshot of tracked resources, ordered by id.
    pub async fn tracked(&self) -> Vec<Resource> {
        let tracked = self.tracked.read().await;
        let mut resources: Vec<Resource> = tracked.values().map(|t| t.resource.clone()).collect();
        resources.sort_by(|a, b| a.resource_id.cmp(&b.resource_id));
        resources
    }

    pub async fn resource(&self, resource_id: &str) -> Option<Resource> {
        self.tracked
            .read()
            .await
            .get(resource_id)
            .map(|t| t.resource.clone())
    }

    /// Tracked resources of `group` that are `Requested` or `Running`.
    pub async fn live_count(&self, group: &str) -> u32 {
        let tracked = self.tracked.read().await;
        live_in_group(&tracked, group)
    }

    /// Run one reconcile round.
    pub async fn reconcile_once(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        // Dead entries are waiting for a release retry and are not re-queried.
        let (to_query, mut to_release): (Vec<ResourceId>, Vec<ResourceId>) = {
            let tracked = self.tracked.read().await;
            let (dead, live): (Vec<_>, Vec<_>) = tracked
                .iter()
                .partition(|(_, t)| t.resource.status == ResourceStatus::Dead);
            (
                live.into_iter().map(|(id, _)| id.clone()).collect(),
                dead.into_iter().map(|(id, _)| id.clone()).collect(),
            )
        };

        let observations = self.observe(to_query).await;
        report.observed = observations.len();

        // group → resources lost this round
        let mut lost: BTreeMap<String, u32> = BTreeMap::new();
        {
            let mut tracked = self.tracked.write().await;
            for (resource_id, observed) in observations {
                // Untracked while the query was in flight.
                let Some(entry) = tracked.get_mut(&resource_id) else {
                    continue;
                };
                let liveness = entry.tracker.record(observed);

                if observed == ObservedStatus::Running
                    && entry.resource.status == ResourceStatus::Requested
                {
                    entry.resource.status = ResourceStatus::Running;
                    info!(%resource_id, group = %entry.resource.group_name, "resource running");
                    report.became_running.push(resource_id.clone());
                }

                if liveness == Liveness::Dead {
                    entry.resource.status = ResourceStatus::Dead;
                    *lost.entry(entry.resource.group_name.clone()).or_default() += 1;
                    report.declared_dead.push(resource_id.clone());
                    to_release.push(resource_id);
                } else if let Liveness::Suspect(misses) = liveness {
                    debug!(%resource_id, misses, %observed, "resource suspect");
                }
            }
        }

        for resource_id in to_release {
            match self.container.release_resource(&resource_id).await {
                Ok(()) => {
                    if let Some(mut entry) = self.tracked.write().await.remove(&resource_id) {
                        entry.resource.status = ResourceStatus::Released;
                        info!(%resource_id, group = %entry.resource.group_name, "dead resource reclaimed");
                        report.reclaimed.push(entry.resource);
                    }
                }
                Err(e) => {
                    warn!(%resource_id, error = %e, "release of dead resource failed, will retry");
                    report.release_failures.push(resource_id);
                }
            }
        }

        for request in self.replacements(lost).await {
            info!(group = %request.group, missing = request.missing, "requesting replacements");
            if let Some(ref cb) = self.on_replacement {
                cb(request.clone()).await;
            }
            report.replacements.push(request);
        }

        report
    }

    /// Release every tracked resource and stop tracking it. Failures are
    /// logged and the resource stays tracked; returns the failed ids.
    pub async fn release_all(&self) -> Vec<ResourceId> {
        let ids: Vec<ResourceId> = self.tracked.read().await.keys().cloned().collect();
        let mut failed = Vec::new();
        for resource_id in ids {
            match self.container.release_resource(&resource_id).await {
                Ok(()) => {
                    self.tracked.write().await.remove(&resource_id);
                }
                Err(e) => {
                    error!(%resource_id, error = %e, "failed to release resource");
                    failed.push(resource_id);
                }
            }
        }
        info!(failed = failed.len(), "released tracked resources");
        failed
    }

    /// Replacement requests for this round.
    ///
    /// A group with a target asks for `target - live - in_flight`, so a
    /// launch that failed earlier is retried on a later round and one death
    /// still yields exactly one request. A group without a target replaces
    /// what it lost this round.
    async fn replacements(&self, lost: BTreeMap<String, u32>) -> Vec<ReplacementRequest> {
        let targets: BTreeMap<String, u32> = self
            .targets
            .read()
            .await
            .iter()
            .map(|(group, target)| (group.clone(), *target))
            .collect();
        let tracked = self.tracked.read().await;
        let mut in_flight = self.in_flight.write().await;

        let mut requests = Vec::new();
        for (group, target) in &targets {
            let live = live_in_group(&tracked, group);
            let pending = in_flight.get(group).copied().unwrap_or(0);
            let missing = target.saturating_sub(live + pending);
            if missing == 0 {
                if lost.contains_key(group) {
                    debug!(%group, live, pending, "group still at target");
                }
                continue;
            }
            *in_flight.entry(group.clone()).or_default() += missing;
            requests.push(ReplacementRequest {
                group: group.clone(),
                missing,
            });
        }
        requests.extend(
            lost.into_iter()
                .filter(|(group, _)| !targets.contains_key(group))
                .map(|(group, missing)| ReplacementRequest { group, missing }),
        );
        requests
    }

    /// Run the reconcile loop until `shutdown` fires.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.config.poll_interval.as_millis() as u64,
            dead_threshold = self.config.dead_threshold,
            "reconciler started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    let report = self.reconcile_once().await;
                    if !report.reclaimed.is_empty() || !report.replacements.is_empty() {
                        debug!(
                            observed = report.observed,
                            reclaimed = report.reclaimed.len(),
                            replacements = report.replacements.len(),
                            "reconcile round finished"
                        );
                    }
                }
                _ = shutdown.changed() => {
                    info!("reconciler shutting down");
                    break;
                }
            }
        }
    }

    /// Query every id concurrently. Status queries never fail; a panicked
    /// task is logged and its resource skipped for this round.
    async fn observe(&self, ids: Vec<ResourceId>) -> Vec<(ResourceId, ObservedStatus)> {
        let mut queries = JoinSet::new();
        for resource_id in ids {
            let container = self.container.clone();
            queries.spawn(async move {
                let status = container.get_status(&resource_id).await;
                (resource_id, status)
            });
        }

        let mut observations = Vec::with_capacity(queries.len());
        while let Some(joined) = queries.join_next().await {
            match joined {
                Ok(observation) => observations.push(observation),
                Err(e) => error!(error = %e, "status query task failed"),
            }
        }
        observations
    }
}

fn live_in_group(tracked: &HashMap<ResourceId, Tracked>, group: &str) -> u32 {
    tracked
        .values()
        .filter(|t| t.resource.group_name == group && t.resource.status.is_live())
        .count() as u32
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use fleet_container::backends::MemoryBackend;
    use fleet_core::{ContainerProperties, keys};

    use super::*;

    fn container(backend: Arc<MemoryBackend>) -> Arc<ResourceContainer> {
        let props = ContainerProperties::from_iter([
            (keys::AMS_HOME, "/opt/ams"),
            (keys::AMS_OPTIMIZER_URI, "thrift://ams:1260"),
        ]);
        Arc::new(ResourceContainer::init("test", props, backend).unwrap())
    }

    fn reconciler(backend: Arc<MemoryBackend>, threshold: u32) -> Reconciler {
        Reconciler::new(
            container(backend),
            ReconcilerConfig {
                poll_interval: Duration::from_millis(10),
                dead_threshold: threshold,
            },
        )
    }

    async fn launch(r: &Reconciler, group: &str) -> ResourceId {
        let request = Resource::new(group, 2);
        let facts = r.container().request_resource(&request).await.unwrap();
        let resource = request.merged_with(&facts);
        let id = resource.resource_id.clone();
        r.track(resource).await.unwrap();
        id
    }

    fn recording_callback() -> (ReplacementCallback, Arc<Mutex<Vec<ReplacementRequest>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let cb: ReplacementCallback = Arc::new(move |req| {
            sink.lock().unwrap().push(req);
            Box::pin(async {}) as BoxFuture<'static, ()>
        });
        (cb, seen)
    }

    #[tokio::test]
    async fn track_requires_id() {
        let r = reconciler(Arc::new(MemoryBackend::new()), 3);
        let err = r.track(Resource::new("g1", 1)).await.unwrap_err();
        assert!(matches!(err, ReconcileError::MissingResourceId { ref group } if group == "g1"));
    }

    #[tokio::test]
    async fn requested_becomes_running() {
        let r = reconciler(Arc::new(MemoryBackend::new()), 3);
        let id = launch(&r, "g1").await;
        assert_eq!(r.resource(&id).await.unwrap().status, ResourceStatus::Requested);

        let report = r.reconcile_once().await;
        assert_eq!(report.observed, 1);
        assert_eq!(report.became_running, vec![id.clone()]);
        assert_eq!(r.resource(&id).await.unwrap().status, ResourceStatus::Running);

        // Only reported on the transition.
        assert!(r.reconcile_once().await.became_running.is_empty());
    }

    #[tokio::test]
    async fn dead_resource_reclaimed_after_threshold() {
        let backend = Arc::new(MemoryBackend::new());
        let (cb, seen) = recording_callback();
        let r = reconciler(backend.clone(), 3).with_callback(cb);
        r.set_target("g1", 1).await;
        let id = launch(&r, "g1").await;

        r.reconcile_once().await;
        backend.kill(&id).await;

        assert!(r.reconcile_once().await.declared_dead.is_empty());
        assert!(r.reconcile_once().await.declared_dead.is_empty());
        assert!(backend.terminated().await.is_empty());

        let report = r.reconcile_once().await;
        assert_eq!(report.declared_dead, vec![id.clone()]);
        assert_eq!(report.reclaimed.len(), 1);
        assert_eq!(report.reclaimed[0].status, ResourceStatus::Released);
        assert_eq!(backend.terminated().await, vec![id.clone()]);
        assert!(r.resource(&id).await.is_none());

        let expected = ReplacementRequest {
            group: "g1".to_string(),
            missing: 1,
        };
        assert_eq!(report.replacements, vec![expected.clone()]);
        assert_eq!(*seen.lock().unwrap(), vec![expected]);

        // One death, one request.
        assert!(r.reconcile_once().await.replacements.is_empty());
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn transient_failure_is_forgiven() {
        let backend = Arc::new(MemoryBackend::new());
        let r = reconciler(backend.clone(), 3);
        let id = launch(&r, "g1").await;
        r.reconcile_once().await;

        backend.kill(&id).await;
        r.reconcile_once().await;
        r.reconcile_once().await;
        backend.revive(&id).await;
        r.reconcile_once().await;
        backend.kill(&id).await;
        r.reconcile_once().await;
        r.reconcile_once().await;

        assert!(r.resource(&id).await.is_some());
        assert!(backend.terminated().await.is_empty());
    }

    #[tokio::test]
    async fn statusless_backend_never_reclaims() {
        let backend = Arc::new(MemoryBackend::new().without_status());
        let r = reconciler(backend.clone(), 2);
        let id = launch(&r, "g1").await;
        for _ in 0..5 {
            let report = r.reconcile_once().await;
            assert!(report.declared_dead.is_empty());
        }
        assert_eq!(r.resource(&id).await.unwrap().status, ResourceStatus::Requested);
        assert!(backend.terminated().await.is_empty());
    }

    #[tokio::test]
    async fn vanished_after_running_counts_as_lost() {
        let backend = Arc::new(MemoryBackend::new());
        let r = reconciler(backend.clone(), 2);
        let id = launch(&r, "g1").await;
        r.reconcile_once().await;

        backend.vanish(&id).await;
        r.reconcile_once().await;
        let report = r.reconcile_once().await;
        assert_eq!(report.declared_dead, vec![id]);
        // No target set: replace like for like.
        assert_eq!(
            report.replacements,
            vec![ReplacementRequest {
                group: "g1".to_string(),
                missing: 1
            }]
        );
    }

    #[tokio::test]
    async fn no_replacement_when_group_still_at_target() {
        let backend = Arc::new(MemoryBackend::new());
        let r = reconciler(backend.clone(), 1);
        r.set_target("g1", 1).await;
        let a = launch(&r, "g1").await;
        launch(&r, "g1").await;
        r.reconcile_once().await;

        backend.kill(&a).await;
        let report = r.reconcile_once().await;
        assert_eq!(report.reclaimed.len(), 1);
        assert!(report.replacements.is_empty());
        assert_eq!(r.live_count("g1").await, 1);
    }

    #[tokio::test]
    async fn group_below_target_is_topped_up_after_failed_launch() {
        let backend = Arc::new(MemoryBackend::new());
        let (cb, seen) = recording_callback();
        let r = reconciler(backend.clone(), 3).with_callback(cb);
        r.set_target("g1", 2).await;

        launch(&r, "g1").await;
        backend.fail_next_scale_out("no capacity").await;
        assert!(r.container().request_resource(&Resource::new("g1", 2)).await.is_err());
        assert_eq!(r.live_count("g1").await, 1);

        let report = r.reconcile_once().await;
        let expected = ReplacementRequest {
            group: "g1".to_string(),
            missing: 1,
        };
        assert_eq!(report.replacements, vec![expected.clone()]);
        assert_eq!(r.in_flight("g1").await, 1);

        // Outstanding: not asked for again.
        for _ in 0..3 {
            assert!(r.reconcile_once().await.replacements.is_empty());
        }

        // The scheduler could not fill it either; the next round asks again.
        r.replacements_abandoned("g1", 1).await;
        assert_eq!(r.in_flight("g1").await, 0);
        assert_eq!(r.reconcile_once().await.replacements, vec![expected.clone()]);

        // Answered: the group is whole and stays quiet.
        launch(&r, "g1").await;
        assert_eq!(r.in_flight("g1").await, 0);
        assert_eq!(r.live_count("g1").await, 2);
        for _ in 0..3 {
            assert!(r.reconcile_once().await.replacements.is_empty());
        }
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn deaths_while_replacements_outstanding_ask_only_for_the_gap() {
        let backend = Arc::new(MemoryBackend::new());
        let r = reconciler(backend.clone(), 1);
        r.set_target("g1", 3).await;
        let a = launch(&r, "g1").await;
        let b = launch(&r, "g1").await;
        launch(&r, "g1").await;
        r.reconcile_once().await;

        backend.kill(&a).await;
        let report = r.reconcile_once().await;
        assert_eq!(report.replacements[0].missing, 1);

        backend.kill(&b).await;
        let report = r.reconcile_once().await;
        assert_eq!(report.replacements[0].missing, 1);
        assert_eq!(r.in_flight("g1").await, 2);
        assert_eq!(r.live_count("g1").await, 1);
    }

    #[tokio::test]
    async fn untracked_resources_are_ignored() {
        let backend = Arc::new(MemoryBackend::new());
        let r = reconciler(backend.clone(), 1);
        let id = launch(&r, "g1").await;
        let removed = r.untrack(&id).await.unwrap();
        assert_eq!(removed.resource_id, id);

        backend.kill(&id).await;
        let report = r.reconcile_once().await;
        assert_eq!(report.observed, 0);
        assert!(backend.terminated().await.is_empty());
    }

    #[tokio::test]
    async fn release_all_empties_tracking() {
        let backend = Arc::new(MemoryBackend::new());
        let r = reconciler(backend.clone(), 3);
        launch(&r, "g1").await;
        launch(&r, "g2").await;

        assert!(r.release_all().await.is_empty());
        assert!(r.tracked().await.is_empty());
        assert_eq!(backend.terminated().await.len(), 2);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let backend = Arc::new(MemoryBackend::new());
        let r = Arc::new(reconciler(backend.clone(), 1));
        let id = launch(&r, "g1").await;

        let (tx, rx) = watch::channel(false);
        let runner = {
            let r = r.clone();
            tokio::spawn(async move { r.run(rx).await })
        };

        for _ in 0..100 {
            if r.resource(&id).await.map(|res| res.status) == Some(ResourceStatus::Running) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(r.resource(&id).await.unwrap().status, ResourceStatus::Running);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .unwrap()
            .unwrap();
    }
}
