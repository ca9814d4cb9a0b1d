//! Shared test harness: a simulated cluster around the real tracker,
//! queue, offer processor and deployment manager. The simulation stands in
//! for the external resource manager: offers appear on demand, kills
//! acknowledge with `TASK_KILLED`, and staged instances are promoted to
//! running between pump iterations.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use event_bus::EventBus;
use fleet_deployment::{
    ArtifactResolver, DeploymentManager, HealthEngine, HealthProber, HealthResult,
    ReadinessCheckExecutor, ReadinessSubscription, StepContext,
};
use fleet_model::{Condition, Instance, ReadinessCheckDef, RunSpec, TaskId};
use fleet_scheduler::{
    InstanceTracker, KillReason, KillService, LaunchDescriptor, LaunchQueue, MemoryRepository,
    Offer, OfferId, OfferProcessor, SchedulerConfig, SchedulerDriver, StatusUpdate,
};

/// Driver stub: launches are implicit (the processor registers instances
/// with the tracker), kills and acks are recorded.
#[derive(Default)]
pub struct SimDriver {
    pub kills: Mutex<Vec<TaskId>>,
}

#[async_trait]
impl SchedulerDriver for SimDriver {
    async fn launch(
        &self,
        _offer_id: &OfferId,
        _tasks: Vec<LaunchDescriptor>,
    ) -> fleet_scheduler::Result<()> {
        Ok(())
    }

    async fn kill(&self, task_id: &TaskId) -> fleet_scheduler::Result<()> {
        self.kills.lock().unwrap().push(task_id.clone());
        Ok(())
    }

    async fn reconcile(&self, _task_ids: Vec<TaskId>) -> fleet_scheduler::Result<()> {
        Ok(())
    }

    async fn acknowledge(&self, _update: &StatusUpdate) -> fleet_scheduler::Result<()> {
        Ok(())
    }
}

/// Kill service that immediately confirms every kill with `TASK_KILLED`,
/// except for unreachable instances, which are never killed.
pub struct SimKillService {
    tracker: Arc<InstanceTracker>,
    pub killed: Mutex<Vec<Instance>>,
}

#[async_trait]
impl KillService for SimKillService {
    async fn kill_instance(
        &self,
        instance: &Instance,
        _reason: KillReason,
    ) -> fleet_scheduler::Result<()> {
        if instance.is_unreachable() {
            return Ok(());
        }
        self.killed.lock().unwrap().push(instance.clone());
        for task_id in instance.tasks.keys() {
            self.tracker
                .process_status_update(
                    Condition::Killed,
                    StatusUpdate::new(task_id.clone(), "TASK_KILLED"),
                    chrono::Utc::now(),
                )
                .await?;
        }
        Ok(())
    }
}

/// Readiness executor under test control: checks report ready only once the
/// test released them.
#[derive(Default)]
pub struct ManualReadiness {
    released: Mutex<bool>,
    pub started: Mutex<Vec<(String, TaskId)>>,
}

impl ManualReadiness {
    /// Let every subsequent (and pending) probe report ready.
    pub fn release(&self) {
        *self.released.lock().unwrap() = true;
    }
}

/// Local wrapper so the trait impl satisfies the orphan rule (both
/// `Arc` and `ReadinessCheckExecutor` live outside this crate).
#[derive(Clone)]
pub struct ManualReadinessHandle(pub Arc<ManualReadiness>);

impl ReadinessCheckExecutor for ManualReadinessHandle {
    fn start(
        &self,
        check: &ReadinessCheckDef,
        _spec: &RunSpec,
        instance: &Instance,
        bus: EventBus,
    ) -> ReadinessSubscription {
        let task_id = instance.tasks.keys().next().cloned().expect("instance has a task");
        self.0.started.lock().unwrap().push((check.name.clone(), task_id.clone()));

        let (stop_tx, stop_rx) = async_channel::bounded::<()>(1);
        let this = self.0.clone();
        let name = check.name.clone();
        smol::spawn(async move {
            loop {
                if stop_rx.try_recv().is_err() && stop_rx.is_closed() {
                    return;
                }
                if *this.released.lock().unwrap() {
                    bus.publish(fleet_model::events::ReadinessResult {
                        name: name.clone(),
                        task_id: task_id.clone(),
                        ready: true,
                        last_response: None,
                        timestamp: chrono::Utc::now(),
                    });
                    return;
                }
                smol::Timer::after(Duration::from_millis(5)).await;
            }
        })
        .detach();
        ReadinessSubscription::new(stop_tx)
    }
}

/// Prober that always succeeds; health-checked specs become healthy on the
/// first probe round.
pub struct AlwaysHealthy;

#[async_trait]
impl HealthProber for AlwaysHealthy {
    async fn probe(
        &self,
        _check: &fleet_model::HealthCheckDef,
        _host: &str,
        _port: Option<u16>,
    ) -> HealthResult {
        HealthResult::healthy()
    }
}

/// Artifact resolver that records requests instead of downloading.
#[derive(Default)]
pub struct RecordingArtifacts {
    pub resolved: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl ArtifactResolver for RecordingArtifacts {
    async fn resolve(&self, url: &str, path: &str) -> fleet_deployment::Result<()> {
        let mut resolved = self.resolved.lock().unwrap();
        if !resolved.iter().any(|(u, p)| u == url && p == path) {
            resolved.push((url.to_string(), path.to_string()));
        }
        Ok(())
    }
}

/// The assembled simulation.
pub struct SimCluster {
    pub bus: EventBus,
    pub queue: Arc<LaunchQueue>,
    pub tracker: Arc<InstanceTracker>,
    pub groups: Arc<MemoryRepository>,
    pub driver: Arc<SimDriver>,
    pub kill_service: Arc<SimKillService>,
    pub readiness: Arc<ManualReadiness>,
    pub artifacts: Arc<RecordingArtifacts>,
    pub manager: Arc<DeploymentManager>,
    processor: OfferProcessor,
    offer_counter: AtomicUsize,
    /// Promote freshly created instances to running during pumps.
    pub auto_run: Mutex<bool>,
}

impl SimCluster {
    pub fn new() -> Arc<Self> {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let bus = EventBus::new();
        let repo = Arc::new(MemoryRepository::new());
        let groups = Arc::new(MemoryRepository::new());
        let queue = Arc::new(LaunchQueue::new());
        let tracker = Arc::new(InstanceTracker::new(repo, bus.clone()));
        let driver = Arc::new(SimDriver::default());
        let kill_service = Arc::new(SimKillService {
            tracker: tracker.clone(),
            killed: Mutex::new(Vec::new()),
        });
        let readiness = Arc::new(ManualReadiness::default());
        let artifacts = Arc::new(RecordingArtifacts::default());
        let health = Arc::new(HealthEngine::new(
            tracker.clone(),
            kill_service.clone(),
            Arc::new(AlwaysHealthy),
            bus.clone(),
        ));
        let processor = OfferProcessor::new(
            queue.clone(),
            tracker.clone(),
            driver.clone(),
            SchedulerConfig::default(),
        );
        let ctx = StepContext {
            tracker: tracker.clone(),
            queue: queue.clone(),
            kill_service: kill_service.clone(),
            bus: bus.clone(),
            readiness: Arc::new(ManualReadinessHandle(readiness.clone())),
            health,
            artifacts: artifacts.clone(),
        };
        let manager = DeploymentManager::new(ctx, groups.clone());
        Arc::new(SimCluster {
            bus,
            queue,
            tracker,
            groups,
            driver,
            kill_service,
            readiness,
            artifacts,
            manager,
            processor,
            offer_counter: AtomicUsize::new(0),
            auto_run: Mutex::new(true),
        })
    }

    /// One simulation beat: present a fat offer to the queue, then promote
    /// staged instances to running (when auto_run is on).
    pub async fn pump_once(&self) {
        let n = self.offer_counter.fetch_add(1, Ordering::SeqCst);
        let offer = Offer::plain(
            &format!("offer-{n}"),
            &format!("sim-host-{n}"),
            64.0,
            65_536.0,
            Some((30_000, 32_000)),
        );
        self.processor.process_offer(offer).await.expect("offer processing");

        if *self.auto_run.lock().unwrap() {
            for (_, instances) in self.tracker.instances_by_spec().await {
                for instance in instances {
                    for task in instance.tasks.values() {
                        if matches!(
                            task.status.condition,
                            Condition::Created | Condition::Staging | Condition::Starting
                        ) {
                            self.tracker
                                .process_status_update(
                                    Condition::Running,
                                    StatusUpdate::new(task.id.clone(), "TASK_RUNNING"),
                                    chrono::Utc::now(),
                                )
                                .await
                                .expect("status update");
                        }
                    }
                }
            }
        }
    }

    /// Pump until `done` observes completion or the iteration budget runs
    /// out; panics on timeout.
    pub async fn drive_until(&self, what: &str, mut done: impl FnMut() -> bool) {
        for _ in 0..500 {
            if done() {
                return;
            }
            self.pump_once().await;
            smol::Timer::after(Duration::from_millis(5)).await;
        }
        panic!("simulation did not reach: {what}");
    }

    /// Active instances of a spec.
    pub async fn active_instances(&self, spec: &RunSpec) -> Vec<Instance> {
        self.tracker
            .spec_instances(spec.id())
            .await
            .into_iter()
            .filter(|i| i.is_active())
            .collect()
    }
}
