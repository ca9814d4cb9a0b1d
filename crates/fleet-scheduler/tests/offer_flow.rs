//! End-to-end flow over the scheduler crate: demand enters the queue,
//! offers turn into launches, status updates drive the tracker, and the
//! unreachable policy cleans up.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use event_bus::EventBus;
use fleet_model::events::{InstanceChanged, InstanceReappeared};
use fleet_model::{
    AppSpec, Condition, Group, Instance, KillSelection, PathId, RunSpec, TaskId,
    UnreachableStrategy,
};
use fleet_scheduler::{
    GroupRepository, InstanceTracker, KillReason, KillService, LaunchDescriptor, LaunchQueue,
    MemoryRepository, Offer, OfferId, OfferProcessor, SchedulerConfig, SchedulerDriver,
    StatusUpdate, UnreachableMonitor,
};

#[derive(Default)]
struct FakeDriver {
    launches: Mutex<Vec<LaunchDescriptor>>,
    kills: Mutex<Vec<TaskId>>,
    acks: Mutex<usize>,
}

#[async_trait]
impl SchedulerDriver for Arc<FakeDriver> {
    async fn launch(
        &self,
        _offer_id: &OfferId,
        tasks: Vec<LaunchDescriptor>,
    ) -> fleet_scheduler::Result<()> {
        self.launches.lock().unwrap().extend(tasks);
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
        *self.acks.lock().unwrap() += 1;
        Ok(())
    }
}

struct RecordingKillService {
    killed: Mutex<Vec<Instance>>,
}

#[async_trait]
impl KillService for Arc<RecordingKillService> {
    async fn kill_instance(
        &self,
        instance: &Instance,
        _reason: KillReason,
    ) -> fleet_scheduler::Result<()> {
        self.killed.lock().unwrap().push(instance.clone());
        Ok(())
    }
}

struct Fixture {
    queue: Arc<LaunchQueue>,
    tracker: Arc<InstanceTracker>,
    driver: Arc<FakeDriver>,
    processor: OfferProcessor,
    bus: EventBus,
}

fn fixture() -> Fixture {
    let bus = EventBus::new();
    let queue = Arc::new(LaunchQueue::new());
    let tracker = Arc::new(InstanceTracker::new(Arc::new(MemoryRepository::new()), bus.clone()));
    let driver = Arc::new(FakeDriver::default());
    let processor = OfferProcessor::new(
        queue.clone(),
        tracker.clone(),
        Arc::new(driver.clone()),
        SchedulerConfig::default(),
    );
    Fixture { queue, tracker, driver, processor, bus }
}

fn web_app(instances: u32) -> RunSpec {
    let mut app = AppSpec::new(PathId::parse("/web").unwrap());
    app.cmd = Some("serve".to_string());
    app.instances = instances;
    app.resources.cpus = 1.0;
    app.resources.mem = 128.0;
    RunSpec::App(app)
}

#[smol_potat::test]
async fn test_offer_satisfies_queued_demand() {
    let f = fixture();
    let spec = web_app(2);
    f.queue.add(spec.clone(), 2);

    let offer = Offer::plain("o1", "h1", 4.0, 1024.0, Some((31000, 31009)));
    let launched = f.processor.process_offer(offer).await.unwrap();
    assert_eq!(launched, 2);
    assert_eq!(f.queue.pending(spec.id()), 0);
    assert_eq!(f.driver.launches.lock().unwrap().len(), 2);

    let instances = f.tracker.spec_instances(spec.id()).await;
    assert_eq!(instances.len(), 2);
    assert!(instances.iter().all(|i| i.state.condition == Condition::Created));
}

#[smol_potat::test]
async fn test_offer_partially_satisfies_when_too_small() {
    let f = fixture();
    let spec = web_app(3);
    f.queue.add(spec.clone(), 3);

    // Room for a single instance only.
    let offer = Offer::plain("o1", "h1", 1.5, 256.0, None);
    let launched = f.processor.process_offer(offer).await.unwrap();
    assert_eq!(launched, 1);
    assert_eq!(f.queue.pending(spec.id()), 2);
}

#[smol_potat::test]
async fn test_max_instances_per_offer_is_honored() {
    let f = fixture();
    let spec = web_app(20);
    f.queue.add(spec.clone(), 20);

    let offer = Offer::plain("o1", "h1", 100.0, 100_000.0, Some((30000, 32000)));
    let launched = f.processor.process_offer(offer).await.unwrap();
    assert_eq!(launched, SchedulerConfig::default().max_instances_per_offer);
}

#[smol_potat::test]
async fn test_failed_task_applies_backoff_and_blocks_offers() {
    let f = fixture();
    let spec = {
        let mut app = AppSpec::new(PathId::parse("/crasher").unwrap());
        app.cmd = Some("false".to_string());
        app.backoff.backoff = Duration::from_secs(3600);
        RunSpec::App(app)
    };
    f.queue.add(spec.clone(), 1);

    let offer = Offer::plain("o1", "h1", 4.0, 1024.0, None);
    assert_eq!(f.processor.process_offer(offer.clone()).await.unwrap(), 1);

    let task_id = {
        let instances = f.tracker.spec_instances(spec.id()).await;
        instances[0].tasks.keys().next().unwrap().clone()
    };
    f.processor
        .handle_status_update(StatusUpdate::new(task_id, "TASK_FAILED"))
        .await
        .unwrap();
    assert_eq!(*f.driver.acks.lock().unwrap(), 1);

    // The instance is gone, and the queue withholds the next launch.
    assert!(f.tracker.spec_instances(spec.id()).await.is_empty());
    f.queue.add(spec.clone(), 1);
    let info = &f.queue.list(Utc::now())[0];
    assert!(!info.overdue);
    assert_eq!(f.processor.process_offer(offer).await.unwrap(), 0);
}

#[smol_potat::test]
async fn test_status_update_order_is_tracker_order() {
    let f = fixture();
    let events = f.bus.subscribe::<InstanceChanged>();
    let spec = web_app(1);
    f.queue.add(spec.clone(), 1);
    let offer = Offer::plain("o1", "h1", 4.0, 1024.0, None);
    f.processor.process_offer(offer).await.unwrap();

    let task_id = {
        let instances = f.tracker.spec_instances(spec.id()).await;
        instances[0].tasks.keys().next().unwrap().clone()
    };
    for reason in ["TASK_STAGING", "TASK_STARTING", "TASK_RUNNING"] {
        f.processor
            .handle_status_update(StatusUpdate::new(task_id.clone(), reason))
            .await
            .unwrap();
    }

    let mut observed = Vec::new();
    while let Ok(event) = events.try_recv() {
        observed.push(event.condition);
    }
    assert_eq!(
        observed,
        vec![
            Condition::Created,
            Condition::Staging,
            Condition::Starting,
            Condition::Running
        ]
    );
}

#[smol_potat::test]
async fn test_unreachable_reappearance_kills_youngest_replacement() {
    let f = fixture();
    let mut app = match web_app(1) {
        RunSpec::App(app) => app,
        _ => unreachable!(),
    };
    app.kill_selection = KillSelection::YoungestFirst;
    app.unreachable_strategy = UnreachableStrategy {
        time_until_inactive: Duration::from_secs(60),
        time_until_expunge: Duration::from_secs(600),
    };
    let spec = RunSpec::App(app.clone());

    let groups: Arc<MemoryRepository> = Arc::new(MemoryRepository::new());
    let mut root = Group::empty_root(Utc::now());
    root.put_app(app, Utc::now());
    groups.store_root(&root).await.unwrap();

    let kill_service = Arc::new(RecordingKillService { killed: Mutex::new(Vec::new()) });
    let monitor = UnreachableMonitor::new(
        f.tracker.clone(),
        Arc::new(kill_service.clone()),
        groups,
        SchedulerConfig::default(),
        f.bus.clone(),
    );

    let reappearances = f.bus.subscribe::<InstanceReappeared>();

    // First instance launches and runs. An ordinary launch reaching
    // Running is not a re-observation.
    f.queue.add(spec.clone(), 1);
    f.processor
        .process_offer(Offer::plain("o1", "h1", 4.0, 1024.0, None))
        .await
        .unwrap();
    let i1_task = {
        let instances = f.tracker.spec_instances(spec.id()).await;
        instances[0].tasks.keys().next().unwrap().clone()
    };
    f.processor
        .handle_status_update(StatusUpdate::new(i1_task.clone(), "TASK_RUNNING"))
        .await
        .unwrap();
    assert!(reappearances.try_recv().is_err());

    // The agent drops off; the instance goes unreachable but keeps its
    // tracker entry.
    f.processor
        .handle_status_update(StatusUpdate::new(i1_task.clone(), "TASK_UNREACHABLE"))
        .await
        .unwrap();
    assert_eq!(f.tracker.spec_instances(spec.id()).await.len(), 1);

    // A replacement is launched and becomes running: two active entries.
    f.queue.add(spec.clone(), 1);
    f.processor
        .process_offer(Offer::plain("o2", "h2", 4.0, 1024.0, None))
        .await
        .unwrap();
    let i2_task = {
        let instances = f.tracker.spec_instances(spec.id()).await;
        instances
            .iter()
            .flat_map(|i| i.tasks.keys())
            .find(|t| **t != i1_task)
            .unwrap()
            .clone()
    };
    f.processor
        .handle_status_update(StatusUpdate::new(i2_task.clone(), "TASK_RUNNING"))
        .await
        .unwrap();
    assert_eq!(f.tracker.spec_instances(spec.id()).await.len(), 2);
    // The replacement running is an ordinary launch, no re-observation.
    assert!(reappearances.try_recv().is_err());

    // The agent recovers; i1 reports running again. The tracker announces
    // the re-observation, and the monitor kills the younger replacement.
    f.processor
        .handle_status_update(StatusUpdate::new(i1_task.clone(), "TASK_RUNNING"))
        .await
        .unwrap();
    let event = reappearances.try_recv().expect("re-observation signal");
    assert_eq!(event.id, i1_task.instance);
    monitor.resolve_duplicates(&event).await.unwrap();

    let killed = kill_service.killed.lock().unwrap();
    assert_eq!(killed.len(), 1);
    assert_eq!(killed[0].id, i2_task.instance);
}

#[smol_potat::test]
async fn test_expunge_pass_demotes_then_expunges() {
    let f = fixture();
    let mut app = match web_app(1) {
        RunSpec::App(app) => app,
        _ => unreachable!(),
    };
    app.unreachable_strategy = UnreachableStrategy {
        time_until_inactive: Duration::from_secs(60),
        time_until_expunge: Duration::from_secs(600),
    };
    let spec = RunSpec::App(app.clone());

    let groups: Arc<MemoryRepository> = Arc::new(MemoryRepository::new());
    let kill_service = Arc::new(RecordingKillService { killed: Mutex::new(Vec::new()) });
    let monitor = UnreachableMonitor::new(
        f.tracker.clone(),
        Arc::new(kill_service),
        groups,
        SchedulerConfig::default(),
        f.bus.clone(),
    );

    f.queue.add(spec.clone(), 1);
    f.processor
        .process_offer(Offer::plain("o1", "h1", 4.0, 1024.0, None))
        .await
        .unwrap();
    let task_id = {
        let instances = f.tracker.spec_instances(spec.id()).await;
        instances[0].tasks.keys().next().unwrap().clone()
    };
    f.processor
        .handle_status_update(StatusUpdate::new(task_id.clone(), "TASK_RUNNING"))
        .await
        .unwrap();
    f.processor
        .handle_status_update(StatusUpdate::new(task_id.clone(), "TASK_UNREACHABLE"))
        .await
        .unwrap();

    // Before the inactivity window nothing happens.
    monitor.expunge_pass(Utc::now()).await.unwrap();
    let instance = &f.tracker.spec_instances(spec.id()).await[0];
    assert_eq!(instance.state.condition, Condition::Unreachable);

    // Past the inactivity window the instance is demoted.
    monitor
        .expunge_pass(Utc::now() + chrono::Duration::seconds(120))
        .await
        .unwrap();
    let instance = &f.tracker.spec_instances(spec.id()).await[0];
    assert_eq!(instance.state.condition, Condition::UnreachableInactive);

    // Past the expunge window it disappears.
    monitor
        .expunge_pass(Utc::now() + chrono::Duration::seconds(700))
        .await
        .unwrap();
    assert!(f.tracker.spec_instances(spec.id()).await.is_empty());
}
