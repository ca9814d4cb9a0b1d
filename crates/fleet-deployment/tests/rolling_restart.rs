//! Rolling-restart scenarios: capacity bounds, readiness gating and
//! rollback.

mod common;

use chrono::Utc;
use std::collections::BTreeSet;
use std::time::Duration;

use common::SimCluster;
use fleet_model::events::{DeploymentFailed, DeploymentSuccess};
use fleet_model::{AppSpec, Group, PathId, ReadinessCheckDef, RunSpec, UpgradeStrategy};

fn app(id: &str, instances: u32) -> AppSpec {
    let mut app = AppSpec::new(PathId::parse(id).unwrap());
    app.cmd = Some("serve-v1".to_string());
    app.instances = instances;
    app.resources.cpus = 0.5;
    app.resources.mem = 64.0;
    app.upgrade_strategy =
        UpgradeStrategy { minimum_health_capacity: 1.0, maximum_over_capacity: 1.0 };
    app
}

async fn deploy_and_wait(sim: &SimCluster, target: Group) -> String {
    let successes = sim.bus.subscribe::<DeploymentSuccess>();
    let plan = sim.manager.deploy_group_change(target, false).await.unwrap();
    sim.drive_until("deployment success", || {
        successes.try_recv().map(|e| e.plan_id == plan).unwrap_or(false)
    })
    .await;
    plan
}

#[smol_potat::test]
async fn test_restart_replaces_every_old_instance_within_bounds() {
    let sim = SimCluster::new();
    let path = PathId::parse("/web").unwrap();

    let mut v1_root = Group::empty_root(Utc::now());
    v1_root.put_app(app("/web", 2), Utc::now());
    let v1 = v1_root.run_spec(&path).unwrap();
    deploy_and_wait(&sim, v1_root.clone()).await;

    let old_ids: BTreeSet<_> =
        sim.active_instances(&v1).await.into_iter().map(|i| i.id).collect();
    assert_eq!(old_ids.len(), 2);

    // Config change: every instance must be replaced.
    let mut v2_root = v1_root.clone();
    let mut changed = app("/web", 2);
    changed.cmd = Some("serve-v2".to_string());
    v2_root.put_app(changed, Utc::now());
    let v2 = v2_root.run_spec(&path).unwrap();

    let successes = sim.bus.subscribe::<DeploymentSuccess>();
    let plan = sim.manager.deploy_group_change(v2_root, false).await.unwrap();

    // minHealthy = ceil(2*1.0) = 2, maxCapacity = floor(2*(1+1)) = 4.
    let mut done = false;
    for _ in 0..500 {
        if successes.try_recv().map(|e| e.plan_id == plan).unwrap_or(false) {
            done = true;
            break;
        }
        let active = sim.active_instances(&v2).await;
        assert!(active.len() <= 4, "capacity ceiling breached: {}", active.len());
        let running = active.iter().filter(|i| i.is_running()).count();
        let staged = active.len() - running;
        // The ready floor: instances that were running stay running until
        // a replacement is ready, so only freshly staged ones are not yet
        // counted.
        assert!(
            running >= 2 || staged > 0,
            "health floor breached: {running} running"
        );
        sim.pump_once().await;
        smol::Timer::after(Duration::from_millis(5)).await;
    }
    assert!(done, "restart did not complete");

    let survivors = sim.active_instances(&v2).await;
    assert_eq!(survivors.len(), 2);
    assert!(survivors.iter().all(|i| i.run_spec_version == v2.version()));
    assert!(survivors.iter().all(|i| !old_ids.contains(&i.id)));
    // Both old instances went through the kill service.
    let killed: BTreeSet<_> = sim
        .kill_service
        .killed
        .lock()
        .unwrap()
        .iter()
        .map(|i| i.id.clone())
        .collect();
    assert_eq!(killed, old_ids);
}

#[smol_potat::test]
async fn test_restart_of_empty_spec_completes_immediately() {
    let sim = SimCluster::new();
    let mut v1_root = Group::empty_root(Utc::now());
    v1_root.put_app(app("/idle", 0), Utc::now());
    deploy_and_wait(&sim, v1_root.clone()).await;

    let mut v2_root = v1_root.clone();
    let mut changed = app("/idle", 0);
    changed.cmd = Some("serve-v2".to_string());
    v2_root.put_app(changed, Utc::now());
    deploy_and_wait(&sim, v2_root).await;
    assert!(sim.kill_service.killed.lock().unwrap().is_empty());
}

fn readiness_gated_v2(base: &Group) -> Group {
    let mut v2_root = base.clone();
    let mut changed = app("/web", 1);
    changed.cmd = Some("serve-v2".to_string());
    changed.readiness_checks = vec![ReadinessCheckDef::default()];
    v2_root.put_app(changed, Utc::now());
    v2_root
}

#[smol_potat::test]
async fn test_completion_waits_for_readiness_signal() {
    let sim = SimCluster::new();
    let path = PathId::parse("/web").unwrap();

    let mut v1_root = Group::empty_root(Utc::now());
    v1_root.put_app(app("/web", 1), Utc::now());
    let v1 = v1_root.run_spec(&path).unwrap();
    deploy_and_wait(&sim, v1_root.clone()).await;
    let v1_instance = sim.active_instances(&v1).await[0].id.clone();

    let v2_root = readiness_gated_v2(&v1_root);
    let v2 = v2_root.run_spec(&path).unwrap();
    let successes = sim.bus.subscribe::<DeploymentSuccess>();
    let plan = sim.manager.deploy_group_change(v2_root, false).await.unwrap();

    // The new instance launches and runs, but without the readiness signal
    // the deployment must not complete and the old instance must survive.
    for _ in 0..40 {
        sim.pump_once().await;
        smol::Timer::after(Duration::from_millis(5)).await;
    }
    assert!(successes.try_recv().is_err(), "completed without readiness");
    let active = sim.active_instances(&v2).await;
    assert_eq!(active.len(), 2);
    assert!(active.iter().any(|i| i.id == v1_instance));
    assert!(!sim.readiness.started.lock().unwrap().is_empty());

    // Out-of-band continue signal: readiness passes, rollout finishes.
    sim.readiness.release();
    sim.drive_until("gated deployment success", || {
        successes.try_recv().map(|e| e.plan_id == plan).unwrap_or(false)
    })
    .await;
    let active = sim.active_instances(&v2).await;
    assert_eq!(active.len(), 1);
    assert_ne!(active[0].id, v1_instance);
}

#[smol_potat::test]
async fn test_cancel_without_force_rolls_back() {
    let sim = SimCluster::new();
    let path = PathId::parse("/web").unwrap();

    let mut v1_root = Group::empty_root(Utc::now());
    v1_root.put_app(app("/web", 1), Utc::now());
    let v1 = v1_root.run_spec(&path).unwrap();
    deploy_and_wait(&sim, v1_root.clone()).await;
    let v1_instance = sim.active_instances(&v1).await[0].id.clone();

    let v2_root = readiness_gated_v2(&v1_root);
    let failures = sim.bus.subscribe::<DeploymentFailed>();
    let successes = sim.bus.subscribe::<DeploymentSuccess>();
    let plan = sim.manager.deploy_group_change(v2_root, false).await.unwrap();
    for _ in 0..40 {
        sim.pump_once().await;
        smol::Timer::after(Duration::from_millis(5)).await;
    }
    assert_eq!(sim.active_instances(&v1).await.len(), 2);

    sim.manager.cancel(&plan, false).await.unwrap();

    // Failure of the cancelled plan is published before the rollback's
    // success.
    let failure = failures.recv().await.unwrap();
    assert_eq!(failure.plan_id, plan);
    sim.drive_until("rollback success", || successes.try_recv().is_ok()).await;

    // Back on v1: the original instance survived, the v2 stand-in is gone.
    let active = sim.active_instances(&v1).await;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, v1_instance);
    assert_eq!(active[0].run_spec_version, v1.version());

    use fleet_scheduler::GroupRepository;
    let stored = sim.groups.root().await.unwrap();
    match stored.run_spec(&path).unwrap() {
        RunSpec::App(app) => assert_eq!(app.cmd.as_deref(), Some("serve-v1")),
        other => panic!("unexpected spec {other:?}"),
    }
}
