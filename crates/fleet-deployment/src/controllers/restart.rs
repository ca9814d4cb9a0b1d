//! The rolling-restart controller.
//!
//! Replaces every active instance not running the spec's current version
//! while honoring the upgrade strategy: never fewer than
//! `ceil(N * minimumHealthCapacity)` ready instances, never more than
//! `floor(N * (1 + maximumOverCapacity))` active ones — with a single
//! deliberate exception when the two bounds pinch (see
//! [`compute_restart_strategy`]).

use futures::FutureExt;
use std::collections::{HashSet, VecDeque};
use tracing::{debug, info};

use fleet_model::events::{InstanceChanged, InstanceHealthChanged, ReadinessResult};
use fleet_model::{Instance, InstanceId, RunSpec};
use fleet_scheduler::{KillReason, select_victims};

use super::{StepContext, canceled};
use crate::readiness::{ReadinessTracker, ReadinessUpdate};
use crate::{Error, Result};

/// Capacity arithmetic for one rolling restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartStrategy {
    /// Ready floor throughout the rollout.
    pub min_healthy: usize,
    /// Active ceiling throughout the rollout (already including the
    /// one-instance bubble when granted).
    pub max_capacity: usize,
    /// Old instances killed before anything new launches.
    pub nr_to_kill_immediately: usize,
}

/// Compute the restart strategy for `spec` with `old_count` active
/// instances awaiting replacement.
///
/// When `min_healthy == max_capacity <= old_count` no progress is possible
/// within the bounds. Resident specs may not exceed declared capacity while
/// reservations are held, so they kill one extra instance up front and dip
/// below the floor by one; everything else gets a one-instance
/// over-capacity bubble instead.
pub fn compute_restart_strategy(spec: &RunSpec, old_count: usize) -> Result<RestartStrategy> {
    let n = spec.instances() as usize;
    let strategy = spec.upgrade_strategy();
    let min_healthy = (n as f64 * strategy.minimum_health_capacity).ceil() as usize;
    let mut max_capacity = (n as f64 * (1.0 + strategy.maximum_over_capacity)).floor() as usize;
    let mut nr_to_kill_immediately = old_count.saturating_sub(min_healthy);

    if min_healthy == max_capacity && max_capacity <= old_count {
        if spec.is_resident() {
            nr_to_kill_immediately += 1;
            info!(
                spec = %spec.id(),
                "resident spec pinched between capacity bounds, killing one extra instance"
            );
        } else {
            max_capacity += 1;
            info!(spec = %spec.id(), "temporarily raising the capacity ceiling by one");
        }
    }

    // Progress must be possible: either new instances fit under the
    // ceiling, or enough old ones die up front to make room.
    let can_start = min_healthy < max_capacity
        || old_count.saturating_sub(nr_to_kill_immediately) < max_capacity;
    if n > 0 && !can_start {
        return Err(Error::Plan(format!(
            "restart of {} cannot make progress within capacity bounds",
            spec.id()
        )));
    }

    Ok(RestartStrategy { min_healthy, max_capacity, nr_to_kill_immediately })
}

pub(crate) async fn run_restart(
    ctx: &StepContext,
    spec: &RunSpec,
    shutdown: async_channel::Receiver<()>,
) -> Result<()> {
    let id = spec.id().clone();
    let version = spec.version();
    let n = spec.instances() as usize;

    let changed = ctx.bus.subscribe::<InstanceChanged>();
    let health_events = ctx.bus.subscribe::<InstanceHealthChanged>();
    let readiness_events = ctx.bus.subscribe::<ReadinessResult>();

    ctx.health.start_monitoring(spec);
    // A restart is a fresh start in the queue's eyes.
    ctx.queue.reset_delay(&id);

    let snapshot = ctx.tracker.spec_instances(&id).await;
    let old_active: Vec<Instance> = snapshot
        .iter()
        .filter(|i| i.is_active() && i.run_spec_version != version)
        .cloned()
        .collect();

    let mut readiness = ReadinessTracker::new(spec.clone());
    let mut started = 0usize;
    for instance in &snapshot {
        if instance.run_spec_version == version && instance.is_active() {
            started += 1;
            readiness.reconcile_running(instance, ctx.readiness.as_ref(), &ctx.bus);
        }
    }

    let strategy = compute_restart_strategy(spec, old_active.len())?;
    info!(
        spec = %id,
        old = old_active.len(),
        started,
        min_healthy = strategy.min_healthy,
        max_capacity = strategy.max_capacity,
        kill_immediately = strategy.nr_to_kill_immediately,
        "restart controller running"
    );

    // Kill order follows the spec's kill selection; the queue front dies
    // first.
    let ordered_old = select_victims(spec.kill_selection(), old_active, usize::MAX);
    let mut to_kill: VecDeque<InstanceId> = ordered_old.iter().map(|i| i.id.clone()).collect();
    let mut old_remaining: HashSet<InstanceId> = to_kill.iter().cloned().collect();

    for _ in 0..strategy.nr_to_kill_immediately {
        kill_next_old(ctx, &mut to_kill).await?;
    }
    // Instances that were already ready when the controller started have no
    // upcoming ready event; they pay for their old counterparts here.
    for _ in 0..readiness.ready_count() {
        kill_next_old(ctx, &mut to_kill).await?;
    }

    let launch = |old_remaining: &HashSet<InstanceId>, started: &mut usize| {
        let occupied = old_remaining.len() + *started;
        let left_capacity = strategy.max_capacity.saturating_sub(occupied);
        let not_yet_started = n.saturating_sub(*started);
        let launch_now = left_capacity.min(not_yet_started);
        if launch_now > 0 {
            debug!(spec = %id, launch_now, "requesting launches");
            ctx.queue.add(spec.clone(), launch_now as u32);
            *started += launch_now;
        }
    };
    launch(&old_remaining, &mut started);

    if old_remaining.is_empty() && readiness.ready_count() >= n {
        return Ok(());
    }

    loop {
        futures::select! {
            _ = shutdown.recv().fuse() => {
                // Launched-but-not-ready instances stay: they are part of
                // the next plan's input state.
                return Err(canceled());
            }
            event = changed.recv().fuse() => {
                let Ok(event) = event else { return Err(canceled()) };
                if event.run_spec_id != id {
                    continue;
                }
                if event.run_spec_version == version {
                    let instance = ctx.tracker.instance(&event.id).await;
                    let update = readiness.note_instance_changed(
                        &event,
                        instance.as_ref(),
                        ctx.readiness.as_ref(),
                        &ctx.bus,
                    );
                    match update {
                        ReadinessUpdate::BecameReady(_) => {
                            // Each ready newcomer pays for one old
                            // instance.
                            kill_next_old(ctx, &mut to_kill).await?;
                            launch(&old_remaining, &mut started);
                        }
                        ReadinessUpdate::Terminated(_) => {
                            started = started.saturating_sub(1);
                            launch(&old_remaining, &mut started);
                        }
                        ReadinessUpdate::None => {}
                    }
                } else if event.condition.is_terminal() {
                    if old_remaining.remove(&event.id) {
                        to_kill.retain(|i| *i != event.id);
                        debug!(spec = %id, instance = %event.id, "old instance gone");
                        launch(&old_remaining, &mut started);
                    }
                }
            }
            event = health_events.recv().fuse() => {
                let Ok(event) = event else { return Err(canceled()) };
                if let ReadinessUpdate::BecameReady(_) = readiness.note_health_changed(&event) {
                    kill_next_old(ctx, &mut to_kill).await?;
                    launch(&old_remaining, &mut started);
                }
            }
            event = readiness_events.recv().fuse() => {
                let Ok(event) = event else { return Err(canceled()) };
                if let ReadinessUpdate::BecameReady(_) =
                    readiness.note_readiness_result(&event)
                {
                    kill_next_old(ctx, &mut to_kill).await?;
                    launch(&old_remaining, &mut started);
                }
            }
        }

        if old_remaining.is_empty() && readiness.ready_count() >= n {
            info!(spec = %id, "restart complete");
            return Ok(());
        }
    }
}

async fn kill_next_old(
    ctx: &StepContext,
    to_kill: &mut VecDeque<InstanceId>,
) -> Result<()> {
    let Some(victim) = to_kill.pop_front() else { return Ok(()) };
    if let Some(instance) = ctx.tracker.instance(&victim).await {
        ctx.kill_service
            .kill_instance(&instance, KillReason::DeploymentUpgrading)
            .await
            .map_err(Error::Scheduler)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_model::{AppSpec, PathId, Residency, UpgradeStrategy};

    fn spec(n: u32, min_healthy: f64, over: f64, resident: bool) -> RunSpec {
        let mut app = AppSpec::new(PathId::parse("/a").unwrap());
        app.cmd = Some("run".to_string());
        app.instances = n;
        app.upgrade_strategy =
            UpgradeStrategy { minimum_health_capacity: min_healthy, maximum_over_capacity: over };
        if resident {
            app.residency = Some(Residency::default());
        }
        RunSpec::App(app)
    }

    #[test]
    fn test_plain_half_capacity() {
        // N=4, minHealth=0.5: floor 2, ceiling 4, kill 2 up front.
        let strategy = compute_restart_strategy(&spec(4, 0.5, 0.0, false), 4).unwrap();
        assert_eq!(strategy.min_healthy, 2);
        // min(2) != max(4): untouched ceiling.
        assert_eq!(strategy.max_capacity, 4);
        assert_eq!(strategy.nr_to_kill_immediately, 2);
    }

    #[test]
    fn test_over_capacity_bubble_for_pinched_bounds() {
        // N=2, minHealth=1.0, over=0.0: both bounds are 2 and 2 old
        // instances exist, so the ceiling is raised by one.
        let strategy = compute_restart_strategy(&spec(2, 1.0, 0.0, false), 2).unwrap();
        assert_eq!(strategy.min_healthy, 2);
        assert_eq!(strategy.max_capacity, 3);
        assert_eq!(strategy.nr_to_kill_immediately, 0);
    }

    #[test]
    fn test_resident_dips_below_floor_instead() {
        // Resident specs may not exceed capacity: kill one extra up front.
        let strategy = compute_restart_strategy(&spec(2, 1.0, 0.0, true), 2).unwrap();
        assert_eq!(strategy.min_healthy, 2);
        assert_eq!(strategy.max_capacity, 2);
        assert_eq!(strategy.nr_to_kill_immediately, 1);
    }

    #[test]
    fn test_generous_over_capacity() {
        // N=2, minHealth=1.0, over=1.0: ceiling 4, nothing killed early.
        let strategy = compute_restart_strategy(&spec(2, 1.0, 1.0, false), 2).unwrap();
        assert_eq!(strategy.min_healthy, 2);
        assert_eq!(strategy.max_capacity, 4);
        assert_eq!(strategy.nr_to_kill_immediately, 0);
    }

    #[test]
    fn test_zero_instances_is_trivially_satisfiable() {
        let strategy = compute_restart_strategy(&spec(0, 1.0, 0.0, false), 0).unwrap();
        assert_eq!(strategy.min_healthy, 0);
        assert_eq!(strategy.nr_to_kill_immediately, 0);
    }

    #[test]
    fn test_fewer_old_than_bounds_keeps_plain_arithmetic() {
        // The special case requires max_capacity <= old count.
        let strategy = compute_restart_strategy(&spec(2, 1.0, 0.0, false), 1).unwrap();
        assert_eq!(strategy.max_capacity, 2);
        assert_eq!(strategy.nr_to_kill_immediately, 0);
    }
}
