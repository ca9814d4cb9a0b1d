//! The scale controller: converge an existing spec onto a new instance
//! count, killing surplus instances or launching missing ones.

use futures::FutureExt;
use tracing::{debug, info};

use fleet_model::events::{InstanceChanged, InstanceHealthChanged, ReadinessResult};
use fleet_model::{Instance, InstanceId, RunSpec};
use fleet_scheduler::{KillReason, order_victims_for_constraints, select_victims};

use super::{StepContext, canceled};
use crate::Result;
use crate::readiness::ReadinessTracker;

pub(crate) async fn run_scale(
    ctx: &StepContext,
    spec: &RunSpec,
    scale_to: u32,
    to_kill: Option<&[InstanceId]>,
    shutdown: async_channel::Receiver<()>,
) -> Result<()> {
    let id = spec.id().clone();
    let target = scale_to as usize;

    let changed = ctx.bus.subscribe::<InstanceChanged>();
    let health_events = ctx.bus.subscribe::<InstanceHealthChanged>();
    let readiness_events = ctx.bus.subscribe::<ReadinessResult>();

    let instances = ctx.tracker.spec_instances(&id).await;
    let active: Vec<Instance> =
        instances.iter().filter(|i| i.is_active()).cloned().collect();
    info!(spec = %id, current = active.len(), target, "scale controller running");

    if active.len() > target {
        let surplus = active.len() - target;
        let victims: Vec<Instance> = match to_kill {
            // The caller picked its victims; honor the pick where it still
            // names live instances.
            Some(ids) => active
                .iter()
                .filter(|i| ids.contains(&i.id))
                .take(surplus)
                .cloned()
                .collect(),
            None => {
                let constraints: &[fleet_model::Constraint] = match spec {
                    RunSpec::App(app) => &app.constraints,
                    RunSpec::Pod(pod) => &pod.constraints,
                };
                let ordered =
                    select_victims(spec.kill_selection(), active.clone(), usize::MAX);
                let mut ordered = order_victims_for_constraints(constraints, ordered);
                ordered.truncate(surplus);
                ordered
            }
        };
        debug!(spec = %id, victims = victims.len(), "killing surplus instances");
        ctx.kill_service
            .kill_instances(&victims, KillReason::DeploymentScaling)
            .await
            .map_err(crate::Error::Scheduler)?;

        // Wait until the fleet shrank to the target.
        loop {
            let count = ctx
                .tracker
                .spec_instances(&id)
                .await
                .iter()
                .filter(|i| i.is_active())
                .count();
            if count <= target {
                info!(spec = %id, target, "scale-down complete");
                return Ok(());
            }
            futures::select! {
                _ = shutdown.recv().fuse() => return Err(canceled()),
                event = changed.recv().fuse() => {
                    if event.is_err() {
                        return Err(canceled());
                    }
                }
            }
        }
    }

    // Scale up (or already converged): missing instances come from the
    // queue and count once they satisfy the readiness decision rule.
    let mut readiness = ReadinessTracker::new(spec.clone());
    let version = spec.version();
    for instance in &active {
        if instance.run_spec_version == version {
            readiness.reconcile_running(instance, ctx.readiness.as_ref(), &ctx.bus);
        }
    }
    let missing = target.saturating_sub(active.len()) as u32;
    if missing > 0 {
        ctx.queue.add(spec.clone(), missing);
    }

    let complete = |ready_new: usize, older_active: usize| ready_new + older_active >= target;
    let older_active = |instances: &[Instance]| {
        instances
            .iter()
            .filter(|i| i.is_active() && i.run_spec_version != version)
            .count()
    };

    loop {
        let snapshot = ctx.tracker.spec_instances(&id).await;
        if complete(readiness.ready_count(), older_active(&snapshot)) {
            info!(spec = %id, target, "scale-up complete");
            return Ok(());
        }
        futures::select! {
            _ = shutdown.recv().fuse() => return Err(canceled()),
            event = changed.recv().fuse() => {
                let Ok(event) = event else { return Err(canceled()) };
                if event.run_spec_id != id {
                    continue;
                }
                let instance = ctx.tracker.instance(&event.id).await;
                readiness.note_instance_changed(
                    &event,
                    instance.as_ref(),
                    ctx.readiness.as_ref(),
                    &ctx.bus,
                );
                if event.condition.is_terminal() {
                    // Any loss during scale-up re-enters the queue.
                    ctx.queue.add(spec.clone(), 1);
                }
            }
            event = health_events.recv().fuse() => {
                let Ok(event) = event else { return Err(canceled()) };
                readiness.note_health_changed(&event);
            }
            event = readiness_events.recv().fuse() => {
                let Ok(event) = event else { return Err(canceled()) };
                readiness.note_readiness_result(&event);
            }
        }
    }
}
