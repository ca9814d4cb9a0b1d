//! The start controller: bring a freshly introduced spec up to its target
//! instance count, gated on the readiness decision rule.

use futures::FutureExt;
use tracing::{debug, info};

use fleet_model::RunSpec;
use fleet_model::events::{InstanceChanged, InstanceHealthChanged, ReadinessResult};

use super::{StepContext, canceled};
use crate::Result;
use crate::readiness::{ReadinessTracker, ReadinessUpdate};

pub(crate) async fn run_start(
    ctx: &StepContext,
    spec: &RunSpec,
    scale_to: u32,
    shutdown: async_channel::Receiver<()>,
) -> Result<()> {
    let id = spec.id().clone();
    let version = spec.version();
    let target = scale_to as usize;

    // Subscribe before acting so no event of our own launches is missed.
    let changed = ctx.bus.subscribe::<InstanceChanged>();
    let health_events = ctx.bus.subscribe::<InstanceHealthChanged>();
    let readiness_events = ctx.bus.subscribe::<ReadinessResult>();

    ctx.health.start_monitoring(spec);
    let mut readiness = ReadinessTracker::new(spec.clone());

    // Instances that already exist at this version count toward the goal.
    let existing = ctx.tracker.spec_instances(&id).await;
    let mut launched = 0usize;
    for instance in &existing {
        if instance.run_spec_version == version && instance.is_active() {
            launched += 1;
            readiness.reconcile_running(instance, ctx.readiness.as_ref(), &ctx.bus);
        }
    }

    let demand = target.saturating_sub(launched) as u32;
    if demand > 0 {
        ctx.queue.add(spec.clone(), demand);
    }
    info!(spec = %id, target, already_running = launched, "start controller running");

    if readiness.ready_count() >= target {
        return Ok(());
    }

    loop {
        let update = futures::select! {
            _ = shutdown.recv().fuse() => return Err(canceled()),
            event = changed.recv().fuse() => {
                let Ok(event) = event else { return Err(canceled()) };
                if event.run_spec_id != id || event.run_spec_version != version {
                    continue;
                }
                let instance = ctx.tracker.instance(&event.id).await;
                let update = readiness.note_instance_changed(
                    &event,
                    instance.as_ref(),
                    ctx.readiness.as_ref(),
                    &ctx.bus,
                );
                if event.condition.is_terminal() {
                    // The loss flows back into the queue, which re-launches
                    // to keep the demand whole.
                    debug!(spec = %id, instance = %event.id, "lost instance during start");
                    ctx.queue.add(spec.clone(), 1);
                }
                update
            }
            event = health_events.recv().fuse() => {
                let Ok(event) = event else { return Err(canceled()) };
                readiness.note_health_changed(&event)
            }
            event = readiness_events.recv().fuse() => {
                let Ok(event) = event else { return Err(canceled()) };
                readiness.note_readiness_result(&event)
            }
        };

        if matches!(update, ReadinessUpdate::BecameReady(_))
            && readiness.ready_count() >= target
        {
            info!(spec = %id, target, "start controller complete");
            return Ok(());
        }
    }
}
