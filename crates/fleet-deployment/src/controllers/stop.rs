//! The stop controller: tear a spec down completely and forget it.

use futures::FutureExt;
use tracing::{debug, info};

use fleet_model::RunSpec;
use fleet_model::events::InstanceChanged;
use fleet_scheduler::{InstanceUpdateOp, KillReason};

use super::{StepContext, canceled};
use crate::{Error, Result};

pub(crate) async fn run_stop(
    ctx: &StepContext,
    spec: &RunSpec,
    shutdown: async_channel::Receiver<()>,
) -> Result<()> {
    let id = spec.id().clone();
    let changed = ctx.bus.subscribe::<InstanceChanged>();

    ctx.health.stop_monitoring(&id);
    ctx.queue.purge(&id);

    let instances = ctx.tracker.spec_instances(&id).await;
    info!(spec = %id, instances = instances.len(), "stop controller running");

    for instance in &instances {
        if instance.is_unreachable() || !instance.is_active() {
            // Nothing the external manager can kill; drop the record.
            debug!(instance = %instance.id, "expunging instance on stop");
            ctx.tracker
                .process(InstanceUpdateOp::ForceExpunge { instance_id: instance.id.clone() })
                .await
                .map_err(Error::Scheduler)?;
        } else {
            ctx.kill_service
                .kill_instance(instance, KillReason::DeploymentStopping)
                .await
                .map_err(Error::Scheduler)?;
        }
    }

    loop {
        if ctx.tracker.spec_instances(&id).await.is_empty() {
            info!(spec = %id, "stop complete");
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
