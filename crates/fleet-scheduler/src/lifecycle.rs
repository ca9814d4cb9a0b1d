//! Lifecycle interpretation and the unreachable-instance policy.
//!
//! Maps external status reasons onto conditions, selects kill victims, and
//! hosts the periodic task that demotes and expunges unreachable instances
//! and resolves duplicates when a lost instance reappears.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use event_bus::EventBus;
use fleet_model::events::InstanceReappeared;
use fleet_model::{Condition, Instance, KillSelection};

use crate::Result;
use crate::config::SchedulerConfig;
use crate::driver::{KillReason, KillService, StatusUpdate};
use crate::repository::GroupRepository;
use crate::tracker::{InstanceTracker, InstanceUpdateOp};

/// Map a status reason from the external manager onto a condition. Unknown
/// reasons yield `None` and are dropped with a log line.
pub fn condition_from_reason(reason: &str) -> Option<Condition> {
    let condition = match reason {
        "TASK_STAGING" => Condition::Staging,
        "TASK_STARTING" => Condition::Starting,
        "TASK_RUNNING" => Condition::Running,
        "TASK_KILLING" => Condition::Killing,
        "TASK_KILLED" => Condition::Killed,
        "TASK_FINISHED" => Condition::Finished,
        "TASK_FAILED" => Condition::Failed,
        "TASK_ERROR" => Condition::Error,
        "TASK_GONE" | "TASK_GONE_BY_OPERATOR" => Condition::Gone,
        "TASK_DROPPED" => Condition::Dropped,
        "TASK_LOST" | "TASK_UNREACHABLE" => Condition::Unreachable,
        "TASK_UNKNOWN" => Condition::Unknown,
        _ => return None,
    };
    Some(condition)
}

/// Order instances for killing according to the spec's kill selection and
/// take the first `count`. Age is judged by when the instance first became
/// active, falling back to its current condition timestamp, so a freshly
/// re-observed instance does not look young.
pub fn select_victims(
    selection: KillSelection,
    mut candidates: Vec<Instance>,
    count: usize,
) -> Vec<Instance> {
    let age = |i: &Instance| i.state.active_since.unwrap_or(i.state.since);
    match selection {
        KillSelection::YoungestFirst => {
            candidates.sort_by_key(|i| std::cmp::Reverse(age(i)));
        }
        KillSelection::OldestFirst => {
            candidates.sort_by_key(age);
        }
    }
    candidates.truncate(count);
    candidates
}

/// Periodic policy over unreachable instances, plus duplicate resolution on
/// re-observation.
pub struct UnreachableMonitor {
    tracker: Arc<InstanceTracker>,
    kill_service: Arc<dyn KillService>,
    groups: Arc<dyn GroupRepository>,
    config: SchedulerConfig,
    bus: EventBus,
}

impl UnreachableMonitor {
    /// Assemble the monitor.
    pub fn new(
        tracker: Arc<InstanceTracker>,
        kill_service: Arc<dyn KillService>,
        groups: Arc<dyn GroupRepository>,
        config: SchedulerConfig,
        bus: EventBus,
    ) -> Self {
        UnreachableMonitor { tracker, kill_service, groups, config, bus }
    }

    /// Run until the shutdown channel closes. Scheduled with
    /// `task_lost_expunge_initial_delay`, then every
    /// `task_lost_expunge_interval`; reacts to re-observation signals in
    /// between.
    pub async fn run(self, shutdown: async_channel::Receiver<()>) {
        // Only the tracker's dedicated re-observation signal triggers
        // duplicate resolution. Ordinary Running transitions carry no such
        // signal, so a rolling restart's deliberate over-capacity phase is
        // invisible here.
        let reappearances = self.bus.subscribe::<InstanceReappeared>();
        let mut timer = smol::Timer::after(self.config.task_lost_expunge_initial_delay);
        loop {
            futures::select! {
                _ = shutdown.recv().fuse() => {
                    debug!("unreachable monitor shutting down");
                    return;
                }
                _ = (&mut timer).fuse() => {
                    if let Err(e) = self.expunge_pass(Utc::now()).await {
                        warn!("unreachable expunge pass failed: {e}");
                    }
                    timer = smol::Timer::after(self.config.task_lost_expunge_interval);
                }
                event = reappearances.recv().fuse() => match event {
                    Ok(event) => {
                        if let Err(e) = self.resolve_duplicates(&event).await {
                            warn!("duplicate resolution failed: {e}");
                        }
                    }
                    Err(_) => return,
                }
            }
        }
    }

    /// One pass over all instances: demote overdue `Unreachable` instances
    /// to `UnreachableInactive`, expunge those unreachable beyond
    /// `time_until_expunge`.
    pub async fn expunge_pass(&self, now: DateTime<Utc>) -> Result<()> {
        for (_, instances) in self.tracker.instances_by_spec().await {
            for instance in instances {
                let strategy = instance.unreachable_strategy;
                let unreachable_since = instance
                    .tasks
                    .values()
                    .filter_map(|t| t.status.unreachable_since)
                    .min();
                let Some(since) = unreachable_since else { continue };
                let unreachable_for = (now - since)
                    .to_std()
                    .unwrap_or_default();

                if instance.state.condition == Condition::UnreachableInactive
                    && unreachable_for >= strategy.time_until_expunge
                {
                    info!(instance = %instance.id, "expunging unreachable instance");
                    self.tracker
                        .process(InstanceUpdateOp::ForceExpunge {
                            instance_id: instance.id.clone(),
                        })
                        .await?;
                } else if instance.state.condition == Condition::Unreachable
                    && unreachable_for >= strategy.time_until_inactive
                {
                    info!(instance = %instance.id, "marking unreachable instance inactive");
                    for task_id in instance.tasks.keys() {
                        self.tracker
                            .process(InstanceUpdateOp::MesosUpdate {
                                task_id: task_id.clone(),
                                condition: Condition::UnreachableInactive,
                                status: StatusUpdate::new(task_id.clone(), "TASK_UNREACHABLE"),
                                now,
                            })
                            .await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// A lost instance was re-observed: if the spec now has more active
    /// instances than declared, kill the surplus per the spec's kill
    /// selection. The default `YoungestFirst` removes the replacement
    /// spawned in the meantime, not the survivor.
    pub async fn resolve_duplicates(&self, event: &InstanceReappeared) -> Result<()> {
        let root = self.groups.root().await?;
        let Some(spec) = root.run_spec(&event.run_spec_id) else {
            return Ok(());
        };
        let active: Vec<Instance> = self
            .tracker
            .spec_instances(&event.run_spec_id)
            .await
            .into_iter()
            .filter(Instance::is_active)
            .collect();
        let declared = spec.instances() as usize;
        if active.len() <= declared {
            return Ok(());
        }
        let surplus = active.len() - declared;
        info!(
            spec = %event.run_spec_id,
            surplus,
            "resolving duplicate instances after re-observation"
        );
        let victims = select_victims(spec.kill_selection(), active, surplus);
        self.kill_service
            .kill_instances(&victims, KillReason::DuplicateResolution)
            .await
    }
}
