//! The instance tracker.
//!
//! Authoritative in-memory index of all instances, keyed by run spec. Every
//! mutation flows through [`InstanceTracker::process`], which serializes
//! updates behind one async mutex, persists through the repository before
//! applying, and only then publishes events. Readers therefore never see a
//! state the repository has not committed.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

use event_bus::EventBus;
use fleet_model::events::{InstanceChanged, StatusUpdateEvent};
use fleet_model::{Condition, Instance, InstanceId, PathId, Task, TaskId};

use crate::Result;
use crate::driver::StatusUpdate;
use crate::repository::InstanceRepository;

/// A state mutation submitted to the tracker.
#[derive(Debug, Clone)]
pub enum InstanceUpdateOp {
    /// Register a freshly provisioned stateless instance.
    LaunchEphemeral(Instance),
    /// Register a launch on top of an existing reservation.
    LaunchOnReservation(Instance),
    /// Register a reservation-only instance.
    Reserve(Instance),
    /// Interpret a status update from the external manager.
    MesosUpdate {
        /// The task the update refers to.
        task_id: TaskId,
        /// Interpreted condition.
        condition: Condition,
        /// The raw update.
        status: StatusUpdate,
        /// Processing time.
        now: DateTime<Utc>,
    },
    /// A reservation was not used within its window.
    ReservationTimeout {
        /// The reserved instance.
        instance_id: InstanceId,
    },
    /// Remove an instance unconditionally.
    ForceExpunge {
        /// The instance to remove.
        instance_id: InstanceId,
    },
}

/// Result of one processed mutation.
#[derive(Debug, Clone)]
pub enum UpdateEffect {
    /// The instance changed.
    Update {
        /// Previous rendition, if the instance existed.
        old: Option<Instance>,
        /// New rendition.
        new: Instance,
        /// Events published for the change.
        events: Vec<InstanceChanged>,
    },
    /// The instance was removed.
    Expunge {
        /// The removed rendition.
        old: Instance,
        /// Events published for the removal.
        events: Vec<InstanceChanged>,
    },
    /// Nothing changed.
    Noop,
    /// The operation is illegal for the entity's current state. A bug in
    /// the caller or the external manager, surfaced but not fatal.
    Failure {
        /// What went wrong.
        reason: String,
    },
}

#[derive(Default)]
struct TrackerState {
    by_spec: HashMap<PathId, BTreeMap<InstanceId, Instance>>,
}

impl TrackerState {
    fn get(&self, id: &InstanceId) -> Option<&Instance> {
        self.by_spec.get(&id.run_spec_id).and_then(|m| m.get(id))
    }

    fn insert(&mut self, instance: Instance) {
        self.by_spec
            .entry(instance.id.run_spec_id.clone())
            .or_default()
            .insert(instance.id.clone(), instance);
    }

    fn remove(&mut self, id: &InstanceId) -> Option<Instance> {
        let map = self.by_spec.get_mut(&id.run_spec_id)?;
        let removed = map.remove(id);
        if map.is_empty() {
            self.by_spec.remove(&id.run_spec_id);
        }
        removed
    }
}

/// Single-writer index of instances.
pub struct InstanceTracker {
    state: futures::lock::Mutex<TrackerState>,
    repository: Arc<dyn InstanceRepository>,
    bus: EventBus,
}

impl InstanceTracker {
    /// A tracker persisting through the given repository and publishing on
    /// the given bus.
    pub fn new(repository: Arc<dyn InstanceRepository>, bus: EventBus) -> Self {
        InstanceTracker {
            state: futures::lock::Mutex::new(TrackerState::default()),
            repository,
            bus,
        }
    }

    /// Rehydrate the in-memory index from the repository, on start-up or
    /// leadership acquisition.
    pub async fn recover(&self) -> Result<usize> {
        let stored = self.repository.all().await?;
        let mut state = self.state.lock().await;
        let count = stored.len();
        for instance in stored {
            state.insert(instance);
        }
        Ok(count)
    }

    /// All instances, keyed by run spec.
    pub async fn instances_by_spec(&self) -> BTreeMap<PathId, Vec<Instance>> {
        let state = self.state.lock().await;
        state
            .by_spec
            .iter()
            .map(|(id, m)| (id.clone(), m.values().cloned().collect()))
            .collect()
    }

    /// Instances of one run spec.
    pub async fn spec_instances(&self, id: &PathId) -> Vec<Instance> {
        let state = self.state.lock().await;
        state.by_spec.get(id).map(|m| m.values().cloned().collect()).unwrap_or_default()
    }

    /// One instance by id.
    pub async fn instance(&self, id: &InstanceId) -> Option<Instance> {
        let state = self.state.lock().await;
        state.get(id).cloned()
    }

    /// All launched (non-reserved) tasks of one run spec.
    pub async fn launched_tasks(&self, id: &PathId) -> Vec<Task> {
        let state = self.state.lock().await;
        state
            .by_spec
            .get(id)
            .map(|m| {
                m.values()
                    .flat_map(|i| i.tasks.values())
                    .filter(|t| !t.is_reserved())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Apply one mutation: resolve the effect, persist it, apply it to the
    /// in-memory index, then publish events — in that order.
    pub async fn process(&self, op: InstanceUpdateOp) -> Result<UpdateEffect> {
        let mut state = self.state.lock().await;
        let effect = resolve(&state, op);

        match &effect {
            UpdateEffect::Update { old, new, events } => {
                self.repository.put(new).await?;
                state.insert(new.clone());
                for event in events {
                    self.bus.publish(event.clone());
                }
                let was_unreachable =
                    old.as_ref().is_some_and(|i| i.state.condition.is_unreachable());
                if was_unreachable && new.is_running() {
                    // The agent came back. This signal drives duplicate
                    // resolution; a plain launch reaching Running must not.
                    self.bus.publish(fleet_model::events::InstanceReappeared {
                        id: new.id.clone(),
                        run_spec_id: new.id.run_spec_id.clone(),
                        run_spec_version: new.run_spec_version,
                        timestamp: chrono::Utc::now(),
                    });
                }
                let old_health = old.as_ref().and_then(|i| i.state.healthy);
                if new.state.healthy != old_health {
                    self.bus.publish(fleet_model::events::InstanceHealthChanged {
                        id: new.id.clone(),
                        run_spec_id: new.id.run_spec_id.clone(),
                        run_spec_version: new.run_spec_version,
                        healthy: new.state.healthy,
                        timestamp: chrono::Utc::now(),
                    });
                }
            }
            UpdateEffect::Expunge { old, events } => {
                self.repository.delete(&old.id).await?;
                state.remove(&old.id);
                for event in events {
                    self.bus.publish(event.clone());
                }
            }
            UpdateEffect::Noop => {}
            UpdateEffect::Failure { reason } => {
                warn!(reason, "rejected instance update");
            }
        }
        Ok(effect)
    }

    /// Process a status update end to end and publish the raw update event.
    pub async fn process_status_update(
        &self,
        condition: Condition,
        status: StatusUpdate,
        now: DateTime<Utc>,
    ) -> Result<UpdateEffect> {
        let task_id = status.task_id.clone();
        let effect = self
            .process(InstanceUpdateOp::MesosUpdate {
                task_id: task_id.clone(),
                condition,
                status: status.clone(),
                now,
            })
            .await?;
        self.bus.publish(StatusUpdateEvent {
            task_id,
            condition,
            reason: status.reason,
            timestamp: now,
        });
        Ok(effect)
    }
}

fn changed_event(instance: &Instance, now: DateTime<Utc>) -> InstanceChanged {
    InstanceChanged {
        id: instance.id.clone(),
        run_spec_id: instance.id.run_spec_id.clone(),
        run_spec_version: instance.run_spec_version,
        condition: instance.state.condition,
        timestamp: now,
    }
}

/// Pure resolution of an op against the current state.
fn resolve(state: &TrackerState, op: InstanceUpdateOp) -> UpdateEffect {
    match op {
        InstanceUpdateOp::LaunchEphemeral(instance)
        | InstanceUpdateOp::LaunchOnReservation(instance)
        | InstanceUpdateOp::Reserve(instance) => {
            let old = state.get(&instance.id).cloned();
            if let Some(old) = &old {
                // Run-spec versions only move forward for one instance.
                if instance.run_spec_version < old.run_spec_version {
                    return UpdateEffect::Failure {
                        reason: format!(
                            "run spec version regression for {}: {} < {}",
                            instance.id, instance.run_spec_version, old.run_spec_version
                        ),
                    };
                }
            }
            let events = vec![changed_event(&instance, instance.state.since)];
            UpdateEffect::Update { old, new: instance, events }
        }

        InstanceUpdateOp::MesosUpdate { task_id, condition, status, now } => {
            let Some(instance) = state.get(&task_id.instance) else {
                debug!(task = %task_id, "status update for unknown instance");
                return UpdateEffect::Noop;
            };
            let Some(task) = instance.tasks.get(&task_id) else {
                return UpdateEffect::Noop;
            };
            if task.is_reserved() {
                // A reserved task has nothing running; the external manager
                // must not report on it.
                return UpdateEffect::Failure {
                    reason: format!("MesosUpdate on reserved task {task_id}"),
                };
            }
            if task.status.condition == condition && task.status.healthy == status.healthy {
                return UpdateEffect::Noop;
            }

            let previous_condition = instance.state.condition;
            let mut updated = instance.clone();
            {
                let task = updated.tasks.get_mut(&task_id).expect("task existence checked");
                task.status.condition = condition;
                task.status.healthy = status.healthy;
                match condition {
                    Condition::Running => {
                        if task.status.started_at.is_none() {
                            task.status.started_at = Some(now);
                        }
                        task.status.unreachable_since = None;
                    }
                    Condition::Unreachable => {
                        if task.status.unreachable_since.is_none() {
                            task.status.unreachable_since = Some(status.timestamp);
                        }
                    }
                    _ => {}
                }
                if let Some(agent_id) = status.agent_id {
                    updated.agent.agent_id = Some(agent_id);
                }
            }
            updated.refresh_state(now);
            // Delegated health checks report through status flags; the
            // instance is healthy only when every flagged task is.
            let task_flags: Vec<Option<bool>> =
                updated.tasks.values().map(|t| t.status.healthy).collect();
            updated.state.healthy = if task_flags.iter().any(|f| *f == Some(false)) {
                Some(false)
            } else if !task_flags.is_empty() && task_flags.iter().all(|f| *f == Some(true)) {
                Some(true)
            } else {
                instance.state.healthy
            };

            let mut events = Vec::new();
            if updated.state.condition != previous_condition {
                events.push(changed_event(&updated, now));
            }

            if updated.state.condition.is_terminal() {
                if updated.is_reserved_only() {
                    // Resident instances fall back to their reservation.
                    UpdateEffect::Update { old: Some(instance.clone()), new: updated, events }
                } else {
                    UpdateEffect::Expunge { old: updated, events }
                }
            } else {
                UpdateEffect::Update { old: Some(instance.clone()), new: updated, events }
            }
        }

        InstanceUpdateOp::ReservationTimeout { instance_id } => {
            let Some(instance) = state.get(&instance_id) else {
                return UpdateEffect::Noop;
            };
            if !instance.is_reserved_only() {
                return UpdateEffect::Failure {
                    reason: format!("reservation timeout for launched instance {instance_id}"),
                };
            }
            let mut old = instance.clone();
            old.refresh_state(Utc::now());
            let events = vec![changed_event(&old, Utc::now())];
            UpdateEffect::Expunge { old, events }
        }

        InstanceUpdateOp::ForceExpunge { instance_id } => {
            let Some(instance) = state.get(&instance_id) else {
                return UpdateEffect::Noop;
            };
            let mut old = instance.clone();
            let now = Utc::now();
            // Report the removal as Killed so observers see a final
            // transition.
            for task in old.tasks.values_mut() {
                if !task.status.condition.is_terminal() {
                    task.status.condition = Condition::Killed;
                }
            }
            old.refresh_state(now);
            let events = vec![changed_event(&old, now)];
            UpdateEffect::Expunge { old, events }
        }
    }
}
