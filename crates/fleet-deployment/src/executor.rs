//! The deployment executor.
//!
//! Drives plans step by step: steps run strictly sequentially, the actions
//! within one step concurrently (they affect disjoint specs by
//! construction). At most one deployment may touch a run spec at a time; a
//! conflicting submission fails unless forced, in which case the in-flight
//! plans are shut down first. Cancellation without force rolls the world
//! back to the plan's original root.

use chrono::Utc;
use futures::future::{Either, select};
use indexmap::IndexMap;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

use fleet_model::events::{
    DeploymentFailed, DeploymentInfo, DeploymentStepFailure, DeploymentStepSuccess,
    DeploymentSuccess, GroupChangeFailed, GroupChangeSuccess,
};
use fleet_model::{DeploymentPlan, Group, PathId};
use fleet_scheduler::GroupRepository;

use crate::controllers::{StepContext, run_action};
use crate::planner::plan_deployment;
use crate::{Error, Result};

/// How long controllers get to wind down after a shutdown signal before
/// they are terminated unconditionally.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Where a live deployment currently stands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    /// Steps are executing.
    Running,
    /// A shutdown signal was sent; waiting for controllers to wind down.
    Canceling,
}

/// Observable state of one live deployment.
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentSummary {
    /// Plan id.
    pub id: String,
    /// Run specs the plan touches.
    pub affected: BTreeSet<PathId>,
    /// 1-based index of the step in flight; 0 before the first step.
    pub current_step: usize,
    /// Total step count.
    pub total_steps: usize,
    /// Execution status.
    pub status: DeploymentStatus,
}

struct DeploymentHandle {
    plan: DeploymentPlan,
    affected: BTreeSet<PathId>,
    shutdown: async_channel::Sender<()>,
    task: Option<smol::Task<()>>,
    current_step: Arc<AtomicUsize>,
    canceling: bool,
}

/// Owns and executes deployment plans; the live map keeps submission
/// order.
pub struct DeploymentManager {
    ctx: StepContext,
    groups: Arc<dyn GroupRepository>,
    deployments: Mutex<IndexMap<String, DeploymentHandle>>,
}

impl DeploymentManager {
    /// Assemble a manager.
    pub fn new(ctx: StepContext, groups: Arc<dyn GroupRepository>) -> Arc<Self> {
        Arc::new(DeploymentManager { ctx, groups, deployments: Mutex::new(IndexMap::new()) })
    }

    /// Plan and start the deployment converging the stored root onto
    /// `target`. Returns the plan id.
    pub async fn deploy_group_change(
        self: &Arc<Self>,
        target: Group,
        force: bool,
    ) -> Result<String> {
        let original = self.groups.root().await.map_err(fleet_scheduler::Error::from)?;
        let group_id = target.id.clone();
        let version = target.version;
        let outcome = match plan_deployment(&original, &target) {
            Ok(plan) => self.deploy(plan, force).await,
            Err(e) => Err(e),
        };
        match &outcome {
            Ok(_) => self.ctx.bus.publish(GroupChangeSuccess {
                group_id,
                version,
                timestamp: Utc::now(),
            }),
            Err(e) => self.ctx.bus.publish(GroupChangeFailed {
                group_id,
                reason: e.to_string(),
                timestamp: Utc::now(),
            }),
        }
        outcome
    }

    /// Kill specific instances and decrement their specs' declared counts
    /// accordingly (the `scale=true` kill flavor). Produces one scale
    /// deployment whose victim selection is pinned to the given instances.
    pub async fn kill_and_scale(
        self: &Arc<Self>,
        instance_ids: Vec<fleet_model::InstanceId>,
        force: bool,
    ) -> Result<String> {
        let original = self.groups.root().await.map_err(fleet_scheduler::Error::from)?;
        let mut target = original.clone();
        let now = Utc::now();

        let mut by_spec: IndexMap<PathId, Vec<fleet_model::InstanceId>> = IndexMap::new();
        for id in instance_ids {
            by_spec.entry(id.run_spec_id.clone()).or_default().push(id);
        }

        let mut actions = Vec::new();
        for (spec_id, victims) in by_spec {
            let spec = original
                .run_spec(&spec_id)
                .ok_or_else(|| Error::Plan(format!("unknown run spec {spec_id}")))?;
            let scale_to = spec.instances().saturating_sub(victims.len() as u32);
            target.scale_run_spec(&spec_id, scale_to, now)?;
            let scaled = target.run_spec(&spec_id).expect("spec scaled in place");
            actions.push(fleet_model::DeploymentAction::ScaleApplication {
                spec: scaled,
                scale_to,
                to_kill: Some(victims),
            });
        }

        let plan = DeploymentPlan::new(
            original,
            target,
            vec![fleet_model::DeploymentStep::new(actions)],
            now,
        );
        self.deploy(plan, force).await
    }

    /// Start executing a plan. A plan whose affected specs overlap a live
    /// deployment conflicts: without `force` the submission fails, with
    /// `force` the conflicting deployments are stopped (no rollback) first.
    pub async fn deploy(self: &Arc<Self>, plan: DeploymentPlan, force: bool) -> Result<String> {
        let affected = plan.affected_run_specs();
        let conflicting: Vec<String> = {
            let deployments = self.deployments.lock().unwrap();
            deployments
                .values()
                .filter(|h| !h.affected.is_disjoint(&affected))
                .map(|h| h.plan.id.clone())
                .collect()
        };
        if !conflicting.is_empty() {
            if !force {
                return Err(Error::Conflict { deployment_ids: conflicting });
            }
            for id in conflicting {
                warn!(plan = id, "force-canceling conflicting deployment");
                match self.cancel(&id, true).await {
                    // It may have finished on its own in the meantime.
                    Ok(()) | Err(Error::DeploymentNotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        // The target becomes the declared state as soon as the plan is
        // accepted.
        self.groups
            .store_root(&plan.target)
            .await
            .map_err(fleet_scheduler::Error::from)?;

        let plan_id = plan.id.clone();
        self.spawn_plan(plan, affected);
        Ok(plan_id)
    }

    fn spawn_plan(self: &Arc<Self>, plan: DeploymentPlan, affected: BTreeSet<PathId>) {
        let (shutdown_tx, shutdown_rx) = async_channel::bounded::<()>(1);
        let current_step = Arc::new(AtomicUsize::new(0));
        let plan_id = plan.id.clone();

        let task = smol::spawn({
            let this = self.clone();
            let plan = plan.clone();
            let current_step = current_step.clone();
            async move {
                let result =
                    this.run_plan(&plan, shutdown_rx, current_step).await;
                let now = Utc::now();
                match result {
                    Ok(()) => {
                        info!(plan = plan.id, "deployment finished");
                        this.ctx.bus.publish(DeploymentSuccess {
                            plan_id: plan.id.clone(),
                            timestamp: now,
                        });
                    }
                    Err(e) => {
                        warn!(plan = plan.id, "deployment failed: {e}");
                        this.ctx.bus.publish(DeploymentFailed {
                            plan_id: plan.id.clone(),
                            reason: e.to_string(),
                            timestamp: now,
                        });
                    }
                }
                this.deployments.lock().unwrap().shift_remove(&plan.id);
            }
        });

        self.deployments.lock().unwrap().insert(
            plan_id,
            DeploymentHandle {
                plan,
                affected,
                shutdown: shutdown_tx,
                task: Some(task),
                current_step,
                canceling: false,
            },
        );
    }

    async fn run_plan(
        &self,
        plan: &DeploymentPlan,
        shutdown: async_channel::Receiver<()>,
        current_step: Arc<AtomicUsize>,
    ) -> Result<()> {
        for (index, step) in plan.steps.iter().enumerate() {
            let step_number = index + 1;
            current_step.store(step_number, Ordering::SeqCst);
            self.ctx.bus.publish(DeploymentInfo {
                plan_id: plan.id.clone(),
                step: step_number,
                timestamp: Utc::now(),
            });
            info!(plan = plan.id, step = step_number, actions = step.actions.len(), "step starting");

            let outcomes = futures::future::join_all(
                step.actions
                    .iter()
                    .map(|action| run_action(&self.ctx, action, shutdown.clone())),
            )
            .await;

            if let Some(position) = outcomes.iter().position(Result::is_err) {
                let action = step.actions[position].kind().to_string();
                let error = outcomes
                    .into_iter()
                    .find_map(Result::err)
                    .expect("position() found an error");
                self.ctx.bus.publish(DeploymentStepFailure {
                    plan_id: plan.id.clone(),
                    step: step_number,
                    action,
                    reason: error.to_string(),
                    timestamp: Utc::now(),
                });
                return Err(error);
            }
            self.ctx.bus.publish(DeploymentStepSuccess {
                plan_id: plan.id.clone(),
                step: step_number,
                timestamp: Utc::now(),
            });
        }
        Ok(())
    }

    /// Cancel a live deployment.
    ///
    /// `force=false` rolls back: after the controllers stop, a synthesized
    /// plan converges from the cancelled plan's target back to its original
    /// root. The cancelled plan's failure event is published before the
    /// rollback's success event. `force=true` only stops the plan.
    pub async fn cancel(self: &Arc<Self>, plan_id: &str, force: bool) -> Result<()> {
        let mut handle = {
            let mut deployments = self.deployments.lock().unwrap();
            let Some(mut handle) = deployments.shift_remove(plan_id) else {
                return Err(Error::DeploymentNotFound(plan_id.to_string()));
            };
            handle.canceling = true;
            handle
        };

        info!(plan = plan_id, force, "canceling deployment");
        // Closing the channel is the shutdown broadcast: every controller
        // selecting on it observes the closure.
        handle.shutdown.close();

        if let Some(task) = handle.task.take() {
            let grace = smol::Timer::after(SHUTDOWN_GRACE);
            match select(task, grace).await {
                Either::Left((_, _)) => {}
                Either::Right((_, task)) => {
                    warn!(plan = plan_id, "controllers exceeded shutdown grace, terminating");
                    task.cancel().await;
                    self.ctx.bus.publish(DeploymentFailed {
                        plan_id: plan_id.to_string(),
                        reason: "canceled after shutdown grace".to_string(),
                        timestamp: Utc::now(),
                    });
                    self.deployments.lock().unwrap().shift_remove(plan_id);
                }
            }
        }

        if force {
            // A force-stopped plan leaves no pending demand behind; the
            // specs themselves stay defined.
            for id in &handle.affected {
                self.ctx.queue.purge(id);
            }
        } else {
            let (current_target, original) = handle.plan.revert_pair();
            let rollback = plan_deployment(&current_target, &original)?;
            info!(plan = plan_id, rollback = rollback.id, "executing rollback plan");
            Box::pin(self.deploy(rollback, true)).await?;
        }
        Ok(())
    }

    /// Summaries of all live deployments.
    pub fn list(&self) -> Vec<DeploymentSummary> {
        let deployments = self.deployments.lock().unwrap();
        deployments.values().map(summary).collect()
    }

    /// Summary of one live deployment.
    pub fn find(&self, plan_id: &str) -> Option<DeploymentSummary> {
        self.deployments.lock().unwrap().get(plan_id).map(summary)
    }

    /// Leadership was lost: shut down every live controller. Plans are not
    /// rolled back; the next leader recovers from the repository.
    pub async fn on_leadership_lost(self: &Arc<Self>) {
        let ids: Vec<String> =
            self.deployments.lock().unwrap().keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.cancel(&id, true).await {
                warn!(plan = id, "shutdown on leadership loss failed: {e}");
            }
        }
    }
}

fn summary(handle: &DeploymentHandle) -> DeploymentSummary {
    DeploymentSummary {
        id: handle.plan.id.clone(),
        affected: handle.affected.clone(),
        current_step: handle.current_step.load(Ordering::SeqCst),
        total_steps: handle.plan.steps.len(),
        status: if handle.canceling {
            DeploymentStatus::Canceling
        } else {
            DeploymentStatus::Running
        },
    }
}
