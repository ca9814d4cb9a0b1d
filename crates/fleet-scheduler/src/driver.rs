//! Seams to the external resource manager.
//!
//! The scheduler core never speaks the wire protocol itself; it drives
//! these traits and consumes the status updates they deliver.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use fleet_model::{Instance, TaskId};

use crate::Result;
use crate::launch::LaunchDescriptor;
use crate::offer::OfferId;

/// A task status update pushed by the external manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    /// The task the update refers to.
    pub task_id: TaskId,
    /// Raw reason, e.g. `TASK_RUNNING` or `TASK_FAILED`.
    pub reason: String,
    /// Free-form message from the manager.
    pub message: Option<String>,
    /// Health flag for manager-executed checks.
    pub healthy: Option<bool>,
    /// Agent id the update came from.
    pub agent_id: Option<String>,
    /// Manager-side timestamp.
    pub timestamp: DateTime<Utc>,
}

impl StatusUpdate {
    /// A bare update with the given reason, timestamped now.
    pub fn new(task_id: TaskId, reason: &str) -> Self {
        StatusUpdate {
            task_id,
            reason: reason.to_string(),
            message: None,
            healthy: None,
            agent_id: None,
            timestamp: Utc::now(),
        }
    }
}

/// Operations the scheduler invokes on the external resource manager.
#[async_trait]
pub trait SchedulerDriver: Send + Sync {
    /// Launch tasks against an offer.
    async fn launch(&self, offer_id: &OfferId, tasks: Vec<LaunchDescriptor>) -> Result<()>;
    /// Kill one task.
    async fn kill(&self, task_id: &TaskId) -> Result<()>;
    /// Ask the manager to re-send the status of the given tasks.
    async fn reconcile(&self, task_ids: Vec<TaskId>) -> Result<()>;
    /// Acknowledge a processed status update.
    async fn acknowledge(&self, update: &StatusUpdate) -> Result<()>;
}

/// Why an instance is being killed; published with kill events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KillReason {
    /// Health checks exceeded their failure threshold.
    FailedHealthChecks,
    /// More instances are active than declared.
    OverCapacity,
    /// A deployment is scaling the spec down.
    DeploymentScaling,
    /// A deployment is stopping the spec.
    DeploymentStopping,
    /// A rolling restart is replacing old instances.
    DeploymentUpgrading,
    /// A lost instance reappeared and its stand-in must go.
    DuplicateResolution,
}

impl std::fmt::Display for KillReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            KillReason::FailedHealthChecks => "failed_health_checks",
            KillReason::OverCapacity => "over_capacity",
            KillReason::DeploymentScaling => "deployment_scaling",
            KillReason::DeploymentStopping => "deployment_stopping",
            KillReason::DeploymentUpgrading => "deployment_upgrading",
            KillReason::DuplicateResolution => "duplicate_resolution",
        };
        f.write_str(name)
    }
}

/// Kills instances through the external manager and resolves when the kill
/// was issued. Implementations never kill unreachable instances: the
/// manager cannot act on them, so the expunge policy handles them instead.
#[async_trait]
pub trait KillService: Send + Sync {
    /// Kill one instance.
    async fn kill_instance(&self, instance: &Instance, reason: KillReason) -> Result<()>;

    /// Kill several instances.
    async fn kill_instances(&self, instances: &[Instance], reason: KillReason) -> Result<()> {
        for instance in instances {
            self.kill_instance(instance, reason).await?;
        }
        Ok(())
    }
}

/// Kill service backed by a [`SchedulerDriver`].
pub struct DriverKillService<D> {
    driver: D,
}

impl<D: SchedulerDriver> DriverKillService<D> {
    /// Wrap a driver.
    pub fn new(driver: D) -> Self {
        DriverKillService { driver }
    }
}

#[async_trait]
impl<D: SchedulerDriver> KillService for DriverKillService<D> {
    async fn kill_instance(&self, instance: &Instance, reason: KillReason) -> Result<()> {
        if instance.is_unreachable() {
            // The external manager cannot reach the agent; the unreachable
            // policy expunges or the kill happens on re-observation.
            warn!(instance = %instance.id, %reason, "skipping kill of unreachable instance");
            return Ok(());
        }
        info!(instance = %instance.id, %reason, "killing instance");
        for task_id in instance.tasks.keys() {
            self.driver.kill(task_id).await?;
        }
        Ok(())
    }
}
