//! Typed event messages published on the in-process event bus.
//!
//! Events carry timestamps and the identifiers observers need; there is no
//! ordering guarantee across distinct event types. Every type is `Clone`
//! because the bus fans each message out to all subscribers of its type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::condition::Condition;
use crate::instance::{InstanceId, TaskId};
use crate::path::PathId;

/// A task status update arrived from the external manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdateEvent {
    /// Task the update refers to.
    pub task_id: TaskId,
    /// Condition after interpretation.
    pub condition: Condition,
    /// Raw reason string from the external manager.
    pub reason: String,
    /// When the update was processed.
    pub timestamp: DateTime<Utc>,
}

/// An instance changed condition or version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceChanged {
    /// The instance.
    pub id: InstanceId,
    /// Owning run spec.
    pub run_spec_id: PathId,
    /// Run spec version the instance is on.
    pub run_spec_version: DateTime<Utc>,
    /// Condition after the change.
    pub condition: Condition,
    /// When the tracker acknowledged the change.
    pub timestamp: DateTime<Utc>,
}

/// A lost instance was re-observed: its condition returned to `Running`
/// from `Unreachable` or `UnreachableInactive`. Published in addition to
/// the plain [`InstanceChanged`] event, and only for genuine
/// re-observations — an ordinary launch reaching `Running` never emits
/// this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceReappeared {
    /// The re-observed instance.
    pub id: InstanceId,
    /// Owning run spec.
    pub run_spec_id: PathId,
    /// Run spec version the instance is on.
    pub run_spec_version: DateTime<Utc>,
    /// When the tracker acknowledged the re-observation.
    pub timestamp: DateTime<Utc>,
}

/// An instance's aggregate health flipped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceHealthChanged {
    /// The instance.
    pub id: InstanceId,
    /// Owning run spec.
    pub run_spec_id: PathId,
    /// Run spec version the instance is on.
    pub run_spec_version: DateTime<Utc>,
    /// New aggregate health, if known.
    pub healthy: Option<bool>,
    /// When the engine observed the transition.
    pub timestamp: DateTime<Utc>,
}

/// A health check failed for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedHealthCheck {
    /// Owning run spec.
    pub run_spec_id: PathId,
    /// The instance that failed.
    pub instance_id: InstanceId,
    /// Rendered check description.
    pub check: String,
    /// When the failure was observed.
    pub timestamp: DateTime<Utc>,
}

/// The health engine decided to kill a persistently unhealthy task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnhealthyInstanceKill {
    /// Owning run spec.
    pub run_spec_id: PathId,
    /// The instance being killed.
    pub instance_id: InstanceId,
    /// Consecutive failures that triggered the kill.
    pub consecutive_failures: u32,
    /// When the kill intent was published.
    pub timestamp: DateTime<Utc>,
}

/// One readiness probe produced a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadinessResult {
    /// Name of the readiness check.
    pub name: String,
    /// Task that was probed.
    pub task_id: TaskId,
    /// Whether the probe reported ready.
    pub ready: bool,
    /// Last response body, when the check preserves it.
    pub last_response: Option<String>,
    /// When the probe completed.
    pub timestamp: DateTime<Utc>,
}

/// A deployment started executing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentInfo {
    /// Plan id.
    pub plan_id: String,
    /// Current step index (1-based), 0 before the first step.
    pub step: usize,
    /// When execution reached this point.
    pub timestamp: DateTime<Utc>,
}

/// A deployment step finished successfully.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentStepSuccess {
    /// Plan id.
    pub plan_id: String,
    /// Step index (1-based).
    pub step: usize,
    /// When the step completed.
    pub timestamp: DateTime<Utc>,
}

/// A deployment step failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentStepFailure {
    /// Plan id.
    pub plan_id: String,
    /// Step index (1-based).
    pub step: usize,
    /// The failing action's kind.
    pub action: String,
    /// Failure rendition.
    pub reason: String,
    /// When the step failed.
    pub timestamp: DateTime<Utc>,
}

/// A deployment finished successfully.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentSuccess {
    /// Plan id.
    pub plan_id: String,
    /// When the plan completed.
    pub timestamp: DateTime<Utc>,
}

/// A deployment failed or was cancelled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentFailed {
    /// Plan id.
    pub plan_id: String,
    /// Failure rendition, including cancellation reasons.
    pub reason: String,
    /// When the plan failed.
    pub timestamp: DateTime<Utc>,
}

/// A group mutation was accepted and produced a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupChangeSuccess {
    /// The mutated group.
    pub group_id: PathId,
    /// New root version.
    pub version: DateTime<Utc>,
    /// When the change was accepted.
    pub timestamp: DateTime<Utc>,
}

/// A group mutation was rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupChangeFailed {
    /// The group the mutation targeted.
    pub group_id: PathId,
    /// Rejection rendition.
    pub reason: String,
    /// When the change was rejected.
    pub timestamp: DateTime<Utc>,
}

/// An API-surface mutation was observed (posted by the API layer).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiPostEvent {
    /// Request URI as seen by the API layer.
    pub uri: String,
    /// The run spec the request addressed.
    pub run_spec_id: PathId,
    /// When the request was handled.
    pub timestamp: DateTime<Utc>,
}
