//! Deployment plan data types.
//!
//! A plan is an ordered sequence of steps; each step is a set of actions
//! that are safe to execute concurrently because they affect disjoint run
//! specs. Plans are produced by the deployment planner and consumed by the
//! executor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::group::Group;
use crate::instance::InstanceId;
use crate::path::PathId;
use crate::runspec::RunSpec;

/// A single unit of deployment work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DeploymentAction {
    /// Launch a newly introduced run spec up to `scale_to` instances.
    StartApplication {
        /// The spec to start.
        spec: RunSpec,
        /// Target instance count for this step.
        scale_to: u32,
    },
    /// Adjust the instance count of an existing run spec.
    ScaleApplication {
        /// The spec to scale.
        spec: RunSpec,
        /// Target instance count.
        scale_to: u32,
        /// Specific victims to kill when scaling down, if the caller chose.
        to_kill: Option<Vec<InstanceId>>,
    },
    /// Replace every instance not running the spec's current version.
    RestartApplication {
        /// The spec to roll.
        spec: RunSpec,
    },
    /// Kill all instances and forget the spec.
    StopApplication {
        /// The spec to stop.
        spec: RunSpec,
    },
    /// Fetch artifacts into the local store before dependent steps run.
    ResolveArtifacts {
        /// URL to local-path mapping.
        urls: Vec<(String, String)>,
    },
}

impl DeploymentAction {
    /// The run spec this action affects, if any.
    pub fn run_spec(&self) -> Option<&RunSpec> {
        match self {
            DeploymentAction::StartApplication { spec, .. }
            | DeploymentAction::ScaleApplication { spec, .. }
            | DeploymentAction::RestartApplication { spec }
            | DeploymentAction::StopApplication { spec } => Some(spec),
            DeploymentAction::ResolveArtifacts { .. } => None,
        }
    }

    /// Short name used in events and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            DeploymentAction::StartApplication { .. } => "StartApplication",
            DeploymentAction::ScaleApplication { .. } => "ScaleApplication",
            DeploymentAction::RestartApplication { .. } => "RestartApplication",
            DeploymentAction::StopApplication { .. } => "StopApplication",
            DeploymentAction::ResolveArtifacts { .. } => "ResolveArtifacts",
        }
    }
}

/// A set of actions executed concurrently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DeploymentStep {
    /// The concurrent actions; they affect disjoint run specs.
    pub actions: Vec<DeploymentAction>,
}

impl DeploymentStep {
    /// A step with the given actions.
    pub fn new(actions: Vec<DeploymentAction>) -> Self {
        DeploymentStep { actions }
    }
}

/// An ordered deployment plan between two renditions of the root group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentPlan {
    /// Plan id, returned to callers for tracking and cancellation.
    pub id: String,
    /// The root group the plan starts from.
    pub original: Group,
    /// The root group the plan converges to.
    pub target: Group,
    /// Ordered steps.
    pub steps: Vec<DeploymentStep>,
    /// Version of the target root.
    pub version: DateTime<Utc>,
}

impl DeploymentPlan {
    /// Assemble a plan with a fresh id.
    pub fn new(
        original: Group,
        target: Group,
        steps: Vec<DeploymentStep>,
        version: DateTime<Utc>,
    ) -> Self {
        DeploymentPlan { id: Uuid::new_v4().to_string(), original, target, steps, version }
    }

    /// Ids of all run specs any step touches.
    pub fn affected_run_specs(&self) -> BTreeSet<PathId> {
        self.steps
            .iter()
            .flat_map(|s| s.actions.iter())
            .filter_map(|a| a.run_spec().map(|s| s.id().clone()))
            .collect()
    }

    /// Whether the plan changes anything at all.
    pub fn is_empty(&self) -> bool {
        self.steps.iter().all(|s| s.actions.is_empty())
    }

    /// A plan that undoes this one: from the currently-targeted rendition
    /// back to the original root.
    pub fn revert_pair(&self) -> (Group, Group) {
        (self.target.clone(), self.original.clone())
    }
}
