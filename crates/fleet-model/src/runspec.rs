//! The run-specification sum over applications and pods.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::app::{
    AppSpec, BackoffStrategy, KillSelection, Resources, UnreachableStrategy, UpgradeStrategy,
    VersionInfo,
};
use crate::error::Result;
use crate::path::PathId;
use crate::pod::PodSpec;

/// A deployable unit: either a replicated single-container application or a
/// co-scheduled pod.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunSpec {
    /// Application variant.
    App(AppSpec),
    /// Pod variant.
    Pod(PodSpec),
}

impl RunSpec {
    /// The spec's absolute id.
    pub fn id(&self) -> &PathId {
        match self {
            RunSpec::App(app) => &app.id,
            RunSpec::Pod(pod) => &pod.id,
        }
    }

    /// Desired instance count.
    pub fn instances(&self) -> u32 {
        match self {
            RunSpec::App(app) => app.instances,
            RunSpec::Pod(pod) => pod.instances,
        }
    }

    /// Version timestamp of this rendition.
    pub fn version(&self) -> DateTime<Utc> {
        match self {
            RunSpec::App(app) => app.version,
            RunSpec::Pod(pod) => pod.version,
        }
    }

    /// Config-change vs. scaling bookkeeping.
    pub fn version_info(&self) -> VersionInfo {
        match self {
            RunSpec::App(app) => app.version_info,
            RunSpec::Pod(pod) => pod.version_info,
        }
    }

    /// Declared dependencies.
    pub fn dependencies(&self) -> &BTreeSet<PathId> {
        match self {
            RunSpec::App(app) => &app.dependencies,
            RunSpec::Pod(pod) => &pod.dependencies,
        }
    }

    /// Rollout safety parameters.
    pub fn upgrade_strategy(&self) -> UpgradeStrategy {
        match self {
            RunSpec::App(app) => app.upgrade_strategy,
            RunSpec::Pod(pod) => pod.upgrade_strategy,
        }
    }

    /// Launch backoff parameters.
    pub fn backoff(&self) -> BackoffStrategy {
        match self {
            RunSpec::App(app) => app.backoff,
            RunSpec::Pod(pod) => pod.backoff,
        }
    }

    /// Unreachable-instance policy.
    pub fn unreachable_strategy(&self) -> UnreachableStrategy {
        match self {
            RunSpec::App(app) => app.unreachable_strategy,
            RunSpec::Pod(pod) => pod.unreachable_strategy,
        }
    }

    /// Kill ordering for scale-down and duplicate resolution.
    pub fn kill_selection(&self) -> KillSelection {
        match self {
            RunSpec::App(app) => app.kill_selection,
            RunSpec::Pod(pod) => pod.kill_selection,
        }
    }

    /// Whether the spec holds reservations and persistent volumes.
    pub fn is_resident(&self) -> bool {
        match self {
            RunSpec::App(app) => app.is_resident(),
            RunSpec::Pod(_) => false,
        }
    }

    /// Aggregate per-instance resource demand.
    pub fn aggregate_resources(&self) -> Resources {
        match self {
            RunSpec::App(app) => app.resources,
            RunSpec::Pod(pod) => pod.aggregate_resources(),
        }
    }

    /// Declared ports in positional order.
    pub fn declared_ports(&self) -> Vec<crate::app::DeclaredPort> {
        match self {
            RunSpec::App(app) => app.declared_ports(),
            RunSpec::Pod(pod) => pod.declared_ports(),
        }
    }

    /// Whether the spec declares health checks.
    pub fn has_health_checks(&self) -> bool {
        match self {
            RunSpec::App(app) => !app.health_checks.is_empty(),
            RunSpec::Pod(pod) => pod.has_health_checks(),
        }
    }

    /// Whether the spec declares readiness checks.
    pub fn has_readiness_checks(&self) -> bool {
        match self {
            RunSpec::App(app) => !app.readiness_checks.is_empty(),
            RunSpec::Pod(_) => false,
        }
    }

    /// Whether `other` differs from `self` in configuration (not merely in
    /// instance count). Drives the restart-vs-scale planning decision.
    pub fn is_upgrade(&self, other: &RunSpec) -> bool {
        match (self, other) {
            (RunSpec::App(a), RunSpec::App(b)) => !a.config_equivalent(b),
            (RunSpec::Pod(a), RunSpec::Pod(b)) => !a.config_equivalent(b),
            _ => true,
        }
    }

    /// Whether `other` merely changes the instance count.
    pub fn is_scale_change(&self, other: &RunSpec) -> bool {
        !self.is_upgrade(other) && self.instances() != other.instances()
    }

    /// Replace the instance count, recording a scaling-only change.
    pub fn with_instances(&self, instances: u32, now: DateTime<Utc>) -> RunSpec {
        match self {
            RunSpec::App(app) => {
                let mut app = app.clone();
                app.instances = instances;
                app.version = now;
                app.version_info = app.version_info.with_scaling(now);
                RunSpec::App(app)
            }
            RunSpec::Pod(pod) => {
                let mut pod = pod.clone();
                pod.instances = instances;
                pod.version = now;
                pod.version_info = pod.version_info.with_scaling(now);
                RunSpec::Pod(pod)
            }
        }
    }

    /// Validate the underlying spec.
    pub fn validate(&self) -> Result<()> {
        match self {
            RunSpec::App(app) => app.validate(),
            RunSpec::Pod(pod) => pod.validate(),
        }
    }
}

impl From<AppSpec> for RunSpec {
    fn from(app: AppSpec) -> Self {
        RunSpec::App(app)
    }
}

impl From<PodSpec> for RunSpec {
    fn from(pod: PodSpec) -> Self {
        RunSpec::Pod(pod)
    }
}
