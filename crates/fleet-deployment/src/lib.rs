//! # Fleet deployment
//!
//! The convergence half of the orchestrator: diffing declared group trees
//! into ordered deployment plans, executing them step by step through
//! per-action controllers, and gating rollouts on health and readiness.
//!
//! Controllers are event-driven consumers: they subscribe to the in-process
//! bus before acting, push demand into the launch queue or kills into the
//! kill service, and complete when the tracker's events show the declared
//! state reached.

#![warn(missing_docs)]
#![warn(unsafe_code)]

mod controllers;
mod executor;
mod health;
mod planner;
mod readiness;

pub use controllers::{
    ArtifactResolver, HttpArtifactResolver, RestartStrategy, StepContext, compute_restart_strategy,
};
pub use executor::{DeploymentManager, DeploymentStatus, DeploymentSummary};
pub use health::{
    HealthDecision, HealthEngine, HealthProber, HealthResult, NetworkProber, TaskHealthState,
    resolve_probe_port,
};
pub use planner::plan_deployment;
pub use readiness::{
    HttpReadinessExecutor, ReadinessCheckExecutor, ReadinessSubscription, ReadinessTracker,
    ReadinessUpdate,
};

/// Error types for deployment operations.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Scheduler-side failure (tracker, queue, driver or storage).
    #[error("scheduler error: {0}")]
    Scheduler(#[from] fleet_scheduler::Error),

    /// The declared model failed validation.
    #[error("validation error: {0}")]
    Model(#[from] fleet_model::ValidationError),

    /// The planner rejected the requested change.
    #[error("{0}")]
    Plan(String),

    /// The change conflicts with in-flight deployments; retry with force.
    #[error("conflict with deployments: {}", deployment_ids.join(", "))]
    Conflict {
        /// Ids of the conflicting plans.
        deployment_ids: Vec<String>,
    },

    /// The controller was shut down before completing.
    #[error("canceled: {reason}")]
    Canceled {
        /// Why the controller stopped.
        reason: String,
    },

    /// A health or readiness probe could not be executed.
    #[error("health check error: {0}")]
    HealthCheck(String),

    /// Artifact resolution failed.
    #[error("artifact error: {0}")]
    Artifact(String),

    /// An unknown deployment id was referenced.
    #[error("deployment not found: {0}")]
    DeploymentNotFound(String),
}

/// Result type alias for deployment operations.
pub type Result<T> = std::result::Result<T, Error>;
