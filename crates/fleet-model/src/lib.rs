//! # Fleet model
//!
//! Declarative model for the fleet orchestrator: hierarchical path ids,
//! application and pod run specifications, groups with dependency edges,
//! instances and tasks with their lifecycle conditions, deployment plan
//! data types, and the typed event messages published on the in-process
//! bus.
//!
//! The model is purely data: validation lives here, behavior lives in the
//! scheduler and deployment crates.

#![warn(missing_docs)]
#![warn(unsafe_code)]

mod app;
mod condition;
mod constraint;
mod error;
mod group;
mod health;
mod instance;
mod path;
mod plan;
mod pod;
mod runspec;

pub mod events;

pub use app::{
    AppSpec, BackoffStrategy, Container, DeclaredPort, DiskType, KillSelection, Network,
    PersistentVolume, PortDefinition, PortMapping, PortProtocol, Residency, Resources,
    UnreachableStrategy, UpgradeStrategy, VersionInfo, VolumeMount,
};
pub use condition::Condition;
pub use constraint::{Constraint, ConstraintOperator};
pub use error::{Result, ValidationError};
pub use group::Group;
pub use health::{
    CheckTiming, DEFAULT_GRACE_PERIOD, DEFAULT_INTERVAL, DEFAULT_MAX_CONSECUTIVE_FAILURES,
    DEFAULT_TIMEOUT, HealthCheckDef, HttpScheme, PortReference, ReadinessCheckDef,
};
pub use instance::{
    AgentInfo, Attribute, AttributeValue, Instance, InstanceId, InstanceState, NetworkInfo,
    Reservation, Task, TaskId, TaskStatus, TaskVariant,
};
pub use path::PathId;
pub use plan::{DeploymentAction, DeploymentPlan, DeploymentStep};
pub use pod::{Endpoint, PodContainer, PodSpec, PodVolume, PodVolumeMount};
pub use runspec::RunSpec;
