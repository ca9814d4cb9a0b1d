//! # Fleet scheduler
//!
//! The offer-facing half of the orchestrator: matching declared demand
//! against resource offers, building launch descriptors with the task
//! environment contract, aggregating demand in the launch queue with
//! exponential backoff, tracking instances through a single-writer index
//! persisted before acknowledgement, and interpreting the lifecycle of
//! tasks reported by the external resource manager.
//!
//! The external manager itself is reached only through the seams in
//! [`driver`]; storage only through [`repository`].

#![warn(missing_docs)]
#![warn(unsafe_code)]

mod config;
mod constraints;
mod driver;
mod env;
mod launch;
mod lifecycle;
mod matching;
mod offer;
mod processor;
mod queue;
mod repository;
mod tracker;

pub use config::SchedulerConfig;
pub use constraints::{offer_matches_constraint, order_victims_for_constraints};
pub use driver::{DriverKillService, KillReason, KillService, SchedulerDriver, StatusUpdate};
pub use env::{ENV_KEY_LIMIT, ENV_VALUE_LIMIT, task_env};
pub use launch::{DiscoveryPort, DiscoveryScope, LaunchDescriptor, Provision, provision};
pub use lifecycle::{UnreachableMonitor, condition_from_reason, select_victims};
pub use matching::{
    ConsumedResource, NoMatchReason, OfferMatch, PortBinding, ResourceMatch, VolumeMatch,
    match_offer,
};
pub use offer::{
    DiskInfo, Offer, OfferId, OfferResource, PortRange, ReservationLabels, ResourceValue,
};
pub use processor::{OfferProcessor, ReconciliationLoop};
pub use queue::{LaunchQueue, QueueInfo, QueuedRequest};
pub use repository::{
    GroupRepository, InstanceRepository, MemoryRepository, RepositoryError, SledRepository,
};
pub use tracker::{InstanceTracker, InstanceUpdateOp, UpdateEffect};

/// Error types for scheduler operations.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The declared model failed validation.
    #[error("validation error: {0}")]
    Model(#[from] fleet_model::ValidationError),

    /// Durable storage failed; fatal to the running operation.
    #[error("repository error: {0}")]
    Repository(#[from] repository::RepositoryError),

    /// The external manager rejected or failed an operation.
    #[error("driver error: {0}")]
    Driver(String),

    /// An operation is illegal for the entity's current state.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}

/// Result type alias for scheduler operations.
pub type Result<T> = std::result::Result<T, Error>;
