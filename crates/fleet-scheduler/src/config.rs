//! Scheduler-wide configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Recognized scheduler options with their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Upper bound on instances launched from a single offer.
    pub max_instances_per_offer: usize,
    /// Minimum pause between offer-revival requests to the external
    /// manager.
    pub min_revive_offers_interval: Duration,
    /// Delay before the first task reconciliation pass.
    pub reconciliation_initial_delay: Duration,
    /// Interval between task reconciliation passes.
    pub reconciliation_interval: Duration,
    /// Delay before the first unreachable-expunge pass.
    pub task_lost_expunge_initial_delay: Duration,
    /// Interval between unreachable-expunge passes.
    pub task_lost_expunge_interval: Duration,
    /// Retention of expunged-instance tombstones.
    pub task_lost_expunge_gc: Duration,
    /// Resource roles accepted when a spec does not name its own.
    pub default_accepted_resource_roles: BTreeSet<String>,
    /// Network joined by container-network specs without an explicit name.
    pub default_network_name: Option<String>,
    /// Prefix for generated task environment variables.
    pub env_vars_prefix: Option<String>,
    /// Principal reservations are labeled with.
    pub framework_principal: Option<String>,
    /// Feature toggles.
    pub enabled_features: BTreeSet<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            max_instances_per_offer: 5,
            min_revive_offers_interval: Duration::from_secs(5),
            reconciliation_initial_delay: Duration::from_secs(15),
            reconciliation_interval: Duration::from_secs(600),
            task_lost_expunge_initial_delay: Duration::from_secs(300),
            task_lost_expunge_interval: Duration::from_secs(30),
            task_lost_expunge_gc: Duration::from_secs(75),
            default_accepted_resource_roles: BTreeSet::from(["*".to_string()]),
            default_network_name: None,
            env_vars_prefix: None,
            framework_principal: None,
            enabled_features: BTreeSet::new(),
        }
    }
}
