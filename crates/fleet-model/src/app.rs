//! Application run specifications.
//!
//! An application is a singleton-container replicated service. The spec
//! carries everything the matcher, the launch queue and the deployment
//! controllers need: resource demand, port declarations, placement
//! constraints, health and readiness checks, and the upgrade, backoff,
//! unreachable and kill-selection strategies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::constraint::Constraint;
use crate::error::{Result, ValidationError};
use crate::health::{HealthCheckDef, ReadinessCheckDef};
use crate::path::PathId;

/// Scalar resource demand of a single task.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    /// CPU shares.
    pub cpus: f64,
    /// Memory in MiB.
    pub mem: f64,
    /// Scratch disk in MiB.
    pub disk: f64,
    /// GPU count.
    pub gpus: f64,
}

impl Resources {
    /// Element-wise sum, used when aggregating pod containers.
    pub fn plus(&self, other: &Resources) -> Resources {
        Resources {
            cpus: self.cpus + other.cpus,
            mem: self.mem + other.mem,
            disk: self.disk + other.disk,
            gpus: self.gpus + other.gpus,
        }
    }
}

impl Default for Resources {
    fn default() -> Self {
        Resources { cpus: 1.0, mem: 128.0, disk: 0.0, gpus: 0.0 }
    }
}

/// Transport protocol of a declared port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PortProtocol {
    /// TCP.
    #[default]
    Tcp,
    /// UDP.
    Udp,
}

impl std::fmt::Display for PortProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortProtocol::Tcp => f.write_str("tcp"),
            PortProtocol::Udp => f.write_str("udp"),
        }
    }
}

/// A host-network port declaration. Port `0` requests a dynamic port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortDefinition {
    /// Requested host port; 0 means any free port from the offer.
    pub port: u16,
    /// Optional port name, surfaced in discovery info and `PORT_<name>`.
    pub name: Option<String>,
    /// Transport protocol.
    #[serde(default)]
    pub protocol: PortProtocol,
    /// Free-form labels attached to the discovery entry.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl PortDefinition {
    /// A dynamic unnamed TCP port.
    pub fn dynamic() -> Self {
        PortDefinition { port: 0, name: None, protocol: PortProtocol::Tcp, labels: BTreeMap::new() }
    }
}

/// A container-network port mapping. `host_port: None` keeps the port
/// container-only; `Some(0)` requests a dynamic host port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortMapping {
    /// Port inside the container network namespace.
    pub container_port: u16,
    /// Host port to map to, if any.
    pub host_port: Option<u16>,
    /// Optional port name.
    pub name: Option<String>,
    /// Transport protocol.
    #[serde(default)]
    pub protocol: PortProtocol,
}

/// Network attachment of a run spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Network {
    /// Share the agent host network.
    Host,
    /// Join a named container network.
    Container {
        /// Network name; the configured default applies when absent.
        name: Option<String>,
    },
}

/// Persistent volume disk type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DiskType {
    /// Agent root disk.
    #[default]
    Root,
    /// A path-backed disk slice.
    Path,
    /// A whole mounted disk; mount disks are consumed indivisibly.
    Mount,
}

/// A persistent volume declaration for resident tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistentVolume {
    /// Volume size in MiB.
    pub size_mb: u64,
    /// Disk type the volume must be placed on.
    #[serde(default)]
    pub disk_type: DiskType,
}

/// A volume mount inside the container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeMount {
    /// Mount point inside the container.
    pub container_path: String,
    /// Persistent volume backing the mount, if resident.
    pub persistent: Option<PersistentVolume>,
    /// Host path for plain bind mounts.
    pub host_path: Option<String>,
    /// Mount read-only.
    #[serde(default)]
    pub read_only: bool,
}

/// Container image and network configuration of an app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Container {
    /// Container image; absent for plain command apps.
    pub image: Option<String>,
    /// Port mappings when the app joins a container network.
    #[serde(default)]
    pub port_mappings: Vec<PortMapping>,
    /// Volume mounts.
    #[serde(default)]
    pub volumes: Vec<VolumeMount>,
}

/// Rollout safety parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UpgradeStrategy {
    /// Lower bound, as a fraction of the instance count, on ready instances
    /// during a rolling restart.
    pub minimum_health_capacity: f64,
    /// Upper bound, as a fraction of the instance count, on the bubble above
    /// the declared count during a rolling restart.
    pub maximum_over_capacity: f64,
}

impl Default for UpgradeStrategy {
    fn default() -> Self {
        UpgradeStrategy { minimum_health_capacity: 1.0, maximum_over_capacity: 1.0 }
    }
}

impl UpgradeStrategy {
    /// Conservative strategy for resident specs: never exceed capacity.
    pub fn for_resident() -> Self {
        UpgradeStrategy { minimum_health_capacity: 0.5, maximum_over_capacity: 0.0 }
    }

    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.minimum_health_capacity) {
            return Err(ValidationError::InvalidCapacity(
                "minimumHealthCapacity",
                self.minimum_health_capacity,
            ));
        }
        if !(0.0..=1.0).contains(&self.maximum_over_capacity) {
            return Err(ValidationError::InvalidCapacity(
                "maximumOverCapacity",
                self.maximum_over_capacity,
            ));
        }
        Ok(())
    }
}

/// Launch backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffStrategy {
    /// Initial delay after the first launch failure.
    pub backoff: Duration,
    /// Multiplier applied on each further failure.
    pub factor: f64,
    /// Ceiling for the delay.
    pub max_launch_delay: Duration,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy {
            backoff: Duration::from_secs(1),
            factor: 1.15,
            max_launch_delay: Duration::from_secs(3600),
        }
    }
}

/// Policy for instances whose agent stops reporting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UnreachableStrategy {
    /// Unreachable for this long becomes `UnreachableInactive`.
    pub time_until_inactive: Duration,
    /// Unreachable for this long is expunged from the tracker.
    pub time_until_expunge: Duration,
}

impl Default for UnreachableStrategy {
    fn default() -> Self {
        UnreachableStrategy {
            time_until_inactive: Duration::from_secs(300),
            time_until_expunge: Duration::from_secs(600),
        }
    }
}

/// Which instances die first when scaling down or resolving duplicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum KillSelection {
    /// Most recently started instances first.
    #[default]
    YoungestFirst,
    /// Longest-running instances first.
    OldestFirst,
}

/// Marker for stateful apps that hold reservations and persistent volumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Residency {
    /// How long to wait for the original agent before relaunch escalation.
    pub relaunch_escalation_timeout: Duration,
}

impl Default for Residency {
    fn default() -> Self {
        Residency { relaunch_escalation_timeout: Duration::from_secs(3600) }
    }
}

/// Distinguishes configuration mutations from pure scaling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VersionInfo {
    /// Last time the spec itself changed (not the instance count).
    pub last_config_change_at: DateTime<Utc>,
    /// Last time the instance count changed.
    pub last_scaling_at: DateTime<Utc>,
}

impl VersionInfo {
    /// Version info for a freshly created spec.
    pub fn new(version: DateTime<Utc>) -> Self {
        VersionInfo { last_config_change_at: version, last_scaling_at: version }
    }

    /// Record a scale-only change.
    pub fn with_scaling(self, now: DateTime<Utc>) -> Self {
        VersionInfo { last_scaling_at: now, ..self }
    }

    /// Record a configuration change.
    pub fn with_config_change(self, now: DateTime<Utc>) -> Self {
        VersionInfo { last_config_change_at: now, last_scaling_at: now }
    }
}

/// A single-container replicated application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppSpec {
    /// Absolute id of the app.
    pub id: PathId,
    /// Shell command to run; at least one of `cmd` and a container image is
    /// required.
    pub cmd: Option<String>,
    /// Argument vector, used instead of shell interpretation when set.
    #[serde(default)]
    pub args: Vec<String>,
    /// Container image and mounts.
    pub container: Option<Container>,
    /// Network attachments; host networking when empty.
    #[serde(default)]
    pub networks: Vec<Network>,
    /// Desired instance count.
    pub instances: u32,
    /// Per-task resource demand.
    #[serde(default)]
    pub resources: Resources,
    /// Host-network port declarations (ignored when port mappings exist).
    #[serde(default)]
    pub port_definitions: Vec<PortDefinition>,
    /// Forbid remapping: every declared port must be granted verbatim.
    #[serde(default)]
    pub require_ports: bool,
    /// Artifact URLs fetched into the task sandbox before launch.
    #[serde(default)]
    pub fetch: Vec<String>,
    /// User environment; overrides any generated variable of the same name.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Free-form labels, exported into the task environment.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Placement constraints.
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    /// Run-spec ids this app depends on.
    #[serde(default)]
    pub dependencies: BTreeSet<PathId>,
    /// Health checks.
    #[serde(default)]
    pub health_checks: Vec<HealthCheckDef>,
    /// Readiness checks, evaluated during deployments only.
    #[serde(default)]
    pub readiness_checks: Vec<ReadinessCheckDef>,
    /// Rollout safety parameters.
    #[serde(default)]
    pub upgrade_strategy: UpgradeStrategy,
    /// Launch backoff parameters.
    #[serde(default)]
    pub backoff: BackoffStrategy,
    /// Unreachable-instance policy.
    #[serde(default)]
    pub unreachable_strategy: UnreachableStrategy,
    /// Kill ordering for scale-down and duplicate resolution.
    #[serde(default)]
    pub kill_selection: KillSelection,
    /// Present for stateful apps holding reservations.
    pub residency: Option<Residency>,
    /// Grace period between SIGTERM and SIGKILL for task kills.
    pub task_kill_grace_period: Option<Duration>,
    /// Roles whose offered resources this app accepts; the scheduler-wide
    /// default applies when absent.
    pub accepted_resource_roles: Option<BTreeSet<String>>,
    /// Version timestamp of this rendition of the spec.
    pub version: DateTime<Utc>,
    /// Config-change vs. scaling bookkeeping.
    pub version_info: VersionInfo,
}

impl AppSpec {
    /// Minimal app with defaults, used as a starting point by builders and
    /// tests.
    pub fn new(id: PathId) -> Self {
        let now = Utc::now();
        AppSpec {
            id,
            cmd: None,
            args: Vec::new(),
            container: None,
            networks: Vec::new(),
            instances: 1,
            resources: Resources::default(),
            port_definitions: Vec::new(),
            require_ports: false,
            fetch: Vec::new(),
            env: BTreeMap::new(),
            labels: BTreeMap::new(),
            constraints: Vec::new(),
            dependencies: BTreeSet::new(),
            health_checks: Vec::new(),
            readiness_checks: Vec::new(),
            upgrade_strategy: UpgradeStrategy::default(),
            backoff: BackoffStrategy::default(),
            unreachable_strategy: UnreachableStrategy::default(),
            kill_selection: KillSelection::default(),
            residency: None,
            task_kill_grace_period: None,
            accepted_resource_roles: None,
            version: now,
            version_info: VersionInfo::new(now),
        }
    }

    /// Whether the app holds reservations and persistent volumes.
    pub fn is_resident(&self) -> bool {
        self.residency.is_some()
            || self.container.as_ref().is_some_and(|c| {
                c.volumes.iter().any(|v| v.persistent.is_some())
            })
    }

    /// Declared persistent volumes, in declaration order.
    pub fn persistent_volumes(&self) -> Vec<&VolumeMount> {
        self.container
            .as_ref()
            .map(|c| c.volumes.iter().filter(|v| v.persistent.is_some()).collect())
            .unwrap_or_default()
    }

    /// Declared ports in positional order. Container-only mappings yield
    /// `None` host ports but keep their slot.
    pub fn declared_ports(&self) -> Vec<DeclaredPort> {
        if let Some(container) = &self.container {
            if !container.port_mappings.is_empty() {
                return container
                    .port_mappings
                    .iter()
                    .map(|m| DeclaredPort {
                        host_port: m.host_port,
                        container_port: Some(m.container_port),
                        name: m.name.clone(),
                        protocol: m.protocol,
                    })
                    .collect();
            }
        }
        self.port_definitions
            .iter()
            .map(|d| DeclaredPort {
                host_port: Some(d.port),
                container_port: None,
                name: d.name.clone(),
                protocol: d.protocol,
            })
            .collect()
    }

    /// Whether two renditions describe the same configuration. Instance
    /// count, version and version bookkeeping are ignored: a pure scale
    /// change is not a config change.
    pub fn config_equivalent(&self, other: &AppSpec) -> bool {
        let mut a = self.clone();
        let mut b = other.clone();
        a.instances = 0;
        b.instances = 0;
        a.version = b.version;
        a.version_info = b.version_info;
        a == b
    }

    /// Validate structural invariants of the spec.
    pub fn validate(&self) -> Result<()> {
        if self.cmd.is_none()
            && self.args.is_empty()
            && self.container.as_ref().and_then(|c| c.image.as_ref()).is_none()
        {
            return Err(ValidationError::InvalidRunSpec(
                self.id.clone(),
                "one of cmd, args or a container image is required".to_string(),
            ));
        }
        self.upgrade_strategy.validate()?;
        if self.is_resident() && self.upgrade_strategy.maximum_over_capacity != 0.0 {
            return Err(ValidationError::InvalidRunSpec(
                self.id.clone(),
                "resident apps must use maximumOverCapacity 0".to_string(),
            ));
        }
        let mut seen = BTreeSet::new();
        for declared in self.declared_ports() {
            if let Some(port) = declared.host_port {
                if port != 0 && !seen.insert(port) {
                    return Err(ValidationError::DuplicatePort(port));
                }
                if port == 0 && self.require_ports {
                    return Err(ValidationError::RequirePortsWithDynamicPort);
                }
            }
        }
        Ok(())
    }
}

/// One positional slot of the declared port list.
#[derive(Debug, Clone, PartialEq)]
pub struct DeclaredPort {
    /// Requested host port: `None` container-only, `Some(0)` dynamic.
    pub host_port: Option<u16>,
    /// Container-side port for mapped and pod-endpoint slots.
    pub container_port: Option<u16>,
    /// Declared name.
    pub name: Option<String>,
    /// Transport protocol.
    pub protocol: PortProtocol,
}
