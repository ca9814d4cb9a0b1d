//! Pod run specifications.
//!
//! A pod is a co-scheduled group of containers sharing an execution
//! sandbox, network namespace and volumes. Each container becomes one task
//! of the pod's instance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::app::{
    BackoffStrategy, KillSelection, Network, PortProtocol, Resources, UnreachableStrategy,
    UpgradeStrategy, VersionInfo,
};
use crate::constraint::Constraint;
use crate::error::{Result, ValidationError};
use crate::health::HealthCheckDef;
use crate::path::PathId;

/// A network endpoint exposed by one pod container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Endpoint name, unique within the pod.
    pub name: String,
    /// Port inside the container network namespace, if any.
    pub container_port: Option<u16>,
    /// Host port to allocate; `Some(0)` requests a dynamic port, `None`
    /// keeps the endpoint container-only.
    pub host_port: Option<u16>,
    /// Transport protocol.
    #[serde(default)]
    pub protocol: PortProtocol,
}

/// A volume shared by the containers of a pod.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodVolume {
    /// Volume name referenced by container mounts.
    pub name: String,
    /// Host path backing the volume; ephemeral sandbox storage when absent.
    pub host_path: Option<String>,
}

/// A mount of a shared pod volume into one container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodVolumeMount {
    /// Name of the shared volume.
    pub volume: String,
    /// Mount point inside the container.
    pub mount_path: String,
    /// Mount read-only.
    #[serde(default)]
    pub read_only: bool,
}

/// One container of a pod.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodContainer {
    /// Container name, unique within the pod.
    pub name: String,
    /// Container image; inherits the sandbox when absent.
    pub image: Option<String>,
    /// Command to run.
    pub cmd: Option<String>,
    /// Per-container resource demand.
    #[serde(default)]
    pub resources: Resources,
    /// Endpoints exposed by this container.
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
    /// Optional health check for this container.
    pub health_check: Option<HealthCheckDef>,
    /// Environment for this container.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Mounts of shared pod volumes.
    #[serde(default)]
    pub volume_mounts: Vec<PodVolumeMount>,
}

/// A co-scheduled group of containers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodSpec {
    /// Absolute id of the pod.
    pub id: PathId,
    /// Ordered containers; order is preserved in task naming.
    pub containers: Vec<PodContainer>,
    /// Volumes shared between containers.
    #[serde(default)]
    pub volumes: Vec<PodVolume>,
    /// Network attachments; host networking when empty.
    #[serde(default)]
    pub networks: Vec<Network>,
    /// Desired instance count.
    pub instances: u32,
    /// Free-form labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Placement constraints.
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    /// Run-spec ids this pod depends on.
    #[serde(default)]
    pub dependencies: BTreeSet<PathId>,
    /// Rollout safety parameters.
    #[serde(default)]
    pub upgrade_strategy: UpgradeStrategy,
    /// Launch backoff parameters.
    #[serde(default)]
    pub backoff: BackoffStrategy,
    /// Unreachable-instance policy.
    #[serde(default)]
    pub unreachable_strategy: UnreachableStrategy,
    /// Kill ordering for scale-down.
    #[serde(default)]
    pub kill_selection: KillSelection,
    /// Version timestamp of this rendition of the spec.
    pub version: DateTime<Utc>,
    /// Config-change vs. scaling bookkeeping.
    pub version_info: VersionInfo,
}

impl PodSpec {
    /// Minimal pod with defaults.
    pub fn new(id: PathId) -> Self {
        let now = Utc::now();
        PodSpec {
            id,
            containers: Vec::new(),
            volumes: Vec::new(),
            networks: Vec::new(),
            instances: 1,
            labels: BTreeMap::new(),
            constraints: Vec::new(),
            dependencies: BTreeSet::new(),
            upgrade_strategy: UpgradeStrategy::default(),
            backoff: BackoffStrategy::default(),
            unreachable_strategy: UnreachableStrategy::default(),
            kill_selection: KillSelection::default(),
            version: now,
            version_info: VersionInfo::new(now),
        }
    }

    /// Aggregate resource demand over all containers.
    pub fn aggregate_resources(&self) -> Resources {
        self.containers
            .iter()
            .fold(Resources { cpus: 0.0, mem: 0.0, disk: 0.0, gpus: 0.0 }, |acc, c| {
                acc.plus(&c.resources)
            })
    }

    /// All endpoints in container order, flattened.
    pub fn endpoints(&self) -> Vec<(&PodContainer, &Endpoint)> {
        self.containers
            .iter()
            .flat_map(|c| c.endpoints.iter().map(move |e| (c, e)))
            .collect()
    }

    /// Declared ports in endpoint order, the same positional shape apps
    /// use.
    pub fn declared_ports(&self) -> Vec<crate::app::DeclaredPort> {
        self.endpoints()
            .into_iter()
            .map(|(_, e)| crate::app::DeclaredPort {
                host_port: e.host_port,
                container_port: e.container_port,
                name: Some(e.name.clone()),
                protocol: e.protocol,
            })
            .collect()
    }

    /// Whether any container declares a health check.
    pub fn has_health_checks(&self) -> bool {
        self.containers.iter().any(|c| c.health_check.is_some())
    }

    /// See [`crate::app::AppSpec::config_equivalent`].
    pub fn config_equivalent(&self, other: &PodSpec) -> bool {
        let mut a = self.clone();
        let mut b = other.clone();
        a.instances = 0;
        b.instances = 0;
        a.version = b.version;
        a.version_info = b.version_info;
        a == b
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        if self.containers.is_empty() {
            return Err(ValidationError::InvalidRunSpec(
                self.id.clone(),
                "a pod requires at least one container".to_string(),
            ));
        }
        let mut names = BTreeSet::new();
        for container in &self.containers {
            if !names.insert(container.name.as_str()) {
                return Err(ValidationError::InvalidRunSpec(
                    self.id.clone(),
                    format!("duplicate container name {}", container.name),
                ));
            }
        }
        let mut endpoint_names = BTreeSet::new();
        let volume_names: BTreeSet<&str> =
            self.volumes.iter().map(|v| v.name.as_str()).collect();
        for endpoint in self.containers.iter().flat_map(|c| c.endpoints.iter()) {
            if !endpoint_names.insert(endpoint.name.as_str()) {
                return Err(ValidationError::InvalidRunSpec(
                    self.id.clone(),
                    format!("duplicate endpoint name {}", endpoint.name),
                ));
            }
        }
        for container in &self.containers {
            for mount in &container.volume_mounts {
                if !volume_names.contains(mount.volume.as_str()) {
                    return Err(ValidationError::InvalidRunSpec(
                        self.id.clone(),
                        format!("unknown volume {} in container {}", mount.volume, container.name),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod() -> PodSpec {
        let mut pod = PodSpec::new(PathId::parse("/prod/pod").unwrap());
        pod.containers = vec![
            PodContainer {
                name: "web".to_string(),
                image: Some("nginx".to_string()),
                cmd: None,
                resources: Resources { cpus: 0.5, mem: 64.0, disk: 0.0, gpus: 0.0 },
                endpoints: vec![Endpoint {
                    name: "http".to_string(),
                    container_port: Some(80),
                    host_port: Some(0),
                    protocol: PortProtocol::Tcp,
                }],
                health_check: None,
                env: BTreeMap::new(),
                volume_mounts: vec![],
            },
            PodContainer {
                name: "sidecar".to_string(),
                image: None,
                cmd: Some("tail -f /dev/null".to_string()),
                resources: Resources { cpus: 0.1, mem: 32.0, disk: 0.0, gpus: 0.0 },
                endpoints: vec![],
                health_check: None,
                env: BTreeMap::new(),
                volume_mounts: vec![],
            },
        ];
        pod
    }

    #[test]
    fn test_aggregate_resources() {
        let total = pod().aggregate_resources();
        assert!((total.cpus - 0.6).abs() < f64::EPSILON);
        assert!((total.mem - 96.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_duplicate_container_names_rejected() {
        let mut p = pod();
        p.containers[1].name = "web".to_string();
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_unknown_volume_rejected() {
        let mut p = pod();
        p.containers[0].volume_mounts.push(PodVolumeMount {
            volume: "missing".to_string(),
            mount_path: "/data".to_string(),
            read_only: false,
        });
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_empty_pod_rejected() {
        let empty = PodSpec::new(PathId::parse("/p").unwrap());
        assert!(empty.validate().is_err());
    }
}
