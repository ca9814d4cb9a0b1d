//! Instances and tasks.
//!
//! An instance is a single scheduled unit of a run spec; for applications
//! it contains one task, for pods one task per container. Tasks are the
//! units the external manager launches and reports on.

use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::IpAddr;
use uuid::Uuid;

use crate::app::UnreachableStrategy;
use crate::condition::Condition;
use crate::error::ValidationError;
use crate::path::PathId;

/// Identifier of an instance: the owning run spec plus an opaque suffix.
///
/// The string form is `<safe-spec-id>.<uuid>`, e.g.
/// `prod_web_api.0b1f8b6e-...`; path segments never contain underscores, so
/// the form is reversible.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId {
    /// Id of the run spec this instance belongs to.
    pub run_spec_id: PathId,
    /// Opaque unique suffix.
    pub uuid: Uuid,
}

impl InstanceId {
    /// Mint a fresh id for the given run spec.
    pub fn for_run_spec(run_spec_id: PathId) -> Self {
        InstanceId { run_spec_id, uuid: Uuid::new_v4() }
    }

    /// Parse the string form.
    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        let (prefix, uuid) = s
            .rsplit_once('.')
            .ok_or_else(|| ValidationError::InvalidPath(s.to_string()))?;
        let uuid =
            Uuid::parse_str(uuid).map_err(|_| ValidationError::InvalidPath(s.to_string()))?;
        let path = format!("/{}", prefix.replace('_', "/"));
        Ok(InstanceId { run_spec_id: PathId::parse(&path)?, uuid })
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.run_spec_id.safe_id(), self.uuid)
    }
}

impl Serialize for InstanceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for InstanceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        InstanceId::parse(&s).map_err(D::Error::custom)
    }
}

/// Identifier of a task within an instance. Application tasks use the
/// instance id verbatim; pod tasks append the container name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId {
    /// The owning instance.
    pub instance: InstanceId,
    /// Container name for pod tasks; `None` for application tasks.
    pub container: Option<String>,
}

impl TaskId {
    /// The task id of an application instance.
    pub fn for_instance(instance: InstanceId) -> Self {
        TaskId { instance, container: None }
    }

    /// The task id of one pod container.
    pub fn for_container(instance: InstanceId, container: &str) -> Self {
        TaskId { instance, container: Some(container.to_string()) }
    }

    /// Parse the string form: the segment after the uuid, if present, names
    /// the container.
    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        // Find the uuid segment: 36 chars, parses as a Uuid.
        let parts: Vec<&str> = s.split('.').collect();
        for (i, part) in parts.iter().enumerate() {
            if Uuid::parse_str(part).is_ok() {
                let instance = InstanceId::parse(&parts[..=i].join("."))?;
                let container = if i + 1 < parts.len() {
                    Some(parts[i + 1..].join("."))
                } else {
                    None
                };
                return Ok(TaskId { instance, container });
            }
        }
        Err(ValidationError::InvalidPath(s.to_string()))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.container {
            Some(container) => write!(f, "{}.{}", self.instance, container),
            None => write!(f, "{}", self.instance),
        }
    }
}

impl Serialize for TaskId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TaskId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        TaskId::parse(&s).map_err(D::Error::custom)
    }
}

/// A typed agent attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    /// Text attribute.
    Text(String),
    /// Scalar attribute.
    Scalar(f64),
}

impl AttributeValue {
    /// Render the value the way constraints compare it.
    pub fn as_text(&self) -> String {
        match self {
            AttributeValue::Text(s) => s.clone(),
            AttributeValue::Scalar(v) => v.to_string(),
        }
    }
}

/// A named agent attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    /// Attribute name.
    pub name: String,
    /// Attribute value.
    pub value: AttributeValue,
}

/// Where an instance was placed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    /// Agent hostname.
    pub host: String,
    /// External manager agent id, once known.
    pub agent_id: Option<String>,
    /// Agent attributes observed at match time.
    #[serde(default)]
    pub attributes: Vec<Attribute>,
}

impl AgentInfo {
    /// Attribute lookup; `hostname` resolves to the agent host.
    pub fn attribute(&self, field: &str) -> Option<String> {
        if field == "hostname" {
            return Some(self.host.clone());
        }
        self.attributes.iter().find(|a| a.name == field).map(|a| a.value.as_text())
    }
}

/// Resources held for a resident task while nothing is running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Reservation {
    /// Ids of the persistent volumes covered by the reservation.
    #[serde(default)]
    pub volume_ids: Vec<String>,
    /// Framework principal the reservation is labeled with.
    pub principal: Option<String>,
    /// Reservation labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// How a task relates to reservations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskVariant {
    /// Resources held but nothing launched.
    Reserved {
        /// The reservation being held.
        reservation: Reservation,
    },
    /// A plain stateless launch.
    LaunchedEphemeral,
    /// A launch on top of an existing reservation.
    LaunchedOnReservation {
        /// Ids of the persistent volumes in use.
        volume_ids: Vec<String>,
    },
}

/// Network placement of a running task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct NetworkInfo {
    /// IP addresses reported by the external manager.
    #[serde(default)]
    pub ip_addresses: Vec<IpAddr>,
    /// Host ports granted at match time, in declared order.
    #[serde(default)]
    pub host_ports: Vec<u16>,
}

/// Status of a single task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    /// When the launch was accepted.
    pub staged_at: DateTime<Utc>,
    /// When the task reported running, if it did.
    pub started_at: Option<DateTime<Utc>>,
    /// Current condition.
    pub condition: Condition,
    /// When the task was first observed unreachable; cleared on
    /// re-observation.
    pub unreachable_since: Option<DateTime<Utc>>,
    /// Network placement.
    #[serde(default)]
    pub network_info: NetworkInfo,
    /// Health flag from the last external status, if reported.
    pub healthy: Option<bool>,
}

/// A single executor-level workload belonging to an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Task id.
    pub id: TaskId,
    /// Current status.
    pub status: TaskStatus,
    /// Reservation relationship.
    pub variant: TaskVariant,
}

impl Task {
    /// Whether the task only holds a reservation.
    pub fn is_reserved(&self) -> bool {
        matches!(self.variant, TaskVariant::Reserved { .. })
    }
}

/// Condition, timestamps and health of an instance as a whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceState {
    /// Current condition, derived from the instance's tasks.
    pub condition: Condition,
    /// When this condition was entered.
    pub since: DateTime<Utc>,
    /// When the instance last became active, if it ever did.
    pub active_since: Option<DateTime<Utc>>,
    /// Aggregate health, once known.
    pub healthy: Option<bool>,
}

impl InstanceState {
    /// Derive the instance condition from task conditions. The most urgent
    /// condition wins; an instance is `Running` only when every task runs.
    pub fn derive_condition<'a>(conditions: impl Iterator<Item = &'a Condition>) -> Condition {
        const PRIORITY: [Condition; 14] = [
            Condition::Error,
            Condition::Failed,
            Condition::Gone,
            Condition::Dropped,
            Condition::Unreachable,
            Condition::UnreachableInactive,
            Condition::Killing,
            Condition::Killed,
            Condition::Staging,
            Condition::Starting,
            Condition::Created,
            Condition::Reserved,
            Condition::Finished,
            Condition::Unknown,
        ];
        let present: BTreeSet<u8> = conditions.map(|c| *c as u8).collect();
        if present.is_empty() {
            return Condition::Unknown;
        }
        for candidate in PRIORITY {
            if present.contains(&(candidate as u8)) {
                return candidate;
            }
        }
        Condition::Running
    }
}

/// A single scheduled unit of a run spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    /// Instance id.
    pub id: InstanceId,
    /// Placement of the instance.
    pub agent: AgentInfo,
    /// Aggregate state.
    pub state: InstanceState,
    /// Tasks keyed by id.
    pub tasks: BTreeMap<TaskId, Task>,
    /// Version of the run spec that produced this instance. Monotonic
    /// across updates to a given instance.
    pub run_spec_version: DateTime<Utc>,
    /// Copy of the owning spec's unreachable policy.
    pub unreachable_strategy: UnreachableStrategy,
}

impl Instance {
    /// Id of the owning run spec.
    pub fn run_spec_id(&self) -> &PathId {
        &self.id.run_spec_id
    }

    /// Whether the instance occupies a fleet slot.
    pub fn is_active(&self) -> bool {
        self.state.condition.is_active()
    }

    /// Whether every task of the instance runs.
    pub fn is_running(&self) -> bool {
        self.state.condition == Condition::Running
    }

    /// Whether the instance is out of contact.
    pub fn is_unreachable(&self) -> bool {
        self.state.condition.is_unreachable()
    }

    /// Whether the instance reached a terminal condition.
    pub fn is_terminal(&self) -> bool {
        self.state.condition.is_terminal()
    }

    /// Whether the instance only holds reservations.
    pub fn is_reserved_only(&self) -> bool {
        !self.tasks.is_empty() && self.tasks.values().all(Task::is_reserved)
    }

    /// Recompute the aggregate state from the tasks, keeping `since` when
    /// the condition does not change.
    pub fn refresh_state(&mut self, now: DateTime<Utc>) {
        let condition =
            InstanceState::derive_condition(self.tasks.values().map(|t| &t.status.condition));
        if condition != self.state.condition {
            self.state.since = now;
            self.state.condition = condition;
        }
        if condition == Condition::Running && self.state.active_since.is_none() {
            self.state.active_since = Some(now);
        }
        if condition.is_terminal() {
            self.state.active_since = None;
        }
    }
}
