//! Launch descriptor construction.
//!
//! Once an offer matches, the selection is turned into concrete launch
//! descriptors (one per task) plus the tracker-side instance record. The
//! descriptor carries everything the external manager needs: resources to
//! consume, command, environment, discovery info, network attachments,
//! delegated health checks and the kill policy.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::time::Duration;

use fleet_model::{
    AgentInfo, AppSpec, Condition, HealthCheckDef, Instance, InstanceId, InstanceState, Network,
    NetworkInfo, PathId, PodSpec, PortProtocol, RunSpec, Task, TaskId, TaskStatus, TaskVariant,
};

use crate::config::SchedulerConfig;
use crate::env::task_env;
use crate::matching::{ConsumedResource, ResourceMatch, VolumeMatch};
use crate::offer::{Offer, OfferId};

/// Whether a discovery port is reachable on the host or only inside the
/// container network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryScope {
    /// Exposed on the agent host.
    Host,
    /// Container-network only.
    Container,
}

/// One entry of the task's discovery info; one per declared port.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryPort {
    /// Declared name, if any.
    pub name: Option<String>,
    /// Transport protocol.
    pub protocol: PortProtocol,
    /// Host port when host-exposed, container port otherwise.
    pub port: u16,
    /// Visibility scope.
    pub scope: DiscoveryScope,
}

/// A concrete launch instruction for one task.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchDescriptor {
    /// Task to create.
    pub task_id: TaskId,
    /// Owning run spec.
    pub run_spec_id: PathId,
    /// Spec version being launched.
    pub run_spec_version: DateTime<Utc>,
    /// Agent the offer belongs to.
    pub agent_id: String,
    /// Offer being consumed.
    pub offer_id: OfferId,
    /// Scalar portions to consume, role-preserving.
    pub consumed: Vec<ConsumedResource>,
    /// Granted host ports in declared order.
    pub host_ports: Vec<u16>,
    /// Shell command.
    pub cmd: Option<String>,
    /// Argument vector.
    pub args: Vec<String>,
    /// Container image, if containerized.
    pub container_image: Option<String>,
    /// Task environment.
    pub env: BTreeMap<String, String>,
    /// Task labels.
    pub labels: BTreeMap<String, String>,
    /// Discovery info, one entry per declared port.
    pub discovery: Vec<DiscoveryPort>,
    /// Network attachments with defaults applied.
    pub networks: Vec<Network>,
    /// Health check executed by the external manager, if delegated.
    pub health_check: Option<HealthCheckDef>,
    /// Grace period between SIGTERM and SIGKILL.
    pub kill_grace: Option<Duration>,
    /// Persistent volumes to create or reuse.
    pub volumes: Vec<VolumeMatch>,
}

/// The instance record plus the launch descriptors produced from one match.
#[derive(Debug, Clone)]
pub struct Provision {
    /// Tracker-side instance record, in `Created` condition.
    pub instance: Instance,
    /// One descriptor per task.
    pub descriptors: Vec<LaunchDescriptor>,
}

/// Turn a matched offer into an instance and its launch descriptors.
pub fn provision(
    spec: &RunSpec,
    offer: &Offer,
    selection: &ResourceMatch,
    config: &SchedulerConfig,
    now: DateTime<Utc>,
) -> Provision {
    let instance_id = InstanceId::for_run_spec(spec.id().clone());
    match spec {
        RunSpec::App(app) => provision_app(app, instance_id, offer, selection, config, now),
        RunSpec::Pod(pod) => provision_pod(pod, instance_id, offer, selection, config, now),
    }
}

fn provision_app(
    app: &AppSpec,
    instance_id: InstanceId,
    offer: &Offer,
    selection: &ResourceMatch,
    config: &SchedulerConfig,
    now: DateTime<Utc>,
) -> Provision {
    let task_id = TaskId::for_instance(instance_id.clone());
    let env = task_env(
        app,
        &task_id,
        &offer.hostname,
        &selection.port_bindings,
        config.env_vars_prefix.as_deref(),
    );

    let declared = app.declared_ports();
    let discovery = declared
        .iter()
        .zip(selection.port_bindings.iter())
        .map(|(decl, binding)| match binding {
            Some(binding) => DiscoveryPort {
                name: decl.name.clone(),
                protocol: decl.protocol,
                port: binding.host_port,
                scope: DiscoveryScope::Host,
            },
            None => DiscoveryPort {
                name: decl.name.clone(),
                protocol: decl.protocol,
                port: decl.container_port.unwrap_or_default(),
                scope: DiscoveryScope::Container,
            },
        })
        .collect();

    let variant = if selection.volumes.is_empty() {
        TaskVariant::LaunchedEphemeral
    } else {
        TaskVariant::LaunchedOnReservation {
            volume_ids: selection.volumes.iter().map(|v| v.persistence_id.clone()).collect(),
        }
    };

    let descriptor = LaunchDescriptor {
        task_id: task_id.clone(),
        run_spec_id: app.id.clone(),
        run_spec_version: app.version,
        agent_id: offer.agent_id.clone(),
        offer_id: offer.id.clone(),
        consumed: selection.consumed.clone(),
        host_ports: selection.host_ports(),
        cmd: app.cmd.clone(),
        args: app.args.clone(),
        container_image: app.container.as_ref().and_then(|c| c.image.clone()),
        env,
        labels: app.labels.clone(),
        discovery,
        networks: resolve_networks(&app.networks, config),
        health_check: app.health_checks.iter().find(|c| c.delegated()).cloned(),
        kill_grace: app.task_kill_grace_period,
        volumes: selection.volumes.clone(),
    };

    let instance = new_instance(
        instance_id,
        offer,
        vec![(task_id, variant)],
        selection,
        app.version,
        app.unreachable_strategy,
        now,
    );
    Provision { instance, descriptors: vec![descriptor] }
}

fn provision_pod(
    pod: &PodSpec,
    instance_id: InstanceId,
    offer: &Offer,
    selection: &ResourceMatch,
    config: &SchedulerConfig,
    now: DateTime<Utc>,
) -> Provision {
    let mut descriptors = Vec::with_capacity(pod.containers.len());
    let mut tasks = Vec::with_capacity(pod.containers.len());
    // Bindings line up with the flattened endpoint order.
    let mut slot = 0usize;

    for container in &pod.containers {
        let task_id = TaskId::for_container(instance_id.clone(), &container.name);
        let mut discovery = Vec::with_capacity(container.endpoints.len());
        let mut host_ports = Vec::new();
        for endpoint in &container.endpoints {
            let binding = selection.port_bindings.get(slot).and_then(|b| b.as_ref());
            slot += 1;
            match binding {
                Some(binding) => {
                    host_ports.push(binding.host_port);
                    discovery.push(DiscoveryPort {
                        name: Some(endpoint.name.clone()),
                        protocol: endpoint.protocol,
                        port: binding.host_port,
                        scope: DiscoveryScope::Host,
                    });
                }
                None => discovery.push(DiscoveryPort {
                    name: Some(endpoint.name.clone()),
                    protocol: endpoint.protocol,
                    port: endpoint.container_port.unwrap_or_default(),
                    scope: DiscoveryScope::Container,
                }),
            }
        }

        descriptors.push(LaunchDescriptor {
            task_id: task_id.clone(),
            run_spec_id: pod.id.clone(),
            run_spec_version: pod.version,
            agent_id: offer.agent_id.clone(),
            offer_id: offer.id.clone(),
            consumed: selection.consumed.clone(),
            host_ports,
            cmd: container.cmd.clone(),
            args: Vec::new(),
            container_image: container.image.clone(),
            env: container.env.clone(),
            labels: pod.labels.clone(),
            discovery,
            networks: resolve_networks(&pod.networks, config),
            health_check: container.health_check.clone().filter(HealthCheckDef::delegated),
            kill_grace: None,
            volumes: Vec::new(),
        });
        tasks.push((task_id, TaskVariant::LaunchedEphemeral));
    }

    let instance = new_instance(
        instance_id,
        offer,
        tasks,
        selection,
        pod.version,
        pod.unreachable_strategy,
        now,
    );
    Provision { instance, descriptors }
}

fn resolve_networks(networks: &[Network], config: &SchedulerConfig) -> Vec<Network> {
    networks
        .iter()
        .map(|n| match n {
            Network::Container { name: None } => {
                Network::Container { name: config.default_network_name.clone() }
            }
            other => other.clone(),
        })
        .collect()
}

#[allow(clippy::too_many_arguments)]
fn new_instance(
    id: InstanceId,
    offer: &Offer,
    tasks: Vec<(TaskId, TaskVariant)>,
    selection: &ResourceMatch,
    run_spec_version: DateTime<Utc>,
    unreachable_strategy: fleet_model::UnreachableStrategy,
    now: DateTime<Utc>,
) -> Instance {
    let host_ports = selection.host_ports();
    let tasks: BTreeMap<TaskId, Task> = tasks
        .into_iter()
        .map(|(task_id, variant)| {
            (
                task_id.clone(),
                Task {
                    id: task_id,
                    status: TaskStatus {
                        staged_at: now,
                        started_at: None,
                        condition: Condition::Created,
                        unreachable_since: None,
                        network_info: NetworkInfo {
                            ip_addresses: Vec::new(),
                            host_ports: host_ports.clone(),
                        },
                        healthy: None,
                    },
                    variant,
                },
            )
        })
        .collect();

    Instance {
        id,
        agent: AgentInfo {
            host: offer.hostname.clone(),
            agent_id: Some(offer.agent_id.clone()),
            attributes: offer.attributes.clone(),
        },
        state: InstanceState {
            condition: Condition::Created,
            since: now,
            active_since: None,
            healthy: None,
        },
        tasks,
        run_spec_version,
        unreachable_strategy,
    }
}

