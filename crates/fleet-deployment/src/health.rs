//! The health engine.
//!
//! One worker per (spec, check definition) probes the spec's running tasks
//! on a periodic timer. HTTP(S) probes run the blocking client on the
//! blocking pool so no event-loop consumer ever blocks on probe I/O; TCP
//! probes use the async networking stack. Delegated checks (manager-side
//! HTTP/TCP and command checks) are not probed here: their verdicts arrive
//! as health flags on task status updates.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use event_bus::EventBus;
use fleet_model::events::{FailedHealthCheck, InstanceHealthChanged, UnhealthyInstanceKill};
use fleet_model::{
    CheckTiming, Condition, HealthCheckDef, HttpScheme, PathId, PortReference, RunSpec,
};
use fleet_scheduler::{InstanceTracker, KillReason, KillService};

/// Outcome of one probe.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthResult {
    /// Whether the probe succeeded.
    pub healthy: bool,
    /// Failure rendition, if any.
    pub message: Option<String>,
}

impl HealthResult {
    /// A passing result.
    pub fn healthy() -> Self {
        HealthResult { healthy: true, message: None }
    }

    /// A failing result with a message.
    pub fn unhealthy(message: impl Into<String>) -> Self {
        HealthResult { healthy: false, message: Some(message.into()) }
    }
}

/// Executes a single probe against one task.
#[async_trait]
pub trait HealthProber: Send + Sync {
    /// Probe `host` (and `port`, when the check wants one).
    async fn probe(&self, check: &HealthCheckDef, host: &str, port: Option<u16>) -> HealthResult;
}

/// Default prober: blocking HTTP client on the blocking pool, async TCP
/// connects with a timeout race.
pub struct NetworkProber;

#[async_trait]
impl HealthProber for NetworkProber {
    async fn probe(&self, check: &HealthCheckDef, host: &str, port: Option<u16>) -> HealthResult {
        match check {
            HealthCheckDef::Http { scheme, path, timing, .. } => {
                let Some(port) = port else {
                    return HealthResult::unhealthy("no port to probe");
                };
                let scheme_str = match scheme {
                    HttpScheme::Http => "http",
                    HttpScheme::Https => "https",
                };
                let url = format!("{scheme_str}://{host}:{port}{path}");
                let timeout = timing.timeout;
                let insecure = *scheme == HttpScheme::Https;
                smol::unblock(move || {
                    let client = reqwest::blocking::Client::builder()
                        .timeout(timeout)
                        .danger_accept_invalid_certs(insecure)
                        .build();
                    let client = match client {
                        Ok(client) => client,
                        Err(e) => return HealthResult::unhealthy(e.to_string()),
                    };
                    match client.get(&url).send() {
                        Ok(response) if response.status().as_u16() < 400 => {
                            HealthResult::healthy()
                        }
                        Ok(response) => HealthResult::unhealthy(format!(
                            "status {} from {url}",
                            response.status()
                        )),
                        Err(e) => HealthResult::unhealthy(e.to_string()),
                    }
                })
                .await
            }
            HealthCheckDef::Tcp { timing, .. } => {
                let Some(port) = port else {
                    return HealthResult::unhealthy("no port to probe");
                };
                let connect = async_net::TcpStream::connect((host, port)).fuse();
                let mut connect = Box::pin(connect);
                let mut deadline = smol::Timer::after(timing.timeout);
                futures::select! {
                    result = connect => match result {
                        Ok(_) => HealthResult::healthy(),
                        Err(e) => HealthResult::unhealthy(e.to_string()),
                    },
                    _ = (&mut deadline).fuse() => {
                        HealthResult::unhealthy(format!("connect timeout to {host}:{port}"))
                    }
                }
            }
            // Delegated checks never reach a local prober.
            other => HealthResult::unhealthy(format!(
                "{} checks are executed by the external manager",
                if other.delegated() { "delegated" } else { "unsupported" }
            )),
        }
    }
}

/// Resolve which granted host port a check's port reference points at.
/// `host_ports` is the granted list, i.e. one entry per host-exposed
/// declared slot in declared order.
pub fn resolve_probe_port(
    port: &PortReference,
    spec: &RunSpec,
    host_ports: &[u16],
) -> Option<u16> {
    let declared = spec.declared_ports();
    match port {
        PortReference::Literal(p) => Some(*p),
        PortReference::Index(wanted) => {
            if declared.is_empty() {
                return host_ports.get(*wanted).copied();
            }
            let mut granted = 0usize;
            for (slot, decl) in declared.iter().enumerate() {
                if slot == *wanted {
                    return if decl.host_port.is_some() {
                        host_ports.get(granted).copied()
                    } else {
                        None
                    };
                }
                if decl.host_port.is_some() {
                    granted += 1;
                }
            }
            None
        }
        PortReference::Name(wanted) => {
            let mut granted = 0usize;
            for decl in &declared {
                if decl.name.as_deref() == Some(wanted.as_str()) {
                    return if decl.host_port.is_some() {
                        host_ports.get(granted).copied()
                    } else {
                        None
                    };
                }
                if decl.host_port.is_some() {
                    granted += 1;
                }
            }
            None
        }
    }
}

/// What one state fold decided.
#[derive(Debug, Clone, PartialEq)]
pub enum HealthDecision {
    /// The task's aliveness flipped.
    Transition(bool),
    /// The failure threshold was crossed; kill the instance.
    Kill,
}

/// Per-task probe bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct TaskHealthState {
    /// Consecutive failures observed outside the grace window.
    pub consecutive_failures: u32,
    /// First successful probe, ends grace suppression permanently.
    pub first_success: Option<DateTime<Utc>>,
    /// Last published aliveness.
    pub alive: Option<bool>,
    /// Whether a kill intent was already published for this streak.
    pub kill_sent: bool,
}

impl TaskHealthState {
    /// Fold one probe result. The failure threshold is evaluated against
    /// the already-updated counter, so the probe that brings the streak to
    /// `max_consecutive_failures` is the one that triggers the kill.
    pub fn update(
        &mut self,
        result: &HealthResult,
        now: DateTime<Utc>,
        launched_at: DateTime<Utc>,
        timing: &CheckTiming,
    ) -> Vec<HealthDecision> {
        let mut decisions = Vec::new();
        if result.healthy {
            if self.first_success.is_none() {
                self.first_success = Some(now);
            }
            self.consecutive_failures = 0;
            self.kill_sent = false;
            if self.alive != Some(true) {
                self.alive = Some(true);
                decisions.push(HealthDecision::Transition(true));
            }
            return decisions;
        }

        let in_grace = self.first_success.is_none()
            && (now - launched_at).to_std().unwrap_or_default() < timing.grace_period;
        if in_grace {
            debug!("suppressing health failure within grace period");
            return decisions;
        }

        self.consecutive_failures += 1;
        if self.alive != Some(false) {
            self.alive = Some(false);
            decisions.push(HealthDecision::Transition(false));
        }
        if self.consecutive_failures >= timing.max_consecutive_failures && !self.kill_sent {
            self.kill_sent = true;
            decisions.push(HealthDecision::Kill);
        }
        decisions
    }
}

/// Spawns and owns the per-check workers.
pub struct HealthEngine {
    tracker: Arc<InstanceTracker>,
    kill_service: Arc<dyn KillService>,
    prober: Arc<dyn HealthProber>,
    bus: EventBus,
    active: Mutex<HashMap<PathId, Vec<async_channel::Sender<()>>>>,
}

impl HealthEngine {
    /// Assemble the engine.
    pub fn new(
        tracker: Arc<InstanceTracker>,
        kill_service: Arc<dyn KillService>,
        prober: Arc<dyn HealthProber>,
        bus: EventBus,
    ) -> Self {
        HealthEngine {
            tracker,
            kill_service,
            prober,
            bus,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// (Re)start monitoring for a spec: one worker per locally-executed
    /// check definition. Delegated checks need no worker.
    pub fn start_monitoring(&self, spec: &RunSpec) {
        self.stop_monitoring(spec.id());
        let checks: Vec<HealthCheckDef> = match spec {
            RunSpec::App(app) => {
                app.health_checks.iter().filter(|c| !c.delegated()).cloned().collect()
            }
            RunSpec::Pod(pod) => pod
                .containers
                .iter()
                .filter_map(|c| c.health_check.clone())
                .filter(|c| !c.delegated())
                .collect(),
        };
        if checks.is_empty() {
            return;
        }
        info!(spec = %spec.id(), workers = checks.len(), "starting health monitoring");
        let mut handles = Vec::with_capacity(checks.len());
        for check in checks {
            let (stop_tx, stop_rx) = async_channel::bounded::<()>(1);
            handles.push(stop_tx);
            let worker = HealthWorker {
                spec: spec.clone(),
                check,
                tracker: self.tracker.clone(),
                kill_service: self.kill_service.clone(),
                prober: self.prober.clone(),
                bus: self.bus.clone(),
            };
            smol::spawn(worker.run(stop_rx)).detach();
        }
        self.active.lock().unwrap().insert(spec.id().clone(), handles);
    }

    /// Stop all workers of a spec; dropping the senders closes the workers'
    /// shutdown channels.
    pub fn stop_monitoring(&self, id: &PathId) {
        if self.active.lock().unwrap().remove(id).is_some() {
            info!(spec = %id, "stopped health monitoring");
        }
    }
}

struct HealthWorker {
    spec: RunSpec,
    check: HealthCheckDef,
    tracker: Arc<InstanceTracker>,
    kill_service: Arc<dyn KillService>,
    prober: Arc<dyn HealthProber>,
    bus: EventBus,
}

impl HealthWorker {
    async fn run(self, shutdown: async_channel::Receiver<()>) {
        let timing = self.check.timing().clone();
        let first_delay = timing.interval.min(Duration::from_secs(5));
        let mut states: HashMap<fleet_model::TaskId, TaskHealthState> = HashMap::new();
        let mut timer = smol::Timer::after(first_delay);
        loop {
            futures::select! {
                _ = shutdown.recv().fuse() => return,
                _ = (&mut timer).fuse() => {}
            }
            self.probe_round(&timing, &mut states).await;
            timer = smol::Timer::after(timing.interval);
        }
    }

    async fn probe_round(
        &self,
        timing: &CheckTiming,
        states: &mut HashMap<fleet_model::TaskId, TaskHealthState>,
    ) {
        let now = Utc::now();
        let instances = self.tracker.spec_instances(self.spec.id()).await;
        let mut seen = Vec::new();

        for instance in &instances {
            for task in instance.tasks.values() {
                // Only running tasks are probed; any other condition
                // suppresses failures by construction.
                if task.status.condition != Condition::Running {
                    continue;
                }
                seen.push(task.id.clone());
                let port = self.check.port().and_then(|p| {
                    resolve_probe_port(p, &self.spec, &task.status.network_info.host_ports)
                });
                let result =
                    self.prober.probe(&self.check, &instance.agent.host, port).await;
                let launched_at = task.status.started_at.unwrap_or(task.status.staged_at);
                let state = states.entry(task.id.clone()).or_default();
                let decisions = state.update(&result, now, launched_at, timing);
                let failures = state.consecutive_failures;
                for decision in decisions {
                    self.apply(decision, instance, &result, failures, now).await;
                }
            }
        }
        states.retain(|task_id, _| seen.contains(task_id));
    }

    async fn apply(
        &self,
        decision: HealthDecision,
        instance: &fleet_model::Instance,
        result: &HealthResult,
        failures: u32,
        now: DateTime<Utc>,
    ) {
        match decision {
            HealthDecision::Transition(healthy) => {
                if !healthy {
                    self.bus.publish(FailedHealthCheck {
                        run_spec_id: self.spec.id().clone(),
                        instance_id: instance.id.clone(),
                        check: result.message.clone().unwrap_or_else(|| "probe failed".into()),
                        timestamp: now,
                    });
                }
                self.bus.publish(InstanceHealthChanged {
                    id: instance.id.clone(),
                    run_spec_id: self.spec.id().clone(),
                    run_spec_version: instance.run_spec_version,
                    healthy: Some(healthy),
                    timestamp: now,
                });
            }
            HealthDecision::Kill => {
                if instance.is_unreachable() {
                    // Nothing to kill while the agent is away; the
                    // unreachable policy owns this instance now.
                    warn!(instance = %instance.id, "unhealthy but unreachable, not killing");
                    return;
                }
                self.bus.publish(UnhealthyInstanceKill {
                    run_spec_id: self.spec.id().clone(),
                    instance_id: instance.id.clone(),
                    consecutive_failures: failures,
                    timestamp: now,
                });
                if let Err(e) = self
                    .kill_service
                    .kill_instance(instance, KillReason::FailedHealthChecks)
                    .await
                {
                    warn!(instance = %instance.id, "failed to kill unhealthy instance: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_model::{AppSpec, PathId, PortDefinition, PortMapping, PortProtocol};

    fn timing(grace_secs: u64, max_failures: u32) -> CheckTiming {
        CheckTiming {
            grace_period: Duration::from_secs(grace_secs),
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(1),
            max_consecutive_failures: max_failures,
        }
    }

    #[test]
    fn test_grace_suppresses_failures_without_prior_success() {
        let mut state = TaskHealthState::default();
        let timing = timing(300, 3);
        let now = Utc::now();
        let decisions =
            state.update(&HealthResult::unhealthy("boom"), now, now, &timing);
        assert!(decisions.is_empty());
        assert_eq!(state.consecutive_failures, 0);
    }

    #[test]
    fn test_failure_after_success_counts_even_within_grace() {
        let mut state = TaskHealthState::default();
        let timing = timing(300, 3);
        let now = Utc::now();
        state.update(&HealthResult::healthy(), now, now, &timing);
        let decisions =
            state.update(&HealthResult::unhealthy("boom"), now, now, &timing);
        assert_eq!(decisions, vec![HealthDecision::Transition(false)]);
        assert_eq!(state.consecutive_failures, 1);
    }

    #[test]
    fn test_kill_on_reaching_threshold_post_update() {
        let mut state = TaskHealthState::default();
        let timing = timing(0, 3);
        let now = Utc::now();
        let launched = now - chrono::Duration::seconds(10);

        state.update(&HealthResult::unhealthy("1"), now, launched, &timing);
        state.update(&HealthResult::unhealthy("2"), now, launched, &timing);
        // The third probe moves the counter to 3 and, because the check
        // runs against the updated counter, fires the kill on this probe.
        let decisions = state.update(&HealthResult::unhealthy("3"), now, launched, &timing);
        assert!(decisions.contains(&HealthDecision::Kill));

        // The streak does not re-fire.
        let again = state.update(&HealthResult::unhealthy("4"), now, launched, &timing);
        assert!(again.is_empty());
    }

    #[test]
    fn test_recovery_resets_streak_and_flips_alive() {
        let mut state = TaskHealthState::default();
        let timing = timing(0, 3);
        let now = Utc::now();
        let launched = now - chrono::Duration::seconds(10);
        state.update(&HealthResult::unhealthy("1"), now, launched, &timing);
        let decisions = state.update(&HealthResult::healthy(), now, launched, &timing);
        assert_eq!(decisions, vec![HealthDecision::Transition(true)]);
        assert_eq!(state.consecutive_failures, 0);
    }

    #[test]
    fn test_resolve_probe_port_by_index_and_name() {
        let mut app = AppSpec::new(PathId::parse("/a").unwrap());
        app.cmd = Some("run".to_string());
        app.port_definitions = vec![
            PortDefinition {
                port: 0,
                name: Some("http".to_string()),
                protocol: PortProtocol::Tcp,
                labels: Default::default(),
            },
            PortDefinition {
                port: 0,
                name: Some("admin".to_string()),
                protocol: PortProtocol::Tcp,
                labels: Default::default(),
            },
        ];
        let spec = RunSpec::App(app);
        let granted = [31000, 31001];

        assert_eq!(
            resolve_probe_port(&PortReference::Index(1), &spec, &granted),
            Some(31001)
        );
        assert_eq!(
            resolve_probe_port(&PortReference::Name("admin".to_string()), &spec, &granted),
            Some(31001)
        );
        assert_eq!(
            resolve_probe_port(&PortReference::Literal(9999), &spec, &granted),
            Some(9999)
        );
    }

    #[test]
    fn test_resolve_probe_port_skips_container_only_slots() {
        let mut app = AppSpec::new(PathId::parse("/a").unwrap());
        app.cmd = Some("run".to_string());
        app.container = Some(fleet_model::Container {
            image: Some("img".to_string()),
            port_mappings: vec![
                PortMapping {
                    container_port: 9090,
                    host_port: None,
                    name: Some("internal".to_string()),
                    protocol: PortProtocol::Tcp,
                },
                PortMapping {
                    container_port: 80,
                    host_port: Some(0),
                    name: Some("http".to_string()),
                    protocol: PortProtocol::Tcp,
                },
            ],
            volumes: vec![],
        });
        let spec = RunSpec::App(app);
        let granted = [31000];

        // Slot 0 is container-only: no host port to probe.
        assert_eq!(resolve_probe_port(&PortReference::Index(0), &spec, &granted), None);
        assert_eq!(
            resolve_probe_port(&PortReference::Index(1), &spec, &granted),
            Some(31000)
        );
        assert_eq!(
            resolve_probe_port(&PortReference::Name("http".to_string()), &spec, &granted),
            Some(31000)
        );
    }
}
