//! Readiness tracking during deployments.
//!
//! Controllers compose a [`ReadinessTracker`] rather than inheriting
//! behavior: the tracker consumes instance-changed, health-changed and
//! readiness-result events and answers the one question controllers ask —
//! is this instance ready for rollout purposes?
//!
//! The decision rule:
//! - no health checks, no readiness checks: ready on `Running`;
//! - health checks only: ready when healthy;
//! - readiness checks only: ready when every check passed on a `Running`
//!   instance;
//! - both: ready when healthy and every readiness check passed.

use chrono::Utc;
use futures::FutureExt;
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, info, warn};

use event_bus::EventBus;
use fleet_model::events::{InstanceChanged, InstanceHealthChanged, ReadinessResult};
use fleet_model::{Condition, Instance, InstanceId, ReadinessCheckDef, RunSpec, TaskId};

use crate::health::resolve_probe_port;
use fleet_model::PortReference;

/// Handle for one running readiness poller; dropping it stops the poller.
pub struct ReadinessSubscription {
    _stop: async_channel::Sender<()>,
}

impl ReadinessSubscription {
    /// Wrap a stop channel; dropping the subscription closes it, which
    /// tells the poller to exit.
    pub fn new(stop: async_channel::Sender<()>) -> Self {
        ReadinessSubscription { _stop: stop }
    }
}

/// Spawns readiness pollers for instances entering the rollout.
pub trait ReadinessCheckExecutor: Send + Sync {
    /// Start polling `instance` with `check`, publishing
    /// [`ReadinessResult`] events on the bus until the subscription is
    /// dropped.
    fn start(
        &self,
        check: &ReadinessCheckDef,
        spec: &RunSpec,
        instance: &Instance,
        bus: EventBus,
    ) -> ReadinessSubscription;
}

/// Default executor: HTTP GET against the check's named port on the
/// blocking pool.
pub struct HttpReadinessExecutor;

impl ReadinessCheckExecutor for HttpReadinessExecutor {
    fn start(
        &self,
        check: &ReadinessCheckDef,
        spec: &RunSpec,
        instance: &Instance,
        bus: EventBus,
    ) -> ReadinessSubscription {
        let (stop_tx, stop_rx) = async_channel::bounded::<()>(1);
        let check = check.clone();
        let host = instance.agent.host.clone();
        let task_id = instance.tasks.keys().next().cloned();
        let port = instance.tasks.values().next().and_then(|task| {
            resolve_probe_port(
                &PortReference::Name(check.port_name.clone()),
                spec,
                &task.status.network_info.host_ports,
            )
        });

        smol::spawn(async move {
            let Some(task_id) = task_id else { return };
            let Some(port) = port else {
                warn!(check = check.name, "readiness check has no resolvable port");
                return;
            };
            let url = format!("http://{host}:{port}{}", check.path);
            let mut timer = smol::Timer::after(std::time::Duration::ZERO);
            loop {
                futures::select! {
                    _ = stop_rx.recv().fuse() => return,
                    _ = (&mut timer).fuse() => {}
                }
                let probe_url = url.clone();
                let timeout = check.timeout;
                let accepted = check.http_status_codes_for_ready.clone();
                let keep_body = check.preserve_last_response;
                let outcome = smol::unblock(move || {
                    let client = reqwest::blocking::Client::builder()
                        .timeout(timeout)
                        .build()
                        .map_err(|e| e.to_string())?;
                    let response = client.get(&probe_url).send().map_err(|e| e.to_string())?;
                    let status = response.status().as_u16();
                    let body = if keep_body { response.text().ok() } else { None };
                    Ok::<_, String>((accepted.contains(&status), body))
                })
                .await;
                let (ready, last_response) = match outcome {
                    Ok(pair) => pair,
                    Err(message) => {
                        debug!(check = check.name, "readiness probe failed: {message}");
                        (false, None)
                    }
                };
                bus.publish(ReadinessResult {
                    name: check.name.clone(),
                    task_id: task_id.clone(),
                    ready,
                    last_response,
                    timestamp: Utc::now(),
                });
                timer = smol::Timer::after(check.interval);
            }
        })
        .detach();

        ReadinessSubscription { _stop: stop_tx }
    }
}

/// What a fed-in event changed.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadinessUpdate {
    /// The instance satisfies the decision rule for the first time.
    BecameReady(InstanceId),
    /// The instance left the rollout (terminal or lost).
    Terminated(InstanceId),
    /// Nothing changed.
    None,
}

/// Event-driven readiness bookkeeping for one spec at one target version.
pub struct ReadinessTracker {
    spec: RunSpec,
    requires_health: bool,
    required_checks: BTreeSet<String>,
    running: HashSet<InstanceId>,
    healthy: HashSet<InstanceId>,
    passed: HashMap<InstanceId, BTreeSet<String>>,
    ready: HashSet<InstanceId>,
    subscriptions: HashMap<InstanceId, Vec<ReadinessSubscription>>,
}

impl ReadinessTracker {
    /// A tracker for instances of `spec` at the spec's own version.
    pub fn new(spec: RunSpec) -> Self {
        let requires_health = spec.has_health_checks();
        let required_checks = match &spec {
            RunSpec::App(app) => {
                app.readiness_checks.iter().map(|c| c.name.clone()).collect()
            }
            RunSpec::Pod(_) => BTreeSet::new(),
        };
        ReadinessTracker {
            spec,
            requires_health,
            required_checks,
            running: HashSet::new(),
            healthy: HashSet::new(),
            passed: HashMap::new(),
            ready: HashSet::new(),
            subscriptions: HashMap::new(),
        }
    }

    /// Whether the instance counts as ready for rollout purposes.
    pub fn is_ready(&self, id: &InstanceId) -> bool {
        self.ready.contains(id)
    }

    /// Number of ready instances.
    pub fn ready_count(&self) -> usize {
        self.ready.len()
    }

    /// Whether the event belongs to this tracker's spec and version.
    pub fn concerns(&self, run_spec_id: &fleet_model::PathId, version: chrono::DateTime<Utc>) -> bool {
        *run_spec_id == *self.spec.id() && version == self.spec.version()
    }

    /// Seed the tracker with an instance that is already running when the
    /// controller starts, subscribing its readiness checks.
    pub fn reconcile_running(
        &mut self,
        instance: &Instance,
        executor: &dyn ReadinessCheckExecutor,
        bus: &EventBus,
    ) -> ReadinessUpdate {
        if instance.is_running() {
            self.note_running(instance, executor, bus)
        } else {
            ReadinessUpdate::None
        }
    }

    /// Feed an instance-changed event, handing over the instance record
    /// when it is running (needed to start readiness subscriptions).
    pub fn note_instance_changed(
        &mut self,
        event: &InstanceChanged,
        instance: Option<&Instance>,
        executor: &dyn ReadinessCheckExecutor,
        bus: &EventBus,
    ) -> ReadinessUpdate {
        if !self.concerns(&event.run_spec_id, event.run_spec_version) {
            return ReadinessUpdate::None;
        }
        if event.condition.is_terminal() || event.condition == Condition::Unreachable {
            return self.note_terminated(&event.id);
        }
        if event.condition == Condition::Running {
            if let Some(instance) = instance {
                return self.note_running(instance, executor, bus);
            }
        }
        ReadinessUpdate::None
    }

    /// Feed a health-changed event.
    pub fn note_health_changed(&mut self, event: &InstanceHealthChanged) -> ReadinessUpdate {
        if !self.concerns(&event.run_spec_id, event.run_spec_version) {
            return ReadinessUpdate::None;
        }
        match event.healthy {
            Some(true) => {
                self.healthy.insert(event.id.clone());
                self.evaluate(&event.id)
            }
            Some(false) | None => {
                // Health loss does not unready an instance; only terminal
                // events do.
                ReadinessUpdate::None
            }
        }
    }

    /// Feed a readiness probe result.
    pub fn note_readiness_result(&mut self, event: &ReadinessResult) -> ReadinessUpdate {
        let instance_id = event.task_id.instance.clone();
        if !self.subscriptions.contains_key(&instance_id) {
            return ReadinessUpdate::None;
        }
        if event.ready {
            self.passed.entry(instance_id.clone()).or_default().insert(event.name.clone());
            return self.evaluate(&instance_id);
        }
        ReadinessUpdate::None
    }

    fn note_running(
        &mut self,
        instance: &Instance,
        executor: &dyn ReadinessCheckExecutor,
        bus: &EventBus,
    ) -> ReadinessUpdate {
        let id = instance.id.clone();
        self.running.insert(id.clone());
        if !self.required_checks.is_empty() && !self.subscriptions.contains_key(&id) {
            // Readiness subscription begins once the instance runs (and
            // health gating happens in evaluate()).
            let checks: Vec<ReadinessCheckDef> = match &self.spec {
                RunSpec::App(app) => app.readiness_checks.clone(),
                RunSpec::Pod(_) => Vec::new(),
            };
            let handles = checks
                .iter()
                .map(|check| executor.start(check, &self.spec, instance, bus.clone()))
                .collect();
            self.subscriptions.insert(id.clone(), handles);
            debug!(instance = %id, "readiness subscription started");
        } else {
            self.subscriptions.entry(id.clone()).or_default();
        }
        self.evaluate(&id)
    }

    fn note_terminated(&mut self, id: &InstanceId) -> ReadinessUpdate {
        let known = self.running.remove(id)
            | self.healthy.remove(id)
            | self.ready.remove(id)
            | self.subscriptions.remove(id).is_some();
        self.passed.remove(id);
        if known {
            info!(instance = %id, "instance left the rollout");
            ReadinessUpdate::Terminated(id.clone())
        } else {
            ReadinessUpdate::None
        }
    }

    fn evaluate(&mut self, id: &InstanceId) -> ReadinessUpdate {
        if self.ready.contains(id) {
            return ReadinessUpdate::None;
        }
        if !self.running.contains(id) {
            return ReadinessUpdate::None;
        }
        if self.requires_health && !self.healthy.contains(id) {
            return ReadinessUpdate::None;
        }
        if !self.required_checks.is_empty() {
            let passed = self.passed.get(id);
            let all_passed = passed
                .map(|p| self.required_checks.iter().all(|c| p.contains(c)))
                .unwrap_or(false);
            if !all_passed {
                return ReadinessUpdate::None;
            }
        }
        self.ready.insert(id.clone());
        ReadinessUpdate::BecameReady(id.clone())
    }
}
