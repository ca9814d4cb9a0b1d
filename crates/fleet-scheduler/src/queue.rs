//! The launch queue.
//!
//! Pending launch demand per run spec, with exponential backoff on launch
//! failures. The offer processor consumes overdue requests; everything else
//! waits for its delay to elapse.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

use fleet_model::{PathId, RunSpec};

/// Backoff state of one run spec.
#[derive(Debug, Clone)]
struct DelayState {
    /// Delay applied on the next failure.
    current: Duration,
    /// Launches are withheld until this instant; `None` means no active
    /// delay.
    active_until: Option<DateTime<Utc>>,
}

impl DelayState {
    fn fresh(spec: &RunSpec) -> Self {
        DelayState { current: spec.backoff().backoff, active_until: None }
    }

    fn overdue(&self, now: DateTime<Utc>) -> bool {
        self.active_until.map(|until| now >= until).unwrap_or(true)
    }
}

#[derive(Debug, Clone)]
struct QueueEntry {
    spec: RunSpec,
    pending: u32,
    delay: DelayState,
}

/// Observable state of one queue entry.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueInfo {
    /// The run spec.
    pub run_spec_id: PathId,
    /// Instances still waiting to launch.
    pub pending: u32,
    /// Whether the entry may consume offers right now.
    pub overdue: bool,
    /// Time left until the entry becomes overdue.
    pub time_left: Duration,
    /// Delay the next failure will apply.
    pub current_delay: Duration,
}

/// A matchable request handed to the offer processor.
#[derive(Debug, Clone)]
pub struct QueuedRequest {
    /// Latest rendition of the spec.
    pub spec: RunSpec,
    /// Instances still waiting to launch.
    pub pending: u32,
}

/// Aggregated launch demand per run spec.
#[derive(Debug, Default)]
pub struct LaunchQueue {
    entries: Mutex<HashMap<PathId, QueueEntry>>,
}

impl LaunchQueue {
    /// An empty queue.
    pub fn new() -> Self {
        LaunchQueue::default()
    }

    /// Add demand for `count` more instances of `spec`. A configuration
    /// change (not a scaling change) resets the backoff to its base.
    pub fn add(&self, spec: RunSpec, count: u32) {
        let mut entries = self.entries.lock().unwrap();
        let id = spec.id().clone();
        match entries.get_mut(&id) {
            Some(entry) => {
                let config_changed = spec.version_info().last_config_change_at
                    > entry.spec.version_info().last_config_change_at;
                if config_changed {
                    debug!(spec = %id, "config change resets launch delay");
                    entry.delay = DelayState::fresh(&spec);
                }
                entry.spec = spec;
                entry.pending += count;
            }
            None => {
                entries.insert(
                    id.clone(),
                    QueueEntry { delay: DelayState::fresh(&spec), spec, pending: count },
                );
            }
        }
        debug!(spec = %id, count, "launch demand added");
    }

    /// Pending count for a spec.
    pub fn pending(&self, id: &PathId) -> u32 {
        self.entries.lock().unwrap().get(id).map(|e| e.pending).unwrap_or(0)
    }

    /// Record that `count` launches were handed to the external manager.
    pub fn mark_launched(&self, id: &PathId, count: u32) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(id) {
            entry.pending = entry.pending.saturating_sub(count);
        }
    }

    /// A task of the spec failed without an intervening running report:
    /// activate the current delay and escalate it.
    pub fn on_task_failed(&self, id: &PathId, now: DateTime<Utc>) {
        let mut entries = self.entries.lock().unwrap();
        let Some(entry) = entries.get_mut(id) else { return };
        let backoff = entry.spec.backoff();
        entry.delay.active_until = Some(
            now + chrono::Duration::from_std(entry.delay.current)
                .unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 1_000)),
        );
        let escalated = entry.delay.current.mul_f64(backoff.factor);
        entry.delay.current = escalated.min(backoff.max_launch_delay);
        info!(
            spec = %id,
            delay_secs = entry.delay.current.as_secs(),
            "launch failure, backoff escalated"
        );
    }

    /// A task of the spec reported running: the delay resets to its base.
    pub fn on_task_running(&self, id: &PathId) {
        self.reset_delay(id);
    }

    /// Reset the delay to the configured base and clear any active wait.
    pub fn reset_delay(&self, id: &PathId) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(id) {
            entry.delay = DelayState::fresh(&entry.spec);
        }
    }

    /// Drop a spec from the queue entirely.
    pub fn purge(&self, id: &PathId) {
        self.entries.lock().unwrap().remove(id);
        debug!(spec = %id, "purged from launch queue");
    }

    /// Observable queue state.
    pub fn list(&self, now: DateTime<Utc>) -> Vec<QueueInfo> {
        let entries = self.entries.lock().unwrap();
        let mut out: Vec<QueueInfo> = entries
            .values()
            .map(|entry| QueueInfo {
                run_spec_id: entry.spec.id().clone(),
                pending: entry.pending,
                overdue: entry.delay.overdue(now),
                time_left: entry
                    .delay
                    .active_until
                    .and_then(|until| (until - now).to_std().ok())
                    .unwrap_or(Duration::ZERO),
                current_delay: entry.delay.current,
            })
            .collect();
        out.sort_by(|a, b| a.run_spec_id.cmp(&b.run_spec_id));
        out
    }

    /// Requests whose delay has elapsed and that still want instances.
    pub fn overdue_requests(&self, now: DateTime<Utc>) -> Vec<QueuedRequest> {
        let entries = self.entries.lock().unwrap();
        let mut out: Vec<QueuedRequest> = entries
            .values()
            .filter(|e| e.pending > 0 && e.delay.overdue(now))
            .map(|e| QueuedRequest { spec: e.spec.clone(), pending: e.pending })
            .collect();
        out.sort_by(|a, b| a.spec.id().cmp(b.spec.id()));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_model::AppSpec;

    fn spec(backoff_secs: u64) -> RunSpec {
        let mut app = AppSpec::new(PathId::parse("/app").unwrap());
        app.cmd = Some("false".to_string());
        app.backoff.backoff = Duration::from_secs(backoff_secs);
        app.backoff.factor = 2.0;
        app.backoff.max_launch_delay = Duration::from_secs(3600);
        RunSpec::App(app)
    }

    #[test]
    fn test_new_demand_is_overdue() {
        let queue = LaunchQueue::new();
        queue.add(spec(3600), 2);
        let now = Utc::now();
        let requests = queue.overdue_requests(now);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].pending, 2);
    }

    #[test]
    fn test_failure_applies_delay() {
        let queue = LaunchQueue::new();
        let spec = spec(3600);
        queue.add(spec.clone(), 1);
        let now = Utc::now();
        queue.on_task_failed(spec.id(), now);

        let info = &queue.list(now)[0];
        assert!(!info.overdue);
        assert!(info.time_left > Duration::from_secs(3590));
        assert!(queue.overdue_requests(now).is_empty());
    }

    #[test]
    fn test_delay_escalates_and_caps() {
        let queue = LaunchQueue::new();
        let spec = spec(1000);
        queue.add(spec.clone(), 1);
        let now = Utc::now();
        queue.on_task_failed(spec.id(), now);
        assert_eq!(queue.list(now)[0].current_delay, Duration::from_secs(2000));
        queue.on_task_failed(spec.id(), now);
        // 4000 would exceed the cap of 3600.
        assert_eq!(queue.list(now)[0].current_delay, Duration::from_secs(3600));
    }

    #[test]
    fn test_running_resets_delay() {
        let queue = LaunchQueue::new();
        let spec = spec(3600);
        queue.add(spec.clone(), 1);
        let now = Utc::now();
        queue.on_task_failed(spec.id(), now);
        queue.on_task_running(spec.id());
        assert!(queue.list(now)[0].overdue);
        assert_eq!(queue.list(now)[0].current_delay, Duration::from_secs(3600));
    }

    #[test]
    fn test_config_change_resets_scale_change_does_not() {
        let queue = LaunchQueue::new();
        let original = spec(3600);
        queue.add(original.clone(), 1);
        let now = Utc::now();
        queue.on_task_failed(original.id(), now);
        assert!(!queue.list(now)[0].overdue);

        // Scaling keeps the delay in force.
        let scaled = original.with_instances(5, now + chrono::Duration::seconds(1));
        queue.add(scaled, 1);
        assert!(!queue.list(now)[0].overdue);

        // A config change clears it.
        let mut changed = match original {
            RunSpec::App(app) => app,
            _ => unreachable!(),
        };
        changed.cmd = Some("true".to_string());
        let later = now + chrono::Duration::seconds(2);
        changed.version = later;
        changed.version_info = changed.version_info.with_config_change(later);
        queue.add(RunSpec::App(changed), 0);
        assert!(queue.list(now)[0].overdue);
    }

    #[test]
    fn test_mark_launched_and_purge() {
        let queue = LaunchQueue::new();
        let spec = spec(1);
        queue.add(spec.clone(), 3);
        queue.mark_launched(spec.id(), 2);
        assert_eq!(queue.pending(spec.id()), 1);
        queue.purge(spec.id());
        assert_eq!(queue.pending(spec.id()), 0);
        assert!(queue.list(Utc::now()).is_empty());
    }
}
