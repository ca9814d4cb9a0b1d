//! Offer consumption and status-update ingestion.
//!
//! The offer processor is the launch queue's consumer of offers: it walks
//! the overdue requests, matches each against what is left of the offer,
//! registers provisioned instances with the tracker (persist first), and
//! only then hands the launch to the external manager. Status updates flow
//! the opposite way and are acknowledged after the tracker committed them.

use chrono::Utc;
use futures::FutureExt;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use fleet_model::{Condition, RunSpec};

use crate::Result;
use crate::config::SchedulerConfig;
use crate::driver::{SchedulerDriver, StatusUpdate};
use crate::lifecycle::condition_from_reason;
use crate::matching::{OfferMatch, ResourceMatch, match_offer};
use crate::launch::provision;
use crate::offer::{Offer, PortRange, ResourceValue};
use crate::queue::LaunchQueue;
use crate::tracker::{InstanceTracker, InstanceUpdateOp};

/// Matches queued demand against offers and ingests status updates.
pub struct OfferProcessor {
    queue: Arc<LaunchQueue>,
    tracker: Arc<InstanceTracker>,
    driver: Arc<dyn SchedulerDriver>,
    config: SchedulerConfig,
}

impl OfferProcessor {
    /// Assemble a processor.
    pub fn new(
        queue: Arc<LaunchQueue>,
        tracker: Arc<InstanceTracker>,
        driver: Arc<dyn SchedulerDriver>,
        config: SchedulerConfig,
    ) -> Self {
        OfferProcessor { queue, tracker, driver, config }
    }

    /// Consume one offer: launch as much overdue demand as it satisfies,
    /// bounded by `max_instances_per_offer`. Returns the number of
    /// instances launched.
    pub async fn process_offer(&self, offer: Offer) -> Result<usize> {
        let now = Utc::now();
        let mut remaining = offer.clone();
        let mut launched = 0usize;

        for request in self.queue.overdue_requests(now) {
            let spec_id = request.spec.id().clone();
            let accepted_roles = accepted_roles(&request.spec, &self.config);

            while launched < self.config.max_instances_per_offer
                && self.queue.pending(&spec_id) > 0
            {
                let running = self.tracker.spec_instances(&spec_id).await;
                let outcome = match_offer(
                    &request.spec,
                    &remaining,
                    &running,
                    &accepted_roles,
                    self.config.framework_principal.as_deref(),
                );
                let selection = match outcome {
                    OfferMatch::Match(selection) => selection,
                    OfferMatch::NoMatch(reasons) => {
                        debug!(
                            spec = %spec_id,
                            offer = %offer.id,
                            reason = %reasons
                                .first()
                                .map(ToString::to_string)
                                .unwrap_or_default(),
                            "offer does not satisfy request"
                        );
                        break;
                    }
                };

                let provisioned =
                    provision(&request.spec, &remaining, &selection, &self.config, now);
                let op = if selection.volumes.is_empty() {
                    InstanceUpdateOp::LaunchEphemeral(provisioned.instance.clone())
                } else {
                    InstanceUpdateOp::LaunchOnReservation(provisioned.instance.clone())
                };
                // Persist before the launch leaves the process, so recovery
                // knows about the instance even if we crash in between.
                self.tracker.process(op).await?;
                self.driver.launch(&offer.id, provisioned.descriptors).await?;
                self.queue.mark_launched(&spec_id, 1);
                consume_selection(&mut remaining, &selection);
                launched += 1;
                info!(spec = %spec_id, offer = %offer.id, "instance launched");
            }

            if launched >= self.config.max_instances_per_offer {
                break;
            }
        }
        Ok(launched)
    }

    /// Ingest one status update: interpret, apply through the tracker,
    /// reflect launch outcomes into the queue's backoff, then acknowledge.
    pub async fn handle_status_update(&self, update: StatusUpdate) -> Result<()> {
        let Some(condition) = condition_from_reason(&update.reason) else {
            warn!(reason = update.reason, "unknown status reason, dropping update");
            return Ok(());
        };
        let now = Utc::now();
        let spec_id = update.task_id.instance.run_spec_id.clone();
        self.tracker.process_status_update(condition, update.clone(), now).await?;

        match condition {
            Condition::Failed | Condition::Error | Condition::Dropped | Condition::Gone => {
                self.queue.on_task_failed(&spec_id, now);
            }
            Condition::Running => self.queue.on_task_running(&spec_id),
            _ => {}
        }

        self.driver.acknowledge(&update).await
    }
}

/// Periodically asks the external manager to re-send the status of every
/// known task, bounding divergence after reconnects.
pub struct ReconciliationLoop {
    tracker: Arc<InstanceTracker>,
    driver: Arc<dyn SchedulerDriver>,
    config: SchedulerConfig,
}

impl ReconciliationLoop {
    /// Assemble the loop.
    pub fn new(
        tracker: Arc<InstanceTracker>,
        driver: Arc<dyn SchedulerDriver>,
        config: SchedulerConfig,
    ) -> Self {
        ReconciliationLoop { tracker, driver, config }
    }

    /// One reconciliation pass.
    pub async fn reconcile_once(&self) -> Result<()> {
        let mut task_ids = Vec::new();
        for (_, instances) in self.tracker.instances_by_spec().await {
            for instance in instances {
                task_ids.extend(instance.tasks.keys().cloned());
            }
        }
        debug!(tasks = task_ids.len(), "requesting reconciliation");
        self.driver.reconcile(task_ids).await
    }

    /// Run until the shutdown channel closes.
    pub async fn run(self, shutdown: async_channel::Receiver<()>) {
        let mut timer = smol::Timer::after(self.config.reconciliation_initial_delay);
        loop {
            futures::select! {
                _ = shutdown.recv().fuse() => return,
                _ = (&mut timer).fuse() => {
                    if let Err(e) = self.reconcile_once().await {
                        warn!("reconciliation failed: {e}");
                    }
                    timer = smol::Timer::after(self.config.reconciliation_interval);
                }
            }
        }
    }
}

fn accepted_roles(spec: &RunSpec, config: &SchedulerConfig) -> BTreeSet<String> {
    match spec {
        RunSpec::App(app) => app
            .accepted_resource_roles
            .clone()
            .unwrap_or_else(|| config.default_accepted_resource_roles.clone()),
        RunSpec::Pod(_) => config.default_accepted_resource_roles.clone(),
    }
}

/// Subtract a selection from the offer's local accounting so the next match
/// within the same offer sees only what is left.
fn consume_selection(offer: &mut Offer, selection: &ResourceMatch) {
    for consumed in &selection.consumed {
        let mut left = consumed.amount;
        for resource in offer
            .resources
            .iter_mut()
            .filter(|r| r.name == consumed.name && r.role == consumed.role)
        {
            if left <= 0.0 {
                break;
            }
            if let ResourceValue::Scalar(amount) = &mut resource.value {
                let take = left.min(*amount);
                *amount -= take;
                left -= take;
            }
        }
    }
    for volume in &selection.volumes {
        let mut left = volume.size_mb as f64;
        for resource in offer
            .resources
            .iter_mut()
            .filter(|r| r.name == "disk" && r.role == volume.role)
        {
            if left <= 0.0 {
                break;
            }
            if let ResourceValue::Scalar(amount) = &mut resource.value {
                let take = left.min(*amount);
                *amount -= take;
                left -= take;
            }
        }
    }
    for binding in selection.port_bindings.iter().flatten() {
        for resource in offer
            .resources
            .iter_mut()
            .filter(|r| r.name == "ports" && r.role == binding.role)
        {
            if let ResourceValue::Ranges(ranges) = &mut resource.value {
                if let Some(idx) = ranges.iter().position(|r| r.contains(binding.host_port)) {
                    let range = ranges.remove(idx);
                    if binding.host_port > range.begin {
                        ranges.push(PortRange {
                            begin: range.begin,
                            end: binding.host_port - 1,
                        });
                    }
                    if binding.host_port < range.end {
                        ranges.push(PortRange { begin: binding.host_port + 1, end: range.end });
                    }
                    break;
                }
            }
        }
    }
}
