//! Deployment step controllers.
//!
//! One controller runs per in-flight step action. Controllers are
//! event-driven: they subscribe to the bus before acting, push demand into
//! the launch queue or kills into the kill service, and complete when the
//! tracker's events show the target state reached. A closed shutdown
//! channel cancels a controller with a [`Error::Canceled`] outcome.

mod restart;
mod scale;
mod start;
mod stop;

pub use restart::{RestartStrategy, compute_restart_strategy};

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use event_bus::EventBus;
use fleet_model::DeploymentAction;
use fleet_scheduler::{InstanceTracker, KillService, LaunchQueue};

use crate::health::HealthEngine;
use crate::readiness::ReadinessCheckExecutor;
use crate::{Error, Result};

/// Everything a step controller needs to act on the fleet.
#[derive(Clone)]
pub struct StepContext {
    /// The instance tracker.
    pub tracker: Arc<InstanceTracker>,
    /// The launch queue.
    pub queue: Arc<LaunchQueue>,
    /// The kill service.
    pub kill_service: Arc<dyn KillService>,
    /// The in-process event bus.
    pub bus: EventBus,
    /// Readiness poller factory.
    pub readiness: Arc<dyn ReadinessCheckExecutor>,
    /// The health engine.
    pub health: Arc<HealthEngine>,
    /// Artifact downloads.
    pub artifacts: Arc<dyn ArtifactResolver>,
}

/// Execute one action to completion (or cancellation).
pub(crate) async fn run_action(
    ctx: &StepContext,
    action: &DeploymentAction,
    shutdown: async_channel::Receiver<()>,
) -> Result<()> {
    debug!(action = action.kind(), "controller starting");
    match action {
        DeploymentAction::StartApplication { spec, scale_to } => {
            start::run_start(ctx, spec, *scale_to, shutdown).await
        }
        DeploymentAction::ScaleApplication { spec, scale_to, to_kill } => {
            scale::run_scale(ctx, spec, *scale_to, to_kill.as_deref(), shutdown).await
        }
        DeploymentAction::RestartApplication { spec } => {
            restart::run_restart(ctx, spec, shutdown).await
        }
        DeploymentAction::StopApplication { spec } => {
            stop::run_stop(ctx, spec, shutdown).await
        }
        DeploymentAction::ResolveArtifacts { urls } => {
            for (url, path) in urls {
                ctx.artifacts.resolve(url, path).await?;
            }
            Ok(())
        }
    }
}

/// Cancellation outcome shared by all controllers.
pub(crate) fn canceled() -> Error {
    Error::Canceled { reason: "deployment shut down".to_string() }
}

/// Downloads deployment artifacts to local paths before dependent steps
/// proceed. Resolution is idempotent per (url, path).
#[async_trait]
pub trait ArtifactResolver: Send + Sync {
    /// Fetch `url` into `path` (relative to the resolver's store).
    async fn resolve(&self, url: &str, path: &str) -> Result<()>;
}

/// Default resolver: blocking HTTP download on the blocking pool into a
/// local artifact store.
pub struct HttpArtifactResolver {
    root: PathBuf,
}

impl HttpArtifactResolver {
    /// A resolver storing artifacts under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        HttpArtifactResolver { root: root.into() }
    }
}

#[async_trait]
impl ArtifactResolver for HttpArtifactResolver {
    async fn resolve(&self, url: &str, path: &str) -> Result<()> {
        let target = self.root.join(path);
        if target.exists() {
            debug!(url, ?target, "artifact already resolved");
            return Ok(());
        }
        info!(url, ?target, "resolving artifact");
        let url = url.to_string();
        let bytes = smol::unblock(move || {
            reqwest::blocking::get(&url)
                .and_then(|r| r.error_for_status())
                .and_then(|r| r.bytes())
                .map_err(|e| e.to_string())
        })
        .await
        .map_err(Error::Artifact)?;

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Artifact(e.to_string()))?;
        }
        // Write-then-rename keeps partially downloaded files out of the
        // store.
        let staging = target.with_extension("partial");
        std::fs::write(&staging, &bytes).map_err(|e| Error::Artifact(e.to_string()))?;
        std::fs::rename(&staging, &target).map_err(|e| Error::Artifact(e.to_string()))?;
        Ok(())
    }
}
