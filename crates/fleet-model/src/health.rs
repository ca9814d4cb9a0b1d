//! Health and readiness check definitions.
//!
//! A health check is either executed by the orchestrator itself (HTTP,
//! HTTPS, TCP) or delegated to the external resource manager through the
//! launch descriptor (manager-side HTTP/TCP and command checks). The
//! dichotomy is a capability of the variant, exposed via
//! [`HealthCheckDef::delegated`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Default probe interval.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);
/// Default per-task grace period during which failures are suppressed.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(300);
/// Default per-probe timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);
/// Default number of consecutive failures that triggers a kill intent.
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Timing and failure-threshold parameters shared by all check variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckTiming {
    /// Failures within this window after launch are suppressed unless a
    /// success was already observed.
    pub grace_period: Duration,
    /// Interval between probes.
    pub interval: Duration,
    /// Per-probe timeout.
    pub timeout: Duration,
    /// Consecutive unhealthy results before a kill intent is published.
    pub max_consecutive_failures: u32,
}

impl Default for CheckTiming {
    fn default() -> Self {
        CheckTiming {
            grace_period: DEFAULT_GRACE_PERIOD,
            interval: DEFAULT_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
        }
    }
}

/// How a check locates the port to probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortReference {
    /// Positional index into the declared ports.
    Index(usize),
    /// A literal host port.
    Literal(u16),
    /// A declared port name.
    Name(String),
}

impl Default for PortReference {
    fn default() -> Self {
        PortReference::Index(0)
    }
}

/// HTTP scheme for HTTP-family checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpScheme {
    /// Plain HTTP.
    Http,
    /// TLS; certificate validation is skipped for probes.
    Https,
}

/// A health check definition attached to a run spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthCheckDef {
    /// HTTP(S) probe executed by the orchestrator.
    Http {
        /// Scheme to probe with.
        scheme: HttpScheme,
        /// Request path, e.g. `/health`.
        path: String,
        /// Port to probe.
        #[serde(default)]
        port: PortReference,
        /// Timing parameters.
        #[serde(default)]
        timing: CheckTiming,
    },
    /// TCP connect probe executed by the orchestrator.
    Tcp {
        /// Port to probe.
        #[serde(default)]
        port: PortReference,
        /// Timing parameters.
        #[serde(default)]
        timing: CheckTiming,
    },
    /// HTTP(S) probe executed by the external manager on the agent.
    MesosHttp {
        /// Scheme to probe with.
        scheme: HttpScheme,
        /// Request path.
        path: String,
        /// Port to probe.
        #[serde(default)]
        port: PortReference,
        /// Timing parameters.
        #[serde(default)]
        timing: CheckTiming,
    },
    /// TCP probe executed by the external manager on the agent.
    MesosTcp {
        /// Port to probe.
        #[serde(default)]
        port: PortReference,
        /// Timing parameters.
        #[serde(default)]
        timing: CheckTiming,
    },
    /// Shell command executed by the external manager inside the sandbox.
    Command {
        /// Command line to run; exit 0 means healthy.
        command: String,
        /// Timing parameters.
        #[serde(default)]
        timing: CheckTiming,
    },
}

impl HealthCheckDef {
    /// Whether the check is executed by the external manager rather than by
    /// the orchestrator. Delegated checks are translated into the launch
    /// descriptor; their results arrive as task status health flags.
    pub fn delegated(&self) -> bool {
        matches!(
            self,
            HealthCheckDef::MesosHttp { .. }
                | HealthCheckDef::MesosTcp { .. }
                | HealthCheckDef::Command { .. }
        )
    }

    /// Timing parameters of the check.
    pub fn timing(&self) -> &CheckTiming {
        match self {
            HealthCheckDef::Http { timing, .. }
            | HealthCheckDef::Tcp { timing, .. }
            | HealthCheckDef::MesosHttp { timing, .. }
            | HealthCheckDef::MesosTcp { timing, .. }
            | HealthCheckDef::Command { timing, .. } => timing,
        }
    }

    /// Port reference of the check, if it probes a port.
    pub fn port(&self) -> Option<&PortReference> {
        match self {
            HealthCheckDef::Http { port, .. }
            | HealthCheckDef::Tcp { port, .. }
            | HealthCheckDef::MesosHttp { port, .. }
            | HealthCheckDef::MesosTcp { port, .. } => Some(port),
            HealthCheckDef::Command { .. } => None,
        }
    }
}

/// A readiness check, evaluated only while a deployment is in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadinessCheckDef {
    /// Check name; distinguishes multiple checks on one spec.
    pub name: String,
    /// Request path.
    pub path: String,
    /// Named declared port to probe.
    pub port_name: String,
    /// Interval between probes.
    pub interval: Duration,
    /// Per-probe timeout.
    pub timeout: Duration,
    /// HTTP statuses that count as ready.
    pub http_status_codes_for_ready: BTreeSet<u16>,
    /// Whether the last probe body is kept for observability.
    pub preserve_last_response: bool,
}

impl Default for ReadinessCheckDef {
    fn default() -> Self {
        ReadinessCheckDef {
            name: "readiness-check".to_string(),
            path: "/".to_string(),
            port_name: "http-api".to_string(),
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
            http_status_codes_for_ready: BTreeSet::from([200]),
            preserve_last_response: false,
        }
    }
}
