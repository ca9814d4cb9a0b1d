//! Offer-to-spec matching.
//!
//! Given a run spec and an offer, decide whether the offer satisfies the
//! spec's scalar, port, constraint and persistent-volume requirements. A
//! mismatch is a data outcome carrying the reasons, never an error.

use std::collections::BTreeSet;
use tracing::debug;
use uuid::Uuid;

use fleet_model::{Constraint, DiskType, Instance, RunSpec};

use crate::constraints::offer_matches_constraint;
use crate::offer::{Offer, OfferResource, ResourceValue};

/// A concrete portion of one offered slice to consume.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumedResource {
    /// Resource name.
    pub name: String,
    /// Role of the slice the portion comes from; the role is preserved,
    /// never silently re-roled.
    pub role: String,
    /// Amount consumed.
    pub amount: f64,
}

/// One granted host port.
#[derive(Debug, Clone, PartialEq)]
pub struct PortBinding {
    /// The granted host port.
    pub host_port: u16,
    /// Role of the range the port came from.
    pub role: String,
}

/// One matched persistent volume.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeMatch {
    /// Mount point the volume backs.
    pub container_path: String,
    /// Persistence id; freshly minted for new reservations.
    pub persistence_id: String,
    /// Volume size in MiB.
    pub size_mb: u64,
    /// Role of the disk slice.
    pub role: String,
    /// Whether a new reservation must be created for this volume.
    pub new_reservation: bool,
}

/// Everything the matcher decided to consume from the offer.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResourceMatch {
    /// Scalar portions to consume.
    pub consumed: Vec<ConsumedResource>,
    /// Host ports in declared order; container-only slots stay `None`.
    pub port_bindings: Vec<Option<PortBinding>>,
    /// Matched persistent volumes.
    pub volumes: Vec<VolumeMatch>,
}

impl ResourceMatch {
    /// The granted host ports, skipping container-only slots.
    pub fn host_ports(&self) -> Vec<u16> {
        self.port_bindings.iter().flatten().map(|b| b.host_port).collect()
    }
}

/// Why an offer did not satisfy a spec.
#[derive(Debug, Clone, PartialEq)]
pub enum NoMatchReason {
    /// Not enough of a scalar resource among the eligible slices.
    InsufficientScalar {
        /// Resource name.
        resource: String,
        /// Demanded amount.
        required: f64,
        /// Eligible amount in the offer.
        offered: f64,
    },
    /// A declared port could not be granted; 0 stands for a dynamic port.
    UnfulfilledPort(u16),
    /// A placement constraint rejected the agent.
    UnfulfilledConstraint(Constraint),
    /// No disk in the offer can back the persistent volume at this path.
    NoAvailableVolume(String),
}

impl std::fmt::Display for NoMatchReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NoMatchReason::InsufficientScalar { resource, required, offered } => {
                write!(f, "insufficient {resource}: required {required}, offered {offered}")
            }
            NoMatchReason::UnfulfilledPort(0) => write!(f, "no free port in offer"),
            NoMatchReason::UnfulfilledPort(port) => write!(f, "port {port} not offered"),
            NoMatchReason::UnfulfilledConstraint(c) => {
                write!(f, "constraint on {} not satisfiable", c.field)
            }
            NoMatchReason::NoAvailableVolume(path) => {
                write!(f, "no disk for persistent volume at {path}")
            }
        }
    }
}

/// Outcome of matching one spec against one offer.
#[derive(Debug, Clone, PartialEq)]
pub enum OfferMatch {
    /// The offer satisfies the spec; consume the selection.
    Match(ResourceMatch),
    /// The offer does not satisfy the spec.
    NoMatch(Vec<NoMatchReason>),
}

impl OfferMatch {
    /// The selection, if matched.
    pub fn matched(self) -> Option<ResourceMatch> {
        match self {
            OfferMatch::Match(m) => Some(m),
            OfferMatch::NoMatch(_) => None,
        }
    }
}

/// Mutable view of one offered slice during a single match invocation. All
/// scratch state is local to the invocation; nothing leaks on early return.
struct SliceState<'a> {
    resource: &'a OfferResource,
    remaining: f64,
    taken_ports: BTreeSet<u16>,
}

/// Decide whether `offer` satisfies `spec`.
///
/// `running` are the spec's current instances (for constraint evaluation),
/// `accepted_roles` the roles the framework accepts, `principal` the
/// framework principal used to recognize its own reservations.
pub fn match_offer(
    spec: &RunSpec,
    offer: &Offer,
    running: &[Instance],
    accepted_roles: &BTreeSet<String>,
    principal: Option<&str>,
) -> OfferMatch {
    let mut reasons = Vec::new();

    let spec_constraints: &[Constraint] = match spec {
        RunSpec::App(app) => &app.constraints,
        RunSpec::Pod(pod) => &pod.constraints,
    };
    for constraint in spec_constraints {
        if !offer_matches_constraint(constraint, offer, running) {
            reasons.push(NoMatchReason::UnfulfilledConstraint(constraint.clone()));
        }
    }

    let resident = spec.is_resident();
    // Eligible slices in consumption order: the unreserved pool first, then
    // other accepted roles; reservations only for resident specs whose
    // principal matches.
    let mut slices: Vec<SliceState<'_>> = Vec::new();
    let eligible = |r: &OfferResource| -> bool {
        match &r.reservation {
            None => accepted_roles.contains(&r.role),
            Some(reservation) => {
                resident && reservation.principal.as_deref() == principal
            }
        }
    };
    for r in offer.resources.iter().filter(|r| eligible(r) && r.reservation.is_none() && r.role == "*")
    {
        slices.push(SliceState { resource: r, remaining: r.scalar_amount(), taken_ports: BTreeSet::new() });
    }
    for r in offer.resources.iter().filter(|r| eligible(r) && r.reservation.is_none() && r.role != "*")
    {
        slices.push(SliceState { resource: r, remaining: r.scalar_amount(), taken_ports: BTreeSet::new() });
    }
    for r in offer.resources.iter().filter(|r| eligible(r) && r.reservation.is_some()) {
        slices.push(SliceState { resource: r, remaining: r.scalar_amount(), taken_ports: BTreeSet::new() });
    }

    let mut selection = ResourceMatch::default();

    // Scalar demands, greedily over the ordered slices. The consumed
    // portion keeps the role of the slice it came from.
    let demand = spec.aggregate_resources();
    for (name, required) in [
        ("cpus", demand.cpus),
        ("mem", demand.mem),
        ("disk", demand.disk),
        ("gpus", demand.gpus),
    ] {
        if required <= 0.0 {
            continue;
        }
        let mut left = required;
        for slice in slices.iter_mut().filter(|s| scratch_scalar(s.resource, name)) {
            if left <= 0.0 {
                break;
            }
            let take = left.min(slice.remaining);
            if take > 0.0 {
                slice.remaining -= take;
                left -= take;
                selection.consumed.push(ConsumedResource {
                    name: name.to_string(),
                    role: slice.resource.role.clone(),
                    amount: take,
                });
            }
        }
        if left > 1e-9 {
            let offered: f64 = offer
                .resources
                .iter()
                .filter(|r| scratch_scalar(r, name) && eligible(r))
                .map(OfferResource::scalar_amount)
                .sum();
            reasons.push(NoMatchReason::InsufficientScalar {
                resource: name.to_string(),
                required,
                offered,
            });
        }
    }

    // Port allocation in declared order. Fixed ports must appear in the
    // offered ranges; port 0 takes the lowest free port; container-only
    // slots keep their position with no binding.
    let require_ports = match spec {
        RunSpec::App(app) => app.require_ports,
        RunSpec::Pod(_) => false,
    };
    for declared in spec.declared_ports() {
        match declared.host_port {
            None => selection.port_bindings.push(None),
            Some(port) => {
                // Without requirePorts a declared port is a hint and may be
                // remapped; only requirePorts pins it, and 0 always means
                // dynamic.
                let fixed = port != 0 && require_ports;
                let granted = if fixed {
                    take_fixed_port(&mut slices, port)
                } else {
                    take_any_port(&mut slices)
                };
                match granted {
                    Some(binding) => selection.port_bindings.push(Some(binding)),
                    None => {
                        reasons.push(NoMatchReason::UnfulfilledPort(if fixed { port } else { 0 }));
                        selection.port_bindings.push(None);
                    }
                }
            }
        }
    }

    // Persistent volumes for resident specs: existing reservations with a
    // persistence id are taken as-is; otherwise an unreserved disk backs a
    // new reservation. Mount disks are indivisible.
    if let RunSpec::App(app) = spec {
        for mount in app.persistent_volumes() {
            let volume = mount.persistent.as_ref().expect("filtered to persistent volumes");
            match take_volume(&mut slices, &mount.container_path, volume.size_mb, volume.disk_type)
            {
                Some(matched) => selection.volumes.push(matched),
                None => {
                    reasons.push(NoMatchReason::NoAvailableVolume(mount.container_path.clone()))
                }
            }
        }
    }

    if reasons.is_empty() {
        debug!(spec = %spec.id(), offer = %offer.id, "offer matched");
        OfferMatch::Match(selection)
    } else {
        debug!(spec = %spec.id(), offer = %offer.id, reasons = reasons.len(), "offer rejected");
        OfferMatch::NoMatch(reasons)
    }
}

/// Whether a slice can satisfy scratch scalar demand under `name`. Disk
/// slices that back persistent volumes (mount disks or slices with a
/// persistence id) are excluded from scratch consumption.
fn scratch_scalar(resource: &OfferResource, name: &str) -> bool {
    if resource.name != name {
        return false;
    }
    if name == "disk" {
        if let Some(disk) = &resource.disk {
            if disk.persistence_id.is_some() || disk.source == DiskType::Mount {
                return false;
            }
        }
    }
    matches!(resource.value, ResourceValue::Scalar(_))
}

fn take_fixed_port(slices: &mut [SliceState<'_>], port: u16) -> Option<PortBinding> {
    for slice in slices.iter_mut().filter(|s| s.resource.name == "ports") {
        if let ResourceValue::Ranges(ranges) = &slice.resource.value {
            if ranges.iter().any(|r| r.contains(port)) && !slice.taken_ports.contains(&port) {
                slice.taken_ports.insert(port);
                return Some(PortBinding { host_port: port, role: slice.resource.role.clone() });
            }
        }
    }
    None
}

fn take_any_port(slices: &mut [SliceState<'_>]) -> Option<PortBinding> {
    for slice in slices.iter_mut().filter(|s| s.resource.name == "ports") {
        if let ResourceValue::Ranges(ranges) = &slice.resource.value {
            for range in ranges {
                for port in range.ports() {
                    if !slice.taken_ports.contains(&port) {
                        slice.taken_ports.insert(port);
                        return Some(PortBinding {
                            host_port: port,
                            role: slice.resource.role.clone(),
                        });
                    }
                }
            }
        }
    }
    None
}

fn take_volume(
    slices: &mut [SliceState<'_>],
    container_path: &str,
    size_mb: u64,
    disk_type: DiskType,
) -> Option<VolumeMatch> {
    let size = size_mb as f64;

    // Reserved disks carrying a persistence id are resumed as-is.
    for slice in slices.iter_mut() {
        if slice.resource.name != "disk" || slice.remaining < size {
            continue;
        }
        if let Some(disk) = &slice.resource.disk {
            if let Some(persistence_id) = &disk.persistence_id {
                if slice.resource.reservation.is_some() {
                    slice.remaining -= size;
                    return Some(VolumeMatch {
                        container_path: container_path.to_string(),
                        persistence_id: persistence_id.clone(),
                        size_mb,
                        role: slice.resource.role.clone(),
                        new_reservation: false,
                    });
                }
            }
        }
    }

    // Fresh reservation on an unreserved disk of the requested type. A
    // mount disk is only taken when the volume consumes it entirely.
    for slice in slices.iter_mut() {
        if slice.resource.name != "disk" || slice.resource.reservation.is_some() {
            continue;
        }
        let source = slice.resource.disk.as_ref().map(|d| d.source).unwrap_or(DiskType::Root);
        if source != disk_type {
            continue;
        }
        let fits = slice.remaining >= size && size > 0.0;
        if fits {
            // A mount disk is indivisible: the volume takes the whole disk.
            let consumed = match source {
                DiskType::Mount => slice.remaining,
                DiskType::Root | DiskType::Path => size,
            };
            slice.remaining -= consumed;
            return Some(VolumeMatch {
                container_path: container_path.to_string(),
                persistence_id: Uuid::new_v4().to_string(),
                size_mb,
                role: slice.resource.role.clone(),
                new_reservation: true,
            });
        }
    }

    None
}
