//! Resource offers from the external manager.
//!
//! An offer advertises resources on one agent: scalar slices (cpus, mem,
//! disk, gpus) and port ranges, each tagged with a role and optionally with
//! a dynamic reservation. Matching consumes portions of these slices.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use fleet_model::{Attribute, DiskType};

/// Identifier of an offer; valid only within the offer's window.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OfferId(pub String);

impl std::fmt::Display for OfferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A contiguous port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    /// First port, inclusive.
    pub begin: u16,
    /// Last port, inclusive.
    pub end: u16,
}

impl PortRange {
    /// Iterate the ports of the range in ascending order.
    pub fn ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.begin..=self.end
    }

    /// Whether the range contains the port.
    pub fn contains(&self, port: u16) -> bool {
        (self.begin..=self.end).contains(&port)
    }
}

/// Value of one offered resource slice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResourceValue {
    /// A scalar amount (cpus, mem, disk, gpus).
    Scalar(f64),
    /// Port ranges.
    Ranges(Vec<PortRange>),
}

/// Dynamic reservation metadata on a resource slice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ReservationLabels {
    /// Principal that made the reservation.
    pub principal: Option<String>,
    /// Reservation labels; matching requires equality with the spec's.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Disk-specific metadata on a `disk` resource slice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskInfo {
    /// Where the disk space lives.
    pub source: DiskType,
    /// Persistence id when the slice backs an existing volume.
    pub persistence_id: Option<String>,
}

/// One role-tagged resource slice of an offer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferResource {
    /// Resource name: `cpus`, `mem`, `disk`, `gpus` or `ports`.
    pub name: String,
    /// Role the slice is tagged with; `*` is the unreserved pool.
    pub role: String,
    /// Dynamic reservation, if any.
    pub reservation: Option<ReservationLabels>,
    /// The offered amount.
    pub value: ResourceValue,
    /// Disk metadata for `disk` slices.
    pub disk: Option<DiskInfo>,
}

impl OfferResource {
    /// An unreserved scalar slice.
    pub fn scalar(name: &str, amount: f64) -> Self {
        OfferResource {
            name: name.to_string(),
            role: "*".to_string(),
            reservation: None,
            value: ResourceValue::Scalar(amount),
            disk: None,
        }
    }

    /// An unreserved port-range slice.
    pub fn ports(begin: u16, end: u16) -> Self {
        OfferResource {
            name: "ports".to_string(),
            role: "*".to_string(),
            reservation: None,
            value: ResourceValue::Ranges(vec![PortRange { begin, end }]),
            disk: None,
        }
    }

    /// Scalar amount, 0 for range slices.
    pub fn scalar_amount(&self) -> f64 {
        match &self.value {
            ResourceValue::Scalar(v) => *v,
            ResourceValue::Ranges(_) => 0.0,
        }
    }
}

/// A resource advertisement from the external manager, scoped to one agent
/// and a validity window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    /// Offer id.
    pub id: OfferId,
    /// Agent the resources live on.
    pub agent_id: String,
    /// Agent hostname.
    pub hostname: String,
    /// Offered resource slices.
    pub resources: Vec<OfferResource>,
    /// Agent attributes.
    #[serde(default)]
    pub attributes: Vec<Attribute>,
}

impl Offer {
    /// A plain offer with the given scalar amounts and one port range,
    /// everything unreserved. The shape most tests need.
    pub fn plain(
        id: &str,
        hostname: &str,
        cpus: f64,
        mem: f64,
        ports: Option<(u16, u16)>,
    ) -> Self {
        let mut resources = vec![
            OfferResource::scalar("cpus", cpus),
            OfferResource::scalar("mem", mem),
        ];
        if let Some((begin, end)) = ports {
            resources.push(OfferResource::ports(begin, end));
        }
        Offer {
            id: OfferId(id.to_string()),
            agent_id: format!("agent-{hostname}"),
            hostname: hostname.to_string(),
            resources,
            attributes: Vec::new(),
        }
    }

    /// Total scalar amount offered under the given name, over all roles.
    pub fn scalar_total(&self, name: &str) -> f64 {
        self.resources
            .iter()
            .filter(|r| r.name == name)
            .map(OfferResource::scalar_amount)
            .sum()
    }

    /// Attribute value by name; `hostname` resolves to the agent host.
    pub fn attribute(&self, field: &str) -> Option<String> {
        if field == "hostname" {
            return Some(self.hostname.clone());
        }
        self.attributes.iter().find(|a| a.name == field).map(|a| a.value.as_text())
    }
}
