//! Value types shared between the control plane and backend drivers.
//!
//! Offers, requirements, provisioning data, and placement-group
//! configuration. Everything is serde-serializable; persisted rows embed
//! these types as JSON.

use serde::{Deserialize, Serialize};

// ── Resources & offers ─────────────────────────────────────────────

/// Concrete resources of an instance type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    pub cpus: u32,
    pub memory_mib: u64,
    pub gpus: u32,
    /// GPU model name, when the type carries GPUs.
    pub gpu_name: Option<String>,
    pub disk_gib: u64,
    pub spot: bool,
}

/// A priced (backend, region, instance-type, resources) tuple returned by
/// a backend capacity query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceOffer {
    pub backend: String,
    pub region: String,
    pub instance_type: String,
    pub resources: Resources,
    /// Price in USD per hour.
    pub price: f64,
}

/// Availability as reported by the backend's quota/zone lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceAvailability {
    Unknown,
    Available,
    NoQuota,
    NotAvailable,
}

impl InstanceAvailability {
    /// True when the offer should be dropped under `exclude_not_available`.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::NoQuota | Self::NotAvailable)
    }
}

/// An offer together with its availability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceOfferWithAvailability {
    pub offer: InstanceOffer,
    pub availability: InstanceAvailability,
}

// ── Requirements ───────────────────────────────────────────────────

/// Inclusive range over a scalar resource. `max = None` means unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRange {
    pub min: u64,
    pub max: Option<u64>,
}

impl ResourceRange {
    pub fn at_least(min: u64) -> Self {
        Self { min, max: None }
    }

    pub fn contains(&self, value: u64) -> bool {
        value >= self.min && self.max.is_none_or(|max| value <= max)
    }
}

impl Default for ResourceRange {
    fn default() -> Self {
        Self::at_least(0)
    }
}

/// Spot policy requested for an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpotPolicy {
    /// Only spot capacity.
    Spot,
    /// Only on-demand capacity.
    OnDemand,
    /// Either, ranked purely by price.
    #[default]
    Auto,
}

/// Resource ranges a run/fleet asks for.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    pub cpus: ResourceRange,
    pub memory_mib: ResourceRange,
    pub gpus: ResourceRange,
    pub disk_gib: ResourceRange,
}

/// A full capacity filter: resources, price cap, spot policy, reservation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Requirements {
    pub resources: ResourceRequirements,
    /// Maximum price in USD per hour.
    pub max_price: Option<f64>,
    pub spot: SpotPolicy,
    /// Capacity reservation id. Spot offers are never matched against a
    /// reservation.
    pub reservation: Option<String>,
}

impl Requirements {
    /// Whether an offer satisfies these requirements.
    pub fn matches(&self, offer: &InstanceOffer) -> bool {
        let r = &offer.resources;
        if !self.resources.cpus.contains(u64::from(r.cpus))
            || !self.resources.memory_mib.contains(r.memory_mib)
            || !self.resources.gpus.contains(u64::from(r.gpus))
            || !self.resources.disk_gib.contains(r.disk_gib)
        {
            return false;
        }
        if self.max_price.is_some_and(|cap| offer.price > cap) {
            return false;
        }
        let spot_ok = match self.spot {
            SpotPolicy::Spot => r.spot,
            SpotPolicy::OnDemand => !r.spot,
            SpotPolicy::Auto => true,
        };
        if !spot_ok {
            return false;
        }
        // A capacity reservation excludes spot offers outright.
        if self.reservation.is_some() && r.spot {
            return false;
        }
        true
    }
}

// ── Provisioning data ──────────────────────────────────────────────

/// What a backend hands back once an instance exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobProvisioningData {
    pub backend: String,
    pub region: String,
    pub instance_type: String,
    /// Backend-native instance id.
    pub instance_id: String,
    pub hostname: Option<String>,
    pub internal_ip: Option<String>,
    pub price: f64,
    pub username: String,
    pub ssh_port: u16,
    /// Opaque driver payload carried through to termination.
    pub backend_data: Option<String>,
}

/// Per-instance creation parameters passed to `create_instance`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub instance_id: String,
    pub instance_name: String,
    pub project: String,
    pub user: String,
    pub reservation: Option<String>,
}

// ── Placement groups ───────────────────────────────────────────────

/// Backend-native colocation strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementStrategy {
    /// Pack nodes close together for low inter-node latency.
    Cluster,
    /// Spread nodes over distinct partitions.
    Partition,
}

/// Desired configuration of a placement group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacementGroupConfig {
    pub backend: String,
    pub region: String,
    pub strategy: PlacementStrategy,
}

/// Opaque backend handle for a created placement group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacementGroupProvisioningData {
    pub backend: String,
    pub backend_id: String,
}
