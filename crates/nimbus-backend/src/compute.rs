//! The `Compute` capability interface.
//!
//! One implementation per backend driver (AWS, GCP, Azure, Kubernetes,
//! on-prem SSH). Optional capabilities are separate traits reached through
//! accessor methods — the control plane checks for a capability by asking
//! for the trait object, never by probing attributes.

use async_trait::async_trait;

use crate::error::{BackendError, BackendResult};
use crate::types::{
    InstanceConfig, InstanceOffer, InstanceOfferWithAvailability, JobProvisioningData,
    PlacementGroupConfig, PlacementGroupProvisioningData, Requirements,
};

/// A compute backend driver.
///
/// All network calls live behind this trait; the control plane never holds
/// a row lock across one of them except the minimal persist window.
#[async_trait]
pub trait Compute: Send + Sync {
    /// Stable backend identifier ("aws", "gcp", "azure", "kubernetes", ...).
    fn kind(&self) -> &str;

    /// List offers matching the requirements, with availability.
    ///
    /// Drivers may pre-filter offers they cannot satisfy; the offer source
    /// applies the requirements filter again before ranking.
    async fn get_offers(
        &self,
        requirements: &Requirements,
    ) -> BackendResult<Vec<InstanceOfferWithAvailability>>;

    /// Launch an instance for the given offer.
    async fn create_instance(
        &self,
        offer: &InstanceOffer,
        config: &InstanceConfig,
        placement_group: Option<&PlacementGroupProvisioningData>,
    ) -> BackendResult<JobProvisioningData>;

    /// Terminate a backend instance.
    ///
    /// Must be idempotent: terminating an already-absent resource succeeds
    /// silently.
    async fn terminate_instance(
        &self,
        instance_id: &str,
        region: &str,
        backend_data: Option<&str>,
    ) -> BackendResult<()>;

    /// Create a placement group for the master offer.
    async fn create_placement_group(
        &self,
        config: &PlacementGroupConfig,
        _master_offer: &InstanceOffer,
    ) -> BackendResult<PlacementGroupProvisioningData> {
        Err(BackendError::PlacementGroupNotSupported(format!(
            "{} does not support placement groups",
            config.backend
        )))
    }

    /// Delete a placement group. Deleting an already-absent group succeeds.
    async fn delete_placement_group(
        &self,
        _config: &PlacementGroupConfig,
        _data: &PlacementGroupProvisioningData,
    ) -> BackendResult<()> {
        Ok(())
    }

    /// Whether an existing group can host the given offer.
    fn is_suitable_placement_group(
        &self,
        _config: &PlacementGroupConfig,
        _offer: &InstanceOffer,
    ) -> bool {
        false
    }

    // ── Optional capabilities ──────────────────────────────────────

    fn multinode(&self) -> Option<&dyn SupportsMultinode> {
        None
    }

    fn volumes(&self) -> Option<&dyn SupportsVolumes> {
        None
    }

    fn gateway(&self) -> Option<&dyn SupportsGateway> {
        None
    }

    fn reservations(&self) -> Option<&dyn SupportsReservations> {
        None
    }
}

/// The backend can run multi-node (cluster) jobs.
pub trait SupportsMultinode: Send + Sync {
    /// Regions where cluster networking is available.
    fn cluster_regions(&self) -> Vec<String>;
}

/// The backend can attach/detach block volumes.
#[async_trait]
pub trait SupportsVolumes: Send + Sync {
    async fn attach_volume(&self, volume_id: &str, instance_id: &str) -> BackendResult<()>;
    async fn detach_volume(&self, volume_id: &str, instance_id: &str) -> BackendResult<()>;
}

/// The backend can provision gateway instances.
#[async_trait]
pub trait SupportsGateway: Send + Sync {
    async fn create_gateway(&self, region: &str) -> BackendResult<JobProvisioningData>;
    async fn terminate_gateway(&self, instance_id: &str, region: &str) -> BackendResult<()>;
}

/// The backend understands capacity reservations in its offer listings.
pub trait SupportsReservations: Send + Sync {
    /// Whether the reservation id is usable in the given region.
    fn reservation_usable(&self, reservation: &str, region: &str) -> bool;
}
