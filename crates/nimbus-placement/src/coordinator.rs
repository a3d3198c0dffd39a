//! Placement group coordinator.
//!
//! Owns the fleet ↔ active-group mapping for clustered fleets: one active
//! group per fleet per (backend, region). Reuse is delegated to the
//! backend's suitability check; superseded groups are marked for cleanup
//! and deleted opportunistically once no instance references them.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use nimbus_backend::{
    BackendError, BackendRegistry, Compute, InstanceOffer, PlacementGroupConfig,
    PlacementStrategy,
};
use nimbus_state::{PlacementGroup, StateStore, new_id};

/// Result type alias for placement coordination.
pub type PlacementResult<T> = Result<T, PlacementError>;

#[derive(Debug, Error)]
pub enum PlacementError {
    #[error("state store error: {0}")]
    State(#[from] nimbus_state::StateError),

    /// Group creation failed in a way that must abort the offer attempt.
    #[error("placement group creation failed: {0}")]
    Backend(#[source] BackendError),
}

/// What `ensure_group` decided for one offer.
#[derive(Debug)]
pub enum EnsureOutcome {
    /// A group (existing or freshly created) suitable for the offer.
    Group(PlacementGroup),
    /// The backend cannot colocate this offer; try the next one.
    SkipOffer,
}

/// Creates, reuses, and retires placement groups for clustered fleets.
#[derive(Clone)]
pub struct PlacementCoordinator {
    state: StateStore,
}

impl PlacementCoordinator {
    pub fn new(state: StateStore) -> Self {
        Self { state }
    }

    /// Ensure a placement group exists for (fleet, offer) before instance
    /// creation.
    ///
    /// The fleet's existing group is reused when the backend reports it
    /// suitable for the offer; otherwise it is marked `fleet_deleted` for
    /// later cleanup and a new group scoped to this offer's master is
    /// created. Not-supported and capacity failures are offer failures
    /// ([`EnsureOutcome::SkipOffer`]); anything else aborts the attempt.
    pub async fn ensure_group(
        &self,
        backend: &Arc<dyn Compute>,
        fleet_id: &str,
        master_instance_id: &str,
        offer: &InstanceOffer,
    ) -> PlacementResult<EnsureOutcome> {
        let existing = self
            .state
            .list_placement_groups_for_fleet(fleet_id)?
            .into_iter()
            .find(|g| !g.fleet_deleted && g.configuration.backend == offer.backend);

        if let Some(group) = existing {
            if backend.is_suitable_placement_group(&group.configuration, offer) {
                debug!(fleet_id, group = %group.name, "reusing placement group");
                return Ok(EnsureOutcome::Group(group));
            }
            // Retire the unsuitable group; cleanup happens once its
            // instances are gone.
            let mut retired = group;
            retired.fleet_deleted = true;
            self.state.put_placement_group(&retired)?;
            debug!(fleet_id, group = %retired.name, "marked unsuitable placement group for cleanup");
        }

        let config = PlacementGroupConfig {
            backend: offer.backend.clone(),
            region: offer.region.clone(),
            strategy: PlacementStrategy::Cluster,
        };
        match backend.create_placement_group(&config, offer).await {
            Ok(data) => {
                let group = PlacementGroup {
                    id: new_id(),
                    fleet_id: fleet_id.to_string(),
                    name: format!("{fleet_id}-{}-{}", offer.backend, offer.region),
                    configuration: config,
                    provisioning_data: Some(data),
                    master_instance_id: Some(master_instance_id.to_string()),
                    fleet_deleted: false,
                };
                self.state.put_placement_group(&group)?;
                info!(fleet_id, group = %group.name, "placement group created");
                Ok(EnsureOutcome::Group(group))
            }
            Err(e @ (BackendError::PlacementGroupNotSupported(_) | BackendError::NoCapacity(_))) => {
                debug!(fleet_id, error = %e, "placement group unavailable for offer");
                Ok(EnsureOutcome::SkipOffer)
            }
            Err(e) => Err(PlacementError::Backend(e)),
        }
    }

    /// Mark every group of a fleet for cleanup (fleet deletion/reshape).
    pub fn mark_fleet_groups_deleted(&self, fleet_id: &str) -> PlacementResult<()> {
        for mut group in self.state.list_placement_groups_for_fleet(fleet_id)? {
            if !group.fleet_deleted {
                group.fleet_deleted = true;
                self.state.put_placement_group(&group)?;
            }
        }
        Ok(())
    }

    /// Delete retired groups whose instances are all gone.
    ///
    /// A group is deleted only after every instance that used it is
    /// terminated; backend "in use" errors defer to the next pass.
    /// Returns the number of groups removed.
    pub async fn cleanup_pass(&self, registry: &BackendRegistry) -> PlacementResult<usize> {
        let fleets = self.state.list_fleets_all()?;
        let instances = self.state.list_instances_all()?;
        let mut removed = 0;

        for group in self.state.list_placement_groups_all()? {
            let fleet_gone = fleets
                .iter()
                .find(|f| f.id == group.fleet_id)
                .is_none_or(|f| f.deleted);
            if !group.fleet_deleted && !fleet_gone {
                continue;
            }

            let in_use = instances
                .iter()
                .any(|i| !i.deleted && i.placement_group_id.as_deref() == Some(&group.id));
            if in_use {
                continue;
            }

            if let Some(data) = &group.provisioning_data {
                let Some(backend) = registry.get(&group.configuration.backend) else {
                    warn!(group = %group.name, backend = %group.configuration.backend,
                        "backend gone, dropping placement group row");
                    self.state.remove_placement_group(&group.fleet_id, &group.id)?;
                    removed += 1;
                    continue;
                };
                match backend.delete_placement_group(&group.configuration, data).await {
                    Ok(()) => {}
                    Err(BackendError::PlacementGroupInUse(_)) => {
                        debug!(group = %group.name, "placement group still in use, deferring");
                        continue;
                    }
                    Err(e) => {
                        warn!(group = %group.name, error = %e, "placement group deletion failed, deferring");
                        continue;
                    }
                }
            }
            self.state.remove_placement_group(&group.fleet_id, &group.id)?;
            info!(group = %group.name, "placement group deleted");
            removed += 1;
        }
        Ok(removed)
    }
}
