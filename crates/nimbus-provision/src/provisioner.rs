//! Instance provisioner — the PENDING and TERMINATING reconciliation passes.
//!
//! Each pass batch-scans eligible instances and advances every one by a
//! single step under its own row lock. Backend calls are never made while
//! holding more than that one lock; offer discovery goes through the
//! cached offer source.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use nimbus_backend::{BackendRegistry, InstanceConfig};
use nimbus_offers::{OfferQuery, OfferSource, RankedOffer};
use nimbus_placement::{EnsureOutcome, PlacementCoordinator, PlacementError};
use nimbus_state::{
    Fleet, Instance, InstanceStatus, InstanceTerminationReason, LockManager, StateStore,
};

/// Minimum spacing between termination attempts against one instance.
const TERMINATION_RETRY_INTERVAL_SECS: u64 = 60;

/// How long termination is retried before the instance is force-marked
/// terminated without backend confirmation.
const TERMINATION_DEADLINE_SECS: u64 = 15 * 60;

pub type ProvisionResult<T> = Result<T, ProvisionError>;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("state store error: {0}")]
    State(#[from] nimbus_state::StateError),

    #[error("placement error: {0}")]
    Placement(#[from] PlacementError),
}

/// Drives PENDING instances into PROVISIONING and TERMINATING instances
/// out of existence.
pub struct Provisioner {
    state: StateStore,
    locks: Arc<LockManager>,
    registry: Arc<BackendRegistry>,
    offers: Arc<OfferSource>,
    placement: PlacementCoordinator,
}

impl Provisioner {
    pub fn new(
        state: StateStore,
        locks: Arc<LockManager>,
        registry: Arc<BackendRegistry>,
        offers: Arc<OfferSource>,
    ) -> Self {
        let placement = PlacementCoordinator::new(state.clone());
        Self {
            state,
            locks,
            registry,
            offers,
            placement,
        }
    }

    // ── PENDING pass ───────────────────────────────────────────────

    /// Provision every PENDING instance one step forward.
    ///
    /// Instances are visited masters-first within a fleet so cluster
    /// members can pick up the master's provisioning data in the same
    /// pass.
    pub async fn process_pending_instances(&self, now: u64) -> ProvisionResult<()> {
        let mut pending: Vec<Instance> = self
            .state
            .list_instances_all()?
            .into_iter()
            .filter(|i| !i.deleted && i.status == InstanceStatus::Pending)
            .collect();
        pending.sort_by(|a, b| {
            (a.fleet_id.as_deref(), a.instance_num).cmp(&(b.fleet_id.as_deref(), b.instance_num))
        });

        for candidate in pending {
            let _guard = self.locks.lock_row("instances", &candidate.id).await;
            // Re-fetch under the lock; a concurrent pass may have moved it.
            let Some(instance) = self.state.get_instance(&candidate.project, &candidate.id)?
            else {
                continue;
            };
            if instance.deleted || instance.status != InstanceStatus::Pending {
                continue;
            }
            if let Err(e) = self.provision_instance(instance, now).await {
                warn!(instance_id = %candidate.id, error = %e, "provisioning attempt failed");
            }
        }
        Ok(())
    }

    /// One provisioning attempt for a single PENDING instance.
    async fn provision_instance(&self, mut instance: Instance, now: u64) -> ProvisionResult<()> {
        let fleet = match &instance.fleet_id {
            Some(fleet_id) => self.state.get_fleet(&instance.project, fleet_id)?,
            None => None,
        };
        let is_cluster = fleet.as_ref().is_some_and(|f| f.spec.is_cluster_placement());

        // Cluster members never provision ahead of their master.
        let master = if is_cluster {
            self.cluster_master(&instance, fleet.as_ref())?
        } else {
            None
        };
        if is_cluster && instance.instance_num != 0 {
            let master_ready = master
                .as_ref()
                .is_some_and(|m| m.job_provisioning_data.is_some());
            if !master_ready {
                info!(instance = %instance.name, "cluster master not provisioned, terminating member");
                instance.begin_termination(InstanceTerminationReason::MasterFailed);
                instance.mark_terminated(now);
                self.state.put_instance(&instance)?;
                return Ok(());
            }
        }

        if self.registry.is_empty() {
            instance.begin_termination(InstanceTerminationReason::NoOffers);
            instance.mark_terminated(now);
            self.state.put_instance(&instance)?;
            return Ok(());
        }

        let query = self.build_query(&instance, fleet.as_ref(), master.as_ref(), is_cluster)?;
        let ranked = self.offers.get_offers(&query, now).await;
        debug!(instance = %instance.name, offers = ranked.len(), "ranked offers fetched");

        let mut unexpected_failure = false;
        for RankedOffer { backend: kind, offer } in &ranked {
            let Some(backend) = self.registry.get(kind) else {
                continue;
            };

            // Clustered fleets need a suitable placement group first.
            let mut placement_group = None;
            if is_cluster {
                let fleet_id = instance.fleet_id.as_deref().unwrap_or_default();
                let master_id = master
                    .as_ref()
                    .map_or(instance.id.as_str(), |m| m.id.as_str());
                match self
                    .placement
                    .ensure_group(&backend, fleet_id, master_id, &offer.offer)
                    .await
                {
                    Ok(EnsureOutcome::Group(group)) => placement_group = Some(group),
                    Ok(EnsureOutcome::SkipOffer) => continue,
                    Err(e) => {
                        // Abort the attempt; the instance stays PENDING.
                        warn!(instance = %instance.name, error = %e,
                            "placement group setup failed, retrying next pass");
                        return Ok(());
                    }
                }
            }

            let config = InstanceConfig {
                instance_id: instance.id.clone(),
                instance_name: instance.name.clone(),
                project: instance.project.clone(),
                user: "nimbus".to_string(),
                reservation: instance.requirements.reservation.clone(),
            };
            let pg_data = placement_group
                .as_ref()
                .and_then(|g| g.provisioning_data.clone());
            match backend
                .create_instance(&offer.offer, &config, pg_data.as_ref())
                .await
            {
                Ok(data) => {
                    instance.status = InstanceStatus::Provisioning;
                    instance.backend = Some(offer.offer.backend.clone());
                    instance.region = Some(offer.offer.region.clone());
                    instance.price = Some(offer.offer.price);
                    instance.offer = Some(offer.offer.clone());
                    instance.total_blocks = Some(crate::blocks::total_blocks(
                        instance.blocks,
                        &offer.offer.resources,
                    ));
                    instance.busy_blocks = 0;
                    instance.placement_group_id = placement_group.map(|g| g.id);
                    instance.job_provisioning_data = Some(data);
                    self.state.put_instance(&instance)?;
                    info!(
                        instance = %instance.name,
                        backend = %offer.offer.backend,
                        instance_type = %offer.offer.instance_type,
                        price = offer.offer.price,
                        "instance provisioning started"
                    );
                    return Ok(());
                }
                Err(e) if e.is_capacity() => {
                    debug!(instance = %instance.name, backend = %kind, error = %e,
                        "offer failed, trying next");
                }
                Err(e) => {
                    // Unexpected errors also advance to the next offer, but
                    // exhaustion caused by them leaves the instance PENDING
                    // for the next tick instead of terminating it.
                    unexpected_failure = true;
                    warn!(instance = %instance.name, backend = %kind, error = %e,
                        "unexpected create error, trying next offer");
                }
            }
        }

        if unexpected_failure {
            return Ok(());
        }
        info!(instance = %instance.name, "all offers exhausted");
        instance.begin_termination(InstanceTerminationReason::NoOffers);
        instance.mark_terminated(now);
        self.state.put_instance(&instance)?;
        Ok(())
    }

    /// The instance_num-0 member of the instance's fleet.
    fn cluster_master(
        &self,
        instance: &Instance,
        fleet: Option<&Fleet>,
    ) -> ProvisionResult<Option<Instance>> {
        let Some(fleet) = fleet else {
            return Ok(None);
        };
        Ok(self
            .state
            .list_instances_for_fleet(&instance.project, &fleet.id)?
            .into_iter()
            .find(|i| i.instance_num == 0))
    }

    fn build_query(
        &self,
        instance: &Instance,
        fleet: Option<&Fleet>,
        master: Option<&Instance>,
        is_cluster: bool,
    ) -> ProvisionResult<OfferQuery> {
        let profile = fleet.map(|f| f.spec.profile.clone()).unwrap_or_default();
        // An existing active group pins the region for the whole fleet.
        let placement_group = match fleet {
            Some(f) if is_cluster => self
                .state
                .list_placement_groups_for_fleet(&f.id)?
                .into_iter()
                .find(|g| !g.fleet_deleted)
                .map(|g| g.configuration),
            _ => None,
        };
        let master_provisioning_data = if instance.instance_num != 0 {
            master.and_then(|m| m.job_provisioning_data.clone())
        } else {
            None
        };
        Ok(OfferQuery {
            project: instance.project.clone(),
            requirements: instance.requirements.clone(),
            multinode: is_cluster,
            master_provisioning_data,
            placement_group,
            blocks: match instance.blocks {
                nimbus_state::BlocksSpec::Count(n) => Some(n),
                nimbus_state::BlocksSpec::Auto => None,
            },
            backends: profile.backends,
            regions: profile.regions,
            exclude_not_available: true,
        })
    }

    // ── TERMINATING pass ───────────────────────────────────────────

    /// Retire every TERMINATING instance, retrying backend termination
    /// with spaced attempts up to the termination deadline.
    pub async fn process_terminating_instances(&self, now: u64) -> ProvisionResult<()> {
        let terminating: Vec<Instance> = self
            .state
            .list_instances_all()?
            .into_iter()
            .filter(|i| !i.deleted && i.status == InstanceStatus::Terminating)
            .collect();

        for candidate in terminating {
            let _guard = self.locks.lock_row("instances", &candidate.id).await;
            let Some(mut instance) = self.state.get_instance(&candidate.project, &candidate.id)?
            else {
                continue;
            };
            if instance.deleted || instance.status != InstanceStatus::Terminating {
                continue;
            }

            // Nothing was ever created backend-side (or the host is an
            // SSH attachment): termination is just bookkeeping.
            let Some(data) = instance.job_provisioning_data.clone() else {
                instance.mark_terminated(now);
                self.state.put_instance(&instance)?;
                continue;
            };
            if instance.remote {
                instance.mark_terminated(now);
                self.state.put_instance(&instance)?;
                info!(instance = %instance.name, "ssh instance detached");
                continue;
            }

            // Space attempts out; the backend may still be shutting down.
            if instance
                .last_job_processed_at
                .is_some_and(|last| now < last + TERMINATION_RETRY_INTERVAL_SECS)
            {
                continue;
            }
            let deadline = match instance.termination_deadline {
                Some(deadline) => deadline,
                None => {
                    let deadline = now + TERMINATION_DEADLINE_SECS;
                    instance.termination_deadline = Some(deadline);
                    self.state.put_instance(&instance)?;
                    deadline
                }
            };

            let Some(backend) = self.registry.get(&data.backend) else {
                warn!(instance = %instance.name, backend = %data.backend,
                    "backend not configured, force-terminating");
                instance.mark_terminated(now);
                self.state.put_instance(&instance)?;
                continue;
            };
            match backend
                .terminate_instance(&data.instance_id, &data.region, data.backend_data.as_deref())
                .await
            {
                Ok(()) => {
                    instance.mark_terminated(now);
                    self.state.put_instance(&instance)?;
                    info!(instance = %instance.name, "instance terminated");
                }
                Err(e) if now >= deadline => {
                    warn!(instance = %instance.name, error = %e,
                        "termination deadline passed, force-terminating");
                    instance.mark_terminated(now);
                    self.state.put_instance(&instance)?;
                }
                Err(e) => {
                    debug!(instance = %instance.name, error = %e, "termination attempt failed, will retry");
                    instance.last_job_processed_at = Some(now);
                    self.state.put_instance(&instance)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_backend::testing::{CreateOutcome, StubCompute, test_offer, test_offer_with};
    use nimbus_backend::{PlacementStrategy, Requirements};
    use nimbus_state::*;

    fn setup(backends: Vec<StubCompute>) -> (Provisioner, StateStore, Vec<Arc<StubCompute>>) {
        let state = StateStore::open_in_memory().unwrap();
        let mut registry = BackendRegistry::new();
        let arcs: Vec<Arc<StubCompute>> = backends.into_iter().map(Arc::new).collect();
        for backend in &arcs {
            registry.register(backend.clone());
        }
        let registry = Arc::new(registry);
        let offers = Arc::new(OfferSource::new(registry.clone()));
        let provisioner = Provisioner::new(
            state.clone(),
            Arc::new(LockManager::new()),
            registry,
            offers,
        );
        (provisioner, state, arcs)
    }

    fn pending_instance(project: &str, fleet_id: Option<&str>, num: u32) -> Instance {
        Instance {
            id: new_id(),
            project: project.to_string(),
            name: format!("fleet-{num}"),
            fleet_id: fleet_id.map(str::to_string),
            instance_num: num,
            status: InstanceStatus::Pending,
            backend: None,
            region: None,
            price: None,
            offer: None,
            requirements: Requirements::default(),
            job_provisioning_data: None,
            placement_group_id: None,
            termination_reason: None,
            termination_reason_message: None,
            termination_deadline: None,
            last_job_processed_at: None,
            blocks: BlocksSpec::Auto,
            total_blocks: None,
            busy_blocks: 0,
            unreachable: false,
            health: HealthStatus::Unknown,
            remote: false,
            termination_policy: TerminationPolicy::DestroyAfterIdle,
            termination_idle_time_secs: 300,
            started_at: 1000,
            finished_at: None,
            deleted: false,
        }
    }

    fn cluster_fleet(id: &str) -> Fleet {
        let spec = FleetSpec {
            name: Some("cluster".to_string()),
            ssh_config: None,
            nodes: Some(FleetNodeCount { min: 0, target: 2 }),
            placement: Some(PlacementStrategy::Cluster),
            resources: Some(Requirements::default()),
            profile: Profile::default(),
        };
        Fleet {
            id: id.to_string(),
            project: "main".to_string(),
            name: "cluster".to_string(),
            spec_json: serde_json::to_string(&spec).unwrap(),
            spec,
            status: FleetStatus::Active,
            deleted: false,
            created_at: 1000,
        }
    }

    #[tokio::test]
    async fn tries_offers_in_rank_order_and_stops_at_first_success() {
        // aws has the cheaper offer but no capacity; gcp succeeds.
        let (provisioner, state, backends) = setup(vec![
            StubCompute::new("aws")
                .with_offers(vec![test_offer("aws", "a", 0.5)])
                .with_create_script(vec![CreateOutcome::NoCapacity]),
            StubCompute::new("gcp").with_offers(vec![test_offer("gcp", "b", 1.0)]),
        ]);
        let instance = pending_instance("main", None, 0);
        state.put_instance(&instance).unwrap();

        provisioner.process_pending_instances(1000).await.unwrap();

        let after = state.get_instance("main", &instance.id).unwrap().unwrap();
        assert_eq!(after.status, InstanceStatus::Provisioning);
        assert_eq!(after.backend.as_deref(), Some("gcp"));
        assert_eq!(backends[0].create_calls() + backends[1].create_calls(), 2);
        assert!(after.job_provisioning_data.is_some());
        assert_eq!(after.price, Some(1.0));
    }

    #[tokio::test]
    async fn exhausted_offers_terminate_with_no_offers() {
        let (provisioner, state, _) = setup(vec![StubCompute::new("aws")
            .with_offers(vec![test_offer("aws", "a", 0.5), test_offer("aws", "b", 1.0)])
            .with_create_script(vec![CreateOutcome::NoCapacity, CreateOutcome::Provisioning])]);
        let instance = pending_instance("main", None, 0);
        state.put_instance(&instance).unwrap();

        provisioner.process_pending_instances(1000).await.unwrap();

        let after = state.get_instance("main", &instance.id).unwrap().unwrap();
        assert_eq!(after.status, InstanceStatus::Terminated);
        assert_eq!(after.termination_reason, Some(InstanceTerminationReason::NoOffers));
        assert!(after.deleted);
        assert_eq!(after.finished_at, Some(1000));
    }

    #[tokio::test]
    async fn no_backends_terminates_with_no_offers() {
        let (provisioner, state, _) = setup(vec![]);
        let instance = pending_instance("main", None, 0);
        state.put_instance(&instance).unwrap();

        provisioner.process_pending_instances(1000).await.unwrap();

        let after = state.get_instance("main", &instance.id).unwrap().unwrap();
        assert_eq!(after.termination_reason, Some(InstanceTerminationReason::NoOffers));
    }

    #[tokio::test]
    async fn unexpected_create_error_leaves_instance_pending() {
        let (provisioner, state, _) = setup(vec![StubCompute::new("aws")
            .with_offers(vec![test_offer("aws", "a", 0.5)])
            .with_create_script(vec![CreateOutcome::Transient])]);
        let instance = pending_instance("main", None, 0);
        state.put_instance(&instance).unwrap();

        provisioner.process_pending_instances(1000).await.unwrap();

        let after = state.get_instance("main", &instance.id).unwrap().unwrap();
        assert_eq!(after.status, InstanceStatus::Pending);
    }

    #[tokio::test]
    async fn cluster_member_terminates_when_master_unprovisioned() {
        let (provisioner, state, backends) = setup(vec![StubCompute::new("aws")
            .with_multinode()
            .with_placement_groups()
            .with_offers(vec![test_offer("aws", "a", 0.5)])]);
        state.put_fleet(&cluster_fleet("f1")).unwrap();

        // Master exists but has no provisioning data; member must die
        // without a single backend call.
        let mut master = pending_instance("main", Some("f1"), 0);
        master.status = InstanceStatus::Terminated;
        master.deleted = true;
        state.put_instance(&master).unwrap();
        let member = pending_instance("main", Some("f1"), 1);
        state.put_instance(&member).unwrap();

        provisioner.process_pending_instances(1000).await.unwrap();

        let after = state.get_instance("main", &member.id).unwrap().unwrap();
        assert_eq!(after.status, InstanceStatus::Terminated);
        assert_eq!(
            after.termination_reason,
            Some(InstanceTerminationReason::MasterFailed)
        );
        assert_eq!(backends[0].create_calls(), 0);
        assert_eq!(backends[0].offer_calls(), 0);
    }

    #[tokio::test]
    async fn cluster_master_gets_placement_group_then_member_follows() {
        let (provisioner, state, backends) = setup(vec![StubCompute::new("aws")
            .with_multinode()
            .with_placement_groups()
            .with_offers(vec![test_offer("aws", "a", 0.5)])]);
        state.put_fleet(&cluster_fleet("f1")).unwrap();
        let master = pending_instance("main", Some("f1"), 0);
        let member = pending_instance("main", Some("f1"), 1);
        state.put_instance(&master).unwrap();
        state.put_instance(&member).unwrap();

        // Masters sort first, so the member sees the master's data within
        // the same pass.
        provisioner.process_pending_instances(1000).await.unwrap();

        let master_after = state.get_instance("main", &master.id).unwrap().unwrap();
        let member_after = state.get_instance("main", &member.id).unwrap().unwrap();
        assert_eq!(master_after.status, InstanceStatus::Provisioning);
        assert_eq!(member_after.status, InstanceStatus::Provisioning);
        assert!(master_after.placement_group_id.is_some());
        assert_eq!(master_after.placement_group_id, member_after.placement_group_id);
        assert_eq!(backends[0].create_pg_calls(), 1);
        assert_eq!(state.list_placement_groups_for_fleet("f1").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cluster_master_without_offers_terminates_no_offers() {
        let (provisioner, state, _) = setup(vec![StubCompute::new("aws")
            .with_multinode()
            .with_placement_groups()]);
        state.put_fleet(&cluster_fleet("f1")).unwrap();
        let master = pending_instance("main", Some("f1"), 0);
        state.put_instance(&master).unwrap();

        provisioner.process_pending_instances(1000).await.unwrap();

        let after = state.get_instance("main", &master.id).unwrap().unwrap();
        assert_eq!(after.termination_reason, Some(InstanceTerminationReason::NoOffers));
    }

    #[tokio::test]
    async fn auto_blocks_resolved_from_offer_resources() {
        let (provisioner, state, _) = setup(vec![
            StubCompute::new("aws").with_offers(vec![test_offer_with("aws", "gpu", 2.0, 32, 8)]),
        ]);
        let instance = pending_instance("main", None, 0);
        state.put_instance(&instance).unwrap();

        provisioner.process_pending_instances(1000).await.unwrap();

        let after = state.get_instance("main", &instance.id).unwrap().unwrap();
        assert_eq!(after.total_blocks, Some(8));
        assert_eq!(after.busy_blocks, 0);
    }

    // ── Termination ────────────────────────────────────────────────

    fn terminating_instance(state: &StateStore, provisioned: bool) -> Instance {
        let mut instance = pending_instance("main", None, 0);
        instance.begin_termination(InstanceTerminationReason::UserRequest);
        if provisioned {
            instance.job_provisioning_data = Some(nimbus_backend::JobProvisioningData {
                backend: "aws".to_string(),
                region: "us-east-1".to_string(),
                instance_type: "a".to_string(),
                instance_id: "i-123".to_string(),
                hostname: None,
                internal_ip: None,
                price: 0.5,
                username: "ubuntu".to_string(),
                ssh_port: 22,
                backend_data: None,
            });
        }
        state.put_instance(&instance).unwrap();
        instance
    }

    #[tokio::test]
    async fn never_created_instance_terminates_without_backend_call() {
        let (provisioner, state, backends) = setup(vec![StubCompute::new("aws")]);
        let instance = terminating_instance(&state, false);

        provisioner.process_terminating_instances(1000).await.unwrap();

        let after = state.get_instance("main", &instance.id).unwrap().unwrap();
        assert_eq!(after.status, InstanceStatus::Terminated);
        assert!(after.deleted);
        assert_eq!(backends[0].terminate_calls(), 0);
    }

    #[tokio::test]
    async fn termination_retries_with_spacing_until_success() {
        let (provisioner, state, backends) =
            setup(vec![StubCompute::new("aws").with_terminate_failures(1)]);
        let instance = terminating_instance(&state, true);

        // First attempt fails transiently.
        provisioner.process_terminating_instances(1000).await.unwrap();
        assert_eq!(backends[0].terminate_calls(), 1);
        let mid = state.get_instance("main", &instance.id).unwrap().unwrap();
        assert_eq!(mid.status, InstanceStatus::Terminating);

        // Too soon: no new attempt.
        provisioner.process_terminating_instances(1030).await.unwrap();
        assert_eq!(backends[0].terminate_calls(), 1);

        // Past the spacing window the retry succeeds.
        provisioner.process_terminating_instances(1061).await.unwrap();
        assert_eq!(backends[0].terminate_calls(), 2);
        let after = state.get_instance("main", &instance.id).unwrap().unwrap();
        assert_eq!(after.status, InstanceStatus::Terminated);
        assert!(after.deleted);
    }

    #[tokio::test]
    async fn termination_forced_past_deadline() {
        let (provisioner, state, backends) =
            setup(vec![StubCompute::new("aws").with_terminate_failures(100)]);
        let mut instance = terminating_instance(&state, true);
        instance.termination_deadline = Some(1100);
        state.put_instance(&instance).unwrap();

        provisioner.process_terminating_instances(1200).await.unwrap();

        let after = state.get_instance("main", &instance.id).unwrap().unwrap();
        assert_eq!(after.status, InstanceStatus::Terminated);
        assert!(after.deleted);
        assert_eq!(backends[0].terminate_calls(), 1);
    }

    #[tokio::test]
    async fn terminate_is_idempotent() {
        let (provisioner, state, backends) = setup(vec![StubCompute::new("aws")]);
        let instance = terminating_instance(&state, true);

        // The stub treats the instance as already absent; termination
        // succeeds silently and a second pass is a no-op.
        provisioner.process_terminating_instances(1000).await.unwrap();
        provisioner.process_terminating_instances(1100).await.unwrap();

        let after = state.get_instance("main", &instance.id).unwrap().unwrap();
        assert_eq!(after.status, InstanceStatus::Terminated);
        assert_eq!(backends[0].terminate_calls(), 1);
    }

    #[tokio::test]
    async fn ssh_instance_detaches_without_backend_call() {
        let (provisioner, state, backends) = setup(vec![StubCompute::new("aws")]);
        let mut instance = pending_instance("main", None, 0);
        instance.remote = true;
        instance.begin_termination(InstanceTerminationReason::FleetDeleted);
        instance.job_provisioning_data = Some(nimbus_backend::JobProvisioningData {
            backend: "remote".to_string(),
            region: "on-prem".to_string(),
            instance_type: "ssh".to_string(),
            instance_id: "host-1".to_string(),
            hostname: Some("host-1".to_string()),
            internal_ip: None,
            price: 0.0,
            username: "root".to_string(),
            ssh_port: 22,
            backend_data: None,
        });
        state.put_instance(&instance).unwrap();

        provisioner.process_terminating_instances(1000).await.unwrap();

        let after = state.get_instance("main", &instance.id).unwrap().unwrap();
        assert_eq!(after.status, InstanceStatus::Terminated);
        assert_eq!(backends[0].terminate_calls(), 0);
    }
}
