//! Fleet manager — fleet specs, instance membership, and update rules.
//!
//! Fleets come in two mutually exclusive shapes: cloud-provisioned
//! (`nodes`) and SSH-attached (`ssh_config`). Creation materializes the
//! member instances; in-place updates are restricted to adding/removing
//! SSH hosts; deletion is guarded against active jobs and runs.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info};

use nimbus_backend::JobProvisioningData;
use nimbus_placement::PlacementCoordinator;
use nimbus_state::{
    BlocksSpec, Fleet, FleetSpec, FleetStatus, HealthStatus, Instance, InstanceStatus,
    InstanceTerminationReason, LockManager, Run, SshHost, StateStore, TerminationPolicy, new_id,
};

use crate::diff::{calculate_ssh_hosts_changes, check_can_update_fleet_spec, next_instance_num};
use crate::error::{FleetError, FleetResult};

/// What applying a fleet spec would do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FleetPlanAction {
    Create,
    Update,
    Noop,
}

/// Dry-run result for a fleet spec.
#[derive(Debug, Clone)]
pub struct FleetPlan {
    pub effective_spec: FleetSpec,
    pub current: Option<Fleet>,
    pub action: FleetPlanAction,
}

/// Validate a fleet spec and fill defaults.
///
/// Exactly one of `ssh_config`/`nodes` must be set; SSH host lists must be
/// non-empty and free of duplicate hostnames.
pub fn validate_fleet_spec_and_set_defaults(spec: &FleetSpec) -> FleetResult<FleetSpec> {
    match (&spec.ssh_config, &spec.nodes) {
        (Some(_), Some(_)) => {
            return Err(FleetError::client(
                "fleet spec must set only one of ssh_config and nodes",
            ));
        }
        (None, None) => {
            return Err(FleetError::client(
                "fleet spec must set one of ssh_config and nodes",
            ));
        }
        _ => {}
    }
    if let Some(ssh) = &spec.ssh_config {
        if ssh.hosts.is_empty() {
            return Err(FleetError::client("ssh_config must list at least one host"));
        }
        let mut seen = HashSet::new();
        for host in &ssh.hosts {
            if !seen.insert(host.hostname.as_str()) {
                return Err(FleetError::client(format!(
                    "duplicate host {} in ssh_config",
                    host.hostname
                )));
            }
        }
    }
    if let Some(nodes) = &spec.nodes
        && nodes.min > nodes.target
    {
        return Err(FleetError::client("nodes.min cannot exceed nodes.target"));
    }
    Ok(spec.clone())
}

/// Owns fleet rows and their instance membership.
pub struct FleetManager {
    state: StateStore,
    locks: Arc<LockManager>,
    placement: PlacementCoordinator,
}

impl FleetManager {
    pub fn new(state: StateStore, locks: Arc<LockManager>) -> Self {
        let placement = PlacementCoordinator::new(state.clone());
        Self {
            state,
            locks,
            placement,
        }
    }

    /// Compute what applying this spec would do, without persisting.
    pub fn get_plan(&self, project: &str, spec: &FleetSpec) -> FleetResult<FleetPlan> {
        let effective_spec = validate_fleet_spec_and_set_defaults(spec)?;
        let current = match &effective_spec.name {
            Some(name) => self.state.find_fleet_by_name(project, name)?,
            None => None,
        };
        let action = match &current {
            None => FleetPlanAction::Create,
            Some(fleet) if fleet.spec == effective_spec => FleetPlanAction::Noop,
            Some(fleet) if check_can_update_fleet_spec(&fleet.spec, &effective_spec).is_ok() => {
                FleetPlanAction::Update
            }
            Some(_) => FleetPlanAction::Create,
        };
        Ok(FleetPlan {
            effective_spec,
            current,
            action,
        })
    }

    /// Create or in-place update the named fleet.
    pub async fn apply_plan(&self, project: &str, spec: &FleetSpec, now: u64) -> FleetResult<Fleet> {
        let effective = validate_fleet_spec_and_set_defaults(spec)?;
        let _name_lock = self.locks.lock_named(&format!("fleet_names_{project}")).await;

        let current = match &effective.name {
            Some(name) => self.state.find_fleet_by_name(project, name)?,
            None => None,
        };
        match current {
            None => self.create_locked(project, effective, now),
            Some(fleet) if fleet.spec == effective => Ok(fleet),
            Some(fleet) => {
                check_can_update_fleet_spec(&fleet.spec, &effective)?;
                let _fleet_lock = self.locks.lock_row("fleets", &fleet.id).await;
                let Some(fleet) = self.state.get_fleet(project, &fleet.id)? else {
                    return Err(FleetError::client("fleet disappeared during update"));
                };
                self.update_in_place(fleet, effective, now)
            }
        }
    }

    /// Explicitly create a fleet; an existing fleet of the same name is a
    /// client error.
    pub async fn create_fleet(&self, project: &str, spec: &FleetSpec, now: u64) -> FleetResult<Fleet> {
        let effective = validate_fleet_spec_and_set_defaults(spec)?;
        let _name_lock = self.locks.lock_named(&format!("fleet_names_{project}")).await;
        if let Some(name) = &effective.name
            && self.state.find_fleet_by_name(project, name)?.is_some()
        {
            return Err(FleetError::client(format!("fleet {name} already exists")));
        }
        self.create_locked(project, effective, now)
    }

    fn create_locked(&self, project: &str, mut spec: FleetSpec, now: u64) -> FleetResult<Fleet> {
        let name = match spec.name.clone() {
            Some(name) => name,
            None => {
                let mut idx = 1;
                loop {
                    let candidate = format!("fleet-{idx}");
                    if self.state.find_fleet_by_name(project, &candidate)?.is_none() {
                        break candidate;
                    }
                    idx += 1;
                }
            }
        };
        spec.name = Some(name.clone());

        let fleet = Fleet {
            id: new_id(),
            project: project.to_string(),
            name: name.clone(),
            spec_json: serde_json::to_string(&spec).map_err(|e| {
                FleetError::State(nimbus_state::StateError::Serialize(e.to_string()))
            })?,
            spec: spec.clone(),
            status: FleetStatus::Active,
            deleted: false,
            created_at: now,
        };
        self.state.put_fleet(&fleet)?;

        if let Some(ssh) = &spec.ssh_config {
            self.check_hosts_not_assigned(project, &fleet.id, &ssh.hosts)?;
            for (num, host) in ssh.hosts.iter().enumerate() {
                let instance = self.ssh_instance(&fleet, host, num as u32, now);
                self.state.put_instance(&instance)?;
            }
        } else if let Some(nodes) = &spec.nodes {
            for num in 0..nodes.target {
                let instance = self.cloud_instance(&fleet, num, now);
                self.state.put_instance(&instance)?;
            }
        }

        info!(project, fleet = %name, "fleet created");
        Ok(fleet)
    }

    fn update_in_place(&self, mut fleet: Fleet, effective: FleetSpec, now: u64) -> FleetResult<Fleet> {
        let old_hosts = fleet
            .spec
            .ssh_config
            .as_ref()
            .map(|c| c.hosts.clone())
            .unwrap_or_default();
        let new_hosts = effective
            .ssh_config
            .as_ref()
            .map(|c| c.hosts.clone())
            .unwrap_or_default();
        let changes = calculate_ssh_hosts_changes(&old_hosts, &new_hosts);
        self.check_hosts_not_assigned(&fleet.project, &fleet.id, &changes.added)?;

        let instances = self.state.list_instances_for_fleet(&fleet.project, &fleet.id)?;
        let jobs = self.state.list_jobs_all()?;

        // Removals first: a host backing an unfinished job blocks the
        // whole update.
        let mut to_remove = Vec::new();
        for host in &changes.removed {
            let Some(instance) = instances
                .iter()
                .find(|i| i.ssh_hostname() == Some(host.hostname.as_str()))
            else {
                continue;
            };
            let in_use = jobs.iter().any(|j| {
                !j.is_finished() && j.instance_id.as_deref() == Some(&instance.id)
            });
            if in_use {
                return Err(FleetError::client(format!(
                    "host {} is attached to an unfinished job",
                    host.hostname
                )));
            }
            to_remove.push(instance.clone());
        }
        for mut instance in to_remove {
            instance.begin_termination(InstanceTerminationReason::FleetDeleted);
            self.state.put_instance(&instance)?;
            debug!(fleet = %fleet.name, host = %instance.name, "ssh host removed from fleet");
        }

        let mut used: HashSet<u32> = self
            .state
            .list_instances_for_fleet(&fleet.project, &fleet.id)?
            .iter()
            .filter(|i| i.status.is_active())
            .map(|i| i.instance_num)
            .collect();
        for host in &changes.added {
            let num = next_instance_num(&used);
            used.insert(num);
            let instance = self.ssh_instance(&fleet, host, num, now);
            self.state.put_instance(&instance)?;
            debug!(fleet = %fleet.name, host = %host.hostname, instance_num = num, "ssh host added to fleet");
        }

        fleet.spec = effective;
        self.state.put_fleet(&fleet)?;
        info!(fleet = %fleet.name, added = changes.added.len(), removed = changes.removed.len(),
            "fleet updated in place");
        Ok(fleet)
    }

    /// Delete a fleet, or (with `instance_nums`) only some of its
    /// instances.
    ///
    /// Blocked when a targeted instance backs an unfinished job, or when
    /// the removal would leave the fleet empty while an active run still
    /// references it.
    pub async fn delete_fleet(
        &self,
        project: &str,
        name: &str,
        instance_nums: Option<&[u32]>,
        now: u64,
    ) -> FleetResult<()> {
        let Some(found) = self.state.find_fleet_by_name(project, name)? else {
            return Err(FleetError::client(format!("fleet {name} not found")));
        };
        let _fleet_lock = self.locks.lock_row("fleets", &found.id).await;
        let Some(mut fleet) = self.state.get_fleet(project, &found.id)? else {
            return Ok(());
        };

        let instances = self.state.list_instances_for_fleet(project, &fleet.id)?;
        let targeted: Vec<&Instance> = match instance_nums {
            Some(nums) => instances
                .iter()
                .filter(|i| nums.contains(&i.instance_num))
                .collect(),
            None => instances.iter().collect(),
        };

        let jobs = self.state.list_jobs_all()?;
        for instance in &targeted {
            let in_use = jobs.iter().any(|j| {
                !j.is_finished() && j.instance_id.as_deref() == Some(&instance.id)
            });
            if in_use {
                return Err(FleetError::client(format!(
                    "instance {} is attached to an unfinished job",
                    instance.name
                )));
            }
        }

        let runs_backing: Vec<Run> = self
            .state
            .list_runs(project)?
            .into_iter()
            .filter(|r| !r.deleted && !r.is_finished() && r.fleet_id.as_deref() == Some(&fleet.id))
            .collect();
        let would_be_empty = targeted.len() == instances.len();
        if would_be_empty && !fleet.spec.is_ssh() && !runs_backing.is_empty() {
            return Err(FleetError::client(format!(
                "fleet {name} is in use by {} active run(s)",
                runs_backing.len()
            )));
        }

        let ids: Vec<String> = targeted.iter().map(|i| i.id.clone()).collect();
        let _instance_locks = self.locks.lock_rows("instances", &ids).await;
        for instance in targeted {
            let Some(mut instance) = self.state.get_instance(project, &instance.id)? else {
                continue;
            };
            if instance.deleted || instance.status == InstanceStatus::Terminating {
                continue;
            }
            instance.begin_termination(InstanceTerminationReason::FleetDeleted);
            self.state.put_instance(&instance)?;
        }

        if instance_nums.is_none() {
            fleet.status = FleetStatus::Terminating;
            self.state.put_fleet(&fleet)?;
            // The coordinator deletes the groups once their instances are
            // gone.
            self.placement.mark_fleet_groups_deleted(&fleet.id)?;
            info!(project, fleet = %name, "fleet deletion started");
        }
        Ok(())
    }

    /// Finish off TERMINATING fleets whose instances are all gone.
    pub async fn process_fleets(&self) -> FleetResult<()> {
        let fleets = self.state.list_fleets_all()?;
        for fleet in fleets {
            if fleet.deleted || fleet.status != FleetStatus::Terminating {
                continue;
            }
            let _guard = self.locks.lock_row("fleets", &fleet.id).await;
            let Some(mut fleet) = self.state.get_fleet(&fleet.project, &fleet.id)? else {
                continue;
            };
            let remaining = self
                .state
                .list_instances_for_fleet(&fleet.project, &fleet.id)?;
            if remaining.is_empty() {
                fleet.deleted = true;
                self.state.put_fleet(&fleet)?;
                info!(fleet = %fleet.name, "fleet deleted");
            }
        }
        Ok(())
    }

    /// Reject hosts already assigned to another fleet's active remote
    /// instances anywhere in the project.
    fn check_hosts_not_assigned(
        &self,
        project: &str,
        exclude_fleet_id: &str,
        hosts: &[SshHost],
    ) -> FleetResult<()> {
        if hosts.is_empty() {
            return Ok(());
        }
        let requested: HashSet<&str> = hosts.iter().map(|h| h.hostname.as_str()).collect();
        for instance in self.state.list_instances(project)? {
            if instance.deleted
                || !instance.status.is_active()
                || instance.fleet_id.as_deref() == Some(exclude_fleet_id)
            {
                continue;
            }
            if let Some(hostname) = instance.ssh_hostname()
                && requested.contains(hostname)
            {
                return Err(FleetError::client(format!(
                    "host {hostname} is already assigned to another fleet"
                )));
            }
        }
        Ok(())
    }

    // ── Instance construction ──────────────────────────────────────

    fn ssh_instance(&self, fleet: &Fleet, host: &SshHost, num: u32, now: u64) -> Instance {
        let ssh = fleet.spec.ssh_config.as_ref();
        let username = host
            .user
            .clone()
            .or_else(|| ssh.and_then(|c| c.user.clone()))
            .unwrap_or_else(|| "root".to_string());
        let ssh_port = host.port.or_else(|| ssh.and_then(|c| c.port)).unwrap_or(22);
        Instance {
            id: new_id(),
            project: fleet.project.clone(),
            name: format!("{}-{num}", fleet.name),
            fleet_id: Some(fleet.id.clone()),
            instance_num: num,
            // SSH hosts skip backend provisioning and go through the
            // deploy-and-healthcheck path into IDLE.
            status: InstanceStatus::Provisioning,
            backend: Some("remote".to_string()),
            region: Some("on-prem".to_string()),
            price: Some(0.0),
            offer: None,
            requirements: fleet.spec.resources.clone().unwrap_or_default(),
            job_provisioning_data: Some(JobProvisioningData {
                backend: "remote".to_string(),
                region: "on-prem".to_string(),
                instance_type: "ssh".to_string(),
                instance_id: host.hostname.clone(),
                hostname: Some(host.hostname.clone()),
                internal_ip: host.internal_ip.clone(),
                price: 0.0,
                username,
                ssh_port,
                backend_data: None,
            }),
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
            remote: true,
            // User hardware is never destroyed on idleness.
            termination_policy: TerminationPolicy::DontDestroy,
            termination_idle_time_secs: fleet.spec.profile.termination_idle_time_secs,
            started_at: now,
            finished_at: None,
            deleted: false,
        }
    }

    fn cloud_instance(&self, fleet: &Fleet, num: u32, now: u64) -> Instance {
        Instance {
            id: new_id(),
            project: fleet.project.clone(),
            name: format!("{}-{num}", fleet.name),
            fleet_id: Some(fleet.id.clone()),
            instance_num: num,
            status: InstanceStatus::Pending,
            backend: None,
            region: None,
            price: None,
            offer: None,
            requirements: fleet.spec.resources.clone().unwrap_or_default(),
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
            termination_policy: fleet.spec.profile.termination_policy,
            termination_idle_time_secs: fleet.spec.profile.termination_idle_time_secs,
            started_at: now,
            finished_at: None,
            deleted: false,
        }
    }
}
