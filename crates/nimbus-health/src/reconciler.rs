//! Health reconciler — keeps instance state truthful.
//!
//! One pass probes every provisioning/idle/busy instance (probing happens
//! before the row lock is taken; only the state update holds it):
//!
//! - unreachable instances start a termination-deadline countdown; getting
//!   reachable again clears it
//! - PROVISIONING instances are admitted to IDLE on their first successful
//!   probe
//! - IDLE instances under `DestroyAfterIdle` are terminated once their
//!   idle time exceeds the configured limit; `DontDestroy` never is

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use nimbus_state::{
    Instance, InstanceStatus, InstanceTerminationReason, LockManager, StateStore,
    TerminationPolicy,
};

/// Countdown from first-detected-unreachable to forced termination.
const UNREACHABLE_TIMEOUT_SECS: u64 = 20 * 60;

pub type HealthResult<T> = Result<T, HealthError>;

#[derive(Debug, Error)]
pub enum HealthError {
    #[error("state store error: {0}")]
    State(#[from] nimbus_state::StateError),
}

/// Result of probing one instance's shim/agent.
#[derive(Debug, Clone)]
pub enum ProbeOutcome {
    Reachable {
        shim_version: Option<String>,
        /// Job ids the shim still holds that may no longer be active.
        dangling_job_ids: Vec<String>,
    },
    Unreachable,
}

/// Probes an instance's shim/agent. Real implementations live with the
/// backend drivers; the reconciler only needs the outcome.
#[async_trait]
pub trait InstanceProbe: Send + Sync {
    async fn probe(&self, instance: &Instance) -> ProbeOutcome;
}

/// Periodically health-checks running instances and drives idle-timeout
/// and unreachable-timeout termination.
pub struct HealthReconciler {
    state: StateStore,
    locks: Arc<LockManager>,
    probe: Arc<dyn InstanceProbe>,
}

impl HealthReconciler {
    pub fn new(state: StateStore, locks: Arc<LockManager>, probe: Arc<dyn InstanceProbe>) -> Self {
        Self { state, locks, probe }
    }

    /// One health pass over all probeable instances.
    pub async fn run_pass(&self, now: u64) -> HealthResult<()> {
        let candidates: Vec<Instance> = self
            .state
            .list_instances_all()?
            .into_iter()
            .filter(|i| !i.deleted && i.status.is_probeable())
            .collect();

        for candidate in candidates {
            // Probe without holding the row lock.
            let outcome = self.probe.probe(&candidate).await;

            let _guard = self.locks.lock_row("instances", &candidate.id).await;
            let Some(mut instance) = self.state.get_instance(&candidate.project, &candidate.id)?
            else {
                continue;
            };
            if instance.deleted || !instance.status.is_probeable() {
                continue;
            }

            match outcome {
                ProbeOutcome::Unreachable => self.handle_unreachable(&mut instance, now),
                ProbeOutcome::Reachable {
                    shim_version,
                    dangling_job_ids,
                } => {
                    self.handle_reachable(&mut instance, now, shim_version, &dangling_job_ids)?;
                }
            }
            self.state.put_instance(&instance)?;
        }
        Ok(())
    }

    fn handle_unreachable(&self, instance: &mut Instance, now: u64) {
        if !instance.unreachable {
            warn!(instance = %instance.name, "instance became unreachable");
        }
        instance.unreachable = true;
        instance.health = nimbus_state::HealthStatus::Unhealthy;
        let deadline = *instance
            .termination_deadline
            .get_or_insert(now + UNREACHABLE_TIMEOUT_SECS);

        if now >= deadline {
            let reason = if instance.status == InstanceStatus::Provisioning {
                InstanceTerminationReason::ProvisioningTimeout
            } else {
                InstanceTerminationReason::Unreachable
            };
            warn!(instance = %instance.name, ?reason, "unreachable deadline passed, terminating");
            instance.begin_termination(reason);
            // The terminating pass sets its own retry deadline.
            instance.termination_deadline = None;
        }
    }

    fn handle_reachable(
        &self,
        instance: &mut Instance,
        now: u64,
        shim_version: Option<String>,
        dangling_job_ids: &[String],
    ) -> HealthResult<()> {
        if instance.unreachable {
            info!(instance = %instance.name, "instance reachable again");
        }
        instance.unreachable = false;
        instance.termination_deadline = None;
        instance.health = nimbus_state::HealthStatus::Healthy;

        if instance.status == InstanceStatus::Provisioning {
            instance.status = InstanceStatus::Idle;
            instance.last_job_processed_at = Some(now);
            info!(
                instance = %instance.name,
                shim_version = shim_version.as_deref().unwrap_or("unknown"),
                "instance admitted"
            );
        }

        self.request_dangling_cleanup(instance, dangling_job_ids)?;
        self.check_idle_timeout(instance, now);
        Ok(())
    }

    /// Ask the shim to drop jobs it still holds that are finished or gone.
    fn request_dangling_cleanup(
        &self,
        instance: &Instance,
        dangling_job_ids: &[String],
    ) -> HealthResult<()> {
        if dangling_job_ids.is_empty() {
            return Ok(());
        }
        let jobs = self.state.list_jobs_all()?;
        for job_id in dangling_job_ids {
            let active = jobs.iter().any(|j| {
                &j.id == job_id
                    && !j.is_finished()
                    && j.instance_id.as_deref() == Some(&instance.id)
            });
            if !active {
                debug!(instance = %instance.name, job_id = %job_id, "requesting dangling job cleanup");
            }
        }
        Ok(())
    }

    fn check_idle_timeout(&self, instance: &mut Instance, now: u64) {
        if instance.status != InstanceStatus::Idle || instance.busy_blocks > 0 {
            return;
        }
        if instance.termination_policy == TerminationPolicy::DontDestroy {
            return;
        }
        let idle_since = instance.last_job_processed_at.unwrap_or(instance.started_at);
        if now.saturating_sub(idle_since) > instance.termination_idle_time_secs {
            info!(
                instance = %instance.name,
                idle_secs = now.saturating_sub(idle_since),
                "idle timeout exceeded, terminating"
            );
            instance.begin_termination(InstanceTerminationReason::IdleTimeout);
            instance.termination_deadline = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_backend::Requirements;
    use nimbus_state::*;

    struct FixedProbe {
        reachable: bool,
        dangling: Vec<String>,
    }

    #[async_trait]
    impl InstanceProbe for FixedProbe {
        async fn probe(&self, _instance: &Instance) -> ProbeOutcome {
            if self.reachable {
                ProbeOutcome::Reachable {
                    shim_version: Some("0.4.1".to_string()),
                    dangling_job_ids: self.dangling.clone(),
                }
            } else {
                ProbeOutcome::Unreachable
            }
        }
    }

    fn reconciler(state: &StateStore, reachable: bool) -> HealthReconciler {
        HealthReconciler::new(
            state.clone(),
            Arc::new(LockManager::new()),
            Arc::new(FixedProbe {
                reachable,
                dangling: Vec::new(),
            }),
        )
    }

    fn idle_instance(last_job_at: u64) -> Instance {
        Instance {
            id: new_id(),
            project: "main".to_string(),
            name: "fleet-0".to_string(),
            fleet_id: None,
            instance_num: 0,
            status: InstanceStatus::Idle,
            backend: Some("aws".to_string()),
            region: Some("us-east-1".to_string()),
            price: Some(1.0),
            offer: None,
            requirements: Requirements::default(),
            job_provisioning_data: None,
            placement_group_id: None,
            termination_reason: None,
            termination_reason_message: None,
            termination_deadline: None,
            last_job_processed_at: Some(last_job_at),
            blocks: BlocksSpec::Auto,
            total_blocks: Some(8),
            busy_blocks: 0,
            unreachable: false,
            health: HealthStatus::Healthy,
            remote: false,
            termination_policy: TerminationPolicy::DestroyAfterIdle,
            termination_idle_time_secs: 300,
            started_at: 1000,
            finished_at: None,
            deleted: false,
        }
    }

    #[tokio::test]
    async fn idle_timeout_terminates_instance() {
        let state = StateStore::open_in_memory().unwrap();
        let instance = idle_instance(1000);
        state.put_instance(&instance).unwrap();

        // 301 seconds idle with a 300 second limit.
        reconciler(&state, true).run_pass(1301).await.unwrap();

        let after = state.get_instance("main", &instance.id).unwrap().unwrap();
        assert_eq!(after.status, InstanceStatus::Terminating);
        assert_eq!(after.termination_reason, Some(InstanceTerminationReason::IdleTimeout));
    }

    #[tokio::test]
    async fn idle_within_limit_is_kept() {
        let state = StateStore::open_in_memory().unwrap();
        let instance = idle_instance(1000);
        state.put_instance(&instance).unwrap();

        reconciler(&state, true).run_pass(1200).await.unwrap();

        let after = state.get_instance("main", &instance.id).unwrap().unwrap();
        assert_eq!(after.status, InstanceStatus::Idle);
    }

    #[tokio::test]
    async fn dont_destroy_never_idle_terminates() {
        let state = StateStore::open_in_memory().unwrap();
        let mut instance = idle_instance(1000);
        instance.termination_policy = TerminationPolicy::DontDestroy;
        state.put_instance(&instance).unwrap();

        // Far past any idle limit.
        reconciler(&state, true).run_pass(1_000_000).await.unwrap();

        let after = state.get_instance("main", &instance.id).unwrap().unwrap();
        assert_eq!(after.status, InstanceStatus::Idle);
    }

    #[tokio::test]
    async fn busy_instance_is_not_idle_terminated() {
        let state = StateStore::open_in_memory().unwrap();
        let mut instance = idle_instance(1000);
        instance.status = InstanceStatus::Busy;
        instance.busy_blocks = 2;
        state.put_instance(&instance).unwrap();

        reconciler(&state, true).run_pass(1_000_000).await.unwrap();

        let after = state.get_instance("main", &instance.id).unwrap().unwrap();
        assert_eq!(after.status, InstanceStatus::Busy);
    }

    #[tokio::test]
    async fn unreachable_sets_deadline_then_terminates() {
        let state = StateStore::open_in_memory().unwrap();
        let instance = idle_instance(1000);
        state.put_instance(&instance).unwrap();
        let reconciler = reconciler(&state, false);

        reconciler.run_pass(1000).await.unwrap();
        let mid = state.get_instance("main", &instance.id).unwrap().unwrap();
        assert!(mid.unreachable);
        assert_eq!(mid.termination_deadline, Some(1000 + 1200));
        assert_eq!(mid.status, InstanceStatus::Idle);

        // A later pass keeps the original deadline.
        reconciler.run_pass(1600).await.unwrap();
        let mid = state.get_instance("main", &instance.id).unwrap().unwrap();
        assert_eq!(mid.termination_deadline, Some(2200));

        // Past the deadline the instance is terminated.
        reconciler.run_pass(2200).await.unwrap();
        let after = state.get_instance("main", &instance.id).unwrap().unwrap();
        assert_eq!(after.status, InstanceStatus::Terminating);
        assert_eq!(after.termination_reason, Some(InstanceTerminationReason::Unreachable));
    }

    #[tokio::test]
    async fn regained_reachability_clears_deadline() {
        let state = StateStore::open_in_memory().unwrap();
        let mut instance = idle_instance(1000);
        instance.unreachable = true;
        instance.termination_deadline = Some(2200);
        instance.health = HealthStatus::Unhealthy;
        state.put_instance(&instance).unwrap();

        reconciler(&state, true).run_pass(1100).await.unwrap();

        let after = state.get_instance("main", &instance.id).unwrap().unwrap();
        assert!(!after.unreachable);
        assert_eq!(after.termination_deadline, None);
        assert_eq!(after.health, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn provisioning_instance_admitted_on_first_probe() {
        let state = StateStore::open_in_memory().unwrap();
        let mut instance = idle_instance(1000);
        instance.status = InstanceStatus::Provisioning;
        instance.last_job_processed_at = None;
        state.put_instance(&instance).unwrap();

        reconciler(&state, true).run_pass(1500).await.unwrap();

        let after = state.get_instance("main", &instance.id).unwrap().unwrap();
        assert_eq!(after.status, InstanceStatus::Idle);
        assert_eq!(after.last_job_processed_at, Some(1500));
    }

    #[tokio::test]
    async fn provisioning_timeout_has_its_own_reason() {
        let state = StateStore::open_in_memory().unwrap();
        let mut instance = idle_instance(1000);
        instance.status = InstanceStatus::Provisioning;
        instance.termination_deadline = Some(1500);
        instance.unreachable = true;
        state.put_instance(&instance).unwrap();

        reconciler(&state, false).run_pass(1600).await.unwrap();

        let after = state.get_instance("main", &instance.id).unwrap().unwrap();
        assert_eq!(after.status, InstanceStatus::Terminating);
        assert_eq!(
            after.termination_reason,
            Some(InstanceTerminationReason::ProvisioningTimeout)
        );
    }

    #[tokio::test]
    async fn terminated_instances_are_not_probed() {
        let state = StateStore::open_in_memory().unwrap();
        let mut instance = idle_instance(1000);
        instance.status = InstanceStatus::Terminating;
        state.put_instance(&instance).unwrap();

        reconciler(&state, false).run_pass(1_000_000).await.unwrap();

        let after = state.get_instance("main", &instance.id).unwrap().unwrap();
        // Untouched by the health pass.
        assert_eq!(after.status, InstanceStatus::Terminating);
        assert!(!after.unreachable);
    }
}
