//! Run manager — submission, planning, and the synchronous request path.
//!
//! Owns run/job rows. Submission validates the spec, serializes name
//! generation through a project-scoped named lock, and creates the initial
//! job group. Plans are dry runs: effective spec + ranked offer preview +
//! the CREATE/UPDATE decision. The background passes live in
//! [`crate::process`].

use std::sync::Arc;

use tracing::{debug, info};

use nimbus_offers::{OfferQuery, OfferSource, RankedOffer};
use nimbus_state::{
    Job, JobStatus, LockManager, Run, RunSpec, RunStatus, RunTerminationReason, StateStore,
    new_id,
};

use crate::error::{RunError, RunResult};
use crate::names::random_base_name;
use crate::schedule::next_fire_time;

/// What applying a run spec would do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPlanAction {
    Create,
    Update,
    /// Spec unchanged; the caller surfaces an explicit confirmation branch.
    Noop,
}

/// Ranked offer preview for one replica group.
#[derive(Debug, Clone)]
pub struct JobPlan {
    pub replica_num: u32,
    /// Ranked offers, capped at the caller's `max_offers`.
    pub offers: Vec<RankedOffer>,
    /// Total offers before capping (for display).
    pub total_offers: usize,
}

/// Dry-run result for a run spec.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub effective_spec: RunSpec,
    pub current: Option<Run>,
    pub action: RunPlanAction,
    pub job_plans: Vec<JobPlan>,
}

/// Apply plugin policies and defaulting to a submitted spec.
///
/// Pure: no persistence, no serialization round-trips.
pub fn apply_defaults(spec: &RunSpec) -> RunSpec {
    let mut spec = spec.clone();
    if spec.configuration.replicas == 0 {
        spec.configuration.replicas = 1;
    }
    if spec.configuration.nodes == 0 {
        spec.configuration.nodes = 1;
    }
    spec
}

/// Verify an in-place run update is permitted: `configuration` and
/// `profile` may change, repo identity never.
pub fn check_can_update_run_spec(old: &RunSpec, new: &RunSpec) -> RunResult<()> {
    if old.repo_id != new.repo_id {
        return Err(RunError::client(
            "cannot update run in place: repo identity changed",
        ));
    }
    if old.run_name != new.run_name {
        return Err(RunError::client(
            "cannot update run in place: run name changed",
        ));
    }
    Ok(())
}

/// Post-hoc run cost: Σ price × wall-clock hours over job submissions with
/// provisioning data, rounded to 4 decimals.
pub fn run_cost(jobs: &[Job], now: u64) -> f64 {
    let total: f64 = jobs
        .iter()
        .filter_map(|job| {
            let data = job.provisioning_data.as_ref()?;
            let end = job.finished_at.unwrap_or(now);
            let hours = end.saturating_sub(job.submitted_at) as f64 / 3600.0;
            Some(data.price * hours)
        })
        .sum();
    (total * 10_000.0).round() / 10_000.0
}

/// Owns run specs, submission, planning, and termination.
pub struct RunManager {
    pub(crate) state: StateStore,
    pub(crate) locks: Arc<LockManager>,
    offers: Arc<OfferSource>,
}

impl RunManager {
    pub fn new(state: StateStore, locks: Arc<LockManager>, offers: Arc<OfferSource>) -> Self {
        Self { state, locks, offers }
    }

    /// Compute an effective spec and ranked-offer preview without
    /// persisting anything.
    pub async fn get_plan(
        &self,
        project: &str,
        spec: &RunSpec,
        max_offers: usize,
        now: u64,
    ) -> RunResult<RunPlan> {
        let effective_spec = apply_defaults(spec);
        let current = match &effective_spec.run_name {
            Some(name) => self.state.find_run_by_name(project, name)?,
            None => None,
        };
        let action = match &current {
            Some(run) if !run.is_finished() => {
                if run.spec == effective_spec {
                    RunPlanAction::Noop
                } else if check_can_update_run_spec(&run.spec, &effective_spec).is_ok() {
                    RunPlanAction::Update
                } else {
                    RunPlanAction::Create
                }
            }
            _ => RunPlanAction::Create,
        };

        let query = OfferQuery {
            project: project.to_string(),
            requirements: effective_spec.configuration.resources.clone(),
            multinode: effective_spec.configuration.nodes > 1,
            backends: effective_spec.profile.backends.clone(),
            regions: effective_spec.profile.regions.clone(),
            ..Default::default()
        };
        let ranked = self.offers.get_offers(&query, now).await;
        let total_offers = ranked.len();
        let mut offers = ranked;
        offers.truncate(max_offers);

        // Replicas share one resource shape, so one job plan per replica
        // group.
        let job_plans = vec![JobPlan {
            replica_num: 0,
            offers,
            total_offers,
        }];

        Ok(RunPlan {
            effective_spec,
            current,
            action,
            job_plans,
        })
    }

    /// Submit a run: validate, lock the project run-name space, resolve
    /// the name, and create the run plus its initial job group.
    pub async fn submit_run(
        &self,
        project: &str,
        user: &str,
        spec: &RunSpec,
        now: u64,
    ) -> RunResult<Run> {
        let spec = apply_defaults(spec);
        validate_run_spec(&spec)?;

        let _name_lock = self.locks.lock_named(&format!("run_names_{project}")).await;

        let run_name = match &spec.run_name {
            None => self.unique_run_name(project, &random_base_name())?,
            Some(name) => {
                if let Some(existing) = self.state.find_run_by_name(project, name)? {
                    if !existing.is_finished() {
                        return Err(RunError::client(format!(
                            "run {name} already exists and is not finished"
                        )));
                    }
                    // Name reuse across non-overlapping runs: drop the old
                    // run's rows synchronously.
                    self.state.remove_jobs_for_run(&existing.id)?;
                    self.state.remove_run(project, &existing.id)?;
                    debug!(project, run = %name, "previous finished run deleted for name reuse");
                }
                name.clone()
            }
        };

        let scheduled_at = if spec.configuration.schedule.is_empty() {
            None
        } else {
            match next_fire_time(&spec.configuration.schedule, now) {
                Some(at) => Some(at),
                None => return Err(RunError::client("invalid schedule: no next fire time")),
            }
        };

        let fleet_id = match &spec.profile.fleet_name {
            Some(fleet_name) => self
                .state
                .find_fleet_by_name(project, fleet_name)?
                .map(|f| f.id),
            None => None,
        };

        let mut run = Run {
            id: new_id(),
            project: project.to_string(),
            user: user.to_string(),
            run_name: run_name.clone(),
            spec_json: serde_json::to_string(&spec)
                .map_err(|e| RunError::State(nimbus_state::StateError::Serialize(e.to_string())))?,
            spec: spec.clone(),
            status: RunStatus::Submitted,
            termination_reason: None,
            status_message: None,
            deployment_num: 0,
            priority: 0,
            fleet_id,
            desired_replica_count: spec.configuration.replicas,
            next_triggered_at: None,
            deleted: false,
            submitted_at: now,
            last_processed_at: now,
        };
        if let Some(at) = scheduled_at {
            // Scheduled runs hold in PENDING until the cron fires.
            run.status = RunStatus::Pending;
            run.next_triggered_at = Some(at);
        }
        self.state.put_run(&run)?;
        if run.status == RunStatus::Submitted {
            self.create_jobs(&run, now)?;
        }
        info!(project, run = %run_name, status = ?run.status, "run submitted");
        Ok(run)
    }

    /// Create or update the named run.
    ///
    /// In-place update bumps `deployment_num`. An incompatible diff
    /// against an unfinished run is a client error unless `force` is set,
    /// in which case the old run is stopped and a new one submitted.
    pub async fn apply_plan(
        &self,
        project: &str,
        user: &str,
        spec: &RunSpec,
        force: bool,
        now: u64,
    ) -> RunResult<Run> {
        let effective = apply_defaults(spec);
        let current = match &effective.run_name {
            Some(name) => self.state.find_run_by_name(project, name)?,
            None => None,
        };
        let Some(current) = current.filter(|r| !r.is_finished()) else {
            return self.submit_run(project, user, &effective, now).await;
        };

        if current.spec == effective {
            // No-op diff; surfaced as its own branch by the caller.
            return Ok(current);
        }
        match check_can_update_run_spec(&current.spec, &effective) {
            Ok(()) => {
                let _lock = self.locks.lock_row("runs", &current.id).await;
                let Some(mut run) = self.state.get_run(project, &current.id)? else {
                    return Err(RunError::client("run disappeared during update"));
                };
                run.spec = effective;
                run.deployment_num += 1;
                run.desired_replica_count = run.spec.configuration.replicas;
                self.state.put_run(&run)?;
                info!(project, run = %run.run_name, deployment_num = run.deployment_num,
                    "run updated in place");
                Ok(run)
            }
            Err(e) if !force => Err(e),
            Err(_) => {
                // Forced replacement: stop the old run synchronously so
                // the name frees up, then submit fresh.
                self.force_stop(&current, now).await?;
                self.submit_run(project, user, &effective, now).await
            }
        }
    }

    /// Request a stop. Asynchronous: marks the run TERMINATING and lets
    /// the reconciliation passes converge; never blocks on full shutdown.
    pub async fn stop_run(
        &self,
        project: &str,
        run_name: &str,
        abort: bool,
        now: u64,
    ) -> RunResult<()> {
        let Some(found) = self.state.find_run_by_name(project, run_name)? else {
            return Err(RunError::client(format!("run {run_name} not found")));
        };
        let _lock = self.locks.lock_row("runs", &found.id).await;
        let Some(mut run) = self.state.get_run(project, &found.id)? else {
            return Ok(());
        };
        if run.is_finished() || run.status == RunStatus::Terminating {
            return Ok(());
        }
        let reason = if abort {
            RunTerminationReason::AbortedByUser
        } else {
            RunTerminationReason::StoppedByUser
        };
        run.status = RunStatus::Terminating;
        run.termination_reason = Some(reason);
        run.status_message = Some("terminating".to_string());
        run.last_processed_at = now;
        self.state.put_run(&run)?;
        info!(project, run = %run_name, abort, "run stop requested");
        Ok(())
    }

    /// Soft-delete a finished run. Rows stay while jobs reference them.
    pub async fn delete_run(&self, project: &str, run_name: &str) -> RunResult<()> {
        let Some(found) = self.state.find_run_by_name(project, run_name)? else {
            return Err(RunError::client(format!("run {run_name} not found")));
        };
        let _lock = self.locks.lock_row("runs", &found.id).await;
        let Some(mut run) = self.state.get_run(project, &found.id)? else {
            return Ok(());
        };
        if !run.is_finished() {
            return Err(RunError::client(format!(
                "run {run_name} is not finished; stop it first"
            )));
        }
        run.deleted = true;
        self.state.put_run(&run)?;
        info!(project, run = %run_name, "run deleted");
        Ok(())
    }

    /// Total cost of a run across all job submissions.
    pub fn cost(&self, run: &Run, now: u64) -> RunResult<f64> {
        let jobs = self.state.list_jobs_for_run(&run.id)?;
        Ok(run_cost(&jobs, now))
    }

    // ── Internal helpers ───────────────────────────────────────────

    /// First free `<base>-<idx>` name, idx starting at 1. Assumes the
    /// project run-name lock is held.
    fn unique_run_name(&self, project: &str, base: &str) -> RunResult<String> {
        let mut idx = 1;
        loop {
            let candidate = format!("{base}-{idx}");
            if self.state.find_run_by_name(project, &candidate)?.is_none() {
                return Ok(candidate);
            }
            idx += 1;
        }
    }

    /// Create the next submission of every job slot of the run.
    pub(crate) fn create_jobs(&self, run: &Run, now: u64) -> RunResult<()> {
        let existing = self.state.list_jobs_for_run(&run.id)?;
        for replica_num in 0..run.spec.configuration.replicas {
            for job_num in 0..run.spec.configuration.nodes {
                let submission_num = existing
                    .iter()
                    .filter(|j| j.slot() == (replica_num, job_num))
                    .map(|j| j.submission_num + 1)
                    .max()
                    .unwrap_or(0);
                let job = Job {
                    id: new_id(),
                    run_id: run.id.clone(),
                    project: run.project.clone(),
                    job_num,
                    replica_num,
                    submission_num,
                    status: JobStatus::Submitted,
                    termination_reason: None,
                    status_message: None,
                    spec_json: run.spec_json.clone(),
                    provisioning_data: None,
                    instance_id: None,
                    // Only the master job of a multi-node group starts
                    // unblocked.
                    waiting_master_job: job_num != 0,
                    submitted_at: now,
                    finished_at: None,
                };
                self.state.put_job(&job)?;
            }
        }
        Ok(())
    }

    /// Synchronous stop used by forced replacement: jobs and run go
    /// terminal immediately.
    async fn force_stop(&self, run: &Run, now: u64) -> RunResult<()> {
        let _lock = self.locks.lock_row("runs", &run.id).await;
        let Some(mut run) = self.state.get_run(&run.project, &run.id)? else {
            return Ok(());
        };
        run.termination_reason = Some(RunTerminationReason::StoppedByUser);
        for mut job in self.state.list_jobs_for_run(&run.id)? {
            if job.is_finished() {
                continue;
            }
            job.termination_reason = Some(nimbus_state::JobTerminationReason::StoppedByUser);
            self.finalize_job(&mut job, now)?;
        }
        run.status = RunStatus::Stopped;
        run.status_message = Some(RunTerminationReason::StoppedByUser.message().to_string());
        self.state.put_run(&run)?;
        info!(run = %run.run_name, "run force-stopped for replacement");
        Ok(())
    }
}

/// Spec-level validation at submission time.
fn validate_run_spec(spec: &RunSpec) -> RunResult<()> {
    if spec.configuration.commands.is_empty() {
        return Err(RunError::client("run configuration has no commands"));
    }
    // Volumes attach to a single machine; a multi-node group cannot
    // share them.
    if !spec.configuration.volumes.is_empty() && spec.configuration.nodes > 1 {
        return Err(RunError::client(
            "volumes cannot be attached to multi-node runs",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_backend::testing::{StubCompute, test_offer};
    use nimbus_backend::{BackendRegistry, JobProvisioningData, Requirements};
    use nimbus_state::{Profile, RunConfiguration, VolumeMount};

    pub(crate) fn setup() -> (RunManager, StateStore) {
        setup_with_offers(vec![])
    }

    pub(crate) fn setup_with_offers(
        offers: Vec<nimbus_backend::InstanceOfferWithAvailability>,
    ) -> (RunManager, StateStore) {
        let state = StateStore::open_in_memory().unwrap();
        let mut registry = BackendRegistry::new();
        registry.register(std::sync::Arc::new(
            StubCompute::new("aws").with_offers(offers),
        ));
        let registry = Arc::new(registry);
        let manager = RunManager::new(
            state.clone(),
            Arc::new(LockManager::new()),
            Arc::new(OfferSource::new(registry)),
        );
        (manager, state)
    }

    pub(crate) fn run_spec(name: Option<&str>) -> RunSpec {
        RunSpec {
            run_name: name.map(str::to_string),
            repo_id: "repo-1".to_string(),
            configuration: RunConfiguration {
                commands: vec!["python train.py".to_string()],
                env: Default::default(),
                replicas: 1,
                nodes: 1,
                resources: Requirements::default(),
                volumes: Vec::new(),
                schedule: Vec::new(),
                retry: None,
            },
            profile: Profile::default(),
        }
    }

    fn provisioning_data(price: f64) -> JobProvisioningData {
        JobProvisioningData {
            backend: "aws".to_string(),
            region: "us-east-1".to_string(),
            instance_type: "m5.large".to_string(),
            instance_id: "i-1".to_string(),
            hostname: None,
            internal_ip: None,
            price,
            username: "ubuntu".to_string(),
            ssh_port: 22,
            backend_data: None,
        }
    }

    #[tokio::test]
    async fn generated_name_ends_with_first_index() {
        let (manager, _) = setup();
        let run = manager
            .submit_run("main", "alice", &run_spec(None), 1000)
            .await
            .unwrap();
        assert!(run.run_name.ends_with("-1"), "got {}", run.run_name);
    }

    #[tokio::test]
    async fn unique_name_increments_past_collisions() {
        let (manager, _) = setup();
        let spec = run_spec(Some("train-1"));
        manager.submit_run("main", "alice", &spec, 1000).await.unwrap();

        assert_eq!(manager.unique_run_name("main", "train").unwrap(), "train-2");
        assert_eq!(manager.unique_run_name("main", "other").unwrap(), "other-1");
    }

    #[tokio::test]
    async fn submit_creates_initial_job_group() {
        let (manager, state) = setup();
        let mut spec = run_spec(Some("cluster"));
        spec.configuration.replicas = 2;
        spec.configuration.nodes = 2;
        let run = manager.submit_run("main", "alice", &spec, 1000).await.unwrap();

        let jobs = state.list_jobs_for_run(&run.id).unwrap();
        assert_eq!(jobs.len(), 4);
        for job in &jobs {
            assert_eq!(job.status, JobStatus::Submitted);
            assert_eq!(job.waiting_master_job, job.job_num != 0);
            assert_eq!(job.submission_num, 0);
        }
        assert_eq!(run.desired_replica_count, 2);
    }

    #[tokio::test]
    async fn submit_against_unfinished_same_name_is_rejected() {
        let (manager, _) = setup();
        let spec = run_spec(Some("train"));
        manager.submit_run("main", "alice", &spec, 1000).await.unwrap();

        let err = manager.submit_run("main", "alice", &spec, 1001).await.unwrap_err();
        assert!(matches!(err, RunError::ServerClient(_)));
        assert!(err.to_string().contains("not finished"));
    }

    #[tokio::test]
    async fn submit_reuses_name_of_finished_run() {
        let (manager, state) = setup();
        let spec = run_spec(Some("train"));
        let old = manager.submit_run("main", "alice", &spec, 1000).await.unwrap();

        let mut finished = state.get_run("main", &old.id).unwrap().unwrap();
        finished.status = RunStatus::Done;
        state.put_run(&finished).unwrap();

        let new = manager.submit_run("main", "alice", &spec, 2000).await.unwrap();
        assert_ne!(new.id, old.id);
        // The old run's rows are gone.
        assert!(state.get_run("main", &old.id).unwrap().is_none());
        assert!(state.list_jobs_for_run(&old.id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn volumes_on_multinode_run_are_rejected() {
        let (manager, _) = setup();
        let mut spec = run_spec(Some("train"));
        spec.configuration.nodes = 2;
        spec.configuration.volumes = vec![VolumeMount {
            name: "data".to_string(),
            path: "/data".to_string(),
        }];

        let err = manager.submit_run("main", "alice", &spec, 1000).await.unwrap_err();
        assert!(err.to_string().contains("volumes"));
    }

    #[tokio::test]
    async fn scheduled_run_holds_in_pending() {
        let (manager, state) = setup();
        let mut spec = run_spec(Some("nightly"));
        spec.configuration.schedule = vec!["0 2 * * *".to_string()];

        let run = manager.submit_run("main", "alice", &spec, 1000).await.unwrap();
        assert_eq!(run.status, RunStatus::Pending);
        assert!(run.next_triggered_at.is_some_and(|at| at > 1000));
        // No jobs until the cron fires.
        assert!(state.list_jobs_for_run(&run.id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn apply_plan_updates_in_place_and_bumps_deployment() {
        let (manager, _) = setup();
        let spec = run_spec(Some("train"));
        let run = manager.apply_plan("main", "alice", &spec, false, 1000).await.unwrap();
        assert_eq!(run.deployment_num, 0);

        let mut updated = spec.clone();
        updated.configuration.commands = vec!["python eval.py".to_string()];
        let run = manager.apply_plan("main", "alice", &updated, false, 2000).await.unwrap();
        assert_eq!(run.deployment_num, 1);
        assert_eq!(run.spec.configuration.commands, vec!["python eval.py"]);
    }

    #[tokio::test]
    async fn apply_plan_noop_returns_current_unchanged() {
        let (manager, _) = setup();
        let spec = run_spec(Some("train"));
        let first = manager.apply_plan("main", "alice", &spec, false, 1000).await.unwrap();
        let second = manager.apply_plan("main", "alice", &spec, false, 2000).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.deployment_num, 0);
    }

    #[tokio::test]
    async fn incompatible_diff_requires_force() {
        let (manager, state) = setup();
        let spec = run_spec(Some("train"));
        let old = manager.apply_plan("main", "alice", &spec, false, 1000).await.unwrap();

        let mut moved = spec.clone();
        moved.repo_id = "repo-2".to_string();

        let err = manager
            .apply_plan("main", "alice", &moved, false, 2000)
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::ServerClient(_)));

        // With force the old run is stopped and replaced.
        let new = manager.apply_plan("main", "alice", &moved, true, 3000).await.unwrap();
        assert_ne!(new.id, old.id);
        assert_eq!(new.spec.repo_id, "repo-2");
    }

    #[tokio::test]
    async fn plan_caps_offers_and_keeps_total() {
        let (manager, _) = setup_with_offers(vec![
            test_offer("aws", "a", 3.0),
            test_offer("aws", "b", 0.5),
            test_offer("aws", "c", 2.0),
        ]);

        let plan = manager
            .get_plan("main", &run_spec(Some("train")), 2, 1000)
            .await
            .unwrap();
        assert_eq!(plan.action, RunPlanAction::Create);
        assert_eq!(plan.job_plans.len(), 1);
        assert_eq!(plan.job_plans[0].total_offers, 3);
        let prices: Vec<f64> = plan.job_plans[0]
            .offers
            .iter()
            .map(|o| o.offer.offer.price)
            .collect();
        assert_eq!(prices, vec![0.5, 2.0]);
    }

    #[tokio::test]
    async fn plan_detects_update_action() {
        let (manager, _) = setup();
        let spec = run_spec(Some("train"));
        manager.submit_run("main", "alice", &spec, 1000).await.unwrap();

        let mut updated = spec.clone();
        updated.configuration.commands = vec!["python eval.py".to_string()];
        let plan = manager.get_plan("main", &updated, 10, 2000).await.unwrap();
        assert_eq!(plan.action, RunPlanAction::Update);

        let mut incompatible = spec.clone();
        incompatible.repo_id = "repo-2".to_string();
        let plan = manager.get_plan("main", &incompatible, 10, 2000).await.unwrap();
        assert_eq!(plan.action, RunPlanAction::Create);

        let plan = manager.get_plan("main", &spec, 10, 2000).await.unwrap();
        assert_eq!(plan.action, RunPlanAction::Noop);
    }

    #[tokio::test]
    async fn stop_and_delete_lifecycle() {
        let (manager, state) = setup();
        let run = manager
            .submit_run("main", "alice", &run_spec(Some("train")), 1000)
            .await
            .unwrap();

        // Unfinished runs cannot be deleted.
        assert!(manager.delete_run("main", "train").await.is_err());

        manager.stop_run("main", "train", false, 2000).await.unwrap();
        let stopped = state.get_run("main", &run.id).unwrap().unwrap();
        assert_eq!(stopped.status, RunStatus::Terminating);
        assert_eq!(
            stopped.termination_reason,
            Some(RunTerminationReason::StoppedByUser)
        );

        // Simulate convergence, then delete.
        let mut finished = stopped;
        finished.status = RunStatus::Stopped;
        state.put_run(&finished).unwrap();
        manager.delete_run("main", "train").await.unwrap();
        assert!(state.find_run_by_name("main", "train").unwrap().is_none());
    }

    #[test]
    fn cost_sums_priced_submissions() {
        let mut job = Job {
            id: new_id(),
            run_id: "r1".to_string(),
            project: "main".to_string(),
            job_num: 0,
            replica_num: 0,
            submission_num: 0,
            status: JobStatus::Done,
            termination_reason: None,
            status_message: None,
            spec_json: "{}".to_string(),
            provisioning_data: Some(provisioning_data(2.5)),
            instance_id: None,
            waiting_master_job: false,
            submitted_at: 0,
            finished_at: Some(7200),
        };
        let mut no_data = job.clone();
        no_data.id = new_id();
        no_data.submission_num = 1;
        no_data.provisioning_data = None;

        // 2.5 $/h × 2 h + nothing for the unprovisioned submission.
        assert_eq!(run_cost(&[job.clone(), no_data], 10_000), 5.0);

        // Unfinished submissions are billed up to `now`.
        job.finished_at = None;
        assert_eq!(run_cost(std::slice::from_ref(&job), 3600), 2.5);

        // Rounded to 4 decimals.
        job.provisioning_data = Some(provisioning_data(0.123_456_7));
        job.finished_at = Some(3600);
        assert_eq!(run_cost(&[job], 10_000), 0.1235);
    }

    #[test]
    fn defaults_fill_replicas_and_nodes() {
        let mut spec = run_spec(None);
        spec.configuration.replicas = 0;
        spec.configuration.nodes = 0;
        let effective = apply_defaults(&spec);
        assert_eq!(effective.configuration.replicas, 1);
        assert_eq!(effective.configuration.nodes, 1);
    }
}
