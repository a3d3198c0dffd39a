//! Run/job reconciliation passes.
//!
//! Three independent passes, each batch-scanning eligible runs and
//! committing row-by-row under sorted locks:
//!
//! - `process_runs`: attaches submitted jobs to instances, mirrors
//!   instance state into job state, applies the retry-on-no-capacity
//!   policy, and rolls job statuses up into the run status.
//! - `process_terminating_runs`: signals running jobs, finalizes them, and
//!   flips the run to its terminal status (or re-arms scheduled runs).
//! - `process_scheduled_runs`: fires PENDING runs whose cron time passed.

use tracing::{debug, info, warn};

use nimbus_state::{
    BlocksSpec, HealthStatus, Instance, InstanceStatus, InstanceTerminationReason, Job,
    JobStatus, JobTerminationReason, Run, RunStatus, RunTerminationReason, TerminationPolicy,
    new_id,
};

use crate::error::RunResult;
use crate::manager::RunManager;
use crate::schedule::next_fire_time;

impl RunManager {
    // ── process_runs ───────────────────────────────────────────────

    /// Advance every in-flight run one step.
    pub async fn process_runs(&self, now: u64) -> RunResult<()> {
        let candidates: Vec<Run> = self
            .state
            .list_runs_all()?
            .into_iter()
            .filter(|r| {
                !r.deleted
                    && matches!(
                        r.status,
                        RunStatus::Submitted | RunStatus::Provisioning | RunStatus::Running
                    )
            })
            .collect();

        for candidate in candidates {
            let _guard = self.locks.lock_row("runs", &candidate.id).await;
            let Some(run) = self.state.get_run(&candidate.project, &candidate.id)? else {
                continue;
            };
            if run.deleted || run.status.is_finished() || run.status == RunStatus::Terminating {
                continue;
            }
            if let Err(e) = self.process_run(run, now).await {
                warn!(run_id = %candidate.id, error = %e, "run pass failed");
            }
        }
        Ok(())
    }

    async fn process_run(&self, mut run: Run, now: u64) -> RunResult<()> {
        let latest = self.latest_jobs(&run)?;
        for job in latest {
            match job.status {
                JobStatus::Submitted => self.try_attach_job(&run, job, now).await?,
                JobStatus::Provisioning => self.sync_provisioning_job(job, now).await?,
                JobStatus::Running => self.sync_running_job(job, now).await?,
                _ => {}
            }
        }

        self.apply_retry_policy(&mut run, now)?;
        if run.status != RunStatus::Terminating {
            self.roll_up_status(&mut run)?;
        }
        run.last_processed_at = now;
        self.state.put_run(&run)?;
        Ok(())
    }

    /// Latest submission of every job slot.
    fn latest_jobs(&self, run: &Run) -> RunResult<Vec<Job>> {
        let mut latest: Vec<Job> = Vec::new();
        // Jobs are ordered by (replica, job_num, submission_num), so the
        // last row per slot wins.
        for job in self.state.list_jobs_for_run(&run.id)? {
            match latest.last_mut() {
                Some(prev) if prev.slot() == job.slot() => *prev = job,
                _ => latest.push(job),
            }
        }
        Ok(latest)
    }

    /// Find or create an instance for a submitted job.
    async fn try_attach_job(&self, run: &Run, mut job: Job, now: u64) -> RunResult<()> {
        // Non-master cluster jobs wait for the master's provisioning data.
        if job.waiting_master_job {
            let master_ready = self
                .latest_jobs(run)?
                .into_iter()
                .find(|j| j.replica_num == job.replica_num && j.job_num == 0)
                .is_some_and(|master| master.provisioning_data.is_some());
            if !master_ready {
                return Ok(());
            }
        }

        if let Some(fleet_id) = &run.fleet_id {
            // Prefer a fleet instance with a free block.
            let candidate = self
                .state
                .list_instances_for_fleet(&run.project, fleet_id)?
                .into_iter()
                .find(|i| {
                    matches!(i.status, InstanceStatus::Idle | InstanceStatus::Busy)
                        && i.busy_blocks < i.total_blocks.unwrap_or(1)
                });
            let Some(found) = candidate else {
                // Fleet has no capacity yet; the job waits.
                return Ok(());
            };
            let _lock = self.locks.lock_row("instances", &found.id).await;
            let Some(mut instance) = self.state.get_instance(&run.project, &found.id)? else {
                return Ok(());
            };
            if instance.deleted || instance.busy_blocks >= instance.total_blocks.unwrap_or(1) {
                return Ok(());
            }
            instance.busy_blocks += 1;
            instance.status = InstanceStatus::Busy;
            instance.last_job_processed_at = Some(now);
            self.state.put_instance(&instance)?;

            job.instance_id = Some(instance.id.clone());
            job.provisioning_data = instance.job_provisioning_data.clone();
            job.status = JobStatus::Provisioning;
            self.state.put_job(&job)?;
            debug!(run = %run.run_name, job_num = job.job_num, instance = %instance.name,
                "job attached to fleet instance");
        } else {
            // Ad-hoc: a dedicated instance owned by this job.
            let instance = self.adhoc_instance(run, &job, now);
            self.state.put_instance(&instance)?;
            job.instance_id = Some(instance.id.clone());
            job.status = JobStatus::Provisioning;
            self.state.put_job(&job)?;
            debug!(run = %run.run_name, job_num = job.job_num, instance = %instance.name,
                "ad-hoc instance requested for job");
        }
        Ok(())
    }

    /// Mirror instance progress into a provisioning job.
    async fn sync_provisioning_job(&self, mut job: Job, now: u64) -> RunResult<()> {
        let Some(instance_id) = job.instance_id.clone() else {
            job.status = JobStatus::Submitted;
            self.state.put_job(&job)?;
            return Ok(());
        };
        let Some(instance) = self.state.get_instance(&job.project, &instance_id)? else {
            job.termination_reason = Some(JobTerminationReason::FailedToStartDueToNoCapacity);
            self.finalize_job(&mut job, now)?;
            return Ok(());
        };

        if job.provisioning_data.is_none() && instance.job_provisioning_data.is_some() {
            job.provisioning_data = instance.job_provisioning_data.clone();
            self.state.put_job(&job)?;
        }

        match instance.status {
            InstanceStatus::Idle | InstanceStatus::Busy => {
                // The instance is deployed and reachable: claim it.
                let _lock = self.locks.lock_row("instances", &instance.id).await;
                if let Some(mut instance) = self.state.get_instance(&job.project, &instance_id)? {
                    if instance.busy_blocks == 0 {
                        instance.busy_blocks = 1;
                    }
                    instance.status = InstanceStatus::Busy;
                    instance.last_job_processed_at = Some(now);
                    self.state.put_instance(&instance)?;
                }
                job.status = JobStatus::Running;
                self.state.put_job(&job)?;
            }
            InstanceStatus::Terminated => {
                job.termination_reason = Some(match instance.termination_reason {
                    Some(InstanceTerminationReason::NoOffers) => {
                        JobTerminationReason::FailedToStartDueToNoCapacity
                    }
                    Some(InstanceTerminationReason::MasterFailed) => {
                        JobTerminationReason::MasterJobFailed
                    }
                    _ => JobTerminationReason::InterruptedByNoCapacity,
                });
                self.finalize_job(&mut job, now)?;
            }
            _ => {}
        }
        Ok(())
    }

    /// A running job dies with its instance.
    async fn sync_running_job(&self, mut job: Job, now: u64) -> RunResult<()> {
        let Some(instance_id) = job.instance_id.clone() else {
            return Ok(());
        };
        let gone = match self.state.get_instance(&job.project, &instance_id)? {
            None => true,
            Some(instance) => matches!(
                instance.status,
                InstanceStatus::Terminating | InstanceStatus::Terminated
            ),
        };
        if gone {
            job.termination_reason = Some(JobTerminationReason::InterruptedByNoCapacity);
            self.finalize_job(&mut job, now)?;
        }
        Ok(())
    }

    /// Resubmit failed jobs whose termination reason matches a configured
    /// retry event, while the retry window allows it.
    fn apply_retry_policy(&self, run: &mut Run, now: u64) -> RunResult<()> {
        let retry = run.spec.configuration.retry.clone();
        let all_jobs = self.state.list_jobs_for_run(&run.id)?;
        let mut retrying = false;

        for job in self.latest_jobs(run)? {
            if !job.is_finished() {
                continue;
            }
            let Some(reason) = job.termination_reason else {
                continue;
            };
            let enabled = match reason {
                r if r.is_no_capacity() => {
                    retry.as_ref().is_some_and(|p| p.retries_no_capacity())
                }
                JobTerminationReason::ContainerExitedWithError => {
                    retry.as_ref().is_some_and(|p| p.retries_error())
                }
                // Secondary failure: the member mirrors its master, whose
                // own reason was gated first, so it follows the group under
                // any configured event.
                JobTerminationReason::MasterJobFailed => retry
                    .as_ref()
                    .is_some_and(|p| p.retries_no_capacity() || p.retries_error()),
                _ => continue,
            };
            if !enabled {
                self.begin_run_termination(run, RunTerminationReason::JobFailed);
                return Ok(());
            }
            // Budget: measured from the slot's first submission.
            let first_submitted = all_jobs
                .iter()
                .filter(|j| j.slot() == job.slot())
                .map(|j| j.submitted_at)
                .min()
                .unwrap_or(job.submitted_at);
            let within_budget = retry
                .as_ref()
                .and_then(|p| p.duration_secs)
                .is_none_or(|budget| now <= first_submitted + budget);
            if !within_budget {
                self.begin_run_termination(run, RunTerminationReason::RetryLimitExceeded);
                return Ok(());
            }

            let resubmission = Job {
                id: new_id(),
                submission_num: job.submission_num + 1,
                status: JobStatus::Submitted,
                termination_reason: None,
                status_message: None,
                provisioning_data: None,
                instance_id: None,
                submitted_at: now,
                finished_at: None,
                ..job.clone()
            };
            self.state.put_job(&resubmission)?;
            retrying = true;
            info!(run = %run.run_name, job_num = job.job_num, ?reason,
                submission_num = resubmission.submission_num, "job resubmitted");
        }
        if retrying {
            run.status_message = Some("retrying".to_string());
        }
        Ok(())
    }

    /// Aggregate the latest job statuses into the run status.
    fn roll_up_status(&self, run: &mut Run) -> RunResult<()> {
        let latest = self.latest_jobs(run)?;
        if latest.is_empty() {
            return Ok(());
        }
        if latest.iter().all(|j| j.is_finished()) {
            if latest.iter().all(|j| j.status == JobStatus::Done) {
                self.begin_run_termination(run, RunTerminationReason::AllJobsDone);
            } else if latest.iter().any(|j| j.status == JobStatus::Failed) {
                self.begin_run_termination(run, RunTerminationReason::JobFailed);
            } else {
                self.begin_run_termination(run, RunTerminationReason::StoppedByUser);
            }
            return Ok(());
        }

        run.status = if latest.iter().any(|j| j.status == JobStatus::Running) {
            // A retry that found capacity clears the "retrying" message.
            run.status_message = None;
            RunStatus::Running
        } else if latest
            .iter()
            .any(|j| j.status == JobStatus::Provisioning || j.provisioning_data.is_some())
        {
            RunStatus::Provisioning
        } else {
            RunStatus::Submitted
        };
        Ok(())
    }

    fn begin_run_termination(&self, run: &mut Run, reason: RunTerminationReason) {
        run.status = RunStatus::Terminating;
        run.termination_reason = Some(reason);
        run.status_message = Some("terminating".to_string());
        debug!(run = %run.run_name, ?reason, "run termination started");
    }

    // ── process_terminating_runs ───────────────────────────────────

    /// Converge TERMINATING runs: signal, finalize, then flip terminal
    /// (or re-arm scheduled runs to PENDING).
    pub async fn process_terminating_runs(&self, now: u64) -> RunResult<()> {
        let candidates: Vec<Run> = self
            .state
            .list_runs_all()?
            .into_iter()
            .filter(|r| !r.deleted && r.status == RunStatus::Terminating)
            .collect();

        for candidate in candidates {
            let _guard = self.locks.lock_row("runs", &candidate.id).await;
            let Some(run) = self.state.get_run(&candidate.project, &candidate.id)? else {
                continue;
            };
            if run.deleted || run.status != RunStatus::Terminating {
                continue;
            }
            if let Err(e) = self.process_terminating_run(run, now).await {
                warn!(run_id = %candidate.id, error = %e, "terminating-run pass failed");
            }
        }
        Ok(())
    }

    async fn process_terminating_run(&self, mut run: Run, now: u64) -> RunResult<()> {
        let reason = run
            .termination_reason
            .unwrap_or(RunTerminationReason::StoppedByUser);

        for mut job in self.state.list_jobs_for_run(&run.id)? {
            if job.is_finished() {
                continue;
            }
            match job.status {
                // Graceful stop signal, unless aborting or the runner
                // already reported done.
                JobStatus::Running if !reason.is_abort() => {
                    job.status = JobStatus::Terminating;
                    job.termination_reason = Some(job_reason_for(reason));
                    job.status_message = Some("stopping".to_string());
                    self.state.put_job(&job)?;
                    debug!(run = %run.run_name, job_num = job.job_num, "stop signal sent");
                }
                JobStatus::Terminating => {
                    self.finalize_job(&mut job, now)?;
                }
                _ => {
                    job.termination_reason = Some(job_reason_for(reason));
                    self.finalize_job(&mut job, now)?;
                }
            }
        }

        let all_finished = self
            .state
            .list_jobs_for_run(&run.id)?
            .iter()
            .all(|j| j.is_finished());
        if !all_finished {
            run.last_processed_at = now;
            self.state.put_run(&run)?;
            return Ok(());
        }

        let scheduled = !run.spec.configuration.schedule.is_empty();
        if scheduled && !reason.is_user_requested() {
            // Re-arm: back to PENDING, fresh fire time, fleet affinity
            // re-selected at the next fire.
            run.status = RunStatus::Pending;
            run.termination_reason = None;
            run.status_message = None;
            run.next_triggered_at = next_fire_time(&run.spec.configuration.schedule, now);
            run.fleet_id = None;
            info!(run = %run.run_name, next_triggered_at = ?run.next_triggered_at, "scheduled run re-armed");
        } else {
            run.status = reason.terminal_status();
            run.status_message = Some(reason.message().to_string());
            info!(run = %run.run_name, status = ?run.status, "run finished");
        }
        run.last_processed_at = now;
        self.state.put_run(&run)?;
        Ok(())
    }

    // ── process_scheduled_runs ─────────────────────────────────────

    /// Fire PENDING runs whose next_triggered_at has passed.
    pub async fn process_scheduled_runs(&self, now: u64) -> RunResult<()> {
        let candidates: Vec<Run> = self
            .state
            .list_runs_all()?
            .into_iter()
            .filter(|r| {
                !r.deleted
                    && r.status == RunStatus::Pending
                    && r.next_triggered_at.is_some_and(|at| at <= now)
            })
            .collect();

        for candidate in candidates {
            let _guard = self.locks.lock_row("runs", &candidate.id).await;
            let Some(mut run) = self.state.get_run(&candidate.project, &candidate.id)? else {
                continue;
            };
            if run.deleted
                || run.status != RunStatus::Pending
                || !run.next_triggered_at.is_some_and(|at| at <= now)
            {
                continue;
            }
            run.status = RunStatus::Submitted;
            run.next_triggered_at = None;
            run.status_message = None;
            run.last_processed_at = now;
            self.state.put_run(&run)?;
            self.create_jobs(&run, now)?;
            info!(run = %run.run_name, "scheduled run fired");
        }
        Ok(())
    }

    // ── Shared job finalization ────────────────────────────────────

    /// Release the job's instance and move the job to its terminal
    /// status.
    pub(crate) fn finalize_job(&self, job: &mut Job, now: u64) -> RunResult<()> {
        if let Some(instance_id) = job.instance_id.clone() {
            self.release_instance(&job.project, &instance_id, now)?;
        }
        let reason = job
            .termination_reason
            .unwrap_or(JobTerminationReason::TerminatedByUser);
        job.termination_reason = Some(reason);
        job.status = reason.terminal_status();
        job.finished_at = Some(now);
        self.state.put_job(job)?;
        Ok(())
    }

    /// Free the block a job held. Fleet instances go back to IDLE (and
    /// their idle clock restarts); ad-hoc instances are released for
    /// termination.
    fn release_instance(&self, project: &str, instance_id: &str, now: u64) -> RunResult<()> {
        let Some(mut instance) = self.state.get_instance(project, instance_id)? else {
            return Ok(());
        };
        if instance.deleted || !instance.status.is_active() {
            return Ok(());
        }
        instance.busy_blocks = instance.busy_blocks.saturating_sub(1);
        instance.last_job_processed_at = Some(now);
        if instance.fleet_id.is_none() {
            if instance.status != InstanceStatus::Terminating {
                instance.begin_termination(InstanceTerminationReason::JobFinished);
            }
        } else if instance.busy_blocks == 0 && instance.status == InstanceStatus::Busy {
            instance.status = InstanceStatus::Idle;
        }
        self.state.put_instance(&instance)?;
        Ok(())
    }

    /// A dedicated single-block instance for one job.
    fn adhoc_instance(&self, run: &Run, job: &Job, now: u64) -> Instance {
        Instance {
            id: new_id(),
            project: run.project.clone(),
            name: format!("{}-{}-{}", run.run_name, job.replica_num, job.job_num),
            fleet_id: None,
            instance_num: 0,
            status: InstanceStatus::Pending,
            backend: None,
            region: None,
            price: None,
            offer: None,
            requirements: run.spec.configuration.resources.clone(),
            job_provisioning_data: None,
            placement_group_id: None,
            termination_reason: None,
            termination_reason_message: None,
            termination_deadline: None,
            last_job_processed_at: None,
            blocks: BlocksSpec::Count(1),
            total_blocks: None,
            busy_blocks: 0,
            unreachable: false,
            health: HealthStatus::Unknown,
            remote: false,
            termination_policy: TerminationPolicy::DestroyAfterIdle,
            termination_idle_time_secs: run.spec.profile.termination_idle_time_secs,
            started_at: now,
            finished_at: None,
            deleted: false,
        }
    }
}

/// Job-level reason corresponding to a run-level termination reason.
fn job_reason_for(reason: RunTerminationReason) -> JobTerminationReason {
    match reason {
        RunTerminationReason::StoppedByUser => JobTerminationReason::StoppedByUser,
        RunTerminationReason::AbortedByUser => JobTerminationReason::AbortedByUser,
        _ => JobTerminationReason::TerminatedByUser,
    }
}
