//! Domain rows persisted by the Nimbus state store.
//!
//! Runs, jobs, fleets, instances, and placement groups, plus their status
//! enums and spec types. Every row is JSON-serialized into redb; spec
//! snapshots are additionally kept as opaque JSON strings for audit/diff.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use nimbus_backend::{
    InstanceOffer, JobProvisioningData, PlacementGroupConfig, PlacementGroupProvisioningData,
    PlacementStrategy, Requirements, SpotPolicy,
};

/// Generate a fresh row id.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ── Run ────────────────────────────────────────────────────────────

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Scheduled run waiting for its next cron fire time.
    Pending,
    Submitted,
    Provisioning,
    Running,
    Terminating,
    Terminated,
    Aborted,
    Stopped,
    Done,
    Failed,
}

impl RunStatus {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            Self::Terminated | Self::Aborted | Self::Stopped | Self::Done | Self::Failed
        )
    }
}

/// Why a run is being (or was) terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTerminationReason {
    AllJobsDone,
    JobFailed,
    RetryLimitExceeded,
    StoppedByUser,
    AbortedByUser,
}

impl RunTerminationReason {
    /// Terminal status the run lands in for this reason.
    pub fn terminal_status(&self) -> RunStatus {
        match self {
            Self::AllJobsDone => RunStatus::Done,
            Self::JobFailed | Self::RetryLimitExceeded => RunStatus::Failed,
            Self::StoppedByUser => RunStatus::Stopped,
            Self::AbortedByUser => RunStatus::Aborted,
        }
    }

    /// Abort skips the graceful stop signal.
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::AbortedByUser)
    }

    /// User-initiated reasons win over cron re-arming.
    pub fn is_user_requested(&self) -> bool {
        matches!(self, Self::StoppedByUser | Self::AbortedByUser)
    }

    pub fn message(&self) -> &'static str {
        match self {
            Self::AllJobsDone => "all jobs finished successfully",
            Self::JobFailed => "a job failed",
            Self::RetryLimitExceeded => "retry limit exceeded",
            Self::StoppedByUser => "stopped by user",
            Self::AbortedByUser => "aborted by user",
        }
    }
}

/// Retryable events a run can opt into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetryEvent {
    NoCapacity,
    Error,
}

/// Automatic resubmission policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub on_events: Vec<RetryEvent>,
    /// Retry budget in seconds, measured from the first submission.
    pub duration_secs: Option<u64>,
}

impl RetryPolicy {
    pub fn retries_no_capacity(&self) -> bool {
        self.on_events.contains(&RetryEvent::NoCapacity)
    }

    pub fn retries_error(&self) -> bool {
        self.on_events.contains(&RetryEvent::Error)
    }
}

/// What to run and how many of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfiguration {
    pub commands: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Replica count of the job group.
    pub replicas: u32,
    /// Nodes per replica; > 1 makes the replica a cluster job group.
    pub nodes: u32,
    pub resources: Requirements,
    #[serde(default)]
    pub volumes: Vec<VolumeMount>,
    /// Cron expressions; non-empty makes the run a scheduled run.
    #[serde(default)]
    pub schedule: Vec<String>,
    pub retry: Option<RetryPolicy>,
}

/// A named volume mounted into a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub name: String,
    pub path: String,
}

/// Placement/price/termination preferences.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub max_price: Option<f64>,
    #[serde(default)]
    pub spot_policy: SpotPolicy,
    /// Restrict to these backends; None means all configured.
    pub backends: Option<Vec<String>>,
    pub regions: Option<Vec<String>>,
    pub reservation: Option<String>,
    /// Pin run instances to a fleet by name.
    pub fleet_name: Option<String>,
    #[serde(default)]
    pub termination_policy: TerminationPolicy,
    #[serde(default = "default_idle_secs")]
    pub termination_idle_time_secs: u64,
}

fn default_idle_secs() -> u64 {
    300
}

/// A declarative run submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSpec {
    /// Unique per project among non-deleted runs; generated when absent.
    pub run_name: Option<String>,
    /// Repo identity — never updatable in place.
    pub repo_id: String,
    pub configuration: RunConfiguration,
    #[serde(default)]
    pub profile: Profile,
}

/// A persisted run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub project: String,
    pub user: String,
    pub run_name: String,
    pub spec: RunSpec,
    /// Immutable snapshot of the spec as submitted.
    pub spec_json: String,
    pub status: RunStatus,
    pub termination_reason: Option<RunTerminationReason>,
    pub status_message: Option<String>,
    /// Incremented on every in-place update.
    pub deployment_num: u32,
    pub priority: u32,
    pub fleet_id: Option<String>,
    pub desired_replica_count: u32,
    /// Next cron fire time for scheduled runs.
    pub next_triggered_at: Option<u64>,
    pub deleted: bool,
    pub submitted_at: u64,
    pub last_processed_at: u64,
}

impl Run {
    pub fn table_key(&self) -> String {
        run_key(&self.project, &self.id)
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_finished()
    }
}

pub fn run_key(project: &str, run_id: &str) -> String {
    format!("{project}:{run_id}")
}

// ── Job ────────────────────────────────────────────────────────────

/// Lifecycle status of a single job submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Submitted,
    Provisioning,
    Running,
    Terminating,
    Terminated,
    Aborted,
    Stopped,
    Done,
    Failed,
}

impl JobStatus {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            Self::Terminated | Self::Aborted | Self::Stopped | Self::Done | Self::Failed
        )
    }
}

/// Why a job finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobTerminationReason {
    DoneByRunner,
    ContainerExitedWithError,
    FailedToStartDueToNoCapacity,
    InterruptedByNoCapacity,
    MasterJobFailed,
    TerminatedByUser,
    StoppedByUser,
    AbortedByUser,
}

impl JobTerminationReason {
    /// Reasons eligible for retry under the `no-capacity` event.
    pub fn is_no_capacity(&self) -> bool {
        matches!(
            self,
            Self::FailedToStartDueToNoCapacity | Self::InterruptedByNoCapacity
        )
    }

    pub fn terminal_status(&self) -> JobStatus {
        match self {
            Self::DoneByRunner => JobStatus::Done,
            Self::ContainerExitedWithError
            | Self::FailedToStartDueToNoCapacity
            | Self::InterruptedByNoCapacity
            | Self::MasterJobFailed => JobStatus::Failed,
            Self::TerminatedByUser => JobStatus::Terminated,
            Self::StoppedByUser => JobStatus::Stopped,
            Self::AbortedByUser => JobStatus::Aborted,
        }
    }
}

/// One submission attempt of a job slot (replica_num, job_num).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub run_id: String,
    pub project: String,
    pub job_num: u32,
    pub replica_num: u32,
    /// Monotonic per job slot, starting at 0.
    pub submission_num: u32,
    pub status: JobStatus,
    pub termination_reason: Option<JobTerminationReason>,
    pub status_message: Option<String>,
    pub spec_json: String,
    /// Set once an instance is attached.
    pub provisioning_data: Option<JobProvisioningData>,
    pub instance_id: Option<String>,
    /// Non-master members of a cluster group wait for the master job.
    pub waiting_master_job: bool,
    pub submitted_at: u64,
    pub finished_at: Option<u64>,
}

impl Job {
    pub fn table_key(&self) -> String {
        job_key(&self.run_id, &self.id)
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_finished()
    }

    /// Slot identity shared by all submissions of this job.
    pub fn slot(&self) -> (u32, u32) {
        (self.replica_num, self.job_num)
    }
}

pub fn job_key(run_id: &str, job_id: &str) -> String {
    format!("{run_id}:{job_id}")
}

// ── Fleet ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FleetStatus {
    Active,
    Terminating,
}

/// What happens to an instance once it has been idle long enough.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationPolicy {
    #[default]
    DestroyAfterIdle,
    DontDestroy,
}

/// Desired cloud node count of a fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetNodeCount {
    pub min: u32,
    pub target: u32,
}

/// One manually-listed SSH host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshHost {
    pub hostname: String,
    pub user: Option<String>,
    pub port: Option<u16>,
    /// Private key material/path. The only field allowed to change on an
    /// existing host during an in-place update.
    pub identity_file: Option<String>,
    pub internal_ip: Option<String>,
}

/// SSH-attached fleet configuration. Mutually exclusive with `nodes`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshConfig {
    pub user: Option<String>,
    pub port: Option<u16>,
    pub identity_file: Option<String>,
    pub hosts: Vec<SshHost>,
}

/// A declarative fleet submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetSpec {
    pub name: Option<String>,
    /// Exactly one of `ssh_config`/`nodes` must be set.
    pub ssh_config: Option<SshConfig>,
    pub nodes: Option<FleetNodeCount>,
    pub placement: Option<PlacementStrategy>,
    pub resources: Option<Requirements>,
    #[serde(default)]
    pub profile: Profile,
}

impl FleetSpec {
    pub fn is_ssh(&self) -> bool {
        self.ssh_config.is_some()
    }

    pub fn is_cluster_placement(&self) -> bool {
        self.placement == Some(PlacementStrategy::Cluster)
    }
}

/// A persisted fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fleet {
    pub id: String,
    pub project: String,
    pub name: String,
    pub spec: FleetSpec,
    pub spec_json: String,
    pub status: FleetStatus,
    pub deleted: bool,
    pub created_at: u64,
}

impl Fleet {
    pub fn table_key(&self) -> String {
        fleet_key(&self.project, &self.id)
    }
}

pub fn fleet_key(project: &str, fleet_id: &str) -> String {
    format!("{project}:{fleet_id}")
}

// ── Instance ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    Provisioning,
    Idle,
    Busy,
    Terminating,
    Terminated,
}

impl InstanceStatus {
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Terminated)
    }

    /// Statuses the health reconciler probes.
    pub fn is_probeable(&self) -> bool {
        matches!(self, Self::Provisioning | Self::Idle | Self::Busy)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceTerminationReason {
    NoOffers,
    MasterFailed,
    IdleTimeout,
    Unreachable,
    ProvisioningTimeout,
    FleetDeleted,
    JobFinished,
    UserRequest,
}

impl InstanceTerminationReason {
    pub fn message(&self) -> &'static str {
        match self {
            Self::NoOffers => "no available offers",
            Self::MasterFailed => "cluster master failed to provision",
            Self::IdleTimeout => "idle timeout exceeded",
            Self::Unreachable => "instance unreachable",
            Self::ProvisioningTimeout => "provisioning deadline exceeded",
            Self::FleetDeleted => "fleet deleted",
            Self::JobFinished => "job finished",
            Self::UserRequest => "terminated by user",
        }
    }
}

/// Health as determined by the instance probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

/// Requested sub-instance block count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlocksSpec {
    /// As many blocks as the offer's resources allow.
    #[default]
    Auto,
    Count(u32),
}

/// A persisted instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub project: String,
    pub name: String,
    /// None for ad-hoc job-only instances.
    pub fleet_id: Option<String>,
    /// Position within the fleet; reused via smallest-free-slot allocation.
    pub instance_num: u32,
    pub status: InstanceStatus,
    pub backend: Option<String>,
    pub region: Option<String>,
    pub price: Option<f64>,
    pub offer: Option<InstanceOffer>,
    pub requirements: Requirements,
    pub job_provisioning_data: Option<JobProvisioningData>,
    pub placement_group_id: Option<String>,
    pub termination_reason: Option<InstanceTerminationReason>,
    pub termination_reason_message: Option<String>,
    /// Hard deadline for termination retries / unreachable countdown.
    pub termination_deadline: Option<u64>,
    pub last_job_processed_at: Option<u64>,
    pub blocks: BlocksSpec,
    pub total_blocks: Option<u32>,
    pub busy_blocks: u32,
    pub unreachable: bool,
    pub health: HealthStatus,
    /// SSH-attached instances skip backend provisioning.
    pub remote: bool,
    pub termination_policy: TerminationPolicy,
    pub termination_idle_time_secs: u64,
    pub started_at: u64,
    pub finished_at: Option<u64>,
    pub deleted: bool,
}

impl Instance {
    pub fn table_key(&self) -> String {
        instance_key(&self.project, &self.id)
    }

    /// Move the instance into TERMINATING with a populated reason message.
    pub fn begin_termination(&mut self, reason: InstanceTerminationReason) {
        self.status = InstanceStatus::Terminating;
        self.termination_reason = Some(reason);
        self.termination_reason_message = Some(reason.message().to_string());
    }

    /// Final transition: the backend resource is confirmed gone (or was
    /// never created).
    pub fn mark_terminated(&mut self, now: u64) {
        self.status = InstanceStatus::Terminated;
        self.deleted = true;
        self.finished_at = Some(now);
        if self.termination_reason_message.is_none() {
            self.termination_reason_message =
                self.termination_reason.map(|r| r.message().to_string());
        }
    }

    /// Hostname of an SSH-attached instance (for collision checks).
    pub fn ssh_hostname(&self) -> Option<&str> {
        if !self.remote {
            return None;
        }
        self.job_provisioning_data
            .as_ref()
            .and_then(|pd| pd.hostname.as_deref())
    }
}

pub fn instance_key(project: &str, instance_id: &str) -> String {
    format!("{project}:{instance_id}")
}

// ── Placement group ────────────────────────────────────────────────

/// A backend-native colocation group owned by a fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacementGroup {
    pub id: String,
    pub fleet_id: String,
    pub name: String,
    pub configuration: PlacementGroupConfig,
    /// Opaque backend handle; None until created backend-side.
    pub provisioning_data: Option<PlacementGroupProvisioningData>,
    pub master_instance_id: Option<String>,
    /// Marked when the fleet scales down/changes shape; cleaned up once no
    /// live instance references the group.
    pub fleet_deleted: bool,
}

impl PlacementGroup {
    pub fn table_key(&self) -> String {
        placement_group_key(&self.fleet_id, &self.id)
    }
}

pub fn placement_group_key(fleet_id: &str, group_id: &str) -> String {
    format!("{fleet_id}:{group_id}")
}
