//! nimbus-run — the run manager.
//!
//! Owns run/job specs, submission, plan computation (dry-run offer
//! preview), in-place update rules, retry-on-no-capacity policy, and
//! termination/finalization, including cron re-arming for scheduled runs.

pub mod error;
pub mod manager;
pub mod names;
pub mod process;
pub mod schedule;

pub use error::{RunError, RunResult};
pub use manager::{
    JobPlan, RunManager, RunPlan, RunPlanAction, apply_defaults, check_can_update_run_spec,
    run_cost,
};
pub use schedule::next_fire_time;
