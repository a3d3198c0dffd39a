//! nimbus-fleet — the fleet manager.
//!
//! Owns fleet specs (cloud-provisioned or static SSH-attached), instance
//! membership, and the in-place update/diff rules.

pub mod diff;
pub mod error;
pub mod manager;

pub use diff::{
    SshHostsChanges, calculate_ssh_hosts_changes, check_can_update_fleet_spec, next_instance_num,
};
pub use error::{FleetError, FleetResult};
pub use manager::{FleetManager, FleetPlan, FleetPlanAction, validate_fleet_spec_and_set_defaults};
