//! redb table definitions for the Nimbus state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized rows).
//! Composite keys follow `{parent}:{child}` so related rows share a prefix.

use redb::TableDefinition;

/// Runs keyed by `{project}:{run_id}`.
pub const RUNS: TableDefinition<&str, &[u8]> = TableDefinition::new("runs");

/// Job submissions keyed by `{run_id}:{job_id}`.
pub const JOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("jobs");

/// Fleets keyed by `{project}:{fleet_id}`.
pub const FLEETS: TableDefinition<&str, &[u8]> = TableDefinition::new("fleets");

/// Instances keyed by `{project}:{instance_id}`.
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");

/// Placement groups keyed by `{fleet_id}:{group_id}`.
pub const PLACEMENT_GROUPS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("placement_groups");
