//! StateStore — redb-backed persistence for the provisioning control plane.
//!
//! Typed CRUD over runs, jobs, fleets, instances, and placement groups.
//! All values are JSON-serialized into redb's `&[u8]` value columns. The
//! store supports both on-disk and in-memory backends (the latter for
//! testing). Reads are plain snapshots — "read committed", nothing more;
//! mutators serialize through the `LockManager`, not the store.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type Table = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(RUNS).map_err(map_err!(Table))?;
        txn.open_table(JOBS).map_err(map_err!(Table))?;
        txn.open_table(FLEETS).map_err(map_err!(Table))?;
        txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        txn.open_table(PLACEMENT_GROUPS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic row plumbing ───────────────────────────────────────

    fn put<T: Serialize>(&self, table: Table, key: &str, row: &T) -> StateResult<()> {
        let value = serde_json::to_vec(row).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            t.insert(key, value.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, table: Table, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        match t.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let row = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(row))
            }
            None => Ok(None),
        }
    }

    /// Scan rows whose key starts with `prefix` (empty prefix = full scan).
    fn scan<T: DeserializeOwned>(&self, table: Table, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in t.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                let row: T =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(row);
            }
        }
        Ok(results)
    }

    fn remove(&self, table: Table, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            existed = t.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Runs ───────────────────────────────────────────────────────

    pub fn put_run(&self, run: &Run) -> StateResult<()> {
        self.put(RUNS, &run.table_key(), run)
    }

    pub fn get_run(&self, project: &str, run_id: &str) -> StateResult<Option<Run>> {
        self.get(RUNS, &run_key(project, run_id))
    }

    /// All runs in a project, deleted included.
    pub fn list_runs(&self, project: &str) -> StateResult<Vec<Run>> {
        self.scan(RUNS, &format!("{project}:"))
    }

    pub fn list_runs_all(&self) -> StateResult<Vec<Run>> {
        self.scan(RUNS, "")
    }

    /// Find the non-deleted run with this name, if any.
    pub fn find_run_by_name(&self, project: &str, run_name: &str) -> StateResult<Option<Run>> {
        Ok(self
            .list_runs(project)?
            .into_iter()
            .find(|r| !r.deleted && r.run_name == run_name))
    }

    /// Physically remove a run row (only valid for soft-deleted runs with
    /// no jobs left referencing them).
    pub fn remove_run(&self, project: &str, run_id: &str) -> StateResult<bool> {
        self.remove(RUNS, &run_key(project, run_id))
    }

    // ── Jobs ───────────────────────────────────────────────────────

    pub fn put_job(&self, job: &Job) -> StateResult<()> {
        self.put(JOBS, &job.table_key(), job)
    }

    pub fn get_job(&self, run_id: &str, job_id: &str) -> StateResult<Option<Job>> {
        self.get(JOBS, &job_key(run_id, job_id))
    }

    /// Jobs of a run ordered by (replica_num, job_num, submission_num).
    pub fn list_jobs_for_run(&self, run_id: &str) -> StateResult<Vec<Job>> {
        let mut jobs: Vec<Job> = self.scan(JOBS, &format!("{run_id}:"))?;
        jobs.sort_by_key(|j| (j.replica_num, j.job_num, j.submission_num));
        Ok(jobs)
    }

    /// Every job row across all runs (reconciliation passes).
    pub fn list_jobs_all(&self) -> StateResult<Vec<Job>> {
        self.scan(JOBS, "")
    }

    /// Remove all job rows of a run. Returns the number removed.
    pub fn remove_jobs_for_run(&self, run_id: &str) -> StateResult<u32> {
        let jobs = self.list_jobs_for_run(run_id)?;
        let mut removed = 0;
        for job in &jobs {
            if self.remove(JOBS, &job.table_key())? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    // ── Fleets ─────────────────────────────────────────────────────

    pub fn put_fleet(&self, fleet: &Fleet) -> StateResult<()> {
        self.put(FLEETS, &fleet.table_key(), fleet)
    }

    pub fn get_fleet(&self, project: &str, fleet_id: &str) -> StateResult<Option<Fleet>> {
        self.get(FLEETS, &fleet_key(project, fleet_id))
    }

    pub fn list_fleets(&self, project: &str) -> StateResult<Vec<Fleet>> {
        self.scan(FLEETS, &format!("{project}:"))
    }

    pub fn list_fleets_all(&self) -> StateResult<Vec<Fleet>> {
        self.scan(FLEETS, "")
    }

    pub fn find_fleet_by_name(&self, project: &str, name: &str) -> StateResult<Option<Fleet>> {
        Ok(self
            .list_fleets(project)?
            .into_iter()
            .find(|f| !f.deleted && f.name == name))
    }

    // ── Instances ──────────────────────────────────────────────────

    pub fn put_instance(&self, instance: &Instance) -> StateResult<()> {
        self.put(INSTANCES, &instance.table_key(), instance)
    }

    pub fn get_instance(&self, project: &str, instance_id: &str) -> StateResult<Option<Instance>> {
        self.get(INSTANCES, &instance_key(project, instance_id))
    }

    pub fn list_instances(&self, project: &str) -> StateResult<Vec<Instance>> {
        self.scan(INSTANCES, &format!("{project}:"))
    }

    /// Every instance across all projects (reconciliation passes).
    pub fn list_instances_all(&self) -> StateResult<Vec<Instance>> {
        self.scan(INSTANCES, "")
    }

    /// Non-deleted instances of a fleet, ordered by instance_num.
    pub fn list_instances_for_fleet(
        &self,
        project: &str,
        fleet_id: &str,
    ) -> StateResult<Vec<Instance>> {
        let mut instances: Vec<Instance> = self
            .list_instances(project)?
            .into_iter()
            .filter(|i| !i.deleted && i.fleet_id.as_deref() == Some(fleet_id))
            .collect();
        instances.sort_by_key(|i| i.instance_num);
        Ok(instances)
    }

    // ── Placement groups ───────────────────────────────────────────

    pub fn put_placement_group(&self, group: &PlacementGroup) -> StateResult<()> {
        self.put(PLACEMENT_GROUPS, &group.table_key(), group)
    }

    pub fn get_placement_group(
        &self,
        fleet_id: &str,
        group_id: &str,
    ) -> StateResult<Option<PlacementGroup>> {
        self.get(PLACEMENT_GROUPS, &placement_group_key(fleet_id, group_id))
    }

    pub fn list_placement_groups_for_fleet(
        &self,
        fleet_id: &str,
    ) -> StateResult<Vec<PlacementGroup>> {
        self.scan(PLACEMENT_GROUPS, &format!("{fleet_id}:"))
    }

    pub fn list_placement_groups_all(&self) -> StateResult<Vec<PlacementGroup>> {
        self.scan(PLACEMENT_GROUPS, "")
    }

    /// Hard-delete a placement group row once its backend resource is gone.
    pub fn remove_placement_group(&self, fleet_id: &str, group_id: &str) -> StateResult<bool> {
        self.remove(PLACEMENT_GROUPS, &placement_group_key(fleet_id, group_id))
    }
}
