//! nimbus-state — embedded state store for the Nimbus control plane.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and
//! in-memory state for runs, jobs, fleets, instances, and placement
//! groups, plus the advisory locking subsystem every mutator goes through.
//!
//! # Architecture
//!
//! All rows are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{project}:{id}`, `{run_id}:{job_id}`) enable prefix
//! scans for related records. The `StateStore` is `Clone + Send + Sync`
//! (backed by `Arc<Database>`) and shared across reconciliation passes.
//!
//! Mutators never rely on store-level isolation; they serialize through
//! [`LockManager`] with sorted-id row locks.

pub mod error;
pub mod lock;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use lock::{LockManager, NamedLockGuard, RowLockGuard};
pub use store::StateStore;
pub use types::*;
