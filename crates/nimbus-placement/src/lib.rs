//! nimbus-placement — placement group coordination for clustered fleets.

pub mod coordinator;

pub use coordinator::{EnsureOutcome, PlacementCoordinator, PlacementError, PlacementResult};
