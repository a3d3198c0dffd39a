//! nimbus-backend — the compute provider interface.
//!
//! Every cloud/on-prem backend driver implements [`Compute`]; the control
//! plane only ever talks to backends through this crate:
//!
//! - Offer and requirements types for capacity queries
//! - [`Compute`] plus optional capability extensions (multinode, volumes,
//!   gateway, reservations)
//! - The backend error taxonomy ([`BackendError`])
//! - [`BackendRegistry`] — ordered set of configured backends
//! - [`testing::StubCompute`] — a scriptable backend for tests

pub mod compute;
pub mod error;
pub mod registry;
pub mod testing;
pub mod types;

pub use compute::{
    Compute, SupportsGateway, SupportsMultinode, SupportsReservations, SupportsVolumes,
};
pub use error::{BackendError, BackendResult};
pub use registry::BackendRegistry;
pub use types::*;
