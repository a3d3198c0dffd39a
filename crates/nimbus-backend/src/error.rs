//! Backend error taxonomy.
//!
//! Errors are split by how the provisioner reacts to them: capacity-shaped
//! errors advance to the next ranked offer, transient errors are retried
//! with a deadline, placement-group errors are handled locally by the
//! placement coordinator.

use thiserror::Error;

/// Result type alias for backend driver operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// Errors raised by compute backend drivers.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend has no capacity for the requested offer.
    #[error("no capacity: {0}")]
    NoCapacity(String),

    /// Instance creation failed for a reason other than capacity.
    #[error("provisioning failed: {0}")]
    Provisioning(String),

    /// The backend cannot create the requested placement group.
    #[error("placement group not supported: {0}")]
    PlacementGroupNotSupported(String),

    /// The placement group still has members and cannot be deleted yet.
    #[error("placement group in use: {0}")]
    PlacementGroupInUse(String),

    /// Termination was requested but the resource is still shutting down.
    #[error("instance not yet terminated: {0}")]
    NotYetTerminated(String),

    /// Transient backend/API failure; safe to retry.
    #[error("backend error: {0}")]
    Transient(String),

    /// Anything the driver did not classify.
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl BackendError {
    /// True for errors that mean "this offer won't work, try the next one".
    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::NoCapacity(_) | Self::Provisioning(_))
    }

    /// True for errors worth retrying against the same resource.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transient(_) | Self::NotYetTerminated(_) | Self::Unexpected(_)
        )
    }
}
