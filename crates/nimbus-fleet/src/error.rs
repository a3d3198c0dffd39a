//! Fleet manager error types.

use thiserror::Error;

pub type FleetResult<T> = Result<T, FleetError>;

#[derive(Debug, Error)]
pub enum FleetError {
    /// Invalid request, forbidden in-place update, name collision, or
    /// resource in use — surfaced verbatim to the caller, never retried.
    #[error("{0}")]
    ServerClient(String),

    /// Permission failure (403-equivalent).
    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("state store error: {0}")]
    State(#[from] nimbus_state::StateError),

    #[error("placement error: {0}")]
    Placement(#[from] nimbus_placement::PlacementError),
}

impl FleetError {
    pub fn client(message: impl Into<String>) -> Self {
        Self::ServerClient(message.into())
    }
}
