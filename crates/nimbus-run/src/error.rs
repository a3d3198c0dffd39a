//! Run manager error types.

use thiserror::Error;

pub type RunResult<T> = Result<T, RunError>;

#[derive(Debug, Error)]
pub enum RunError {
    /// Invalid request, forbidden in-place update, or name collision —
    /// surfaced verbatim to the caller, never retried.
    #[error("{0}")]
    ServerClient(String),

    /// Permission failure (403-equivalent).
    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("state store error: {0}")]
    State(#[from] nimbus_state::StateError),
}

impl RunError {
    pub fn client(message: impl Into<String>) -> Self {
        Self::ServerClient(message.into())
    }
}
