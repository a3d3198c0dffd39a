//! Ordered registry of configured backends.
//!
//! Enumeration order is load-bearing: offer ranking breaks price ties by
//! backend registration order, so iteration must be stable.

use std::sync::Arc;

use crate::compute::Compute;

/// The set of backends available to the control plane, in configuration
/// order.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: Vec<Arc<dyn Compute>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a backend. Order of registration is preserved.
    pub fn register(&mut self, backend: Arc<dyn Compute>) {
        self.backends.push(backend);
    }

    /// Look a backend up by its kind.
    pub fn get(&self, kind: &str) -> Option<Arc<dyn Compute>> {
        self.backends.iter().find(|b| b.kind() == kind).cloned()
    }

    /// Iterate backends in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Compute>> {
        self.backends.iter()
    }

    pub fn kinds(&self) -> Vec<String> {
        self.backends.iter().map(|b| b.kind().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}
