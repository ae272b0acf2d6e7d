//! Backend provider registry.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::memory::{DeviceMemory, HostMemory};
use crate::types::Backend;
use crate::{OpkError, Result};

/// Maps each backend to the memory provider that serves it.
///
/// A backend with no provider is reported as unavailable when resolved.
pub struct ProviderRegistry {
    providers: BTreeMap<Backend, Arc<dyn DeviceMemory>>,
}

impl ProviderRegistry {
    pub fn empty() -> Self {
        Self {
            providers: BTreeMap::new(),
        }
    }

    /// Registry with the host provider for the CPU backend.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(HostMemory::new()));
        registry
    }

    /// Register `provider` for its backend, replacing any previous one.
    pub fn register(&mut self, provider: Arc<dyn DeviceMemory>) {
        let backend = provider.backend();
        debug!(%backend, "registered memory provider");
        self.providers.insert(backend, provider);
    }

    pub fn resolve(&self, backend: Backend) -> Result<Arc<dyn DeviceMemory>> {
        self.providers
            .get(&backend)
            .cloned()
            .ok_or(OpkError::BackendUnavailable(backend))
    }

    pub fn is_registered(&self, backend: Backend) -> bool {
        self.providers.contains_key(&backend)
    }

    pub fn backends(&self) -> impl Iterator<Item = Backend> + '_ {
        self.providers.keys().copied()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
