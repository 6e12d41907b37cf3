//! Lazily constructed, name-keyed shared resources.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::Result;

use super::managed::{Closeable, ManagedResource, ResourceLease};

/// Maps logical names to one shared [`ManagedResource`] each.
///
/// The first caller for a name builds the resource; every later caller gets
/// the same instance. Every acquisition retains before returning. Once a
/// resource has been closed, the next acquisition builds a fresh one.
pub struct ManagedResourceProvider<T: Closeable> {
    resources: Mutex<HashMap<String, Arc<ManagedResource<T>>>>,
}

impl<T: Closeable> ManagedResourceProvider<T> {
    /// Create an empty provider.
    pub fn new() -> Self {
        Self {
            resources: Mutex::new(HashMap::new()),
        }
    }

    /// Get the resource for `name`, building it with `factory` if needed.
    ///
    /// The returned resource has already been retained for the caller.
    pub fn acquire<F>(&self, name: &str, factory: F) -> Result<Arc<ManagedResource<T>>>
    where
        F: FnOnce() -> Result<T>,
    {
        let mut resources = self.resources.lock();

        if let Some(existing) = resources.get(name) {
            if existing.try_retain().is_some() {
                return Ok(Arc::clone(existing));
            }
        }

        debug!(resource = name, "creating shared resource");
        let created = Arc::new(ManagedResource::new(name, factory()?));
        created.retain();
        resources.insert(name.to_string(), Arc::clone(&created));
        Ok(created)
    }

    /// Like [`acquire`](Self::acquire), wrapped in a lease that releases on drop.
    pub fn lease<F>(&self, name: &str, factory: F) -> Result<ResourceLease<T>>
    where
        F: FnOnce() -> Result<T>,
    {
        self.acquire(name, factory).map(ResourceLease::adopt)
    }

    /// Check if a live resource is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.resources
            .lock()
            .get(name)
            .is_some_and(|r| !r.is_closed())
    }

    /// Names of all live resources.
    pub fn names(&self) -> Vec<String> {
        self.resources
            .lock()
            .iter()
            .filter(|(_, r)| !r.is_closed())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Drop bookkeeping for resources that have been closed.
    ///
    /// Returns the number of entries removed.
    pub fn purge_closed(&self) -> usize {
        let mut resources = self.resources.lock();
        let before = resources.len();
        resources.retain(|_, r| !r.is_closed());
        before - resources.len()
    }
}

impl<T: Closeable> Default for ManagedResourceProvider<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Closeable> fmt::Debug for ManagedResourceProvider<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedResourceProvider")
            .field("names", &self.names())
            .finish()
    }
}
