//! Reference-counted wrapper with single teardown.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tracing::{debug, warn};

use crate::error::{QueryError, Result};

/// Boxed error returned by [`Closeable::close`].
pub type CloseError = Box<dyn std::error::Error + Send + Sync>;

/// A shared object that must be torn down exactly once.
pub trait Closeable: Send + Sync {
    /// Release the underlying resources.
    fn close(&self) -> std::result::Result<(), CloseError>;
}

/// A reference-counted wrapper around an expensive shared object.
///
/// Holders call [`retain`](Self::retain) before use and
/// [`release`](Self::release) afterwards. The wrapped value is closed when a
/// release brings the count to zero, and never again after that.
pub struct ManagedResource<T: Closeable> {
    name: String,
    resource: T,
    ref_count: AtomicUsize,
    closed: AtomicBool,
}

impl<T: Closeable> ManagedResource<T> {
    /// Wrap a resource with a reference count of zero.
    pub fn new(name: impl Into<String>, resource: T) -> Self {
        Self::with_count(name, resource, 0)
    }

    /// Wrap a resource that the creator already holds one reference to.
    pub fn owned(name: impl Into<String>, resource: T) -> Self {
        Self::with_count(name, resource, 1)
    }

    fn with_count(name: impl Into<String>, resource: T, count: usize) -> Self {
        Self {
            name: name.into(),
            resource,
            ref_count: AtomicUsize::new(count),
            closed: AtomicBool::new(false),
        }
    }

    /// Get the logical name of this resource.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get a reference to the wrapped resource.
    pub fn get(&self) -> &T {
        &self.resource
    }

    /// Add a reference. Returns the new count.
    pub fn retain(&self) -> usize {
        self.ref_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Add a reference unless the count has already reached zero.
    ///
    /// Returns the new count, or `None` for a resource that a release has
    /// already brought to zero, even if its teardown is still running.
    pub fn try_retain(&self) -> Option<usize> {
        self.ref_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count > 0).then_some(count + 1)
            })
            .ok()
            .map(|previous| previous + 1)
    }

    /// Drop one reference. Returns `true` if this call closed the resource.
    pub fn release(&self) -> Result<bool> {
        self.release_n(1)
    }

    /// Drop `n` references, clamping the count at zero.
    ///
    /// Fails with [`QueryError::AlreadyReleased`] if the count is already zero.
    /// Teardown errors surface as [`QueryError::TeardownFailed`]; the count is
    /// not restored in that case.
    pub fn release_n(&self, n: usize) -> Result<bool> {
        let mut current = self.ref_count.load(Ordering::Acquire);
        let remaining = loop {
            if current == 0 {
                return Err(QueryError::AlreadyReleased {
                    name: self.name.clone(),
                });
            }
            let next = current.saturating_sub(n);
            match self.ref_count.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break next,
                Err(actual) => current = actual,
            }
        };

        if remaining > 0 {
            return Ok(false);
        }
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }

        debug!(resource = %self.name, "closing managed resource");
        self.resource
            .close()
            .map_err(|source| QueryError::TeardownFailed {
                name: self.name.clone(),
                source,
            })?;
        Ok(true)
    }

    /// Current reference count. Advisory only.
    pub fn reference_count(&self) -> usize {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Check if the resource has been torn down.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl<T: Closeable> Deref for ManagedResource<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.resource
    }
}

impl<T: Closeable> fmt::Debug for ManagedResource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedResource")
            .field("name", &self.name)
            .field("ref_count", &self.reference_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A scoped hold on a managed resource.
///
/// Retains on creation and releases when dropped.
pub struct ResourceLease<T: Closeable> {
    resource: Arc<ManagedResource<T>>,
}

impl<T: Closeable> ResourceLease<T> {
    /// Retain `resource` for the lifetime of the lease.
    pub fn new(resource: Arc<ManagedResource<T>>) -> Self {
        resource.retain();
        Self { resource }
    }

    /// Wrap a fresh, unshared resource in a lease of its own.
    pub fn standalone(name: impl Into<String>, resource: T) -> Self {
        Self::adopt(Arc::new(ManagedResource::owned(name, resource)))
    }

    /// Wrap a resource that has already been retained on the caller's behalf.
    pub(crate) fn adopt(resource: Arc<ManagedResource<T>>) -> Self {
        Self { resource }
    }

    /// Get the shared managed resource.
    pub fn managed(&self) -> &Arc<ManagedResource<T>> {
        &self.resource
    }
}

impl<T: Closeable> Clone for ResourceLease<T> {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.resource))
    }
}

impl<T: Closeable> Deref for ResourceLease<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.resource.get()
    }
}

impl<T: Closeable> Drop for ResourceLease<T> {
    fn drop(&mut self) {
        if let Err(e) = self.resource.release() {
            warn!(resource = %self.resource.name(), error = %e, "lease release failed");
        }
    }
}

impl<T: Closeable> fmt::Debug for ResourceLease<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ResourceLease").field(&self.resource).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[derive(Default)]
    struct Counter {
        closes: AtomicUsize,
        fail: bool,
    }

    impl Closeable for Counter {
        fn close(&self) -> std::result::Result<(), CloseError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err("boom".into());
            }
            Ok(())
        }
    }

    #[test]
    fn test_closes_once_at_zero() {
        let res = ManagedResource::new("pool", Counter::default());
        assert_eq!(res.retain(), 1);
        assert_eq!(res.retain(), 2);

        assert!(!res.release().unwrap());
        assert_eq!(res.closes.load(Ordering::SeqCst), 0);

        assert!(res.release().unwrap());
        assert_eq!(res.closes.load(Ordering::SeqCst), 1);
        assert!(res.is_closed());
    }

    #[test]
    fn test_release_past_zero_fails() {
        let res = ManagedResource::owned("executor", Counter::default());
        assert!(res.release().unwrap());

        let err = res.release().unwrap_err();
        assert!(matches!(err, QueryError::AlreadyReleased { .. }));
        assert_eq!(res.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_try_retain_refuses_after_zero() {
        let res = ManagedResource::owned("executor", Counter::default());
        assert_eq!(res.try_retain(), Some(2));
        res.release_n(2).unwrap();

        assert_eq!(res.try_retain(), None);
        assert_eq!(res.reference_count(), 0);
        assert!(matches!(
            res.release(),
            Err(QueryError::AlreadyReleased { .. })
        ));
    }

    #[test]
    fn test_release_n_clamps() {
        let res = ManagedResource::new("pool", Counter::default());
        res.retain();
        res.retain();
        assert!(res.release_n(5).unwrap());
        assert_eq!(res.reference_count(), 0);
        assert_eq!(res.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_teardown_failure_is_wrapped() {
        let res = ManagedResource::owned(
            "broken",
            Counter {
                fail: true,
                ..Default::default()
            },
        );
        let err = res.release().unwrap_err();
        assert!(matches!(err, QueryError::TeardownFailed { .. }));
        assert_eq!(res.reference_count(), 0);
        assert!(res.is_closed());
    }

    #[test]
    fn test_concurrent_retain_release() {
        let res = Arc::new(ManagedResource::owned("shared", Counter::default()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let res = Arc::clone(&res);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        res.retain();
                        res.release().unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(res.reference_count(), 1);
        assert_eq!(res.closes.load(Ordering::SeqCst), 0);
        assert!(res.release().unwrap());
        assert_eq!(res.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_lease_releases_on_drop() {
        let res = Arc::new(ManagedResource::new("leased", Counter::default()));
        {
            let lease = ResourceLease::new(Arc::clone(&res));
            let second = lease.clone();
            assert_eq!(res.reference_count(), 2);
            drop(second);
            assert_eq!(res.reference_count(), 1);
        }
        assert!(res.is_closed());
        assert_eq!(res.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_standalone_lease() {
        let lease = ResourceLease::standalone("solo", Counter::default());
        let managed = Arc::clone(lease.managed());
        assert_eq!(managed.reference_count(), 1);
        drop(lease);
        assert!(managed.is_closed());
    }
}
