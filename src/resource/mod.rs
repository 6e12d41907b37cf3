//! Lifecycle management for expensive shared objects.
//!
//! This module provides:
//! - [`ManagedResource`], a reference count that closes its payload exactly once
//! - [`ManagedResourceProvider`], lazily built resources keyed by name
//! - [`TaskExecutor`], the shared execution resource with two-phase shutdown
//!
//! # Example
//!
//! ```no_run
//! use gamequery::resource::{ManagedResourceProvider, TaskExecutor};
//! use std::time::Duration;
//!
//! let provider = ManagedResourceProvider::new();
//! let executor = provider
//!     .acquire("default", || TaskExecutor::owned("default", 4, Duration::from_secs(5)))
//!     .unwrap();
//!
//! // ... hand `executor` to pools and messengers ...
//!
//! // The runtime shuts down when the last holder releases it.
//! executor.release().unwrap();
//! ```

mod executor;
mod managed;
mod provider;

pub use executor::{DEFAULT_SHUTDOWN_GRACE, TaskExecutor};
pub use managed::{CloseError, Closeable, ManagedResource, ResourceLease};
pub use provider::ManagedResourceProvider;
