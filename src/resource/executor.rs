//! Shared task executor with two-phase shutdown.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::Notify;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, warn};

use crate::error::{QueryError, Result};

use super::managed::{CloseError, Closeable};

/// Default grace period for in-flight work during shutdown.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Default)]
struct TaskSet {
    next_id: u64,
    running: HashMap<u64, AbortHandle>,
}

struct ExecutorShared {
    name: String,
    handle: Handle,
    runtime: Mutex<Option<Runtime>>,
    accepting: AtomicBool,
    tasks: Mutex<TaskSet>,
    drained: Condvar,
    drained_async: Notify,
    grace: Duration,
}

impl ExecutorShared {
    fn stop_accepting(&self) -> bool {
        self.accepting.swap(false, Ordering::AcqRel)
    }

    fn abort_remaining(&self) -> usize {
        let remaining: Vec<AbortHandle> = {
            let mut tasks = self.tasks.lock();
            tasks.running.drain().map(|(_, h)| h).collect()
        };
        let aborted = remaining.iter().filter(|h| !h.is_finished()).count();
        for handle in remaining {
            handle.abort();
        }
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
        }
        aborted
    }

    fn shutdown_blocking(&self) -> usize {
        self.stop_accepting();
        let deadline = Instant::now() + self.grace;
        {
            let mut tasks = self.tasks.lock();
            loop {
                tasks.running.retain(|_, h| !h.is_finished());
                if tasks.running.is_empty() {
                    break;
                }
                if self.drained.wait_until(&mut tasks, deadline).timed_out() {
                    break;
                }
            }
        }
        self.finish_shutdown()
    }

    fn finish_shutdown(&self) -> usize {
        let aborted = self.abort_remaining();
        if aborted > 0 {
            warn!(executor = %self.name, aborted, "force-cancelled tasks after grace period");
        } else {
            debug!(executor = %self.name, "executor shut down cleanly");
        }
        aborted
    }
}

/// Removes a finished task from the in-flight set.
struct TaskGuard {
    shared: Arc<ExecutorShared>,
    id: u64,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        let empty = {
            let mut tasks = self.shared.tasks.lock();
            tasks.running.remove(&self.id);
            tasks.running.is_empty()
        };
        if empty {
            self.shared.drained.notify_all();
            self.shared.drained_async.notify_waiters();
        }
    }
}

/// The execution resource shared by pools and messengers.
///
/// Either owns a multi-thread runtime or spawns onto an existing runtime
/// handle. Shutdown stops accepting work, waits up to the grace period for
/// in-flight tasks, then aborts whatever is left.
#[derive(Clone)]
pub struct TaskExecutor {
    shared: Arc<ExecutorShared>,
}

impl TaskExecutor {
    /// Create an executor that owns a dedicated multi-thread runtime.
    pub fn owned(name: impl Into<String>, worker_threads: usize, grace: Duration) -> Result<Self> {
        let name = name.into();
        let runtime = Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .thread_name(name.clone())
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        Ok(Self::build(name, handle, Some(runtime), grace))
    }

    /// Create an executor that spawns onto the current tokio runtime.
    pub fn current(name: impl Into<String>, grace: Duration) -> Result<Self> {
        let handle = Handle::try_current().map_err(|_| QueryError::Rejected)?;
        Ok(Self::from_handle(name, handle, grace))
    }

    /// Create an executor that spawns onto the given runtime handle.
    pub fn from_handle(name: impl Into<String>, handle: Handle, grace: Duration) -> Self {
        Self::build(name.into(), handle, None, grace)
    }

    fn build(name: String, handle: Handle, runtime: Option<Runtime>, grace: Duration) -> Self {
        Self {
            shared: Arc::new(ExecutorShared {
                name,
                handle,
                runtime: Mutex::new(runtime),
                accepting: AtomicBool::new(true),
                tasks: Mutex::new(TaskSet::default()),
                drained: Condvar::new(),
                drained_async: Notify::new(),
                grace,
            }),
        }
    }

    /// Get the executor name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Get the runtime handle tasks are spawned onto.
    pub fn handle(&self) -> &Handle {
        &self.shared.handle
    }

    /// Check if the executor still accepts new work.
    pub fn is_accepting(&self) -> bool {
        self.shared.accepting.load(Ordering::Acquire)
    }

    /// Number of tasks currently tracked as in flight.
    pub fn in_flight(&self) -> usize {
        let mut tasks = self.shared.tasks.lock();
        tasks.running.retain(|_, h| !h.is_finished());
        tasks.running.len()
    }

    /// Spawn a task, or fail with [`QueryError::Rejected`] after shutdown.
    pub fn spawn<F>(&self, future: F) -> Result<JoinHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if !self.is_accepting() {
            return Err(QueryError::Rejected);
        }

        let id = {
            let mut tasks = self.shared.tasks.lock();
            let id = tasks.next_id;
            tasks.next_id += 1;
            id
        };

        // Spawned without the lock held: a runtime that is already gone drops
        // the future inline, and its destructors may spawn again.
        let shared = Arc::clone(&self.shared);
        let join = self.shared.handle.spawn(async move {
            let _guard = TaskGuard { shared, id };
            future.await
        });

        // A task that already finished is swept by the next retain.
        if !join.is_finished() {
            self.shared
                .tasks
                .lock()
                .running
                .insert(id, join.abort_handle());
        }
        Ok(join)
    }

    /// Two-phase shutdown from async code.
    ///
    /// Returns the number of tasks that had to be aborted.
    pub async fn shutdown(&self) -> usize {
        let shared = &self.shared;
        shared.stop_accepting();
        let deadline = tokio::time::Instant::now() + shared.grace;

        loop {
            let notified = shared.drained_async.notified();
            {
                let mut tasks = shared.tasks.lock();
                tasks.running.retain(|_, h| !h.is_finished());
                if tasks.running.is_empty() {
                    break;
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }
        shared.finish_shutdown()
    }

    /// Two-phase shutdown that blocks the calling thread.
    ///
    /// Must not be called from a task running on this executor's runtime.
    pub fn shutdown_blocking(&self) -> usize {
        self.shared.shutdown_blocking()
    }
}

impl Closeable for TaskExecutor {
    fn close(&self) -> std::result::Result<(), CloseError> {
        if Handle::try_current().is_ok() {
            // Blocking here would stall the runtime driving the in-flight tasks.
            let shared = Arc::clone(&self.shared);
            std::thread::Builder::new()
                .name(format!("{}-shutdown", shared.name))
                .spawn(move || {
                    shared.shutdown_blocking();
                })?;
        } else {
            self.shared.shutdown_blocking();
        }
        Ok(())
    }
}

impl Drop for ExecutorShared {
    fn drop(&mut self) {
        self.accepting.store(false, Ordering::Release);
        if let Some(runtime) = self.runtime.get_mut().take() {
            runtime.shutdown_background();
        }
    }
}

impl fmt::Debug for TaskExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskExecutor")
            .field("name", &self.shared.name)
            .field("accepting", &self.is_accepting())
            .field("grace", &self.shared.grace)
            .finish()
    }
}
