//! Worker pool shared by experiment data containers.

use std::future::Future;

use tokio::runtime::Handle;
use tokio_util::task::TaskTracker;

use crate::error::{ExpDataError, ExpDataResult};

/// Runtime handle plus a tracker of every task spawned through it.
///
/// Clones share the tracker, so one pool can be injected into many
/// containers and shut down once.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    handle: Handle,
    tracker: TaskTracker,
}

impl WorkerPool {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            tracker: TaskTracker::new(),
        }
    }

    /// Pool on the runtime the caller is running in.
    pub fn current() -> ExpDataResult<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| ExpDataError::Runtime(e.to_string()))
    }

    pub(crate) fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.tracker.is_closed() {
            tracing::debug!("Spawning onto a worker pool that is shutting down");
        }
        self.tracker.spawn_on(task, &self.handle);
    }

    /// Number of tasks still running.
    pub fn active_tasks(&self) -> usize {
        self.tracker.len()
    }

    /// Stop accepting new work and wait for running tasks to finish.
    pub async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        tracing::debug!("Worker pool shut down");
    }
}
