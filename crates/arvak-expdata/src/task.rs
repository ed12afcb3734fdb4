//! Background task handles observable by many waiters.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use futures::future::join_all;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::error::TaskFailure;
use crate::pool::WorkerPool;

/// Normal completion of a job or analysis task.
///
/// `success` is false for jobs that ended cancelled or errored, and for
/// callbacks that were cancelled or failed. Those are outcomes, not failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutcome {
    pub id: String,
    pub success: bool,
}

impl TaskOutcome {
    pub fn new(id: impl Into<String>, success: bool) -> Self {
        Self {
            id: id.into(),
            success,
        }
    }
}

pub type TaskResult = Result<TaskOutcome, TaskFailure>;

/// Handle to a spawned task. Cloning is cheap; every clone sees the same result.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    rx: watch::Receiver<Option<TaskResult>>,
}

impl TaskHandle {
    /// Spawn `task` on `pool`. Panics inside the task become [`TaskFailure::Panicked`].
    pub(crate) fn spawn<F>(pool: &WorkerPool, task: F) -> Self
    where
        F: Future<Output = TaskResult> + Send + 'static,
    {
        let (tx, rx) = watch::channel(None);
        pool.spawn(async move {
            let result = match AssertUnwindSafe(task).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => Err(TaskFailure::Panicked(panic_message(panic.as_ref()))),
            };
            tx.send_replace(Some(result));
        });
        Self { rx }
    }

    /// Already-settled handle.
    pub fn ready(result: TaskResult) -> Self {
        let (_tx, rx) = watch::channel(Some(result));
        Self { rx }
    }

    pub fn is_done(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Result if the task has settled.
    pub fn outcome(&self) -> Option<TaskResult> {
        self.rx.borrow().clone()
    }

    /// Settled without a task failure.
    pub fn settled_ok(&self) -> bool {
        matches!(&*self.rx.borrow(), Some(Ok(_)))
    }

    pub fn failure(&self) -> Option<TaskFailure> {
        match &*self.rx.borrow() {
            Some(Err(failure)) => Some(failure.clone()),
            _ => None,
        }
    }

    /// Wait until the task settles.
    pub async fn wait(&self) -> TaskResult {
        let mut rx = self.rx.clone();
        if let Ok(guard) = rx.wait_for(Option::is_some).await {
            if let Some(result) = &*guard {
                return result.clone();
            }
        }
        // Sender dropped without a value: the runtime dropped the task.
        let current = rx.borrow().clone();
        current.unwrap_or(Err(TaskFailure::Aborted))
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Wait for `handles` and report whether all of them finished successfully.
///
/// Returns false if the timeout elapsed first, or if any task failed or
/// reported an unsuccessful outcome.
pub(crate) async fn wait_for_tasks(
    handles: &[TaskHandle],
    name: &str,
    experiment_id: &str,
    timeout: Option<Duration>,
) -> bool {
    let all = join_all(handles.iter().map(TaskHandle::wait));
    let mut value = match timeout {
        None => {
            all.await;
            true
        }
        Some(limit) => tokio::time::timeout(limit, all).await.is_ok(),
    };
    if !value {
        info!(
            "Waiting for {} timed out before completion [Experiment ID: {}].",
            name, experiment_id
        );
    }

    let mut failures = Vec::new();
    for handle in handles {
        match handle.outcome() {
            Some(Err(failure)) => {
                failures.push(failure.to_string());
                value = false;
            }
            Some(Ok(outcome)) if !outcome.success => {
                debug!(
                    "{} did not succeed [Experiment ID: {}][ID: {}]",
                    name, experiment_id, outcome.id
                );
                value = false;
            }
            _ => {}
        }
    }
    if !failures.is_empty() {
        error!(
            "{} raised exceptions [Experiment ID: {}]:\n{}",
            name,
            experiment_id,
            failures.join("\n")
        );
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_many_waiters_see_same_result() {
        let pool = WorkerPool::current().unwrap();
        let handle = TaskHandle::spawn(&pool, async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(TaskOutcome::new("job-1", true))
        });
        let other = handle.clone();
        let (a, b) = tokio::join!(handle.wait(), other.wait());
        assert_eq!(a, Ok(TaskOutcome::new("job-1", true)));
        assert_eq!(a, b);
        assert!(handle.is_done());
        assert!(handle.settled_ok());
    }

    #[tokio::test]
    async fn test_panic_is_captured() {
        let pool = WorkerPool::current().unwrap();
        let handle = TaskHandle::spawn(&pool, async {
            if true {
                panic!("exploded");
            }
            Ok(TaskOutcome::new("x", true))
        });
        let result = handle.wait().await;
        assert_eq!(result, Err(TaskFailure::Panicked("exploded".into())));
        assert_eq!(handle.failure(), Some(TaskFailure::Panicked("exploded".into())));
    }

    #[tokio::test]
    async fn test_wait_for_tasks_reports_unsuccessful() {
        let ok = TaskHandle::ready(Ok(TaskOutcome::new("a", true)));
        let cancelled = TaskHandle::ready(Ok(TaskOutcome::new("b", false)));
        let failed = TaskHandle::ready(Err(TaskFailure::Error("bad".into())));

        assert!(wait_for_tasks(&[ok.clone()], "jobs", "exp", None).await);
        assert!(!wait_for_tasks(&[ok.clone(), cancelled], "jobs", "exp", None).await);
        assert!(!wait_for_tasks(&[ok, failed], "jobs", "exp", None).await);
        assert!(wait_for_tasks(&[], "jobs", "exp", None).await);
    }

    #[tokio::test]
    async fn test_wait_for_tasks_timeout() {
        let pool = WorkerPool::current().unwrap();
        let slow = TaskHandle::spawn(&pool, async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(TaskOutcome::new("slow", true))
        });
        let timeout = Some(Duration::from_millis(10));
        let done = wait_for_tasks(&[slow.clone()], "jobs", "exp", timeout).await;
        assert!(!done);
        assert!(!slow.is_done());
    }
}
