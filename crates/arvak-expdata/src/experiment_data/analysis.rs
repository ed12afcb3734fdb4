//! Analysis callback queue, cancellation and blocking.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::ExperimentData;
use crate::callback::{AnalysisCallback, AnalysisStatus, CallbackKwargs};
use crate::error::TaskFailure;
use crate::status::ExperimentStatus;
use crate::task::{TaskHandle, TaskOutcome, TaskResult, panic_message, wait_for_tasks};

impl ExperimentData {
    /// Queue an analysis callback and return its id.
    ///
    /// The callback runs after every job and analysis task registered before
    /// this call has finished. It is cancelled instead if any of them failed or
    /// did not succeed. Callbacks run one at a time, in submission order.
    pub fn add_analysis_callback<F, Fut>(
        &self,
        name: impl Into<String>,
        callback: F,
        kwargs: CallbackKwargs,
    ) -> String
    where
        F: FnOnce(ExperimentData, CallbackKwargs) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let job_futures = self.inner.job_futures.lock();
        let mut analysis_futures = self.inner.analysis_futures.lock();
        let mut callbacks = self.inner.analysis_callbacks.lock();

        let gating: Vec<TaskHandle> = job_futures
            .values()
            .chain(analysis_futures.values())
            .cloned()
            .collect();

        let descriptor = AnalysisCallback::new(name);
        let callback_id = descriptor.callback_id.clone();
        let token = descriptor.cancel.clone();
        callbacks.insert(callback_id.clone(), descriptor);

        let this = self.clone();
        let id = callback_id.clone();
        let handle = TaskHandle::spawn(&self.inner.pool, async move {
            this.run_analysis_callback(id, callback, kwargs, gating, token)
                .await
        });
        analysis_futures.insert(callback_id.clone(), handle);
        callback_id
    }

    async fn run_analysis_callback<F, Fut>(
        self,
        callback_id: String,
        callback: F,
        kwargs: CallbackKwargs,
        gating: Vec<TaskHandle>,
        token: CancellationToken,
    ) -> TaskResult
    where
        F: FnOnce(ExperimentData, CallbackKwargs) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let gated = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            ok = wait_for_tasks(&gating, "jobs and analysis", self.experiment_id(), None) => {
                Some(ok)
            }
        };
        match gated {
            None => return Ok(self.finish_cancelled(&callback_id)),
            Some(false) => {
                warn!(
                    "Analysis callback cancelled due to failed or cancelled jobs or analysis [Experiment ID: {}][Analysis Callback ID: {}]",
                    self.experiment_id(),
                    callback_id
                );
                return Ok(self.finish_cancelled(&callback_id));
            }
            Some(true) => {}
        }

        // Taken after gating so a permit holder never waits on a queued predecessor.
        let slots = Arc::clone(&self.inner.analysis_slots);
        let _permit = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(self.finish_cancelled(&callback_id)),
            permit = slots.acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return Err(TaskFailure::Aborted),
            },
        };

        // A cancel that reported success must never race this transition.
        {
            let mut callbacks = self.inner.analysis_callbacks.lock();
            let Some(descriptor) = callbacks.get_mut(&callback_id) else {
                return Err(TaskFailure::Error(format!(
                    "analysis callback {callback_id} is not registered"
                )));
            };
            if descriptor.cancel.is_cancelled() {
                descriptor.status = AnalysisStatus::Cancelled;
                return Ok(TaskOutcome::new(callback_id, false));
            }
            descriptor.status = AnalysisStatus::Running;
        }
        debug!(
            "Running analysis callback [Experiment ID: {}][Analysis Callback ID: {}]",
            self.experiment_id(),
            callback_id
        );

        let this = self.clone();
        let outcome = AssertUnwindSafe(async move { callback(this, kwargs).await })
            .catch_unwind()
            .await;
        let error = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(format!("{err:?}")),
            Err(panic) => Some(format!("panicked: {}", panic_message(panic.as_ref()))),
        };

        let success = error.is_none();
        let error_msg = error.map(|err| {
            format!(
                "Analysis callback failed [Experiment ID: {}][Analysis Callback ID: {}]:\n{}",
                self.experiment_id(),
                callback_id,
                err
            )
        });
        if let Some(msg) = &error_msg {
            warn!("{msg}");
        }
        if let Some(descriptor) = self.inner.analysis_callbacks.lock().get_mut(&callback_id) {
            descriptor.status = if success {
                AnalysisStatus::Done
            } else {
                AnalysisStatus::Error
            };
            descriptor.error_msg = error_msg;
        }
        Ok(TaskOutcome::new(callback_id, success))
    }

    fn finish_cancelled(&self, callback_id: &str) -> TaskOutcome {
        if let Some(descriptor) = self
            .inner
            .analysis_callbacks
            .lock()
            .get_mut(&callback_id.to_string())
        {
            descriptor.status = AnalysisStatus::Cancelled;
        }
        info!(
            "Cancelled analysis callback [Experiment ID: {}][Analysis Callback ID: {}]",
            self.experiment_id(),
            callback_id
        );
        TaskOutcome::new(callback_id, false)
    }

    pub(crate) fn analysis_pending(&self) -> bool {
        self.inner
            .analysis_futures
            .lock()
            .values()
            .any(|handle| !handle.is_done())
    }

    /// Descriptors of all submitted callbacks, in submission order.
    pub fn analysis_callbacks(&self) -> Vec<AnalysisCallback> {
        self.inner.analysis_callbacks.values()
    }

    pub fn analysis_callback(&self, callback_id: &str) -> Option<AnalysisCallback> {
        self.inner.analysis_callbacks.get(&callback_id.to_string())
    }

    /// Cancel queued callbacks.
    ///
    /// A running callback cannot be stopped; that makes the return value false.
    pub async fn cancel_analysis(&self, ids: Option<&[String]>) -> bool {
        let (all_cancelled, settling) = self.signal_cancel(ids);
        if settling.is_empty() {
            return all_cancelled;
        }

        let waits = join_all(settling.iter().map(|(_, handle)| handle.wait()));
        if tokio::time::timeout(self.inner.config.cancel_settle_timeout(), waits)
            .await
            .is_err()
        {
            debug!(
                "Cancelled analysis callbacks did not settle in time [Experiment ID: {}]",
                self.experiment_id()
            );
        }

        let mut futures = self.inner.analysis_futures.lock();
        for (callback_id, handle) in &settling {
            if handle.settled_ok() {
                futures.remove(callback_id);
            }
        }
        all_cancelled
    }

    fn signal_cancel(&self, ids: Option<&[String]>) -> (bool, Vec<(String, TaskHandle)>) {
        let mut all_cancelled = true;
        let mut settling = Vec::new();

        let futures = self.inner.analysis_futures.lock();
        let callbacks = self.inner.analysis_callbacks.lock();
        for (callback_id, descriptor) in callbacks.iter().rev() {
            if ids.is_some_and(|ids| !ids.contains(callback_id)) {
                continue;
            }
            match descriptor.status {
                AnalysisStatus::Running => {
                    warn!(
                        "Unable to cancel running analysis callback [Experiment ID: {}][Analysis Callback ID: {}]",
                        self.experiment_id(),
                        callback_id
                    );
                    all_cancelled = false;
                }
                AnalysisStatus::Queued => {
                    descriptor.cancel.cancel();
                    if let Some(handle) = futures.get(callback_id) {
                        settling.push((callback_id.clone(), handle.clone()));
                    }
                }
                _ => {}
            }
        }
        (all_cancelled, settling)
    }

    /// Cancel analysis, then jobs. True only if both fully succeeded.
    pub async fn cancel(&self) -> bool {
        let analysis = self.cancel_analysis(None).await;
        let jobs = self.cancel_jobs(None).await;
        analysis && jobs
    }

    /// Wait for every job and analysis task, including tasks spawned while
    /// waiting, then for every child.
    pub fn block_for_results(&self, timeout: Option<Duration>) -> BoxFuture<'_, &Self> {
        async move {
            let start = Instant::now();
            let (job_handles, analysis_handles) = {
                let jobs = self.inner.job_futures.lock();
                let analysis = self.inner.analysis_futures.lock();
                (
                    jobs.iter()
                        .map(|(id, h)| (id.clone(), h.clone()))
                        .collect::<Vec<_>>(),
                    analysis
                        .iter()
                        .map(|(id, h)| (id.clone(), h.clone()))
                        .collect::<Vec<_>>(),
                )
            };

            let handles: Vec<TaskHandle> = job_handles
                .iter()
                .chain(&analysis_handles)
                .map(|(_, h)| h.clone())
                .collect();
            wait_for_tasks(&handles, "jobs and analysis", self.experiment_id(), timeout).await;

            let (remaining_jobs, remaining_analysis) = {
                let mut jobs = self.inner.job_futures.lock();
                for (id, handle) in &job_handles {
                    if handle.settled_ok() {
                        jobs.remove(id);
                    }
                }
                let mut analysis = self.inner.analysis_futures.lock();
                for (id, handle) in &analysis_handles {
                    if handle.settled_ok() {
                        analysis.remove(id);
                    }
                }
                let known_jobs = job_handles.iter().filter(|(_, h)| !h.settled_ok()).count();
                let known_analysis = analysis_handles
                    .iter()
                    .filter(|(_, h)| !h.settled_ok())
                    .count();
                (jobs.len() > known_jobs, analysis.len() > known_analysis)
            };

            let remaining = timeout.map(|limit| limit.saturating_sub(start.elapsed()));
            if remaining_jobs || remaining_analysis {
                return self.block_for_results(remaining).await;
            }

            for child in self.inner.child_data.values() {
                let remaining = timeout.map(|limit| limit.saturating_sub(start.elapsed()));
                child.block_for_results(remaining).await;
            }
            self
        }
        .boxed()
    }

    /// Aggregate status of all analysis callbacks.
    pub fn analysis_status(&self) -> AnalysisStatus {
        AnalysisStatus::aggregate(
            self.inner
                .analysis_callbacks
                .lock()
                .values()
                .map(|callback| callback.status),
        )
    }

    /// Overall experiment status.
    pub async fn status(&self) -> ExperimentStatus {
        if self.is_empty() {
            return ExperimentStatus::Empty;
        }
        // Job states other than Done take precedence over analysis.
        ExperimentStatus::from_parts(self.job_status().await, self.analysis_status())
    }

    /// Error messages of failed analysis callbacks.
    pub fn analysis_errors(&self) -> String {
        self.inner
            .analysis_callbacks
            .lock()
            .values()
            .filter(|callback| callback.status == AnalysisStatus::Error)
            .map(|callback| {
                format!(
                    "\n[Analysis Callback ID: {}]: {}",
                    callback.callback_id,
                    callback.error_msg.as_deref().unwrap_or_default()
                )
            })
            .collect()
    }

    /// Job errors followed by analysis errors.
    pub async fn errors(&self) -> String {
        let mut errors = self.job_errors().await;
        errors.push_str(&self.analysis_errors());
        errors
    }

    /// Wait for currently known analysis tasks only.
    pub(crate) async fn wait_for_analysis(&self, timeout: Option<Duration>) -> bool {
        let handles = self.inner.analysis_futures.values();
        wait_for_tasks(&handles, "analysis", self.experiment_id(), timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::Record;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_callback_runs_to_done() {
        let exp = ExperimentData::builder().build().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let id = exp.add_analysis_callback(
            "count",
            move |_data, _kwargs| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            Record::new(),
        );
        exp.block_for_results(None).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(exp.analysis_callback(&id).unwrap().status, AnalysisStatus::Done);
        assert_eq!(exp.analysis_status(), AnalysisStatus::Done);
    }

    #[tokio::test]
    async fn test_callback_error_is_recorded() {
        let exp = ExperimentData::builder().build().unwrap();
        let id = exp.add_analysis_callback(
            "broken",
            |_data, _kwargs| async { Err(anyhow::anyhow!("fit did not converge")) },
            Record::new(),
        );
        exp.block_for_results(None).await;

        let callback = exp.analysis_callback(&id).unwrap();
        assert_eq!(callback.status, AnalysisStatus::Error);
        let msg = callback.error_msg.unwrap();
        assert!(msg.starts_with("Analysis callback failed"));
        assert!(msg.contains("fit did not converge"));
        assert!(exp.analysis_errors().contains(&id));
        assert_eq!(exp.status().await, ExperimentStatus::Error);
    }

    #[tokio::test]
    async fn test_callback_panic_is_recorded() {
        let exp = ExperimentData::builder().build().unwrap();
        let id = exp.add_analysis_callback(
            "panics",
            |_data, _kwargs| async {
                if true {
                    panic!("index out of bounds");
                }
                Ok(())
            },
            Record::new(),
        );
        exp.block_for_results(None).await;
        let callback = exp.analysis_callback(&id).unwrap();
        assert_eq!(callback.status, AnalysisStatus::Error);
        assert!(callback.error_msg.unwrap().contains("index out of bounds"));
    }

    #[tokio::test]
    async fn test_failed_predecessor_cancels_successor() {
        let exp = ExperimentData::builder().build().unwrap();
        exp.add_analysis_callback(
            "first",
            |_data, _kwargs| async { Err(anyhow::anyhow!("boom")) },
            Record::new(),
        );
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let second = exp.add_analysis_callback(
            "second",
            move |_data, _kwargs| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            Record::new(),
        );
        exp.block_for_results(None).await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            exp.analysis_callback(&second).unwrap().status,
            AnalysisStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_callbacks_run_in_submission_order() {
        let exp = ExperimentData::builder().build().unwrap();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        for i in 0..4 {
            let order = Arc::clone(&order);
            exp.add_analysis_callback(
                format!("step-{i}"),
                move |_data, _kwargs| async move {
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    order.lock().unwrap().push(i);
                    Ok(())
                },
                Record::new(),
            );
        }
        exp.block_for_results(None).await;
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_cancel_running_callback_reports_failure() {
        let exp = ExperimentData::builder().build().unwrap();
        let started = Arc::new(tokio::sync::Notify::new());
        let release = Arc::new(tokio::sync::Notify::new());
        let (s, r) = (Arc::clone(&started), Arc::clone(&release));
        exp.add_analysis_callback(
            "slow",
            move |_data, _kwargs| async move {
                s.notify_one();
                r.notified().await;
                Ok(())
            },
            Record::new(),
        );
        started.notified().await;

        assert!(!exp.cancel_analysis(None).await);
        release.notify_one();
        exp.block_for_results(None).await;
        assert_eq!(exp.analysis_status(), AnalysisStatus::Done);
    }

    #[tokio::test]
    async fn test_callback_spawning_callback_is_awaited() {
        let exp = ExperimentData::builder().build().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        exp.add_analysis_callback(
            "parent",
            move |data: ExperimentData, _kwargs| async move {
                data.add_analysis_callback(
                    "nested",
                    move |_data, _kwargs| async move {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    },
                    Record::new(),
                );
                Ok(())
            },
            Record::new(),
        );
        exp.block_for_results(None).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(exp.analysis_callbacks().len(), 2);
    }
}
