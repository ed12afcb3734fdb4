//! Raw data and job ingestion.

use std::ops::{Range, RangeFull};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::ExperimentData;
use crate::error::{ExpDataError, ExpDataResult, TaskFailure};
use crate::job::{JobStatus, RemoteJob};
use crate::result::{DataPayload, Record};
use crate::task::{TaskHandle, TaskOutcome, TaskResult};

/// Selector for [`ExperimentData::data`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataIndex {
    All,
    Index(usize),
    Range(Range<usize>),
    /// Records whose `job_id` equals this id.
    JobId(String),
}

impl From<RangeFull> for DataIndex {
    fn from(_: RangeFull) -> Self {
        DataIndex::All
    }
}

impl From<usize> for DataIndex {
    fn from(index: usize) -> Self {
        DataIndex::Index(index)
    }
}

impl From<Range<usize>> for DataIndex {
    fn from(range: Range<usize>) -> Self {
        DataIndex::Range(range)
    }
}

impl From<&str> for DataIndex {
    fn from(job_id: &str) -> Self {
        DataIndex::JobId(job_id.to_string())
    }
}

impl From<String> for DataIndex {
    fn from(job_id: String) -> Self {
        DataIndex::JobId(job_id)
    }
}

impl ExperimentData {
    /// Add raw result data.
    ///
    /// Every payload is validated before anything is stored, so a rejected
    /// call leaves the container unchanged.
    pub fn add_data<I>(&self, data: I) -> ExpDataResult<()>
    where
        I: IntoIterator,
        I::Item: Into<DataPayload>,
    {
        if self.analysis_pending() {
            warn!(
                "Not all analysis has finished running. Adding new data may create unexpected analysis results [Experiment ID: {}]",
                self.experiment_id()
            );
        }

        let normalized = data
            .into_iter()
            .map(|payload| payload.into().normalize())
            .collect::<ExpDataResult<Vec<_>>>()?;

        for batch in &normalized {
            if let Some(job_id) = &batch.job_id {
                self.register_job_id(job_id);
            }
        }
        self.inner
            .result_data
            .extend(normalized.into_iter().flat_map(|batch| batch.records));
        Ok(())
    }

    /// Track a job id without a handle.
    fn register_job_id(&self, job_id: &str) {
        let mut jobs = self.inner.jobs.lock();
        if !jobs.contains_key(&job_id.to_string()) {
            jobs.insert(job_id.to_string(), None);
            self.lock_record().job_ids.push(job_id.to_string());
        }
    }

    /// Add remote jobs and retrieve their results in the background.
    ///
    /// Jobs still unfinished after `timeout` are cancelled.
    pub async fn add_jobs(&self, jobs: Vec<Arc<dyn RemoteJob>>, timeout: Option<Duration>) {
        if self.analysis_pending() {
            warn!(
                "Not all analysis has finished running. Adding new jobs may create unexpected analysis results [Experiment ID: {}]",
                self.experiment_id()
            );
        }

        let mut added = Vec::new();
        for job in jobs {
            if let Some(job_backend) = job.backend() {
                let current = self.backend_name();
                if current.as_deref() != Some(job_backend.name()) {
                    if let Some(current) = current {
                        warn!(
                            "Adding a job from a backend ({}) that is different than the current backend ({}). The new backend will be used [Experiment ID: {}]",
                            job_backend.name(),
                            current,
                            self.experiment_id()
                        );
                    }
                    self.assign_backend(job_backend);
                }
            }

            let job_id = job.job_id().to_string();
            if self.register_job(job) {
                added.push(job_id);
            } else {
                warn!(
                    "Skipping duplicate job, a job with this ID already exists [Experiment ID: {}][Job ID: {}]",
                    self.experiment_id(),
                    job_id
                );
            }
        }

        if let Some(timeout) = timeout.filter(|_| !added.is_empty()) {
            let this = self.clone();
            self.inner.pool.spawn(async move {
                tokio::time::sleep(timeout).await;
                this.cancel_unfinished(&added).await;
            });
        }

        self.auto_save_metadata().await;
    }

    /// Store a job handle and schedule its result retrieval. A placeholder
    /// for the same id is filled in; a second handle is refused.
    fn register_job(&self, job: Arc<dyn RemoteJob>) -> bool {
        let job_id = job.job_id().to_string();
        let mut jobs = self.inner.jobs.lock();
        match jobs.get(&job_id) {
            Some(Some(_)) => return false,
            Some(None) => {}
            None => self.lock_record().job_ids.push(job_id.clone()),
        }
        jobs.insert(job_id, Some(Arc::clone(&job)));
        self.add_job_future(job);
        true
    }

    pub(crate) fn add_job_future(&self, job: Arc<dyn RemoteJob>) {
        let job_id = job.job_id().to_string();
        let mut futures = self.inner.job_futures.lock();
        if futures.contains_key(&job_id) {
            warn!(
                "Job future has already been submitted [Experiment ID: {}][Job ID: {}]",
                self.experiment_id(),
                job_id
            );
            return;
        }
        let this = self.clone();
        let handle =
            TaskHandle::spawn(&self.inner.pool, async move { this.add_job_data(job).await });
        futures.insert(job_id, handle);
    }

    async fn cancel_unfinished(&self, job_ids: &[String]) {
        let pending: Vec<String> = job_ids
            .iter()
            .filter(|id| {
                self.inner
                    .job_futures
                    .get(id)
                    .is_some_and(|handle| !handle.is_done())
            })
            .cloned()
            .collect();
        if pending.is_empty() {
            return;
        }
        warn!(
            "Jobs did not finish before the timeout and will be cancelled [Experiment ID: {}][Job IDs: {}]",
            self.experiment_id(),
            pending.join(", ")
        );
        self.cancel_jobs(Some(&pending)).await;
    }

    /// Wait for a job and merge its records.
    pub(crate) async fn add_job_data(&self, job: Arc<dyn RemoteJob>) -> TaskResult {
        let job_id = job.job_id().to_string();
        match job.result().await {
            Ok(result) => {
                let records = result
                    .to_records(Some(&job_id))
                    .map_err(|e| TaskFailure::Error(e.to_string()))?;
                self.inner.result_data.extend(records);
                self.lock_record().end_datetime = Some(Utc::now());
                debug!(
                    "Added job data [Experiment ID: {}][Job ID: {}]",
                    self.experiment_id(),
                    job_id
                );
                Ok(TaskOutcome::new(job_id, true))
            }
            Err(err) => match job.status().await {
                Ok(JobStatus::Cancelled) => {
                    warn!(
                        "Job was cancelled before completion [Experiment ID: {}][Job ID: {}]",
                        self.experiment_id(),
                        job_id
                    );
                    Ok(TaskOutcome::new(job_id, false))
                }
                Ok(JobStatus::Error) => {
                    let message = job
                        .error_message()
                        .await
                        .unwrap_or_else(|| err.to_string());
                    error!(
                        "Job failed with an error [Experiment ID: {}][Job ID: {}]: {}",
                        self.experiment_id(),
                        job_id,
                        message
                    );
                    Ok(TaskOutcome::new(job_id, false))
                }
                _ => {
                    warn!(
                        "Adding data from job failed [Experiment ID: {}][Job ID: {}]",
                        self.experiment_id(),
                        job_id
                    );
                    Err(TaskFailure::Error(err.to_string()))
                }
            },
        }
    }

    /// Fetch handles for known job ids that have none, through the provider.
    pub async fn retrieve_data(&self) {
        let missing: Vec<String> = self
            .inner
            .jobs
            .items()
            .into_iter()
            .filter_map(|(id, job)| job.is_none().then_some(id))
            .collect();
        if missing.is_empty() {
            return;
        }
        let Some(provider) = self.provider() else {
            warn!(
                "Unable to retrieve data from jobs because no provider is set [Experiment ID: {}][Job IDs: {}]",
                self.experiment_id(),
                missing.join(", ")
            );
            return;
        };

        for job_id in missing {
            let job = match provider.retrieve_job(&job_id).await {
                Ok(job) => job,
                Err(e) => {
                    warn!(
                        "Unable to retrieve data from job [Experiment ID: {}][Job ID: {}]: {}",
                        self.experiment_id(),
                        job_id,
                        e
                    );
                    continue;
                }
            };
            if !self.fill_placeholder(&job_id, &job) {
                continue;
            }
            let finished = matches!(job.status().await, Ok(status) if status.is_final());
            if finished {
                if let Err(failure) = self.add_job_data(job).await {
                    warn!(
                        "Unable to add data from job [Experiment ID: {}][Job ID: {}]: {}",
                        self.experiment_id(),
                        job_id,
                        failure
                    );
                }
            } else {
                self.add_job_future(job);
            }
        }
    }

    fn fill_placeholder(&self, job_id: &str, job: &Arc<dyn RemoteJob>) -> bool {
        let mut jobs = self.inner.jobs.lock();
        match jobs.get_mut(&job_id.to_string()) {
            Some(slot) if slot.is_none() => {
                *slot = Some(Arc::clone(job));
                true
            }
            _ => false,
        }
    }

    /// Raw result records, after reconciling jobs that lack a handle.
    pub async fn data(&self, index: impl Into<DataIndex>) -> ExpDataResult<Vec<Record>> {
        self.retrieve_data().await;
        self.select_data(index.into())
    }

    fn select_data(&self, index: DataIndex) -> ExpDataResult<Vec<Record>> {
        let records = self.inner.result_data.lock();
        let len = records.len();
        match index {
            DataIndex::All => Ok(records.clone()),
            DataIndex::Index(index) => records
                .get(index)
                .map(|record| vec![record.clone()])
                .ok_or(ExpDataError::IndexOutOfRange { index, len }),
            DataIndex::Range(range) => {
                let end = range.end;
                records
                    .get(range)
                    .map(<[Record]>::to_vec)
                    .ok_or(ExpDataError::IndexOutOfRange { index: end, len })
            }
            DataIndex::JobId(job_id) => Ok(records
                .iter()
                .filter(|record| {
                    record.get("job_id").and_then(Value::as_str) == Some(job_id.as_str())
                })
                .cloned()
                .collect()),
        }
    }

    /// Cached job handles, in insertion order.
    pub fn jobs(&self) -> Vec<Arc<dyn RemoteJob>> {
        self.inner.jobs.values().into_iter().flatten().collect()
    }

    pub fn job_ids(&self) -> Vec<String> {
        self.lock_record().job_ids.clone()
    }

    /// Completion time of every job that reports one.
    pub async fn completion_times(&self) -> Vec<(String, DateTime<Utc>)> {
        let jobs = self.jobs();
        let times = join_all(jobs.iter().map(|job| job.completion_time())).await;
        jobs.iter()
            .zip(times)
            .filter_map(|(job, time)| time.map(|t| (job.job_id().to_string(), t)))
            .collect()
    }

    /// Aggregate status of all job handles. A failed query counts as `Error`.
    pub async fn job_status(&self) -> JobStatus {
        let jobs = self.jobs();
        let statuses = join_all(jobs.iter().map(|job| job.status())).await;
        JobStatus::aggregate(
            statuses
                .into_iter()
                .map(|status| status.unwrap_or(JobStatus::Error)),
        )
    }

    /// Errors of errored jobs and failed job tasks.
    pub async fn job_errors(&self) -> String {
        let mut errors = String::new();
        for job in self.jobs() {
            if matches!(job.status().await, Ok(JobStatus::Error)) {
                let message = job.error_message().await.unwrap_or_default();
                errors.push_str(&format!("\n[Job ID: {}]: {}", job.job_id(), message));
            }
        }
        for (job_id, handle) in self.inner.job_futures.items() {
            if let Some(failure) = handle.failure() {
                errors.push_str(&format!("[Job ID: {job_id}]{failure}"));
            }
        }
        errors
    }

    /// Cancel matching unfinished jobs in reverse insertion order.
    ///
    /// Returns false if any remote cancel failed.
    pub async fn cancel_jobs(&self, ids: Option<&[String]>) -> bool {
        let mut all_cancelled = true;
        for (job_id, job) in self.inner.jobs.items().into_iter().rev() {
            if ids.is_some_and(|ids| !ids.contains(&job_id)) {
                continue;
            }
            let Some(job) = job else {
                continue;
            };
            let unfinished = !matches!(job.status().await, Ok(status) if status.is_final());
            if unfinished {
                if let Err(e) = job.cancel().await {
                    all_cancelled = false;
                    warn!(
                        "Unable to cancel job [Experiment ID: {}][Job ID: {}]:\n{}",
                        self.experiment_id(),
                        job_id,
                        e
                    );
                    continue;
                }
                info!(
                    "Cancelled job [Experiment ID: {}][Job ID: {}]",
                    self.experiment_id(),
                    job_id
                );
            }
            {
                let mut futures = self.inner.job_futures.lock();
                if unfinished || futures.get(&job_id).is_some_and(TaskHandle::is_done) {
                    futures.remove(&job_id);
                }
            }
        }
        all_cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::{ExperimentResult, JobResult};
    use serde_json::json;

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_add_data_registers_bundle_job() {
        let exp = ExperimentData::builder().build().unwrap();
        let bundle = JobResult::new("job-9").with_result(ExperimentResult::new(100, 2));
        exp.add_data([DataPayload::from(bundle), record(json!({"a": 1})).into()])
            .unwrap();

        assert_eq!(exp.job_ids(), vec!["job-9".to_string()]);
        assert_eq!(exp.data_len(), 2);
        assert_eq!(exp.select_data(DataIndex::JobId("job-9".into())).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_add_data_is_all_or_nothing() {
        let exp = ExperimentData::builder().build().unwrap();
        let err = exp
            .add_data([json!({"a": 1}), json!("not a record")])
            .unwrap_err();
        assert!(matches!(err, ExpDataError::UnsupportedData(_)));
        assert_eq!(exp.data_len(), 0);
    }

    #[tokio::test]
    async fn test_data_index_bounds() {
        let exp = ExperimentData::builder().build().unwrap();
        exp.add_data([json!([{"i": 0}, {"i": 1}, {"i": 2}])]).unwrap();

        assert_eq!(exp.data(1usize).await.unwrap()[0]["i"], json!(1));
        assert_eq!(exp.data(0usize..2).await.unwrap().len(), 2);
        assert_eq!(exp.data(..).await.unwrap().len(), 3);
        assert!(matches!(
            exp.data(5usize).await,
            Err(ExpDataError::IndexOutOfRange { index: 5, len: 3 })
        ));
        assert!(exp.data(2usize..4).await.is_err());
    }
}
