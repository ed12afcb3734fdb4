//! Synchronization with an experiment service.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{ExperimentData, lock};
use crate::analysis_result::AnalysisResult;
use crate::config::ExpDataConfig;
use crate::error::{ExpDataError, ExpDataResult, ServiceError};
use crate::job::Provider;
use crate::pool::WorkerPool;
use crate::service::ExperimentService;
use crate::task::wait_for_tasks;

/// Options for [`ExperimentData::save`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveOptions {
    /// Log remote failures instead of returning them.
    pub suppress_errors: bool,
    /// Concurrent requests for bulk uploads.
    pub max_workers: usize,
    pub save_figures: bool,
    pub save_children: bool,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self::from_config(&ExpDataConfig::default())
    }
}

impl SaveOptions {
    pub fn from_config(config: &ExpDataConfig) -> Self {
        Self {
            suppress_errors: true,
            max_workers: config.default_save_workers,
            save_figures: true,
            save_children: true,
        }
    }

    /// Fail on the first remote error.
    pub fn strict(mut self) -> Self {
        self.suppress_errors = false;
        self
    }
}

fn remove_queued(queue: &Mutex<VecDeque<String>>, item: &str) {
    let mut queue = lock(queue);
    if let Some(pos) = queue.iter().position(|queued| queued == item) {
        queue.remove(pos);
    }
}

impl ExperimentData {
    fn save_failure(&self, suppress_errors: bool, message: String) -> ExpDataResult<()> {
        if suppress_errors {
            warn!("{message}");
            Ok(())
        } else {
            Err(ExpDataError::SaveFailed(message))
        }
    }

    async fn save_experiment_metadata(&self, suppress_errors: bool) -> ExpDataResult<()> {
        let Some(service) = self.service() else {
            return self.save_failure(
                suppress_errors,
                format!(
                    "Experiment cannot be saved because no experiment service is available [Experiment ID: {}]",
                    self.experiment_id()
                ),
            );
        };

        let mut record = self.record();
        let metadata_size = serde_json::to_string(&record.metadata)?.len();
        let side_metadata = (metadata_size > self.inner.config.metadata_size_limit)
            .then(|| std::mem::take(&mut record.metadata));

        let create = !self.created_in_db();
        let saved = match service.create_or_update_experiment(&record, create).await {
            Err(ServiceError::AlreadyExists(_)) if create => {
                service.create_or_update_experiment(&record, false).await
            }
            other => other,
        };
        let timestamps = match saved {
            Ok(timestamps) => timestamps,
            Err(e) => {
                return self.save_failure(
                    suppress_errors,
                    format!(
                        "Unable to save experiment metadata [Experiment ID: {}]: {}",
                        self.experiment_id(),
                        e
                    ),
                );
            }
        };
        {
            let mut db = self.lock_record();
            if timestamps.created_at.is_some() {
                db.creation_datetime = timestamps.created_at;
            }
            db.updated_datetime = timestamps.updated_at;
        }
        self.inner.created_in_db.store(true, Ordering::SeqCst);

        if let Some(metadata) = side_metadata {
            debug!(
                "Uploading metadata of {} bytes as {} [Experiment ID: {}]",
                metadata_size,
                self.inner.config.metadata_filename,
                self.experiment_id()
            );
            if let Err(e) = service
                .file_upload(
                    self.experiment_id(),
                    &self.inner.config.metadata_filename,
                    &metadata,
                )
                .await
            {
                return self.save_failure(
                    suppress_errors,
                    format!(
                        "Unable to upload experiment metadata file [Experiment ID: {}]: {}",
                        self.experiment_id(),
                        e
                    ),
                );
            }
        }
        Ok(())
    }

    /// Save the experiment record of this container and every child.
    pub fn save_metadata(&self) -> BoxFuture<'_, ()> {
        async move {
            if let Err(e) = self.save_experiment_metadata(true).await {
                warn!(
                    "Unable to save experiment metadata [Experiment ID: {}]: {}",
                    self.experiment_id(),
                    e
                );
            }
            for child in self.inner.child_data.values() {
                child.save_metadata().await;
            }
        }
        .boxed()
    }

    pub(crate) async fn auto_save_metadata(&self) {
        if self.auto_save() {
            self.save_metadata().await;
        }
    }

    /// Default save options for this container's configuration.
    pub fn save_options(&self) -> SaveOptions {
        SaveOptions::from_config(&self.inner.config)
    }

    /// Save the experiment, its analysis results and figures, and pending
    /// deletions.
    pub fn save(&self, options: SaveOptions) -> BoxFuture<'_, ExpDataResult<()>> {
        async move {
            let suppress = options.suppress_errors;
            let Some(service) = self.service() else {
                return self.save_failure(
                    suppress,
                    format!(
                        "Experiment cannot be saved because no experiment service is available [Experiment ID: {}]",
                        self.experiment_id()
                    ),
                );
            };

            let cap = self.inner.config.max_save_workers;
            let max_workers = if options.max_workers > cap {
                warn!("max_workers cannot be larger than {cap}. Setting max_workers = {cap} now.");
                cap
            } else {
                options.max_workers.max(1)
            };

            self.save_experiment_metadata(suppress).await?;
            if !self.created_in_db() {
                warn!(
                    "Could not save experiment metadata, aborting experiment save [Experiment ID: {}]",
                    self.experiment_id()
                );
                return Ok(());
            }

            let records: Vec<_> = self
                .inner
                .analysis_results
                .values()
                .iter()
                .map(|result| result.record().clone())
                .collect();
            if !records.is_empty() {
                match service.create_analysis_results(&records, max_workers).await {
                    Ok(()) => {
                        let mut results = self.inner.analysis_results.lock();
                        for record in &records {
                            if let Some(result) = results.get_mut(&record.result_id) {
                                result.mark_created();
                            }
                        }
                    }
                    Err(e) => self.save_failure(
                        suppress,
                        format!(
                            "Unable to save analysis results [Experiment ID: {}]: {}",
                            self.experiment_id(),
                            e
                        ),
                    )?,
                }
            }
            self.flush_deleted_analysis_results(&service, suppress).await?;

            if options.save_figures {
                let mut rendered = Vec::new();
                for figure in self.inner.figures.values() {
                    match figure.figure.to_svg() {
                        Ok(svg) => rendered.push((figure.name.clone(), svg)),
                        Err(e) => self.save_failure(
                            suppress,
                            format!(
                                "Unable to render figure [Experiment ID: {}][Figure: {}]: {}",
                                self.experiment_id(),
                                figure.name,
                                e
                            ),
                        )?,
                    }
                }
                if !rendered.is_empty() {
                    if let Err(e) = service
                        .create_figures(self.experiment_id(), &rendered, max_workers)
                        .await
                    {
                        self.save_failure(
                            suppress,
                            format!(
                                "Unable to save figures [Experiment ID: {}]: {}",
                                self.experiment_id(),
                                e
                            ),
                        )?;
                    }
                }
            }
            self.flush_deleted_figures(&service, suppress).await?;

            if let Some(url) = service.experiment_url(self.experiment_id()) {
                info!("Experiment saved. You can view it at {url}");
            }

            if options.save_children {
                for child in self.inner.child_data.values() {
                    child.save(options).await?;
                }
            }
            Ok(())
        }
        .boxed()
    }

    /// Delete one queued figure remotely, dequeuing it on success.
    pub(crate) async fn delete_queued_figure(
        &self,
        service: &Arc<dyn ExperimentService>,
        name: &str,
        suppress_errors: bool,
    ) -> ExpDataResult<()> {
        match service.delete_figure(self.experiment_id(), name).await {
            // Already gone remotely counts as deleted.
            Ok(()) | Err(ServiceError::NotFound(_)) => {
                remove_queued(&self.inner.deleted_figures, name);
                Ok(())
            }
            Err(e) => self.save_failure(
                suppress_errors,
                format!(
                    "Unable to delete figure [Experiment ID: {}][Figure: {}]: {}",
                    self.experiment_id(),
                    name,
                    e
                ),
            ),
        }
    }

    pub(crate) async fn flush_deleted_figures(
        &self,
        service: &Arc<dyn ExperimentService>,
        suppress_errors: bool,
    ) -> ExpDataResult<()> {
        let pending: Vec<String> = lock(&self.inner.deleted_figures).iter().cloned().collect();
        for name in pending {
            self.delete_queued_figure(service, &name, suppress_errors)
                .await?;
        }
        Ok(())
    }

    /// Delete one queued analysis result remotely, dequeuing it on success.
    pub(crate) async fn delete_queued_analysis_result(
        &self,
        service: &Arc<dyn ExperimentService>,
        result_id: &str,
        suppress_errors: bool,
    ) -> ExpDataResult<()> {
        match service.delete_analysis_result(result_id).await {
            Ok(()) | Err(ServiceError::NotFound(_)) => {
                remove_queued(&self.inner.deleted_analysis_results, result_id);
                Ok(())
            }
            Err(e) => self.save_failure(
                suppress_errors,
                format!(
                    "Unable to delete analysis result [Experiment ID: {}][Result ID: {}]: {}",
                    self.experiment_id(),
                    result_id,
                    e
                ),
            ),
        }
    }

    pub(crate) async fn flush_deleted_analysis_results(
        &self,
        service: &Arc<dyn ExperimentService>,
        suppress_errors: bool,
    ) -> ExpDataResult<()> {
        let pending: Vec<String> = lock(&self.inner.deleted_analysis_results)
            .iter()
            .cloned()
            .collect();
        for result_id in pending {
            self.delete_queued_analysis_result(service, &result_id, suppress_errors)
                .await?;
        }
        Ok(())
    }

    /// Figure names awaiting remote deletion.
    pub fn pending_figure_deletions(&self) -> Vec<String> {
        lock(&self.inner.deleted_figures).iter().cloned().collect()
    }

    /// Analysis result ids awaiting remote deletion.
    pub fn pending_result_deletions(&self) -> Vec<String> {
        lock(&self.inner.deleted_analysis_results)
            .iter()
            .cloned()
            .collect()
    }

    /// Turn auto-save on or off for this container, its results and children.
    ///
    /// Turning it on saves this container immediately.
    pub fn set_auto_save(&self, auto_save: bool) -> BoxFuture<'_, ()> {
        async move {
            if auto_save {
                let options = SaveOptions {
                    save_children: false,
                    ..self.save_options()
                };
                if let Err(e) = self.save(options).await {
                    warn!(
                        "Unable to save experiment [Experiment ID: {}]: {}",
                        self.experiment_id(),
                        e
                    );
                }
            }
            self.inner.auto_save.store(auto_save, Ordering::SeqCst);
            {
                let mut results = self.inner.analysis_results.lock();
                for result in results.values_mut() {
                    result.set_auto_save(auto_save);
                }
            }
            for child in self.inner.child_data.values() {
                child.set_auto_save(auto_save).await;
            }
        }
        .boxed()
    }

    /// Load an experiment and its children from a service.
    ///
    /// The service is taken from `provider` when not given.
    pub async fn load(
        experiment_id: &str,
        service: Option<Arc<dyn ExperimentService>>,
        provider: Option<Arc<dyn Provider>>,
    ) -> ExpDataResult<ExperimentData> {
        Self::load_in(
            experiment_id,
            service,
            provider,
            WorkerPool::current()?,
            Arc::new(ExpDataConfig::default()),
        )
        .await
    }

    /// [`load`](Self::load) onto an explicit pool and configuration.
    pub fn load_in<'a>(
        experiment_id: &'a str,
        service: Option<Arc<dyn ExperimentService>>,
        provider: Option<Arc<dyn Provider>>,
        pool: WorkerPool,
        config: Arc<ExpDataConfig>,
    ) -> BoxFuture<'a, ExpDataResult<ExperimentData>> {
        async move {
            let service = match service
                .or_else(|| provider.as_ref().and_then(|p| p.experiment_service()))
            {
                Some(service) => service,
                None => {
                    return Err(ExpDataError::MissingService(
                        "no service or provider with a service was given, cannot load experiment data"
                            .to_string(),
                    ));
                }
            };

            let mut record = service.experiment(experiment_id).await?;
            if service
                .experiment_has_file(experiment_id, &config.metadata_filename)
                .await?
            {
                let side = service
                    .file_download(experiment_id, &config.metadata_filename)
                    .await?;
                record.metadata.extend(side);
            }
            let child_ids: Vec<String> = match record.metadata.remove("child_data_ids") {
                Some(Value::Array(ids)) => ids
                    .into_iter()
                    .filter_map(|id| id.as_str().map(str::to_string))
                    .collect(),
                _ => Vec::new(),
            };

            let data = ExperimentData::from_parts(record, pool.clone(), Arc::clone(&config));
            data.assign_service(&service);
            data.inner
                .auto_save
                .store(service.auto_save_default(), Ordering::SeqCst);
            if let Some(provider) = &provider {
                *lock(&data.inner.provider) = Some(Arc::clone(provider));
                data.retrieve_data().await;
            }
            data.retrieve_analysis_results(true).await?;
            data.inner.created_in_db.store(true, Ordering::SeqCst);

            for child_id in child_ids {
                let child = Self::load_in(
                    &child_id,
                    Some(Arc::clone(&service)),
                    provider.clone(),
                    pool.clone(),
                    Arc::clone(&config),
                )
                .await?;
                data.add_child_data(child);
            }
            debug!("Loaded experiment [Experiment ID: {}]", experiment_id);
            Ok(data)
        }
        .boxed()
    }

    /// Copy under a new experiment id.
    ///
    /// With `copy_results`, the copy waits for analysis and takes copies of
    /// analysis results (with fresh ids) and figures. Children are copied the
    /// same way.
    pub fn copy(&self, copy_results: bool) -> BoxFuture<'_, ExperimentData> {
        async move {
            let mut record = self.record();
            record.experiment_id = Uuid::new_v4().to_string();
            record.creation_datetime = None;
            record.updated_datetime = None;
            record.metadata.remove("child_data_ids");
            if !copy_results {
                record.figure_names.clear();
            }

            let copy = ExperimentData::from_parts(
                record,
                self.inner.pool.clone(),
                Arc::clone(&self.inner.config),
            );
            *lock(&copy.inner.backend) = self.backend();
            *lock(&copy.inner.provider) = self.provider();
            *lock(&copy.inner.service) = self.service();
            *lock(&copy.inner.extra) = lock(&self.inner.extra).clone();

            {
                let jobs = self.inner.jobs.lock();
                let job_futures = self.inner.job_futures.lock();
                let records = self.inner.result_data.lock();
                copy.inner.jobs.replace(jobs.clone());
                copy.inner.result_data.extend(records.iter().cloned());
                for (job_id, handle) in job_futures.iter() {
                    if handle.is_done() {
                        continue;
                    }
                    if let Some(Some(job)) = jobs.get(job_id) {
                        copy.add_job_future(Arc::clone(job));
                    }
                }
            }

            if copy_results {
                let pending = self.inner.analysis_futures.values();
                if pending.iter().any(|handle| !handle.is_done()) {
                    wait_for_tasks(&pending, "analysis", self.experiment_id(), None).await;
                }
                let figures = self.inner.figures.lock();
                let results = self.inner.analysis_results.lock();
                copy.attach_results(results.values().map(AnalysisResult::copy).collect());
                copy.inner.figures.replace(figures.clone());
            }

            for child in self.inner.child_data.values() {
                copy.add_child_data(child.copy(copy_results).await);
            }
            copy.inner.auto_save.store(self.auto_save(), Ordering::SeqCst);
            copy
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_without_service() {
        let exp = ExperimentData::builder().build().unwrap();
        assert!(exp.save(exp.save_options()).await.is_ok());
        let err = exp.save(exp.save_options().strict()).await.unwrap_err();
        assert!(matches!(err, ExpDataError::SaveFailed(_)));
        assert!(!exp.created_in_db());
    }

    #[tokio::test]
    async fn test_load_without_service() {
        let err = ExperimentData::load("exp-1", None, None).await.unwrap_err();
        assert!(matches!(err, ExpDataError::MissingService(_)));
    }

    #[test]
    fn test_save_options_defaults() {
        let options = SaveOptions::default();
        assert!(options.suppress_errors);
        assert_eq!(options.max_workers, 3);
        assert!(options.save_figures && options.save_children);
        assert!(!options.strict().suppress_errors);
    }

    #[tokio::test]
    async fn test_copy_gets_new_id_and_data() {
        let exp = ExperimentData::builder()
            .experiment_type("T1")
            .job_ids(["j1"])
            .build()
            .unwrap();
        exp.add_data([serde_json::json!({"x": 1})]).unwrap();
        exp.add_analysis_results(vec![crate::AnalysisResult::new("T1", serde_json::json!(1))])
            .await;

        let copy = exp.copy(true).await;
        assert_ne!(copy.experiment_id(), exp.experiment_id());
        assert_eq!(copy.data_len(), 1);
        assert_eq!(copy.job_ids(), vec!["j1".to_string()]);

        let original = exp.analysis_results(..).await.unwrap();
        let copied = copy.analysis_results(..).await.unwrap();
        assert_eq!(copied.len(), 1);
        assert_ne!(copied[0].result_id(), original[0].result_id());
        assert_eq!(copied[0].experiment_id(), copy.experiment_id());

        let bare = exp.copy(false).await;
        let query = crate::ResultQuery {
            block: false,
            ..Default::default()
        };
        let results = bare.analysis_results_with(.., query).await.unwrap();
        assert!(results.is_empty());
    }
}
