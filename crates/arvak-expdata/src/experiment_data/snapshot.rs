//! Serializable snapshots of a settled container.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::{ExperimentData, lock};
use crate::analysis_result::{AnalysisResult, AnalysisResultRecord};
use crate::callback::AnalysisCallback;
use crate::config::ExpDataConfig;
use crate::error::{ExpDataError, ExpDataResult};
use crate::figure::{FigureData, StoredFigure};
use crate::pool::WorkerPool;
use crate::result::Record;
use crate::service::ExperimentRecord;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredAnalysisResult {
    #[serde(flatten)]
    pub record: AnalysisResultRecord,
    #[serde(default)]
    pub created_in_db: bool,
}

/// Everything needed to rebuild an [`ExperimentData`] without its service,
/// provider or backend handles. Jobs come back as id placeholders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentSnapshot {
    pub record: ExperimentRecord,
    #[serde(default)]
    pub result_data: Vec<Record>,
    #[serde(default)]
    pub analysis_results: Vec<StoredAnalysisResult>,
    #[serde(default)]
    pub analysis_callbacks: Vec<AnalysisCallback>,
    #[serde(default)]
    pub figures: Vec<StoredFigure>,
    #[serde(default)]
    pub deleted_figures: Vec<String>,
    #[serde(default)]
    pub deleted_analysis_results: Vec<String>,
    #[serde(default)]
    pub extra: Record,
    #[serde(default)]
    pub created_in_db: bool,
    #[serde(default)]
    pub auto_save: bool,
    #[serde(default)]
    pub children: Vec<ExperimentSnapshot>,
}

impl ExperimentData {
    /// Snapshot this container and its children.
    ///
    /// Fails with [`ExpDataError::TasksOutstanding`] while any job or analysis
    /// task is unfinished.
    pub fn to_snapshot(&self) -> ExpDataResult<ExperimentSnapshot> {
        let jobs = self
            .inner
            .job_futures
            .values()
            .iter()
            .filter(|handle| !handle.is_done())
            .count();
        let analysis = self
            .inner
            .analysis_futures
            .values()
            .iter()
            .filter(|handle| !handle.is_done())
            .count();
        if jobs > 0 || analysis > 0 {
            return Err(ExpDataError::TasksOutstanding { jobs, analysis });
        }
        // No background task writes from here on; collections are read one lock at a time.

        if self.service().is_some() || self.backend().is_some() {
            info!(
                "The experiment service and backend are not serialized and will be dropped [Experiment ID: {}]",
                self.experiment_id()
            );
        }

        let figures = self
            .inner
            .figures
            .values()
            .iter()
            .map(FigureData::to_stored)
            .collect::<ExpDataResult<Vec<_>>>()?;
        let children = self
            .inner
            .child_data
            .values()
            .iter()
            .map(ExperimentData::to_snapshot)
            .collect::<ExpDataResult<Vec<_>>>()?;

        Ok(ExperimentSnapshot {
            record: self.record(),
            result_data: self.inner.result_data.snapshot(),
            analysis_results: self
                .inner
                .analysis_results
                .values()
                .into_iter()
                .map(|result| StoredAnalysisResult {
                    record: result.record().clone(),
                    created_in_db: result.created_in_db(),
                })
                .collect(),
            analysis_callbacks: self.inner.analysis_callbacks.values(),
            figures,
            deleted_figures: lock(&self.inner.deleted_figures).iter().cloned().collect(),
            deleted_analysis_results: lock(&self.inner.deleted_analysis_results)
                .iter()
                .cloned()
                .collect(),
            extra: lock(&self.inner.extra).clone(),
            created_in_db: self.created_in_db(),
            auto_save: self.auto_save(),
            children,
        })
    }

    /// Rebuild a container from a snapshot.
    pub fn from_snapshot(
        snapshot: ExperimentSnapshot,
        pool: WorkerPool,
        config: Arc<ExpDataConfig>,
    ) -> ExperimentData {
        let data = ExperimentData::from_parts(snapshot.record, pool.clone(), Arc::clone(&config));
        let inner = &data.inner;

        inner.result_data.extend(snapshot.result_data);
        {
            let mut results = inner.analysis_results.lock();
            for stored in snapshot.analysis_results {
                let mut result = AnalysisResult::from_record(stored.record);
                if stored.created_in_db {
                    result.mark_created();
                }
                results.insert(result.result_id().to_string(), result);
            }
        }
        // Restored callbacks are settled history; they never gate new ones.
        {
            let mut callbacks = inner.analysis_callbacks.lock();
            for callback in snapshot.analysis_callbacks {
                callbacks.insert(callback.callback_id.clone(), callback);
            }
        }
        {
            let mut figures = inner.figures.lock();
            for stored in snapshot.figures {
                figures.insert(stored.name.clone(), FigureData::from(stored));
            }
        }
        *lock(&inner.deleted_figures) = VecDeque::from(snapshot.deleted_figures);
        *lock(&inner.deleted_analysis_results) = VecDeque::from(snapshot.deleted_analysis_results);
        *lock(&inner.extra) = snapshot.extra;
        inner.created_in_db.store(snapshot.created_in_db, Ordering::SeqCst);
        inner.auto_save.store(snapshot.auto_save, Ordering::SeqCst);

        for child in snapshot.children {
            data.add_child_data(ExperimentData::from_snapshot(
                child,
                pool.clone(),
                Arc::clone(&config),
            ));
        }
        data
    }

    pub fn to_json(&self) -> ExpDataResult<String> {
        Ok(serde_json::to_string_pretty(&self.to_snapshot()?)?)
    }

    pub fn from_json(
        json: &str,
        pool: WorkerPool,
        config: Arc<ExpDataConfig>,
    ) -> ExpDataResult<ExperimentData> {
        let snapshot: ExperimentSnapshot = serde_json::from_str(json)?;
        Ok(Self::from_snapshot(snapshot, pool, config))
    }
}
