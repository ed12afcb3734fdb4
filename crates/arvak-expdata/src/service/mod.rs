//! Experiment persistence service interface.

mod local;

pub use local::LocalExperimentService;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};

use crate::analysis_result::AnalysisResultRecord;
use crate::error::ServiceResult;
use crate::result::Record;

/// Database record of an experiment: everything persisted by `save_metadata`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentRecord {
    pub experiment_id: String,
    #[serde(default)]
    pub experiment_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub job_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share_level: Option<String>,
    #[serde(default)]
    pub metadata: Record,
    #[serde(default)]
    pub figure_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_datetime: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_datetime: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_datetime: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_datetime: Option<DateTime<Utc>>,
}

impl ExperimentRecord {
    pub fn new(experiment_id: impl Into<String>, experiment_type: impl Into<String>) -> Self {
        Self {
            experiment_id: experiment_id.into(),
            experiment_type: experiment_type.into(),
            parent_id: None,
            backend: None,
            tags: Vec::new(),
            job_ids: Vec::new(),
            share_level: None,
            metadata: Record::new(),
            figure_names: Vec::new(),
            notes: None,
            hub: None,
            group: None,
            project: None,
            owner: None,
            start_datetime: None,
            end_datetime: None,
            creation_datetime: None,
            updated_datetime: None,
        }
    }
}

/// Server-assigned timestamps returned by a create/update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentTimestamps {
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// External system of record for experiments, analysis results and figures.
///
/// Every call may fail; callers in this crate downgrade failures to warnings
/// unless strict mode was requested.
#[async_trait]
pub trait ExperimentService: Send + Sync {
    /// Create (`create == true`) or update an experiment record.
    async fn create_or_update_experiment(
        &self,
        record: &ExperimentRecord,
        create: bool,
    ) -> ServiceResult<ExperimentTimestamps>;

    /// Fetch an experiment record. Fails with `NotFound` for unknown ids.
    async fn experiment(&self, experiment_id: &str) -> ServiceResult<ExperimentRecord>;

    /// Create (`create == true`) or update a single analysis result.
    async fn create_or_update_analysis_result(
        &self,
        record: &AnalysisResultRecord,
        create: bool,
    ) -> ServiceResult<()>;

    /// Bulk create or update with at most `max_workers` requests in flight.
    async fn create_analysis_results(
        &self,
        records: &[AnalysisResultRecord],
        max_workers: usize,
    ) -> ServiceResult<()> {
        // Collected eagerly: a lazy borrowing `map` does not satisfy the boxed future's bounds.
        let uploads: Vec<_> = records
            .iter()
            .map(|record| self.create_or_update_analysis_result(record, true))
            .collect();
        let results: Vec<ServiceResult<()>> = stream::iter(uploads)
            .buffer_unordered(max_workers.max(1))
            .collect()
            .await;
        results.into_iter().collect()
    }

    /// All analysis results stored for an experiment.
    async fn analysis_results(&self, experiment_id: &str)
    -> ServiceResult<Vec<AnalysisResultRecord>>;

    /// Delete an analysis result by id.
    async fn delete_analysis_result(&self, result_id: &str) -> ServiceResult<()>;

    /// Create (`create == true`) or update a figure from its SVG text.
    async fn create_or_update_figure(
        &self,
        experiment_id: &str,
        figure: &str,
        figure_name: &str,
        create: bool,
    ) -> ServiceResult<()>;

    /// Bulk upload of `(name, svg)` pairs with at most `max_workers` requests in flight.
    async fn create_figures(
        &self,
        experiment_id: &str,
        figures: &[(String, String)],
        max_workers: usize,
    ) -> ServiceResult<()> {
        let uploads: Vec<_> = figures
            .iter()
            .map(|(name, svg)| self.create_or_update_figure(experiment_id, svg, name, true))
            .collect();
        let results: Vec<ServiceResult<()>> = stream::iter(uploads)
            .buffer_unordered(max_workers.max(1))
            .collect()
            .await;
        results.into_iter().collect()
    }

    /// SVG text of a stored figure.
    async fn figure(&self, experiment_id: &str, figure_name: &str) -> ServiceResult<String>;

    /// Delete a figure by name.
    async fn delete_figure(&self, experiment_id: &str, figure_name: &str) -> ServiceResult<()>;

    /// Store a JSON side file next to the experiment.
    async fn file_upload(
        &self,
        experiment_id: &str,
        file_name: &str,
        content: &Record,
    ) -> ServiceResult<()>;

    /// Read back a side file written by `file_upload`.
    async fn file_download(&self, experiment_id: &str, file_name: &str) -> ServiceResult<Record>;

    /// Check whether a side file exists.
    async fn experiment_has_file(&self, experiment_id: &str, file_name: &str)
    -> ServiceResult<bool>;

    /// Auto-save preference applied when this service is attached to a container.
    fn auto_save_default(&self) -> bool {
        false
    }

    /// Where the experiment can be viewed, if the service has a web front end.
    fn experiment_url(&self, _experiment_id: &str) -> Option<String> {
        None
    }
}
