//! The experiment data container.
//!
//! [`ExperimentData`] is a cheap-to-clone handle over shared state. Background
//! job and analysis tasks hold their own handle, so results land in the same
//! container the caller is looking at.
//!
//! # Example
//!
//! ```ignore
//! use arvak_expdata::{ExperimentData, DataIndex};
//!
//! let exp = ExperimentData::builder()
//!     .experiment_type("T1")
//!     .backend(backend)
//!     .build()?;
//!
//! exp.add_jobs(vec![job], None).await;
//! exp.add_analysis_callback("fit_t1", fit_t1, Default::default());
//! exp.block_for_results(None).await;
//!
//! let records = exp.data(DataIndex::All).await?;
//! ```

mod analysis;
mod artifacts;
mod hierarchy;
mod jobs;
mod persistence;
mod snapshot;

pub use artifacts::{FigureKey, ResultIndex, ResultKey, ResultQuery};
pub use hierarchy::ChildIndex;
pub use jobs::DataIndex;
pub use persistence::SaveOptions;
pub use snapshot::{ExperimentSnapshot, StoredAnalysisResult};

use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use rustc_hash::FxHashSet;
use serde_json::{Value, json};
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::analysis_result::AnalysisResult;
use crate::callback::AnalysisCallback;
use crate::config::ExpDataConfig;
use crate::containers::{OrderedMap, ThreadSafeList, ThreadSafeMap};
use crate::error::ExpDataResult;
use crate::figure::FigureData;
use crate::job::{Backend, JobStatus, Provider, RemoteJob};
use crate::pool::WorkerPool;
use crate::result::Record;
use crate::service::{ExperimentRecord, ExperimentService};
use crate::status::ExperimentStatus;
use crate::task::TaskHandle;

/// Class name recorded in the `_source` provenance entry.
pub const SOURCE_CLASS: &str = "arvak_expdata::ExperimentData";

/// Metadata schema version recorded in `_source`.
pub const METADATA_VERSION: u64 = 1;

/// Lock a plain mutex, recovering from poisoning.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Sorted, without duplicates.
pub(crate) fn normalize_tags<I: IntoIterator<Item = String>>(tags: I) -> Vec<String> {
    tags.into_iter().collect::<BTreeSet<_>>().into_iter().collect()
}

/// Remove duplicates, keeping the first occurrence of each id.
pub(crate) fn dedupe_ids<I: IntoIterator<Item = String>>(ids: I) -> Vec<String> {
    let mut seen = FxHashSet::default();
    ids.into_iter().filter(|id| seen.insert(id.clone())).collect()
}

fn source_info() -> Value {
    json!({
        "class": SOURCE_CLASS,
        "metadata_version": METADATA_VERSION,
        "arvak_version": env!("CARGO_PKG_VERSION"),
    })
}

// Shared lock order: jobs, job_futures, analysis_futures, analysis_callbacks,
// result_data, figures, analysis_results, child_data, db.
pub(crate) struct Inner {
    experiment_id: String,
    config: Arc<ExpDataConfig>,
    pool: WorkerPool,
    analysis_slots: Arc<Semaphore>,

    db: Mutex<ExperimentRecord>,
    backend: Mutex<Option<Arc<dyn Backend>>>,
    provider: Mutex<Option<Arc<dyn Provider>>>,
    service: Mutex<Option<Arc<dyn ExperimentService>>>,
    auto_save: AtomicBool,
    created_in_db: AtomicBool,
    extra: Mutex<Record>,

    jobs: ThreadSafeMap<String, Option<Arc<dyn RemoteJob>>>,
    job_futures: ThreadSafeMap<String, TaskHandle>,
    analysis_callbacks: ThreadSafeMap<String, AnalysisCallback>,
    analysis_futures: ThreadSafeMap<String, TaskHandle>,
    result_data: ThreadSafeList<Record>,
    figures: ThreadSafeMap<String, FigureData>,
    analysis_results: ThreadSafeMap<String, AnalysisResult>,
    deleted_figures: Mutex<VecDeque<String>>,
    deleted_analysis_results: Mutex<VecDeque<String>>,
    child_data: ThreadSafeMap<String, ExperimentData>,
}

/// Container for the jobs, raw result records, analysis callbacks, figures and
/// analysis results of one experiment, plus its child experiments.
#[derive(Clone)]
pub struct ExperimentData {
    inner: Arc<Inner>,
}

/// Builder for [`ExperimentData`].
#[derive(Default)]
pub struct ExperimentDataBuilder {
    experiment_type: String,
    experiment_id: Option<String>,
    parent_id: Option<String>,
    backend: Option<Arc<dyn Backend>>,
    provider: Option<Arc<dyn Provider>>,
    service: Option<Arc<dyn ExperimentService>>,
    job_ids: Vec<String>,
    child_data: Vec<ExperimentData>,
    metadata: Record,
    tags: Vec<String>,
    share_level: Option<String>,
    notes: Option<String>,
    start_datetime: Option<DateTime<Utc>>,
    pool: Option<WorkerPool>,
    config: Option<Arc<ExpDataConfig>>,
    extra: Record,
}

impl ExperimentDataBuilder {
    pub fn experiment_type(mut self, experiment_type: impl Into<String>) -> Self {
        self.experiment_type = experiment_type.into();
        self
    }

    /// Fixed experiment id instead of a fresh UUID.
    pub fn experiment_id(mut self, experiment_id: impl Into<String>) -> Self {
        self.experiment_id = Some(experiment_id.into());
        self
    }

    pub fn parent_id(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn service(mut self, service: Arc<dyn ExperimentService>) -> Self {
        self.service = Some(service);
        self
    }

    /// Ids of jobs whose handles will be fetched from the provider on demand.
    pub fn job_ids<I, S>(mut self, job_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.job_ids = job_ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn child_data(mut self, children: Vec<ExperimentData>) -> Self {
        self.child_data = children;
        self
    }

    pub fn metadata(mut self, metadata: Record) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn share_level(mut self, share_level: impl Into<String>) -> Self {
        self.share_level = Some(share_level.into());
        self
    }

    pub fn notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn start_datetime(mut self, start: DateTime<Utc>) -> Self {
        self.start_datetime = Some(start);
        self
    }

    /// Worker pool for background tasks. Defaults to the current runtime.
    pub fn pool(mut self, pool: WorkerPool) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn config(mut self, config: Arc<ExpDataConfig>) -> Self {
        self.config = Some(config);
        self
    }

    /// Extra keyword value, readable through [`ExperimentData::extra`].
    pub fn extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    pub fn build(self) -> ExpDataResult<ExperimentData> {
        let pool = match self.pool {
            Some(pool) => pool,
            None => WorkerPool::current()?,
        };
        let config = self.config.unwrap_or_default();

        let experiment_id = self
            .experiment_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut record = ExperimentRecord::new(experiment_id, self.experiment_type);
        let mut metadata = self.metadata;
        if !metadata.contains_key("_source") {
            metadata.insert("_source".to_string(), source_info());
        }
        record.metadata = metadata;
        record.parent_id = self.parent_id;
        record.tags = normalize_tags(self.tags);
        record.job_ids = dedupe_ids(self.job_ids);
        record.share_level = self.share_level;
        record.notes = self.notes;
        record.start_datetime = Some(self.start_datetime.unwrap_or_else(Utc::now));

        let data = ExperimentData::from_parts(record, pool, config);
        *lock(&data.inner.extra) = self.extra;

        if let Some(backend) = self.backend {
            data.assign_backend(backend);
        }
        if let Some(provider) = self.provider {
            *lock(&data.inner.provider) = Some(provider);
        }
        let service = self
            .service
            .or_else(|| data.provider().and_then(|p| p.experiment_service()));
        if let Some(service) = service {
            data.inner
                .auto_save
                .store(service.auto_save_default(), Ordering::SeqCst);
            data.assign_service(&service);
        }

        for child in self.child_data {
            data.add_child_data(child);
        }
        Ok(data)
    }
}

impl ExperimentData {
    pub fn builder() -> ExperimentDataBuilder {
        ExperimentDataBuilder::default()
    }

    /// Container around an existing database record. Job ids become placeholders.
    pub(crate) fn from_parts(
        record: ExperimentRecord,
        pool: WorkerPool,
        config: Arc<ExpDataConfig>,
    ) -> Self {
        let jobs: OrderedMap<String, Option<Arc<dyn RemoteJob>>> =
            record.job_ids.iter().map(|id| (id.clone(), None)).collect();
        let analysis_slots = Arc::new(Semaphore::new(config.analysis_workers.max(1)));

        Self {
            inner: Arc::new(Inner {
                experiment_id: record.experiment_id.clone(),
                config,
                pool,
                analysis_slots,
                db: Mutex::new(record),
                backend: Mutex::new(None),
                provider: Mutex::new(None),
                service: Mutex::new(None),
                auto_save: AtomicBool::new(false),
                created_in_db: AtomicBool::new(false),
                extra: Mutex::new(Record::new()),
                jobs: ThreadSafeMap::from_map(jobs),
                job_futures: ThreadSafeMap::new(),
                analysis_callbacks: ThreadSafeMap::new(),
                analysis_futures: ThreadSafeMap::new(),
                result_data: ThreadSafeList::new(),
                figures: ThreadSafeMap::new(),
                analysis_results: ThreadSafeMap::new(),
                deleted_figures: Mutex::new(VecDeque::new()),
                deleted_analysis_results: Mutex::new(VecDeque::new()),
                child_data: ThreadSafeMap::new(),
            }),
        }
    }

    pub(crate) fn lock_record(&self) -> MutexGuard<'_, ExperimentRecord> {
        lock(&self.inner.db)
    }

    pub fn experiment_id(&self) -> &str {
        &self.inner.experiment_id
    }

    pub fn experiment_type(&self) -> String {
        self.lock_record().experiment_type.clone()
    }

    pub fn parent_id(&self) -> Option<String> {
        self.lock_record().parent_id.clone()
    }

    /// Copy of the database record.
    pub fn record(&self) -> ExperimentRecord {
        self.lock_record().clone()
    }

    pub fn metadata(&self) -> Record {
        self.lock_record().metadata.clone()
    }

    /// Set one metadata entry. The `_source` entry cannot be overwritten.
    pub fn set_metadata_entry(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        if key == "_source" {
            tracing::warn!(
                "Ignoring attempt to overwrite metadata provenance [Experiment ID: {}]",
                self.experiment_id()
            );
            return;
        }
        self.lock_record().metadata.insert(key, value);
    }

    /// Provenance entry of the metadata.
    pub fn source(&self) -> Option<Value> {
        self.lock_record().metadata.get("_source").cloned()
    }

    /// Extra keyword value supplied at construction.
    pub fn extra(&self, key: &str) -> Option<Value> {
        lock(&self.inner.extra).get(key).cloned()
    }

    pub fn tags(&self) -> Vec<String> {
        self.lock_record().tags.clone()
    }

    pub fn share_level(&self) -> Option<String> {
        self.lock_record().share_level.clone()
    }

    pub fn notes(&self) -> Option<String> {
        self.lock_record().notes.clone()
    }

    pub fn figure_names(&self) -> Vec<String> {
        self.lock_record().figure_names.clone()
    }

    pub fn start_datetime(&self) -> Option<DateTime<Utc>> {
        self.lock_record().start_datetime
    }

    pub fn end_datetime(&self) -> Option<DateTime<Utc>> {
        self.lock_record().end_datetime
    }

    pub fn creation_datetime(&self) -> Option<DateTime<Utc>> {
        self.lock_record().creation_datetime
    }

    pub fn updated_datetime(&self) -> Option<DateTime<Utc>> {
        self.lock_record().updated_datetime
    }

    pub fn backend(&self) -> Option<Arc<dyn Backend>> {
        lock(&self.inner.backend).clone()
    }

    pub fn backend_name(&self) -> Option<String> {
        self.lock_record().backend.clone()
    }

    pub fn provider(&self) -> Option<Arc<dyn Provider>> {
        lock(&self.inner.provider).clone()
    }

    pub fn service(&self) -> Option<Arc<dyn ExperimentService>> {
        lock(&self.inner.service).clone()
    }

    pub fn auto_save(&self) -> bool {
        self.inner.auto_save.load(Ordering::SeqCst)
    }

    pub fn created_in_db(&self) -> bool {
        self.inner.created_in_db.load(Ordering::SeqCst)
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.inner.pool
    }

    pub fn config(&self) -> &ExpDataConfig {
        &self.inner.config
    }

    /// Number of raw result records.
    pub fn data_len(&self) -> usize {
        self.inner.result_data.len()
    }

    pub(crate) fn set_parent_id(&self, parent_id: Option<String>) {
        self.lock_record().parent_id = parent_id;
    }

    /// True when nothing at all has been added.
    fn is_empty(&self) -> bool {
        self.inner.result_data.is_empty()
            && self.inner.jobs.is_empty()
            && self.inner.job_futures.is_empty()
            && self.inner.analysis_callbacks.is_empty()
            && self.inner.analysis_futures.is_empty()
            && self.inner.figures.is_empty()
            && self.inner.analysis_results.is_empty()
    }

    /// Status derived from local task state only, without querying remote jobs.
    pub fn local_status(&self) -> ExperimentStatus {
        if self.is_empty() {
            return ExperimentStatus::Empty;
        }
        let handles = self.inner.job_futures.values();
        let job = if handles.iter().any(|h| !h.is_done()) {
            JobStatus::Running
        } else if handles.iter().any(|h| h.failure().is_some()) {
            JobStatus::Error
        } else {
            JobStatus::Done
        };
        ExperimentStatus::from_parts(job, self.analysis_status())
    }

    /// Human summary including the live status and any errors.
    pub async fn summary(&self) -> String {
        let status = self.status().await;
        let errors = if status == ExperimentStatus::Error {
            Some(self.errors().await)
        } else {
            None
        };
        self.render_summary(status, errors.as_deref())
    }

    fn render_summary(&self, status: ExperimentStatus, errors: Option<&str>) -> String {
        let record = self.record();
        let mut out = "-".repeat(51);
        out.push_str(&format!("\nExperiment: {}", record.experiment_type));
        out.push_str(&format!("\nExperiment ID: {}", record.experiment_id));
        if let Some(parent_id) = &record.parent_id {
            out.push_str(&format!("\nParent ID: {parent_id}"));
        }
        let children = self.inner.child_data.len();
        if children > 0 {
            out.push_str(&format!("\nChild Experiment Data: {children}"));
        }
        out.push_str(&format!("\nStatus: {status}"));
        if let Some(errors) = errors.filter(|e| !e.is_empty()) {
            out.push_str("\n  ");
            out.push_str(&errors.trim_start().replace('\n', "\n  "));
        }
        if let Some(backend) = &record.backend {
            out.push_str(&format!("\nBackend: {backend}"));
        }
        if !record.tags.is_empty() {
            out.push_str(&format!("\nTags: {:?}", record.tags));
        }
        out.push_str(&format!("\nData: {}", self.inner.result_data.len()));
        out.push_str(&format!(
            "\nAnalysis Results: {}",
            self.inner.analysis_results.len()
        ));
        out.push_str(&format!("\nFigures: {}", self.inner.figures.len()));
        out
    }
}

impl fmt::Display for ExperimentData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render_summary(self.local_status(), None))
    }
}

impl fmt::Debug for ExperimentData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let record = self.record();
        write!(
            f,
            "ExperimentData({}, {}",
            record.experiment_type, record.experiment_id
        )?;
        if let Some(parent_id) = &record.parent_id {
            write!(f, ", parent_id={parent_id}")?;
        }
        if let Some(backend) = &record.backend {
            write!(f, ", backend={backend}")?;
        }
        if !record.job_ids.is_empty() {
            write!(f, ", job_ids={:?}", record.job_ids)?;
        }
        f.write_str(")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_builder_defaults() {
        let exp = ExperimentData::builder()
            .experiment_type("T1")
            .build()
            .unwrap();
        assert_eq!(exp.experiment_id().len(), 36);
        assert_eq!(exp.experiment_type(), "T1");
        assert!(exp.start_datetime().is_some());
        assert!(exp.end_datetime().is_none());
        assert!(!exp.auto_save());

        let source = exp.source().unwrap();
        assert_eq!(source["class"], SOURCE_CLASS);
        assert_eq!(source["metadata_version"], 1);
    }

    #[tokio::test]
    async fn test_existing_source_is_preserved() {
        let mut metadata = Record::new();
        metadata.insert("_source".into(), json!({"class": "legacy"}));
        let exp = ExperimentData::builder()
            .metadata(metadata)
            .build()
            .unwrap();
        assert_eq!(exp.source().unwrap()["class"], "legacy");

        exp.set_metadata_entry("_source", json!("overwritten"));
        assert_eq!(exp.source().unwrap()["class"], "legacy");
    }

    #[tokio::test]
    async fn test_extra_and_tags() {
        let exp = ExperimentData::builder()
            .tags(["b", "a", "b"])
            .extra("shots", json!(2048))
            .build()
            .unwrap();
        assert_eq!(exp.tags(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(exp.extra("shots"), Some(json!(2048)));
        assert_eq!(exp.extra("missing"), None);
    }

    #[tokio::test]
    async fn test_job_ids_become_placeholders() {
        let exp = ExperimentData::builder()
            .job_ids(["j1", "j2", "j1"])
            .build()
            .unwrap();
        assert_eq!(exp.job_ids(), vec!["j1".to_string(), "j2".to_string()]);
        assert!(exp.jobs().is_empty());
        assert_ne!(exp.local_status(), ExperimentStatus::Empty);
    }

    #[tokio::test]
    async fn test_display_and_debug() {
        let exp = ExperimentData::builder()
            .experiment_type("Rabi")
            .experiment_id("abc")
            .build()
            .unwrap();
        let text = exp.to_string();
        assert!(text.starts_with(&"-".repeat(51)));
        assert!(text.contains("\nExperiment: Rabi"));
        assert!(text.contains("\nStatus: EMPTY"));
        assert!(text.ends_with("\nFigures: 0"));
        assert_eq!(format!("{exp:?}"), "ExperimentData(Rabi, abc)");
    }

    #[test]
    fn test_normalize_tags() {
        let tags = normalize_tags(["y", "x", "y", "x"].map(String::from));
        assert_eq!(tags, vec!["x".to_string(), "y".to_string()]);

        let ids = dedupe_ids(["j2", "j1", "j2"].map(String::from));
        assert_eq!(ids, vec!["j2".to_string(), "j1".to_string()]);
    }
}
