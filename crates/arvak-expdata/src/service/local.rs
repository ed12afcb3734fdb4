//! Directory-backed experiment service for development, testing and the CLI.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use rustc_hash::FxHashMap;
use tokio::fs;
use tokio::sync::RwLock;

use crate::analysis_result::AnalysisResultRecord;
use crate::error::{ServiceError, ServiceResult};
use crate::result::Record;
use crate::service::{ExperimentRecord, ExperimentService, ExperimentTimestamps};

/// JSON file-based experiment service.
///
/// Layout under the base directory:
///
/// ```text
/// experiments/<experiment_id>.json
/// analysis_results/<result_id>.json
/// figures/<experiment_id>/<figure_name>
/// files/<experiment_id>/<file_name>
/// ```
pub struct LocalExperimentService {
    base_dir: PathBuf,
    auto_save: bool,

    /// In-memory cache of experiment records.
    cache: RwLock<FxHashMap<String, ExperimentRecord>>,
}

impl LocalExperimentService {
    /// Open (or create) a store at the given path.
    pub async fn new(base_dir: impl AsRef<Path>) -> ServiceResult<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();

        fs::create_dir_all(base_dir.join("experiments")).await?;
        fs::create_dir_all(base_dir.join("analysis_results")).await?;
        fs::create_dir_all(base_dir.join("figures")).await?;
        fs::create_dir_all(base_dir.join("files")).await?;

        let service = Self {
            base_dir,
            auto_save: false,
            cache: RwLock::new(FxHashMap::default()),
        };
        service.load_all_experiments().await?;
        Ok(service)
    }

    /// Auto-save preference handed to containers this service is attached to.
    pub fn with_auto_save(mut self, auto_save: bool) -> Self {
        self.auto_save = auto_save;
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Ids of all stored experiments, sorted.
    pub async fn experiment_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.cache.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn experiment_path(&self, experiment_id: &str) -> ServiceResult<PathBuf> {
        Ok(self
            .base_dir
            .join("experiments")
            .join(format!("{}.json", checked_name(experiment_id)?)))
    }

    fn result_path(&self, result_id: &str) -> ServiceResult<PathBuf> {
        Ok(self
            .base_dir
            .join("analysis_results")
            .join(format!("{}.json", checked_name(result_id)?)))
    }

    fn entry_path(&self, kind: &str, experiment_id: &str, name: &str) -> ServiceResult<PathBuf> {
        Ok(self
            .base_dir
            .join(kind)
            .join(checked_name(experiment_id)?)
            .join(checked_name(name)?))
    }

    async fn load_all_experiments(&self) -> ServiceResult<()> {
        let dir = self.base_dir.join("experiments");
        let mut cache = self.cache.write().await;

        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                match fs::read_to_string(&path).await {
                    Ok(content) => match serde_json::from_str::<ExperimentRecord>(&content) {
                        Ok(record) => {
                            cache.insert(record.experiment_id.clone(), record);
                        }
                        Err(e) => {
                            tracing::warn!("Failed to parse experiment file {:?}: {}", path, e);
                        }
                    },
                    Err(e) => {
                        tracing::warn!("Failed to read experiment file {:?}: {}", path, e);
                    }
                }
            }
        }
        Ok(())
    }

    async fn write_in(path: &Path, contents: &str) -> ServiceResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path, contents).await?;
        Ok(())
    }
}

/// Names become path components, so separators and parent references are refused.
fn checked_name(name: &str) -> ServiceResult<&str> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(ServiceError::Request(format!("invalid entry name '{name}'")));
    }
    Ok(name)
}

fn not_found(err: std::io::Error, what: String) -> ServiceError {
    if err.kind() == std::io::ErrorKind::NotFound {
        ServiceError::NotFound(what)
    } else {
        ServiceError::Io(err)
    }
}

#[async_trait]
impl ExperimentService for LocalExperimentService {
    async fn create_or_update_experiment(
        &self,
        record: &ExperimentRecord,
        create: bool,
    ) -> ServiceResult<ExperimentTimestamps> {
        let path = self.experiment_path(&record.experiment_id)?;
        let mut cache = self.cache.write().await;
        let now = Utc::now();

        let created_at = match (create, cache.get(&record.experiment_id)) {
            (true, Some(_)) => {
                return Err(ServiceError::AlreadyExists(record.experiment_id.clone()));
            }
            (false, None) => return Err(ServiceError::NotFound(record.experiment_id.clone())),
            (true, None) => now,
            (false, Some(existing)) => existing.creation_datetime.unwrap_or(now),
        };

        let mut stored = record.clone();
        stored.creation_datetime = Some(created_at);
        stored.updated_datetime = Some(now);
        fs::write(&path, serde_json::to_string_pretty(&stored)?).await?;
        cache.insert(stored.experiment_id.clone(), stored);

        Ok(ExperimentTimestamps {
            created_at: Some(created_at),
            updated_at: Some(now),
        })
    }

    async fn experiment(&self, experiment_id: &str) -> ServiceResult<ExperimentRecord> {
        self.cache
            .read()
            .await
            .get(experiment_id)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(experiment_id.to_string()))
    }

    async fn create_or_update_analysis_result(
        &self,
        record: &AnalysisResultRecord,
        _create: bool,
    ) -> ServiceResult<()> {
        let path = self.result_path(&record.result_id)?;
        let now = Utc::now();

        let created_at = match fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str::<AnalysisResultRecord>(&content)
                .ok()
                .and_then(|existing| existing.creation_datetime),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(ServiceError::Io(e)),
        };

        let mut stored = record.clone();
        stored.creation_datetime = created_at.or(Some(now));
        stored.updated_datetime = Some(now);
        fs::write(&path, serde_json::to_string_pretty(&stored)?).await?;
        Ok(())
    }

    async fn analysis_results(
        &self,
        experiment_id: &str,
    ) -> ServiceResult<Vec<AnalysisResultRecord>> {
        let dir = self.base_dir.join("analysis_results");
        let mut results = Vec::new();

        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.extension().is_some_and(|ext| ext == "json") {
                continue;
            }
            let content = fs::read_to_string(&path).await?;
            match serde_json::from_str::<AnalysisResultRecord>(&content) {
                Ok(record) if record.experiment_id == experiment_id => results.push(record),
                Ok(_) => {}
                Err(e) => tracing::warn!("Failed to parse analysis result {:?}: {}", path, e),
            }
        }

        results.sort_by(|a, b| {
            a.creation_datetime
                .cmp(&b.creation_datetime)
                .then_with(|| a.result_id.cmp(&b.result_id))
        });
        Ok(results)
    }

    async fn delete_analysis_result(&self, result_id: &str) -> ServiceResult<()> {
        let path = self.result_path(result_id)?;
        fs::remove_file(&path)
            .await
            .map_err(|e| not_found(e, format!("analysis result {result_id}")))
    }

    async fn create_or_update_figure(
        &self,
        experiment_id: &str,
        figure: &str,
        figure_name: &str,
        _create: bool,
    ) -> ServiceResult<()> {
        let path = self.entry_path("figures", experiment_id, figure_name)?;
        Self::write_in(&path, figure).await
    }

    async fn figure(&self, experiment_id: &str, figure_name: &str) -> ServiceResult<String> {
        let path = self.entry_path("figures", experiment_id, figure_name)?;
        fs::read_to_string(&path)
            .await
            .map_err(|e| not_found(e, format!("figure {figure_name}")))
    }

    async fn delete_figure(&self, experiment_id: &str, figure_name: &str) -> ServiceResult<()> {
        let path = self.entry_path("figures", experiment_id, figure_name)?;
        fs::remove_file(&path)
            .await
            .map_err(|e| not_found(e, format!("figure {figure_name}")))
    }

    async fn file_upload(
        &self,
        experiment_id: &str,
        file_name: &str,
        content: &Record,
    ) -> ServiceResult<()> {
        let path = self.entry_path("files", experiment_id, file_name)?;
        Self::write_in(&path, &serde_json::to_string_pretty(content)?).await
    }

    async fn file_download(&self, experiment_id: &str, file_name: &str) -> ServiceResult<Record> {
        let path = self.entry_path("files", experiment_id, file_name)?;
        let content = fs::read_to_string(&path)
            .await
            .map_err(|e| not_found(e, format!("file {file_name}")))?;
        Ok(serde_json::from_str(&content)?)
    }

    async fn experiment_has_file(
        &self,
        experiment_id: &str,
        file_name: &str,
    ) -> ServiceResult<bool> {
        let path = self.entry_path("files", experiment_id, file_name)?;
        Ok(fs::try_exists(&path).await?)
    }

    fn auto_save_default(&self) -> bool {
        self.auto_save
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis_result::AnalysisResult;
    use serde_json::json;

    #[tokio::test]
    async fn test_experiment_create_then_update() {
        let dir = tempfile::tempdir().unwrap();
        let service = LocalExperimentService::new(dir.path()).await.unwrap();

        let mut record = ExperimentRecord::new("exp-1", "T1");
        let ts = service.create_or_update_experiment(&record, true).await.unwrap();
        assert!(ts.created_at.is_some());

        // Second create is rejected, update keeps the creation time.
        assert!(matches!(
            service.create_or_update_experiment(&record, true).await,
            Err(ServiceError::AlreadyExists(_))
        ));
        record.notes = Some("re-run".into());
        let ts2 = service.create_or_update_experiment(&record, false).await.unwrap();
        assert_eq!(ts2.created_at, ts.created_at);

        let loaded = service.experiment("exp-1").await.unwrap();
        assert_eq!(loaded.notes.as_deref(), Some("re-run"));

        // Reopening reads the record back from disk.
        let reopened = LocalExperimentService::new(dir.path()).await.unwrap();
        assert_eq!(reopened.experiment_ids().await, vec!["exp-1".to_string()]);
    }

    #[tokio::test]
    async fn test_update_missing_experiment() {
        let dir = tempfile::tempdir().unwrap();
        let service = LocalExperimentService::new(dir.path()).await.unwrap();
        let record = ExperimentRecord::new("missing", "T1");
        assert!(matches!(
            service.create_or_update_experiment(&record, false).await,
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_figures_and_files() {
        let dir = tempfile::tempdir().unwrap();
        let service = LocalExperimentService::new(dir.path()).await.unwrap();

        service
            .create_figures("exp-1", &[("a.svg".into(), "<svg/>".into())], 2)
            .await
            .unwrap();
        assert_eq!(service.figure("exp-1", "a.svg").await.unwrap(), "<svg/>");
        service.delete_figure("exp-1", "a.svg").await.unwrap();
        assert!(matches!(
            service.delete_figure("exp-1", "a.svg").await,
            Err(ServiceError::NotFound(_))
        ));

        let mut content = Record::new();
        content.insert("big".into(), json!([1, 2, 3]));
        assert!(!service.experiment_has_file("exp-1", "metadata.json").await.unwrap());
        service.file_upload("exp-1", "metadata.json", &content).await.unwrap();
        assert!(service.experiment_has_file("exp-1", "metadata.json").await.unwrap());
        assert_eq!(service.file_download("exp-1", "metadata.json").await.unwrap(), content);
    }

    #[tokio::test]
    async fn test_bulk_analysis_results() {
        let dir = tempfile::tempdir().unwrap();
        let service = LocalExperimentService::new(dir.path()).await.unwrap();

        let records: Vec<AnalysisResultRecord> = (0..5)
            .map(|i| {
                let mut record = AnalysisResult::new(format!("T{i}"), json!(i)).record().clone();
                record.experiment_id = "exp-1".into();
                record
            })
            .collect();
        service.create_analysis_results(&records, 2).await.unwrap();

        let mut stored = service.analysis_results("exp-1").await.unwrap();
        stored.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(stored.len(), 5);
        assert_eq!(stored[3].value, json!(3));

        // Zero workers still uploads one at a time.
        service.create_analysis_results(&records[..1], 0).await.unwrap();
        assert!(service.analysis_results("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let service = LocalExperimentService::new(dir.path()).await.unwrap();
        assert!(matches!(
            service.figure("exp-1", "../secret").await,
            Err(ServiceError::Request(_))
        ));
    }
}
