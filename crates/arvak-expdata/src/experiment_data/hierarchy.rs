//! Parent/child composition and the setters that apply to a whole tree.

use std::ops::{Range, RangeFull};
use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use super::{ExperimentData, lock, normalize_tags};
use crate::error::{ExpDataError, ExpDataResult};
use crate::job::Backend;
use crate::service::ExperimentService;

/// Selector for [`ExperimentData::child_data`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildIndex {
    All,
    Index(usize),
    Range(Range<usize>),
    /// Child experiment id.
    Id(String),
}

impl From<RangeFull> for ChildIndex {
    fn from(_: RangeFull) -> Self {
        ChildIndex::All
    }
}

impl From<usize> for ChildIndex {
    fn from(index: usize) -> Self {
        ChildIndex::Index(index)
    }
}

impl From<Range<usize>> for ChildIndex {
    fn from(range: Range<usize>) -> Self {
        ChildIndex::Range(range)
    }
}

impl From<&str> for ChildIndex {
    fn from(id: &str) -> Self {
        ChildIndex::Id(id.to_string())
    }
}

impl From<String> for ChildIndex {
    fn from(id: String) -> Self {
        ChildIndex::Id(id)
    }
}

impl ExperimentData {
    /// Attach a child experiment. The child's `parent_id` is set to this
    /// experiment and its id is recorded in `metadata.child_data_ids`.
    pub fn add_child_data(&self, child: ExperimentData) {
        if Arc::ptr_eq(&self.inner, &child.inner) {
            warn!(
                "Refusing to add an experiment as its own child [Experiment ID: {}]",
                self.experiment_id()
            );
            return;
        }
        child.set_parent_id(Some(self.experiment_id().to_string()));
        if child.service().is_none() {
            if let Some(service) = self.service() {
                child.assign_service(&service);
            }
        }

        let mut children = self.inner.child_data.lock();
        children.insert(child.experiment_id().to_string(), child);
        let ids = children
            .keys()
            .map(|id| Value::String(id.clone()))
            .collect();
        self.lock_record()
            .metadata
            .insert("child_data_ids".to_string(), Value::Array(ids));
    }

    /// Child experiments by position, range or id.
    pub fn child_data(&self, index: impl Into<ChildIndex>) -> ExpDataResult<Vec<ExperimentData>> {
        let children = self.inner.child_data.lock();
        let found = match index.into() {
            ChildIndex::All => Some(children.values().cloned().collect()),
            ChildIndex::Index(index) => children.get_index(index).map(|(_, c)| vec![c.clone()]),
            ChildIndex::Range(range) if range.start <= range.end && range.end <= children.len() => {
                Some(
                    children
                        .values()
                        .skip(range.start)
                        .take(range.end - range.start)
                        .cloned()
                        .collect(),
                )
            }
            ChildIndex::Range(_) => None,
            ChildIndex::Id(id) => children.get(&id).map(|c| vec![c.clone()]),
        };
        found.ok_or_else(|| {
            ExpDataError::NotFound(format!(
                "Child experiment data not found [Experiment ID: {}]",
                self.experiment_id()
            ))
        })
    }

    pub fn child_count(&self) -> usize {
        self.inner.child_data.len()
    }

    /// Record the backend, its name and the provider's hub/group/project,
    /// here and in every child. Provider and service are taken from the
    /// backend when none is set.
    pub(crate) fn assign_backend(&self, backend: Arc<dyn Backend>) {
        let name = backend.name().to_string();
        let provider = self.provider().or_else(|| backend.provider());
        let instance = provider.as_ref().and_then(|p| p.instance(&name));
        {
            let mut db = self.lock_record();
            db.backend = Some(name);
            if let Some(instance) = instance {
                db.hub = instance.hub;
                db.group = instance.group;
                db.project = instance.project;
            }
        }
        *lock(&self.inner.backend) = Some(Arc::clone(&backend));

        if let Some(provider) = provider {
            lock(&self.inner.provider).get_or_insert_with(|| Arc::clone(&provider));
            if self.service().is_none() {
                if let Some(service) = provider.experiment_service() {
                    self.assign_service(&service);
                }
            }
        }

        for child in self.inner.child_data.values() {
            child.assign_backend(Arc::clone(&backend));
        }
    }

    pub(crate) fn assign_service(&self, service: &Arc<dyn ExperimentService>) {
        *lock(&self.inner.service) = Some(Arc::clone(service));
        {
            let mut results = self.inner.analysis_results.lock();
            for result in results.values_mut() {
                result.set_service(Some(Arc::clone(service)));
            }
        }
        for child in self.inner.child_data.values() {
            child.assign_service(service);
        }
    }

    /// Attach an experiment service to this tree and apply its auto-save default.
    pub async fn set_service(
        &self,
        service: Arc<dyn ExperimentService>,
        replace: bool,
    ) -> ExpDataResult<()> {
        if self.service().is_some() && !replace {
            return Err(ExpDataError::ServiceAlreadySet);
        }
        self.assign_service(&service);
        self.set_auto_save(service.auto_save_default()).await;
        Ok(())
    }

    /// Set the backend of this experiment and every child.
    pub async fn set_backend(&self, backend: Arc<dyn Backend>) {
        self.assign_backend(backend);
        self.auto_save_metadata().await;
    }

    fn apply_share_level(&self, share_level: &str) {
        self.lock_record().share_level = Some(share_level.to_string());
        for child in self.inner.child_data.values() {
            child.apply_share_level(share_level);
        }
    }

    /// Set the share level of this experiment and every child.
    pub async fn set_share_level(&self, share_level: impl Into<String>) {
        self.apply_share_level(&share_level.into());
        self.auto_save_metadata().await;
    }

    /// Replace the tags. Stored sorted, without duplicates.
    pub async fn set_tags<I, S>(&self, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lock_record().tags = normalize_tags(tags.into_iter().map(Into::into));
        self.auto_save_metadata().await;
    }

    fn apply_tags(&self, add: &[String], remove: &[String]) {
        {
            let mut db = self.lock_record();
            let tags = std::mem::take(&mut db.tags);
            db.tags = normalize_tags(
                tags.into_iter()
                    .chain(add.iter().cloned())
                    .filter(|tag| !remove.contains(tag)),
            );
        }
        for child in self.inner.child_data.values() {
            child.apply_tags(add, remove);
        }
    }

    /// Add tags to this experiment and every child.
    pub async fn add_tags_recursive(&self, tags: &[String]) {
        self.apply_tags(tags, &[]);
        self.auto_save_metadata().await;
    }

    /// Remove tags from this experiment and every child.
    pub async fn remove_tags_recursive(&self, tags: &[String]) {
        self.apply_tags(&[], tags);
        self.auto_save_metadata().await;
    }

    pub async fn set_notes(&self, notes: impl Into<String>) {
        self.lock_record().notes = Some(notes.into());
        self.auto_save_metadata().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JobError;
    use crate::job::{Provider, ProviderInstance, RemoteJob};
    use crate::service::LocalExperimentService;
    use async_trait::async_trait;

    struct Instanced;

    #[async_trait]
    impl Provider for Instanced {
        async fn retrieve_job(&self, job_id: &str) -> Result<Arc<dyn RemoteJob>, JobError> {
            Err(JobError::NotFound(job_id.to_string()))
        }

        fn instance(&self, _backend_name: &str) -> Option<ProviderInstance> {
            Some(ProviderInstance {
                hub: Some("hub".into()),
                group: Some("group".into()),
                project: Some("project".into()),
            })
        }
    }

    struct Device;

    impl Backend for Device {
        fn name(&self) -> &str {
            "device_a"
        }

        fn provider(&self) -> Option<Arc<dyn Provider>> {
            Some(Arc::new(Instanced))
        }
    }

    fn family() -> (ExperimentData, ExperimentData, ExperimentData) {
        let first = ExperimentData::builder().experiment_type("T1").build().unwrap();
        let second = ExperimentData::builder().experiment_type("T2").build().unwrap();
        let parent = ExperimentData::builder()
            .experiment_type("Batch")
            .tags(["batch"])
            .child_data(vec![first.clone(), second.clone()])
            .build()
            .unwrap();
        (parent, first, second)
    }

    #[tokio::test]
    async fn test_children_record_parent() {
        let (parent, first, second) = family();
        assert_eq!(first.parent_id().as_deref(), Some(parent.experiment_id()));
        assert_eq!(parent.child_count(), 2);

        let ids = parent.metadata()["child_data_ids"].clone();
        assert_eq!(
            ids,
            serde_json::json!([first.experiment_id(), second.experiment_id()])
        );

        parent.add_child_data(parent.clone());
        assert_eq!(parent.child_count(), 2);
    }

    #[tokio::test]
    async fn test_child_lookup() {
        let (parent, first, second) = family();
        assert_eq!(parent.child_data(..).unwrap().len(), 2);
        assert_eq!(
            parent.child_data(1usize).unwrap()[0].experiment_id(),
            second.experiment_id()
        );
        assert_eq!(
            parent.child_data(first.experiment_id()).unwrap()[0].experiment_type(),
            "T1"
        );
        assert_eq!(parent.child_data(0usize..2).unwrap().len(), 2);
        assert!(matches!(
            parent.child_data(5usize),
            Err(ExpDataError::NotFound(_))
        ));
        assert!(parent.child_data(1usize..3).is_err());
    }

    #[tokio::test]
    async fn test_recursive_tags_and_share_level() {
        let (parent, first, _) = family();
        parent
            .add_tags_recursive(&["calibration".to_string(), "batch".to_string()])
            .await;
        assert_eq!(parent.tags(), vec!["batch", "calibration"]);
        assert_eq!(first.tags(), vec!["batch", "calibration"]);

        parent.remove_tags_recursive(&["batch".to_string()]).await;
        assert_eq!(parent.tags(), vec!["calibration"]);
        assert_eq!(first.tags(), vec!["calibration"]);

        parent.set_share_level("project").await;
        assert_eq!(first.share_level().as_deref(), Some("project"));

        parent.set_notes("parent only").await;
        assert!(first.notes().is_none());
    }

    #[tokio::test]
    async fn test_backend_reaches_children() {
        let (parent, first, second) = family();
        parent.set_backend(Arc::new(Device)).await;

        for exp in [&parent, &first, &second] {
            let record = exp.record();
            assert_eq!(record.backend.as_deref(), Some("device_a"));
            assert_eq!(record.hub.as_deref(), Some("hub"));
            assert_eq!(record.project.as_deref(), Some("project"));
            assert!(exp.provider().is_some());
        }
    }

    #[tokio::test]
    async fn test_service_is_not_replaced_silently() {
        let dir = tempfile::tempdir().unwrap();
        let service: Arc<dyn ExperimentService> =
            Arc::new(LocalExperimentService::new(dir.path()).await.unwrap());
        let (parent, first, _) = family();

        parent.set_service(Arc::clone(&service), false).await.unwrap();
        assert!(first.service().is_some());
        assert!(matches!(
            parent.set_service(Arc::clone(&service), false).await,
            Err(ExpDataError::ServiceAlreadySet)
        ));
        assert!(parent.set_service(service, true).await.is_ok());
    }
}
