//! Derived analysis results.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ServiceResult;
use crate::result::Record;
use crate::service::ExperimentService;

/// Quality verdict attached to an analysis result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultQuality {
    Good,
    Bad,
    #[default]
    Unknown,
}

/// Database record of an analysis result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResultRecord {
    pub result_id: String,
    pub experiment_id: String,
    /// Result type, e.g. `"T1"`.
    pub name: String,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chisq: Option<f64>,
    #[serde(default)]
    pub quality: ResultQuality,
    #[serde(default)]
    pub device_components: Vec<String>,
    #[serde(default)]
    pub verified: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_name: Option<String>,
    #[serde(default)]
    pub extra: Record,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_datetime: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_datetime: Option<DateTime<Utc>>,
}

/// A named derived value produced by an analysis callback.
#[derive(Clone)]
pub struct AnalysisResult {
    record: AnalysisResultRecord,
    service: Option<Arc<dyn ExperimentService>>,
    auto_save: bool,
    created_in_db: bool,
}

impl AnalysisResult {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self::from_record(AnalysisResultRecord {
            result_id: Uuid::new_v4().to_string(),
            experiment_id: String::new(),
            name: name.into(),
            value,
            chisq: None,
            quality: ResultQuality::Unknown,
            device_components: Vec::new(),
            verified: false,
            tags: Vec::new(),
            backend_name: None,
            extra: Record::new(),
            creation_datetime: None,
            updated_datetime: None,
        })
    }

    pub fn from_record(record: AnalysisResultRecord) -> Self {
        Self {
            record,
            service: None,
            auto_save: false,
            created_in_db: false,
        }
    }

    pub fn with_chisq(mut self, chisq: f64) -> Self {
        self.record.chisq = Some(chisq);
        self
    }

    pub fn with_quality(mut self, quality: ResultQuality) -> Self {
        self.record.quality = quality;
        self
    }

    pub fn with_device_components(mut self, components: Vec<String>) -> Self {
        self.record.device_components = components;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.record.tags = tags;
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.record.extra.insert(key.into(), value);
        self
    }

    pub fn result_id(&self) -> &str {
        &self.record.result_id
    }

    pub fn experiment_id(&self) -> &str {
        &self.record.experiment_id
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn value(&self) -> &Value {
        &self.record.value
    }

    pub fn quality(&self) -> ResultQuality {
        self.record.quality
    }

    pub fn chisq(&self) -> Option<f64> {
        self.record.chisq
    }

    pub fn tags(&self) -> &[String] {
        &self.record.tags
    }

    pub fn record(&self) -> &AnalysisResultRecord {
        &self.record
    }

    pub fn auto_save(&self) -> bool {
        self.auto_save
    }

    pub fn created_in_db(&self) -> bool {
        self.created_in_db
    }

    /// Identical result under a fresh id, not yet saved anywhere.
    pub fn copy(&self) -> Self {
        let mut copy = self.clone();
        copy.record.result_id = Uuid::new_v4().to_string();
        copy.record.creation_datetime = None;
        copy.record.updated_datetime = None;
        copy.created_in_db = false;
        copy
    }

    pub(crate) fn set_experiment_id(&mut self, experiment_id: &str) {
        self.record.experiment_id = experiment_id.to_string();
    }

    pub(crate) fn set_service(&mut self, service: Option<Arc<dyn ExperimentService>>) {
        self.service = service;
    }

    pub(crate) fn set_auto_save(&mut self, auto_save: bool) {
        self.auto_save = auto_save;
    }

    pub(crate) fn mark_created(&mut self) {
        self.created_in_db = true;
    }

    /// Create or update this result on its service.
    ///
    /// Returns `Ok(false)` when no service is attached.
    pub async fn save(&mut self) -> ServiceResult<bool> {
        let Some(service) = self.service.clone() else {
            tracing::warn!(
                "Analysis result cannot be saved because no experiment service is available [Result ID: {}]",
                self.record.result_id
            );
            return Ok(false);
        };
        service
            .create_or_update_analysis_result(&self.record, !self.created_in_db)
            .await?;
        self.created_in_db = true;
        Ok(true)
    }
}

impl fmt::Debug for AnalysisResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalysisResult")
            .field("name", &self.record.name)
            .field("value", &self.record.value)
            .field("quality", &self.record.quality)
            .field("result_id", &self.record.result_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builder_and_accessors() {
        let result = AnalysisResult::new("T1", json!(42.5e-6))
            .with_chisq(1.2)
            .with_quality(ResultQuality::Good)
            .with_device_components(vec!["Q0".into()])
            .with_tags(vec!["calibration".into()]);

        assert_eq!(result.name(), "T1");
        assert_eq!(result.chisq(), Some(1.2));
        assert_eq!(result.quality(), ResultQuality::Good);
        assert_eq!(result.tags(), ["calibration".to_string()]);
        assert!(!result.created_in_db());
    }

    #[test]
    fn test_copy_gets_new_id() {
        let mut original = AnalysisResult::new("T2", json!(1.0));
        original.mark_created();
        let copy = original.copy();
        assert_ne!(copy.result_id(), original.result_id());
        assert_eq!(copy.name(), original.name());
        assert!(!copy.created_in_db());
    }

    #[test]
    fn test_quality_serde() {
        assert_eq!(serde_json::to_string(&ResultQuality::Bad).unwrap(), "\"bad\"");
        let record: AnalysisResultRecord = serde_json::from_value(json!({
            "result_id": "r1",
            "experiment_id": "e1",
            "name": "fit",
            "value": [1, 2],
        }))
        .unwrap();
        assert_eq!(record.quality, ResultQuality::Unknown);
        assert!(record.tags.is_empty());
    }

    #[tokio::test]
    async fn test_save_without_service() {
        let mut result = AnalysisResult::new("T1", json!(1));
        assert!(!result.save().await.unwrap());
        assert!(!result.created_in_db());
    }
}
