//! Figures and analysis results.

use std::fmt;
use std::ops::{Range, RangeFull};
use std::path::Path;
use std::time::Duration;

use serde_json::Value;
use tracing::warn;

use super::{ExperimentData, lock};
use crate::analysis_result::AnalysisResult;
use crate::error::{ExpDataError, ExpDataResult};
use crate::figure::{FigureData, FigureInput, FigurePayload, canonical_figure_name};
use crate::result::Record;

/// A figure addressed by name or position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FigureKey {
    Index(usize),
    Name(String),
}

impl From<usize> for FigureKey {
    fn from(index: usize) -> Self {
        FigureKey::Index(index)
    }
}

impl From<&str> for FigureKey {
    fn from(name: &str) -> Self {
        FigureKey::Name(name.to_string())
    }
}

impl From<String> for FigureKey {
    fn from(name: String) -> Self {
        FigureKey::Name(name)
    }
}

/// An analysis result addressed by position, or by id then name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultKey {
    Index(usize),
    Key(String),
}

impl From<usize> for ResultKey {
    fn from(index: usize) -> Self {
        ResultKey::Index(index)
    }
}

impl From<&str> for ResultKey {
    fn from(key: &str) -> Self {
        ResultKey::Key(key.to_string())
    }
}

impl From<String> for ResultKey {
    fn from(key: String) -> Self {
        ResultKey::Key(key)
    }
}

impl fmt::Display for ResultKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultKey::Index(index) => write!(f, "at index {index}"),
            ResultKey::Key(key) => write!(f, "'{key}'"),
        }
    }
}

/// Selector for [`ExperimentData::analysis_results`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultIndex {
    All,
    Index(usize),
    Range(Range<usize>),
    /// Result id, or failing that, result name.
    Key(String),
}

impl From<RangeFull> for ResultIndex {
    fn from(_: RangeFull) -> Self {
        ResultIndex::All
    }
}

impl From<usize> for ResultIndex {
    fn from(index: usize) -> Self {
        ResultIndex::Index(index)
    }
}

impl From<Range<usize>> for ResultIndex {
    fn from(range: Range<usize>) -> Self {
        ResultIndex::Range(range)
    }
}

impl From<&str> for ResultIndex {
    fn from(key: &str) -> Self {
        ResultIndex::Key(key.to_string())
    }
}

impl From<String> for ResultIndex {
    fn from(key: String) -> Self {
        ResultIndex::Key(key)
    }
}

impl fmt::Display for ResultIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultIndex::All => f.write_str("(all)"),
            ResultIndex::Index(index) => write!(f, "at index {index}"),
            ResultIndex::Range(range) => write!(f, "in range {range:?}"),
            ResultIndex::Key(key) => write!(f, "'{key}'"),
        }
    }
}

/// Options for [`ExperimentData::analysis_results_with`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultQuery {
    /// Pull results from the service even if some are cached.
    pub refresh: bool,
    /// Wait for analysis tasks first.
    pub block: bool,
    pub timeout: Option<Duration>,
}

impl Default for ResultQuery {
    fn default() -> Self {
        Self {
            refresh: false,
            block: true,
            timeout: None,
        }
    }
}

impl ExperimentData {
    fn default_figure_name(&self) -> String {
        let short_id: String = self.experiment_id().chars().take(8).collect();
        format!(
            "{}_Fig-{}_Exp-{}.svg",
            self.experiment_type(),
            self.inner.figures.len(),
            short_id
        )
    }

    /// Add figures and return their names.
    ///
    /// `save_figure` defaults to the auto-save setting; when on, each figure
    /// is uploaded straight away.
    pub async fn add_figures(
        &self,
        figures: Vec<FigureInput>,
        names: Option<Vec<String>>,
        overwrite: bool,
        save_figure: Option<bool>,
    ) -> ExpDataResult<Vec<String>> {
        if let Some(names) = &names {
            if names.len() != figures.len() {
                return Err(ExpDataError::InvalidArgument(format!(
                    "figure names must match the number of figures ({} != {})",
                    names.len(),
                    figures.len()
                )));
            }
        }
        let save_figure = save_figure.unwrap_or_else(|| self.auto_save());
        let service = self.service();
        let mut names = names.map(Vec::into_iter);
        let mut added = Vec::with_capacity(figures.len());

        for input in figures {
            let explicit = names.as_mut().and_then(Iterator::next);
            let implied = match &input {
                FigureInput::Data(data) => Some(data.name.clone()),
                other => other.implied_name(),
            };
            let name = match explicit.or(implied) {
                Some(name) => canonical_figure_name(&name),
                None => self.default_figure_name(),
            };

            let (payload, metadata) = input.into_payload().await?;
            let metadata = metadata.unwrap_or_else(|| self.default_figure_metadata());
            let existing =
                self.store_figure(FigureData::new(payload, name.clone(), metadata), overwrite)?;

            if save_figure {
                if let Some(service) = &service {
                    let uploaded = match self.inner.figures.get(&name).map(|f| f.figure.to_svg()) {
                        Some(Ok(svg)) => service
                            .create_or_update_figure(self.experiment_id(), &svg, &name, !existing)
                            .await
                            .map_err(ExpDataError::from),
                        Some(Err(e)) => Err(e),
                        None => Ok(()),
                    };
                    if let Err(e) = uploaded {
                        warn!(
                            "Unable to save figure [Experiment ID: {}][Figure: {}]: {}",
                            self.experiment_id(),
                            name,
                            e
                        );
                    }
                }
            }
            added.push(name);
        }

        self.auto_save_metadata().await;
        Ok(added)
    }

    fn default_figure_metadata(&self) -> Record {
        let qubits = self
            .lock_record()
            .metadata
            .get("physical_qubits")
            .cloned()
            .unwrap_or(Value::Null);
        let mut metadata = Record::new();
        metadata.insert("qubits".to_string(), qubits);
        metadata
    }

    /// Insert a figure, returning whether it replaced an existing one.
    fn store_figure(&self, figure: FigureData, overwrite: bool) -> ExpDataResult<bool> {
        let name = figure.name.clone();
        let existing = {
            let mut figures = self.inner.figures.lock();
            let existing = figures.contains_key(&name);
            if existing && !overwrite {
                return Err(ExpDataError::EntryExists(format!(
                    "A figure with the name {name} for this experiment already exists. Specify overwrite to replace it."
                )));
            }
            figures.insert(name.clone(), figure);
            existing
        };
        let mut record = self.lock_record();
        if !record.figure_names.contains(&name) {
            record.figure_names.push(name);
        }
        Ok(existing)
    }

    fn figure_name(&self, key: FigureKey) -> ExpDataResult<String> {
        match key {
            FigureKey::Name(name) => Ok(name),
            FigureKey::Index(index) => self
                .inner
                .figures
                .get_index(index)
                .map(|(name, _)| name)
                .ok_or_else(|| ExpDataError::NotFound(format!("Figure index {index} not found."))),
        }
    }

    /// Remove a figure locally and queue its remote deletion.
    pub async fn delete_figure(&self, key: impl Into<FigureKey>) -> ExpDataResult<String> {
        let name = self.figure_name(key.into())?;
        if self.inner.figures.remove(&name).is_none() {
            return Err(ExpDataError::NotFound(format!("Figure {name} not found.")));
        }
        self.lock_record().figure_names.retain(|n| n != &name);
        lock(&self.inner.deleted_figures).push_back(name.clone());

        if self.auto_save() {
            if let Some(service) = self.service() {
                let _ = self.delete_queued_figure(&service, &name, true).await;
            }
            self.save_metadata().await;
        }
        Ok(name)
    }

    /// A figure, fetched from the service and cached if it is not local.
    pub async fn figure(&self, key: impl Into<FigureKey>) -> ExpDataResult<FigureData> {
        let name = self.figure_name(key.into())?;
        if let Some(figure) = self.inner.figures.get(&name) {
            return Ok(figure);
        }
        let Some(service) = self.service() else {
            return Err(ExpDataError::NotFound(format!("Figure {name} not found.")));
        };
        let svg = service
            .figure(self.experiment_id(), &name)
            .await
            .map_err(|e| ExpDataError::NotFound(format!("Figure {name} not found: {e}")))?;
        let figure = FigureData::new(FigurePayload::Svg(svg), name.clone(), Record::new());
        self.inner.figures.insert(name, figure.clone());
        Ok(figure)
    }

    /// Write a figure as SVG to `path`, returning the number of bytes written.
    pub async fn write_figure(
        &self,
        key: impl Into<FigureKey>,
        path: impl AsRef<Path>,
    ) -> ExpDataResult<usize> {
        let svg = self.figure(key).await?.figure.to_svg()?;
        tokio::fs::write(path.as_ref(), svg.as_bytes()).await?;
        Ok(svg.len())
    }

    pub fn figures(&self) -> Vec<FigureData> {
        self.inner.figures.values()
    }

    /// Attach results to this container. Returns the ids of the new entries.
    pub(crate) fn attach_results(&self, results: Vec<AnalysisResult>) -> Vec<String> {
        let service = self.service();
        let auto_save = self.auto_save();
        let mut map = self.inner.analysis_results.lock();
        results
            .into_iter()
            .map(|mut result| {
                result.set_experiment_id(self.experiment_id());
                result.set_service(service.clone());
                result.set_auto_save(auto_save);
                let id = result.result_id().to_string();
                map.insert(id.clone(), result);
                id
            })
            .collect()
    }

    /// Add analysis results, saving each one when auto-save is on.
    pub async fn add_analysis_results(&self, results: Vec<AnalysisResult>) {
        let ids = self.attach_results(results);
        if !self.auto_save() || self.service().is_none() {
            return;
        }
        for id in ids {
            let Some(mut result) = self.inner.analysis_results.get(&id) else {
                continue;
            };
            match result.save().await {
                Ok(true) => {
                    if let Some(stored) = self.inner.analysis_results.lock().get_mut(&id) {
                        stored.mark_created();
                    }
                }
                Ok(false) => {}
                Err(e) => warn!(
                    "Unable to save analysis result [Experiment ID: {}][Result ID: {}]: {}",
                    self.experiment_id(),
                    id,
                    e
                ),
            }
        }
        self.save_metadata().await;
    }

    fn result_ids(&self, key: ResultKey) -> Vec<String> {
        let map = self.inner.analysis_results.lock();
        match key {
            ResultKey::Index(index) => map
                .get_index(index)
                .map(|(id, _)| vec![id.clone()])
                .unwrap_or_default(),
            ResultKey::Key(key) if map.contains_key(&key) => vec![key],
            ResultKey::Key(key) => map
                .iter()
                .filter(|(_, result)| result.name() == key)
                .map(|(id, _)| id.clone())
                .collect(),
        }
    }

    /// Remove analysis results by id, name or position and queue their
    /// remote deletion. A name removes every result with that name.
    pub async fn delete_analysis_result(
        &self,
        key: impl Into<ResultKey>,
    ) -> ExpDataResult<Vec<String>> {
        let key = key.into();
        let ids = self.result_ids(key.clone());
        if ids.is_empty() {
            return Err(ExpDataError::NotFound(format!(
                "Analysis result {key} not found."
            )));
        }
        {
            let mut map = self.inner.analysis_results.lock();
            let mut queue = lock(&self.inner.deleted_analysis_results);
            for id in &ids {
                map.remove(id);
                queue.push_back(id.clone());
            }
        }

        if self.auto_save() {
            if let Some(service) = self.service() {
                for id in &ids {
                    let _ = self.delete_queued_analysis_result(&service, id, true).await;
                }
            }
            self.save_metadata().await;
        }
        Ok(ids)
    }

    /// Replace cached analysis results with the ones stored on the service.
    pub async fn retrieve_analysis_results(&self, refresh: bool) -> ExpDataResult<()> {
        let Some(service) = self.service() else {
            return Ok(());
        };
        if !refresh && !self.inner.analysis_results.is_empty() {
            return Ok(());
        }
        let records = service.analysis_results(self.experiment_id()).await?;
        let auto_save = self.auto_save();
        let mut map = self.inner.analysis_results.lock();
        map.clear();
        for record in records {
            let mut result = AnalysisResult::from_record(record);
            result.set_service(Some(service.clone()));
            result.set_auto_save(auto_save);
            result.mark_created();
            map.insert(result.result_id().to_string(), result);
        }
        Ok(())
    }

    /// Analysis results, waiting for analysis to finish first.
    pub async fn analysis_results(
        &self,
        index: impl Into<ResultIndex>,
    ) -> ExpDataResult<Vec<AnalysisResult>> {
        self.analysis_results_with(index, ResultQuery::default())
            .await
    }

    pub async fn analysis_results_with(
        &self,
        index: impl Into<ResultIndex>,
        query: ResultQuery,
    ) -> ExpDataResult<Vec<AnalysisResult>> {
        if query.block {
            self.wait_for_analysis(query.timeout).await;
        }
        if let Err(e) = self.retrieve_analysis_results(query.refresh).await {
            warn!(
                "Unable to retrieve analysis results [Experiment ID: {}]: {}",
                self.experiment_id(),
                e
            );
        }

        let index = index.into();
        if let Some(found) = self.select_results(&index) {
            return Ok(found);
        }
        let mut message = format!("Analysis result {index} not found.");
        let errors = self.errors().await;
        if !errors.is_empty() {
            message.push_str(&format!(" Errors: {errors}"));
        }
        Err(ExpDataError::NotFound(message))
    }

    fn select_results(&self, index: &ResultIndex) -> Option<Vec<AnalysisResult>> {
        let map = self.inner.analysis_results.lock();
        match index {
            ResultIndex::All => Some(map.values().cloned().collect()),
            ResultIndex::Index(index) => map.get_index(*index).map(|(_, r)| vec![r.clone()]),
            ResultIndex::Range(range) => {
                if range.start > range.end || range.end > map.len() {
                    return None;
                }
                Some(
                    map.values()
                        .skip(range.start)
                        .take(range.end - range.start)
                        .cloned()
                        .collect(),
                )
            }
            ResultIndex::Key(key) => {
                if let Some(result) = map.get(key) {
                    return Some(vec![result.clone()]);
                }
                let by_name: Vec<AnalysisResult> = map
                    .values()
                    .filter(|result| result.name() == key)
                    .cloned()
                    .collect();
                (!by_name.is_empty()).then_some(by_name)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_default_figure_names() {
        let exp = ExperimentData::builder()
            .experiment_type("T1")
            .experiment_id("0123456789abcdef")
            .build()
            .unwrap();
        let names = exp
            .add_figures(
                vec![FigureInput::Svg("<svg/>".into()), FigureInput::Svg("<svg/>".into())],
                None,
                false,
                None,
            )
            .await
            .unwrap();
        assert_eq!(names, vec!["T1_Fig-0_Exp-01234567.svg", "T1_Fig-1_Exp-01234567.svg"]);
        assert_eq!(exp.figure_names(), names);
    }

    #[tokio::test]
    async fn test_figure_name_conflicts() {
        let exp = ExperimentData::builder().build().unwrap();
        let svg = || vec![FigureInput::Svg("<svg/>".into())];
        exp.add_figures(svg(), Some(vec!["fit".into()]), false, None)
            .await
            .unwrap();
        let err = exp
            .add_figures(svg(), Some(vec!["fit.svg".into()]), false, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ExpDataError::EntryExists(_)));

        exp.add_figures(svg(), Some(vec!["fit.svg".into()]), true, None)
            .await
            .unwrap();
        assert_eq!(exp.figure_names(), vec!["fit.svg".to_string()]);

        let err = exp
            .add_figures(svg(), Some(vec![]), false, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ExpDataError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_figure_metadata_and_delete() {
        let mut metadata = Record::new();
        metadata.insert("physical_qubits".into(), json!([0, 3]));
        let exp = ExperimentData::builder().metadata(metadata).build().unwrap();
        exp.add_figures(
            vec![FigureInput::Svg("<svg/>".into())],
            Some(vec!["a".into()]),
            false,
            None,
        )
        .await
        .unwrap();

        let figure = exp.figure(0usize).await.unwrap();
        assert_eq!(figure.name, "a.svg");
        assert_eq!(figure.metadata["qubits"], json!([0, 3]));

        assert_eq!(exp.delete_figure("a.svg").await.unwrap(), "a.svg");
        assert!(exp.figure_names().is_empty());
        assert!(matches!(exp.figure("a.svg").await, Err(ExpDataError::NotFound(_))));
        assert!(matches!(exp.delete_figure("a.svg").await, Err(ExpDataError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_analysis_result_lookup() {
        let exp = ExperimentData::builder().experiment_id("exp-1").build().unwrap();
        let t1 = AnalysisResult::new("T1", json!(30e-6));
        let t1_id = t1.result_id().to_string();
        exp.add_analysis_results(vec![t1, AnalysisResult::new("T2", json!(20e-6))])
            .await;

        let by_id = exp.analysis_results(t1_id.as_str()).await.unwrap();
        assert_eq!(by_id[0].experiment_id(), "exp-1");
        assert_eq!(exp.analysis_results("T2").await.unwrap()[0].name(), "T2");
        assert_eq!(exp.analysis_results(..).await.unwrap().len(), 2);
        assert_eq!(exp.analysis_results(1usize..2).await.unwrap()[0].name(), "T2");
        assert!(matches!(
            exp.analysis_results("missing").await,
            Err(ExpDataError::NotFound(_))
        ));

        assert_eq!(exp.delete_analysis_result("T1").await.unwrap(), vec![t1_id]);
        assert_eq!(exp.analysis_results(..).await.unwrap().len(), 1);
    }
}
