//! Figures attached to an experiment.
//!
//! The canonical figure format is SVG. Plot objects are rendered lazily, when
//! a figure is saved, serialized, or written to disk.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{ExpDataError, ExpDataResult};
use crate::result::Record;

/// Canonical figure name suffix.
pub const FIGURE_SUFFIX: &str = ".svg";

/// A plot object that can render itself as SVG.
pub trait PlotFigure: Send + Sync {
    fn to_svg(&self) -> ExpDataResult<String>;
}

/// Figure content.
#[derive(Clone)]
pub enum FigurePayload {
    Svg(String),
    Plot(Arc<dyn PlotFigure>),
}

impl FigurePayload {
    /// Render to the canonical SVG text.
    pub fn to_svg(&self) -> ExpDataResult<String> {
        match self {
            FigurePayload::Svg(svg) => Ok(svg.clone()),
            FigurePayload::Plot(plot) => plot.to_svg(),
        }
    }
}

impl fmt::Debug for FigurePayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FigurePayload::Svg(svg) => write!(f, "Svg({} bytes)", svg.len()),
            FigurePayload::Plot(_) => f.write_str("Plot"),
        }
    }
}

/// A named figure plus its metadata.
#[derive(Debug, Clone)]
pub struct FigureData {
    pub figure: FigurePayload,
    pub name: String,
    pub metadata: Record,
}

impl FigureData {
    pub fn new(figure: FigurePayload, name: impl Into<String>, metadata: Record) -> Self {
        Self {
            figure,
            name: name.into(),
            metadata,
        }
    }

    /// Same figure under a different name.
    pub fn copy(&self, new_name: Option<&str>) -> Self {
        let mut copy = self.clone();
        if let Some(name) = new_name {
            copy.name = name.to_string();
        }
        copy
    }

    /// Canonical (SVG-rendered) form, used for persistence and serialization.
    pub fn to_stored(&self) -> ExpDataResult<StoredFigure> {
        Ok(StoredFigure {
            name: self.name.clone(),
            metadata: self.metadata.clone(),
            svg: self.figure.to_svg()?,
        })
    }
}

/// Serializable figure in canonical form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredFigure {
    pub name: String,
    #[serde(default)]
    pub metadata: Record,
    pub svg: String,
}

impl From<StoredFigure> for FigureData {
    fn from(stored: StoredFigure) -> Self {
        FigureData::new(FigurePayload::Svg(stored.svg), stored.name, stored.metadata)
    }
}

/// Input accepted by `ExperimentData::add_figures`.
#[derive(Debug, Clone)]
pub enum FigureInput {
    /// Path to an SVG file; its file name is the default figure name.
    Path(PathBuf),
    Svg(String),
    Plot(Arc<dyn PlotFigure>),
    /// An already wrapped figure, e.g. one taken from a child experiment.
    Data(FigureData),
}

impl fmt::Debug for dyn PlotFigure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PlotFigure")
    }
}

impl From<FigureData> for FigureInput {
    fn from(data: FigureData) -> Self {
        FigureInput::Data(data)
    }
}

impl FigureInput {
    /// Name implied by the input itself.
    pub(crate) fn implied_name(&self) -> Option<String> {
        match self {
            FigureInput::Path(path) => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned()),
            _ => None,
        }
    }

    pub(crate) async fn into_payload(self) -> ExpDataResult<(FigurePayload, Option<Record>)> {
        match self {
            FigureInput::Path(path) => {
                let svg = tokio::fs::read_to_string(&path).await.map_err(|e| {
                    ExpDataError::Figure(format!("cannot read {}: {e}", path.display()))
                })?;
                Ok((FigurePayload::Svg(svg), None))
            }
            FigureInput::Svg(svg) => Ok((FigurePayload::Svg(svg), None)),
            FigureInput::Plot(plot) => Ok((FigurePayload::Plot(plot), None)),
            FigureInput::Data(data) => Ok((data.figure, Some(data.metadata))),
        }
    }
}

/// Append the canonical suffix if it is missing.
pub fn canonical_figure_name(name: &str) -> String {
    if name.ends_with(FIGURE_SUFFIX) {
        name.to_string()
    } else {
        tracing::info!(
            "File name {} does not have an SVG extension. A '{}' is added.",
            name,
            FIGURE_SUFFIX
        );
        format!("{name}{FIGURE_SUFFIX}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Circle;

    impl PlotFigure for Circle {
        fn to_svg(&self) -> ExpDataResult<String> {
            Ok("<svg><circle r=\"1\"/></svg>".to_string())
        }
    }

    #[test]
    fn test_canonical_name() {
        assert_eq!(canonical_figure_name("plot"), "plot.svg");
        assert_eq!(canonical_figure_name("plot.svg"), "plot.svg");
        assert_eq!(canonical_figure_name("plot.png"), "plot.png.svg");
    }

    #[test]
    fn test_plot_renders_to_stored_svg() {
        let fig = FigureData::new(FigurePayload::Plot(Arc::new(Circle)), "c.svg", Record::new());
        let stored = fig.to_stored().unwrap();
        assert_eq!(stored.svg, "<svg><circle r=\"1\"/></svg>");

        let back = FigureData::from(stored.clone());
        assert_eq!(back.to_stored().unwrap(), stored);
    }

    #[test]
    fn test_copy_renames() {
        let fig = FigureData::new(FigurePayload::Svg("<svg/>".into()), "a.svg", Record::new());
        assert_eq!(fig.copy(Some("b.svg")).name, "b.svg");
        assert_eq!(fig.copy(None).name, "a.svg");
    }

    #[test]
    fn test_implied_name_from_path() {
        let input = FigureInput::Path(PathBuf::from("/tmp/plots/t1_fit.svg"));
        assert_eq!(input.implied_name().as_deref(), Some("t1_fit.svg"));
        assert!(FigureInput::Svg("<svg/>".into()).implied_name().is_none());
    }
}
