//! Analysis callback descriptors.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::result::Record;

/// Keyword arguments handed to an analysis callback.
pub type CallbackKwargs = Record;

/// Lifecycle state of an analysis callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnalysisStatus {
    Queued,
    Running,
    Cancelled,
    Done,
    Error,
}

impl AnalysisStatus {
    /// Aggregation order, worst first. `Done` is the fallback.
    pub const PRECEDENCE: [AnalysisStatus; 4] = [
        AnalysisStatus::Error,
        AnalysisStatus::Cancelled,
        AnalysisStatus::Running,
        AnalysisStatus::Queued,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AnalysisStatus::Done | AnalysisStatus::Cancelled | AnalysisStatus::Error
        )
    }

    pub fn description(self) -> &'static str {
        match self {
            AnalysisStatus::Queued => "analysis callback is queued",
            AnalysisStatus::Running => "analysis callback is actively running",
            AnalysisStatus::Cancelled => "analysis callback has been cancelled",
            AnalysisStatus::Done => "analysis callback has successfully run",
            AnalysisStatus::Error => "analysis callback incurred an error",
        }
    }

    pub fn aggregate<I: IntoIterator<Item = AnalysisStatus>>(statuses: I) -> AnalysisStatus {
        let seen: Vec<AnalysisStatus> = statuses.into_iter().collect();
        Self::PRECEDENCE
            .into_iter()
            .find(|s| seen.contains(s))
            .unwrap_or(AnalysisStatus::Done)
    }
}

impl fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AnalysisStatus::Queued => "QUEUED",
            AnalysisStatus::Running => "RUNNING",
            AnalysisStatus::Cancelled => "CANCELLED",
            AnalysisStatus::Done => "DONE",
            AnalysisStatus::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Status record of one submitted analysis callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisCallback {
    pub name: String,
    pub callback_id: String,
    pub status: AnalysisStatus,
    #[serde(default)]
    pub error_msg: Option<String>,
    /// Fired to cancel the callback before it starts.
    #[serde(skip, default)]
    pub(crate) cancel: CancellationToken,
}

impl AnalysisCallback {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            callback_id: Uuid::new_v4().simple().to_string(),
            status: AnalysisStatus::Queued,
            error_msg: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
