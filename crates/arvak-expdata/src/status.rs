//! Coarse-grained experiment status.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::callback::AnalysisStatus;
use crate::job::JobStatus;

/// Aggregate status of an experiment's jobs and analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExperimentStatus {
    Empty,
    Initializing,
    Validating,
    Queued,
    Running,
    Cancelled,
    PostProcessing,
    Done,
    Error,
}

impl ExperimentStatus {
    pub fn description(self) -> &'static str {
        match self {
            ExperimentStatus::Empty => "experiment data is empty",
            ExperimentStatus::Initializing => "experiment jobs are being initialized",
            ExperimentStatus::Validating => "experiment jobs are validating",
            ExperimentStatus::Queued => "experiment jobs are queued",
            ExperimentStatus::Running => "experiment jobs is actively running",
            ExperimentStatus::Cancelled => "experiment jobs or analysis has been cancelled",
            ExperimentStatus::PostProcessing => "experiment analysis is actively running",
            ExperimentStatus::Done => "experiment jobs and analysis have successfully run",
            ExperimentStatus::Error => "experiment jobs or analysis incurred an error",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ExperimentStatus::Empty => "EMPTY",
            ExperimentStatus::Initializing => "INITIALIZING",
            ExperimentStatus::Validating => "VALIDATING",
            ExperimentStatus::Queued => "QUEUED",
            ExperimentStatus::Running => "RUNNING",
            ExperimentStatus::Cancelled => "CANCELLED",
            ExperimentStatus::PostProcessing => "POST_PROCESSING",
            ExperimentStatus::Done => "DONE",
            ExperimentStatus::Error => "ERROR",
        }
    }

    /// Combine the aggregate job and analysis states of a non-empty experiment.
    pub fn from_parts(job: JobStatus, analysis: AnalysisStatus) -> Self {
        match job {
            JobStatus::Initializing => return ExperimentStatus::Initializing,
            JobStatus::Queued => return ExperimentStatus::Queued,
            JobStatus::Validating => return ExperimentStatus::Validating,
            JobStatus::Running => return ExperimentStatus::Running,
            JobStatus::Cancelled => return ExperimentStatus::Cancelled,
            JobStatus::Error => return ExperimentStatus::Error,
            JobStatus::Done => {}
        }
        match analysis {
            AnalysisStatus::Done => ExperimentStatus::Done,
            AnalysisStatus::Cancelled => ExperimentStatus::Cancelled,
            AnalysisStatus::Error => ExperimentStatus::Error,
            AnalysisStatus::Queued | AnalysisStatus::Running => ExperimentStatus::PostProcessing,
        }
    }
}

impl fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_wins_until_done() {
        assert_eq!(
            ExperimentStatus::from_parts(JobStatus::Running, AnalysisStatus::Error),
            ExperimentStatus::Running
        );
        assert_eq!(
            ExperimentStatus::from_parts(JobStatus::Error, AnalysisStatus::Done),
            ExperimentStatus::Error
        );
    }

    #[test]
    fn test_analysis_mapping() {
        assert_eq!(
            ExperimentStatus::from_parts(JobStatus::Done, AnalysisStatus::Done),
            ExperimentStatus::Done
        );
        assert_eq!(
            ExperimentStatus::from_parts(JobStatus::Done, AnalysisStatus::Cancelled),
            ExperimentStatus::Cancelled
        );
        assert_eq!(
            ExperimentStatus::from_parts(JobStatus::Done, AnalysisStatus::Queued),
            ExperimentStatus::PostProcessing
        );
        assert_eq!(
            ExperimentStatus::from_parts(JobStatus::Done, AnalysisStatus::Running),
            ExperimentStatus::PostProcessing
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(ExperimentStatus::PostProcessing.to_string(), "POST_PROCESSING");
        assert_eq!(
            ExperimentStatus::Empty.description(),
            "experiment data is empty"
        );
    }
}
