//! Error types for experiment data handling.

use thiserror::Error;

/// Result type for experiment data operations.
pub type ExpDataResult<T> = Result<T, ExpDataError>;

/// Result type for experiment service calls.
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Errors raised by the experiment data container.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ExpDataError {
    /// A payload handed to `add_data` has an unsupported shape.
    #[error("Invalid data type: {0}")]
    UnsupportedData(String),

    /// An argument is inconsistent with the others.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A positional index is past the end of a collection.
    #[error("Index {index} out of range for {len} entries")]
    IndexOutOfRange { index: usize, len: usize },

    /// A figure, analysis result or child was not found.
    #[error("{0}")]
    NotFound(String),

    /// An entry with the same key already exists.
    #[error("{0}")]
    EntryExists(String),

    /// An experiment service is attached and replacement was not requested.
    #[error("An experiment service is already being used")]
    ServiceAlreadySet,

    /// No experiment service could be resolved.
    #[error("Missing experiment service: {0}")]
    MissingService(String),

    /// Saving to the experiment service failed in strict mode.
    #[error("Experiment data save failed: {0}")]
    SaveFailed(String),

    /// Serialization was attempted while background tasks were still running.
    #[error(
        "Cannot serialize experiment data with outstanding tasks: {jobs} job(s), {analysis} analysis callback(s)"
    )]
    TasksOutstanding { jobs: usize, analysis: usize },

    /// A figure could not be rendered to its canonical format.
    #[error("Figure error: {0}")]
    Figure(String),

    /// No tokio runtime is available for background work.
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// A background task failed.
    #[error("Background task failed: {0}")]
    Task(#[from] TaskFailure),

    /// Remote job error.
    #[error("Job error: {0}")]
    Job(#[from] JobError),

    /// Experiment service error.
    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors reported by an experiment service.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ServiceError {
    #[error("Entry not found: {0}")]
    NotFound(String),

    #[error("Entry already exists: {0}")]
    AlreadyExists(String),

    #[error("Request failed: {0}")]
    Request(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors reported by a remote job handle or provider.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum JobError {
    #[error("Job {0} not found")]
    NotFound(String),

    #[error("Job {job_id} failed: {message}")]
    Failed { job_id: String, message: String },

    #[error("Job {0} was cancelled")]
    Cancelled(String),

    #[error("Remote error: {0}")]
    Remote(String),
}

/// Failure of a background task, observable by any number of waiters.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskFailure {
    /// The task returned an unexpected error.
    #[error("{0}")]
    Error(String),

    /// The task panicked.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// The task was dropped before reporting, e.g. on runtime shutdown.
    #[error("task aborted before completion")]
    Aborted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ExpDataError::IndexOutOfRange { index: 4, len: 2 };
        assert_eq!(err.to_string(), "Index 4 out of range for 2 entries");

        let err = ExpDataError::TasksOutstanding {
            jobs: 1,
            analysis: 0,
        };
        assert!(err.to_string().contains("1 job(s)"));

        let err: ExpDataError = JobError::Cancelled("job-1".into()).into();
        assert_eq!(err.to_string(), "Job error: Job job-1 was cancelled");
    }

    #[test]
    fn test_service_error_conversion() {
        let err: ExpDataError = ServiceError::NotFound("exp-1".into()).into();
        assert!(matches!(err, ExpDataError::Service(ServiceError::NotFound(_))));
    }

    #[test]
    fn test_task_failure_is_cloneable() {
        let failure = TaskFailure::Panicked("boom".into());
        let copy = failure.clone();
        assert_eq!(failure, copy);
        assert_eq!(copy.to_string(), "task panicked: boom");
    }
}
