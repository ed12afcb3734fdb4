//! Arvak Experiment Data
//!
//! This crate provides [`ExperimentData`], the container that collects
//! everything one characterization or calibration experiment produces: remote
//! jobs, raw result records, analysis callbacks, analysis results and figures.
//!
//! # Overview
//!
//! - Jobs are ingested in the background; their result records land in the
//!   container as they complete
//! - Analysis callbacks are queued behind the jobs and callbacks submitted
//!   before them, and can be cancelled until they start
//! - [`ExperimentStatus`] summarizes job and analysis state
//! - An [`ExperimentService`] keeps a remote copy; [`LocalExperimentService`]
//!   stores it as JSON on disk
//! - Experiments nest: a parent owns its child experiments
//!
//! # Example: Collecting and Analyzing
//!
//! ```ignore
//! use arvak_expdata::{AnalysisResult, ExperimentData, DataIndex};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let exp = ExperimentData::builder()
//!         .experiment_type("T1")
//!         .backend(backend)
//!         .build()?;
//!
//!     exp.add_jobs(vec![job], None).await;
//!     exp.add_analysis_callback(
//!         "fit_t1",
//!         |exp, _kwargs| async move {
//!             let records = exp.data(DataIndex::All).await?;
//!             let t1 = fit(&records)?;
//!             exp.add_analysis_results(vec![AnalysisResult::new("T1", t1.into())])
//!                 .await;
//!             Ok(())
//!         },
//!         Default::default(),
//!     );
//!
//!     exp.block_for_results(None).await;
//!     println!("{}", exp.summary().await);
//!     Ok(())
//! }
//! ```
//!
//! # Persistence
//!
//! ```ignore
//! use arvak_expdata::{ExperimentData, LocalExperimentService};
//!
//! let service = Arc::new(LocalExperimentService::new("./store").await?);
//! exp.set_service(service.clone(), false).await?;
//! exp.save(exp.save_options().strict()).await?;
//!
//! let loaded = ExperimentData::load(exp.experiment_id(), Some(service), None).await?;
//! ```

pub mod analysis_result;
pub mod callback;
pub mod config;
pub mod containers;
pub mod error;
pub mod experiment_data;
pub mod figure;
pub mod job;
pub mod logging;
pub mod pool;
pub mod result;
pub mod service;
pub mod status;
pub mod task;

pub use analysis_result::{AnalysisResult, AnalysisResultRecord, ResultQuality};
pub use callback::{AnalysisCallback, AnalysisStatus, CallbackKwargs};
pub use config::{ConfigError, ExpDataConfig};
pub use containers::{OrderedMap, ThreadSafeList, ThreadSafeMap};
pub use error::{ExpDataError, ExpDataResult, JobError, ServiceError, ServiceResult, TaskFailure};
pub use experiment_data::{
    ChildIndex, DataIndex, ExperimentData, ExperimentDataBuilder, ExperimentSnapshot, FigureKey,
    ResultIndex, ResultKey, ResultQuery, SaveOptions, StoredAnalysisResult,
};
pub use figure::{FigureData, FigureInput, FigurePayload, PlotFigure, StoredFigure};
pub use job::{Backend, JobStatus, Provider, ProviderInstance, RemoteJob};
pub use logging::{LogFormat, LoggingConfig, init_tracing};
pub use pool::WorkerPool;
pub use result::{Counts, DataPayload, ExperimentResult, JobResult, Record, ResultHeader};
pub use service::{
    ExperimentRecord, ExperimentService, ExperimentTimestamps, LocalExperimentService,
};
pub use status::ExperimentStatus;
pub use task::{TaskHandle, TaskOutcome, TaskResult};
