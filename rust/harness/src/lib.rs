#![warn(clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::cast_precision_loss,
    clippy::too_many_lines
)]

//! Klynge Sweep Harness
//!
//! Stages one job directory per parameter configuration and runs the jobs
//! through a bounded local worker pool or a cluster batch scheduler.

pub mod config;
pub mod jobfile;
pub mod logging;
pub mod pool;
pub mod runner;
pub mod stage;

pub use config::{ClusterProfile, HarnessConfig, JobDescriptor};
pub use jobfile::{ClusterBackend, SubmissionError};
pub use pool::{PoolError, WorkerId, WorkerPool, WorkerTask};
pub use runner::{Dispatch, JobRunner, RunSummary, RunnerError};
pub use stage::{Stager, StagingError};
