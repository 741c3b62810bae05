//! Tracing setup: console through the progress bars, plus two log files.

use std::{
    fs::File,
    path::{Path, PathBuf},
    sync::Mutex,
};

use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::{EnvFilter, filter::LevelFilter, fmt, prelude::*};

/// Install the global subscriber.
///
/// The console shows INFO (DEBUG with `debug`) unless `RUST_LOG` says
/// otherwise. `log_file` receives everything at DEBUG and above and
/// `error_log` only errors. Both files are truncated.
pub fn init(debug: bool, log_file: &Path, error_log: &Path) -> Result<(), LoggingError> {
    // tracing needs to be initialized with indicatif_layer to not clobber progress bars
    let indicatif_layer = IndicatifLayer::new();
    let level = if debug { LevelFilter::DEBUG } else { LevelFilter::INFO };
    let console_filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    let log_writer = create(log_file)?;
    let error_writer = create(error_log)?;

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(indicatif_layer.get_stderr_writer())
                .with_target(false)
                .with_filter(console_filter),
        )
        .with(
            fmt::layer()
                .with_writer(log_writer)
                .with_ansi(false)
                .with_filter(LevelFilter::DEBUG),
        )
        .with(
            fmt::layer()
                .with_writer(error_writer)
                .with_ansi(false)
                .with_filter(LevelFilter::ERROR),
        )
        .with(indicatif_layer)
        .try_init()
        .map_err(|e| LoggingError::Init(e.to_string()))
}

/// Truncate `path` and wrap it as a log writer.
fn create(path: &Path) -> Result<Mutex<File>, LoggingError> {
    File::create(path)
        .map(Mutex::new)
        .map_err(|e| LoggingError::Create(path.to_path_buf(), e))
}

/// Errors that can occur while setting up logging.
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to create log file {0}: {1}")]
    Create(PathBuf, std::io::Error),
    #[error("failed to install subscriber: {0}")]
    Init(String),
}
