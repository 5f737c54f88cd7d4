//! Tracing subscriber setup.
//!
//! The engine itself only emits `tracing` events; binaries call
//! [`init_logging`] once at startup to send them to the console and,
//! optionally, to a daily-rolling log file.

use std::fs;

use time::format_description::well_known::Rfc3339;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::LocalTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::config::LoggingConfig;
use crate::error::LoggingError;

/// Base name of the rolling log files.
pub const LOG_FILE_PREFIX: &str = "rangefetch.log";

/// Builds the filter: `RUST_LOG` when set, else `config.level`.
pub fn build_filter(config: &LoggingConfig) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.level).map_err(|e| LoggingError::Filter {
        directive: config.level.clone(),
        reason: e.to_string(),
    })
}

/// Installs the global subscriber.
///
/// Returns the file writer's guard when a log directory is configured; it
/// must be kept alive for as long as logs should reach the file.
///
/// # Errors
///
/// Fails on an invalid filter, an uncreatable log directory, or when a
/// global subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>, LoggingError> {
    let filter = build_filter(config)?;
    let console = fmt::layer()
        .with_target(false)
        .with_timer(LocalTime::new(Rfc3339))
        .with_writer(std::io::stderr);

    let (file, guard) = match &config.directory {
        Some(directory) => {
            fs::create_dir_all(directory).map_err(|source| LoggingError::Directory {
                path: directory.clone(),
                source,
            })?;
            let appender = tracing_appender::rolling::daily(directory, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_ansi(false)
                .with_timer(LocalTime::new(Rfc3339))
                .with_writer(writer)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))?;

    Ok(guard)
}
