//! Error types for the download engine.
//!
//! Every fallible engine operation returns one of these enums. `DownloadError`
//! is the error a task can end with; it knows whether it is worth retrying and
//! which terminal [`EndCause`] it maps to.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::task::{EndCause, ResumeFailedCause};

/// Errors raised while executing a download.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Local I/O failure (file system, response body read).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport failure reported by the HTTP client.
    #[error("HTTP request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The task was canceled by the caller or aborted by a sibling block.
    #[error("download canceled")]
    Canceled,

    /// A stored breakpoint could not be resumed and the task must restart.
    #[error("resume failed: {0}")]
    ResumeFailed(ResumeFailedCause),

    /// The server answered a resume request with an unusable status.
    #[error("server canceled the download (status {status}, block offset {current_offset})")]
    ServerCanceled { status: u16, current_offset: u64 },

    /// The server violated the HTTP protocol (e.g. a redirect without Location).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An interceptor asked for the connect phase to run again.
    #[error("retry requested: {0}")]
    RetryRequested(String),

    /// Not enough free space to pre-allocate the target file.
    #[error("cannot pre-allocate {required} bytes, only {available} available")]
    PreAllocate { required: u64, available: u64 },

    /// A block finished at an offset other than its length.
    #[error("block {block} finished at offset {actual}, expected {expected}")]
    Inconsistent {
        block: usize,
        expected: u64,
        actual: u64,
    },

    /// Another download is writing the same target file.
    #[error("target file {} is used by another download", path.display())]
    FileBusy { path: PathBuf },

    /// Flushing buffered data to the file system failed.
    #[error("sync to file system failed: {0}")]
    SyncFailed(#[source] Arc<io::Error>),

    /// The breakpoint store rejected an operation.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The task cannot be executed as described.
    #[error("invalid task: {0}")]
    InvalidTask(String),
}

impl DownloadError {
    /// Whether the Retry interceptor may re-drive the pipeline after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Http { .. } | Self::RetryRequested(_)
        )
    }

    /// Whether the error is a cancellation signal.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    /// Terminal cause reported for a task that fails with this error.
    pub fn end_cause(&self) -> EndCause {
        match self {
            Self::Canceled => EndCause::Canceled,
            Self::PreAllocate { .. } => EndCause::PreAllocateFailed,
            Self::FileBusy { .. } => EndCause::FileBusy,
            _ => EndCause::Error,
        }
    }
}

/// Result alias for download operations.
pub type DownloadResult<T> = Result<T, DownloadError>;

/// Errors raised by the breakpoint store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The info passed in is not the one held by the store.
    #[error("breakpoint {0} is not on the store")]
    NotOnStore(i32),

    /// The persistence backend failed.
    #[error("persistence failure: {0}")]
    Persistence(#[from] PersistenceError),
}

/// Errors raised by a persistence backend.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// No record exists for the id.
    #[error("no persisted record for id {0}")]
    NotFound(i32),

    /// Backend-specific failure.
    #[error("backend failure: {0}")]
    Backend(String),
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid value {value:?} for [{section}] {key}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
    },
}

/// Errors raised while installing the tracing subscriber.
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to create log directory {}: {source}", path.display())]
    Directory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid log filter {directive:?}: {reason}")]
    Filter { directive: String, reason: String },

    #[error("logging is already initialised: {0}")]
    AlreadyInitialized(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors_are_retryable() {
        let io = DownloadError::Io(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert!(io.is_retryable());
        assert!(DownloadError::RetryRequested("range moved".into()).is_retryable());
    }

    #[test]
    fn test_signals_are_not_retryable() {
        assert!(!DownloadError::Canceled.is_retryable());
        assert!(!DownloadError::ResumeFailed(ResumeFailedCause::ResponseEtagChanged).is_retryable());
        assert!(!DownloadError::ServerCanceled {
            status: 416,
            current_offset: 10
        }
        .is_retryable());
        assert!(!DownloadError::Protocol("no location".into()).is_retryable());
    }

    #[test]
    fn test_end_cause_mapping() {
        assert_eq!(DownloadError::Canceled.end_cause(), EndCause::Canceled);
        assert_eq!(
            DownloadError::PreAllocate {
                required: 10,
                available: 1
            }
            .end_cause(),
            EndCause::PreAllocateFailed
        );
        assert_eq!(
            DownloadError::FileBusy {
                path: PathBuf::from("/tmp/a")
            }
            .end_cause(),
            EndCause::FileBusy
        );
        assert_eq!(
            DownloadError::Inconsistent {
                block: 0,
                expected: 10,
                actual: 9
            }
            .end_cause(),
            EndCause::Error
        );
    }
}
