//! State shared by the block chains of one download attempt.

use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{DownloadError, DownloadResult};
use crate::output::MultiPointOutputStream;
use crate::task::DownloadTask;

/// Granularity of interruptible sleeps.
const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// What a call may ask about the other running downloads.
pub(crate) trait CallHost: Send + Sync {
    /// Whether another running download already writes `task`'s target.
    fn is_file_busy_after_run(&self, task: &Arc<DownloadTask>) -> bool;

    /// Whether a running download owns the breakpoint `id`.
    fn is_running_id(&self, id: i32) -> bool;
}

/// Per-attempt state: output stream, cancellation and the first failure.
///
/// The first non-cancel failure of any block cancels the attempt token, so
/// the sibling blocks stop at their next checkpoint.
pub struct DownloadCache {
    stream: Arc<MultiPointOutputStream>,
    token: CancellationToken,
    failure: Mutex<Option<DownloadError>>,
    host: Option<Weak<dyn CallHost>>,
}

impl DownloadCache {
    pub(crate) fn new(
        stream: Arc<MultiPointOutputStream>,
        token: CancellationToken,
        host: Option<Weak<dyn CallHost>>,
    ) -> Self {
        Self {
            stream,
            token,
            failure: Mutex::new(None),
            host,
        }
    }

    pub fn stream(&self) -> &Arc<MultiPointOutputStream> {
        &self.stream
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_interrupted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// `Err(Canceled)` once the attempt is interrupted.
    pub fn check_interrupt(&self) -> DownloadResult<()> {
        if self.is_interrupted() {
            Err(DownloadError::Canceled)
        } else {
            Ok(())
        }
    }

    /// Sleeps for `duration` unless the attempt is interrupted first.
    pub fn sleep(&self, duration: Duration) -> DownloadResult<()> {
        let deadline = Instant::now() + duration;
        loop {
            self.check_interrupt()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }

    /// Keeps the first real failure and stops the other blocks.
    pub fn record_failure(&self, error: DownloadError) {
        if error.is_canceled() {
            return;
        }
        self.failure.lock().get_or_insert(error);
        self.token.cancel();
    }

    pub fn take_failure(&self) -> Option<DownloadError> {
        self.failure.lock().take()
    }

    /// Whether another running download already writes `task`'s target.
    pub(crate) fn is_file_busy(&self, task: &Arc<DownloadTask>) -> bool {
        self.host
            .as_ref()
            .and_then(Weak::upgrade)
            .is_some_and(|host| host.is_file_busy_after_run(task))
    }

    /// Whether a running download owns the breakpoint `id`.
    pub(crate) fn is_running_id(&self, id: i32) -> bool {
        self.host
            .as_ref()
            .and_then(Weak::upgrade)
            .is_some_and(|host| host.is_running_id(id))
    }
}
