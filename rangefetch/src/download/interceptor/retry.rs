//! Bounded retry of transient failures.

use tracing::{debug, warn};

use super::{ConnectInterceptor, DownloadChain, FetchInterceptor};
use crate::connection::Connected;
use crate::error::{DownloadError, DownloadResult};

/// Re-drives the rest of the pipeline after a retryable error.
///
/// Attempts and delays come from the engine's
/// [`RetryPolicy`](crate::policy::RetryPolicy). A
/// [`DownloadError::RetryRequested`] re-runs immediately and does not use up
/// an attempt. Delays are interrupted by cancellation.
#[derive(Debug, Default, Clone, Copy)]
pub struct RetryInterceptor;

impl RetryInterceptor {
    /// Waits before attempt `attempt + 1`, or gives `error` back when the
    /// policy is exhausted.
    fn backoff(chain: &DownloadChain, attempt: u32, error: DownloadError) -> DownloadResult<()> {
        let Some(delay) = chain.context().config().retry.delay_for_attempt(attempt) else {
            warn!(
                task_id = chain.task().id(),
                block = chain.block_index(),
                attempts = attempt,
                error = %error,
                "Giving up after retries"
            );
            return Err(error);
        };
        debug!(
            task_id = chain.task().id(),
            block = chain.block_index(),
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Retrying block"
        );
        chain.cache().sleep(delay)
    }
}

impl ConnectInterceptor for RetryInterceptor {
    fn intercept_connect(&self, chain: &mut DownloadChain) -> DownloadResult<Box<dyn Connected>> {
        let mut attempt = 0u32;
        loop {
            chain.cache().check_interrupt()?;
            match chain.process_connect() {
                Ok(connected) => return Ok(connected),
                Err(DownloadError::RetryRequested(reason)) => {
                    debug!(task_id = chain.task().id(), block = chain.block_index(), %reason, "Connect re-run requested");
                    chain.reset_connection();
                }
                Err(e) if e.is_retryable() => {
                    chain.reset_connection();
                    attempt += 1;
                    Self::backoff(chain, attempt, e)?;
                }
                Err(e) => {
                    chain.reset_connection();
                    return Err(e);
                }
            }
        }
    }
}

impl FetchInterceptor for RetryInterceptor {
    fn intercept_fetch(&self, chain: &mut DownloadChain) -> DownloadResult<u64> {
        let mut attempt = 0u32;
        loop {
            match chain.process_fetch() {
                Ok(fetched) => return Ok(fetched),
                Err(e) if e.is_retryable() => {
                    // Resume from what is durable, not from what was read.
                    chain
                        .cache()
                        .stream()
                        .ensure_sync_complete(chain.block_index())?;
                    attempt += 1;
                    Self::backoff(chain, attempt, e)?;
                    chain.reconnect()?;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
