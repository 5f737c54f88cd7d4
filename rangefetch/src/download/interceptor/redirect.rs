//! Following HTTP redirects.

use reqwest::Url;
use tracing::debug;

use super::{ConnectInterceptor, DownloadChain};
use crate::connection::Connected;
use crate::error::{DownloadError, DownloadResult};

/// Redirects followed before a block gives up.
pub const MAX_REDIRECTS: usize = 10;

fn is_redirect(status: u16) -> bool {
    matches!(status, 300 | 301 | 302 | 303 | 307 | 308)
}

/// Follows redirects and records the final location on the task, so the
/// other blocks connect there directly.
#[derive(Debug, Default, Clone, Copy)]
pub struct RedirectInterceptor;

impl ConnectInterceptor for RedirectInterceptor {
    fn intercept_connect(&self, chain: &mut DownloadChain) -> DownloadResult<Box<dyn Connected>> {
        let mut redirects = 0;
        loop {
            let connected = chain.process_connect()?;
            let status = connected.status();
            if !is_redirect(status) {
                return Ok(connected);
            }

            redirects += 1;
            if redirects > MAX_REDIRECTS {
                return Err(DownloadError::Protocol(format!(
                    "too many redirects ({MAX_REDIRECTS}) for {}",
                    chain.task().url()
                )));
            }

            let location = connected.header("Location").map(str::to_string).ok_or_else(|| {
                DownloadError::Protocol(format!("redirect {status} without a Location header"))
            })?;
            let current = chain.task().effective_url();
            let next = resolve_location(&current, &location)?;

            debug!(
                task_id = chain.task().id(),
                block = chain.block_index(),
                status,
                from = %current,
                to = %next,
                "Following redirect"
            );
            chain.task().set_redirect_location(next);
            chain.reset_connection();
        }
    }
}

/// `location` resolved against the url that produced it.
fn resolve_location(current: &str, location: &str) -> DownloadResult<String> {
    let joined = match Url::parse(current) {
        Ok(base) => base.join(location),
        Err(_) => Url::parse(location),
    };
    joined
        .map(String::from)
        .map_err(|e| DownloadError::Protocol(format!("invalid redirect location {location:?}: {e}")))
}
