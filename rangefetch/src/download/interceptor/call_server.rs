//! The terminal connect step.

use super::{ConnectInterceptor, DownloadChain};
use crate::connection::Connected;
use crate::error::DownloadResult;

/// Sends the prepared request.
#[derive(Debug, Default, Clone, Copy)]
pub struct CallServerInterceptor;

impl ConnectInterceptor for CallServerInterceptor {
    fn intercept_connect(&self, chain: &mut DownloadChain) -> DownloadResult<Box<dyn Connected>> {
        chain.cache().check_interrupt()?;
        chain.connection_or_create()?.execute()
    }
}
