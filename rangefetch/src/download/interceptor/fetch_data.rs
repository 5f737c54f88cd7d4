//! The terminal fetch step.

use super::{DownloadChain, FetchInterceptor};
use crate::error::DownloadResult;

/// Reads one buffer of body and hands it to the output stream.
///
/// A sized block never reads past its end, even if the server sends more.
#[derive(Debug, Default, Clone, Copy)]
pub struct FetchDataInterceptor;

impl FetchInterceptor for FetchDataInterceptor {
    fn intercept_fetch(&self, chain: &mut DownloadChain) -> DownloadResult<u64> {
        chain.cache().check_interrupt()?;

        let block_index = chain.block_index();
        let block = chain.block_info()?;
        let mut limit = chain.task().read_buffer_size();
        if !block.is_chunked() {
            let written = block.current_offset()
                + chain.cache().stream().pending_length(block_index);
            let remaining = block.content_length().saturating_sub(written);
            if remaining == 0 {
                return Ok(0);
            }
            limit = limit.min(usize::try_from(remaining).unwrap_or(usize::MAX));
        }

        let read = chain.read_body(limit)?;
        if read == 0 {
            return Ok(0);
        }
        chain
            .cache()
            .stream()
            .write(block_index, chain.buffer(read))?;
        chain.increase_progress(read as u64);
        Ok(read as u64)
    }
}
