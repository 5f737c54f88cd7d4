//! Request headers of a block.

use std::sync::Arc;

use tracing::trace;

use super::{ConnectInterceptor, DownloadChain};
use crate::connection::{response_content_length, Connected};
use crate::error::DownloadResult;

/// Adds caller headers, the block's `Range` and `If-Match`, then reports
/// the exchange to the listener.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeaderInterceptor;

impl ConnectInterceptor for HeaderInterceptor {
    fn intercept_connect(&self, chain: &mut DownloadChain) -> DownloadResult<Box<dyn Connected>> {
        let task = Arc::clone(chain.task());
        let info = Arc::clone(chain.info());
        let block_index = chain.block_index();
        let block = chain.block_info()?;

        let mut range = format!("bytes={}-", block.range_left());
        if block_index + 1 < info.block_count() && !block.is_chunked() {
            range.push_str(&block.range_right().to_string());
        }
        let etag = info.etag().filter(|etag| !etag.is_empty());

        let connection = chain.connection_or_create()?;
        for (name, value) in task.headers() {
            connection.add_header(name, value);
        }
        connection.add_header("Range", &range);
        if let Some(etag) = &etag {
            connection.add_header("If-Match", etag);
        }
        let request_headers = connection.request_headers().clone();

        chain.set_requested_offset(block.range_left());
        chain.cache().check_interrupt()?;

        trace!(task_id = task.id(), block = block_index, %range, "Connecting block");
        let listener = Arc::clone(task.listener());
        listener.connect_start(&task, block_index, &request_headers);

        let connected = chain.process_connect()?;

        listener.connect_end(&task, block_index, connected.status(), connected.headers());
        chain.cache().check_interrupt()?;

        chain.set_response_content_length(response_content_length(connected.headers()));
        Ok(connected)
    }
}
