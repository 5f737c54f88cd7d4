//! Validating responses against the breakpoint and settling the block layout.

use std::sync::Arc;

use tracing::{debug, info};

use super::{ConnectInterceptor, DownloadChain, FetchInterceptor};
use crate::breakpoint::{BlockInfo, CHUNKED_CONTENT_LENGTH};
use crate::connection::Connected;
use crate::download::response_check;
use crate::download::resolve_filename;
use crate::download::split_blocks;
use crate::error::{DownloadError, DownloadResult, StoreError};

/// Connect side: checks every response against the stored breakpoint and,
/// on the trial, decides filename and block layout.
///
/// Fetch side: drives the body to its end, makes it durable and verifies
/// the block ended where its layout says.
#[derive(Debug, Default, Clone, Copy)]
pub struct BreakpointInterceptor;

impl ConnectInterceptor for BreakpointInterceptor {
    fn intercept_connect(&self, chain: &mut DownloadChain) -> DownloadResult<Box<dyn Connected>> {
        let connected = chain.process_connect()?;
        chain.cache().check_interrupt()?;

        let info = Arc::clone(chain.info());
        let stored_etag = info.etag();
        response_check(
            connected.status(),
            stored_etag.as_deref(),
            connected.header("ETag"),
            chain.requested_offset(),
        )?;

        let reused = if chain.is_trial() {
            settle_layout(chain, connected.as_ref())?
        } else {
            false
        };

        if !chain.context().store().update(&info)? {
            return Err(StoreError::NotOnStore(info.id()).into());
        }

        if chain.is_trial() {
            chain
                .task()
                .listener()
                .split_block_end(chain.task(), &info);
            chain.complete_trial();
        }

        if reused {
            let first = chain.block_info()?;
            if !first.is_complete() && first.range_left() > 0 {
                return Err(DownloadError::RetryRequested(format!(
                    "reused breakpoint resumes block 0 at {}",
                    first.range_left()
                )));
            }
        }
        Ok(connected)
    }
}

impl FetchInterceptor for BreakpointInterceptor {
    fn intercept_fetch(&self, chain: &mut DownloadChain) -> DownloadResult<u64> {
        let mut fetched = 0u64;
        loop {
            let read = chain.process_fetch()?;
            if read == 0 {
                break;
            }
            fetched += read;
        }

        chain.flush_progress();
        let index = chain.block_index();
        chain.cache().stream().ensure_sync_complete(index)?;

        let block = chain.block_info()?;
        let response_length = chain.response_content_length();
        if !block.is_chunked() && response_length != CHUNKED_CONTENT_LENGTH {
            if block.current_offset() != block.content_length() {
                return Err(DownloadError::Inconsistent {
                    block: index,
                    expected: block.content_length(),
                    actual: block.current_offset(),
                });
            }
            // A trial response covers the whole resource, not just this block.
            if !chain.is_trial_response() && fetched != response_length {
                return Err(DownloadError::Inconsistent {
                    block: index,
                    expected: response_length,
                    actual: fetched,
                });
            }
        }
        Ok(fetched)
    }
}

/// Applies the trial response to the breakpoint. Returns true when an idle
/// breakpoint of the same file was taken over instead of starting fresh.
fn settle_layout(chain: &DownloadChain, connected: &dyn Connected) -> DownloadResult<bool> {
    let task = Arc::clone(chain.task());
    let info = Arc::clone(chain.info());
    let context = Arc::clone(chain.context());
    let status = connected.status();
    let headers = connected.headers();

    task.listener().connect_trial_end(&task, status, headers);
    info.set_etag(connected.header("ETag").map(str::to_string));

    if task.filename().is_none() {
        let name = resolve_filename(&task.effective_url(), headers);
        debug!(task_id = task.id(), filename = %name, "Resolved filename from response");
        task.target().filename_holder().set(name);
    }
    if let Some(name) = task.filename() {
        if info.filename().as_deref() != Some(name.as_str()) {
            info.filename_holder().set(name);
        }
    }
    let path = task.path().ok_or_else(|| {
        DownloadError::InvalidTask(format!("{task} has no filename after the trial"))
    })?;

    if task.target().is_filename_from_response() && chain.cache().is_file_busy(&task) {
        return Err(DownloadError::FileBusy { path });
    }

    let content_length = chain.response_content_length();
    let chunked = content_length == CHUNKED_CONTENT_LENGTH;
    info.set_chunked(chunked);

    if !chunked && reuse_idle_info(chain, content_length)? {
        info!(
            task_id = task.id(),
            offset = info.total_offset(),
            "Continuing an idle breakpoint of the same file"
        );
        return Ok(true);
    }

    context.output().delete(&path)?;

    let split = context.split();
    let blocks = if split.is_split_block(
        status,
        headers,
        content_length,
        context.output().supports_seek(),
    ) {
        let count = task
            .connection_count()
            .unwrap_or_else(|| split.determine_block_count(content_length));
        split_blocks(content_length, count)
    } else {
        vec![BlockInfo::new(0, content_length)]
    };
    info.replace_blocks(blocks);

    debug!(
        task_id = task.id(),
        status,
        length = content_length,
        blocks = info.block_count(),
        "Block layout settled"
    );
    Ok(false)
}

/// Takes over the progress of another stored breakpoint for the same file.
///
/// An idle other breakpoint is always discarded; its blocks are only adopted
/// when it made real progress on the same content that is still on disk.
fn reuse_idle_info(chain: &DownloadChain, content_length: u64) -> DownloadResult<bool> {
    let task = chain.task();
    let info = chain.info();
    let context = chain.context();
    let store = context.store();

    let Some(other) = store.find_another_info_from_compare(task.target(), info) else {
        return Ok(false);
    };
    if chain.cache().is_running_id(other.id()) {
        return Ok(false);
    }
    store.discard(other.id())?;

    if other.total_offset() <= context.split().reuse_idle_threshold_bytes() {
        return Ok(false);
    }
    if other.etag().is_some() && other.etag() != info.etag() {
        return Ok(false);
    }
    if other.is_chunked() || other.total_length() != content_length {
        return Ok(false);
    }
    match other.path() {
        Some(path) if context.output().exists(&path) => {}
        _ => return Ok(false),
    }

    info.reuse_blocks(&other);
    Ok(true)
}
