//! One block's connect-then-fetch pipeline.
//!
//! A chain walks the connect interceptors until one produces a response,
//! then walks the fetch interceptors until the body is exhausted. Each
//! interceptor receives the chain itself and calls
//! [`DownloadChain::process_connect`] / [`DownloadChain::process_fetch`] to
//! run the rest of the list, as often as it needs to.

use std::io;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::oneshot;
use tracing::{debug, trace};

use super::cache::DownloadCache;
use super::interceptor::Interceptors;
use crate::breakpoint::{BlockInfo, BreakpointInfo};
use crate::connection::{Connected, Connection};
use crate::engine::EngineContext;
use crate::error::{DownloadError, DownloadResult};
use crate::task::DownloadTask;

/// Pipeline state of one block for one attempt.
pub struct DownloadChain {
    block: usize,
    task: Arc<DownloadTask>,
    info: Arc<BreakpointInfo>,
    cache: Arc<DownloadCache>,
    context: Arc<EngineContext>,
    interceptors: Arc<Interceptors>,

    connect_index: usize,
    fetch_index: usize,

    connection: Option<Box<dyn Connection>>,
    connected: Option<Box<dyn Connected>>,
    response_content_length: u64,
    requested_offset: u64,

    /// Present on the first block of a fresh download until the layout is final.
    trial: Option<oneshot::Sender<()>>,
    /// The open response was requested by the trial and spans the whole resource.
    trial_response: bool,

    buffer: Vec<u8>,
    pending_progress: u64,
    last_progress: Instant,
}

impl DownloadChain {
    pub(crate) fn new(
        block: usize,
        task: Arc<DownloadTask>,
        info: Arc<BreakpointInfo>,
        cache: Arc<DownloadCache>,
        context: Arc<EngineContext>,
        interceptors: Arc<Interceptors>,
    ) -> Self {
        let buffer = vec![0; task.read_buffer_size()];
        Self {
            block,
            task,
            info,
            cache,
            context,
            interceptors,
            connect_index: 0,
            fetch_index: 0,
            connection: None,
            connected: None,
            response_content_length: 0,
            requested_offset: 0,
            trial: None,
            trial_response: false,
            buffer,
            pending_progress: 0,
            last_progress: Instant::now(),
        }
    }

    /// Makes this chain the trial: `trial` fires once the layout is final.
    pub(crate) fn with_trial(mut self, trial: oneshot::Sender<()>) -> Self {
        self.trial = Some(trial);
        self
    }

    /// Runs the block to the end of its body.
    pub fn run(&mut self) -> DownloadResult<()> {
        self.cache.check_interrupt()?;
        trace!(task_id = self.task.id(), block = self.block, "Block chain started");

        let result = self.connect_and_fetch();
        self.reset_connection();
        result
    }

    fn connect_and_fetch(&mut self) -> DownloadResult<()> {
        let connected = self.process_connect()?;
        self.connected = Some(connected);

        let listener = Arc::clone(self.task.listener());
        listener.fetch_start(&self.task, self.block, self.response_content_length);

        let fetched = self.process_fetch()?;

        self.flush_progress();
        listener.fetch_end(&self.task, self.block, fetched);
        debug!(
            task_id = self.task.id(),
            block = self.block,
            bytes = fetched,
            "Block finished"
        );
        Ok(())
    }

    /// Runs the remaining connect interceptors.
    pub fn process_connect(&mut self) -> DownloadResult<Box<dyn Connected>> {
        let index = self.connect_index;
        let interceptor = self
            .interceptors
            .connect
            .get(index)
            .cloned()
            .ok_or_else(|| DownloadError::InvalidTask("connect pipeline produced no response".into()))?;

        self.connect_index = index + 1;
        let result = interceptor.intercept_connect(self);
        self.connect_index = index;
        result
    }

    /// Runs the remaining fetch interceptors; `Ok(0)` means the body ended.
    pub fn process_fetch(&mut self) -> DownloadResult<u64> {
        let index = self.fetch_index;
        let interceptor = self
            .interceptors
            .fetch
            .get(index)
            .cloned()
            .ok_or_else(|| DownloadError::InvalidTask("fetch pipeline has no reader".into()))?;

        self.fetch_index = index + 1;
        let result = interceptor.intercept_fetch(self);
        self.fetch_index = index;
        result
    }

    // -------------------------------------------------------------------------
    // Connection
    // -------------------------------------------------------------------------

    /// The prepared request, created on first use.
    pub fn connection_or_create(&mut self) -> DownloadResult<&mut Box<dyn Connection>> {
        if self.connection.is_none() {
            let url = self.task.effective_url();
            trace!(task_id = self.task.id(), block = self.block, url = %url, "Creating connection");
            self.connection = Some(self.context.connections().create(&url)?);
        }
        self.connection
            .as_mut()
            .ok_or_else(|| DownloadError::InvalidTask("connection unavailable".into()))
    }

    pub fn connection(&self) -> Option<&dyn Connection> {
        self.connection.as_deref()
    }

    /// Drops the current request and response so the next connect starts clean.
    pub fn reset_connection(&mut self) {
        self.connected = None;
        self.trial_response = false;
        if let Some(mut connection) = self.connection.take() {
            connection.release();
        }
    }

    /// Re-runs the whole connect phase from the first interceptor.
    pub fn reconnect(&mut self) -> DownloadResult<()> {
        self.reset_connection();
        let saved = self.connect_index;
        self.connect_index = 0;
        let result = self.process_connect();
        self.connect_index = saved;
        self.connected = Some(result?);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Body and progress
    // -------------------------------------------------------------------------

    /// Reads at most `limit` body bytes into the chain's buffer.
    pub fn read_body(&mut self, limit: usize) -> io::Result<usize> {
        let connected = self.connected.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "block has no open response")
        })?;
        let limit = limit.min(self.buffer.len());
        connected.read(&mut self.buffer[..limit])
    }

    /// Bytes of the last read.
    pub fn buffer(&self, len: usize) -> &[u8] {
        &self.buffer[..len.min(self.buffer.len())]
    }

    /// Counts fetched bytes, reporting them at most once per progress interval.
    pub fn increase_progress(&mut self, increase: u64) {
        self.pending_progress += increase;
        if self.last_progress.elapsed() >= self.task.progress_interval() {
            self.flush_progress();
        }
    }

    /// Reports any progress not delivered yet.
    pub fn flush_progress(&mut self) {
        if self.pending_progress == 0 {
            return;
        }
        let increase = std::mem::take(&mut self.pending_progress);
        self.last_progress = Instant::now();
        self.task
            .listener()
            .fetch_progress(&self.task, self.block, increase);
    }

    // -------------------------------------------------------------------------
    // Trial
    // -------------------------------------------------------------------------

    pub fn is_trial(&self) -> bool {
        self.trial.is_some()
    }

    /// Releases the siblings waiting for the block layout.
    pub fn complete_trial(&mut self) {
        if let Some(trial) = self.trial.take() {
            self.trial_response = true;
            // The call may have stopped waiting after a cancel.
            let _ = trial.send(());
        }
    }

    /// Whether the open response came from the trial request (`Range: bytes=0-`)
    /// and may therefore be longer than this block.
    pub fn is_trial_response(&self) -> bool {
        self.trial_response
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn block_index(&self) -> usize {
        self.block
    }

    /// Current state of this chain's block; re-read since the trial may
    /// replace the layout.
    pub fn block_info(&self) -> DownloadResult<Arc<BlockInfo>> {
        self.info.block(self.block).ok_or_else(|| {
            DownloadError::InvalidTask(format!("{} has no block {}", self.task, self.block))
        })
    }

    pub fn task(&self) -> &Arc<DownloadTask> {
        &self.task
    }

    pub fn info(&self) -> &Arc<BreakpointInfo> {
        &self.info
    }

    pub fn cache(&self) -> &Arc<DownloadCache> {
        &self.cache
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.context
    }

    pub fn response_content_length(&self) -> u64 {
        self.response_content_length
    }

    pub fn set_response_content_length(&mut self, length: u64) {
        self.response_content_length = length;
    }

    /// Absolute offset the current request asked to start from.
    pub fn requested_offset(&self) -> u64 {
        self.requested_offset
    }

    pub fn set_requested_offset(&mut self, offset: u64) {
        self.requested_offset = offset;
    }
}
