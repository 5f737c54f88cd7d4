//! Execution of one task from admission to its terminal event.
//!
//! A call first tries to continue the stored breakpoint. If that is not
//! possible it runs a trial connection on block 0, which settles filename
//! and block layout, and only then starts the remaining blocks. A resume
//! validation failure restarts the task from byte 0 once.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::thread::{self, Scope, ScopedJoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::cache::{CallHost, DownloadCache};
use super::cancel::CancelBatch;
use super::chain::DownloadChain;
use super::check::local_check;
use crate::breakpoint::{BlockInfo, BreakpointInfo};
use crate::engine::EngineContext;
use crate::error::{DownloadError, DownloadResult};
use crate::output::MultiPointOutputStream;
use crate::task::{DownloadTask, EndCause};

/// Restarts from byte 0 allowed after a resume validation failure.
pub const MAX_RESUME_RESTARTS: usize = 1;

const FILE_LOCK_POLL: Duration = Duration::from_millis(100);

#[derive(Default)]
struct CallState {
    canceled: bool,
    finishing: bool,
    /// Path held in the file lock by a cancel until the call has drained.
    lock_path: Option<PathBuf>,
    /// Group the store hears about once this call has drained.
    batch: Option<Arc<CancelBatch>>,
}

/// One running task.
pub struct DownloadCall {
    task: Arc<DownloadTask>,
    is_async: bool,
    context: Arc<EngineContext>,
    host: Option<Weak<dyn CallHost>>,
    state: Mutex<CallState>,
    token: CancellationToken,
    stream: Mutex<Option<Arc<MultiPointOutputStream>>>,
}

impl DownloadCall {
    pub(crate) fn new(
        task: Arc<DownloadTask>,
        is_async: bool,
        context: Arc<EngineContext>,
        host: Option<Weak<dyn CallHost>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            task,
            is_async,
            context,
            host,
            state: Mutex::new(CallState::default()),
            token: CancellationToken::new(),
            stream: Mutex::new(None),
        })
    }

    /// A call not admitted through a dispatcher.
    pub fn standalone(task: Arc<DownloadTask>, context: Arc<EngineContext>) -> Arc<Self> {
        Self::new(task, false, context, None)
    }

    pub fn task(&self) -> &Arc<DownloadTask> {
        &self.task
    }

    pub fn is_async(&self) -> bool {
        self.is_async
    }

    pub fn is_canceled(&self) -> bool {
        self.state.lock().canceled
    }

    pub fn is_finishing(&self) -> bool {
        self.state.lock().finishing
    }

    /// Runs the task to completion on the current thread.
    pub fn execute(&self) -> EndCause {
        let store = self.context.store();
        store.on_task_start(self.task.id());
        self.task.listener().task_start(&self.task);
        info!(task_id = self.task.id(), url = %self.task.url(), "Download started");

        let result = self.run_attempts();
        self.finish(result)
    }

    /// Stops the call. Returns false if it was already canceled or is
    /// already reporting its end.
    ///
    /// The target path stays locked until the call has drained its output,
    /// so a new task for the same file cannot open it early.
    pub fn cancel(&self) -> bool {
        self.cancel_with(None)
    }

    /// Cancels as a member of `batch`, which reports the store once every
    /// member has drained.
    pub(crate) fn cancel_in(&self, batch: &Arc<CancelBatch>) -> bool {
        self.cancel_with(Some(batch))
    }

    fn cancel_with(&self, batch: Option<&Arc<CancelBatch>>) -> bool {
        {
            let mut state = self.state.lock();
            if state.canceled || state.finishing {
                return false;
            }
            state.canceled = true;
            if let Some(batch) = batch {
                batch.join(self.task.id());
                state.batch = Some(Arc::clone(batch));
            }
            if let Some(path) = self.task.path() {
                self.context.file_lock().increase(&path);
                state.lock_path = Some(path);
            }
        }
        self.token.cancel();
        debug!(task_id = self.task.id(), "Download call canceled");
        true
    }

    fn run_attempts(&self) -> DownloadResult<()> {
        let mut restarts = 0;
        loop {
            match self.run_once() {
                Err(DownloadError::ResumeFailed(cause))
                    if restarts < MAX_RESUME_RESTARTS && !self.is_canceled() =>
                {
                    restarts += 1;
                    warn!(task_id = self.task.id(), %cause, "Resume failed, restarting from the beginning");
                    if let Some(info) = self.context.store().get(self.task.id()) {
                        self.task
                            .listener()
                            .download_from_beginning(&self.task, &info, cause);
                        info.reset_blocks();
                    }
                }
                other => return other,
            }
        }
    }

    fn run_once(&self) -> DownloadResult<()> {
        let store = self.context.store();
        let info = match store.get(self.task.id()) {
            Some(info) => info,
            None => store.create_and_insert(&self.task)?,
        };

        let token = self.token.child_token();
        if let Some(path) = self.task.path() {
            self.wait_for_file_release(&path, &token)?;
        }

        let stream = MultiPointOutputStream::new(
            Arc::clone(&self.task),
            Arc::clone(&info),
            Arc::clone(store),
            Arc::clone(self.context.output()),
            Arc::clone(self.context.file_lock()),
            token.clone(),
        );
        let previous = self.stream.lock().replace(Arc::clone(&stream));
        if let Some(previous) = previous {
            // Output of an abandoned generation; its blocks no longer exist.
            if let Err(e) = previous.close() {
                debug!(task_id = self.task.id(), error = %e, "Closing previous output failed");
            }
        }
        let cache = Arc::new(DownloadCache::new(stream, token, self.host.clone()));

        let listener = self.task.listener();
        let fresh = match local_check(&self.task, &info, self.context.output().as_ref()) {
            Ok(()) => {
                debug!(
                    task_id = self.task.id(),
                    offset = info.total_offset(),
                    length = info.total_length(),
                    "Resuming from breakpoint"
                );
                listener.download_from_breakpoint(&self.task, &info);
                false
            }
            Err(cause) => {
                if info.block_count() > 0 {
                    listener.download_from_beginning(&self.task, &info, cause);
                }
                if let Some(path) = self.task.path() {
                    self.context.output().delete(&path)?;
                }
                info.reset_blocks();
                info.set_chunked(false);
                // The trial must not carry a validator of the discarded content.
                info.set_etag(None);
                info.add_block(BlockInfo::new(0, 0));
                listener.connect_trial_start(&self.task);
                true
            }
        };

        self.run_chains(&info, &cache, fresh);

        if let Some(error) = cache.take_failure() {
            return Err(error);
        }
        if self.is_canceled() || cache.is_interrupted() {
            return Err(DownloadError::Canceled);
        }
        Ok(())
    }

    /// Runs the block chains and waits for all of them. Failures land in
    /// `cache`.
    fn run_chains(&self, info: &Arc<BreakpointInfo>, cache: &Arc<DownloadCache>, fresh: bool) {
        thread::scope(|scope| {
            let mut workers = Vec::new();

            if fresh {
                let (trial_done, trial) = oneshot::channel();
                let chain = self.chain(0, info, cache).with_trial(trial_done);
                workers.extend(self.spawn_chain(scope, chain, cache));

                // A dropped sender means the trial failed; its error is in the cache.
                if trial.blocking_recv().is_ok() {
                    for index in 1..info.block_count() {
                        workers.extend(self.spawn_block(scope, info, cache, index));
                    }
                }
            } else {
                for index in 0..info.block_count() {
                    workers.extend(self.spawn_block(scope, info, cache, index));
                }
            }

            for worker in workers {
                if worker.join().is_err() {
                    cache.record_failure(DownloadError::Io(io::Error::other(
                        "block worker panicked",
                    )));
                }
            }
        });
    }

    fn spawn_block<'scope, 'env>(
        &self,
        scope: &'scope Scope<'scope, 'env>,
        info: &Arc<BreakpointInfo>,
        cache: &Arc<DownloadCache>,
        index: usize,
    ) -> Option<ScopedJoinHandle<'scope, ()>> {
        let complete = info.block(index).map_or(true, |block| block.is_complete());
        if complete || cache.is_interrupted() {
            return None;
        }
        self.spawn_chain(scope, self.chain(index, info, cache), cache)
    }

    fn spawn_chain<'scope, 'env>(
        &self,
        scope: &'scope Scope<'scope, 'env>,
        mut chain: DownloadChain,
        cache: &Arc<DownloadCache>,
    ) -> Option<ScopedJoinHandle<'scope, ()>> {
        let name = format!("rangefetch-{}-{}", self.task.id(), chain.block_index());
        let worker_cache = Arc::clone(cache);
        let spawned = thread::Builder::new().name(name).spawn_scoped(scope, move || {
            if let Err(e) = chain.run() {
                if !e.is_canceled() {
                    warn!(
                        task_id = chain.task().id(),
                        block = chain.block_index(),
                        error = %e,
                        "Block failed"
                    );
                }
                worker_cache.record_failure(e);
            }
        });
        match spawned {
            Ok(handle) => Some(handle),
            Err(e) => {
                cache.record_failure(DownloadError::Io(e));
                None
            }
        }
    }

    fn chain(&self, index: usize, info: &Arc<BreakpointInfo>, cache: &Arc<DownloadCache>) -> DownloadChain {
        DownloadChain::new(
            index,
            Arc::clone(&self.task),
            Arc::clone(info),
            Arc::clone(cache),
            Arc::clone(&self.context),
            Arc::clone(self.context.interceptors()),
        )
    }

    fn wait_for_file_release(&self, path: &Path, token: &CancellationToken) -> DownloadResult<()> {
        let file_lock = self.context.file_lock();
        while !file_lock.wait_for_release_timeout(path, FILE_LOCK_POLL) {
            if token.is_cancelled() {
                return Err(DownloadError::Canceled);
            }
        }
        Ok(())
    }

    /// Ends a call whose worker could not be started.
    pub(crate) fn abandon(&self, error: DownloadError) -> EndCause {
        self.finish(Err(error))
    }

    fn finish(&self, result: DownloadResult<()>) -> EndCause {
        let (canceled, lock_path, batch) = {
            let mut state = self.state.lock();
            state.finishing = true;
            (state.canceled, state.lock_path.take(), state.batch.take())
        };
        let stream = self.stream.lock().take();
        let store = self.context.store();

        if canceled {
            let report_store = batch.is_none();
            match &stream {
                Some(stream) => stream.cancel(report_store),
                None if report_store => {
                    if let Err(e) = store.on_task_end(self.task.id(), EndCause::Canceled) {
                        warn!(task_id = self.task.id(), error = %e, "Failed to record canceled task");
                    }
                }
                None => {}
            }
            if let Some(batch) = batch {
                batch.drained();
            }
            if let Some(path) = lock_path {
                self.context.file_lock().decrease(&path);
            }
            info!(task_id = self.task.id(), "Download canceled");
            // A dispatcher delivers CANCELED itself when it cancels.
            if self.host.is_none() {
                self.task
                    .listener()
                    .task_end(&self.task, EndCause::Canceled, None);
            }
            return EndCause::Canceled;
        }

        let result = match result {
            Ok(()) => stream.as_ref().map_or(Ok(()), |stream| stream.complete()),
            Err(e) => {
                if let Some(stream) = &stream {
                    if let Err(close) = stream.close() {
                        debug!(task_id = self.task.id(), error = %close, "Closing output after failure failed");
                    }
                }
                Err(e)
            }
        };
        let (cause, error) = match result {
            Ok(()) => (EndCause::Completed, None),
            Err(e) => (e.end_cause(), Some(e)),
        };

        if let Err(e) = store.on_task_end(self.task.id(), cause) {
            warn!(task_id = self.task.id(), error = %e, "Failed to record task end");
        }
        if cause == EndCause::Completed {
            store.mark_file_clear(self.task.id());
        }

        match &error {
            None => info!(task_id = self.task.id(), "Download completed"),
            Some(e) => warn!(task_id = self.task.id(), %cause, error = %e, "Download ended"),
        }
        self.task
            .listener()
            .task_end(&self.task, cause, error.as_ref());
        cause
    }
}
