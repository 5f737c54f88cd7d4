//! Admission control and scheduling of download calls.
//!
//! The dispatcher bounds how many tasks run at once, refuses work that
//! would conflict with a running or waiting call, and starts waiting calls
//! by priority as slots free up.
//!
//! ```text
//!  enqueue ──► completed? ──► same task? ──► same file? ──► slot free? ──► running_async
//!                 │               │              │              │
//!             COMPLETED     SAME_TASK_BUSY   FILE_BUSY        ready ──(finish)──┘
//! ```
//!
//! All state lives behind one mutex, so a batch enqueue or cancel is
//! atomic with respect to scheduling. Listener callbacks are delivered
//! after the mutex is released.

mod queue;

use std::io;
use std::sync::{Arc, Weak};
use std::thread;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::download::{CallHost, CancelBatch, DownloadCall};
use crate::engine::EngineContext;
use crate::error::DownloadError;
use crate::task::{DownloadTask, EndCause};
use queue::ReadyQueue;

/// A terminal event produced under the lock and delivered after it.
type EndEvent = (Arc<DownloadTask>, EndCause);

struct DispatcherState {
    ready: ReadyQueue,
    running_async: Vec<Arc<DownloadCall>>,
    running_sync: Vec<Arc<DownloadCall>>,
    max_parallel: usize,
    /// Canceled async calls still draining; they do not hold a slot.
    flying_canceled: usize,
}

impl DispatcherState {
    fn has_capacity(&self) -> bool {
        self.running_async.len().saturating_sub(self.flying_canceled) < self.max_parallel
    }

    fn running(&self) -> impl Iterator<Item = &Arc<DownloadCall>> {
        self.running_async.iter().chain(self.running_sync.iter())
    }

    fn all(&self) -> impl Iterator<Item = &Arc<DownloadCall>> {
        self.ready.iter().chain(self.running())
    }
}

/// Schedules tasks of one engine.
pub struct DownloadDispatcher {
    context: Arc<EngineContext>,
    state: Mutex<DispatcherState>,
    this: Weak<DownloadDispatcher>,
}

impl DownloadDispatcher {
    pub(crate) fn new(context: Arc<EngineContext>) -> Arc<Self> {
        let max_parallel = context.config().max_parallel.max(1);
        Arc::new_cyclic(|this| Self {
            context,
            state: Mutex::new(DispatcherState {
                ready: ReadyQueue::new(),
                running_async: Vec::new(),
                running_sync: Vec::new(),
                max_parallel,
                flying_canceled: 0,
            }),
            this: this.clone(),
        })
    }

    // -------------------------------------------------------------------------
    // Admission
    // -------------------------------------------------------------------------

    /// Admits `task` to run in the background.
    pub fn enqueue(&self, task: Arc<DownloadTask>) {
        self.enqueue_all(vec![task]);
    }

    /// Admits several tasks at once, highest priority first.
    pub fn enqueue_all(&self, tasks: impl IntoIterator<Item = Arc<DownloadTask>>) {
        let mut tasks: Vec<_> = tasks.into_iter().collect();
        tasks.sort_by_key(|task| std::cmp::Reverse(task.priority()));

        let mut events = Vec::new();
        let mut starts = Vec::new();
        {
            let mut state = self.state.lock();
            for task in tasks {
                if let Some(cause) = self.inspect_admission(&state, &task) {
                    events.push((task, cause));
                    continue;
                }
                let call = DownloadCall::new(task, true, Arc::clone(&self.context), Some(self.host()));
                if state.has_capacity() {
                    state.running_async.push(Arc::clone(&call));
                    starts.push(call);
                } else {
                    debug!(task_id = call.task().id(), "Task queued");
                    state.ready.push(call);
                }
            }
        }

        self.deliver(events);
        for call in starts {
            self.start(call);
        }
    }

    /// Runs `task` on the calling thread and returns its terminal cause.
    pub fn execute(&self, task: Arc<DownloadTask>) -> EndCause {
        let call = {
            let mut state = self.state.lock();
            if let Some(cause) = self.inspect_admission(&state, &task) {
                drop(state);
                self.deliver(vec![(task, cause)]);
                return cause;
            }
            let call = DownloadCall::new(task, false, Arc::clone(&self.context), Some(self.host()));
            state.running_sync.push(Arc::clone(&call));
            call
        };

        let cause = call.execute();
        self.finish(&call);
        cause
    }

    fn host(&self) -> Weak<dyn CallHost> {
        self.this.clone()
    }

    /// Why `task` may not be admitted now, if anything.
    fn inspect_admission(&self, state: &DispatcherState, task: &Arc<DownloadTask>) -> Option<EndCause> {
        if self.is_already_completed(task) {
            info!(task_id = task.id(), "Target already downloaded");
            return Some(EndCause::Completed);
        }

        let path = task.path();
        for call in state.all().filter(|call| !call.is_canceled()) {
            if call.task().same_task(task) {
                warn!(task_id = task.id(), "Same task is already queued or running");
                return Some(EndCause::SameTaskBusy);
            }
            if path.is_some() && call.task().path() == path {
                warn!(task_id = task.id(), path = ?path, "Target file is used by another task");
                return Some(EndCause::FileBusy);
            }
        }
        None
    }

    /// The file is on disk and nothing suggests it is partial.
    fn is_already_completed(&self, task: &DownloadTask) -> bool {
        if !task.pass_if_already_completed() {
            return false;
        }
        let Some(path) = task.path() else {
            return false;
        };
        let store = self.context.store();
        self.context.output().exists(&path)
            && store.get(task.id()).is_none()
            && !store.is_file_dirty(task.id())
    }

    fn start(&self, call: Arc<DownloadCall>) {
        let Some(dispatcher) = self.this.upgrade() else {
            return;
        };
        let worker_call = Arc::clone(&call);
        let spawned = thread::Builder::new()
            .name(format!("rangefetch-task-{}", call.task().id()))
            .spawn(move || {
                worker_call.execute();
                dispatcher.finish(&worker_call);
            });

        if let Err(e) = spawned {
            warn!(task_id = call.task().id(), error = %e, "Failed to start download thread");
            self.abandon_start(&call, e);
        }
    }

    /// Ends a call that never ran and frees its slot.
    fn abandon_start(&self, call: &Arc<DownloadCall>, error: io::Error) {
        call.abandon(DownloadError::Io(error));
        self.finish(call);
    }

    /// Removes a call that reported its end and schedules waiting calls.
    fn finish(&self, call: &Arc<DownloadCall>) {
        let mut events = Vec::new();
        let mut starts = Vec::new();
        {
            let mut state = self.state.lock();
            let list = if call.is_async() {
                &mut state.running_async
            } else {
                &mut state.running_sync
            };
            let before = list.len();
            list.retain(|running| !Arc::ptr_eq(running, call));
            let removed = before != list.len();

            if removed && call.is_async() && call.is_canceled() {
                state.flying_canceled = state.flying_canceled.saturating_sub(1);
            }
            if call.is_async() {
                self.process_calls(&mut state, &mut events, &mut starts);
            }
        }

        self.deliver(events);
        for call in starts {
            self.start(call);
        }
    }

    /// Moves ready calls into free slots. A call whose target became busy
    /// while it waited ends with FILE_BUSY instead.
    fn process_calls(
        &self,
        state: &mut DispatcherState,
        events: &mut Vec<EndEvent>,
        starts: &mut Vec<Arc<DownloadCall>>,
    ) {
        while state.has_capacity() {
            let Some(call) = state.ready.pop() else {
                break;
            };
            let path = call.task().path();
            let busy = path.is_some()
                && state
                    .running()
                    .any(|running| !running.is_canceled() && running.task().path() == path);
            if busy {
                events.push((Arc::clone(call.task()), EndCause::FileBusy));
                continue;
            }
            state.running_async.push(Arc::clone(&call));
            starts.push(call);
        }
    }

    fn deliver(&self, events: Vec<EndEvent>) {
        for (task, cause) in events {
            task.listener().task_end(&task, cause, None);
        }
    }

    // -------------------------------------------------------------------------
    // Cancellation
    // -------------------------------------------------------------------------

    /// Cancels `task` wherever it is. Returns false if it was not found or
    /// had already been canceled.
    pub fn cancel(&self, task: &DownloadTask) -> bool {
        self.cancel_matching(|candidate| candidate.id() == task.id()) > 0
    }

    /// Cancels several tasks; returns how many were canceled.
    pub fn cancel_many(&self, tasks: &[Arc<DownloadTask>]) -> usize {
        self.cancel_matching(|candidate| tasks.iter().any(|task| task.id() == candidate.id()))
    }

    /// Cancels every waiting and running task.
    pub fn cancel_all(&self) -> usize {
        self.cancel_matching(|_| true)
    }

    fn cancel_matching(&self, matches: impl Fn(&DownloadTask) -> bool) -> usize {
        let mut events: Vec<EndEvent> = Vec::new();
        let mut starts = Vec::new();
        {
            let mut state = self.state.lock();

            for call in state.ready.remove_where(|call| matches(call.task().as_ref())) {
                events.push((Arc::clone(call.task()), EndCause::Canceled));
            }

            // The store is told once every canceled call has drained.
            let batch = CancelBatch::new(Arc::clone(self.context.store()));
            let canceled: Vec<Arc<DownloadCall>> = state
                .running()
                .filter(|call| matches(call.task().as_ref()) && call.cancel_in(&batch))
                .cloned()
                .collect();
            batch.seal();
            state.flying_canceled += canceled.iter().filter(|call| call.is_async()).count();

            events.extend(
                canceled
                    .iter()
                    .map(|call| (Arc::clone(call.task()), EndCause::Canceled)),
            );

            if !canceled.is_empty() {
                self.process_calls(&mut state, &mut events, &mut starts);
            }
        }

        let count = events
            .iter()
            .filter(|(_, cause)| *cause == EndCause::Canceled)
            .count();
        if count > 0 {
            info!(count, "Canceled tasks");
        }
        self.deliver(events);
        for call in starts {
            self.start(call);
        }
        count
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// The admitted task equal to `task`, if any.
    pub fn find_same_task(&self, task: &DownloadTask) -> Option<Arc<DownloadTask>> {
        let state = self.state.lock();
        let found = state
            .all()
            .filter(|call| !call.is_canceled())
            .find(|call| call.task().same_task(task))
            .map(|call| Arc::clone(call.task()));
        found
    }

    pub fn is_running(&self, task: &DownloadTask) -> bool {
        let state = self.state.lock();
        let running = state
            .running()
            .any(|call| !call.is_canceled() && call.task().same_task(task));
        running
    }

    pub fn is_pending(&self, task: &DownloadTask) -> bool {
        let state = self.state.lock();
        let pending = state
            .ready
            .iter()
            .any(|call| !call.is_canceled() && call.task().same_task(task));
        pending
    }

    /// Changes the concurrency bound (at least 1) and fills new slots.
    pub fn set_max_parallel(&self, max_parallel: usize) {
        let mut events = Vec::new();
        let mut starts = Vec::new();
        {
            let mut state = self.state.lock();
            state.max_parallel = max_parallel.max(1);
            self.process_calls(&mut state, &mut events, &mut starts);
        }
        self.deliver(events);
        for call in starts {
            self.start(call);
        }
    }

    pub fn max_parallel(&self) -> usize {
        self.state.lock().max_parallel
    }

    /// Calls admitted to run in the background and not yet finished.
    pub fn running_count(&self) -> usize {
        self.state.lock().running_async.len()
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().ready.len()
    }
}

impl CallHost for DownloadDispatcher {
    fn is_file_busy_after_run(&self, task: &Arc<DownloadTask>) -> bool {
        let Some(path) = task.path() else {
            return false;
        };
        let state = self.state.lock();
        let busy = state.running().any(|call| {
            !Arc::ptr_eq(call.task(), task)
                && !call.is_canceled()
                && call.task().path().as_ref() == Some(&path)
        });
        busy
    }

    fn is_running_id(&self, id: i32) -> bool {
        let state = self.state.lock();
        let running = state
            .running()
            .any(|call| !call.is_canceled() && call.task().id() == id);
        running
    }
}
