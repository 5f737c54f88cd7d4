//! One-at-a-time download queue that can be paused.
//!
//! Tasks wait in priority order and run one after another on a looper
//! thread through [`DownloadDispatcher::execute`]. Pausing cancels the
//! running task and puts it back at the head of the queue, so resuming
//! continues it from its breakpoint.

use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::dispatcher::DownloadDispatcher;
use crate::task::DownloadTask;

#[derive(Default)]
struct SerialState {
    waiting: Vec<Arc<DownloadTask>>,
    running: Option<Arc<DownloadTask>>,
    looping: bool,
    paused: bool,
    shut_down: bool,
}

struct SerialInner {
    dispatcher: Arc<DownloadDispatcher>,
    state: Mutex<SerialState>,
}

/// Runs enqueued tasks strictly one at a time.
#[derive(Clone)]
pub struct SerialQueue {
    inner: Arc<SerialInner>,
}

impl SerialQueue {
    pub fn new(dispatcher: Arc<DownloadDispatcher>) -> Self {
        Self {
            inner: Arc::new(SerialInner {
                dispatcher,
                state: Mutex::new(SerialState::default()),
            }),
        }
    }

    /// Adds `task` behind every waiting task of equal or higher priority.
    pub fn enqueue(&self, task: Arc<DownloadTask>) {
        let mut state = self.inner.state.lock();
        if state.shut_down {
            warn!(task_id = task.id(), "Serial queue is shut down, task ignored");
            return;
        }
        let index = state
            .waiting
            .iter()
            .position(|waiting| waiting.priority() < task.priority())
            .unwrap_or(state.waiting.len());
        state.waiting.insert(index, task);
        if !state.paused && !state.looping {
            self.start_looper(&mut state);
        }
    }

    /// Cancels the running task and holds the queue until [`resume`](Self::resume).
    pub fn pause(&self) {
        let mut state = self.inner.state.lock();
        if state.paused {
            warn!(waiting = state.waiting.len(), "Serial queue is already paused");
            return;
        }
        state.paused = true;
        if let Some(task) = state.running.take() {
            self.inner.dispatcher.cancel(&task);
            state.waiting.insert(0, task);
        }
        info!(waiting = state.waiting.len(), "Serial queue paused");
    }

    pub fn resume(&self) {
        let mut state = self.inner.state.lock();
        if !state.paused {
            warn!(waiting = state.waiting.len(), "Serial queue is not paused");
            return;
        }
        state.paused = false;
        if !state.waiting.is_empty() && !state.looping {
            self.start_looper(&mut state);
        }
        info!(waiting = state.waiting.len(), "Serial queue resumed");
    }

    /// Cancels the running task and returns the tasks that never ran.
    pub fn shutdown(&self) -> Vec<Arc<DownloadTask>> {
        let mut state = self.inner.state.lock();
        state.shut_down = true;
        if let Some(task) = state.running.take() {
            self.inner.dispatcher.cancel(&task);
        }
        std::mem::take(&mut state.waiting)
    }

    /// Id of the task running now.
    pub fn working_task_id(&self) -> Option<i32> {
        self.inner.state.lock().running.as_ref().map(|task| task.id())
    }

    pub fn waiting_count(&self) -> usize {
        self.inner.state.lock().waiting.len()
    }

    pub fn is_paused(&self) -> bool {
        self.inner.state.lock().paused
    }

    fn start_looper(&self, state: &mut SerialState) {
        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name("rangefetch-serial".into())
            .spawn(move || inner.run());
        match spawned {
            Ok(_) => state.looping = true,
            Err(e) => warn!(error = %e, "Failed to start serial queue looper"),
        }
    }
}

impl SerialInner {
    fn run(&self) {
        loop {
            let task = {
                let mut state = self.state.lock();
                if state.shut_down || state.paused || state.waiting.is_empty() {
                    state.running = None;
                    state.looping = false;
                    return;
                }
                let task = state.waiting.remove(0);
                state.running = Some(Arc::clone(&task));
                task
            };

            let cause = self.dispatcher.execute(Arc::clone(&task));
            debug!(task_id = task.id(), %cause, "Serial task ended");

            let mut state = self.state.lock();
            if state
                .running
                .as_ref()
                .is_some_and(|running| Arc::ptr_eq(running, &task))
            {
                state.running = None;
            }
        }
    }
}
