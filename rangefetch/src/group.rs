//! Task groups started and stopped as one unit.
//!
//! A [`DownloadGroup`] owns a fixed set of tasks. It runs them either all
//! at once through the dispatcher, or one after another on a dedicated
//! thread, and reports to a single [`GroupListener`] as members end and when
//! the whole group is done.
//!
//! ```ignore
//! let group = DownloadGroup::builder(&engine, "/tmp/downloads")
//!     .listener(Arc::new(MyGroupListener))
//!     .bind_url("https://example.com/a.bin")
//!     .bind_url("https://example.com/b.bin")
//!     .build();
//! group.start_parallel();
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::dispatcher::DownloadDispatcher;
use crate::engine::Engine;
use crate::error::{DownloadError, DownloadResult};
use crate::listener::DownloadListener;
use crate::task::{DownloadTask, EndCause, TaskBuilder};

/// Receives the outcome of a group.
#[allow(unused_variables)]
pub trait GroupListener: Send + Sync {
    /// A member ended; `remaining` members have not ended yet.
    fn task_end(
        &self,
        task: &DownloadTask,
        cause: EndCause,
        error: Option<&DownloadError>,
        remaining: usize,
    ) {
    }

    /// Every member ended, or a serial run was stopped.
    fn queue_end(&self) {}
}

/// Counts member ends for one run of the group.
struct GroupProgress {
    remaining: AtomicUsize,
    listener: Mutex<Option<Arc<dyn GroupListener>>>,
}

impl GroupProgress {
    fn listener(&self) -> Option<Arc<dyn GroupListener>> {
        self.listener.lock().clone()
    }

    fn queue_end(&self) {
        if let Some(listener) = self.listener() {
            listener.queue_end();
        }
    }
}

/// Attached to every member task.
struct GroupAttach {
    progress: Arc<GroupProgress>,
}

impl DownloadListener for GroupAttach {
    fn task_end(&self, task: &DownloadTask, cause: EndCause, error: Option<&DownloadError>) {
        let previous = self
            .progress
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        let Ok(previous) = previous else {
            return;
        };
        let remaining = previous - 1;
        if let Some(listener) = self.progress.listener() {
            listener.task_end(task, cause, error, remaining);
        }
        if remaining == 0 {
            self.progress.queue_end();
        }
    }
}

/// Builder for [`DownloadGroup`].
pub struct GroupBuilder<'a> {
    engine: &'a Engine,
    parent: PathBuf,
    tasks: Vec<Arc<DownloadTask>>,
    progress: Arc<GroupProgress>,
}

impl<'a> GroupBuilder<'a> {
    /// Reports group events to `listener`.
    pub fn listener(self, listener: Arc<dyn GroupListener>) -> Self {
        *self.progress.listener.lock() = Some(listener);
        self
    }

    /// Adds a task for `url` in the group directory, named by the server.
    pub fn bind_url(self, url: impl Into<String>) -> Self {
        let builder = self.engine.task(url, self.parent.clone());
        self.bind(builder)
    }

    /// Adds the task described by `builder`. An equal task already bound is
    /// replaced.
    pub fn bind(mut self, builder: TaskBuilder) -> Self {
        let attach = Arc::new(GroupAttach {
            progress: Arc::clone(&self.progress),
        });
        let task = builder.add_listener(attach).build(self.engine.store());
        match self.tasks.iter().position(|bound| bound.same_task(&task)) {
            Some(index) => self.tasks[index] = task,
            None => self.tasks.push(task),
        }
        self
    }

    pub fn unbind(mut self, id: i32) -> Self {
        self.tasks.retain(|task| task.id() != id);
        self
    }

    pub fn build(self) -> DownloadGroup {
        DownloadGroup {
            dispatcher: Arc::clone(self.engine.dispatcher()),
            tasks: self.tasks,
            progress: self.progress,
            started: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// A fixed set of tasks run and stopped together.
pub struct DownloadGroup {
    dispatcher: Arc<DownloadDispatcher>,
    tasks: Vec<Arc<DownloadTask>>,
    progress: Arc<GroupProgress>,
    started: Arc<AtomicBool>,
}

impl DownloadGroup {
    /// Starts describing a group whose url-only members land in `parent`.
    pub fn builder(engine: &Engine, parent: impl Into<PathBuf>) -> GroupBuilder<'_> {
        GroupBuilder {
            engine,
            parent: parent.into(),
            tasks: Vec::new(),
            progress: Arc::new(GroupProgress {
                remaining: AtomicUsize::new(0),
                listener: Mutex::new(None),
            }),
        }
    }

    pub fn tasks(&self) -> &[Arc<DownloadTask>] {
        &self.tasks
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Hands every member to the dispatcher at once.
    pub fn start_parallel(&self) {
        self.begin();
        info!(tasks = self.tasks.len(), "Starting download group in parallel");
        self.dispatcher.enqueue_all(self.tasks.iter().cloned());
    }

    /// Runs the members one at a time, highest priority first, on a
    /// dedicated thread.
    ///
    /// # Errors
    ///
    /// Fails if the thread cannot be started.
    pub fn start_serial(&self) -> DownloadResult<()> {
        self.begin();
        info!(tasks = self.tasks.len(), "Starting download group serially");

        let mut order: Vec<_> = self.tasks.iter().cloned().collect();
        order.sort_by_key(|task| std::cmp::Reverse(task.priority()));
        let dispatcher = Arc::clone(&self.dispatcher);
        let progress = Arc::clone(&self.progress);
        let started = Arc::clone(&self.started);

        let spawned = thread::Builder::new()
            .name("rangefetch-group".into())
            .spawn(move || {
                for task in order {
                    if !started.load(Ordering::Acquire) {
                        debug!(task_id = task.id(), "Group stopped before task");
                        progress.queue_end();
                        return;
                    }
                    dispatcher.execute(task);
                }
            });
        if let Err(e) = spawned {
            self.started.store(false, Ordering::Release);
            return Err(DownloadError::Io(e));
        }
        Ok(())
    }

    /// Cancels every member that is still waiting or running.
    pub fn stop(&self) {
        if self.started.swap(false, Ordering::AcqRel) {
            let canceled = self.dispatcher.cancel_many(&self.tasks);
            info!(canceled, "Stopped download group");
        }
    }

    fn begin(&self) {
        self.progress
            .remaining
            .store(self.tasks.len(), Ordering::Release);
        self.started.store(true, Ordering::Release);
    }
}
