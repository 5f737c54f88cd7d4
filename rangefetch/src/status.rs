//! Where a task stands, from the dispatcher's and the store's point of view.

use std::fmt;
use std::path::PathBuf;

use crate::breakpoint::BreakpointInfo;
use crate::engine::{Engine, EngineContext};
use crate::task::{DownloadTask, TaskTarget};

/// Status of a task as seen from outside its call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    /// Admitted and waiting for a slot.
    Pending,
    Running,
    /// The target file is on disk and no breakpoint says it is partial.
    Completed,
    /// A partial download exists and nothing is running it.
    Idle,
    /// The target may be complete, but without a filename it cannot be found.
    Unknown,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Idle => "idle",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

impl Engine {
    /// Current status of `task`.
    pub fn status(&self, task: &DownloadTask) -> TaskStatus {
        let stored = completed_or_unknown(self.context(), task);
        if stored == TaskStatus::Completed {
            return stored;
        }
        let dispatcher = self.dispatcher();
        if dispatcher.is_pending(task) {
            TaskStatus::Pending
        } else if dispatcher.is_running(task) {
            TaskStatus::Running
        } else {
            stored
        }
    }

    pub fn is_completed(&self, task: &DownloadTask) -> bool {
        completed_or_unknown(self.context(), task) == TaskStatus::Completed
    }

    /// Whether an equal task is waiting or running.
    pub fn is_same_task_pending_or_running(&self, task: &DownloadTask) -> bool {
        self.dispatcher().find_same_task(task).is_some()
    }

    /// Snapshot of the breakpoint of the task that would download `url`
    /// into `parent`, named `filename` or by the server.
    pub fn current_info(
        &self,
        url: &str,
        parent: impl Into<PathBuf>,
        filename: Option<&str>,
    ) -> Option<BreakpointInfo> {
        let target = match filename {
            Some(filename) => TaskTarget::file(url, parent, filename),
            None => TaskTarget::directory(url, parent),
        };
        let store = self.store();
        let id = store.find_or_create_id(&target);
        store.get(id).map(|info| info.copy())
    }
}

/// COMPLETED, IDLE or UNKNOWN judged from the store and the file system.
pub fn completed_or_unknown(context: &EngineContext, task: &DownloadTask) -> TaskStatus {
    let store = context.store();
    let output = context.output();
    let parent = task.parent_dir();
    let exists = |name: &str| output.exists(&parent.join(name));
    let filename = task.filename();

    match store.get(task.id()) {
        Some(info) => {
            let Some(stored_name) = info.filename() else {
                return TaskStatus::Unknown;
            };
            match filename {
                Some(name) if name == stored_name && exists(name.as_str()) => {
                    if info.total_length() > 0 && info.total_offset() == info.total_length() {
                        TaskStatus::Completed
                    } else {
                        TaskStatus::Idle
                    }
                }
                None if exists(stored_name.as_str()) => TaskStatus::Idle,
                _ => TaskStatus::Unknown,
            }
        }
        None => {
            let name = match filename {
                Some(name) => Some(name),
                None => store.response_filename(task.url()),
            };
            match name {
                Some(name) if exists(name.as_str()) => TaskStatus::Completed,
                _ => TaskStatus::Unknown,
            }
        }
    }
}
