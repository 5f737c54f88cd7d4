//! Task lifecycle callbacks.
//!
//! One capability trait covers every event a task emits. All methods have
//! no-op defaults, so a listener implements only what it cares about.
//! Callbacks run on engine threads (dispatcher caller, call thread or block
//! worker) and must not block for long.

use std::sync::Arc;

use crate::breakpoint::BreakpointInfo;
use crate::connection::Headers;
use crate::error::DownloadError;
use crate::task::{DownloadTask, EndCause, ResumeFailedCause};

/// Receives task lifecycle events.
#[allow(unused_variables)]
pub trait DownloadListener: Send + Sync {
    /// The task was admitted and starts executing.
    fn task_start(&self, task: &DownloadTask) {}

    /// The first-block trial connection is about to be issued.
    fn connect_trial_start(&self, task: &DownloadTask) {}

    /// The first-block trial connection returned headers.
    fn connect_trial_end(&self, task: &DownloadTask, status: u16, headers: &Headers) {}

    /// A stored breakpoint was unusable; the task restarts from byte 0.
    fn download_from_beginning(
        &self,
        task: &DownloadTask,
        info: &BreakpointInfo,
        cause: ResumeFailedCause,
    ) {
    }

    /// The task resumes from a stored breakpoint.
    fn download_from_breakpoint(&self, task: &DownloadTask, info: &BreakpointInfo) {}

    /// The block layout is final.
    fn split_block_end(&self, task: &DownloadTask, info: &BreakpointInfo) {}

    /// A block is about to connect with these request headers.
    fn connect_start(&self, task: &DownloadTask, block: usize, request_headers: &Headers) {}

    /// A block received its response headers.
    fn connect_end(&self, task: &DownloadTask, block: usize, status: u16, headers: &Headers) {}

    /// A block starts reading its body.
    fn fetch_start(&self, task: &DownloadTask, block: usize, content_length: u64) {}

    /// `increase` more bytes of a block were written.
    fn fetch_progress(&self, task: &DownloadTask, block: usize, increase: u64) {}

    /// A block finished reading its body.
    fn fetch_end(&self, task: &DownloadTask, block: usize, content_length: u64) {}

    /// Terminal event, delivered exactly once per task.
    fn task_end(&self, task: &DownloadTask, cause: EndCause, error: Option<&DownloadError>) {}
}

/// Listener that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl DownloadListener for NoopListener {}

/// Forwards every event to several listeners, in order.
#[derive(Clone, Default)]
pub struct ListenerBunch {
    listeners: Vec<Arc<dyn DownloadListener>>,
}

impl ListenerBunch {
    pub fn new(listeners: Vec<Arc<dyn DownloadListener>>) -> Self {
        Self { listeners }
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    fn each(&self, event: impl Fn(&dyn DownloadListener)) {
        for listener in &self.listeners {
            event(listener.as_ref());
        }
    }
}

impl DownloadListener for ListenerBunch {
    fn task_start(&self, task: &DownloadTask) {
        self.each(|l| l.task_start(task));
    }

    fn connect_trial_start(&self, task: &DownloadTask) {
        self.each(|l| l.connect_trial_start(task));
    }

    fn connect_trial_end(&self, task: &DownloadTask, status: u16, headers: &Headers) {
        self.each(|l| l.connect_trial_end(task, status, headers));
    }

    fn download_from_beginning(
        &self,
        task: &DownloadTask,
        info: &BreakpointInfo,
        cause: ResumeFailedCause,
    ) {
        self.each(|l| l.download_from_beginning(task, info, cause));
    }

    fn download_from_breakpoint(&self, task: &DownloadTask, info: &BreakpointInfo) {
        self.each(|l| l.download_from_breakpoint(task, info));
    }

    fn split_block_end(&self, task: &DownloadTask, info: &BreakpointInfo) {
        self.each(|l| l.split_block_end(task, info));
    }

    fn connect_start(&self, task: &DownloadTask, block: usize, request_headers: &Headers) {
        self.each(|l| l.connect_start(task, block, request_headers));
    }

    fn connect_end(&self, task: &DownloadTask, block: usize, status: u16, headers: &Headers) {
        self.each(|l| l.connect_end(task, block, status, headers));
    }

    fn fetch_start(&self, task: &DownloadTask, block: usize, content_length: u64) {
        self.each(|l| l.fetch_start(task, block, content_length));
    }

    fn fetch_progress(&self, task: &DownloadTask, block: usize, increase: u64) {
        self.each(|l| l.fetch_progress(task, block, increase));
    }

    fn fetch_end(&self, task: &DownloadTask, block: usize, content_length: u64) {
        self.each(|l| l.fetch_end(task, block, content_length));
    }

    fn task_end(&self, task: &DownloadTask, cause: EndCause, error: Option<&DownloadError>) {
        self.each(|l| l.task_end(task, cause, error));
    }
}
