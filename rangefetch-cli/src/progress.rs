//! Terminal progress for running downloads.
//!
//! Each task gets a [`TaskProgress`] listener that drives one bar of a
//! shared [`MultiProgress`] and reports the task's terminal event back to
//! the command waiting on it.

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::sync::mpsc::UnboundedSender;

use rangefetch::breakpoint::BreakpointInfo;
use rangefetch::error::DownloadError;
use rangefetch::task::{DownloadTask, EndCause, ResumeFailedCause};
use rangefetch::DownloadListener;

const BAR_TEMPLATE: &str =
    "{prefix:20!} [{bar:30}] {bytes}/{total_bytes} {bytes_per_sec} {eta} {msg}";
const SPINNER_TEMPLATE: &str = "{prefix:20!} {spinner} {bytes} {bytes_per_sec} {msg}";

/// Terminal event of one task.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub id: i32,
    pub url: String,
    pub cause: EndCause,
    pub error: Option<String>,
}

/// Listener rendering one task as a progress bar.
pub struct TaskProgress {
    bar: ProgressBar,
    done: UnboundedSender<TaskOutcome>,
}

impl TaskProgress {
    pub fn new(multi: &MultiProgress, url: &str, done: UnboundedSender<TaskOutcome>) -> Self {
        let bar = multi.add(ProgressBar::new(0));
        bar.set_style(spinner_style());
        bar.set_prefix(label_for_url(url));
        bar.set_message("waiting");
        Self { bar, done }
    }

    fn show_layout(&self, task: &DownloadTask, info: &BreakpointInfo) {
        if let Some(name) = task.filename() {
            self.bar.set_prefix(name);
        }
        if info.is_chunked() {
            self.bar.set_style(spinner_style());
        } else {
            self.bar.set_style(bar_style());
            self.bar.set_length(info.total_length());
        }
        self.bar.set_message("");
    }
}

impl DownloadListener for TaskProgress {
    fn task_start(&self, _task: &DownloadTask) {
        self.bar.set_message("starting");
    }

    fn connect_trial_start(&self, _task: &DownloadTask) {
        self.bar.set_message("connecting");
    }

    fn download_from_beginning(
        &self,
        _task: &DownloadTask,
        _info: &BreakpointInfo,
        cause: ResumeFailedCause,
    ) {
        self.bar.set_position(0);
        self.bar.set_message(format!("restarted ({})", cause));
    }

    fn download_from_breakpoint(&self, task: &DownloadTask, info: &BreakpointInfo) {
        self.show_layout(task, info);
        self.bar.set_position(info.total_offset());
    }

    fn split_block_end(&self, task: &DownloadTask, info: &BreakpointInfo) {
        self.show_layout(task, info);
    }

    fn fetch_progress(&self, _task: &DownloadTask, _block: usize, increase: u64) {
        self.bar.inc(increase);
    }

    fn task_end(&self, task: &DownloadTask, cause: EndCause, error: Option<&DownloadError>) {
        match cause {
            EndCause::Completed => self.bar.finish_with_message("done"),
            other => self.bar.abandon_with_message(other.to_string()),
        }
        // The command stops listening once every task has reported.
        let _ = self.done.send(TaskOutcome {
            id: task.id(),
            url: task.url().to_string(),
            cause,
            error: error.map(|e| e.to_string()),
        });
    }
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template(BAR_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template(SPINNER_TEMPLATE).unwrap_or_else(|_| ProgressStyle::default_spinner())
}

/// Short label for a url until the filename is known.
fn label_for_url(url: &str) -> String {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty())
        .unwrap_or(url)
        .to_string()
}
