//! Download task description and terminal outcomes.
//!
//! A [`DownloadTask`] is immutable once built except for two late-bound
//! values: the filename (when only a directory was given, the server names
//! the file) and the redirect location learned on the first connect.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::breakpoint::{BreakpointStore, FilenameHolder};
use crate::config::TaskDefaults;
use crate::listener::{DownloadListener, ListenerBunch, NoopListener};

// =============================================================================
// Outcomes
// =============================================================================

/// Terminal outcome of a task. Every task reports exactly one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EndCause {
    Completed,
    Canceled,
    Error,
    PreAllocateFailed,
    FileBusy,
    SameTaskBusy,
}

impl fmt::Display for EndCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Completed => "COMPLETED",
            Self::Canceled => "CANCELED",
            Self::Error => "ERROR",
            Self::PreAllocateFailed => "PRE_ALLOCATE_FAILED",
            Self::FileBusy => "FILE_BUSY",
            Self::SameTaskBusy => "SAME_TASK_BUSY",
        };
        f.write_str(name)
    }
}

/// Why a stored breakpoint could not be resumed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResumeFailedCause {
    /// The stored block layout is unusable.
    InfoDirty,
    /// The partially written file is gone.
    FileNotExist,
    /// The output backend cannot continue this layout.
    OutputStreamNotSupport,
    /// The server's etag differs from the stored one.
    ResponseEtagChanged,
    /// The server answered 412 to the conditional request.
    ResponsePreconditionFailed,
    /// The server answered 201 to a request not starting at zero.
    ResponseCreatedRangeNotFrom0,
    /// The server answered 205 to a request not starting at zero.
    ResponseResetRangeNotFrom0,
}

impl fmt::Display for ResumeFailedCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InfoDirty => "INFO_DIRTY",
            Self::FileNotExist => "FILE_NOT_EXIST",
            Self::OutputStreamNotSupport => "OUTPUT_STREAM_NOT_SUPPORT",
            Self::ResponseEtagChanged => "RESPONSE_ETAG_CHANGED",
            Self::ResponsePreconditionFailed => "RESPONSE_PRECONDITION_FAILED",
            Self::ResponseCreatedRangeNotFrom0 => "RESPONSE_CREATED_RANGE_NOT_FROM_0",
            Self::ResponseResetRangeNotFrom0 => "RESPONSE_RESET_RANGE_NOT_FROM_0",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Target
// =============================================================================

/// Where a task's bytes come from and where they go.
///
/// Clones share the filename holder, so a name resolved from a response is
/// visible through every clone.
#[derive(Clone, Debug)]
pub struct TaskTarget {
    url: String,
    parent: PathBuf,
    filename: Arc<FilenameHolder>,
    filename_from_response: bool,
}

impl TaskTarget {
    /// Target with an explicit filename.
    pub fn file(url: impl Into<String>, parent: impl Into<PathBuf>, filename: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            parent: parent.into(),
            filename: Arc::new(FilenameHolder::new(Some(filename.into()))),
            filename_from_response: false,
        }
    }

    /// Target naming only a directory; the filename comes from the response.
    pub fn directory(url: impl Into<String>, parent: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            parent: parent.into(),
            filename: Arc::new(FilenameHolder::default()),
            filename_from_response: true,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn parent(&self) -> &Path {
        &self.parent
    }

    pub fn filename(&self) -> Option<String> {
        self.filename.get()
    }

    pub fn filename_holder(&self) -> &Arc<FilenameHolder> {
        &self.filename
    }

    /// True when the caller supplied only a directory.
    pub fn is_filename_from_response(&self) -> bool {
        self.filename_from_response
    }

    /// Resolved target path, once the filename is known.
    pub fn path(&self) -> Option<PathBuf> {
        self.filename.get().map(|name| self.parent.join(name))
    }

    /// The path exactly as the caller provided it.
    fn provided_path(&self) -> PathBuf {
        if self.filename_from_response {
            self.parent.clone()
        } else {
            self.path().unwrap_or_else(|| self.parent.clone())
        }
    }

    /// Whether both targets describe the same download, ignoring task ids.
    pub fn same_target(&self, other: &TaskTarget) -> bool {
        if self.url != other.url {
            return false;
        }
        if self.provided_path() == other.provided_path() {
            return true;
        }
        if self.parent != other.parent {
            return false;
        }
        match (self.filename(), other.filename()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

// =============================================================================
// Task
// =============================================================================

/// One resource to download.
pub struct DownloadTask {
    id: i32,
    target: TaskTarget,
    priority: i32,
    read_buffer_size: usize,
    flush_buffer_size: usize,
    sync_buffer_size: u64,
    sync_interval: Duration,
    progress_interval: Duration,
    pre_allocate: Option<bool>,
    pass_if_already_completed: bool,
    connection_count: Option<usize>,
    headers: Vec<(String, String)>,
    listener: Arc<dyn DownloadListener>,
    redirect_location: Mutex<Option<String>>,
}

impl DownloadTask {
    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn url(&self) -> &str {
        self.target.url()
    }

    pub fn target(&self) -> &TaskTarget {
        &self.target
    }

    pub fn parent_dir(&self) -> &Path {
        self.target.parent()
    }

    pub fn filename(&self) -> Option<String> {
        self.target.filename()
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.target.path()
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn read_buffer_size(&self) -> usize {
        self.read_buffer_size
    }

    pub fn flush_buffer_size(&self) -> usize {
        self.flush_buffer_size
    }

    pub fn sync_buffer_size(&self) -> u64 {
        self.sync_buffer_size
    }

    pub fn sync_interval(&self) -> Duration {
        self.sync_interval
    }

    pub fn progress_interval(&self) -> Duration {
        self.progress_interval
    }

    /// Explicit pre-allocation choice, `None` to follow the output backend.
    pub fn pre_allocate(&self) -> Option<bool> {
        self.pre_allocate
    }

    pub fn pass_if_already_completed(&self) -> bool {
        self.pass_if_already_completed
    }

    /// Fixed number of connections, overriding the split strategy.
    pub fn connection_count(&self) -> Option<usize> {
        self.connection_count
    }

    /// Caller-supplied request headers.
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn listener(&self) -> &Arc<dyn DownloadListener> {
        &self.listener
    }

    /// Location learned by following redirects, used by later connections.
    pub fn redirect_location(&self) -> Option<String> {
        self.redirect_location.lock().clone()
    }

    pub fn set_redirect_location(&self, location: impl Into<String>) {
        *self.redirect_location.lock() = Some(location.into());
    }

    /// The URL new connections should use.
    pub fn effective_url(&self) -> String {
        self.redirect_location()
            .unwrap_or_else(|| self.target.url().to_string())
    }

    /// Task equality: same id, or same url and target file.
    pub fn same_task(&self, other: &DownloadTask) -> bool {
        self.id == other.id || self.target.same_target(&other.target)
    }
}

impl fmt::Debug for DownloadTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadTask")
            .field("id", &self.id)
            .field("url", &self.target.url)
            .field("parent", &self.target.parent)
            .field("filename", &self.target.filename())
            .field("priority", &self.priority)
            .finish()
    }
}

impl fmt::Display for DownloadTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{} {}", self.id, self.target.url)
    }
}

/// Builder for [`DownloadTask`].
///
/// The id is assigned by [`TaskBuilder::build`] through the breakpoint store
/// so that equivalent tasks share one breakpoint.
pub struct TaskBuilder {
    target: TaskTarget,
    priority: i32,
    read_buffer_size: usize,
    flush_buffer_size: usize,
    sync_buffer_size: u64,
    sync_interval: Duration,
    progress_interval: Duration,
    pre_allocate: Option<bool>,
    pass_if_already_completed: bool,
    connection_count: Option<usize>,
    headers: Vec<(String, String)>,
    listener: Arc<dyn DownloadListener>,
}

impl TaskBuilder {
    /// Task downloading `url` into the directory `parent`.
    pub fn new(url: impl Into<String>, parent: impl Into<PathBuf>) -> Self {
        Self::with_defaults(url, parent, &TaskDefaults::default())
    }

    /// Task downloading `url` into `parent`, starting from `defaults`.
    pub fn with_defaults(
        url: impl Into<String>,
        parent: impl Into<PathBuf>,
        defaults: &TaskDefaults,
    ) -> Self {
        Self {
            target: TaskTarget::directory(url, parent),
            priority: 0,
            read_buffer_size: defaults.read_buffer_size,
            flush_buffer_size: defaults.flush_buffer_size,
            sync_buffer_size: defaults.sync_buffer_size,
            sync_interval: defaults.sync_interval,
            progress_interval: defaults.progress_interval,
            pre_allocate: defaults.pre_allocate,
            pass_if_already_completed: defaults.pass_if_already_completed,
            connection_count: None,
            headers: Vec::new(),
            listener: Arc::new(NoopListener),
        }
    }

    /// Use an explicit filename instead of the server-provided one.
    pub fn filename(mut self, filename: impl Into<String>) -> Self {
        self.target = TaskTarget::file(self.target.url, self.target.parent, filename);
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1);
        self
    }

    pub fn flush_buffer_size(mut self, size: usize) -> Self {
        self.flush_buffer_size = size;
        self
    }

    pub fn sync_buffer_size(mut self, size: u64) -> Self {
        self.sync_buffer_size = size;
        self
    }

    pub fn sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    pub fn progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn pre_allocate(mut self, enabled: bool) -> Self {
        self.pre_allocate = Some(enabled);
        self
    }

    pub fn pass_if_already_completed(mut self, pass: bool) -> Self {
        self.pass_if_already_completed = pass;
        self
    }

    /// Force the number of blocks (clamped to at least one).
    pub fn connection_count(mut self, count: usize) -> Self {
        self.connection_count = Some(count.max(1));
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn listener(mut self, listener: Arc<dyn DownloadListener>) -> Self {
        self.listener = listener;
        self
    }

    /// Adds `listener` after the one already set.
    pub fn add_listener(mut self, listener: Arc<dyn DownloadListener>) -> Self {
        self.listener = Arc::new(ListenerBunch::new(vec![self.listener, listener]));
        self
    }

    /// Assigns the task id and returns the shareable task.
    pub fn build(self, store: &BreakpointStore) -> Arc<DownloadTask> {
        if self.target.is_filename_from_response() && self.target.filename().is_none() {
            if let Some(name) = store.response_filename(self.target.url()) {
                self.target.filename_holder().set(name);
            }
        }
        let id = store.find_or_create_id(&self.target);

        Arc::new(DownloadTask {
            id,
            target: self.target,
            priority: self.priority,
            read_buffer_size: self.read_buffer_size,
            flush_buffer_size: self.flush_buffer_size,
            sync_buffer_size: self.sync_buffer_size,
            sync_interval: self.sync_interval,
            progress_interval: self.progress_interval,
            pre_allocate: self.pre_allocate,
            pass_if_already_completed: self.pass_if_already_completed,
            connection_count: self.connection_count,
            headers: self.headers,
            listener: self.listener,
            redirect_location: Mutex::new(None),
        })
    }
}
