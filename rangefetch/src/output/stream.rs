//! Concurrent multi-block writer for one task.
//!
//! Every block writes through its own [`OutputHandle`]. Written bytes are
//! counted as pending until a sync cycle has flushed and fsynced the handle;
//! only then is the block's durable offset advanced in the store. So the
//! store never claims more than what is on disk.

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::backend::{OutputBackend, OutputHandle};
use super::file_lock::FileLock;
use crate::breakpoint::{BreakpointInfo, BreakpointStore};
use crate::error::{DownloadError, DownloadResult};
use crate::task::{DownloadTask, EndCause};

type SharedHandle = Arc<Mutex<Box<dyn OutputHandle>>>;

/// How often a blocked opener re-checks cancellation while a path is locked.
const FILE_LOCK_POLL: Duration = Duration::from_millis(100);

struct SyncState {
    running: bool,
    last_sync: Instant,
    failure: Option<Arc<io::Error>>,
}

/// Writes concurrently fetched blocks of one task into its target file.
pub struct MultiPointOutputStream {
    task: Arc<DownloadTask>,
    info: Arc<BreakpointInfo>,
    store: Arc<BreakpointStore>,
    backend: Arc<dyn OutputBackend>,
    file_lock: Arc<FileLock>,
    token: CancellationToken,

    handles: DashMap<usize, SharedHandle>,
    /// Set once the first handle has been opened (pre-allocation, dirty mark).
    opened: Mutex<bool>,

    pending: DashMap<usize, u64>,
    all_pending: AtomicU64,

    sync: Mutex<SyncState>,
    sync_done: Condvar,
    canceled: AtomicBool,

    active_cycles: AtomicUsize,
    peak_cycles: AtomicUsize,
    completed_cycles: AtomicU64,
}

impl MultiPointOutputStream {
    pub fn new(
        task: Arc<DownloadTask>,
        info: Arc<BreakpointInfo>,
        store: Arc<BreakpointStore>,
        backend: Arc<dyn OutputBackend>,
        file_lock: Arc<FileLock>,
        token: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            task,
            info,
            store,
            backend,
            file_lock,
            token,
            handles: DashMap::new(),
            opened: Mutex::new(false),
            pending: DashMap::new(),
            all_pending: AtomicU64::new(0),
            sync: Mutex::new(SyncState {
                running: false,
                last_sync: Instant::now(),
                failure: None,
            }),
            sync_done: Condvar::new(),
            canceled: AtomicBool::new(false),
            active_cycles: AtomicUsize::new(0),
            peak_cycles: AtomicUsize::new(0),
            completed_cycles: AtomicU64::new(0),
        })
    }

    pub fn info(&self) -> &Arc<BreakpointInfo> {
        &self.info
    }

    /// Appends `buf` to `block`.
    pub fn write(self: &Arc<Self>, block: usize, buf: &[u8]) -> DownloadResult<()> {
        if self.canceled.load(Ordering::Acquire) || self.token.is_cancelled() {
            return Err(DownloadError::Canceled);
        }
        self.check_failure()?;

        let handle = self.handle(block)?;
        handle.lock().write_all(buf)?;

        let len = buf.len() as u64;
        *self.pending.entry(block).or_insert(0) += len;
        self.all_pending.fetch_add(len, Ordering::AcqRel);

        self.inspect_persist();
        Ok(())
    }

    /// Bytes of `block` written but not yet durable.
    pub fn pending_length(&self, block: usize) -> u64 {
        self.pending.get(&block).map_or(0, |p| *p)
    }

    /// Makes every byte written to `block` durable before returning.
    pub fn ensure_sync_complete(&self, block: usize) -> DownloadResult<()> {
        {
            let mut state = self.sync.lock();
            while state.running {
                self.sync_done.wait(&mut state);
            }
            if self.pending_length(block) == 0 {
                drop(state);
                return self.check_failure();
            }
            state.running = true;
        }
        self.run_sync_cycle();
        self.check_failure()
    }

    /// Makes everything durable and closes all handles.
    pub fn close(&self) -> DownloadResult<()> {
        self.drain();
        self.check_failure()?;
        self.close_handles()?;
        Ok(())
    }

    /// Closes the output of a download that finished successfully.
    ///
    /// An empty resource writes nothing, so its file is created here.
    pub fn complete(&self) -> DownloadResult<()> {
        if self.is_empty_resource() {
            self.handle(0)?;
        }
        self.close()
    }

    fn is_empty_resource(&self) -> bool {
        self.handles.is_empty()
            && !self.info.is_chunked()
            && self.info.block_count() > 0
            && self.info.total_length() == 0
    }

    /// Stops accepting writes, drains what was written and closes all handles.
    ///
    /// With `report_store` the CANCELED end is recorded in the store.
    /// Members of a canceled batch leave that to the batch.
    pub fn cancel(&self, report_store: bool) {
        self.canceled.store(true, Ordering::Release);
        self.drain();
        if let Err(e) = self.close_handles() {
            warn!(task_id = self.task.id(), error = %e, "Closing output after cancel failed");
        }
        if report_store {
            if let Err(e) = self.store.on_task_end(self.task.id(), EndCause::Canceled) {
                warn!(task_id = self.task.id(), error = %e, "Failed to record canceled task");
            }
        }
        debug!(task_id = self.task.id(), "Output stream canceled");
    }

    /// Highest number of sync cycles observed running at the same time.
    pub fn peak_concurrent_syncs(&self) -> usize {
        self.peak_cycles.load(Ordering::Acquire)
    }

    pub fn sync_cycle_count(&self) -> u64 {
        self.completed_cycles.load(Ordering::Acquire)
    }

    fn check_failure(&self) -> DownloadResult<()> {
        match &self.sync.lock().failure {
            Some(e) => Err(DownloadError::SyncFailed(Arc::clone(e))),
            None => Ok(()),
        }
    }

    fn drain(&self) {
        {
            let mut state = self.sync.lock();
            while state.running {
                self.sync_done.wait(&mut state);
            }
            if self.all_pending.load(Ordering::Acquire) == 0 {
                return;
            }
            state.running = true;
        }
        self.run_sync_cycle();
    }

    fn handle(&self, block: usize) -> DownloadResult<SharedHandle> {
        if let Some(handle) = self.handles.get(&block) {
            return Ok(Arc::clone(handle.value()));
        }

        let mut opened = self.opened.lock();
        if let Some(handle) = self.handles.get(&block) {
            return Ok(Arc::clone(handle.value()));
        }

        let path = self.info.path().ok_or_else(|| {
            DownloadError::InvalidTask(format!("{} has no resolved filename", self.task))
        })?;
        let first = !*opened;
        if first {
            while !self.file_lock.wait_for_release_timeout(&path, FILE_LOCK_POLL) {
                if self.token.is_cancelled() {
                    return Err(DownloadError::Canceled);
                }
            }
        }

        let mut handle = self.backend.create(&path, self.task.flush_buffer_size())?;
        if first {
            self.store.mark_file_dirty(self.info.id());
            if self.is_pre_allocate() {
                self.pre_allocate(&path, handle.as_mut())?;
            }
            *opened = true;
        }

        if self.backend.supports_seek() {
            let info = self.info.block(block).ok_or_else(|| {
                DownloadError::InvalidTask(format!("{} has no block {block}", self.task))
            })?;
            handle.seek(info.range_left())?;
        }

        trace!(task_id = self.task.id(), block, "Created output handle");
        let handle: SharedHandle = Arc::new(Mutex::new(handle));
        self.handles.insert(block, Arc::clone(&handle));
        Ok(handle)
    }

    fn is_pre_allocate(&self) -> bool {
        !self.info.is_chunked()
            && self.info.total_length() > 0
            && self
                .task
                .pre_allocate()
                .unwrap_or_else(|| self.backend.supports_seek())
    }

    fn pre_allocate(&self, path: &Path, handle: &mut dyn OutputHandle) -> DownloadResult<()> {
        let total = self.info.total_length();
        let required = total.saturating_sub(self.backend.existing_length(path));
        if required == 0 {
            return Ok(());
        }
        if let Some(available) = self.backend.available_space(path) {
            if available < required {
                return Err(DownloadError::PreAllocate {
                    required,
                    available,
                });
            }
        }
        handle.set_length(total)?;
        debug!(task_id = self.task.id(), total, "Pre-allocated output file");
        Ok(())
    }

    fn inspect_persist(self: &Arc<Self>) {
        if self.all_pending.load(Ordering::Acquire) <= self.task.sync_buffer_size() {
            return;
        }
        {
            let mut state = self.sync.lock();
            if state.running || state.last_sync.elapsed() < self.task.sync_interval() {
                return;
            }
            state.running = true;
        }

        let stream = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("rangefetch-sync-{}", self.task.id()))
            .spawn(move || stream.run_sync_cycle());
        if let Err(e) = spawned {
            warn!(error = %e, "Failed to spawn sync thread, syncing inline");
            self.run_sync_cycle();
        }
    }

    /// Runs one cycle. The caller must have set `running`.
    fn run_sync_cycle(&self) {
        let active = self.active_cycles.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_cycles.fetch_max(active, Ordering::AcqRel);

        let result = self.flush_pending();

        self.active_cycles.fetch_sub(1, Ordering::AcqRel);
        self.completed_cycles.fetch_add(1, Ordering::AcqRel);

        let mut state = self.sync.lock();
        if let Err(e) = result {
            warn!(task_id = self.task.id(), error = %e, "Sync to file system failed");
            state.failure.get_or_insert_with(|| Arc::new(e));
        }
        state.running = false;
        state.last_sync = Instant::now();
        self.sync_done.notify_all();
    }

    fn flush_pending(&self) -> io::Result<()> {
        let snapshot: Vec<(usize, u64)> = self
            .pending
            .iter()
            .filter(|entry| *entry.value() > 0)
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();

        for (block, increase) in snapshot {
            let handle = self.handles.get(&block).map(|h| Arc::clone(h.value()));
            let Some(handle) = handle else {
                continue;
            };
            handle.lock().flush_and_sync()?;
            self.store
                .on_sync_to_filesystem_success(&self.info, block, increase)
                .map_err(io::Error::other)?;

            if let Some(mut pending) = self.pending.get_mut(&block) {
                *pending -= increase;
            }
            self.all_pending.fetch_sub(increase, Ordering::AcqRel);
            trace!(task_id = self.task.id(), block, increase, "Synced block");
        }
        Ok(())
    }

    fn close_handles(&self) -> io::Result<()> {
        let handles: Vec<SharedHandle> = self
            .handles
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.handles.clear();

        let mut first_error = None;
        for handle in handles {
            if let Err(e) = handle.lock().close() {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breakpoint::BlockInfo;
    use crate::output::FileOutputBackend;
    use crate::task::TaskBuilder;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: Arc<BreakpointStore>,
        stream: Arc<MultiPointOutputStream>,
    }

    fn fixture(
        blocks: &[(u64, u64)],
        backend: Arc<dyn OutputBackend>,
        configure: impl FnOnce(TaskBuilder) -> TaskBuilder,
    ) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = BreakpointStore::in_memory();
        let task = configure(TaskBuilder::new("http://x/file", dir.path()).filename("file.bin"))
            .build(&store);
        let info = store.create_and_insert(&task).unwrap();
        for (start, len) in blocks {
            info.add_block(BlockInfo::new(*start, *len));
        }
        store.update(&info).unwrap();

        let stream = MultiPointOutputStream::new(
            task,
            info,
            Arc::clone(&store),
            backend,
            Arc::new(FileLock::new()),
            CancellationToken::new(),
        );
        Fixture {
            _dir: dir,
            store,
            stream,
        }
    }

    #[test]
    fn test_durable_offset_moves_only_after_sync() {
        let f = fixture(&[(0, 8)], Arc::new(FileOutputBackend), |b| b);
        let block = f.stream.info().block(0).unwrap();

        f.stream.write(0, b"abcd").unwrap();
        assert_eq!(block.current_offset(), 0);
        assert_eq!(f.stream.pending_length(0), 4);

        f.stream.ensure_sync_complete(0).unwrap();
        assert_eq!(block.current_offset(), 4);
        assert_eq!(f.stream.pending_length(0), 0);
        assert!(f.store.is_file_dirty(f.stream.info().id()));
    }

    #[test]
    fn test_blocks_land_at_their_offsets() {
        let f = fixture(&[(0, 4), (4, 4)], Arc::new(FileOutputBackend), |b| b);
        f.stream.write(1, b"5678").unwrap();
        f.stream.write(0, b"1234").unwrap();
        f.stream.ensure_sync_complete(0).unwrap();
        f.stream.ensure_sync_complete(1).unwrap();
        f.stream.close().unwrap();

        let path = f.stream.info().path().unwrap();
        assert_eq!(fs::read(path).unwrap(), b"12345678");
        assert_eq!(f.stream.info().total_offset(), 8);
    }

    #[test]
    fn test_complete_creates_file_of_empty_resource() {
        let f = fixture(&[(0, 0)], Arc::new(FileOutputBackend), |b| b);
        f.stream.close().unwrap();
        let path = f.stream.info().path().unwrap();
        assert!(!path.exists());

        f.stream.complete().unwrap();
        assert!(path.exists());
        assert_eq!(fs::read(path).unwrap(), b"");
    }

    #[test]
    fn test_threshold_triggers_background_sync() {
        let f = fixture(&[(0, 1024)], Arc::new(FileOutputBackend), |b| {
            b.sync_buffer_size(16).sync_interval(Duration::ZERO)
        });
        f.stream.write(0, &[7u8; 64]).unwrap();

        let block = f.stream.info().block(0).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while block.current_offset() < 64 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(block.current_offset(), 64);
    }

    #[test]
    fn test_at_most_one_sync_cycle_runs() {
        let f = fixture(
            &[(0, 4096), (4096, 4096), (8192, 4096), (12288, 4096)],
            Arc::new(FileOutputBackend),
            |b| b.sync_buffer_size(1).sync_interval(Duration::ZERO),
        );

        thread::scope(|scope| {
            for block in 0..4 {
                let stream = Arc::clone(&f.stream);
                scope.spawn(move || {
                    for _ in 0..64 {
                        stream.write(block, &[block as u8; 64]).unwrap();
                    }
                    stream.ensure_sync_complete(block).unwrap();
                });
            }
        });

        assert!(f.stream.sync_cycle_count() > 0);
        assert_eq!(f.stream.peak_concurrent_syncs(), 1);
        assert_eq!(f.stream.info().total_offset(), 4 * 4096);
    }

    struct TinyDisk;

    impl OutputBackend for TinyDisk {
        fn create(&self, path: &Path, buffer_size: usize) -> io::Result<Box<dyn OutputHandle>> {
            FileOutputBackend.create(path, buffer_size)
        }

        fn available_space(&self, _path: &Path) -> Option<u64> {
            Some(10)
        }
    }

    #[test]
    fn test_pre_allocate_checks_free_space() {
        let f = fixture(&[(0, 100)], Arc::new(TinyDisk), |b| b.pre_allocate(true));
        let err = f.stream.write(0, b"x").unwrap_err();
        assert!(matches!(
            err,
            DownloadError::PreAllocate {
                required: 100,
                available: 10
            }
        ));
    }

    #[test]
    fn test_pre_allocate_sizes_file() {
        let f = fixture(&[(0, 100)], Arc::new(FileOutputBackend), |b| b);
        f.stream.write(0, b"x").unwrap();
        let path = f.stream.info().path().unwrap();
        assert_eq!(fs::metadata(path).unwrap().len(), 100);
    }

    struct FailingSync;

    struct FailingHandle;

    impl OutputHandle for FailingHandle {
        fn write_all(&mut self, _buf: &[u8]) -> io::Result<()> {
            Ok(())
        }
        fn flush_and_sync(&mut self) -> io::Result<()> {
            Err(io::Error::other("disk gone"))
        }
        fn seek(&mut self, _offset: u64) -> io::Result<()> {
            Ok(())
        }
        fn set_length(&mut self, _len: u64) -> io::Result<()> {
            Ok(())
        }
        fn close(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl OutputBackend for FailingSync {
        fn create(&self, _path: &Path, _buffer_size: usize) -> io::Result<Box<dyn OutputHandle>> {
            Ok(Box::new(FailingHandle))
        }
    }

    #[test]
    fn test_sync_failure_surfaces_to_next_caller() {
        let f = fixture(&[(0, 8)], Arc::new(FailingSync), |b| b.pre_allocate(false));
        f.stream.write(0, b"abcd").unwrap();
        let err = f.stream.ensure_sync_complete(0).unwrap_err();
        assert!(matches!(err, DownloadError::SyncFailed(_)));
        assert!(matches!(f.stream.write(0, b"e"), Err(DownloadError::SyncFailed(_))));
        assert_eq!(f.stream.info().block(0).unwrap().current_offset(), 0);
    }

    #[test]
    fn test_cancel_drains_and_rejects_writes() {
        let f = fixture(&[(0, 8)], Arc::new(FileOutputBackend), |b| b);
        f.stream.write(0, b"abc").unwrap();
        f.stream.cancel(true);

        assert_eq!(f.stream.info().block(0).unwrap().current_offset(), 3);
        assert!(matches!(f.stream.write(0, b"d"), Err(DownloadError::Canceled)));
        assert!(f.store.get(f.stream.info().id()).is_some());
    }
}
