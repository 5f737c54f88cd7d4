//! Authoritative map of task id → breakpoint, with id allocation.
//!
//! The store answers from memory and mirrors changes into a
//! [`BreakpointPersistence`] backend. With a remit delay configured, records of
//! freshly started tasks stay memory-only until the delay elapses, so short
//! downloads never touch the backend at all.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use super::info::BreakpointInfo;
use super::persistence::{BreakpointPersistence, MemoryPersistence, PersistOp};
use crate::error::StoreError;
use crate::task::{DownloadTask, EndCause, TaskTarget};

/// Smallest id the store hands out.
pub const FIRST_ID: i32 = 1;

/// Delay before a remitted record is written through.
pub const DEFAULT_REMIT_DELAY: Duration = Duration::from_millis(1500);

#[derive(Default)]
struct StoreState {
    infos: HashMap<i32, Arc<BreakpointInfo>>,
    unstored: HashMap<i32, TaskTarget>,
    sorted_ids: Vec<i32>,
    response_filenames: HashMap<String, String>,
    dirty_files: HashSet<i32>,
}

impl StoreState {
    /// Smallest unused id: the first gap in the occupied ids, or max + 1.
    fn allocate_id(&mut self) -> i32 {
        let mut expected = FIRST_ID;
        let mut index = self.sorted_ids.len();
        for (i, id) in self.sorted_ids.iter().enumerate() {
            if *id != expected {
                index = i;
                break;
            }
            expected += 1;
        }
        self.sorted_ids.insert(index, expected);
        expected
    }

    fn occupy(&mut self, id: i32) {
        if let Err(index) = self.sorted_ids.binary_search(&id) {
            self.sorted_ids.insert(index, id);
        }
    }

    fn release(&mut self, id: i32) {
        if self.unstored.contains_key(&id) {
            return;
        }
        if let Ok(index) = self.sorted_ids.binary_search(&id) {
            self.sorted_ids.remove(index);
        }
    }
}

/// Breakpoint store shared by every component of one engine.
pub struct BreakpointStore {
    state: Mutex<StoreState>,
    persistence: Arc<dyn BreakpointPersistence>,
    remit: Option<Arc<RemitSync>>,
}

impl BreakpointStore {
    /// Opens a store over `persistence`, loading every record it holds.
    pub fn open(
        persistence: Arc<dyn BreakpointPersistence>,
        remit_delay: Option<Duration>,
    ) -> Result<Arc<Self>, StoreError> {
        let persisted = persistence.load_all()?;

        let mut state = StoreState {
            response_filenames: persisted.response_filenames,
            ..StoreState::default()
        };
        for record in &persisted.records {
            state.infos
                .insert(record.id, Arc::new(BreakpointInfo::from_record(record)));
            state.occupy(record.id);
        }
        debug!(records = state.infos.len(), "Loaded breakpoint store");

        let store = Arc::new_cyclic(|weak: &Weak<BreakpointStore>| BreakpointStore {
            state: Mutex::new(state),
            persistence,
            remit: remit_delay.map(|delay| RemitSync::spawn(delay, weak.clone())),
        });
        Ok(store)
    }

    /// Store over a fresh [`MemoryPersistence`] backend.
    pub fn in_memory() -> Arc<Self> {
        let state = StoreState::default();
        Arc::new(BreakpointStore {
            state: Mutex::new(state),
            persistence: Arc::new(MemoryPersistence::new()),
            remit: None,
        })
    }

    pub fn get(&self, id: i32) -> Option<Arc<BreakpointInfo>> {
        self.state.lock().infos.get(&id).cloned()
    }

    /// Creates the breakpoint for a task that has none yet.
    pub fn create_and_insert(&self, task: &DownloadTask) -> Result<Arc<BreakpointInfo>, StoreError> {
        let info = Arc::new(BreakpointInfo::for_target(task.id(), task.target()));
        {
            let mut state = self.state.lock();
            state.infos.insert(task.id(), Arc::clone(&info));
            state.unstored.remove(&task.id());
            state.occupy(task.id());
        }
        if self.is_write_through(task.id()) {
            self.persistence.upsert(info.to_record())?;
        }
        Ok(info)
    }

    /// Id of the breakpoint equivalent to `target`, allocating one if needed.
    pub fn find_or_create_id(&self, target: &TaskTarget) -> i32 {
        let mut state = self.state.lock();
        if let Some(info) = state.infos.values().find(|info| info.is_same_from(target)) {
            return info.id();
        }
        if let Some((id, _)) = state
            .unstored
            .iter()
            .find(|(_, other)| other.same_target(target))
        {
            return *id;
        }
        let id = state.allocate_id();
        state.unstored.insert(id, target.clone());
        id
    }

    /// Stores `info` as the current state of its id.
    ///
    /// Returns false if no breakpoint exists for the id.
    pub fn update(&self, info: &Arc<BreakpointInfo>) -> Result<bool, StoreError> {
        let filename = info
            .filename()
            .filter(|_| info.is_task_only_provided_parent_path());
        if let Some(filename) = filename {
            self.remember_response_filename(info.url(), &filename);
        }

        {
            let mut state = self.state.lock();
            match state.infos.get(&info.id()) {
                Some(stored) if Arc::ptr_eq(stored, info) => {}
                Some(_) => {
                    state.infos.insert(info.id(), Arc::new(info.copy()));
                }
                None => return Ok(false),
            }
        }
        if self.is_write_through(info.id()) {
            self.persistence.upsert(info.to_record())?;
        }
        Ok(true)
    }

    /// Records that `increase` more bytes of a block reached the disk.
    pub fn on_sync_to_filesystem_success(
        &self,
        info: &Arc<BreakpointInfo>,
        block_index: usize,
        increase: u64,
    ) -> Result<(), StoreError> {
        let current_offset = {
            let state = self.state.lock();
            let stored = state
                .infos
                .get(&info.id())
                .filter(|stored| Arc::ptr_eq(stored, info))
                .ok_or(StoreError::NotOnStore(info.id()))?;
            let block = stored
                .block(block_index)
                .ok_or(StoreError::NotOnStore(info.id()))?;
            block.increase_current_offset(increase);
            block.current_offset()
        };
        if self.is_write_through(info.id()) {
            self.persistence
                .update_block_offset(info.id(), block_index, current_offset)?;
        }
        Ok(())
    }

    pub fn on_task_start(&self, id: i32) {
        if let Some(remit) = &self.remit {
            remit.schedule(id);
        }
    }

    /// Task reached a terminal state. COMPLETED drops the breakpoint.
    pub fn on_task_end(&self, id: i32, cause: EndCause) -> Result<(), StoreError> {
        if cause == EndCause::Completed {
            return self.remove(id);
        }
        if let Some(remit) = &self.remit {
            remit.end(id);
            self.sync_to_persistence(id)?;
        }
        Ok(())
    }

    /// Several running tasks were canceled together; persist them in one batch.
    pub fn bunch_task_canceled(&self, ids: &[i32]) -> Result<(), StoreError> {
        let Some(remit) = &self.remit else {
            return Ok(());
        };
        let mut ops = Vec::with_capacity(ids.len());
        for id in ids {
            remit.end(*id);
            if let Some(info) = self.get(*id) {
                ops.push(PersistOp::Upsert(info.to_record()));
            }
        }
        if !ops.is_empty() {
            self.persistence.apply(ops)?;
        }
        Ok(())
    }

    /// Deletes the breakpoint and frees its id.
    pub fn remove(&self, id: i32) -> Result<(), StoreError> {
        if let Some(remit) = &self.remit {
            remit.end(id);
        }
        {
            let mut state = self.state.lock();
            state.infos.remove(&id);
            state.release(id);
        }
        self.persistence.remove(id)?;
        Ok(())
    }

    /// Drops an idle breakpoint that another task has taken over.
    pub fn discard(&self, id: i32) -> Result<(), StoreError> {
        self.remove(id)
    }

    /// Another stored breakpoint equivalent to `target`, other than `ignored`.
    pub fn find_another_info_from_compare(
        &self,
        target: &TaskTarget,
        ignored: &Arc<BreakpointInfo>,
    ) -> Option<Arc<BreakpointInfo>> {
        self.state
            .lock()
            .infos
            .values()
            .find(|info| !Arc::ptr_eq(info, ignored) && info.is_same_from(target))
            .cloned()
    }

    /// Filename a server previously assigned to `url`.
    pub fn response_filename(&self, url: &str) -> Option<String> {
        self.state.lock().response_filenames.get(url).cloned()
    }

    pub fn remember_response_filename(&self, url: &str, filename: &str) {
        let changed = {
            let mut state = self.state.lock();
            state
                .response_filenames
                .insert(url.to_string(), filename.to_string())
                .as_deref()
                != Some(filename)
        };
        if changed {
            if let Err(e) = self.persistence.update_response_filename(url, filename) {
                warn!(url, error = %e, "Failed to persist response filename");
            }
        }
    }

    pub fn mark_file_dirty(&self, id: i32) {
        self.state.lock().dirty_files.insert(id);
    }

    pub fn mark_file_clear(&self, id: i32) {
        self.state.lock().dirty_files.remove(&id);
    }

    pub fn is_file_dirty(&self, id: i32) -> bool {
        self.state.lock().dirty_files.contains(&id)
    }

    fn is_write_through(&self, id: i32) -> bool {
        self.remit.as_ref().map_or(true, |remit| remit.is_free(id))
    }

    /// Writes the in-memory record of `id` to the backend.
    fn sync_to_persistence(&self, id: i32) -> Result<(), StoreError> {
        if let Some(info) = self.get(id) {
            self.persistence.upsert(info.to_record())?;
        }
        Ok(())
    }

    #[cfg(test)]
    fn allocate_id(&self) -> i32 {
        self.state.lock().allocate_id()
    }

    #[cfg(test)]
    fn live_ids(&self) -> Vec<i32> {
        self.state.lock().sorted_ids.clone()
    }
}

impl Drop for BreakpointStore {
    fn drop(&mut self) {
        if let Some(remit) = &self.remit {
            remit.shutdown();
        }
    }
}

// =============================================================================
// Remit
// =============================================================================

#[derive(Default)]
struct RemitState {
    pending: HashMap<i32, Instant>,
    free: HashSet<i32>,
    handling: Option<i32>,
    shutdown: bool,
}

/// Delays persistence of started tasks on a dedicated thread.
struct RemitSync {
    delay: Duration,
    state: Mutex<RemitState>,
    changed: Condvar,
}

impl RemitSync {
    fn spawn(delay: Duration, store: Weak<BreakpointStore>) -> Arc<Self> {
        let remit = Arc::new(Self {
            delay,
            state: Mutex::new(RemitState::default()),
            changed: Condvar::new(),
        });
        let worker = Arc::clone(&remit);
        let spawned = thread::Builder::new()
            .name("rangefetch-remit".into())
            .spawn(move || worker.run(store));
        if let Err(e) = spawned {
            // Without the worker every id stays memory-only until its task ends.
            warn!(error = %e, "Failed to start remit worker");
        }
        remit
    }

    fn run(&self, store: Weak<BreakpointStore>) {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                return;
            }
            let next = state
                .pending
                .iter()
                .min_by_key(|(_, due)| **due)
                .map(|(id, due)| (*id, *due));
            let Some((id, due)) = next else {
                self.changed.wait(&mut state);
                continue;
            };
            if due > Instant::now() {
                self.changed.wait_until(&mut state, due);
                continue;
            }

            state.pending.remove(&id);
            state.handling = Some(id);
            drop(state);

            if let Some(store) = store.upgrade() {
                if let Err(e) = store.sync_to_persistence(id) {
                    warn!(task_id = id, error = %e, "Remit sync to persistence failed");
                }
            }

            state = self.state.lock();
            state.free.insert(id);
            state.handling = None;
            self.changed.notify_all();
        }
    }

    fn schedule(&self, id: i32) {
        let mut state = self.state.lock();
        state.free.remove(&id);
        state.pending.insert(id, Instant::now() + self.delay);
        self.changed.notify_all();
    }

    fn is_free(&self, id: i32) -> bool {
        self.state.lock().free.contains(&id)
    }

    /// Cancels a pending write, waiting out one already in progress.
    fn settle(&self, id: i32) -> parking_lot::MutexGuard<'_, RemitState> {
        let mut state = self.state.lock();
        state.pending.remove(&id);
        while state.handling == Some(id) {
            self.changed.wait(&mut state);
        }
        state
    }

    /// The task ended: later writes for `id` wait for the next start.
    fn end(&self, id: i32) {
        self.settle(id).free.remove(&id);
    }

    fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.changed.notify_all();
    }
}
