//! Durability contract for breakpoint records.
//!
//! The store keeps the authoritative copy in memory and mirrors every change
//! into a [`BreakpointPersistence`] backend. Backends only need to store plain
//! records; batches passed to [`BreakpointPersistence::apply`] must be applied
//! atomically.

use std::collections::HashMap;
use std::path::PathBuf;

use parking_lot::Mutex;

use crate::error::PersistenceError;

/// Persisted shape of a task's breakpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BreakpointRecord {
    pub id: i32,
    pub url: String,
    pub etag: Option<String>,
    pub parent_path: PathBuf,
    pub filename: Option<String>,
    pub task_only_parent_path: bool,
    pub chunked: bool,
    pub blocks: Vec<BlockRecord>,
}

/// Persisted shape of one block, owned by a [`BreakpointRecord`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockRecord {
    pub block_index: usize,
    pub start_offset: u64,
    pub content_length: u64,
    pub current_offset: u64,
}

/// Everything a backend holds, as loaded on startup.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PersistedState {
    pub records: Vec<BreakpointRecord>,
    pub response_filenames: HashMap<String, String>,
}

/// One mutation of persisted state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PersistOp {
    /// Insert or fully replace a record, blocks included.
    Upsert(BreakpointRecord),
    /// Move one block's durable offset.
    UpdateBlockOffset {
        id: i32,
        block_index: usize,
        current_offset: u64,
    },
    /// Delete a record and its blocks.
    Remove(i32),
    /// Remember the server-assigned filename for a url.
    UpdateResponseFilename { url: String, filename: String },
}

/// Backend storing breakpoint records.
pub trait BreakpointPersistence: Send + Sync {
    /// Loads every record and the url→filename cache.
    fn load_all(&self) -> Result<PersistedState, PersistenceError>;

    /// Applies all operations or none of them.
    fn apply(&self, ops: Vec<PersistOp>) -> Result<(), PersistenceError>;

    fn upsert(&self, record: BreakpointRecord) -> Result<(), PersistenceError> {
        self.apply(vec![PersistOp::Upsert(record)])
    }

    fn update_block_offset(
        &self,
        id: i32,
        block_index: usize,
        current_offset: u64,
    ) -> Result<(), PersistenceError> {
        self.apply(vec![PersistOp::UpdateBlockOffset {
            id,
            block_index,
            current_offset,
        }])
    }

    fn remove(&self, id: i32) -> Result<(), PersistenceError> {
        self.apply(vec![PersistOp::Remove(id)])
    }

    fn update_response_filename(&self, url: &str, filename: &str) -> Result<(), PersistenceError> {
        self.apply(vec![PersistOp::UpdateResponseFilename {
            url: url.to_string(),
            filename: filename.to_string(),
        }])
    }
}

/// In-process backend. Records survive as long as the value does, which
/// is enough to hand state from one engine instance to the next.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    state: Mutex<MemoryState>,
}

#[derive(Clone, Debug, Default)]
struct MemoryState {
    records: HashMap<i32, BreakpointRecord>,
    response_filenames: HashMap<String, String>,
}

impl MemoryState {
    fn apply(&mut self, op: PersistOp) -> Result<(), PersistenceError> {
        match op {
            PersistOp::Upsert(record) => {
                self.records.insert(record.id, record);
            }
            PersistOp::UpdateBlockOffset {
                id,
                block_index,
                current_offset,
            } => {
                let record = self
                    .records
                    .get_mut(&id)
                    .ok_or(PersistenceError::NotFound(id))?;
                let block = record
                    .blocks
                    .iter_mut()
                    .find(|b| b.block_index == block_index)
                    .ok_or_else(|| {
                        PersistenceError::Backend(format!("record {id} has no block {block_index}"))
                    })?;
                block.current_offset = current_offset;
            }
            PersistOp::Remove(id) => {
                self.records.remove(&id);
            }
            PersistOp::UpdateResponseFilename { url, filename } => {
                self.response_filenames.insert(url, filename);
            }
        }
        Ok(())
    }
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current record for `id`.
    pub fn record(&self, id: i32) -> Option<BreakpointRecord> {
        self.state.lock().records.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().records.is_empty()
    }
}

impl BreakpointPersistence for MemoryPersistence {
    fn load_all(&self) -> Result<PersistedState, PersistenceError> {
        let state = self.state.lock();
        let mut records: Vec<BreakpointRecord> = state.records.values().cloned().collect();
        records.sort_by_key(|r| r.id);
        Ok(PersistedState {
            records,
            response_filenames: state.response_filenames.clone(),
        })
    }

    fn apply(&self, ops: Vec<PersistOp>) -> Result<(), PersistenceError> {
        let mut state = self.state.lock();
        let mut staged = state.clone();
        for op in ops {
            staged.apply(op)?;
        }
        *state = staged;
        Ok(())
    }
}
