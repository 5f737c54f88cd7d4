//! Resumable progress state of a task.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::persistence::{BlockRecord, BreakpointRecord};
use crate::task::TaskTarget;

/// Content length of a block whose total size is unknown (chunked transfer).
pub const CHUNKED_CONTENT_LENGTH: u64 = u64::MAX;

// =============================================================================
// Filename Holder
// =============================================================================

/// A filename that may only become known after the first response.
#[derive(Debug, Default)]
pub struct FilenameHolder(RwLock<Option<String>>);

impl FilenameHolder {
    pub fn new(filename: Option<String>) -> Self {
        Self(RwLock::new(filename))
    }

    pub fn get(&self) -> Option<String> {
        self.0.read().clone()
    }

    pub fn set(&self, filename: String) {
        *self.0.write() = Some(filename);
    }

    pub fn is_set(&self) -> bool {
        self.0.read().is_some()
    }
}

// =============================================================================
// Block
// =============================================================================

/// One contiguous byte range of a resource.
///
/// `current_offset` is the number of bytes of this block known to be durable
/// on disk. It only grows, except for an explicit reset on restart.
#[derive(Debug)]
pub struct BlockInfo {
    start_offset: u64,
    content_length: u64,
    current_offset: AtomicU64,
}

impl BlockInfo {
    pub fn new(start_offset: u64, content_length: u64) -> Self {
        Self::with_current(start_offset, content_length, 0)
    }

    pub fn with_current(start_offset: u64, content_length: u64, current_offset: u64) -> Self {
        Self {
            start_offset,
            content_length,
            current_offset: AtomicU64::new(current_offset),
        }
    }

    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    pub fn current_offset(&self) -> u64 {
        self.current_offset.load(Ordering::Acquire)
    }

    pub fn is_chunked(&self) -> bool {
        self.content_length == CHUNKED_CONTENT_LENGTH
    }

    /// First absolute byte still missing.
    pub fn range_left(&self) -> u64 {
        self.start_offset + self.current_offset()
    }

    /// Last absolute byte of the block.
    pub fn range_right(&self) -> u64 {
        (self.start_offset + self.content_length).saturating_sub(1)
    }

    pub fn increase_current_offset(&self, increase: u64) {
        self.current_offset.fetch_add(increase, Ordering::AcqRel);
    }

    pub fn reset_current_offset(&self) {
        self.current_offset.store(0, Ordering::Release);
    }

    pub fn is_complete(&self) -> bool {
        !self.is_chunked() && self.current_offset() == self.content_length
    }

    pub fn copy(&self) -> BlockInfo {
        Self::with_current(self.start_offset, self.content_length, self.current_offset())
    }
}

impl fmt::Display for BlockInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_chunked() {
            write!(f, "[{}, chunked) current {}", self.start_offset, self.current_offset())
        } else {
            write!(
                f,
                "[{}, {}) current {}",
                self.start_offset,
                self.start_offset + self.content_length,
                self.current_offset()
            )
        }
    }
}

// =============================================================================
// Breakpoint
// =============================================================================

/// Resumable state of one task.
#[derive(Debug)]
pub struct BreakpointInfo {
    id: i32,
    url: String,
    etag: RwLock<Option<String>>,
    parent: PathBuf,
    filename: Arc<FilenameHolder>,
    task_only_provided_parent_path: bool,
    chunked: AtomicBool,
    blocks: RwLock<Vec<Arc<BlockInfo>>>,
}

impl BreakpointInfo {
    pub fn new(
        id: i32,
        url: impl Into<String>,
        parent: impl Into<PathBuf>,
        filename: Option<String>,
        task_only_provided_parent_path: bool,
    ) -> Self {
        Self::with_holder(
            id,
            url.into(),
            parent.into(),
            Arc::new(FilenameHolder::new(filename)),
            task_only_provided_parent_path,
        )
    }

    /// Info for a task target; the filename holder is shared with the task.
    pub fn for_target(id: i32, target: &TaskTarget) -> Self {
        Self::with_holder(
            id,
            target.url().to_string(),
            target.parent().to_path_buf(),
            Arc::clone(target.filename_holder()),
            target.is_filename_from_response(),
        )
    }

    fn with_holder(
        id: i32,
        url: String,
        parent: PathBuf,
        filename: Arc<FilenameHolder>,
        task_only_provided_parent_path: bool,
    ) -> Self {
        Self {
            id,
            url,
            etag: RwLock::new(None),
            parent,
            filename,
            task_only_provided_parent_path,
            chunked: AtomicBool::new(false),
            blocks: RwLock::new(Vec::new()),
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn etag(&self) -> Option<String> {
        self.etag.read().clone()
    }

    pub fn set_etag(&self, etag: Option<String>) {
        *self.etag.write() = etag;
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

    pub fn path(&self) -> Option<PathBuf> {
        self.filename.get().map(|name| self.parent.join(name))
    }

    pub fn is_task_only_provided_parent_path(&self) -> bool {
        self.task_only_provided_parent_path
    }

    pub fn is_chunked(&self) -> bool {
        self.chunked.load(Ordering::Acquire)
    }

    pub fn set_chunked(&self, chunked: bool) {
        self.chunked.store(chunked, Ordering::Release);
    }

    pub fn block_count(&self) -> usize {
        self.blocks.read().len()
    }

    pub fn is_single_block(&self) -> bool {
        self.block_count() == 1
    }

    pub fn block(&self, index: usize) -> Option<Arc<BlockInfo>> {
        self.blocks.read().get(index).cloned()
    }

    /// Snapshot of the block list in index order.
    pub fn blocks(&self) -> Vec<Arc<BlockInfo>> {
        self.blocks.read().clone()
    }

    pub fn add_block(&self, block: BlockInfo) {
        self.blocks.write().push(Arc::new(block));
    }

    /// Replaces the whole layout in one step.
    pub fn replace_blocks(&self, blocks: Vec<BlockInfo>) {
        *self.blocks.write() = blocks.into_iter().map(Arc::new).collect();
    }

    /// Drops every block and the etag: the next generation starts from zero.
    pub fn reset_blocks(&self) {
        self.blocks.write().clear();
        *self.etag.write() = None;
    }

    /// Sum of the blocks' durable offsets.
    pub fn total_offset(&self) -> u64 {
        self.blocks.read().iter().map(|b| b.current_offset()).sum()
    }

    /// Sum of the blocks' lengths, or the total offset when chunked.
    pub fn total_length(&self) -> u64 {
        if self.is_chunked() {
            return self.total_offset();
        }
        self.blocks
            .read()
            .iter()
            .map(|b| b.content_length())
            .fold(0u64, |acc, len| acc.saturating_add(len))
    }

    /// Whether this info describes the same logical download as `target`.
    pub fn is_same_from(&self, target: &TaskTarget) -> bool {
        if self.parent != target.parent() || self.url != target.url() {
            return false;
        }

        let own = self.filename.get();
        let other = target.filename();
        if other.is_some() && other == own {
            return true;
        }

        if self.task_only_provided_parent_path {
            if !target.is_filename_from_response() {
                return false;
            }
            return other.is_none() || other == own;
        }

        false
    }

    /// Deep copy with its own filename holder.
    pub fn copy(&self) -> BreakpointInfo {
        self.copy_with(self.id, self.url.clone())
    }

    pub fn copy_with_replace_id(&self, id: i32) -> BreakpointInfo {
        self.copy_with(id, self.url.clone())
    }

    pub fn copy_with_replace_id_and_url(&self, id: i32, url: impl Into<String>) -> BreakpointInfo {
        self.copy_with(id, url.into())
    }

    fn copy_with(&self, id: i32, url: String) -> BreakpointInfo {
        let copy = Self::new(
            id,
            url,
            self.parent.clone(),
            self.filename.get(),
            self.task_only_provided_parent_path,
        );
        copy.set_etag(self.etag());
        copy.set_chunked(self.is_chunked());
        copy.replace_blocks(self.blocks.read().iter().map(|b| b.copy()).collect());
        copy
    }

    /// Adopts the layout and etag of another info for the same target.
    pub fn reuse_blocks(&self, other: &BreakpointInfo) {
        self.replace_blocks(other.blocks().iter().map(|b| b.copy()).collect());
        self.set_etag(other.etag());
        self.set_chunked(other.is_chunked());
    }

    pub(crate) fn to_record(&self) -> BreakpointRecord {
        BreakpointRecord {
            id: self.id,
            url: self.url.clone(),
            etag: self.etag(),
            parent_path: self.parent.clone(),
            filename: self.filename.get(),
            task_only_parent_path: self.task_only_provided_parent_path,
            chunked: self.is_chunked(),
            blocks: self
                .blocks
                .read()
                .iter()
                .enumerate()
                .map(|(index, block)| BlockRecord {
                    block_index: index,
                    start_offset: block.start_offset(),
                    content_length: block.content_length(),
                    current_offset: block.current_offset(),
                })
                .collect(),
        }
    }

    pub(crate) fn from_record(record: &BreakpointRecord) -> BreakpointInfo {
        let info = Self::new(
            record.id,
            record.url.clone(),
            record.parent_path.clone(),
            record.filename.clone(),
            record.task_only_parent_path,
        );
        info.set_etag(record.etag.clone());
        info.set_chunked(record.chunked);

        let mut blocks: Vec<&BlockRecord> = record.blocks.iter().collect();
        blocks.sort_by_key(|b| b.block_index);
        info.replace_blocks(
            blocks
                .into_iter()
                .map(|b| BlockInfo::with_current(b.start_offset, b.content_length, b.current_offset))
                .collect(),
        );
        info
    }
}

impl fmt::Display for BreakpointInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "breakpoint#{} {} etag={:?} blocks={} offset={}/{}",
            self.id,
            self.url,
            self.etag(),
            self.block_count(),
            self.total_offset(),
            self.total_length()
        )
    }
}
