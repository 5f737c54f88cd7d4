//! Ready queue for admitted calls waiting for a free slot.
//!
//! Calls are ordered by task priority (higher values first), then by
//! enqueue order (FIFO within the same priority).

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use crate::download::DownloadCall;

/// Global sequence counter for FIFO ordering within priority levels.
static SEQUENCE_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_sequence() -> u64 {
    SEQUENCE_COUNTER.fetch_add(1, AtomicOrdering::Relaxed)
}

/// A call waiting to run.
pub(crate) struct QueuedCall {
    pub call: Arc<DownloadCall>,
    priority: i32,
    sequence: u64,
}

impl QueuedCall {
    pub fn new(call: Arc<DownloadCall>) -> Self {
        Self {
            priority: call.task().priority(),
            call,
            sequence: next_sequence(),
        }
    }
}

// Ordering for BinaryHeap: higher priority first, then lower sequence (older) first
impl PartialEq for QueuedCall {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for QueuedCall {}

impl PartialOrd for QueuedCall {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedCall {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.priority.cmp(&other.priority) {
            Ordering::Equal => other.sequence.cmp(&self.sequence),
            other_ordering => other_ordering,
        }
    }
}

/// Priority-ordered calls. Not thread-safe; the dispatcher keeps it under
/// its state mutex.
#[derive(Default)]
pub(crate) struct ReadyQueue {
    heap: BinaryHeap<QueuedCall>,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, call: Arc<DownloadCall>) {
        self.heap.push(QueuedCall::new(call));
    }

    /// Removes and returns the highest-priority call.
    pub fn pop(&mut self) -> Option<Arc<DownloadCall>> {
        self.heap.pop().map(|queued| queued.call)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Iterates in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<DownloadCall>> {
        self.heap.iter().map(|queued| &queued.call)
    }

    /// Removes every call matching `predicate`, returning them in priority order.
    pub fn remove_where(&mut self, mut predicate: impl FnMut(&DownloadCall) -> bool) -> Vec<Arc<DownloadCall>> {
        let (mut removed, kept): (Vec<_>, Vec<_>) =
            self.heap.drain().partition(|queued| predicate(queued.call.as_ref()));
        self.heap = BinaryHeap::from(kept);
        removed.sort_by(|a, b| b.cmp(a));
        removed.into_iter().map(|queued| queued.call).collect()
    }
}
