//! Block split strategy.
//!
//! Decides whether a fresh download is split into several ranged
//! connections and how many. The size tiers are policy, so they sit behind
//! the [`BlockSplitStrategy`] trait and can be replaced per engine.

use crate::breakpoint::{BlockInfo, CHUNKED_CONTENT_LENGTH};
use crate::connection::{is_accept_range, Headers};

const MIB: u64 = 1024 * 1024;

/// Upper bounds (exclusive) of the size tiers; the tier index + 1 is the block count.
const TIERS: [u64; 4] = [MIB, 5 * MIB, 50 * MIB, 100 * MIB];

/// Default minimum progress an idle breakpoint needs before it is reused.
pub const DEFAULT_REUSE_IDLE_THRESHOLD_BYTES: u64 = 10 * 1024;

/// Chooses the block layout of a fresh download.
pub trait BlockSplitStrategy: Send + Sync {
    /// Whether the trial response allows splitting into ranged blocks.
    fn is_split_block(
        &self,
        status: u16,
        headers: &Headers,
        content_length: u64,
        supports_seek: bool,
    ) -> bool {
        status == 206
            && is_accept_range(status, headers)
            && content_length != CHUNKED_CONTENT_LENGTH
            && supports_seek
    }

    /// Number of blocks for a resource of `total_length` bytes (at least 1).
    fn determine_block_count(&self, total_length: u64) -> usize;

    /// An idle breakpoint for the same file is only reused above this progress.
    fn reuse_idle_threshold_bytes(&self) -> u64 {
        DEFAULT_REUSE_IDLE_THRESHOLD_BYTES
    }
}

/// Five size tiers: <1 MiB → 1, <5 MiB → 2, <50 MiB → 3, <100 MiB → 4, else 5.
#[derive(Clone, Copy, Debug, Default)]
pub struct TieredSplit;

impl BlockSplitStrategy for TieredSplit {
    fn determine_block_count(&self, total_length: u64) -> usize {
        TIERS
            .iter()
            .position(|upper| total_length < *upper)
            .unwrap_or(TIERS.len())
            + 1
    }
}

/// Splits `total_length` into `count` equal-width blocks, the remainder
/// folded into the last one.
pub fn split_blocks(total_length: u64, count: usize) -> Vec<BlockInfo> {
    let count = (count.max(1) as u64).min(total_length.max(1));
    let each = total_length / count;
    let remainder = total_length % count;

    (0..count)
        .map(|i| {
            let length = if i == count - 1 { each + remainder } else { each };
            BlockInfo::new(i * each, length)
        })
        .collect()
}
