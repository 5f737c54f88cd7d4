//! Per-path lock held while a canceled task drains its writes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

/// Counts holders per absolute path; openers wait until the count drops to zero.
#[derive(Debug, Default)]
pub struct FileLock {
    holders: Mutex<HashMap<PathBuf, usize>>,
    released: Condvar,
}

impl FileLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increase(&self, path: &Path) {
        *self.holders.lock().entry(path.to_path_buf()).or_insert(0) += 1;
    }

    pub fn decrease(&self, path: &Path) {
        let mut holders = self.holders.lock();
        if let Some(count) = holders.get_mut(path) {
            *count -= 1;
            if *count == 0 {
                holders.remove(path);
                self.released.notify_all();
            }
        }
    }

    pub fn is_locked(&self, path: &Path) -> bool {
        self.holders.lock().contains_key(path)
    }

    /// Blocks until no one holds `path`.
    pub fn wait_for_release(&self, path: &Path) {
        let mut holders = self.holders.lock();
        if holders.contains_key(path) {
            debug!(path = %path.display(), "Waiting for file lock release");
        }
        while holders.contains_key(path) {
            self.released.wait(&mut holders);
        }
    }

    /// Like [`wait_for_release`](Self::wait_for_release) but gives up after `timeout`.
    ///
    /// Returns true if the path is free.
    pub fn wait_for_release_timeout(&self, path: &Path, timeout: Duration) -> bool {
        let mut holders = self.holders.lock();
        while holders.contains_key(path) {
            if self.released.wait_for(&mut holders, timeout).timed_out() {
                return !holders.contains_key(path);
            }
        }
        true
    }
}
