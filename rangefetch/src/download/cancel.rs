//! Store report for calls canceled together.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::breakpoint::BreakpointStore;

#[derive(Default)]
struct BatchState {
    ids: Vec<i32>,
    draining: usize,
    sealed: bool,
    reported: bool,
}

/// Collects running calls canceled in one dispatcher operation.
///
/// The store hears about the whole group once the last member has drained
/// its output, so the final sync of every member is part of the report.
pub(crate) struct CancelBatch {
    store: Arc<BreakpointStore>,
    state: Mutex<BatchState>,
}

impl CancelBatch {
    pub(crate) fn new(store: Arc<BreakpointStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            state: Mutex::new(BatchState::default()),
        })
    }

    /// A call was canceled as part of this batch.
    pub(crate) fn join(&self, id: i32) {
        let mut state = self.state.lock();
        state.ids.push(id);
        state.draining += 1;
    }

    /// A member finished draining its output.
    pub(crate) fn drained(&self) {
        let mut state = self.state.lock();
        state.draining = state.draining.saturating_sub(1);
        self.report_if_done(&mut state);
    }

    /// No more members will join.
    pub(crate) fn seal(&self) {
        let mut state = self.state.lock();
        state.sealed = true;
        self.report_if_done(&mut state);
    }

    fn report_if_done(&self, state: &mut BatchState) {
        if !state.sealed || state.draining > 0 || state.reported || state.ids.is_empty() {
            return;
        }
        state.reported = true;
        debug!(count = state.ids.len(), "Recording canceled tasks");
        if let Err(e) = self.store.bunch_task_canceled(&state.ids) {
            warn!(count = state.ids.len(), error = %e, "Failed to record canceled tasks");
        }
    }

    #[cfg(test)]
    fn is_reported(&self) -> bool {
        self.state.lock().reported
    }
}
