//! Breakpoint model and store.
//!
//! A breakpoint is everything needed to resume a task: its block layout, how
//! far each block got, and the etag the server reported.
//!
//! ```text
//! ┌────────────────┐  get / update / on_sync   ┌──────────────────────┐
//! │ DownloadCall   │ ─────────────────────────► │ BreakpointStore      │
//! │ OutputStream   │                            │  id → BreakpointInfo │
//! └────────────────┘                            └──────────┬───────────┘
//!                                                          │ PersistOp batches
//!                                                          ▼
//!                                               ┌──────────────────────┐
//!                                               │ BreakpointPersistence│
//!                                               └──────────────────────┘
//! ```

mod info;
mod persistence;
mod store;

pub use info::{BlockInfo, BreakpointInfo, FilenameHolder, CHUNKED_CONTENT_LENGTH};
pub use persistence::{
    BlockRecord, BreakpointPersistence, BreakpointRecord, MemoryPersistence, PersistOp,
    PersistedState,
};
pub use store::{BreakpointStore, DEFAULT_REMIT_DELAY, FIRST_ID};
