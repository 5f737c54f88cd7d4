//! The per-task download pipeline.
//!
//! ```text
//! DownloadCall ──► trial chain (block 0) ──► layout settled ──► chains 1..N
//!      │                     │                                      │
//!      │                     └──────────── DownloadCache ◄──────────┘
//!      │                                   (stream, token, first failure)
//!      └──► finish: close output, store.on_task_end, task_end
//! ```
//!
//! Each [`DownloadChain`] runs the connect interceptors and then the fetch
//! interceptors for one block on its own thread.

mod cache;
mod cancel;
mod call;
mod chain;
mod check;
mod filename;
pub mod interceptor;
mod strategy;

pub(crate) use cache::CallHost;
pub(crate) use cancel::CancelBatch;
pub use cache::DownloadCache;
pub use call::{DownloadCall, MAX_RESUME_RESTARTS};
pub use chain::DownloadChain;
pub use check::{local_check, response_check};
pub use filename::resolve_filename;
pub use interceptor::{ConnectInterceptor, FetchInterceptor, Interceptors};
pub use strategy::{split_blocks, BlockSplitStrategy, TieredSplit, DEFAULT_REUSE_IDLE_THRESHOLD_BYTES};
