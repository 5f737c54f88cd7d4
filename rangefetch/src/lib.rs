//! Rangefetch - resumable multi-connection HTTP downloads
//!
//! This library downloads a resource over one or more concurrent ranged
//! HTTP connections, persists enough state to resume after a crash or a
//! network loss, and never records more progress than is durable on disk.
//!
//! - [`dispatcher`] admits tasks, bounds concurrency and resolves conflicts.
//! - [`download`] runs one task: the trial connect, the block layout and a
//!   connect/fetch interceptor pipeline per block.
//! - [`output`] writes concurrently fetched blocks into one file.
//! - [`breakpoint`] holds the resumable state and its persistence contract.
//! - [`group`] and [`serial`] run sets of tasks together or one at a time.
//! - [`status`] answers where a task stands.
//! - [`engine`] wires it all together.

pub mod breakpoint;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod download;
pub mod engine;
pub mod error;
pub mod group;
pub mod listener;
pub mod logging;
pub mod output;
pub mod policy;
pub mod serial;
pub mod status;
pub mod task;

pub use config::{EngineConfig, TaskDefaults};
pub use dispatcher::DownloadDispatcher;
pub use engine::{Engine, EngineBuilder, EngineContext};
pub use error::{DownloadError, DownloadResult};
pub use group::{DownloadGroup, GroupBuilder, GroupListener};
pub use listener::{DownloadListener, ListenerBunch};
pub use policy::RetryPolicy;
pub use serial::SerialQueue;
pub use status::TaskStatus;
pub use task::{DownloadTask, EndCause, ResumeFailedCause, TaskBuilder};
