//! Writing fetched bytes to the target file.
//!
//! - [`OutputBackend`] / [`OutputHandle`]: where bytes go, with
//!   [`FileOutputBackend`] as the local file system implementation.
//! - [`MultiPointOutputStream`]: one per running task; lets blocks write
//!   concurrently and reports durable progress to the breakpoint store.
//! - [`FileLock`]: keeps a new task off a path while a canceled one drains.

mod backend;
mod file_lock;
mod stream;

pub use backend::{available_space_for_path, FileOutputBackend, OutputBackend, OutputHandle};
pub use file_lock::FileLock;
pub use stream::MultiPointOutputStream;
