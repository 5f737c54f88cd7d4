//! Engine configuration.
//!
//! [`EngineConfig`] is the typed configuration an [`Engine`](crate::Engine)
//! is built from. [`ConfigFile`] loads the same settings from an INI file.

mod file;

use std::path::PathBuf;
use std::time::Duration;

pub use file::{default_config_path, ConfigFile};

use crate::connection::HttpSettings;
use crate::policy::RetryPolicy;

/// Default number of calls running at once.
pub const DEFAULT_MAX_PARALLEL: usize = 5;

/// Default bytes read from a response per chunk.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 4096;

/// Default size of the in-memory write buffer in front of each block's file handle.
pub const DEFAULT_FLUSH_BUFFER_SIZE: usize = 16 * 1024;

/// Default pending bytes that trigger a sync to the file system.
pub const DEFAULT_SYNC_BUFFER_SIZE: u64 = 64 * 1024;

/// Default minimum time between two syncs.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_millis(2000);

/// Default minimum time between two progress callbacks of one block.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(3000);

/// Per-task settings applied by [`Engine::task`](crate::Engine::task).
#[derive(Clone, Debug, PartialEq)]
pub struct TaskDefaults {
    pub read_buffer_size: usize,
    pub flush_buffer_size: usize,
    pub sync_buffer_size: u64,
    pub sync_interval: Duration,
    pub progress_interval: Duration,
    /// `None` pre-allocates whenever the output backend supports seeking.
    pub pre_allocate: Option<bool>,
    pub pass_if_already_completed: bool,
}

impl Default for TaskDefaults {
    fn default() -> Self {
        Self {
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            flush_buffer_size: DEFAULT_FLUSH_BUFFER_SIZE,
            sync_buffer_size: DEFAULT_SYNC_BUFFER_SIZE,
            sync_interval: DEFAULT_SYNC_INTERVAL,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            pre_allocate: None,
            pass_if_already_completed: true,
        }
    }
}

/// Logging settings consumed by [`init_logging`](crate::logging::init_logging).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset, e.g. `info` or `rangefetch=debug`.
    pub level: String,
    /// Directory for daily-rolling log files. Console only when unset.
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: None,
        }
    }
}

/// Configuration of one engine instance.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Calls allowed to run concurrently (at least 1).
    pub max_parallel: usize,

    /// Retry policy applied to each block's connect and fetch phases.
    pub retry: RetryPolicy,

    /// Settings copied into every task built through the engine.
    pub task_defaults: TaskDefaults,

    /// Delay before a started task's breakpoint is persisted. `None` writes through.
    pub remit_delay: Option<Duration>,

    pub connect_timeout: Duration,

    pub read_timeout: Duration,

    pub user_agent: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let http = HttpSettings::default();
        Self {
            max_parallel: DEFAULT_MAX_PARALLEL,
            retry: RetryPolicy::default(),
            task_defaults: TaskDefaults::default(),
            remit_delay: None,
            connect_timeout: http.connect_timeout,
            read_timeout: http.read_timeout,
            user_agent: http.user_agent,
        }
    }
}

impl EngineConfig {
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_task_defaults(mut self, defaults: TaskDefaults) -> Self {
        self.task_defaults = defaults;
        self
    }

    pub fn with_remit_delay(mut self, delay: Duration) -> Self {
        self.remit_delay = Some(delay);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Client settings for the default HTTP connection factory.
    pub fn http_settings(&self) -> HttpSettings {
        HttpSettings {
            connect_timeout: self.connect_timeout,
            read_timeout: self.read_timeout,
            user_agent: self.user_agent.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_defaults() {
        let defaults = TaskDefaults::default();
        assert_eq!(defaults.read_buffer_size, 4096);
        assert_eq!(defaults.flush_buffer_size, 16384);
        assert_eq!(defaults.sync_buffer_size, 65536);
        assert_eq!(defaults.sync_interval, Duration::from_millis(2000));
        assert_eq!(defaults.progress_interval, Duration::from_millis(3000));
        assert!(defaults.pass_if_already_completed);
        assert_eq!(defaults.pre_allocate, None);
    }

    #[test]
    fn test_engine_config_builder() {
        let config = EngineConfig::default()
            .with_max_parallel(0)
            .with_remit_delay(Duration::from_millis(1500))
            .with_user_agent("test/1.0");
        assert_eq!(config.max_parallel, 1);
        assert_eq!(config.remit_delay, Some(Duration::from_millis(1500)));
        assert_eq!(config.http_settings().user_agent, "test/1.0");
    }

    #[test]
    fn test_engine_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_parallel, DEFAULT_MAX_PARALLEL);
        assert_eq!(config.retry.max_attempts(), 5);
        assert_eq!(config.remit_delay, None);
    }
}
