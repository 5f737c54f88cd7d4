//! Engine assembly.
//!
//! [`EngineBuilder`] wires the collaborators every download needs and
//! produces an [`Engine`]: a breakpoint store, a connection factory, an
//! output backend, a block split strategy and the file lock, bundled into
//! one shared [`EngineContext`], plus the [`DownloadDispatcher`] admitting
//! tasks against it.
//!
//! Each collaborator has a production default, so the common case is:
//!
//! ```ignore
//! use rangefetch::{EngineBuilder, EngineConfig};
//!
//! let engine = EngineBuilder::new(EngineConfig::default()).build()?;
//! let task = engine.task("https://example.com/file.bin", "/tmp/downloads").build(engine.store());
//! engine.dispatcher().enqueue(task);
//! ```
//!
//! Tests swap in in-memory connections or persistence through the
//! builder's setters.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use crate::breakpoint::{BreakpointPersistence, BreakpointStore, MemoryPersistence};
use crate::config::EngineConfig;
use crate::connection::{ConnectionFactory, HttpConnectionFactory};
use crate::dispatcher::DownloadDispatcher;
use crate::download::{BlockSplitStrategy, Interceptors, TieredSplit};
use crate::error::DownloadResult;
use crate::output::{FileLock, FileOutputBackend, OutputBackend};
use crate::task::TaskBuilder;

/// Collaborators shared by every call of one engine.
pub struct EngineContext {
    config: EngineConfig,
    store: Arc<BreakpointStore>,
    connections: Arc<dyn ConnectionFactory>,
    output: Arc<dyn OutputBackend>,
    split: Arc<dyn BlockSplitStrategy>,
    file_lock: Arc<FileLock>,
    interceptors: Arc<Interceptors>,
}

impl EngineContext {
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<BreakpointStore> {
        &self.store
    }

    pub fn connections(&self) -> &Arc<dyn ConnectionFactory> {
        &self.connections
    }

    pub fn output(&self) -> &Arc<dyn OutputBackend> {
        &self.output
    }

    pub fn split(&self) -> &Arc<dyn BlockSplitStrategy> {
        &self.split
    }

    pub fn file_lock(&self) -> &Arc<FileLock> {
        &self.file_lock
    }

    pub(crate) fn interceptors(&self) -> &Arc<Interceptors> {
        &self.interceptors
    }
}

/// Builder for [`Engine`].
pub struct EngineBuilder {
    config: EngineConfig,
    persistence: Option<Arc<dyn BreakpointPersistence>>,
    connections: Option<Arc<dyn ConnectionFactory>>,
    output: Option<Arc<dyn OutputBackend>>,
    split: Option<Arc<dyn BlockSplitStrategy>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            persistence: None,
            connections: None,
            output: None,
            split: None,
        }
    }

    /// Where breakpoints survive between runs. Defaults to memory only.
    pub fn persistence(mut self, persistence: Arc<dyn BreakpointPersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// How requests are made. Defaults to [`HttpConnectionFactory`].
    pub fn connections(mut self, connections: Arc<dyn ConnectionFactory>) -> Self {
        self.connections = Some(connections);
        self
    }

    /// Where bytes are written. Defaults to [`FileOutputBackend`].
    pub fn output(mut self, output: Arc<dyn OutputBackend>) -> Self {
        self.output = Some(output);
        self
    }

    /// How fresh downloads are split. Defaults to [`TieredSplit`].
    pub fn split(mut self, split: Arc<dyn BlockSplitStrategy>) -> Self {
        self.split = Some(split);
        self
    }

    /// Opens the breakpoint store and starts the dispatcher.
    ///
    /// # Errors
    ///
    /// Fails when the persistence backend cannot be loaded or the HTTP
    /// client cannot be created.
    pub fn build(self) -> DownloadResult<Engine> {
        let persistence = self
            .persistence
            .unwrap_or_else(|| Arc::new(MemoryPersistence::new()));
        let store = BreakpointStore::open(persistence, self.config.remit_delay)?;

        let connections = match self.connections {
            Some(connections) => connections,
            None => Arc::new(HttpConnectionFactory::new(&self.config.http_settings())?),
        };

        let context = Arc::new(EngineContext {
            store,
            connections,
            output: self.output.unwrap_or_else(|| Arc::new(FileOutputBackend)),
            split: self.split.unwrap_or_else(|| Arc::new(TieredSplit)),
            file_lock: Arc::new(FileLock::new()),
            interceptors: Arc::new(Interceptors::default()),
            config: self.config,
        });
        let dispatcher = DownloadDispatcher::new(Arc::clone(&context));

        info!(
            max_parallel = context.config.max_parallel,
            "Download engine ready"
        );
        Ok(Engine {
            context,
            dispatcher,
        })
    }
}

/// A configured download engine.
pub struct Engine {
    context: Arc<EngineContext>,
    dispatcher: Arc<DownloadDispatcher>,
}

impl Engine {
    /// Starts describing a task with this engine's task defaults.
    pub fn task(&self, url: impl Into<String>, parent: impl Into<PathBuf>) -> TaskBuilder {
        TaskBuilder::with_defaults(url, parent, &self.context.config.task_defaults)
    }

    pub fn store(&self) -> &Arc<BreakpointStore> {
        self.context.store()
    }

    pub fn dispatcher(&self) -> &Arc<DownloadDispatcher> {
        &self.dispatcher
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.context
    }
}
