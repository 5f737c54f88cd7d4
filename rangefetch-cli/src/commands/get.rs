//! Get command - download URLs with progress bars.

use std::path::PathBuf;
use std::sync::Arc;

use indicatif::MultiProgress;
use tokio::sync::mpsc;
use tracing::{info, warn};

use rangefetch::logging::init_logging;
use rangefetch::task::EndCause;
use rangefetch::EngineBuilder;

use super::common::{load_config, Verbosity};
use crate::error::CliError;
use crate::progress::TaskProgress;

/// Arguments for the get command.
pub struct GetArgs {
    pub urls: Vec<String>,
    pub output: PathBuf,
    pub name: Option<String>,
    pub connections: Option<usize>,
    pub max_parallel: Option<usize>,
    pub priority: i32,
    pub config: Option<PathBuf>,
    pub verbosity: Verbosity,
}

/// Run the get command.
pub fn run(args: GetArgs) -> Result<(), CliError> {
    if args.name.is_some() && args.urls.len() > 1 {
        return Err(CliError::Usage(
            "--name can only be used with a single URL".to_string(),
        ));
    }
    if args.connections == Some(0) {
        return Err(CliError::Usage("--connections must be at least 1".to_string()));
    }

    let mut config = load_config(args.config)?;
    if let Some(level) = args.verbosity.level_override() {
        config.logging.level = level.to_string();
    }
    let _log_guard = init_logging(&config.logging)?;

    let mut engine_config = config.engine;
    if let Some(max_parallel) = args.max_parallel {
        engine_config = engine_config.with_max_parallel(max_parallel);
    }
    let engine = EngineBuilder::new(engine_config).build()?;

    let multi = MultiProgress::new();
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let tasks: Vec<_> = args
        .urls
        .iter()
        .map(|url| {
            let listener = Arc::new(TaskProgress::new(&multi, url, done_tx.clone()));
            let mut builder = engine
                .task(url.clone(), args.output.clone())
                .priority(args.priority)
                .listener(listener);
            if let Some(name) = &args.name {
                builder = builder.filename(name.clone());
            }
            if let Some(connections) = args.connections {
                builder = builder.connection_count(connections);
            }
            builder.build(engine.store())
        })
        .collect();
    drop(done_tx);

    let dispatcher = Arc::clone(engine.dispatcher());
    ctrlc::set_handler(move || {
        let canceled = dispatcher.cancel_all();
        info!(canceled, "Interrupted, canceling downloads");
    })
    .map_err(|e| CliError::Signal(e.to_string()))?;

    info!(count = tasks.len(), output = %args.output.display(), "Starting downloads");
    engine.dispatcher().enqueue_all(tasks.iter().cloned());

    let total = tasks.len();
    let mut outcomes = Vec::with_capacity(total);
    while outcomes.len() < total {
        match done_rx.blocking_recv() {
            Some(outcome) => outcomes.push(outcome),
            None => break,
        }
    }

    let failed: Vec<_> = outcomes
        .iter()
        .filter(|outcome| outcome.cause != EndCause::Completed)
        .collect();
    for outcome in &failed {
        warn!(task_id = outcome.id, url = %outcome.url, cause = %outcome.cause, "Download did not complete");
        match &outcome.error {
            Some(error) => eprintln!("{}: {} ({})", outcome.url, outcome.cause, error),
            None => eprintln!("{}: {}", outcome.url, outcome.cause),
        }
    }

    let missing = total - outcomes.len();
    if failed.is_empty() && missing == 0 {
        Ok(())
    } else {
        Err(CliError::Incomplete {
            failed: failed.len() + missing,
            total,
        })
    }
}
