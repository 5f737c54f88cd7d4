//! Helpers shared across CLI commands.

use std::path::PathBuf;

use rangefetch::config::{default_config_path, ConfigFile};

use crate::error::CliError;

/// Log verbosity requested on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    Quiet,
    Normal,
    Debug,
    Trace,
}

impl Verbosity {
    pub fn from_flags(verbose: u8, quiet: bool) -> Self {
        match (quiet, verbose) {
            (true, _) => Verbosity::Quiet,
            (false, 0) => Verbosity::Normal,
            (false, 1) => Verbosity::Debug,
            (false, _) => Verbosity::Trace,
        }
    }

    /// Filter directive overriding the configured level, if any.
    pub fn level_override(self) -> Option<&'static str> {
        match self {
            Verbosity::Quiet => Some("warn"),
            Verbosity::Normal => None,
            Verbosity::Debug => Some("debug"),
            Verbosity::Trace => Some("trace"),
        }
    }
}

/// Resolve the configuration path: CLI flag first, then the default location.
pub fn resolve_config_path(cli_path: Option<PathBuf>) -> Result<PathBuf, CliError> {
    cli_path
        .or_else(default_config_path)
        .ok_or(CliError::NoConfigPath)
}

/// Load the configuration, using defaults when the file does not exist.
pub fn load_config(cli_path: Option<PathBuf>) -> Result<ConfigFile, CliError> {
    let path = resolve_config_path(cli_path)?;
    Ok(ConfigFile::load_or_default(&path)?)
}
