//! CLI error type.

use std::fmt;

use rangefetch::error::{ConfigError, DownloadError, LoggingError};

/// Errors reported by CLI commands.
#[derive(Debug)]
pub enum CliError {
    /// Loading or saving the configuration file failed.
    Config(ConfigError),
    /// No configuration directory could be determined.
    NoConfigPath,
    /// Logging could not be initialised.
    Logging(LoggingError),
    /// The download engine could not be created.
    Engine(DownloadError),
    /// The Ctrl-C handler could not be installed.
    Signal(String),
    /// Arguments that cannot be combined.
    Usage(String),
    /// Some downloads did not complete.
    Incomplete { failed: usize, total: usize },
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Config(e) => write!(f, "Configuration error: {}", e),
            CliError::NoConfigPath => write!(
                f,
                "Could not determine the configuration directory. Use --config to pass a path."
            ),
            CliError::Logging(e) => write!(f, "Failed to initialise logging: {}", e),
            CliError::Engine(e) => write!(f, "Failed to start the download engine: {}", e),
            CliError::Signal(e) => write!(f, "Failed to install the Ctrl-C handler: {}", e),
            CliError::Usage(e) => write!(f, "{}", e),
            CliError::Incomplete { failed, total } => {
                write!(f, "{} of {} downloads did not complete", failed, total)
            }
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CliError::Config(e) => Some(e),
            CliError::Logging(e) => Some(e),
            CliError::Engine(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConfigError> for CliError {
    fn from(e: ConfigError) -> Self {
        CliError::Config(e)
    }
}

impl From<LoggingError> for CliError {
    fn from(e: LoggingError) -> Self {
        CliError::Logging(e)
    }
}

impl From<DownloadError> for CliError {
    fn from(e: DownloadError) -> Self {
        CliError::Engine(e)
    }
}
