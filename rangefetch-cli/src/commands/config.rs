//! Configuration CLI command.
//!
//! `rangefetch config` prints the effective settings as INI, `--path`
//! prints where they are read from and `--init` writes a default file.

use std::path::PathBuf;

use rangefetch::config::ConfigFile;

use super::common::{load_config, resolve_config_path};
use crate::error::CliError;

/// Run the config command.
pub fn run(cli_path: Option<PathBuf>, init: bool, show_path: bool) -> Result<(), CliError> {
    if show_path {
        println!("{}", resolve_config_path(cli_path)?.display());
        return Ok(());
    }
    if init {
        let path = resolve_config_path(cli_path)?;
        if path.exists() {
            return Err(CliError::Usage(format!(
                "{} already exists; remove it first to write defaults",
                path.display()
            )));
        }
        ConfigFile::default().save(&path)?;
        println!("Wrote default configuration to {}", path.display());
        return Ok(());
    }

    let config = load_config(cli_path)?;
    print!("{}", config.to_ini_string());
    Ok(())
}
