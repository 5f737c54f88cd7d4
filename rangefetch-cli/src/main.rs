//! Rangefetch CLI - Command-line interface
//!
//! Downloads one or more URLs with the rangefetch engine, resuming from
//! stored breakpoints and splitting large resources across connections.

mod commands;
mod error;
mod progress;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Parser, Subcommand};

use commands::get::GetArgs;
use error::CliError;

#[derive(Debug, Parser)]
#[command(name = "rangefetch", version, about = "Resumable multi-connection downloader")]
struct Cli {
    /// Configuration file (defaults to <config dir>/rangefetch/config.ini)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Download one or more URLs
    Get {
        /// URLs to download
        #[arg(required = true)]
        urls: Vec<String>,

        /// Directory to save into
        #[arg(short, long, default_value = ".")]
        output: PathBuf,

        /// File name to save as (single URL only)
        #[arg(short = 'n', long)]
        name: Option<String>,

        /// Fixed number of connections per download
        #[arg(long)]
        connections: Option<usize>,

        /// Maximum downloads running at once
        #[arg(long)]
        max_parallel: Option<usize>,

        /// Priority of the downloads; higher runs first
        #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
        priority: i32,
    },

    /// Show or initialise the configuration file
    Config {
        /// Write a default configuration file
        #[arg(long)]
        init: bool,

        /// Print the configuration file path and exit
        #[arg(long)]
        path: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let verbosity = commands::common::Verbosity::from_flags(cli.verbose, cli.quiet);
    match cli.command {
        Commands::Get {
            urls,
            output,
            name,
            connections,
            max_parallel,
            priority,
        } => commands::get::run(GetArgs {
            urls,
            output,
            name,
            connections,
            max_parallel,
            priority,
            config: cli.config,
            verbosity,
        }),
        Commands::Config { init, path } => commands::config::run(cli.config, init, path),
    }
}
