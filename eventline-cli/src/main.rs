//! Eventline CLI - Command-line interface
//!
//! Inspect, feed and drain the local event queue of an eventline pipeline.

mod commands;
mod error;

use std::path::PathBuf;
use std::process;
use std::time::Duration;

use clap::{Parser, Subcommand};
use eventline::logging::{init_logging, LoggingGuard};

use commands::common::{load_config, PriorityArg};
use commands::config::ConfigCommands;
use error::CliError;

#[derive(Debug, Parser)]
#[command(name = "eventline")]
#[command(about = "Durable event telemetry queue", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (default: <config dir>/eventline/config.ini)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Append an event to the local queue
    Record {
        /// Event payload
        message: String,

        /// Delivery priority
        #[arg(long, value_enum, default_value = "normal")]
        priority: PriorityArg,
    },

    /// Deliver queued events to the configured collector and exit
    Drain {
        /// Seconds to wait for the queue to empty
        #[arg(long, default_value = "30")]
        timeout_secs: u64,
    },

    /// Show queue statistics
    Status,

    /// View or initialise the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Config(command) => commands::config::run(command, config_path),
        Commands::Record { message, priority } => {
            let config = load_config(config_path)?;
            let _guard = start_logging(&config, cli.verbose)?;
            commands::record::run(&config, &message, priority)
        }
        Commands::Drain { timeout_secs } => {
            let config = load_config(config_path)?;
            let _guard = start_logging(&config, cli.verbose)?;
            commands::drain::run(&config, Duration::from_secs(timeout_secs))
        }
        Commands::Status => {
            let config = load_config(config_path)?;
            let _guard = start_logging(&config, cli.verbose)?;
            commands::status::run(&config)
        }
    }
}

fn start_logging(
    config: &eventline::ConfigFile,
    verbose: bool,
) -> Result<LoggingGuard, CliError> {
    let mut logging = config.logging.clone();
    if verbose {
        logging.level = "debug".to_string();
    }
    Ok(init_logging(&logging)?)
}
