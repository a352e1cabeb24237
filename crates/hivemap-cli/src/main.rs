//! # hivemap CLI
//!
//! Command-line front end for the view cache and the change hub.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hivemap_config::logging::{init_logging, LogLevel};

mod notify;
mod scan;

/// hivemap - bounded file views and change notification
#[derive(Parser)]
#[command(name = "hivemap")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log level (error, warn, info, debug, trace); defaults to the configured level
    #[arg(long, global = true, env = "HIVEMAP_LOG")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Map every view of a file through the view cache and print statistics
    Scan(scan::ScanArgs),

    /// Print the effective configuration as TOML
    Config,

    /// Watch a key, report a change from another thread, print what arrived
    Notify(notify::NotifyArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = hivemap_config::config().clone();

    let level_name = cli.log_level.as_deref().unwrap_or(&config.logging.level);
    let level: LogLevel = level_name
        .parse()
        .map_err(anyhow::Error::msg)
        .context("Invalid --log-level")?;
    init_logging(level);

    match cli.command {
        Commands::Scan(args) => scan::run(&config, args),
        Commands::Config => {
            print!("{}", config.to_toml());
            Ok(())
        }
        Commands::Notify(args) => notify::run(&config, args),
    }
}
