//! mirra: keep a WebP mirror of every image tree you point it at.
//!
//! # Usage
//!
//! ```text
//! mirra run [-c FILE]
//! mirra scan [-c FILE] [--dry-run]
//! mirra status [-c FILE] [--json]
//! mirra stop [-c FILE]
//! mirra rescan [ROOT] [-c FILE]
//! mirra config init <FILE> [--force]
//! mirra config show [-c FILE]
//! ```

mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{config::ConfigCommand, daemon::RescanArgs, daemon::StatusArgs, scan::ScanArgs};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "mirra",
    version,
    about = "Mirror source image trees into WebP subdirectories",
    long_about = None,
)]
struct Cli {
    /// Config file (YAML or JSON). Defaults to ~/.mirra/config.yaml.
    #[arg(long, short = 'c', global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the watcher daemon in the foreground.
    Run,

    /// Reconcile every watched root once and exit.
    Scan(ScanArgs),

    /// Query the running daemon.
    Status(StatusArgs),

    /// Ask the running daemon to shut down.
    Stop,

    /// Ask the running daemon to reconcile one root, or all of them.
    Rescan(RescanArgs),

    /// Create or inspect the config file.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.config.as_deref();
    match cli.command {
        Commands::Run => commands::daemon::run(config),
        Commands::Scan(args) => args.run(config),
        Commands::Status(args) => args.run(config),
        Commands::Stop => commands::daemon::stop(config),
        Commands::Rescan(args) => args.run(config),
        Commands::Config { command } => commands::config::run(command, config),
    }
}
