//! revkb CLI
//!
//! Command-line tools for journal-backed revkb stores.
//!
//! # Commands
//!
//! - `init` - Create an empty store
//! - `inspect` - Display store statistics, tables and branches
//! - `history` - List committed revisions
//! - `demo` - Run the two-revision walkthrough against a store
//! - `verify` - Check journal frames and row histories

mod commands;
mod error;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use crate::error::CliError;

/// revkb command-line store tools.
#[derive(Parser)]
#[command(name = "revkb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the store directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Output format of reporting commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    /// Human readable text
    Text,
    /// Pretty-printed JSON
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an empty store
    Init,

    /// Display store statistics and metadata
    Inspect {
        /// Show branch details
        #[arg(short, long)]
        branches: bool,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
    },

    /// List committed revisions, newest first
    History {
        /// Maximum number of revisions to list
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
    },

    /// Commit X="a", edit it to "b" in a second transaction and read both
    /// revisions back
    Demo,

    /// Verify journal frames and row histories
    Verify,

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging; RUST_LOG wins over --verbose
    let default = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Init => {
            let path = cli.path.ok_or(CliError::PathRequired("init"))?;
            commands::init::run(&path)?;
        }
        Commands::Inspect { branches, format } => {
            let path = cli.path.ok_or(CliError::PathRequired("inspect"))?;
            commands::inspect::run(&path, branches, format)?;
        }
        Commands::History { limit, format } => {
            let path = cli.path.ok_or(CliError::PathRequired("history"))?;
            commands::history::run(&path, limit, format)?;
        }
        Commands::Demo => {
            let path = cli.path.ok_or(CliError::PathRequired("demo"))?;
            commands::demo::run(&path)?;
        }
        Commands::Verify => {
            let path = cli.path.ok_or(CliError::PathRequired("verify"))?;
            commands::verify::run(&path)?;
        }
        Commands::Version => {
            println!("revkb CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
