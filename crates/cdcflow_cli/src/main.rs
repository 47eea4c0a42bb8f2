//! cdcflow CLI
//!
//! Operator tools for a cdcflow state directory.
//!
//! # Commands
//!
//! - `offsets` - Show the committed offset or the full commit history
//! - `schema-history` - List logged schema versions
//! - `dead-letters` - List dead-lettered events
//! - `verify` - Check every durable log frame by frame
//! - `version` - Show version information
//!
//! All commands take the state directory lock, so they refuse to run
//! against a directory a live engine is using.

mod commands;

use clap::{Parser, Subcommand};
use commands::OutputFormat;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// cdcflow state directory tools.
#[derive(Parser)]
#[command(name = "cdcflow")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the engine state directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show committed offsets
    Offsets {
        /// List every commit instead of only the last one
        #[arg(long)]
        history: bool,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// List logged schema versions
    SchemaHistory {
        /// Only show this table (qualified or bare name)
        #[arg(short, long)]
        table: Option<String>,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// List dead-lettered events
    DeadLetters {
        /// Maximum number of records to show, newest last
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Verify the integrity of every durable log
    Verify {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Offsets { history, format } => {
            let path = cli.path.ok_or("State directory path required for offsets")?;
            commands::offsets::run(&path, history, format)?;
        }
        Commands::SchemaHistory { table, format } => {
            let path = cli
                .path
                .ok_or("State directory path required for schema-history")?;
            commands::schema_history::run(&path, table.as_deref(), format)?;
        }
        Commands::DeadLetters { limit, format } => {
            let path = cli
                .path
                .ok_or("State directory path required for dead-letters")?;
            commands::dead_letters::run(&path, limit, format)?;
        }
        Commands::Verify { format } => {
            let path = cli.path.ok_or("State directory path required for verify")?;
            commands::verify::run(&path, format)?;
        }
        Commands::Version => {
            println!("cdcflow CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("cdcflow core v{}", cdcflow_core::VERSION);
            println!("cdcflow engine v{}", cdcflow_engine::VERSION);
        }
    }

    Ok(())
}
