//! CLI command implementations.

pub mod dead_letters;
pub mod offsets;
pub mod schema_history;
pub mod verify;

use cdcflow_core::{DurableStores, StateDir};
use serde::Serialize;
use std::path::Path;

/// Result type shared by the commands.
pub type CommandResult<T> = Result<T, Box<dyn std::error::Error>>;

/// How command output is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text
    Text,
    /// Pretty-printed JSON
    Json,
}

/// Locks an existing state directory and opens its logs.
pub fn open_state(path: &Path) -> CommandResult<(StateDir, DurableStores)> {
    let dir = StateDir::open(path, false)?;
    let stores = dir.open_stores()?;
    Ok((dir, stores))
}

/// Prints `value` as pretty JSON.
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> CommandResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Formats milliseconds since the epoch as `seconds.millis`.
pub fn format_ts(ms: u64) -> String {
    format!("{}.{:03}", ms / 1000, ms % 1000)
}
