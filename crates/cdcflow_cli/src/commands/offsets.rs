//! Offsets command implementation.

use super::{format_ts, open_state, print_json, CommandResult, OutputFormat};
use cdcflow_core::{OffsetRecord, OffsetStore};
use serde::Serialize;
use std::path::Path;

/// One commit, for output.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct CommitInfo {
    /// Sequence position.
    pub position: u64,
    /// Source-native resume token.
    pub token: String,
    /// Capture session that made the commit.
    pub session_id: String,
    /// Commit time, ms since the epoch.
    pub commit_ts_ms: u64,
}

impl From<OffsetRecord> for CommitInfo {
    fn from(record: OffsetRecord) -> Self {
        Self {
            position: record.offset.position.as_u64(),
            token: record.offset.token,
            session_id: record.session_id.to_string(),
            commit_ts_ms: record.commit_ts_ms,
        }
    }
}

/// Runs the offsets command.
pub fn run(path: &Path, history: bool, format: OutputFormat) -> CommandResult<()> {
    let (_lock, stores) = open_state(path)?;
    let commits = collect(&stores.offsets, history)?;

    match format {
        OutputFormat::Json if history => print_json(&commits)?,
        OutputFormat::Json => print_json(&commits.last())?,
        OutputFormat::Text => print_text_output(&commits, history),
    }
    Ok(())
}

fn collect(offsets: &OffsetStore, history: bool) -> CommandResult<Vec<CommitInfo>> {
    if history {
        Ok(offsets.history()?.into_iter().map(CommitInfo::from).collect())
    } else {
        Ok(offsets.last().map(CommitInfo::from).into_iter().collect())
    }
}

fn print_text_output(commits: &[CommitInfo], history: bool) {
    if commits.is_empty() {
        println!("No committed offset; the next start begins at the source's beginning");
        return;
    }
    if history {
        println!("Offset commits ({} total)", commits.len());
        println!("================");
    }
    for commit in commits {
        println!(
            "pos:{:<12} token={:<20} session={} at={}",
            commit.position,
            commit.token,
            commit.session_id,
            format_ts(commit.commit_ts_ms)
        );
    }
}
