//! Dead-letters command implementation.

use super::{format_ts, open_state, print_json, CommandResult, OutputFormat};
use cdcflow_core::{DeadLetterLog, DeadLetterRecord};
use std::path::Path;

/// Runs the dead-letters command.
pub fn run(path: &Path, limit: Option<usize>, format: OutputFormat) -> CommandResult<()> {
    let (_lock, stores) = open_state(path)?;
    let total = stores.dead_letters.len();
    let records = collect(&stores.dead_letters, limit)?;

    match format {
        OutputFormat::Json => print_json(&records)?,
        OutputFormat::Text => print_text_output(&records, total),
    }
    Ok(())
}

/// The newest `limit` records, oldest first.
fn collect(log: &DeadLetterLog, limit: Option<usize>) -> CommandResult<Vec<DeadLetterRecord>> {
    let mut records = log.read_all()?;
    if let Some(limit) = limit {
        let skip = records.len().saturating_sub(limit);
        records.drain(..skip);
    }
    Ok(records)
}

fn print_text_output(records: &[DeadLetterRecord], total: u64) {
    println!("Dead letters ({} shown, {} total)", records.len(), total);
    println!("================");
    for record in records {
        let event = &record.event;
        println!();
        println!(
            "[{}] {} {} token={} attempts={} at={}",
            event.position,
            event.kind,
            event.table,
            event.offset_token,
            record.attempt_count,
            format_ts(record.timestamp_ms)
        );
        println!("    reason: {}", record.failure_reason);
        if let Some(tx) = &event.tx_marker {
            println!("    tx: {tx}");
        }
        for (label, image) in [("before", &event.before), ("after", &event.after)] {
            if let Some(image) = image {
                let rendered = serde_json::to_string(image).unwrap_or_else(|_| "?".into());
                println!("    {label}: {rendered}");
            }
        }
    }
}
