//! Schema history command implementation.

use super::{format_ts, open_state, print_json, CommandResult, OutputFormat};
use cdcflow_core::{SchemaHistoryLog, SchemaHistoryRecord};
use std::path::Path;

/// Runs the schema-history command.
pub fn run(path: &Path, table: Option<&str>, format: OutputFormat) -> CommandResult<()> {
    let (_lock, stores) = open_state(path)?;
    let records = collect(&stores.schema_history, table)?;

    match format {
        OutputFormat::Json => print_json(&records)?,
        OutputFormat::Text => print_text_output(&records),
    }
    Ok(())
}

fn collect(history: &SchemaHistoryLog, table: Option<&str>) -> CommandResult<Vec<SchemaHistoryRecord>> {
    let mut records = history.records()?;
    if let Some(pattern) = table {
        records.retain(|r| r.table.matches(pattern));
    }
    Ok(records)
}

fn print_text_output(records: &[SchemaHistoryRecord]) {
    println!("Schema versions ({} total)", records.len());
    println!("================");
    for record in records {
        println!();
        println!(
            "{} v{}  key=({})  logged at {}",
            record.table,
            record.version,
            record.primary_keys.join(", "),
            format_ts(record.timestamp_ms)
        );
        for column in &record.columns {
            println!(
                "    {:<24} {:<16}{}",
                column.name,
                column.data_type,
                if column.nullable { "" } else { " NOT NULL" }
            );
        }
    }
}
