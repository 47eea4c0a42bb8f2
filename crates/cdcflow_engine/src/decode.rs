//! Decoding of raw change notifications.
//!
//! The capture source hands the bridge Debezium-style JSON envelopes:
//!
//! ```json
//! { "op": "u",
//!   "source": { "schema": "public", "table": "orders", "pos": 17,
//!               "lsn": "0/16B3748", "ts_ms": 1700000000000 },
//!   "before": { "id": 1, "price": 5 },
//!   "after":  { "id": 1, "price": 10 },
//!   "ts_ms": 1700000000001,
//!   "transaction": { "id": "tx-9" } }
//! ```
//!
//! Op codes: `c` insert, `u` update, `d` delete, `r` snapshot read,
//! `s` schema change (with a `schema` block). A `{"payload": {...}}` wrapper
//! is unwrapped first.

use crate::error::{CdcError, CdcResult};
use cdcflow_core::{
    ChangeEvent, ColumnDefinition, OperationKind, Row, SchemaVersion, SequencePosition, TableId,
};
use serde::Deserialize;
use serde_json::Value;

#[derive(Deserialize)]
struct Envelope {
    op: String,
    source: Source,
    #[serde(default)]
    before: Option<Row>,
    #[serde(default)]
    after: Option<Row>,
    #[serde(default)]
    ts_ms: Option<u64>,
    #[serde(default)]
    transaction: Option<Transaction>,
    #[serde(default)]
    schema: Option<SchemaBlock>,
}

#[derive(Deserialize)]
struct Source {
    #[serde(default)]
    schema: Option<String>,
    table: String,
    pos: u64,
    #[serde(default)]
    lsn: Option<Value>,
    #[serde(default)]
    ts_ms: Option<u64>,
}

#[derive(Deserialize)]
struct Transaction {
    id: String,
}

#[derive(Deserialize)]
struct SchemaBlock {
    version: u32,
    columns: Vec<ColumnBlock>,
    #[serde(default)]
    primary_keys: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct ColumnBlock {
    name: String,
    #[serde(rename = "type")]
    data_type: String,
    #[serde(default = "default_nullable")]
    nullable: bool,
    #[serde(default)]
    primary_key: bool,
}

fn default_nullable() -> bool {
    true
}

fn operation(op: &str) -> CdcResult<OperationKind> {
    Ok(match op {
        "c" => OperationKind::Insert,
        "u" => OperationKind::Update,
        "d" => OperationKind::Delete,
        "r" => OperationKind::SnapshotRead,
        "s" => OperationKind::SchemaChange,
        other => return Err(CdcError::malformed(format!("unknown op code `{other}`"))),
    })
}

fn offset_token(lsn: Option<Value>, position: u64) -> CdcResult<String> {
    match lsn {
        None | Some(Value::Null) => Ok(position.to_string()),
        Some(Value::String(s)) => Ok(s),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(other) => Err(CdcError::malformed(format!(
            "source.lsn must be a string or number, got {other}"
        ))),
    }
}

/// Decodes one raw notification into a validated [`ChangeEvent`].
///
/// # Errors
///
/// Returns [`CdcError::MalformedEvent`] for invalid JSON, a missing or
/// ill-typed field, an unknown op code, or images that do not fit the op.
pub fn decode_change(raw: &[u8]) -> CdcResult<ChangeEvent> {
    let mut value: Value =
        serde_json::from_slice(raw).map_err(|e| CdcError::malformed(format!("invalid JSON: {e}")))?;

    if let Value::Object(map) = &mut value {
        if !map.contains_key("op") {
            if let Some(payload) = map.remove("payload") {
                value = payload;
            }
        }
    }

    let envelope: Envelope =
        serde_json::from_value(value).map_err(|e| CdcError::malformed(e.to_string()))?;

    let kind = operation(&envelope.op)?;
    let source = envelope.source;
    let table = TableId::qualified(source.schema.as_deref().unwrap_or(""), &source.table);
    if source.table.is_empty() {
        return Err(CdcError::malformed("source.table is empty"));
    }

    let schema = match (kind, envelope.schema) {
        (OperationKind::SchemaChange, Some(block)) => Some(schema_version(&table, block)?),
        (OperationKind::SchemaChange, None) => {
            return Err(CdcError::malformed("schema change without a schema block"))
        }
        (_, _) => None,
    };

    let event = ChangeEvent {
        position: SequencePosition::new(source.pos),
        kind,
        table,
        before: envelope.before,
        after: envelope.after,
        captured_at_ms: envelope.ts_ms.or(source.ts_ms).unwrap_or(0),
        tx_marker: envelope.transaction.map(|t| t.id),
        offset_token: offset_token(source.lsn, source.pos)?,
        schema,
    };
    event
        .validate()
        .map_err(|e| CdcError::malformed(e.to_string()))?;
    Ok(event)
}

fn schema_version(table: &TableId, block: SchemaBlock) -> CdcResult<SchemaVersion> {
    if block.version == 0 {
        return Err(CdcError::malformed("schema version must start at 1"));
    }
    let columns = block
        .columns
        .into_iter()
        .map(|c| ColumnDefinition {
            name: c.name,
            data_type: c.data_type,
            nullable: c.nullable && !c.primary_key,
            primary_key: c.primary_key,
        })
        .collect();
    let schema = SchemaVersion::new(table.clone(), block.version, columns);
    Ok(match block.primary_keys {
        Some(keys) => {
            if let Some(missing) = keys.iter().find(|k| !schema.has_column(k)) {
                return Err(CdcError::malformed(format!(
                    "primary key `{missing}` is not a column"
                )));
            }
            schema.with_primary_keys(keys)
        }
        None => schema,
    })
}
