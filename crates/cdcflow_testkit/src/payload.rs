//! Builders for raw change envelopes.

use cdcflow_core::{Row, SchemaVersion};
use serde_json::{json, Map, Value};

/// Builds the JSON notifications a capture source hands the bridge.
///
/// ```rust,ignore
/// let items = PayloadBuilder::new("public", "items");
/// bridge.on_raw_change(&items.insert(1, item(1, 5)))?;
/// ```
#[derive(Debug, Clone)]
pub struct PayloadBuilder {
    schema: String,
    table: String,
    wrapped: bool,
    tx: Option<String>,
}

impl PayloadBuilder {
    /// Payloads for `schema.table`.
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            wrapped: false,
            tx: None,
        }
    }

    /// Wraps every envelope in `{"payload": ...}`.
    pub fn wrapped(mut self) -> Self {
        self.wrapped = true;
        self
    }

    /// Tags every envelope with a transaction id.
    pub fn in_tx(mut self, tx: impl Into<String>) -> Self {
        self.tx = Some(tx.into());
        self
    }

    /// An insert (`op: c`).
    pub fn insert(&self, pos: u64, after: Row) -> Vec<u8> {
        self.envelope("c", pos, None, Some(after), None)
    }

    /// An update (`op: u`).
    pub fn update(&self, pos: u64, before: Row, after: Row) -> Vec<u8> {
        self.envelope("u", pos, Some(before), Some(after), None)
    }

    /// A delete (`op: d`).
    pub fn delete(&self, pos: u64, before: Row) -> Vec<u8> {
        self.envelope("d", pos, Some(before), None, None)
    }

    /// A snapshot read (`op: r`).
    pub fn snapshot(&self, pos: u64, after: Row) -> Vec<u8> {
        self.envelope("r", pos, None, Some(after), None)
    }

    /// A schema change (`op: s`) carrying `schema`.
    pub fn schema_change(&self, pos: u64, schema: &SchemaVersion) -> Vec<u8> {
        let columns: Vec<Value> = schema
            .columns
            .iter()
            .map(|c| {
                json!({
                    "name": c.name,
                    "type": c.data_type,
                    "nullable": c.nullable,
                    "primary_key": c.primary_key,
                })
            })
            .collect();
        let block = json!({
            "version": schema.version,
            "columns": columns,
            "primary_keys": schema.primary_keys,
        });
        self.envelope("s", pos, None, None, Some(block))
    }

    fn envelope(
        &self,
        op: &str,
        pos: u64,
        before: Option<Row>,
        after: Option<Row>,
        schema: Option<Value>,
    ) -> Vec<u8> {
        let mut map = Map::new();
        map.insert("op".into(), json!(op));
        map.insert(
            "source".into(),
            json!({
                "schema": self.schema,
                "table": self.table,
                "pos": pos,
                "lsn": format!("0/{pos:X}"),
                "ts_ms": 1_700_000_000_000u64 + pos,
            }),
        );
        if let Some(before) = before {
            map.insert("before".into(), json!(before));
        }
        if let Some(after) = after {
            map.insert("after".into(), json!(after));
        }
        if let Some(schema) = schema {
            map.insert("schema".into(), schema);
        }
        if let Some(tx) = &self.tx {
            map.insert("transaction".into(), json!({ "id": tx }));
        }

        let envelope = Value::Object(map);
        let value = if self.wrapped {
            json!({ "payload": envelope })
        } else {
            envelope
        };
        value.to_string().into_bytes()
    }
}
