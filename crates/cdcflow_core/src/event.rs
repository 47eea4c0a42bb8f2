//! The change event data model.
//!
//! A [`ChangeEvent`] is one row-level change (or one schema change) captured
//! from the source database. Events are created by the capture bridge, owned
//! by the queue while buffered, and by a worker while being handled.
//!
//! # Image rules
//!
//! | kind           | before | after |
//! |----------------|--------|-------|
//! | snapshot-read  | -      | yes   |
//! | insert         | -      | yes   |
//! | update         | yes    | yes   |
//! | delete         | yes    | -     |
//! | schema-change  | -      | -     |

use crate::error::{CoreError, CoreResult};
use crate::schema::SchemaVersion;
use crate::types::{SequencePosition, SourceOffset, TableId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// One row image: column name to value.
pub type Row = BTreeMap<String, serde_json::Value>;

/// Kind of captured change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Row read during the initial snapshot.
    SnapshotRead,
    /// Row inserted.
    Insert,
    /// Row updated.
    Update,
    /// Row deleted.
    Delete,
    /// Table schema changed.
    SchemaChange,
}

impl OperationKind {
    /// Returns true for kinds that write or delete a row.
    #[must_use]
    pub fn is_data_change(self) -> bool {
        !matches!(self, Self::SchemaChange)
    }

    /// Short label used in logs and statistics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SnapshotRead => "snapshot_read",
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::SchemaChange => "schema_change",
        }
    }

    fn needs_before(self) -> bool {
        matches!(self, Self::Update | Self::Delete)
    }

    fn needs_after(self) -> bool {
        matches!(self, Self::SnapshotRead | Self::Insert | Self::Update)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single captured change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Source-assigned position, strictly increasing within a session.
    pub position: SequencePosition,
    /// What happened.
    pub kind: OperationKind,
    /// Table the change belongs to.
    pub table: TableId,
    /// Row image before the change (update, delete).
    pub before: Option<Row>,
    /// Row image after the change (snapshot-read, insert, update).
    pub after: Option<Row>,
    /// Capture timestamp, milliseconds since the epoch.
    pub captured_at_ms: u64,
    /// Source transaction marker, if the source reports one.
    pub tx_marker: Option<String>,
    /// Opaque resume token for this position (LSN, binlog coordinate).
    pub offset_token: String,
    /// New schema, present only for schema changes.
    pub schema: Option<SchemaVersion>,
}

impl ChangeEvent {
    fn base(position: u64, kind: OperationKind, table: TableId) -> Self {
        Self {
            position: SequencePosition::new(position),
            kind,
            table,
            before: None,
            after: None,
            captured_at_ms: 0,
            tx_marker: None,
            offset_token: position.to_string(),
            schema: None,
        }
    }

    /// Creates a snapshot-read event.
    pub fn snapshot_read(position: u64, table: impl Into<TableId>, after: Row) -> Self {
        Self {
            after: Some(after),
            ..Self::base(position, OperationKind::SnapshotRead, table.into())
        }
    }

    /// Creates an insert event.
    pub fn insert(position: u64, table: impl Into<TableId>, after: Row) -> Self {
        Self {
            after: Some(after),
            ..Self::base(position, OperationKind::Insert, table.into())
        }
    }

    /// Creates an update event.
    pub fn update(position: u64, table: impl Into<TableId>, before: Row, after: Row) -> Self {
        Self {
            before: Some(before),
            after: Some(after),
            ..Self::base(position, OperationKind::Update, table.into())
        }
    }

    /// Creates a delete event.
    pub fn delete(position: u64, table: impl Into<TableId>, before: Row) -> Self {
        Self {
            before: Some(before),
            ..Self::base(position, OperationKind::Delete, table.into())
        }
    }

    /// Creates a schema-change event carrying `schema`.
    pub fn schema_change(position: u64, schema: SchemaVersion) -> Self {
        let table = schema.table.clone();
        Self {
            schema: Some(schema),
            ..Self::base(position, OperationKind::SchemaChange, table)
        }
    }

    /// Sets the opaque offset token.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.offset_token = token.into();
        self
    }

    /// Sets the transaction marker.
    #[must_use]
    pub fn with_tx(mut self, tx: impl Into<String>) -> Self {
        self.tx_marker = Some(tx.into());
        self
    }

    /// Sets the capture timestamp.
    #[must_use]
    pub fn with_timestamp(mut self, captured_at_ms: u64) -> Self {
        self.captured_at_ms = captured_at_ms;
        self
    }

    /// Returns the resumable offset of this event.
    #[must_use]
    pub fn offset(&self) -> SourceOffset {
        SourceOffset::new(self.position, self.offset_token.clone())
    }

    /// Checks the image rules for this event's kind.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidEvent`] naming the first rule broken.
    pub fn validate(&self) -> CoreResult<()> {
        let fail = |message: String| CoreError::InvalidEvent {
            position: self.position.as_u64(),
            message,
        };

        if self.kind == OperationKind::SchemaChange {
            let schema = self
                .schema
                .as_ref()
                .ok_or_else(|| fail("schema change without schema".into()))?;
            if schema.table != self.table {
                return Err(fail(format!(
                    "schema for {} attached to event for {}",
                    schema.table, self.table
                )));
            }
            if self.before.is_some() || self.after.is_some() {
                return Err(fail("schema change must not carry row images".into()));
            }
            return Ok(());
        }

        if self.schema.is_some() {
            return Err(fail(format!("{} event must not carry a schema", self.kind)));
        }
        if self.kind.needs_before() != self.before.is_some() {
            return Err(fail(format!(
                "{} event {} a before image",
                self.kind,
                if self.before.is_some() { "must not have" } else { "requires" }
            )));
        }
        if self.kind.needs_after() != self.after.is_some() {
            return Err(fail(format!(
                "{} event {} an after image",
                self.kind,
                if self.after.is_some() { "must not have" } else { "requires" }
            )));
        }
        Ok(())
    }

    /// Extracts the primary-key columns from the after image, falling back
    /// to the before image. Returns `None` if any key column is missing or
    /// null.
    #[must_use]
    pub fn primary_key(&self, key_columns: &[String]) -> Option<Row> {
        let image = self.after.as_ref().or(self.before.as_ref())?;
        key_row(image, key_columns)
    }
}

/// Projects `image` onto `key_columns`; `None` if a key is absent or null.
#[must_use]
pub fn key_row(image: &Row, key_columns: &[String]) -> Option<Row> {
    if key_columns.is_empty() {
        return None;
    }
    let mut key = Row::new();
    for column in key_columns {
        match image.get(column) {
            Some(value) if !value.is_null() => {
                key.insert(column.clone(), value.clone());
            }
            _ => return None,
        }
    }
    Some(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnDefinition;
    use serde_json::json;

    fn row(pairs: &[(&str, serde_json::Value)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn constructors_satisfy_image_rules() {
        let r = row(&[("id", json!(1))]);
        ChangeEvent::snapshot_read(1, "t", r.clone()).validate().unwrap();
        ChangeEvent::insert(2, "t", r.clone()).validate().unwrap();
        ChangeEvent::update(3, "t", r.clone(), r.clone()).validate().unwrap();
        ChangeEvent::delete(4, "t", r).validate().unwrap();
    }

    #[test]
    fn delete_with_after_image_is_invalid() {
        let mut event = ChangeEvent::delete(1, "t", row(&[("id", json!(1))]));
        event.after = Some(row(&[("id", json!(1))]));
        let err = event.validate().unwrap_err();
        assert!(err.to_string().contains("must not have an after image"));
    }

    #[test]
    fn update_without_before_is_invalid() {
        let mut event = ChangeEvent::update(
            1,
            "t",
            row(&[("id", json!(1))]),
            row(&[("id", json!(1))]),
        );
        event.before = None;
        assert!(matches!(
            event.validate(),
            Err(CoreError::InvalidEvent { position: 1, .. })
        ));
    }

    #[test]
    fn schema_change_table_must_match() {
        let schema = SchemaVersion::new(
            "public.orders",
            1,
            vec![ColumnDefinition::new("id", "int").primary_key()],
        );
        let mut event = ChangeEvent::schema_change(9, schema);
        event.validate().unwrap();
        event.table = TableId::new("public.other");
        assert!(event.validate().is_err());
    }

    #[test]
    fn primary_key_prefers_after_image() {
        let event = ChangeEvent::update(
            5,
            "t",
            row(&[("id", json!(1)), ("v", json!("old"))]),
            row(&[("id", json!(2)), ("v", json!("new"))]),
        );
        let key = event.primary_key(&["id".to_string()]).unwrap();
        assert_eq!(key.get("id"), Some(&json!(2)));
    }

    #[test]
    fn null_key_column_is_missing() {
        let event = ChangeEvent::insert(1, "t", row(&[("id", serde_json::Value::Null)]));
        assert!(event.primary_key(&["id".to_string()]).is_none());
        assert!(event.primary_key(&[]).is_none());
    }

    #[test]
    fn default_token_is_position() {
        let event = ChangeEvent::insert(42, "t", Row::new());
        assert_eq!(event.offset().token, "42");
        let event = event.with_token("0/16B3748");
        assert_eq!(event.offset().token, "0/16B3748");
    }
}
