//! Table schemas and the schema history log.
//!
//! The history log is the durable, append-only record of every schema
//! version the engine has accepted. At startup it is replayed in full into a
//! [`SchemaCatalog`], which data-change handlers read to resolve row images.
//!
//! ## Invariants
//!
//! - Versions of a table start at 1 and grow by exactly one
//! - A version is visible in the catalog only after its record is durable
//! - Re-offering an already logged version is a no-op (redelivery after a
//!   restart), never an error

use crate::error::{CoreError, CoreResult};
use crate::log::{RecordKind, RecordLog};
use crate::types::{now_millis, TableId};
use cdcflow_storage::StorageBackend;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Definition of one column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    /// Column name.
    pub name: String,
    /// Source data type, as reported by the capture source.
    pub data_type: String,
    /// Whether NULL is allowed.
    pub nullable: bool,
    /// Whether the column is part of the primary key.
    pub primary_key: bool,
}

impl ColumnDefinition {
    /// Creates a nullable, non-key column.
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
            primary_key: false,
        }
    }

    /// Marks the column NOT NULL.
    #[must_use]
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Marks the column as a primary-key column (implies NOT NULL).
    #[must_use]
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }
}

/// One version of a table's schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaVersion {
    /// Table this schema describes.
    pub table: TableId,
    /// Version number, starting at 1.
    pub version: u32,
    /// Columns in source order.
    pub columns: Vec<ColumnDefinition>,
    /// Primary-key column names in key order.
    pub primary_keys: Vec<String>,
}

impl SchemaVersion {
    /// Creates a schema; the primary key is taken from the column flags.
    pub fn new(table: impl Into<TableId>, version: u32, columns: Vec<ColumnDefinition>) -> Self {
        let primary_keys = columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.clone())
            .collect();
        Self {
            table: table.into(),
            version,
            columns,
            primary_keys,
        }
    }

    /// Sets the primary key explicitly (for composite keys in a specific
    /// order) and updates the column flags to match.
    #[must_use]
    pub fn with_primary_keys(mut self, keys: Vec<String>) -> Self {
        for column in &mut self.columns {
            column.primary_key = keys.contains(&column.name);
            if column.primary_key {
                column.nullable = false;
            }
        }
        self.primary_keys = keys;
        self
    }

    /// Looks up a column by name.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&ColumnDefinition> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Returns true if the schema defines `name`.
    #[must_use]
    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }
}

/// Persisted form of a schema version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaHistoryRecord {
    /// Table identifier.
    pub table: TableId,
    /// Version number.
    pub version: u32,
    /// Column list snapshot.
    pub columns: Vec<ColumnDefinition>,
    /// Primary key.
    pub primary_keys: Vec<String>,
    /// When the version was logged, ms since the epoch.
    pub timestamp_ms: u64,
}

impl SchemaHistoryRecord {
    fn from_schema(schema: &SchemaVersion, timestamp_ms: u64) -> Self {
        Self {
            table: schema.table.clone(),
            version: schema.version,
            columns: schema.columns.clone(),
            primary_keys: schema.primary_keys.clone(),
            timestamp_ms,
        }
    }

    /// Converts the record back into a schema version.
    #[must_use]
    pub fn into_schema(self) -> SchemaVersion {
        SchemaVersion {
            table: self.table,
            version: self.version,
            columns: self.columns,
            primary_keys: self.primary_keys,
        }
    }
}

/// Result of offering a schema version to the history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaAdvance {
    /// The version was the next one and has been logged.
    Appended,
    /// The version was already logged; nothing changed.
    AlreadyLogged,
}

/// Current schema per table, rebuilt from the history log.
#[derive(Debug, Default)]
pub struct SchemaCatalog {
    tables: RwLock<HashMap<TableId, Arc<SchemaVersion>>>,
}

impl SchemaCatalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current schema of `table`.
    #[must_use]
    pub fn current(&self, table: &TableId) -> Option<Arc<SchemaVersion>> {
        self.tables.read().get(table).cloned()
    }

    /// Returns the current version of `table`, 0 if none was logged.
    #[must_use]
    pub fn current_version(&self, table: &TableId) -> u32 {
        self.tables.read().get(table).map_or(0, |s| s.version)
    }

    /// Tables with at least one logged version, sorted.
    #[must_use]
    pub fn tables(&self) -> Vec<TableId> {
        let mut tables: Vec<TableId> = self.tables.read().keys().cloned().collect();
        tables.sort();
        tables
    }

    /// Classifies `schema` against the current version.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::SchemaSequence`] if the version skips ahead.
    pub fn check_next(&self, schema: &SchemaVersion) -> CoreResult<Option<SchemaAdvance>> {
        let current = self.current_version(&schema.table);
        if schema.version <= current {
            return Ok(Some(SchemaAdvance::AlreadyLogged));
        }
        if schema.version != current + 1 {
            return Err(CoreError::SchemaSequence {
                table: schema.table.clone(),
                expected: current + 1,
                found: schema.version,
            });
        }
        Ok(None)
    }

    fn install(&self, schema: SchemaVersion) {
        self.tables
            .write()
            .insert(schema.table.clone(), Arc::new(schema));
    }
}

/// Durable schema history plus the catalog it feeds.
pub struct SchemaHistoryLog {
    log: RecordLog,
    catalog: Arc<SchemaCatalog>,
    append_lock: Mutex<()>,
}

impl SchemaHistoryLog {
    /// Log name used in errors.
    pub const NAME: &'static str = "schema-history";

    /// Opens the history and replays it into a fresh catalog.
    ///
    /// # Errors
    ///
    /// Returns an error if the log is corrupted or its versions are not
    /// contiguous per table.
    pub fn open(backend: Box<dyn StorageBackend>) -> CoreResult<Self> {
        let log = RecordLog::open(Self::NAME, RecordKind::Schema, backend)?;
        let catalog = Arc::new(SchemaCatalog::new());

        let mut replayed = 0usize;
        log.for_each(|_, record: SchemaHistoryRecord| {
            let schema = record.into_schema();
            let expected = catalog.current_version(&schema.table) + 1;
            if schema.version != expected {
                return Err(CoreError::SchemaSequence {
                    table: schema.table,
                    expected,
                    found: schema.version,
                });
            }
            catalog.install(schema);
            replayed += 1;
            Ok(true)
        })?;

        info!(
            records = replayed,
            tables = catalog.tables().len(),
            "schema history replayed"
        );

        Ok(Self {
            log,
            catalog,
            append_lock: Mutex::new(()),
        })
    }

    /// Shared handle to the catalog.
    #[must_use]
    pub fn catalog(&self) -> Arc<SchemaCatalog> {
        Arc::clone(&self.catalog)
    }

    /// Offers a new schema version.
    ///
    /// The record is appended and synced before the catalog changes, so
    /// readers never see a version that is not durable.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::SchemaSequence`] if the version skips ahead, or a
    /// storage error if the append fails.
    pub fn append(&self, schema: &SchemaVersion) -> CoreResult<SchemaAdvance> {
        let _guard = self.append_lock.lock();

        if let Some(advance) = self.catalog.check_next(schema)? {
            debug!(
                table = %schema.table,
                version = schema.version,
                "schema version already logged"
            );
            return Ok(advance);
        }

        self.log
            .append(&SchemaHistoryRecord::from_schema(schema, now_millis()))?;
        self.catalog.install(schema.clone());
        info!(table = %schema.table, version = schema.version, "schema version logged");
        Ok(SchemaAdvance::Appended)
    }

    /// Every logged record, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error on corruption or decode failure.
    pub fn records(&self) -> CoreResult<Vec<SchemaHistoryRecord>> {
        Ok(self
            .log
            .read_all()?
            .into_iter()
            .map(|(_, record)| record)
            .collect())
    }
}

impl std::fmt::Debug for SchemaHistoryLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaHistoryLog")
            .field("tables", &self.catalog.tables())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdcflow_storage::InMemoryBackend;

    fn orders(version: u32) -> SchemaVersion {
        let mut columns = vec![
            ColumnDefinition::new("id", "int8").primary_key(),
            ColumnDefinition::new("price", "numeric"),
        ];
        if version >= 2 {
            columns.push(ColumnDefinition::new("note", "text"));
        }
        SchemaVersion::new("public.orders", version, columns)
    }

    #[test]
    fn primary_keys_follow_column_flags() {
        let schema = orders(1);
        assert_eq!(schema.primary_keys, vec!["id".to_string()]);
        assert!(!schema.column("id").unwrap().nullable);
        assert!(schema.has_column("price"));
        assert!(!schema.has_column("note"));
    }

    #[test]
    fn explicit_composite_key() {
        let schema = SchemaVersion::new(
            "line_items",
            1,
            vec![
                ColumnDefinition::new("order_id", "int8"),
                ColumnDefinition::new("line", "int4"),
            ],
        )
        .with_primary_keys(vec!["order_id".into(), "line".into()]);
        assert!(schema.column("line").unwrap().primary_key);
        assert_eq!(schema.primary_keys, vec!["order_id", "line"]);
    }

    #[test]
    fn append_contiguous_versions() {
        let history = SchemaHistoryLog::open(Box::new(InMemoryBackend::new())).unwrap();
        assert_eq!(history.append(&orders(1)).unwrap(), SchemaAdvance::Appended);
        assert_eq!(history.append(&orders(2)).unwrap(), SchemaAdvance::Appended);

        let catalog = history.catalog();
        let table = TableId::new("public.orders");
        assert_eq!(catalog.current_version(&table), 2);
        assert!(catalog.current(&table).unwrap().has_column("note"));
    }

    #[test]
    fn skipping_a_version_is_rejected() {
        let history = SchemaHistoryLog::open(Box::new(InMemoryBackend::new())).unwrap();
        let err = history.append(&orders(2)).unwrap_err();
        assert!(matches!(
            err,
            CoreError::SchemaSequence {
                expected: 1,
                found: 2,
                ..
            }
        ));
        assert_eq!(history.catalog().current_version(&TableId::new("public.orders")), 0);
        assert!(history.records().unwrap().is_empty());
    }

    #[test]
    fn redelivered_version_is_noop() {
        let history = SchemaHistoryLog::open(Box::new(InMemoryBackend::new())).unwrap();
        history.append(&orders(1)).unwrap();
        history.append(&orders(2)).unwrap();
        assert_eq!(
            history.append(&orders(1)).unwrap(),
            SchemaAdvance::AlreadyLogged
        );
        assert_eq!(history.records().unwrap().len(), 2);
    }

    #[test]
    fn replay_rebuilds_catalog() {
        let backend = InMemoryBackend::new();
        {
            let history = SchemaHistoryLog::open(Box::new(backend.clone())).unwrap();
            history.append(&orders(1)).unwrap();
            history.append(&orders(2)).unwrap();
            history
                .append(&SchemaVersion::new(
                    "public.customers",
                    1,
                    vec![ColumnDefinition::new("id", "int8").primary_key()],
                ))
                .unwrap();
        }

        let history = SchemaHistoryLog::open(Box::new(backend)).unwrap();
        let catalog = history.catalog();
        assert_eq!(
            catalog.tables(),
            vec![TableId::new("public.customers"), TableId::new("public.orders")]
        );
        assert_eq!(catalog.current_version(&TableId::new("public.orders")), 2);
    }

    #[test]
    fn failed_append_leaves_catalog_untouched() {
        let backend = InMemoryBackend::new();
        let history = SchemaHistoryLog::open(Box::new(backend.clone())).unwrap();
        backend.fail_syncs(true);
        assert!(history.append(&orders(1)).is_err());
        assert_eq!(history.catalog().current_version(&TableId::new("public.orders")), 0);
    }
}
