//! Sink connector boundary and an in-memory sink.

use crate::error::{CdcError, CdcResult};
use crate::type_map::TypeMap;
use cdcflow_core::{Row, SchemaVersion, TableId};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::debug;

/// A keyed write against the target system.
///
/// Requests are idempotent: replaying one after a crash converges to the
/// same target state.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteRequest {
    /// Insert or replace the row with `key`.
    Upsert {
        /// Target table.
        table: TableId,
        /// Primary-key columns and values.
        key: Row,
        /// Full row image.
        row: Row,
        /// Replace an existing row; `false` only inserts if absent.
        overwrite: bool,
    },
    /// Remove the row with `key`, if present.
    Delete {
        /// Target table.
        table: TableId,
        /// Primary-key columns and values.
        key: Row,
    },
}

impl WriteRequest {
    /// Target table.
    #[must_use]
    pub fn table(&self) -> &TableId {
        match self {
            Self::Upsert { table, .. } | Self::Delete { table, .. } => table,
        }
    }

    /// Primary key of the affected row.
    #[must_use]
    pub fn key(&self) -> &Row {
        match self {
            Self::Upsert { key, .. } | Self::Delete { key, .. } => key,
        }
    }
}

/// A downstream system the engine writes into.
///
/// Implementations classify failures: [`CdcError::TransientSink`] is
/// retried, [`CdcError::PermanentSink`] sends the event to the dead-letter
/// log. `write` may be called from several worker threads at once.
pub trait SinkConnector: Send + Sync {
    /// Opens connections; called once at engine start.
    fn connect(&self) -> CdcResult<()>;

    /// Applies one keyed write.
    fn write(&self, request: &WriteRequest) -> CdcResult<()>;

    /// Makes all acknowledged writes durable. Called before every offset
    /// commit.
    fn flush(&self) -> CdcResult<()>;

    /// Flushes and releases connections; called once at engine stop.
    fn close(&self) -> CdcResult<()>;

    /// Creates or alters the target table for a new schema version.
    ///
    /// Receives the schema after [`SinkConnector::target_schema`].
    fn apply_schema(&self, _schema: &SchemaVersion) -> CdcResult<()> {
        Ok(())
    }

    /// Translates a source schema into the target's column types.
    ///
    /// The schema history keeps the source types; only the sink sees the
    /// translated schema. Defaults to passing the schema through.
    fn target_schema(&self, schema: &SchemaVersion) -> SchemaVersion {
        schema.clone()
    }
}

/// Rows of one table, keyed by the canonical JSON of their primary key.
pub type TableRows = BTreeMap<String, Row>;

/// An in-memory keyed sink.
#[derive(Debug, Default)]
pub struct MemorySink {
    tables: RwLock<BTreeMap<TableId, TableRows>>,
    schemas: RwLock<BTreeMap<TableId, SchemaVersion>>,
    connected: AtomicBool,
    writes: AtomicU64,
    flushes: AtomicU64,
    type_map: TypeMap,
}

impl MemorySink {
    /// Creates an empty, disconnected sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Translates column types of applied schemas with `type_map`.
    #[must_use]
    pub fn with_type_map(mut self, type_map: TypeMap) -> Self {
        self.type_map = type_map;
        self
    }

    fn key_string(key: &Row) -> CdcResult<String> {
        serde_json::to_string(key).map_err(|e| CdcError::permanent(e.to_string()))
    }

    /// Returns the row stored under `key`.
    #[must_use]
    pub fn get(&self, table: &TableId, key: &Row) -> Option<Row> {
        let key = Self::key_string(key).ok()?;
        self.tables.read().get(table)?.get(&key).cloned()
    }

    /// Rows of `table` in key order.
    #[must_use]
    pub fn rows(&self, table: &TableId) -> Vec<Row> {
        self.tables
            .read()
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of rows in `table`.
    #[must_use]
    pub fn row_count(&self, table: &TableId) -> usize {
        self.tables.read().get(table).map_or(0, BTreeMap::len)
    }

    /// Copy of every table's rows.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<TableId, TableRows> {
        self.tables.read().clone()
    }

    /// Last schema applied for `table`.
    #[must_use]
    pub fn schema(&self, table: &TableId) -> Option<SchemaVersion> {
        self.schemas.read().get(table).cloned()
    }

    /// Successful writes so far.
    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Flushes so far.
    #[must_use]
    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::SeqCst)
    }

    /// Returns true between `connect` and `close`.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl SinkConnector for MemorySink {
    fn connect(&self) -> CdcResult<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn write(&self, request: &WriteRequest) -> CdcResult<()> {
        if !self.is_connected() {
            return Err(CdcError::transient("memory sink is not connected"));
        }
        let key = Self::key_string(request.key())?;
        let mut tables = self.tables.write();
        let rows = tables.entry(request.table().clone()).or_default();
        match request {
            WriteRequest::Upsert { row, overwrite, .. } => {
                if *overwrite || !rows.contains_key(&key) {
                    rows.insert(key, row.clone());
                } else {
                    debug!(table = %request.table(), key = %key, "existing row kept");
                }
            }
            WriteRequest::Delete { .. } => {
                rows.remove(&key);
            }
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn flush(&self) -> CdcResult<()> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) -> CdcResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn apply_schema(&self, schema: &SchemaVersion) -> CdcResult<()> {
        self.schemas
            .write()
            .insert(schema.table.clone(), schema.clone());
        Ok(())
    }

    fn target_schema(&self, schema: &SchemaVersion) -> SchemaVersion {
        self.type_map.convert_schema(schema)
    }
}
