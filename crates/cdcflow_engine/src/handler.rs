//! Event handlers.
//!
//! Data changes become keyed sink writes resolved against the table's
//! current schema. Schema changes are propagated to the sink and then
//! logged durably, in that order, so a crash in between only repeats an
//! idempotent `apply_schema`.

use crate::error::{CdcError, CdcResult};
use crate::sink::{SinkConnector, WriteRequest};
use crate::stats::EngineStats;
use cdcflow_core::{
    key_row, ChangeEvent, ConflictPolicy, EngineConfig, OperationKind, SchemaAdvance, SchemaCatalog,
    SchemaHistoryLog, SchemaVersion,
};
use std::sync::Arc;
use tracing::{debug, info};

/// What a handler did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// A write was applied to the sink.
    Written,
    /// A delete was acknowledged without writing (`apply.deletes=false`).
    DeleteSkipped,
    /// A new schema version was applied and logged.
    SchemaApplied,
    /// The schema version was already logged.
    SchemaAlreadyLogged,
}

/// Dispatches events to the data-change or schema-change handler.
pub struct HandlerSet {
    history: Arc<SchemaHistoryLog>,
    catalog: Arc<SchemaCatalog>,
    stats: Arc<EngineStats>,
    apply_deletes: bool,
    conflict_policy: ConflictPolicy,
}

impl HandlerSet {
    /// Creates handlers over the schema history.
    pub fn new(history: Arc<SchemaHistoryLog>, stats: Arc<EngineStats>, config: &EngineConfig) -> Self {
        let catalog = history.catalog();
        Self {
            history,
            catalog,
            stats,
            apply_deletes: config.apply_deletes,
            conflict_policy: config.conflict_policy,
        }
    }

    /// Handles one event against `sink`.
    ///
    /// # Errors
    ///
    /// Returns the sink's error, a schema resolution error for data changes,
    /// or [`cdcflow_core::CoreError::SchemaSequence`] for a schema version
    /// that skips ahead.
    pub fn handle(&self, event: &ChangeEvent, sink: &dyn SinkConnector) -> CdcResult<HandlerOutcome> {
        match event.kind {
            OperationKind::SnapshotRead
            | OperationKind::Insert
            | OperationKind::Update
            | OperationKind::Delete => self.handle_data(event, sink),
            OperationKind::SchemaChange => self.handle_schema(event, sink),
        }
    }

    /// Maps a data change to its sink writes, in the order they must be
    /// applied.
    ///
    /// An update that changes the primary key deletes the row under the old
    /// key before upserting the new one. A delete that is not propagated maps
    /// to no writes.
    ///
    /// # Errors
    ///
    /// Returns [`CdcError::UnknownSchema`], [`CdcError::SchemaMismatch`] or
    /// [`CdcError::MissingPrimaryKey`].
    pub fn write_requests(&self, event: &ChangeEvent) -> CdcResult<Vec<WriteRequest>> {
        let schema = self
            .catalog
            .current(&event.table)
            .ok_or_else(|| CdcError::UnknownSchema {
                table: event.table.clone(),
            })?;

        for image in [event.before.as_ref(), event.after.as_ref()].into_iter().flatten() {
            if let Some(column) = image.keys().find(|c| !schema.has_column(c)) {
                return Err(CdcError::SchemaMismatch {
                    table: event.table.clone(),
                    version: schema.version,
                    column: column.clone(),
                });
            }
        }

        let key = event
            .primary_key(&schema.primary_keys)
            .ok_or_else(|| CdcError::MissingPrimaryKey {
                table: event.table.clone(),
            })?;

        match (event.kind, event.after.as_ref()) {
            (OperationKind::Delete, _) => {
                if !self.apply_deletes {
                    return Ok(Vec::new());
                }
                Ok(vec![WriteRequest::Delete {
                    table: event.table.clone(),
                    key,
                }])
            }
            (kind, Some(after)) => {
                let mut requests = Vec::with_capacity(2);
                if kind == OperationKind::Update {
                    let old_key = event
                        .before
                        .as_ref()
                        .and_then(|before| key_row(before, &schema.primary_keys));
                    if let Some(old_key) = old_key.filter(|old| *old != key) {
                        debug!(position = %event.position, table = %event.table, "primary key changed");
                        requests.push(WriteRequest::Delete {
                            table: event.table.clone(),
                            key: old_key,
                        });
                    }
                }
                requests.push(WriteRequest::Upsert {
                    table: event.table.clone(),
                    key,
                    row: after.clone(),
                    overwrite: !(kind == OperationKind::Update
                        && self.conflict_policy == ConflictPolicy::TargetWins),
                });
                Ok(requests)
            }
            (kind, None) => Err(CdcError::malformed(format!("{kind} event without after image"))),
        }
    }

    fn handle_data(&self, event: &ChangeEvent, sink: &dyn SinkConnector) -> CdcResult<HandlerOutcome> {
        let requests = self.write_requests(event)?;
        if requests.is_empty() {
            debug!(position = %event.position, table = %event.table, "delete not propagated");
            self.stats.record_delete_skipped();
            return Ok(HandlerOutcome::DeleteSkipped);
        }
        for request in &requests {
            sink.write(request)?;
        }
        self.stats.record_applied(event.kind);
        Ok(HandlerOutcome::Written)
    }

    fn handle_schema(&self, event: &ChangeEvent, sink: &dyn SinkConnector) -> CdcResult<HandlerOutcome> {
        let schema: &SchemaVersion = event.schema.as_ref().ok_or_else(|| {
            CdcError::malformed(format!("schema change at {} without schema", event.position))
        })?;

        if self.catalog.check_next(schema)?.is_some() {
            debug!(
                table = %schema.table,
                version = schema.version,
                "schema change redelivered"
            );
            self.stats.record_schema_duplicate();
            return Ok(HandlerOutcome::SchemaAlreadyLogged);
        }

        sink.apply_schema(&sink.target_schema(schema))?;
        match self.history.append(schema)? {
            SchemaAdvance::Appended => {
                info!(
                    table = %schema.table,
                    version = schema.version,
                    columns = schema.columns.len(),
                    "schema change applied"
                );
                self.stats.record_applied(OperationKind::SchemaChange);
                Ok(HandlerOutcome::SchemaApplied)
            }
            SchemaAdvance::AlreadyLogged => {
                self.stats.record_schema_duplicate();
                Ok(HandlerOutcome::SchemaAlreadyLogged)
            }
        }
    }
}

impl std::fmt::Debug for HandlerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerSet")
            .field("apply_deletes", &self.apply_deletes)
            .field("conflict_policy", &self.conflict_policy)
            .finish_non_exhaustive()
    }
}
