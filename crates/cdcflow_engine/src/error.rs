//! Error types for the engine.

use cdcflow_core::{CoreError, PartitionId, TableId};
use thiserror::Error;

/// Result type for engine operations.
pub type CdcResult<T> = Result<T, CdcError>;

/// Errors raised while capturing, processing and committing events.
#[derive(Error, Debug)]
pub enum CdcError {
    /// Error from the data model, durable logs or queue.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// A raw change notification could not be decoded.
    #[error("malformed event: {message}")]
    MalformedEvent {
        /// What is wrong with the payload.
        message: String,
    },

    /// The bridge gave up waiting for queue space.
    #[error("backpressure timeout on {partition} after {waited_ms} ms")]
    BackpressureTimeout {
        /// Partition whose queue stayed full.
        partition: PartitionId,
        /// How long the bridge waited.
        waited_ms: u64,
    },

    /// Sink write failed but may succeed later.
    #[error("transient sink error: {message}")]
    TransientSink {
        /// Error message.
        message: String,
    },

    /// Sink rejected the write for good.
    #[error("permanent sink error: {message}")]
    PermanentSink {
        /// Error message.
        message: String,
    },

    /// The sink kept failing longer than the unavailability ceiling.
    #[error("sink unavailable on {partition} for {unavailable_ms} ms")]
    SinkUnavailable {
        /// Stalled partition.
        partition: PartitionId,
        /// How long the sink has been failing.
        unavailable_ms: u64,
    },

    /// No schema version is logged for the table.
    #[error("no schema known for table {table}")]
    UnknownSchema {
        /// Table of the event.
        table: TableId,
    },

    /// A row image has a column the current schema does not define.
    #[error("column `{column}` not in schema version {version} of {table}")]
    SchemaMismatch {
        /// Table of the event.
        table: TableId,
        /// Current schema version.
        version: u32,
        /// Unknown column.
        column: String,
    },

    /// A primary-key column is absent or null.
    #[error("missing primary key for table {table}")]
    MissingPrimaryKey {
        /// Table of the event.
        table: TableId,
    },

    /// The engine does not accept input in its current state.
    #[error("engine is not streaming (state: {state})")]
    EngineNotStreaming {
        /// Current state.
        state: String,
    },

    /// Invalid state transition.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },
}

impl CdcError {
    /// Creates a malformed-event error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedEvent {
            message: message.into(),
        }
    }

    /// Creates a transient sink error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::TransientSink {
            message: message.into(),
        }
    }

    /// Creates a permanent sink error.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::PermanentSink {
            message: message.into(),
        }
    }

    /// Returns true if the failed operation should be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CdcError::TransientSink { .. })
    }

    /// Returns true if the failed event belongs in the dead-letter log.
    pub fn is_dead_letter(&self) -> bool {
        matches!(
            self,
            CdcError::PermanentSink { .. }
                | CdcError::UnknownSchema { .. }
                | CdcError::SchemaMismatch { .. }
                | CdcError::MissingPrimaryKey { .. }
                | CdcError::MalformedEvent { .. }
                | CdcError::Core(CoreError::InvalidEvent { .. })
        )
    }

    /// Returns true if the error is a schema sequence violation.
    pub fn is_schema_sequence(&self) -> bool {
        matches!(self, CdcError::Core(CoreError::SchemaSequence { .. }))
    }
}
