//! # cdcflow core
//!
//! Data model and durable state for the cdcflow change-data-capture engine.
//!
//! This crate provides:
//! - Change events, table identifiers and source offsets
//! - A checksummed append-only record log shared by all durable state
//! - The offset store, schema history and dead-letter log built on it
//! - The bounded blocking queue between capture and processing
//! - Engine configuration from flat key-value properties
//! - State directory layout and locking
//!
//! ## Key Invariants
//!
//! - A committed offset never moves backward
//! - Schema versions of a table are contiguous, starting at 1
//! - A durable append is synced before it is acknowledged
//! - The queue never holds more than its capacity

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod dead_letter;
mod dir;
mod error;
mod event;
pub mod log;
mod offset;
mod queue;
mod schema;
mod types;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use config::{ConflictPolicy, EngineConfig, RetryConfig, TableFilter};
pub use dead_letter::{DeadLetterLog, DeadLetterRecord};
pub use dir::{DurableStores, StateDir};
pub use error::{CoreError, CoreResult};
pub use event::{key_row, ChangeEvent, OperationKind, Row};
pub use offset::{OffsetRecord, OffsetStore};
pub use queue::{BoundedQueue, EnqueueError, QueueEntry};
pub use schema::{
    ColumnDefinition, SchemaAdvance, SchemaCatalog, SchemaHistoryLog, SchemaHistoryRecord,
    SchemaVersion,
};
pub use types::{now_millis, PartitionId, SequencePosition, SessionId, SourceOffset, TableId};
