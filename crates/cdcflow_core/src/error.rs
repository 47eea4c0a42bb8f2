//! Error types for cdcflow core.

use crate::types::TableId;
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised by the data model, the durable logs and the queue.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] cdcflow_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A record payload could not be encoded or decoded.
    #[error("codec error: {message}")]
    Codec {
        /// Description of the failure.
        message: String,
    },

    /// A durable log is corrupted.
    #[error("log corruption in {log}: {message}")]
    LogCorruption {
        /// Which log.
        log: &'static str,
        /// Description of the corruption.
        message: String,
    },

    /// Record checksum mismatch.
    #[error("checksum mismatch in {log} at offset {offset}: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Which log.
        log: &'static str,
        /// Offset of the damaged record.
        offset: u64,
        /// Stored checksum.
        expected: u32,
        /// Computed checksum.
        actual: u32,
    },

    /// A schema version arrived out of order.
    #[error("schema sequence violation for {table}: expected version {expected}, got {found}")]
    SchemaSequence {
        /// Table whose history was violated.
        table: TableId,
        /// Next version the history accepts.
        expected: u32,
        /// Version that was offered.
        found: u32,
    },

    /// The offset store could not persist a commit.
    #[error("offset persistence failed: {message}")]
    OffsetPersist {
        /// Description of the failure.
        message: String,
    },

    /// The queue no longer accepts entries.
    #[error("queue is closed")]
    QueueClosed,

    /// A configuration value is invalid.
    #[error("invalid configuration for `{key}`: {message}")]
    InvalidConfig {
        /// Configuration key.
        key: String,
        /// What is wrong with it.
        message: String,
    },

    /// Another process holds the state directory.
    #[error("state directory locked: another engine has exclusive access")]
    StateDirLocked,

    /// The event violates the change-event invariants.
    #[error("invalid change event at {position}: {message}")]
    InvalidEvent {
        /// Position of the event.
        position: u64,
        /// Which invariant failed.
        message: String,
    },
}

impl CoreError {
    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Creates a log corruption error.
    pub fn log_corruption(log: &'static str, message: impl Into<String>) -> Self {
        Self::LogCorruption {
            log,
            message: message.into(),
        }
    }

    /// Creates an offset persistence error.
    pub fn offset_persist(message: impl Into<String>) -> Self {
        Self::OffsetPersist {
            message: message.into(),
        }
    }

    /// Creates an invalid configuration error.
    pub fn invalid_config(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Returns true if the error means on-disk state cannot be trusted.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::LogCorruption { .. } | Self::ChecksumMismatch { .. }
        )
    }
}
