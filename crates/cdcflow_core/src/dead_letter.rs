//! Dead-letter log for events that could not be applied.

use crate::error::CoreResult;
use crate::event::ChangeEvent;
use crate::log::{RecordKind, RecordLog};
use crate::types::now_millis;
use cdcflow_storage::StorageBackend;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// A failed event with the reason it was given up on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    /// The event as it was delivered.
    pub event: ChangeEvent,
    /// Rendered error of the last attempt.
    pub failure_reason: String,
    /// Number of attempts made, including the first.
    pub attempt_count: u32,
    /// When the event was dead-lettered, ms since the epoch.
    pub timestamp_ms: u64,
}

impl DeadLetterRecord {
    /// Creates a record stamped with the current time.
    pub fn new(event: ChangeEvent, failure_reason: impl Into<String>, attempt_count: u32) -> Self {
        Self {
            event,
            failure_reason: failure_reason.into(),
            attempt_count,
            timestamp_ms: now_millis(),
        }
    }
}

/// Durable, append-only dead-letter log.
///
/// A record is written once and never removed. Operators replay or discard
/// dead letters out of band.
pub struct DeadLetterLog {
    log: RecordLog,
    count: Mutex<u64>,
}

impl DeadLetterLog {
    /// Log name used in errors.
    pub const NAME: &'static str = "dead-letters";

    /// Opens the log.
    ///
    /// # Errors
    ///
    /// Returns an error if the log is corrupted.
    pub fn open(backend: Box<dyn StorageBackend>) -> CoreResult<Self> {
        let log = RecordLog::open(Self::NAME, RecordKind::DeadLetter, backend)?;
        let mut count = 0u64;
        log.for_each(|_, _: DeadLetterRecord| {
            count += 1;
            Ok(true)
        })?;
        Ok(Self {
            log,
            count: Mutex::new(count),
        })
    }

    /// Appends and syncs a dead letter.
    ///
    /// # Errors
    ///
    /// Returns an error if the record could not be made durable.
    pub fn append(&self, record: &DeadLetterRecord) -> CoreResult<()> {
        let mut count = self.count.lock();
        self.log.append(record)?;
        *count += 1;
        warn!(
            position = %record.event.position,
            table = %record.event.table,
            kind = %record.event.kind,
            attempts = record.attempt_count,
            reason = %record.failure_reason,
            "event dead-lettered"
        );
        Ok(())
    }

    /// Number of records in the log.
    #[must_use]
    pub fn len(&self) -> u64 {
        *self.count.lock()
    }

    /// Returns true if nothing has been dead-lettered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every record, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error on corruption or decode failure.
    pub fn read_all(&self) -> CoreResult<Vec<DeadLetterRecord>> {
        Ok(self
            .log
            .read_all()?
            .into_iter()
            .map(|(_, record)| record)
            .collect())
    }
}

impl std::fmt::Debug for DeadLetterLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterLog")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Row;
    use cdcflow_storage::InMemoryBackend;
    use serde_json::json;

    fn row(id: i64) -> Row {
        let mut row = Row::new();
        row.insert("id".into(), json!(id));
        row
    }

    #[test]
    fn append_and_read_back() {
        let backend = InMemoryBackend::new();
        let log = DeadLetterLog::open(Box::new(backend.clone())).unwrap();
        assert!(log.is_empty());

        let event = ChangeEvent::insert(5, "public.orders", row(1)).with_tx("tx-9");
        log.append(&DeadLetterRecord::new(event.clone(), "constraint violation", 3))
            .unwrap();

        let records = log.read_all().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event, event);
        assert_eq!(records[0].attempt_count, 3);

        let reopened = DeadLetterLog::open(Box::new(backend)).unwrap();
        assert_eq!(reopened.len(), 1);
    }

    #[test]
    fn failed_append_is_not_counted() {
        let backend = InMemoryBackend::new();
        let log = DeadLetterLog::open(Box::new(backend.clone())).unwrap();
        backend.fail_syncs(true);
        let event = ChangeEvent::delete(1, "t", row(1));
        assert!(log.append(&DeadLetterRecord::new(event, "boom", 1)).is_err());
        assert_eq!(log.len(), 0);
    }
}
