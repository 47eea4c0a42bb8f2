//! Durable offset store.
//!
//! Each commit appends an [`OffsetRecord`]; the last record in the log is the
//! committed offset. A restart resumes the capture source from it, so every
//! event at or below the committed position must already be handled.

use crate::error::{CoreError, CoreResult};
use crate::log::{RecordKind, RecordLog};
use crate::types::{now_millis, SessionId, SourceOffset};
use cdcflow_storage::StorageBackend;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// One persisted offset commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetRecord {
    /// Session that made the commit.
    pub session_id: SessionId,
    /// Committed offset.
    pub offset: SourceOffset,
    /// Commit time, ms since the epoch.
    pub commit_ts_ms: u64,
}

/// Append-only store of committed offsets.
pub struct OffsetStore {
    log: RecordLog,
    last: Mutex<Option<OffsetRecord>>,
}

impl OffsetStore {
    /// Log name used in errors.
    pub const NAME: &'static str = "offsets";

    /// Opens the store and loads the last committed offset.
    ///
    /// # Errors
    ///
    /// Returns an error if the log is corrupted.
    pub fn open(backend: Box<dyn StorageBackend>) -> CoreResult<Self> {
        let log = RecordLog::open(Self::NAME, RecordKind::Offset, backend)?;
        let last: Option<OffsetRecord> = log.last()?;
        match &last {
            Some(record) => info!(
                offset = %record.offset,
                session = %record.session_id,
                "loaded committed offset"
            ),
            None => info!("no committed offset, starting from the beginning"),
        }
        Ok(Self {
            log,
            last: Mutex::new(last),
        })
    }

    /// Last committed offset, if any.
    #[must_use]
    pub fn load(&self) -> Option<SourceOffset> {
        self.last.lock().as_ref().map(|r| r.offset.clone())
    }

    /// Last committed record, if any.
    #[must_use]
    pub fn last(&self) -> Option<OffsetRecord> {
        self.last.lock().clone()
    }

    /// Persists `offset` as committed.
    ///
    /// Returns `false` without writing if `offset` does not advance past the
    /// last commit.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::OffsetPersist`] if the record could not be made
    /// durable. The previous commit stays in effect.
    pub fn commit(&self, session_id: SessionId, offset: SourceOffset) -> CoreResult<bool> {
        let mut last = self.last.lock();
        if let Some(previous) = last.as_ref() {
            if offset.position <= previous.offset.position {
                debug!(
                    offset = %offset,
                    committed = %previous.offset,
                    "offset does not advance, skipping commit"
                );
                return Ok(false);
            }
        }

        let record = OffsetRecord {
            session_id,
            offset,
            commit_ts_ms: now_millis(),
        };
        self.log
            .append(&record)
            .map_err(|e| CoreError::offset_persist(e.to_string()))?;
        debug!(offset = %record.offset, "offset committed");
        *last = Some(record);
        Ok(true)
    }

    /// Every commit in the log, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error on corruption or decode failure.
    pub fn history(&self) -> CoreResult<Vec<OffsetRecord>> {
        Ok(self
            .log
            .read_all()?
            .into_iter()
            .map(|(_, record)| record)
            .collect())
    }
}

impl std::fmt::Debug for OffsetStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OffsetStore")
            .field("last", &self.load())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SequencePosition;
    use cdcflow_storage::InMemoryBackend;

    fn offset(pos: u64) -> SourceOffset {
        SourceOffset::new(SequencePosition::new(pos), format!("0/{pos:X}"))
    }

    #[test]
    fn fresh_store_is_empty() {
        let store = OffsetStore::open(Box::new(InMemoryBackend::new())).unwrap();
        assert_eq!(store.load(), None);
    }

    #[test]
    fn commit_and_reload() {
        let backend = InMemoryBackend::new();
        let session = SessionId::generate();
        {
            let store = OffsetStore::open(Box::new(backend.clone())).unwrap();
            assert!(store.commit(session, offset(10)).unwrap());
            assert!(store.commit(session, offset(25)).unwrap());
        }
        backend.drop_unsynced();

        let store = OffsetStore::open(Box::new(backend)).unwrap();
        assert_eq!(store.load(), Some(offset(25)));
        assert_eq!(store.last().unwrap().session_id, session);
        assert_eq!(store.history().unwrap().len(), 2);
    }

    #[test]
    fn non_advancing_commit_is_skipped() {
        let store = OffsetStore::open(Box::new(InMemoryBackend::new())).unwrap();
        let session = SessionId::generate();
        store.commit(session, offset(10)).unwrap();
        assert!(!store.commit(session, offset(10)).unwrap());
        assert!(!store.commit(session, offset(4)).unwrap());
        assert_eq!(store.load(), Some(offset(10)));
        assert_eq!(store.history().unwrap().len(), 1);
    }

    #[test]
    fn persist_failure_keeps_previous_commit() {
        let backend = InMemoryBackend::new();
        let store = OffsetStore::open(Box::new(backend.clone())).unwrap();
        let session = SessionId::generate();
        store.commit(session, offset(1)).unwrap();

        backend.fail_syncs(true);
        let err = store.commit(session, offset(2)).unwrap_err();
        assert!(matches!(err, CoreError::OffsetPersist { .. }));
        assert_eq!(store.load(), Some(offset(1)));
    }
}
