//! Append side of a record log.

use super::iterator::FrameIterator;
use super::record::{decode_payload, encode_frame, encode_payload, RecordKind};
use crate::error::{CoreError, CoreResult};
use cdcflow_storage::StorageBackend;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

/// An append-only, sync-on-write log of one record kind.
///
/// Appends are serialized by an internal mutex; a record is durable once
/// [`RecordLog::append`] returns.
pub struct RecordLog {
    name: &'static str,
    kind: RecordKind,
    backend: Mutex<Box<dyn StorageBackend>>,
}

impl RecordLog {
    /// Opens a log over `backend`, validating every frame and cutting off a
    /// torn tail left by a crash.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if any complete frame fails validation or
    /// holds a record of a different kind.
    pub fn open(
        name: &'static str,
        kind: RecordKind,
        mut backend: Box<dyn StorageBackend>,
    ) -> CoreResult<Self> {
        let (valid_end, torn) = {
            let mut iter = FrameIterator::new(backend.as_ref(), name)?;
            for frame in iter.by_ref() {
                let frame = frame?;
                if frame.kind != kind {
                    return Err(CoreError::log_corruption(
                        name,
                        format!(
                            "{} record at offset {} in a {} log",
                            frame.kind.name(),
                            frame.offset,
                            kind.name()
                        ),
                    ));
                }
            }
            (iter.valid_end(), iter.has_torn_tail())
        };

        if torn {
            let size = backend.size()?;
            warn!(
                log = name,
                valid_end,
                discarded = size - valid_end,
                "truncating torn record at end of log"
            );
            backend.truncate(valid_end)?;
        }

        Ok(Self {
            name,
            kind,
            backend: Mutex::new(backend),
        })
    }

    /// Returns the log name used in errors and logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Appends `record` and syncs it to durable storage.
    ///
    /// Returns the offset of the new frame.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding, writing or syncing fails. On a sync
    /// failure the record must be treated as not persisted.
    pub fn append<T: Serialize>(&self, record: &T) -> CoreResult<u64> {
        let payload = encode_payload(record)?;
        let frame = encode_frame(self.kind, &payload)?;

        let mut backend = self.backend.lock();
        let offset = backend.append(&frame)?;
        backend.sync()?;
        Ok(offset)
    }

    /// Decodes every record in order, with its frame offset.
    ///
    /// # Errors
    ///
    /// Returns an error on corruption or if a payload is not a valid `T`.
    pub fn read_all<T: DeserializeOwned>(&self) -> CoreResult<Vec<(u64, T)>> {
        let mut records = Vec::new();
        self.for_each(|offset, record| {
            records.push((offset, record));
            Ok(true)
        })?;
        Ok(records)
    }

    /// Streams records through `callback`; return `Ok(false)` to stop early.
    ///
    /// # Errors
    ///
    /// Returns an error on corruption, decode failure, or a callback error.
    pub fn for_each<T, F>(&self, mut callback: F) -> CoreResult<()>
    where
        T: DeserializeOwned,
        F: FnMut(u64, T) -> CoreResult<bool>,
    {
        let backend = self.backend.lock();
        for frame in FrameIterator::new(backend.as_ref(), self.name)? {
            let frame = frame?;
            let record = decode_payload(&frame.payload)?;
            if !callback(frame.offset, record)? {
                break;
            }
        }
        Ok(())
    }

    /// Decodes only the last record, if any.
    ///
    /// # Errors
    ///
    /// Returns an error on corruption or decode failure.
    pub fn last<T: DeserializeOwned>(&self) -> CoreResult<Option<T>> {
        let backend = self.backend.lock();
        let mut last = None;
        for frame in FrameIterator::new(backend.as_ref(), self.name)? {
            last = Some(frame?);
        }
        last.map(|frame| decode_payload(&frame.payload)).transpose()
    }

    /// Current size of the log in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend size cannot be read.
    pub fn size(&self) -> CoreResult<u64> {
        Ok(self.backend.lock().size()?)
    }
}

impl std::fmt::Debug for RecordLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordLog")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdcflow_storage::InMemoryBackend;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Checkpoint {
        position: u64,
    }

    fn open(backend: &InMemoryBackend) -> RecordLog {
        RecordLog::open("offsets", RecordKind::Offset, Box::new(backend.clone())).unwrap()
    }

    #[test]
    fn append_then_read_back() {
        let backend = InMemoryBackend::new();
        let log = open(&backend);
        log.append(&Checkpoint { position: 1 }).unwrap();
        log.append(&Checkpoint { position: 2 }).unwrap();

        let records: Vec<(u64, Checkpoint)> = log.read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].0, 0);
        assert_eq!(records[1].1, Checkpoint { position: 2 });
        assert_eq!(log.last::<Checkpoint>().unwrap(), Some(Checkpoint { position: 2 }));
    }

    #[test]
    fn empty_log_has_no_last() {
        let log = open(&InMemoryBackend::new());
        assert_eq!(log.last::<Checkpoint>().unwrap(), None);
        assert_eq!(log.size().unwrap(), 0);
    }

    #[test]
    fn reopen_sees_synced_records() {
        let backend = InMemoryBackend::new();
        open(&backend).append(&Checkpoint { position: 7 }).unwrap();
        backend.drop_unsynced();

        let reopened = open(&backend);
        assert_eq!(
            reopened.last::<Checkpoint>().unwrap(),
            Some(Checkpoint { position: 7 })
        );
    }

    #[test]
    fn torn_tail_is_truncated_on_open() {
        let backend = InMemoryBackend::new();
        let log = open(&backend);
        log.append(&Checkpoint { position: 1 }).unwrap();
        let good_len = log.size().unwrap();
        {
            let mut raw = backend.clone();
            raw.append(b"CDCL\x01\x00\x01\xFF\x00").unwrap();
        }

        let reopened = open(&backend);
        assert_eq!(reopened.size().unwrap(), good_len);
        reopened.append(&Checkpoint { position: 2 }).unwrap();
        assert_eq!(reopened.read_all::<Checkpoint>().unwrap().len(), 2);
    }

    #[test]
    fn wrong_kind_is_corruption() {
        let backend = InMemoryBackend::new();
        open(&backend).append(&Checkpoint { position: 1 }).unwrap();

        let result = RecordLog::open("schema-history", RecordKind::Schema, Box::new(backend));
        assert!(matches!(result, Err(CoreError::LogCorruption { .. })));
    }

    #[test]
    fn corrupted_frame_fails_open() {
        let backend = InMemoryBackend::new();
        open(&backend).append(&Checkpoint { position: 1 }).unwrap();
        backend.corrupt_byte(12);

        let result = RecordLog::open("offsets", RecordKind::Offset, Box::new(backend));
        assert!(matches!(result, Err(CoreError::ChecksumMismatch { .. })));
    }

    #[test]
    fn sync_failure_surfaces() {
        let backend = InMemoryBackend::new();
        let log = open(&backend);
        backend.fail_syncs(true);
        assert!(matches!(
            log.append(&Checkpoint { position: 1 }),
            Err(CoreError::Storage(_))
        ));
    }

    #[test]
    fn for_each_stops_early() {
        let log = open(&InMemoryBackend::new());
        for position in 0..5 {
            log.append(&Checkpoint { position }).unwrap();
        }
        let mut seen = 0;
        log.for_each(|_, _: Checkpoint| {
            seen += 1;
            Ok(seen < 2)
        })
        .unwrap();
        assert_eq!(seen, 2);
    }
}
