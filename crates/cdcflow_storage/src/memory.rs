//! In-memory storage for tests.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// An in-memory backend.
///
/// Cloning an `InMemoryBackend` yields a second handle onto the **same**
/// buffer. Tests use this to simulate a crash: drop the engine that owned one
/// handle, then reopen its logs from the other handle. Bytes appended but
/// never synced are kept, like a page cache that happened to reach disk;
/// use [`InMemoryBackend::drop_unsynced`] to model the opposite outcome.
///
/// ```rust
/// use cdcflow_storage::{InMemoryBackend, StorageBackend};
///
/// let mut first = InMemoryBackend::new();
/// let second = first.clone();
/// first.append(b"abc").unwrap();
/// assert_eq!(second.size().unwrap(), 3);
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemoryBackend {
    shared: Arc<Shared>,
}

#[derive(Debug, Default)]
struct Shared {
    data: RwLock<Vec<u8>>,
    synced_len: RwLock<usize>,
    fail_sync: AtomicBool,
}

impl InMemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend preloaded with `data`, all of it considered synced.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        let len = data.len();
        Self {
            shared: Arc::new(Shared {
                data: RwLock::new(data),
                synced_len: RwLock::new(len),
                fail_sync: AtomicBool::new(false),
            }),
        }
    }

    /// Returns a copy of the current bytes.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.shared.data.read().clone()
    }

    /// Makes every subsequent `sync` fail (or succeed again with `false`).
    pub fn fail_syncs(&self, fail: bool) {
        self.shared.fail_sync.store(fail, Ordering::SeqCst);
    }

    /// Discards bytes appended after the last successful `sync`.
    pub fn drop_unsynced(&self) {
        let synced = *self.shared.synced_len.read();
        self.shared.data.write().truncate(synced);
    }

    /// Overwrites one byte, for corruption tests.
    ///
    /// # Panics
    ///
    /// Panics if `offset` is out of range.
    pub fn corrupt_byte(&self, offset: usize) {
        let mut data = self.shared.data.write();
        data[offset] ^= 0xFF;
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let data = self.shared.data.read();
        let size = data.len() as u64;
        let end = offset.saturating_add(len as u64);
        if offset > size || end > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }
        Ok(data[offset as usize..end as usize].to_vec())
    }

    fn append(&mut self, new_data: &[u8]) -> StorageResult<u64> {
        let mut data = self.shared.data.write();
        let offset = data.len() as u64;
        data.extend_from_slice(new_data);
        Ok(offset)
    }

    fn sync(&mut self) -> StorageResult<()> {
        if self.shared.fail_sync.load(Ordering::SeqCst) {
            return Err(StorageError::SyncFailed("injected sync failure".into()));
        }
        let len = self.shared.data.read().len();
        *self.shared.synced_len.write() = len;
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.shared.data.read().len() as u64)
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let mut data = self.shared.data.write();
        let size = data.len() as u64;
        if new_size > size {
            return Err(StorageError::TruncatePastEnd {
                requested: new_size,
                size,
            });
        }
        data.truncate(new_size as usize);
        let mut synced = self.shared.synced_len.write();
        *synced = (*synced).min(new_size as usize);
        Ok(())
    }
}
