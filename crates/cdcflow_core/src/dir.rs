//! State directory management.
//!
//! The engine keeps its durable state in one directory:
//!
//! ```text
//! <state_dir>/
//! ├─ LOCK                 # Advisory lock for single-engine access
//! ├─ offsets.log          # Offset store
//! ├─ schema-history.log   # Schema history
//! └─ dead-letters.log     # Dead-lettered events
//! ```
//!
//! Two engines sharing a state directory would interleave commits, so the
//! LOCK file is held exclusively for as long as the [`StateDir`] lives.

use crate::dead_letter::DeadLetterLog;
use crate::error::{CoreError, CoreResult};
use crate::offset::OffsetStore;
use crate::schema::SchemaHistoryLog;
use cdcflow_storage::{FileBackend, InMemoryBackend};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing::info;

const LOCK_FILE: &str = "LOCK";
const OFFSETS_FILE: &str = "offsets.log";
const SCHEMA_HISTORY_FILE: &str = "schema-history.log";
const DEAD_LETTERS_FILE: &str = "dead-letters.log";

/// A locked state directory.
#[derive(Debug)]
pub struct StateDir {
    path: PathBuf,
    _lock_file: File,
}

impl StateDir {
    /// Opens (and optionally creates) a state directory and takes its lock.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::StateDirLocked`] if another process holds the
    /// lock, or an I/O error if the directory is missing and
    /// `create_if_missing` is false.
    pub fn open(path: &Path, create_if_missing: bool) -> CoreResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(CoreError::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("state directory does not exist: {}", path.display()),
                )));
            }
        }
        if !path.is_dir() {
            return Err(CoreError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("not a directory: {}", path.display()),
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::StateDirLocked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Root of the state directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the offset store.
    #[must_use]
    pub fn offsets_path(&self) -> PathBuf {
        self.path.join(OFFSETS_FILE)
    }

    /// Path of the schema history.
    #[must_use]
    pub fn schema_history_path(&self) -> PathBuf {
        self.path.join(SCHEMA_HISTORY_FILE)
    }

    /// Path of the dead-letter log.
    #[must_use]
    pub fn dead_letters_path(&self) -> PathBuf {
        self.path.join(DEAD_LETTERS_FILE)
    }

    /// Opens the three durable logs in this directory.
    ///
    /// # Errors
    ///
    /// Returns an error if a log cannot be opened or is corrupted.
    pub fn open_stores(&self) -> CoreResult<DurableStores> {
        let stores = DurableStores {
            offsets: OffsetStore::open(Box::new(FileBackend::open(&self.offsets_path())?))?,
            schema_history: SchemaHistoryLog::open(Box::new(FileBackend::open(
                &self.schema_history_path(),
            )?))?,
            dead_letters: DeadLetterLog::open(Box::new(FileBackend::open(
                &self.dead_letters_path(),
            )?))?,
        };
        info!(path = %self.path.display(), "state directory opened");
        Ok(stores)
    }
}

/// The offset store, schema history and dead-letter log of one engine.
#[derive(Debug)]
pub struct DurableStores {
    /// Committed offsets.
    pub offsets: OffsetStore,
    /// Schema versions.
    pub schema_history: SchemaHistoryLog,
    /// Dead letters.
    pub dead_letters: DeadLetterLog,
}

impl DurableStores {
    /// Fresh, empty in-memory stores.
    ///
    /// # Errors
    ///
    /// Never fails for empty backends; the signature matches
    /// [`StateDir::open_stores`].
    pub fn in_memory() -> CoreResult<Self> {
        Self::from_backends(
            InMemoryBackend::new(),
            InMemoryBackend::new(),
            InMemoryBackend::new(),
        )
    }

    /// Stores over the given in-memory backends. Clones of a backend share
    /// its bytes, so a test can reopen stores after a simulated crash.
    ///
    /// # Errors
    ///
    /// Returns an error if a backend holds a corrupted log.
    pub fn from_backends(
        offsets: InMemoryBackend,
        schema_history: InMemoryBackend,
        dead_letters: InMemoryBackend,
    ) -> CoreResult<Self> {
        Ok(Self {
            offsets: OffsetStore::open(Box::new(offsets))?,
            schema_history: SchemaHistoryLog::open(Box::new(schema_history))?,
            dead_letters: DeadLetterLog::open(Box::new(dead_letters))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SequencePosition, SessionId, SourceOffset};
    use tempfile::tempdir;

    #[test]
    fn creates_layout() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("state");
        let dir = StateDir::open(&path, true).unwrap();
        dir.open_stores().unwrap();

        assert!(path.join("LOCK").exists());
        assert!(dir.offsets_path().ends_with("offsets.log"));
        assert!(dir.schema_history_path().exists());
        assert!(dir.dead_letters_path().exists());
    }

    #[test]
    fn missing_directory_without_create() {
        let temp = tempdir().unwrap();
        let result = StateDir::open(&temp.path().join("absent"), false);
        assert!(matches!(result, Err(CoreError::Io(_))));
    }

    #[test]
    fn second_open_is_locked_out() {
        let temp = tempdir().unwrap();
        let _held = StateDir::open(temp.path(), true).unwrap();
        assert!(matches!(
            StateDir::open(temp.path(), true),
            Err(CoreError::StateDirLocked)
        ));
    }

    #[test]
    fn lock_released_on_drop() {
        let temp = tempdir().unwrap();
        drop(StateDir::open(temp.path(), true).unwrap());
        assert!(StateDir::open(temp.path(), true).is_ok());
    }

    #[test]
    fn stores_persist_across_reopen() {
        let temp = tempdir().unwrap();
        let offset = SourceOffset::new(SequencePosition::new(42), "0/2A");
        {
            let dir = StateDir::open(temp.path(), true).unwrap();
            let stores = dir.open_stores().unwrap();
            stores
                .offsets
                .commit(SessionId::generate(), offset.clone())
                .unwrap();
        }

        let dir = StateDir::open(temp.path(), false).unwrap();
        let stores = dir.open_stores().unwrap();
        assert_eq!(stores.offsets.load(), Some(offset));
    }
}
