//! # cdcflow storage
//!
//! Byte-level storage for the durable logs of the cdcflow engine (offsets,
//! schema history, dead letters).
//!
//! Backends are **opaque append-only byte stores**. They know nothing about
//! record framing or checksums; `cdcflow_core::log` owns the file format.
//!
//! ## Available Backends
//!
//! - [`FileBackend`] - one OS file per log, `sync` maps to `fdatasync`
//! - [`InMemoryBackend`] - for tests; handles can share one buffer so a test
//!   can "crash" an engine and reopen the same bytes
//!
//! ## Example
//!
//! ```rust
//! use cdcflow_storage::{InMemoryBackend, StorageBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"offset-record").unwrap();
//! backend.sync().unwrap();
//! assert_eq!(backend.read_at(offset, 6).unwrap(), b"offset");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
