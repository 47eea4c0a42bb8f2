//! Checksummed append-only record logs.
//!
//! The offset store, the schema history and the dead-letter log all share
//! one on-disk framing:
//!
//! ```text
//! | magic (4) | version (2) | kind (1) | length (4) | payload (N) | crc32 (4) |
//! ```
//!
//! Payloads are CBOR-encoded records. Every append is followed by a sync, so
//! an acknowledged append survives a crash.
//!
//! ## Recovery Policy
//!
//! Opening a log scans it front to back.
//!
//! - **Truncated header or payload** at the tail is a crash mid-append. The
//!   torn bytes are cut off and the log opens with the earlier records.
//! - **CRC mismatch, bad magic, unknown kind, future version** are real
//!   corruption. Opening fails; no heuristic repair is attempted, because an
//!   offset store that silently loses records could skip events.

mod iterator;
mod record;
mod writer;

pub use iterator::{Frame, FrameIterator};
pub use record::{compute_crc32, decode_payload, encode_payload, RecordKind, LOG_MAGIC, LOG_VERSION};
pub use writer::RecordLog;

/// magic (4) + version (2) + kind (1) + length (4)
pub(crate) const HEADER_SIZE: usize = 11;

/// Trailing CRC-32.
pub(crate) const CRC_SIZE: usize = 4;
