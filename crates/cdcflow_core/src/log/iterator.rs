//! Frame-by-frame scanning of a record log.

use super::record::{compute_crc32, RecordKind, LOG_MAGIC, LOG_VERSION};
use super::{CRC_SIZE, HEADER_SIZE};
use crate::error::{CoreError, CoreResult};
use cdcflow_storage::StorageBackend;

/// One raw record read from a log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Offset of the frame's first byte.
    pub offset: u64,
    /// Record kind from the header.
    pub kind: RecordKind,
    /// CBOR payload.
    pub payload: Vec<u8>,
    /// Offset just past the frame (start of the next one).
    pub end: u64,
}

/// Reads frames one at a time, holding only the current frame in memory.
///
/// Yields `Err` on corruption and stops. A torn tail ends iteration
/// cleanly; [`FrameIterator::valid_end`] then reports where the last good
/// frame ended so the caller can cut the rest off.
pub struct FrameIterator<'a> {
    backend: &'a dyn StorageBackend,
    log: &'static str,
    offset: u64,
    size: u64,
    finished: bool,
}

impl<'a> FrameIterator<'a> {
    /// Starts scanning `backend` at offset 0.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend size cannot be read.
    pub fn new(backend: &'a dyn StorageBackend, log: &'static str) -> CoreResult<Self> {
        let size = backend.size()?;
        Ok(Self {
            backend,
            log,
            offset: 0,
            size,
            finished: false,
        })
    }

    /// End of the last complete frame returned so far.
    #[must_use]
    pub fn valid_end(&self) -> u64 {
        self.offset
    }

    /// Returns true if bytes remain after `valid_end` that did not form a
    /// complete frame.
    #[must_use]
    pub fn has_torn_tail(&self) -> bool {
        self.finished && self.offset < self.size
    }

    fn read_frame(&mut self) -> CoreResult<Option<Frame>> {
        let start = self.offset;
        let remaining = self.size - start;
        if remaining < HEADER_SIZE as u64 {
            return Ok(None);
        }

        let header = self.backend.read_at(start, HEADER_SIZE)?;
        if header[0..4] != LOG_MAGIC {
            return Err(CoreError::log_corruption(
                self.log,
                format!("invalid magic at offset {start}"),
            ));
        }

        let version = u16::from_le_bytes([header[4], header[5]]);
        if version > LOG_VERSION {
            return Err(CoreError::log_corruption(
                self.log,
                format!("unsupported version {version} at offset {start}"),
            ));
        }

        let kind = RecordKind::from_byte(header[6]).ok_or_else(|| {
            CoreError::log_corruption(
                self.log,
                format!("unknown record kind {} at offset {start}", header[6]),
            )
        })?;

        let len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]) as u64;
        let frame_len = HEADER_SIZE as u64 + len + CRC_SIZE as u64;
        if remaining < frame_len {
            return Ok(None);
        }

        let body = self
            .backend
            .read_at(start, HEADER_SIZE + len as usize + CRC_SIZE)?;
        let crc_at = HEADER_SIZE + len as usize;
        let stored = u32::from_le_bytes([
            body[crc_at],
            body[crc_at + 1],
            body[crc_at + 2],
            body[crc_at + 3],
        ]);
        let computed = compute_crc32(&body[..crc_at]);
        if stored != computed {
            return Err(CoreError::ChecksumMismatch {
                log: self.log,
                offset: start,
                expected: stored,
                actual: computed,
            });
        }

        let end = start + frame_len;
        self.offset = end;
        Ok(Some(Frame {
            offset: start,
            kind,
            payload: body[HEADER_SIZE..crc_at].to_vec(),
            end,
        }))
    }
}

impl Iterator for FrameIterator<'_> {
    type Item = CoreResult<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.read_frame() {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}
