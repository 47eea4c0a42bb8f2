//! Record framing and payload codec.

use crate::error::{CoreError, CoreResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Magic bytes at the start of every record.
pub const LOG_MAGIC: [u8; 4] = *b"CDCL";

/// Current framing version.
pub const LOG_VERSION: u16 = 1;

/// What a log record holds. Each log file accepts exactly one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    /// An offset commit.
    Offset = 1,
    /// A schema version.
    Schema = 2,
    /// A dead-lettered event.
    DeadLetter = 3,
}

impl RecordKind {
    /// Converts a byte to a record kind.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Offset),
            2 => Some(Self::Schema),
            3 => Some(Self::DeadLetter),
            _ => None,
        }
    }

    /// Converts the kind to its byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }

    /// Human-readable name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Offset => "OFFSET",
            Self::Schema => "SCHEMA",
            Self::DeadLetter => "DEAD_LETTER",
        }
    }
}

/// Encodes a record as CBOR.
///
/// # Errors
///
/// Returns [`CoreError::Codec`] if serialization fails.
pub fn encode_payload<T: Serialize>(record: &T) -> CoreResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(record, &mut buf).map_err(|e| CoreError::codec(e.to_string()))?;
    Ok(buf)
}

/// Decodes a CBOR record.
///
/// # Errors
///
/// Returns [`CoreError::Codec`] if the bytes are not a valid `T`.
pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> CoreResult<T> {
    ciborium::de::from_reader(payload).map_err(|e| CoreError::codec(e.to_string()))
}

/// Builds the full frame (header, payload, CRC) for one record.
pub(crate) fn encode_frame(kind: RecordKind, payload: &[u8]) -> CoreResult<Vec<u8>> {
    let len = u32::try_from(payload.len())
        .map_err(|_| CoreError::codec("record payload exceeds 4 GiB"))?;

    let mut frame = Vec::with_capacity(super::HEADER_SIZE + payload.len() + super::CRC_SIZE);
    frame.extend_from_slice(&LOG_MAGIC);
    frame.extend_from_slice(&LOG_VERSION.to_le_bytes());
    frame.push(kind.as_byte());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(payload);

    let crc = compute_crc32(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    Ok(frame)
}

/// Computes the IEEE CRC-32 of `data`.
///
/// Also used to hash table identifiers onto worker partitions, so the value
/// must stay stable across releases.
pub fn compute_crc32(data: &[u8]) -> u32 {
    const TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                crc = if crc & 1 != 0 {
                    (crc >> 1) ^ 0xEDB8_8320
                } else {
                    crc >> 1
                };
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        crc = (crc >> 8) ^ TABLE[((crc ^ u32::from(byte)) & 0xFF) as usize];
    }
    !crc
}
