//! On-disk framing of log records.
//!
//! ```text
//! magic "TKVL" (4) | kind (1) | payload length u32 LE (4) | CBOR payload | crc32 LE (4)
//! ```
//!
//! The CRC covers every byte before it. A record cut short at the end of
//! the journal is a torn write and is truncated away on open; a bad magic
//! or checksum anywhere is corruption.

use crate::error::{CoreError, CoreResult};
use std::fmt;
use tierkv_protocol::Operation;
use tierkv_storage::StorageBackend;
use tracing::warn;

const JOURNAL_MAGIC: [u8; 4] = *b"TKVL";
const HEADER_SIZE: usize = 9;
const CRC_SIZE: usize = 4;

const KIND_APPEND: u8 = 1;
const KIND_TRIM: u8 = 2;

/// A journaled log mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum JournalRecord {
    Append(Operation),
    Trim(u64),
}

impl JournalRecord {
    fn kind(&self) -> u8 {
        match self {
            Self::Append(_) => KIND_APPEND,
            Self::Trim(_) => KIND_TRIM,
        }
    }

    fn encode(&self) -> CoreResult<Vec<u8>> {
        let mut payload = Vec::new();
        let written = match self {
            Self::Append(op) => ciborium::into_writer(op, &mut payload),
            Self::Trim(upto) => ciborium::into_writer(upto, &mut payload),
        };
        written.map_err(|e| CoreError::log_corruption(format!("encode failed: {e}")))?;

        let len = u32::try_from(payload.len())
            .map_err(|_| CoreError::log_corruption("record payload too large"))?;
        let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        frame.extend_from_slice(&JOURNAL_MAGIC);
        frame.push(self.kind());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&payload);
        let crc = crc32fast::hash(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        Ok(frame)
    }

    fn decode(kind: u8, payload: &[u8]) -> CoreResult<Self> {
        let decoded = match kind {
            KIND_APPEND => ciborium::from_reader(payload).map(Self::Append),
            KIND_TRIM => ciborium::from_reader(payload).map(Self::Trim),
            other => {
                return Err(CoreError::log_corruption(format!(
                    "unknown record kind {other}"
                )))
            }
        };
        decoded.map_err(|e| CoreError::log_corruption(format!("undecodable payload: {e}")))
    }
}

/// Append-only record journal over a [`StorageBackend`].
pub(crate) struct Journal {
    backend: Box<dyn StorageBackend>,
}

impl fmt::Debug for Journal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Journal")
            .field("size", &self.backend.size().ok())
            .finish()
    }
}

impl Journal {
    /// Replays every complete record and drops a torn tail.
    pub(crate) fn open(
        mut backend: Box<dyn StorageBackend>,
    ) -> CoreResult<(Self, Vec<JournalRecord>)> {
        let size = backend.size()?;
        let mut offset = 0u64;
        let mut records = Vec::new();

        while offset < size {
            let remaining = size - offset;
            if remaining < HEADER_SIZE as u64 {
                break;
            }
            let header = backend.read_at(offset, HEADER_SIZE)?;
            if header[..4] != JOURNAL_MAGIC {
                return Err(CoreError::log_corruption(format!(
                    "bad magic at offset {offset}"
                )));
            }
            let kind = header[4];
            let mut len_bytes = [0u8; 4];
            len_bytes.copy_from_slice(&header[5..9]);
            let len = u32::from_le_bytes(len_bytes) as usize;

            let total = HEADER_SIZE + len + CRC_SIZE;
            if remaining < total as u64 {
                break;
            }
            let frame = backend.read_at(offset, total)?;
            let (body, crc_bytes) = frame.split_at(HEADER_SIZE + len);
            let mut stored = [0u8; 4];
            stored.copy_from_slice(crc_bytes);
            let expected = u32::from_le_bytes(stored);
            let actual = crc32fast::hash(body);
            if expected != actual {
                return Err(CoreError::ChecksumMismatch { expected, actual });
            }

            records.push(JournalRecord::decode(kind, &body[HEADER_SIZE..])?);
            offset += total as u64;
        }

        if offset < size {
            warn!(offset, size, "dropping torn journal tail");
            backend.truncate(offset)?;
        }
        Ok((Self { backend }, records))
    }

    /// Appends a record and makes it durable.
    pub(crate) fn write(&mut self, record: &JournalRecord) -> CoreResult<()> {
        let frame = record.encode()?;
        self.backend.append(&frame)?;
        self.backend.sync()?;
        Ok(())
    }
}
