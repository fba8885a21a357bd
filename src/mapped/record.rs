//! Commit records
//!
//! One record per committed transaction, framed as
//! `[len u32][crc32 u32][bincode payload]`.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::index::Index;
use crate::overlay::Overlay;
use crate::tables::{Tables, Usage};

use super::file::read_u32;

/// Length prefix plus checksum
pub const FRAME_HEADER_SIZE: usize = 8;

/// Encoded `Put` beyond its key and value: variant tag, index id and two
/// length prefixes
const PUT_OVERHEAD: u64 = 4 + 1 + 8 + 8;

/// Frame header plus txn id, timestamp and op count
const RECORD_OVERHEAD: u64 = FRAME_HEADER_SIZE as u64 + 8 + 8 + 8;

/// Frame size of the single record `from_tables` writes for tables with
/// this usage
pub(crate) fn compacted_len(usage: Usage) -> u64 {
    RECORD_OVERHEAD + usage.values * PUT_OVERHEAD + usage.bytes
}

/// All changes of one committed transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitRecord {
    /// Strictly increasing across the file
    pub txn_id: u64,

    /// Timestamp (unix millis) of the commit
    pub timestamp: u64,

    pub ops: Vec<RecordOp>,
}

/// A single change, applied in order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RecordOp {
    /// Remove every value of a key
    Clear { index: u8, key: Vec<u8> },

    /// Replace the value (unique-key index) or append one (duplicate-key index)
    Put { index: u8, key: Vec<u8>, value: Vec<u8> },
}

/// Why bytes could not be read back as a frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Zero length prefix: unwritten space
    Empty,
    /// The frame runs past the end of the buffer
    Truncated { needed: usize, available: usize },
    ChecksumMismatch { stored: u32, computed: u32 },
    Malformed(String),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::Empty => write!(f, "empty frame"),
            FrameError::Truncated { needed, available } => {
                write!(f, "truncated frame: needs {} bytes, {} available", needed, available)
            }
            FrameError::ChecksumMismatch { stored, computed } => write!(
                f,
                "checksum mismatch: stored {:#010x}, computed {:#010x}",
                stored, computed
            ),
            FrameError::Malformed(msg) => write!(f, "malformed payload: {}", msg),
        }
    }
}

impl CommitRecord {
    pub fn new(txn_id: u64, ops: Vec<RecordOp>) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            txn_id,
            timestamp,
            ops,
        }
    }

    /// Record the changes of an overlay
    pub(crate) fn from_overlay(txn_id: u64, overlay: &Overlay) -> Self {
        let mut ops = Vec::with_capacity(overlay.len());
        for (index, key, pending) in overlay.iter() {
            let replaced = !index.duplicate_keys_allowed() && !pending.values.is_empty();
            if pending.cleared && !replaced {
                ops.push(RecordOp::Clear {
                    index: index.id(),
                    key: key.to_vec(),
                });
            }
            for value in &pending.values {
                ops.push(RecordOp::Put {
                    index: index.id(),
                    key: key.to_vec(),
                    value: value.to_vec(),
                });
            }
        }
        Self::new(txn_id, ops)
    }

    /// Record the whole live state, for compaction
    pub(crate) fn from_tables(txn_id: u64, tables: &Tables) -> Self {
        let mut ops = Vec::new();
        for index in Index::ALL {
            for (key, values) in tables.table(index) {
                for value in values {
                    ops.push(RecordOp::Put {
                        index: index.id(),
                        key: key.clone(),
                        value: value.to_vec(),
                    });
                }
            }
        }
        Self::new(txn_id, ops)
    }

    /// Apply the record's changes to committed tables
    pub(crate) fn apply(self, tables: &mut Tables) -> Result<()> {
        for op in self.ops {
            match op {
                RecordOp::Clear { index, key } => {
                    tables.remove(decode_index(index)?, &key);
                }
                RecordOp::Put { index, key, value } => {
                    tables.put(decode_index(index)?, &key, Bytes::from(value));
                }
            }
        }
        Ok(())
    }

    /// Serialize into a checksummed frame
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = bincode::serialize(self)?;
        let len = u32::try_from(payload.len()).map_err(|_| {
            StoreError::Serialization(format!(
                "commit record of {} bytes exceeds frame limit",
                payload.len()
            ))
        })?;

        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// Read one frame from the front of `buf`, returning the record and the
    /// number of bytes consumed
    pub fn decode(buf: &[u8]) -> std::result::Result<(Self, usize), FrameError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Err(FrameError::Truncated {
                needed: FRAME_HEADER_SIZE,
                available: buf.len(),
            });
        }
        let len = read_u32(&buf[0..4]) as usize;
        if len == 0 {
            return Err(FrameError::Empty);
        }
        let total = FRAME_HEADER_SIZE + len;
        if buf.len() < total {
            return Err(FrameError::Truncated {
                needed: total,
                available: buf.len(),
            });
        }

        let payload = &buf[FRAME_HEADER_SIZE..total];
        let stored = read_u32(&buf[4..8]);
        let computed = crc32fast::hash(payload);
        if stored != computed {
            return Err(FrameError::ChecksumMismatch { stored, computed });
        }

        let record: Self =
            bincode::deserialize(payload).map_err(|e| FrameError::Malformed(e.to_string()))?;
        Ok((record, total))
    }
}

fn decode_index(id: u8) -> Result<Index> {
    Index::try_from(id)
        .map_err(|_| StoreError::Corruption(format!("commit record names unknown index {}", id)))
}
