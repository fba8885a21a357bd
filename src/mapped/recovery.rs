//! Recovery
//!
//! Rebuilds the committed tables from the data file on open. Only the
//! region covered by the commit pointer is trusted; anything past it is a
//! transaction that never finished committing.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;

use crate::error::{Result, StoreError};
use crate::tables::Tables;

use super::file::{Header, MapFile};
use super::record::CommitRecord;
use super::HEADER_SIZE;

/// Result of a recovery or verification pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryResult {
    /// Number of commit records replayed
    pub records_replayed: u64,

    /// Id of the last committed transaction
    pub last_txn_id: u64,

    /// Bytes of committed frames (header excluded)
    pub committed_bytes: u64,

    /// Whether a complete but uncommitted frame was found past the commit
    /// pointer and ignored
    pub discarded_tail: bool,
}

pub struct Recovery;

impl Recovery {
    /// Replay every committed record of an open data file
    pub(crate) fn replay(file: &MapFile) -> Result<(Tables, RecoveryResult)> {
        let mut tables = Tables::default();
        let result = scan(file.committed(), file.tail(), file.header(), Some(&mut tables))?;
        Ok((tables, result))
    }

    /// Check the integrity of a data file without modifying it
    pub fn verify(path: &Path) -> Result<RecoveryResult> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        if len < HEADER_SIZE {
            return Err(StoreError::Corruption(format!(
                "data file too small for header: {} bytes",
                len
            )));
        }
        // Read-only view; the store may be open elsewhere in this process
        let map = unsafe { Mmap::map(&file)? };
        let header = Header::decode(&map[..HEADER_SIZE as usize], len)?;
        let end = header.committed_end as usize;
        scan(&map[HEADER_SIZE as usize..end], &map[end..], header, None)
    }
}

fn scan(
    committed: &[u8],
    tail: &[u8],
    header: Header,
    mut tables: Option<&mut Tables>,
) -> Result<RecoveryResult> {
    let mut result = RecoveryResult {
        committed_bytes: committed.len() as u64,
        ..Default::default()
    };

    let mut pos = 0usize;
    while pos < committed.len() {
        let (record, used) = CommitRecord::decode(&committed[pos..]).map_err(|e| {
            StoreError::Corruption(format!(
                "commit record at offset {}: {}",
                HEADER_SIZE + pos as u64,
                e
            ))
        })?;
        if record.txn_id <= result.last_txn_id {
            return Err(StoreError::Corruption(format!(
                "transaction id {} follows {}",
                record.txn_id, result.last_txn_id
            )));
        }
        result.last_txn_id = record.txn_id;
        if let Some(tables) = tables.as_deref_mut() {
            record.apply(tables)?;
        }
        result.records_replayed += 1;
        pos += used;
    }

    if result.last_txn_id != header.last_txn_id {
        return Err(StoreError::Corruption(format!(
            "header names transaction {} but the last record is {}",
            header.last_txn_id, result.last_txn_id
        )));
    }

    result.discarded_tail = CommitRecord::decode(tail).is_ok();
    Ok(result)
}
