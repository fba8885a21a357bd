//! Memory-Mapped Backend
//!
//! Durable, transactional store over a single memory-mapped file.
//!
//! ## Responsibilities
//! - Append one checksummed commit record per transaction
//! - Publish a commit by moving the header's commit pointer, after the record
//!   itself is synced
//! - Rebuild the committed tables on open, ignoring anything past the pointer
//! - Grow the map on demand, bounded by `max_map_size`
//! - Serve readers from copy-on-write snapshots while a writer proceeds
//!
//! ## File Format
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Header (32)                                                  │
//! │ ┌──────────┬─────────┬─────────┬───────────┬────────┬──────┐ │
//! │ │"NSDB" (4)│ Ver (2) │ Rsv (2) │ End (8)   │ Txn (8)│CRC(4)│ │
//! │ └──────────┴─────────┴─────────┴───────────┴────────┴──────┘ │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Commit record 1                                              │
//! │ ┌─────────┬─────────┬────────────────────────────────────┐   │
//! │ │ Len (4) │ CRC (4) │ bincode(CommitRecord)              │   │
//! │ └─────────┴─────────┴────────────────────────────────────┘   │
//! ├──────────────────────────────────────────────────────────────┤
//! │ ...                                                          │
//! ├──────────────────────────────────────────────────────────────┤ ← End
//! │ unused (zero-filled, or an unfinished commit)                │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod file;
mod record;
mod recovery;

pub use record::{CommitRecord, FrameError, RecordOp, FRAME_HEADER_SIZE};
pub use recovery::{Recovery, RecoveryResult};

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::{CompactionPolicy, Config, OpenMode, SyncStrategy};
use crate::db::{check_erasable, pick_unique, slice_value, Db, MultiMap, UniqueMap};
use crate::error::{Result, StoreError};
use crate::index::Index;
use crate::overlay::{resolve_layers, Overlay};
use crate::tables::{Tables, Usage};

use file::MapFile;
use record::compacted_len;

pub(crate) const MAGIC: &[u8; 4] = b"NSDB";
pub(crate) const VERSION: u16 = 1;
pub(crate) const HEADER_SIZE: u64 = 32;

/// Growth granularity of the data file
pub(crate) const GROWTH_STEP: u64 = 1024 * 1024;

const COMPACT_SUFFIX: &str = "db.compact";

/// Persistent store over a memory-mapped file
pub struct MappedDb {
    /// Last committed state
    tables: RwLock<Arc<Tables>>,

    /// `None` once closed
    writer: Mutex<Option<Writer>>,

    recovery: RecoveryResult,
    initial_map_size: u64,
    max_map_size: Option<u64>,
    sync_strategy: SyncStrategy,
    auto_compact: Option<CompactionPolicy>,
}

struct Writer {
    file: MapFile,
    txn: Option<Overlay>,
    next_txn_id: u64,
}

/// Capacity and content summary of a mapped store
#[derive(Debug, Clone)]
pub struct MapStats {
    pub path: PathBuf,
    pub capacity: u64,
    pub committed_bytes: u64,
    pub last_txn_id: u64,
    pub keys_per_index: Vec<(Index, usize)>,
}

impl MappedDb {
    /// Open (or create) the store described by `config`
    pub fn open(config: &Config) -> Result<Self> {
        fs::create_dir_all(&config.data_dir)?;
        let path = config.data_file();

        let file = match config.open_mode {
            OpenMode::OpenOrCreate if path.exists() => {
                MapFile::open(&path, config.max_map_size, config.sync_strategy)?
            }
            OpenMode::OpenOrCreate | OpenMode::Fresh => {
                let stale = path.with_extension(COMPACT_SUFFIX);
                if stale.exists() {
                    fs::remove_file(&stale)?;
                }
                MapFile::create(
                    &path,
                    config.initial_map_size,
                    config.max_map_size,
                    config.sync_strategy,
                )?
            }
        };

        let (tables, recovery) = Recovery::replay(&file)?;
        info!(
            path = %path.display(),
            records = recovery.records_replayed,
            last_txn_id = recovery.last_txn_id,
            capacity = file.capacity(),
            "Opened mapped store"
        );
        if recovery.discarded_tail {
            warn!(path = %path.display(), "Discarded unfinished commit past the commit pointer");
        }

        Ok(Self {
            tables: RwLock::new(Arc::new(tables)),
            writer: Mutex::new(Some(Writer {
                file,
                txn: None,
                next_txn_id: recovery.last_txn_id + 1,
            })),
            recovery,
            initial_map_size: config.initial_map_size,
            max_map_size: config.max_map_size,
            sync_strategy: config.sync_strategy,
            auto_compact: config.auto_compact,
        })
    }

    /// Open with default settings at `path`
    pub fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(&Config::builder().data_dir(path.as_ref()).build())
    }

    /// What was replayed when this store was opened
    pub fn recovery(&self) -> &RecoveryResult {
        &self.recovery
    }

    /// Read handle on the current committed state. It keeps observing that
    /// state while later commits proceed.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            tables: Arc::clone(&self.tables.read()),
        }
    }

    pub fn stats(&self) -> Result<MapStats> {
        let guard = self.writer.lock();
        let writer = guard.as_ref().ok_or(StoreError::Closed)?;
        let header = writer.file.header();
        let counts = self.tables.read().key_counts();

        Ok(MapStats {
            path: writer.file.path().to_path_buf(),
            capacity: writer.file.capacity(),
            committed_bytes: header.committed_end - HEADER_SIZE,
            last_txn_id: header.last_txn_id,
            keys_per_index: Index::ALL.iter().map(|&i| (i, counts[i.slot()])).collect(),
        })
    }

    /// Rewrite the live state as a single record into a new file and swap it
    /// in. Refused while a transaction is open.
    pub fn compact(&self) -> Result<()> {
        let mut guard = self.writer.lock();
        let writer = guard.as_mut().ok_or(StoreError::Closed)?;
        if writer.txn.is_some() {
            return Err(StoreError::TransactionAlreadyOpen);
        }
        self.rewrite(writer)
    }

    /// Swap the data file for one holding a single record of the live state
    fn rewrite(&self, writer: &mut Writer) -> Result<()> {
        let tables = Arc::clone(&self.tables.read());
        let txn_id = writer.next_txn_id;
        let frame = CommitRecord::from_tables(txn_id, &tables).encode()?;

        let path = writer.file.path().to_path_buf();
        let temp_path = path.with_extension(COMPACT_SUFFIX);
        let mut compacted = MapFile::create(
            &temp_path,
            self.initial_map_size,
            self.max_map_size,
            self.sync_strategy,
        )?;
        compacted.append(&frame, txn_id)?;
        compacted.sync()?;
        fs::rename(&temp_path, &path)?;
        compacted.set_path(path);

        let before = writer.file.header().committed_end;
        writer.file = compacted;
        writer.next_txn_id += 1;

        info!(
            before_bytes = before,
            after_bytes = writer.file.header().committed_end,
            "Compacted data file"
        );
        Ok(())
    }

    /// Resolve `key` through the open transaction onto the committed state
    fn resolved(&self, index: Index, key: &[u8]) -> Result<Vec<Bytes>> {
        let guard = self.writer.lock();
        let writer = guard.as_ref().ok_or(StoreError::Closed)?;
        let layers = [writer.txn.as_ref().and_then(|t| t.get(index, key))];
        resolve_layers(&layers, || {
            Ok(self.tables.read().values(index, key).to_vec())
        })
    }

    fn mutate(&self, f: impl FnOnce(&mut Overlay)) -> Result<()> {
        let mut guard = self.writer.lock();
        let writer = guard.as_mut().ok_or(StoreError::Closed)?;
        match writer.txn.as_mut() {
            Some(txn) => {
                f(txn);
                Ok(())
            }
            None => {
                let mut overlay = Overlay::default();
                f(&mut overlay);
                self.publish(writer, &overlay)
            }
        }
    }

    /// Make `overlay` durable, then visible
    fn publish(&self, writer: &mut Writer, overlay: &Overlay) -> Result<()> {
        if self.changes_nothing(overlay) {
            return Ok(());
        }
        let txn_id = writer.next_txn_id;
        let frame = CommitRecord::from_overlay(txn_id, overlay).encode()?;
        writer.file.append(&frame, txn_id)?;
        writer.next_txn_id += 1;

        let usage = {
            let mut tables = self.tables.write();
            let tables = Arc::make_mut(&mut *tables);
            tables.apply(overlay);
            tables.usage()
        };

        debug!(txn_id, keys = overlay.len(), bytes = frame.len(), "Committed transaction");
        self.compact_if_due(writer, usage);
        Ok(())
    }

    /// True when every change erases a key that holds nothing
    fn changes_nothing(&self, overlay: &Overlay) -> bool {
        let tables = self.tables.read();
        overlay.iter().all(|(index, key, pending)| {
            pending.cleared && pending.values.is_empty() && tables.values(index, key).is_empty()
        })
    }

    /// Rewrite the data file once superseded records dominate it. The commit
    /// that triggered it has already succeeded, so a failure is only logged.
    fn compact_if_due(&self, writer: &mut Writer, usage: Usage) {
        let Some(policy) = self.auto_compact else {
            return;
        };
        let committed = writer.file.header().committed_end - HEADER_SIZE;
        let live = compacted_len(usage);
        if !policy.is_due(committed, live) {
            return;
        }
        if let Err(e) = self.rewrite(writer) {
            warn!(error = %e, committed, live, "Automatic compaction failed");
        }
    }
}

impl Db for MappedDb {
    fn write(&self, index: Index, key: &[u8], value: &[u8]) -> Result<()> {
        self.mutate(|o| o.write(index, key, value))
    }

    fn read(
        &self,
        index: Index,
        key: &[u8],
        offset: usize,
        size: Option<usize>,
    ) -> Result<Option<Vec<u8>>> {
        Ok(self
            .resolved(index, key)?
            .first()
            .map(|v| slice_value(v, offset, size)))
    }

    fn exists(&self, index: Index, key: &[u8]) -> Result<bool> {
        Ok(!self.resolved(index, key)?.is_empty())
    }

    fn erase(&self, index: Index, key: &[u8]) -> Result<()> {
        check_erasable(index)?;
        self.erase_all(index, key)
    }

    fn erase_all(&self, index: Index, key: &[u8]) -> Result<()> {
        self.mutate(|o| o.erase_all(index, key))
    }

    fn read_multiple(&self, index: Index, key: &[u8]) -> Result<Vec<Vec<u8>>> {
        Ok(self
            .resolved(index, key)?
            .iter()
            .map(|v| v.to_vec())
            .collect())
    }

    fn read_all(&self, index: Index) -> Result<MultiMap> {
        let guard = self.writer.lock();
        let writer = guard.as_ref().ok_or(StoreError::Closed)?;
        let mut all = self.tables.read().read_all(index);
        if let Some(txn) = &writer.txn {
            txn.apply_to_map(index, &mut all);
        }
        Ok(all)
    }

    fn begin_transaction(&self, size_hint: Option<u64>) -> Result<()> {
        let mut guard = self.writer.lock();
        let writer = guard.as_mut().ok_or(StoreError::Closed)?;
        if writer.txn.is_some() {
            return Err(StoreError::TransactionAlreadyOpen);
        }
        if let Some(hint) = size_hint {
            // Growth at commit enforces the real limit
            let wanted = hint.saturating_add(FRAME_HEADER_SIZE as u64);
            if let Err(e) = writer.file.pre_grow(wanted) {
                debug!(hint, error = %e, "Could not pre-grow map for size hint");
            }
        }
        writer.txn = Some(Overlay::default());
        Ok(())
    }

    /// A failed commit leaves the committed state untouched and the
    /// transaction closed
    fn commit_transaction(&self) -> Result<()> {
        let mut guard = self.writer.lock();
        let writer = guard.as_mut().ok_or(StoreError::Closed)?;
        let txn = writer.txn.take().ok_or(StoreError::NoTransaction)?;
        self.publish(writer, &txn)
    }

    fn abort_transaction(&self) -> Result<()> {
        let mut guard = self.writer.lock();
        let writer = guard.as_mut().ok_or(StoreError::Closed)?;
        writer.txn.take().ok_or(StoreError::NoTransaction)?;
        Ok(())
    }

    fn flush(&self, _size_hint: Option<u64>) -> Result<()> {
        let guard = self.writer.lock();
        let writer = guard.as_ref().ok_or(StoreError::Closed)?;
        writer.file.sync()
    }

    fn close(&self) -> Result<()> {
        let Some(mut writer) = self.writer.lock().take() else {
            return Ok(());
        };
        if writer.txn.take().is_some() {
            warn!("Discarding open transaction on close");
        }
        writer.file.sync()?;
        info!(
            path = %writer.file.path().display(),
            last_txn_id = writer.file.header().last_txn_id,
            "Closed mapped store"
        );
        Ok(())
    }
}

impl Drop for MappedDb {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(error = %e, "Failed to close mapped store");
        }
    }
}

// =============================================================================
// Snapshots
// =============================================================================

/// Immutable view of one committed state
#[derive(Clone)]
pub struct Snapshot {
    tables: Arc<Tables>,
}

impl Snapshot {
    pub fn read(&self, index: Index, key: &[u8], offset: usize, size: Option<usize>) -> Option<Vec<u8>> {
        self.tables.read(index, key, offset, size)
    }

    pub fn get(&self, index: Index, key: &[u8]) -> Option<Vec<u8>> {
        self.read(index, key, 0, None)
    }

    pub fn exists(&self, index: Index, key: &[u8]) -> bool {
        !self.tables.values(index, key).is_empty()
    }

    pub fn read_multiple(&self, index: Index, key: &[u8]) -> Vec<Vec<u8>> {
        self.tables
            .values(index, key)
            .iter()
            .map(|v| v.to_vec())
            .collect()
    }

    pub fn read_all(&self, index: Index) -> MultiMap {
        self.tables.read_all(index)
    }

    pub fn read_all_unique(&self, index: Index) -> UniqueMap {
        pick_unique(self.read_all(index))
    }
}
