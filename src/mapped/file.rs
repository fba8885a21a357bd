//! Mapped data file
//!
//! Owns the memory map of `data.db`: header I/O, appending commit frames,
//! and growing the file when a frame does not fit.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use crate::config::SyncStrategy;
use crate::error::{Result, StoreError};

use super::{GROWTH_STEP, HEADER_SIZE, MAGIC, VERSION};

/// Decoded file header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Header {
    /// Offset just past the last committed frame
    pub committed_end: u64,
    /// Id of the last committed transaction (0 = none yet)
    pub last_txn_id: u64,
}

impl Header {
    pub fn encode(&self) -> [u8; HEADER_SIZE as usize] {
        let mut buf = [0u8; HEADER_SIZE as usize];
        buf[0..4].copy_from_slice(MAGIC);
        buf[4..6].copy_from_slice(&VERSION.to_le_bytes());
        buf[8..16].copy_from_slice(&self.committed_end.to_le_bytes());
        buf[16..24].copy_from_slice(&self.last_txn_id.to_le_bytes());
        let crc = crc32fast::hash(&buf[0..24]);
        buf[24..28].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Parse and validate a header; `file_len` bounds the commit pointer
    pub fn decode(buf: &[u8], file_len: u64) -> Result<Self> {
        if buf.len() < HEADER_SIZE as usize {
            return Err(StoreError::Corruption(format!(
                "data file too small for header: {} bytes",
                buf.len()
            )));
        }
        if &buf[0..4] != MAGIC {
            return Err(StoreError::Corruption(format!(
                "invalid magic: expected NSDB, got {:?}",
                &buf[0..4]
            )));
        }
        let version = u16::from_le_bytes([buf[4], buf[5]]);
        if version != VERSION {
            return Err(StoreError::Corruption(format!(
                "unsupported format version: {}",
                version
            )));
        }
        let stored_crc = read_u32(&buf[24..28]);
        let actual_crc = crc32fast::hash(&buf[0..24]);
        if stored_crc != actual_crc {
            return Err(StoreError::Corruption(format!(
                "header checksum mismatch: stored {:#010x}, computed {:#010x}",
                stored_crc, actual_crc
            )));
        }

        let committed_end = read_u64(&buf[8..16]);
        if committed_end < HEADER_SIZE || committed_end > file_len {
            return Err(StoreError::Corruption(format!(
                "commit pointer {} outside file of {} bytes",
                committed_end, file_len
            )));
        }

        Ok(Self {
            committed_end,
            last_txn_id: read_u64(&buf[16..24]),
        })
    }
}

pub(crate) fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(buf)
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

/// Memory-mapped, append-only data file
pub(crate) struct MapFile {
    path: PathBuf,
    file: File,
    map: MmapMut,
    header: Header,
    max_size: Option<u64>,
    sync_strategy: SyncStrategy,
}

impl MapFile {
    /// Create an empty data file, replacing whatever is at `path`
    pub fn create(
        path: &Path,
        initial_size: u64,
        max_size: Option<u64>,
        sync_strategy: SyncStrategy,
    ) -> Result<Self> {
        let size = initial_size.max(HEADER_SIZE);
        if let Some(limit) = max_size {
            if size > limit {
                return Err(StoreError::Config(format!(
                    "initial map size {} exceeds max map size {}",
                    size, limit
                )));
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(size)?;
        let map = map_file(&file)?;

        let header = Header {
            committed_end: HEADER_SIZE,
            last_txn_id: 0,
        };
        let mut map_file = Self {
            path: path.to_path_buf(),
            file,
            map,
            header,
            max_size,
            sync_strategy,
        };
        map_file.write_header(&header)?;
        map_file.map.flush()?;
        Ok(map_file)
    }

    /// Open an existing data file and validate its header
    pub fn open(path: &Path, max_size: Option<u64>, sync_strategy: SyncStrategy) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len < HEADER_SIZE {
            return Err(StoreError::Corruption(format!(
                "data file too small for header: {} bytes",
                len
            )));
        }
        let map = map_file(&file)?;
        let header = Header::decode(&map[..HEADER_SIZE as usize], len)?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            map,
            header,
            max_size,
            sync_strategy,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn set_path(&mut self, path: PathBuf) {
        self.path = path;
    }

    pub fn header(&self) -> Header {
        self.header
    }

    pub fn capacity(&self) -> u64 {
        self.map.len() as u64
    }

    /// Frames covered by the commit pointer
    pub fn committed(&self) -> &[u8] {
        &self.map[HEADER_SIZE as usize..self.header.committed_end as usize]
    }

    /// Bytes past the commit pointer; never replayed
    pub fn tail(&self) -> &[u8] {
        &self.map[self.header.committed_end as usize..]
    }

    /// Make room for `additional` bytes past the commit pointer
    pub fn reserve(&mut self, additional: u64) -> Result<()> {
        let needed = self.header.committed_end.saturating_add(additional);
        if needed > self.capacity() {
            self.grow(needed)?;
        }
        Ok(())
    }

    /// Grow toward `additional` bytes past the commit pointer without
    /// passing the growth limit. Used for size hints.
    pub fn pre_grow(&mut self, additional: u64) -> Result<()> {
        let mut needed = self.header.committed_end.saturating_add(additional);
        if let Some(limit) = self.max_size {
            needed = needed.min(limit);
        }
        if needed > self.capacity() {
            self.grow(needed)?;
        }
        Ok(())
    }

    fn grow(&mut self, needed: u64) -> Result<()> {
        let doubled = self.capacity().saturating_mul(2);
        let rounded = needed.div_ceil(GROWTH_STEP).saturating_mul(GROWTH_STEP);
        let mut new_size = doubled.max(rounded);
        if let Some(limit) = self.max_size {
            if needed > limit {
                return Err(StoreError::MapFull { needed, limit });
            }
            new_size = new_size.min(limit);
        }

        self.map.flush()?;
        self.file.set_len(new_size)?;
        self.map = map_file(&self.file)?;

        tracing::debug!(
            path = %self.path.display(),
            old_size = doubled / 2,
            new_size,
            "Grew data file"
        );
        Ok(())
    }

    /// Append one frame and move the commit pointer past it.
    ///
    /// The frame is written (and synced) before the header, so a crash in
    /// between leaves the frame outside the committed region.
    pub fn append(&mut self, frame: &[u8], txn_id: u64) -> Result<()> {
        self.reserve(frame.len() as u64)?;

        let start = self.header.committed_end as usize;
        self.map[start..start + frame.len()].copy_from_slice(frame);
        if self.sync_strategy == SyncStrategy::EveryCommit {
            self.map.flush_range(start, frame.len())?;
        }

        let header = Header {
            committed_end: self.header.committed_end + frame.len() as u64,
            last_txn_id: txn_id,
        };
        if let Err(e) = self.write_header(&header) {
            // The frame stays outside the committed region
            let previous = self.header.encode();
            self.map[..previous.len()].copy_from_slice(&previous);
            return Err(e);
        }
        self.header = header;
        Ok(())
    }

    fn write_header(&mut self, header: &Header) -> Result<()> {
        let bytes = header.encode();
        self.map[..bytes.len()].copy_from_slice(&bytes);
        if self.sync_strategy == SyncStrategy::EveryCommit {
            self.map.flush_range(0, bytes.len())?;
        }
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.map.flush()?;
        Ok(())
    }
}

fn map_file(file: &File) -> Result<MmapMut> {
    // The file is owned by this process for the lifetime of the map
    let map = unsafe { MmapMut::map_mut(file)? };
    Ok(map)
}
