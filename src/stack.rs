//! Store composition
//!
//! Builds the configured stack of backend and cache layers as one
//! `Box<dyn Db>`, reading locations and limits from a [`Config`].

use std::fmt;
use std::str::FromStr;

use tracing::info;

use crate::cache::{LruCache, ReadCache, WriteBackCache};
use crate::config::Config;
use crate::db::Db;
use crate::error::{Result, StoreError};
use crate::mapped::MappedDb;
use crate::memory::InMemoryDb;

/// Supported stack layouts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StackKind {
    /// Persistent backend alone
    Mapped,
    /// Reference backend alone
    InMemory,
    /// Write-back cache over the persistent backend
    WriteBack,
    /// Read cache over the persistent backend
    ReadCached,
    /// LRU cache over the persistent backend
    LruOverMapped,
    /// LRU cache over a read cache over the persistent backend
    LruOverReadCache,
}

impl StackKind {
    pub const ALL: [StackKind; 6] = [
        StackKind::Mapped,
        StackKind::InMemory,
        StackKind::WriteBack,
        StackKind::ReadCached,
        StackKind::LruOverMapped,
        StackKind::LruOverReadCache,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StackKind::Mapped => "mapped",
            StackKind::InMemory => "memory",
            StackKind::WriteBack => "write-back",
            StackKind::ReadCached => "read-cache",
            StackKind::LruOverMapped => "lru",
            StackKind::LruOverReadCache => "lru-read-cache",
        }
    }
}

impl fmt::Display for StackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StackKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        StackKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| StoreError::Config(format!("unknown stack kind '{}'", s)))
    }
}

/// Open the stack `kind` as configured
pub fn open_stack(kind: StackKind, config: &Config) -> Result<Box<dyn Db>> {
    let db: Box<dyn Db> = match kind {
        StackKind::Mapped => Box::new(MappedDb::open(config)?),
        StackKind::InMemory => Box::new(InMemoryDb::new()),
        StackKind::WriteBack => Box::new(WriteBackCache::new(
            MappedDb::open(config)?,
            config.write_cache_limit,
        )),
        StackKind::ReadCached => Box::new(ReadCache::new(
            MappedDb::open(config)?,
            config.read_cache_limit,
        )),
        StackKind::LruOverMapped => {
            Box::new(LruCache::new(MappedDb::open(config)?, config.lru_capacity))
        }
        StackKind::LruOverReadCache => Box::new(LruCache::new(
            ReadCache::new(MappedDb::open(config)?, config.read_cache_limit),
            config.lru_capacity,
        )),
    };

    info!(
        stack = %kind,
        data_dir = %config.data_dir.display(),
        "Opened store stack"
    );
    Ok(db)
}
