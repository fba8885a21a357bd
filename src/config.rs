//! Configuration for nodestore
//!
//! Centralized configuration with sensible defaults. Every store stack is
//! built from one `Config`; backends read the storage fields and the cache
//! layers read their limits.

use std::path::PathBuf;

/// Main configuration for a store instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Root directory for the data file
    /// Internal structure:
    ///   {data_dir}/
    ///     └── data.db          (memory-mapped commit log)
    pub data_dir: PathBuf,

    /// Whether existing data at `data_dir` is kept or wiped
    pub open_mode: OpenMode,

    /// Size the data file is mapped with when first created (in bytes)
    pub initial_map_size: u64,

    /// Upper bound for map growth (in bytes), `None` for unbounded
    pub max_map_size: Option<u64>,

    /// When committed data is msynced to disk
    pub sync_strategy: SyncStrategy,

    /// When the data file is rewritten on its own, `None` to only compact
    /// on request
    pub auto_compact: Option<CompactionPolicy>,

    // -------------------------------------------------------------------------
    // Cache Configuration
    // -------------------------------------------------------------------------
    /// Pending bytes after which the write-back layer flushes on its own
    pub write_cache_limit: CacheLimit,

    /// Maximum bytes held by the read cache layer
    pub read_cache_limit: CacheLimit,

    /// Maximum resident weight of the LRU layer
    pub lru_capacity: CacheLimit,
}

/// How a backend treats data already present at its location
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Keep existing data, create the store if it is missing
    OpenOrCreate,

    /// Discard any existing data and start empty
    Fresh,
}

/// Size bound for a cache layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLimit {
    /// No size-triggered behaviour: the write-back layer never flushes on its
    /// own, the LRU layer never evicts, the read cache grows without bound
    Disabled,

    /// Threshold in bytes
    Bytes(u64),
}

impl CacheLimit {
    /// Translate a raw byte count where 0 traditionally meant "disabled"
    pub fn from_bytes(bytes: u64) -> Self {
        if bytes == 0 {
            CacheLimit::Disabled
        } else {
            CacheLimit::Bytes(bytes)
        }
    }

    /// Whether `size` is past the limit
    pub fn is_exceeded_by(&self, size: u64) -> bool {
        match self {
            CacheLimit::Disabled => false,
            CacheLimit::Bytes(limit) => size > *limit,
        }
    }

    pub fn bytes(&self) -> Option<u64> {
        match self {
            CacheLimit::Disabled => None,
            CacheLimit::Bytes(limit) => Some(*limit),
        }
    }
}

/// Sync strategy for the persistent backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStrategy {
    /// msync every committed transaction (safest, slowest)
    EveryCommit,

    /// msync only on flush and close
    OnClose,
}

/// Threshold for rewriting the data file with only its live state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionPolicy {
    /// Committed bytes below which the file is left alone
    pub min_committed_bytes: u64,

    /// Share of the committed bytes (percent) allowed to be superseded data
    pub max_dead_percent: u8,
}

impl Default for CompactionPolicy {
    fn default() -> Self {
        Self {
            min_committed_bytes: 4 * 1024 * 1024, // 4 MB
            max_dead_percent: 50,
        }
    }
}

impl CompactionPolicy {
    /// Whether a file with `committed` bytes, of which `live` would survive
    /// compaction, is due
    pub fn is_due(&self, committed: u64, live: u64) -> bool {
        let dead = committed.saturating_sub(live);
        committed >= self.min_committed_bytes
            && dead.saturating_mul(100) > committed.saturating_mul(u64::from(self.max_dead_percent))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./nodestore_data"),
            open_mode: OpenMode::OpenOrCreate,
            initial_map_size: 4 * 1024 * 1024, // 4 MB
            max_map_size: None,
            sync_strategy: SyncStrategy::EveryCommit,
            auto_compact: Some(CompactionPolicy::default()),
            write_cache_limit: CacheLimit::Bytes(64 * 1024 * 1024), // 64 MB
            read_cache_limit: CacheLimit::Bytes(32 * 1024 * 1024),  // 32 MB
            lru_capacity: CacheLimit::Bytes(16 * 1024 * 1024),      // 16 MB
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Path of the memory-mapped data file
    pub fn data_file(&self) -> PathBuf {
        self.data_dir.join("data.db")
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the data directory
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set the open mode
    pub fn open_mode(mut self, mode: OpenMode) -> Self {
        self.config.open_mode = mode;
        self
    }

    /// Set the initial map size (in bytes)
    pub fn initial_map_size(mut self, size: u64) -> Self {
        self.config.initial_map_size = size;
        self
    }

    /// Bound map growth (in bytes)
    pub fn max_map_size(mut self, size: u64) -> Self {
        self.config.max_map_size = Some(size);
        self
    }

    /// Set the sync strategy
    pub fn sync_strategy(mut self, strategy: SyncStrategy) -> Self {
        self.config.sync_strategy = strategy;
        self
    }

    /// Set the automatic compaction threshold, `None` to disable it
    pub fn auto_compact(mut self, policy: Option<CompactionPolicy>) -> Self {
        self.config.auto_compact = policy;
        self
    }

    /// Set the write-back flush threshold
    pub fn write_cache_limit(mut self, limit: CacheLimit) -> Self {
        self.config.write_cache_limit = limit;
        self
    }

    /// Set the read cache size bound
    pub fn read_cache_limit(mut self, limit: CacheLimit) -> Self {
        self.config.read_cache_limit = limit;
        self
    }

    /// Set the LRU capacity
    pub fn lru_capacity(mut self, limit: CacheLimit) -> Self {
        self.config.lru_capacity = limit;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compaction_due_past_dead_share() {
        let policy = CompactionPolicy {
            min_committed_bytes: 1000,
            max_dead_percent: 50,
        };
        assert!(policy.is_due(10_000, 4_000));
        assert!(!policy.is_due(10_000, 6_000));
        // Small files are never due
        assert!(!policy.is_due(900, 0));
        // Live bytes above committed count as no dead bytes
        assert!(!policy.is_due(10_000, 20_000));
    }

    #[test]
    fn test_builder_sets_auto_compact() {
        let config = Config::builder().auto_compact(None).build();
        assert_eq!(config.auto_compact, None);
        assert_eq!(
            Config::default().auto_compact,
            Some(CompactionPolicy::default())
        );
    }
}
