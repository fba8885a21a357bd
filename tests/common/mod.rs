//! Shared helpers for the integration suites

#![allow(dead_code)]

use std::path::Path;

use nodestore::{
    CacheLimit, Config, Db, InMemoryDb, Index, LruCache, MappedDb, OpenMode, ReadCache,
    WriteBackCache,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

/// Write-back threshold of the bounded variant; small enough to flush often
pub const WRITE_CACHE_LIMIT: u64 = 1000;

/// LRU capacity of the bounded variants; small enough to evict often
pub const LRU_CAPACITY: u64 = 500;

/// Every store stack the contract suite runs against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    Mapped,
    InMemory,
    WriteBack,
    WriteBackNoFlush,
    ReadCached,
    LruOverMappedUnbounded,
    LruOverReadCacheUnbounded,
    LruOverMapped,
    LruOverReadCache,
}

pub const ALL_VARIANTS: [Variant; 9] = [
    Variant::Mapped,
    Variant::InMemory,
    Variant::WriteBack,
    Variant::WriteBackNoFlush,
    Variant::ReadCached,
    Variant::LruOverMappedUnbounded,
    Variant::LruOverReadCacheUnbounded,
    Variant::LruOverMapped,
    Variant::LruOverReadCache,
];

pub fn test_config(dir: &Path) -> Config {
    Config::builder()
        .data_dir(dir)
        .open_mode(OpenMode::Fresh)
        .initial_map_size(64 * 1024)
        .build()
}

pub fn open_variant(variant: Variant, dir: &Path) -> Box<dyn Db> {
    let config = test_config(dir);
    let mapped = || MappedDb::open(&config).unwrap();
    let bounded_lru = CacheLimit::Bytes(LRU_CAPACITY);

    match variant {
        Variant::Mapped => Box::new(mapped()),
        Variant::InMemory => Box::new(InMemoryDb::new()),
        Variant::WriteBack => Box::new(WriteBackCache::new(
            mapped(),
            CacheLimit::Bytes(WRITE_CACHE_LIMIT),
        )),
        Variant::WriteBackNoFlush => Box::new(WriteBackCache::new(mapped(), CacheLimit::Disabled)),
        Variant::ReadCached => Box::new(ReadCache::new(mapped(), CacheLimit::Disabled)),
        Variant::LruOverMappedUnbounded => Box::new(LruCache::new(mapped(), CacheLimit::Disabled)),
        Variant::LruOverReadCacheUnbounded => Box::new(LruCache::new(
            ReadCache::new(mapped(), CacheLimit::Disabled),
            CacheLimit::Disabled,
        )),
        Variant::LruOverMapped => Box::new(LruCache::new(mapped(), bounded_lru)),
        Variant::LruOverReadCache => Box::new(LruCache::new(
            ReadCache::new(mapped(), CacheLimit::Disabled),
            bounded_lru,
        )),
    }
}

pub fn setup_store(variant: Variant) -> (TempDir, Box<dyn Db>) {
    let temp_dir = TempDir::new().unwrap();
    let db = open_variant(variant, temp_dir.path());
    (temp_dir, db)
}

pub fn seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

pub fn random_bytes(rng: &mut StdRng, min_len: usize, max_len: usize) -> Vec<u8> {
    let len = rng.gen_range(min_len..=max_len);
    (0..len).map(|_| rng.gen()).collect()
}

/// Assert that `db` holds exactly what `oracle` holds, through every read
/// operation
pub fn assert_same_contents(db: &dyn Db, oracle: &InMemoryDb, context: &str) {
    for index in Index::ALL {
        let expected = oracle.read_all(index).unwrap();
        let actual = db.read_all(index).unwrap();
        assert_eq!(actual, expected, "{}: read_all({}) differs", context, index);

        for (key, values) in &expected {
            assert!(db.exists(index, key).unwrap(), "{}: exists({})", context, index);
            assert_eq!(
                &db.read_multiple(index, key).unwrap(),
                values,
                "{}: read_multiple({})",
                context,
                index
            );
            assert_eq!(
                db.get(index, key).unwrap().as_ref(),
                values.first(),
                "{}: get({})",
                context,
                index
            );
        }

        for (key, value) in db.read_all_unique(index).unwrap() {
            assert!(
                expected[&key].contains(&value),
                "{}: read_all_unique({}) returned a value never written",
                context,
                index
            );
        }
    }
}
