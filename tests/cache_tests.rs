//! Tests for the cache layers
//!
//! These tests verify:
//! - Flush accounting for manual and threshold-triggered flushes
//! - Buffered data stays out of the inner store until flushed
//! - clear_cache never drops the only copy of data
//! - LRU capacity bound and write-through of dirty victims
//! - Large cached datasets equal the reference before and after a flush
//! - Arbitrary layer nesting

mod common;

use std::collections::BTreeMap;

use common::{assert_same_contents, random_bytes, seeded_rng, test_config};
use nodestore::{
    open_stack, CacheLimit, Config, Db, InMemoryDb, Index, LruCache, MappedDb, OpenMode,
    ReadCache, StackKind, WriteBackCache,
};
use rand::Rng;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_write_back(limit: CacheLimit) -> (TempDir, WriteBackCache<MappedDb>) {
    let temp_dir = TempDir::new().unwrap();
    let inner = MappedDb::open(&test_config(temp_dir.path())).unwrap();
    (temp_dir, WriteBackCache::new(inner, limit))
}

fn setup_lru(capacity: CacheLimit) -> (TempDir, LruCache<MappedDb>) {
    let temp_dir = TempDir::new().unwrap();
    let inner = MappedDb::open(&test_config(temp_dir.path())).unwrap();
    (temp_dir, LruCache::new(inner, capacity))
}

/// Write about `total_bytes` of random data across every index into both
/// stores; duplicate-key tables get several values per key
fn fill_random(db: &dyn Db, oracle: &InMemoryDb, seed: u64, total_bytes: usize) {
    let mut rng = seeded_rng(seed);
    let mut written = 0;
    while written < total_bytes {
        let index = Index::ALL[rng.gen_range(0..Index::COUNT)];
        let key = random_bytes(&mut rng, 4, 16);
        let values = if index.duplicate_keys_allowed() {
            rng.gen_range(1..5)
        } else {
            1
        };
        for _ in 0..values {
            let value = random_bytes(&mut rng, 1, 300);
            written += key.len() + value.len();
            db.write(index, &key, &value).unwrap();
            oracle.write(index, &key, &value).unwrap();
        }
    }
}

/// Fill a manually flushed layer, then check it before and after one flush
fn check_big_flush(db: &dyn Db, total_bytes: usize) {
    let oracle = InMemoryDb::new();
    fill_random(db, &oracle, 99, total_bytes);

    assert_eq!(db.flush_count(), 0);
    assert_same_contents(db, &oracle, "before flush");

    db.flush(Some(1 << 22)).unwrap();
    assert_eq!(db.flush_count(), 1);
    db.clear_cache().unwrap();

    assert_same_contents(db, &oracle, "after flush");
}

// =============================================================================
// Flush Accounting Tests
// =============================================================================

#[test]
fn test_manual_flush_counts_once() {
    let (_temp, db) = setup_write_back(CacheLimit::Disabled);
    for i in 0..100u32 {
        db.write(Index::Tx, &i.to_be_bytes(), &[1u8; 100]).unwrap();
    }
    assert_eq!(db.flush_count(), 0);

    db.flush(None).unwrap();
    assert_eq!(db.flush_count(), 1);

    // Nothing pending still counts as a completed flush
    db.flush(None).unwrap();
    assert_eq!(db.flush_count(), 2);
}

#[test]
fn test_threshold_flushes_count_each() {
    // Each write adds 10 key bytes and 40 value bytes; every third write
    // pushes the pending size past 100
    let (_temp, db) = setup_write_back(CacheLimit::Bytes(100));
    for i in 0..30u32 {
        let key = format!("key-{:06}", i);
        db.write(Index::Blocks, key.as_bytes(), &[7u8; 40]).unwrap();
    }
    assert_eq!(db.flush_count(), 10);
    assert_eq!(db.pending_bytes(), 0);
    assert_eq!(db.inner().read_all(Index::Blocks).unwrap().len(), 30);
}

#[test]
fn test_disabled_limit_never_flushes_on_its_own() {
    let (_temp, db) = setup_write_back(CacheLimit::Disabled);
    for i in 0..500u32 {
        db.write(Index::Blocks, &i.to_be_bytes(), &[3u8; 1000]).unwrap();
    }
    assert_eq!(db.flush_count(), 0);
    assert!(db.inner().read_all(Index::Blocks).unwrap().is_empty());
    assert!(db.pending_bytes() > 500_000);
}

#[test]
fn test_read_cache_and_lru_count_flushes() {
    let temp_dir = TempDir::new().unwrap();
    let inner = MappedDb::open(&test_config(temp_dir.path())).unwrap();
    let db = LruCache::new(ReadCache::new(inner, CacheLimit::Disabled), CacheLimit::Disabled);

    db.write(Index::Main, b"k", b"v").unwrap();
    db.flush(None).unwrap();

    assert_eq!(db.flush_count(), 1);
    assert_eq!(db.inner().flush_count(), 1);
}

// =============================================================================
// Write-Back Tests
// =============================================================================

#[test]
fn test_write_back_transaction_stays_in_layer() {
    let (_temp, db) = setup_write_back(CacheLimit::Disabled);

    db.begin_transaction(None).unwrap();
    db.write(Index::Main, b"k", b"v").unwrap();
    db.flush(None).unwrap();
    assert!(!db.inner().exists(Index::Main, b"k").unwrap());

    db.commit_transaction().unwrap();
    assert!(!db.inner().exists(Index::Main, b"k").unwrap());
    db.flush(None).unwrap();
    assert!(db.inner().exists(Index::Main, b"k").unwrap());
}

#[test]
fn test_write_back_clear_cache_keeps_pending() {
    let (_temp, db) = setup_write_back(CacheLimit::Disabled);
    db.write(Index::Main, b"k", b"v").unwrap();
    db.erase_all(Index::Tx, b"gone").unwrap();

    db.clear_cache().unwrap();

    assert_eq!(db.get(Index::Main, b"k").unwrap(), Some(b"v".to_vec()));
    assert!(db.pending_bytes() > 0);
}

#[test]
fn test_write_back_rewrites_count_one_entry() {
    let temp_dir = TempDir::new().unwrap();
    let bounded = Config::builder()
        .data_dir(temp_dir.path())
        .open_mode(OpenMode::Fresh)
        .initial_map_size(4096)
        .max_map_size(1024 * 1024)
        .build();
    let db = WriteBackCache::new(MappedDb::open(&bounded).unwrap(), CacheLimit::Disabled);

    for i in 0..2000u32 {
        let mut value = vec![0u8; 1024];
        value[..4].copy_from_slice(&i.to_le_bytes());
        db.write(Index::Main, b"best", &value).unwrap();
    }
    assert_eq!(db.pending_bytes(), 4 + 1024);

    db.flush(None).unwrap();
    let best = db.inner().get(Index::Main, b"best").unwrap().unwrap();
    assert_eq!(&best[..4], &1999u32.to_le_bytes());
}

#[test]
fn test_write_back_threshold_ignores_replaced_values() {
    // One key rewritten far past the limit never grows the buffer
    let (_temp, db) = setup_write_back(CacheLimit::Bytes(100));
    for i in 0..50u32 {
        db.write(Index::Main, b"best", &[i as u8; 40]).unwrap();
    }
    assert_eq!(db.flush_count(), 0);
    assert_eq!(db.pending_bytes(), 4 + 40);

    db.erase_all(Index::Main, b"best").unwrap();
    assert_eq!(db.pending_bytes(), 4);
}

#[test]
fn test_write_back_committed_transaction_sizes() {
    let (_temp, db) = setup_write_back(CacheLimit::Disabled);
    db.write(Index::Main, b"k", &[1u8; 100]).unwrap();

    db.begin_transaction(None).unwrap();
    db.write(Index::Main, b"k", &[2u8; 10]).unwrap();
    db.write(Index::Ntp1TokenNames, b"t", b"ab").unwrap();
    db.commit_transaction().unwrap();

    assert_eq!(db.pending_bytes(), (1 + 10) + (1 + 2));
}

#[test]
fn test_write_back_flush_uses_one_inner_transaction() {
    let (_temp, db) = setup_write_back(CacheLimit::Disabled);
    for i in 0..50u32 {
        db.write(Index::Tx, &i.to_be_bytes(), b"x").unwrap();
    }
    db.flush(None).unwrap();

    assert_eq!(db.inner().stats().unwrap().last_txn_id, 1);
}

// =============================================================================
// LRU Tests
// =============================================================================

#[test]
fn test_lru_weight_never_exceeds_capacity() {
    let capacity = 2_000;
    let (_temp, db) = setup_lru(CacheLimit::Bytes(capacity));
    let oracle = InMemoryDb::new();
    let mut rng = seeded_rng(31);

    for _ in 0..500 {
        let key = random_bytes(&mut rng, 1, 2);
        let value = random_bytes(&mut rng, 1, 120);
        if rng.gen_bool(0.8) {
            db.write(Index::Ntp1TokenNames, &key, &value).unwrap();
            oracle.write(Index::Ntp1TokenNames, &key, &value).unwrap();
        } else {
            assert_eq!(
                db.read_multiple(Index::Ntp1TokenNames, &key).unwrap(),
                oracle.read_multiple(Index::Ntp1TokenNames, &key).unwrap()
            );
        }
        assert!(db.resident_weight() <= capacity);
    }

    assert!(db.evictions() > 0);
    assert_same_contents(&db, &oracle, "lru");
}

#[test]
fn test_lru_evicted_entries_reach_inner_store() {
    let (_temp, db) = setup_lru(CacheLimit::Bytes(300));
    let mut expected = BTreeMap::new();
    for i in 0..40u32 {
        let key = i.to_be_bytes().to_vec();
        db.write(Index::Blocks, &key, &[i as u8; 50]).unwrap();
        expected.insert(key, vec![i as u8; 50]);
    }

    let resident = db.resident_len();
    assert!(resident < 40);
    let in_inner = db.inner().read_all_unique(Index::Blocks).unwrap();
    assert_eq!(in_inner.len(), 40 - db.dirty_len());
    for (key, value) in &in_inner {
        assert_eq!(&expected[key], value);
    }

    db.flush(None).unwrap();
    assert_eq!(db.inner().read_all_unique(Index::Blocks).unwrap(), expected);
}

#[test]
fn test_lru_transaction_commit_marks_dirty() {
    let (_temp, db) = setup_lru(CacheLimit::Disabled);

    db.begin_transaction(None).unwrap();
    db.write(Index::Main, b"a", b"1").unwrap();
    db.write(Index::Ntp1TokenNames, b"t", b"x").unwrap();
    assert_eq!(db.dirty_len(), 0);
    db.commit_transaction().unwrap();

    assert_eq!(db.dirty_len(), 2);
    assert!(!db.inner().exists(Index::Main, b"a").unwrap());
    db.flush(None).unwrap();
    assert_eq!(db.dirty_len(), 0);
    assert!(db.inner().exists(Index::Main, b"a").unwrap());
}

#[test]
fn test_lru_close_writes_dirty_entries() {
    let temp_dir = TempDir::new().unwrap();
    {
        let inner = MappedDb::open(&test_config(temp_dir.path())).unwrap();
        let db = LruCache::new(inner, CacheLimit::Disabled);
        db.write(Index::Main, b"k", b"v").unwrap();
    }

    let config = nodestore::Config::builder().data_dir(temp_dir.path()).build();
    let db = MappedDb::open(&config).unwrap();
    assert_eq!(db.get(Index::Main, b"k").unwrap(), Some(b"v".to_vec()));
}

// =============================================================================
// Big Flush Tests
// =============================================================================

#[test]
fn test_big_write_back_flush() {
    let (_temp, db) = setup_write_back(CacheLimit::Disabled);
    check_big_flush(&db, 1 << 20);
}

#[test]
fn test_big_read_cache_flush() {
    let temp_dir = TempDir::new().unwrap();
    let inner = MappedDb::open(&test_config(temp_dir.path())).unwrap();
    let db = ReadCache::new(inner, CacheLimit::Disabled);
    check_big_flush(&db, 1 << 18);
}

#[test]
fn test_big_lru_flush() {
    let (_temp, db) = setup_lru(CacheLimit::Disabled);
    check_big_flush(&db, 1 << 20);
}

#[test]
fn test_big_lru_with_read_cache_flush() {
    let temp_dir = TempDir::new().unwrap();
    let inner = MappedDb::open(&test_config(temp_dir.path())).unwrap();
    let db = LruCache::new(ReadCache::new(inner, CacheLimit::Disabled), CacheLimit::Disabled);
    check_big_flush(&db, 1 << 20);
}

// =============================================================================
// Composition Tests
// =============================================================================

#[test]
fn test_lru_over_write_back() {
    let db = LruCache::new(
        WriteBackCache::new(InMemoryDb::new(), CacheLimit::Bytes(256)),
        CacheLimit::Bytes(128),
    );
    let oracle = InMemoryDb::new();
    fill_random(&db, &oracle, 41, 8 * 1024);

    assert_same_contents(&db, &oracle, "lru over write-back");
    assert!(db.inner().flush_count() > 0);
}

#[test]
fn test_boxed_stack_is_injectable() {
    let inner: Box<dyn Db> = Box::new(InMemoryDb::new());
    let db = ReadCache::new(inner, CacheLimit::Disabled);
    db.write(Index::Main, b"k", b"v").unwrap();
    assert_eq!(db.inner().get(Index::Main, b"k").unwrap(), Some(b"v".to_vec()));
}

#[test]
fn test_open_stack_kinds() {
    for kind in StackKind::ALL {
        let temp_dir = TempDir::new().unwrap();
        let db = open_stack(kind, &test_config(temp_dir.path())).unwrap();
        let oracle = InMemoryDb::new();
        fill_random(db.as_ref(), &oracle, 51, 16 * 1024);

        assert_same_contents(db.as_ref(), &oracle, kind.as_str());
        db.close().unwrap();
    }
}
