//! Read cache
//!
//! Remembers the full value list of every key read through it. An empty
//! list records that the key was absent. Writes go straight to the inner
//! store and drop the cached entry of their key.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error};

use crate::config::CacheLimit;
use crate::db::{check_erasable, slice_value, Db, MultiMap};
use crate::error::{Result, StoreError};
use crate::index::Index;

use super::{load_values, values_weight};

pub struct ReadCache<D: Db> {
    inner: D,
    limit: CacheLimit,
    state: Mutex<ReadState>,
    flushes: AtomicU64,
}

#[derive(Default)]
struct ReadState {
    entries: [HashMap<Vec<u8>, Vec<Bytes>>; Index::COUNT],
    /// Bytes of cached keys and values
    size: u64,
    hits: u64,
    misses: u64,
    closed: bool,
}

impl ReadState {
    fn invalidate(&mut self, index: Index, key: &[u8]) {
        if let Some(values) = self.entries[index.slot()].remove(key) {
            self.size -= key.len() as u64 + values_weight(&values);
        }
    }

    fn clear(&mut self) {
        for table in self.entries.iter_mut() {
            table.clear();
        }
        self.size = 0;
    }
}

impl<D: Db> ReadCache<D> {
    pub fn new(inner: D, limit: CacheLimit) -> Self {
        Self {
            inner,
            limit,
            state: Mutex::new(ReadState::default()),
            flushes: AtomicU64::new(0),
        }
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }

    /// Number of cached keys, absences included
    pub fn cached_len(&self) -> usize {
        self.state.lock().entries.iter().map(HashMap::len).sum()
    }

    /// Lookups answered from the cache
    pub fn hits(&self) -> u64 {
        self.state.lock().hits
    }

    /// Lookups forwarded to the inner store
    pub fn misses(&self) -> u64 {
        self.state.lock().misses
    }

    fn live(&self) -> Result<MutexGuard<'_, ReadState>> {
        let state = self.state.lock();
        if state.closed {
            return Err(StoreError::Closed);
        }
        Ok(state)
    }

    fn lookup(&self, index: Index, key: &[u8]) -> Result<Vec<Bytes>> {
        let mut state = self.live()?;
        if let Some(values) = state.entries[index.slot()].get(key) {
            let values = values.clone();
            state.hits += 1;
            return Ok(values);
        }

        state.misses += 1;
        let values = load_values(&self.inner, index, key)?;
        let weight = key.len() as u64 + values_weight(&values);
        if let CacheLimit::Bytes(limit) = self.limit {
            if weight > limit {
                return Ok(values);
            }
            if state.size + weight > limit {
                debug!(
                    entries = state.entries.iter().map(HashMap::len).sum::<usize>(),
                    bytes = state.size,
                    "Read cache full, dropping entries"
                );
                state.clear();
            }
        }
        state.entries[index.slot()].insert(key.to_vec(), values.clone());
        state.size += weight;
        Ok(values)
    }
}

impl<D: Db> Db for ReadCache<D> {
    fn write(&self, index: Index, key: &[u8], value: &[u8]) -> Result<()> {
        let mut state = self.live()?;
        state.invalidate(index, key);
        self.inner.write(index, key, value)
    }

    fn read(
        &self,
        index: Index,
        key: &[u8],
        offset: usize,
        size: Option<usize>,
    ) -> Result<Option<Vec<u8>>> {
        Ok(self
            .lookup(index, key)?
            .first()
            .map(|v| slice_value(v, offset, size)))
    }

    fn exists(&self, index: Index, key: &[u8]) -> Result<bool> {
        Ok(!self.lookup(index, key)?.is_empty())
    }

    fn erase(&self, index: Index, key: &[u8]) -> Result<()> {
        check_erasable(index)?;
        self.erase_all(index, key)
    }

    fn erase_all(&self, index: Index, key: &[u8]) -> Result<()> {
        let mut state = self.live()?;
        state.invalidate(index, key);
        self.inner.erase_all(index, key)
    }

    fn read_multiple(&self, index: Index, key: &[u8]) -> Result<Vec<Vec<u8>>> {
        Ok(self
            .lookup(index, key)?
            .iter()
            .map(|v| v.to_vec())
            .collect())
    }

    fn read_all(&self, index: Index) -> Result<MultiMap> {
        let _state = self.live()?;
        self.inner.read_all(index)
    }

    fn begin_transaction(&self, size_hint: Option<u64>) -> Result<()> {
        let _state = self.live()?;
        self.inner.begin_transaction(size_hint)
    }

    fn commit_transaction(&self) -> Result<()> {
        let _state = self.live()?;
        self.inner.commit_transaction()
    }

    /// Cached entries may reflect aborted writes, so all of them go
    fn abort_transaction(&self) -> Result<()> {
        let mut state = self.live()?;
        self.inner.abort_transaction()?;
        state.clear();
        Ok(())
    }

    fn flush(&self, size_hint: Option<u64>) -> Result<()> {
        let _state = self.live()?;
        self.inner.flush(size_hint)?;
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::SeqCst)
    }

    fn clear_cache(&self) -> Result<()> {
        let mut state = self.live()?;
        state.clear();
        self.inner.clear_cache()
    }

    fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        state.clear();
        state.closed = true;
        drop(state);
        self.inner.close()
    }
}

impl<D: Db> Drop for ReadCache<D> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(error = %e, "Failed to close read cache");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryDb;

    #[test]
    fn test_absence_is_cached() {
        let db = ReadCache::new(InMemoryDb::new(), CacheLimit::Disabled);
        assert_eq!(db.get(Index::Tx, b"k").unwrap(), None);

        // Bypass the cache: the cached absence still answers
        db.inner().write(Index::Tx, b"k", b"v").unwrap();
        assert_eq!(db.get(Index::Tx, b"k").unwrap(), None);
        assert_eq!(db.hits(), 1);

        db.clear_cache().unwrap();
        assert_eq!(db.get(Index::Tx, b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_write_invalidates_entry() {
        let db = ReadCache::new(InMemoryDb::new(), CacheLimit::Disabled);
        db.write(Index::Main, b"k", b"v1").unwrap();
        assert_eq!(db.get(Index::Main, b"k").unwrap(), Some(b"v1".to_vec()));

        db.write(Index::Main, b"k", b"v2").unwrap();
        assert_eq!(db.get(Index::Main, b"k").unwrap(), Some(b"v2".to_vec()));
        assert_eq!(db.misses(), 2);
    }

    #[test]
    fn test_limit_bounds_cached_bytes() {
        let db = ReadCache::new(InMemoryDb::new(), CacheLimit::Bytes(8));
        for key in [b"a", b"b", b"c", b"d"] {
            db.write(Index::Main, key, b"12345").unwrap();
            db.get(Index::Main, key).unwrap();
        }
        assert!(db.cached_len() <= 1);
        assert_eq!(db.get(Index::Main, b"a").unwrap(), Some(b"12345".to_vec()));
    }

    #[test]
    fn test_abort_drops_transactional_reads() {
        let db = ReadCache::new(InMemoryDb::new(), CacheLimit::Disabled);
        db.begin_transaction(None).unwrap();
        db.write(Index::Main, b"k", b"v").unwrap();
        assert!(db.exists(Index::Main, b"k").unwrap());
        db.abort_transaction().unwrap();

        assert!(!db.exists(Index::Main, b"k").unwrap());
    }
}
