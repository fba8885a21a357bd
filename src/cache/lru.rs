//! LRU cache
//!
//! Keeps the resolved value list of recently used keys, bounded by total
//! weight (key plus value bytes). Writes stay resident as dirty entries.
//! When the weight passes capacity the least recently used entries are
//! evicted, and the dirty ones among them are written to the inner store
//! in one transaction first, so nothing is dropped before it is stored
//! underneath.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error, warn};

use crate::config::CacheLimit;
use crate::db::{check_erasable, slice_value, Db, MultiMap};
use crate::error::{Result, StoreError};
use crate::index::Index;
use crate::overlay::{resolve_layers, Overlay};

use super::{load_values, values_weight};

pub struct LruCache<D: Db> {
    inner: D,
    capacity: CacheLimit,
    state: Mutex<LruState>,
    flushes: AtomicU64,
    evictions: AtomicU64,
}

#[derive(Debug)]
struct Entry {
    values: Vec<Bytes>,
    /// Not yet written to the inner store
    dirty: bool,
    weight: u64,
    tick: u64,
}

#[derive(Default)]
struct LruState {
    entries: [HashMap<Vec<u8>, Entry>; Index::COUNT],
    /// Recency order: oldest tick first
    recency: BTreeMap<u64, (Index, Vec<u8>)>,
    tick: u64,
    weight: u64,
    txn: Option<Overlay>,
    closed: bool,
}

impl LruState {
    /// Resident values of `key`, marking it most recently used
    fn touch(&mut self, index: Index, key: &[u8]) -> Option<Vec<Bytes>> {
        let entry = self.entries[index.slot()].get_mut(key)?;
        self.recency.remove(&entry.tick);
        self.tick += 1;
        entry.tick = self.tick;
        self.recency.insert(self.tick, (index, key.to_vec()));
        Some(entry.values.clone())
    }

    fn put(&mut self, index: Index, key: &[u8], values: Vec<Bytes>, dirty: bool) {
        let weight = key.len() as u64 + values_weight(&values);
        self.tick += 1;
        let tick = self.tick;

        let table = &mut self.entries[index.slot()];
        match table.get_mut(key) {
            Some(entry) => {
                self.recency.remove(&entry.tick);
                self.weight -= entry.weight;
                entry.values = values;
                entry.dirty = entry.dirty || dirty;
                entry.weight = weight;
                entry.tick = tick;
            }
            None => {
                table.insert(
                    key.to_vec(),
                    Entry {
                        values,
                        dirty,
                        weight,
                        tick,
                    },
                );
            }
        }
        self.weight += weight;
        self.recency.insert(tick, (index, key.to_vec()));
    }

    /// Put back an evicted entry with its original recency
    fn restore(&mut self, index: Index, key: Vec<u8>, entry: Entry) {
        self.weight += entry.weight;
        self.recency.insert(entry.tick, (index, key.clone()));
        self.entries[index.slot()].insert(key, entry);
    }

    fn remove(&mut self, index: Index, key: &[u8]) -> Option<Entry> {
        let entry = self.entries[index.slot()].remove(key)?;
        self.recency.remove(&entry.tick);
        self.weight -= entry.weight;
        Some(entry)
    }

    fn dirty(&self) -> Vec<(Index, &[u8], &[Bytes])> {
        Index::ALL
            .into_iter()
            .flat_map(move |index| {
                self.entries[index.slot()]
                    .iter()
                    .filter(|(_, e)| e.dirty)
                    .map(move |(k, e)| (index, k.as_slice(), e.values.as_slice()))
            })
            .collect()
    }
}

impl<D: Db> LruCache<D> {
    pub fn new(inner: D, capacity: CacheLimit) -> Self {
        Self {
            inner,
            capacity,
            state: Mutex::new(LruState::default()),
            flushes: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }

    pub fn capacity(&self) -> CacheLimit {
        self.capacity
    }

    /// Total weight of resident entries
    pub fn resident_weight(&self) -> u64 {
        self.state.lock().weight
    }

    pub fn resident_len(&self) -> usize {
        self.state.lock().entries.iter().map(HashMap::len).sum()
    }

    pub fn dirty_len(&self) -> usize {
        self.state.lock().dirty().len()
    }

    /// Entries evicted since construction
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::SeqCst)
    }

    fn live(&self) -> Result<MutexGuard<'_, LruState>> {
        let state = self.state.lock();
        if state.closed {
            return Err(StoreError::Closed);
        }
        Ok(state)
    }

    /// Committed values of `key`, loading them from the inner store on a miss
    fn load(&self, state: &mut LruState, index: Index, key: &[u8]) -> Result<Vec<Bytes>> {
        if let Some(values) = state.touch(index, key) {
            return Ok(values);
        }
        let values = load_values(&self.inner, index, key)?;
        state.put(index, key, values.clone(), false);
        Ok(values)
    }

    fn resolved(&self, index: Index, key: &[u8]) -> Result<Vec<Bytes>> {
        let mut state = self.live()?;
        let pending = state.txn.as_ref().and_then(|t| t.get(index, key)).cloned();
        let values = resolve_layers(&[pending.as_ref()], || self.load(&mut state, index, key))?;
        self.evict(&mut state)?;
        Ok(values)
    }

    /// Evict least recently used entries until the weight fits capacity
    fn evict(&self, state: &mut LruState) -> Result<()> {
        let CacheLimit::Bytes(capacity) = self.capacity else {
            return Ok(());
        };

        let mut victims = Vec::new();
        while state.weight > capacity {
            let Some((_, (index, key))) = state.recency.pop_first() else {
                break;
            };
            if let Some(entry) = state.entries[index.slot()].remove(&key) {
                state.weight -= entry.weight;
                victims.push((index, key, entry));
            }
        }
        if victims.is_empty() {
            return Ok(());
        }

        let dirty: Vec<(Index, &[u8], &[Bytes])> = victims
            .iter()
            .filter(|(_, _, e)| e.dirty)
            .map(|(i, k, e)| (*i, k.as_slice(), e.values.as_slice()))
            .collect();
        let written = dirty.len();
        if let Err(e) = self.write_through(&dirty) {
            drop(dirty);
            for (index, key, entry) in victims {
                state.restore(index, key, entry);
            }
            return Err(e);
        }

        self.evictions.fetch_add(victims.len() as u64, Ordering::SeqCst);
        debug!(
            evicted = victims.len(),
            written,
            resident_weight = state.weight,
            "Evicted LRU entries"
        );
        Ok(())
    }

    /// Store full value lists in the inner store inside one transaction
    fn write_through(&self, dirty: &[(Index, &[u8], &[Bytes])]) -> Result<()> {
        if dirty.is_empty() {
            return Ok(());
        }
        let bytes: u64 = dirty
            .iter()
            .map(|(_, k, vs)| k.len() as u64 + values_weight(vs))
            .sum();

        self.inner.begin_transaction(Some(bytes))?;
        let result = dirty.iter().try_for_each(|&(index, key, values)| {
            // A unique-key write replaces on its own
            if index.duplicate_keys_allowed() || values.is_empty() {
                self.inner.erase_all(index, key)?;
            }
            values
                .iter()
                .try_for_each(|value| self.inner.write(index, key, value))
        });
        if let Err(e) = result {
            if let Err(abort_err) = self.inner.abort_transaction() {
                error!(error = %abort_err, "Failed to abort inner transaction after write-through error");
            }
            return Err(e);
        }
        self.inner.commit_transaction()
    }

    /// Write every dirty entry through and mark it clean
    fn write_back_all(&self, state: &mut LruState) -> Result<usize> {
        let written = {
            let dirty = state.dirty();
            self.write_through(&dirty)?;
            dirty.len()
        };
        for table in state.entries.iter_mut() {
            for entry in table.values_mut() {
                entry.dirty = false;
            }
        }
        Ok(written)
    }

    /// Full value list of every key an overlay touches
    fn resolve_overlay(
        &self,
        state: &mut LruState,
        overlay: &Overlay,
    ) -> Result<Vec<(Index, Vec<u8>, Vec<Bytes>)>> {
        overlay
            .iter()
            .map(|(index, key, pending)| {
                let base = if pending.cleared {
                    Vec::new()
                } else {
                    match state.touch(index, key) {
                        Some(values) => values,
                        None => load_values(&self.inner, index, key)?,
                    }
                };
                Ok((index, key.to_vec(), pending.resolve(&base)))
            })
            .collect()
    }

    fn mutate(&self, index: Index, key: &[u8], f: impl FnOnce(&mut Overlay)) -> Result<()> {
        let mut state = self.live()?;
        if let Some(txn) = state.txn.as_mut() {
            f(txn);
            return Ok(());
        }

        let mut change = Overlay::default();
        f(&mut change);
        if let Some(pending) = change.get(index, key) {
            let values = resolve_layers(&[Some(pending)], || self.load(&mut state, index, key))?;
            state.put(index, key, values, true);
        }
        self.evict(&mut state)
    }
}

impl<D: Db> Db for LruCache<D> {
    fn write(&self, index: Index, key: &[u8], value: &[u8]) -> Result<()> {
        self.mutate(index, key, |o| o.write(index, key, value))
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
        self.mutate(index, key, |o| o.erase_all(index, key))
    }

    fn read_multiple(&self, index: Index, key: &[u8]) -> Result<Vec<Vec<u8>>> {
        Ok(self
            .resolved(index, key)?
            .iter()
            .map(|v| v.to_vec())
            .collect())
    }

    fn read_all(&self, index: Index) -> Result<MultiMap> {
        let state = self.live()?;
        let mut all = self.inner.read_all(index)?;
        for (key, entry) in state.entries[index.slot()].iter().filter(|(_, e)| e.dirty) {
            if entry.values.is_empty() {
                all.remove(key);
            } else {
                all.insert(key.clone(), entry.values.iter().map(|v| v.to_vec()).collect());
            }
        }
        if let Some(txn) = &state.txn {
            txn.apply_to_map(index, &mut all);
        }
        Ok(all)
    }

    fn begin_transaction(&self, _size_hint: Option<u64>) -> Result<()> {
        let mut state = self.live()?;
        if state.txn.is_some() {
            return Err(StoreError::TransactionAlreadyOpen);
        }
        state.txn = Some(Overlay::default());
        Ok(())
    }

    /// Resolve every touched key first, then store the results as dirty
    /// entries in one step
    fn commit_transaction(&self) -> Result<()> {
        let mut state = self.live()?;
        let txn = state.txn.take().ok_or(StoreError::NoTransaction)?;

        let resolved = match self.resolve_overlay(&mut state, &txn) {
            Ok(resolved) => resolved,
            Err(e) => {
                state.txn = Some(txn);
                return Err(e);
            }
        };

        for (index, key, values) in resolved {
            state.put(index, &key, values, true);
        }
        self.evict(&mut state)
    }

    fn abort_transaction(&self) -> Result<()> {
        let mut state = self.live()?;
        state.txn.take().ok_or(StoreError::NoTransaction)?;
        Ok(())
    }

    fn flush(&self, size_hint: Option<u64>) -> Result<()> {
        let mut state = self.live()?;
        let written = self.write_back_all(&mut state)?;
        self.inner.flush(size_hint)?;
        self.flushes.fetch_add(1, Ordering::SeqCst);
        debug!(written, resident_weight = state.weight, "Flushed LRU cache");
        Ok(())
    }

    fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::SeqCst)
    }

    /// Drop clean entries; dirty ones are the only copy of their data
    fn clear_cache(&self) -> Result<()> {
        let mut state = self.live()?;
        let entries = &state.entries;
        let clean: Vec<(Index, Vec<u8>)> = Index::ALL
            .into_iter()
            .flat_map(move |index| {
                entries[index.slot()]
                    .iter()
                    .filter(|(_, e)| !e.dirty)
                    .map(move |(k, _)| (index, k.clone()))
            })
            .collect();
        for (index, key) in clean {
            state.remove(index, &key);
        }
        drop(state);
        self.inner.clear_cache()
    }

    fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        if state.txn.take().is_some() {
            warn!("Discarding open transaction on close");
        }
        self.write_back_all(&mut state)?;
        *state = LruState {
            closed: true,
            ..LruState::default()
        };
        drop(state);
        self.inner.close()
    }
}

impl<D: Db> Drop for LruCache<D> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(error = %e, "Failed to close LRU cache");
        }
    }
}
