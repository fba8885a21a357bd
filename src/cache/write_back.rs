//! Write-back cache
//!
//! Writes and erasures land in a pending overlay; reads merge it over the
//! inner store. The overlay is pushed down inside one inner transaction
//! when it grows past the configured limit or on `flush`/`close`.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error, warn};

use crate::config::CacheLimit;
use crate::db::{check_erasable, slice_value, Db, MultiMap};
use crate::error::{Result, StoreError};
use crate::index::Index;
use crate::overlay::{resolve_layers, Overlay};

use super::load_values;

pub struct WriteBackCache<D: Db> {
    inner: D,
    limit: CacheLimit,
    state: Mutex<WriteBackState>,
    flushes: AtomicU64,
}

#[derive(Default)]
struct WriteBackState {
    /// Changes not yet in the inner store
    pending: Overlay,
    /// Open transaction, folded into `pending` on commit
    txn: Option<Overlay>,
    closed: bool,
}

impl WriteBackState {
    /// Where a change goes right now
    fn target(&mut self) -> &mut Overlay {
        self.txn.as_mut().unwrap_or(&mut self.pending)
    }
}

impl<D: Db> WriteBackCache<D> {
    pub fn new(inner: D, limit: CacheLimit) -> Self {
        Self {
            inner,
            limit,
            state: Mutex::new(WriteBackState::default()),
            flushes: AtomicU64::new(0),
        }
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }

    pub fn limit(&self) -> CacheLimit {
        self.limit
    }

    /// Bytes of keys and values waiting for the next flush
    pub fn pending_bytes(&self) -> u64 {
        self.state.lock().pending.size_bytes()
    }

    fn live(&self) -> Result<MutexGuard<'_, WriteBackState>> {
        let state = self.state.lock();
        if state.closed {
            return Err(StoreError::Closed);
        }
        Ok(state)
    }

    fn resolved(&self, index: Index, key: &[u8]) -> Result<Vec<bytes::Bytes>> {
        let state = self.live()?;
        let layers = [
            state.pending.get(index, key),
            state.txn.as_ref().and_then(|t| t.get(index, key)),
        ];
        resolve_layers(&layers, || load_values(&self.inner, index, key))
    }

    fn flush_if_over_limit(&self, state: &mut WriteBackState) -> Result<()> {
        if state.txn.is_none() && self.limit.is_exceeded_by(state.pending.size_bytes()) {
            self.push_pending(state, None)?;
            self.flushes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Move the pending overlay into the inner store; on failure it stays
    /// pending
    fn push_pending(&self, state: &mut WriteBackState, size_hint: Option<u64>) -> Result<()> {
        if state.pending.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut state.pending);
        let bytes = pending.size_bytes();
        if let Err(e) = self.replay(&pending, size_hint.unwrap_or(bytes)) {
            state.pending = pending;
            return Err(e);
        }
        debug!(keys = pending.len(), bytes, "Flushed write-back cache");
        Ok(())
    }

    fn replay(&self, pending: &Overlay, size_hint: u64) -> Result<()> {
        self.inner.begin_transaction(Some(size_hint))?;
        if let Err(e) = pending.replay_into(&self.inner) {
            if let Err(abort_err) = self.inner.abort_transaction() {
                error!(error = %abort_err, "Failed to abort inner transaction after flush error");
            }
            return Err(e);
        }
        self.inner.commit_transaction()
    }
}

impl<D: Db> Db for WriteBackCache<D> {
    fn write(&self, index: Index, key: &[u8], value: &[u8]) -> Result<()> {
        let mut state = self.live()?;
        state.target().write(index, key, value);
        self.flush_if_over_limit(&mut state)
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
        let mut state = self.live()?;
        state.target().erase_all(index, key);
        self.flush_if_over_limit(&mut state)
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
        state.pending.apply_to_map(index, &mut all);
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

    fn commit_transaction(&self) -> Result<()> {
        let mut state = self.live()?;
        let txn = state.txn.take().ok_or(StoreError::NoTransaction)?;
        state.pending.absorb(txn);
        self.flush_if_over_limit(&mut state)
    }

    fn abort_transaction(&self) -> Result<()> {
        let mut state = self.live()?;
        state.txn.take().ok_or(StoreError::NoTransaction)?;
        Ok(())
    }

    /// Push pending changes down and sync the inner store. An open
    /// transaction stays in this layer.
    fn flush(&self, size_hint: Option<u64>) -> Result<()> {
        let mut state = self.live()?;
        self.push_pending(&mut state, size_hint)?;
        self.inner.flush(size_hint)?;
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::SeqCst)
    }

    /// Pending changes are the only copy of their data and are kept
    fn clear_cache(&self) -> Result<()> {
        let _state = self.live()?;
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
        self.push_pending(&mut state, None)?;
        state.closed = true;
        drop(state);
        self.inner.close()
    }
}

impl<D: Db> Drop for WriteBackCache<D> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(error = %e, "Failed to close write-back cache");
        }
    }
}
