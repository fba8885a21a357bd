//! Reference Backend
//!
//! In-process ordered tables with no persistence. Every other store must
//! produce the same results as this one for the same operation sequence,
//! which makes it the oracle of the test suites.

use bytes::Bytes;
use parking_lot::RwLock;

use crate::db::{check_erasable, Db, MultiMap};
use crate::error::{Result, StoreError};
use crate::index::Index;
use crate::overlay::{resolve_layers, Overlay};
use crate::tables::Tables;

/// In-memory store
pub struct InMemoryDb {
    state: RwLock<MemoryState>,
}

struct MemoryState {
    tables: Tables,
    /// Open transaction, if any
    txn: Option<Overlay>,
    closed: bool,
}

impl MemoryState {
    fn live(&self) -> Result<()> {
        if self.closed {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn resolved(&self, index: Index, key: &[u8]) -> Vec<Bytes> {
        let layers = [self.txn.as_ref().and_then(|t| t.get(index, key))];
        // Loading from committed tables cannot fail
        resolve_layers(&layers, || Ok(self.tables.values(index, key).to_vec()))
            .unwrap_or_default()
    }

    fn mutate(&mut self, f: impl FnOnce(&mut Overlay)) -> Result<()> {
        self.live()?;
        match self.txn.as_mut() {
            Some(txn) => f(txn),
            None => {
                let mut overlay = Overlay::default();
                f(&mut overlay);
                self.tables.apply(&overlay);
            }
        }
        Ok(())
    }
}

impl InMemoryDb {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState {
                tables: Tables::default(),
                txn: None,
                closed: false,
            }),
        }
    }
}

impl Default for InMemoryDb {
    fn default() -> Self {
        Self::new()
    }
}

impl Db for InMemoryDb {
    fn write(&self, index: Index, key: &[u8], value: &[u8]) -> Result<()> {
        self.state.write().mutate(|o| o.write(index, key, value))
    }

    fn read(
        &self,
        index: Index,
        key: &[u8],
        offset: usize,
        size: Option<usize>,
    ) -> Result<Option<Vec<u8>>> {
        let state = self.state.read();
        state.live()?;
        Ok(state
            .resolved(index, key)
            .first()
            .map(|v| crate::db::slice_value(v, offset, size)))
    }

    fn exists(&self, index: Index, key: &[u8]) -> Result<bool> {
        let state = self.state.read();
        state.live()?;
        Ok(!state.resolved(index, key).is_empty())
    }

    fn erase(&self, index: Index, key: &[u8]) -> Result<()> {
        check_erasable(index)?;
        self.erase_all(index, key)
    }

    fn erase_all(&self, index: Index, key: &[u8]) -> Result<()> {
        self.state.write().mutate(|o| o.erase_all(index, key))
    }

    fn read_multiple(&self, index: Index, key: &[u8]) -> Result<Vec<Vec<u8>>> {
        let state = self.state.read();
        state.live()?;
        Ok(state
            .resolved(index, key)
            .iter()
            .map(|v| v.to_vec())
            .collect())
    }

    fn read_all(&self, index: Index) -> Result<MultiMap> {
        let state = self.state.read();
        state.live()?;
        let mut all = state.tables.read_all(index);
        if let Some(txn) = &state.txn {
            txn.apply_to_map(index, &mut all);
        }
        Ok(all)
    }

    fn begin_transaction(&self, _size_hint: Option<u64>) -> Result<()> {
        let mut state = self.state.write();
        state.live()?;
        if state.txn.is_some() {
            return Err(StoreError::TransactionAlreadyOpen);
        }
        state.txn = Some(Overlay::default());
        Ok(())
    }

    fn commit_transaction(&self) -> Result<()> {
        let mut state = self.state.write();
        state.live()?;
        let txn = state.txn.take().ok_or(StoreError::NoTransaction)?;
        state.tables.apply(&txn);
        Ok(())
    }

    fn abort_transaction(&self) -> Result<()> {
        let mut state = self.state.write();
        state.live()?;
        state.txn.take().ok_or(StoreError::NoTransaction)?;
        Ok(())
    }

    fn flush(&self, _size_hint: Option<u64>) -> Result<()> {
        self.state.read().live()
    }

    fn close(&self) -> Result<()> {
        let mut state = self.state.write();
        if !state.closed {
            state.tables.clear();
            state.txn = None;
            state.closed = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_discards_everything() {
        let db = InMemoryDb::new();
        db.write(Index::Main, b"k", b"v").unwrap();
        db.close().unwrap();
        db.close().unwrap();
        assert!(matches!(db.get(Index::Main, b"k"), Err(StoreError::Closed)));
    }

    #[test]
    fn test_transaction_overlay_is_private_until_commit() {
        let db = InMemoryDb::new();
        db.write(Index::Ntp1TokenNames, b"k", b"v1").unwrap();
        db.begin_transaction(None).unwrap();
        db.write(Index::Ntp1TokenNames, b"k", b"v2").unwrap();
        assert_eq!(
            db.read_multiple(Index::Ntp1TokenNames, b"k").unwrap(),
            vec![b"v1".to_vec(), b"v2".to_vec()]
        );
        db.abort_transaction().unwrap();
        assert_eq!(
            db.read_multiple(Index::Ntp1TokenNames, b"k").unwrap(),
            vec![b"v1".to_vec()]
        );
    }
}
