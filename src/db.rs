//! Shared store contract
//!
//! Every backend and every cache layer implements [`Db`], so they are
//! interchangeable and stack freely: a cache layer takes any `D: Db` as its
//! inner store, including another cache layer or a `Box<dyn Db>`.
//!
//! ## Table kinds
//! - Unique-key tables keep one value per key; `write` overwrites.
//! - Duplicate-key tables keep an ordered list per key; `write` appends.
//!
//! ## Transactions
//! At most one transaction is open per store instance. Writes issued inside
//! it are visible to reads through the same instance, `commit` applies them
//! atomically and `abort` restores the exact previous state.

use std::collections::BTreeMap;

use crate::error::{Result, StoreError};
use crate::index::Index;

/// Every key of a table with all of its values, in write order
pub type MultiMap = BTreeMap<Vec<u8>, Vec<Vec<u8>>>;

/// Every key of a table with one of its values
pub type UniqueMap = BTreeMap<Vec<u8>, Vec<u8>>;

/// The store contract
///
/// All methods take `&self`; implementations serialize mutation internally.
pub trait Db: Send + Sync {
    /// Store `value` under `key`: overwrite in a unique-key table, append in
    /// a duplicate-key table
    fn write(&self, index: Index, key: &[u8], value: &[u8]) -> Result<()>;

    /// Read `size` bytes of the value starting at `offset` (the remainder if
    /// `size` is `None`), clamped to the stored length.
    ///
    /// Returns `Ok(None)` when the key has no value. In a duplicate-key table
    /// the first value in write order is read.
    fn read(&self, index: Index, key: &[u8], offset: usize, size: Option<usize>)
        -> Result<Option<Vec<u8>>>;

    /// Read the whole value
    fn get(&self, index: Index, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.read(index, key, 0, None)
    }

    /// Whether at least one value is stored under `key`
    fn exists(&self, index: Index, key: &[u8]) -> Result<bool>;

    /// Remove the value of `key` in a unique-key table.
    ///
    /// Fails with `InvalidIndex` on a duplicate-key table; use `erase_all`.
    fn erase(&self, index: Index, key: &[u8]) -> Result<()>;

    /// Remove every value of `key`. Erasing a missing key is not an error.
    fn erase_all(&self, index: Index, key: &[u8]) -> Result<()>;

    /// All values of `key` in write order, empty if the key is missing
    fn read_multiple(&self, index: Index, key: &[u8]) -> Result<Vec<Vec<u8>>>;

    /// Every key of the table with its values
    fn read_all(&self, index: Index) -> Result<MultiMap>;

    /// Every key of the table with one of its values. Which value is picked
    /// for a duplicate-key table is unspecified.
    fn read_all_unique(&self, index: Index) -> Result<UniqueMap> {
        Ok(pick_unique(self.read_all(index)?))
    }

    /// Open the store's single transaction. `size_hint` is the expected
    /// number of bytes to be written; backends may pre-allocate with it.
    fn begin_transaction(&self, size_hint: Option<u64>) -> Result<()>;

    fn commit_transaction(&self) -> Result<()>;

    fn abort_transaction(&self) -> Result<()>;

    /// Push buffered data down the stack and sync it
    fn flush(&self, size_hint: Option<u64>) -> Result<()>;

    /// Number of completed flushes of this layer
    fn flush_count(&self) -> u64 {
        0
    }

    /// Drop cached data that can be rebuilt from the inner store. Data that
    /// only exists in a cache is never dropped.
    fn clear_cache(&self) -> Result<()> {
        Ok(())
    }

    /// Release all resources. Calling it again is a no-op; every other
    /// operation fails with `Closed` afterwards.
    fn close(&self) -> Result<()>;
}

impl<D: Db + ?Sized> Db for Box<D> {
    fn write(&self, index: Index, key: &[u8], value: &[u8]) -> Result<()> {
        (**self).write(index, key, value)
    }

    fn read(
        &self,
        index: Index,
        key: &[u8],
        offset: usize,
        size: Option<usize>,
    ) -> Result<Option<Vec<u8>>> {
        (**self).read(index, key, offset, size)
    }

    fn exists(&self, index: Index, key: &[u8]) -> Result<bool> {
        (**self).exists(index, key)
    }

    fn erase(&self, index: Index, key: &[u8]) -> Result<()> {
        (**self).erase(index, key)
    }

    fn erase_all(&self, index: Index, key: &[u8]) -> Result<()> {
        (**self).erase_all(index, key)
    }

    fn read_multiple(&self, index: Index, key: &[u8]) -> Result<Vec<Vec<u8>>> {
        (**self).read_multiple(index, key)
    }

    fn read_all(&self, index: Index) -> Result<MultiMap> {
        (**self).read_all(index)
    }

    fn read_all_unique(&self, index: Index) -> Result<UniqueMap> {
        (**self).read_all_unique(index)
    }

    fn begin_transaction(&self, size_hint: Option<u64>) -> Result<()> {
        (**self).begin_transaction(size_hint)
    }

    fn commit_transaction(&self) -> Result<()> {
        (**self).commit_transaction()
    }

    fn abort_transaction(&self) -> Result<()> {
        (**self).abort_transaction()
    }

    fn flush(&self, size_hint: Option<u64>) -> Result<()> {
        (**self).flush(size_hint)
    }

    fn flush_count(&self) -> u64 {
        (**self).flush_count()
    }

    fn clear_cache(&self) -> Result<()> {
        (**self).clear_cache()
    }

    fn close(&self) -> Result<()> {
        (**self).close()
    }
}

// =============================================================================
// Scoped Transactions
// =============================================================================

/// Open transaction that is aborted when dropped unresolved
///
/// ```no_run
/// # use nodestore::{Db, Index, InMemoryDb, TransactionGuard};
/// # fn apply(db: &InMemoryDb) -> nodestore::Result<()> {
/// let txn = TransactionGuard::begin(db, None)?;
/// db.write(Index::Blocks, b"hash", b"block")?;
/// txn.commit()
/// # }
/// ```
pub struct TransactionGuard<'a> {
    db: &'a dyn Db,
    resolved: bool,
}

impl<'a> TransactionGuard<'a> {
    pub fn begin(db: &'a dyn Db, size_hint: Option<u64>) -> Result<Self> {
        db.begin_transaction(size_hint)?;
        Ok(Self { db, resolved: false })
    }

    pub fn commit(mut self) -> Result<()> {
        self.resolved = true;
        self.db.commit_transaction()
    }

    pub fn abort(mut self) -> Result<()> {
        self.resolved = true;
        self.db.abort_transaction()
    }
}

impl Drop for TransactionGuard<'_> {
    fn drop(&mut self) {
        if !self.resolved {
            if let Err(e) = self.db.abort_transaction() {
                tracing::error!(error = %e, "Failed to abort unresolved transaction");
            }
        }
    }
}

// =============================================================================
// Helpers shared by implementations
// =============================================================================

/// Clamp `[offset, offset + size)` to the value and copy it out
pub fn slice_value(value: &[u8], offset: usize, size: Option<usize>) -> Vec<u8> {
    let start = offset.min(value.len());
    let end = match size {
        Some(size) => start.saturating_add(size).min(value.len()),
        None => value.len(),
    };
    value[start..end].to_vec()
}

/// Reject single-value erase on tables that hold value lists
pub(crate) fn check_erasable(index: Index) -> Result<()> {
    if index.duplicate_keys_allowed() {
        return Err(StoreError::InvalidIndex(format!(
            "erase on duplicate-key index '{}', use erase_all",
            index
        )));
    }
    Ok(())
}

/// One member of each key's value list
pub(crate) fn pick_unique(all: MultiMap) -> UniqueMap {
    all.into_iter()
        .filter_map(|(key, values)| values.into_iter().next().map(|v| (key, v)))
        .collect()
}
