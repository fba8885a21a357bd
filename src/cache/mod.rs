//! Cache Layers
//!
//! Decorators over any [`Db`](crate::Db). Each one owns its inner store,
//! implements the same contract and forwards misses and writes down the
//! stack, so layers nest freely:
//!
//! ```text
//! LruCache<ReadCache<MappedDb>>
//!    │ dirty victims, misses
//!    ▼
//! ReadCache<MappedDb>
//!    │ writes, misses
//!    ▼
//! MappedDb
//! ```
//!
//! ## Responsibilities
//! - `WriteBackCache`: buffer writes and erasures, push them down on flush
//! - `ReadCache`: remember read results, including absences
//! - `LruCache`: keep a bounded working set, writing dirty entries through
//!   before they are evicted
//!
//! Every layer handles its own state first, then forwards `flush`,
//! `clear_cache` and `close` to the inner store.

mod lru;
mod read_cache;
mod write_back;

pub use lru::LruCache;
pub use read_cache::ReadCache;
pub use write_back::WriteBackCache;

use bytes::Bytes;

use crate::db::Db;
use crate::error::Result;
use crate::index::Index;

/// Value list of `key` in the inner store
fn load_values<D: Db + ?Sized>(inner: &D, index: Index, key: &[u8]) -> Result<Vec<Bytes>> {
    Ok(inner
        .read_multiple(index, key)?
        .into_iter()
        .map(Bytes::from)
        .collect())
}

fn values_weight(values: &[Bytes]) -> u64 {
    values.iter().map(|v| v.len() as u64).sum()
}
