//! Committed table state
//!
//! One ordered B-tree per index mapping a key to its value list. Values are
//! `Bytes`, so cloning the whole state for a copy-on-write snapshot only
//! bumps reference counts.

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::db::{slice_value, MultiMap};
use crate::index::Index;
use crate::overlay::Overlay;

pub(crate) type Table = BTreeMap<Vec<u8>, Vec<Bytes>>;

#[derive(Debug, Clone, Default)]
pub(crate) struct Tables {
    tables: [Table; Index::COUNT],
    usage: Usage,
}

/// Running totals of the stored values
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Usage {
    /// Number of values across every table
    pub values: u64,
    /// Key bytes (once per value) plus value bytes
    pub bytes: u64,
}

impl Usage {
    fn add(&mut self, key: &[u8], values: &[Bytes]) {
        self.values += values.len() as u64;
        self.bytes += values
            .iter()
            .map(|v| (key.len() + v.len()) as u64)
            .sum::<u64>();
    }

    fn sub(&mut self, key: &[u8], values: &[Bytes]) {
        self.values -= values.len() as u64;
        self.bytes -= values
            .iter()
            .map(|v| (key.len() + v.len()) as u64)
            .sum::<u64>();
    }
}

impl Tables {
    pub fn table(&self, index: Index) -> &Table {
        &self.tables[index.slot()]
    }

    /// Values of `key`, empty slice if missing
    pub fn values(&self, index: Index, key: &[u8]) -> &[Bytes] {
        self.tables[index.slot()]
            .get(key)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn read(&self, index: Index, key: &[u8], offset: usize, size: Option<usize>) -> Option<Vec<u8>> {
        self.values(index, key)
            .first()
            .map(|v| slice_value(v, offset, size))
    }

    pub fn put(&mut self, index: Index, key: &[u8], value: Bytes) {
        let table = &mut self.tables[index.slot()];
        self.usage.add(key, std::slice::from_ref(&value));
        if index.duplicate_keys_allowed() {
            table.entry(key.to_vec()).or_default().push(value);
        } else if let Some(old) = table.insert(key.to_vec(), vec![value]) {
            self.usage.sub(key, &old);
        }
    }

    pub fn remove(&mut self, index: Index, key: &[u8]) {
        if let Some(old) = self.tables[index.slot()].remove(key) {
            self.usage.sub(key, &old);
        }
    }

    /// Fold every pending change into the committed state
    pub fn apply(&mut self, overlay: &Overlay) {
        for (index, key, pending) in overlay.iter() {
            let table = &mut self.tables[index.slot()];
            if pending.cleared {
                if let Some(old) = table.remove(key) {
                    self.usage.sub(key, &old);
                }
                if !pending.values.is_empty() {
                    table.insert(key.to_vec(), pending.values.clone());
                }
            } else if !pending.values.is_empty() {
                table
                    .entry(key.to_vec())
                    .or_default()
                    .extend(pending.values.iter().cloned());
            }
            self.usage.add(key, &pending.values);
        }
    }

    pub fn read_all(&self, index: Index) -> MultiMap {
        self.tables[index.slot()]
            .iter()
            .map(|(k, vs)| (k.clone(), vs.iter().map(|v| v.to_vec()).collect()))
            .collect()
    }

    /// Number of keys per index
    pub fn key_counts(&self) -> [usize; Index::COUNT] {
        let mut counts = [0usize; Index::COUNT];
        for (slot, table) in self.tables.iter().enumerate() {
            counts[slot] = table.len();
        }
        counts
    }

    pub fn usage(&self) -> Usage {
        self.usage
    }

    pub fn clear(&mut self) {
        for table in self.tables.iter_mut() {
            table.clear();
        }
        self.usage = Usage::default();
    }
}
