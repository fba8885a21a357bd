//! Pending changes
//!
//! An `Overlay` records writes and erasures that are not yet part of the
//! state underneath it: an open transaction, or the dirty buffer of the
//! write-back cache. Each touched key keeps a `Pending` delta:
//!
//! - `cleared`: everything underneath is hidden
//! - `values`: values appended on top, in write order
//!
//! A unique-key write is `cleared` plus one value; an erasure is `cleared`
//! with no values; a duplicate-key write appends.

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::db::{Db, MultiMap};
use crate::error::Result;
use crate::index::Index;

#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Pending {
    pub cleared: bool,
    pub values: Vec<Bytes>,
}

impl Pending {
    /// The value list seen through this delta
    pub fn resolve(&self, base: &[Bytes]) -> Vec<Bytes> {
        if self.cleared {
            self.values.clone()
        } else {
            base.iter().chain(self.values.iter()).cloned().collect()
        }
    }

    /// Bytes of the values held by this delta
    fn weight(&self) -> u64 {
        self.values.iter().map(|v| v.len() as u64).sum()
    }

    /// Compose a later delta on top of this one
    fn then(&mut self, later: Pending) {
        if later.cleared {
            *self = later;
        } else {
            self.values.extend(later.values);
        }
    }
}

/// Resolve a key through stacked deltas, loading the base only when no
/// delta hides it
pub(crate) fn resolve_layers<F>(layers: &[Option<&Pending>], load_base: F) -> Result<Vec<Bytes>>
where
    F: FnOnce() -> Result<Vec<Bytes>>,
{
    let hidden = layers.iter().flatten().any(|p| p.cleared);
    let mut values = if hidden { Vec::new() } else { load_base()? };
    for pending in layers.iter().flatten() {
        values = pending.resolve(&values);
    }
    Ok(values)
}

#[derive(Debug, Default)]
pub(crate) struct Overlay {
    entries: [BTreeMap<Vec<u8>, Pending>; Index::COUNT],
    /// Bytes of keys and values currently held, each key counted once
    size: u64,
}

impl Overlay {
    pub fn write(&mut self, index: Index, key: &[u8], value: &[u8]) {
        let value = Bytes::copy_from_slice(value);
        let added = value.len() as u64;
        let pending = self.entry(index, key);
        let replaced = if index.duplicate_keys_allowed() {
            pending.values.push(value);
            0
        } else {
            let replaced = pending.weight();
            pending.cleared = true;
            pending.values = vec![value];
            replaced
        };
        self.size = self.size + added - replaced;
    }

    pub fn erase_all(&mut self, index: Index, key: &[u8]) {
        let pending = self.entry(index, key);
        let dropped = pending.weight();
        pending.cleared = true;
        pending.values.clear();
        self.size -= dropped;
    }

    fn entry(&mut self, index: Index, key: &[u8]) -> &mut Pending {
        let table = &mut self.entries[index.slot()];
        if !table.contains_key(key) {
            self.size += key.len() as u64;
        }
        table.entry(key.to_vec()).or_default()
    }

    pub fn get(&self, index: Index, key: &[u8]) -> Option<&Pending> {
        self.entries[index.slot()].get(key)
    }

    /// Compose a later overlay (a committed transaction) on top of this one
    pub fn absorb(&mut self, later: Overlay) {
        for (slot, table) in later.entries.into_iter().enumerate() {
            for (key, pending) in table {
                match self.entries[slot].get_mut(&key) {
                    Some(existing) => {
                        let before = existing.weight();
                        existing.then(pending);
                        self.size = self.size + existing.weight() - before;
                    }
                    None => {
                        self.size += key.len() as u64 + pending.weight();
                        self.entries[slot].insert(key, pending);
                    }
                }
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Index, &[u8], &Pending)> + '_ {
        Index::ALL.into_iter().flat_map(move |index| {
            self.entries[index.slot()]
                .iter()
                .map(move |(key, pending)| (index, key.as_slice(), pending))
        })
    }

    /// Merge the deltas of one table into a full dump of the state underneath
    pub fn apply_to_map(&self, index: Index, map: &mut MultiMap) {
        for (key, pending) in &self.entries[index.slot()] {
            let merged: Vec<Vec<u8>> = if pending.cleared {
                pending.values.iter().map(|v| v.to_vec()).collect()
            } else {
                let mut base = map.remove(key).unwrap_or_default();
                base.extend(pending.values.iter().map(|v| v.to_vec()));
                base
            };
            if merged.is_empty() {
                map.remove(key);
            } else {
                map.insert(key.clone(), merged);
            }
        }
    }

    /// Re-issue every change against another store
    pub fn replay_into<D: Db + ?Sized>(&self, db: &D) -> Result<()> {
        for (index, key, pending) in self.iter() {
            // A unique-key write replaces the old value on its own
            let replaced = !index.duplicate_keys_allowed() && !pending.values.is_empty();
            if pending.cleared && !replaced {
                db.erase_all(index, key)?;
            }
            for value in &pending.values {
                db.write(index, key, value)?;
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.iter().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(BTreeMap::is_empty)
    }

    pub fn size_bytes(&self) -> u64 {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(vs: &[&[u8]]) -> Vec<Bytes> {
        vs.iter().map(|v| Bytes::copy_from_slice(v)).collect()
    }

    #[test]
    fn test_unique_write_hides_base() {
        let mut overlay = Overlay::default();
        overlay.write(Index::Main, b"k", b"new");
        let pending = overlay.get(Index::Main, b"k").unwrap();
        assert_eq!(pending.resolve(&values(&[b"old"])), values(&[b"new"]));
    }

    #[test]
    fn test_duplicate_write_appends_to_base() {
        let mut overlay = Overlay::default();
        overlay.write(Index::Ntp1TokenNames, b"k", b"v2");
        overlay.write(Index::Ntp1TokenNames, b"k", b"v3");
        let pending = overlay.get(Index::Ntp1TokenNames, b"k").unwrap();
        assert_eq!(
            pending.resolve(&values(&[b"v1"])),
            values(&[b"v1", b"v2", b"v3"])
        );
    }

    #[test]
    fn test_erase_then_append() {
        let mut overlay = Overlay::default();
        overlay.erase_all(Index::Ntp1TokenNames, b"k");
        overlay.write(Index::Ntp1TokenNames, b"k", b"v9");
        let pending = overlay.get(Index::Ntp1TokenNames, b"k").unwrap();
        assert_eq!(pending.resolve(&values(&[b"v1", b"v2"])), values(&[b"v9"]));
    }

    #[test]
    fn test_absorb_composes_deltas() {
        let mut base = Overlay::default();
        base.write(Index::Ntp1TokenNames, b"k", b"a");
        base.write(Index::Main, b"gone", b"x");

        let mut later = Overlay::default();
        later.write(Index::Ntp1TokenNames, b"k", b"b");
        later.erase_all(Index::Main, b"gone");
        later.write(Index::Tx, b"t", b"1");

        base.absorb(later);

        let k = base.get(Index::Ntp1TokenNames, b"k").unwrap();
        assert_eq!(k.resolve(&[]), values(&[b"a", b"b"]));
        let gone = base.get(Index::Main, b"gone").unwrap();
        assert!(gone.cleared && gone.values.is_empty());
        assert!(base.get(Index::Tx, b"t").is_some());
        assert_eq!(base.len(), 3);
    }

    #[test]
    fn test_resolve_layers_skips_hidden_base() {
        let mut overlay = Overlay::default();
        overlay.erase_all(Index::Main, b"k");
        let layers = [overlay.get(Index::Main, b"k")];
        let resolved = resolve_layers(&layers, || panic!("base must not be loaded")).unwrap();
        assert!(resolved.is_empty());
    }

    #[test]
    fn test_apply_to_map() {
        let mut map = MultiMap::new();
        map.insert(b"a".to_vec(), vec![b"1".to_vec()]);
        map.insert(b"b".to_vec(), vec![b"2".to_vec()]);

        let mut overlay = Overlay::default();
        overlay.write(Index::Ntp1TokenNames, b"a", b"3");
        overlay.erase_all(Index::Ntp1TokenNames, b"b");
        overlay.write(Index::Ntp1TokenNames, b"c", b"4");
        overlay.apply_to_map(Index::Ntp1TokenNames, &mut map);

        assert_eq!(map[b"a".as_slice()], vec![b"1".to_vec(), b"3".to_vec()]);
        assert!(!map.contains_key(b"b".as_slice()));
        assert_eq!(map[b"c".as_slice()], vec![b"4".to_vec()]);
    }

    #[test]
    fn test_size_accounts_keys_once() {
        let mut overlay = Overlay::default();
        overlay.write(Index::Main, b"key", b"12345");
        overlay.write(Index::Main, b"key", b"123");
        assert_eq!(overlay.size_bytes(), 3 + 3);
    }

    #[test]
    fn test_size_tracks_held_values() {
        let mut overlay = Overlay::default();
        for _ in 0..1000 {
            overlay.write(Index::Main, b"best", &[0u8; 1024]);
        }
        assert_eq!(overlay.size_bytes(), 4 + 1024);

        overlay.write(Index::Ntp1TokenNames, b"t", b"ab");
        overlay.write(Index::Ntp1TokenNames, b"t", b"cd");
        assert_eq!(overlay.size_bytes(), 4 + 1024 + 1 + 4);

        overlay.erase_all(Index::Main, b"best");
        assert_eq!(overlay.size_bytes(), 4 + 1 + 4);
    }

    #[test]
    fn test_absorb_size_matches_composed_overlay() {
        let mut base = Overlay::default();
        base.write(Index::Main, b"k", &[1u8; 100]);
        base.write(Index::Ntp1TokenNames, b"t", b"a");

        let mut later = Overlay::default();
        later.write(Index::Main, b"k", &[2u8; 10]);
        later.write(Index::Ntp1TokenNames, b"t", b"b");
        later.write(Index::Tx, b"new", b"xyz");

        base.absorb(later);
        // k + 10, t + "a" + "b", new + "xyz"
        assert_eq!(base.size_bytes(), (1 + 10) + (1 + 2) + (3 + 3));
    }
}
