use std::collections::btree_map::{self, BTreeMap};

use serde::{Deserialize, Serialize};

use crate::{Oid, Persistable};

/// A string-keyed mapping of references to other persistent
/// objects. The database root is one of these.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentMapping {
    entries: BTreeMap<String, Oid>,
}

impl PersistentMapping {
    pub fn new() -> PersistentMapping {
        PersistentMapping::default()
    }

    /// Returns the oid previously stored under `key`.
    pub fn insert<K: Into<String>>(&mut self, key: K, oid: Oid) -> Option<Oid> {
        self.entries.insert(key.into(), oid)
    }

    pub fn get(&self, key: &str) -> Option<Oid> {
        self.entries.get(key).copied()
    }

    pub fn remove(&mut self, key: &str) -> Option<Oid> {
        self.entries.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, Oid> {
        self.entries.iter()
    }
}

impl Persistable for PersistentMapping {
    const CLASS_ID: &'static str = "granite.PersistentMapping";

    fn references(&self) -> Vec<Oid> {
        self.entries.values().copied().collect()
    }

    /// Concurrent changes merge as long as no key was changed
    /// differently on both sides.
    fn resolve(old: &Self, committed: &Self, new: &Self) -> Option<Self> {
        let mut merged = committed.clone();

        let keys = old.entries.keys().chain(new.entries.keys());
        for key in keys {
            let before = old.entries.get(key);
            let ours = new.entries.get(key);
            let theirs = committed.entries.get(key);

            if ours == before {
                continue;
            }
            if theirs != before && theirs != ours {
                return None;
            }
            match ours {
                Some(oid) => merged.entries.insert(key.clone(), *oid),
                None => merged.entries.remove(key),
            };
        }

        Some(merged)
    }
}

/// A persistent integer whose concurrent increments never
/// conflict.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counter {
    value: i64,
}

impl Counter {
    pub fn new(value: i64) -> Counter {
        Counter { value }
    }

    pub fn value(&self) -> i64 {
        self.value
    }

    /// Returns the new value.
    pub fn increment(&mut self, delta: i64) -> i64 {
        self.value = self.value.wrapping_add(delta);
        self.value
    }
}

impl Persistable for Counter {
    const CLASS_ID: &'static str = "granite.Counter";

    fn resolve(old: &Self, committed: &Self, new: &Self) -> Option<Self> {
        let theirs = committed.value.wrapping_sub(old.value);
        let ours = new.value.wrapping_sub(old.value);
        Some(Counter::new(old.value.wrapping_add(theirs).wrapping_add(ours)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(entries: &[(&str, u64)]) -> PersistentMapping {
        let mut mapping = PersistentMapping::new();
        for (key, oid) in entries {
            mapping.insert(*key, Oid::from_u64(*oid));
        }
        mapping
    }

    #[test]
    fn disjoint_mapping_changes_merge() {
        let old = mapping(&[("a", 1), ("b", 2)]);
        let committed = mapping(&[("a", 1), ("b", 2), ("c", 3)]);
        let new = mapping(&[("b", 2), ("d", 4)]);

        let merged = PersistentMapping::resolve(&old, &committed, &new).unwrap();
        assert_eq!(merged, mapping(&[("b", 2), ("c", 3), ("d", 4)]));
    }

    #[test]
    fn same_key_changed_differently_conflicts() {
        let old = mapping(&[("a", 1)]);
        let committed = mapping(&[("a", 2)]);
        let new = mapping(&[("a", 3)]);
        assert!(PersistentMapping::resolve(&old, &committed, &new).is_none());

        let same = mapping(&[("a", 2)]);
        assert_eq!(PersistentMapping::resolve(&old, &committed, &same), Some(same));
    }
}
