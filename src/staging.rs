use crate::{Map, Oid, Tid};

/// Object states written by savepoints and not yet committed.
///
/// Later entries for the same oid shadow earlier ones, so that
/// rolling back to a savepoint only has to truncate.
#[derive(Default)]
pub(crate) struct Staging {
    entries: Vec<(Oid, Tid, Vec<u8>)>,
    index: Map<Oid, usize>,
}

/// A position in the staging area to roll back to.
#[derive(Clone)]
pub(crate) struct StagingMark {
    len: usize,
    index: Map<Oid, usize>,
}

impl Staging {
    /// `serial` is the revision the state was derived from.
    pub fn stage(&mut self, oid: Oid, serial: Tid, pickle: Vec<u8>) {
        self.index.insert(oid, self.entries.len());
        self.entries.push((oid, serial, pickle));
    }

    pub fn get(&self, oid: Oid) -> Option<(Tid, &[u8])> {
        let idx = *self.index.get(&oid)?;
        let (_, serial, pickle) = &self.entries[idx];
        Some((*serial, pickle))
    }

    pub fn mark(&self) -> StagingMark {
        StagingMark {
            len: self.entries.len(),
            index: self.index.clone(),
        }
    }

    /// Forgets everything staged after `mark`, returning the oids
    /// whose staged state changed as a result.
    pub fn reset(&mut self, mark: &StagingMark) -> Vec<Oid> {
        if mark.len > self.entries.len() {
            return vec![];
        }
        let dropped = self.entries.split_off(mark.len);
        self.index = mark.index.clone();
        let mut oids: Vec<Oid> = dropped.into_iter().map(|(oid, _, _)| oid).collect();
        oids.sort();
        oids.dedup();
        oids
    }

    /// The newest staged state of every object, in staging order.
    pub fn current(&self) -> impl Iterator<Item = (Oid, Tid, &[u8])> {
        self.entries
            .iter()
            .enumerate()
            .filter(move |(idx, (oid, _, _))| self.index.get(oid) == Some(idx))
            .map(|(_, (oid, serial, pickle))| (*oid, *serial, pickle.as_slice()))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }
}
