use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use fault_injection::{annotate, fallible};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::{Map, Oid, Tid};

/// Primary index from object ID to the file position of its
/// current committed record. Only the commit path writes to it,
/// replacing whole entries; loads take the read side.
#[derive(Default, Debug)]
pub(crate) struct Index {
    table: RwLock<Map<Oid, u64>>,
}

impl Index {
    pub fn from_table(table: Map<Oid, u64>) -> Index {
        Index {
            table: RwLock::new(table),
        }
    }

    pub fn get(&self, oid: Oid) -> Option<u64> {
        self.table.read().get(&oid).copied()
    }

    /// Installs a committed transaction's tentative index in one
    /// step, so readers see either none or all of it.
    pub fn extend<I: IntoIterator<Item = (Oid, u64)>>(&self, entries: I) {
        let mut table = self.table.write();
        for (oid, pos) in entries {
            table.insert(oid, pos);
        }
    }

    /// Swaps in a completely rebuilt table, as after a pack.
    pub fn replace(&self, new_table: Map<Oid, u64>) {
        *self.table.write() = new_table;
    }

    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    pub fn snapshot(&self) -> Map<Oid, u64> {
        self.table.read().clone()
    }
}

/// What gets persisted next to the data file on clean close.
#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub(crate) struct SavedIndex {
    /// File position up to which the index is complete.
    pub pos: u64,
    pub last_tid: Tid,
    pub last_oid: Oid,
    pub entries: Vec<(Oid, u64)>,
}

const CRC_LEN: usize = 4;

pub(crate) fn write_index(path: &Path, saved: &SavedIndex) -> io::Result<()> {
    let body = bincode::serialize(saved)
        .map_err(|e| {
            let e = io::Error::new(io::ErrorKind::InvalidData, e);
            annotate!(e)
        })?;
    let crc = crc32fast::hash(&body);

    let tmp_path = path.with_extension("index.tmp");

    let mut file = fallible!(OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path));
    fallible!(file.write_all(&crc.to_le_bytes()));
    fallible!(file.write_all(&body));
    fallible!(file.sync_all());
    drop(file);

    fallible!(fs::rename(&tmp_path, path));

    log::trace!(
        "wrote index of {} entries covering {} with crc {}",
        saved.entries.len(),
        saved.pos,
        crc
    );

    Ok(())
}

/// Returns `Ok(None)` when no usable index exists, in which
/// case the caller falls back to a full scan.
pub(crate) fn read_index(path: &Path) -> io::Result<Option<SavedIndex>> {
    let buf = match fs::read(path) {
        Ok(buf) => buf,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(annotate!(e)),
    };

    if buf.len() < CRC_LEN {
        log::warn!("ignoring truncated index file {:?}", path);
        return Ok(None);
    }

    let mut crc_bytes = [0_u8; CRC_LEN];
    crc_bytes.copy_from_slice(&buf[..CRC_LEN]);
    let expected_crc = u32::from_le_bytes(crc_bytes);
    let actual_crc = crc32fast::hash(&buf[CRC_LEN..]);

    if expected_crc != actual_crc {
        log::warn!(
            "crc mismatch for index file {:?}, expected {expected_crc} but got {actual_crc}",
            path
        );
        return Ok(None);
    }

    match bincode::deserialize::<SavedIndex>(&buf[CRC_LEN..]) {
        Ok(saved) => Ok(Some(saved)),
        Err(e) => {
            log::warn!("failed to decode index file {:?}: {}", path, e);
            Ok(None)
        }
    }
}
