use std::fs::File;
use std::io;

use fault_injection::annotate;

use crate::format::{read_payload, read_record_header, read_txn_header, Payload, RecordHeader};
use crate::{Error, FileStorage, Oid, Result, RevisionInfo, Tid};

/// Follows backpointers from the record at `pos` until actual
/// data is found. `Ok(None)` means the revision records that the
/// object does not exist.
pub(crate) fn resolve_data(
    file: &File,
    oid: Oid,
    pos: u64,
    rh: &RecordHeader,
) -> io::Result<Option<Vec<u8>>> {
    let mut pos = pos;
    let mut rh = *rh;

    loop {
        match read_payload(file, pos, &rh)? {
            Payload::Data(data) => return Ok(Some(data)),
            Payload::Backpointer(0) => return Ok(None),
            Payload::Backpointer(target) => {
                if target >= pos {
                    return Err(annotate!(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("record for {oid} at {pos} has a forward backpointer to {target}"),
                    )));
                }
                let target_rh = read_record_header(file, target)?;
                if target_rh.oid != oid {
                    return Err(annotate!(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!(
                            "backpointer for {oid} at {pos} leads to a record of {}",
                            target_rh.oid
                        ),
                    )));
                }
                pos = target;
                rh = target_rh;
            }
        }
    }
}

impl FileStorage {
    /// The position and TID of the current committed revision.
    pub(crate) fn current_revision(&self, oid: Oid) -> Result<Option<(u64, Tid)>> {
        let file = self.shared.file.read();
        let pos = if let Some(pos) = self.shared.index.get(oid) {
            pos
        } else {
            return Ok(None);
        };
        let rh = read_record_header(&file, pos)?;
        Ok(Some((pos, rh.tid)))
    }

    /// Reads an object as of `at`, or its current revision.
    pub(crate) fn read_object(&self, oid: Oid, at: Option<Tid>) -> Result<(Vec<u8>, Tid)> {
        self.check_open()?;

        // the index is looked up under the file lock so that a pack
        // cannot swap the file between the two
        let file = self.shared.file.read();

        let mut pos = self.shared.index.get(oid).ok_or(Error::PosKey(oid))?;

        loop {
            let rh = read_record_header(&file, pos)?;

            if at.map_or(true, |at| rh.tid <= at) {
                return match resolve_data(&file, oid, pos, &rh)? {
                    Some(data) => {
                        log::trace!("loaded {oid} revision {} from {pos}", rh.tid);
                        Ok((data, rh.tid))
                    }
                    None => Err(Error::PosKey(oid)),
                };
            }

            if rh.prev == 0 {
                // every remaining revision is newer than the reader
                return Err(Error::ReadConflict(oid));
            }
            pos = rh.prev;
        }
    }

    pub(crate) fn read_serial(&self, oid: Oid, serial: Tid) -> Result<Vec<u8>> {
        self.check_open()?;

        let file = self.shared.file.read();
        let mut pos = self.shared.index.get(oid).ok_or(Error::PosKey(oid))?;

        loop {
            let rh = read_record_header(&file, pos)?;

            if rh.tid == serial {
                return resolve_data(&file, oid, pos, &rh)?.ok_or(Error::PosKey(oid));
            }

            if rh.tid < serial || rh.prev == 0 {
                return Err(Error::PosKey(oid));
            }
            pos = rh.prev;
        }
    }

    pub(crate) fn read_before(
        &self,
        oid: Oid,
        before: Tid,
    ) -> Result<Option<(Vec<u8>, Tid, Option<Tid>)>> {
        self.check_open()?;

        let file = self.shared.file.read();
        let mut pos = self.shared.index.get(oid).ok_or(Error::PosKey(oid))?;
        let mut next = None;

        loop {
            let rh = read_record_header(&file, pos)?;

            if rh.tid < before {
                return Ok(resolve_data(&file, oid, pos, &rh)?.map(|data| (data, rh.tid, next)));
            }

            if rh.prev == 0 {
                return Ok(None);
            }
            next = Some(rh.tid);
            pos = rh.prev;
        }
    }

    pub(crate) fn read_history(&self, oid: Oid, size: usize) -> Result<Vec<RevisionInfo>> {
        self.check_open()?;

        let file = self.shared.file.read();
        let mut pos = self.shared.index.get(oid).ok_or(Error::PosKey(oid))?;
        let mut ret = vec![];

        while ret.len() < size {
            let rh = read_record_header(&file, pos)?;
            let th = read_txn_header(&file, rh.tx_pos)?;
            let size = resolve_data(&file, oid, pos, &rh)?.map_or(0, |data| data.len());

            ret.push(RevisionInfo {
                tid: rh.tid,
                time: rh.tid.to_system_time(),
                user: String::from_utf8_lossy(&th.user).into_owned(),
                description: String::from_utf8_lossy(&th.description).into_owned(),
                size,
            });

            if rh.prev == 0 {
                break;
            }
            pos = rh.prev;
        }

        Ok(ret)
    }
}
