use std::fs::File;
use std::io;

use fault_injection::annotate;

use crate::format::{
    read_frame, read_txn_header, Payload, TxnHeader, TxnStatus, MAGIC_LEN, TLEN_LEN,
};
use crate::storage::{TxnInfo, UndoInfo};
use crate::writepath::pending_for;
use crate::{read_range_at, Error, FileStorage, Oid, Result, Tid};

/// Walks frame headers from the end of the file towards the
/// start using the trailing copy of each frame's length.
struct Backwards<'a> {
    file: &'a File,
    pos: u64,
}

impl<'a> Backwards<'a> {
    fn new(file: &'a File, eof: u64) -> Backwards<'a> {
        Backwards { file, pos: eof }
    }

    fn next_frame(&mut self) -> io::Result<Option<(u64, TxnHeader)>> {
        if self.pos <= MAGIC_LEN {
            return Ok(None);
        }

        let trailer = read_range_at(self.file, self.pos - TLEN_LEN, self.pos)?;
        let mut tlen_bytes = [0_u8; 8];
        tlen_bytes.copy_from_slice(&trailer);
        let tlen = u64::from_be_bytes(tlen_bytes);

        if tlen > self.pos - MAGIC_LEN {
            return Err(annotate!(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("trailing tlen {tlen} before {} points before the file start", self.pos),
            )));
        }

        let frame_pos = self.pos - tlen;
        let header = read_txn_header(self.file, frame_pos)?;

        if header.tlen != tlen {
            return Err(annotate!(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "frame at {frame_pos} has tlen {} but its trailer says {tlen}",
                    header.tlen
                ),
            )));
        }

        self.pos = frame_pos;

        Ok(Some((frame_pos, header)))
    }
}

impl FileStorage {
    pub(crate) fn undo_txn(&self, tid: Tid, txn: &TxnInfo) -> Result<Vec<Oid>> {
        self.check_writable()?;

        let mut state = self.shared.state.lock();
        let eof = state.eof;

        if tid <= state.pack_tid {
            return Err(Error::Undo {
                tid,
                reason: format!("history up to {} was removed by pack", state.pack_tid),
            });
        }

        let pending = pending_for(&mut state, txn)?;

        if pending.voted {
            return Err(Error::StorageTransaction(format!(
                "undo of {tid} after transaction {} voted",
                txn.id
            )));
        }

        let file = self.shared.file.read();

        let mut backwards = Backwards::new(&file, eof);
        let frame_pos = loop {
            match backwards.next_frame()? {
                Some((pos, header)) if header.tid == tid => {
                    if !header.status.is_committed() {
                        return Err(Error::Undo {
                            tid,
                            reason: "the transaction was packed".into(),
                        });
                    }
                    break pos;
                }
                Some((_, header)) if header.tid < tid => {
                    return Err(Error::Undo {
                        tid,
                        reason: "no such transaction".into(),
                    })
                }
                Some(_) => continue,
                None => {
                    return Err(Error::Undo {
                        tid,
                        reason: "no such transaction".into(),
                    })
                }
            }
        };

        let frame = read_frame(&file, frame_pos, eof)?;

        let mut staged = vec![];

        for record in frame.records.iter().rev() {
            let oid = record.header.oid;
            if staged.iter().any(|(staged_oid, _, _)| *staged_oid == oid) {
                // only the last record per object in a frame counts
                continue;
            }

            if pending.tindex.contains_key(&oid) {
                return Err(Error::Undo {
                    tid,
                    reason: format!("{oid} was already changed in this transaction"),
                });
            }

            let head_pos = self.shared.index.get(oid).ok_or(Error::PosKey(oid))?;
            if head_pos != record.pos {
                return Err(Error::Undo {
                    tid,
                    reason: format!("{oid} was modified by a later transaction"),
                });
            }

            // prev 0 means the undone transaction created the object
            let restored = Payload::Backpointer(record.header.prev);
            staged.push((oid, head_pos, restored));
        }

        drop(file);

        let mut oids = Vec::with_capacity(staged.len());
        for (oid, head_pos, payload) in staged.into_iter().rev() {
            let pos = pending.writer.push_record(oid, head_pos, &payload);
            pending.tindex.insert(oid, pos);
            pending.oids.push(oid);
            oids.push(oid);
        }

        log::debug!("staged undo of {tid} touching {} objects", oids.len());

        Ok(oids)
    }

    pub(crate) fn read_undo_log(&self, first: usize, last: usize) -> Result<Vec<UndoInfo>> {
        self.check_open()?;

        let (eof, pack_tid) = {
            let state = self.shared.state.lock();
            (state.eof, state.pack_tid)
        };
        let file = self.shared.file.read();

        let mut backwards = Backwards::new(&file, eof);
        let mut seen = 0;
        let mut ret = vec![];

        while seen < last {
            let header = match backwards.next_frame()? {
                Some((_, header)) => header,
                None => break,
            };

            if header.status == TxnStatus::Packed || header.tid <= pack_tid {
                break;
            }

            if seen >= first {
                ret.push(UndoInfo {
                    id: header.tid,
                    time: header.tid.to_system_time(),
                    user: String::from_utf8_lossy(&header.user).into_owned(),
                    description: String::from_utf8_lossy(&header.description).into_owned(),
                });
            }
            seen += 1;
        }

        Ok(ret)
    }
}
