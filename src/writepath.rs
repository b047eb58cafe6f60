use std::io;
use std::sync::atomic::Ordering::SeqCst;

use fault_injection::fallible;

use crate::format::{
    FrameWriter, Payload, TxnHeader, TxnStatus, STATUS_OFFSET, TLEN_LEN, TLEN_OFFSET,
};
use crate::storage::{StoreStatus, TxnInfo};
use crate::{write_all_at, Error, FileStorage, Map, Oid, Pending, Result, State, Tid};

/// Staged records are written to the data file whenever this
/// many bytes have accumulated, so large transactions do not
/// have to fit in memory.
const FLUSH_THRESHOLD: usize = 1024 * 1024;

/// Commit lock owner used by pack while it copies the tail of
/// the file. Transaction ids never reach it.
pub(crate) const PACK_OWNER: u64 = u64::MAX;

/// Returns the transaction staged by `txn`, or an error if some
/// other transaction (or none) holds the commit lock.
pub(crate) fn pending_for<'a>(state: &'a mut State, txn: &TxnInfo) -> Result<&'a mut Pending> {
    match state.pending.as_mut() {
        Some(pending) if pending.txn_id == txn.id => Ok(pending),
        _ => Err(Error::StorageTransaction(format!(
            "transaction {} is not in a two-phase commit on this storage",
            txn.id
        ))),
    }
}

impl FileStorage {
    pub(crate) fn check_writable(&self) -> Result<()> {
        self.check_open()?;
        if self.shared.config.read_only {
            return Err(Error::ReadOnly);
        }
        if self.shared.degraded.load(SeqCst) {
            return Err(Error::Storage(format!(
                "{} stopped accepting writes after a failed commit",
                self.shared.name
            )));
        }
        Ok(())
    }

    /// True if opened read-only or if a commit failed after the
    /// point of no return.
    pub fn is_read_only(&self) -> bool {
        self.shared.config.read_only || self.shared.degraded.load(SeqCst)
    }

    pub fn last_transaction(&self) -> Tid {
        self.shared.state.lock().last_tid
    }

    pub(crate) fn acquire_commit_lock(&self, owner: u64) -> Result<()> {
        let mut current = self.shared.commit_owner.lock();
        if *current == Some(owner) {
            return Err(Error::StorageTransaction(format!(
                "duplicate tpc_begin for transaction {owner}"
            )));
        }
        while current.is_some() {
            self.shared.commit_cv.wait(&mut current);
        }
        *current = Some(owner);
        Ok(())
    }

    pub(crate) fn release_commit_lock(&self) {
        let mut current = self.shared.commit_owner.lock();
        *current = None;
        drop(current);
        self.shared.commit_cv.notify_one();
    }

    pub(crate) fn allocate_oid(&self) -> Result<Oid> {
        self.check_writable()?;
        let mut state = self.shared.state.lock();
        state.last_oid = Oid::from_u64(state.last_oid.as_u64() + 1);
        Ok(state.last_oid)
    }

    pub(crate) fn begin(&self, txn: &TxnInfo, tid: Option<Tid>, status: Option<TxnStatus>) -> Result<()> {
        self.check_writable()?;

        self.acquire_commit_lock(txn.id)?;

        let res = self.begin_locked(txn, tid, status);
        if res.is_err() {
            self.release_commit_lock();
        }
        res
    }

    fn begin_locked(&self, txn: &TxnInfo, tid: Option<Tid>, status: Option<TxnStatus>) -> Result<()> {
        let mut state = self.shared.state.lock();

        let tid = match tid {
            Some(forced) if forced <= state.last_tid => {
                return Err(Error::StorageTransaction(format!(
                    "forced tid {forced} is not after the last committed tid {}",
                    state.last_tid
                )));
            }
            Some(forced) => forced,
            None => Tid::now().later_than(state.last_tid),
        };

        let status = status.unwrap_or(TxnStatus::Committed);
        if matches!(status, TxnStatus::Checkpoint | TxnStatus::Packed) {
            return Err(Error::StorageTransaction(format!(
                "a transaction cannot be committed with status {status:?}"
            )));
        }

        let header = TxnHeader {
            tid,
            tlen: 0,
            status: TxnStatus::Checkpoint,
            user: txn.user.as_bytes().to_vec(),
            description: txn.description.as_bytes().to_vec(),
            extension: txn.extension.clone(),
        };

        let writer = FrameWriter::new(state.eof, &header)?;

        log::trace!("transaction {} began as {tid} at {}", txn.id, state.eof);

        state.pending = Some(Pending {
            txn_id: txn.id,
            writer,
            status,
            tindex: Map::default(),
            oids: vec![],
            voted: false,
        });

        Ok(())
    }

    pub(crate) fn stage(&self, oid: Oid, serial: Tid, data: &[u8], txn: &TxnInfo) -> Result<StoreStatus> {
        self.check_writable()?;

        if data.is_empty() {
            return Err(Error::StorageTransaction(format!(
                "refusing to store an empty pickle for {oid}"
            )));
        }

        if data.len() > self.shared.config.max_record_size {
            return Err(Error::StorageTransaction(format!(
                "{oid} has a size of {}, which is larger than the configured \
                 `max_record_size` of {}",
                data.len(),
                self.shared.config.max_record_size
            )));
        }

        let mut state = self.shared.state.lock();
        let pending = pending_for(&mut state, txn)?;

        if pending.voted {
            return Err(Error::StorageTransaction(format!(
                "store of {oid} after transaction {} voted",
                txn.id
            )));
        }

        let current = self.current_revision(oid)?;
        let committed = current.map_or(Tid::ZERO, |(_, tid)| tid);

        let mut status = StoreStatus::Stored;
        let mut resolved = None;

        if committed != serial {
            match self.try_resolve(oid, serial, committed, data) {
                Some(merged) => {
                    log::debug!("resolved conflicting store of {oid} against {committed}");
                    status = StoreStatus::Resolved;
                    resolved = Some(merged);
                }
                None => {
                    return Err(Error::Conflict {
                        oid,
                        expected: serial,
                        committed,
                    })
                }
            }
        }

        let data = resolved.unwrap_or_else(|| data.to_vec());
        let prev = current.map_or(0, |(pos, _)| pos);

        let pos = pending.writer.push_record(oid, prev, &Payload::Data(data));
        if pending.tindex.insert(oid, pos).is_none() {
            pending.oids.push(oid);
        }

        if pending.writer.unflushed_len() > FLUSH_THRESHOLD {
            self.flush(pending)?;
        }

        Ok(status)
    }

    fn try_resolve(&self, oid: Oid, expected: Tid, committed: Tid, new: &[u8]) -> Option<Vec<u8>> {
        if expected == Tid::ZERO || committed == Tid::ZERO {
            return None;
        }
        let old = self.read_serial(oid, expected).ok()?;
        let (committed_data, _) = self.read_object(oid, None).ok()?;
        self.shared.format.resolve(oid, &old, &committed_data, new)
    }

    /// Writes the part of the pending frame still buffered in memory.
    pub(crate) fn flush(&self, pending: &mut Pending) -> io::Result<()> {
        if pending.writer.unflushed_len() == 0 {
            return Ok(());
        }
        let (at, buf) = pending.writer.take_unflushed();
        let file = self.shared.file.read();
        write_all_at(&file, &buf, at)
    }

    pub(crate) fn vote(&self, txn: &TxnInfo) -> Result<()> {
        let mut state = self.shared.state.lock();
        let pending = pending_for(&mut state, txn)?;

        if pending.voted {
            return Ok(());
        }

        self.flush(pending)?;
        self.write_lengths(&pending.writer)?;

        pending.voted = true;

        log::trace!(
            "transaction {} voted with {} records",
            txn.id,
            pending.writer.records()
        );

        Ok(())
    }

    /// Patches the leading tlen and writes the trailing copy. The
    /// status byte still says `c`, so a crash leaves the frame to
    /// be truncated by recovery.
    fn write_lengths(&self, writer: &FrameWriter) -> io::Result<()> {
        let tlen = writer.tlen();
        let tlen_bytes = tlen.to_be_bytes();

        let file = self.shared.file.read();
        write_all_at(&file, &tlen_bytes, writer.pos() + tlen - TLEN_LEN)?;
        write_all_at(&file, &tlen_bytes, writer.pos() + TLEN_OFFSET)?;

        if self.shared.config.fsync_each_commit {
            fallible!(file.sync_data());
        }

        Ok(())
    }

    fn write_status(&self, pos: u64, status: TxnStatus) -> io::Result<()> {
        let file = self.shared.file.read();
        write_all_at(&file, &[status.to_byte()], pos + STATUS_OFFSET)?;
        if self.shared.config.fsync_each_commit {
            fallible!(file.sync_data());
        }
        Ok(())
    }

    pub(crate) fn finish(&self, txn: &TxnInfo, callback: &mut dyn FnMut(Tid, &[Oid])) -> Result<Tid> {
        let mut state = self.shared.state.lock();

        let pending = match state.pending.take() {
            Some(pending) if pending.txn_id == txn.id && pending.voted => pending,
            other => {
                let before_vote = matches!(&other, Some(p) if p.txn_id == txn.id);
                state.pending = other;
                return Err(Error::StorageTransaction(if before_vote {
                    format!("tpc_finish called for transaction {} before tpc_vote", txn.id)
                } else {
                    format!(
                        "transaction {} is not in a two-phase commit on this storage",
                        txn.id
                    )
                }));
            }
        };

        let pos = pending.writer.pos();
        let tid = pending.writer.tid();
        let end = pos + pending.writer.tlen();

        if let Err(e) = self.write_status(pos, pending.status) {
            // the status byte may or may not have reached the disk,
            // so nothing can be appended after this frame safely
            log::error!(
                "failed to finish commit of {tid} at {pos}, {} no longer accepts writes: {:?}",
                self.shared.name,
                e
            );
            self.shared.degraded.store(true, SeqCst);
            drop(state);
            self.release_commit_lock();
            return Err(Error::Storage(format!("failed to finish commit of {tid}: {e}")));
        }

        self.shared.index.extend(pending.tindex);
        state.eof = end;

        callback(tid, &pending.oids);

        state.last_tid = tid;
        drop(state);

        self.release_commit_lock();

        log::debug!(
            "committed {tid} with {} objects at {pos}..{end}",
            pending.oids.len()
        );

        Ok(tid)
    }

    pub(crate) fn abort(&self, txn: &TxnInfo) -> Result<()> {
        let mut state = self.shared.state.lock();

        let pending = match state.pending.take() {
            Some(pending) if pending.txn_id == txn.id => pending,
            other => {
                state.pending = other;
                return Ok(());
            }
        };
        drop(state);

        let pos = pending.writer.pos();
        log::trace!(
            "aborting transaction {} with {} staged records at {pos}",
            txn.id,
            pending.writer.records()
        );

        let res = {
            let file = self.shared.file.read();
            file.set_len(pos)
        };

        self.release_commit_lock();

        res.map_err(Error::from)
    }
}
