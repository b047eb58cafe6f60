use std::time::SystemTime;

use crate::{FileStorage, Oid, Result, Tid, TransactionIterator, TxnStatus};

/// What a storage needs to know about the transaction driving a
/// two-phase commit: an identity to tell concurrent commits apart
/// and the metadata recorded in the transaction frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxnInfo {
    pub id: u64,
    pub user: String,
    pub description: String,
    pub extension: Vec<u8>,
}

/// Outcome of a successful `store`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreStatus {
    /// The data was staged as given.
    Stored,
    /// The expected serial was stale, but the object's class
    /// merged the concurrent changes. The staged data differs from
    /// what the caller passed in, so any in-memory copy is stale.
    Resolved,
}

/// One revision of an object, as returned by `history`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionInfo {
    pub tid: Tid,
    pub time: SystemTime,
    pub user: String,
    pub description: String,
    /// Size of the pickle in bytes, 0 if the revision says the
    /// object does not exist.
    pub size: usize,
}

/// A transaction that can be undone, as returned by `undo_log`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoInfo {
    /// Pass this to `undo`.
    pub id: Tid,
    pub time: SystemTime,
    pub user: String,
    pub description: String,
}

/// One object revision inside a transaction yielded by the
/// storage iterator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRecord {
    pub oid: Oid,
    pub tid: Tid,
    /// `None` if this revision says the object does not exist.
    pub data: Option<Vec<u8>>,
    /// If the record reuses the data of an earlier record, the TID
    /// of the transaction that wrote it.
    pub data_txn: Option<Tid>,
}

/// A committed transaction yielded by the storage iterator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRecord {
    pub tid: Tid,
    pub status: TxnStatus,
    pub user: String,
    pub description: String,
    pub extension: Vec<u8>,
    pub records: Vec<DataRecord>,
}

/// Result of a pack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PackStats {
    /// Everything at or before this TID was subject to collection.
    pub pack_tid: Tid,
    pub file_size_before: u64,
    pub file_size_after: u64,
    pub records_before: u64,
    pub records_after: u64,
}

/// The interface connections and the database use to talk to a
/// storage. Two-phase commit calls for one transaction must come
/// in the order `tpc_begin`, `store`/`undo`*, `tpc_vote`,
/// `tpc_finish`, with `tpc_abort` allowed at any point after
/// `tpc_begin`.
pub trait Storage: Send + Sync {
    fn name(&self) -> &str;

    /// Data managers sharing a sort key commit in a stable order
    /// relative to each other.
    fn sort_key(&self) -> String {
        self.name().to_owned()
    }

    /// Allocates a fresh object id.
    fn new_oid(&self) -> Result<Oid>;

    /// Loads the current revision, or with `at`, the newest
    /// revision committed at or before `at`. Returns the pickle
    /// and the TID of the transaction that wrote it.
    fn load(&self, oid: Oid, at: Option<Tid>) -> Result<(Vec<u8>, Tid)>;

    /// Loads the revision written by exactly `serial`.
    fn load_serial(&self, oid: Oid, serial: Tid) -> Result<Vec<u8>>;

    /// Loads the newest revision strictly before `tid`, returning
    /// the pickle, its TID, and the TID of the next revision if
    /// one exists. `Ok(None)` if no such revision exists.
    fn load_before(&self, oid: Oid, tid: Tid) -> Result<Option<(Vec<u8>, Tid, Option<Tid>)>>;

    /// Stages a new revision of `oid` in the transaction that holds
    /// the commit lock. `serial` is the TID of the revision the
    /// new data was derived from, `Tid::ZERO` for new objects.
    fn store(&self, oid: Oid, serial: Tid, data: &[u8], txn: &TxnInfo) -> Result<StoreStatus>;

    /// Takes the commit lock, blocking until it is available.
    /// `tid` and `status` force the TID and status byte of the
    /// frame, for copying transactions from another storage.
    fn tpc_begin(&self, txn: &TxnInfo, tid: Option<Tid>, status: Option<TxnStatus>) -> Result<()>;

    fn tpc_vote(&self, txn: &TxnInfo) -> Result<()>;

    /// Makes the transaction durable and visible. `callback` runs
    /// with the new TID and the touched oids after the commit is
    /// durable but before `last_transaction` reports it.
    fn tpc_finish(&self, txn: &TxnInfo, callback: &mut dyn FnMut(Tid, &[Oid])) -> Result<Tid>;

    /// Discards everything staged by `txn`. A no-op if `txn` does
    /// not hold the commit lock.
    fn tpc_abort(&self, txn: &TxnInfo) -> Result<()>;

    /// Stages, in `txn`, the inverse of the committed transaction
    /// `tid`. Returns the affected oids.
    fn undo(&self, tid: Tid, txn: &TxnInfo) -> Result<Vec<Oid>>;

    /// Undoable transactions, most recent first, skipping `first`
    /// and stopping before `last`.
    fn undo_log(&self, first: usize, last: usize) -> Result<Vec<UndoInfo>>;

    /// Removes revisions that were superseded at `time` and objects
    /// unreachable from the root at `time`.
    fn pack(&self, time: SystemTime) -> Result<PackStats>;

    /// The newest revisions of `oid`, at most `size` of them.
    fn history(&self, oid: Oid, size: usize) -> Result<Vec<RevisionInfo>>;

    /// Committed transactions with `start <= tid <= end`, in order.
    fn iterator(
        &self,
        start: Option<Tid>,
        end: Option<Tid>,
    ) -> Result<Box<dyn Iterator<Item = Result<TransactionRecord>> + Send>>;

    fn last_transaction(&self) -> Tid;

    fn is_read_only(&self) -> bool;

    fn close(&self) -> Result<()>;
}

impl Storage for FileStorage {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn new_oid(&self) -> Result<Oid> {
        self.allocate_oid()
    }

    fn load(&self, oid: Oid, at: Option<Tid>) -> Result<(Vec<u8>, Tid)> {
        self.read_object(oid, at)
    }

    fn load_serial(&self, oid: Oid, serial: Tid) -> Result<Vec<u8>> {
        self.read_serial(oid, serial)
    }

    fn load_before(&self, oid: Oid, tid: Tid) -> Result<Option<(Vec<u8>, Tid, Option<Tid>)>> {
        self.read_before(oid, tid)
    }

    fn store(&self, oid: Oid, serial: Tid, data: &[u8], txn: &TxnInfo) -> Result<StoreStatus> {
        self.stage(oid, serial, data, txn)
    }

    fn tpc_begin(&self, txn: &TxnInfo, tid: Option<Tid>, status: Option<TxnStatus>) -> Result<()> {
        self.begin(txn, tid, status)
    }

    fn tpc_vote(&self, txn: &TxnInfo) -> Result<()> {
        self.vote(txn)
    }

    fn tpc_finish(&self, txn: &TxnInfo, callback: &mut dyn FnMut(Tid, &[Oid])) -> Result<Tid> {
        self.finish(txn, callback)
    }

    fn tpc_abort(&self, txn: &TxnInfo) -> Result<()> {
        self.abort(txn)
    }

    fn undo(&self, tid: Tid, txn: &TxnInfo) -> Result<Vec<Oid>> {
        self.undo_txn(tid, txn)
    }

    fn undo_log(&self, first: usize, last: usize) -> Result<Vec<UndoInfo>> {
        self.read_undo_log(first, last)
    }

    fn pack(&self, time: SystemTime) -> Result<PackStats> {
        self.pack_until(time)
    }

    fn history(&self, oid: Oid, size: usize) -> Result<Vec<RevisionInfo>> {
        self.read_history(oid, size)
    }

    fn iterator(
        &self,
        start: Option<Tid>,
        end: Option<Tid>,
    ) -> Result<Box<dyn Iterator<Item = Result<TransactionRecord>> + Send>> {
        Ok(Box::new(TransactionIterator::new(self, start, end)?))
    }

    fn last_transaction(&self) -> Tid {
        FileStorage::last_transaction(self)
    }

    fn is_read_only(&self) -> bool {
        FileStorage::is_read_only(self)
    }

    fn close(&self) -> Result<()> {
        FileStorage::close(self)
    }
}
