use std::io;

use thiserror::Error;

use crate::{Oid, Tid};

/// Errors surfaced by the storage, the transaction machinery
/// and connections.
#[derive(Error, Debug)]
pub enum Error {
    /// The object is not present in the index, or it does not
    /// exist in the requested revision.
    #[error("object {0} not found")]
    PosKey(Oid),

    /// A store was attempted against a stale serial and the
    /// object's class could not merge the concurrent changes.
    #[error(
        "database conflict error (oid {oid}, serial this txn started with {expected}, \
         serial currently committed {committed})"
    )]
    Conflict {
        oid: Oid,
        expected: Tid,
        committed: Tid,
    },

    /// The object changed after the reader's snapshot and either
    /// no revision visible to the snapshot remains, or the
    /// changed object is pinned by the current transaction.
    #[error("database read conflict error (oid {0})")]
    ReadConflict(Oid),

    #[error("cannot undo transaction {tid}: {reason}")]
    Undo { tid: Tid, reason: String },

    /// Corruption or a failure during the second commit phase.
    #[error("storage error: {0}")]
    Storage(String),

    /// The two-phase commit protocol was used incorrectly.
    #[error("storage transaction error: {0}")]
    StorageTransaction(String),

    #[error("storage is read-only")]
    ReadOnly,

    #[error("transaction is doomed and cannot be committed")]
    Doomed,

    /// A previous commit attempt of this transaction failed; it
    /// must be aborted before anything else can happen.
    #[error("an operation previously failed, with traceback: {0}")]
    TransactionFailed(String),

    #[error("connection state error: {0}")]
    ConnectionState(String),

    #[error("savepoint has been invalidated")]
    InvalidSavepoint,

    #[error("data manager {0} does not support savepoints")]
    SavepointUnsupported(String),

    #[error("no class registered for class id {0:?}")]
    UnknownClass(String),

    #[error("object {oid} holds a {found}, not a {expected}")]
    WrongType {
        oid: Oid,
        expected: &'static str,
        found: String,
    },

    #[error("malformed pickle: {0}")]
    Pickle(String),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Errors where retrying the whole transaction may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Conflict { .. } | Error::ReadConflict(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
