//! # Granite
//!
//! Granite is a transactional, versioned object store. It maps
//! object identifiers (`Oid`s) to immutable, timestamped
//! revisions of serialized objects ("pickles"), ordering every
//! mutation through a single append-only, fsynced file log.
//!
//! The crate has three layers:
//!
//! * [`FileStorage`], the durable engine: an append-only log of
//!   transaction frames, an in-memory index from `Oid` to the
//!   current record, crash recovery by forward scan, two-phase
//!   commit, transactional undo and garbage-collecting pack.
//! * [`TransactionManager`] and [`Transaction`], which drive
//!   two-phase commit across any number of [`DataManager`]s and
//!   provide savepoints, dooming and synchronizer callbacks.
//! * [`Database`] and [`Connection`], which hand out live
//!   [`PObject`]s with snapshot isolation: every connection reads
//!   as of the TID at which its current transaction started, and
//!   commits by other connections arrive as invalidations that
//!   are applied at the next transaction boundary.
//!
//! # Examples
//!
//! ```
//! use granite::{Counter, PersistentMapping, TransactionManager};
//!
//! # let _ = std::fs::remove_dir_all("doc_example");
//! # std::fs::create_dir_all("doc_example").unwrap();
//! let db = granite::open("doc_example/data.fs").unwrap();
//! let tm = TransactionManager::new();
//! let conn = db.open_with(&tm).unwrap();
//!
//! // every database starts with an empty mapping at the root
//! let root = conn.root().unwrap();
//! let hits = conn.add(Counter::new(0)).unwrap();
//! root.write(|map: &mut PersistentMapping| map.insert("hits", hits.oid()))
//!     .unwrap();
//! hits.write(|counter: &mut Counter| counter.increment(1)).unwrap();
//! tm.commit().unwrap();
//!
//! // the committed state is visible after a restart
//! drop(conn);
//! db.close().unwrap();
//! let db = granite::open("doc_example/data.fs").unwrap();
//! let conn = db.open_with(&tm).unwrap();
//! let hits_oid = conn
//!     .root()
//!     .unwrap()
//!     .read(|map: &PersistentMapping| map.get("hits"))
//!     .unwrap()
//!     .unwrap();
//! let value = conn.get(hits_oid).unwrap().read(|c: &Counter| c.value()).unwrap();
//! assert_eq!(value, 1);
//! # drop(conn);
//! # db.close().unwrap();
//! # std::fs::remove_dir_all("doc_example").unwrap();
//! ```
//!
//! Storage behavior and pool sizes are set through [`Config`]:
//!
//! ```
//! # let _ = std::fs::remove_dir_all("doc_config");
//! # std::fs::create_dir_all("doc_config").unwrap();
//! let config = granite::Config {
//!     path: "doc_config/data.fs".into(),
//!     fsync_each_commit: false,
//!     pool_size: 2,
//!     cache_size: 1000,
//!     ..Default::default()
//! };
//!
//! let db = config.open().unwrap();
//! # db.close().unwrap();
//! # std::fs::remove_dir_all("doc_config").unwrap();
//! ```
use std::fmt;
use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::Arc;

use fault_injection::fallible;
use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};

mod cache;
mod classes;
mod config;
mod connection;
mod database;
mod error;
mod format;
mod index;
mod iterator;
mod pack;
mod persistent;
mod readpath;
mod recovery;
mod serialize;
mod staging;
mod storage;
mod tid;
mod transaction;
mod undo;
mod writepath;

pub use classes::{Counter, PersistentMapping};
pub use config::Config;
pub use connection::Connection;
pub use database::Database;
pub use error::{Error, Result};
pub use format::TxnStatus;
pub use iterator::TransactionIterator;
pub use persistent::{ObjectStatus, PObject};
pub use serialize::{ObjectState, Persistable, Pickle, PickleFormat, Serializer};
pub use storage::{
    DataRecord, PackStats, RevisionInfo, Storage, StoreStatus, TransactionRecord, TxnInfo,
    UndoInfo,
};
pub use tid::Tid;
pub use transaction::{
    DataManager, ResourceSavepoint, Savepoint, Synchronizer, Transaction, TransactionManager,
    TxnState,
};

use format::FrameWriter;
use index::Index;

#[derive(Clone, Copy)]
pub(crate) struct LocationHasher(u64);

impl Default for LocationHasher {
    #[inline]
    fn default() -> LocationHasher {
        LocationHasher(0)
    }
}

impl std::hash::Hasher for LocationHasher {
    #[inline]
    fn finish(&self) -> u64 {
        // object ids are handed out sequentially, so spread them
        // over the table before use
        self.0.wrapping_mul(0x9E37_79B9_7F4A_7C15)
    }

    #[inline]
    fn write_u64(&mut self, n: u64) {
        self.0 = n;
    }

    #[inline]
    fn write(&mut self, _: &[u8]) {
        panic!("trying to use LocationHasher with incorrect type");
    }
}

/// Hash map keyed by `Oid`.
pub(crate) type Map<K, V> =
    std::collections::HashMap<K, V, std::hash::BuildHasherDefault<LocationHasher>>;

/// Hash set of `Oid`s.
pub(crate) type Set<K> =
    std::collections::HashSet<K, std::hash::BuildHasherDefault<LocationHasher>>;

/// Object identifier. Assigned by the storage when an object is
/// first added and never reused. `Oid::ROOT` is reserved for the
/// database root mapping.
#[derive(
    Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Oid(u64);

impl Oid {
    pub const ROOT: Oid = Oid(0);

    pub const fn from_u64(raw: u64) -> Oid {
        Oid(raw)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn from_bytes(bytes: [u8; 8]) -> Oid {
        Oid(u64::from_be_bytes(bytes))
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

impl fmt::Debug for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Oid({:x})", self.0)
    }
}

fn read_range_at(file: &File, start: u64, end: u64) -> io::Result<Vec<u8>> {
    use std::os::unix::fs::FileExt;

    let buf_sz: usize = usize::try_from(end - start).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("read of {} bytes does not fit in memory", end - start),
        )
    })?;

    let mut buf = vec![0_u8; buf_sz];

    fallible!(file.read_exact_at(&mut buf, start));

    Ok(buf)
}

fn write_all_at(file: &File, buf: &[u8], at: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;

    fallible!(file.write_all_at(buf, at));

    Ok(())
}

/// Summary of the storage's current contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stats {
    /// Size of the data file in bytes, up to the last committed
    /// transaction.
    pub file_size: u64,
    /// Number of objects in the primary index.
    pub objects: usize,
    pub last_tid: Tid,
    pub last_oid: Oid,
    /// True if opened read-only or degraded after a failed commit.
    pub read_only: bool,
}

/// Open a database with default configuration at the provided
/// data file path, using the built-in persistent classes.
pub fn open<P: AsRef<Path>>(path: P) -> Result<Database> {
    let config = Config {
        path: path.as_ref().into(),
        ..Config::default()
    };

    config.open()
}

/// Durable storage engine keeping every object revision in one
/// append-only file.
///
/// Cloning is cheap and yields another handle to the same
/// storage. Loads never block on commits; only one transaction
/// at a time may be between `tpc_begin` and `tpc_finish`.
#[derive(Clone)]
pub struct FileStorage {
    shared: Arc<Shared>,
}

pub(crate) struct Shared {
    config: Config,
    name: String,
    // read side for positional reads and appends, write side to
    // swap in a packed file
    file: RwLock<File>,
    index: Index,
    format: Arc<dyn PickleFormat>,
    // id of the transaction holding the commit lock
    commit_owner: Mutex<Option<u64>>,
    commit_cv: Condvar,
    state: Mutex<State>,
    degraded: AtomicBool,
    closed: AtomicBool,
    // bumped whenever pack swaps in a rewritten file, which
    // invalidates every file position handed out before
    generation: AtomicU64,
    pack_lock: Mutex<()>,
    lock_file: File,
}

pub(crate) struct State {
    last_tid: Tid,
    last_oid: Oid,
    // transactions at or before this were rewritten by a pack
    pack_tid: Tid,
    // end of the last committed frame
    eof: u64,
    pending: Option<Pending>,
}

/// A transaction between `tpc_begin` and `tpc_finish`.
pub(crate) struct Pending {
    txn_id: u64,
    writer: FrameWriter,
    // status byte the frame gets at tpc_finish
    status: TxnStatus,
    // oid -> position of the record staged by this transaction
    tindex: Map<Oid, u64>,
    oids: Vec<Oid>,
    voted: bool,
}

impl fmt::Debug for FileStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileStorage")
            .field("name", &self.shared.name)
            .field("stats", &self.stats())
            .finish()
    }
}

impl fmt::Display for FileStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileStorage({})", self.shared.name)
    }
}

impl FileStorage {
    /// Statistics about the data file and index.
    pub fn stats(&self) -> Stats {
        let state = self.shared.state.lock();
        Stats {
            file_size: state.eof,
            objects: self.shared.index.len(),
            last_tid: state.last_tid,
            last_oid: state.last_oid,
            read_only: self.is_read_only(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }
}
