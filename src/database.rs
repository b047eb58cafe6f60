use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering::SeqCst};
use std::sync::{Arc, Weak};
use std::time::{Instant, SystemTime};

use parking_lot::{Condvar, Mutex};

use crate::connection::{ConnInner, Connection};
use crate::transaction::{next_txn_id, DataManager, Transaction};
use crate::{
    Config, Error, Oid, PackStats, PersistentMapping, Result, RevisionInfo, Serializer, Storage,
    Tid, TransactionManager, TxnInfo, UndoInfo,
};

struct Pool {
    idle: Vec<Arc<ConnInner>>,
    // connections handed out and not yet returned
    open: usize,
}

pub(crate) struct DbInner {
    storage: Arc<dyn Storage>,
    serializer: Arc<Serializer>,
    config: Config,
    pool: Mutex<Pool>,
    pool_cv: Condvar,
    // every live non-historical connection, for invalidations
    connections: Mutex<Vec<Weak<ConnInner>>>,
    historical: Mutex<Vec<Arc<ConnInner>>>,
    next_conn_id: AtomicU64,
    closed: AtomicBool,
}

impl DbInner {
    /// Queues `oids` for invalidation at `tid` on every connection
    /// except `exclude`. Runs inside the storage's commit, before
    /// the new tid becomes visible through `last_transaction`.
    pub(crate) fn invalidate(&self, tid: Tid, oids: &[Oid], exclude: Option<u64>) {
        let mut connections = self.connections.lock();
        connections.retain(|conn| conn.strong_count() > 0);
        for conn in connections.iter().filter_map(Weak::upgrade) {
            if Some(conn.id()) != exclude {
                conn.enqueue(tid, oids);
            }
        }
        log::trace!(
            "queued {} invalidations at {tid} for {} connections",
            oids.len(),
            connections.len()
        );
    }

    /// Takes back a connection closed by its user.
    pub(crate) fn release(&self, conn: Arc<ConnInner>) {
        if conn.historical().is_some() {
            let mut historical = self.historical.lock();
            if !self.closed.load(SeqCst) && self.config.historical_pool_size > 0 {
                if historical.len() >= self.config.historical_pool_size {
                    historical.remove(0);
                }
                historical.push(conn);
            }
            return;
        }

        let mut pool = self.pool.lock();
        pool.open = pool.open.saturating_sub(1);
        if !self.closed.load(SeqCst) && pool.idle.len() < self.config.pool_size {
            pool.idle.push(conn);
        }
        drop(pool);

        self.pool_cv.notify_one();
    }

    /// Gives up on a connection that cannot be pooled again.
    pub(crate) fn forget(&self, conn: &Arc<ConnInner>) {
        if conn.historical().is_none() {
            let mut pool = self.pool.lock();
            pool.open = pool.open.saturating_sub(1);
            drop(pool);
            self.pool_cv.notify_one();
        }
        let id = conn.id();
        self.connections
            .lock()
            .retain(|other| other.upgrade().map_or(false, |other| other.id() != id));
    }
}

/// A pool of connections to one storage.
///
/// Cloning is cheap and yields another handle to the same
/// database.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DbInner>,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("storage", &self.inner.storage.name())
            .field("open_connections", &self.open_connections())
            .finish()
    }
}

impl Database {
    /// Wraps an open storage, storing an empty root mapping if the
    /// storage has none yet.
    pub fn new(storage: Arc<dyn Storage>, serializer: Arc<Serializer>, config: Config) -> Result<Database> {
        let db = Database {
            inner: Arc::new(DbInner {
                storage,
                serializer,
                config,
                pool: Mutex::new(Pool {
                    idle: vec![],
                    open: 0,
                }),
                pool_cv: Condvar::new(),
                connections: Mutex::new(vec![]),
                historical: Mutex::new(vec![]),
                next_conn_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        };

        db.ensure_root()?;

        log::debug!(
            "opened database on {} at {}",
            db.inner.storage.name(),
            db.inner.storage.last_transaction()
        );

        Ok(db)
    }

    fn ensure_root(&self) -> Result<()> {
        let storage = &self.inner.storage;

        match storage.load(Oid::ROOT, None) {
            Ok(_) => return Ok(()),
            Err(Error::PosKey(_)) if !storage.is_read_only() => {}
            Err(Error::PosKey(_)) => {
                log::warn!("read-only storage {} has no root object", storage.name());
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let info = TxnInfo {
            id: next_txn_id(),
            description: "initial database creation".into(),
            ..TxnInfo::default()
        };
        let pickle = self.inner.serializer.serialize(&PersistentMapping::new())?;

        storage.tpc_begin(&info, None, None)?;

        let res = (|| {
            storage.store(Oid::ROOT, Tid::ZERO, &pickle, &info)?;
            storage.tpc_vote(&info)?;
            storage.tpc_finish(&info, &mut |_, _| {})
        })();

        match res {
            Ok(tid) => {
                log::debug!("stored the root object of {} at {tid}", storage.name());
                Ok(())
            }
            Err(e) => {
                if let Err(abort_error) = storage.tpc_abort(&info) {
                    log::error!("failed to abort root creation: {:?}", abort_error);
                }
                Err(e)
            }
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.inner.closed.load(SeqCst) {
            return Err(Error::ConnectionState("database is closed".into()));
        }
        Ok(())
    }

    fn new_connection(&self, historical: Option<Tid>) -> Arc<ConnInner> {
        let id = self.inner.next_conn_id.fetch_add(1, SeqCst);
        ConnInner::new(
            id,
            Arc::downgrade(&self.inner),
            self.inner.storage.clone(),
            self.inner.serializer.clone(),
            self.inner.config.cache_size,
            historical,
        )
    }

    /// Opens a connection bound to the calling thread's
    /// transaction manager.
    pub fn open(&self) -> Result<Connection> {
        self.open_with(&TransactionManager::for_thread())
    }

    /// Opens a connection whose changes join transactions of `tm`.
    ///
    /// Reuses an idle pooled connection if there is one. Once
    /// `pool_size` connections are open this waits up to
    /// `pool_timeout` for one to be closed, failing with
    /// `Error::ConnectionState` if none is.
    pub fn open_with(&self, tm: &TransactionManager) -> Result<Connection> {
        self.check_open()?;

        let pool_size = self.inner.config.pool_size;
        let deadline = self.inner.config.pool_timeout.map(|timeout| Instant::now() + timeout);

        let reused = {
            let mut pool = self.inner.pool.lock();
            while pool.open >= pool_size {
                let exhausted = Error::ConnectionState(format!(
                    "connection pool exhausted with {} connections open",
                    pool.open
                ));
                let deadline = match deadline {
                    Some(deadline) => deadline,
                    None => return Err(exhausted),
                };
                if self.inner.pool_cv.wait_until(&mut pool, deadline).timed_out()
                    && pool.open >= pool_size
                {
                    return Err(exhausted);
                }
            }
            pool.open += 1;
            pool.idle.pop()
        };

        let conn = match reused {
            Some(conn) => conn,
            None => {
                let conn = self.new_connection(None);
                self.inner.connections.lock().push(Arc::downgrade(&conn));
                conn
            }
        };

        if let Err(e) = conn.reopen(tm) {
            self.inner.forget(&conn);
            return Err(e);
        }

        Ok(Connection::new(conn))
    }

    /// Opens a read-only connection that sees the database as it
    /// was right after the transaction `at` committed.
    pub fn open_at(&self, at: Tid) -> Result<Connection> {
        self.check_open()?;

        let last = self.inner.storage.last_transaction();
        if at > last {
            return Err(Error::ConnectionState(format!(
                "cannot open a connection at {at}, the last transaction is {last}"
            )));
        }

        let reused = {
            let mut historical = self.inner.historical.lock();
            historical
                .iter()
                .position(|conn| conn.historical() == Some(at))
                .map(|idx| historical.remove(idx))
        };

        let conn = match reused {
            Some(conn) => conn,
            None => self.new_connection(Some(at)),
        };

        conn.reopen(&TransactionManager::for_thread())?;

        Ok(Connection::new(conn))
    }

    /// Joins the undo of transaction `tid` to the current
    /// transaction of `tm`. Takes effect when that transaction
    /// commits.
    pub fn undo(&self, tid: Tid, tm: &TransactionManager) -> Result<()> {
        self.undo_multiple(&[tid], tm)
    }

    pub fn undo_multiple(&self, tids: &[Tid], tm: &TransactionManager) -> Result<()> {
        self.check_open()?;
        if self.inner.storage.is_read_only() {
            return Err(Error::ReadOnly);
        }

        let txn = tm.get();
        txn.join(Arc::new(TransactionalUndo {
            db: Arc::downgrade(&self.inner),
            storage: self.inner.storage.clone(),
            tids: tids.to_vec(),
            info: Mutex::new(None),
        }))
    }

    /// Undoable transactions, most recent first.
    pub fn undo_log(&self, first: usize, last: usize) -> Result<Vec<UndoInfo>> {
        self.inner.storage.undo_log(first, last)
    }

    pub fn history(&self, oid: Oid, size: usize) -> Result<Vec<RevisionInfo>> {
        self.inner.storage.history(oid, size)
    }

    /// Packs the storage as of `time`, defaulting to now.
    pub fn pack(&self, time: Option<SystemTime>) -> Result<PackStats> {
        self.check_open()?;
        let stats = self.inner.storage.pack(time.unwrap_or_else(SystemTime::now))?;
        log::debug!("packed {} as of {}", self.inner.storage.name(), stats.pack_tid);
        Ok(stats)
    }

    pub fn last_transaction(&self) -> Tid {
        self.inner.storage.last_transaction()
    }

    pub fn storage(&self) -> Arc<dyn Storage> {
        self.inner.storage.clone()
    }

    pub fn serializer(&self) -> Arc<Serializer> {
        self.inner.serializer.clone()
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Connections handed out and not yet closed, not counting
    /// historical ones.
    pub fn open_connections(&self) -> usize {
        self.inner.pool.lock().open
    }

    /// Closes every connection, pooled or not, and then the
    /// storage. Connections still held by callers fail every
    /// further operation.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, SeqCst) {
            return Ok(());
        }

        let live: Vec<Arc<ConnInner>> = self
            .inner
            .connections
            .lock()
            .drain(..)
            .filter_map(|conn| conn.upgrade())
            .collect();
        for conn in &live {
            conn.mark_closed();
        }

        self.inner.pool.lock().idle.clear();
        self.inner.historical.lock().clear();
        self.inner.pool_cv.notify_all();

        log::debug!("closing database on {}", self.inner.storage.name());

        self.inner.storage.close()
    }
}

/// Data manager that undoes transactions as part of a commit.
struct TransactionalUndo {
    db: Weak<DbInner>,
    storage: Arc<dyn Storage>,
    tids: Vec<Tid>,
    info: Mutex<Option<TxnInfo>>,
}

impl TransactionalUndo {
    fn info(&self) -> Result<TxnInfo> {
        self.info
            .lock()
            .clone()
            .ok_or_else(|| Error::StorageTransaction("undo is not in a two-phase commit".into()))
    }
}

impl DataManager for TransactionalUndo {
    fn sort_key(&self) -> String {
        self.storage.sort_key()
    }

    fn abort(&self, _txn: &Transaction) -> Result<()> {
        Ok(())
    }

    fn tpc_begin(&self, txn: &Transaction) -> Result<()> {
        let info = txn.info()?;
        self.storage.tpc_begin(&info, None, None)?;
        *self.info.lock() = Some(info);
        Ok(())
    }

    fn commit(&self, _txn: &Transaction) -> Result<()> {
        let info = self.info()?;
        for tid in &self.tids {
            let oids = self.storage.undo(*tid, &info)?;
            log::debug!("undoing {tid} touches {} objects", oids.len());
        }
        Ok(())
    }

    fn tpc_vote(&self, _txn: &Transaction) -> Result<()> {
        self.storage.tpc_vote(&self.info()?)
    }

    fn tpc_finish(&self, _txn: &Transaction) -> Result<()> {
        let info = self.info()?;
        let db = self.db.clone();
        self.storage.tpc_finish(&info, &mut |tid, oids| {
            if let Some(db) = db.upgrade() {
                db.invalidate(tid, oids, None);
            }
        })?;
        *self.info.lock() = None;
        Ok(())
    }

    fn tpc_abort(&self, _txn: &Transaction) -> Result<()> {
        let info = self.info.lock().take();
        match info {
            Some(info) => self.storage.tpc_abort(&info),
            None => Ok(()),
        }
    }
}
