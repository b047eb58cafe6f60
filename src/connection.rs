use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering::SeqCst};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::cache::ObjectCache;
use crate::database::DbInner;
use crate::staging::{Staging, StagingMark};
use crate::transaction::{DataManager, ResourceSavepoint, Synchronizer, Transaction};
use crate::{
    Error, ObjectState, ObjectStatus, Oid, PObject, Persistable, Result, Serializer, Set,
    Storage, StoreStatus, Tid, TransactionManager, TxnInfo,
};

struct ConnState {
    // reads are satisfied as of this tid
    snapshot: Tid,
    cache: ObjectCache,
    // registered since the last savepoint, in registration order
    modified: Vec<Oid>,
    modified_set: Set<Oid>,
    added: Set<Oid>,
    staging: Staging,
    // id of the transaction this connection is joined to
    joined: Option<u64>,
    // metadata passed to the storage between tpc_begin and tpc_finish
    committing: Option<TxnInfo>,
    resolved: Vec<Oid>,
    manager: Option<TransactionManager>,
    synch_key: Option<u64>,
    closed: bool,
}

/// The shared part of a connection. Objects point back at it,
/// transactions hold it as a data manager and the database keeps
/// it in its pool.
pub(crate) struct ConnInner {
    id: u64,
    me: Weak<ConnInner>,
    db: Weak<DbInner>,
    storage: Arc<dyn Storage>,
    serializer: Arc<Serializer>,
    historical: Option<Tid>,
    // commits by other connections, not yet applied to the cache
    inbox: Mutex<BTreeMap<Tid, Vec<Oid>>>,
    state: Mutex<ConnState>,
}

impl ConnInner {
    pub(crate) fn new(
        id: u64,
        db: Weak<DbInner>,
        storage: Arc<dyn Storage>,
        serializer: Arc<Serializer>,
        cache_size: usize,
        historical: Option<Tid>,
    ) -> Arc<ConnInner> {
        let snapshot = historical.unwrap_or_else(|| storage.last_transaction());

        Arc::new_cyclic(|me| ConnInner {
            id,
            me: me.clone(),
            db,
            storage,
            serializer,
            historical,
            inbox: Mutex::new(BTreeMap::new()),
            state: Mutex::new(ConnState {
                snapshot,
                cache: ObjectCache::new(cache_size),
                modified: vec![],
                modified_set: Set::default(),
                added: Set::default(),
                staging: Staging::default(),
                joined: None,
                committing: None,
                resolved: vec![],
                manager: None,
                synch_key: None,
                closed: true,
            }),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn historical(&self) -> Option<Tid> {
        self.historical
    }

    fn me(&self) -> Result<Arc<ConnInner>> {
        self.me
            .upgrade()
            .ok_or_else(|| Error::ConnectionState(format!("connection {} is gone", self.id)))
    }

    fn check_open(state: &ConnState) -> Result<()> {
        if state.closed {
            return Err(Error::ConnectionState("connection is closed".into()));
        }
        Ok(())
    }

    /// Hands the connection to a new user of `manager`.
    pub(crate) fn reopen(&self, manager: &TransactionManager) -> Result<()> {
        let me = self.me()?;

        if self.historical.is_none() {
            let synch: Arc<dyn Synchronizer> = me;
            let key = manager.register_synch(Arc::downgrade(&synch));
            let mut state = self.state.lock();
            state.synch_key = Some(key);
        }

        {
            let mut state = self.state.lock();
            state.manager = Some(manager.clone());
            state.closed = false;
        }

        self.sync();

        log::trace!("connection {} opened at {}", self.id, self.snapshot());

        Ok(())
    }

    /// Marks the connection closed and stops listening to its
    /// transaction manager. Fails if it has uncommitted changes.
    pub(crate) fn release(&self) -> Result<()> {
        let (manager, key) = {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(());
            }
            if state.joined.is_some() {
                return Err(Error::ConnectionState(
                    "cannot close a connection joined to a transaction".into(),
                ));
            }
            state.closed = true;
            (state.manager.take(), state.synch_key.take())
        };

        if let (Some(manager), Some(key)) = (manager, key) {
            manager.unregister_synch(key);
        }

        Ok(())
    }

    /// Stops listening to the transaction manager even if joined.
    /// The transaction can still finish with this connection, but
    /// the connection is never handed out again.
    pub(crate) fn detach(&self) {
        let (manager, key) = {
            let mut state = self.state.lock();
            (state.manager.take(), state.synch_key.take())
        };
        if let (Some(manager), Some(key)) = (manager, key) {
            manager.unregister_synch(key);
        }
    }

    pub(crate) fn mark_closed(&self) {
        self.state.lock().closed = true;
    }

    pub(crate) fn is_joined(&self) -> bool {
        self.state.lock().joined.is_some()
    }

    pub(crate) fn snapshot(&self) -> Tid {
        self.state.lock().snapshot
    }

    /// Queues an invalidation from a commit made elsewhere.
    pub(crate) fn enqueue(&self, tid: Tid, oids: &[Oid]) {
        if self.historical.is_some() {
            return;
        }
        self.inbox.lock().entry(tid).or_default().extend_from_slice(oids);
    }

    /// Advances the snapshot to the last committed transaction and
    /// ghosts every cached object that changed since. Objects with
    /// uncommitted changes are left alone; their stale serial makes
    /// the storage detect the conflict at commit.
    pub(crate) fn sync(&self) {
        if self.historical.is_some() {
            return;
        }

        let last = self.storage.last_transaction();

        let stale = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }

            let ready = {
                let mut inbox = self.inbox.lock();
                let newer = inbox.split_off(&last.next());
                std::mem::replace(&mut *inbox, newer)
            };

            if last > state.snapshot {
                state.snapshot = last;
            }

            let mut stale = vec![];
            for oid in ready.into_values().flatten() {
                if let Some(obj) = state.cache.peek(oid) {
                    if obj.status() != ObjectStatus::Changed {
                        stale.push(obj.clone());
                    }
                }
            }

            state.cache.gc();

            stale
        };

        if !stale.is_empty() {
            log::trace!(
                "connection {} invalidated {} objects at {last}",
                self.id,
                stale.len()
            );
        }

        for obj in stale {
            obj.invalidate();
        }
    }

    /// Loads the state of `oid` as of the snapshot, preferring
    /// state written by a savepoint.
    pub(crate) fn load_state(&self, oid: Oid) -> Result<(Tid, Box<dyn ObjectState>)> {
        let at = {
            let state = self.state.lock();
            ConnInner::check_open(&state)?;
            if let Some((serial, pickle)) = state.staging.get(oid) {
                return Ok((serial, self.serializer.deserialize(pickle)?));
            }
            self.historical.unwrap_or(state.snapshot)
        };

        let (data, serial) = self.storage.load(oid, Some(at))?;
        log::trace!("connection {} loaded {oid} at {serial}", self.id);

        Ok((serial, self.serializer.deserialize(&data)?))
    }

    pub(crate) fn touch(&self, oid: Oid) {
        self.state.lock().cache.touch(oid);
    }

    fn check_writable(&self) -> Result<TransactionManager> {
        if self.historical.is_some() || self.storage.is_read_only() {
            return Err(Error::ReadOnly);
        }
        let state = self.state.lock();
        ConnInner::check_open(&state)?;
        state
            .manager
            .clone()
            .ok_or_else(|| Error::ConnectionState("connection has no transaction manager".into()))
    }

    fn join(&self, txn: &Transaction) -> Result<()> {
        if self.state.lock().joined == Some(txn.id()) {
            return Ok(());
        }

        txn.join(self.me()?)?;

        self.state.lock().joined = Some(txn.id());
        Ok(())
    }

    /// Records that `oid` is about to change in the current
    /// transaction.
    pub(crate) fn register(&self, oid: Oid) -> Result<()> {
        let manager = self.check_writable()?;
        let txn = manager.get();
        self.join(&txn)?;

        let mut state = self.state.lock();
        if state.modified_set.insert(oid) {
            state.modified.push(oid);
        }
        Ok(())
    }

    fn add<T: Persistable>(&self, value: T) -> Result<Arc<PObject>> {
        if !self.serializer.is_registered(T::CLASS_ID) {
            return Err(Error::UnknownClass(T::CLASS_ID.to_owned()));
        }
        self.check_writable()?;

        let oid = self.storage.new_oid()?;
        let obj = Arc::new(PObject::new_added(oid, self.me.clone(), Box::new(value)));

        self.register(oid)?;

        let mut state = self.state.lock();
        state.added.insert(oid);
        state.cache.insert(obj.clone());

        Ok(obj)
    }

    fn get(&self, oid: Oid) -> Result<Arc<PObject>> {
        {
            let mut state = self.state.lock();
            ConnInner::check_open(&state)?;
            if let Some(obj) = state.cache.get(oid) {
                return Ok(obj);
            }
        }

        let (serial, loaded) = self.load_state(oid)?;
        let obj = Arc::new(PObject::new_loaded(oid, self.me.clone(), serial, loaded));

        let mut state = self.state.lock();
        if let Some(existing) = state.cache.get(oid) {
            return Ok(existing);
        }
        state.cache.insert(obj.clone());

        Ok(obj)
    }

    fn info(&self) -> Result<TxnInfo> {
        self.state.lock().committing.clone().ok_or_else(|| {
            Error::StorageTransaction(format!(
                "connection {} is not in a two-phase commit",
                self.id
            ))
        })
    }

    /// Objects whose state was written by the current transaction,
    /// either directly or through a savepoint.
    fn touched_objects(state: &ConnState) -> Vec<Arc<PObject>> {
        let staged = state.staging.current().map(|(oid, _, _)| oid);
        let mut oids: Vec<Oid> = staged.chain(state.modified.iter().copied()).collect();
        oids.sort();
        oids.dedup();
        oids.iter()
            .filter_map(|oid| state.cache.peek(*oid).cloned())
            .collect()
    }

    /// Throws away the changes of the current transaction.
    fn discard(&self) {
        let (touched, added) = {
            let mut state = self.state.lock();
            let touched = ConnInner::touched_objects(&state);
            let added: Vec<Oid> = state.added.drain().collect();
            let added: Vec<Arc<PObject>> = added
                .into_iter()
                .filter_map(|oid| state.cache.remove(oid))
                .collect();
            state.modified.clear();
            state.modified_set.clear();
            state.staging.clear();
            state.resolved.clear();
            state.committing = None;
            state.joined = None;
            (touched, added)
        };

        log::trace!(
            "connection {} discarded {} changed and {} added objects",
            self.id,
            touched.len(),
            added.len()
        );

        for obj in touched.iter().chain(added.iter()) {
            obj.invalidate();
        }
    }

    fn serialize(&self, obj: &PObject) -> Result<(Tid, Vec<u8>)> {
        obj.snapshot_state(|state| self.serializer.serialize(state))?
            .ok_or_else(|| {
                Error::ConnectionState(format!("{} lost its state before commit", obj.oid()))
            })
    }
}

impl DataManager for ConnInner {
    fn sort_key(&self) -> String {
        self.storage.sort_key()
    }

    fn abort(&self, _txn: &Transaction) -> Result<()> {
        self.discard();
        Ok(())
    }

    fn tpc_begin(&self, txn: &Transaction) -> Result<()> {
        if self.state.lock().joined != Some(txn.id()) {
            return Err(Error::StorageTransaction(format!(
                "connection {} is not joined to transaction {}",
                self.id,
                txn.id()
            )));
        }

        let info = txn.info()?;
        self.storage.tpc_begin(&info, None, None)?;
        self.state.lock().committing = Some(info);
        Ok(())
    }

    fn commit(&self, _txn: &Transaction) -> Result<()> {
        let info = self.info()?;

        let (staged, objects) = {
            let state = self.state.lock();
            let staged: Vec<(Oid, Tid, Vec<u8>)> = state
                .staging
                .current()
                .filter(|(oid, _, _)| !state.modified_set.contains(oid))
                .map(|(oid, serial, pickle)| (oid, serial, pickle.to_vec()))
                .collect();
            let objects: Vec<Arc<PObject>> = state
                .modified
                .iter()
                .filter_map(|oid| state.cache.peek(*oid).cloned())
                .collect();
            (staged, objects)
        };

        let mut resolved = vec![];

        for (oid, serial, pickle) in &staged {
            if self.storage.store(*oid, *serial, pickle, &info)? == StoreStatus::Resolved {
                resolved.push(*oid);
            }
        }

        for obj in &objects {
            let (serial, pickle) = self.serialize(obj)?;
            if self.storage.store(obj.oid(), serial, &pickle, &info)? == StoreStatus::Resolved {
                resolved.push(obj.oid());
            }
        }

        log::trace!(
            "connection {} stored {} objects, {} resolved",
            self.id,
            staged.len() + objects.len(),
            resolved.len()
        );

        self.state.lock().resolved = resolved;

        Ok(())
    }

    fn tpc_vote(&self, _txn: &Transaction) -> Result<()> {
        let info = self.info()?;
        self.storage.tpc_vote(&info)
    }

    fn tpc_finish(&self, _txn: &Transaction) -> Result<()> {
        let info = self.info()?;
        let db = self.db.clone();
        let id = self.id;

        let tid = self.storage.tpc_finish(&info, &mut |tid, oids| {
            if let Some(db) = db.upgrade() {
                db.invalidate(tid, oids, Some(id));
            }
        })?;

        let (touched, resolved) = {
            let mut state = self.state.lock();
            let touched = ConnInner::touched_objects(&state);
            let resolved: Set<Oid> = state.resolved.drain(..).collect();
            state.modified.clear();
            state.modified_set.clear();
            state.added.clear();
            state.staging.clear();
            state.committing = None;
            state.joined = None;
            (touched, resolved)
        };

        for obj in touched {
            if resolved.contains(&obj.oid()) {
                // the stored state is a merge the object never held
                obj.invalidate();
            } else {
                obj.mark_saved(tid);
            }
        }

        Ok(())
    }

    fn tpc_abort(&self, _txn: &Transaction) -> Result<()> {
        let committing = self.state.lock().committing.take();
        if let Some(info) = committing {
            self.storage.tpc_abort(&info)?;
        }
        self.discard();
        Ok(())
    }

    fn savepoint(&self, _txn: &Transaction) -> Result<Box<dyn ResourceSavepoint>> {
        let objects: Vec<Arc<PObject>> = {
            let state = self.state.lock();
            ConnInner::check_open(&state)?;
            state
                .modified
                .iter()
                .filter_map(|oid| state.cache.peek(*oid).cloned())
                .collect()
        };

        let mut pickles = Vec::with_capacity(objects.len());
        for obj in &objects {
            let (serial, pickle) = self.serialize(obj)?;
            pickles.push((obj.oid(), serial, pickle));
        }

        let (mark, added) = {
            let mut state = self.state.lock();
            for (oid, serial, pickle) in pickles {
                state.staging.stage(oid, serial, pickle);
            }
            state.modified.clear();
            state.modified_set.clear();
            (state.staging.mark(), state.added.clone())
        };

        for obj in &objects {
            obj.mark_saved(obj.serial());
        }

        log::trace!(
            "connection {} staged {} objects for a savepoint",
            self.id,
            objects.len()
        );

        Ok(Box::new(ConnSavepoint {
            conn: self.me()?,
            mark,
            added,
        }))
    }
}

impl Synchronizer for ConnInner {
    fn after_completion(&self, _txn: &Transaction) {
        self.sync();
    }

    fn new_transaction(&self, _txn: &Transaction) {
        self.sync();
    }
}

struct ConnSavepoint {
    conn: Arc<ConnInner>,
    mark: StagingMark,
    added: Set<Oid>,
}

impl ResourceSavepoint for ConnSavepoint {
    fn rollback(&self) -> Result<()> {
        let conn = &self.conn;

        let (stale, evicted) = {
            let mut state = conn.state.lock();

            let mut oids = state.staging.reset(&self.mark);
            oids.extend(state.modified.drain(..));
            state.modified_set.clear();

            let late: Vec<Oid> = state
                .added
                .iter()
                .filter(|oid| !self.added.contains(*oid))
                .copied()
                .collect();
            let mut evicted = vec![];
            for oid in &late {
                state.added.remove(oid);
                evicted.extend(state.cache.remove(*oid));
            }

            let stale: Vec<Arc<PObject>> = oids
                .iter()
                .filter_map(|oid| state.cache.peek(*oid).cloned())
                .collect();

            (stale, evicted)
        };

        log::trace!(
            "connection {} rolled back {} objects and dropped {} added ones",
            conn.id,
            stale.len(),
            evicted.len()
        );

        for obj in stale.iter().chain(evicted.iter()) {
            obj.invalidate();
        }

        Ok(())
    }
}

/// A session on a database: a cache of live objects read as of
/// one snapshot, joined to the current transaction of a
/// `TransactionManager` whenever an object is changed.
///
/// A connection must not be used by several threads at once.
/// Dropping it returns it to the database's pool.
pub struct Connection {
    inner: Arc<ConnInner>,
    closed: AtomicBool,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("snapshot", &self.snapshot())
            .field("historical", &self.is_historical())
            .finish()
    }
}

impl Connection {
    pub(crate) fn new(inner: Arc<ConnInner>) -> Connection {
        Connection {
            inner,
            closed: AtomicBool::new(false),
        }
    }

    /// The database root, a `PersistentMapping` at `Oid::ROOT`.
    pub fn root(&self) -> Result<Arc<PObject>> {
        self.get(Oid::ROOT)
    }

    /// Returns the object with `oid`, loading it as of the
    /// connection's snapshot if it is not cached. The same oid
    /// yields the same `PObject` for as long as it is referenced.
    pub fn get(&self, oid: Oid) -> Result<Arc<PObject>> {
        self.inner.get(oid)
    }

    /// Adds a new object to the database in the current
    /// transaction, assigning it an oid.
    pub fn add<T: Persistable>(&self, value: T) -> Result<Arc<PObject>> {
        self.inner.add(value)
    }

    /// Applies invalidations from commits made since the snapshot
    /// was taken and advances the snapshot. Happens on its own at
    /// every transaction boundary.
    pub fn sync(&self) {
        self.inner.sync()
    }

    /// The TID reads are satisfied at.
    pub fn snapshot(&self) -> Tid {
        self.inner.historical.unwrap_or_else(|| self.inner.snapshot())
    }

    pub fn is_historical(&self) -> bool {
        self.inner.historical.is_some()
    }

    pub fn transaction_manager(&self) -> Option<TransactionManager> {
        self.inner.state.lock().manager.clone()
    }

    /// Ghosts least recently used objects until the cache is back
    /// at its target size. Returns how many were ghosted.
    pub fn cache_gc(&self) -> usize {
        self.inner.state.lock().cache.gc()
    }

    /// Ghosts every object without uncommitted changes.
    pub fn cache_minimize(&self) -> usize {
        self.inner.state.lock().cache.minimize()
    }

    pub fn cache_len(&self) -> usize {
        self.inner.state.lock().cache.len()
    }

    pub fn cache_non_ghost_count(&self) -> usize {
        self.inner.state.lock().cache.non_ghost_count()
    }

    /// Returns the connection to the database's pool. Fails,
    /// leaving the connection open, while it is joined to a
    /// transaction.
    pub fn close(&self) -> Result<()> {
        if self.closed.load(SeqCst) {
            return Ok(());
        }

        self.inner.release()?;
        self.closed.store(true, SeqCst);

        if let Some(db) = self.inner.db.upgrade() {
            db.release(self.inner.clone());
        }

        log::trace!("connection {} closed", self.inner.id);

        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.closed.load(SeqCst) {
            return;
        }
        if let Err(e) = self.close() {
            log::warn!(
                "connection {} dropped without being closed: {:?}",
                self.inner.id,
                e
            );
            self.inner.detach();
            if let Some(db) = self.inner.db.upgrade() {
                db.forget(&self.inner);
            }
        }
    }
}
