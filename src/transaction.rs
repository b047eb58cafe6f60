//! Transactions and two-phase commit across data managers.
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering::SeqCst};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::{Error, Result, TxnInfo};

static TXN_IDS: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_txn_id() -> u64 {
    TXN_IDS.fetch_add(1, SeqCst)
}

/// Lifecycle of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxnState {
    Active,
    /// Inside `commit`, between the first `tpc_begin` and the
    /// last `tpc_finish`.
    Committing,
    Committed,
    /// A commit attempt failed. Only `abort` is allowed.
    CommitFailed,
    Aborted,
    /// Can still be used and joined, but never committed.
    Doomed,
}

/// Something whose changes are made durable by two-phase commit.
///
/// During `Transaction::commit` every joined data manager sees
/// `tpc_begin`, then `commit`, then `tpc_vote`, then
/// `tpc_finish`, each phase completing for all data managers (in
/// `sort_key` order) before the next starts. If anything fails
/// before the last vote, data managers that did not vote get
/// `abort` and all of them get `tpc_abort`.
pub trait DataManager: Send + Sync {
    fn sort_key(&self) -> String;

    /// Discards changes made in `txn` outside of a commit.
    fn abort(&self, txn: &Transaction) -> Result<()>;

    fn tpc_begin(&self, txn: &Transaction) -> Result<()>;

    fn commit(&self, txn: &Transaction) -> Result<()>;

    fn tpc_vote(&self, txn: &Transaction) -> Result<()>;

    fn tpc_finish(&self, txn: &Transaction) -> Result<()>;

    fn tpc_abort(&self, txn: &Transaction) -> Result<()>;

    fn savepoint(&self, _txn: &Transaction) -> Result<Box<dyn ResourceSavepoint>> {
        Err(Error::SavepointUnsupported(self.sort_key()))
    }
}

/// One data manager's part of a transaction savepoint.
pub trait ResourceSavepoint: Send + Sync {
    fn rollback(&self) -> Result<()>;
}

/// Notified around transaction boundaries of a manager it is
/// registered with.
pub trait Synchronizer: Send + Sync {
    fn before_completion(&self, _txn: &Transaction) {}
    fn after_completion(&self, _txn: &Transaction) {}
    fn new_transaction(&self, _txn: &Transaction) {}
}

type BeforeCommitHook = Box<dyn FnOnce(&Transaction) -> Result<()> + Send>;
type AfterCommitHook = Box<dyn FnOnce(&Transaction, bool) + Send>;

struct TxnData {
    status: TxnState,
    resources: Vec<Arc<dyn DataManager>>,
    user: String,
    description: String,
    extension: BTreeMap<String, String>,
    before_commit: Vec<BeforeCommitHook>,
    after_commit: Vec<AfterCommitHook>,
    savepoints: Vec<Weak<SavepointInner>>,
    failure: Option<String>,
}

struct TxnInner {
    id: u64,
    manager: Weak<ManagerInner>,
    data: Mutex<TxnData>,
}

/// A unit of work spanning any number of data managers.
///
/// Cloning yields another handle to the same transaction.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TxnInner>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.inner.id)
            .field("status", &self.status())
            .finish()
    }
}

fn same_resource(a: &Arc<dyn DataManager>, b: &Arc<dyn DataManager>) -> bool {
    Arc::as_ptr(a) as *const u8 == Arc::as_ptr(b) as *const u8
}

impl Transaction {
    fn new(manager: Weak<ManagerInner>) -> Transaction {
        Transaction {
            inner: Arc::new(TxnInner {
                id: next_txn_id(),
                manager,
                data: Mutex::new(TxnData {
                    status: TxnState::Active,
                    resources: vec![],
                    user: String::new(),
                    description: String::new(),
                    extension: BTreeMap::new(),
                    before_commit: vec![],
                    after_commit: vec![],
                    savepoints: vec![],
                    failure: None,
                }),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn status(&self) -> TxnState {
        self.inner.data.lock().status
    }

    pub fn is_doomed(&self) -> bool {
        self.status() == TxnState::Doomed
    }

    pub fn user(&self) -> String {
        self.inner.data.lock().user.clone()
    }

    pub fn set_user<S: Into<String>>(&self, user: S) {
        self.inner.data.lock().user = user.into();
    }

    pub fn description(&self) -> String {
        self.inner.data.lock().description.clone()
    }

    /// Appends a line to the transaction description.
    pub fn note<S: AsRef<str>>(&self, text: S) {
        let text = text.as_ref().trim();
        if text.is_empty() {
            return;
        }
        let mut data = self.inner.data.lock();
        if !data.description.is_empty() {
            data.description.push('\n');
        }
        data.description.push_str(text);
    }

    pub fn set_extended_info<K: Into<String>, V: Into<String>>(&self, key: K, value: V) {
        self.inner.data.lock().extension.insert(key.into(), value.into());
    }

    pub fn extended_info(&self) -> BTreeMap<String, String> {
        self.inner.data.lock().extension.clone()
    }

    /// Decodes the extension bytes of a stored transaction back
    /// into the map passed to `set_extended_info`.
    pub fn decode_extension(bytes: &[u8]) -> Result<BTreeMap<String, String>> {
        if bytes.is_empty() {
            return Ok(BTreeMap::new());
        }
        Ok(bincode::deserialize(bytes)?)
    }

    /// The identity and metadata a storage records for this
    /// transaction.
    pub fn info(&self) -> Result<TxnInfo> {
        let data = self.inner.data.lock();
        let extension = if data.extension.is_empty() {
            vec![]
        } else {
            bincode::serialize(&data.extension)?
        };
        Ok(TxnInfo {
            id: self.inner.id,
            user: data.user.clone(),
            description: data.description.clone(),
            extension,
        })
    }

    /// Runs `hook` at the start of `commit`, before any data
    /// manager is asked to commit. An error fails the commit.
    pub fn add_before_commit_hook<F>(&self, hook: F)
    where
        F: FnOnce(&Transaction) -> Result<()> + Send + 'static,
    {
        self.inner.data.lock().before_commit.push(Box::new(hook));
    }

    /// Runs `hook` after a commit attempt with whether it
    /// succeeded.
    pub fn add_after_commit_hook<F>(&self, hook: F)
    where
        F: FnOnce(&Transaction, bool) + Send + 'static,
    {
        self.inner.data.lock().after_commit.push(Box::new(hook));
    }

    fn failed(data: &TxnData) -> Error {
        Error::TransactionFailed(data.failure.clone().unwrap_or_default())
    }

    fn mark_failed(&self, error: &Error) {
        let mut data = self.inner.data.lock();
        data.status = TxnState::CommitFailed;
        data.failure = Some(error.to_string());
    }

    /// Adds a data manager to the transaction. Joining twice is a
    /// no-op.
    pub fn join(&self, dm: Arc<dyn DataManager>) -> Result<()> {
        let mut data = self.inner.data.lock();
        match data.status {
            TxnState::Active | TxnState::Doomed => {}
            TxnState::CommitFailed => return Err(Transaction::failed(&data)),
            other => {
                return Err(Error::StorageTransaction(format!(
                    "cannot join transaction {} while it is {:?}",
                    self.inner.id, other
                )))
            }
        }

        if data.resources.iter().any(|r| same_resource(r, &dm)) {
            return Ok(());
        }

        // rolling back a savepoint taken before this join has to
        // throw away everything the late joiner did
        for sp in data.savepoints.iter().filter_map(Weak::upgrade) {
            sp.resource_savepoints.lock().push(Box::new(AbortSavepoint {
                dm: dm.clone(),
                txn: self.clone(),
            }));
        }

        log::trace!("{} joined transaction {}", dm.sort_key(), self.inner.id);
        data.resources.push(dm);

        Ok(())
    }

    fn unjoin(&self, dm: &Arc<dyn DataManager>) {
        self.inner
            .data
            .lock()
            .resources
            .retain(|r| !same_resource(r, dm));
    }

    fn synchronizers(&self) -> Vec<Arc<dyn Synchronizer>> {
        match self.inner.manager.upgrade() {
            Some(manager) => manager.synchronizers(),
            None => vec![],
        }
    }

    fn free(&self) {
        if let Some(manager) = self.inner.manager.upgrade() {
            let mut current = manager.current.lock();
            if current.as_ref().map(Transaction::id) == Some(self.inner.id) {
                *current = None;
            }
        }
    }

    fn invalidate_savepoints(data: &mut TxnData) {
        for sp in data.savepoints.drain(..).filter_map(|sp| sp.upgrade()) {
            sp.valid.store(false, SeqCst);
        }
    }

    /// Marks the transaction so that it can never commit.
    pub fn doom(&self) -> Result<()> {
        let mut data = self.inner.data.lock();
        match data.status {
            TxnState::Active => {
                data.status = TxnState::Doomed;
                Ok(())
            }
            TxnState::Doomed => Ok(()),
            other => Err(Error::StorageTransaction(format!(
                "cannot doom transaction {} while it is {:?}",
                self.inner.id, other
            ))),
        }
    }

    pub fn commit(&self) -> Result<()> {
        {
            let mut data = self.inner.data.lock();
            match data.status {
                TxnState::Active => {}
                TxnState::Doomed => return Err(Error::Doomed),
                TxnState::CommitFailed => return Err(Transaction::failed(&data)),
                other => {
                    return Err(Error::StorageTransaction(format!(
                        "cannot commit transaction {} while it is {:?}",
                        self.inner.id, other
                    )))
                }
            }
            Transaction::invalidate_savepoints(&mut data);
        }

        // hooks may register more hooks
        loop {
            let hooks = std::mem::take(&mut self.inner.data.lock().before_commit);
            if hooks.is_empty() {
                break;
            }
            for hook in hooks {
                if let Err(e) = hook(self) {
                    log::debug!("before-commit hook failed transaction {}: {:?}", self.inner.id, e);
                    let resources = self.inner.data.lock().resources.clone();
                    self.cleanup(&resources, 0);
                    return Err(self.commit_failed(e));
                }
            }
        }

        let synchronizers = self.synchronizers();
        for synch in &synchronizers {
            synch.before_completion(self);
        }

        let mut resources = {
            let mut data = self.inner.data.lock();
            data.status = TxnState::Committing;
            data.resources.clone()
        };
        resources.sort_by_cached_key(|r| r.sort_key());

        if let Err(e) = self.commit_resources(&resources) {
            return Err(self.commit_failed(e));
        }

        let after_hooks = {
            let mut data = self.inner.data.lock();
            data.status = TxnState::Committed;
            data.resources.clear();
            std::mem::take(&mut data.after_commit)
        };

        self.free();

        for synch in &synchronizers {
            synch.after_completion(self);
        }

        for hook in after_hooks {
            hook(self, true);
        }

        log::debug!(
            "committed transaction {} across {} data managers",
            self.inner.id,
            resources.len()
        );

        Ok(())
    }

    fn commit_resources(&self, resources: &[Arc<dyn DataManager>]) -> Result<()> {
        let mut voted = 0;

        let res = (|| {
            for r in resources {
                r.tpc_begin(self)?;
            }
            for r in resources {
                r.commit(self)?;
            }
            for r in resources {
                r.tpc_vote(self)?;
                voted += 1;
            }
            Ok(())
        })();

        if let Err(e) = res {
            log::debug!(
                "first phase of transaction {} failed after {voted} votes: {:?}",
                self.inner.id,
                e
            );
            self.cleanup(resources, voted);
            return Err(e);
        }

        for r in resources {
            if let Err(e) = r.tpc_finish(self) {
                log::error!(
                    "a data manager failed in the second phase of two-phase commit of \
                     transaction {}, data managers may be inconsistent: {:?}",
                    self.inner.id,
                    e
                );
                self.cleanup(resources, resources.len());
                return Err(e);
            }
        }

        Ok(())
    }

    fn cleanup(&self, resources: &[Arc<dyn DataManager>], voted: usize) {
        for r in &resources[voted.min(resources.len())..] {
            if let Err(e) = r.abort(self) {
                log::error!("failed to abort {} during cleanup: {:?}", r.sort_key(), e);
            }
        }
        for r in resources.iter().rev() {
            if let Err(e) = r.tpc_abort(self) {
                log::error!("tpc_abort of {} failed during cleanup: {:?}", r.sort_key(), e);
            }
        }
    }

    fn commit_failed(&self, error: Error) -> Error {
        self.mark_failed(&error);

        let after_hooks = std::mem::take(&mut self.inner.data.lock().after_commit);

        for synch in &self.synchronizers() {
            synch.after_completion(self);
        }
        for hook in after_hooks {
            hook(self, false);
        }

        error
    }

    /// Discards all changes made in this transaction. Returns the
    /// first error reported by a data manager, after asking every
    /// one of them to abort.
    pub fn abort(&self) -> Result<()> {
        let resources = {
            let data = self.inner.data.lock();
            if matches!(data.status, TxnState::Committed | TxnState::Aborted) {
                return Ok(());
            }
            data.resources.clone()
        };

        let synchronizers = self.synchronizers();
        for synch in &synchronizers {
            synch.before_completion(self);
        }

        let mut first_error = None;
        for r in &resources {
            if let Err(e) = r.abort(self) {
                log::error!("failed to abort {}: {:?}", r.sort_key(), e);
                first_error.get_or_insert(e);
            }
        }

        {
            let mut data = self.inner.data.lock();
            data.status = TxnState::Aborted;
            data.resources.clear();
            data.before_commit.clear();
            data.after_commit.clear();
            Transaction::invalidate_savepoints(&mut data);
        }

        self.free();

        for synch in &synchronizers {
            synch.after_completion(self);
        }

        log::trace!("aborted transaction {}", self.inner.id);

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Records the state of every joined data manager so that it
    /// can be returned to later. With `optimistic`, data managers
    /// without savepoint support are tolerated and only fail if
    /// the savepoint is rolled back.
    pub fn savepoint(&self, optimistic: bool) -> Result<Savepoint> {
        let resources = {
            let data = self.inner.data.lock();
            match data.status {
                TxnState::Active | TxnState::Doomed => {}
                TxnState::CommitFailed => return Err(Transaction::failed(&data)),
                other => {
                    return Err(Error::StorageTransaction(format!(
                        "cannot take a savepoint of transaction {} while it is {:?}",
                        self.inner.id, other
                    )))
                }
            }
            data.resources.clone()
        };

        let mut resource_savepoints: Vec<Box<dyn ResourceSavepoint>> = vec![];
        for r in &resources {
            match r.savepoint(self) {
                Ok(sp) => resource_savepoints.push(sp),
                Err(Error::SavepointUnsupported(name)) if optimistic => {
                    resource_savepoints.push(Box::new(NoRollbackSavepoint { name }));
                }
                Err(e) => {
                    self.mark_failed(&e);
                    return Err(e);
                }
            }
        }

        let inner = Arc::new(SavepointInner {
            txn: self.clone(),
            valid: AtomicBool::new(true),
            resource_savepoints: Mutex::new(resource_savepoints),
        });

        self.inner.data.lock().savepoints.push(Arc::downgrade(&inner));

        Ok(Savepoint { inner })
    }
}

struct SavepointInner {
    txn: Transaction,
    valid: AtomicBool,
    resource_savepoints: Mutex<Vec<Box<dyn ResourceSavepoint>>>,
}

/// A point within a transaction that its changes can be rolled
/// back to. Rolling back invalidates every savepoint taken after
/// this one; this one stays usable.
pub struct Savepoint {
    inner: Arc<SavepointInner>,
}

impl Savepoint {
    pub fn is_valid(&self) -> bool {
        self.inner.valid.load(SeqCst)
    }

    pub fn rollback(&self) -> Result<()> {
        if !self.is_valid() {
            return Err(Error::InvalidSavepoint);
        }

        let txn = &self.inner.txn;

        {
            let mut data = txn.inner.data.lock();
            if data.status == TxnState::CommitFailed {
                return Err(Transaction::failed(&data));
            }
            let this = Arc::as_ptr(&self.inner);
            if let Some(idx) = data.savepoints.iter().position(|sp| sp.as_ptr() == this) {
                for later in data.savepoints.drain(idx + 1..).filter_map(|sp| sp.upgrade()) {
                    later.valid.store(false, SeqCst);
                }
            }
        }

        let resource_savepoints = self.inner.resource_savepoints.lock();
        for sp in resource_savepoints.iter() {
            if let Err(e) = sp.rollback() {
                txn.mark_failed(&e);
                return Err(e);
            }
        }

        log::trace!("rolled back a savepoint of transaction {}", txn.id());

        Ok(())
    }
}

struct AbortSavepoint {
    dm: Arc<dyn DataManager>,
    txn: Transaction,
}

impl ResourceSavepoint for AbortSavepoint {
    fn rollback(&self) -> Result<()> {
        self.dm.abort(&self.txn)?;
        self.txn.unjoin(&self.dm);
        Ok(())
    }
}

struct NoRollbackSavepoint {
    name: String,
}

impl ResourceSavepoint for NoRollbackSavepoint {
    fn rollback(&self) -> Result<()> {
        Err(Error::SavepointUnsupported(self.name.clone()))
    }
}

struct ManagerInner {
    current: Mutex<Option<Transaction>>,
    synchs: Mutex<Vec<(u64, Weak<dyn Synchronizer>)>>,
    next_synch: AtomicU64,
}

impl ManagerInner {
    fn synchronizers(&self) -> Vec<Arc<dyn Synchronizer>> {
        let mut synchs = self.synchs.lock();
        synchs.retain(|(_, synch)| synch.strong_count() > 0);
        synchs.iter().filter_map(|(_, synch)| synch.upgrade()).collect()
    }
}

thread_local! {
    static THREAD_MANAGER: TransactionManager = TransactionManager::new();
}

/// Tracks the current transaction of one thread of control and
/// the synchronizers interested in its boundaries.
#[derive(Clone)]
pub struct TransactionManager {
    inner: Arc<ManagerInner>,
}

impl Default for TransactionManager {
    fn default() -> TransactionManager {
        TransactionManager::new()
    }
}

impl fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionManager")
            .field("current", &*self.inner.current.lock())
            .finish()
    }
}

impl TransactionManager {
    pub fn new() -> TransactionManager {
        TransactionManager {
            inner: Arc::new(ManagerInner {
                current: Mutex::new(None),
                synchs: Mutex::new(vec![]),
                next_synch: AtomicU64::new(0),
            }),
        }
    }

    /// The manager of the calling thread.
    pub fn for_thread() -> TransactionManager {
        THREAD_MANAGER.with(TransactionManager::clone)
    }

    /// Starts a new transaction, aborting the current one if any.
    pub fn begin(&self) -> Transaction {
        let previous = self.inner.current.lock().take();
        if let Some(previous) = previous {
            log::debug!("begin aborts unfinished transaction {}", previous.id());
            if let Err(e) = previous.abort() {
                log::warn!("failed to abort transaction {}: {:?}", previous.id(), e);
            }
        }

        let txn = Transaction::new(Arc::downgrade(&self.inner));
        *self.inner.current.lock() = Some(txn.clone());

        for synch in self.inner.synchronizers() {
            synch.new_transaction(&txn);
        }

        txn
    }

    /// The current transaction, beginning one if necessary.
    pub fn get(&self) -> Transaction {
        let current = self.inner.current.lock().clone();
        match current {
            Some(txn) => txn,
            None => self.begin(),
        }
    }

    pub fn commit(&self) -> Result<()> {
        self.get().commit()
    }

    pub fn abort(&self) -> Result<()> {
        let current = self.inner.current.lock().clone();
        match current {
            Some(txn) => txn.abort(),
            None => Ok(()),
        }
    }

    pub fn doom(&self) -> Result<()> {
        self.get().doom()
    }

    pub fn is_doomed(&self) -> bool {
        self.get().is_doomed()
    }

    pub fn savepoint(&self, optimistic: bool) -> Result<Savepoint> {
        self.get().savepoint(optimistic)
    }

    /// Returns a key for `unregister_synch`.
    pub fn register_synch(&self, synch: Weak<dyn Synchronizer>) -> u64 {
        let key = self.inner.next_synch.fetch_add(1, SeqCst);
        self.inner.synchs.lock().push((key, synch));
        key
    }

    pub fn unregister_synch(&self, key: u64) {
        self.inner.synchs.lock().retain(|(k, _)| *k != key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Log {
        events: Mutex<Vec<String>>,
    }

    impl Log {
        fn push(&self, event: String) {
            self.events.lock().push(event);
        }

        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.events.lock())
        }
    }

    struct Recorder {
        name: &'static str,
        log: Arc<Log>,
        fail_vote: bool,
        savepoints: bool,
    }

    impl Recorder {
        fn new(name: &'static str, log: &Arc<Log>) -> Arc<Recorder> {
            Arc::new(Recorder {
                name,
                log: log.clone(),
                fail_vote: false,
                savepoints: true,
            })
        }

        fn record(&self, phase: &str) -> Result<()> {
            self.log.push(format!("{}:{phase}", self.name));
            Ok(())
        }
    }

    struct RecorderSavepoint {
        name: &'static str,
        log: Arc<Log>,
    }

    impl ResourceSavepoint for RecorderSavepoint {
        fn rollback(&self) -> Result<()> {
            self.log.push(format!("{}:rollback", self.name));
            Ok(())
        }
    }

    impl DataManager for Recorder {
        fn sort_key(&self) -> String {
            self.name.to_owned()
        }
        fn abort(&self, _: &Transaction) -> Result<()> {
            self.record("abort")
        }
        fn tpc_begin(&self, _: &Transaction) -> Result<()> {
            self.record("begin")
        }
        fn commit(&self, _: &Transaction) -> Result<()> {
            self.record("commit")
        }
        fn tpc_vote(&self, _: &Transaction) -> Result<()> {
            self.record("vote")?;
            if self.fail_vote {
                return Err(Error::Storage("vote refused".into()));
            }
            Ok(())
        }
        fn tpc_finish(&self, _: &Transaction) -> Result<()> {
            self.record("finish")
        }
        fn tpc_abort(&self, _: &Transaction) -> Result<()> {
            self.record("tpc_abort")
        }
        fn savepoint(&self, _: &Transaction) -> Result<Box<dyn ResourceSavepoint>> {
            if !self.savepoints {
                return Err(Error::SavepointUnsupported(self.name.to_owned()));
            }
            self.record("savepoint")?;
            Ok(Box::new(RecorderSavepoint {
                name: self.name,
                log: self.log.clone(),
            }))
        }
    }

    #[test]
    fn phases_run_in_sort_key_order() {
        let log = Arc::new(Log::default());
        let tm = TransactionManager::new();
        let txn = tm.get();
        txn.join(Recorder::new("b", &log)).unwrap();
        txn.join(Recorder::new("a", &log)).unwrap();

        tm.commit().unwrap();

        assert_eq!(
            log.take(),
            [
                "a:begin", "b:begin", "a:commit", "b:commit", "a:vote", "b:vote", "a:finish",
                "b:finish"
            ]
        );
        assert_eq!(txn.status(), TxnState::Committed);
        assert_ne!(tm.get().id(), txn.id());
    }

    #[test]
    fn failed_vote_aborts_everyone_and_requires_abort() {
        let log = Arc::new(Log::default());
        let tm = TransactionManager::new();
        let txn = tm.get();
        txn.join(Recorder::new("a", &log)).unwrap();
        txn.join(Arc::new(Recorder {
            name: "b",
            log: log.clone(),
            fail_vote: true,
            savepoints: true,
        }))
        .unwrap();
        txn.join(Recorder::new("c", &log)).unwrap();

        assert!(matches!(tm.commit(), Err(Error::Storage(_))));
        assert_eq!(
            log.take(),
            [
                "a:begin",
                "b:begin",
                "c:begin",
                "a:commit",
                "b:commit",
                "c:commit",
                "a:vote",
                "b:vote",
                "b:abort",
                "c:abort",
                "c:tpc_abort",
                "b:tpc_abort",
                "a:tpc_abort"
            ]
        );

        assert_eq!(txn.status(), TxnState::CommitFailed);
        assert!(matches!(txn.commit(), Err(Error::TransactionFailed(_))));
        assert!(matches!(
            txn.join(Recorder::new("d", &log)),
            Err(Error::TransactionFailed(_))
        ));

        tm.abort().unwrap();
        assert_eq!(txn.status(), TxnState::Aborted);
        assert_eq!(tm.get().status(), TxnState::Active);
    }

    #[test]
    fn doomed_transactions_cannot_commit() {
        let log = Arc::new(Log::default());
        let tm = TransactionManager::new();
        tm.get().join(Recorder::new("a", &log)).unwrap();
        tm.doom().unwrap();
        assert!(tm.is_doomed());

        assert!(matches!(tm.commit(), Err(Error::Doomed)));
        assert!(log.take().is_empty());

        tm.abort().unwrap();
        assert_eq!(log.take(), ["a:abort"]);
    }

    #[test]
    fn rollback_invalidates_later_savepoints() {
        let log = Arc::new(Log::default());
        let tm = TransactionManager::new();
        tm.get().join(Recorder::new("a", &log)).unwrap();

        let first = tm.savepoint(false).unwrap();
        let second = tm.savepoint(false).unwrap();
        log.take();

        first.rollback().unwrap();
        assert_eq!(log.take(), ["a:rollback"]);
        assert!(first.is_valid());
        assert!(!second.is_valid());
        assert!(matches!(second.rollback(), Err(Error::InvalidSavepoint)));

        // rolling back twice to the same savepoint is allowed
        first.rollback().unwrap();

        tm.commit().unwrap();
        assert!(!first.is_valid());
    }

    #[test]
    fn late_joiners_are_aborted_by_rollback() {
        let log = Arc::new(Log::default());
        let tm = TransactionManager::new();
        let txn = tm.get();
        let sp = txn.savepoint(false).unwrap();
        txn.join(Recorder::new("late", &log)).unwrap();

        sp.rollback().unwrap();
        assert_eq!(log.take(), ["late:abort"]);

        tm.commit().unwrap();
        assert!(log.take().is_empty());
    }

    #[test]
    fn savepoints_need_support_unless_optimistic() {
        let log = Arc::new(Log::default());
        let tm = TransactionManager::new();
        tm.get()
            .join(Arc::new(Recorder {
                name: "a",
                log: log.clone(),
                fail_vote: false,
                savepoints: false,
            }))
            .unwrap();

        let sp = tm.savepoint(true).unwrap();
        assert!(matches!(sp.rollback(), Err(Error::SavepointUnsupported(_))));

        tm.abort().unwrap();
        tm.get()
            .join(Arc::new(Recorder {
                name: "a",
                log: log.clone(),
                fail_vote: false,
                savepoints: false,
            }))
            .unwrap();
        assert!(matches!(
            tm.savepoint(false),
            Err(Error::SavepointUnsupported(_))
        ));
        assert_eq!(tm.get().status(), TxnState::CommitFailed);
    }

    #[test]
    fn hooks_and_synchronizers_see_boundaries() {
        #[derive(Default)]
        struct Synch {
            log: Log,
        }

        impl Synchronizer for Synch {
            fn before_completion(&self, _: &Transaction) {
                self.log.push("before".into());
            }
            fn after_completion(&self, _: &Transaction) {
                self.log.push("after".into());
            }
            fn new_transaction(&self, _: &Transaction) {
                self.log.push("new".into());
            }
        }

        let synch = Arc::new(Synch::default());
        let tm = TransactionManager::new();
        let weak: Weak<dyn Synchronizer> = Arc::downgrade(&(synch.clone() as Arc<dyn Synchronizer>));
        let key = tm.register_synch(weak);

        let txn = tm.get();
        txn.note("first line");
        txn.note("second line");
        let seen = Arc::new(Mutex::new(vec![]));
        let seen2 = seen.clone();
        txn.add_before_commit_hook(|t| {
            t.set_user("hook");
            Ok(())
        });
        txn.add_after_commit_hook(move |t, ok| seen2.lock().push((t.user(), ok)));

        tm.commit().unwrap();

        assert_eq!(txn.description(), "first line\nsecond line");
        assert_eq!(*seen.lock(), vec![("hook".to_owned(), true)]);
        assert_eq!(synch.log.take(), ["new", "before", "after"]);

        tm.unregister_synch(key);
        tm.get();
        assert!(synch.log.take().is_empty());
    }

    #[test]
    fn extension_survives_encoding() {
        let tm = TransactionManager::new();
        let txn = tm.get();
        assert!(txn.info().unwrap().extension.is_empty());
        txn.set_extended_info("request", "/checkout");
        let info = txn.info().unwrap();
        assert_eq!(
            Transaction::decode_extension(&info.extension).unwrap(),
            txn.extended_info()
        );
        assert!(Transaction::decode_extension(&[]).unwrap().is_empty());
    }
}
