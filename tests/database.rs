use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use granite::{
    Config, Connection, Counter, Database, Error, Oid, PersistentMapping, Persistable,
    Serializer, Tid, Transaction, TransactionManager, TxnState,
};

mod common;

use common::{cleanup, test_config};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Note {
    text: String,
}

impl Persistable for Note {
    const CLASS_ID: &'static str = "tests.Note";
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Unregistered;

impl Persistable for Unregistered {
    const CLASS_ID: &'static str = "tests.Unregistered";
}

fn open_db(config: &Config) -> Database {
    let mut serializer = Serializer::new();
    serializer.register::<Note>();
    config.open_with(Arc::new(serializer)).unwrap()
}

fn with_db<F: FnOnce(&Config, &Database)>(name: &str, f: F) {
    let config = Config {
        pool_size: 8,
        ..test_config(name)
    };
    let db = open_db(&config);
    f(&config, &db);
    let _ = db.close();
    cleanup(&config);
}

/// Stores `value` in the root under `key` and commits.
fn add_to_root<T: Persistable>(db: &Database, key: &str, value: T) -> Oid {
    let tm = TransactionManager::new();
    let conn = db.open_with(&tm).unwrap();
    let obj = conn.add(value).unwrap();
    conn.root()
        .unwrap()
        .write(|root: &mut PersistentMapping| root.insert(key, obj.oid()))
        .unwrap();
    tm.commit().unwrap();
    conn.close().unwrap();
    obj.oid()
}

fn counter_value(conn: &Connection, oid: Oid) -> i64 {
    conn.get(oid).unwrap().read(|c: &Counter| c.value()).unwrap()
}

fn note_text(conn: &Connection, oid: Oid) -> String {
    conn.get(oid).unwrap().read(|n: &Note| n.text.clone()).unwrap()
}

#[test]
fn new_database_has_an_empty_root() {
    with_db("new_database_has_an_empty_root", |config, db| {
        let created = db.last_transaction();
        assert!(created > Tid::ZERO);

        let tm = TransactionManager::new();
        let conn = db.open_with(&tm).unwrap();
        let root = conn.root().unwrap();
        assert_eq!(root.oid(), Oid::ROOT);
        assert!(root.read(|root: &PersistentMapping| root.is_empty()).unwrap());
        drop(root);
        conn.close().unwrap();

        db.close().unwrap();
        let db = open_db(config);
        assert_eq!(db.last_transaction(), created);
        assert_eq!(db.undo_log(0, 10).unwrap().len(), 1);
        db.close().unwrap();
    });
}

#[test]
fn objects_keep_their_identity() {
    with_db("objects_keep_their_identity", |_config, db| {
        let oid = add_to_root(db, "counter", Counter::new(1));

        let tm = TransactionManager::new();
        let conn = db.open_with(&tm).unwrap();
        let a = conn.get(oid).unwrap();
        let b = conn.get(oid).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&conn.root().unwrap(), &conn.root().unwrap()));

        // a ghost is the same object, reloaded on use
        assert!(a.deactivate());
        assert!(a.is_ghost());
        assert_eq!(b.read(|c: &Counter| c.value()).unwrap(), 1);
        assert!(!a.is_ghost());
        assert!(Arc::ptr_eq(&a, &conn.get(oid).unwrap()));

        let other = db.open_with(&tm).unwrap();
        assert!(!Arc::ptr_eq(&a, &other.get(oid).unwrap()));
    });
}

#[test]
fn connections_read_from_their_snapshot() {
    with_db("connections_read_from_their_snapshot", |_config, db| {
        let oid = add_to_root(db, "counter", Counter::new(0));

        let (tm_a, tm_b) = (TransactionManager::new(), TransactionManager::new());
        let a = db.open_with(&tm_a).unwrap();
        let b = db.open_with(&tm_b).unwrap();

        tm_a.begin();
        assert_eq!(counter_value(&a, oid), 0);

        b.get(oid).unwrap().write(|c: &mut Counter| c.increment(5)).unwrap();
        tm_b.commit().unwrap();
        assert_eq!(counter_value(&b, oid), 5);

        // neither the cached copy nor a reload sees the new commit
        assert_eq!(counter_value(&a, oid), 0);
        a.cache_minimize();
        assert_eq!(counter_value(&a, oid), 0);

        tm_a.abort().unwrap();
        assert_eq!(counter_value(&a, oid), 5);
        assert_eq!(a.snapshot(), db.last_transaction());
    });
}

#[test]
fn conflicting_writes_fail_the_later_commit() {
    with_db("conflicting_writes_fail_the_later_commit", |_config, db| {
        let oid = add_to_root(db, "note", Note { text: "start".into() });

        let (tm_a, tm_b) = (TransactionManager::new(), TransactionManager::new());
        let a = db.open_with(&tm_a).unwrap();
        let b = db.open_with(&tm_b).unwrap();

        tm_b.begin();
        assert_eq!(note_text(&b, oid), "start");

        a.get(oid).unwrap().write(|n: &mut Note| n.text = "from a".into()).unwrap();
        tm_a.commit().unwrap();

        b.get(oid).unwrap().write(|n: &mut Note| n.text = "from b".into()).unwrap();
        assert!(matches!(tm_b.commit(), Err(Error::Conflict { .. })));
        assert_eq!(tm_b.get().status(), TxnState::CommitFailed);
        assert!(matches!(tm_b.commit(), Err(Error::TransactionFailed(_))));

        tm_b.abort().unwrap();
        assert_eq!(note_text(&b, oid), "from a");

        // a retry on fresh state goes through
        b.get(oid).unwrap().write(|n: &mut Note| n.text = "from b".into()).unwrap();
        tm_b.commit().unwrap();
        tm_a.begin();
        assert_eq!(note_text(&a, oid), "from b");
    });
}

#[test]
fn concurrent_counter_increments_merge() {
    with_db("concurrent_counter_increments_merge", |_config, db| {
        let oid = add_to_root(db, "counter", Counter::new(0));

        let (tm_a, tm_b) = (TransactionManager::new(), TransactionManager::new());
        let a = db.open_with(&tm_a).unwrap();
        let b = db.open_with(&tm_b).unwrap();
        tm_a.begin();
        tm_b.begin();

        a.get(oid).unwrap().write(|c: &mut Counter| c.increment(2)).unwrap();
        b.get(oid).unwrap().write(|c: &mut Counter| c.increment(3)).unwrap();
        tm_a.commit().unwrap();
        tm_b.commit().unwrap();

        assert_eq!(counter_value(&b, oid), 5);
        tm_a.begin();
        assert_eq!(counter_value(&a, oid), 5);
    });
}

#[test]
fn many_threads_increment_one_counter() {
    with_db("many_threads_increment_one_counter", |_config, db| {
        let oid = add_to_root(db, "counter", Counter::new(0));

        let threads: Vec<_> = (0..4)
            .map(|i| {
                let db = db.clone();
                thread::Builder::new()
                    .name(format!("incrementer-{i}"))
                    .spawn(move || {
                        let tm = TransactionManager::new();
                        let conn = db.open_with(&tm).unwrap();
                        for _ in 0..25 {
                            tm.begin();
                            conn.get(oid)
                                .unwrap()
                                .write(|c: &mut Counter| c.increment(1))
                                .unwrap();
                            tm.commit().unwrap();
                        }
                        conn.close().unwrap();
                    })
                    .unwrap()
            })
            .collect();

        for thread in threads {
            thread.join().unwrap();
        }

        let conn = db.open_with(&TransactionManager::new()).unwrap();
        assert_eq!(counter_value(&conn, oid), 100);
    });
}

#[test]
fn abort_discards_changes() {
    with_db("abort_discards_changes", |_config, db| {
        let oid = add_to_root(db, "counter", Counter::new(1));

        let tm = TransactionManager::new();
        let conn = db.open_with(&tm).unwrap();
        let counter = conn.get(oid).unwrap();
        counter.write(|c: &mut Counter| c.increment(10)).unwrap();
        let added = conn.add(Counter::new(99)).unwrap();
        assert_eq!(counter.status(), granite::ObjectStatus::Changed);

        tm.abort().unwrap();

        assert_eq!(counter.read(|c: &Counter| c.value()).unwrap(), 1);
        assert!(matches!(conn.get(added.oid()), Err(Error::PosKey(_))));
    });
}

#[test]
fn savepoints_roll_back_connection_state() {
    with_db("savepoints_roll_back_connection_state", |_config, db| {
        let oid = add_to_root(db, "counter", Counter::new(0));

        let tm = TransactionManager::new();
        let conn = db.open_with(&tm).unwrap();
        tm.begin();
        let counter = conn.get(oid).unwrap();

        counter.write(|c: &mut Counter| c.increment(1)).unwrap();
        let sp = tm.savepoint(false).unwrap();

        counter.write(|c: &mut Counter| c.increment(10)).unwrap();
        let extra = conn.add(Counter::new(7)).unwrap();
        assert_eq!(counter.read(|c: &Counter| c.value()).unwrap(), 11);

        sp.rollback().unwrap();
        assert_eq!(counter.read(|c: &Counter| c.value()).unwrap(), 1);
        assert!(matches!(conn.get(extra.oid()), Err(Error::PosKey(_))));

        // ghosts reload what the savepoint staged, not the
        // committed state
        conn.cache_minimize();
        assert_eq!(counter_value(&conn, oid), 1);

        tm.commit().unwrap();

        let other = db.open_with(&TransactionManager::new()).unwrap();
        assert_eq!(counter_value(&other, oid), 1);
        assert!(matches!(sp.rollback(), Err(Error::InvalidSavepoint)));
    });
}

#[test]
fn objects_added_before_a_savepoint_survive_rollback() {
    with_db("objects_added_before_a_savepoint_survive_rollback", |_config, db| {
        let tm = TransactionManager::new();
        let conn = db.open_with(&tm).unwrap();

        let note = conn.add(Note { text: "kept".into() }).unwrap();
        conn.root()
            .unwrap()
            .write(|root: &mut PersistentMapping| root.insert("note", note.oid()))
            .unwrap();
        let sp = tm.savepoint(false).unwrap();

        note.write(|n: &mut Note| n.text = "dropped".into()).unwrap();
        sp.rollback().unwrap();
        tm.commit().unwrap();

        let other = db.open_with(&TransactionManager::new()).unwrap();
        let oid = other
            .root()
            .unwrap()
            .read(|root: &PersistentMapping| root.get("note"))
            .unwrap()
            .unwrap();
        assert_eq!(note_text(&other, oid), "kept");
    });
}

#[test]
fn doomed_transactions_do_not_commit() {
    with_db("doomed_transactions_do_not_commit", |_config, db| {
        let oid = add_to_root(db, "counter", Counter::new(0));

        let tm = TransactionManager::new();
        let conn = db.open_with(&tm).unwrap();
        conn.get(oid).unwrap().write(|c: &mut Counter| c.increment(1)).unwrap();
        tm.doom().unwrap();

        assert!(matches!(tm.commit(), Err(Error::Doomed)));
        tm.abort().unwrap();
        assert_eq!(counter_value(&conn, oid), 0);
    });
}

#[test]
fn transaction_metadata_is_recorded() {
    with_db("transaction_metadata_is_recorded", |_config, db| {
        let tm = TransactionManager::new();
        let conn = db.open_with(&tm).unwrap();
        let txn = tm.get();
        txn.set_user("alice");
        txn.note("add a note");
        txn.set_extended_info("request", "/notes/new");

        let hook_saw = Arc::new(parking_lot::Mutex::new(None));
        let seen = hook_saw.clone();
        txn.add_after_commit_hook(move |_: &Transaction, ok| *seen.lock() = Some(ok));

        let note = conn.add(Note { text: "hi".into() }).unwrap();
        conn.root()
            .unwrap()
            .write(|root: &mut PersistentMapping| root.insert("note", note.oid()))
            .unwrap();
        tm.commit().unwrap();
        assert_eq!(*hook_saw.lock(), Some(true));

        let tid = db.last_transaction();
        let record = db
            .storage()
            .iterator(Some(tid), None)
            .unwrap()
            .next()
            .unwrap()
            .unwrap();
        assert_eq!(record.user, "alice");
        assert_eq!(record.description, "add a note");
        let extension = Transaction::decode_extension(&record.extension).unwrap();
        assert_eq!(extension.get("request").map(String::as_str), Some("/notes/new"));

        let history = db.history(note.oid(), 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].user, "alice");
    });
}

#[test]
fn pool_is_bounded() {
    let config = Config {
        pool_size: 2,
        ..test_config("pool_is_bounded")
    };
    let db = config.open().unwrap();
    let tm = TransactionManager::new();

    let c1 = db.open_with(&tm).unwrap();
    let c2 = db.open_with(&tm).unwrap();
    assert_eq!(db.open_connections(), 2);
    assert!(matches!(db.open_with(&tm), Err(Error::ConnectionState(_))));

    c1.close().unwrap();
    let c3 = db.open_with(&tm).unwrap();
    assert_eq!(db.open_connections(), 2);

    drop(c2);
    assert_eq!(db.open_connections(), 1);
    drop(c3);
    assert_eq!(db.open_connections(), 0);

    db.close().unwrap();
    cleanup(&config);
}

#[test]
fn pool_waits_for_a_connection() {
    let config = Config {
        pool_size: 1,
        pool_timeout: Some(Duration::from_secs(10)),
        ..test_config("pool_waits_for_a_connection")
    };
    let db = config.open().unwrap();

    let held = db.open_with(&TransactionManager::new()).unwrap();
    let releaser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        drop(held);
    });

    let before = Instant::now();
    let conn = db.open_with(&TransactionManager::new()).unwrap();
    assert!(before.elapsed() >= Duration::from_millis(50));
    releaser.join().unwrap();

    drop(conn);
    db.close().unwrap();
    cleanup(&config);
}

#[test]
fn joined_connections_cannot_close() {
    with_db("joined_connections_cannot_close", |_config, db| {
        let oid = add_to_root(db, "counter", Counter::new(0));

        let tm = TransactionManager::new();
        let conn = db.open_with(&tm).unwrap();
        conn.get(oid).unwrap().write(|c: &mut Counter| c.increment(1)).unwrap();

        assert!(matches!(conn.close(), Err(Error::ConnectionState(_))));
        tm.abort().unwrap();
        conn.close().unwrap();
        assert!(matches!(conn.get(oid), Err(Error::ConnectionState(_))));
    });
}

#[test]
fn historical_connections_are_read_only() {
    with_db("historical_connections_are_read_only", |_config, db| {
        let oid = add_to_root(db, "counter", Counter::new(0));
        let t1 = db.last_transaction();

        let tm = TransactionManager::new();
        let conn = db.open_with(&tm).unwrap();
        conn.get(oid).unwrap().write(|c: &mut Counter| c.increment(5)).unwrap();
        tm.commit().unwrap();

        let old = db.open_at(t1).unwrap();
        assert!(old.is_historical());
        assert_eq!(old.snapshot(), t1);
        assert_eq!(counter_value(&old, oid), 0);
        assert!(matches!(
            old.get(oid).unwrap().write(|c: &mut Counter| c.increment(1)),
            Err(Error::ReadOnly)
        ));
        assert!(matches!(old.add(Counter::new(1)), Err(Error::ReadOnly)));

        // later commits never reach it
        conn.get(oid).unwrap().write(|c: &mut Counter| c.increment(5)).unwrap();
        tm.commit().unwrap();
        old.sync();
        assert_eq!(counter_value(&old, oid), 0);
        assert_eq!(counter_value(&conn, oid), 10);

        assert!(matches!(db.open_at(Tid::MAX), Err(Error::ConnectionState(_))));
        old.close().unwrap();
    });
}

#[test]
fn undo_through_the_database() {
    with_db("undo_through_the_database", |_config, db| {
        let oid = add_to_root(db, "counter", Counter::new(0));

        let tm = TransactionManager::new();
        let conn = db.open_with(&tm).unwrap();
        conn.get(oid).unwrap().write(|c: &mut Counter| c.increment(5)).unwrap();
        tm.get().note("add five");
        tm.commit().unwrap();
        assert_eq!(counter_value(&conn, oid), 5);

        let log = db.undo_log(0, 10).unwrap();
        assert_eq!(log[0].description, "add five");

        db.undo(log[0].id, &tm).unwrap();
        tm.commit().unwrap();

        // the undo invalidated the cached counter
        assert_eq!(counter_value(&conn, oid), 0);

        let history = db.history(oid, 10).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[1].description, "add five");

        // undoing something superseded fails at commit
        db.undo(log[0].id, &tm).unwrap();
        assert!(matches!(tm.commit(), Err(Error::Undo { .. })));
        tm.abort().unwrap();
    });
}

#[test]
fn pack_through_the_database() {
    with_db("pack_through_the_database", |config, db| {
        let oid = add_to_root(db, "counter", Counter::new(0));

        let tm = TransactionManager::new();
        let conn = db.open_with(&tm).unwrap();
        for _ in 0..10 {
            conn.get(oid).unwrap().write(|c: &mut Counter| c.increment(1)).unwrap();
            tm.commit().unwrap();
        }

        let before = std::fs::metadata(&config.path).unwrap().len();
        thread::sleep(Duration::from_millis(10));
        let stats = db.pack(None).unwrap();
        assert!(stats.file_size_after < before);
        assert_eq!(db.history(oid, 100).unwrap().len(), 1);

        conn.cache_minimize();
        assert_eq!(counter_value(&conn, oid), 10);
        conn.get(oid).unwrap().write(|c: &mut Counter| c.increment(1)).unwrap();
        tm.commit().unwrap();
        assert_eq!(counter_value(&conn, oid), 11);
    });
}

#[test]
fn cache_is_kept_near_its_target_size() {
    let config = Config {
        cache_size: 3,
        ..test_config("cache_is_kept_near_its_target_size")
    };
    let db = config.open().unwrap();
    let tm = TransactionManager::new();
    let conn = db.open_with(&tm).unwrap();

    let counters: Vec<_> = (0..10).map(|i| conn.add(Counter::new(i)).unwrap()).collect();
    conn.root()
        .unwrap()
        .write(|root: &mut PersistentMapping| {
            for (i, counter) in counters.iter().enumerate() {
                root.insert(format!("c{i}"), counter.oid());
            }
        })
        .unwrap();
    tm.commit().unwrap();

    assert!(conn.cache_non_ghost_count() <= 3);
    for (i, counter) in counters.iter().enumerate() {
        assert_eq!(counter.read(|c: &Counter| c.value()).unwrap(), i as i64);
    }
    conn.cache_gc();
    assert!(conn.cache_non_ghost_count() <= 3);

    conn.cache_minimize();
    assert_eq!(conn.cache_non_ghost_count(), 0);

    drop(counters);
    conn.cache_gc();
    assert_eq!(conn.cache_len(), 0);

    drop(conn);
    db.close().unwrap();
    cleanup(&config);
}

#[test]
fn read_only_database_serves_reads() {
    let config = test_config("read_only_database_serves_reads");
    let db = open_db(&config);
    let oid = add_to_root(&db, "counter", Counter::new(3));
    db.close().unwrap();

    let read_only = Config {
        read_only: true,
        ..config.clone()
    };
    let db = open_db(&read_only);
    let tm = TransactionManager::new();
    let conn = db.open_with(&tm).unwrap();
    assert_eq!(counter_value(&conn, oid), 3);
    assert!(matches!(
        conn.get(oid).unwrap().write(|c: &mut Counter| c.increment(1)),
        Err(Error::ReadOnly)
    ));
    assert!(matches!(conn.add(Counter::new(1)), Err(Error::ReadOnly)));

    drop(conn);
    db.close().unwrap();
    cleanup(&config);
}

#[test]
fn type_errors_are_reported() {
    with_db("type_errors_are_reported", |_config, db| {
        let tm = TransactionManager::new();
        let conn = db.open_with(&tm).unwrap();
        let root = conn.root().unwrap();

        assert!(matches!(
            root.read(|c: &Counter| c.value()),
            Err(Error::WrongType { .. })
        ));
        assert!(matches!(
            root.write(|c: &mut Counter| c.increment(1)),
            Err(Error::WrongType { .. })
        ));
        assert!(matches!(conn.add(Unregistered), Err(Error::UnknownClass(_))));
        assert_eq!(tm.get().status(), TxnState::Active);
    });
}

#[test]
fn closing_the_database_closes_connections() {
    let config = test_config("closing_the_database_closes_connections");
    let db = config.open().unwrap();
    let conn = db.open_with(&TransactionManager::new()).unwrap();

    db.close().unwrap();

    assert!(matches!(conn.root(), Err(Error::ConnectionState(_))));
    assert!(matches!(db.open(), Err(Error::ConnectionState(_))));
    drop(conn);
    cleanup(&config);
}
