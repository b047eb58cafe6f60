#![no_main]
#[macro_use]
extern crate libfuzzer_sys;
extern crate arbitrary;
extern crate granite;
extern crate uuid;

use std::collections::BTreeMap;

use arbitrary::Arbitrary;

use granite::{Config as GraniteConfig, Counter, Database, PersistentMapping, TransactionManager};

const TEST_DIR: &str = "testing_data_directories";
const KEYSPACE: u8 = 16;
const BATCH_MIN_SZ: u8 = 0;
const BATCH_MAX_SZ: u8 = 8;

#[derive(Debug)]
struct Config(GraniteConfig);

impl<'a> Arbitrary<'a> for Config {
    fn arbitrary(u: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Self> {
        let path = std::path::Path::new(TEST_DIR)
            .join("fuzz")
            .join(uuid::Uuid::new_v4().to_string())
            .join("data.fs");

        Ok(Config(GraniteConfig {
            path,
            fsync_each_commit: false,
            save_index: Arbitrary::arbitrary(u).unwrap_or(true),
            cache_size: u.int_in_range(1..=64).unwrap_or(400),
            ..Default::default()
        }))
    }
}

/// Sets (or with `None`, removes) counters under root keys.
#[derive(Debug)]
struct Batch(BTreeMap<String, Option<i64>>);

impl<'a> Arbitrary<'a> for Batch {
    fn arbitrary(u: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Self> {
        let entries: u8 = u
            .int_in_range(BATCH_MIN_SZ..=BATCH_MAX_SZ)
            .unwrap_or(BATCH_MIN_SZ);

        let mut batch = BTreeMap::default();
        for _ in 0..entries {
            let key: u8 = u.int_in_range(0..=KEYSPACE).unwrap_or(0);
            let value = if Arbitrary::arbitrary(u).unwrap_or(true) {
                Some(i64::from(u.int_in_range(-1000_i16..=1000).unwrap_or(1)))
            } else {
                None
            };
            batch.insert(format!("k{key}"), value);
        }

        Ok(Batch(batch))
    }
}

#[derive(Debug)]
enum Op {
    Commit(Batch),
    Abort(Batch),
    UndoLast,
    Pack,
    Restart,
}

impl<'a> Arbitrary<'a> for Op {
    fn arbitrary(u: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Self> {
        let choice = u.int_in_range(0..=4).unwrap_or(0);
        Ok(match choice {
            0 => Op::Commit(Batch::arbitrary(u)?),
            1 => Op::Abort(Batch::arbitrary(u)?),
            2 => Op::UndoLast,
            3 => Op::Pack,
            4 => Op::Restart,
            _ => unreachable!(),
        })
    }
}

fn apply(db: &Database, tm: &TransactionManager, batch: &Batch) {
    let conn = db.open_with(tm).unwrap();
    let root = conn.root().unwrap();
    for (key, value) in &batch.0 {
        let existing = root.read(|root: &PersistentMapping| root.get(key)).unwrap();
        match (existing, value) {
            (Some(oid), Some(value)) => {
                conn.get(oid)
                    .unwrap()
                    .write(|c: &mut Counter| c.increment(*value - c.value()))
                    .unwrap();
            }
            (None, Some(value)) => {
                let oid = conn.add(Counter::new(*value)).unwrap().oid();
                root.write(|root: &mut PersistentMapping| root.insert(key.as_str(), oid))
                    .unwrap();
            }
            (Some(_), None) => {
                root.write(|root: &mut PersistentMapping| root.remove(key)).unwrap();
            }
            (None, None) => {}
        }
    }
}

fn contents(db: &Database) -> BTreeMap<String, i64> {
    let tm = TransactionManager::new();
    let conn = db.open_with(&tm).unwrap();
    let entries: Vec<(String, granite::Oid)> = conn
        .root()
        .unwrap()
        .read(|root: &PersistentMapping| root.iter().map(|(k, v)| (k.clone(), *v)).collect())
        .unwrap();
    entries
        .into_iter()
        .map(|(key, oid)| {
            let value = conn.get(oid).unwrap().read(|c: &Counter| c.value()).unwrap();
            (key, value)
        })
        .collect()
}

fuzz_target!(|args: (Config, [Op; 8])| {
    let (config, ops) = args;

    let mut db = config.0.open().unwrap();
    let tm = TransactionManager::new();

    // the model after each written transaction, newest last
    let mut history: Vec<BTreeMap<String, i64>> = vec![BTreeMap::new()];

    for op in ops {
        match op {
            Op::Commit(batch) => {
                let before = db.last_transaction();
                apply(&db, &tm, &batch);
                tm.commit().unwrap();
                if db.last_transaction() == before {
                    // nothing changed, so nothing was written
                    continue;
                }

                let mut model = history.last().cloned().unwrap_or_default();
                for (key, value) in batch.0 {
                    match value {
                        Some(value) => model.insert(key, value),
                        None => model.remove(&key),
                    };
                }
                history.push(model);
            }
            Op::Abort(batch) => {
                apply(&db, &tm, &batch);
                tm.abort().unwrap();
            }
            Op::UndoLast => {
                // only the newest transaction is always undoable
                let last = db.undo_log(0, 1).unwrap();
                if history.len() > 1 && !last.is_empty() {
                    db.undo(last[0].id, &tm).unwrap();
                    tm.commit().unwrap();
                    let restored = history[history.len() - 2].clone();
                    history.push(restored);
                }
            }
            Op::Pack => {
                std::thread::sleep(std::time::Duration::from_millis(1));
                db.pack(None).unwrap();
            }
            Op::Restart => {
                db.close().unwrap();
                db = config.0.open().unwrap();
            }
        };

        assert_eq!(&contents(&db), history.last().unwrap());
    }

    db.close().unwrap();

    std::fs::remove_dir_all(config.0.path.parent().unwrap()).unwrap();
});
