use rand::{thread_rng, Rng};

use granite::{Config, Counter, Database, Oid, PersistentMapping, TransactionManager};

mod common;

const KEYSPACE: usize = 16;
const BATCH_SZ: usize = 3;
const OPS: usize = 48;
const BATCHES: usize = OPS / BATCH_SZ;

/// Returns how many increments it committed.
fn run(db: Database, counters: Vec<Oid>) -> usize {
    let tm = TransactionManager::new();
    let conn = db.open_with(&tm).unwrap();

    let mut rng = thread_rng();
    let mut committed = 0;
    let mut retries = 0;

    for i in 0..BATCHES {
        let batch: Vec<Oid> = (0..BATCH_SZ)
            .map(|_| counters[rng.gen_range(0..KEYSPACE)])
            .collect();

        loop {
            tm.begin();
            let res = batch
                .iter()
                .try_for_each(|oid| {
                    conn.get(*oid)?
                        .write(|counter: &mut Counter| counter.increment(1))
                        .map(drop)
                })
                .and_then(|()| tm.commit());
            // a concurrent pack can remove revisions an old snapshot
            // still needs, which surfaces as a read conflict
            match res {
                Ok(()) => break,
                Err(e) if e.is_transient() => {
                    tm.abort().unwrap();
                    retries += 1;
                }
                Err(e) => panic!("commit failed: {e:?}"),
            }
        }
        committed += BATCH_SZ;

        if i % 16 == 0 {
            let stats = db.pack(None).unwrap();
            if stats.records_before != stats.records_after {
                log::info!(
                    "packed away {} records",
                    stats.records_before - stats.records_after
                );
            }
        }
    }

    if retries != 0 {
        log::info!("retried {} transactions", retries);
    }

    conn.close().unwrap();
    committed
}

#[test]
fn burn_in() {
    let concurrency: usize = std::thread::available_parallelism().unwrap().get() * 2;

    let config = Config {
        pool_size: concurrency + 1,
        ..common::test_config("burn_in")
    };
    let db = config.open().unwrap();

    let tm = TransactionManager::new();
    let conn = db.open_with(&tm).unwrap();
    let counters: Vec<Oid> = (0..KEYSPACE)
        .map(|_| conn.add(Counter::new(0)).unwrap().oid())
        .collect();
    conn.root()
        .unwrap()
        .write(|root: &mut PersistentMapping| {
            for (i, oid) in counters.iter().enumerate() {
                root.insert(format!("c{i}"), *oid);
            }
        })
        .unwrap();
    tm.commit().unwrap();

    let mut threads = vec![];

    let before = std::time::Instant::now();

    for i in 0..concurrency {
        let db = db.clone();
        let counters = counters.clone();
        threads.push(
            std::thread::Builder::new()
                .name(format!("thread-{i}"))
                .spawn(move || run(db, counters))
                .unwrap(),
        )
    }

    let mut total_ops = 0;
    for thread in threads {
        total_ops += thread.join().unwrap();
    }

    let fault_injection_points =
        u64::MAX - fault_injection::FAULT_INJECT_COUNTER.load(std::sync::atomic::Ordering::Acquire);
    let elapsed = before.elapsed();
    let writes_per_second = (total_ops as u128 * 1000) / elapsed.as_millis().max(1);

    log::info!(
        "committed {} increments in {:?} with {} threads ({} writes per second), {} fault \
         injection points",
        total_ops,
        elapsed,
        concurrency,
        writes_per_second,
        fault_injection_points,
    );

    tm.begin();
    let sum: i64 = counters
        .iter()
        .map(|oid| conn.get(*oid).unwrap().read(|c: &Counter| c.value()).unwrap())
        .sum();
    assert_eq!(sum, total_ops as i64);

    drop(conn);
    db.close().unwrap();
    common::cleanup(&config);
}
