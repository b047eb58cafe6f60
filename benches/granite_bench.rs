use criterion::{criterion_group, criterion_main, Criterion};

use granite::{
    Config, Counter, Oid, PersistentMapping, Serializer, Storage, Tid, TransactionManager, TxnInfo,
};

fn bench_config(name: &str) -> Config {
    let path = std::path::Path::new("bench_data").join(name);
    let _ = std::fs::remove_dir_all(&path);
    Config {
        path: path.join("data.fs"),
        ..Default::default()
    }
}

pub fn measure_commit_latency(c: &mut Criterion) {
    let config = bench_config("commit_latency");
    let storage = config.open_storage().unwrap();
    let oid = storage.new_oid().unwrap();
    let data = Serializer::new().serialize(&Counter::new(0)).unwrap();

    let mut serial = Tid::ZERO;
    let mut id = 0;
    c.bench_function("storage commit", |b| {
        b.iter(|| {
            id += 1;
            let txn = TxnInfo {
                id,
                ..Default::default()
            };
            storage.tpc_begin(&txn, None, None).unwrap();
            storage.store(oid, serial, &data, &txn).unwrap();
            storage.tpc_vote(&txn).unwrap();
            serial = storage.tpc_finish(&txn, &mut |_, _| {}).unwrap();
        })
    });

    c.bench_function("storage load", |b| {
        b.iter(|| storage.load(oid, None).unwrap())
    });

    storage.close().unwrap();
}

pub fn measure_transaction_throughput(c: &mut Criterion) {
    let config = Config {
        fsync_each_commit: false,
        ..bench_config("transaction_throughput")
    };
    let db = config.open().unwrap();
    let tm = TransactionManager::new();
    let conn = db.open_with(&tm).unwrap();

    let counter = conn.add(Counter::new(0)).unwrap();
    conn.root()
        .unwrap()
        .write(|root: &mut PersistentMapping| root.insert("counter", counter.oid()))
        .unwrap();
    tm.commit().unwrap();
    let oid: Oid = counter.oid();

    c.bench_function("increment and commit", |b| {
        b.iter(|| {
            conn.get(oid)
                .unwrap()
                .write(|counter: &mut Counter| counter.increment(1))
                .unwrap();
            tm.commit().unwrap();
        })
    });

    drop(conn);
    db.close().unwrap();
}

criterion_group!(latency, measure_commit_latency);
criterion_group!(throughput, measure_transaction_throughput);
criterion_main!(latency, throughput);
