#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering::SeqCst};

use granite::{Config, Oid, Storage, Tid, TxnInfo};

mod alloc {
    use std::alloc::{Layout, System};

    #[global_allocator]
    static ALLOCATOR: Alloc = Alloc;

    #[derive(Default, Debug, Clone, Copy)]
    struct Alloc;

    unsafe impl std::alloc::GlobalAlloc for Alloc {
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            let ret = unsafe { System.alloc(layout) };
            assert_ne!(ret, std::ptr::null_mut());
            unsafe {
                std::ptr::write_bytes(ret, 0xa1, layout.size());
            }
            ret
        }

        unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
            unsafe {
                std::ptr::write_bytes(ptr, 0xde, layout.size());
                System.dealloc(ptr, layout)
            }
        }
    }
}

pub fn setup_logger() {
    use std::io::Write;

    fn tn() -> String {
        std::thread::current()
            .name()
            .unwrap_or("unknown")
            .to_owned()
    }

    let mut builder = env_logger::Builder::new();
    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "{:05} {:20} {:10} {}",
                record.level(),
                tn(),
                record.module_path().unwrap().split("::").last().unwrap(),
                record.args()
            )
        })
        .filter(None, log::LevelFilter::Info);

    if let Ok(env) = std::env::var("RUST_LOG") {
        builder.parse_filters(&env);
    }

    let _r = builder.try_init();
}

pub const TEST_DIR: &str = "testing_data_directories";

static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);
static TXN_COUNTER: AtomicU64 = AtomicU64::new(1);

/// A config pointing at a fresh directory of its own.
pub fn test_config(name: &str) -> Config {
    setup_logger();

    let subdir = format!("{name}_{}_{}", std::process::id(), TEST_COUNTER.fetch_add(1, SeqCst));
    let dir = PathBuf::from(TEST_DIR).join(subdir);
    let _ = std::fs::remove_dir_all(&dir);

    Config {
        path: dir.join("data.fs"),
        fsync_each_commit: false,
        ..Default::default()
    }
}

pub fn cleanup(config: &Config) {
    if let Some(dir) = config.path.parent() {
        let _ = std::fs::remove_dir_all(dir);
    }
}

pub fn txn_info(description: &str) -> TxnInfo {
    TxnInfo {
        id: u64::MAX / 2 + TXN_COUNTER.fetch_add(1, SeqCst),
        user: "tester".into(),
        description: description.into(),
        extension: vec![],
    }
}

/// Commits one transaction straight against the storage.
pub fn commit<S: Storage + ?Sized>(
    storage: &S,
    description: &str,
    stores: &[(Oid, Tid, &[u8])],
) -> granite::Result<Tid> {
    let txn = txn_info(description);
    storage.tpc_begin(&txn, None, None)?;
    let res = (|| {
        for (oid, serial, data) in stores {
            storage.store(*oid, *serial, data, &txn)?;
        }
        storage.tpc_vote(&txn)?;
        storage.tpc_finish(&txn, &mut |_, _| {})
    })();
    if res.is_err() {
        storage.tpc_abort(&txn)?;
    }
    res
}
