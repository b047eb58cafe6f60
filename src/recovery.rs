use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering::SeqCst};
use std::sync::Arc;

use fault_injection::fallible;
use parking_lot::{Condvar, Mutex, RwLock};

use crate::format::{
    read_frame, read_frame_len, TxnHeader, TxnStatus, MAGIC, MAGIC_LEN, TLEN_LEN,
    TXN_HEADER_LEN,
};
use crate::index::{read_index, write_index, SavedIndex};
use crate::pack::marker_last_oid;
use crate::{
    read_range_at, write_all_at, Config, Error, FileStorage, Index, Map, Oid, PickleFormat,
    Result, Shared, State, Tid,
};

/// `<path>.<ext>`, for the files that live next to the data file.
pub(crate) fn sibling_path(path: &Path, ext: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(ext);
    PathBuf::from(name)
}

/// The primary index and counters as rebuilt from disk.
struct Recovered {
    table: Map<Oid, u64>,
    pack_tid: Tid,
    last_tid: Tid,
    last_oid: Oid,
    eof: u64,
}

impl FileStorage {
    /// Opens (creating if necessary) the data file described by
    /// `config`, rebuilding the index from the saved snapshot and
    /// a forward scan of anything written after it.
    pub fn open(config: &Config, format: Arc<dyn PickleFormat>) -> Result<FileStorage> {
        let config = config.clone();

        config.validate()?;

        log::debug!("opening FileStorage at {:?}", config.path);

        let lock_file = lock(&config)?;

        let index_path = sibling_path(&config.path, "index");
        let pack_path = sibling_path(&config.path, "pack");

        if !config.read_only && pack_path.exists() {
            log::warn!(
                "removing pack file that was not fully written before the last crash: {:?}",
                pack_path
            );
            fs::remove_file(&pack_path)?;
        }

        if config.create {
            for stale in [&config.path, &index_path] {
                match fs::remove_file(stale) {
                    Ok(()) => log::debug!("removed {:?} because create was requested", stale),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }

        let file = open_data_file(&config)?;
        let file_len = file.metadata()?.len();

        let recovered = match read_index(&index_path)? {
            Some(saved) if saved_index_matches(&file, file_len, &saved) => {
                log::debug!(
                    "resuming from saved index covering {} with {} objects",
                    saved.pos,
                    saved.entries.len()
                );
                let recovered = Recovered {
                    table: saved.entries.into_iter().collect(),
                    pack_tid: read_pack_marker(&file, file_len),
                    last_tid: saved.last_tid,
                    last_oid: saved.last_oid,
                    eof: saved.pos,
                };
                scan(&file, file_len, recovered)?
            }
            other => {
                if other.is_some() {
                    log::warn!("saved index does not match the data file, rescanning");
                }
                let recovered = Recovered {
                    table: Map::default(),
                    pack_tid: Tid::ZERO,
                    last_tid: Tid::ZERO,
                    last_oid: Oid::ROOT,
                    eof: MAGIC_LEN,
                };
                scan(&file, file_len, recovered)?
            }
        };

        if recovered.eof < file_len {
            if config.read_only {
                log::warn!(
                    "ignoring {} bytes of uncommitted data at the end of read-only {:?}",
                    file_len - recovered.eof,
                    config.path
                );
            } else {
                log::warn!(
                    "truncating {} bytes of uncommitted data at the end of {:?}",
                    file_len - recovered.eof,
                    config.path
                );
                file.set_len(recovered.eof)?;
                file.sync_all()?;
            }
        }

        log::debug!(
            "recovered {} objects, last tid {} last oid {} eof {}",
            recovered.table.len(),
            recovered.last_tid,
            recovered.last_oid,
            recovered.eof
        );

        let name = config.path.display().to_string();

        Ok(FileStorage {
            shared: Arc::new(Shared {
                name,
                file: RwLock::new(file),
                index: Index::from_table(recovered.table),
                format,
                commit_owner: Mutex::new(None),
                commit_cv: Condvar::new(),
                state: Mutex::new(State {
                    last_tid: recovered.last_tid,
                    last_oid: recovered.last_oid,
                    pack_tid: recovered.pack_tid,
                    eof: recovered.eof,
                    pending: None,
                }),
                degraded: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                pack_lock: Mutex::new(()),
                lock_file,
                config,
            }),
        })
    }

    /// Persists the index (if configured) and releases the
    /// process lock. Further operations fail.
    pub fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, SeqCst) {
            return Ok(());
        }
        log::debug!("closing FileStorage at {:?}", self.shared.config.path);
        let res = self.shared.save_index();
        let _ = fs2::FileExt::unlock(&self.shared.lock_file);
        res
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.shared.closed.load(SeqCst) {
            Err(Error::Storage(format!("{} is closed", self.shared.name)))
        } else {
            Ok(())
        }
    }
}

impl Shared {
    pub(crate) fn save_index(&self) -> Result<()> {
        if !self.config.save_index || self.config.read_only {
            return Ok(());
        }
        let state = self.state.lock();
        let saved = SavedIndex {
            pos: state.eof,
            last_tid: state.last_tid,
            last_oid: state.last_oid,
            entries: self.index.snapshot().into_iter().collect(),
        };
        drop(state);
        write_index(&sibling_path(&self.config.path, "index"), &saved)?;
        Ok(())
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if !self.closed.load(SeqCst) {
            if let Err(e) = self.save_index() {
                log::error!("failed to save index of {} on drop: {:?}", self.name, e);
            }
        }
    }
}

fn lock(config: &Config) -> Result<File> {
    let lock_path = sibling_path(&config.path, "lock");

    if let Some(parent) = config.path.parent() {
        if !config.read_only && !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut options = OpenOptions::new();
    options.read(true).write(true).create(true);

    let lock_file = fallible!(options.open(&lock_path));

    // std has inherent File locking methods with other signatures
    let res = if config.read_only {
        fs2::FileExt::try_lock_shared(&lock_file)
    } else {
        fs2::FileExt::try_lock_exclusive(&lock_file)
    };

    if let Err(e) = res {
        return Err(Error::Storage(format!(
            "could not lock {:?}, is another process using it? ({e})",
            lock_path
        )));
    }

    Ok(lock_file)
}

fn open_data_file(config: &Config) -> Result<File> {
    let mut options = OpenOptions::new();
    options.read(true);
    if !config.read_only {
        options.write(true).create(true);
    }

    let file = options.open(&config.path)?;
    let len = file.metadata()?.len();

    if len == 0 {
        if config.read_only {
            return Err(Error::Storage(format!(
                "{:?} is empty and cannot be initialized read-only",
                config.path
            )));
        }
        write_all_at(&file, MAGIC, 0)?;
        file.sync_all()?;
        log::debug!("initialized new data file at {:?}", config.path);
        return Ok(file);
    }

    if len < MAGIC_LEN || read_range_at(&file, 0, MAGIC_LEN)? != MAGIC {
        return Err(Error::Storage(format!(
            "{:?} is not a data file, its magic number is wrong",
            config.path
        )));
    }

    Ok(file)
}

/// A saved index is trusted only if the frame that ends where
/// the index stops is intact and carries the saved last tid.
fn saved_index_matches(file: &File, file_len: u64, saved: &SavedIndex) -> bool {
    if saved.pos > file_len || saved.pos < MAGIC_LEN {
        return false;
    }
    if saved.pos == MAGIC_LEN {
        return saved.entries.is_empty() && saved.last_tid == Tid::ZERO;
    }
    if saved.pos < MAGIC_LEN + TXN_HEADER_LEN as u64 + TLEN_LEN {
        return false;
    }

    let trailer = match read_range_at(file, saved.pos - TLEN_LEN, saved.pos) {
        Ok(buf) => buf,
        Err(_) => return false,
    };
    let mut tlen_bytes = [0_u8; 8];
    tlen_bytes.copy_from_slice(&trailer);
    let tlen = u64::from_be_bytes(tlen_bytes);

    if tlen > saved.pos - MAGIC_LEN {
        return false;
    }
    let frame_pos = saved.pos - tlen;

    match read_range_at(file, frame_pos, frame_pos + TXN_HEADER_LEN as u64)
        .and_then(|buf| TxnHeader::decode_prefix(&buf))
    {
        Ok((tid, leading_tlen, status)) => {
            tid == saved.last_tid && leading_tlen == tlen && status.is_committed()
        }
        Err(_) => false,
    }
}

/// The tid of the pack marker frame at the start of the file, if
/// the file was ever packed.
fn read_pack_marker(file: &File, file_len: u64) -> Tid {
    match read_frame_len(file, MAGIC_LEN, file_len) {
        Ok((_, TxnStatus::Packed)) => {}
        _ => return Tid::ZERO,
    }
    read_range_at(file, MAGIC_LEN, MAGIC_LEN + TXN_HEADER_LEN as u64)
        .and_then(|buf| TxnHeader::decode_prefix(&buf))
        .map_or(Tid::ZERO, |(tid, _, _)| tid)
}

/// Walks frames forward from `recovered.eof`, indexing every
/// committed record, and stops at the first frame that is torn,
/// still in progress, or otherwise unreadable. The position it
/// stops at becomes the new end of file.
fn scan(file: &File, file_len: u64, mut recovered: Recovered) -> Result<Recovered> {
    let mut pos = recovered.eof;

    while pos < file_len {
        let (_tlen, status) = match read_frame_len(file, pos, file_len) {
            Ok(found) => found,
            Err(e) => {
                log::warn!("stopping recovery at torn transaction header at {pos}: {e}");
                break;
            }
        };

        if status == TxnStatus::Checkpoint {
            log::warn!("stopping recovery at transaction at {pos} that never finished committing");
            break;
        }

        let frame = match read_frame(file, pos, file_len) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("stopping recovery at corrupt transaction at {pos}: {e}");
                break;
            }
        };

        if status == TxnStatus::Packed {
            // pack leaves one of these at the start of the file to
            // record how far back history was rewritten
            log::debug!("skipping pack marker {} at {pos}", frame.header.tid);
            recovered.pack_tid = recovered.pack_tid.max(frame.header.tid);
            recovered.last_oid = recovered.last_oid.max(marker_last_oid(&frame.header));
            pos = frame.end();
            continue;
        }

        if frame.header.tid <= recovered.last_tid {
            return Err(Error::Storage(format!(
                "transaction at {pos} has tid {} which is not after the previous tid {}",
                frame.header.tid, recovered.last_tid
            )));
        }

        log::trace!(
            "recovered transaction {} at {pos} with {} records",
            frame.header.tid,
            frame.records.len()
        );

        for record in &frame.records {
            recovered.table.insert(record.header.oid, record.pos);
            recovered.last_oid = recovered.last_oid.max(record.header.oid);
        }

        recovered.last_tid = frame.header.tid;
        pos = frame.end();
    }

    recovered.eof = pos;

    Ok(recovered)
}
