use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::atomic::Ordering::SeqCst;
use std::time::SystemTime;

use fault_injection::fallible;

use crate::format::{
    read_frame, read_record_header, Frame, FrameWriter, Payload, TxnHeader, TxnStatus, MAGIC,
    MAGIC_LEN,
};
use crate::readpath::resolve_data;
use crate::recovery::sibling_path;
use crate::storage::PackStats;
use crate::writepath::PACK_OWNER;
use crate::{FileStorage, Map, Oid, PickleFormat, Result, Set, Tid};

/// Releases the commit lock taken by pack on every exit path.
struct DeferRelease<'a> {
    storage: &'a FileStorage,
}

impl<'a> Drop for DeferRelease<'a> {
    fn drop(&mut self) {
        self.storage.release_commit_lock();
    }
}

/// Writes the packed copy of the data file.
struct Rewriter<'a> {
    old: &'a File,
    out: BufWriter<File>,
    out_pos: u64,
    // old record position -> new record position
    moved: Map<u64, u64>,
    index: Map<Oid, u64>,
    records_before: u64,
    records_after: u64,
}

struct Rewritten {
    file: File,
    index: Map<Oid, u64>,
    eof: u64,
    records_before: u64,
    records_after: u64,
}

impl<'a> Rewriter<'a> {
    fn new(old: &'a File, out: File, pack_tid: Tid, last_oid: Oid) -> io::Result<Rewriter<'a>> {
        let mut rewriter = Rewriter {
            old,
            out: BufWriter::with_capacity(8 * 1024 * 1024, out),
            out_pos: 0,
            moved: Map::default(),
            index: Map::default(),
            records_before: 0,
            records_after: 0,
        };

        fallible!(rewriter.out.write_all(MAGIC));
        rewriter.out_pos = MAGIC_LEN;

        // recovery skips this frame, it only records how far back
        // history has been rewritten and the oid counter, which
        // collected objects no longer witness
        let marker = TxnHeader {
            tid: pack_tid,
            tlen: 0,
            status: TxnStatus::Packed,
            user: vec![],
            description: b"pack".to_vec(),
            extension: last_oid.to_bytes().to_vec(),
        };
        let bytes = FrameWriter::new(rewriter.out_pos, &marker)?.into_bytes();
        fallible!(rewriter.out.write_all(&bytes));
        rewriter.out_pos += bytes.len() as u64;

        Ok(rewriter)
    }

    fn write_frame(
        &mut self,
        header: &TxnHeader,
        records: Vec<(u64, Oid, u64, Payload)>,
    ) -> io::Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut writer = FrameWriter::new(self.out_pos, header)?;
        for (old_pos, oid, prev, payload) in records {
            let new_pos = writer.push_record(oid, prev, &payload);
            self.moved.insert(old_pos, new_pos);
            self.index.insert(oid, new_pos);
            self.records_after += 1;
        }

        let bytes = writer.into_bytes();
        fallible!(self.out.write_all(&bytes));
        self.out_pos += bytes.len() as u64;

        Ok(())
    }

    /// Keeps only the revisions in `keep`, which are the ones
    /// current at pack time for reachable objects, with their
    /// data inlined and their history cut off.
    fn rewrite_historical(&mut self, frame: Frame, keep: &Map<Oid, u64>) -> io::Result<()> {
        self.records_before += frame.records.len() as u64;

        let mut records = vec![];
        for record in frame.records {
            let oid = record.header.oid;
            if keep.get(&oid) != Some(&record.pos) {
                continue;
            }
            // a revision saying the object does not exist has
            // nothing left to preserve once its history is gone
            if let Some(data) = resolve_data(self.old, oid, record.pos, &record.header)? {
                records.push((record.pos, oid, 0, Payload::Data(data)));
            }
        }

        let header = TxnHeader {
            status: TxnStatus::Committed,
            ..frame.header
        };
        self.write_frame(&header, records)
    }

    /// Copies a frame newer than the pack time, remapping file
    /// positions into the new file.
    fn copy_recent(&mut self, frame: Frame) -> io::Result<()> {
        self.records_before += frame.records.len() as u64;

        let mut records = Vec::with_capacity(frame.records.len());
        for record in frame.records {
            let oid = record.header.oid;
            let prev = self.moved.get(&record.header.prev).copied().unwrap_or(0);
            let payload = match record.payload {
                Payload::Data(data) => Payload::Data(data),
                Payload::Backpointer(0) => Payload::Backpointer(0),
                Payload::Backpointer(target) => match self.moved.get(&target) {
                    Some(new_target) => Payload::Backpointer(*new_target),
                    None => match resolve_data(self.old, oid, record.pos, &record.header)? {
                        Some(data) => Payload::Data(data),
                        None => Payload::Backpointer(0),
                    },
                },
            };
            records.push((record.pos, oid, prev, payload));
        }

        self.write_frame(&frame.header, records)
    }

    /// Copies every frame in `from..to` as a recent frame.
    fn copy_tail(&mut self, from: u64, to: u64) -> io::Result<()> {
        let mut pos = from;
        while pos < to {
            let frame = read_frame(self.old, pos, to)?;
            pos = frame.end();
            if frame.header.status != TxnStatus::Packed {
                self.copy_recent(frame)?;
            }
        }
        Ok(())
    }

    fn finish(self) -> io::Result<Rewritten> {
        let file = self.out.into_inner().map_err(|e| e.into_error())?;
        fallible!(file.sync_all());
        Ok(Rewritten {
            file,
            index: self.index,
            eof: self.out_pos,
            records_before: self.records_before,
            records_after: self.records_after,
        })
    }
}

/// Finds the objects reachable from the root at `pack_tid`, or
/// from any revision written after it, and returns the pack-time
/// position of each one's current revision.
fn mark(file: &File, eof: u64, pack_tid: Tid, format: &dyn PickleFormat) -> Result<Map<Oid, u64>> {
    let mut packtime: Map<Oid, u64> = Map::default();
    let mut stack = vec![Oid::ROOT];

    let mut pos = MAGIC_LEN;
    while pos < eof {
        let frame = read_frame(file, pos, eof)?;
        pos = frame.end();

        if frame.header.status == TxnStatus::Packed {
            continue;
        }

        if frame.header.tid <= pack_tid {
            for record in &frame.records {
                packtime.insert(record.header.oid, record.pos);
            }
        } else {
            for record in &frame.records {
                let oid = record.header.oid;
                stack.push(oid);
                if let Some(data) = resolve_data(file, oid, record.pos, &record.header)? {
                    stack.extend(format.references(&data)?);
                }
            }
        }
    }

    let mut reachable: Set<Oid> = Set::default();
    while let Some(oid) = stack.pop() {
        if !reachable.insert(oid) {
            continue;
        }
        if let Some(&pos) = packtime.get(&oid) {
            let rh = read_record_header(file, pos)?;
            if let Some(data) = resolve_data(file, oid, pos, &rh)? {
                stack.extend(format.references(&data)?);
            }
        }
    }

    let before = packtime.len();
    packtime.retain(|oid, _| reachable.contains(oid));

    log::debug!(
        "pack keeps {} of {before} objects that existed at {pack_tid}",
        packtime.len()
    );

    Ok(packtime)
}

/// The highest oid allocated before the pack that wrote `marker`.
pub(crate) fn marker_last_oid(marker: &TxnHeader) -> Oid {
    marker
        .extension
        .get(..8)
        .and_then(|bytes| <[u8; 8]>::try_from(bytes).ok())
        .map_or(Oid::ROOT, Oid::from_bytes)
}

fn sync_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            let dir = fallible!(File::open(parent));
            fallible!(dir.sync_all());
            Ok(())
        }
        _ => Ok(()),
    }
}

impl FileStorage {
    /// Rewrites the data file without the revisions that were
    /// superseded at `time` and without objects that were not
    /// reachable from the root at `time`.
    ///
    /// Commits proceed while the bulk of the file is copied. They
    /// are blocked only while the transactions committed during
    /// the copy are appended and the new file is swapped in.
    pub(crate) fn pack_until(&self, time: SystemTime) -> Result<PackStats> {
        self.check_writable()?;

        let _pack_guard = self.shared.pack_lock.lock();

        let pack_path = sibling_path(&self.shared.config.path, "pack");

        let res = self.pack_inner(time, &pack_path);

        if res.is_err() && pack_path.exists() {
            if let Err(e) = fs::remove_file(&pack_path) {
                log::warn!("failed to remove {:?} after a failed pack: {:?}", pack_path, e);
            }
        }

        res
    }

    fn pack_inner(&self, time: SystemTime, pack_path: &Path) -> Result<PackStats> {
        let (eof, last_tid, last_oid, old_pack_tid) = {
            let state = self.shared.state.lock();
            (state.eof, state.last_tid, state.last_oid, state.pack_tid)
        };

        let pack_tid = Tid::from_system_time(time).min(last_tid);

        if pack_tid == Tid::ZERO || pack_tid <= old_pack_tid {
            log::debug!("nothing to pack at {pack_tid}, history is packed up to {old_pack_tid}");
            return Ok(PackStats {
                pack_tid,
                file_size_before: eof,
                file_size_after: eof,
                records_before: 0,
                records_after: 0,
            });
        }

        log::info!("packing {} as of {pack_tid}, {eof} bytes", self.shared.name);

        let out = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(pack_path)?;

        let file = self.shared.file.read();

        let keep = mark(&file, eof, pack_tid, &*self.shared.format)?;

        let mut rewriter = Rewriter::new(&file, out, pack_tid, last_oid)?;

        let mut pos = MAGIC_LEN;
        while pos < eof {
            let frame = read_frame(&file, pos, eof)?;
            pos = frame.end();

            if frame.header.status == TxnStatus::Packed {
                continue;
            }

            if frame.header.tid <= pack_tid {
                rewriter.rewrite_historical(frame, &keep)?;
            } else {
                rewriter.copy_recent(frame)?;
            }
        }

        // block commits while the tail written during the copy is
        // brought over and the files are swapped
        self.acquire_commit_lock(PACK_OWNER)?;
        let _release = DeferRelease { storage: self };

        let tail = self.shared.state.lock().eof;
        rewriter.copy_tail(eof, tail)?;

        let rewritten = rewriter.finish()?;
        drop(file);

        let path = &self.shared.config.path;
        let old_path = sibling_path(path, "old");

        if self.shared.config.pack_keep_old {
            match fs::remove_file(&old_path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            fs::hard_link(path, &old_path)?;
        }

        let mut state = self.shared.state.lock();
        let mut file = self.shared.file.write();

        fs::rename(pack_path, path)?;
        sync_parent(path)?;

        *file = rewritten.file;
        self.shared.index.replace(rewritten.index);
        state.eof = rewritten.eof;
        state.pack_tid = pack_tid;
        self.shared.generation.fetch_add(1, SeqCst);

        drop(file);
        drop(state);

        // positions in a saved index refer to the old file
        match fs::remove_file(sibling_path(path, "index")) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("failed to remove stale index after pack: {:?}", e),
        }
        if let Err(e) = self.shared.save_index() {
            log::warn!("failed to save index of {} after pack: {:?}", self.shared.name, e);
        }

        let stats = PackStats {
            pack_tid,
            file_size_before: tail,
            file_size_after: rewritten.eof,
            records_before: rewritten.records_before,
            records_after: rewritten.records_after,
        };

        log::info!("packed {}: {:?}", self.shared.name, stats);

        Ok(stats)
    }
}
