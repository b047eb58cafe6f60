use std::sync::atomic::Ordering::SeqCst;

use crate::format::{read_frame, read_record_header, Frame, Payload, TxnStatus, MAGIC_LEN};
use crate::readpath::resolve_data;
use crate::storage::{DataRecord, TransactionRecord};
use crate::{Error, FileStorage, Result, Tid};

/// Iterates over committed transactions in file order.
///
/// The set of transactions is fixed when the iterator is
/// created: later commits are not yielded. If the storage is
/// packed while iterating, the next call yields an error and
/// iteration ends.
pub struct TransactionIterator {
    storage: FileStorage,
    pos: u64,
    eof: u64,
    generation: u64,
    start: Option<Tid>,
    end: Option<Tid>,
    done: bool,
}

impl TransactionIterator {
    /// Iterates committed transactions with `start <= tid <= end`.
    pub fn new(
        storage: &FileStorage,
        start: Option<Tid>,
        end: Option<Tid>,
    ) -> Result<TransactionIterator> {
        storage.check_open()?;

        let state = storage.shared.state.lock();
        let eof = state.eof;
        drop(state);

        Ok(TransactionIterator {
            storage: storage.clone(),
            pos: MAGIC_LEN,
            eof,
            generation: storage.shared.generation.load(SeqCst),
            start,
            end,
            done: false,
        })
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let file = self.storage.shared.file.read();

        if self.storage.shared.generation.load(SeqCst) != self.generation {
            return Err(Error::Storage(format!(
                "{} was packed while being iterated",
                self.storage.shared.name
            )));
        }

        while self.pos < self.eof {
            let frame = read_frame(&file, self.pos, self.eof)?;
            self.pos = frame.end();

            if frame.header.status == TxnStatus::Packed {
                continue;
            }
            if self.start.map_or(false, |start| frame.header.tid < start) {
                continue;
            }
            if self.end.map_or(false, |end| frame.header.tid > end) {
                return Ok(None);
            }
            return Ok(Some(frame));
        }

        Ok(None)
    }

    fn to_record(&self, frame: Frame) -> Result<TransactionRecord> {
        let file = self.storage.shared.file.read();

        let mut records = Vec::with_capacity(frame.records.len());

        for record in frame.records {
            let oid = record.header.oid;
            let (data, data_txn) = match record.payload {
                Payload::Data(data) => (Some(data), None),
                Payload::Backpointer(0) => (None, None),
                Payload::Backpointer(target) => {
                    let target_tid = read_record_header(&file, target)?.tid;
                    let data = resolve_data(&file, oid, record.pos, &record.header)?;
                    (data, Some(target_tid))
                }
            };
            records.push(DataRecord {
                oid,
                tid: record.header.tid,
                data,
                data_txn,
            });
        }

        Ok(TransactionRecord {
            tid: frame.header.tid,
            status: frame.header.status,
            user: String::from_utf8_lossy(&frame.header.user).into_owned(),
            description: String::from_utf8_lossy(&frame.header.description).into_owned(),
            extension: frame.header.extension,
            records,
        })
    }
}

impl Iterator for TransactionIterator {
    type Item = Result<TransactionRecord>;

    fn next(&mut self) -> Option<Result<TransactionRecord>> {
        if self.done {
            return None;
        }

        let res = self
            .next_frame()
            .and_then(|frame_opt| frame_opt.map(|frame| self.to_record(frame)).transpose());

        match res {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                log::warn!("stopping transaction iteration at {}: {:?}", self.pos, e);
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
