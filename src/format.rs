//! On-disk layout of the data file.
//!
//! ```txt
//! file   := "FS21" frame*
//! frame  := tid:8 tlen:8 status:1 ul:2 dl:2 el:2 user description extension
//!           record* tlen:8
//! record := oid:8 tid:8 prev:8 tx_pos:8 vlen:2 plen:8 version data
//! ```
//!
//! All integers are big-endian. `tlen` covers the whole frame,
//! including the redundant trailing copy that allows walking
//! the file backwards. A record with `plen == 0` carries an
//! 8-byte backpointer to an earlier record of the same object
//! instead of data; backpointer 0 means the object does not
//! exist in that revision.
use std::fs::File;
use std::io;

use fault_injection::annotate;

use crate::{read_range_at, Oid, Tid};

pub(crate) const MAGIC: &[u8; 4] = b"FS21";
pub(crate) const MAGIC_LEN: u64 = 4;
pub(crate) const TXN_HEADER_LEN: usize = 23;
pub(crate) const RECORD_HEADER_LEN: usize = 42;
pub(crate) const TLEN_LEN: u64 = 8;
pub(crate) const BACKPOINTER_LEN: u64 = 8;

pub(crate) const TLEN_OFFSET: u64 = 8;
pub(crate) const STATUS_OFFSET: u64 = 16;

/// Status byte of a transaction frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxnStatus {
    /// `' '`: durable and visible.
    Committed,
    /// `'c'`: staged by an in-progress commit. Truncated on recovery.
    Checkpoint,
    /// `'p'`: written by a historical pack. Never trusted as committed.
    Packed,
    /// `'u'`: superseded, informational only.
    Undone,
}

impl TxnStatus {
    pub fn to_byte(self) -> u8 {
        match self {
            TxnStatus::Committed => b' ',
            TxnStatus::Checkpoint => b'c',
            TxnStatus::Packed => b'p',
            TxnStatus::Undone => b'u',
        }
    }

    pub fn from_byte(byte: u8) -> Option<TxnStatus> {
        match byte {
            b' ' => Some(TxnStatus::Committed),
            b'c' => Some(TxnStatus::Checkpoint),
            b'p' => Some(TxnStatus::Packed),
            b'u' => Some(TxnStatus::Undone),
            _ => None,
        }
    }

    /// Whether recovery and readers may trust the frame.
    pub fn is_committed(self) -> bool {
        matches!(self, TxnStatus::Committed | TxnStatus::Undone)
    }
}

fn be_u64(buf: &[u8]) -> u64 {
    let mut bytes = [0_u8; 8];
    bytes.copy_from_slice(&buf[..8]);
    u64::from_be_bytes(bytes)
}

fn be_u16(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

fn invalid(msg: String) -> io::Error {
    let e = io::Error::new(io::ErrorKind::InvalidData, msg);
    annotate!(e)
}

fn u16_len(field: &str, bytes: &[u8]) -> io::Result<u16> {
    u16::try_from(bytes.len()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("transaction {field} is {} bytes, more than {}", bytes.len(), u16::MAX),
        )
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TxnHeader {
    pub tid: Tid,
    pub tlen: u64,
    pub status: TxnStatus,
    pub user: Vec<u8>,
    pub description: Vec<u8>,
    pub extension: Vec<u8>,
}

impl TxnHeader {
    pub fn len(&self) -> u64 {
        (TXN_HEADER_LEN + self.user.len() + self.description.len() + self.extension.len()) as u64
    }

    pub fn encode(&self) -> io::Result<Vec<u8>> {
        let ul = u16_len("user", &self.user)?;
        let dl = u16_len("description", &self.description)?;
        let el = u16_len("extension", &self.extension)?;

        let mut buf = Vec::with_capacity(self.len() as usize);
        buf.extend_from_slice(&self.tid.to_bytes());
        buf.extend_from_slice(&self.tlen.to_be_bytes());
        buf.push(self.status.to_byte());
        buf.extend_from_slice(&ul.to_be_bytes());
        buf.extend_from_slice(&dl.to_be_bytes());
        buf.extend_from_slice(&el.to_be_bytes());
        buf.extend_from_slice(&self.user);
        buf.extend_from_slice(&self.description);
        buf.extend_from_slice(&self.extension);
        Ok(buf)
    }

    /// Decodes the fixed part of a header, returning it along
    /// with the length of the variable part that follows.
    fn decode_fixed(buf: &[u8]) -> io::Result<(Tid, u64, TxnStatus, usize)> {
        if buf.len() < TXN_HEADER_LEN {
            return Err(invalid(format!(
                "transaction header needs {TXN_HEADER_LEN} bytes, got {}",
                buf.len()
            )));
        }
        let tid = Tid::from_u64(be_u64(&buf[0..8]));
        let tlen = be_u64(&buf[8..16]);
        let status = TxnStatus::from_byte(buf[16])
            .ok_or_else(|| invalid(format!("unknown transaction status byte {:#04x}", buf[16])))?;
        let var_len = usize::from(be_u16(&buf[17..19]))
            + usize::from(be_u16(&buf[19..21]))
            + usize::from(be_u16(&buf[21..23]));
        Ok((tid, tlen, status, var_len))
    }

    /// Just the tid, tlen and status of a header.
    pub fn decode_prefix(buf: &[u8]) -> io::Result<(Tid, u64, TxnStatus)> {
        let (tid, tlen, status, _) = TxnHeader::decode_fixed(buf)?;
        Ok((tid, tlen, status))
    }

    pub fn decode(buf: &[u8]) -> io::Result<TxnHeader> {
        let (tid, tlen, status, var_len) = TxnHeader::decode_fixed(buf)?;
        if buf.len() < TXN_HEADER_LEN + var_len {
            return Err(invalid(format!(
                "transaction header for {tid} is truncated: needs {} bytes, got {}",
                TXN_HEADER_LEN + var_len,
                buf.len()
            )));
        }
        let ul = usize::from(be_u16(&buf[17..19]));
        let dl = usize::from(be_u16(&buf[19..21]));
        let el = usize::from(be_u16(&buf[21..23]));
        let user_start = TXN_HEADER_LEN;
        let desc_start = user_start + ul;
        let ext_start = desc_start + dl;
        Ok(TxnHeader {
            tid,
            tlen,
            status,
            user: buf[user_start..desc_start].to_vec(),
            description: buf[desc_start..ext_start].to_vec(),
            extension: buf[ext_start..ext_start + el].to_vec(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RecordHeader {
    pub oid: Oid,
    pub tid: Tid,
    pub prev: u64,
    pub tx_pos: u64,
    pub vlen: u16,
    pub plen: u64,
}

impl RecordHeader {
    pub fn decode(buf: &[u8]) -> io::Result<RecordHeader> {
        if buf.len() < RECORD_HEADER_LEN {
            return Err(invalid(format!(
                "record header needs {RECORD_HEADER_LEN} bytes, got {}",
                buf.len()
            )));
        }
        Ok(RecordHeader {
            oid: Oid::from_u64(be_u64(&buf[0..8])),
            tid: Tid::from_u64(be_u64(&buf[8..16])),
            prev: be_u64(&buf[16..24]),
            tx_pos: be_u64(&buf[24..32]),
            vlen: be_u16(&buf[32..34]),
            plen: be_u64(&buf[34..42]),
        })
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.oid.to_bytes());
        buf.extend_from_slice(&self.tid.to_bytes());
        buf.extend_from_slice(&self.prev.to_be_bytes());
        buf.extend_from_slice(&self.tx_pos.to_be_bytes());
        buf.extend_from_slice(&self.vlen.to_be_bytes());
        buf.extend_from_slice(&self.plen.to_be_bytes());
    }

    pub fn payload_offset(&self) -> u64 {
        RECORD_HEADER_LEN as u64 + u64::from(self.vlen)
    }

    pub fn is_backpointer(&self) -> bool {
        self.plen == 0
    }

    pub fn record_len(&self) -> io::Result<u64> {
        let payload = if self.is_backpointer() {
            BACKPOINTER_LEN
        } else {
            self.plen
        };
        self.payload_offset().checked_add(payload).ok_or_else(|| {
            invalid(format!(
                "record {} in transaction {} has impossible payload length {}",
                self.oid, self.tid, self.plen
            ))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Payload {
    Data(Vec<u8>),
    Backpointer(u64),
}

#[derive(Debug, Clone)]
pub(crate) struct Record {
    pub pos: u64,
    pub header: RecordHeader,
    pub payload: Payload,
}

/// A fully parsed transaction frame.
#[derive(Debug, Clone)]
pub(crate) struct Frame {
    pub pos: u64,
    pub header: TxnHeader,
    pub records: Vec<Record>,
}

impl Frame {
    pub fn end(&self) -> u64 {
        self.pos + self.header.tlen
    }

    /// Parses a frame from a buffer that holds exactly `tlen`
    /// bytes read from `pos`.
    pub fn parse(pos: u64, buf: &[u8]) -> io::Result<Frame> {
        let header = TxnHeader::decode(buf)?;
        let tlen = header.tlen;

        if tlen != buf.len() as u64 {
            return Err(invalid(format!(
                "frame at {pos} claims tlen {tlen} but {} bytes were read",
                buf.len()
            )));
        }
        if tlen < header.len() + TLEN_LEN {
            return Err(invalid(format!("frame at {pos} has impossible tlen {tlen}")));
        }

        let trailer_start = (tlen - TLEN_LEN) as usize;
        let trailing_tlen = be_u64(&buf[trailer_start..]);
        if trailing_tlen != tlen {
            return Err(invalid(format!(
                "frame at {pos} has leading tlen {tlen} but trailing tlen {trailing_tlen}"
            )));
        }

        let mut records = vec![];
        let mut offset = header.len() as usize;

        while offset < trailer_start {
            let rh = RecordHeader::decode(&buf[offset..trailer_start])?;
            let record_pos = pos + offset as u64;

            if rh.tx_pos != pos || rh.tid != header.tid {
                return Err(invalid(format!(
                    "record at {record_pos} claims transaction {} at {} but lives in \
                     transaction {} at {pos}",
                    rh.tid, rh.tx_pos, header.tid
                )));
            }

            let end = (offset as u64).checked_add(rh.record_len()?);
            let Some(end) = end.filter(|end| *end <= trailer_start as u64) else {
                return Err(invalid(format!(
                    "record at {record_pos} overruns the end of its frame"
                )));
            };

            let payload_start = offset + rh.payload_offset() as usize;
            let payload = if rh.is_backpointer() {
                Payload::Backpointer(be_u64(&buf[payload_start..]))
            } else {
                Payload::Data(buf[payload_start..end as usize].to_vec())
            };

            records.push(Record {
                pos: record_pos,
                header: rh,
                payload,
            });
            offset = end as usize;
        }

        Ok(Frame {
            pos,
            header,
            records,
        })
    }
}

/// Reads and validates the whole frame starting at `pos`,
/// refusing to read past `limit`.
pub(crate) fn read_frame(file: &File, pos: u64, limit: u64) -> io::Result<Frame> {
    let (tlen, _status) = read_frame_len(file, pos, limit)?;
    let buf = read_range_at(file, pos, pos + tlen)?;
    Frame::parse(pos, &buf)
}

/// Reads just enough of a frame header to learn its length and
/// status, checking that the frame fits before `limit`.
pub(crate) fn read_frame_len(file: &File, pos: u64, limit: u64) -> io::Result<(u64, TxnStatus)> {
    if pos + TXN_HEADER_LEN as u64 > limit {
        return Err(invalid(format!(
            "transaction header at {pos} would extend past the end of the file at {limit}"
        )));
    }
    let fixed = read_range_at(file, pos, pos + TXN_HEADER_LEN as u64)?;
    let (_tid, tlen, status, var_len) = TxnHeader::decode_fixed(&fixed)?;
    let fits = pos.checked_add(tlen).is_some_and(|end| end <= limit);
    if tlen < (TXN_HEADER_LEN + var_len) as u64 + TLEN_LEN || !fits {
        return Err(invalid(format!(
            "frame at {pos} has tlen {tlen} which does not fit before {limit}"
        )));
    }
    Ok((tlen, status))
}

/// Reads the transaction header, metadata included, at `pos`.
pub(crate) fn read_txn_header(file: &File, pos: u64) -> io::Result<TxnHeader> {
    let fixed = read_range_at(file, pos, pos + TXN_HEADER_LEN as u64)?;
    let (_, _, _, var_len) = TxnHeader::decode_fixed(&fixed)?;
    if var_len == 0 {
        return TxnHeader::decode(&fixed);
    }
    let buf = read_range_at(file, pos, pos + (TXN_HEADER_LEN + var_len) as u64)?;
    TxnHeader::decode(&buf)
}

/// Reads the record header at `pos`.
pub(crate) fn read_record_header(file: &File, pos: u64) -> io::Result<RecordHeader> {
    let buf = read_range_at(file, pos, pos + RECORD_HEADER_LEN as u64)?;
    RecordHeader::decode(&buf)
}

/// Reads the payload of the record at `pos` with header `rh`.
pub(crate) fn read_payload(file: &File, pos: u64, rh: &RecordHeader) -> io::Result<Payload> {
    let start = pos + rh.payload_offset();
    if rh.is_backpointer() {
        let buf = read_range_at(file, start, start + BACKPOINTER_LEN)?;
        Ok(Payload::Backpointer(be_u64(&buf)))
    } else {
        let end = start.checked_add(rh.plen).ok_or_else(|| {
            invalid(format!(
                "record at {pos} has payload length {} past the addressable end",
                rh.plen
            ))
        })?;
        Ok(Payload::Data(read_range_at(file, start, end)?))
    }
}

/// Incrementally assembles one transaction frame. Bytes that
/// have been handed out by `take_unflushed` stay accounted for
/// in record positions and in the final `tlen`.
#[derive(Debug)]
pub(crate) struct FrameWriter {
    pos: u64,
    tid: Tid,
    flushed: u64,
    buf: Vec<u8>,
    records: usize,
}

impl FrameWriter {
    pub fn new(pos: u64, header: &TxnHeader) -> io::Result<FrameWriter> {
        Ok(FrameWriter {
            pos,
            tid: header.tid,
            flushed: 0,
            buf: header.encode()?,
            records: 0,
        })
    }

    pub fn pos(&self) -> u64 {
        self.pos
    }

    pub fn tid(&self) -> Tid {
        self.tid
    }

    pub fn records(&self) -> usize {
        self.records
    }

    /// Total length of the frame once the trailing tlen is added.
    pub fn tlen(&self) -> u64 {
        self.flushed + self.buf.len() as u64 + TLEN_LEN
    }

    pub fn unflushed_len(&self) -> usize {
        self.buf.len()
    }

    /// Appends a record and returns its absolute position.
    pub fn push_record(&mut self, oid: Oid, prev: u64, payload: &Payload) -> u64 {
        let record_pos = self.pos + self.flushed + self.buf.len() as u64;
        let (vlen, plen, bytes): (u16, u64, &[u8]) = match payload {
            Payload::Data(data) => {
                assert!(!data.is_empty(), "empty data would be read back as a backpointer");
                (0, data.len() as u64, data)
            }
            Payload::Backpointer(_) => (0, 0, &[]),
        };
        let rh = RecordHeader {
            oid,
            tid: self.tid,
            prev,
            tx_pos: self.pos,
            vlen,
            plen,
        };
        rh.encode_into(&mut self.buf);
        match payload {
            Payload::Data(_) => self.buf.extend_from_slice(bytes),
            Payload::Backpointer(bp) => self.buf.extend_from_slice(&bp.to_be_bytes()),
        }
        self.records += 1;
        record_pos
    }

    /// Hands out the buffered bytes along with the absolute file
    /// offset they belong at.
    pub fn take_unflushed(&mut self) -> (u64, Vec<u8>) {
        let at = self.pos + self.flushed;
        self.flushed += self.buf.len() as u64;
        (at, std::mem::take(&mut self.buf))
    }

    /// Finishes a frame that was assembled entirely in memory.
    pub fn into_bytes(mut self) -> Vec<u8> {
        assert_eq!(self.flushed, 0, "into_bytes called on a partially flushed frame");
        let tlen = self.tlen();
        self.buf[TLEN_OFFSET as usize..STATUS_OFFSET as usize].copy_from_slice(&tlen.to_be_bytes());
        self.buf.extend_from_slice(&tlen.to_be_bytes());
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(tid: u64) -> TxnHeader {
        TxnHeader {
            tid: Tid::from_u64(tid),
            tlen: 0,
            status: TxnStatus::Committed,
            user: b"alice".to_vec(),
            description: b"initial import".to_vec(),
            extension: vec![],
        }
    }

    #[test]
    fn frame_parses_back_with_positions() {
        let pos = 4;
        let mut writer = FrameWriter::new(pos, &header(7)).unwrap();
        let first = writer.push_record(Oid::from_u64(1), 0, &Payload::Data(b"hello".to_vec()));
        let second = writer.push_record(Oid::from_u64(2), 99, &Payload::Backpointer(first));
        let bytes = writer.into_bytes();

        let frame = Frame::parse(pos, &bytes).unwrap();
        assert_eq!(frame.header.tid, Tid::from_u64(7));
        assert_eq!(frame.header.user, b"alice");
        assert_eq!(frame.end(), pos + bytes.len() as u64);
        assert_eq!(frame.records.len(), 2);
        assert_eq!(frame.records[0].pos, first);
        assert_eq!(frame.records[0].payload, Payload::Data(b"hello".to_vec()));
        assert_eq!(frame.records[1].pos, second);
        assert_eq!(frame.records[1].header.prev, 99);
        assert_eq!(frame.records[1].payload, Payload::Backpointer(first));
    }

    #[test]
    fn mismatched_trailer_is_rejected() {
        let mut bytes = FrameWriter::new(4, &header(7)).unwrap().into_bytes();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(Frame::parse(4, &bytes).is_err());
    }

    #[test]
    fn unknown_status_is_rejected() {
        let mut bytes = FrameWriter::new(4, &header(7)).unwrap().into_bytes();
        bytes[STATUS_OFFSET as usize] = b'x';
        assert!(Frame::parse(4, &bytes).is_err());
    }

    #[test]
    fn oversized_payload_length_is_rejected() {
        let mut writer = FrameWriter::new(4, &header(7)).unwrap();
        let record = writer.push_record(Oid::from_u64(1), 0, &Payload::Data(b"hello".to_vec()));
        let mut bytes = writer.into_bytes();

        let plen_at = (record - 4) as usize + RECORD_HEADER_LEN - 8;
        bytes[plen_at..plen_at + 8].copy_from_slice(&[0xFF; 8]);
        assert!(Frame::parse(4, &bytes).is_err());
    }
}
