//! The write-ahead log: an append-only record stream in 64 KiB segments.
//!
//! A record carries one committed batch: `tx_id`, `op_count`, the ops and
//! a trailing CRC32.
//! Records never straddle a segment boundary (the gap is zero-padded)
//! unless a single record is larger than a segment, in which case it starts
//! on a boundary. Replay is idempotent because index puts are
//! insert-or-replace with identical payloads.

use crate::storage::error::{CorruptionError, StorageError};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

pub const SEGMENT_LEN: u64 = 64 * 1024;

const WAL_MAGIC: u64 = 0x6368_726f_6e6f_5731; // "chronoW1"
const FORMAT_VERSION: u32 = 1;
const HEADER_RESERVED: u64 = 4096;

const RECORD_HEADER_LEN: u64 = 12;
const OP_LEN: u64 = 49;
const CRC_LEN: u64 = 4;

/// An implausible op count marks a torn or corrupt record header.
const MAX_OPS_PER_RECORD: u32 = 1 << 24;

#[derive(Eq, PartialEq, Debug, Clone, Copy)]
#[repr(u8)]
pub enum WalOpKind {
    /// A new version was inserted.
    Add = 0,
    /// An open version had its `valid_to` closed.
    Close = 1,
}

/// One quad operation of a batch. Terms are atom words: the atom store is
/// flushed before the record, so replay always resolves them.
#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub struct WalOp {
    pub kind: WalOpKind,
    pub graph: u64,
    pub subject: u64,
    pub predicate: u64,
    pub object: u64,
    pub valid_from: i64,
    pub valid_to: i64,
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub struct WalRecord {
    pub tx_id: u64,
    pub ops: Vec<WalOp>,
}

pub struct Wal {
    file: File,
    tail: u64,
}

impl Wal {
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        if file.metadata()?.len() == 0 {
            write_file_header(&mut file)?;
            file.sync_data()?;
        } else {
            let mut header = [0_u8; 12];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut header)?;
            if u64::from_be_bytes(header[0..8].try_into().unwrap()) != WAL_MAGIC {
                return Err(CorruptionError::BadHeader {
                    file: "wal.log".into(),
                    reason: "bad magic number".into(),
                }
                .into());
            }
            let version = u32::from_be_bytes(header[8..12].try_into().unwrap());
            if version > FORMAT_VERSION {
                return Err(CorruptionError::BadHeader {
                    file: "wal.log".into(),
                    reason: format!(
                        "format version {version} is newer than the supported {FORMAT_VERSION}"
                    ),
                }
                .into());
            }
        }
        Ok(Self {
            file,
            tail: HEADER_RESERVED,
        })
    }

    /// Bytes of log past the header, the checkpoint trigger input.
    pub fn size(&self) -> u64 {
        self.tail - HEADER_RESERVED
    }

    /// Appends one record, zero-padding to the next segment boundary first
    /// if the record would straddle it.
    pub fn append(&mut self, record: &WalRecord) -> Result<(), StorageError> {
        let len = RECORD_HEADER_LEN + OP_LEN * record.ops.len() as u64 + CRC_LEN;
        let into_segment = self.tail % SEGMENT_LEN;
        let remaining = SEGMENT_LEN - into_segment;
        if len > remaining && len <= SEGMENT_LEN {
            let padding = vec![0_u8; usize::try_from(remaining).unwrap()];
            self.file.seek(SeekFrom::Start(self.tail))?;
            self.file.write_all(&padding)?;
            self.tail += remaining;
        } else if len > SEGMENT_LEN && into_segment != 0 {
            let padding = vec![0_u8; usize::try_from(remaining).unwrap()];
            self.file.seek(SeekFrom::Start(self.tail))?;
            self.file.write_all(&padding)?;
            self.tail += remaining;
        }
        let mut body =
            Vec::with_capacity(usize::try_from(RECORD_HEADER_LEN + OP_LEN * record.ops.len() as u64).unwrap());
        body.extend_from_slice(&record.tx_id.to_be_bytes());
        body.extend_from_slice(&u32::try_from(record.ops.len()).unwrap().to_be_bytes());
        for op in &record.ops {
            body.push(op.kind as u8);
            body.extend_from_slice(&op.graph.to_be_bytes());
            body.extend_from_slice(&op.subject.to_be_bytes());
            body.extend_from_slice(&op.predicate.to_be_bytes());
            body.extend_from_slice(&op.object.to_be_bytes());
            body.extend_from_slice(&op.valid_from.to_be_bytes());
            body.extend_from_slice(&op.valid_to.to_be_bytes());
        }
        let crc = crc32fast::hash(&body);
        body.extend_from_slice(&crc.to_be_bytes());
        self.file.seek(SeekFrom::Start(self.tail))?;
        self.file.write_all(&body)?;
        self.tail += body.len() as u64;
        Ok(())
    }

    /// The commit point: everything appended so far reaches the disk.
    pub fn sync(&self) -> Result<(), StorageError> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Scans the log forward, feeding `apply` every valid record with
    /// `tx_id > durable_tx`. Stops at the torn-write boundary and positions
    /// the tail there; a valid record *after* an invalid one means the
    /// middle of the log was damaged, which is fatal.
    pub fn replay(
        &mut self,
        durable_tx: u64,
        mut apply: impl FnMut(&WalRecord) -> Result<(), StorageError>,
    ) -> Result<u64, StorageError> {
        let len = self.file.metadata()?.len();
        let mut pos = HEADER_RESERVED;
        let mut replayed = 0_u64;
        let stop = loop {
            if pos + RECORD_HEADER_LEN + CRC_LEN > len {
                break pos;
            }
            let mut header = [0_u8; 12];
            self.file.seek(SeekFrom::Start(pos))?;
            self.file.read_exact(&mut header)?;
            let tx_id = u64::from_be_bytes(header[0..8].try_into().unwrap());
            if tx_id == 0 {
                // Padding up to the next segment boundary, or the clean end.
                let next = (pos / SEGMENT_LEN + 1) * SEGMENT_LEN;
                if next + RECORD_HEADER_LEN + CRC_LEN > len {
                    break pos;
                }
                let mut probe = [0_u8; 8];
                self.file.seek(SeekFrom::Start(next))?;
                self.file.read_exact(&mut probe)?;
                if u64::from_be_bytes(probe) == 0 {
                    break pos;
                }
                pos = next;
                continue;
            }
            let op_count = u32::from_be_bytes(header[8..12].try_into().unwrap());
            if op_count > MAX_OPS_PER_RECORD {
                break pos;
            }
            let total = RECORD_HEADER_LEN + OP_LEN * u64::from(op_count) + CRC_LEN;
            if pos + total > len {
                break pos;
            }
            let mut body = vec![0_u8; usize::try_from(total - CRC_LEN).unwrap()];
            let mut crc = [0_u8; 4];
            self.file.seek(SeekFrom::Start(pos))?;
            self.file.read_exact(&mut body)?;
            self.file.read_exact(&mut crc)?;
            if crc32fast::hash(&body) != u32::from_be_bytes(crc) {
                break pos;
            }
            if tx_id > durable_tx {
                apply(&decode_record(&body))?;
                replayed += 1;
            }
            pos += total;
        };
        if self.valid_record_after(stop, len)? {
            return Err(CorruptionError::WalCorruption(format!(
                "valid records found after a damaged record at offset {stop}"
            ))
            .into());
        }
        self.tail = stop;
        self.file.set_len(stop.max(HEADER_RESERVED))?;
        Ok(replayed)
    }

    /// Probes later segment boundaries for an intact record.
    fn valid_record_after(&mut self, stop: u64, len: u64) -> Result<bool, StorageError> {
        let mut boundary = (stop / SEGMENT_LEN + 1) * SEGMENT_LEN;
        while boundary + RECORD_HEADER_LEN + CRC_LEN <= len {
            let mut header = [0_u8; 12];
            self.file.seek(SeekFrom::Start(boundary))?;
            self.file.read_exact(&mut header)?;
            let tx_id = u64::from_be_bytes(header[0..8].try_into().unwrap());
            let op_count = u32::from_be_bytes(header[8..12].try_into().unwrap());
            if tx_id != 0 && op_count <= MAX_OPS_PER_RECORD {
                let total = RECORD_HEADER_LEN + OP_LEN * u64::from(op_count) + CRC_LEN;
                if boundary + total <= len {
                    let mut body = vec![0_u8; usize::try_from(total - CRC_LEN).unwrap()];
                    let mut crc = [0_u8; 4];
                    self.file.seek(SeekFrom::Start(boundary))?;
                    self.file.read_exact(&mut body)?;
                    self.file.read_exact(&mut crc)?;
                    if crc32fast::hash(&body) == u32::from_be_bytes(crc) {
                        return Ok(true);
                    }
                }
            }
            boundary += SEGMENT_LEN;
        }
        Ok(false)
    }

    /// Drops every record; the checkpoint made them redundant.
    pub fn truncate(&mut self) -> Result<(), StorageError> {
        self.file.set_len(HEADER_RESERVED)?;
        self.tail = HEADER_RESERVED;
        self.file.sync_data()?;
        Ok(())
    }
}

fn write_file_header(file: &mut File) -> Result<(), StorageError> {
    let mut header = vec![0_u8; usize::try_from(HEADER_RESERVED).unwrap()];
    header[0..8].copy_from_slice(&WAL_MAGIC.to_be_bytes());
    header[8..12].copy_from_slice(&FORMAT_VERSION.to_be_bytes());
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&header)?;
    Ok(())
}

fn decode_record(body: &[u8]) -> WalRecord {
    let tx_id = u64::from_be_bytes(body[0..8].try_into().unwrap());
    let op_count = u32::from_be_bytes(body[8..12].try_into().unwrap());
    let mut ops = Vec::with_capacity(op_count as usize);
    let mut at = 12;
    for _ in 0..op_count {
        let kind = if body[at] == 0 {
            WalOpKind::Add
        } else {
            WalOpKind::Close
        };
        ops.push(WalOp {
            kind,
            graph: u64::from_be_bytes(body[at + 1..at + 9].try_into().unwrap()),
            subject: u64::from_be_bytes(body[at + 9..at + 17].try_into().unwrap()),
            predicate: u64::from_be_bytes(body[at + 17..at + 25].try_into().unwrap()),
            object: u64::from_be_bytes(body[at + 25..at + 33].try_into().unwrap()),
            valid_from: i64::from_be_bytes(body[at + 33..at + 41].try_into().unwrap()),
            valid_to: i64::from_be_bytes(body[at + 41..at + 49].try_into().unwrap()),
        });
        at += usize::try_from(OP_LEN).unwrap();
    }
    WalRecord { tx_id, ops }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(n: u64) -> WalOp {
        WalOp {
            kind: WalOpKind::Add,
            graph: 0,
            subject: n,
            predicate: n + 1,
            object: n + 2,
            valid_from: 100,
            valid_to: i64::MAX,
        }
    }

    #[test]
    fn append_and_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.log");
        {
            let mut wal = Wal::open(&path).unwrap();
            for tx in 1..=5 {
                wal.append(&WalRecord {
                    tx_id: tx,
                    ops: vec![op(tx * 10), op(tx * 10 + 1)],
                })
                .unwrap();
            }
            wal.sync().unwrap();
        }
        let mut wal = Wal::open(&path).unwrap();
        let mut seen = Vec::new();
        wal.replay(2, |record| {
            seen.push(record.clone());
            Ok(())
        })
        .unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].tx_id, 3);
        assert_eq!(seen[2].tx_id, 5);
        assert_eq!(seen[0].ops[0], op(30));
    }

    #[test]
    fn records_do_not_straddle_segments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.log");
        let mut wal = Wal::open(&path).unwrap();
        // Each record is 12 + 49*20 + 4 = 996 bytes; enough of them walk
        // past the first segment boundary.
        let ops: Vec<_> = (0..20).map(|i| op(i)).collect();
        for tx in 1..=200 {
            wal.append(&WalRecord {
                tx_id: tx,
                ops: ops.clone(),
            })
            .unwrap();
        }
        wal.sync().unwrap();
        drop(wal);
        let mut wal = Wal::open(&path).unwrap();
        let mut count = 0;
        wal.replay(0, |_| {
            count += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(count, 200);
    }

    #[test]
    fn torn_tail_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.log");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&WalRecord {
                tx_id: 1,
                ops: vec![op(1)],
            })
            .unwrap();
            wal.append(&WalRecord {
                tx_id: 2,
                ops: vec![op(2)],
            })
            .unwrap();
            wal.sync().unwrap();
        }
        // Tear the last record.
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        let len = file.metadata().unwrap().len();
        file.set_len(len - 10).unwrap();
        drop(file);
        let mut wal = Wal::open(&path).unwrap();
        let mut seen = Vec::new();
        wal.replay(0, |record| {
            seen.push(record.tx_id);
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![1]);
        // The torn bytes are gone; appending works again.
        wal.append(&WalRecord {
            tx_id: 2,
            ops: vec![op(2)],
        })
        .unwrap();
    }

    #[test]
    fn replay_twice_is_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.log");
        {
            let mut wal = Wal::open(&path).unwrap();
            for tx in 1..=3 {
                wal.append(&WalRecord {
                    tx_id: tx,
                    ops: vec![op(tx)],
                })
                .unwrap();
            }
            wal.sync().unwrap();
        }
        let collect = || {
            let mut wal = Wal::open(&path).unwrap();
            let mut seen = Vec::new();
            wal.replay(0, |r| {
                seen.push(r.clone());
                Ok(())
            })
            .unwrap();
            seen
        };
        assert_eq!(collect(), collect());
    }
}
