// txn_wal.rs
// Append-only log of transaction lifecycle transitions.
//
// Log record layout (little-endian):
// ┌────────────┬────────────┬───────────┐
// │ u32 len    │ u32 crc32  │ payload…  │
// └────────────┴────────────┴───────────┘
// - `len`    : number of bytes in payload
// - `crc32`  : checksum of payload for corruption detection
//
// The payload is a postcard-encoded `TxnLogEntry`. Replaying the log in LSN order rebuilds
// every transaction record: a `Begin` creates it, a terminal op closes it.
//
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use sidb_transaction::{IsolationLevel, Timestamp};
use tracing::warn;

use super::{LogRecord, StorageWal};
use crate::error::{StorageError, StorageResult, WalError};

const HEADER_SIZE: usize = 8; // 4 bytes length + 4 bytes crc32

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnLogEntry {
    pub lsn: u64,            // Log sequence number
    pub txn_id: Timestamp,   // Transaction ID
    pub op: TxnLogOp,        // Transition
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnLogOp {
    Begin {
        ancestors: Vec<Timestamp>,
        isolation_level: IsolationLevel,
    },
    Commit(Timestamp), // commit timestamp
    Rollback,
    Error,
}

impl LogRecord for TxnLogEntry {
    fn lsn(&self) -> u64 {
        self.lsn
    }

    fn to_bytes(&self) -> StorageResult<Vec<u8>> {
        postcard::to_allocvec(self)
            .map_err(|e| StorageError::Wal(WalError::SerializationFailed(e.to_string())))
    }

    fn from_bytes(bytes: Vec<u8>) -> StorageResult<Self> {
        postcard::from_bytes(&bytes)
            .map_err(|e| StorageError::Wal(WalError::DeserializationFailed(e.to_string())))
    }
}

#[derive(Debug, Clone)]
pub struct TxnLogConfig {
    pub path: PathBuf,
}

impl TxnLogConfig {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

/// Write-ahead log of transaction records.
pub struct TxnLog {
    file: BufWriter<File>,
    path: PathBuf,
    next_lsn: u64,
}

impl StorageWal for TxnLog {
    type LogIterator = TxnLogIter;
    type Record = TxnLogEntry;

    /// Open existing log or create a new one at `path`.
    fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Wal(WalError::Io(e)))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .read(true)
            .open(&path)
            .map_err(|e| StorageError::Wal(WalError::Io(e)))?;

        file.seek(SeekFrom::End(0))
            .map_err(|e| StorageError::Wal(WalError::Io(e)))?;

        let mut log = Self {
            file: BufWriter::new(file),
            path: path.as_ref().to_path_buf(),
            next_lsn: 0,
        };
        // A crash in the middle of an append leaves an incomplete record at the tail. It was
        // never acknowledged, so it is cut off before anything is appended behind it.
        let mut next_lsn = 0;
        for record in log.iter()? {
            match record {
                Ok(entry) => next_lsn = next_lsn.max(entry.lsn + 1),
                Err(StorageError::Wal(WalError::TornRecord { offset })) => {
                    warn!(path = %log.path.display(), offset, "truncating incomplete log tail");
                    log.file
                        .get_ref()
                        .set_len(offset)
                        .map_err(|e| StorageError::Wal(WalError::Io(e)))?;
                }
                Err(e) => return Err(e),
            }
        }
        log.next_lsn = next_lsn;
        // The replay reader shares the file cursor with the writer.
        log.file
            .seek(SeekFrom::End(0))
            .map_err(|e| StorageError::Wal(WalError::Io(e)))?;
        Ok(log)
    }

    /// Append a record and buffer it. Call `flush` to fsync.
    ///
    /// The header and payload are written in one call. If the write fails, the file is
    /// truncated back to its previous length so no partial record is left behind.
    fn append(&mut self, record: &Self::Record) -> StorageResult<()> {
        let payload = record.to_bytes()?;
        let mut hasher = Hasher::new();
        hasher.update(&payload);
        let checksum = hasher.finalize();
        let len = payload.len() as u32;

        let original_pos = self
            .file
            .stream_position()
            .map_err(|e| StorageError::Wal(WalError::Io(e)))?;

        let mut data = Vec::with_capacity(HEADER_SIZE + payload.len());
        data.extend_from_slice(&len.to_le_bytes());
        data.extend_from_slice(&checksum.to_le_bytes());
        data.extend_from_slice(&payload);

        match self.file.write_all(&data) {
            Ok(_) => {
                self.next_lsn = self.next_lsn.max(record.lsn + 1);
                Ok(())
            }
            Err(e) => {
                self.file
                    .seek(SeekFrom::Start(original_pos))
                    .map_err(|e| StorageError::Wal(WalError::Io(e)))?;
                self.file
                    .get_ref()
                    .set_len(original_pos)
                    .map_err(|e| StorageError::Wal(WalError::Io(e)))?;
                Err(StorageError::Wal(WalError::Io(e)))
            }
        }
    }

    /// Flush internal buffer and fsync to guarantee durability.
    fn flush(&mut self) -> StorageResult<()> {
        self.file
            .flush()
            .map_err(|e| StorageError::Wal(WalError::Io(e)))?;
        self.file
            .get_ref()
            .sync_data()
            .map_err(|e| StorageError::Wal(WalError::Io(e)))
    }

    /// Iterate over the records in file order, verifying each checksum.
    ///
    /// Iteration ends at a clean EOF. A checksum mismatch is yielded and skipped; an I/O
    /// error (including a torn record at the tail) is yielded and ends the iteration.
    fn iter(&self) -> StorageResult<Self::LogIterator> {
        let mut reader = self
            .file
            .get_ref()
            .try_clone()
            .map_err(|e| StorageError::Wal(WalError::Io(e)))?;
        reader
            .seek(SeekFrom::Start(0))
            .map_err(|e| StorageError::Wal(WalError::Io(e)))?;
        Ok(TxnLogIter {
            reader: BufReader::new(reader),
            offset: 0,
            done: false,
        })
    }
}

impl TxnLog {
    /// Append `op` for `txn_id` under the next LSN and make it durable.
    pub fn log(&mut self, txn_id: Timestamp, op: TxnLogOp) -> StorageResult<u64> {
        let lsn = self.next_lsn;
        self.append(&TxnLogEntry { lsn, txn_id, op })?;
        self.flush()?;
        Ok(lsn)
    }

    pub fn next_lsn(&self) -> u64 {
        self.next_lsn
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub struct TxnLogIter {
    reader: BufReader<File>,
    /// End of the last complete record.
    offset: u64,
    done: bool,
}

impl TxnLogIter {
    fn read_record(&mut self) -> Option<StorageResult<TxnLogEntry>> {
        let mut header = [0u8; HEADER_SIZE];
        match read_full(&mut self.reader, &mut header) {
            // Normal EOF, stop iteration
            Ok(0) => {
                self.done = true;
                return None;
            }
            Ok(n) if n < HEADER_SIZE => return Some(Err(self.torn())),
            Ok(_) => {}
            Err(e) => {
                self.done = true;
                return Some(Err(StorageError::Wal(WalError::Io(e))));
            }
        }

        let (len, checksum) = header.split_at(4);
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(len);
        let mut checksum_bytes = [0u8; 4];
        checksum_bytes.copy_from_slice(checksum);
        let len = u32::from_le_bytes(len_bytes) as usize;
        let checksum = u32::from_le_bytes(checksum_bytes);

        let mut payload = vec![0u8; len];
        match read_full(&mut self.reader, &mut payload) {
            Ok(n) if n < len => return Some(Err(self.torn())),
            Ok(_) => {}
            Err(e) => {
                self.done = true;
                return Some(Err(StorageError::Wal(WalError::Io(e))));
            }
        }
        self.offset += (HEADER_SIZE + len) as u64;

        let mut hasher = Hasher::new();
        hasher.update(&payload);
        if hasher.finalize() != checksum {
            return Some(Err(StorageError::Wal(WalError::ChecksumMismatch)));
        }

        Some(TxnLogEntry::from_bytes(payload))
    }

    fn torn(&mut self) -> StorageError {
        self.done = true;
        StorageError::Wal(WalError::TornRecord {
            offset: self.offset,
        })
    }
}

/// Fill `buf` unless EOF comes first, returning how many bytes were read.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

impl Iterator for TxnLogIter {
    type Item = StorageResult<TxnLogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        self.read_record()
    }
}
