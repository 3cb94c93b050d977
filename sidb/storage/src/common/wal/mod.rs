//! Write-ahead logging for state that must survive a restart.
//!
//! Only transaction transitions are logged; cells belong to the external store.

pub mod txn_wal;

use std::path::Path;

pub use txn_wal::{TxnLog, TxnLogConfig, TxnLogEntry, TxnLogIter, TxnLogOp};

use crate::error::StorageResult;

/// A log entry with its own binary encoding and a position in the log.
pub trait LogRecord: Clone + std::fmt::Debug {
    /// Log sequence number. Replay applies records in ascending order of it.
    fn lsn(&self) -> u64;

    fn to_bytes(&self) -> StorageResult<Vec<u8>>;

    fn from_bytes(bytes: Vec<u8>) -> StorageResult<Self>
    where
        Self: Sized;
}

/// An append-only log. A record is durable once `flush` returns.
pub trait StorageWal {
    type Record: LogRecord;

    type LogIterator: Iterator<Item = StorageResult<Self::Record>>;

    /// Open the log at `path`, creating it when missing.
    fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self>
    where
        Self: Sized;

    /// Buffer one record at the end of the log.
    fn append(&mut self, record: &Self::Record) -> StorageResult<()>;

    fn flush(&mut self) -> StorageResult<()>;

    /// Records in file order, from the start of the log.
    fn iter(&self) -> StorageResult<Self::LogIterator>;

    /// Every record in replay order. Fails on the first unreadable record.
    fn read_all(&self) -> StorageResult<Vec<Self::Record>> {
        let mut records = self.iter()?.collect::<StorageResult<Vec<_>>>()?;
        records.sort_by_key(|record| record.lsn());
        Ok(records)
    }
}
