use sidb_transaction::{TimestampError, TransactionError};
use thiserror::Error;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),
    #[error("Timestamp error: {0}")]
    Timestamp(#[from] TimestampError),
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),
}

#[derive(Error, Debug)]
pub enum WalError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Checksum mismatch")]
    ChecksumMismatch,
    #[error("Incomplete record at offset {offset}")]
    TornRecord { offset: u64 },
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),
}

#[derive(Error, Debug)]
pub enum EncodingError {
    #[error("commit marker of {0} bytes is neither unresolved nor a timestamp")]
    MalformedCommitMarker(usize),
    #[error("compaction must emit one cell per input, got {output} for {input}")]
    BatchSizeMismatch { input: usize, output: usize },
}
