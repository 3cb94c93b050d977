use thiserror::Error;

use crate::timestamp::Timestamp;
use crate::transaction::TxnStatus;

pub type TimestampResult<T> = Result<T, TimestampError>;
pub type TransactionResult<T> = Result<T, TransactionError>;

#[derive(Error, Debug)]
pub enum TimestampError {
    #[error("timestamp authority unavailable: {0}")]
    Unavailable(String),

    #[error("timestamp overflow, reached {0}")]
    Overflow(u64),

    #[error("failed to persist timestamp watermark: {0}")]
    WatermarkWrite(String),

    #[error("failed to read timestamp watermark: {0}")]
    WatermarkRead(String),

    #[error("timestamp watermark is corrupt: {0}")]
    CorruptWatermark(String),
}

#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("transaction {0:?} not found")]
    NotFound(Timestamp),

    #[error("transaction {id:?} cannot move from {from:?} to {to:?}")]
    InvalidStateTransition {
        id: Timestamp,
        from: TxnStatus,
        to: TxnStatus,
    },

    #[error("transaction {id:?} already committed at {existing:?}, refusing {attempted:?}")]
    CommitTimestampConflict {
        id: Timestamp,
        existing: Timestamp,
        attempted: Timestamp,
    },

    #[error("commit timestamp {commit_ts:?} does not follow begin timestamp of {id:?}")]
    CommitBeforeBegin { id: Timestamp, commit_ts: Timestamp },

    #[error("invalid ancestor chain for {id:?}: {reason}")]
    InvalidChain { id: Timestamp, reason: String },

    #[error("transaction {id:?} is {status:?}, not active")]
    NotActive { id: Timestamp, status: TxnStatus },

    #[error("parent transaction {parent:?} is {status:?}")]
    ParentNotActive { parent: Timestamp, status: TxnStatus },

    #[error("transaction {0:?} already exists")]
    AlreadyExists(Timestamp),

    #[error("timestamp error: {0}")]
    Timestamp(#[from] TimestampError),
}

/// Errors raised while reconstructing a transaction context received from another process.
#[derive(Error, Debug)]
pub enum ContextError {
    #[error("failed to encode transaction context: {0}")]
    Encode(String),

    #[error("malformed transaction context: {0}")]
    Deserialization(String),
}
