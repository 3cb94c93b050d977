use miette::Diagnostic;
use sidb_storage::error::StorageError;
use sidb_transaction::{ContextError, TimestampError, TransactionError};
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum Error {
    #[error("storage failure")]
    #[diagnostic(code(sidb::storage))]
    Storage(#[from] StorageError),

    #[error("timestamp authority failure")]
    #[diagnostic(
        code(sidb::timestamp),
        help("the operation did not take effect and may be retried")
    )]
    Timestamp(#[from] TimestampError),

    #[error("transaction failure")]
    #[diagnostic(code(sidb::transaction))]
    Transaction(#[from] TransactionError),

    #[error("invalid transaction context")]
    #[diagnostic(code(sidb::context))]
    Context(#[from] ContextError),

    #[error("failed to prepare the database directory")]
    #[diagnostic(code(sidb::io))]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
