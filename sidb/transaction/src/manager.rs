//! Transaction manager trait
//!
//! This module defines the lifecycle interface exposed to the execution layer: open a
//! transaction, finish it, and report the oldest snapshot still in use.

use crate::{IsolationLevel, Timestamp, TxnHandle};

/// Trait for transaction managers supporting snapshot isolation.
///
/// Note: implementations draw every id and commit timestamp from an injected
/// [`crate::TimestampSource`]; there is no global generator.
pub trait TxnLifecycleManager {
    /// The error type for operations
    type Error;

    /// Begin a new transaction, nested under `parent` if given.
    /// The returned handle is the reader context of the transaction.
    fn begin_transaction(
        &self,
        isolation_level: IsolationLevel,
        parent: Option<&TxnHandle>,
    ) -> Result<TxnHandle, Self::Error>;

    /// Commit the transaction, returning the commit timestamp on success.
    /// Retrying a commit that already succeeded returns the same timestamp.
    fn commit(&self, txn: &TxnHandle) -> Result<Timestamp, Self::Error>;

    /// Roll back an active transaction.
    fn rollback(&self, txn: &TxnHandle) -> Result<(), Self::Error>;

    /// The minimum begin timestamp of the active transactions, if any.
    fn low_watermark(&self) -> Option<Timestamp>;
}
