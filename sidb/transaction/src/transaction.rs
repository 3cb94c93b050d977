//! Transaction identity and lifecycle state
//!
//! A transaction is identified by its begin timestamp. Its record moves exactly once from
//! `Active` to one of the absorbing terminal states.

use serde::{Deserialize, Serialize};

use crate::error::{TransactionError, TransactionResult};
use crate::timestamp::Timestamp;

/// Isolation level for transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum IsolationLevel {
    /// Reads see everything committed at or before the snapshot timestamp.
    #[default]
    Snapshot,
    /// Reads see everything committed, regardless of when.
    ReadCommitted,
    /// Reads also see writes of transactions that are still active.
    ReadUncommitted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxnStatus {
    Active,
    Committed,
    RolledBack,
    /// Failed with an ambiguous outcome. Never visible, reported apart from rollback.
    Error,
}

impl TxnStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TxnStatus::Active)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, TxnStatus::RolledBack | TxnStatus::Error)
    }
}

/// Status of a transaction as seen from outside its own family of nested transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectiveStatus {
    Active,
    /// Committed all the way to the top level, at the outermost commit timestamp.
    Committed(Timestamp),
    /// The transaction or one of its ancestors rolled back or failed.
    Failed(TxnStatus),
}

impl EffectiveStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, EffectiveStatus::Active)
    }
}

/// The durable record of one transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    id: Timestamp,
    /// Enclosing transactions, nearest parent first.
    ancestors: Vec<Timestamp>,
    isolation_level: IsolationLevel,
    status: TxnStatus,
    commit_ts: Option<Timestamp>,
    global_commit_ts: Option<Timestamp>,
}

impl TransactionRecord {
    /// Create the record of a transaction that just began.
    pub fn begin(
        id: Timestamp,
        ancestors: Vec<Timestamp>,
        isolation_level: IsolationLevel,
    ) -> TransactionResult<Self> {
        validate_chain(id, &ancestors)?;
        Ok(Self {
            id,
            ancestors,
            isolation_level,
            status: TxnStatus::Active,
            commit_ts: None,
            global_commit_ts: None,
        })
    }

    pub fn id(&self) -> Timestamp {
        self.id
    }

    pub fn parent_id(&self) -> Option<Timestamp> {
        self.ancestors.first().copied()
    }

    pub fn ancestors(&self) -> &[Timestamp] {
        &self.ancestors
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn status(&self) -> TxnStatus {
        self.status
    }

    /// Set once the record is terminal. Only meaningful for visibility when `Committed`.
    pub fn commit_ts(&self) -> Option<Timestamp> {
        self.commit_ts
    }

    pub fn global_commit_ts(&self) -> Option<Timestamp> {
        self.global_commit_ts
    }

    pub fn is_top_level(&self) -> bool {
        self.ancestors.is_empty()
    }

    /// Reader context for this transaction.
    pub fn handle(&self) -> TxnHandle {
        TxnHandle {
            id: self.id,
            ancestors: self.ancestors.clone(),
            isolation_level: self.isolation_level,
        }
    }

    /// Move to `Committed` at `commit_ts`.
    ///
    /// Committing again at the same timestamp is a no-op. Any other second commit timestamp
    /// is refused.
    pub fn commit(&mut self, commit_ts: Timestamp) -> TransactionResult<Timestamp> {
        match (self.status, self.commit_ts) {
            (TxnStatus::Active, None) => {
                if commit_ts <= self.id {
                    return Err(TransactionError::CommitBeforeBegin {
                        id: self.id,
                        commit_ts,
                    });
                }
                self.status = TxnStatus::Committed;
                self.commit_ts = Some(commit_ts);
                if self.is_top_level() {
                    self.global_commit_ts = Some(commit_ts);
                }
                Ok(commit_ts)
            }
            (TxnStatus::Committed, Some(existing)) if existing == commit_ts => Ok(existing),
            (TxnStatus::Active | TxnStatus::Committed, Some(existing)) => {
                Err(TransactionError::CommitTimestampConflict {
                    id: self.id,
                    existing,
                    attempted: commit_ts,
                })
            }
            (from, _) => Err(TransactionError::InvalidStateTransition {
                id: self.id,
                from,
                to: TxnStatus::Committed,
            }),
        }
    }

    /// Move to `RolledBack`. Rolling back twice is a no-op.
    pub fn rollback(&mut self) -> TransactionResult<()> {
        self.fail(TxnStatus::RolledBack)
    }

    /// Move to `Error`. Marking twice is a no-op.
    pub fn mark_error(&mut self) -> TransactionResult<()> {
        self.fail(TxnStatus::Error)
    }

    fn fail(&mut self, to: TxnStatus) -> TransactionResult<()> {
        match self.status {
            TxnStatus::Active => {
                // No timestamp is drawn for a failed transaction; its own id closes the record.
                self.status = to;
                self.commit_ts = Some(self.id);
                Ok(())
            }
            from if from == to => Ok(()),
            from => Err(TransactionError::InvalidStateTransition {
                id: self.id,
                from,
                to,
            }),
        }
    }
}

/// What a reader needs to know about the transaction it runs in.
///
/// This is what crosses process boundaries; see [`crate::operation::OperationFactory`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TxnHandle {
    id: Timestamp,
    ancestors: Vec<Timestamp>,
    isolation_level: IsolationLevel,
}

impl TxnHandle {
    pub fn new(
        id: Timestamp,
        ancestors: Vec<Timestamp>,
        isolation_level: IsolationLevel,
    ) -> TransactionResult<Self> {
        validate_chain(id, &ancestors)?;
        Ok(Self {
            id,
            ancestors,
            isolation_level,
        })
    }

    pub fn id(&self) -> Timestamp {
        self.id
    }

    /// Nested transactions read at their own begin timestamp.
    pub fn snapshot_ts(&self) -> Timestamp {
        self.id
    }

    pub fn parent_id(&self) -> Option<Timestamp> {
        self.ancestors.first().copied()
    }

    pub fn ancestors(&self) -> &[Timestamp] {
        &self.ancestors
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    /// True for the transaction itself and every enclosing transaction.
    pub fn is_in_family(&self, ts: Timestamp) -> bool {
        self.id == ts || self.ancestors.contains(&ts)
    }

    pub fn is_ancestor(&self, ts: Timestamp) -> bool {
        self.ancestors.contains(&ts)
    }
}

/// A chain is valid when it is strictly decreasing below `id`: parents always begin before
/// their children, which also rules out cycles.
fn validate_chain(id: Timestamp, ancestors: &[Timestamp]) -> TransactionResult<()> {
    if id == Timestamp::ZERO {
        return Err(TransactionError::InvalidChain {
            id,
            reason: "zero is not a transaction id".to_string(),
        });
    }
    let mut below = id;
    for ancestor in ancestors {
        if *ancestor >= below || *ancestor == Timestamp::ZERO {
            return Err(TransactionError::InvalidChain {
                id,
                reason: format!("ancestor {ancestor:?} does not precede {below:?}"),
            });
        }
        below = *ancestor;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(raw: u64) -> Timestamp {
        Timestamp::with_ts(raw)
    }

    #[test]
    fn test_commit_assigns_timestamp_once() {
        let mut record = TransactionRecord::begin(ts(10), vec![], IsolationLevel::Snapshot).unwrap();
        assert_eq!(record.commit_ts(), None);

        assert_eq!(record.commit(ts(15)).unwrap(), ts(15));
        assert_eq!(record.status(), TxnStatus::Committed);
        assert_eq!(record.commit_ts(), Some(ts(15)));
        assert_eq!(record.global_commit_ts(), Some(ts(15)));

        // Retrying with the same timestamp is harmless.
        assert_eq!(record.commit(ts(15)).unwrap(), ts(15));
        assert!(matches!(
            record.commit(ts(16)),
            Err(TransactionError::CommitTimestampConflict { .. })
        ));
        assert!(matches!(
            record.rollback(),
            Err(TransactionError::InvalidStateTransition { .. })
        ));
    }

    #[test]
    fn test_commit_must_follow_begin() {
        let mut record = TransactionRecord::begin(ts(10), vec![], IsolationLevel::Snapshot).unwrap();
        assert!(matches!(
            record.commit(ts(10)),
            Err(TransactionError::CommitBeforeBegin { .. })
        ));
        assert_eq!(record.status(), TxnStatus::Active);
    }

    #[test]
    fn test_failed_states_are_absorbing() {
        let mut rolled_back =
            TransactionRecord::begin(ts(3), vec![], IsolationLevel::Snapshot).unwrap();
        rolled_back.rollback().unwrap();
        rolled_back.rollback().unwrap();
        assert_eq!(rolled_back.status(), TxnStatus::RolledBack);
        assert!(rolled_back.commit_ts().is_some());
        assert!(rolled_back.commit(ts(9)).is_err());
        assert!(rolled_back.mark_error().is_err());

        let mut errored = TransactionRecord::begin(ts(4), vec![], IsolationLevel::Snapshot).unwrap();
        errored.mark_error().unwrap();
        assert_eq!(errored.status(), TxnStatus::Error);
        assert!(errored.status().is_failed());
        assert!(errored.commit(ts(9)).is_err());
        assert!(errored.rollback().is_err());
    }

    #[test]
    fn test_commit_ts_present_iff_terminal() {
        let mut records: Vec<_> = (1..=4)
            .map(|i| TransactionRecord::begin(ts(i), vec![], IsolationLevel::Snapshot).unwrap())
            .collect();
        records[1].commit(ts(10)).unwrap();
        records[2].rollback().unwrap();
        records[3].mark_error().unwrap();
        for record in &records {
            assert_eq!(record.commit_ts().is_some(), record.status().is_terminal());
        }
    }

    #[test]
    fn test_nested_commit_has_no_global_timestamp() {
        let mut child =
            TransactionRecord::begin(ts(12), vec![ts(10)], IsolationLevel::Snapshot).unwrap();
        assert_eq!(child.parent_id(), Some(ts(10)));
        child.commit(ts(13)).unwrap();
        assert_eq!(child.global_commit_ts(), None);
    }

    #[test]
    fn test_chain_must_strictly_decrease() {
        assert!(TxnHandle::new(ts(12), vec![ts(10), ts(4)], IsolationLevel::Snapshot).is_ok());
        assert!(TxnHandle::new(ts(12), vec![ts(12)], IsolationLevel::Snapshot).is_err());
        assert!(TxnHandle::new(ts(12), vec![ts(4), ts(10)], IsolationLevel::Snapshot).is_err());
        assert!(TxnHandle::new(ts(12), vec![ts(10), ts(10)], IsolationLevel::Snapshot).is_err());
        assert!(TxnHandle::new(ts(0), vec![], IsolationLevel::Snapshot).is_err());
    }

    #[test]
    fn test_handle_family() {
        let handle =
            TxnHandle::new(ts(20), vec![ts(15), ts(11)], IsolationLevel::Snapshot).unwrap();
        assert!(handle.is_in_family(ts(20)));
        assert!(handle.is_in_family(ts(11)));
        assert!(!handle.is_ancestor(ts(20)));
        assert!(handle.is_ancestor(ts(15)));
        assert!(!handle.is_in_family(ts(14)));
        assert_eq!(handle.snapshot_ts(), ts(20));
    }
}
