//! Byte-level conventions for SI metadata stored next to user data.
//!
//! Every write by transaction `T` to row `R` produces, at writer timestamp `T`:
//! - the user cells in the data family, and
//! - exactly one commit-timestamp marker `(R, S, t)`, initially empty (unresolved).
//!
//! A delete writes a tombstone `(R, S, d)` instead of user cells. Nothing here knows where
//! transaction records live.

use bytes::Bytes;
use sidb_transaction::{
    EffectiveStatus, Timestamp, TransactionError, TransactionRecord, TxnStatus,
};

use super::cell::{Cell, CellKind};
use crate::error::{EncodingError, StorageResult};

pub const DATA_FAMILY: &[u8] = b"V";
pub const SI_FAMILY: &[u8] = b"S";
pub const COMMIT_TIMESTAMP_QUALIFIER: &[u8] = b"t";
pub const TOMBSTONE_QUALIFIER: &[u8] = b"d";

/// Unresolved commit marker: consult the transaction store.
pub const SI_NULL: &[u8] = b"";
/// Resolved marker of a writer that rolled back or failed (`-1` as a big-endian i64).
pub const SI_FAIL: &[u8] = &[0xFF; 8];
pub const ANTI_TOMBSTONE_VALUE: &[u8] = b"0";

/// Decoded commit-timestamp marker value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMarker {
    Unresolved,
    Committed(Timestamp),
    Failed,
}

impl CommitMarker {
    pub fn is_resolved(&self) -> bool {
        !matches!(self, CommitMarker::Unresolved)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DataStore;

impl DataStore {
    pub fn new() -> Self {
        Self
    }

    pub fn classify(&self, family: &[u8], qualifier: &[u8]) -> CellKind {
        if family != SI_FAMILY {
            return CellKind::UserData;
        }
        match qualifier {
            COMMIT_TIMESTAMP_QUALIFIER => CellKind::CommitTimestamp,
            TOMBSTONE_QUALIFIER => CellKind::Tombstone,
            _ => CellKind::Other,
        }
    }

    /// Like [`Self::classify`], but tells tombstones and anti-tombstones apart by their value.
    /// A deletion cell holding neither value is [`CellKind::Other`].
    pub fn kind_of(&self, cell: &Cell) -> CellKind {
        match self.classify(cell.family(), cell.qualifier()) {
            CellKind::Tombstone if self.is_anti_tombstone_value(cell.value()) => {
                CellKind::AntiTombstone
            }
            CellKind::Tombstone if !self.is_tombstone_value(cell.value()) => CellKind::Other,
            kind => kind,
        }
    }

    pub fn is_unresolved_commit_marker(&self, value: &[u8]) -> bool {
        value == SI_NULL
    }

    pub fn is_tombstone_value(&self, value: &[u8]) -> bool {
        value.is_empty()
    }

    pub fn is_anti_tombstone_value(&self, value: &[u8]) -> bool {
        value == ANTI_TOMBSTONE_VALUE
    }

    pub fn decode_commit_marker(&self, value: &[u8]) -> StorageResult<CommitMarker> {
        if self.is_unresolved_commit_marker(value) {
            return Ok(CommitMarker::Unresolved);
        }
        if value == SI_FAIL {
            return Ok(CommitMarker::Failed);
        }
        let raw: [u8; 8] = value
            .try_into()
            .map_err(|_| EncodingError::MalformedCommitMarker(value.len()))?;
        Ok(CommitMarker::Committed(Timestamp::from_be_bytes(raw)))
    }

    /// Final marker value for the writer `txn`, given its effective status.
    ///
    /// A committed writer is encoded with the commit timestamp of its outermost ancestor,
    /// which is what `effective` carries. A writer that is still effectively active has no
    /// final value yet.
    pub fn encode_resolved_commit(
        &self,
        txn: &TransactionRecord,
        effective: EffectiveStatus,
    ) -> StorageResult<Bytes> {
        if txn.status().is_failed() {
            return Ok(Bytes::from_static(SI_FAIL));
        }
        match effective {
            EffectiveStatus::Committed(commit_ts) if txn.status() == TxnStatus::Committed => {
                Ok(Bytes::copy_from_slice(&commit_ts.to_be_bytes()))
            }
            EffectiveStatus::Failed(_) => Ok(Bytes::from_static(SI_FAIL)),
            EffectiveStatus::Committed(_) | EffectiveStatus::Active => {
                Err(TransactionError::InvalidStateTransition {
                    id: txn.id(),
                    from: TxnStatus::Active,
                    to: TxnStatus::Committed,
                }
                .into())
            }
        }
    }

    pub fn data_cell(
        &self,
        row: impl Into<Bytes>,
        qualifier: impl Into<Bytes>,
        writer: Timestamp,
        value: impl Into<Bytes>,
    ) -> Cell {
        Cell::new(row, Bytes::from_static(DATA_FAMILY), qualifier, writer, value)
    }

    pub fn unresolved_marker(&self, row: impl Into<Bytes>, writer: Timestamp) -> Cell {
        Cell::new(
            row,
            Bytes::from_static(SI_FAMILY),
            Bytes::from_static(COMMIT_TIMESTAMP_QUALIFIER),
            writer,
            Bytes::from_static(SI_NULL),
        )
    }

    pub fn tombstone(&self, row: impl Into<Bytes>, writer: Timestamp) -> Cell {
        Cell::new(
            row,
            Bytes::from_static(SI_FAMILY),
            Bytes::from_static(TOMBSTONE_QUALIFIER),
            writer,
            Bytes::new(),
        )
    }

    pub fn anti_tombstone(&self, row: impl Into<Bytes>, writer: Timestamp) -> Cell {
        Cell::new(
            row,
            Bytes::from_static(SI_FAMILY),
            Bytes::from_static(TOMBSTONE_QUALIFIER),
            writer,
            Bytes::from_static(ANTI_TOMBSTONE_VALUE),
        )
    }
}

#[cfg(test)]
mod tests {
    use sidb_transaction::IsolationLevel;

    use super::*;

    fn ts(raw: u64) -> Timestamp {
        Timestamp::with_ts(raw)
    }

    #[test]
    fn test_classify() {
        let ds = DataStore::new();
        assert_eq!(ds.classify(b"V", b"name"), CellKind::UserData);
        assert_eq!(ds.classify(b"S", b"t"), CellKind::CommitTimestamp);
        assert_eq!(ds.classify(b"S", b"d"), CellKind::Tombstone);
        assert_eq!(ds.classify(b"S", b"zz"), CellKind::Other);

        assert_eq!(ds.kind_of(&ds.tombstone("r", ts(3))), CellKind::Tombstone);
        assert_eq!(
            ds.kind_of(&ds.anti_tombstone("r", ts(3))),
            CellKind::AntiTombstone
        );
        assert_eq!(
            ds.kind_of(&ds.unresolved_marker("r", ts(3))),
            CellKind::CommitTimestamp
        );
        assert!(ds.is_tombstone_value(ds.tombstone("r", ts(3)).value()));
        assert!(!ds.is_tombstone_value(ds.anti_tombstone("r", ts(3)).value()));
        let unknown = Cell::new("r", SI_FAMILY, TOMBSTONE_QUALIFIER, ts(3), "junk");
        assert_eq!(ds.kind_of(&unknown), CellKind::Other);
    }

    #[test]
    fn test_encode_resolved_commit() {
        let ds = DataStore::new();
        let mut committed =
            TransactionRecord::begin(ts(10), vec![], IsolationLevel::Snapshot).unwrap();
        committed.commit(ts(15)).unwrap();
        let value = ds
            .encode_resolved_commit(&committed, EffectiveStatus::Committed(ts(15)))
            .unwrap();
        assert_eq!(value.as_ref(), &15u64.to_be_bytes());
        assert_eq!(
            ds.decode_commit_marker(&value).unwrap(),
            CommitMarker::Committed(ts(15))
        );

        let mut rolled_back =
            TransactionRecord::begin(ts(11), vec![], IsolationLevel::Snapshot).unwrap();
        rolled_back.rollback().unwrap();
        let failed = EffectiveStatus::Failed(TxnStatus::RolledBack);
        assert_eq!(
            ds.encode_resolved_commit(&rolled_back, failed)
                .unwrap()
                .as_ref(),
            SI_FAIL
        );

        let mut errored =
            TransactionRecord::begin(ts(12), vec![], IsolationLevel::Snapshot).unwrap();
        errored.mark_error().unwrap();
        let value = ds
            .encode_resolved_commit(&errored, EffectiveStatus::Failed(TxnStatus::Error))
            .unwrap();
        assert_eq!(ds.decode_commit_marker(&value).unwrap(), CommitMarker::Failed);

        let active = TransactionRecord::begin(ts(13), vec![], IsolationLevel::Snapshot).unwrap();
        assert!(
            ds.encode_resolved_commit(&active, EffectiveStatus::Active)
                .is_err()
        );
    }

    #[test]
    fn test_encode_resolved_commit_of_nested_writer() {
        let ds = DataStore::new();
        let mut child =
            TransactionRecord::begin(ts(11), vec![ts(10)], IsolationLevel::Snapshot).unwrap();
        child.commit(ts(12)).unwrap();

        // The parent is still running: the child's own commit is not final.
        assert!(
            ds.encode_resolved_commit(&child, EffectiveStatus::Active)
                .is_err()
        );
        // Committed through the parent at 20, never at the child's local 12.
        let value = ds
            .encode_resolved_commit(&child, EffectiveStatus::Committed(ts(20)))
            .unwrap();
        assert_eq!(
            ds.decode_commit_marker(&value).unwrap(),
            CommitMarker::Committed(ts(20))
        );
        // The parent rolled back.
        let value = ds
            .encode_resolved_commit(&child, EffectiveStatus::Failed(TxnStatus::RolledBack))
            .unwrap();
        assert_eq!(value.as_ref(), SI_FAIL);
    }

    #[test]
    fn test_decode_commit_marker() {
        let ds = DataStore::new();
        assert_eq!(
            ds.decode_commit_marker(SI_NULL).unwrap(),
            CommitMarker::Unresolved
        );
        assert!(ds.is_unresolved_commit_marker(ds.unresolved_marker("r", ts(1)).value()));
        assert!(ds.decode_commit_marker(b"abc").is_err());
    }
}
