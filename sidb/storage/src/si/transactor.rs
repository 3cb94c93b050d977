use std::sync::Arc;

use bytes::Bytes;
use sidb_transaction::{
    IsolationLevel, Timestamp, TimestampSource, TransactionError, TxnHandle, TxnLifecycleManager,
    TxnStatus,
};
use tracing::warn;

use super::compaction::{CompactionRewriter, CompactionStats};
use super::read::{ReadScope, VisibilityResolver};
use super::txn_store::TransactionStore;
use crate::common::cell::{Cell, CellKind};
use crate::common::data_store::DataStore;
use crate::error::{StorageError, StorageResult};
use crate::storage::VersionedStore;

/// Opens and finishes transactions and tags their writes with SI metadata.
///
/// Every id and commit timestamp comes from the injected [`TimestampSource`]. No lock is
/// held while waiting on it.
pub struct Transactor {
    source: Arc<dyn TimestampSource>,
    txn_store: Arc<TransactionStore>,
    cells: Arc<dyn VersionedStore>,
    data_store: DataStore,
    resolver: VisibilityResolver,
}

impl Transactor {
    pub fn new(
        source: Arc<dyn TimestampSource>,
        txn_store: Arc<TransactionStore>,
        cells: Arc<dyn VersionedStore>,
    ) -> Self {
        let data_store = DataStore::new();
        Self {
            source,
            resolver: VisibilityResolver::new(txn_store.clone(), data_store),
            txn_store,
            cells,
            data_store,
        }
    }

    pub fn txn_store(&self) -> &Arc<TransactionStore> {
        &self.txn_store
    }

    /// Write `columns` of `row` at the transaction's writer timestamp.
    ///
    /// A write into a row another transaction deleted, as far as this one can see, also
    /// records an anti-tombstone. The transaction's own tombstone is left in place.
    pub fn write(
        &self,
        txn: &TxnHandle,
        row: impl Into<Bytes>,
        columns: impl IntoIterator<Item = (Bytes, Bytes)>,
    ) -> StorageResult<()> {
        self.ensure_active(txn)?;
        let row = row.into();
        let raw = self.cells.row(&row)?;
        if !self.deleted_by(txn, &raw) && self.sees_tombstone(txn, &raw)? {
            self.cells
                .put(self.data_store.anti_tombstone(row.clone(), txn.id()))?;
        }
        for (qualifier, value) in columns {
            self.cells
                .put(self.data_store.data_cell(row.clone(), qualifier, txn.id(), value))?;
        }
        self.cells
            .put(self.data_store.unresolved_marker(row, txn.id()))
    }

    /// Delete `row` as of the transaction's writer timestamp.
    ///
    /// A tombstone only hides older versions, so columns the transaction itself wrote
    /// earlier are dropped here.
    pub fn delete(&self, txn: &TxnHandle, row: impl Into<Bytes>) -> StorageResult<()> {
        self.ensure_active(txn)?;
        let row = row.into();
        for cell in self.cells.row(&row)? {
            if cell.timestamp() == txn.id()
                && self.data_store.kind_of(&cell) == CellKind::UserData
            {
                self.cells.remove(&cell)?;
            }
        }
        self.cells
            .put(self.data_store.tombstone(row.clone(), txn.id()))?;
        self.cells
            .put(self.data_store.unresolved_marker(row, txn.id()))
    }

    /// The columns of `row` visible to `txn`.
    pub fn read_row(&self, txn: &TxnHandle, row: &[u8]) -> StorageResult<Vec<Cell>> {
        let raw = self.cells.row(row)?;
        let mut scope = ReadScope::new();
        self.resolver.read_row(&mut scope, &raw, txn)
    }

    /// Whether one stored cell is visible to `txn` at its snapshot.
    pub fn is_visible(&self, cell: &Cell, txn: &TxnHandle) -> StorageResult<bool> {
        let mut scope = ReadScope::new();
        self.resolver
            .is_visible(&mut scope, cell, txn.snapshot_ts(), txn)
    }

    /// Run one compaction pass over the cell store.
    pub fn compact(&self) -> StorageResult<CompactionStats> {
        let mut rewriter = CompactionRewriter::new(self.txn_store.clone(), self.data_store);
        self.cells.compact(&mut rewriter)?;
        Ok(rewriter.stats())
    }

    /// Persist the oldest timestamp still needed by an active transaction, falling back to
    /// the newest timestamp recorded when nothing is active.
    pub fn remember_watermark(&self) -> StorageResult<Option<Timestamp>> {
        let watermark = self
            .txn_store
            .low_watermark()
            .or_else(|| self.txn_store.max_timestamp());
        if let Some(ts) = watermark {
            self.source.remember_timestamp(ts)?;
        }
        Ok(watermark)
    }

    fn ensure_active(&self, txn: &TxnHandle) -> StorageResult<()> {
        let status = self.txn_store.get(txn.id())?.status();
        if status != TxnStatus::Active {
            return Err(TransactionError::NotActive {
                id: txn.id(),
                status,
            }
            .into());
        }
        Ok(())
    }

    /// Whether `txn` itself deleted the row `raw` belongs to.
    fn deleted_by(&self, txn: &TxnHandle, raw: &[Cell]) -> bool {
        raw.iter().any(|cell| {
            cell.timestamp() == txn.id() && self.data_store.kind_of(cell) == CellKind::Tombstone
        })
    }

    fn sees_tombstone(&self, txn: &TxnHandle, raw: &[Cell]) -> StorageResult<bool> {
        let mut scope = ReadScope::new();
        for cell in raw {
            if self.data_store.kind_of(cell) == CellKind::Tombstone
                && self
                    .resolver
                    .is_visible(&mut scope, cell, txn.snapshot_ts(), txn)?
            {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

impl TxnLifecycleManager for Transactor {
    type Error = StorageError;

    fn begin_transaction(
        &self,
        isolation_level: IsolationLevel,
        parent: Option<&TxnHandle>,
    ) -> StorageResult<TxnHandle> {
        // A failed request leaves nothing behind: the transaction never opened.
        let id = self.source.next_timestamp()?;
        self.txn_store.begin(id, parent, isolation_level)
    }

    fn commit(&self, txn: &TxnHandle) -> StorageResult<Timestamp> {
        let record = self.txn_store.get(txn.id())?;
        match (record.status(), record.commit_ts()) {
            (TxnStatus::Committed, Some(commit_ts)) => return Ok(commit_ts),
            (TxnStatus::Active, _) => {}
            (from, _) => {
                return Err(TransactionError::InvalidStateTransition {
                    id: txn.id(),
                    from,
                    to: TxnStatus::Committed,
                }
                .into());
            }
        }
        if let Some(parent) = record.parent_id() {
            let status = self.txn_store.get(parent)?.status();
            if status != TxnStatus::Active {
                return Err(TransactionError::ParentNotActive { parent, status }.into());
            }
        }

        let commit_ts = match self.source.next_timestamp() {
            Ok(commit_ts) => commit_ts,
            Err(e) => {
                // The outcome is ambiguous to the caller; it must never turn into a commit.
                if let Err(mark) = self.txn_store.mark_error(txn.id()) {
                    warn!(txn = txn.id().raw(), error = %mark, "failed to mark transaction");
                }
                return Err(e.into());
            }
        };
        match self.txn_store.commit(txn.id(), commit_ts) {
            // A concurrent commit of the same handle won; its timestamp is the outcome.
            Err(StorageError::Transaction(TransactionError::CommitTimestampConflict {
                ..
            })) => {
                let record = self.txn_store.get(txn.id())?;
                match (record.status(), record.commit_ts()) {
                    (TxnStatus::Committed, Some(existing)) => Ok(existing),
                    (from, _) => Err(TransactionError::InvalidStateTransition {
                        id: txn.id(),
                        from,
                        to: TxnStatus::Committed,
                    }
                    .into()),
                }
            }
            result => result,
        }
    }

    fn rollback(&self, txn: &TxnHandle) -> StorageResult<()> {
        self.txn_store.rollback(txn.id())
    }

    fn low_watermark(&self) -> Option<Timestamp> {
        self.txn_store.low_watermark()
    }
}
