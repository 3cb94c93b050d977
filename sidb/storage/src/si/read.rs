//! Visibility of stored versions to a reading transaction.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use sidb_transaction::{IsolationLevel, Timestamp, TransactionRecord, TxnHandle, TxnStatus};

use super::txn_store::TransactionStore;
use crate::common::cell::{Cell, CellKind};
use crate::common::data_store::{CommitMarker, DataStore};
use crate::error::StorageResult;

/// Writer records resolved during one read operation.
///
/// Created by the caller for one logical read and dropped with it. Records in here may be
/// stale `Active` ones, which is why a scope must never outlive its operation.
#[derive(Debug, Default)]
pub struct ReadScope {
    records: HashMap<Timestamp, TransactionRecord>,
}

impl ReadScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct transactions resolved so far.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn lookup(
        &mut self,
        store: &TransactionStore,
        id: Timestamp,
    ) -> StorageResult<TransactionRecord> {
        if let Some(record) = self.records.get(&id) {
            return Ok(record.clone());
        }
        let record = store.get(id)?;
        self.records.insert(id, record.clone());
        Ok(record)
    }
}

/// Decides which stored versions a reader sees.
pub struct VisibilityResolver {
    store: Arc<TransactionStore>,
    data_store: DataStore,
}

impl VisibilityResolver {
    pub fn new(store: Arc<TransactionStore>, data_store: DataStore) -> Self {
        Self { store, data_store }
    }

    /// Whether `cell` is visible to `reader` reading at `snapshot_ts`.
    pub fn is_visible(
        &self,
        scope: &mut ReadScope,
        cell: &Cell,
        snapshot_ts: Timestamp,
        reader: &TxnHandle,
    ) -> StorageResult<bool> {
        self.is_writer_visible(scope, cell.timestamp(), None, snapshot_ts, reader)
    }

    /// Whether the writes of `writer` are visible to `reader` reading at `snapshot_ts`.
    ///
    /// A resolved commit marker of the writer, when the caller has one, is trusted instead
    /// of looking the writer up.
    pub fn is_writer_visible(
        &self,
        scope: &mut ReadScope,
        writer: Timestamp,
        marker: Option<CommitMarker>,
        snapshot_ts: Timestamp,
        reader: &TxnHandle,
    ) -> StorageResult<bool> {
        if writer == reader.id() {
            return Ok(true);
        }
        if reader.is_ancestor(writer) {
            // Ancestors share the reader's snapshot.
            let ancestor = scope.lookup(&self.store, writer)?;
            return Ok(!ancestor.status().is_failed());
        }
        match marker {
            Some(CommitMarker::Committed(commit_ts)) => {
                return Ok(committed_visible(commit_ts, snapshot_ts, reader));
            }
            Some(CommitMarker::Failed) => return Ok(false),
            Some(CommitMarker::Unresolved) | None => {}
        }

        let mut current = scope.lookup(&self.store, writer)?;
        loop {
            let commit_ts = match (current.status(), current.commit_ts()) {
                (TxnStatus::RolledBack | TxnStatus::Error, _) => return Ok(false),
                (TxnStatus::Active, _) | (TxnStatus::Committed, None) => {
                    return Ok(reader.isolation_level() == IsolationLevel::ReadUncommitted);
                }
                (TxnStatus::Committed, Some(commit_ts)) => commit_ts,
            };
            match current.parent_id() {
                None => return Ok(committed_visible(commit_ts, snapshot_ts, reader)),
                // Committed into the reader itself.
                Some(parent) if parent == reader.id() => return Ok(true),
                Some(parent) if reader.is_ancestor(parent) => {
                    return Ok(committed_visible(commit_ts, snapshot_ts, reader));
                }
                Some(parent) => current = scope.lookup(&self.store, parent)?,
            }
        }
    }

    /// Materialise the version of `row` visible to `reader`.
    ///
    /// `raw` holds every stored version of the row. For each data column the visible version
    /// with the highest writer timestamp is returned, unless a newer visible tombstone
    /// deleted the row. A tombstone never hides cells of its own writer: a transaction that
    /// deletes a row drops its earlier writes to it. Anti-tombstones delete nothing.
    pub fn read_row(
        &self,
        scope: &mut ReadScope,
        raw: &[Cell],
        reader: &TxnHandle,
    ) -> StorageResult<Vec<Cell>> {
        let snapshot_ts = reader.snapshot_ts();
        let mut markers = HashMap::new();
        for cell in raw {
            if self.data_store.kind_of(cell) == CellKind::CommitTimestamp {
                let marker = self.data_store.decode_commit_marker(cell.value())?;
                markers.insert(cell.timestamp(), marker);
            }
        }

        let mut visible_writers: HashMap<Timestamp, bool> = HashMap::new();
        let mut is_visible = |scope: &mut ReadScope, writer: Timestamp| -> StorageResult<bool> {
            if let Some(visible) = visible_writers.get(&writer) {
                return Ok(*visible);
            }
            let marker = markers.get(&writer).copied();
            let visible = self.is_writer_visible(scope, writer, marker, snapshot_ts, reader)?;
            visible_writers.insert(writer, visible);
            Ok(visible)
        };

        let mut deleted_at = None;
        for cell in raw {
            if self.data_store.kind_of(cell) == CellKind::Tombstone
                && is_visible(scope, cell.timestamp())?
            {
                deleted_at = deleted_at.max(Some(cell.timestamp()));
            }
        }

        let mut columns: BTreeMap<(Bytes, Bytes), Cell> = BTreeMap::new();
        for cell in raw {
            if self.data_store.kind_of(cell) != CellKind::UserData {
                continue;
            }
            if deleted_at.is_some_and(|deleted_at| cell.timestamp() < deleted_at) {
                continue;
            }
            let key = (cell.family().clone(), cell.qualifier().clone());
            if columns
                .get(&key)
                .is_some_and(|best| best.timestamp() >= cell.timestamp())
            {
                continue;
            }
            if is_visible(scope, cell.timestamp())? {
                columns.insert(key, cell.clone());
            }
        }
        Ok(columns.into_values().collect())
    }
}

fn committed_visible(commit_ts: Timestamp, snapshot_ts: Timestamp, reader: &TxnHandle) -> bool {
    match reader.isolation_level() {
        IsolationLevel::Snapshot => commit_ts <= snapshot_ts,
        IsolationLevel::ReadCommitted | IsolationLevel::ReadUncommitted => true,
    }
}
