//! Resolution of commit markers during physical compaction.
//!
//! Every unresolved marker whose writer has reached a terminal effective status is rewritten
//! to its final value, so later reads never have to look that writer up again. Markers of
//! writers that are still active, or that cannot be looked up, stay unresolved and are
//! retried by a later pass.

use std::collections::HashMap;
use std::sync::Arc;

use sidb_transaction::{EffectiveStatus, Timestamp, TransactionRecord};
use tracing::{debug, warn};

use super::txn_store::{TransactionStore, resolve_effective_status};
use crate::common::cell::{Cell, CellKind};
use crate::common::data_store::DataStore;
use crate::error::StorageResult;
use crate::storage::CompactionHook;

/// Writer records resolved during one compaction pass.
///
/// Kept apart from [`super::read::ReadScope`]: a pass is long-lived and batch-local, and
/// never shares what it resolved with readers.
#[derive(Debug, Default)]
pub struct CompactionScope {
    records: HashMap<Timestamp, TransactionRecord>,
    statuses: HashMap<Timestamp, EffectiveStatus>,
}

impl CompactionScope {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(
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

    fn effective_status(
        &mut self,
        store: &TransactionStore,
        id: Timestamp,
    ) -> StorageResult<EffectiveStatus> {
        if let Some(status) = self.statuses.get(&id) {
            return Ok(*status);
        }
        let record = self.record(store, id)?;
        let status = resolve_effective_status(&record, |ancestor| self.record(store, ancestor))?;
        // Active statuses may still change; only terminal ones are worth keeping.
        if status.is_terminal() {
            self.statuses.insert(id, status);
        }
        Ok(status)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionStats {
    pub resolved_committed: usize,
    pub resolved_failed: usize,
    pub left_unresolved: usize,
    pub lookup_failures: usize,
}

/// Rewrites one compaction pass worth of raw cell batches.
pub struct CompactionRewriter {
    store: Arc<TransactionStore>,
    data_store: DataStore,
    scope: CompactionScope,
    stats: CompactionStats,
}

impl CompactionRewriter {
    /// Start a pass with a fresh scope.
    pub fn new(store: Arc<TransactionStore>, data_store: DataStore) -> Self {
        Self {
            store,
            data_store,
            scope: CompactionScope::new(),
            stats: CompactionStats::default(),
        }
    }

    /// Emit one output cell per input cell into `results`, in input order.
    pub fn mutate(&mut self, raw: &[Cell], results: &mut Vec<Cell>) {
        results.reserve(raw.len());
        for cell in raw {
            results.push(self.mutate_cell(cell));
        }
    }

    pub fn stats(&self) -> CompactionStats {
        self.stats
    }

    fn mutate_cell(&mut self, cell: &Cell) -> Cell {
        if self.data_store.kind_of(cell) != CellKind::CommitTimestamp
            || !self.data_store.is_unresolved_commit_marker(cell.value())
        {
            return cell.clone();
        }

        let writer = cell.timestamp();
        let status = match self.scope.effective_status(&self.store, writer) {
            Ok(status) => status,
            Err(e) => {
                warn!(
                    txn = writer.raw(),
                    error = %e,
                    "cannot resolve writer, leaving commit marker unresolved"
                );
                self.stats.lookup_failures += 1;
                self.stats.left_unresolved += 1;
                return cell.clone();
            }
        };
        if status == EffectiveStatus::Active {
            self.stats.left_unresolved += 1;
            return cell.clone();
        }
        let value = self
            .scope
            .record(&self.store, writer)
            .and_then(|record| self.data_store.encode_resolved_commit(&record, status));
        match value {
            Ok(value) => {
                match status {
                    EffectiveStatus::Committed(_) => self.stats.resolved_committed += 1,
                    _ => self.stats.resolved_failed += 1,
                }
                debug!(txn = writer.raw(), ?status, "resolved commit marker");
                cell.with_value(value)
            }
            Err(e) => {
                warn!(
                    txn = writer.raw(),
                    error = %e,
                    "cannot encode writer outcome, leaving commit marker unresolved"
                );
                self.stats.left_unresolved += 1;
                cell.clone()
            }
        }
    }
}

impl CompactionHook for CompactionRewriter {
    fn rewrite(&mut self, raw: &[Cell]) -> StorageResult<Vec<Cell>> {
        let mut results = Vec::with_capacity(raw.len());
        self.mutate(raw, &mut results);
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use sidb_transaction::IsolationLevel;

    use super::*;
    use crate::common::data_store::{CommitMarker, SI_FAIL};

    fn ts(raw: u64) -> Timestamp {
        Timestamp::with_ts(raw)
    }

    fn batch(ds: &DataStore, writers: &[u64]) -> Vec<Cell> {
        writers
            .iter()
            .flat_map(|writer| {
                [
                    ds.data_cell("r", "c", ts(*writer), "v"),
                    ds.unresolved_marker("r", ts(*writer)),
                ]
            })
            .collect()
    }

    #[test]
    fn test_resolves_terminal_writers() {
        let store = Arc::new(TransactionStore::in_memory());
        let ds = DataStore::new();
        for id in [10, 11, 12] {
            store.begin(ts(id), None, IsolationLevel::Snapshot).unwrap();
        }
        store.commit(ts(10), ts(15)).unwrap();
        store.rollback(ts(11)).unwrap();

        let raw = batch(&ds, &[10, 11, 12]);
        let mut rewriter = CompactionRewriter::new(store, ds);
        let mut results = Vec::new();
        rewriter.mutate(&raw, &mut results);

        assert_eq!(results.len(), raw.len());
        assert_eq!(results[0], raw[0]);
        assert_eq!(
            ds.decode_commit_marker(results[1].value()).unwrap(),
            CommitMarker::Committed(ts(15))
        );
        assert_eq!(results[3].value().as_ref(), SI_FAIL);
        assert!(ds.is_unresolved_commit_marker(results[5].value()));
        assert_eq!(rewriter.stats(), CompactionStats {
            resolved_committed: 1,
            resolved_failed: 1,
            left_unresolved: 1,
            lookup_failures: 0,
        });
    }

    #[test]
    fn test_second_pass_is_identical() {
        let store = Arc::new(TransactionStore::in_memory());
        let ds = DataStore::new();
        store.begin(ts(10), None, IsolationLevel::Snapshot).unwrap();
        store.commit(ts(10), ts(15)).unwrap();
        let raw = batch(&ds, &[10]);

        let mut first = Vec::new();
        CompactionRewriter::new(store.clone(), ds).mutate(&raw, &mut first);

        let lookups = store.lookup_count();
        let mut second_pass = CompactionRewriter::new(store.clone(), ds);
        let mut second = Vec::new();
        second_pass.mutate(&first, &mut second);
        assert_eq!(first, second);
        assert_eq!(store.lookup_count(), lookups);
        assert_eq!(second_pass.stats(), CompactionStats::default());
    }

    #[test]
    fn test_lookup_failure_never_fails_the_pass() {
        let store = Arc::new(TransactionStore::in_memory());
        let ds = DataStore::new();
        let raw = batch(&ds, &[42]);
        let mut rewriter = CompactionRewriter::new(store, ds);
        let results = rewriter.rewrite(&raw).unwrap();
        assert_eq!(results, raw);
        assert_eq!(rewriter.stats().lookup_failures, 1);
        assert_eq!(rewriter.stats().left_unresolved, 1);
    }

    #[test]
    fn test_scope_resolves_each_writer_once() {
        let store = Arc::new(TransactionStore::in_memory());
        let ds = DataStore::new();
        let parent = store.begin(ts(10), None, IsolationLevel::Snapshot).unwrap();
        store
            .begin(ts(11), Some(&parent), IsolationLevel::Snapshot)
            .unwrap();
        store.commit(ts(11), ts(12)).unwrap();
        store.commit(ts(10), ts(13)).unwrap();

        let before = store.lookup_count();
        let mut rewriter = CompactionRewriter::new(store.clone(), ds);
        for _ in 0..3 {
            let results = rewriter.rewrite(&batch(&ds, &[11])).unwrap();
            // A nested writer resolves to its outermost commit timestamp.
            assert_eq!(
                ds.decode_commit_marker(results[1].value()).unwrap(),
                CommitMarker::Committed(ts(13))
            );
        }
        assert_eq!(store.lookup_count() - before, 2);
    }

    #[test]
    fn test_nested_writer_waits_for_its_parent() {
        let store = Arc::new(TransactionStore::in_memory());
        let ds = DataStore::new();
        let parent = store.begin(ts(10), None, IsolationLevel::Snapshot).unwrap();
        store
            .begin(ts(11), Some(&parent), IsolationLevel::Snapshot)
            .unwrap();
        store.commit(ts(11), ts(12)).unwrap();
        let raw = batch(&ds, &[11]);

        // The child's own commit at 12 is not final while the parent runs.
        let mut rewriter = CompactionRewriter::new(store.clone(), ds);
        assert_eq!(rewriter.rewrite(&raw).unwrap(), raw);
        assert_eq!(rewriter.stats().left_unresolved, 1);

        store.rollback(ts(10)).unwrap();
        let mut rewriter = CompactionRewriter::new(store, ds);
        let results = rewriter.rewrite(&raw).unwrap();
        assert_eq!(results[1].value().as_ref(), SI_FAIL);
        assert_eq!(rewriter.stats().resolved_failed, 1);
    }
}
