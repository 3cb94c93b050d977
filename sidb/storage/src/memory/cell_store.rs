use std::cmp::Reverse;

use bytes::Bytes;
use crossbeam_skiplist::SkipMap;
use sidb_transaction::Timestamp;
use tracing::debug;

use crate::common::cell::Cell;
use crate::error::{EncodingError, StorageResult};
use crate::storage::{CompactionHook, CompactionOutcome, VersionedStore};

/// Sort key of one cell version: grouped by row and column, newest version first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct CellKey {
    row: Bytes,
    family: Bytes,
    qualifier: Bytes,
    timestamp: Reverse<Timestamp>,
}

impl CellKey {
    fn of(cell: &Cell) -> Self {
        Self {
            row: cell.row().clone(),
            family: cell.family().clone(),
            qualifier: cell.qualifier().clone(),
            timestamp: Reverse(cell.timestamp()),
        }
    }

    /// Sorts before every key of `row`.
    fn row_start(row: &[u8]) -> Self {
        Self {
            row: Bytes::copy_from_slice(row),
            family: Bytes::new(),
            qualifier: Bytes::new(),
            timestamp: Reverse(Timestamp::with_ts(u64::MAX)),
        }
    }

    fn into_cell(self, value: Bytes) -> Cell {
        Cell::new(
            self.row,
            self.family,
            self.qualifier,
            self.timestamp.0,
            value,
        )
    }
}

/// In-memory multi-version cell store.
///
/// Versions are never dropped; compaction only rewrites values in place.
#[derive(Default)]
pub struct MemoryCellStore {
    cells: SkipMap<CellKey, Bytes>,
}

impl MemoryCellStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The version of one column written at exactly `timestamp`.
    pub fn get(
        &self,
        row: &[u8],
        family: &[u8],
        qualifier: &[u8],
        timestamp: Timestamp,
    ) -> Option<Cell> {
        let key = CellKey {
            row: Bytes::copy_from_slice(row),
            family: Bytes::copy_from_slice(family),
            qualifier: Bytes::copy_from_slice(qualifier),
            timestamp: Reverse(timestamp),
        };
        self.cells
            .get(&key)
            .map(|entry| entry.key().clone().into_cell(entry.value().clone()))
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    fn row_cells(&self, row: &[u8]) -> Vec<Cell> {
        self.cells
            .range(CellKey::row_start(row)..)
            .take_while(|entry| entry.key().row.as_ref() == row)
            .map(|entry| entry.key().clone().into_cell(entry.value().clone()))
            .collect()
    }
}

impl VersionedStore for MemoryCellStore {
    fn put(&self, cell: Cell) -> StorageResult<()> {
        let value = cell.value().clone();
        self.cells.insert(CellKey::of(&cell), value);
        Ok(())
    }

    fn remove(&self, cell: &Cell) -> StorageResult<()> {
        self.cells.remove(&CellKey::of(cell));
        Ok(())
    }

    fn row(&self, row: &[u8]) -> StorageResult<Vec<Cell>> {
        Ok(self.row_cells(row))
    }

    fn rows(&self) -> StorageResult<Vec<Bytes>> {
        let mut rows: Vec<Bytes> = Vec::new();
        for entry in self.cells.iter() {
            if rows.last() != Some(&entry.key().row) {
                rows.push(entry.key().row.clone());
            }
        }
        Ok(rows)
    }

    fn compact(&self, hook: &mut dyn CompactionHook) -> StorageResult<CompactionOutcome> {
        let mut outcome = CompactionOutcome::default();
        for row in self.rows()? {
            let raw = self.row_cells(&row);
            let rewritten = hook.rewrite(&raw)?;
            if rewritten.len() != raw.len() {
                return Err(EncodingError::BatchSizeMismatch {
                    input: raw.len(),
                    output: rewritten.len(),
                }
                .into());
            }
            for (before, after) in raw.iter().zip(rewritten) {
                if before.value() != after.value() {
                    outcome.rewritten += 1;
                    self.put(after)?;
                }
            }
            outcome.rows += 1;
            outcome.cells += raw.len();
        }
        debug!(
            rows = outcome.rows,
            cells = outcome.cells,
            rewritten = outcome.rewritten,
            "compaction pass finished"
        );
        Ok(outcome)
    }
}
