use bytes::Bytes;

use crate::common::cell::Cell;
use crate::error::StorageResult;

/// Trait defining the multi-version cell store the SI layer is built on.
///
/// Cells are addressed by `(row, family, qualifier, timestamp)`; the store keeps every
/// version and never interprets values.
pub trait VersionedStore: Send + Sync {
    /// Write one cell at its explicit timestamp, replacing a cell at the same coordinates.
    fn put(&self, cell: Cell) -> StorageResult<()>;

    /// Drop the version stored at `cell`'s coordinates, if there is one. The value is ignored.
    fn remove(&self, cell: &Cell) -> StorageResult<()>;

    /// All versions of all columns of `row`, grouped by column, newest version first.
    fn row(&self, row: &[u8]) -> StorageResult<Vec<Cell>>;

    /// Keys of all rows holding at least one cell.
    fn rows(&self) -> StorageResult<Vec<Bytes>>;

    /// Stream every row's raw versions through `hook` and store what it returns.
    fn compact(&self, hook: &mut dyn CompactionHook) -> StorageResult<CompactionOutcome>;
}

/// Pluggable rewrite function run by [`VersionedStore::compact`].
pub trait CompactionHook {
    /// Return one output cell per input cell, in input order.
    fn rewrite(&mut self, raw: &[Cell]) -> StorageResult<Vec<Cell>>;
}

/// What a compaction pass did to the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionOutcome {
    pub rows: usize,
    pub cells: usize,
    /// Cells whose value the hook changed.
    pub rewritten: usize,
}
