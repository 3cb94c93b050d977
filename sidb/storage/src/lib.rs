//! Snapshot isolation over a multi-version cell store.
//!
//! The SI layer never changes how cells are stored. It tags every write with its writer
//! transaction, decides per reader which versions are visible, and folds resolved commit
//! metadata back into the cells during compaction.

pub mod common;
pub mod error;
pub mod memory;
pub mod si;
pub mod storage;
