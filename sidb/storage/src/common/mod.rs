pub mod cell;
pub mod data_store;
pub mod wal;

pub use cell::{Cell, CellKind};
pub use data_store::{CommitMarker, DataStore};
pub use wal::*;
