pub mod cell_store;

pub use cell_store::MemoryCellStore;
