//! Embedded snapshot isolation over a versioned cell store.
//!
//! [`Database`] wires a timestamp authority, its client, the transaction store and a cell
//! store together. Nothing is global: every component hangs off the database value.

mod database;
mod error;

pub use database::{Database, DatabaseConfig};
pub use error::{Error, Result};
pub use sidb_storage::common::Cell;
pub use sidb_storage::si::CompactionStats;
pub use sidb_transaction::{EffectiveStatus, IsolationLevel, Timestamp, TxnHandle, TxnStatus};
