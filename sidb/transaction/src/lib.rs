//! Transaction infrastructure for the sidb snapshot isolation engine.
//!
//! This crate holds the pieces that do not depend on how cells are stored: the timestamp
//! authority and its client, transaction records and handles, and the transport encoding
//! of transaction context.

pub mod client;
pub mod error;
pub mod manager;
pub mod operation;
pub mod timestamp;
pub mod transaction;
pub mod watermark;

pub use client::{
    ClientConfig, LocalTransport, TimestampSource, TimestampSourceClient, TimestampTransport,
};
pub use error::{
    ContextError, TimestampError, TimestampResult, TransactionError, TransactionResult,
};
// Re-export commonly used types
pub use manager::TxnLifecycleManager;
pub use operation::OperationFactory;
pub use timestamp::{AuthorityConfig, Timestamp, TimestampAuthority};
pub use transaction::{EffectiveStatus, IsolationLevel, TransactionRecord, TxnHandle, TxnStatus};
pub use watermark::{FileWatermarkStore, MemoryWatermarkStore, WatermarkStore};
