pub mod compaction;
pub mod read;
pub mod transactor;
pub mod txn_store;

pub use compaction::{CompactionRewriter, CompactionScope, CompactionStats};
pub use read::{ReadScope, VisibilityResolver};
pub use transactor::Transactor;
pub use txn_store::{TransactionStore, TxnStoreConfig, resolve_effective_status};
