use std::fs;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use sidb_storage::common::Cell;
use sidb_storage::common::wal::TxnLogConfig;
use sidb_storage::memory::MemoryCellStore;
use sidb_storage::si::{CompactionStats, TransactionStore, Transactor, TxnStoreConfig};
use sidb_transaction::{
    AuthorityConfig, ClientConfig, EffectiveStatus, FileWatermarkStore, IsolationLevel,
    MemoryWatermarkStore, OperationFactory, Timestamp, TimestampAuthority, TimestampSource,
    TimestampSourceClient, TxnHandle, TxnLifecycleManager, TxnStatus, WatermarkStore,
};
use tracing::info;

use crate::error::Result;

const WATERMARK_FILE: &str = "timestamp.watermark";
const TXN_LOG_FILE: &str = "txn.log";

#[derive(Debug, Clone, Default)]
pub struct DatabaseConfig {
    pub authority: AuthorityConfig,
    pub client: ClientConfig,
    /// Used as given by [`Database::open_in_memory`]; [`Database::open`] replaces its log.
    pub txn_store: TxnStoreConfig,
}

pub struct Database {
    transactor: Transactor,
    cells: Arc<MemoryCellStore>,
    operations: OperationFactory,
}

impl Database {
    /// Open a database whose timestamp watermark and transaction records live under `path`.
    ///
    /// Cells are kept in memory. Transactions that were active when the previous process
    /// stopped come back as failed.
    pub fn open<P: AsRef<Path>>(path: P, config: &DatabaseConfig) -> Result<Self> {
        let path = path.as_ref();
        fs::create_dir_all(path)?;
        let watermarks = Arc::new(FileWatermarkStore::new(path.join(WATERMARK_FILE))?);
        let txn_store = TxnStoreConfig {
            log: Some(TxnLogConfig::new(path.join(TXN_LOG_FILE))),
            ..config.txn_store.clone()
        };
        let db = Self::assemble(watermarks, txn_store, config)?;
        info!(path = %path.display(), "database opened");
        Ok(db)
    }

    pub fn open_in_memory(config: &DatabaseConfig) -> Result<Self> {
        Self::assemble(
            Arc::new(MemoryWatermarkStore::default()),
            config.txn_store.clone(),
            config,
        )
    }

    fn assemble(
        watermarks: Arc<dyn WatermarkStore>,
        txn_store: TxnStoreConfig,
        config: &DatabaseConfig,
    ) -> Result<Self> {
        let authority = Arc::new(TimestampAuthority::recover(watermarks, &config.authority)?);
        let source = Arc::new(TimestampSourceClient::local(authority, config.client.clone())?);
        let txn_store = Arc::new(TransactionStore::open(txn_store)?);
        // A lost watermark must not let the authority reissue an id the log already holds.
        if let Some(max) = txn_store.max_timestamp() {
            source.remember_timestamp(max)?;
        }
        let cells = Arc::new(MemoryCellStore::new());
        let transactor = Transactor::new(source, txn_store, cells.clone());
        Ok(Self {
            transactor,
            cells,
            operations: OperationFactory::new(),
        })
    }

    pub fn begin_transaction(
        &self,
        isolation_level: IsolationLevel,
        parent: Option<&TxnHandle>,
    ) -> Result<TxnHandle> {
        Ok(self.transactor.begin_transaction(isolation_level, parent)?)
    }

    pub fn commit(&self, txn: &TxnHandle) -> Result<Timestamp> {
        Ok(self.transactor.commit(txn)?)
    }

    pub fn rollback(&self, txn: &TxnHandle) -> Result<()> {
        Ok(self.transactor.rollback(txn)?)
    }

    /// The recorded status of `txn` itself, ignoring its ancestors.
    pub fn status(&self, txn: &TxnHandle) -> Result<TxnStatus> {
        Ok(self.txn_store().get(txn.id())?.status())
    }

    /// The status of `txn` once its ancestors are taken into account.
    pub fn effective_status(&self, txn: &TxnHandle) -> Result<EffectiveStatus> {
        Ok(self.txn_store().effective_status(txn.id())?)
    }

    pub fn is_visible(&self, cell: &Cell, txn: &TxnHandle) -> Result<bool> {
        Ok(self.transactor.is_visible(cell, txn)?)
    }

    /// Encode `txn` for a request served by another process.
    pub fn serialize_handle(&self, txn: &TxnHandle) -> Result<Vec<u8>> {
        Ok(self.operations.write_txn(txn)?)
    }

    pub fn deserialize_handle(&self, bytes: &[u8]) -> Result<TxnHandle> {
        Ok(self.operations.read_txn(bytes)?)
    }

    pub fn write(
        &self,
        txn: &TxnHandle,
        row: impl Into<Bytes>,
        columns: impl IntoIterator<Item = (Bytes, Bytes)>,
    ) -> Result<()> {
        Ok(self.transactor.write(txn, row, columns)?)
    }

    pub fn delete(&self, txn: &TxnHandle, row: impl Into<Bytes>) -> Result<()> {
        Ok(self.transactor.delete(txn, row)?)
    }

    pub fn read_row(&self, txn: &TxnHandle, row: &[u8]) -> Result<Vec<Cell>> {
        Ok(self.transactor.read_row(txn, row)?)
    }

    pub fn compact(&self) -> Result<CompactionStats> {
        Ok(self.transactor.compact()?)
    }

    /// Persist the low watermark with the timestamp authority.
    pub fn remember_watermark(&self) -> Result<Option<Timestamp>> {
        Ok(self.transactor.remember_watermark()?)
    }

    pub fn cells(&self) -> &MemoryCellStore {
        &self.cells
    }

    fn txn_store(&self) -> &TransactionStore {
        self.transactor.txn_store()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(qualifier: &'static str, value: &'static str) -> (Bytes, Bytes) {
        (Bytes::from_static(qualifier.as_bytes()), Bytes::from_static(value.as_bytes()))
    }

    #[test]
    fn test_open_in_memory() {
        let db = Database::open_in_memory(&DatabaseConfig::default()).unwrap();
        let writer = db.begin_transaction(IsolationLevel::Snapshot, None).unwrap();
        db.write(&writer, "row", [column("c", "v")]).unwrap();
        let commit_ts = db.commit(&writer).unwrap();
        assert!(commit_ts > writer.id());
        assert_eq!(db.status(&writer).unwrap(), TxnStatus::Committed);

        let reader = db.begin_transaction(IsolationLevel::Snapshot, None).unwrap();
        let row = db.read_row(&reader, b"row").unwrap();
        assert_eq!(row.len(), 1);
        assert_eq!(row[0].value().as_ref(), b"v");
        assert!(db.is_visible(&row[0], &reader).unwrap());
    }

    #[test]
    fn test_handle_round_trip_through_context() {
        let db = Database::open_in_memory(&DatabaseConfig::default()).unwrap();
        let parent = db.begin_transaction(IsolationLevel::Snapshot, None).unwrap();
        let child = db
            .begin_transaction(IsolationLevel::ReadCommitted, Some(&parent))
            .unwrap();
        let bytes = db.serialize_handle(&child).unwrap();
        assert_eq!(db.deserialize_handle(&bytes).unwrap(), child);
        assert!(db.deserialize_handle(&bytes[..bytes.len() - 1]).is_err());
        assert!(db.deserialize_handle(&[]).is_err());
    }

    #[test]
    fn test_effective_status_follows_parent() {
        let db = Database::open_in_memory(&DatabaseConfig::default()).unwrap();
        let parent = db.begin_transaction(IsolationLevel::Snapshot, None).unwrap();
        let child = db
            .begin_transaction(IsolationLevel::Snapshot, Some(&parent))
            .unwrap();
        db.commit(&child).unwrap();
        assert_eq!(db.effective_status(&child).unwrap(), EffectiveStatus::Active);
        db.rollback(&parent).unwrap();
        assert_eq!(
            db.effective_status(&child).unwrap(),
            EffectiveStatus::Failed(TxnStatus::RolledBack)
        );
    }

    #[test]
    fn test_reopen_never_reissues_and_fails_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig {
            authority: AuthorityConfig { block_size: 4 },
            ..Default::default()
        };

        let (in_flight, committed, highest) = {
            let db = Database::open(dir.path(), &config).unwrap();
            let committed = db.begin_transaction(IsolationLevel::Snapshot, None).unwrap();
            db.commit(&committed).unwrap();
            let mut last = committed.id();
            for _ in 0..6 {
                let txn = db.begin_transaction(IsolationLevel::Snapshot, None).unwrap();
                db.rollback(&txn).unwrap();
                last = txn.id();
            }
            let in_flight = db.begin_transaction(IsolationLevel::Snapshot, None).unwrap();
            let highest = last.max(in_flight.id());
            (in_flight, committed, highest)
        };

        let db = Database::open(dir.path(), &config).unwrap();
        assert_eq!(db.status(&in_flight).unwrap(), TxnStatus::Error);
        assert_eq!(db.status(&committed).unwrap(), TxnStatus::Committed);
        assert!(db.commit(&in_flight).is_err());

        let fresh = db.begin_transaction(IsolationLevel::Snapshot, None).unwrap();
        assert!(fresh.id() > highest);
    }

    #[test]
    fn test_remember_watermark_tracks_oldest_active() {
        let db = Database::open_in_memory(&DatabaseConfig::default()).unwrap();
        assert_eq!(db.remember_watermark().unwrap(), None);
        let oldest = db.begin_transaction(IsolationLevel::Snapshot, None).unwrap();
        let newer = db.begin_transaction(IsolationLevel::Snapshot, None).unwrap();
        assert_eq!(db.remember_watermark().unwrap(), Some(oldest.id()));
        db.commit(&oldest).unwrap();
        assert_eq!(db.remember_watermark().unwrap(), Some(newer.id()));
    }

    #[test]
    fn test_compact_resolves_committed_writers() {
        let db = Database::open_in_memory(&DatabaseConfig::default()).unwrap();
        let writer = db.begin_transaction(IsolationLevel::Snapshot, None).unwrap();
        db.write(&writer, "row", [column("c", "v")]).unwrap();
        db.commit(&writer).unwrap();
        let stats = db.compact().unwrap();
        assert_eq!(stats.resolved_committed, 1);
        assert_eq!(db.cells().len(), 2);
        assert_eq!(db.compact().unwrap(), CompactionStats::default());
    }
}
