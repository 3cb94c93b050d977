use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use sidb_storage::memory::MemoryCellStore;
use sidb_storage::si::{TransactionStore, Transactor};
use sidb_transaction::{
    AuthorityConfig, ClientConfig, MemoryWatermarkStore, Timestamp, TimestampAuthority,
    TimestampError, TimestampResult, TimestampSource, TimestampSourceClient,
};

/// Hands out a fixed sequence of timestamps, then reports the authority as unavailable.
pub struct ScriptedTimestampSource {
    script: Mutex<VecDeque<u64>>,
    remembered: Mutex<Option<Timestamp>>,
}

impl ScriptedTimestampSource {
    pub fn new(script: impl IntoIterator<Item = u64>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            remembered: Mutex::new(None),
        }
    }

    #[allow(dead_code)]
    pub fn remaining(&self) -> usize {
        self.script.lock().len()
    }
}

impl TimestampSource for ScriptedTimestampSource {
    fn next_timestamp(&self) -> TimestampResult<Timestamp> {
        self.script
            .lock()
            .pop_front()
            .map(Timestamp::with_ts)
            .ok_or_else(|| TimestampError::Unavailable("script exhausted".to_string()))
    }

    fn remember_timestamp(&self, ts: Timestamp) -> TimestampResult<()> {
        *self.remembered.lock() = Some(ts);
        Ok(())
    }

    fn retrieve_timestamp(&self) -> TimestampResult<Timestamp> {
        Ok(self.remembered.lock().unwrap_or(Timestamp::ZERO))
    }
}

pub struct TestContext {
    pub transactor: Transactor,
    pub cells: Arc<MemoryCellStore>,
    pub txn_store: Arc<TransactionStore>,
}

#[allow(dead_code)]
pub fn context_with(source: Arc<dyn TimestampSource>) -> TestContext {
    let cells = Arc::new(MemoryCellStore::new());
    let txn_store = Arc::new(TransactionStore::in_memory());
    let transactor = Transactor::new(source, txn_store.clone(), cells.clone());
    TestContext {
        transactor,
        cells,
        txn_store,
    }
}

#[allow(dead_code)]
pub fn scripted_context(script: impl IntoIterator<Item = u64>) -> TestContext {
    context_with(Arc::new(ScriptedTimestampSource::new(script)))
}

#[allow(dead_code)]
pub fn authority_context() -> TestContext {
    let authority = TimestampAuthority::recover(
        Arc::new(MemoryWatermarkStore::default()),
        &AuthorityConfig::default(),
    )
    .unwrap();
    let client =
        TimestampSourceClient::local(Arc::new(authority), ClientConfig::default()).unwrap();
    context_with(Arc::new(client))
}

#[allow(dead_code)]
pub fn ts(raw: u64) -> Timestamp {
    Timestamp::with_ts(raw)
}

#[allow(dead_code)]
pub fn column(qualifier: &'static str, value: &'static str) -> (Bytes, Bytes) {
    (Bytes::from_static(qualifier.as_bytes()), Bytes::from_static(value.as_bytes()))
}

/// Values of the visible columns, in column order.
#[allow(dead_code)]
pub fn values(cells: &[sidb_storage::common::Cell]) -> Vec<Bytes> {
    cells.iter().map(|cell| cell.value().clone()).collect()
}
