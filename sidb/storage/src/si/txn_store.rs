//! Durable transaction records with a read-through cache.
//!
//! Records live in the transaction table. A terminal transition is one conditional write:
//! the record's table entry stays locked while the transition is logged and applied, so a
//! reader sees either the `Active` record or the final one, never anything in between.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_skiplist::SkipMap;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use lru::LruCache;
use parking_lot::Mutex;
use sidb_transaction::{
    EffectiveStatus, IsolationLevel, Timestamp, TransactionError, TransactionRecord, TxnHandle,
    TxnStatus,
};
use tracing::{debug, info, warn};

use crate::common::wal::{StorageWal, TxnLog, TxnLogConfig, TxnLogOp};
use crate::error::StorageResult;

const DEFAULT_CACHE_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct TxnStoreConfig {
    /// Number of terminal records kept in the process-wide cache.
    pub cache_capacity: usize,
    /// Transaction log. Without one, records do not survive a restart.
    pub log: Option<TxnLogConfig>,
}

impl Default for TxnStoreConfig {
    fn default() -> Self {
        Self {
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            log: None,
        }
    }
}

pub struct TransactionStore {
    /// The transaction table, keyed by transaction id.
    table: DashMap<Timestamp, TransactionRecord>,
    /// Ids of the transactions still active, ordered for the low watermark.
    active_txns: SkipMap<Timestamp, ()>,
    /// Terminal records only; they never change once written.
    terminal_cache: Mutex<LruCache<Timestamp, TransactionRecord>>,
    log: Option<Mutex<TxnLog>>,
    lookups: AtomicU64,
}

impl TransactionStore {
    /// Open the store, replaying the transaction log if one is configured.
    ///
    /// Records that the log leaves `Active` belonged to a process that died mid-flight and
    /// are marked `Error`.
    pub fn open(config: TxnStoreConfig) -> StorageResult<Self> {
        let mut store = Self::with_capacity(config.cache_capacity);
        if let Some(log_config) = config.log {
            let log = TxnLog::open(&log_config.path)?;
            store.replay(&log)?;
            store.log = Some(Mutex::new(log));
            store.fail_in_flight()?;
        }
        Ok(store)
    }

    /// A store with no transaction log.
    pub fn in_memory() -> Self {
        Self::with_capacity(DEFAULT_CACHE_CAPACITY)
    }

    fn with_capacity(cache_capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            table: DashMap::new(),
            active_txns: SkipMap::new(),
            terminal_cache: Mutex::new(LruCache::new(capacity)),
            log: None,
            lookups: AtomicU64::new(0),
        }
    }

    /// Record a new `Active` transaction. A nested transaction requires an `Active` parent.
    pub fn begin(
        &self,
        id: Timestamp,
        parent: Option<&TxnHandle>,
        isolation_level: IsolationLevel,
    ) -> StorageResult<TxnHandle> {
        let ancestors = match parent {
            Some(parent) => {
                let parent_record = self.get(parent.id())?;
                if parent_record.status() != TxnStatus::Active {
                    return Err(TransactionError::ParentNotActive {
                        parent: parent.id(),
                        status: parent_record.status(),
                    }
                    .into());
                }
                std::iter::once(parent.id())
                    .chain(parent.ancestors().iter().copied())
                    .collect()
            }
            None => Vec::new(),
        };
        let record = TransactionRecord::begin(id, ancestors, isolation_level)?;

        match self.table.entry(id) {
            Entry::Occupied(_) => Err(TransactionError::AlreadyExists(id).into()),
            Entry::Vacant(vacant) => {
                self.append_log(id, TxnLogOp::Begin {
                    ancestors: record.ancestors().to_vec(),
                    isolation_level,
                })?;
                let handle = record.handle();
                self.active_txns.insert(id, ());
                vacant.insert(record);
                debug!(txn = id.raw(), ?isolation_level, "transaction began");
                Ok(handle)
            }
        }
    }

    /// Look a record up, from the terminal cache if possible.
    pub fn get(&self, id: Timestamp) -> StorageResult<TransactionRecord> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        if let Some(record) = self.terminal_cache.lock().get(&id) {
            return Ok(record.clone());
        }
        let record = self
            .table
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(TransactionError::NotFound(id))?;
        if record.status().is_terminal() {
            self.terminal_cache.lock().put(id, record.clone());
        }
        Ok(record)
    }

    /// Commit at `commit_ts`. Committing again at the same timestamp returns it unchanged.
    pub fn commit(&self, id: Timestamp, commit_ts: Timestamp) -> StorageResult<Timestamp> {
        self.transition(id, TxnLogOp::Commit(commit_ts), |record| {
            record.commit(commit_ts)
        })?;
        debug!(txn = id.raw(), commit_ts = commit_ts.raw(), "transaction committed");
        Ok(commit_ts)
    }

    pub fn rollback(&self, id: Timestamp) -> StorageResult<()> {
        self.transition(id, TxnLogOp::Rollback, TransactionRecord::rollback)?;
        debug!(txn = id.raw(), "transaction rolled back");
        Ok(())
    }

    pub fn mark_error(&self, id: Timestamp) -> StorageResult<()> {
        self.transition(id, TxnLogOp::Error, TransactionRecord::mark_error)?;
        warn!(txn = id.raw(), "transaction marked as failed");
        Ok(())
    }

    /// Status of `id` as seen from outside its family, resolved along its ancestor chain.
    pub fn effective_status(&self, id: Timestamp) -> StorageResult<EffectiveStatus> {
        let record = self.get(id)?;
        resolve_effective_status(&record, |ancestor| self.get(ancestor))
    }

    /// The minimum id of the active transactions, if any.
    pub fn low_watermark(&self) -> Option<Timestamp> {
        self.active_txns.front().map(|entry| *entry.key())
    }

    /// Highest timestamp recorded anywhere in the table.
    pub fn max_timestamp(&self) -> Option<Timestamp> {
        self.table
            .iter()
            .map(|entry| {
                let record = entry.value();
                record.commit_ts().map_or(record.id(), |ts| ts.max(record.id()))
            })
            .max()
    }

    /// Number of record lookups served so far, cached or not.
    pub fn lookup_count(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Apply one terminal transition as a conditional write on the record.
    ///
    /// The transition is validated on a copy, logged, and only then published. A no-op
    /// transition (retried commit or rollback) is neither logged nor republished.
    fn transition<F, T>(&self, id: Timestamp, op: TxnLogOp, apply: F) -> StorageResult<()>
    where
        F: FnOnce(&mut TransactionRecord) -> Result<T, TransactionError>,
    {
        let mut entry = self
            .table
            .get_mut(&id)
            .ok_or(TransactionError::NotFound(id))?;
        let mut updated = entry.value().clone();
        apply(&mut updated)?;
        if updated == *entry.value() {
            return Ok(());
        }
        self.append_log(id, op)?;
        *entry.value_mut() = updated;
        drop(entry);
        self.active_txns.remove(&id);
        Ok(())
    }

    fn append_log(&self, id: Timestamp, op: TxnLogOp) -> StorageResult<()> {
        if let Some(log) = &self.log {
            log.lock().log(id, op)?;
        }
        Ok(())
    }

    fn replay(&self, log: &TxnLog) -> StorageResult<()> {
        let entries = log.read_all()?;
        for entry in &entries {
            let id = entry.txn_id;
            match &entry.op {
                TxnLogOp::Begin {
                    ancestors,
                    isolation_level,
                } => {
                    let record =
                        TransactionRecord::begin(id, ancestors.clone(), *isolation_level)?;
                    self.table.insert(id, record);
                }
                op => {
                    let mut record = self
                        .table
                        .get_mut(&id)
                        .ok_or(TransactionError::NotFound(id))?;
                    match op {
                        TxnLogOp::Commit(commit_ts) => {
                            record.commit(*commit_ts)?;
                        }
                        TxnLogOp::Rollback => record.rollback()?,
                        _ => record.mark_error()?,
                    }
                }
            }
        }
        info!(
            path = %log.path().display(),
            entries = entries.len(),
            records = self.table.len(),
            "replayed transaction log"
        );
        Ok(())
    }

    fn fail_in_flight(&self) -> StorageResult<()> {
        let in_flight: Vec<_> = self
            .table
            .iter()
            .filter(|entry| entry.value().status() == TxnStatus::Active)
            .map(|entry| *entry.key())
            .collect();
        for id in in_flight {
            self.mark_error(id)?;
        }
        Ok(())
    }
}

/// Walk `record`'s chain from the record up to its outermost ancestor.
///
/// Any failed member fails the whole chain. Otherwise any active member keeps it active.
/// Otherwise the chain committed at the outermost ancestor's commit timestamp.
pub fn resolve_effective_status<F>(
    record: &TransactionRecord,
    mut lookup: F,
) -> StorageResult<EffectiveStatus>
where
    F: FnMut(Timestamp) -> StorageResult<TransactionRecord>,
{
    let mut active = false;
    let mut outermost_commit = record.commit_ts();
    match record.status() {
        status if status.is_failed() => return Ok(EffectiveStatus::Failed(status)),
        TxnStatus::Active => active = true,
        _ => {}
    }
    for ancestor in record.ancestors() {
        let ancestor = lookup(*ancestor)?;
        match ancestor.status() {
            status if status.is_failed() => return Ok(EffectiveStatus::Failed(status)),
            TxnStatus::Active => active = true,
            _ => outermost_commit = ancestor.commit_ts(),
        }
    }
    match outermost_commit {
        Some(commit_ts) if !active => Ok(EffectiveStatus::Committed(commit_ts)),
        _ => Ok(EffectiveStatus::Active),
    }
}
