//! Timestamp management for snapshot isolation
//!
//! Every transaction id, snapshot and commit timestamp is drawn from one totally ordered
//! space issued by the [`TimestampAuthority`]. The authority persists a reserved ceiling
//! through a [`WatermarkStore`] so that a restarted authority never reissues a value.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{TimestampError, TimestampResult};
use crate::watermark::WatermarkStore;

const DEFAULT_BLOCK_SIZE: u64 = 1024;

/// A point in the global timestamp order.
///
/// A transaction's begin timestamp doubles as its id and as the writer timestamp of every
/// cell it writes, so the same type is used for all three.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The smallest timestamp. Never issued; the authority starts at 1.
    pub const ZERO: Timestamp = Timestamp(0);
    /// The largest timestamp the authority may issue.
    pub const MAX: Timestamp = Timestamp(i64::MAX as u64);

    /// Create timestamp by a given raw value
    pub const fn with_ts(timestamp: u64) -> Self {
        Self(timestamp)
    }

    /// Returns the raw value of the timestamp.
    pub const fn raw(&self) -> u64 {
        self.0
    }

    /// Big-endian encoding, the layout commit markers are stored with.
    pub fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    pub fn from_be_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_be_bytes(bytes))
    }
}

impl From<u64> for Timestamp {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone)]
pub struct AuthorityConfig {
    /// Number of timestamps reserved per watermark write.
    pub block_size: u64,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

/// The single logical source of timestamps.
///
/// Issuing is a lock-free CAS on the counter. Only crossing the reserved ceiling takes the
/// reservation lock, which persists the next ceiling before any value above the old one
/// is handed out.
pub struct TimestampAuthority {
    /// Next timestamp to hand out.
    counter: AtomicU64,
    /// Highest timestamp covered by the persisted watermark.
    reserved: AtomicU64,
    reserve_lock: Mutex<()>,
    block_size: u64,
    watermarks: Arc<dyn WatermarkStore>,
}

impl TimestampAuthority {
    /// Open an authority, resuming strictly above the persisted watermark if there is one.
    pub fn recover(
        watermarks: Arc<dyn WatermarkStore>,
        config: &AuthorityConfig,
    ) -> TimestampResult<Self> {
        let watermark = watermarks.load()?.unwrap_or(Timestamp::ZERO);
        if watermark >= Timestamp::MAX {
            return Err(TimestampError::Overflow(watermark.raw()));
        }
        if watermark > Timestamp::ZERO {
            info!(watermark = watermark.raw(), "timestamp authority resuming");
        }
        Ok(Self {
            counter: AtomicU64::new(watermark.raw() + 1),
            reserved: AtomicU64::new(watermark.raw()),
            reserve_lock: Mutex::new(()),
            block_size: config.block_size.max(1),
            watermarks,
        })
    }

    /// Issue the next timestamp.
    pub fn next(&self) -> TimestampResult<Timestamp> {
        let mut cur = self.counter.load(Ordering::SeqCst);
        loop {
            if cur >= Timestamp::MAX.raw() {
                return Err(TimestampError::Overflow(cur));
            }
            if cur > self.reserved.load(Ordering::Acquire) {
                self.reserve_through(cur)?;
            }
            match self.counter.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(Timestamp::with_ts(cur)),
                Err(actual) => cur = actual,
            }
        }
    }

    /// Get the next timestamp to be issued without issuing it
    pub fn current(&self) -> Timestamp {
        Timestamp::with_ts(self.counter.load(Ordering::SeqCst))
    }

    /// Persist `ts` as a low watermark. Nothing at or below it will be issued afterwards.
    pub fn remember(&self, ts: Timestamp) -> TimestampResult<()> {
        if ts >= Timestamp::MAX {
            return Err(TimestampError::Overflow(ts.raw()));
        }
        let _guard = self.reserve_lock.lock();
        let ceiling = self.reserved.load(Ordering::Acquire).max(ts.raw());
        self.watermarks.store(Timestamp::with_ts(ceiling))?;
        self.reserved.store(ceiling, Ordering::Release);
        self.counter.fetch_max(ts.raw() + 1, Ordering::SeqCst);
        Ok(())
    }

    /// The persisted watermark, or zero if none was ever written.
    pub fn retrieve(&self) -> TimestampResult<Timestamp> {
        Ok(self.watermarks.load()?.unwrap_or(Timestamp::ZERO))
    }

    fn reserve_through(&self, ts: u64) -> TimestampResult<()> {
        let _guard = self.reserve_lock.lock();
        if ts <= self.reserved.load(Ordering::Acquire) {
            return Ok(());
        }
        let ceiling = ts
            .saturating_add(self.block_size - 1)
            .min(Timestamp::MAX.raw());
        self.watermarks.store(Timestamp::with_ts(ceiling))?;
        self.reserved.store(ceiling, Ordering::Release);
        debug!(ceiling, "reserved timestamp block");
        Ok(())
    }
}
