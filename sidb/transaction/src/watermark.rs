//! Durable storage of the timestamp low watermark.
//!
//! File layout (12 bytes):
//! ┌──────────────────┬────────────┐
//! │ u64 ts (BE)      │ u32 crc32  │
//! └──────────────────┴────────────┘

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use crc32fast::Hasher;
use parking_lot::Mutex;

use crate::error::{TimestampError, TimestampResult};
use crate::timestamp::Timestamp;

const WATERMARK_LEN: usize = 12;

/// Durable small-value register holding the timestamp watermark.
///
/// Stands in for the coordination service the authority persists its watermark to.
pub trait WatermarkStore: Send + Sync {
    /// Durably replace the stored watermark.
    fn store(&self, ts: Timestamp) -> TimestampResult<()>;

    /// Read the stored watermark, `None` if nothing was ever stored.
    fn load(&self) -> TimestampResult<Option<Timestamp>>;
}

/// Volatile watermark register, used by in-memory databases and tests.
#[derive(Debug, Default)]
pub struct MemoryWatermarkStore {
    value: Mutex<Option<Timestamp>>,
}

impl WatermarkStore for MemoryWatermarkStore {
    fn store(&self, ts: Timestamp) -> TimestampResult<()> {
        *self.value.lock() = Some(ts);
        Ok(())
    }

    fn load(&self) -> TimestampResult<Option<Timestamp>> {
        Ok(*self.value.lock())
    }
}

/// Watermark register backed by a single checksummed file.
///
/// Writes go to a sibling temp file which is synced and then renamed over the target, so a
/// crash leaves either the old or the new value in place.
#[derive(Debug)]
pub struct FileWatermarkStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileWatermarkStore {
    pub fn new<P: AsRef<Path>>(path: P) -> TimestampResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)
                .map_err(|e| TimestampError::WatermarkWrite(e.to_string()))?;
        }
        Ok(Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl WatermarkStore for FileWatermarkStore {
    fn store(&self, ts: Timestamp) -> TimestampResult<()> {
        let _guard = self.write_lock.lock();
        let payload = ts.to_be_bytes();
        let mut hasher = Hasher::new();
        hasher.update(&payload);
        let mut data = Vec::with_capacity(WATERMARK_LEN);
        data.extend_from_slice(&payload);
        data.extend_from_slice(&hasher.finalize().to_le_bytes());

        let temp = self.temp_path();
        let write = || -> std::io::Result<()> {
            let mut file = File::create(&temp)?;
            file.write_all(&data)?;
            file.sync_data()?;
            fs::rename(&temp, &self.path)
        };
        write().map_err(|e| TimestampError::WatermarkWrite(e.to_string()))
    }

    fn load(&self) -> TimestampResult<Option<Timestamp>> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(TimestampError::WatermarkRead(e.to_string())),
        };
        if data.len() != WATERMARK_LEN {
            return Err(TimestampError::CorruptWatermark(format!(
                "expected {WATERMARK_LEN} bytes, found {}",
                data.len()
            )));
        }
        let (payload, checksum) = data.split_at(8);
        let mut hasher = Hasher::new();
        hasher.update(payload);
        let mut crc = [0u8; 4];
        crc.copy_from_slice(checksum);
        if hasher.finalize() != u32::from_le_bytes(crc) {
            return Err(TimestampError::CorruptWatermark(
                "checksum mismatch".to_string(),
            ));
        }
        let mut raw = [0u8; 8];
        raw.copy_from_slice(payload);
        Ok(Some(Timestamp::from_be_bytes(raw)))
    }
}
