/// Minute bar storage - in-memory index (BTreeMap) + append-only JSONL log (disk)
///
/// Each minute lives under the 8-byte big-endian
/// encoding of its open time, and the watermark lives under the reserved ASCII key
/// `latest_timestamp`. The two key spaces differ in length, so they cannot collide.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{BarSyncError, Result};
use crate::types::MinuteBar;
use crate::utils::time::MINUTE_MS;

pub const WATERMARK_KEY: &[u8] = b"latest_timestamp";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StoreKey {
    Minute(i64),
    Watermark,
}

impl StoreKey {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            StoreKey::Minute(ts) => ts.to_be_bytes().to_vec(),
            StoreKey::Watermark => WATERMARK_KEY.to_vec(),
        }
    }

    pub fn decode(bytes: &[u8]) -> Option<StoreKey> {
        if bytes == WATERMARK_KEY {
            return Some(StoreKey::Watermark);
        }
        let raw: [u8; 8] = bytes.try_into().ok()?;
        Some(StoreKey::Minute(i64::from_be_bytes(raw)))
    }
}

pub fn encode_bar(bar: &MinuteBar) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(bar)?)
}

pub fn decode_bar(bytes: &[u8]) -> Result<MinuteBar> {
    Ok(serde_json::from_slice(bytes)?)
}

fn decode_watermark(bytes: &[u8]) -> Result<i64> {
    let raw: [u8; 8] = bytes.try_into().map_err(|_| {
        BarSyncError::StoreError(format!(
            "watermark value has {} bytes, expected 8",
            bytes.len()
        ))
    })?;
    Ok(i64::from_be_bytes(raw))
}

/// Durable minute-keyed map plus the watermark
///
/// Single writer (the sync engine), any number of readers.
#[async_trait]
pub trait BarStore: Send + Sync {
    async fn get(&self, timestamp_ms: i64) -> Result<Option<MinuteBar>>;

    async fn put(&self, timestamp_ms: i64, bar: &MinuteBar) -> Result<()>;

    async fn watermark(&self) -> Result<Option<i64>>;

    async fn set_watermark(&self, timestamp_ms: i64) -> Result<()>;

    /// Push everything written so far to stable storage
    async fn flush(&self) -> Result<()>;

    /// Snapshot of every key currently stored, minute keys ascending
    async fn keys(&self) -> Result<Vec<StoreKey>>;

    async fn is_empty(&self) -> Result<bool> {
        Ok(self.keys().await?.is_empty())
    }
}

/// One line of the on-disk log
#[derive(Debug, Serialize, Deserialize)]
struct LogRecord {
    key: String,
    value: String,
}

struct StoreInner {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
    writer: BufWriter<File>,
    pending_writes: usize,
}

/// Log-structured bar store: every put is appended to a JSONL file and mirrored
/// into memory; the log is replayed on open, later records winning.
pub struct FileBarStore {
    path: PathBuf,
    inner: RwLock<StoreInner>,
}

impl FileBarStore {
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let (entries, needs_newline) = Self::replay(&path).await?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let mut writer = BufWriter::new(file);

        // Terminate a torn final line so the next record starts clean
        if needs_newline {
            writer.write_all(b"\n").await?;
            writer.flush().await?;
        }

        info!(
            "Opened bar store {} with {} keys",
            path.display(),
            entries.len()
        );

        Ok(FileBarStore {
            path,
            inner: RwLock::new(StoreInner {
                entries,
                writer,
                pending_writes: 0,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of minute records (the watermark is not counted)
    pub async fn minute_count(&self) -> usize {
        let inner = self.inner.read().await;
        inner
            .entries
            .keys()
            .filter(|k| k.as_slice() != WATERMARK_KEY)
            .count()
    }

    /// Rewrite the log with exactly one line per live key
    pub async fn compact(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.writer.flush().await?;

        let tmp_path = self.path.with_extension("compact");
        {
            let tmp = File::create(&tmp_path).await?;
            let mut tmp_writer = BufWriter::new(tmp);
            for (key, value) in &inner.entries {
                tmp_writer.write_all(&Self::encode_line(key, value)?).await?;
            }
            tmp_writer.flush().await?;
            tmp_writer.get_ref().sync_all().await?;
        }
        tokio::fs::rename(&tmp_path, &self.path).await?;

        let file = OpenOptions::new().append(true).open(&self.path).await?;
        inner.writer = BufWriter::new(file);
        inner.pending_writes = 0;

        info!(
            "Compacted bar store {} to {} keys",
            self.path.display(),
            inner.entries.len()
        );
        Ok(())
    }

    async fn replay(path: &Path) -> Result<(BTreeMap<Vec<u8>, Vec<u8>>, bool)> {
        let mut entries = BTreeMap::new();
        if !path.exists() {
            debug!("No existing store file at {}", path.display());
            return Ok((entries, false));
        }

        let content = tokio::fs::read_to_string(path).await?;
        let needs_newline = !content.is_empty() && !content.ends_with('\n');

        let mut skipped = 0usize;
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match Self::decode_line(line) {
                Some((key, value)) => {
                    entries.insert(key, value);
                }
                None => skipped += 1,
            }
        }

        if skipped > 0 {
            warn!(
                "Skipped {} unreadable records while loading {}",
                skipped,
                path.display()
            );
        }

        Ok((entries, needs_newline))
    }

    fn encode_line(key: &[u8], value: &[u8]) -> Result<Vec<u8>> {
        let record = LogRecord {
            key: hex::encode(key),
            value: hex::encode(value),
        };
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        Ok(line)
    }

    fn decode_line(line: &str) -> Option<(Vec<u8>, Vec<u8>)> {
        let record: LogRecord = serde_json::from_str(line).ok()?;
        let key = hex::decode(&record.key).ok()?;
        let value = hex::decode(&record.value).ok()?;
        Some((key, value))
    }

    async fn write_entry(&self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        let line = Self::encode_line(&key, &value)?;

        let mut inner = self.inner.write().await;
        inner.writer.write_all(&line).await?;
        inner.entries.insert(key, value);
        inner.pending_writes += 1;
        Ok(())
    }
}

#[async_trait]
impl BarStore for FileBarStore {
    async fn get(&self, timestamp_ms: i64) -> Result<Option<MinuteBar>> {
        let key = StoreKey::Minute(timestamp_ms).encode();
        let inner = self.inner.read().await;
        match inner.entries.get(&key) {
            Some(value) => Ok(Some(decode_bar(value)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, timestamp_ms: i64, bar: &MinuteBar) -> Result<()> {
        if timestamp_ms <= 0 || timestamp_ms % MINUTE_MS != 0 {
            return Err(BarSyncError::InvalidBarData(format!(
                "minute key {} is not a positive minute boundary",
                timestamp_ms
            )));
        }
        if bar.time != timestamp_ms {
            return Err(BarSyncError::InvalidBarData(format!(
                "bar time {} does not match key {}",
                bar.time, timestamp_ms
            )));
        }

        self.write_entry(StoreKey::Minute(timestamp_ms).encode(), encode_bar(bar)?)
            .await
    }

    async fn watermark(&self) -> Result<Option<i64>> {
        let inner = self.inner.read().await;
        match inner.entries.get(WATERMARK_KEY) {
            Some(value) => Ok(Some(decode_watermark(value)?)),
            None => Ok(None),
        }
    }

    async fn set_watermark(&self, timestamp_ms: i64) -> Result<()> {
        self.write_entry(WATERMARK_KEY.to_vec(), timestamp_ms.to_be_bytes().to_vec())
            .await
    }

    async fn flush(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.writer.flush().await?;
        inner.writer.get_ref().sync_all().await?;

        debug!(
            "Flushed {} pending writes to {}",
            inner.pending_writes,
            self.path.display()
        );
        inner.pending_writes = 0;
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<StoreKey>> {
        let inner = self.inner.read().await;
        let mut keys: Vec<StoreKey> = inner
            .entries
            .keys()
            .filter_map(|k| StoreKey::decode(k))
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn is_empty(&self) -> Result<bool> {
        let inner = self.inner.read().await;
        Ok(inner.entries.is_empty())
    }
}
