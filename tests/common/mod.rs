#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

use barsync::broker::KlineSource;
use barsync::data::{BarStore, HistoricalSync, StoreKey, SyncSettings};
use barsync::utils::{truncate_to_minute, ManualClock, DAY_MS, MINUTE_MS};
use barsync::{BarSyncError, MinuteBar, Result};

/// 2024-01-15T10:30:00Z
pub const BASE: i64 = 1_705_314_600_000;

pub fn bar_at(time: i64) -> MinuteBar {
    let step = ((time / MINUTE_MS) % 1000) as f64;
    MinuteBar {
        open: 40_000.0 + step,
        high: 40_010.0 + step,
        low: 39_990.0 + step,
        close: 40_005.0 + step,
        volume: 1.5,
        time,
    }
}

/// Exchange stand-in serving a gapless minute series, with switches for faults
#[derive(Default)]
pub struct ScriptedSource {
    /// Earliest minute the market has data for
    pub listed_from: i64,
    /// Minute left out of every response
    pub gap_at: Mutex<Option<i64>>,
    /// Each call as (count, end_time_ms)
    pub calls: Mutex<Vec<(u32, i64)>>,
    pub call_times: Mutex<Vec<tokio::time::Instant>>,
    /// Number of upcoming calls answered with HTTP 503
    pub failures: AtomicUsize,
    pub latency: Option<Duration>,
    /// Raised on the first fetch
    pub cancel_on_fetch: Mutex<Option<Arc<AtomicBool>>>,
    /// When set, every fetch waits for a permit after signalling `entered`
    pub gate: Option<(Arc<Notify>, Arc<Notify>)>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls(&self) -> Vec<(u32, i64)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl KlineSource for ScriptedSource {
    async fn fetch(&self, count: u32, end_time_ms: i64) -> Result<Vec<MinuteBar>> {
        self.calls.lock().unwrap().push((count, end_time_ms));
        self.call_times.lock().unwrap().push(tokio::time::Instant::now());

        if let Some(flag) = self.cancel_on_fetch.lock().unwrap().take() {
            flag.store(true, Ordering::SeqCst);
        }
        if let Some((entered, release)) = &self.gate {
            entered.notify_one();
            release.notified().await;
        }
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(BarSyncError::HttpStatus {
                status: 503,
                body: "Service Unavailable".to_string(),
            });
        }

        let gap = *self.gap_at.lock().unwrap();
        let newest = truncate_to_minute(end_time_ms);
        let oldest = newest - (i64::from(count) - 1) * MINUTE_MS;
        Ok((0..i64::from(count))
            .map(|i| oldest + i * MINUTE_MS)
            .filter(|t| *t >= self.listed_from && Some(*t) != gap)
            .map(bar_at)
            .collect())
    }

    fn describe(&self) -> String {
        "scripted://klines".to_string()
    }
}

/// In-memory store with fault switches
#[derive(Default)]
pub struct MemoryStore {
    bars: Mutex<BTreeMap<i64, MinuteBar>>,
    watermark: Mutex<Option<i64>>,
    /// Every successful put, in order
    pub puts: Mutex<Vec<i64>>,
    /// Puts succeed until this many have been made
    pub fail_put_after: Mutex<Option<usize>>,
    pub fail_flush: AtomicBool,
    pub flushes: AtomicUsize,
    /// Keys whose reads fail as if the stored value were corrupt
    pub unreadable: Mutex<Vec<i64>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bars(times: impl IntoIterator<Item = i64>, watermark: Option<i64>) -> Self {
        let store = Self::default();
        {
            let mut bars = store.bars.lock().unwrap();
            for t in times {
                bars.insert(t, bar_at(t));
            }
        }
        *store.watermark.lock().unwrap() = watermark;
        store
    }

    pub fn minute_times(&self) -> Vec<i64> {
        self.bars.lock().unwrap().keys().copied().collect()
    }

    pub fn stored_watermark(&self) -> Option<i64> {
        *self.watermark.lock().unwrap()
    }

    pub fn puts(&self) -> Vec<i64> {
        self.puts.lock().unwrap().clone()
    }
}

#[async_trait]
impl BarStore for MemoryStore {
    async fn get(&self, timestamp_ms: i64) -> Result<Option<MinuteBar>> {
        if self.unreadable.lock().unwrap().contains(&timestamp_ms) {
            return Err(BarSyncError::StoreError(format!("corrupt value at {}", timestamp_ms)));
        }
        Ok(self.bars.lock().unwrap().get(&timestamp_ms).copied())
    }

    async fn put(&self, timestamp_ms: i64, bar: &MinuteBar) -> Result<()> {
        let mut puts = self.puts.lock().unwrap();
        if let Some(limit) = *self.fail_put_after.lock().unwrap() {
            if puts.len() >= limit {
                return Err(BarSyncError::StoreError("disk full".to_string()));
            }
        }
        self.bars.lock().unwrap().insert(timestamp_ms, *bar);
        puts.push(timestamp_ms);
        Ok(())
    }

    async fn watermark(&self) -> Result<Option<i64>> {
        Ok(*self.watermark.lock().unwrap())
    }

    async fn set_watermark(&self, timestamp_ms: i64) -> Result<()> {
        *self.watermark.lock().unwrap() = Some(timestamp_ms);
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        if self.fail_flush.load(Ordering::SeqCst) {
            return Err(BarSyncError::StoreError("fsync failed".to_string()));
        }
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<StoreKey>> {
        let mut keys: Vec<StoreKey> = self
            .bars
            .lock()
            .unwrap()
            .keys()
            .map(|t| StoreKey::Minute(*t))
            .collect();
        if self.watermark.lock().unwrap().is_some() {
            keys.push(StoreKey::Watermark);
        }
        Ok(keys)
    }
}

pub fn fast_settings() -> SyncSettings {
    SyncSettings {
        lookback_ms: 7 * DAY_MS,
        max_chunk_minutes: 1000,
        chunk_delay: Duration::ZERO,
        request_timeout: Duration::from_secs(5),
    }
}

pub fn engine(
    source: Arc<ScriptedSource>,
    store: Arc<dyn BarStore>,
    clock: Arc<ManualClock>,
    settings: SyncSettings,
) -> HistoricalSync {
    HistoricalSync::new(source, store, clock, settings)
}
