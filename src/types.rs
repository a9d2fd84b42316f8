/// Core type definitions for the bar synchronizer
use serde::{Deserialize, Serialize};

use crate::utils::time::MINUTE_MS;

/// One minute of OHLCV data, keyed by its open time
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MinuteBar {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Open time in ms since epoch, an exact multiple of 60_000
    pub time: i64,
}

impl MinuteBar {
    pub fn is_minute_aligned(&self) -> bool {
        self.time % MINUTE_MS == 0
    }
}

/// OHLCV bar spanning several minutes, computed on read and never persisted
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AggregateBar {
    /// Time of the first constituent minute
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub minute_count: u32,
}

impl AggregateBar {
    pub fn open_with(bar: &MinuteBar) -> Self {
        AggregateBar {
            time: bar.time,
            open: bar.open,
            high: bar.high,
            low: bar.low,
            close: bar.close,
            volume: bar.volume,
            minute_count: 1,
        }
    }

    pub fn absorb(&mut self, bar: &MinuteBar) {
        self.high = self.high.max(bar.high);
        self.low = self.low.min(bar.low);
        self.close = bar.close;
        self.volume += bar.volume;
        self.minute_count += 1;
    }

    /// Absorbed at least one minute beyond its opening minute
    pub fn has_additional_data(&self) -> bool {
        self.minute_count > 1
    }
}

/// Configuration for the synchronizer and aggregation driver
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    // Market
    pub symbol: String,
    pub base_url: String,

    // Storage
    pub db_path: String,

    // Backfill
    pub lookback_days: i64,
    pub max_chunk_minutes: u32,
    pub chunk_delay_ms: u64,

    // Remote Calls
    pub request_timeout_secs: u64,
    pub requests_per_second: u32,

    // Scheduling
    pub sync_interval_secs: u64,
    pub refresh_interval_secs: u64,

    // Aggregation
    pub aggregate_timeframe: String,
    pub aggregate_bar_count: usize,

    // Logging
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            symbol: "BTCUSDT".to_string(),
            base_url: "https://api.binance.com".to_string(),
            db_path: "BTCUSDT.db".to_string(),
            lookback_days: 7,
            max_chunk_minutes: 1000,
            chunk_delay_ms: 3000,
            request_timeout_secs: 30,
            requests_per_second: 5,
            sync_interval_secs: 60,
            refresh_interval_secs: 5,
            aggregate_timeframe: "15m".to_string(),
            aggregate_bar_count: 300,
            log_level: "info".to_string(),
        }
    }
}
