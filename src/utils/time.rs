/// Time utilities for minute-keyed market data
use chrono::{DateTime, SecondsFormat, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

pub const MINUTE_MS: i64 = 60 * 1000;
pub const DAY_MS: i64 = 24 * 60 * MINUTE_MS;

/// Source of "now" for both engines
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// Wall clock, UTC
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Settable clock for deterministic runs and tests
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(now_ms: i64) -> Self {
        ManualClock {
            now_ms: AtomicI64::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: i64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Floor `ts_ms` to a multiple of `step_ms` (handles pre-epoch values too)
pub fn floor_to(ts_ms: i64, step_ms: i64) -> i64 {
    ts_ms.div_euclid(step_ms) * step_ms
}

/// Start of the minute containing `ts_ms`
pub fn truncate_to_minute(ts_ms: i64) -> i64 {
    floor_to(ts_ms, MINUTE_MS)
}

/// First minute boundary at or after `ts_ms`
pub fn ceil_to_minute(ts_ms: i64) -> i64 {
    -floor_to(-ts_ms, MINUTE_MS)
}

/// Whole minutes in `[start_ms, end_ms)`, zero if the range is empty
pub fn minutes_between(start_ms: i64, end_ms: i64) -> i64 {
    if end_ms <= start_ms {
        return 0;
    }
    (end_ms - start_ms) / MINUTE_MS
}

pub fn to_datetime(ts_ms: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ts_ms)
}

/// RFC 3339 rendering used in log lines and error messages
pub fn format_ts(ts_ms: i64) -> String {
    match to_datetime(ts_ms) {
        Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Secs, true),
        None => format!("{}ms", ts_ms),
    }
}
