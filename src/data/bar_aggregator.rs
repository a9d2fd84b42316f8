/// Fold stored minute bars into fixed-duration bars on demand
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::data::bar_store::BarStore;
use crate::error::{BarSyncError, Result};
use crate::types::{AggregateBar, MinuteBar};
use crate::utils::time::{ceil_to_minute, floor_to, format_ts, Clock, MINUTE_MS};

/// Timeframe for bar aggregation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timeframe {
    OneMinute,
    FiveMinute,
    FifteenMinute,
    ThirtyMinute,
    OneHour,
    FourHour,
    OneDay,
}

impl Timeframe {
    pub fn as_str(&self) -> &str {
        match self {
            Timeframe::OneMinute => "1m",
            Timeframe::FiveMinute => "5m",
            Timeframe::FifteenMinute => "15m",
            Timeframe::ThirtyMinute => "30m",
            Timeframe::OneHour => "1h",
            Timeframe::FourHour => "4h",
            Timeframe::OneDay => "1d",
        }
    }

    pub fn duration_minutes(&self) -> i64 {
        match self {
            Timeframe::OneMinute => 1,
            Timeframe::FiveMinute => 5,
            Timeframe::FifteenMinute => 15,
            Timeframe::ThirtyMinute => 30,
            Timeframe::OneHour => 60,
            Timeframe::FourHour => 240,
            Timeframe::OneDay => 1440, // 24 * 60
        }
    }

    pub fn duration_ms(&self) -> i64 {
        self.duration_minutes() * MINUTE_MS
    }
}

impl FromStr for Timeframe {
    type Err = BarSyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "1m" => Ok(Timeframe::OneMinute),
            "5m" => Ok(Timeframe::FiveMinute),
            "15m" => Ok(Timeframe::FifteenMinute),
            "30m" => Ok(Timeframe::ThirtyMinute),
            "1h" => Ok(Timeframe::OneHour),
            "4h" => Ok(Timeframe::FourHour),
            "1d" => Ok(Timeframe::OneDay),
            other => Err(BarSyncError::InvalidParameter(format!(
                "unknown timeframe '{}'",
                other
            ))),
        }
    }
}

/// Fold ascending minute bars into `window_ms` bars.
///
/// A bar is closed once a minute at or past `bar.time + window_ms` arrives. A closed
/// bar holding only its opening minute is dropped; the last bar is kept if it has
/// more than one minute or if nothing else was emitted.
pub fn fold_minutes(minutes: &[MinuteBar], window_ms: i64) -> Vec<AggregateBar> {
    let mut result = Vec::new();
    let mut current: Option<AggregateBar> = None;

    for minute in minutes {
        match current.as_mut() {
            Some(bar) if minute.time < bar.time + window_ms => bar.absorb(minute),
            _ => {
                if let Some(done) = current.take() {
                    if done.has_additional_data() {
                        result.push(done);
                    }
                }
                current = Some(AggregateBar::open_with(minute));
            }
        }
    }

    if let Some(last) = current {
        if last.has_additional_data() || result.is_empty() {
            result.push(last);
        }
    }

    result
}

/// Read-only view over the bar store producing aggregate bars
pub struct BarAggregator {
    store: Arc<dyn BarStore>,
    clock: Arc<dyn Clock>,
}

impl BarAggregator {
    pub fn new(store: Arc<dyn BarStore>, clock: Arc<dyn Clock>) -> Self {
        BarAggregator { store, clock }
    }

    /// The last `window_bar_count` windows of `timeframe`, oldest first
    pub async fn aggregate(
        &self,
        window_bar_count: usize,
        timeframe: Timeframe,
    ) -> Result<Vec<AggregateBar>> {
        self.aggregate_window(window_bar_count, timeframe.duration_ms())
            .await
    }

    pub async fn aggregate_window(
        &self,
        window_bar_count: usize,
        window_ms: i64,
    ) -> Result<Vec<AggregateBar>> {
        if window_bar_count == 0 || window_ms <= 0 || window_ms % MINUTE_MS != 0 {
            return Err(BarSyncError::InvalidParameter(format!(
                "aggregation window {} x {}ms",
                window_bar_count, window_ms
            )));
        }

        let end_ms = self.clock.now_ms();
        let start_ms = floor_to(end_ms - window_bar_count as i64 * window_ms, window_ms);
        let mut key = ceil_to_minute(start_ms);

        let mut minutes = Vec::new();
        while key < end_ms {
            match self.store.get(key).await {
                Ok(Some(bar)) => minutes.push(bar),
                Ok(None) => debug!("No bar stored for {}", format_ts(key)),
                Err(e) => warn!("Skipping unreadable bar at {}: {}", format_ts(key), e),
            }
            key += MINUTE_MS;
        }

        if minutes.is_empty() {
            return Err(BarSyncError::NoDataInRange { start_ms, end_ms });
        }

        let bars = fold_minutes(&minutes, window_ms);
        debug!(
            "Aggregated {} minutes into {} bars of {}ms",
            minutes.len(),
            bars.len(),
            window_ms
        );
        Ok(bars)
    }
}
