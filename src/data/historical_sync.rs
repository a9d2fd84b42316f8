/// Incremental minute-bar backfill from the remote source into the bar store
///
/// A run works out which minutes are missing (everything after the watermark, or the
/// lookback window on an empty store), pulls them newest-first in chunks of at most
/// 1000 minutes, rejects any chunk that is not a gapless 60s sequence, and finally
/// writes the complete minutes in ascending order before moving the watermark.
///
/// Writes are at-least-once: a run that fails mid-persist leaves its earlier writes in
/// place but does not move the watermark, so the next run fetches and rewrites them.
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::broker::binance::MAX_KLINES_PER_REQUEST;
use crate::broker::KlineSource;
use crate::data::bar_store::BarStore;
use crate::data::sync_status::StatusHandle;
use crate::error::{BarSyncError, Result};
use crate::types::{Config, MinuteBar};
use crate::utils::time::{
    ceil_to_minute, format_ts, minutes_between, truncate_to_minute, Clock, DAY_MS, MINUTE_MS,
};

/// Tunables for one sync engine
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// History pulled when the store is empty
    pub lookback_ms: i64,
    pub max_chunk_minutes: u32,
    /// Pause between consecutive chunk requests
    pub chunk_delay: Duration,
    pub request_timeout: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            lookback_ms: 7 * DAY_MS,
            max_chunk_minutes: MAX_KLINES_PER_REQUEST,
            chunk_delay: Duration::from_secs(3),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl SyncSettings {
    pub fn from_config(config: &Config) -> Self {
        SyncSettings {
            lookback_ms: config.lookback_days * DAY_MS,
            max_chunk_minutes: config.max_chunk_minutes.clamp(1, MAX_KLINES_PER_REQUEST),
            chunk_delay: Duration::from_millis(config.chunk_delay_ms),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        }
    }
}

/// Summary of a run that fetched and persisted data
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub run_id: Uuid,
    pub start_ms: i64,
    pub end_ms: i64,
    pub minutes_requested: i64,
    pub chunks_fetched: usize,
    pub bars_fetched: usize,
    pub bars_written: usize,
    pub skipped_in_progress: usize,
    pub latest_timestamp: Option<i64>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
pub enum SyncOutcome {
    /// Nothing complete was missing; no remote call, no writes
    UpToDate,
    Completed(SyncReport),
    /// Another run held the single-flight flag; this call did nothing
    AlreadyRunning,
}

impl SyncOutcome {
    pub fn bars_written(&self) -> usize {
        match self {
            SyncOutcome::Completed(report) => report.bars_written,
            _ => 0,
        }
    }
}

/// Planned backfill for one run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncRange {
    pub start_ms: i64,
    pub end_ms: i64,
    /// Minutes to request, the in-progress minute at `end_ms` included
    pub minutes: i64,
}

/// Work out the backfill range.
///
/// `watermark` is `None` when the store holds no watermark yet. Returns `None` when
/// there is no complete minute to fetch.
pub fn plan_range(now_ms: i64, watermark: Option<i64>, lookback_ms: i64) -> Option<SyncRange> {
    let end_ms = now_ms;
    let start_ms = match watermark {
        Some(latest) => latest + MINUTE_MS,
        None => end_ms - lookback_ms,
    };
    if start_ms > end_ms {
        return None;
    }

    let first_minute = ceil_to_minute(start_ms);
    let current_minute = truncate_to_minute(end_ms);
    if first_minute >= current_minute {
        return None;
    }

    // The remote's newest bar is the in-progress minute, so it is counted too;
    // otherwise the oldest wanted minute would fall off the last chunk.
    let minutes = minutes_between(first_minute, current_minute) + 1;
    Some(SyncRange {
        start_ms,
        end_ms,
        minutes,
    })
}

/// Every bar must sit exactly one minute after the previous one
pub fn check_continuity(bars: &[MinuteBar]) -> Result<()> {
    let Some(first) = bars.first() else {
        return Ok(());
    };
    if !first.is_minute_aligned() {
        return Err(BarSyncError::InvalidBarData(format!(
            "bar time {} is not on a minute boundary",
            first.time
        )));
    }

    let mut expected = first.time;
    for bar in bars {
        if bar.time != expected {
            return Err(BarSyncError::ContinuityBroken {
                at: format_ts(expected),
                expected,
                actual: bar.time,
            });
        }
        expected += MINUTE_MS;
    }
    Ok(())
}

/// Error plus the human context recorded into the status
struct RunFailure {
    context: String,
    error: BarSyncError,
}

type RunResult<T> = std::result::Result<T, RunFailure>;

trait RunContext<T> {
    fn during<F: FnOnce() -> String>(self, context: F) -> RunResult<T>;
}

impl<T> RunContext<T> for Result<T> {
    fn during<F: FnOnce() -> String>(self, context: F) -> RunResult<T> {
        self.map_err(|error| RunFailure {
            context: context(),
            error,
        })
    }
}

/// Clears the single-flight flag when the run ends, however it ends
struct RunGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunGuard { flag })
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

pub struct HistoricalSync {
    source: Arc<dyn KlineSource>,
    store: Arc<dyn BarStore>,
    clock: Arc<dyn Clock>,
    settings: SyncSettings,
    status: StatusHandle,
    running: AtomicBool,
    cancel_flag: Arc<AtomicBool>,
}

impl HistoricalSync {
    pub fn new(
        source: Arc<dyn KlineSource>,
        store: Arc<dyn BarStore>,
        clock: Arc<dyn Clock>,
        settings: SyncSettings,
    ) -> Self {
        HistoricalSync {
            source,
            store,
            clock,
            settings,
            status: StatusHandle::new(),
            running: AtomicBool::new(false),
            cancel_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle for status readers
    pub fn status(&self) -> StatusHandle {
        self.status.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Request cancellation of the current run
    pub fn cancel(&self) {
        self.cancel_flag.store(true, Ordering::Release);
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel_flag)
    }

    fn is_cancelled(&self) -> bool {
        self.cancel_flag.load(Ordering::Acquire)
    }

    /// Bring the store up to the last complete minute.
    ///
    /// At most one run executes at a time; an overlapping call returns
    /// `SyncOutcome::AlreadyRunning` without touching the store.
    pub async fn synchronize(&self) -> Result<SyncOutcome> {
        let Some(_guard) = RunGuard::acquire(&self.running) else {
            debug!("Sync already in progress, skipping trigger");
            return Ok(SyncOutcome::AlreadyRunning);
        };
        self.cancel_flag.store(false, Ordering::Release);

        let run_id = Uuid::new_v4();
        let span = info_span!("sync", %run_id);

        async move {
            self.status
                .begin_run(
                    run_id,
                    format!("Fetching data via API: {}...", self.source.describe()),
                )
                .await;

            let result = self.run(run_id).await;
            if let Err(failure) = &result {
                self.status
                    .set_error(format!("{}: {}", failure.context, failure.error))
                    .await;
            }
            self.status.end_run().await;

            match result {
                Ok(outcome) => {
                    if let SyncOutcome::Completed(report) = &outcome {
                        info!(
                            "Sync finished: {} bars written, watermark {:?}, {}ms",
                            report.bars_written, report.latest_timestamp, report.duration_ms
                        );
                    }
                    Ok(outcome)
                }
                Err(failure) => Err(failure.error),
            }
        }
        .instrument(span)
        .await
    }

    async fn run(&self, run_id: Uuid) -> RunResult<SyncOutcome> {
        let started = Instant::now();

        let empty = self
            .store
            .is_empty()
            .await
            .during(|| "failed to check if DB is empty".to_string())?;

        let watermark = if empty {
            None
        } else {
            let latest = self
                .store
                .watermark()
                .await
                .during(|| "failed to get latest timestamp".to_string())?;
            if latest.is_none() {
                warn!("Store has bars but no latest timestamp, backfilling the full lookback");
            }
            latest
        };

        let now = self.clock.now_ms();
        let Some(range) = plan_range(now, watermark, self.settings.lookback_ms) else {
            debug!("Store is up to date (watermark {:?})", watermark);
            return Ok(SyncOutcome::UpToDate);
        };

        info!(
            "Backfilling {} minutes from {} to {}",
            range.minutes,
            format_ts(range.start_ms),
            format_ts(range.end_ms)
        );
        self.status.plan(range.minutes).await;

        let (accumulated, chunks_fetched) = self.fetch_range(&range).await?;
        let bars_fetched = accumulated.len();

        if self.is_cancelled() {
            return Err(RunFailure {
                context: "sync stopped before persisting".to_string(),
                error: BarSyncError::Cancelled(format!("{} bars discarded", bars_fetched)),
            });
        }

        // Bars from the minute that was still open at fetch time are never final
        let boundary = truncate_to_minute(self.clock.now_ms()).min(truncate_to_minute(range.end_ms));
        let (written, skipped_in_progress, latest) =
            self.persist(&accumulated, range.start_ms, boundary).await?;

        if let Some(latest) = latest {
            self.store
                .set_watermark(latest)
                .await
                .during(|| "failed to update latest timestamp".to_string())?;
        }

        self.store
            .flush()
            .await
            .during(|| "failed to sync database".to_string())?;

        Ok(SyncOutcome::Completed(SyncReport {
            run_id,
            start_ms: range.start_ms,
            end_ms: range.end_ms,
            minutes_requested: range.minutes,
            chunks_fetched,
            bars_fetched,
            bars_written: written,
            skipped_in_progress,
            latest_timestamp: latest,
            duration_ms: started.elapsed().as_millis() as u64,
        }))
    }

    /// Walk backwards from `range.end_ms` chunk by chunk; returns bars oldest-first
    async fn fetch_range(&self, range: &SyncRange) -> RunResult<(Vec<MinuteBar>, usize)> {
        let max_chunk = i64::from(self.settings.max_chunk_minutes.clamp(1, MAX_KLINES_PER_REQUEST));
        let mut chunks: Vec<Vec<MinuteBar>> = Vec::new();
        let mut remaining = range.minutes;
        let mut current_end = range.end_ms;

        while remaining > 0 {
            if self.is_cancelled() {
                return Err(RunFailure {
                    context: format!("sync stopped with {} minutes remaining", remaining),
                    error: BarSyncError::Cancelled("cancel requested".to_string()),
                });
            }
            if !chunks.is_empty() && !self.settings.chunk_delay.is_zero() {
                tokio::time::sleep(self.settings.chunk_delay).await;
            }

            let fetch_minutes = remaining.min(max_chunk);
            let data = self
                .fetch_chunk(fetch_minutes as u32, current_end)
                .await
                .during(|| format!("failed to fetch data ending at {}", current_end))?;

            if let (Some(first), Some(last)) = (data.first(), data.last()) {
                let (chunk_start, chunk_end) = (first.time, last.time);
                check_continuity(&data).during(|| {
                    format!(
                        "continuity check failed for chunk {} to {}",
                        chunk_start, chunk_end
                    )
                })?;
            }

            let progress = self
                .status
                .chunk_done(fetch_minutes, &self.source.describe())
                .await;
            debug!(
                "Chunk of {} bars ending {}: {}",
                data.len(),
                format_ts(current_end),
                progress
            );

            remaining -= fetch_minutes;
            current_end = match data.first() {
                Some(first) => first.time - MINUTE_MS,
                None => {
                    warn!("Empty chunk ending at {}", format_ts(current_end));
                    current_end - fetch_minutes * MINUTE_MS
                }
            };
            chunks.push(data);
        }

        let chunk_count = chunks.len();
        // Chunks arrived newest-first
        let accumulated: Vec<MinuteBar> = chunks.into_iter().rev().flatten().collect();
        Ok((accumulated, chunk_count))
    }

    async fn fetch_chunk(&self, count: u32, end_ms: i64) -> Result<Vec<MinuteBar>> {
        let timeout = self.settings.request_timeout;
        match tokio::time::timeout(timeout, self.source.fetch(count, end_ms)).await {
            Ok(result) => result,
            Err(_) => Err(BarSyncError::NetworkTimeout(format!(
                "no response within {:?}",
                timeout
            ))),
        }
    }

    /// Write complete minutes at or after `start_ms`, ascending
    async fn persist(
        &self,
        bars: &[MinuteBar],
        start_ms: i64,
        boundary: i64,
    ) -> RunResult<(usize, usize, Option<i64>)> {
        let mut written = 0usize;
        let mut skipped_in_progress = 0usize;
        let mut latest: Option<i64> = None;

        for bar in bars {
            if bar.time >= boundary {
                skipped_in_progress += 1;
                continue;
            }
            if bar.time < start_ms {
                continue;
            }

            self.store
                .put(bar.time, bar)
                .await
                .during(|| format!("failed to store data at {}", bar.time))?;
            written += 1;
            latest = Some(latest.map_or(bar.time, |l| l.max(bar.time)));
        }

        debug!(
            "Persisted {} bars, skipped {} in-progress",
            written, skipped_in_progress
        );
        Ok((written, skipped_in_progress, latest))
    }
}

/// Run `synchronize()` now and then every `interval` until `shutdown` flips to true
pub fn spawn_periodic_sync(
    engine: Arc<HistoricalSync>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        info!("Shutdown channel closed, periodic sync stopping");
                        break;
                    }
                }
            }
            if *shutdown.borrow() {
                info!("Periodic sync stopping");
                break;
            }

            match engine.synchronize().await {
                Ok(SyncOutcome::Completed(report)) => {
                    info!("Periodic sync wrote {} bars", report.bars_written)
                }
                Ok(_) => {}
                Err(e) => error!("Periodic sync failed: {} ({})", e, e.error_code()),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minute(time: i64) -> MinuteBar {
        MinuteBar {
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 3.0,
            time,
        }
    }

    const T0: i64 = 1_705_314_600_000; // 2024-01-15T10:30:00Z

    #[test]
    fn test_continuity_accepts_gapless_chunk() {
        let bars: Vec<MinuteBar> = (0..5).map(|i| minute(T0 + i * MINUTE_MS)).collect();
        assert!(check_continuity(&bars).is_ok());
        assert!(check_continuity(&[]).is_ok());
    }

    #[test]
    fn test_continuity_reports_first_gap() {
        let bars = vec![minute(T0), minute(T0 + MINUTE_MS), minute(T0 + 3 * MINUTE_MS)];
        match check_continuity(&bars) {
            Err(BarSyncError::ContinuityBroken { expected, actual, .. }) => {
                assert_eq!(expected, T0 + 2 * MINUTE_MS);
                assert_eq!(actual, T0 + 3 * MINUTE_MS);
            }
            other => panic!("expected continuity error, got {:?}", other),
        }
    }

    #[test]
    fn test_continuity_rejects_reorder_and_misalignment() {
        let reordered = vec![minute(T0 + MINUTE_MS), minute(T0)];
        assert!(check_continuity(&reordered).is_err());

        let misaligned = vec![minute(T0 + 1)];
        assert!(matches!(
            check_continuity(&misaligned),
            Err(BarSyncError::InvalidBarData(_))
        ));
    }

    #[test]
    fn test_plan_range_empty_store() {
        let now = T0 + 30_000;
        let range = plan_range(now, None, 7 * DAY_MS).unwrap();
        assert_eq!(range.start_ms, now - 7 * DAY_MS);
        assert_eq!(range.end_ms, now);
        // 10079 complete minutes plus the open one
        assert_eq!(range.minutes, 7 * 24 * 60);

        let aligned = plan_range(T0, None, 7 * DAY_MS).unwrap();
        assert_eq!(aligned.minutes, 7 * 24 * 60 + 1);
    }

    #[test]
    fn test_plan_range_resume() {
        let now = T0 + 30_000;
        let range = plan_range(now, Some(T0 - 3 * MINUTE_MS), 7 * DAY_MS).unwrap();
        assert_eq!(range.start_ms, T0 - 2 * MINUTE_MS);
        assert_eq!(range.minutes, 3);

        // Only the open minute is newer than the watermark
        assert_eq!(plan_range(now, Some(T0 - MINUTE_MS), 7 * DAY_MS), None);
        // Watermark ahead of the clock
        assert_eq!(plan_range(now, Some(T0 + 5 * MINUTE_MS), 7 * DAY_MS), None);
    }

    #[test]
    fn test_run_guard_is_single_flight() {
        let flag = AtomicBool::new(false);
        let first = RunGuard::acquire(&flag);
        assert!(first.is_some());
        assert!(RunGuard::acquire(&flag).is_none());
        drop(first);
        assert!(RunGuard::acquire(&flag).is_some());
    }
}
