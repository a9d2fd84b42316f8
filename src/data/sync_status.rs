/// Progress and error state of the sync engine, shared with status readers
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::error;
use uuid::Uuid;

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStatus {
    pub fetching: bool,
    /// Last error seen; survives later successful runs until replaced
    pub error_message: String,
    pub status_text: String,
    pub run_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub total_minutes: i64,
    pub fetched_minutes: i64,
    #[serde(skip)]
    started_instant: Option<Instant>,
}

impl SyncStatus {
    pub fn remaining_minutes(&self) -> i64 {
        (self.total_minutes - self.fetched_minutes).max(0)
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.started_instant
            .map(|start| start.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }

    /// Seconds left at the average pace so far
    pub fn eta_secs(&self) -> i64 {
        if self.fetched_minutes <= 0 {
            return 0;
        }
        let avg_sec_per_minute = self.elapsed_secs() / self.fetched_minutes as f64;
        (avg_sec_per_minute * self.remaining_minutes() as f64) as i64
    }
}

/// Cloneable handle to the one status record of a sync engine
#[derive(Debug, Clone, Default)]
pub struct StatusHandle {
    inner: Arc<Mutex<SyncStatus>>,
}

impl StatusHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consistent copy of every field, taken under the lock
    pub async fn snapshot(&self) -> SyncStatus {
        self.inner.lock().await.clone()
    }

    pub(crate) async fn begin_run(&self, run_id: Uuid, status_text: String) {
        let mut status = self.inner.lock().await;
        status.fetching = true;
        status.run_id = Some(run_id);
        status.started_at = Some(Utc::now());
        status.started_instant = Some(Instant::now());
        status.total_minutes = 0;
        status.fetched_minutes = 0;
        status.status_text = status_text;
    }

    pub(crate) async fn plan(&self, total_minutes: i64) {
        let mut status = self.inner.lock().await;
        status.total_minutes = total_minutes;
        status.fetched_minutes = 0;
    }

    /// Record a completed chunk and refresh the progress text; returns the new text
    pub(crate) async fn chunk_done(&self, minutes: i64, source: &str) -> String {
        let mut status = self.inner.lock().await;
        status.fetched_minutes += minutes;
        let text = format!(
            "Fetching data via API: {}... {} minutes remaining (~{}s)",
            source,
            status.remaining_minutes(),
            status.eta_secs()
        );
        status.status_text = text.clone();
        text
    }

    pub(crate) async fn set_error(&self, message: String) {
        let mut status = self.inner.lock().await;
        status.error_message = format!("ERROR: {}", message);
        error!("{}", status.error_message);
    }

    /// End of run: stop fetching and clear the progress text; the error stays
    pub(crate) async fn end_run(&self) {
        let mut status = self.inner.lock().await;
        status.fetching = false;
        status.status_text.clear();
        status.started_instant = None;
    }
}
