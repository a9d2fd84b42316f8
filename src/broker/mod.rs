pub mod binance;

pub use binance::BinanceClient;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::MinuteBar;

/// Remote source of consecutive 1-minute bars
#[async_trait]
pub trait KlineSource: Send + Sync {
    /// Up to `count` (1..=1000) bars whose newest `time <= end_time_ms`, ascending
    async fn fetch(&self, count: u32, end_time_ms: i64) -> Result<Vec<MinuteBar>>;

    /// Human-readable endpoint name for progress text
    fn describe(&self) -> String {
        "remote source".to_string()
    }
}
