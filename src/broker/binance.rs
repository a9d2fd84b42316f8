/// Binance public REST client for 1-minute klines
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use crate::broker::KlineSource;
use crate::error::{BarSyncError, Result};
use crate::types::{Config, MinuteBar};
use crate::utils::{format_ts, RateLimiter};

pub const DEFAULT_BASE_URL: &str = "https://api.binance.com";
const KLINES_PATH: &str = "/api/v3/klines";
pub const MAX_KLINES_PER_REQUEST: u32 = 1000;

/// Binance spot kline client (public endpoint, no credentials)
pub struct BinanceClient {
    client: Client,
    base_url: String,
    symbol: String,
    rate_limiter: RateLimiter,
}

impl BinanceClient {
    pub fn new(
        base_url: impl Into<String>,
        symbol: impl Into<String>,
        timeout: Duration,
        requests_per_second: u32,
    ) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(BinanceClient {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            symbol: symbol.into(),
            rate_limiter: RateLimiter::new(requests_per_second),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(
            config.base_url.clone(),
            config.symbol.clone(),
            Duration::from_secs(config.request_timeout_secs),
            config.requests_per_second,
        )
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }
}

#[async_trait]
impl KlineSource for BinanceClient {
    async fn fetch(&self, count: u32, end_time_ms: i64) -> Result<Vec<MinuteBar>> {
        if count == 0 || count > MAX_KLINES_PER_REQUEST {
            return Err(BarSyncError::InvalidParameter(format!(
                "kline count {} outside 1..={}",
                count, MAX_KLINES_PER_REQUEST
            )));
        }

        self.rate_limiter.acquire().await;

        debug!(
            "Fetching {} klines for {} ending {} ({})",
            count,
            self.symbol,
            format_ts(end_time_ms),
            end_time_ms
        );

        let response = self
            .client
            .get(format!("{}{}", self.base_url, KLINES_PATH))
            .query(&[
                ("symbol", self.symbol.clone()),
                ("interval", "1m".to_string()),
                ("limit", count.to_string()),
                ("endTime", end_time_ms.to_string()),
            ])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    BarSyncError::NetworkTimeout(e.to_string())
                } else {
                    BarSyncError::HttpError(e)
                }
            })?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(BarSyncError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }

        let bars = parse_klines(&body)?;
        debug!("Fetched {} klines", bars.len());
        Ok(bars)
    }

    fn describe(&self) -> String {
        format!("{}{}", self.base_url, KLINES_PATH)
    }
}

/// Parse the array-of-arrays kline payload.
///
/// Each entry is `[openTime, "open", "high", "low", "close", "volume", closeTime, ...]`.
/// Entries with fewer than six fields are skipped; anything unparseable in the
/// first six fields fails the whole response.
pub fn parse_klines(body: &str) -> Result<Vec<MinuteBar>> {
    let rows: Vec<Vec<Value>> = serde_json::from_str(body)
        .map_err(|e| BarSyncError::MalformedResponse(format!("kline payload: {}", e)))?;

    let mut bars = Vec::with_capacity(rows.len());
    for (idx, row) in rows.iter().enumerate() {
        if row.len() < 6 {
            warn!("Skipping malformed kline #{} with {} fields", idx, row.len());
            continue;
        }

        let time = row[0].as_i64().ok_or_else(|| {
            BarSyncError::MalformedResponse(format!("kline #{} open time: {}", idx, row[0]))
        })?;

        bars.push(MinuteBar {
            time,
            open: decimal_field(&row[1], idx, "open")?,
            high: decimal_field(&row[2], idx, "high")?,
            low: decimal_field(&row[3], idx, "low")?,
            close: decimal_field(&row[4], idx, "close")?,
            volume: decimal_field(&row[5], idx, "volume")?,
        });
    }

    Ok(bars)
}

fn decimal_field(value: &Value, idx: usize, name: &str) -> Result<f64> {
    let parsed = match value {
        Value::String(s) => s.parse::<f64>().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    };
    parsed.ok_or_else(|| {
        BarSyncError::MalformedResponse(format!("kline #{} {}: {}", idx, name, value))
    })
}
