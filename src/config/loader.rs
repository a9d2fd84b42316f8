/// Configuration loading from TOML file
use std::path::Path;
use tracing::{info, warn};

use crate::data::Timeframe;
use crate::error::{BarSyncError, Result};
use crate::types::Config;

pub const DEFAULT_CONFIG_PATH: &str = "barsync.toml";
/// Overrides the config file location
pub const CONFIG_ENV_VAR: &str = "BARSYNC_CONFIG";

/// Load and validate the config file; a missing file yields the defaults
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();

    let config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BarSyncError::ConfigError(format!("Failed to read config file: {}", e)))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| BarSyncError::ConfigError(format!("Failed to parse config: {}", e)))?;
        info!("Configuration loaded from {}", path.display());
        config
    } else {
        warn!("Config file {} not found, using defaults", path.display());
        Config::default()
    };

    validate_config(&config)?;

    Ok(config)
}

pub fn validate_config(config: &Config) -> Result<()> {
    if config.symbol.trim().is_empty() {
        return Err(BarSyncError::ConfigError("symbol is empty".to_string()));
    }

    if !config.base_url.starts_with("http://") && !config.base_url.starts_with("https://") {
        return Err(BarSyncError::ConfigError(format!(
            "Invalid base_url: {}",
            config.base_url
        )));
    }

    if config.db_path.trim().is_empty() {
        return Err(BarSyncError::ConfigError("db_path is empty".to_string()));
    }

    if config.lookback_days <= 0 {
        return Err(BarSyncError::ConfigError(format!(
            "Invalid lookback_days: {}",
            config.lookback_days
        )));
    }

    // The kline endpoint serves at most 1000 bars per call
    if config.max_chunk_minutes == 0 || config.max_chunk_minutes > 1000 {
        return Err(BarSyncError::ConfigError(format!(
            "max_chunk_minutes must be in 1..=1000, got {}",
            config.max_chunk_minutes
        )));
    }

    if config.request_timeout_secs == 0 {
        return Err(BarSyncError::ConfigError("request_timeout_secs must be > 0".to_string()));
    }

    if config.requests_per_second == 0 {
        return Err(BarSyncError::ConfigError("requests_per_second must be > 0".to_string()));
    }

    if config.sync_interval_secs == 0 || config.refresh_interval_secs == 0 {
        return Err(BarSyncError::ConfigError("intervals must be > 0".to_string()));
    }

    config.aggregate_timeframe.parse::<Timeframe>().map_err(|e| {
        BarSyncError::ConfigError(format!("Invalid aggregate_timeframe: {}", e))
    })?;

    if config.aggregate_bar_count == 0 {
        return Err(BarSyncError::ConfigError("aggregate_bar_count must be > 0".to_string()));
    }

    Ok(())
}
