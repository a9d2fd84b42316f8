/// Standalone utility: run one synchronization pass and exit
/// Usage: cargo run --bin sync_once --release
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use barsync::broker::BinanceClient;
use barsync::config::{load_config, CONFIG_ENV_VAR, DEFAULT_CONFIG_PATH};
use barsync::data::{FileBarStore, HistoricalSync, SyncOutcome, SyncSettings};
use barsync::utils::{format_ts, SystemClock};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("📥 One-shot minute bar sync");

    let config_path = std::env::var(CONFIG_ENV_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = load_config(&config_path)?;

    let store = Arc::new(FileBarStore::open(&config.db_path).await?);
    let source = Arc::new(BinanceClient::from_config(&config)?);
    info!("🔗 {} from {}", source.symbol(), config.base_url);

    let engine = HistoricalSync::new(
        source,
        store.clone(),
        Arc::new(SystemClock),
        SyncSettings::from_config(&config),
    );

    match engine.synchronize().await {
        Ok(SyncOutcome::Completed(report)) => {
            info!(
                "✅ Wrote {} of {} fetched bars in {} chunks ({}ms)",
                report.bars_written, report.bars_fetched, report.chunks_fetched, report.duration_ms
            );
            if let Some(latest) = report.latest_timestamp {
                info!("Latest minute: {}", format_ts(latest));
            }
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Ok(SyncOutcome::UpToDate) => info!("✅ Store already up to date"),
        Ok(SyncOutcome::AlreadyRunning) => info!("Another sync is in progress"),
        Err(e) => {
            error!("❌ Sync failed: {} ({})", e, e.error_code());
            return Err(e.into());
        }
    }

    store.compact().await?;
    info!("📊 {} minutes stored in {}", store.minute_count().await, config.db_path);
    Ok(())
}
