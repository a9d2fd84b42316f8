/// Main entry point: keep the local minute-bar store current and report aggregates
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use barsync::{
    broker::BinanceClient,
    config::{load_config, CONFIG_ENV_VAR, DEFAULT_CONFIG_PATH},
    data::{spawn_periodic_sync, BarAggregator, FileBarStore, HistoricalSync, SyncSettings, Timeframe},
    utils::SystemClock,
    BarSyncError, Config,
};

/// Application state
pub struct BarSyncApp {
    config: Arc<Config>,
    store: Arc<FileBarStore>,
    engine: Arc<HistoricalSync>,
    aggregator: BarAggregator,
    timeframe: Timeframe,
}

impl BarSyncApp {
    pub async fn new(config: Config) -> barsync::Result<Self> {
        let config = Arc::new(config);
        let clock = Arc::new(SystemClock);

        let store = Arc::new(FileBarStore::open(&config.db_path).await?);
        info!("Bar store opened at {} ({} minutes)", config.db_path, store.minute_count().await);

        let source = Arc::new(BinanceClient::from_config(&config)?);
        let engine = Arc::new(HistoricalSync::new(
            source,
            store.clone(),
            clock.clone(),
            SyncSettings::from_config(&config),
        ));
        let aggregator = BarAggregator::new(store.clone(), clock);
        let timeframe = config.aggregate_timeframe.parse()?;

        Ok(BarSyncApp {
            config,
            store,
            engine,
            aggregator,
            timeframe,
        })
    }

    /// Run until Ctrl+C
    pub async fn run(&self) -> anyhow::Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let sync_task = spawn_periodic_sync(
            Arc::clone(&self.engine),
            Duration::from_secs(self.config.sync_interval_secs),
            shutdown_rx,
        );

        let mut refresh = tokio::time::interval(Duration::from_secs(self.config.refresh_interval_secs));

        loop {
            tokio::select! {
                _ = refresh.tick() => self.refresh().await,
                signal = tokio::signal::ctrl_c() => {
                    if let Err(e) = signal {
                        error!("Failed to listen for Ctrl+C: {}", e);
                    }
                    info!("Ctrl+C received - initiating graceful shutdown");
                    break;
                }
            }
        }

        let _ = shutdown_tx.send(true);
        self.engine.cancel();
        if let Err(e) = sync_task.await {
            warn!("Sync task ended abnormally: {}", e);
        }

        if let Err(e) = self.store.compact().await {
            warn!("Final store compaction failed: {}", e);
        }
        info!("Shutdown complete");
        Ok(())
    }

    /// One refresh tick: log sync progress and the latest aggregate
    async fn refresh(&self) {
        let status = self.engine.status().snapshot().await;
        if status.fetching {
            info!("{}", status.status_text);
        }
        if !status.error_message.is_empty() {
            warn!("Last sync error: {}", status.error_message);
        }

        match self
            .aggregator
            .aggregate(self.config.aggregate_bar_count, self.timeframe)
            .await
        {
            Ok(bars) => {
                if let Some(last) = bars.last() {
                    info!(
                        "{} {}: {} bars, last {} O {:.2} H {:.2} L {:.2} C {:.2} V {:.4}",
                        self.config.symbol,
                        self.timeframe.as_str(),
                        bars.len(),
                        barsync::utils::format_ts(last.time),
                        last.open,
                        last.high,
                        last.low,
                        last.close,
                        last.volume
                    );
                }
            }
            Err(BarSyncError::NoDataInRange { .. }) => info!("No bars stored yet"),
            Err(e) => error!("Aggregation failed: {} ({})", e, e.error_code()),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::var(CONFIG_ENV_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = load_config(&config_path)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    info!("Starting bar synchronizer for {}", config.symbol);

    let app = BarSyncApp::new(config).await?;
    app.run().await
}
