pub mod bar_store;
pub mod sync_status;
pub mod historical_sync;
pub mod bar_aggregator;

pub use bar_store::{BarStore, FileBarStore, StoreKey};
pub use sync_status::{StatusHandle, SyncStatus};
pub use historical_sync::{spawn_periodic_sync, HistoricalSync, SyncOutcome, SyncReport, SyncSettings};
pub use bar_aggregator::{BarAggregator, Timeframe};
