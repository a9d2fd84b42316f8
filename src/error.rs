/// Centralized error types for the bar synchronizer
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BarSyncError {
    // Transport Errors
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("http code {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("Network timeout: {0}")]
    NetworkTimeout(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    // Data Errors
    #[error("missing data at {at} (expected {expected}, got {actual})")]
    ContinuityBroken {
        at: String,
        expected: i64,
        actual: i64,
    },

    #[error("Invalid bar data: {0}")]
    InvalidBarData(String),

    #[error("no data available in requested timeframe ({start_ms}..{end_ms})")]
    NoDataInRange { start_ms: i64, end_ms: i64 },

    #[error("Deserialization failed: {0}")]
    DeserializationError(#[from] serde_json::Error),

    // Store Errors
    #[error("Store error: {0}")]
    StoreError(String),

    #[error("File I/O error: {0}")]
    FileError(#[from] std::io::Error),

    // Configuration Errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    // Lifecycle
    #[error("Sync cancelled: {0}")]
    Cancelled(String),
}

pub type Result<T> = std::result::Result<T, BarSyncError>;

impl BarSyncError {
    /// Remote call failed or came back unusable
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            BarSyncError::HttpError(_)
                | BarSyncError::HttpStatus { .. }
                | BarSyncError::NetworkTimeout(_)
                | BarSyncError::MalformedResponse(_)
        )
    }

    /// Check if error is a store/persistence failure
    pub fn is_store(&self) -> bool {
        matches!(
            self,
            BarSyncError::StoreError(_)
                | BarSyncError::FileError(_)
                | BarSyncError::DeserializationError(_)
        )
    }

    /// Check if the next scheduled run can be expected to get past this error
    pub fn is_recoverable(&self) -> bool {
        self.is_transport()
            || matches!(
                self,
                BarSyncError::ContinuityBroken { .. } | BarSyncError::Cancelled(_)
            )
    }

    /// Get error code for logging/monitoring
    pub fn error_code(&self) -> &str {
        match self {
            BarSyncError::HttpError(_) => "NET_001",
            BarSyncError::HttpStatus { .. } => "NET_002",
            BarSyncError::NetworkTimeout(_) => "NET_003",
            BarSyncError::MalformedResponse(_) => "NET_004",
            BarSyncError::ContinuityBroken { .. } => "DATA_001",
            BarSyncError::InvalidBarData(_) => "DATA_002",
            BarSyncError::NoDataInRange { .. } => "DATA_003",
            BarSyncError::DeserializationError(_) => "DATA_004",
            BarSyncError::StoreError(_) => "STORE_001",
            BarSyncError::FileError(_) => "FILE_001",
            BarSyncError::ConfigError(_) => "CFG_001",
            BarSyncError::InvalidParameter(_) => "CFG_002",
            BarSyncError::Cancelled(_) => "SYS_001",
        }
    }
}
