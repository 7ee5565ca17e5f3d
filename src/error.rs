use std::time::Duration;
use thiserror::Error;

/// Error type for the trading engine
///
/// Every per-cycle variant is recoverable: the decision loop logs it and
/// moves on to the next feed item.
#[derive(Error, Debug)]
pub enum EngineError {
    // Market data
    #[error("Market data unavailable: {0}")]
    DataUnavailable(String),

    // Broker snapshots
    #[error("Account info unavailable: {0}")]
    AccountInfoUnavailable(String),

    #[error("Symbol constraints unavailable: {0}")]
    ConstraintsUnavailable(String),

    // Sizing
    #[error("Invalid volatility: ATR = {0}")]
    InvalidVolatility(f64),

    #[error("Invalid volume: {0}")]
    InvalidVolume(String),

    // Order execution
    #[error("Order rejected (code {code}): {reason}")]
    OrderRejected { code: u32, reason: String },

    #[error("Execution error: {0}")]
    Execution(String),

    // Lifecycle
    #[error("Feed task did not exit within {0:?}")]
    ShutdownTimeout(Duration),

    // Configuration
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Transport
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),
}

impl EngineError {
    /// Failures worth simply retrying on the next poll/cycle
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::DataUnavailable(_)
                | Self::AccountInfoUnavailable(_)
                | Self::ConstraintsUnavailable(_)
                | Self::Http(_)
        )
    }
}

/// Result type alias for EngineError
pub type Result<T> = std::result::Result<T, EngineError>;
