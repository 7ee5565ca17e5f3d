use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::{EngineError, Result};
use crate::models::Timeframe;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    /// In-memory simulated broker
    Paper,
    /// JSON bridge gateway in front of the trading terminal
    Http,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub kind: BrokerKind,
    /// Base URL of the bridge gateway (http broker only)
    pub base_url: String,
    pub request_timeout_secs: u64,
    pub requests_per_second: u32,
    /// Seed for the paper broker's synthetic market
    pub paper_seed: u64,
    pub paper_balance: f64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            kind: BrokerKind::Paper,
            base_url: "http://127.0.0.1:8787".to_string(),
            request_timeout_secs: 10,
            requests_per_second: 20,
            paper_seed: 42,
            paper_balance: 10_000.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub symbol: String,
    pub timeframe: Timeframe,
    /// Poll the latest tick instead of the latest bars
    pub tick_mode: bool,
    pub poll_interval_secs: f64,
    /// Days of history preloaded before live polling, 0 disables
    pub warmup_days: i64,
    pub buffer_capacity: usize,
    /// How long the consumer waits for the readiness signal before retrying
    pub consumer_wait_secs: f64,
    pub stop_timeout_secs: f64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            symbol: "XAUUSD".to_string(),
            timeframe: Timeframe::M1,
            tick_mode: false,
            poll_interval_secs: 1.0,
            warmup_days: 15,
            buffer_capacity: 10_000,
            consumer_wait_secs: 1.0,
            stop_timeout_secs: 5.0,
        }
    }
}

impl FeedConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval_secs)
    }

    pub fn consumer_wait(&self) -> Duration {
        Duration::from_secs_f64(self.consumer_wait_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.stop_timeout_secs)
    }
}

/// How crossover sign is turned into signals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrossoverPolicy {
    /// Act only on the bar where the sign flips
    Transition,
    /// Act on the current sign in every new bucket
    Level,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub fast_period: usize,
    pub slow_period: usize,
    pub atr_period: usize,
    pub crossover_policy: CrossoverPolicy,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            fast_period: 20,
            slow_period: 50,
            atr_period: 14,
            crossover_policy: CrossoverPolicy::Transition,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub stop_atr_multiple: f64,
    pub take_profit_multiple: f64,
    /// Fraction of balance risked per trade (0.02 = 2%)
    pub risk_fraction: f64,
    pub max_positions: usize,
    /// Points added on top of the broker's minimum stop level
    pub stop_level_buffer_points: u32,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            stop_atr_multiple: 2.0,
            take_profit_multiple: 3.0,
            risk_fraction: 0.02,
            max_positions: 1,
            stop_level_buffer_points: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Maximum tolerated slippage in points
    pub deviation: u32,
    /// Magic number attached to every order
    pub strategy_id: u64,
    pub close_comment: String,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            deviation: 20,
            strategy_id: 20250620,
            close_comment: "DeathCross".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Print engine events as JSON lines
    pub json_events: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "trendbot=info".to_string(),
            json_events: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from files and environment
    ///
    /// Order: defaults, `config/default.toml`, the file named by
    /// `TRENDBOT_CONFIG`, then `TRENDBOT_<SECTION>__<KEY>` variables.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("config"), None)
    }

    /// Like `load`, with an explicit file taking the place of `TRENDBOT_CONFIG`
    pub fn load_from(config_dir: &Path, file: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::from(config_dir.join("default.toml")).required(false));

        let file = file
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os("TRENDBOT_CONFIG").map(Into::into));
        if let Some(path) = file {
            builder = builder.add_source(File::from(path).required(true));
        }

        let config: AppConfig = builder
            .add_source(
                Environment::with_prefix("TRENDBOT")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(EngineError::InvalidConfig(msg.to_string()));

        if self.feed.symbol.trim().is_empty() {
            return invalid("feed.symbol must not be empty");
        }
        if !(self.feed.poll_interval_secs > 0.0) {
            return invalid("feed.poll_interval_secs must be > 0");
        }
        if !(self.feed.consumer_wait_secs > 0.0) || !(self.feed.stop_timeout_secs > 0.0) {
            return invalid("feed wait/stop timeouts must be > 0");
        }
        if self.feed.buffer_capacity == 0 {
            return invalid("feed.buffer_capacity must be > 0");
        }
        let s = &self.strategy;
        if s.fast_period == 0 || s.slow_period == 0 || s.atr_period == 0 {
            return invalid("indicator periods must be > 0");
        }
        let r = &self.risk;
        if !(r.risk_fraction > 0.0 && r.risk_fraction <= 1.0) {
            return invalid("risk.risk_fraction must be in (0, 1]");
        }
        if !(r.stop_atr_multiple > 0.0) || !(r.take_profit_multiple > 0.0) {
            return invalid("risk multiples must be > 0");
        }
        if r.max_positions == 0 {
            return invalid("risk.max_positions must be >= 1");
        }

        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            feed: FeedConfig::default(),
            strategy: StrategyConfig::default(),
            risk: RiskConfig::default(),
            execution: ExecutionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.feed.symbol, "XAUUSD");
        assert_eq!(config.strategy.slow_period, 50);
        assert_eq!(config.execution.strategy_id, 20250620);
    }

    #[test]
    fn test_rejects_bad_risk_fraction() {
        let mut config = AppConfig::default();
        config.risk.risk_fraction = 1.5;
        assert!(matches!(
            config.validate(),
            Err(EngineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_rejects_zero_periods() {
        let mut config = AppConfig::default();
        config.strategy.atr_period = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_falls_back_to_defaults() {
        let raw = r#"
            [feed]
            symbol = "EURUSD"
            timeframe = "M5"
            tick_mode = true
        "#;
        let config: AppConfig = Config::builder()
            .add_source(File::from_str(raw, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.feed.symbol, "EURUSD");
        assert_eq!(config.feed.timeframe, Timeframe::M5);
        assert!(config.feed.tick_mode);
        assert_eq!(config.feed.buffer_capacity, 10_000);
        assert_eq!(config.risk.max_positions, 1);
        assert_eq!(config.strategy.crossover_policy, CrossoverPolicy::Transition);
    }

    #[test]
    fn test_load_from_explicit_file() {
        let path = std::env::temp_dir().join(format!("trendbot-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "[risk]\nmax_positions = 3\n").unwrap();

        let config = AppConfig::load_from(Path::new("no-such-dir"), Some(&path));
        std::fs::remove_file(&path).ok();

        let config = config.unwrap();
        assert_eq!(config.risk.max_positions, 3);
        assert_eq!(config.feed.symbol, "XAUUSD");
    }
}
