use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Broker result code for a fully filled market order.
///
/// Every other code (requote, margin, rejected, cancelled...) is a failure.
pub const TRADE_RETCODE_DONE: u32 = 10009;

/// OHLCV bar produced by the market data feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Best bid/ask quote
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub timestamp: DateTime<Utc>,
    pub bid: f64,
    pub ask: f64,
}

impl Tick {
    /// Degenerate bar used as indicator input in tick mode
    pub fn to_bar(&self) -> Bar {
        Bar {
            timestamp: self.timestamp,
            open: self.bid,
            high: self.bid,
            low: self.bid,
            close: self.bid,
            volume: 1.0,
        }
    }

    /// Price a market order on `side` would execute at
    pub fn price_for(&self, side: Side) -> f64 {
        match side {
            Side::Buy => self.ask,
            Side::Sell => self.bid,
        }
    }
}

/// Chart timeframe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Timeframe {
    M1,
    M5,
    M15,
    M30,
    H1,
    H4,
    D1,
}

impl Timeframe {
    pub fn code(&self) -> &'static str {
        match self {
            Self::M1 => "M1",
            Self::M5 => "M5",
            Self::M15 => "M15",
            Self::M30 => "M30",
            Self::H1 => "H1",
            Self::H4 => "H4",
            Self::D1 => "D1",
        }
    }

    /// Human readable label used in log lines
    pub fn label(&self) -> &'static str {
        match self {
            Self::M1 => "1min",
            Self::M5 => "5min",
            Self::M15 => "15min",
            Self::M30 => "30min",
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::D1 => "1d",
        }
    }

    pub fn duration(&self) -> Duration {
        match self {
            Self::M1 => Duration::minutes(1),
            Self::M5 => Duration::minutes(5),
            Self::M15 => Duration::minutes(15),
            Self::M30 => Duration::minutes(30),
            Self::H1 => Duration::hours(1),
            Self::H4 => Duration::hours(4),
            Self::D1 => Duration::days(1),
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "M1" => Ok(Self::M1),
            "M5" => Ok(Self::M5),
            "M15" => Ok(Self::M15),
            "M30" => Ok(Self::M30),
            "H1" => Ok(Self::H1),
            "H4" => Ok(Self::H4),
            "D1" => Ok(Self::D1),
            other => Err(format!(
                "unknown timeframe '{}', expected one of M1|M5|M15|M30|H1|H4|D1",
                other
            )),
        }
    }
}

impl TryFrom<String> for Timeframe {
    type Error = String;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        raw.parse()
    }
}

impl From<Timeframe> for String {
    fn from(tf: Timeframe) -> Self {
        tf.code().to_string()
    }
}

/// Order / position direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Snapshot of the indicator values after the latest bar
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndicatorState {
    pub sma_fast: Option<f64>,
    pub sma_slow: Option<f64>,
    pub atr: Option<f64>,
    /// sign(fast - slow), 0 until both averages are defined
    pub crossover_sign: i8,
    /// Sign after the previous bar
    pub previous_sign: i8,
    pub ready: bool,
}

impl IndicatorState {
    /// Fast average crossed above the slow one on this bar
    pub fn is_golden_cross(&self) -> bool {
        self.previous_sign <= 0 && self.crossover_sign > 0
    }

    /// Fast average crossed below the slow one on this bar
    pub fn is_death_cross(&self) -> bool {
        self.previous_sign >= 0 && self.crossover_sign < 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalKind {
    OpenLong,
    CloseAll,
    None,
}

/// Trading decision for one minute bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signal {
    pub kind: SignalKind,
    pub bucket: DateTime<Utc>,
}

impl Signal {
    pub fn none(bucket: DateTime<Utc>) -> Self {
        Self {
            kind: SignalKind::None,
            bucket,
        }
    }

    pub fn is_actionable(&self) -> bool {
        self.kind != SignalKind::None
    }
}

/// Account snapshot, fetched fresh every decision cycle
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AccountState {
    pub balance: f64,
    pub margin_free: f64,
}

/// Broker-imposed numeric constraints of an instrument
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SymbolConstraints {
    pub point: f64,
    pub digits: u32,
    pub volume_min: f64,
    pub volume_max: f64,
    pub volume_step: f64,
    pub contract_size: f64,
    pub min_stop_level_points: u32,
}

impl SymbolConstraints {
    /// Round a price to the instrument's digit precision
    pub fn round_price(&self, price: f64) -> f64 {
        round_to(price, self.digits)
    }
}

/// Round `value` to `decimals` decimal places
pub fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    #[serde(rename = "gtc")]
    Gtc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FillPolicy {
    #[serde(rename = "ioc")]
    ImmediateOrCancel,
}

/// Market order instruction sent to the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_id: Uuid,
    pub symbol: String,
    pub volume: f64,
    pub side: Side,
    pub price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub deviation: u32,
    pub strategy_id: u64,
    pub time_in_force: TimeInForce,
    pub fill_policy: FillPolicy,
    pub comment: String,
}

/// Broker answer to an order submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderResult {
    pub accepted: bool,
    pub code: u32,
    pub executed_price: f64,
    pub reason: String,
}

impl OrderResult {
    /// Interpret a raw broker result code
    pub fn from_code(code: u32, executed_price: f64, reason: impl Into<String>) -> Self {
        Self {
            accepted: code == TRADE_RETCODE_DONE,
            code,
            executed_price,
            reason: reason.into(),
        }
    }

    pub fn done(executed_price: f64) -> Self {
        Self::from_code(TRADE_RETCODE_DONE, executed_price, "done")
    }
}

/// Open position as reported by the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub ticket: u64,
    pub symbol: String,
    pub side: Side,
    pub volume: f64,
    pub open_price: f64,
    pub profit: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_to_bar_is_degenerate() {
        let tick = Tick {
            timestamp: Utc::now(),
            bid: 2300.5,
            ask: 2300.9,
        };
        let bar = tick.to_bar();

        assert_eq!(bar.open, 2300.5);
        assert_eq!(bar.high, 2300.5);
        assert_eq!(bar.low, 2300.5);
        assert_eq!(bar.close, 2300.5);
        assert_eq!(tick.price_for(Side::Buy), 2300.9);
        assert_eq!(tick.price_for(Side::Sell), 2300.5);
    }

    #[test]
    fn test_timeframe_parse_and_label() {
        assert_eq!("m15".parse::<Timeframe>().unwrap(), Timeframe::M15);
        assert_eq!(Timeframe::H4.label(), "4h");
        assert_eq!(Timeframe::D1.duration(), Duration::days(1));
        assert!("W1".parse::<Timeframe>().is_err());
    }

    #[test]
    fn test_crossover_edges() {
        let mut state = IndicatorState {
            sma_fast: Some(2.0),
            sma_slow: Some(1.0),
            atr: Some(1.0),
            crossover_sign: 1,
            previous_sign: 0,
            ready: true,
        };
        assert!(state.is_golden_cross());
        assert!(!state.is_death_cross());

        state.previous_sign = 1;
        assert!(!state.is_golden_cross());

        state.crossover_sign = -1;
        assert!(state.is_death_cross());
    }

    #[test]
    fn test_order_result_only_done_is_accepted() {
        assert!(OrderResult::done(100.0).accepted);
        assert!(!OrderResult::from_code(10004, 0.0, "requote").accepted);
        assert!(!OrderResult::from_code(10019, 0.0, "no money").accepted);
    }

    #[test]
    fn test_round_price_to_digits() {
        let constraints = SymbolConstraints {
            point: 0.01,
            digits: 2,
            volume_min: 0.01,
            volume_max: 10.0,
            volume_step: 0.01,
            contract_size: 100.0,
            min_stop_level_points: 0,
        };
        assert_eq!(constraints.round_price(2345.6789), 2345.68);
    }

    #[test]
    fn test_order_policies_use_bridge_codes() {
        assert_eq!(serde_json::to_value(TimeInForce::Gtc).unwrap(), "gtc");
        assert_eq!(serde_json::to_value(FillPolicy::ImmediateOrCancel).unwrap(), "ioc");
    }
}
