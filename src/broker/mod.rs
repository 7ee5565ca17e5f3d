// Broker capability interface
//
// The engine never talks to a trading terminal directly; everything goes
// through `Broker` so the decision loop can run against a paper broker or
// an HTTP bridge without changes.
pub mod http;
pub mod paper;
pub mod synthetic;

pub use http::HttpBroker;
pub use paper::PaperBroker;
pub use synthetic::{MarketScenario, SyntheticMarket};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{
    AccountState, Bar, BrokerPosition, OrderRequest, OrderResult, Side, SymbolConstraints, Tick,
    Timeframe,
};

#[async_trait]
pub trait Broker: Send + Sync {
    /// Latest `count` bars, oldest first. Empty when the broker has nothing.
    async fn fetch_recent_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        count: usize,
    ) -> Result<Vec<Bar>>;

    async fn fetch_latest_tick(&self, symbol: &str) -> Result<Option<Tick>>;

    async fn fetch_historical_range(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bar>>;

    async fn account_state(&self) -> Result<AccountState>;

    async fn symbol_constraints(&self, symbol: &str) -> Result<SymbolConstraints>;

    /// Margin required for 1.0 lot on `side` at `price`
    async fn estimate_margin_per_lot(&self, symbol: &str, side: Side, price: f64) -> Result<f64>;

    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderResult>;

    async fn open_positions(&self, symbol: &str) -> Result<Vec<BrokerPosition>>;
}
