use async_trait::async_trait;
use chrono::{DateTime, Utc};
use governor::{Quota, RateLimiter};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use super::Broker;
use crate::config::BrokerConfig;
use crate::error::{EngineError, Result};
use crate::models::{
    AccountState, Bar, BrokerPosition, FillPolicy, OrderRequest, OrderResult, Side,
    SymbolConstraints, Tick, Timeframe, TimeInForce,
};

// Type alias for the rate limiter to simplify signatures
type BridgeRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Client for a JSON bridge in front of the trading terminal
///
/// Cloneable; all clones share the same HTTP pool and rate limiter.
#[derive(Clone)]
pub struct HttpBroker {
    client: Client,
    base_url: String,
    rate_limiter: Arc<BridgeRateLimiter>,
}

/// Bar as returned by `/bars` and `/bars/range`
#[derive(Debug, Deserialize)]
struct RateDto {
    time: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    tick_volume: f64,
}

#[derive(Debug, Deserialize)]
struct TickDto {
    time: i64,
    bid: f64,
    ask: f64,
}

#[derive(Debug, Deserialize)]
struct AccountDto {
    balance: f64,
    margin_free: f64,
}

#[derive(Debug, Deserialize)]
struct SymbolInfoDto {
    point: f64,
    digits: u32,
    volume_min: f64,
    volume_max: f64,
    volume_step: f64,
    trade_contract_size: f64,
    trade_stops_level: u32,
}

#[derive(Debug, Deserialize)]
struct MarginDto {
    margin: Option<f64>,
}

#[derive(Debug, Serialize)]
struct OrderSendDto<'a> {
    action: &'static str,
    client_id: String,
    symbol: &'a str,
    volume: f64,
    #[serde(rename = "type")]
    side: Side,
    price: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    sl: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tp: Option<f64>,
    deviation: u32,
    magic: u64,
    comment: &'a str,
    type_time: TimeInForce,
    type_filling: FillPolicy,
}

#[derive(Debug, Deserialize)]
struct OrderSendResultDto {
    retcode: u32,
    #[serde(default)]
    price: f64,
    #[serde(default)]
    comment: String,
}

#[derive(Debug, Deserialize)]
struct PositionDto {
    ticket: u64,
    symbol: String,
    #[serde(rename = "type")]
    side: Side,
    volume: f64,
    price_open: f64,
    #[serde(default)]
    profit: f64,
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| EngineError::DataUnavailable(format!("bad timestamp {}", secs)))
}

impl RateDto {
    fn into_bar(self) -> Result<Bar> {
        Ok(Bar {
            timestamp: timestamp(self.time)?,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.tick_volume,
        })
    }
}

impl HttpBroker {
    pub fn new(config: &BrokerConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        let rps = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_second(rps)));

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            rate_limiter,
        })
    }

    /// Rate-limited GET; `Ok(None)` when the bridge has no data (404/204)
    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Option<T>> {
        self.rate_limiter.until_ready().await;

        let url = format!("{}{}", self.base_url, path);
        let response = self.client.get(&url).query(query).send().await?;

        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::NO_CONTENT => {
                tracing::debug!(%url, "Bridge returned no data");
                Ok(None)
            }
            _ => {
                let body = response.error_for_status()?.json::<T>().await?;
                Ok(Some(body))
            }
        }
    }

    async fn fetch_bars(&self, path: &str, query: &[(&str, String)]) -> Result<Vec<Bar>> {
        let rates: Vec<RateDto> = self.get_json(path, query).await?.unwrap_or_default();
        rates.into_iter().map(RateDto::into_bar).collect()
    }
}

#[async_trait]
impl Broker for HttpBroker {
    async fn fetch_recent_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        count: usize,
    ) -> Result<Vec<Bar>> {
        let query = [
            ("symbol", symbol.to_string()),
            ("timeframe", timeframe.code().to_string()),
            ("count", count.to_string()),
        ];
        self.fetch_bars("/bars", &query).await
    }

    async fn fetch_latest_tick(&self, symbol: &str) -> Result<Option<Tick>> {
        let tick: Option<TickDto> = self.get_json("/tick", &[("symbol", symbol.to_string())]).await?;
        tick.map(|t| {
            Ok(Tick {
                timestamp: timestamp(t.time)?,
                bid: t.bid,
                ask: t.ask,
            })
        })
        .transpose()
    }

    async fn fetch_historical_range(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bar>> {
        let query = [
            ("symbol", symbol.to_string()),
            ("timeframe", timeframe.code().to_string()),
            ("start", start.timestamp().to_string()),
            ("end", end.timestamp().to_string()),
        ];
        self.fetch_bars("/bars/range", &query).await
    }

    async fn account_state(&self) -> Result<AccountState> {
        let account: AccountDto = self
            .get_json("/account", &[])
            .await
            .map_err(|e| EngineError::AccountInfoUnavailable(e.to_string()))?
            .ok_or_else(|| EngineError::AccountInfoUnavailable("empty response".into()))?;

        Ok(AccountState {
            balance: account.balance,
            margin_free: account.margin_free,
        })
    }

    async fn symbol_constraints(&self, symbol: &str) -> Result<SymbolConstraints> {
        let info: SymbolInfoDto = self
            .get_json(&format!("/symbols/{}", symbol), &[])
            .await
            .map_err(|e| EngineError::ConstraintsUnavailable(e.to_string()))?
            .ok_or_else(|| EngineError::ConstraintsUnavailable(format!("unknown symbol {}", symbol)))?;

        Ok(SymbolConstraints {
            point: info.point,
            digits: info.digits,
            volume_min: info.volume_min,
            volume_max: info.volume_max,
            volume_step: info.volume_step,
            contract_size: info.trade_contract_size,
            min_stop_level_points: info.trade_stops_level,
        })
    }

    async fn estimate_margin_per_lot(&self, symbol: &str, side: Side, price: f64) -> Result<f64> {
        let query = [
            ("symbol", symbol.to_string()),
            ("side", side.to_string().to_lowercase()),
            ("volume", "1.0".to_string()),
            ("price", price.to_string()),
        ];
        let margin: Option<MarginDto> = self.get_json("/margin", &query).await?;

        // Unknown margin disables the margin cap rather than blocking the trade
        Ok(margin.and_then(|m| m.margin).unwrap_or(0.0))
    }

    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderResult> {
        self.rate_limiter.until_ready().await;

        let body = OrderSendDto {
            action: "deal",
            client_id: request.client_id.to_string(),
            symbol: &request.symbol,
            volume: request.volume,
            side: request.side,
            price: request.price,
            sl: request.stop_loss,
            tp: request.take_profit,
            deviation: request.deviation,
            magic: request.strategy_id,
            comment: &request.comment,
            type_time: request.time_in_force,
            type_filling: request.fill_policy,
        };

        let url = format!("{}/orders", self.base_url);
        let result: OrderSendResultDto = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(OrderResult::from_code(result.retcode, result.price, result.comment))
    }

    async fn open_positions(&self, symbol: &str) -> Result<Vec<BrokerPosition>> {
        let positions: Vec<PositionDto> = self
            .get_json("/positions", &[("symbol", symbol.to_string())])
            .await?
            .unwrap_or_default();

        Ok(positions
            .into_iter()
            .map(|p| BrokerPosition {
                ticket: p.ticket,
                symbol: p.symbol,
                side: p.side,
                volume: p.volume,
                open_price: p.price_open,
                profit: p.profit,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TRADE_RETCODE_DONE;
    use mockito::Matcher;
    use uuid::Uuid;

    fn broker_for(server: &mockito::ServerGuard) -> HttpBroker {
        let config = BrokerConfig {
            base_url: server.url(),
            requests_per_second: 1000,
            ..Default::default()
        };
        HttpBroker::new(&config).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_recent_bars() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/bars")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("symbol".into(), "XAUUSD".into()),
                Matcher::UrlEncoded("timeframe".into(), "M1".into()),
                Matcher::UrlEncoded("count".into(), "2".into()),
            ]))
            .with_header("content-type", "application/json")
            .with_body(
                r#"[{"time":1750410000,"open":1.0,"high":2.0,"low":0.5,"close":1.5,"tick_volume":12},
                    {"time":1750410060,"open":1.5,"high":2.5,"low":1.0,"close":2.0,"tick_volume":9}]"#,
            )
            .create_async()
            .await;

        let bars = broker_for(&server)
            .fetch_recent_bars("XAUUSD", Timeframe::M1, 2)
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[1].close, 2.0);
        assert_eq!(bars[1].timestamp.timestamp(), 1750410060);
    }

    #[tokio::test]
    async fn test_missing_tick_is_none() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/tick")
            .match_query(Matcher::Any)
            .with_status(404)
            .create_async()
            .await;

        let tick = broker_for(&server).fetch_latest_tick("XAUUSD").await.unwrap();
        assert!(tick.is_none());
    }

    #[tokio::test]
    async fn test_account_failure_maps_to_account_unavailable() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/account")
            .with_status(500)
            .create_async()
            .await;

        let err = broker_for(&server).account_state().await.unwrap_err();
        assert!(matches!(err, EngineError::AccountInfoUnavailable(_)));
    }

    #[tokio::test]
    async fn test_symbol_constraints() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/symbols/XAUUSD")
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"point":0.01,"digits":2,"volume_min":0.01,"volume_max":100.0,
                    "volume_step":0.01,"trade_contract_size":100.0,"trade_stops_level":10}"#,
            )
            .create_async()
            .await;

        let c = broker_for(&server).symbol_constraints("XAUUSD").await.unwrap();
        assert_eq!(c.contract_size, 100.0);
        assert_eq!(c.min_stop_level_points, 10);
    }

    #[tokio::test]
    async fn test_submit_order_maps_retcode() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/orders")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "symbol": "XAUUSD",
                "type": "buy",
                "magic": 20250620,
                "type_time": "gtc",
                "type_filling": "ioc"
            })))
            .with_header("content-type", "application/json")
            .with_body(format!(
                r#"{{"retcode":{},"price":2301.25,"comment":"Request executed"}}"#,
                TRADE_RETCODE_DONE
            ))
            .create_async()
            .await;

        let request = OrderRequest {
            client_id: Uuid::new_v4(),
            symbol: "XAUUSD".into(),
            volume: 0.5,
            side: Side::Buy,
            price: 2301.2,
            stop_loss: Some(2297.2),
            take_profit: Some(2313.2),
            deviation: 20,
            strategy_id: 20250620,
            time_in_force: TimeInForce::Gtc,
            fill_policy: FillPolicy::ImmediateOrCancel,
            comment: String::new(),
        };

        let result = broker_for(&server).submit_order(&request).await.unwrap();

        mock.assert_async().await;
        assert!(result.accepted);
        assert_eq!(result.executed_price, 2301.25);
    }

    #[tokio::test]
    async fn test_open_positions() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/positions")
            .match_query(Matcher::UrlEncoded("symbol".into(), "XAUUSD".into()))
            .with_header("content-type", "application/json")
            .with_body(
                r#"[{"ticket":7,"symbol":"XAUUSD","type":"buy","volume":0.5,"price_open":2300.0,"profit":12.5}]"#,
            )
            .create_async()
            .await;

        let positions = broker_for(&server).open_positions("XAUUSD").await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].side, Side::Buy);
        assert_eq!(positions[0].profit, 12.5);
    }
}
