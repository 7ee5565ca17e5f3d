use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use super::position_state::{EntryRecord, PositionStateMachine};
use crate::broker::Broker;
use crate::config::ExecutionConfig;
use crate::error::EngineError;
use crate::models::{
    BrokerPosition, FillPolicy, OrderRequest, Side, SymbolConstraints, Tick, TimeInForce,
};
use crate::risk::SizedOrder;

/// What happened to one order
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ExecutionOutcome {
    Filled {
        request: OrderRequest,
        executed_price: f64,
    },
    /// Broker answered with anything but the done code
    Rejected {
        request: OrderRequest,
        code: u32,
        reason: String,
    },
    /// The call itself failed (transport, missing quote, ...)
    Failed { reason: String },
}

impl ExecutionOutcome {
    pub fn is_filled(&self) -> bool {
        matches!(self, Self::Filled { .. })
    }

    /// The failure behind a non-filled outcome
    pub fn error(&self) -> Option<EngineError> {
        match self {
            Self::Filled { .. } => None,
            Self::Rejected { code, reason, .. } => Some(EngineError::OrderRejected {
                code: *code,
                reason: reason.clone(),
            }),
            Self::Failed { reason } => Some(EngineError::Execution(reason.clone())),
        }
    }
}

/// Result of a close-all pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CloseReport {
    /// Positions the broker reported as open
    pub found: usize,
    pub closed: usize,
    pub outcomes: Vec<ExecutionOutcome>,
}

/// Builds, submits and interprets market orders
///
/// Never retries: a failed order is logged and the next signal decides again.
pub struct OrderExecutor {
    broker: Arc<dyn Broker>,
    symbol: String,
    deviation: u32,
    strategy_id: u64,
}

impl OrderExecutor {
    pub fn new(broker: Arc<dyn Broker>, symbol: impl Into<String>, config: &ExecutionConfig) -> Self {
        Self {
            broker,
            symbol: symbol.into(),
            deviation: config.deviation,
            strategy_id: config.strategy_id,
        }
    }

    /// Market order at `price` with protective levels `*_points` away
    ///
    /// A buy's stop sits below the price and its target above; a sell is
    /// mirrored. All prices are rounded to the instrument's digits.
    pub fn build_request(
        &self,
        side: Side,
        volume: f64,
        price: f64,
        stop_points: Option<u32>,
        take_profit_points: Option<u32>,
        constraints: &SymbolConstraints,
        comment: &str,
    ) -> OrderRequest {
        let offset = |points: u32| points as f64 * constraints.point;
        let direction = match side {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        };

        let stop_loss = stop_points
            .filter(|p| *p > 0)
            .map(|p| constraints.round_price(price - direction * offset(p)));
        let take_profit = take_profit_points
            .filter(|p| *p > 0)
            .map(|p| constraints.round_price(price + direction * offset(p)));

        OrderRequest {
            client_id: Uuid::new_v4(),
            symbol: self.symbol.clone(),
            volume,
            side,
            price: constraints.round_price(price),
            stop_loss,
            take_profit,
            deviation: self.deviation,
            strategy_id: self.strategy_id,
            time_in_force: TimeInForce::Gtc,
            fill_policy: FillPolicy::ImmediateOrCancel,
            comment: comment.to_string(),
        }
    }

    /// Send one request; broker errors become `Failed`, never propagate
    pub async fn submit(&self, request: OrderRequest) -> ExecutionOutcome {
        match self.broker.submit_order(&request).await {
            Ok(result) if result.accepted => {
                let executed_price = if result.executed_price > 0.0 {
                    result.executed_price
                } else {
                    request.price
                };
                ExecutionOutcome::Filled {
                    request,
                    executed_price,
                }
            }
            Ok(result) => ExecutionOutcome::Rejected {
                request,
                code: result.code,
                reason: result.reason,
            },
            Err(e) => ExecutionOutcome::Failed {
                reason: e.to_string(),
            },
        }
    }

    /// Buy `sized.volume` at the ask with ATR-based stop and target
    pub async fn open_long(
        &self,
        sized: &SizedOrder,
        tick: &Tick,
        constraints: &SymbolConstraints,
        positions: &mut PositionStateMachine,
    ) -> ExecutionOutcome {
        let request = self.build_request(
            Side::Buy,
            sized.volume,
            tick.price_for(Side::Buy),
            Some(sized.stop_points),
            Some(sized.take_profit_points),
            constraints,
            "",
        );
        let client_id = request.client_id;

        let outcome = self.submit(request).await;
        match &outcome {
            ExecutionOutcome::Filled {
                request,
                executed_price,
            } => {
                positions.record_open(EntryRecord {
                    price: *executed_price,
                    volume: request.volume,
                    stop_loss: request.stop_loss,
                    take_profit: request.take_profit,
                    time: Utc::now(),
                });
                tracing::info!(
                    %client_id,
                    positions = positions.count(),
                    "Open long: {:.2}@{:.5} SL={} TP={}",
                    request.volume,
                    executed_price,
                    sized.stop_points,
                    sized.take_profit_points
                );
            }
            ExecutionOutcome::Rejected { .. } | ExecutionOutcome::Failed { .. } => {
                if let Some(err) = outcome.error() {
                    tracing::warn!(%client_id, "Open failed: {}", err);
                }
            }
        }

        outcome
    }

    /// Close every position the broker reports on the symbol
    ///
    /// Each position gets an opposing market order for its exact volume.
    /// The local counter only moves on a confirmed fill.
    pub async fn close_all(
        &self,
        comment: &str,
        positions: &mut PositionStateMachine,
    ) -> CloseReport {
        let open = match self.broker.open_positions(&self.symbol).await {
            Ok(open) => open,
            Err(e) => {
                tracing::error!(error = %e, "Cannot list open positions");
                return CloseReport {
                    outcomes: vec![ExecutionOutcome::Failed {
                        reason: e.to_string(),
                    }],
                    ..Default::default()
                };
            }
        };

        let mut report = CloseReport {
            found: open.len(),
            ..Default::default()
        };
        if open.is_empty() {
            tracing::debug!(symbol = %self.symbol, "No open positions to close");
            return report;
        }

        for position in &open {
            let outcome = self.close_position(position, comment).await;
            match &outcome {
                ExecutionOutcome::Filled { .. } => {
                    positions.record_close();
                    report.closed += 1;
                    tracing::info!(
                        ticket = position.ticket,
                        positions = positions.count(),
                        "Closed: {} PnL={:.2}",
                        comment,
                        position.profit
                    );
                }
                ExecutionOutcome::Rejected { code, reason, .. } => {
                    tracing::warn!(ticket = position.ticket, code, "Close failed: {}", reason);
                }
                ExecutionOutcome::Failed { reason } => {
                    tracing::error!(ticket = position.ticket, "Close error: {}", reason);
                }
            }
            report.outcomes.push(outcome);
        }

        report
    }

    async fn close_position(&self, position: &BrokerPosition, comment: &str) -> ExecutionOutcome {
        let side = position.side.opposite();

        let tick = match self.broker.fetch_latest_tick(&self.symbol).await {
            Ok(Some(tick)) => tick,
            Ok(None) => {
                return ExecutionOutcome::Failed {
                    reason: "No tick data".to_string(),
                }
            }
            Err(e) => {
                return ExecutionOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        };
        let constraints = match self.broker.symbol_constraints(&self.symbol).await {
            Ok(c) => c,
            Err(e) => {
                return ExecutionOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        };

        let request = self.build_request(
            side,
            position.volume,
            tick.price_for(side),
            None,
            None,
            &constraints,
            comment,
        );
        self.submit(request).await
    }
}
