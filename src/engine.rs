use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

use crate::broker::Broker;
use crate::config::AppConfig;
use crate::error::{EngineError, Result};
use crate::execution::{
    CloseReport, ExecutionOutcome, MarketDataFeed, OrderExecutor, PositionStateMachine,
};
use crate::indicators::IndicatorEngine;
use crate::models::{AccountState, Bar, IndicatorState, Side, SignalKind, Timeframe};
use crate::risk::{PositionSizer, SizedOrder, SizingInput};
use crate::strategy::{minute_bucket, SignalGenerator};

// ============================================================================
// Events
// ============================================================================

/// Observable record of what the decision loop did
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    Started {
        symbol: String,
        timeframe: Timeframe,
        tick_mode: bool,
    },
    Signal {
        kind: SignalKind,
        bucket: DateTime<Utc>,
        sma_fast: Option<f64>,
        sma_slow: Option<f64>,
        atr: Option<f64>,
    },
    Sized {
        order: SizedOrder,
    },
    Filled {
        side: Side,
        volume: f64,
        price: f64,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
        positions: usize,
    },
    OrderFailed {
        side: Option<Side>,
        code: Option<u32>,
        reason: String,
    },
    ClosedAll {
        found: usize,
        closed: usize,
        positions: usize,
    },
    CycleAborted {
        reason: String,
    },
    Stopped,
}

/// What one decision cycle ended with
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum CycleOutcome {
    /// Indicators still need more history
    WarmingUp,
    /// Preloaded history bar; indicators updated, no decision
    Replayed,
    /// This minute bucket already produced a decision
    Debounced,
    NoSignal,
    /// Something the decision needed was missing; no order was sent
    Aborted { reason: String },
    Opened(ExecutionOutcome),
    Closed(CloseReport),
}

// ============================================================================
// Engine
// ============================================================================

/// Feed → indicators → signal → sizing → execution, one bar at a time
///
/// Everything except the feed's poll task runs on the caller's task, so a
/// bar is fully handled (including any order) before the next is pulled.
pub struct TradingEngine {
    broker: Arc<dyn Broker>,
    config: AppConfig,
    feed: MarketDataFeed,
    indicators: IndicatorEngine,
    signals: SignalGenerator,
    sizer: PositionSizer,
    executor: OrderExecutor,
    positions: PositionStateMachine,
    last_state: Option<IndicatorState>,
    events: Option<UnboundedSender<EngineEvent>>,
}

impl TradingEngine {
    pub fn new(config: AppConfig, broker: Arc<dyn Broker>) -> Result<Self> {
        config.validate()?;

        let strategy = &config.strategy;
        let symbol = config.feed.symbol.clone();

        Ok(Self {
            feed: MarketDataFeed::new(broker.clone(), config.feed.clone()),
            indicators: IndicatorEngine::new(
                strategy.fast_period,
                strategy.slow_period,
                strategy.atr_period,
            ),
            signals: SignalGenerator::new(config.risk.max_positions, strategy.crossover_policy),
            sizer: PositionSizer::from_config(&config.risk),
            executor: OrderExecutor::new(broker.clone(), symbol, &config.execution),
            positions: PositionStateMachine::new(config.risk.max_positions),
            last_state: None,
            events: None,
            broker,
            config,
        })
    }

    /// Publish events on `tx` in addition to logging them
    pub fn with_events(mut self, tx: UnboundedSender<EngineEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    fn emit(&self, event: EngineEvent) {
        if let Some(tx) = &self.events {
            // Receiver gone just means nobody is listening any more
            let _ = tx.send(event);
        }
    }

    fn symbol(&self) -> &str {
        &self.config.feed.symbol
    }

    /// Start the market data feed
    ///
    /// Preloaded history only warms the indicators; trading starts with the
    /// first bar newer than the last preloaded one.
    pub async fn start(&mut self) {
        tracing::info!(
            symbol = %self.symbol(),
            fast = self.config.strategy.fast_period,
            slow = self.config.strategy.slow_period,
            atr = self.config.strategy.atr_period,
            policy = ?self.config.strategy.crossover_policy,
            "🚀 Trading engine starting"
        );
        self.feed.start().await;

        self.emit(EngineEvent::Started {
            symbol: self.config.feed.symbol.clone(),
            timeframe: self.config.feed.timeframe,
            tick_mode: self.config.feed.tick_mode,
        });
    }

    /// Stop the feed, waiting at most the configured timeout
    ///
    /// A timeout is reported but leaves the engine in a stopped state.
    pub async fn stop(&mut self) -> Result<()> {
        let result = self.feed.stop().await;
        if let Err(EngineError::ShutdownTimeout(timeout)) = &result {
            tracing::warn!(?timeout, "Engine stopped with feed task still running");
        }
        self.emit(EngineEvent::Stopped);
        tracing::info!(positions = self.positions.count(), "⏹️ Trading engine stopped");
        result
    }

    /// Consume feed items until `shutdown` resolves or the feed ends
    pub async fn run_until<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            let bar = tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Shutdown requested, leaving decision loop");
                    break;
                }
                bar = self.feed.next() => bar,
            };

            let Some(bar) = bar else {
                tracing::info!("Feed drained, leaving decision loop");
                break;
            };
            self.process_bar(&bar).await;
        }
    }

    /// Run one full decision cycle for `bar`
    ///
    /// Never fails: every problem is logged, emitted and reported in the
    /// returned outcome.
    pub async fn process_bar(&mut self, bar: &Bar) -> CycleOutcome {
        let state = self.indicators.update(bar);
        self.last_state = Some(state);
        self.signals.observe(&state);

        if !state.ready {
            return CycleOutcome::WarmingUp;
        }
        if self
            .feed
            .history_until()
            .is_some_and(|until| bar.timestamp <= until)
        {
            // Crosses inside history are stale by the time we go live
            self.signals.discard_pending();
            return CycleOutcome::Replayed;
        }

        let bucket = minute_bucket(bar.timestamp);
        if !self.signals.is_candidate(&state, bucket) {
            return CycleOutcome::Debounced;
        }

        let account = match self.broker.account_state().await {
            Ok(account) => Some(account),
            Err(e) => {
                tracing::warn!(error = %e, "Account info unavailable");
                None
            }
        };

        let signal = self.signals.evaluate(
            &state,
            bar.timestamp,
            self.positions.count(),
            account.as_ref(),
        );

        let Some(account) = account else {
            return self.abort(EngineError::AccountInfoUnavailable(format!(
                "no account snapshot for bucket {}",
                bucket
            )));
        };

        if !signal.is_actionable() {
            return CycleOutcome::NoSignal;
        }

        tracing::info!(
            kind = ?signal.kind,
            bucket = %signal.bucket,
            fast = ?state.sma_fast,
            slow = ?state.sma_slow,
            atr = ?state.atr,
            "📈 Signal"
        );
        self.emit(EngineEvent::Signal {
            kind: signal.kind,
            bucket: signal.bucket,
            sma_fast: state.sma_fast,
            sma_slow: state.sma_slow,
            atr: state.atr,
        });

        match signal.kind {
            SignalKind::OpenLong => self.open_long(&state, account).await,
            SignalKind::CloseAll => self.close_all().await,
            SignalKind::None => CycleOutcome::NoSignal,
        }
    }

    async fn open_long(&mut self, state: &IndicatorState, account: AccountState) -> CycleOutcome {
        let symbol = self.config.feed.symbol.clone();

        let constraints = match self.broker.symbol_constraints(&symbol).await {
            Ok(c) => c,
            Err(e) => return self.abort(e),
        };

        let tick = match self.broker.fetch_latest_tick(&symbol).await {
            Ok(Some(tick)) => tick,
            Ok(None) => {
                return self.abort(EngineError::DataUnavailable(format!(
                    "no quote for {}",
                    symbol
                )))
            }
            Err(e) => return self.abort(e),
        };
        let price = tick.price_for(Side::Buy);

        // A reply of 0 means the broker has no estimate; the sizer skips the cap
        let margin_per_lot = match self
            .broker
            .estimate_margin_per_lot(&symbol, Side::Buy, price)
            .await
        {
            Ok(margin) => margin,
            Err(e) => return self.abort(e),
        };

        let input = SizingInput {
            atr: state.atr.unwrap_or(f64::NAN),
            balance: account.balance,
            margin_free: account.margin_free,
            margin_per_lot,
            constraints,
        };
        let sized = match self.sizer.size(&input) {
            Ok(sized) => sized,
            Err(e) => return self.abort(e),
        };

        tracing::debug!(
            raw = sized.raw_volume,
            volume = sized.volume,
            risk = sized.risk_amount,
            stop_distance = sized.stop_distance,
            "Position sized"
        );
        self.emit(EngineEvent::Sized { order: sized });

        let outcome = self
            .executor
            .open_long(&sized, &tick, &constraints, &mut self.positions)
            .await;
        self.emit_execution(&outcome);
        if outcome.is_filled() {
            self.signals.acknowledge(SignalKind::OpenLong);
        }

        CycleOutcome::Opened(outcome)
    }

    async fn close_all(&mut self) -> CycleOutcome {
        let comment = self.config.execution.close_comment.clone();
        let report = self.executor.close_all(&comment, &mut self.positions).await;
        if report.closed == report.found && report.outcomes.iter().all(|o| o.is_filled()) {
            self.signals.acknowledge(SignalKind::CloseAll);
        }

        for outcome in report.outcomes.iter().filter(|o| !o.is_filled()) {
            self.emit_execution(outcome);
        }
        self.emit(EngineEvent::ClosedAll {
            found: report.found,
            closed: report.closed,
            positions: self.positions.count(),
        });

        CycleOutcome::Closed(report)
    }

    fn emit_execution(&self, outcome: &ExecutionOutcome) {
        let event = match outcome {
            ExecutionOutcome::Filled {
                request,
                executed_price,
            } => EngineEvent::Filled {
                side: request.side,
                volume: request.volume,
                price: *executed_price,
                stop_loss: request.stop_loss,
                take_profit: request.take_profit,
                positions: self.positions.count(),
            },
            ExecutionOutcome::Rejected {
                request,
                code,
                reason,
            } => EngineEvent::OrderFailed {
                side: Some(request.side),
                code: Some(*code),
                reason: reason.clone(),
            },
            ExecutionOutcome::Failed { reason } => EngineEvent::OrderFailed {
                side: None,
                code: None,
                reason: reason.clone(),
            },
        };
        self.emit(event);
    }

    fn abort(&self, error: EngineError) -> CycleOutcome {
        tracing::warn!(error = %error, "Decision cycle aborted, no order sent");
        let reason = error.to_string();
        self.emit(EngineEvent::CycleAborted {
            reason: reason.clone(),
        });
        CycleOutcome::Aborted { reason }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn positions(&self) -> &PositionStateMachine {
        &self.positions
    }

    pub fn indicator_state(&self) -> Option<&IndicatorState> {
        self.last_state.as_ref()
    }

    pub fn signals(&self) -> &SignalGenerator {
        &self.signals
    }

    pub fn feed(&self) -> &MarketDataFeed {
        &self.feed
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }
}
