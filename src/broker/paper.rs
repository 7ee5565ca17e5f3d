use async_trait::async_trait;
use chrono::{DateTime, DurationRound, Utc};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use super::{Broker, SyntheticMarket};
use crate::error::{EngineError, Result};
use crate::models::{
    AccountState, Bar, BrokerPosition, OrderRequest, OrderResult, Side, SymbolConstraints, Tick,
    Timeframe, TRADE_RETCODE_DONE,
};

/// Scripted failure for the next call of a broker operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaperFault {
    Account,
    Constraints,
    Tick,
    Margin,
    Submit,
    Positions,
}

struct PaperState {
    bars: Vec<Bar>,
    tick: Option<Tick>,
    spread: f64,
    account: Option<AccountState>,
    constraints: Option<SymbolConstraints>,
    margin_per_lot: f64,
    order_codes: VecDeque<u32>,
    faults: Vec<PaperFault>,
    orders: Vec<OrderRequest>,
    positions: Vec<BrokerPosition>,
    next_ticket: u64,
    market: Option<SyntheticMarket>,
}

/// In-memory broker for dry runs and tests
///
/// Orders fill at the request price unless a result code has been queued.
/// A fill opposite to an open position of the same volume closes it and
/// books the profit into the balance.
pub struct PaperBroker {
    symbol: String,
    state: Mutex<PaperState>,
}

impl PaperBroker {
    pub fn new(symbol: impl Into<String>, balance: f64) -> Self {
        Self {
            symbol: symbol.into(),
            state: Mutex::new(PaperState {
                bars: Vec::new(),
                tick: None,
                spread: 0.0,
                account: Some(AccountState {
                    balance,
                    margin_free: balance,
                }),
                constraints: Some(default_constraints()),
                margin_per_lot: 0.0,
                order_codes: VecDeque::new(),
                faults: Vec::new(),
                orders: Vec::new(),
                positions: Vec::new(),
                next_ticket: 1,
                market: None,
            }),
        }
    }

    /// Drive bars and ticks from a synthetic random walk
    pub fn with_market(self, market: SyntheticMarket) -> Self {
        self.lock().market = Some(market);
        self
    }

    fn lock(&self) -> MutexGuard<'_, PaperState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push_bar(&self, bar: Bar) {
        self.lock().bars.push(bar);
    }

    pub fn set_tick(&self, tick: Option<Tick>) {
        self.lock().tick = tick;
    }

    /// Spread applied to ticks derived from the last bar
    pub fn set_spread(&self, spread: f64) {
        self.lock().spread = spread;
    }

    pub fn set_account(&self, account: Option<AccountState>) {
        self.lock().account = account;
    }

    pub fn set_constraints(&self, constraints: Option<SymbolConstraints>) {
        self.lock().constraints = constraints;
    }

    pub fn set_margin_per_lot(&self, margin: f64) {
        self.lock().margin_per_lot = margin;
    }

    /// Result code for the next submitted order
    pub fn queue_order_code(&self, code: u32) {
        self.lock().order_codes.push_back(code);
    }

    /// Make the next call of `fault` fail
    pub fn inject_fault(&self, fault: PaperFault) {
        self.lock().faults.push(fault);
    }

    pub fn add_position(&self, side: Side, volume: f64, open_price: f64) -> u64 {
        let mut state = self.lock();
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.positions.push(BrokerPosition {
            ticket,
            symbol: self.symbol.clone(),
            side,
            volume,
            open_price,
            profit: 0.0,
        });
        ticket
    }

    pub fn submitted_orders(&self) -> Vec<OrderRequest> {
        self.lock().orders.clone()
    }

    pub fn positions(&self) -> Vec<BrokerPosition> {
        self.lock().positions.clone()
    }

    fn take_fault(state: &mut PaperState, fault: PaperFault) -> bool {
        match state.faults.iter().position(|f| *f == fault) {
            Some(idx) => {
                state.faults.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Advance the synthetic market when a new timeframe bucket starts
    fn advance_market(&self, state: &mut PaperState, timeframe: Timeframe) {
        let now = Utc::now();
        let bucket = now.duration_trunc(timeframe.duration()).unwrap_or(now);
        let is_new = state.bars.last().map_or(true, |b| b.timestamp < bucket);

        if let (true, Some(market)) = (is_new, state.market.as_mut()) {
            let bar = market.next_bar(bucket);
            state.bars.push(bar);
        }
    }

    fn derived_tick(state: &PaperState) -> Option<Tick> {
        state.tick.clone().or_else(|| {
            state.bars.last().map(|b| Tick {
                timestamp: b.timestamp,
                bid: b.close,
                ask: b.close + state.spread,
            })
        })
    }

    fn fill(&self, state: &mut PaperState, request: &OrderRequest) {
        let contract_size = state
            .constraints
            .map(|c| c.contract_size)
            .unwrap_or(1.0);

        let closing = state.positions.iter().position(|p| {
            p.symbol == request.symbol
                && p.side == request.side.opposite()
                && (p.volume - request.volume).abs() < 1e-9
        });

        match closing {
            Some(idx) => {
                let position = state.positions.remove(idx);
                let direction = match position.side {
                    Side::Buy => 1.0,
                    Side::Sell => -1.0,
                };
                let pnl = (request.price - position.open_price)
                    * position.volume
                    * contract_size
                    * direction;
                if let Some(account) = state.account.as_mut() {
                    account.balance += pnl;
                    account.margin_free += pnl;
                }
            }
            None => {
                let ticket = state.next_ticket;
                state.next_ticket += 1;
                state.positions.push(BrokerPosition {
                    ticket,
                    symbol: request.symbol.clone(),
                    side: request.side,
                    volume: request.volume,
                    open_price: request.price,
                    profit: 0.0,
                });
            }
        }
    }
}

#[async_trait]
impl Broker for PaperBroker {
    async fn fetch_recent_bars(
        &self,
        _symbol: &str,
        timeframe: Timeframe,
        count: usize,
    ) -> Result<Vec<Bar>> {
        let mut state = self.lock();
        self.advance_market(&mut state, timeframe);

        let start = state.bars.len().saturating_sub(count);
        Ok(state.bars[start..].to_vec())
    }

    async fn fetch_latest_tick(&self, _symbol: &str) -> Result<Option<Tick>> {
        let mut state = self.lock();
        if Self::take_fault(&mut state, PaperFault::Tick) {
            return Err(EngineError::DataUnavailable("paper: tick fault".into()));
        }
        if state.market.is_some() && state.tick.is_none() {
            // Ticks follow the synthetic bar stream at M1 granularity
            self.advance_market(&mut state, Timeframe::M1);
        }
        Ok(Self::derived_tick(&state))
    }

    async fn fetch_historical_range(
        &self,
        _symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bar>> {
        let mut state = self.lock();

        if state.bars.is_empty() {
            if let Some(market) = state.market.as_mut() {
                let start = start.duration_trunc(timeframe.duration()).unwrap_or(start);
                let history = market.generate_range(start, end, timeframe);
                state.bars = history;
            }
        }

        Ok(state
            .bars
            .iter()
            .filter(|b| b.timestamp >= start && b.timestamp <= end)
            .cloned()
            .collect())
    }

    async fn account_state(&self) -> Result<AccountState> {
        let mut state = self.lock();
        if Self::take_fault(&mut state, PaperFault::Account) {
            return Err(EngineError::AccountInfoUnavailable("paper: account fault".into()));
        }
        state
            .account
            .ok_or_else(|| EngineError::AccountInfoUnavailable("paper: no account".into()))
    }

    async fn symbol_constraints(&self, symbol: &str) -> Result<SymbolConstraints> {
        let mut state = self.lock();
        if Self::take_fault(&mut state, PaperFault::Constraints) {
            return Err(EngineError::ConstraintsUnavailable(format!(
                "paper: constraints fault for {}",
                symbol
            )));
        }
        state.constraints.ok_or_else(|| {
            EngineError::ConstraintsUnavailable(format!("paper: unknown symbol {}", symbol))
        })
    }

    async fn estimate_margin_per_lot(
        &self,
        _symbol: &str,
        _side: Side,
        _price: f64,
    ) -> Result<f64> {
        let mut state = self.lock();
        if Self::take_fault(&mut state, PaperFault::Margin) {
            return Err(EngineError::Execution("paper: margin fault".into()));
        }
        Ok(state.margin_per_lot)
    }

    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderResult> {
        let mut state = self.lock();
        if Self::take_fault(&mut state, PaperFault::Submit) {
            return Err(EngineError::Execution("paper: connection lost".into()));
        }

        state.orders.push(request.clone());
        let code = state.order_codes.pop_front().unwrap_or(TRADE_RETCODE_DONE);

        if code != TRADE_RETCODE_DONE {
            return Ok(OrderResult::from_code(code, 0.0, "paper: scripted rejection"));
        }

        self.fill(&mut state, request);
        Ok(OrderResult::done(request.price))
    }

    async fn open_positions(&self, symbol: &str) -> Result<Vec<BrokerPosition>> {
        let mut state = self.lock();
        if Self::take_fault(&mut state, PaperFault::Positions) {
            return Err(EngineError::Execution("paper: positions fault".into()));
        }
        Ok(state
            .positions
            .iter()
            .filter(|p| p.symbol == symbol)
            .cloned()
            .collect())
    }
}

/// Spot-gold-like instrument
fn default_constraints() -> SymbolConstraints {
    SymbolConstraints {
        point: 0.01,
        digits: 2,
        volume_min: 0.01,
        volume_max: 10.0,
        volume_step: 0.01,
        contract_size: 100.0,
        min_stop_level_points: 0,
    }
}
