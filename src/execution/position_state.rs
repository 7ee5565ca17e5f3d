use chrono::{DateTime, Utc};
use serde::Serialize;

/// Lifecycle of the strategy's exposure on one symbol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PositionPhase {
    /// Nothing opened since start
    NoPosition,
    Open,
    /// Everything opened so far has been closed
    Closed,
}

/// Entry details of the most recent fill, kept for logging
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntryRecord {
    pub price: f64,
    pub volume: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub time: DateTime<Utc>,
}

/// Bounded open-position counter
///
/// Position identity lives at the broker; this only tracks how many
/// entries the engine has confirmed so it can enforce `max_positions`.
/// Close-all reconciles against the broker, so drift here is tolerated.
#[derive(Debug, Clone)]
pub struct PositionStateMachine {
    count: usize,
    max_positions: usize,
    phase: PositionPhase,
    last_entry: Option<EntryRecord>,
}

impl PositionStateMachine {
    pub fn new(max_positions: usize) -> Self {
        Self {
            count: 0,
            max_positions,
            phase: PositionPhase::NoPosition,
            last_entry: None,
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn max_positions(&self) -> usize {
        self.max_positions
    }

    pub fn phase(&self) -> PositionPhase {
        self.phase
    }

    pub fn can_open(&self) -> bool {
        self.count < self.max_positions
    }

    pub fn last_entry(&self) -> Option<&EntryRecord> {
        self.last_entry.as_ref()
    }

    /// Confirmed entry fill
    pub fn record_open(&mut self, entry: EntryRecord) {
        if self.count >= self.max_positions {
            tracing::warn!(
                count = self.count,
                max = self.max_positions,
                "Fill confirmed at position limit, counter stays capped"
            );
        } else {
            self.count += 1;
        }
        self.phase = PositionPhase::Open;
        self.last_entry = Some(entry);
    }

    /// Confirmed closure of one broker position
    pub fn record_close(&mut self) {
        self.count = self.count.saturating_sub(1);
        if self.count == 0 && self.phase == PositionPhase::Open {
            self.phase = PositionPhase::Closed;
        }
    }
}
