use super::{AtrTracker, SmaTracker};
use crate::models::{Bar, IndicatorState};

/// Fast/slow SMA crossover plus ATR, updated one bar at a time
#[derive(Debug, Clone)]
pub struct IndicatorEngine {
    fast: SmaTracker,
    slow: SmaTracker,
    atr: AtrTracker,
    bars_seen: usize,
    warmup: usize,
    sign: i8,
}

impl IndicatorEngine {
    pub fn new(fast_period: usize, slow_period: usize, atr_period: usize) -> Self {
        Self {
            fast: SmaTracker::new(fast_period),
            slow: SmaTracker::new(slow_period),
            atr: AtrTracker::new(atr_period),
            bars_seen: 0,
            warmup: fast_period.max(slow_period).max(atr_period),
            sign: 0,
        }
    }

    /// Feed one bar and return the resulting state
    pub fn update(&mut self, bar: &Bar) -> IndicatorState {
        let sma_fast = self.fast.update(bar.close);
        let sma_slow = self.slow.update(bar.close);
        let atr = self.atr.update(bar);
        self.bars_seen += 1;

        let previous_sign = self.sign;
        self.sign = match (sma_fast, sma_slow) {
            (Some(fast), Some(slow)) => sign_of(fast - slow),
            _ => 0,
        };

        IndicatorState {
            sma_fast,
            sma_slow,
            atr,
            crossover_sign: self.sign,
            previous_sign,
            ready: self.bars_seen >= self.warmup,
        }
    }

    /// Bars required before signals are considered
    pub fn warmup(&self) -> usize {
        self.warmup
    }

    pub fn bars_seen(&self) -> usize {
        self.bars_seen
    }
}

fn sign_of(diff: f64) -> i8 {
    if diff > 0.0 {
        1
    } else if diff < 0.0 {
        -1
    } else {
        0
    }
}
