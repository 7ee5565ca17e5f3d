use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::models::{Bar, Timeframe};

/// Market regimes for the synthetic price path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketScenario {
    /// Slow upward drift with noise
    Uptrend,
    /// Slow downward drift with noise
    Downtrend,
    /// Mean-free noise
    Sideways,
    /// Large swings, no drift
    Volatile,
}

impl MarketScenario {
    /// (drift, volatility) per bar as a fraction of price
    fn params(&self) -> (f64, f64) {
        match self {
            Self::Uptrend => (0.0004, 0.001),
            Self::Downtrend => (-0.0004, 0.001),
            Self::Sideways => (0.0, 0.001),
            Self::Volatile => (0.0, 0.004),
        }
    }
}

/// Seeded random-walk bar generator backing the paper broker
pub struct SyntheticMarket {
    rng: StdRng,
    scenario: MarketScenario,
    price: f64,
    base_volume: f64,
}

impl SyntheticMarket {
    /// Create a new generator with a seed for reproducibility
    pub fn new(seed: u64, scenario: MarketScenario, start_price: f64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            scenario,
            price: start_price,
            base_volume: 500.0,
        }
    }

    pub fn price(&self) -> f64 {
        self.price
    }

    /// Generate the next bar, opening at the previous close
    pub fn next_bar(&mut self, timestamp: DateTime<Utc>) -> Bar {
        let (drift, vol) = self.scenario.params();
        let open = self.price;
        let change = drift + self.rng.gen_range(-vol..vol);
        let close = (open * (1.0 + change)).max(0.01);

        let wick_up = self.rng.gen_range(0.0..vol) * open;
        let wick_down = self.rng.gen_range(0.0..vol) * open;
        let high = open.max(close) + wick_up;
        let low = (open.min(close) - wick_down).max(0.01);

        let volume = self.base_volume * self.rng.gen_range(0.5..1.5);
        self.price = close;

        Bar {
            timestamp,
            open,
            high,
            low,
            close,
            volume: volume.round(),
        }
    }

    /// Bars at every timeframe boundary in `[start, end)`
    pub fn generate_range(
        &mut self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        timeframe: Timeframe,
    ) -> Vec<Bar> {
        let step = timeframe.duration();
        let mut bars = Vec::new();
        let mut ts = start;

        while ts < end {
            bars.push(self.next_bar(ts));
            ts += step;
        }

        bars
    }
}
