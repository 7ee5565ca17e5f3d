/// Average True Range (ATR) indicator
///
/// Measures market volatility by averaging true ranges over a period.
/// True Range is the greatest of:
/// - Current High - Current Low
/// - Abs(Current High - Previous Close)
/// - Abs(Current Low - Previous Close)
///
/// The first bar has no previous close, so its true range is High - Low.
/// The first ATR is the simple mean of the first `period` true ranges,
/// after which Wilder's smoothing is applied.
use crate::models::Bar;

#[derive(Debug, Clone)]
pub struct AtrTracker {
    period: usize,
    prev_close: Option<f64>,
    seed_sum: f64,
    seen: usize,
    atr: Option<f64>,
}

impl AtrTracker {
    pub fn new(period: usize) -> Self {
        Self {
            period,
            prev_close: None,
            seed_sum: 0.0,
            seen: 0,
            atr: None,
        }
    }

    /// Feed one bar, returning the ATR once `period` bars have been seen
    pub fn update(&mut self, bar: &Bar) -> Option<f64> {
        let tr = true_range(bar, self.prev_close);
        self.prev_close = Some(bar.close);
        self.seen += 1;

        if self.period == 0 {
            return None;
        }

        match self.atr {
            Some(prev) => {
                let n = self.period as f64;
                self.atr = Some((prev * (n - 1.0) + tr) / n);
            }
            None => {
                self.seed_sum += tr;
                if self.seen >= self.period {
                    self.atr = Some(self.seed_sum / self.period as f64);
                }
            }
        }

        self.atr
    }

    pub fn value(&self) -> Option<f64> {
        self.atr
    }
}

fn true_range(bar: &Bar, prev_close: Option<f64>) -> f64 {
    let range = bar.high - bar.low;
    match prev_close {
        Some(pc) => range
            .max((bar.high - pc).abs())
            .max((bar.low - pc).abs()),
        None => range,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn create_test_bars(prices: &[(f64, f64, f64, f64)]) -> Vec<Bar> {
        prices
            .iter()
            .enumerate()
            .map(|(i, &(open, high, low, close))| Bar {
                timestamp: Utc::now() + chrono::Duration::minutes(i as i64),
                open,
                high,
                low,
                close,
                volume: 1000.0,
            })
            .collect()
    }

    fn run(tracker: &mut AtrTracker, bars: &[Bar]) -> Option<f64> {
        bars.iter().map(|b| tracker.update(b)).last().flatten()
    }

    #[test]
    fn test_calculate_atr() {
        // Low volatility market
        let candles = create_test_bars(&[(100.0, 101.0, 99.0, 100.0); 15]);
        let mut atr = AtrTracker::new(14);

        let value = run(&mut atr, &candles);

        // ATR should be the 2.0 high-low range
        assert!((value.unwrap() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_calculate_atr_high_volatility() {
        // High volatility market with gaps
        let candles = create_test_bars(&[
            (100.0, 105.0, 95.0, 102.0),
            (102.0, 110.0, 98.0, 105.0),
            (105.0, 108.0, 92.0, 95.0),
            (95.0, 103.0, 88.0, 100.0),
            (100.0, 115.0, 97.0, 110.0),
            (110.0, 112.0, 95.0, 98.0),
            (98.0, 108.0, 90.0, 105.0),
            (105.0, 120.0, 100.0, 115.0),
            (115.0, 118.0, 105.0, 110.0),
            (110.0, 125.0, 108.0, 120.0),
            (120.0, 130.0, 115.0, 125.0),
            (125.0, 128.0, 110.0, 115.0),
            (115.0, 122.0, 105.0, 118.0),
            (118.0, 130.0, 115.0, 125.0),
            (125.0, 135.0, 120.0, 130.0),
        ]);
        let mut atr = AtrTracker::new(14);

        assert!(run(&mut atr, &candles).unwrap() > 10.0);
    }

    #[test]
    fn test_insufficient_data() {
        let candles = create_test_bars(&[(100.0, 101.0, 99.0, 100.0); 13]);
        let mut atr = AtrTracker::new(14);

        assert!(run(&mut atr, &candles).is_none());
    }

    #[test]
    fn test_wilder_smoothing_step() {
        // Three bars with range 2 seed ATR(3) = 2, then a bar gapping to 110
        let mut bars = create_test_bars(&[(100.0, 101.0, 99.0, 100.0); 3]);
        bars.extend(create_test_bars(&[(108.0, 110.0, 108.0, 109.0)]));
        let mut atr = AtrTracker::new(3);

        let value = run(&mut atr, &bars).unwrap();

        // TR = max(2, |110-100|, |108-100|) = 10 -> (2*2 + 10) / 3
        assert!((value - 14.0 / 3.0).abs() < 1e-9);
    }
}
