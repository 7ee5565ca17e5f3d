use std::collections::VecDeque;

/// Incremental Simple Moving Average (SMA)
///
/// Keeps the last `period` values and a running sum, so each update is O(1).
#[derive(Debug, Clone)]
pub struct SmaTracker {
    period: usize,
    window: VecDeque<f64>,
    sum: f64,
}

impl SmaTracker {
    pub fn new(period: usize) -> Self {
        Self {
            period,
            window: VecDeque::with_capacity(period + 1),
            sum: 0.0,
        }
    }

    /// Push a new value and return the average, if `period` values have been seen
    pub fn update(&mut self, value: f64) -> Option<f64> {
        self.window.push_back(value);
        self.sum += value;

        if self.window.len() > self.period {
            if let Some(old) = self.window.pop_front() {
                self.sum -= old;
            }
        }

        self.value()
    }

    pub fn value(&self) -> Option<f64> {
        if self.period == 0 || self.window.len() < self.period {
            return None;
        }
        Some(self.sum / self.period as f64)
    }

    pub fn period(&self) -> usize {
        self.period
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sma() {
        let mut sma = SmaTracker::new(5);
        let mut last = None;
        for price in [100.0, 102.0, 104.0, 106.0, 108.0] {
            last = sma.update(price);
        }
        assert_eq!(last, Some(104.0));
    }

    #[test]
    fn test_sma_insufficient_data() {
        let mut sma = SmaTracker::new(5);
        assert!(sma.update(100.0).is_none());
        assert!(sma.update(102.0).is_none());
        assert!(sma.value().is_none());
    }

    #[test]
    fn test_sma_rolls_window() {
        let mut sma = SmaTracker::new(3);
        for price in [1.0, 2.0, 3.0, 4.0, 5.0] {
            sma.update(price);
        }
        // Last three: 3, 4, 5
        assert_eq!(sma.value(), Some(4.0));
    }
}
