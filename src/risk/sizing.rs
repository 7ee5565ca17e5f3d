use serde::{Deserialize, Serialize};

use crate::config::RiskConfig;
use crate::error::{EngineError, Result};
use crate::models::{round_to, SymbolConstraints};

/// Tolerance when checking that a volume is a whole number of steps
const STEP_EPSILON: f64 = 1e-9;

/// Everything the sizer needs for one decision
#[derive(Debug, Clone, Copy)]
pub struct SizingInput {
    pub atr: f64,
    pub balance: f64,
    pub margin_free: f64,
    /// Margin the broker requires for 1.0 lot at the current price
    pub margin_per_lot: f64,
    pub constraints: SymbolConstraints,
}

/// Broker-compliant volume and protective distances
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SizedOrder {
    pub volume: f64,
    pub raw_volume: f64,
    pub stop_distance: f64,
    pub risk_amount: f64,
    pub stop_points: u32,
    pub take_profit_points: u32,
}

/// Risk-based position sizing from ATR
#[derive(Debug, Clone)]
pub struct PositionSizer {
    pub stop_atr_multiple: f64,
    pub take_profit_multiple: f64,
    pub risk_fraction: f64,
    pub stop_level_buffer_points: u32,
}

impl PositionSizer {
    pub fn from_config(config: &RiskConfig) -> Self {
        Self {
            stop_atr_multiple: config.stop_atr_multiple,
            take_profit_multiple: config.take_profit_multiple,
            risk_fraction: config.risk_fraction,
            stop_level_buffer_points: config.stop_level_buffer_points,
        }
    }

    /// Volume before broker constraints: risk budget, capped by free margin
    pub fn raw_volume(&self, input: &SizingInput) -> Result<(f64, f64, f64)> {
        if !input.atr.is_finite() || input.atr <= 0.0 {
            return Err(EngineError::InvalidVolatility(input.atr));
        }

        let stop_distance = input.atr * self.stop_atr_multiple;
        let risk_amount = input.balance * self.risk_fraction;
        let mut raw = risk_amount / (stop_distance * input.constraints.contract_size);

        if input.margin_per_lot > 0.0 {
            raw = raw.min(input.margin_free / input.margin_per_lot);
        }

        if !raw.is_finite() {
            return Err(EngineError::InvalidVolume(format!(
                "raw volume is not finite (contract size {})",
                input.constraints.contract_size
            )));
        }

        Ok((raw, stop_distance, risk_amount))
    }

    /// Full sizing pipeline
    ///
    /// Either returns a volume inside `[volume_min, volume_max]` that is a
    /// whole number of `volume_step`s, or an error and no order.
    pub fn size(&self, input: &SizingInput) -> Result<SizedOrder> {
        let (raw_volume, stop_distance, risk_amount) = self.raw_volume(input)?;
        let c = &input.constraints;

        let volume = normalize_volume(raw_volume, c)?;

        let min_stop = c.min_stop_level_points + self.stop_level_buffer_points;
        let stop_points = if c.point > 0.0 {
            let pts = (stop_distance / c.point).round();
            (pts.min(u32::MAX as f64) as u32).max(min_stop)
        } else {
            return Err(EngineError::InvalidVolume(format!(
                "instrument point must be > 0, got {}",
                c.point
            )));
        };
        let take_profit_points = (stop_points as f64 * self.take_profit_multiple).round() as u32;

        Ok(SizedOrder {
            volume,
            raw_volume,
            stop_distance,
            risk_amount,
            stop_points,
            take_profit_points,
        })
    }
}

/// Clamp to the broker's range, floor to the step, round to lot precision
pub fn normalize_volume(raw: f64, c: &SymbolConstraints) -> Result<f64> {
    if !(c.volume_step > 0.0) || c.volume_min > c.volume_max {
        return Err(EngineError::InvalidVolume(format!(
            "bad volume constraints: min {} max {} step {}",
            c.volume_min, c.volume_max, c.volume_step
        )));
    }

    let clamped = raw.max(c.volume_min).min(c.volume_max);
    let steps = (clamped / c.volume_step + STEP_EPSILON).floor();
    let volume = round_to(steps * c.volume_step, lot_precision(c.volume_step));

    if volume < c.volume_min - STEP_EPSILON || volume > c.volume_max + STEP_EPSILON {
        return Err(EngineError::InvalidVolume(format!(
            "{} cannot be stepped by {} inside [{}, {}]",
            raw, c.volume_step, c.volume_min, c.volume_max
        )));
    }

    Ok(volume)
}

/// Decimal places implied by the volume step (0.01 -> 2, 0.1 -> 1, 1.0 -> 0)
pub fn lot_precision(step: f64) -> u32 {
    let mut decimals = 0;
    let mut scaled = step;
    while decimals < 8 && (scaled - scaled.round()).abs() > STEP_EPSILON {
        scaled *= 10.0;
        decimals += 1;
    }
    decimals
}

/// True when `volume` is a whole multiple of `step`
pub fn is_step_multiple(volume: f64, step: f64) -> bool {
    let ratio = volume / step;
    (ratio - ratio.round()).abs() < 1e-6
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gold() -> SymbolConstraints {
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

    fn sizer() -> PositionSizer {
        PositionSizer::from_config(&RiskConfig::default())
    }

    fn input(atr: f64) -> SizingInput {
        SizingInput {
            atr,
            balance: 10_000.0,
            margin_free: 100_000.0,
            margin_per_lot: 0.0,
            constraints: gold(),
        }
    }

    #[test]
    fn test_raw_volume_from_risk_budget() {
        let (raw, stop_distance, risk_amount) = sizer().raw_volume(&input(2.0)).unwrap();
        assert!((stop_distance - 4.0).abs() < 1e-12);
        assert!((risk_amount - 200.0).abs() < 1e-12);
        assert!((raw - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_final_volume_is_stepped() {
        let sized = sizer().size(&input(2.0)).unwrap();
        assert_eq!(sized.volume, 0.50);
    }

    #[test]
    fn test_margin_caps_raw_volume() {
        let mut inp = input(2.0);
        inp.margin_free = 50.0;
        inp.margin_per_lot = 200.0;

        let (raw, _, _) = sizer().raw_volume(&inp).unwrap();
        assert!((raw - 0.25).abs() < 1e-12);
        assert_eq!(sizer().size(&inp).unwrap().volume, 0.25);
    }

    #[test]
    fn test_rejects_bad_atr() {
        for atr in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let err = sizer().size(&input(atr)).unwrap_err();
            assert!(matches!(err, EngineError::InvalidVolatility(_)), "atr {}", atr);
        }
    }

    #[test]
    fn test_volume_clamped_into_range() {
        let c = gold();
        assert_eq!(normalize_volume(0.0001, &c).unwrap(), 0.01);
        assert_eq!(normalize_volume(250.0, &c).unwrap(), 10.0);
        assert_eq!(normalize_volume(0.4567, &c).unwrap(), 0.45);
    }

    #[test]
    fn test_volume_invariants_hold_across_inputs() {
        let c = SymbolConstraints {
            volume_min: 0.1,
            volume_max: 50.0,
            volume_step: 0.1,
            ..gold()
        };
        let mut raw = 0.0003;
        while raw < 120.0 {
            let v = normalize_volume(raw, &c).unwrap();
            assert!(v >= c.volume_min && v <= c.volume_max, "{} -> {}", raw, v);
            assert!(is_step_multiple(v, c.volume_step), "{} -> {}", raw, v);
            raw *= 1.37;
        }
    }

    #[test]
    fn test_unsteppable_range_aborts() {
        let c = SymbolConstraints {
            volume_min: 0.15,
            volume_max: 0.19,
            volume_step: 0.1,
            ..gold()
        };
        assert!(matches!(
            normalize_volume(0.17, &c),
            Err(EngineError::InvalidVolume(_))
        ));
    }

    #[test]
    fn test_stop_points_respect_broker_minimum() {
        let mut inp = input(0.01);
        inp.constraints.min_stop_level_points = 30;

        let sized = sizer().size(&inp).unwrap();

        // 0.02 / 0.01 = 2 points, below the 30 + 5 floor
        assert_eq!(sized.stop_points, 35);
        assert_eq!(sized.take_profit_points, 105);
    }

    #[test]
    fn test_stop_points_from_atr() {
        let sized = sizer().size(&input(2.0)).unwrap();
        assert_eq!(sized.stop_points, 400);
        assert_eq!(sized.take_profit_points, 1200);
    }

    #[test]
    fn test_lot_precision() {
        assert_eq!(lot_precision(0.01), 2);
        assert_eq!(lot_precision(0.1), 1);
        assert_eq!(lot_precision(1.0), 0);
        assert_eq!(lot_precision(0.001), 3);
    }
}
