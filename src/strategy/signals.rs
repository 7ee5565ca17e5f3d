use chrono::{DateTime, DurationRound, TimeDelta, Utc};

use crate::config::CrossoverPolicy;
use crate::models::{AccountState, IndicatorState, Signal, SignalKind};

/// Truncate a timestamp to the start of its minute
pub fn minute_bucket(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(TimeDelta::minutes(1)).unwrap_or(ts)
}

/// Turns indicator state into at most one decision per minute bucket
///
/// Under the transition policy a crossover is held as pending from the bar
/// it happens on until the engine reports it as carried out, so a cycle that
/// aborts or an order the broker rejects does not lose the cross.
#[derive(Debug, Clone)]
pub struct SignalGenerator {
    max_positions: usize,
    policy: CrossoverPolicy,
    last_bucket: Option<DateTime<Utc>>,
    pending: Option<SignalKind>,
}

impl SignalGenerator {
    pub fn new(max_positions: usize, policy: CrossoverPolicy) -> Self {
        Self {
            max_positions,
            policy,
            last_bucket: None,
            pending: None,
        }
    }

    /// Track crossovers; must see every bar, including ones that are not evaluated
    ///
    /// A cross in the opposite direction replaces the pending one.
    pub fn observe(&mut self, state: &IndicatorState) {
        let cross = if state.is_golden_cross() {
            SignalKind::OpenLong
        } else if state.is_death_cross() {
            SignalKind::CloseAll
        } else {
            return;
        };

        if let Some(previous) = self.pending.replace(cross) {
            if previous != cross {
                tracing::debug!(?previous, ?cross, "Pending crossover reversed");
            }
        }
    }

    /// Mark the pending cross of `kind` as carried out
    pub fn acknowledge(&mut self, kind: SignalKind) {
        if self.pending == Some(kind) {
            self.pending = None;
        }
    }

    /// Forget any pending cross (used for replayed history)
    pub fn discard_pending(&mut self) {
        self.pending = None;
    }

    pub fn pending(&self) -> Option<SignalKind> {
        self.pending
    }

    /// Cheap pre-check so the caller can skip the account fetch
    ///
    /// False when indicators are warming up or this bucket was already acted on.
    pub fn is_candidate(&self, state: &IndicatorState, bucket: DateTime<Utc>) -> bool {
        state.ready && self.last_bucket != Some(bucket)
    }

    /// Decide what to do for the bar at `timestamp`
    ///
    /// An actionable outcome marks the bucket as used before anything is
    /// executed, so a failed order is not retried inside the same minute.
    pub fn evaluate(
        &mut self,
        state: &IndicatorState,
        timestamp: DateTime<Utc>,
        position_count: usize,
        account: Option<&AccountState>,
    ) -> Signal {
        let bucket = minute_bucket(timestamp);

        if !self.is_candidate(state, bucket) || account.is_none() {
            return Signal::none(bucket);
        }

        let (bullish, bearish) = match self.policy {
            CrossoverPolicy::Transition => (
                self.pending == Some(SignalKind::OpenLong) && state.crossover_sign > 0,
                self.pending == Some(SignalKind::CloseAll) && state.crossover_sign < 0,
            ),
            CrossoverPolicy::Level => (state.crossover_sign > 0, state.crossover_sign < 0),
        };

        let kind = if bullish && position_count < self.max_positions {
            SignalKind::OpenLong
        } else if bearish {
            SignalKind::CloseAll
        } else {
            SignalKind::None
        };

        if kind != SignalKind::None {
            self.last_bucket = Some(bucket);
            tracing::debug!(?kind, %bucket, "Signal recorded for bucket");
        }

        Signal { kind, bucket }
    }

    pub fn last_bucket(&self) -> Option<DateTime<Utc>> {
        self.last_bucket
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    fn state(prev: i8, sign: i8, ready: bool) -> IndicatorState {
        IndicatorState {
            sma_fast: Some(101.0),
            sma_slow: Some(100.0),
            atr: Some(2.0),
            crossover_sign: sign,
            previous_sign: prev,
            ready,
        }
    }

    fn at(min: u32, sec: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 20, 10, min, sec).unwrap()
    }

    const ACCOUNT: AccountState = AccountState {
        balance: 10_000.0,
        margin_free: 10_000.0,
    };

    #[test]
    fn test_minute_bucket_truncates() {
        let bucket = minute_bucket(at(7, 42));
        assert_eq!(bucket.minute(), 7);
        assert_eq!(bucket.second(), 0);
    }

    #[test]
    fn test_no_signal_while_warming_up() {
        let mut gen = SignalGenerator::new(1, CrossoverPolicy::Transition);
        let signal = gen.evaluate(&state(0, 1, false), at(0, 0), 0, Some(&ACCOUNT));
        assert_eq!(signal.kind, SignalKind::None);
        assert!(gen.last_bucket().is_none());
    }

    #[test]
    fn test_no_signal_without_account() {
        let mut gen = SignalGenerator::new(1, CrossoverPolicy::Transition);
        let signal = gen.evaluate(&state(0, 1, true), at(0, 0), 0, None);
        assert_eq!(signal.kind, SignalKind::None);
    }

    #[test]
    fn test_golden_cross_opens_long() {
        let mut gen = SignalGenerator::new(1, CrossoverPolicy::Transition);
        gen.observe(&state(-1, 1, true));
        let signal = gen.evaluate(&state(-1, 1, true), at(1, 5), 0, Some(&ACCOUNT));
        assert_eq!(signal.kind, SignalKind::OpenLong);
        assert_eq!(signal.bucket, at(1, 0));
    }

    #[test]
    fn test_max_positions_blocks_open() {
        let mut gen = SignalGenerator::new(1, CrossoverPolicy::Transition);
        gen.observe(&state(-1, 1, true));
        let signal = gen.evaluate(&state(-1, 1, true), at(1, 5), 1, Some(&ACCOUNT));
        assert_eq!(signal.kind, SignalKind::None);
        // Still waiting for room
        assert_eq!(gen.pending(), Some(SignalKind::OpenLong));
    }

    #[test]
    fn test_death_cross_closes_all() {
        let mut gen = SignalGenerator::new(1, CrossoverPolicy::Transition);
        gen.observe(&state(1, -1, true));
        let signal = gen.evaluate(&state(1, -1, true), at(2, 0), 1, Some(&ACCOUNT));
        assert_eq!(signal.kind, SignalKind::CloseAll);
    }

    #[test]
    fn test_one_action_per_bucket() {
        let mut gen = SignalGenerator::new(5, CrossoverPolicy::Level);

        let first = gen.evaluate(&state(1, 1, true), at(3, 1), 0, Some(&ACCOUNT));
        let second = gen.evaluate(&state(1, 1, true), at(3, 59), 1, Some(&ACCOUNT));
        let next_minute = gen.evaluate(&state(1, 1, true), at(4, 0), 1, Some(&ACCOUNT));

        assert_eq!(first.kind, SignalKind::OpenLong);
        assert_eq!(second.kind, SignalKind::None);
        assert_eq!(next_minute.kind, SignalKind::OpenLong);
    }

    #[test]
    fn test_transition_policy_ignores_steady_sign() {
        let mut gen = SignalGenerator::new(5, CrossoverPolicy::Transition);
        let signal = gen.evaluate(&state(1, 1, true), at(5, 0), 0, Some(&ACCOUNT));
        assert_eq!(signal.kind, SignalKind::None);
        // A None outcome does not consume the bucket
        assert!(gen.is_candidate(&state(1, 1, true), at(5, 0)));
    }

    #[test]
    fn test_cross_survives_missing_account() {
        let mut gen = SignalGenerator::new(1, CrossoverPolicy::Transition);

        gen.observe(&state(-1, 1, true));
        let missed = gen.evaluate(&state(-1, 1, true), at(3, 0), 0, None);
        assert_eq!(missed.kind, SignalKind::None);

        // Later bar in the same minute: sign unchanged, cross still pending
        gen.observe(&state(1, 1, true));
        let retry = gen.evaluate(&state(1, 1, true), at(3, 30), 0, Some(&ACCOUNT));
        assert_eq!(retry.kind, SignalKind::OpenLong);
    }

    #[test]
    fn test_pending_cross_kept_until_acknowledged() {
        let mut gen = SignalGenerator::new(1, CrossoverPolicy::Transition);
        gen.observe(&state(-1, 1, true));

        let first = gen.evaluate(&state(-1, 1, true), at(3, 0), 0, Some(&ACCOUNT));
        assert_eq!(first.kind, SignalKind::OpenLong);

        // Order did not go through: next minute tries again
        gen.observe(&state(1, 1, true));
        let next = gen.evaluate(&state(1, 1, true), at(4, 0), 0, Some(&ACCOUNT));
        assert_eq!(next.kind, SignalKind::OpenLong);

        gen.acknowledge(SignalKind::OpenLong);
        assert!(gen.pending().is_none());
        let after = gen.evaluate(&state(1, 1, true), at(5, 0), 0, Some(&ACCOUNT));
        assert_eq!(after.kind, SignalKind::None);
    }

    #[test]
    fn test_opposite_cross_cancels_pending() {
        let mut gen = SignalGenerator::new(1, CrossoverPolicy::Transition);
        gen.observe(&state(-1, 1, true));
        gen.observe(&state(1, -1, true));
        assert_eq!(gen.pending(), Some(SignalKind::CloseAll));

        // Acknowledging the stale direction changes nothing
        gen.acknowledge(SignalKind::OpenLong);
        assert_eq!(gen.pending(), Some(SignalKind::CloseAll));

        let signal = gen.evaluate(&state(-1, -1, true), at(6, 0), 0, Some(&ACCOUNT));
        assert_eq!(signal.kind, SignalKind::CloseAll);
    }
}
