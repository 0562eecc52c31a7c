//! Cumulative fatigue from heart-rate reserve
//!
//! # Model
//!
//! Effort is expressed as heart-rate reserve (HRR), the share of the span between
//! resting and maximum heart rate currently in use:
//!
//! ```text
//! HRR = (avgHR - restingHR) / (maxHR - restingHR) x 100      (truncated)
//! ```
//!
//! Above the critical-power threshold the wearer spends anaerobic work capacity;
//! below it they recover, 2.4 times faster than they spent it:
//!
//! ```text
//! delta = HRR - criticalPower
//! W = max(W + k x delta, 0)          if delta > 0
//! W = max(W + 2.4 x k x delta, 0)    otherwise
//! fatigue = W / totalAWC x 100       (truncated, not capped)
//! ```
//!
//! The accumulated expenditure `W` persists across cycles for the whole session.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::buffer::SampleBuffer;
use crate::models::CalibrationProfile;

/// Recovery runs this much faster than depletion below critical power
pub const RECOVERY_MULTIPLIER: f64 = 2.4;

/// Session-scoped work-capacity accumulator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccumulatorState {
    accumulated_work_expenditure: f64,
    calibration: CalibrationProfile,
    max_heart_rate: i64,
}

impl AccumulatorState {
    pub fn new(calibration: CalibrationProfile) -> Self {
        Self {
            accumulated_work_expenditure: 0.0,
            max_heart_rate: calibration.max_heart_rate(),
            calibration,
        }
    }

    /// Resume from a previously committed expenditure; negative inputs clamp to zero
    pub fn with_expenditure(calibration: CalibrationProfile, expenditure: f64) -> Self {
        let mut state = Self::new(calibration);
        state.accumulated_work_expenditure = expenditure.max(0.0);
        state
    }

    pub fn accumulated_work_expenditure(&self) -> f64 {
        self.accumulated_work_expenditure
    }

    pub fn calibration(&self) -> &CalibrationProfile {
        &self.calibration
    }

    pub fn max_heart_rate(&self) -> i64 {
        self.max_heart_rate
    }

    /// Truncated heart-rate reserve percentage for an average heart rate
    pub fn heart_rate_reserve(&self, average_heart_rate: i64) -> i64 {
        let resting = self.calibration.resting_heart_rate as f64;
        let span = self.max_heart_rate as f64 - resting;
        ((average_heart_rate as f64 - resting) / span * 100.0) as i64
    }

    /// Apply one cycle's effort to the accumulator; never leaves it negative
    pub fn apply(&mut self, heart_rate_reserve: i64) -> f64 {
        // Degenerate calibration saturates the reserve at the i64 bounds
        let delta = heart_rate_reserve as f64 - self.calibration.hr_reserve_critical_power as f64;
        let k = self.calibration.k_value as f64;
        let step = if delta > 0.0 {
            k * delta
        } else {
            RECOVERY_MULTIPLIER * k * delta
        };
        self.accumulated_work_expenditure = (self.accumulated_work_expenditure + step).max(0.0);
        self.accumulated_work_expenditure
    }

    /// Truncated, uncapped fatigue percentage for the current expenditure
    pub fn fatigue_score(&self) -> i64 {
        let total = self.calibration.total_anaerobic_work_capacity as f64;
        (self.accumulated_work_expenditure / total * 100.0) as i64
    }
}

/// Result of a cycle that had heart-rate data
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FatigueResult {
    pub average_heart_rate: i64,
    pub heart_rate_reserve: i64,
    pub accumulated_work_expenditure: f64,
    /// May exceed 100
    pub fatigue_score: i64,
}

impl FatigueResult {
    /// Score clamped to the displayable 0..=100 range
    pub fn display_score(&self) -> i64 {
        self.fatigue_score.clamp(0, 100)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FatigueOutcome {
    /// Empty heart-rate buffer: accumulator untouched, nothing to record
    NoOp,
    Assessed(FatigueResult),
}

impl FatigueOutcome {
    pub fn result(&self) -> Option<&FatigueResult> {
        match self {
            FatigueOutcome::NoOp => None,
            FatigueOutcome::Assessed(result) => Some(result),
        }
    }
}

/// Converts a cycle's buffered heart rate into a fatigue score
#[derive(Debug, Default, Clone, Copy)]
pub struct FatigueEstimator;

impl FatigueEstimator {
    pub fn new() -> Self {
        Self
    }

    pub fn assess(&self, buffer: &SampleBuffer, state: &mut AccumulatorState) -> FatigueOutcome {
        let average_heart_rate = buffer.average_heart_rate();
        if average_heart_rate == 0 {
            debug!("no heart-rate data this cycle");
            return FatigueOutcome::NoOp;
        }

        let heart_rate_reserve = state.heart_rate_reserve(average_heart_rate);
        let accumulated_work_expenditure = state.apply(heart_rate_reserve);
        let fatigue_score = state.fatigue_score();

        debug!(
            average_heart_rate,
            heart_rate_reserve,
            accumulated_work_expenditure,
            fatigue_score,
            "fatigue assessed"
        );

        FatigueOutcome::Assessed(FatigueResult {
            average_heart_rate,
            heart_rate_reserve,
            accumulated_work_expenditure,
            fatigue_score,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Sample;

    fn reference_calibration() -> CalibrationProfile {
        CalibrationProfile {
            resting_heart_rate: 65,
            hr_reserve_critical_power: 15,
            total_anaerobic_work_capacity: 200,
            k_value: 15,
            age: 30,
        }
    }

    fn buffer_with(bpm: f64) -> SampleBuffer {
        let mut buffer = SampleBuffer::new(187);
        buffer.observe(&Sample::ibi(60.0 / bpm, 0.0));
        buffer
    }

    #[test]
    fn test_effort_then_rest_scenario() {
        let estimator = FatigueEstimator::new();
        let mut state = AccumulatorState::new(reference_calibration());
        assert_eq!(state.max_heart_rate(), 187);

        let first = estimator.assess(&buffer_with(140.0), &mut state);
        let first = first.result().copied().unwrap();
        assert_eq!(first.heart_rate_reserve, 61);
        assert_eq!(first.accumulated_work_expenditure, 690.0);
        assert_eq!(first.fatigue_score, 345);
        assert_eq!(first.display_score(), 100);

        let second = estimator.assess(&buffer_with(65.0), &mut state);
        let second = second.result().copied().unwrap();
        assert_eq!(second.heart_rate_reserve, 0);
        assert!((second.accumulated_work_expenditure - 150.0).abs() < 1e-9);
        assert_eq!(second.fatigue_score, 75);
    }

    #[test]
    fn test_empty_buffer_is_idempotent_noop() {
        let estimator = FatigueEstimator::new();
        let mut state = AccumulatorState::with_expenditure(reference_calibration(), 320.0);
        let empty = SampleBuffer::new(187);

        for _ in 0..5 {
            assert_eq!(estimator.assess(&empty, &mut state), FatigueOutcome::NoOp);
        }
        assert_eq!(state.accumulated_work_expenditure(), 320.0);
    }

    #[test]
    fn test_recovery_is_2_4_times_depletion() {
        let mut state = AccumulatorState::with_expenditure(reference_calibration(), 10_000.0);
        let before = state.accumulated_work_expenditure();
        let after_up = state.apply(15 + 10);
        let after_down = state.apply(15 - 10);

        let increase = after_up - before;
        let decrease = after_up - after_down;
        assert_eq!(increase, 150.0);
        assert!((decrease / increase - 2.4).abs() < 1e-12);
    }

    #[test]
    fn test_at_critical_power_counts_as_recovery_branch() {
        let mut state = AccumulatorState::with_expenditure(reference_calibration(), 100.0);
        // delta == 0 takes the recovery branch, which moves by zero
        assert_eq!(state.apply(15), 100.0);
    }

    #[test]
    fn test_negative_resume_clamps_to_zero() {
        let state = AccumulatorState::with_expenditure(reference_calibration(), -42.0);
        assert_eq!(state.accumulated_work_expenditure(), 0.0);
    }

    #[test]
    fn test_heart_rate_below_resting_truncates_toward_zero() {
        let state = AccumulatorState::new(reference_calibration());
        // (60 - 65) / 122 x 100 = -4.09
        assert_eq!(state.heart_rate_reserve(60), -4);
    }

    #[test]
    fn test_resting_equal_to_max_heart_rate_does_not_panic() {
        let calibration = CalibrationProfile {
            resting_heart_rate: 187,
            ..reference_calibration()
        };
        assert!(calibration.is_degenerate());
        let estimator = FatigueEstimator::new();
        let mut state = AccumulatorState::new(calibration);

        let outcome = estimator.assess(&buffer_with(100.0), &mut state);
        let result = outcome.result().copied().unwrap();
        assert_eq!(result.heart_rate_reserve, i64::MIN);
        assert_eq!(result.accumulated_work_expenditure, 0.0);
        assert_eq!(result.fatigue_score, 0);

        // Saturated positive reserve stays finite
        let expenditure = state.apply(i64::MAX);
        assert!(expenditure.is_finite() && expenditure > 0.0);
        assert_eq!(state.fatigue_score(), i64::MAX);
    }

    use proptest::prelude::*;

    proptest! {
        #[test]
        fn test_accumulator_never_negative(
            reserves in proptest::collection::vec(-60i64..120i64, 1..300),
            k in 0i32..40,
            critical_power in 0i32..60
        ) {
            let calibration = CalibrationProfile {
                k_value: k,
                hr_reserve_critical_power: critical_power,
                ..reference_calibration()
            };
            let mut state = AccumulatorState::new(calibration);
            for reserve in reserves {
                prop_assert!(state.apply(reserve) >= 0.0);
                prop_assert!(state.accumulated_work_expenditure() >= 0.0);
            }
        }
    }
}
