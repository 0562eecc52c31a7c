//! Per-cycle sample buffering with heart-rate plausibility filtering
//!
//! Heart rate arrives as inter-beat intervals and is filtered on the way in:
//! discontinuities, rates above the session maximum and jumps of 30 bpm or more
//! away from the running average are dropped. Auxiliary channels are stored
//! verbatim, keyed by a timestamp label so a repeated label overwrites.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::trace;

use crate::models::{timestamp_label, Sample, SampleKind};

/// Default rejection distance from the running average, in bpm
pub const DEFAULT_OUTLIER_THRESHOLD_BPM: i64 = 30;

/// Outcome of offering one sample to the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    /// Inter-beat interval of zero (or otherwise unusable): a sensor discontinuity
    RejectedDiscontinuity,
    /// Derived heart rate above the session's age-predicted maximum
    RejectedAboveMax,
    /// Too far from the current buffer average
    RejectedOutlier,
}

impl Admission {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Admission::Accepted)
    }
}

/// One accepted heart-rate reading
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeartRateSample {
    pub bpm: i64,
    pub timestamp: f64,
}

/// Channel buffers for the current assessment cycle
#[derive(Debug, Clone)]
pub struct SampleBuffer {
    max_heart_rate: i64,
    outlier_threshold_bpm: i64,
    heart_rates: Vec<HeartRateSample>,
    gsr: BTreeMap<String, f64>,
    bvp: BTreeMap<String, f64>,
    skin_temperature: BTreeMap<String, f64>,
}

impl SampleBuffer {
    pub fn new(max_heart_rate: i64) -> Self {
        Self::with_outlier_threshold(max_heart_rate, DEFAULT_OUTLIER_THRESHOLD_BPM)
    }

    pub fn with_outlier_threshold(max_heart_rate: i64, outlier_threshold_bpm: i64) -> Self {
        Self {
            max_heart_rate,
            outlier_threshold_bpm,
            heart_rates: Vec::new(),
            gsr: BTreeMap::new(),
            bvp: BTreeMap::new(),
            skin_temperature: BTreeMap::new(),
        }
    }

    pub fn max_heart_rate(&self) -> i64 {
        self.max_heart_rate
    }

    /// Offer a sample to the channel buffer for its kind
    pub fn observe(&mut self, sample: &Sample) -> Admission {
        match sample.kind {
            SampleKind::InterBeatInterval => self.observe_ibi(sample.value, sample.timestamp),
            SampleKind::Gsr => {
                self.gsr.insert(timestamp_label(sample.timestamp), sample.value);
                Admission::Accepted
            }
            SampleKind::Bvp => {
                self.bvp.insert(timestamp_label(sample.timestamp), sample.value);
                Admission::Accepted
            }
            SampleKind::SkinTemperature => {
                self.skin_temperature
                    .insert(timestamp_label(sample.timestamp), sample.value);
                Admission::Accepted
            }
        }
    }

    fn observe_ibi(&mut self, ibi: f64, timestamp: f64) -> Admission {
        if ibi <= 0.0 || !ibi.is_finite() {
            trace!(ibi, "discontinuity");
            return Admission::RejectedDiscontinuity;
        }

        let heart_rate = (60.0 / ibi) as i64;
        if heart_rate > self.max_heart_rate {
            trace!(heart_rate, max = self.max_heart_rate, "implausible heart rate");
            return Admission::RejectedAboveMax;
        }

        if !self.heart_rates.is_empty() {
            let average = self.average_heart_rate();
            if (heart_rate - average).abs() >= self.outlier_threshold_bpm {
                trace!(heart_rate, average, "heart rate outlier");
                return Admission::RejectedOutlier;
            }
        }

        self.heart_rates.push(HeartRateSample {
            bpm: heart_rate,
            timestamp,
        });
        Admission::Accepted
    }

    /// Truncating integer mean of accepted heart rates; 0 means "no data"
    pub fn average_heart_rate(&self) -> i64 {
        if self.heart_rates.is_empty() {
            return 0;
        }
        let sum: i64 = self.heart_rates.iter().map(|s| s.bpm).sum();
        sum / self.heart_rates.len() as i64
    }

    pub fn heart_rates(&self) -> &[HeartRateSample] {
        &self.heart_rates
    }

    /// Heart-rate series keyed by timestamp label, for raw channel persistence
    pub fn heart_rate_map(&self) -> BTreeMap<String, i64> {
        self.heart_rates
            .iter()
            .map(|s| (timestamp_label(s.timestamp), s.bpm))
            .collect()
    }

    pub fn gsr(&self) -> &BTreeMap<String, f64> {
        &self.gsr
    }

    pub fn bvp(&self) -> &BTreeMap<String, f64> {
        &self.bvp
    }

    pub fn skin_temperature(&self) -> &BTreeMap<String, f64> {
        &self.skin_temperature
    }

    pub fn clear_heart_rates(&mut self) {
        self.heart_rates.clear();
    }

    pub fn clear_auxiliary(&mut self) {
        self.gsr.clear();
        self.bvp.clear();
        self.skin_temperature.clear();
    }

    /// Clear every channel; runs at the end of each assessment cycle
    pub fn reset(&mut self) {
        self.clear_heart_rates();
        self.clear_auxiliary();
    }

    pub fn is_empty(&self) -> bool {
        self.heart_rates.is_empty()
            && self.gsr.is_empty()
            && self.bvp.is_empty()
            && self.skin_temperature.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ibi_for(bpm: f64) -> f64 {
        60.0 / bpm
    }

    #[test]
    fn test_empty_buffer_average_is_zero() {
        let buffer = SampleBuffer::new(187);
        assert_eq!(buffer.average_heart_rate(), 0);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_rejects_discontinuity() {
        let mut buffer = SampleBuffer::new(187);
        assert_eq!(
            buffer.observe(&Sample::ibi(0.0, 1.0)),
            Admission::RejectedDiscontinuity
        );
        assert!(buffer.heart_rates().is_empty());
    }

    #[test]
    fn test_rejects_above_max_heart_rate() {
        let mut buffer = SampleBuffer::new(187);
        // 60 / 0.3 = 200 bpm
        assert_eq!(
            buffer.observe(&Sample::ibi(0.3, 1.0)),
            Admission::RejectedAboveMax
        );
    }

    #[test]
    fn test_first_sample_always_accepted_then_outliers_rejected() {
        let mut buffer = SampleBuffer::new(187);
        assert!(buffer.observe(&Sample::ibi(ibi_for(150.0), 1.0)).is_accepted());

        // 119 differs from 150 by 31
        assert_eq!(
            buffer.observe(&Sample::ibi(ibi_for(119.0), 2.0)),
            Admission::RejectedOutlier
        );
        // 120 differs by exactly 30, which is still rejected
        assert_eq!(
            buffer.observe(&Sample::ibi(ibi_for(120.0), 3.0)),
            Admission::RejectedOutlier
        );
        assert!(buffer.observe(&Sample::ibi(ibi_for(125.0), 4.0)).is_accepted());
        assert_eq!(buffer.heart_rates().len(), 2);
    }

    #[test]
    fn test_average_truncates() {
        let mut buffer = SampleBuffer::new(187);
        buffer.observe(&Sample::ibi(0.5, 1.0)); // 120
        buffer.observe(&Sample::ibi(60.0 / 121.0, 2.0)); // 121
        assert_eq!(buffer.average_heart_rate(), 120);
    }

    #[test]
    fn test_auxiliary_channels_overwrite_same_label() {
        let mut buffer = SampleBuffer::new(187);
        buffer.observe(&Sample::new(SampleKind::Gsr, 0.4, 100.0));
        buffer.observe(&Sample::new(SampleKind::Gsr, 0.9, 100.0));
        buffer.observe(&Sample::new(SampleKind::Gsr, 0.5, 100.25));

        assert_eq!(buffer.gsr().len(), 2);
        assert_eq!(buffer.gsr().values().copied().collect::<Vec<_>>(), vec![0.9, 0.5]);
    }

    #[test]
    fn test_auxiliary_channels_skip_filtering() {
        let mut buffer = SampleBuffer::new(187);
        buffer.observe(&Sample::new(SampleKind::Bvp, -500.0, 1.0));
        buffer.observe(&Sample::new(SampleKind::SkinTemperature, 0.0, 1.0));
        assert_eq!(buffer.bvp().len(), 1);
        assert_eq!(buffer.skin_temperature().len(), 1);
    }

    #[test]
    fn test_reset_clears_all_channels() {
        let mut buffer = SampleBuffer::new(187);
        buffer.observe(&Sample::ibi(0.5, 1.0));
        buffer.observe(&Sample::new(SampleKind::Bvp, 1.0, 1.0));
        buffer.reset();
        assert!(buffer.is_empty());
        assert_eq!(buffer.average_heart_rate(), 0);
    }

    use proptest::prelude::*;

    proptest! {
        #[test]
        fn test_accepted_heart_rates_stay_plausible(
            ibis in proptest::collection::vec(0.0f64..3.0f64, 1..200)
        ) {
            let mut buffer = SampleBuffer::new(187);
            for (i, ibi) in ibis.iter().enumerate() {
                buffer.observe(&Sample::ibi(*ibi, i as f64));
            }
            for sample in buffer.heart_rates() {
                prop_assert!(sample.bpm <= 187);
                prop_assert!(sample.bpm >= 0);
            }
        }
    }
}
