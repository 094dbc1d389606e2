use log::info;

use crate::{
    logging::category,
    types::{ChannelRange, TelemetrySample, TestVerdict, Verdict},
};

/// Calibration constant: maximum allowed spread of any monitored channel.
pub const DEFAULT_TOLERANCE: f64 = 500.0;
pub const DEFAULT_MIN_SAMPLES: usize = 1;

type Extract = fn(&TelemetrySample) -> f64;

const MONITORED: [(&str, Extract); 5] = [
    ("roll", |s| s.roll),
    ("pitch", |s| s.pitch),
    ("yaw", |s| s.yaw),
    ("gyro_x", |s| s.gyro.x),
    ("gyro_y", |s| s.gyro.y),
];

/// Range-based pass/fail judgement over a finished sample buffer.
#[derive(Clone, Copy, Debug)]
pub struct TelemetryEvaluator {
    pub tolerance: f64,
    pub min_samples: usize,
}

impl Default for TelemetryEvaluator {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_TOLERANCE,
            min_samples: DEFAULT_MIN_SAMPLES,
        }
    }
}

impl TelemetryEvaluator {
    pub fn new(tolerance: f64, min_samples: usize) -> Self {
        Self {
            tolerance,
            min_samples,
        }
    }

    pub fn channel_ranges(samples: &[TelemetrySample]) -> Vec<ChannelRange> {
        if samples.is_empty() {
            return Vec::new();
        }
        MONITORED
            .iter()
            .map(|(channel, extract)| {
                let (min, max) = samples
                    .iter()
                    .map(extract)
                    .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
                        (lo.min(v), hi.max(v))
                    });
                ChannelRange {
                    channel: channel.to_string(),
                    min,
                    max,
                    range: max - min,
                }
            })
            .collect()
    }

    pub fn analyze(&self, samples: &[TelemetrySample]) -> TestVerdict {
        let channels = Self::channel_ranges(samples);
        let sample_count = samples.len();

        if sample_count < self.min_samples.max(1) {
            return TestVerdict {
                verdict: Verdict::Ng,
                reason: format!(
                    "insufficient data: {sample_count} samples (minimum {})",
                    self.min_samples.max(1)
                ),
                failing_channels: Vec::new(),
                channels,
                sample_count,
            };
        }

        let failing = channels
            .iter()
            .filter(|c| c.range > self.tolerance)
            .collect::<Vec<_>>();
        let verdict = if failing.is_empty() {
            TestVerdict {
                verdict: Verdict::Pass,
                reason: format!(
                    "all channels within tolerance {:.1} over {sample_count} samples",
                    self.tolerance
                ),
                failing_channels: Vec::new(),
                channels: channels.clone(),
                sample_count,
            }
        } else {
            let detail = failing
                .iter()
                .map(|c| format!("{} range {:.2}", c.channel, c.range))
                .collect::<Vec<_>>()
                .join(", ");
            TestVerdict {
                verdict: Verdict::Ng,
                reason: format!("out of tolerance (> {:.1}): {detail}", self.tolerance),
                failing_channels: failing.iter().map(|c| c.channel.clone()).collect(),
                channels: channels.clone(),
                sample_count,
            }
        };

        for c in &channels {
            info!(
                target: category::IMU,
                "{}: min={:.2} max={:.2} range={:.2}", c.channel, c.min, c.max, c.range
            );
        }
        info!(target: category::IMU, "verdict {}: {}", verdict.verdict.label(), verdict.reason);
        verdict
    }
}

#[cfg(test)]
mod tests {
    use chrono::Local;

    use super::*;

    fn with_roll(values: &[f64]) -> Vec<TelemetrySample> {
        values
            .iter()
            .map(|roll| TelemetrySample::orientation(Local::now(), *roll, 0.0, 0.0))
            .collect()
    }

    #[test]
    fn roll_spread_over_tolerance_is_ng() {
        let verdict = TelemetryEvaluator::default().analyze(&with_roll(&[0.0, 100.0, 600.0]));
        assert_eq!(verdict.verdict, Verdict::Ng);
        assert_eq!(verdict.failing_channels, vec!["roll".to_string()]);
        assert!(verdict.reason.contains("roll range 600.00"));
    }

    #[test]
    fn roll_spread_within_tolerance_passes() {
        let verdict = TelemetryEvaluator::default().analyze(&with_roll(&[0.0, 100.0, 400.0]));
        assert!(verdict.is_pass());
        assert_eq!(verdict.sample_count, 3);
        assert_eq!(verdict.channels.len(), 5);
    }

    #[test]
    fn every_failing_channel_is_named() {
        let mut samples = with_roll(&[0.0, 501.0]);
        samples[1].gyro.y = -900.0;
        samples[1].yaw = 500.0;
        let verdict = TelemetryEvaluator::default().analyze(&samples);
        assert_eq!(verdict.failing_channels, vec!["roll", "gyro_y"]);
        assert!(verdict.reason.contains("gyro_y range 900.00"));
    }

    #[test]
    fn too_few_samples_is_ng_regardless_of_ranges() {
        let evaluator = TelemetryEvaluator::new(DEFAULT_TOLERANCE, 5);
        let verdict = evaluator.analyze(&with_roll(&[1.0, 2.0]));
        assert_eq!(verdict.verdict, Verdict::Ng);
        assert!(verdict.reason.starts_with("insufficient data"));

        let empty = TelemetryEvaluator::default().analyze(&[]);
        assert_eq!(empty.verdict, Verdict::Ng);
        assert!(empty.channels.is_empty());
    }

    #[test]
    fn analysis_is_repeatable() {
        let samples = with_roll(&[3.0, -250.0, 251.0]);
        let evaluator = TelemetryEvaluator::default();
        assert_eq!(evaluator.analyze(&samples), evaluator.analyze(&samples));
    }
}
