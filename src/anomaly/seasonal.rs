//! Seasonal deviation: find the dominant period by autocorrelation and
//! compare the current value with the values whole periods back.

use crate::config::AnomalyConfig;
use crate::error::AnalysisResult;
use crate::stats::{detect_seasonality, StatisticalFunctions};

use super::{
    relative_deviation, sample_adequacy, AnomalyDetector, ContributingFactor, DetectionContext,
    DetectorCategory, DetectorVerdict, FactorType,
};

pub struct SeasonalDetector {
    threshold: f64,
    min_correlation: f64,
    min_samples: usize,
}

impl SeasonalDetector {
    pub fn new(threshold: f64, min_correlation: f64, min_samples: usize) -> Self {
        Self {
            threshold,
            min_correlation,
            min_samples,
        }
    }

    pub fn from_config(config: &AnomalyConfig) -> Self {
        Self::new(
            config.seasonal_threshold,
            config.seasonal_min_correlation,
            config.min_samples,
        )
    }
}

/// Mean of the values exactly k periods before index `n`, k = 1, 2, ...
fn seasonal_expectation(values: &[f64], period: usize) -> Option<f64> {
    let n = values.len();
    if period == 0 || period > n {
        return None;
    }
    let same_phase: Vec<f64> = (1..=n / period).map(|k| values[n - k * period]).collect();
    Some(StatisticalFunctions::mean(&same_phase))
}

impl AnomalyDetector for SeasonalDetector {
    fn name(&self) -> &'static str {
        "seasonal"
    }

    fn category(&self) -> DetectorCategory {
        DetectorCategory::Seasonal
    }

    fn detect(&self, ctx: &DetectionContext<'_>) -> AnalysisResult<DetectorVerdict> {
        let n = ctx.values.len();
        if n < 2 * self.min_samples || n < 4 {
            return Ok(DetectorVerdict::abstain());
        }

        let seasonality = detect_seasonality(&ctx.values, n / 2, self.min_correlation);
        if !seasonality.has_pattern {
            return Ok(DetectorVerdict::abstain());
        }
        let Some(expected) = seasonal_expectation(&ctx.values, seasonality.period) else {
            return Ok(DetectorVerdict::abstain());
        };

        let current = ctx.current_value();
        let deviation = relative_deviation(current, expected);
        let score = (deviation / (2.0 * self.threshold)).min(1.0);
        let confidence = seasonality.strength.clamp(0.0, 1.0) * sample_adequacy(n, self.min_samples);

        if deviation <= self.threshold {
            return Ok(DetectorVerdict::normal(score, confidence));
        }

        let factor = ContributingFactor::new(
            FactorType::SeasonalDeviation,
            format!(
                "value {:.2} deviates {:.0}% from the seasonal expectation {:.2} (period {})",
                current,
                deviation * 100.0,
                expected,
                seasonality.period
            ),
            confidence,
            score,
        );
        Ok(DetectorVerdict::anomalous(score, confidence, factor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::Baseline;
    use crate::types::{MetricSample, Timestamp};
    use std::f64::consts::PI;

    fn wave(n: usize) -> Vec<f64> {
        (0..n).map(|t| 50.0 + 10.0 * (2.0 * PI * t as f64 / 24.0).sin()).collect()
    }

    fn run(values: &[f64], current: f64) -> DetectorVerdict {
        let history: Vec<MetricSample> = values
            .iter()
            .enumerate()
            .map(|(i, v)| MetricSample::at("m", *v, Timestamp::from_secs(i as i64 * 60)))
            .collect();
        let baseline = Baseline::from_samples(&history);
        let current = MetricSample::at("m", current, Timestamp::from_secs(100_000));
        let ctx = DetectionContext::new("m", &history, &current, &baseline);
        SeasonalDetector::new(0.3, 0.3, 20).detect(&ctx).expect("detect")
    }

    #[test]
    fn test_expectation_averages_whole_periods() {
        let values = [1.0, 2.0, 3.0, 1.0, 2.0, 5.0, 1.0];
        // n = 7, period 3: indices 4 and 1
        assert_eq!(seasonal_expectation(&values, 3), Some(2.0));
        assert_eq!(seasonal_expectation(&values, 0), None);
    }

    #[test]
    fn test_in_phase_value_is_normal() {
        let values = wave(96);
        // Index 96 is in phase with index 0 (value 50).
        let verdict = run(&values, 51.0);
        assert!(!verdict.is_anomaly);
        assert!(verdict.confidence > 0.0);
    }

    #[test]
    fn test_out_of_phase_value_is_anomalous() {
        let verdict = run(&wave(96), 90.0);
        assert!(verdict.is_anomaly);
        assert_eq!(verdict.factors[0].factor_type, FactorType::SeasonalDeviation);
    }

    #[test]
    fn test_abstains_without_pattern_or_data() {
        assert_eq!(run(&wave(30), 90.0), DetectorVerdict::abstain());
        let linear: Vec<f64> = (0..60).map(|i| i as f64).collect();
        assert_eq!(run(&linear, 1_000.0), DetectorVerdict::abstain());
    }
}
