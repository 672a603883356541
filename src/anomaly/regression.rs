//! Trend deviation: fit a line through the history and compare the current
//! value with the fit's prediction for the next step.

use crate::config::AnomalyConfig;
use crate::error::AnalysisResult;
use crate::stats::TrendAnalysis;

use super::{
    relative_deviation, sample_adequacy, AnomalyDetector, ContributingFactor, DetectionContext,
    DetectorCategory, DetectorVerdict, FactorType,
};

pub struct TrendDeviationDetector {
    threshold: f64,
    min_samples: usize,
}

impl TrendDeviationDetector {
    pub fn new(threshold: f64, min_samples: usize) -> Self {
        Self { threshold, min_samples }
    }

    pub fn from_config(config: &AnomalyConfig) -> Self {
        Self::new(config.trend_threshold, config.min_samples)
    }
}

impl AnomalyDetector for TrendDeviationDetector {
    fn name(&self) -> &'static str {
        "trend"
    }

    fn category(&self) -> DetectorCategory {
        DetectorCategory::Trend
    }

    fn detect(&self, ctx: &DetectionContext<'_>) -> AnalysisResult<DetectorVerdict> {
        let n = ctx.values.len();
        if n < self.min_samples.max(3) {
            return Ok(DetectorVerdict::abstain());
        }

        let fit = TrendAnalysis::index_regression(&ctx.values);
        let expected = fit.predict(n as f64);
        let current = ctx.current_value();
        let deviation = relative_deviation(current, expected);

        let score = (deviation / (2.0 * self.threshold)).min(1.0);
        let confidence =
            0.5 * fit.r_squared.clamp(0.0, 1.0) + 0.5 * sample_adequacy(n, self.min_samples);

        if deviation <= self.threshold {
            return Ok(DetectorVerdict::normal(score, confidence));
        }

        let factor = ContributingFactor::new(
            FactorType::TrendDeviation,
            format!(
                "value {:.2} deviates {:.0}% from the trend prediction {:.2}",
                current,
                deviation * 100.0,
                expected
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

    fn run(values: &[f64], current: f64) -> DetectorVerdict {
        let history: Vec<MetricSample> = values
            .iter()
            .enumerate()
            .map(|(i, v)| MetricSample::at("m", *v, Timestamp::from_secs(i as i64 * 10)))
            .collect();
        let baseline = Baseline::from_samples(&history);
        let current = MetricSample::at("m", current, Timestamp::from_secs(10_000));
        let ctx = DetectionContext::new("m", &history, &current, &baseline);
        TrendDeviationDetector::new(0.25, 20).detect(&ctx).expect("detect")
    }

    #[test]
    fn test_follows_the_trend() {
        // 10, 12, ..., 88: next step predicts 90.
        let values: Vec<f64> = (0..40).map(|i| 10.0 + 2.0 * i as f64).collect();
        let verdict = run(&values, 91.0);
        assert!(!verdict.is_anomaly);
        assert!(verdict.confidence > 0.9);
    }

    #[test]
    fn test_breaking_the_trend_is_anomalous() {
        let values: Vec<f64> = (0..40).map(|i| 10.0 + 2.0 * i as f64).collect();
        let verdict = run(&values, 30.0);
        assert!(verdict.is_anomaly);
        assert_eq!(verdict.factors[0].factor_type, FactorType::TrendDeviation);
        // |30 - 90| / 90 = 0.667 -> capped at 1
        assert_eq!(verdict.score, 1.0);
    }

    #[test]
    fn test_abstains_on_short_history() {
        assert_eq!(run(&[1.0, 2.0, 3.0, 4.0], 50.0), DetectorVerdict::abstain());
    }
}
