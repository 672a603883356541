//! Z-score detector: distance from the baseline mean in standard deviations.

use crate::config::AnomalyConfig;
use crate::error::AnalysisResult;

use super::{
    sample_adequacy, AnomalyDetector, ContributingFactor, DetectionContext, DetectorCategory,
    DetectorVerdict, FactorType,
};

pub struct ZScoreDetector {
    threshold: f64,
    min_samples: usize,
}

impl ZScoreDetector {
    pub fn new(threshold: f64, min_samples: usize) -> Self {
        Self { threshold, min_samples }
    }

    pub fn from_config(config: &AnomalyConfig) -> Self {
        Self::new(config.zscore_threshold, config.min_samples)
    }
}

impl AnomalyDetector for ZScoreDetector {
    fn name(&self) -> &'static str {
        "zscore"
    }

    fn category(&self) -> DetectorCategory {
        DetectorCategory::Statistical
    }

    fn detect(&self, ctx: &DetectionContext<'_>) -> AnalysisResult<DetectorVerdict> {
        let baseline = ctx.baseline;
        if baseline.count < self.min_samples || baseline.stddev <= f64::EPSILON {
            return Ok(DetectorVerdict::abstain());
        }

        let current = ctx.current_value();
        let z = (current - baseline.mean).abs() / baseline.stddev;
        let score = (z / (2.0 * self.threshold)).min(1.0);
        let confidence = sample_adequacy(baseline.count, self.min_samples);

        if z <= self.threshold {
            return Ok(DetectorVerdict::normal(score, confidence));
        }

        let factor = ContributingFactor::new(
            FactorType::StatisticalDeviation,
            format!(
                "value {:.2} is {:.1} standard deviations from the mean {:.2}",
                current, z, baseline.mean
            ),
            confidence,
            score,
        );
        Ok(DetectorVerdict::anomalous(score, confidence, factor))
    }
}
