//! Percentile threshold detector: current value above the baseline p95/p99.

use crate::config::AnomalyConfig;
use crate::error::AnalysisResult;

use super::{
    sample_adequacy, AnomalyDetector, ContributingFactor, DetectionContext, DetectorCategory,
    DetectorVerdict, FactorType,
};

const P99_SCORE: f64 = 0.9;
const P95_SCORE: f64 = 0.7;

pub struct PercentileDetector {
    min_samples: usize,
}

impl PercentileDetector {
    pub fn new(min_samples: usize) -> Self {
        Self { min_samples }
    }

    pub fn from_config(config: &AnomalyConfig) -> Self {
        Self::new(config.min_samples)
    }
}

impl AnomalyDetector for PercentileDetector {
    fn name(&self) -> &'static str {
        "percentile"
    }

    fn category(&self) -> DetectorCategory {
        DetectorCategory::Threshold
    }

    fn detect(&self, ctx: &DetectionContext<'_>) -> AnalysisResult<DetectorVerdict> {
        let baseline = ctx.baseline;
        if baseline.count < self.min_samples {
            return Ok(DetectorVerdict::abstain());
        }

        let current = ctx.current_value();
        let confidence = sample_adequacy(baseline.count, self.min_samples);

        let (score, label, bound) = if current > baseline.p99 {
            (P99_SCORE, "p99", baseline.p99)
        } else if current > baseline.p95 {
            (P95_SCORE, "p95", baseline.p95)
        } else {
            return Ok(DetectorVerdict::normal(0.0, confidence));
        };

        let factor = ContributingFactor::new(
            FactorType::ThresholdBreach,
            format!("value {:.2} exceeds the baseline {} of {:.2}", current, label, bound),
            confidence,
            score,
        );
        Ok(DetectorVerdict::anomalous(score, confidence, factor))
    }
}
