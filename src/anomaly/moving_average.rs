//! Moving-average deviation: the current value against the mean and spread
//! of the last `window` points.

use crate::config::AnomalyConfig;
use crate::error::AnalysisResult;
use crate::stats::StatisticalFunctions;

use super::{
    sample_adequacy, AnomalyDetector, ContributingFactor, DetectionContext, DetectorCategory,
    DetectorVerdict, FactorType,
};

pub struct MovingAverageDetector {
    window: usize,
    max_deviation: f64,
    min_samples: usize,
}

impl MovingAverageDetector {
    pub fn new(window: usize, max_deviation: f64, min_samples: usize) -> Self {
        Self {
            window: window.max(2),
            max_deviation,
            min_samples,
        }
    }

    pub fn from_config(config: &AnomalyConfig) -> Self {
        Self::new(
            config.moving_average_window,
            config.moving_average_deviation,
            config.min_samples,
        )
    }
}

impl AnomalyDetector for MovingAverageDetector {
    fn name(&self) -> &'static str {
        "moving_average"
    }

    fn category(&self) -> DetectorCategory {
        DetectorCategory::Statistical
    }

    fn detect(&self, ctx: &DetectionContext<'_>) -> AnalysisResult<DetectorVerdict> {
        if ctx.values.len() < self.window {
            return Ok(DetectorVerdict::abstain());
        }

        let recent = &ctx.values[ctx.values.len() - self.window..];
        let moving_avg = StatisticalFunctions::mean(recent);
        let moving_std = StatisticalFunctions::std_dev(recent);
        if moving_std <= f64::EPSILON {
            return Ok(DetectorVerdict::abstain());
        }

        let current = ctx.current_value();
        let deviation = (current - moving_avg).abs() / moving_std;
        let score = (deviation / (2.0 * self.max_deviation)).min(1.0);
        let confidence = sample_adequacy(ctx.values.len(), self.min_samples);

        if deviation <= self.max_deviation {
            return Ok(DetectorVerdict::normal(score, confidence));
        }

        let factor = ContributingFactor::new(
            FactorType::StatisticalDeviation,
            format!(
                "value {:.2} deviates {:.1}x the recent spread from the {}-point moving average {:.2}",
                current, deviation, self.window, moving_avg
            ),
            confidence,
            score,
        );
        Ok(DetectorVerdict::anomalous(score, confidence, factor))
    }
}
