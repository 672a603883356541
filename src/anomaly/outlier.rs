//! Outlier burst detector.
//!
//! Counts points of history + current further than `multiplier * sigma` from
//! the window mean. Fires when there are at least `min_outliers` of them and
//! the run ending at the current point holds at least `consecutive`
//! outliers, where successive outliers are consecutive when their timestamps
//! are at most one minute apart.

use std::time::Duration;

use crate::config::AnomalyConfig;
use crate::error::AnalysisResult;
use crate::stats::StatisticalFunctions;
use crate::types::Timestamp;

use super::{
    sample_adequacy, AnomalyDetector, ContributingFactor, DetectionContext, DetectorCategory,
    DetectorVerdict, FactorType,
};

const CONSECUTIVE_GAP: Duration = Duration::from_secs(60);

pub struct OutlierBurstDetector {
    multiplier: f64,
    min_outliers: usize,
    consecutive: usize,
    min_samples: usize,
}

impl OutlierBurstDetector {
    pub fn new(multiplier: f64, min_outliers: usize, consecutive: usize, min_samples: usize) -> Self {
        Self {
            multiplier,
            min_outliers: min_outliers.max(1),
            consecutive: consecutive.max(1),
            min_samples,
        }
    }

    pub fn from_config(config: &AnomalyConfig) -> Self {
        Self::new(
            config.outlier_deviation_multiplier,
            config.min_outliers_for_alert,
            config.consecutive_outliers_threshold,
            config.min_samples,
        )
    }
}

/// Length of the run of outlier timestamps ending at the last one
fn trailing_run(outliers: &[Timestamp]) -> usize {
    let mut run = 0;
    for pair in outliers.windows(2).rev() {
        if pair[1].duration_since(pair[0]) <= CONSECUTIVE_GAP {
            run += 1;
        } else {
            break;
        }
    }
    if outliers.is_empty() {
        0
    } else {
        run + 1
    }
}

impl AnomalyDetector for OutlierBurstDetector {
    fn name(&self) -> &'static str {
        "outlier_burst"
    }

    fn category(&self) -> DetectorCategory {
        DetectorCategory::Statistical
    }

    fn detect(&self, ctx: &DetectionContext<'_>) -> AnalysisResult<DetectorVerdict> {
        if ctx.values.len() < self.min_samples {
            return Ok(DetectorVerdict::abstain());
        }

        let mut all = ctx.values.clone();
        all.push(ctx.current_value());
        let mean = StatisticalFunctions::mean(&all);
        let sigma = StatisticalFunctions::std_dev(&all);
        if sigma <= f64::EPSILON {
            return Ok(DetectorVerdict::abstain());
        }

        let limit = self.multiplier * sigma;
        let outliers: Vec<Timestamp> = ctx
            .history
            .iter()
            .chain(std::iter::once(ctx.current))
            .filter(|s| (s.value - mean).abs() > limit)
            .map(|s| s.timestamp)
            .collect();

        let current_is_outlier = (ctx.current_value() - mean).abs() > limit;
        let run = if current_is_outlier { trailing_run(&outliers) } else { 0 };
        let confidence = sample_adequacy(ctx.values.len(), self.min_samples);

        if outliers.len() < self.min_outliers || run < self.consecutive {
            return Ok(DetectorVerdict::normal(0.0, confidence));
        }

        let deviation = (ctx.current_value() - mean).abs() / sigma;
        let score = (deviation / (2.0 * self.multiplier)).min(1.0);
        let factor = ContributingFactor::new(
            FactorType::OutlierBurst,
            format!(
                "{} outliers in window, {} consecutive ending at the current value",
                outliers.len(),
                run
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
    use crate::types::MetricSample;

    fn series(spikes: &[(i64, f64)]) -> Vec<MetricSample> {
        let mut samples: Vec<MetricSample> = (0..60)
            .map(|i| {
                let base = if i % 2 == 0 { 49.0 } else { 51.0 };
                MetricSample::at("m", base, Timestamp::from_secs(i * 30))
            })
            .collect();
        for (index, value) in spikes {
            samples[*index as usize].value = *value;
        }
        samples
    }

    fn run(history: &[MetricSample], current: f64, at_secs: i64) -> DetectorVerdict {
        let baseline = Baseline::from_samples(history);
        let current = MetricSample::at("m", current, Timestamp::from_secs(at_secs));
        let ctx = DetectionContext::new("m", history, &current, &baseline);
        OutlierBurstDetector::new(2.5, 3, 2, 20).detect(&ctx).expect("detect")
    }

    #[test]
    fn test_trailing_run() {
        let ts = |s: i64| Timestamp::from_secs(s);
        assert_eq!(trailing_run(&[]), 0);
        assert_eq!(trailing_run(&[ts(0)]), 1);
        assert_eq!(trailing_run(&[ts(0), ts(500), ts(530), ts(590)]), 3);
        assert_eq!(trailing_run(&[ts(0), ts(30), ts(200)]), 1);
    }

    #[test]
    fn test_burst_ending_now_fires() {
        // Spikes at 1710s, 1740s, 1770s, then the current value at 1800s.
        let history = series(&[(57, 120.0), (58, 120.0), (59, 120.0)]);
        let verdict = run(&history, 120.0, 1_800);
        assert!(verdict.is_anomaly);
        assert_eq!(verdict.factors[0].factor_type, FactorType::OutlierBurst);
    }

    #[test]
    fn test_scattered_outliers_do_not_fire() {
        // Three outliers, each more than a minute from the next.
        let history = series(&[(5, 120.0), (25, 120.0), (45, 120.0)]);
        let verdict = run(&history, 50.0, 1_800);
        assert!(!verdict.is_anomaly);
    }

    #[test]
    fn test_abstains_on_short_history() {
        let history = series(&[]);
        assert_eq!(run(&history[..5], 500.0, 1_800), DetectorVerdict::abstain());
    }
}
