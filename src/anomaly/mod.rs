// ============================================================================
// ANOMALY DETECTION ENGINE
// ============================================================================
// Independent detectors vote on the same {history, current, baseline}
// context. The combined verdict is an anomaly only when enough detectors
// agree; score and confidence are weighted averages over the detectors that
// fired, and their contributing factors are grouped into one explanation.
// ============================================================================

pub mod isolation;
pub mod moving_average;
pub mod outlier;
pub mod percentile;
pub mod regression;
pub mod seasonal;
pub mod zscore;

use std::cmp::Ordering;
use std::collections::BTreeMap;

use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::{AnomalyConfig, DetectorWeights};
use crate::error::{AnalysisError, AnalysisResult};
use crate::stats::Baseline;
use crate::types::MetricSample;

pub use isolation::IsolationDetector;
pub use moving_average::MovingAverageDetector;
pub use outlier::OutlierBurstDetector;
pub use percentile::PercentileDetector;
pub use regression::TrendDeviationDetector;
pub use seasonal::SeasonalDetector;
pub use zscore::ZScoreDetector;

// ----------------------------------------------------------------------------
// 7.1 Detector Vocabulary
// ----------------------------------------------------------------------------

/// Reliability class of a detector, selects its weight in the combined score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorCategory {
    Statistical,
    Trend,
    Threshold,
    Seasonal,
}

impl DetectorCategory {
    pub fn weight(&self, weights: &DetectorWeights) -> f64 {
        match self {
            DetectorCategory::Statistical => weights.statistical,
            DetectorCategory::Trend => weights.trend,
            DetectorCategory::Threshold => weights.threshold,
            DetectorCategory::Seasonal => weights.seasonal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactorType {
    StatisticalDeviation,
    ThresholdBreach,
    TrendDeviation,
    SeasonalDeviation,
    Isolation,
    OutlierBurst,
}

impl FactorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FactorType::StatisticalDeviation => "statistical_deviation",
            FactorType::ThresholdBreach => "threshold_breach",
            FactorType::TrendDeviation => "trend_deviation",
            FactorType::SeasonalDeviation => "seasonal_deviation",
            FactorType::Isolation => "isolation",
            FactorType::OutlierBurst => "outlier_burst",
        }
    }
}

/// One reason a value looks anomalous
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContributingFactor {
    pub factor_type: FactorType,
    pub description: String,
    pub confidence: f64,
    pub impact: f64,
}

impl ContributingFactor {
    pub fn new(factor_type: FactorType, description: impl Into<String>, confidence: f64, impact: f64) -> Self {
        Self {
            factor_type,
            description: description.into(),
            confidence: confidence.clamp(0.0, 1.0),
            impact: impact.clamp(0.0, 1.0),
        }
    }
}

/// The vote of a single detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorVerdict {
    pub is_anomaly: bool,
    pub score: f64,
    pub confidence: f64,
    pub factors: Vec<ContributingFactor>,
}

impl DetectorVerdict {
    /// Not enough data to judge
    pub fn abstain() -> Self {
        Self {
            is_anomaly: false,
            score: 0.0,
            confidence: 0.0,
            factors: Vec::new(),
        }
    }

    /// Judged and found normal
    pub fn normal(score: f64, confidence: f64) -> Self {
        Self {
            is_anomaly: false,
            score: score.clamp(0.0, 1.0),
            confidence: confidence.clamp(0.0, 1.0),
            factors: Vec::new(),
        }
    }

    pub fn anomalous(score: f64, confidence: f64, factor: ContributingFactor) -> Self {
        Self {
            is_anomaly: true,
            score: score.clamp(0.0, 1.0),
            confidence: confidence.clamp(0.0, 1.0),
            factors: vec![factor],
        }
    }
}

/// Combined verdict of one analysis pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyResult {
    pub is_anomaly: bool,
    pub score: f64,
    pub confidence: f64,
    pub contributing_factors: Vec<ContributingFactor>,
    /// Detectors that fired
    pub detection_methods: SmallVec<[CompactString; 8]>,
    /// Detectors that produced a verdict (including abstentions)
    pub detectors_run: usize,
}

impl AnomalyResult {
    pub fn normal() -> Self {
        Self {
            is_anomaly: false,
            score: 0.0,
            confidence: 0.0,
            contributing_factors: Vec::new(),
            detection_methods: SmallVec::new(),
            detectors_run: 0,
        }
    }

    /// Human-readable explanation, strongest factor first
    pub fn explanation(&self) -> String {
        self.contributing_factors
            .iter()
            .map(|f| f.description.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

// ----------------------------------------------------------------------------
// 7.2 Detection Context & Detector Trait
// ----------------------------------------------------------------------------

/// Everything a detector sees for one metric
#[derive(Debug)]
pub struct DetectionContext<'a> {
    pub metric: &'a str,
    /// History preceding `current`, oldest first
    pub history: &'a [MetricSample],
    pub current: &'a MetricSample,
    pub baseline: &'a Baseline,
    /// Values of `history`, in order
    pub values: Vec<f64>,
}

impl<'a> DetectionContext<'a> {
    pub fn new(
        metric: &'a str,
        history: &'a [MetricSample],
        current: &'a MetricSample,
        baseline: &'a Baseline,
    ) -> Self {
        Self {
            metric,
            history,
            current,
            baseline,
            values: history.iter().map(|s| s.value).collect(),
        }
    }

    pub fn current_value(&self) -> f64 {
        self.current.value
    }
}

/// One independent anomaly detection method
pub trait AnomalyDetector: Send + Sync {
    fn name(&self) -> &'static str;

    fn category(&self) -> DetectorCategory;

    /// Insufficient data yields `DetectorVerdict::abstain()`, not an error.
    fn detect(&self, ctx: &DetectionContext<'_>) -> AnalysisResult<DetectorVerdict>;
}

/// Scales confidence with history size; full confidence at twice the minimum
pub(crate) fn sample_adequacy(count: usize, min_samples: usize) -> f64 {
    if min_samples == 0 {
        return 1.0;
    }
    (count as f64 / (2 * min_samples) as f64).min(1.0)
}

/// `|actual - expected| / |expected|`, with a floor on the denominator
pub(crate) fn relative_deviation(actual: f64, expected: f64) -> f64 {
    (actual - expected).abs() / expected.abs().max(f64::EPSILON)
}

// ----------------------------------------------------------------------------
// 7.3 Engine
// ----------------------------------------------------------------------------

struct Vote {
    name: &'static str,
    category: DetectorCategory,
    verdict: DetectorVerdict,
}

pub struct AnomalyEngine {
    detectors: Vec<Box<dyn AnomalyDetector>>,
    weights: DetectorWeights,
    min_detections_required: usize,
}

impl AnomalyEngine {
    /// Engine with every built-in detector
    pub fn from_config(config: &AnomalyConfig) -> Self {
        let detectors: Vec<Box<dyn AnomalyDetector>> = vec![
            Box::new(ZScoreDetector::from_config(config)),
            Box::new(MovingAverageDetector::from_config(config)),
            Box::new(PercentileDetector::from_config(config)),
            Box::new(TrendDeviationDetector::from_config(config)),
            Box::new(SeasonalDetector::from_config(config)),
            Box::new(IsolationDetector::from_config(config)),
            Box::new(OutlierBurstDetector::from_config(config)),
        ];
        debug!(target: "pulse::anomaly", count = detectors.len(), "Initialized detectors");
        Self::with_detectors(detectors, config.weights.clone(), config.min_detections_required)
    }

    pub fn with_detectors(
        detectors: Vec<Box<dyn AnomalyDetector>>,
        weights: DetectorWeights,
        min_detections_required: usize,
    ) -> Self {
        Self {
            detectors,
            weights,
            min_detections_required: min_detections_required.max(1),
        }
    }

    pub fn detector_names(&self) -> Vec<&'static str> {
        self.detectors.iter().map(|d| d.name()).collect()
    }

    /// Run every detector, checking `cancel` before each one. A failing
    /// detector is logged and left out of the combined verdict.
    pub fn analyze(&self, ctx: &DetectionContext<'_>, cancel: &CancellationToken) -> AnalysisResult<AnomalyResult> {
        let mut votes = Vec::with_capacity(self.detectors.len());

        for detector in &self.detectors {
            if cancel.is_cancelled() {
                return Err(AnalysisError::Cancelled);
            }
            match detector.detect(ctx) {
                Ok(verdict) => {
                    trace!(
                        target: "pulse::anomaly",
                        metric = ctx.metric,
                        detector = detector.name(),
                        fired = verdict.is_anomaly,
                        score = verdict.score,
                        "Detector verdict"
                    );
                    votes.push(Vote {
                        name: detector.name(),
                        category: detector.category(),
                        verdict,
                    });
                }
                Err(e) => {
                    warn!(
                        target: "pulse::anomaly",
                        metric = ctx.metric,
                        detector = detector.name(),
                        error = %e,
                        "Detector failed, excluded from verdict"
                    );
                }
            }
        }

        Ok(self.combine(votes))
    }

    fn combine(&self, votes: Vec<Vote>) -> AnomalyResult {
        let detectors_run = votes.len();
        let fired: Vec<Vote> = votes.into_iter().filter(|v| v.verdict.is_anomaly).collect();

        if fired.is_empty() {
            return AnomalyResult {
                detectors_run,
                ..AnomalyResult::normal()
            };
        }

        let mut weight_sum = 0.0;
        let mut score_sum = 0.0;
        let mut confidence_sum = 0.0;
        for vote in &fired {
            let weight = vote.category.weight(&self.weights);
            weight_sum += weight;
            score_sum += weight * vote.verdict.score;
            confidence_sum += weight * vote.verdict.confidence;
        }
        let (score, confidence) = if weight_sum > 0.0 {
            (score_sum / weight_sum, confidence_sum / weight_sum)
        } else {
            let n = fired.len() as f64;
            (
                fired.iter().map(|v| v.verdict.score).sum::<f64>() / n,
                fired.iter().map(|v| v.verdict.confidence).sum::<f64>() / n,
            )
        };

        let is_anomaly = fired.len() >= self.min_detections_required;
        let detection_methods: SmallVec<[CompactString; 8]> =
            fired.iter().map(|v| CompactString::from(v.name)).collect();
        let contributing_factors = group_factors(fired.into_iter().flat_map(|v| v.verdict.factors));

        AnomalyResult {
            is_anomaly,
            score: score.clamp(0.0, 1.0),
            confidence: confidence.clamp(0.0, 1.0),
            contributing_factors,
            detection_methods,
            detectors_run,
        }
    }
}

/// Group factors by type: average confidence, max impact, sorted by impact
/// then confidence, both descending.
fn group_factors(factors: impl Iterator<Item = ContributingFactor>) -> Vec<ContributingFactor> {
    struct Group {
        descriptions: Vec<String>,
        confidence_sum: f64,
        count: usize,
        impact: f64,
    }

    let mut groups: BTreeMap<FactorType, Group> = BTreeMap::new();
    for factor in factors {
        let group = groups.entry(factor.factor_type).or_insert(Group {
            descriptions: Vec::new(),
            confidence_sum: 0.0,
            count: 0,
            impact: 0.0,
        });
        group.descriptions.push(factor.description);
        group.confidence_sum += factor.confidence;
        group.count += 1;
        group.impact = group.impact.max(factor.impact);
    }

    let mut grouped: Vec<ContributingFactor> = groups
        .into_iter()
        .map(|(factor_type, group)| ContributingFactor {
            factor_type,
            description: group.descriptions.join("; "),
            confidence: group.confidence_sum / group.count as f64,
            impact: group.impact,
        })
        .collect();

    grouped.sort_by(|a, b| {
        b.impact
            .partial_cmp(&a.impact)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.confidence.partial_cmp(&a.confidence).unwrap_or(Ordering::Equal))
    });
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Timestamp;
    use pretty_assertions::assert_eq;

    struct Fixed {
        name: &'static str,
        category: DetectorCategory,
        verdict: Option<DetectorVerdict>,
    }

    impl AnomalyDetector for Fixed {
        fn name(&self) -> &'static str {
            self.name
        }

        fn category(&self) -> DetectorCategory {
            self.category
        }

        fn detect(&self, _ctx: &DetectionContext<'_>) -> AnalysisResult<DetectorVerdict> {
            self.verdict
                .clone()
                .ok_or_else(|| AnalysisError::detector_failed(self.name, "boom"))
        }
    }

    fn fired(name: &'static str, category: DetectorCategory, score: f64, factor: FactorType, impact: f64) -> Box<dyn AnomalyDetector> {
        Box::new(Fixed {
            name,
            category,
            verdict: Some(DetectorVerdict::anomalous(
                score,
                0.8,
                ContributingFactor::new(factor, name, 0.8, impact),
            )),
        })
    }

    fn quiet(name: &'static str) -> Box<dyn AnomalyDetector> {
        Box::new(Fixed {
            name,
            category: DetectorCategory::Statistical,
            verdict: Some(DetectorVerdict::normal(0.1, 0.9)),
        })
    }

    fn failing(name: &'static str) -> Box<dyn AnomalyDetector> {
        Box::new(Fixed {
            name,
            category: DetectorCategory::Statistical,
            verdict: None,
        })
    }

    fn run(engine: &AnomalyEngine) -> AnomalyResult {
        let history = vec![MetricSample::at("m", 1.0, Timestamp::from_secs(1))];
        let current = MetricSample::at("m", 2.0, Timestamp::from_secs(2));
        let baseline = Baseline::from_samples(&history);
        let ctx = DetectionContext::new("m", &history, &current, &baseline);
        engine.analyze(&ctx, &CancellationToken::new()).expect("analysis")
    }

    #[test]
    fn test_single_detector_is_not_enough() {
        let engine = AnomalyEngine::with_detectors(
            vec![
                fired("zscore", DetectorCategory::Statistical, 1.0, FactorType::StatisticalDeviation, 1.0),
                quiet("moving_average"),
                quiet("percentile"),
            ],
            DetectorWeights::default(),
            2,
        );
        let result = run(&engine);
        assert!(!result.is_anomaly);
        assert_eq!(result.score, 1.0);
        assert_eq!(result.detectors_run, 3);
        assert_eq!(result.detection_methods.len(), 1);
    }

    #[test]
    fn test_weighted_score_over_fired_detectors() {
        let engine = AnomalyEngine::with_detectors(
            vec![
                fired("zscore", DetectorCategory::Statistical, 1.0, FactorType::StatisticalDeviation, 0.9),
                fired("percentile", DetectorCategory::Threshold, 0.7, FactorType::ThresholdBreach, 0.7),
                quiet("seasonal"),
            ],
            DetectorWeights::default(),
            2,
        );
        let result = run(&engine);
        assert!(result.is_anomaly);
        // (0.4 * 1.0 + 0.2 * 0.7) / 0.6
        assert!((result.score - 0.9).abs() < 1e-9);
        assert!((result.confidence - 0.8).abs() < 1e-9);
        assert_eq!(
            result.detection_methods.iter().map(|m| m.as_str()).collect::<Vec<_>>(),
            vec!["zscore", "percentile"]
        );
    }

    #[test]
    fn test_factors_grouped_and_sorted() {
        let engine = AnomalyEngine::with_detectors(
            vec![
                fired("percentile", DetectorCategory::Threshold, 0.7, FactorType::ThresholdBreach, 0.7),
                fired("zscore", DetectorCategory::Statistical, 0.5, FactorType::StatisticalDeviation, 0.5),
                fired("moving_average", DetectorCategory::Statistical, 0.95, FactorType::StatisticalDeviation, 0.95),
            ],
            DetectorWeights::default(),
            2,
        );
        let result = run(&engine);
        assert_eq!(result.contributing_factors.len(), 2);
        let first = &result.contributing_factors[0];
        assert_eq!(first.factor_type, FactorType::StatisticalDeviation);
        assert_eq!(first.impact, 0.95);
        assert_eq!(first.description, "zscore; moving_average");
        assert_eq!(result.contributing_factors[1].factor_type, FactorType::ThresholdBreach);
        assert!(result.explanation().starts_with("zscore"));
    }

    #[test]
    fn test_failing_detector_is_isolated() {
        let engine = AnomalyEngine::with_detectors(
            vec![
                failing("broken"),
                fired("zscore", DetectorCategory::Statistical, 0.9, FactorType::StatisticalDeviation, 0.9),
                fired("trend", DetectorCategory::Trend, 0.6, FactorType::TrendDeviation, 0.6),
            ],
            DetectorWeights::default(),
            2,
        );
        let result = run(&engine);
        assert!(result.is_anomaly);
        assert_eq!(result.detectors_run, 2);
    }

    #[test]
    fn test_cancellation_checked_before_detectors() {
        let engine = AnomalyEngine::from_config(&AnomalyConfig::default());
        let history = vec![MetricSample::at("m", 1.0, Timestamp::from_secs(1))];
        let current = MetricSample::at("m", 2.0, Timestamp::from_secs(2));
        let baseline = Baseline::from_samples(&history);
        let ctx = DetectionContext::new("m", &history, &current, &baseline);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(engine.analyze(&ctx, &cancel), Err(AnalysisError::Cancelled)));
    }

    #[test]
    fn test_insufficient_history_never_flags() {
        let engine = AnomalyEngine::from_config(&AnomalyConfig::default());
        assert_eq!(engine.detector_names().len(), 7);
        let result = run(&engine);
        assert!(!result.is_anomaly);
        assert!(result.detection_methods.is_empty());
    }

    #[test]
    fn test_sample_adequacy() {
        assert_eq!(sample_adequacy(10, 20), 0.25);
        assert_eq!(sample_adequacy(40, 20), 1.0);
        assert_eq!(sample_adequacy(400, 20), 1.0);
        assert_eq!(sample_adequacy(3, 0), 1.0);
    }
}
