// ============================================================================
// ANALYSIS PIPELINE
// ============================================================================
// One pass over one metric at one tier:
//   history window → baseline → anomaly engine → trend analyzer
//   → resource analyzer → configured thresholds → at most one alert
//
// The candidate alert is picked by priority (anomaly, threshold breach,
// resource level, trend exhaustion); the other findings ride along in its
// context. Evaluation is synchronous and CPU-bound, so `run` moves it onto
// the blocking pool before raising the alert.
// ============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::alerts::{Alert, AlertManager, AlertOutcome};
use crate::anomaly::{AnomalyEngine, AnomalyResult, DetectionContext};
use crate::config::{AnalysisConfig, EngineConfig, MetricThresholds, ThresholdLevels};
use crate::error::{AnalysisError, AnalysisResult};
use crate::history::MetricHistoryManager;
use crate::logging::PerfTimer;
use crate::resource::{ResourceAnalyzers, ResourceAssessment};
use crate::stats::Baseline;
use crate::telemetry::EngineMetrics;
use crate::trend::{TrendAnalyzer, TrendResult};
use crate::types::{Severity, TimeWindow, Timestamp};

/// Exhaustion projected further out than this is not worth an alert
const EXHAUSTION_HORIZON_HOURS: f64 = 24.0;
const EXHAUSTION_URGENT_HOURS: f64 = 6.0;

/// Analysis slower than this is logged as slow
const SLOW_ANALYSIS_MS: u64 = 1_000;

// ----------------------------------------------------------------------------
// 13.1 Findings
// ----------------------------------------------------------------------------

/// Current value at or beyond a configured threshold
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ThresholdBreach {
    pub severity: Severity,
    pub threshold: f64,
    pub value: f64,
}

impl ThresholdBreach {
    fn check(levels: &ThresholdLevels, value: f64) -> Option<Self> {
        if let Some(critical) = levels.critical.filter(|c| value >= *c) {
            return Some(Self {
                severity: Severity::Critical,
                threshold: critical,
                value,
            });
        }
        levels.warning.filter(|w| value >= *w).map(|warning| Self {
            severity: Severity::Warning,
            threshold: warning,
            value,
        })
    }
}

/// Projected time until the metric reaches its ceiling
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Exhaustion {
    pub ceiling: f64,
    pub hours: f64,
}

/// Everything one pass found
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub metric: String,
    pub tier: TimeWindow,
    pub analyzed_at: Timestamp,
    pub points: usize,
    pub current_value: Option<f64>,
    pub baseline: Baseline,
    pub anomaly: AnomalyResult,
    pub trend: TrendResult,
    pub resource: Option<ResourceAssessment>,
    pub threshold_breach: Option<ThresholdBreach>,
    pub exhaustion: Option<Exhaustion>,
    /// Candidate alert produced by this pass
    pub alert: Option<Alert>,
    /// What the alert manager did with the candidate
    pub alert_outcome: Option<AlertOutcome>,
}

impl AnalysisReport {
    fn empty(metric: &str, tier: TimeWindow, now: Timestamp) -> Self {
        Self {
            metric: metric.to_string(),
            tier,
            analyzed_at: now,
            points: 0,
            current_value: None,
            baseline: Baseline::default(),
            anomaly: AnomalyResult::normal(),
            trend: TrendResult::insufficient(0),
            resource: None,
            threshold_breach: None,
            exhaustion: None,
            alert: None,
            alert_outcome: None,
        }
    }
}

/// Alert severity for a combined anomaly score
pub fn severity_for_score(score: f64) -> Severity {
    if score >= 0.8 {
        Severity::Critical
    } else if score >= 0.6 {
        Severity::High
    } else {
        Severity::Warning
    }
}

// ----------------------------------------------------------------------------
// 13.2 Pipeline
// ----------------------------------------------------------------------------

pub struct AnalysisPipeline {
    history: Arc<MetricHistoryManager>,
    alerts: Arc<AlertManager>,
    metrics: Arc<EngineMetrics>,
    anomaly: AnomalyEngine,
    trend: TrendAnalyzer,
    resources: ResourceAnalyzers,
    analysis: AnalysisConfig,
    thresholds: HashMap<String, MetricThresholds>,
}

impl AnalysisPipeline {
    pub fn new(
        config: &EngineConfig,
        history: Arc<MetricHistoryManager>,
        alerts: Arc<AlertManager>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            history,
            alerts,
            metrics,
            anomaly: AnomalyEngine::from_config(&config.anomaly),
            trend: TrendAnalyzer::new(config.trend.clone()),
            resources: ResourceAnalyzers::new(config.resource.clone()),
            analysis: config.analysis.clone(),
            thresholds: config.thresholds.clone(),
        }
    }

    pub fn analysis_config(&self) -> &AnalysisConfig {
        &self.analysis
    }

    fn thresholds_for(&self, metric: &str, tier: TimeWindow) -> Option<&ThresholdLevels> {
        self.thresholds.get(metric).and_then(|t| t.for_window(tier))
    }

    /// Run every analyzer over the tier window ending at `now` and pick the
    /// candidate alert. Does not raise it.
    pub fn evaluate(
        &self,
        metric: &str,
        tier: TimeWindow,
        now: Timestamp,
        cancel: &CancellationToken,
    ) -> AnalysisResult<AnalysisReport> {
        let points = self
            .history
            .get_data_points(metric, self.analysis.window(tier), now)?;
        let mut report = AnalysisReport::empty(metric, tier, now);
        report.points = points.len();

        let Some((current, history)) = points.split_last() else {
            trace!(target: "pulse::pipeline", metric, tier = %tier, "Empty window, nothing to analyse");
            return Ok(report);
        };
        report.current_value = Some(current.value);

        let baseline = Baseline::from_samples(history);
        let ctx = DetectionContext::new(metric, history, current, &baseline);
        report.baseline = baseline;
        report.anomaly = self.anomaly.analyze(&ctx, cancel)?;

        if cancel.is_cancelled() {
            return Err(AnalysisError::Cancelled);
        }
        report.trend = self.trend.analyze_points(&points, cancel)?;
        report.resource = self.resources.assess(metric, &points, report.trend.slope);

        let levels = self.thresholds_for(metric, tier);
        report.threshold_breach = levels.and_then(|l| ThresholdBreach::check(l, current.value));
        report.exhaustion = exhaustion(&report, levels);

        report.alert = self.candidate_alert(&report);
        debug!(
            target: "pulse::pipeline",
            metric,
            tier = %tier,
            points = report.points,
            anomaly = report.anomaly.is_anomaly,
            score = report.anomaly.score,
            trend = report.trend.trend_type.as_str(),
            alert = report.alert.is_some(),
            "Analysis pass complete"
        );
        Ok(report)
    }

    /// Evaluate at `now` on the blocking pool, then raise the candidate alert
    pub async fn run_at(
        self: &Arc<Self>,
        metric: &str,
        tier: TimeWindow,
        now: Timestamp,
        cancel: CancellationToken,
    ) -> AnalysisResult<AnalysisReport> {
        let timer = PerfTimer::with_threshold("analysis", SLOW_ANALYSIS_MS);
        let pipeline = Arc::clone(self);
        let owned_metric = metric.to_string();
        let mut report = tokio::task::spawn_blocking(move || pipeline.evaluate(&owned_metric, tier, now, &cancel))
            .await
            .map_err(|e| AnalysisError::WorkerFailed {
                message: e.to_string(),
            })??;

        if let Some(alert) = report.alert.clone() {
            let outcome = self.alerts.raise_alert(alert).await;
            self.metrics.record_alert(&outcome);
            report.alert_outcome = Some(outcome);
        }
        self.metrics.record_analysis(tier, timer.elapsed_secs_f64());
        crate::log_perf!("analysis", timer.stop(), metric = metric, tier = tier.as_str());
        Ok(report)
    }

    pub async fn run(
        self: &Arc<Self>,
        metric: &str,
        tier: TimeWindow,
        cancel: CancellationToken,
    ) -> AnalysisResult<AnalysisReport> {
        self.run_at(metric, tier, Timestamp::now(), cancel).await
    }

    // ------------------------------------------------------------------------
    // Alert selection
    // ------------------------------------------------------------------------

    fn candidate_alert(&self, report: &AnalysisReport) -> Option<Alert> {
        let metric = report.metric.as_str();
        let value = report.current_value?;

        let (kind, severity, message) = if report.anomaly.is_anomaly {
            let mut severity = severity_for_score(report.anomaly.score);
            if let Some(breach) = report.threshold_breach {
                severity = severity.max(breach.severity);
            }
            let message = format!(
                "Anomalous value {value:.2} for {metric} (score {:.2}): {}",
                report.anomaly.score,
                report.anomaly.explanation()
            );
            ("anomaly", severity, message)
        } else if let Some(breach) = report.threshold_breach {
            let message = format!(
                "{metric} at {value:.2} crossed its {} threshold of {:.2}",
                breach.severity, breach.threshold
            );
            ("threshold", breach.severity, message)
        } else if let Some((assessment, severity)) = report
            .resource
            .as_ref()
            .and_then(|a| a.level.severity().map(|s| (a, s)))
        {
            let message = format!(
                "{} utilization {} at {value:.1}% for {metric}",
                assessment.kind.as_str(),
                assessment.level.as_str()
            );
            ("resource", severity, message)
        } else if let Some(exhaustion) = report.exhaustion {
            let severity = if exhaustion.hours <= EXHAUSTION_URGENT_HOURS {
                Severity::High
            } else {
                Severity::Warning
            };
            let message = format!(
                "{metric} projected to reach {:.2} in {:.1}h at the current trend",
                exhaustion.ceiling, exhaustion.hours
            );
            ("trend", severity, message)
        } else {
            return None;
        };

        let mut alert = Alert::new(format!("{metric}.{kind}"), metric, severity, message)
            .at(report.analyzed_at)
            .with_context("metric", metric)
            .with_context("tier", report.tier.as_str())
            .with_context("value", value)
            .with_context("points", report.points)
            .with_context("baseline_mean", report.baseline.mean)
            .with_context("baseline_stddev", report.baseline.stddev)
            .with_context("trend", report.trend.trend_type.as_str())
            .with_context("trend_slope_per_hour", finite_or_zero(report.trend.slope));

        if report.anomaly.is_anomaly {
            let methods: Vec<&str> = report.anomaly.detection_methods.iter().map(|m| m.as_str()).collect();
            alert = alert
                .with_context("anomaly_score", report.anomaly.score)
                .with_context("anomaly_confidence", report.anomaly.confidence)
                .with_context("detection_methods", json!(methods))
                .with_context("explanation", report.anomaly.explanation());
        }
        if let Some(breach) = report.threshold_breach {
            alert = alert
                .with_context("threshold", breach.threshold)
                .with_context("threshold_level", breach.severity.as_str());
        }
        if let Some(assessment) = &report.resource {
            let recommendations: Vec<&str> = assessment
                .recommendations
                .iter()
                .map(|r| r.message.as_str())
                .collect();
            alert = alert
                .with_context("utilization_level", assessment.level.as_str())
                .with_context("recommendations", json!(recommendations));
        }
        if let Some(exhaustion) = report.exhaustion {
            alert = alert.with_context("hours_to_exhaustion", exhaustion.hours);
        }
        Some(alert)
    }
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

/// Hours until a rising metric reaches its ceiling: the critical threshold
/// when one is configured, 100% for resource metrics.
fn exhaustion(report: &AnalysisReport, levels: Option<&ThresholdLevels>) -> Option<Exhaustion> {
    if let Some(hours) = report.resource.as_ref().and_then(|r| r.hours_to_full) {
        return (hours <= EXHAUSTION_HORIZON_HOURS).then_some(Exhaustion { ceiling: 100.0, hours });
    }

    let slope = report.trend.slope;
    if report.trend.is_stable() || !slope.is_finite() || slope <= 0.0 {
        return None;
    }
    let ceiling = levels
        .and_then(|l| l.critical)
        .or_else(|| report.resource.as_ref().map(|_| 100.0))?;
    let current = report.current_value?;
    if current >= ceiling {
        return None;
    }
    let hours = (ceiling - current) / slope;
    (hours <= EXHAUSTION_HORIZON_HOURS).then_some(Exhaustion { ceiling, hours })
}
