// ============================================================================
// TREND & SEASONALITY ANALYZER
// ============================================================================
// Several trend estimators run over the same window and are reduced to one
// verdict. Slopes are in value units per hour. Each estimator's slope is
// classified by the relative change it implies over the analysed span:
//
//     rel = slope * span_hours / |mean|
//
// compared against +/- `stable_threshold`.
// ============================================================================

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::config::TrendConfig;
use crate::error::{AnalysisError, AnalysisResult};
use crate::stats::{detect_seasonality, Seasonality, StatisticalFunctions, TrendAnalysis};
use crate::types::{MetricSample, Timestamp};

// ----------------------------------------------------------------------------
// 8.1 Result Types
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendType {
    Increasing,
    Decreasing,
    Stable,
}

impl TrendType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrendType::Increasing => "increasing",
            TrendType::Decreasing => "decreasing",
            TrendType::Stable => "stable",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub timestamp: Timestamp,
    pub value: f64,
    pub confidence: f64,
}

/// Slope reported by one estimator; NaN when it abstained
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EstimatorSlope {
    pub estimator: &'static str,
    pub slope: f64,
    pub trend_type: Option<TrendType>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendResult {
    pub trend_type: TrendType,
    /// Value units per hour
    pub slope: f64,
    pub confidence: f64,
    /// `(last - first) / (first * elapsed_hours)`
    pub change_rate: f64,
    pub r_squared: f64,
    pub seasonality: Seasonality,
    pub predictions: Vec<Prediction>,
    pub estimator_slopes: Vec<EstimatorSlope>,
    pub points_analyzed: usize,
}

impl TrendResult {
    /// Stable verdict with no confidence, for windows too short to judge
    pub fn insufficient(points_analyzed: usize) -> Self {
        Self {
            trend_type: TrendType::Stable,
            slope: 0.0,
            confidence: 0.0,
            change_rate: 0.0,
            r_squared: 0.0,
            seasonality: Seasonality::NONE,
            predictions: Vec::new(),
            estimator_slopes: Vec::new(),
            points_analyzed,
        }
    }

    pub fn is_stable(&self) -> bool {
        self.trend_type == TrendType::Stable
    }
}

// ----------------------------------------------------------------------------
// 8.2 Analyzer
// ----------------------------------------------------------------------------

/// Prepared window: hours since the first point, and values
struct Window {
    hours: Vec<f64>,
    values: Vec<f64>,
    last: Timestamp,
    span_hours: f64,
    mean: f64,
}

impl Window {
    fn new(points: &[MetricSample]) -> Option<Self> {
        let first = points.first()?.timestamp;
        let last = points.last()?.timestamp;
        let hours: Vec<f64> = points.iter().map(|p| p.timestamp.hours_since(first)).collect();
        let values: Vec<f64> = points.iter().map(|p| p.value).collect();
        let mean = StatisticalFunctions::mean(&values);
        Some(Self {
            span_hours: last.hours_since(first),
            hours,
            values,
            last,
            mean,
        })
    }

    fn len(&self) -> usize {
        self.values.len()
    }

    /// Average spacing between points, in hours
    fn step_hours(&self) -> f64 {
        if self.len() < 2 {
            return 0.0;
        }
        self.span_hours / (self.len() - 1) as f64
    }
}

pub struct TrendAnalyzer {
    config: TrendConfig,
}

impl TrendAnalyzer {
    pub fn new(config: TrendConfig) -> Self {
        Self { config }
    }

    /// Analyse the points inside `[now - window, now]`. `cancel` is checked
    /// before every estimator.
    pub fn analyze(
        &self,
        points: &[MetricSample],
        window: Duration,
        now: Timestamp,
        cancel: &CancellationToken,
    ) -> AnalysisResult<TrendResult> {
        let start = now.sub_duration(window);
        let in_window: Vec<MetricSample> = points
            .iter()
            .filter(|p| p.timestamp.is_within(start, now))
            .cloned()
            .collect();
        self.analyze_points(&in_window, cancel)
    }

    /// Analyse every point given, oldest first
    pub fn analyze_points(&self, points: &[MetricSample], cancel: &CancellationToken) -> AnalysisResult<TrendResult> {
        if points.len() < self.config.min_points.max(2) {
            return Ok(TrendResult::insufficient(points.len()));
        }
        let Some(window) = Window::new(points) else {
            return Ok(TrendResult::insufficient(0));
        };
        if window.span_hours <= 0.0 {
            return Ok(TrendResult::insufficient(points.len()));
        }

        let max_period = self
            .config
            .max_seasonal_period
            .unwrap_or(window.len() / 2);
        let seasonality = detect_seasonality(&window.values, max_period, self.config.seasonal_min_correlation);

        let reference = TrendAnalysis::linear_regression(&window.hours, &window.values);

        let estimators: [(&'static str, fn(&Self, &Window, &Seasonality) -> f64); 4] = [
            ("linear", Self::linear_slope),
            ("moving_average", Self::moving_average_slope),
            ("exponential_smoothing", Self::holt_slope),
            ("seasonal_adjusted", Self::seasonal_adjusted_slope),
        ];

        let mut slopes = Vec::with_capacity(estimators.len());
        for (name, estimator) in estimators {
            if cancel.is_cancelled() {
                return Err(AnalysisError::Cancelled);
            }
            let slope = estimator(self, &window, &seasonality);
            let trend_type = (!slope.is_nan()).then(|| self.classify(slope, &window));
            trace!(target: "pulse::trend", estimator = name, slope, "Estimator slope");
            slopes.push(EstimatorSlope {
                estimator: name,
                slope,
                trend_type,
            });
        }

        let (trend_type, agreement) = dominant_trend(&slopes);
        let valid: Vec<f64> = slopes.iter().map(|s| s.slope).filter(|s| !s.is_nan()).collect();
        let slope = StatisticalFunctions::mean(&valid);
        let r_squared = reference.r_squared.clamp(0.0, 1.0);
        let confidence = (0.5 * agreement + 0.5 * r_squared).clamp(0.0, 1.0);

        let predictions = if trend_type == TrendType::Stable {
            Vec::new()
        } else {
            self.predict(&window, slope, confidence)
        };

        Ok(TrendResult {
            trend_type,
            slope,
            confidence,
            change_rate: change_rate(&window),
            r_squared,
            seasonality,
            predictions,
            estimator_slopes: slopes,
            points_analyzed: window.len(),
        })
    }

    fn classify(&self, slope: f64, window: &Window) -> TrendType {
        let relative = slope * window.span_hours / window.mean.abs().max(f64::EPSILON);
        if relative > self.config.stable_threshold {
            TrendType::Increasing
        } else if relative < -self.config.stable_threshold {
            TrendType::Decreasing
        } else {
            TrendType::Stable
        }
    }

    fn linear_slope(&self, window: &Window, _: &Seasonality) -> f64 {
        TrendAnalysis::linear_regression(&window.hours, &window.values).slope
    }

    /// First versus last simple moving average, over the time between the
    /// midpoints of the two averaging windows.
    fn moving_average_slope(&self, window: &Window, _: &Seasonality) -> f64 {
        let n = window.len();
        let period = (n / 5).max(2);
        if n < period * 2 {
            return f64::NAN;
        }
        let first = StatisticalFunctions::mean(&window.values[..period]);
        let last = StatisticalFunctions::mean(&window.values[n - period..]);
        let first_mid = StatisticalFunctions::mean(&window.hours[..period]);
        let last_mid = StatisticalFunctions::mean(&window.hours[n - period..]);
        let dt = last_mid - first_mid;
        if dt <= 0.0 {
            return f64::NAN;
        }
        (last - first) / dt
    }

    fn holt_slope(&self, window: &Window, _: &Seasonality) -> f64 {
        let step = window.step_hours();
        if step <= 0.0 {
            return f64::NAN;
        }
        match TrendAnalysis::holt(&window.values, self.config.smoothing_alpha, self.config.smoothing_beta) {
            Some((_, trend_per_step)) => trend_per_step / step,
            None => f64::NAN,
        }
    }

    /// Linear fit after subtracting each phase's mean deviation; abstains
    /// without a seasonal pattern.
    fn seasonal_adjusted_slope(&self, window: &Window, seasonality: &Seasonality) -> f64 {
        if !seasonality.has_pattern || seasonality.period < 2 {
            return f64::NAN;
        }
        let adjusted = deseasonalize(&window.values, seasonality.period);
        TrendAnalysis::linear_regression(&window.hours, &adjusted).slope
    }

    fn predict(&self, window: &Window, slope: f64, confidence: f64) -> Vec<Prediction> {
        let horizon = self.config.prediction_horizon;
        let step = window.step_hours();
        if horizon == 0 || step <= 0.0 {
            return Vec::new();
        }
        let last_value = window.values[window.len() - 1];
        (1..=horizon)
            .map(|k| {
                let hours_ahead = step * k as f64;
                Prediction {
                    timestamp: window
                        .last
                        .add_duration(Duration::from_secs_f64(hours_ahead * 3600.0)),
                    value: last_value + slope * hours_ahead,
                    confidence: confidence * (1.0 - k as f64 / horizon as f64),
                }
            })
            .collect()
    }
}

/// Mode of the estimator verdicts, ties going to `Stable`, and the share of
/// voting estimators that agree with it.
fn dominant_trend(slopes: &[EstimatorSlope]) -> (TrendType, f64) {
    let votes: Vec<TrendType> = slopes.iter().filter_map(|s| s.trend_type).collect();
    if votes.is_empty() {
        return (TrendType::Stable, 0.0);
    }
    let count = |t: TrendType| votes.iter().filter(|v| **v == t).count();
    let increasing = count(TrendType::Increasing);
    let decreasing = count(TrendType::Decreasing);
    let stable = count(TrendType::Stable);

    let best = increasing.max(decreasing).max(stable);
    let winners = [increasing, decreasing, stable].iter().filter(|c| **c == best).count();
    let trend = if winners > 1 || stable == best {
        TrendType::Stable
    } else if increasing == best {
        TrendType::Increasing
    } else {
        TrendType::Decreasing
    };
    let agreeing = count(trend);
    (trend, agreeing as f64 / votes.len() as f64)
}

fn deseasonalize(values: &[f64], period: usize) -> Vec<f64> {
    let mean = StatisticalFunctions::mean(values);
    let mut phase_sum = vec![0.0; period];
    let mut phase_count = vec![0usize; period];
    for (i, v) in values.iter().enumerate() {
        phase_sum[i % period] += v;
        phase_count[i % period] += 1;
    }
    let offsets: Vec<f64> = phase_sum
        .iter()
        .zip(&phase_count)
        .map(|(sum, count)| if *count > 0 { sum / *count as f64 - mean } else { 0.0 })
        .collect();
    values
        .iter()
        .enumerate()
        .map(|(i, v)| v - offsets[i % period])
        .collect()
}

fn change_rate(window: &Window) -> f64 {
    let first = window.values[0];
    let last = window.values[window.len() - 1];
    let denominator = first * window.span_hours;
    if denominator.abs() <= f64::EPSILON {
        return 0.0;
    }
    (last - first) / denominator
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    fn series(n: usize, step_secs: i64, f: impl Fn(usize) -> f64) -> Vec<MetricSample> {
        (0..n)
            .map(|i| MetricSample::at("m", f(i), Timestamp::from_secs(1_000_000 + i as i64 * step_secs)))
            .collect()
    }

    fn analyzer() -> TrendAnalyzer {
        TrendAnalyzer::new(TrendConfig::default())
    }

    fn run(points: &[MetricSample]) -> TrendResult {
        analyzer()
            .analyze_points(points, &CancellationToken::new())
            .expect("analysis")
    }

    #[test]
    fn test_increasing_series() {
        // +10 per hour, one point every 6 minutes
        let points = series(60, 360, |i| 20.0 + i as f64);
        let result = run(&points);
        assert_eq!(result.trend_type, TrendType::Increasing);
        assert!((result.slope - 10.0).abs() < 0.5, "slope {}", result.slope);
        assert!(result.confidence > 0.9);
        assert!((result.r_squared - 1.0).abs() < 1e-9);
        assert_eq!(result.predictions.len(), 12);
    }

    #[test]
    fn test_decreasing_series() {
        let points = series(60, 360, |i| 200.0 - 2.0 * i as f64);
        let result = run(&points);
        assert_eq!(result.trend_type, TrendType::Decreasing);
        assert!(result.slope < 0.0);
        assert!(result.change_rate < 0.0);
    }

    #[test]
    fn test_flat_series_is_stable_without_predictions() {
        let points = series(60, 60, |i| if i % 2 == 0 { 50.0 } else { 50.5 });
        let result = run(&points);
        assert_eq!(result.trend_type, TrendType::Stable);
        assert!(result.predictions.is_empty());
    }

    #[test]
    fn test_too_few_points_is_stable_with_no_confidence() {
        let points = series(5, 60, |i| i as f64 * 100.0);
        let result = run(&points);
        assert_eq!(result, TrendResult::insufficient(5));
    }

    #[test]
    fn test_predictions_extrapolate_and_decay() {
        let points = series(60, 360, |i| 20.0 + i as f64);
        let result = run(&points);
        let last = points[59].value;
        let first = result.predictions[0];
        assert!(first.value > last);
        assert!((first.value - (last + result.slope * 0.1)).abs() < 1e-6);
        assert!(result.predictions.windows(2).all(|w| w[1].confidence < w[0].confidence));
        assert_eq!(result.predictions[11].confidence, 0.0);
        assert!(first.timestamp > points[59].timestamp);
    }

    #[test]
    fn test_change_rate() {
        // 100 -> 150 over exactly 5 hours: 50 / (100 * 5) = 0.1
        let points = series(11, 1_800, |i| 100.0 + 5.0 * i as f64);
        let result = run(&points);
        assert!((result.change_rate - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_seasonality_reported() {
        let points = series(100, 60, |t| 50.0 + 10.0 * (2.0 * PI * t as f64 / 24.0).sin());
        let result = run(&points);
        assert!(result.seasonality.has_pattern);
        assert!((23..=25).contains(&result.seasonality.period));
        let seasonal = result
            .estimator_slopes
            .iter()
            .find(|s| s.estimator == "seasonal_adjusted")
            .expect("estimator present");
        assert!(!seasonal.slope.is_nan());
    }

    #[test]
    fn test_window_filter() {
        let points = series(120, 60, |i| i as f64);
        let now = points[119].timestamp;
        let result = analyzer()
            .analyze(&points, Duration::from_secs(30 * 60), now, &CancellationToken::new())
            .expect("analysis");
        assert_eq!(result.points_analyzed, 31);
    }

    #[test]
    fn test_cancellation() {
        let points = series(60, 60, |i| i as f64);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            analyzer().analyze_points(&points, &cancel),
            Err(AnalysisError::Cancelled)
        ));
    }

    #[test]
    fn test_dominant_trend_ties_go_to_stable() {
        let slope = |t: Option<TrendType>| EstimatorSlope {
            estimator: "x",
            slope: 1.0,
            trend_type: t,
        };
        let (trend, agreement) = dominant_trend(&[
            slope(Some(TrendType::Increasing)),
            slope(Some(TrendType::Decreasing)),
            slope(None),
        ]);
        assert_eq!(trend, TrendType::Stable);
        assert_eq!(agreement, 0.0);

        let (trend, agreement) = dominant_trend(&[
            slope(Some(TrendType::Increasing)),
            slope(Some(TrendType::Increasing)),
            slope(Some(TrendType::Stable)),
        ]);
        assert_eq!(trend, TrendType::Increasing);
        assert!((agreement - 2.0 / 3.0).abs() < 1e-12);
    }
}
