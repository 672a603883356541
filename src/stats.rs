// ============================================================================
// STATISTICAL FUNCTIONS
// ============================================================================
// Shared numeric helpers used by the history manager, the anomaly detectors,
// the trend analyzer and the resource analyzers. Percentiles interpolate
// linearly between closest ranks (rank = p * (n - 1)); standard deviation
// is the population form.
// ============================================================================

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use crate::types::MetricSample;

// ----------------------------------------------------------------------------
// 5.1 Descriptive Statistics
// ----------------------------------------------------------------------------

/// Statistical functions over plain value slices.
pub struct StatisticalFunctions;

impl StatisticalFunctions {
    pub fn mean(values: &[f64]) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        values.iter().sum::<f64>() / values.len() as f64
    }

    /// Population variance
    pub fn variance(values: &[f64]) -> f64 {
        if values.len() < 2 {
            return 0.0;
        }
        let mean = Self::mean(values);
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64
    }

    /// Population standard deviation
    pub fn std_dev(values: &[f64]) -> f64 {
        Self::variance(values).sqrt()
    }

    /// Sorted copy of the values (total order, NaN last)
    pub fn sorted(values: &[f64]) -> Vec<f64> {
        let mut sorted = values.to_vec();
        sorted.sort_by_key(|v| OrderedFloat(*v));
        sorted
    }

    /// Percentile of an already sorted slice, `p` in [0, 1]
    pub fn percentile_sorted(sorted: &[f64], p: f64) -> f64 {
        match sorted.len() {
            0 => 0.0,
            1 => sorted[0],
            n => {
                let rank = p.clamp(0.0, 1.0) * (n - 1) as f64;
                let lower = rank.floor() as usize;
                let upper = rank.ceil() as usize;
                let fraction = rank - lower as f64;
                sorted[lower] + (sorted[upper] - sorted[lower]) * fraction
            }
        }
    }

    pub fn percentile(values: &[f64], p: f64) -> f64 {
        Self::percentile_sorted(&Self::sorted(values), p)
    }

    pub fn median(values: &[f64]) -> f64 {
        Self::percentile(values, 0.5)
    }

    /// stddev / |mean|; a zero mean counts as infinitely volatile unless the
    /// series is flat.
    pub fn coefficient_of_variation(values: &[f64]) -> f64 {
        let mean = Self::mean(values);
        let std = Self::std_dev(values);
        if mean == 0.0 {
            if std > 0.0 {
                f64::INFINITY
            } else {
                0.0
            }
        } else {
            std / mean.abs()
        }
    }

    /// Simple moving average with a sliding sum
    pub fn sma(values: &[f64], period: usize) -> Vec<f64> {
        if period == 0 || values.len() < period {
            return Vec::new();
        }

        let mut result = Vec::with_capacity(values.len() - period + 1);
        let mut sum: f64 = values[..period].iter().sum();
        result.push(sum / period as f64);

        for i in period..values.len() {
            sum += values[i] - values[i - period];
            result.push(sum / period as f64);
        }

        result
    }
}

/// Summary statistics of one metric over a window
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub mean: f64,
    pub median: f64,
    pub stddev: f64,
    pub min: f64,
    pub max: f64,
    pub p95: f64,
    pub p99: f64,
    pub count: usize,
}

impl Statistics {
    /// All-zero statistics when `values` is empty
    pub fn from_values(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        let sorted = StatisticalFunctions::sorted(values);
        Self {
            mean: StatisticalFunctions::mean(values),
            median: StatisticalFunctions::percentile_sorted(&sorted, 0.5),
            stddev: StatisticalFunctions::std_dev(values),
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            p95: StatisticalFunctions::percentile_sorted(&sorted, 0.95),
            p99: StatisticalFunctions::percentile_sorted(&sorted, 0.99),
            count: values.len(),
        }
    }

    pub fn from_samples(samples: &[MetricSample]) -> Self {
        let values: Vec<f64> = samples.iter().map(|s| s.value).collect();
        Self::from_values(&values)
    }
}

/// Reference snapshot of a metric's recent window, recomputed on every
/// analysis pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub mean: f64,
    pub median: f64,
    pub stddev: f64,
    pub p95: f64,
    pub p99: f64,
    pub count: usize,
}

impl Baseline {
    pub fn from_values(values: &[f64]) -> Self {
        Statistics::from_values(values).into()
    }

    pub fn from_samples(samples: &[MetricSample]) -> Self {
        Statistics::from_samples(samples).into()
    }
}

impl From<Statistics> for Baseline {
    fn from(stats: Statistics) -> Self {
        Self {
            mean: stats.mean,
            median: stats.median,
            stddev: stats.stddev,
            p95: stats.p95,
            p99: stats.p99,
            count: stats.count,
        }
    }
}

// ----------------------------------------------------------------------------
// 5.2 Regression
// ----------------------------------------------------------------------------

/// Least-squares fit `y = slope * x + intercept`
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Regression {
    pub slope: f64,
    pub intercept: f64,
    pub r_squared: f64,
}

impl Regression {
    pub fn predict(&self, x: f64) -> f64 {
        self.slope * x + self.intercept
    }
}

/// Trend analysis functions.
pub struct TrendAnalysis;

impl TrendAnalysis {
    /// Ordinary least squares over paired samples. Degenerate input (fewer than
    /// two points or constant x) yields a flat fit through the mean.
    pub fn linear_regression(x: &[f64], y: &[f64]) -> Regression {
        let n = x.len().min(y.len());
        if n < 2 {
            return Regression {
                slope: 0.0,
                intercept: y.first().copied().unwrap_or(0.0),
                r_squared: 0.0,
            };
        }
        let (x, y) = (&x[..n], &y[..n]);
        let nf = n as f64;

        let mean_x = x.iter().sum::<f64>() / nf;
        let mean_y = y.iter().sum::<f64>() / nf;

        let mut sxx = 0.0;
        let mut sxy = 0.0;
        let mut syy = 0.0;
        for (xi, yi) in x.iter().zip(y.iter()) {
            let dx = xi - mean_x;
            let dy = yi - mean_y;
            sxx += dx * dx;
            sxy += dx * dy;
            syy += dy * dy;
        }

        if sxx == 0.0 {
            return Regression {
                slope: 0.0,
                intercept: mean_y,
                r_squared: 0.0,
            };
        }

        let slope = sxy / sxx;
        let intercept = mean_y - slope * mean_x;

        let ss_res: f64 = x
            .iter()
            .zip(y.iter())
            .map(|(xi, yi)| (yi - (slope * xi + intercept)).powi(2))
            .sum();
        let r_squared = if syy != 0.0 {
            (1.0 - ss_res / syy).clamp(0.0, 1.0)
        } else {
            0.0
        };

        Regression {
            slope,
            intercept,
            r_squared,
        }
    }

    /// Regression of values against their index (0, 1, 2, ...)
    pub fn index_regression(values: &[f64]) -> Regression {
        let x: Vec<f64> = (0..values.len()).map(|i| i as f64).collect();
        Self::linear_regression(&x, values)
    }

    /// Holt's double exponential smoothing; returns the final (level, trend)
    /// where trend is expressed per step.
    pub fn holt(values: &[f64], alpha: f64, beta: f64) -> Option<(f64, f64)> {
        if values.len() < 2 {
            return None;
        }

        let mut level = values[0];
        let mut trend = values[1] - values[0];

        for value in &values[1..] {
            let new_level = alpha * value + (1.0 - alpha) * (level + trend);
            trend = beta * (new_level - level) + (1.0 - beta) * trend;
            level = new_level;
        }

        Some((level, trend))
    }
}

// ----------------------------------------------------------------------------
// 5.3 Autocorrelation & Seasonality
// ----------------------------------------------------------------------------

/// Periodic structure found in a series
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Seasonality {
    pub has_pattern: bool,
    /// Period in samples
    pub period: usize,
    /// Autocorrelation at the detected period
    pub strength: f64,
}

impl Seasonality {
    pub const NONE: Seasonality = Seasonality {
        has_pattern: false,
        period: 0,
        strength: 0.0,
    };
}

/// Biased sample autocorrelation for lags `0..=max_lag`
pub fn autocorrelation(values: &[f64], max_lag: usize) -> Vec<f64> {
    let n = values.len();
    if n < 2 {
        return Vec::new();
    }
    let mean = StatisticalFunctions::mean(values);
    let denominator: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
    let max_lag = max_lag.min(n - 1);

    if denominator == 0.0 {
        return vec![0.0; max_lag + 1];
    }

    (0..=max_lag)
        .map(|lag| {
            let numerator: f64 = (0..n - lag)
                .map(|i| (values[i] - mean) * (values[i + lag] - mean))
                .sum();
            numerator / denominator
        })
        .collect()
}

/// Search lags `1..=max_period` (capped at half the series) for the strongest
/// local autocorrelation maximum above `min_correlation`.
pub fn detect_seasonality(values: &[f64], max_period: usize, min_correlation: f64) -> Seasonality {
    let half = values.len() / 2;
    let max_period = max_period.min(half);
    if max_period < 2 {
        return Seasonality::NONE;
    }

    // One extra lag so the last candidate has a right-hand neighbour.
    let acf = autocorrelation(values, max_period + 1);
    if acf.len() < 3 {
        return Seasonality::NONE;
    }

    let mut best = Seasonality::NONE;
    for lag in 1..=max_period.min(acf.len() - 1) {
        let value = acf[lag];
        let left = acf[lag - 1];
        let right = acf.get(lag + 1).copied().unwrap_or(f64::NEG_INFINITY);
        let is_peak = value > left && value >= right;
        if is_peak && value > min_correlation && value > best.strength {
            best = Seasonality {
                has_pattern: true,
                period: lag,
                strength: value,
            };
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_percentile_interpolates_between_ranks() {
        let values = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(StatisticalFunctions::percentile(&values, 0.0), 1.0);
        assert_eq!(StatisticalFunctions::percentile(&values, 1.0), 4.0);
        assert!((StatisticalFunctions::percentile(&values, 0.5) - 2.5).abs() < 1e-12);
        // rank = 0.95 * 3 = 2.85
        assert!((StatisticalFunctions::percentile(&values, 0.95) - 3.85).abs() < 1e-12);
    }

    #[test]
    fn test_statistics_summary() {
        let values: Vec<f64> = (1..=100).map(|i| i as f64).collect();
        let stats = Statistics::from_values(&values);
        assert_eq!(stats.count, 100);
        assert!((stats.mean - 50.5).abs() < 1e-9);
        assert!((stats.median - 50.5).abs() < 1e-9);
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 100.0);
        assert!((stats.p99 - 99.01).abs() < 1e-9);
        // population stddev of 1..=100
        assert!((stats.stddev - 28.866_070_047_722_12).abs() < 1e-9);
    }

    #[test]
    fn test_statistics_empty() {
        assert_eq!(Statistics::from_values(&[]), Statistics::default());
    }

    #[test]
    fn test_coefficient_of_variation_edges() {
        assert_eq!(StatisticalFunctions::coefficient_of_variation(&[5.0, 5.0]), 0.0);
        assert_eq!(StatisticalFunctions::coefficient_of_variation(&[0.0, 0.0]), 0.0);
        assert!(StatisticalFunctions::coefficient_of_variation(&[-1.0, 1.0]).is_infinite());
        assert!((StatisticalFunctions::coefficient_of_variation(&[9.0, 11.0]) - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_linear_regression_exact_line() {
        let x: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let y: Vec<f64> = x.iter().map(|v| 2.0 * v + 1.0).collect();
        let fit = TrendAnalysis::linear_regression(&x, &y);
        assert!((fit.slope - 2.0).abs() < 1e-9);
        assert!((fit.intercept - 1.0).abs() < 1e-9);
        assert!((fit.r_squared - 1.0).abs() < 1e-9);
        assert!((fit.predict(10.0) - 21.0).abs() < 1e-9);
    }

    #[test]
    fn test_linear_regression_degenerate() {
        let fit = TrendAnalysis::linear_regression(&[1.0, 1.0], &[3.0, 5.0]);
        assert_eq!(fit.slope, 0.0);
        assert_eq!(fit.intercept, 4.0);
        assert_eq!(TrendAnalysis::linear_regression(&[], &[]).slope, 0.0);
    }

    #[test]
    fn test_holt_tracks_linear_growth() {
        let values: Vec<f64> = (0..50).map(|i| 10.0 + 0.5 * i as f64).collect();
        let (level, trend) = TrendAnalysis::holt(&values, 0.3, 0.1).expect("enough points");
        assert!((trend - 0.5).abs() < 1e-6);
        assert!((level - values[49]).abs() < 1e-6);
        assert!(TrendAnalysis::holt(&[1.0], 0.3, 0.1).is_none());
    }

    #[test]
    fn test_sma() {
        let values = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(StatisticalFunctions::sma(&values, 2), vec![1.5, 2.5, 3.5, 4.5]);
        assert!(StatisticalFunctions::sma(&values, 6).is_empty());
    }

    #[test]
    fn test_seasonality_of_sine_wave() {
        let values: Vec<f64> = (0..100)
            .map(|t| 50.0 + 10.0 * (2.0 * std::f64::consts::PI * t as f64 / 24.0).sin())
            .collect();
        let seasonality = detect_seasonality(&values, usize::MAX, 0.3);
        assert!(seasonality.has_pattern);
        assert!((23..=25).contains(&seasonality.period), "period {}", seasonality.period);
        assert!(seasonality.strength > 0.5);
    }

    #[test]
    fn test_no_seasonality_in_line() {
        let values: Vec<f64> = (0..60).map(|t| t as f64).collect();
        assert!(!detect_seasonality(&values, usize::MAX, 0.3).has_pattern);
        assert!(!detect_seasonality(&[1.0; 40], usize::MAX, 0.3).has_pattern);
    }

    proptest! {
        #[test]
        fn prop_percentiles_are_ordered(values in proptest::collection::vec(-1e6f64..1e6, 1..200)) {
            let stats = Statistics::from_values(&values);
            prop_assert!(stats.min <= stats.median + 1e-9);
            prop_assert!(stats.median <= stats.p95 + 1e-9);
            prop_assert!(stats.p95 <= stats.p99 + 1e-9);
            prop_assert!(stats.p99 <= stats.max + 1e-9);
            prop_assert!(stats.stddev >= 0.0);
        }
    }
}
