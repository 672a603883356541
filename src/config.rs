// ============================================================================
// CONFIGURATION SYSTEM
// ============================================================================
// Layered configuration: built-in defaults, then a TOML file, then
// environment variables prefixed `PULSE_` (nested keys split on `__`).
// Durations are written in human-readable form ("5m", "250ms").
// Loaded once at startup; there is no hot reload.
// ============================================================================

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::TimeWindow;

const MAX_WORKER_THREADS: usize = 256;
const MIN_WORKER_THREADS: usize = 1;

// ----------------------------------------------------------------------------
// 3.1 Root Configuration
// ----------------------------------------------------------------------------

/// Root configuration for the engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: GeneralConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub sampling: SamplingConfig,

    #[serde(default)]
    pub anomaly: AnomalyConfig,

    #[serde(default)]
    pub trend: TrendConfig,

    #[serde(default)]
    pub resource: ResourceConfig,

    #[serde(default)]
    pub alerts: AlertConfig,

    #[serde(default)]
    pub analysis: AnalysisConfig,

    #[serde(default)]
    pub worker_pool: WorkerPoolConfig,

    #[serde(default)]
    pub cleanup: CleanupConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Per-metric warning/critical thresholds by analysis tier
    #[serde(default)]
    pub thresholds: HashMap<String, MetricThresholds>,
}

impl EngineConfig {
    /// Load configuration from a file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let figment = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("PULSE_").split("__"));

        Self::extract(figment)
    }

    /// Defaults overlaid with `PULSE_` environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        let figment = Figment::from(Serialized::defaults(Self::default()))
            .merge(Env::prefixed("PULSE_").split("__"));
        Self::extract(figment)
    }

    /// Load from a TOML string
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment
            .extract()
            .map_err(|e| ConfigError::parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Render the defaults as TOML
    pub fn generate_default_config() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }

    /// Worker count, auto-detected when configured as 0
    pub fn effective_worker_count(&self) -> usize {
        if self.worker_pool.workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(MIN_WORKER_THREADS)
                .max(MIN_WORKER_THREADS)
        } else {
            self.worker_pool.workers.max(MIN_WORKER_THREADS)
        }
    }

    /// Thresholds configured for a metric at a given tier
    pub fn thresholds_for(&self, metric: &str, tier: TimeWindow) -> Option<&ThresholdLevels> {
        self.thresholds.get(metric).and_then(|t| t.for_window(tier))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let storage = &self.storage;
        if storage.max_points_per_metric == 0 {
            return Err(ConfigError::invalid_value(
                "storage.max_points_per_metric",
                "must be greater than zero",
            ));
        }
        if storage.retention.is_zero() {
            return Err(ConfigError::invalid_value("storage.retention", "must be non-zero"));
        }
        if storage.writer_parallelism == 0 {
            return Err(ConfigError::invalid_value(
                "storage.writer_parallelism",
                "must allow at least one writer",
            ));
        }
        if storage.cleanup_batch_size == 0 {
            return Err(ConfigError::invalid_value(
                "storage.cleanup_batch_size",
                "must be greater than zero",
            ));
        }
        if storage.ingest_buffer_capacity == 0 {
            return Err(ConfigError::invalid_value(
                "storage.ingest_buffer_capacity",
                "must be greater than zero",
            ));
        }

        let sampling = &self.sampling;
        if sampling.min_interval > sampling.base_interval
            || sampling.base_interval > sampling.max_interval
        {
            return Err(ConfigError::invalid_value(
                "sampling",
                format!(
                    "expected min_interval ({:?}) <= base_interval ({:?}) <= max_interval ({:?})",
                    sampling.min_interval, sampling.base_interval, sampling.max_interval
                ),
            ));
        }
        if !(sampling.adjustment_step > 0.0 && sampling.adjustment_step < 1.0) {
            return Err(ConfigError::invalid_value(
                "sampling.adjustment_step",
                "must be within (0, 1)",
            ));
        }
        if sampling.variation_threshold < 0.0 {
            return Err(ConfigError::invalid_value(
                "sampling.variation_threshold",
                "must not be negative",
            ));
        }
        if sampling.recent_values_capacity < 2 {
            return Err(ConfigError::invalid_value(
                "sampling.recent_values_capacity",
                "must hold at least two values",
            ));
        }

        let anomaly = &self.anomaly;
        if anomaly.zscore_threshold <= 0.0 {
            return Err(ConfigError::invalid_value(
                "anomaly.zscore_threshold",
                "must be positive",
            ));
        }
        if anomaly.min_detections_required == 0 {
            return Err(ConfigError::invalid_value(
                "anomaly.min_detections_required",
                "at least one detector must agree",
            ));
        }
        if anomaly.moving_average_window < 2 {
            return Err(ConfigError::invalid_value(
                "anomaly.moving_average_window",
                "must cover at least two points",
            ));
        }
        if anomaly.isolation_trees == 0 || anomaly.isolation_subsample < 2 {
            return Err(ConfigError::invalid_value(
                "anomaly.isolation_subsample",
                "isolation scoring needs at least one tree and a subsample of two",
            ));
        }
        if !(0.0..=1.0).contains(&anomaly.isolation_threshold) {
            return Err(ConfigError::invalid_value(
                "anomaly.isolation_threshold",
                "must be within [0, 1]",
            ));
        }
        let weights = &anomaly.weights;
        if [weights.statistical, weights.trend, weights.threshold, weights.seasonal]
            .iter()
            .any(|w| *w < 0.0 || !w.is_finite())
        {
            return Err(ConfigError::invalid_value(
                "anomaly.weights",
                "weights must be finite and non-negative",
            ));
        }

        if self.trend.min_points < 3 {
            return Err(ConfigError::invalid_value(
                "trend.min_points",
                "at least three points are needed to fit a trend",
            ));
        }
        if !(0.0..=1.0).contains(&self.trend.smoothing_alpha)
            || !(0.0..=1.0).contains(&self.trend.smoothing_beta)
        {
            return Err(ConfigError::invalid_value(
                "trend.smoothing_alpha",
                "smoothing factors must be within [0, 1]",
            ));
        }

        if self.worker_pool.workers > MAX_WORKER_THREADS {
            return Err(ConfigError::invalid_value(
                "worker_pool.workers",
                format!("Worker count cannot exceed {}", MAX_WORKER_THREADS),
            ));
        }
        if self.worker_pool.queue_capacity == 0 {
            return Err(ConfigError::invalid_value(
                "worker_pool.queue_capacity",
                "must be greater than zero",
            ));
        }

        if self.alerts.recent_capacity == 0 {
            return Err(ConfigError::invalid_value(
                "alerts.recent_capacity",
                "must be greater than zero",
            ));
        }

        if !(0.0..=1.0).contains(&self.cleanup.memory_pressure_ratio) {
            return Err(ConfigError::invalid_value(
                "cleanup.memory_pressure_ratio",
                "must be within [0, 1]",
            ));
        }

        for (metric, thresholds) in &self.thresholds {
            for tier in TimeWindow::ALL {
                if let Some(levels) = thresholds.for_window(tier) {
                    if let (Some(w), Some(c)) = (levels.warning, levels.critical) {
                        if w > c {
                            return Err(ConfigError::invalid_value(
                                format!("thresholds.{}.{}", metric, tier),
                                "warning threshold must not exceed critical threshold",
                            ));
                        }
                    }
                }
            }
        }

        match self.logging.format.as_str() {
            "pretty" | "compact" | "json" => {}
            other => {
                return Err(ConfigError::invalid_value(
                    "logging.format",
                    format!("unknown format '{}', expected pretty, compact or json", other),
                ))
            }
        }

        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 3.2 General Engine Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Engine instance name (for identification)
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// Graceful shutdown timeout
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

fn default_instance_name() -> String {
    "pulse-engine".into()
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_true() -> bool {
    true
}

// ----------------------------------------------------------------------------
// 3.3 Storage Configuration
// ----------------------------------------------------------------------------

/// Time-series storage and history manager settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Hard cap on points held per metric
    #[serde(default = "default_max_points")]
    pub max_points_per_metric: usize,

    /// Age beyond which points are evicted
    #[serde(default = "default_retention", with = "humantime_serde")]
    pub retention: Duration,

    /// Concurrent writers allowed per metric
    #[serde(default = "default_writer_parallelism")]
    pub writer_parallelism: usize,

    /// How long a writer waits for a slot before giving up
    #[serde(default = "default_write_timeout", with = "humantime_serde")]
    pub write_timeout: Duration,

    /// Samples allowed in flight through ingestion at once
    #[serde(default = "default_ingest_capacity")]
    pub ingest_buffer_capacity: usize,

    /// Points removed per lock acquisition during cleanup
    #[serde(default = "default_cleanup_batch")]
    pub cleanup_batch_size: usize,

    /// Pause between cleanup batches
    #[serde(default = "default_cleanup_delay", with = "humantime_serde")]
    pub cleanup_batch_delay: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_points_per_metric: default_max_points(),
            retention: default_retention(),
            writer_parallelism: default_writer_parallelism(),
            write_timeout: default_write_timeout(),
            ingest_buffer_capacity: default_ingest_capacity(),
            cleanup_batch_size: default_cleanup_batch(),
            cleanup_batch_delay: default_cleanup_delay(),
        }
    }
}

fn default_max_points() -> usize {
    10_000
}

fn default_retention() -> Duration {
    Duration::from_secs(24 * 3600)
}

fn default_writer_parallelism() -> usize {
    4
}

fn default_write_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_ingest_capacity() -> usize {
    10_000
}

fn default_cleanup_batch() -> usize {
    1_000
}

fn default_cleanup_delay() -> Duration {
    Duration::from_millis(1)
}

// ----------------------------------------------------------------------------
// 3.4 Sampling Configuration
// ----------------------------------------------------------------------------

/// One age-based downsampling step: data older than `age` is sampled at
/// `interval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownsamplingRule {
    #[serde(with = "humantime_serde")]
    pub age: Duration,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingConfig {
    #[serde(default = "default_base_interval", with = "humantime_serde")]
    pub base_interval: Duration,

    #[serde(default = "default_min_interval", with = "humantime_serde")]
    pub min_interval: Duration,

    #[serde(default = "default_max_interval", with = "humantime_serde")]
    pub max_interval: Duration,

    /// Enable volatility-driven interval adjustment
    #[serde(default = "default_true")]
    pub adaptive: bool,

    /// Coefficient of variation above which sampling speeds up
    #[serde(default = "default_variation_threshold")]
    pub variation_threshold: f64,

    /// Relative interval change per adaptation
    #[serde(default = "default_adjustment_step")]
    pub adjustment_step: f64,

    #[serde(default = "default_adaptation_interval", with = "humantime_serde")]
    pub adaptation_interval: Duration,

    #[serde(default = "default_recent_values_capacity")]
    pub recent_values_capacity: usize,

    /// Reject samples for metrics not listed in `registered_metrics`
    #[serde(default)]
    pub require_registration: bool,

    #[serde(default)]
    pub registered_metrics: Vec<String>,

    /// Per-metric sampling state is dropped after this much silence
    #[serde(default = "default_idle_timeout", with = "humantime_serde")]
    pub idle_timeout: Duration,

    #[serde(default = "default_downsampling")]
    pub downsampling: Vec<DownsamplingRule>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            base_interval: default_base_interval(),
            min_interval: default_min_interval(),
            max_interval: default_max_interval(),
            adaptive: true,
            variation_threshold: default_variation_threshold(),
            adjustment_step: default_adjustment_step(),
            adaptation_interval: default_adaptation_interval(),
            recent_values_capacity: default_recent_values_capacity(),
            require_registration: false,
            registered_metrics: Vec::new(),
            idle_timeout: default_idle_timeout(),
            downsampling: default_downsampling(),
        }
    }
}

fn default_base_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_min_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_max_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_variation_threshold() -> f64 {
    0.1
}

fn default_adjustment_step() -> f64 {
    0.25
}

fn default_adaptation_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_recent_values_capacity() -> usize {
    32
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(3600)
}

fn default_downsampling() -> Vec<DownsamplingRule> {
    vec![
        DownsamplingRule {
            age: Duration::from_secs(3600),
            interval: Duration::from_secs(60),
        },
        DownsamplingRule {
            age: Duration::from_secs(24 * 3600),
            interval: Duration::from_secs(300),
        },
    ]
}

// ----------------------------------------------------------------------------
// 3.5 Anomaly Detection Configuration
// ----------------------------------------------------------------------------

/// Combination weights per detector category
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorWeights {
    #[serde(default = "default_weight_statistical")]
    pub statistical: f64,
    #[serde(default = "default_weight_trend")]
    pub trend: f64,
    #[serde(default = "default_weight_threshold")]
    pub threshold: f64,
    #[serde(default = "default_weight_seasonal")]
    pub seasonal: f64,
}

impl Default for DetectorWeights {
    fn default() -> Self {
        Self {
            statistical: default_weight_statistical(),
            trend: default_weight_trend(),
            threshold: default_weight_threshold(),
            seasonal: default_weight_seasonal(),
        }
    }
}

fn default_weight_statistical() -> f64 {
    0.4
}

fn default_weight_trend() -> f64 {
    0.3
}

fn default_weight_threshold() -> f64 {
    0.2
}

fn default_weight_seasonal() -> f64 {
    0.1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyConfig {
    #[serde(default = "default_zscore")]
    pub zscore_threshold: f64,

    #[serde(default = "default_ma_window")]
    pub moving_average_window: usize,

    #[serde(default = "default_ma_deviation")]
    pub moving_average_deviation: f64,

    /// Relative deviation from the fitted trend that counts as anomalous
    #[serde(default = "default_trend_threshold")]
    pub trend_threshold: f64,

    /// Relative deviation from the seasonal expectation that counts as anomalous
    #[serde(default = "default_seasonal_threshold")]
    pub seasonal_threshold: f64,

    /// Autocorrelation floor for accepting a seasonal period
    #[serde(default = "default_seasonal_min_correlation")]
    pub seasonal_min_correlation: f64,

    #[serde(default = "default_isolation_trees")]
    pub isolation_trees: usize,

    #[serde(default = "default_isolation_subsample")]
    pub isolation_subsample: usize,

    #[serde(default = "default_isolation_threshold")]
    pub isolation_threshold: f64,

    /// Fixed seed for isolation scoring, random when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isolation_seed: Option<u64>,

    #[serde(default = "default_outlier_multiplier")]
    pub outlier_deviation_multiplier: f64,

    #[serde(default = "default_min_outliers")]
    pub min_outliers_for_alert: usize,

    #[serde(default = "default_consecutive_outliers")]
    pub consecutive_outliers_threshold: usize,

    /// History points a detector needs before it will vote
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,

    #[serde(default = "default_min_detections")]
    pub min_detections_required: usize,

    #[serde(default)]
    pub weights: DetectorWeights,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            zscore_threshold: default_zscore(),
            moving_average_window: default_ma_window(),
            moving_average_deviation: default_ma_deviation(),
            trend_threshold: default_trend_threshold(),
            seasonal_threshold: default_seasonal_threshold(),
            seasonal_min_correlation: default_seasonal_min_correlation(),
            isolation_trees: default_isolation_trees(),
            isolation_subsample: default_isolation_subsample(),
            isolation_threshold: default_isolation_threshold(),
            isolation_seed: None,
            outlier_deviation_multiplier: default_outlier_multiplier(),
            min_outliers_for_alert: default_min_outliers(),
            consecutive_outliers_threshold: default_consecutive_outliers(),
            min_samples: default_min_samples(),
            min_detections_required: default_min_detections(),
            weights: DetectorWeights::default(),
        }
    }
}

fn default_zscore() -> f64 {
    3.0
}

fn default_ma_window() -> usize {
    10
}

fn default_ma_deviation() -> f64 {
    2.0
}

fn default_trend_threshold() -> f64 {
    0.25
}

fn default_seasonal_threshold() -> f64 {
    0.3
}

fn default_seasonal_min_correlation() -> f64 {
    0.3
}

fn default_isolation_trees() -> usize {
    100
}

fn default_isolation_subsample() -> usize {
    256
}

fn default_isolation_threshold() -> f64 {
    0.6
}

fn default_outlier_multiplier() -> f64 {
    2.5
}

fn default_min_outliers() -> usize {
    3
}

fn default_consecutive_outliers() -> usize {
    2
}

fn default_min_samples() -> usize {
    20
}

fn default_min_detections() -> usize {
    2
}

// ----------------------------------------------------------------------------
// 3.6 Trend Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendConfig {
    #[serde(default = "default_trend_min_points")]
    pub min_points: usize,

    /// Relative change over the analysed span below which a trend is stable
    #[serde(default = "default_stable_threshold")]
    pub stable_threshold: f64,

    #[serde(default = "default_prediction_horizon")]
    pub prediction_horizon: usize,

    /// Longest seasonal period searched, half the series when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_seasonal_period: Option<usize>,

    #[serde(default = "default_seasonal_min_correlation")]
    pub seasonal_min_correlation: f64,

    #[serde(default = "default_smoothing_alpha")]
    pub smoothing_alpha: f64,

    #[serde(default = "default_smoothing_beta")]
    pub smoothing_beta: f64,
}

impl Default for TrendConfig {
    fn default() -> Self {
        Self {
            min_points: default_trend_min_points(),
            stable_threshold: default_stable_threshold(),
            prediction_horizon: default_prediction_horizon(),
            max_seasonal_period: None,
            seasonal_min_correlation: default_seasonal_min_correlation(),
            smoothing_alpha: default_smoothing_alpha(),
            smoothing_beta: default_smoothing_beta(),
        }
    }
}

fn default_trend_min_points() -> usize {
    10
}

fn default_stable_threshold() -> f64 {
    0.05
}

fn default_prediction_horizon() -> usize {
    12
}

fn default_smoothing_alpha() -> f64 {
    0.3
}

fn default_smoothing_beta() -> f64 {
    0.1
}

// ----------------------------------------------------------------------------
// 3.7 Resource Analyzer Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Rolling average (percent) that triggers capacity planning advice
    #[serde(default = "default_sustained_average")]
    pub sustained_average_percent: f64,

    /// Growth in percentage points per hour treated as a leak or scaling signal
    #[serde(default = "default_slope_threshold")]
    pub trend_slope_threshold: f64,

    #[serde(default = "default_cpu_prefixes")]
    pub cpu_prefixes: Vec<String>,

    #[serde(default = "default_memory_prefixes")]
    pub memory_prefixes: Vec<String>,

    #[serde(default = "default_disk_prefixes")]
    pub disk_prefixes: Vec<String>,

    #[serde(default = "default_network_prefixes")]
    pub network_prefixes: Vec<String>,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            sustained_average_percent: default_sustained_average(),
            trend_slope_threshold: default_slope_threshold(),
            cpu_prefixes: default_cpu_prefixes(),
            memory_prefixes: default_memory_prefixes(),
            disk_prefixes: default_disk_prefixes(),
            network_prefixes: default_network_prefixes(),
        }
    }
}

fn default_sustained_average() -> f64 {
    70.0
}

fn default_slope_threshold() -> f64 {
    5.0
}

fn default_cpu_prefixes() -> Vec<String> {
    vec!["cpu".into()]
}

fn default_memory_prefixes() -> Vec<String> {
    vec!["mem".into()]
}

fn default_disk_prefixes() -> Vec<String> {
    vec!["disk".into()]
}

fn default_network_prefixes() -> Vec<String> {
    vec!["net".into()]
}

// ----------------------------------------------------------------------------
// 3.8 Per-Metric Thresholds
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ThresholdLevels {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub critical: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricThresholds {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_term: Option<ThresholdLevels>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub medium_term: Option<ThresholdLevels>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub long_term: Option<ThresholdLevels>,
}

impl MetricThresholds {
    pub fn for_window(&self, tier: TimeWindow) -> Option<&ThresholdLevels> {
        match tier {
            TimeWindow::ShortTerm => self.short_term.as_ref(),
            TimeWindow::MediumTerm => self.medium_term.as_ref(),
            TimeWindow::LongTerm => self.long_term.as_ref(),
        }
    }
}

// ----------------------------------------------------------------------------
// 3.9 Alert Policy
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    /// Minimum gap between two delivered alerts of one type
    #[serde(default = "default_throttle_interval", with = "humantime_serde")]
    pub throttle_interval: Duration,

    /// Alerts of one type per storm window before suppression starts
    #[serde(default = "default_max_alerts_per_interval")]
    pub max_alerts_per_interval: usize,

    #[serde(default = "default_storm_window", with = "humantime_serde")]
    pub storm_window: Duration,

    #[serde(default = "default_alert_retention", with = "humantime_serde")]
    pub retention: Duration,

    /// Minimum storm duration before it may be declared over
    #[serde(default = "default_cooldown", with = "humantime_serde")]
    pub cooldown: Duration,

    #[serde(default = "default_recent_capacity")]
    pub recent_capacity: usize,

    #[serde(default = "default_delivery_timeout", with = "humantime_serde")]
    pub delivery_timeout: Duration,

    #[serde(default = "default_aggregation_interval", with = "humantime_serde")]
    pub aggregation_interval: Duration,

    #[serde(default = "default_alert_cleanup_interval", with = "humantime_serde")]
    pub cleanup_interval: Duration,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            throttle_interval: default_throttle_interval(),
            max_alerts_per_interval: default_max_alerts_per_interval(),
            storm_window: default_storm_window(),
            retention: default_alert_retention(),
            cooldown: default_cooldown(),
            recent_capacity: default_recent_capacity(),
            delivery_timeout: default_delivery_timeout(),
            aggregation_interval: default_aggregation_interval(),
            cleanup_interval: default_alert_cleanup_interval(),
        }
    }
}

fn default_throttle_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_max_alerts_per_interval() -> usize {
    10
}

fn default_storm_window() -> Duration {
    Duration::from_secs(300)
}

fn default_alert_retention() -> Duration {
    Duration::from_secs(24 * 3600)
}

fn default_cooldown() -> Duration {
    Duration::from_secs(600)
}

fn default_recent_capacity() -> usize {
    1_000
}

fn default_delivery_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_aggregation_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_alert_cleanup_interval() -> Duration {
    Duration::from_secs(3600)
}

// ----------------------------------------------------------------------------
// 3.10 Analysis Tiers
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    #[serde(default = "default_short_window", with = "humantime_serde")]
    pub short_term_window: Duration,

    #[serde(default = "default_medium_window", with = "humantime_serde")]
    pub medium_term_window: Duration,

    #[serde(default = "default_long_window", with = "humantime_serde")]
    pub long_term_window: Duration,

    #[serde(default = "default_short_min_interval", with = "humantime_serde")]
    pub short_term_min_interval: Duration,

    #[serde(default = "default_medium_min_interval", with = "humantime_serde")]
    pub medium_term_min_interval: Duration,

    #[serde(default = "default_long_min_interval", with = "humantime_serde")]
    pub long_term_min_interval: Duration,

    /// Period of the background short-term analysis of every metric
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            short_term_window: default_short_window(),
            medium_term_window: default_medium_window(),
            long_term_window: default_long_window(),
            short_term_min_interval: default_short_min_interval(),
            medium_term_min_interval: default_medium_min_interval(),
            long_term_min_interval: default_long_min_interval(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

impl AnalysisConfig {
    /// Look-back window analysed for a tier
    pub fn window(&self, tier: TimeWindow) -> Duration {
        match tier {
            TimeWindow::ShortTerm => self.short_term_window,
            TimeWindow::MediumTerm => self.medium_term_window,
            TimeWindow::LongTerm => self.long_term_window,
        }
    }

    /// Minimum spacing between two analyses of one metric at a tier
    pub fn min_interval(&self, tier: TimeWindow) -> Duration {
        match tier {
            TimeWindow::ShortTerm => self.short_term_min_interval,
            TimeWindow::MediumTerm => self.medium_term_min_interval,
            TimeWindow::LongTerm => self.long_term_min_interval,
        }
    }
}

fn default_short_window() -> Duration {
    Duration::from_secs(3600)
}

fn default_medium_window() -> Duration {
    Duration::from_secs(6 * 3600)
}

fn default_long_window() -> Duration {
    Duration::from_secs(24 * 3600)
}

fn default_short_min_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_medium_min_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_long_min_interval() -> Duration {
    Duration::from_secs(900)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(60)
}

// ----------------------------------------------------------------------------
// 3.11 Worker Pool Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Number of analysis workers (0 = processor count)
    #[serde(default)]
    pub workers: usize,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// How long a submission waits for queue space before it is dropped
    #[serde(default = "default_submit_timeout", with = "humantime_serde")]
    pub submit_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            queue_capacity: default_queue_capacity(),
            submit_timeout: default_submit_timeout(),
        }
    }
}

fn default_queue_capacity() -> usize {
    1_024
}

fn default_submit_timeout() -> Duration {
    Duration::from_secs(1)
}

// ----------------------------------------------------------------------------
// 3.12 Cleanup Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    #[serde(default = "default_cleanup_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// How often memory pressure is checked between regular runs
    #[serde(default = "default_memory_check_interval", with = "humantime_serde")]
    pub memory_check_interval: Duration,

    /// Estimated bytes held by the store that count as memory pressure
    #[serde(default = "default_memory_limit")]
    pub memory_limit_bytes: u64,

    /// Host used/total memory ratio that counts as memory pressure
    #[serde(default = "default_memory_pressure_ratio")]
    pub memory_pressure_ratio: f64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval: default_cleanup_interval(),
            memory_check_interval: default_memory_check_interval(),
            memory_limit_bytes: default_memory_limit(),
            memory_pressure_ratio: default_memory_pressure_ratio(),
        }
    }
}

fn default_cleanup_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_memory_check_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_memory_limit() -> u64 {
    256 * 1024 * 1024
}

fn default_memory_pressure_ratio() -> f64 {
    0.9
}

// ----------------------------------------------------------------------------
// 3.13 Logging Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridable through `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Write to a daily-rolling file instead of stderr
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    #[serde(default = "default_true")]
    pub colors: bool,

    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.storage.max_points_per_metric, 10_000);
        assert_eq!(config.alerts.throttle_interval, Duration::from_secs(300));
        assert_eq!(config.anomaly.min_detections_required, 2);
        assert_eq!(config.sampling.downsampling.len(), 2);
    }

    #[test]
    fn test_generated_config_parses_back() {
        let rendered = EngineConfig::generate_default_config();
        assert!(rendered.contains("[storage]"));
        let parsed = EngineConfig::from_toml_str(&rendered).expect("defaults must round-trip");
        assert_eq!(parsed.sampling.downsampling, EngineConfig::default().sampling.downsampling);
        assert_eq!(parsed.storage.retention, Duration::from_secs(24 * 3600));
        assert_eq!(parsed.worker_pool.queue_capacity, 1_024);
    }

    #[test]
    fn test_human_readable_durations() {
        let config = EngineConfig::from_toml_str(
            r#"
            [storage]
            retention = "2h"
            write_timeout = "250ms"

            [alerts]
            throttle_interval = "30s"
            "#,
        )
        .expect("valid config");
        assert_eq!(config.storage.retention, Duration::from_secs(7200));
        assert_eq!(config.storage.write_timeout, Duration::from_millis(250));
        assert_eq!(config.alerts.throttle_interval, Duration::from_secs(30));
        assert_eq!(config.alerts.max_alerts_per_interval, 10);
    }

    #[test]
    fn test_thresholds_by_tier() {
        let config = EngineConfig::from_toml_str(
            r#"
            [thresholds.cpu_usage.short_term]
            warning = 80.0
            critical = 90.0
            "#,
        )
        .expect("valid config");
        let levels = config
            .thresholds_for("cpu_usage", TimeWindow::ShortTerm)
            .copied()
            .expect("short-term thresholds");
        assert_eq!(levels.critical, Some(90.0));
        assert!(config.thresholds_for("cpu_usage", TimeWindow::LongTerm).is_none());
        assert!(config.thresholds_for("mem_usage", TimeWindow::ShortTerm).is_none());
    }

    #[test]
    fn test_rejects_inverted_sampling_bounds() {
        let err = EngineConfig::from_toml_str(
            r#"
            [sampling]
            min_interval = "10s"
            base_interval = "1s"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "sampling"));
    }

    #[test]
    fn test_rejects_inverted_thresholds() {
        let err = EngineConfig::from_toml_str(
            r#"
            [thresholds.disk_used.long_term]
            warning = 95.0
            critical = 90.0
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("thresholds.disk_used.long_term"));
    }

    #[test]
    fn test_rejects_unknown_log_format() {
        let mut config = EngineConfig::default();
        config.logging.format = "xml".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            "[engine]\ninstance_name = \"edge-1\"\n\n[worker_pool]\nworkers = 3\n"
        )
        .expect("write config");

        let config = EngineConfig::load(file.path()).expect("load config");
        assert_eq!(config.engine.instance_name, "edge-1");
        assert_eq!(config.effective_worker_count(), 3);
        assert_eq!(config.storage.writer_parallelism, 4);
    }

    #[test]
    fn test_load_missing_file() {
        let err = EngineConfig::load("/definitely/not/here/pulse.toml").unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn test_auto_worker_count() {
        let config = EngineConfig::default();
        assert!(config.effective_worker_count() >= 1);
    }
}
