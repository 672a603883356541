// ============================================================================
// ERROR HANDLING FRAMEWORK
// ============================================================================
// One error family per subsystem, all convertible into `PulseError`.
// Every error carries a category for counters and a recovery hint that the
// background loops use to decide whether to retry on the next tick.
// ============================================================================

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;

use crate::types::{AtomicTimestamp, Timestamp, TimeWindow};

// ----------------------------------------------------------------------------
// 2.1 Top-Level Error
// ----------------------------------------------------------------------------

/// The main error type of the engine.
#[derive(Error, Debug)]
pub enum PulseError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Analysis error: {0}")]
    Analysis(#[from] AnalysisError),

    #[error("Alert error: {0}")]
    Alert(#[from] AlertError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] prometheus::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl PulseError {
    pub fn is_recoverable(&self) -> bool {
        match self {
            PulseError::Config(_) => false,
            PulseError::Storage(e) => e.is_recoverable(),
            PulseError::Analysis(e) => e.is_recoverable(),
            PulseError::Alert(_) => true,
            PulseError::Telemetry(_) => false,
            PulseError::Io(_) => true,
            PulseError::Internal(_) => false,
            PulseError::ShuttingDown => false,
        }
    }

    /// Error category for counters and log fields
    pub fn category(&self) -> &'static str {
        match self {
            PulseError::Config(_) => "config",
            PulseError::Storage(_) => "storage",
            PulseError::Analysis(_) => "analysis",
            PulseError::Alert(_) => "alert",
            PulseError::Telemetry(_) => "telemetry",
            PulseError::Io(_) => "io",
            PulseError::Internal(_) => "internal",
            PulseError::ShuttingDown => "shutdown",
        }
    }

    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            PulseError::Config(_) => RecoveryHint::FixConfiguration,
            PulseError::Storage(e) => e.recovery_hint(),
            PulseError::Analysis(e) => e.recovery_hint(),
            PulseError::Alert(e) => e.recovery_hint(),
            PulseError::Io(_) => RecoveryHint::RetryWithBackoff,
            PulseError::ShuttingDown => RecoveryHint::None,
            PulseError::Telemetry(_) | PulseError::Internal(_) => RecoveryHint::None,
        }
    }
}

/// Hints for how to recover from an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryHint {
    /// No recovery possible
    None,
    /// Transient condition, the next scheduled tick retries
    RetryNextCycle,
    /// Retry with exponential backoff
    RetryWithBackoff,
    /// Skip this item and continue
    Skip,
    /// Fix configuration and restart
    FixConfiguration,
}

// ----------------------------------------------------------------------------
// 2.2 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        ConfigError::ParseError {
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 2.3 Storage Errors
// ----------------------------------------------------------------------------

/// Errors from the time-series store and history manager
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Metric not found: {metric}")]
    MetricNotFound { metric: String },

    #[error("Timed out after {timeout_ms}ms waiting for a writer slot on '{metric}'")]
    LockTimeout { metric: String, timeout_ms: u64 },

    #[error("Time series for '{metric}' was retired")]
    SeriesRetired { metric: String },

    #[error("Invalid time range: start={start}, end={end}")]
    InvalidTimeRange { start: Timestamp, end: Timestamp },
}

impl StorageError {
    pub fn metric_not_found(metric: impl Into<String>) -> Self {
        StorageError::MetricNotFound {
            metric: metric.into(),
        }
    }

    pub fn lock_timeout(metric: impl Into<String>, timeout: Duration) -> Self {
        StorageError::LockTimeout {
            metric: metric.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        match self {
            StorageError::MetricNotFound { .. } => false,
            StorageError::InvalidTimeRange { .. } => false,
            StorageError::LockTimeout { .. } | StorageError::SeriesRetired { .. } => true,
        }
    }

    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            StorageError::LockTimeout { .. } | StorageError::SeriesRetired { .. } => {
                RecoveryHint::RetryNextCycle
            }
            StorageError::MetricNotFound { .. } | StorageError::InvalidTimeRange { .. } => {
                RecoveryHint::Skip
            }
        }
    }
}

// ----------------------------------------------------------------------------
// 2.4 Analysis Errors
// ----------------------------------------------------------------------------

/// Errors from analysis requests, detectors and the worker pool
#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("Metric not found: {metric}")]
    MetricNotFound { metric: String },

    #[error("Analysis of '{metric}' ({tier}) throttled, retry in {}ms", .retry_after.as_millis())]
    Throttled {
        metric: String,
        tier: TimeWindow,
        retry_after: Duration,
    },

    #[error("Analysis queue full, dropped request for '{metric}' after {timeout_ms}ms")]
    QueueFull { metric: String, timeout_ms: u64 },

    #[error("Analysis cancelled")]
    Cancelled,

    #[error("Detector '{detector}' failed: {message}")]
    DetectorFailed { detector: String, message: String },

    #[error("Analysis worker failed: {message}")]
    WorkerFailed { message: String },

    #[error("Worker pool is closed")]
    PoolClosed,
}

impl AnalysisError {
    pub fn detector_failed(detector: impl Into<String>, message: impl Into<String>) -> Self {
        AnalysisError::DetectorFailed {
            detector: detector.into(),
            message: message.into(),
        }
    }

    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            AnalysisError::MetricNotFound { .. } | AnalysisError::PoolClosed
        )
    }

    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            AnalysisError::Throttled { .. } | AnalysisError::QueueFull { .. } => {
                RecoveryHint::RetryNextCycle
            }
            AnalysisError::DetectorFailed { .. } | AnalysisError::MetricNotFound { .. } => {
                RecoveryHint::Skip
            }
            AnalysisError::WorkerFailed { .. } => RecoveryHint::RetryWithBackoff,
            AnalysisError::Cancelled | AnalysisError::PoolClosed => RecoveryHint::None,
        }
    }
}

impl From<StorageError> for AnalysisError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::MetricNotFound { metric } => AnalysisError::MetricNotFound { metric },
            other => AnalysisError::WorkerFailed {
                message: other.to_string(),
            },
        }
    }
}

// ----------------------------------------------------------------------------
// 2.5 Alert Errors
// ----------------------------------------------------------------------------

/// Errors from alert subscriptions and delivery
#[derive(Error, Debug)]
pub enum AlertError {
    #[error("Delivery to subscriber '{subscriber}' failed: {message}")]
    DeliveryFailed { subscriber: String, message: String },

    #[error("Delivery to subscriber '{subscriber}' timed out after {timeout_ms}ms")]
    DeliveryTimeout { subscriber: String, timeout_ms: u64 },

    #[error("Subscriber '{subscriber}' panicked during delivery")]
    SubscriberPanicked { subscriber: String },

    #[error("Subscription '{id}' already exists")]
    DuplicateSubscription { id: String },
}

impl AlertError {
    pub fn delivery_failed(subscriber: impl Into<String>, message: impl Into<String>) -> Self {
        AlertError::DeliveryFailed {
            subscriber: subscriber.into(),
            message: message.into(),
        }
    }

    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            AlertError::DuplicateSubscription { .. } => RecoveryHint::FixConfiguration,
            _ => RecoveryHint::Skip,
        }
    }
}

// ----------------------------------------------------------------------------
// 2.6 Result Type Aliases
// ----------------------------------------------------------------------------

pub type PulseResult<T> = Result<T, PulseError>;
pub type StorageResult<T> = Result<T, StorageError>;
pub type AnalysisResult<T> = Result<T, AnalysisError>;
pub type AlertResult<T> = Result<T, AlertError>;

// ----------------------------------------------------------------------------
// 2.7 Error Statistics Tracking
// ----------------------------------------------------------------------------

/// Lock-free error counters fed from background task boundaries
#[derive(Debug, Default)]
pub struct ErrorStats {
    by_category: DashMap<&'static str, AtomicU64>,
    recoverable_count: AtomicU64,
    non_recoverable_count: AtomicU64,
    last_error_time: AtomicTimestamp,
}

impl ErrorStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, error: &PulseError) {
        self.by_category
            .entry(error.category())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, AtomicOrdering::Relaxed);

        if error.is_recoverable() {
            self.recoverable_count.fetch_add(1, AtomicOrdering::Relaxed);
        } else {
            self.non_recoverable_count.fetch_add(1, AtomicOrdering::Relaxed);
        }

        self.last_error_time.update_if_newer(Timestamp::now());
    }

    pub fn total_errors(&self) -> u64 {
        self.recoverable_count.load(AtomicOrdering::Relaxed)
            + self.non_recoverable_count.load(AtomicOrdering::Relaxed)
    }

    pub fn count_by_category(&self, category: &str) -> u64 {
        self.by_category
            .get(category)
            .map(|v| v.load(AtomicOrdering::Relaxed))
            .unwrap_or(0)
    }

    pub fn summary(&self) -> ErrorStatsSummary {
        ErrorStatsSummary {
            total: self.total_errors(),
            recoverable: self.recoverable_count.load(AtomicOrdering::Relaxed),
            non_recoverable: self.non_recoverable_count.load(AtomicOrdering::Relaxed),
            last_error: match self.last_error_time.load(AtomicOrdering::Acquire) {
                Timestamp::EPOCH => None,
                ts => Some(ts),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorStatsSummary {
    pub total: u64,
    pub recoverable: u64,
    pub non_recoverable: u64,
    pub last_error: Option<Timestamp>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors_retry_next_cycle() {
        let err: PulseError = StorageError::lock_timeout("cpu", Duration::from_secs(1)).into();
        assert!(err.is_recoverable());
        assert_eq!(err.recovery_hint(), RecoveryHint::RetryNextCycle);
        assert_eq!(err.category(), "storage");

        let err: PulseError = AnalysisError::QueueFull {
            metric: "cpu".into(),
            timeout_ms: 1000,
        }
        .into();
        assert_eq!(err.recovery_hint(), RecoveryHint::RetryNextCycle);
    }

    #[test]
    fn test_config_errors_are_fatal() {
        let err: PulseError = ConfigError::invalid_value("storage.retention", "zero").into();
        assert!(!err.is_recoverable());
        assert_eq!(err.recovery_hint(), RecoveryHint::FixConfiguration);
        assert!(err.to_string().contains("storage.retention"));
    }

    #[test]
    fn test_storage_not_found_maps_to_analysis_not_found() {
        let err: AnalysisError = StorageError::metric_not_found("disk").into();
        assert!(matches!(err, AnalysisError::MetricNotFound { ref metric } if metric == "disk"));
    }

    #[test]
    fn test_error_stats_counts_by_category() {
        let stats = ErrorStats::new();
        stats.record(&StorageError::metric_not_found("a").into());
        stats.record(&StorageError::lock_timeout("a", Duration::from_millis(5)).into());
        stats.record(&PulseError::Internal("boom".into()));

        assert_eq!(stats.total_errors(), 3);
        assert_eq!(stats.count_by_category("storage"), 2);
        assert_eq!(stats.count_by_category("internal"), 1);
        let summary = stats.summary();
        assert_eq!(summary.recoverable, 1);
        assert_eq!(summary.non_recoverable, 2);
        assert!(summary.last_error.is_some());
    }
}
