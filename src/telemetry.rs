// ============================================================================
// SELF-MONITORING TELEMETRY
// ============================================================================
// Counters describing the engine's own behaviour, kept in a private
// Prometheus registry and rendered in the text exposition format.
// ============================================================================

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use tracing::warn;

use crate::alerts::AlertOutcome;
use crate::types::TimeWindow;

const NAMESPACE: &str = "pulse";

/// Prometheus collectors for the engine
pub struct EngineMetrics {
    registry: Registry,
    samples_accepted: IntCounter,
    samples_rejected: IntCounterVec,
    alerts: IntCounterVec,
    analysis_runs: IntCounterVec,
    analysis_duration: Histogram,
    analysis_dropped: IntCounter,
    tracked_metrics: IntGauge,
    cleanup_points_removed: IntCounter,
}

impl EngineMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let samples_accepted = IntCounter::with_opts(
            Opts::new("samples_accepted_total", "Samples stored").namespace(NAMESPACE),
        )?;
        let samples_rejected = IntCounterVec::new(
            Opts::new("samples_rejected_total", "Samples rejected at ingestion")
                .namespace(NAMESPACE),
            &["reason"],
        )?;
        let alerts = IntCounterVec::new(
            Opts::new("alerts_total", "Alerts raised by outcome").namespace(NAMESPACE),
            &["outcome"],
        )?;
        let analysis_runs = IntCounterVec::new(
            Opts::new("analysis_runs_total", "Completed analysis passes").namespace(NAMESPACE),
            &["tier"],
        )?;
        let analysis_duration = Histogram::with_opts(
            HistogramOpts::new("analysis_duration_seconds", "Duration of one analysis pass")
                .namespace(NAMESPACE)
                .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;
        let analysis_dropped = IntCounter::with_opts(
            Opts::new(
                "analysis_dropped_total",
                "Analysis requests dropped because the queue stayed full",
            )
            .namespace(NAMESPACE),
        )?;
        let tracked_metrics = IntGauge::with_opts(
            Opts::new("tracked_metrics", "Metrics currently held in memory").namespace(NAMESPACE),
        )?;
        let cleanup_points_removed = IntCounter::with_opts(
            Opts::new("cleanup_points_removed_total", "Points evicted by cleanup")
                .namespace(NAMESPACE),
        )?;

        registry.register(Box::new(samples_accepted.clone()))?;
        registry.register(Box::new(samples_rejected.clone()))?;
        registry.register(Box::new(alerts.clone()))?;
        registry.register(Box::new(analysis_runs.clone()))?;
        registry.register(Box::new(analysis_duration.clone()))?;
        registry.register(Box::new(analysis_dropped.clone()))?;
        registry.register(Box::new(tracked_metrics.clone()))?;
        registry.register(Box::new(cleanup_points_removed.clone()))?;

        Ok(Self {
            registry,
            samples_accepted,
            samples_rejected,
            alerts,
            analysis_runs,
            analysis_duration,
            analysis_dropped,
            tracked_metrics,
            cleanup_points_removed,
        })
    }

    pub fn record_accepted(&self) {
        self.samples_accepted.inc();
    }

    pub fn record_rejected(&self, reason: &str) {
        self.samples_rejected.with_label_values(&[reason]).inc();
    }

    pub fn record_alert(&self, outcome: &AlertOutcome) {
        self.alerts.with_label_values(&[outcome.as_str()]).inc();
    }

    pub fn record_analysis(&self, tier: TimeWindow, seconds: f64) {
        self.analysis_runs.with_label_values(&[tier.as_str()]).inc();
        self.analysis_duration.observe(seconds);
    }

    pub fn record_analysis_dropped(&self) {
        self.analysis_dropped.inc();
    }

    pub fn set_tracked_metrics(&self, count: usize) {
        self.tracked_metrics.set(count as i64);
    }

    pub fn record_cleanup(&self, removed: usize) {
        self.cleanup_points_removed.inc_by(removed as u64);
    }

    pub fn samples_accepted(&self) -> u64 {
        self.samples_accepted.get()
    }

    pub fn samples_rejected(&self, reason: &str) -> u64 {
        self.samples_rejected.with_label_values(&[reason]).get()
    }

    pub fn alerts(&self, outcome: &str) -> u64 {
        self.alerts.with_label_values(&[outcome]).get()
    }

    /// Prometheus text exposition of every collector
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            warn!(target: "pulse::telemetry", error = %e, "Failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
