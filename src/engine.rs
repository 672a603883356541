// ============================================================================
// METRICS ENGINE
// ============================================================================
// Facade over the whole engine: ingestion, queries, analysis requests and
// alert subscriptions, plus the lifecycle of the background tasks.
//
//   producers → submit_sample → sampling gate → history
//   request_analysis / sweep → worker pool → pipeline → alert manager
// ============================================================================

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use ahash::RandomState;
use compact_str::CompactString;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::alerts::{Alert, AlertManager, AlertSink, AlertStats, SubscriptionFilter, SubscriptionHandle};
use crate::config::EngineConfig;
use crate::error::{
    AlertResult, AnalysisError, AnalysisResult, ErrorStats, ErrorStatsSummary, PulseError, PulseResult,
    StorageError, StorageResult,
};
use crate::history::MetricHistoryManager;
use crate::pipeline::AnalysisPipeline;
use crate::sampling::{Admission, SamplingController};
use crate::scheduler::{spawn_periodic, CleanupScheduler, PeriodicTask, TaskStats};
use crate::stats::Statistics;
use crate::telemetry::EngineMetrics;
use crate::types::{MetricSample, Tags, TimeWindow, Timestamp};
use crate::worker::{AnalysisHandle, WorkerPool};

// ----------------------------------------------------------------------------
// 14.1 Ingestion Outcomes
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum RejectionReason {
    /// Too many samples in flight, or the metric's writer slots stayed busy
    BufferFull,
    /// Registration is required and the metric is not registered
    UnknownMetric,
    /// The sampling controller has not reached the metric's next slot
    NotDue { next_due: Timestamp },
    /// NaN or infinite value
    InvalidValue,
}

impl RejectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionReason::BufferFull => "buffer_full",
            RejectionReason::UnknownMetric => "unknown_metric",
            RejectionReason::NotDue { .. } => "not_due",
            RejectionReason::InvalidValue => "invalid_value",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitOutcome {
    Accepted,
    Rejected(RejectionReason),
}

impl SubmitOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, SubmitOutcome::Accepted)
    }
}

/// Releases an ingest slot on drop
struct IngestSlot<'a>(&'a AtomicUsize);

impl<'a> IngestSlot<'a> {
    fn acquire(pending: &'a AtomicUsize, capacity: usize) -> Option<Self> {
        let previous = pending.fetch_add(1, AtomicOrdering::AcqRel);
        if previous >= capacity {
            pending.fetch_sub(1, AtomicOrdering::AcqRel);
            return None;
        }
        Some(Self(pending))
    }
}

impl Drop for IngestSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, AtomicOrdering::AcqRel);
    }
}

// ----------------------------------------------------------------------------
// 14.2 Engine Stats
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub instance: String,
    pub started_at: Timestamp,
    pub tracked_metrics: usize,
    pub total_points: usize,
    pub estimated_bytes: usize,
    pub sampling_states: usize,
    pub pending_ingest: usize,
    pub analysis_queue_depth: usize,
    pub samples_accepted: u64,
    pub alerts: AlertStats,
    pub errors: ErrorStatsSummary,
    pub background_tasks: Vec<(&'static str, TaskStats)>,
}

// ----------------------------------------------------------------------------
// 14.3 Engine
// ----------------------------------------------------------------------------

pub struct MetricsEngine {
    config: EngineConfig,
    history: Arc<MetricHistoryManager>,
    sampling: Arc<SamplingController>,
    alerts: Arc<AlertManager>,
    pipeline: Arc<AnalysisPipeline>,
    workers: WorkerPool,
    cleanup: Arc<CleanupScheduler>,
    metrics: Arc<EngineMetrics>,
    errors: Arc<ErrorStats>,
    registered: HashSet<String, RandomState>,
    pending_ingest: AtomicUsize,
    last_analysis: DashMap<(CompactString, TimeWindow), Timestamp, RandomState>,
    tasks: Mutex<Vec<PeriodicTask>>,
    cancel: CancellationToken,
    started_at: Timestamp,
}

impl MetricsEngine {
    /// Build every component and start the analysis workers. Must be called
    /// inside a Tokio runtime. Background tasks start with [`start`].
    ///
    /// [`start`]: MetricsEngine::start
    pub fn new(config: EngineConfig) -> PulseResult<Self> {
        config.validate()?;

        let metrics = Arc::new(EngineMetrics::new()?);
        let history = Arc::new(MetricHistoryManager::new(config.storage.clone()));
        let sampling = Arc::new(SamplingController::new(config.sampling.clone()));
        let alerts = Arc::new(AlertManager::new(config.alerts.clone()));
        let pipeline = Arc::new(AnalysisPipeline::new(
            &config,
            Arc::clone(&history),
            Arc::clone(&alerts),
            Arc::clone(&metrics),
        ));
        let cleanup = Arc::new(CleanupScheduler::new(
            Arc::clone(&history),
            Arc::clone(&sampling),
            Arc::clone(&metrics),
            config.cleanup.clone(),
            config.storage.retention,
        ));

        let cancel = CancellationToken::new();
        let workers = WorkerPool::start(
            config.effective_worker_count(),
            config.worker_pool.queue_capacity,
            config.worker_pool.submit_timeout,
            Arc::clone(&pipeline),
            Arc::clone(&metrics),
            cancel.child_token(),
        );

        let mut registered = HashSet::with_hasher(RandomState::new());
        registered.extend(config.sampling.registered_metrics.iter().cloned());

        info!(
            target: "pulse::engine",
            instance = %config.engine.instance_name,
            workers = config.effective_worker_count(),
            registered = registered.len(),
            "Metrics engine initialized"
        );

        Ok(Self {
            config,
            history,
            sampling,
            alerts,
            pipeline,
            workers,
            cleanup,
            metrics,
            errors: Arc::new(ErrorStats::new()),
            registered,
            pending_ingest: AtomicUsize::new(0),
            last_analysis: DashMap::with_hasher(RandomState::new()),
            tasks: Mutex::new(Vec::new()),
            cancel,
            started_at: Timestamp::now(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ------------------------------------------------------------------------
    // Ingestion API
    // ------------------------------------------------------------------------

    pub async fn submit_sample(&self, metric: &str, value: f64, tags: Tags) -> SubmitOutcome {
        self.submit_sample_at(metric, value, tags, Timestamp::now()).await
    }

    /// Submit a sample taken at `at`
    pub async fn submit_sample_at(&self, metric: &str, value: f64, tags: Tags, at: Timestamp) -> SubmitOutcome {
        let outcome = self.ingest(metric, value, tags, at).await;
        match &outcome {
            SubmitOutcome::Accepted => {
                self.metrics.record_accepted();
                crate::log_sample!(metric, value);
            }
            SubmitOutcome::Rejected(reason) => {
                self.metrics.record_rejected(reason.as_str());
                debug!(target: "pulse::engine", metric, reason = reason.as_str(), "Sample rejected");
            }
        }
        outcome
    }

    async fn ingest(&self, metric: &str, value: f64, tags: Tags, at: Timestamp) -> SubmitOutcome {
        if !value.is_finite() {
            return SubmitOutcome::Rejected(RejectionReason::InvalidValue);
        }
        if self.config.sampling.require_registration && !self.registered.contains(metric) {
            return SubmitOutcome::Rejected(RejectionReason::UnknownMetric);
        }
        let Some(_slot) = IngestSlot::acquire(&self.pending_ingest, self.config.storage.ingest_buffer_capacity) else {
            return SubmitOutcome::Rejected(RejectionReason::BufferFull);
        };

        let ticket = match self.sampling.admit(metric, at) {
            Admission::Granted(ticket) => ticket,
            Admission::NotDue { next_due } => {
                return SubmitOutcome::Rejected(RejectionReason::NotDue { next_due });
            }
        };

        let sample = MetricSample::at(metric, value, at).with_tags(tags);
        match self.history.add_data_point(sample).await {
            Ok(()) => {
                self.sampling.commit(ticket, value);
                SubmitOutcome::Accepted
            }
            Err(e) => {
                self.sampling.release(ticket);
                if matches!(e, StorageError::LockTimeout { .. }) {
                    warn!(target: "pulse::engine", metric, error = %e, "Writer slots busy, sample dropped");
                }
                self.errors.record(&PulseError::Storage(e));
                SubmitOutcome::Rejected(RejectionReason::BufferFull)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Query API
    // ------------------------------------------------------------------------

    /// Points of `metric` in `[now - window, now]`, oldest first
    pub fn get_history(&self, metric: &str, window: Duration) -> StorageResult<Vec<MetricSample>> {
        self.history.get_data_points(metric, window, Timestamp::now())
    }

    pub fn get_statistics(&self, metric: &str, window: Duration) -> StorageResult<Statistics> {
        self.history.get_statistics(metric, window, Timestamp::now())
    }

    pub fn get_metric_names(&self) -> Vec<String> {
        self.history.get_all_metric_names()
    }

    // ------------------------------------------------------------------------
    // Analysis trigger
    // ------------------------------------------------------------------------

    /// Queue an analysis of `metric` over the tier window. At most one
    /// request per (metric, tier) is accepted per minimum re-analysis
    /// interval.
    pub async fn request_analysis(&self, metric: &str, tier: TimeWindow) -> AnalysisResult<AnalysisHandle> {
        if !self.history.contains(metric) {
            return Err(AnalysisError::MetricNotFound {
                metric: metric.to_string(),
            });
        }

        let now = Timestamp::now();
        self.claim_analysis_slot(metric, tier, now)?;

        match self.workers.submit(metric, tier).await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                // A dropped request must not hold the slot.
                self.last_analysis
                    .remove_if(&(CompactString::from(metric), tier), |_, at| *at == now);
                Err(e)
            }
        }
    }

    fn claim_analysis_slot(&self, metric: &str, tier: TimeWindow, now: Timestamp) -> AnalysisResult<()> {
        let min_interval = self.pipeline.analysis_config().min_interval(tier);
        match self.last_analysis.entry((CompactString::from(metric), tier)) {
            Entry::Occupied(mut last) => {
                let elapsed = now.duration_since(*last.get());
                if elapsed < min_interval {
                    return Err(AnalysisError::Throttled {
                        metric: metric.to_string(),
                        tier,
                        retry_after: min_interval - elapsed,
                    });
                }
                last.insert(now);
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Alert subscription API
    // ------------------------------------------------------------------------

    pub fn subscribe(
        &self,
        id: impl Into<String>,
        filter: SubscriptionFilter,
        sink: Arc<dyn AlertSink>,
    ) -> AlertResult<SubscriptionHandle> {
        self.alerts.subscribe(id, filter, sink)
    }

    pub fn subscribe_fn<F>(&self, id: impl Into<String>, filter: SubscriptionFilter, callback: F) -> AlertResult<SubscriptionHandle>
    where
        F: Fn(&Alert) -> AlertResult<()> + Send + Sync + 'static,
    {
        self.alerts.subscribe_fn(id, filter, callback)
    }

    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        self.alerts.unsubscribe(handle)
    }

    pub fn alerts(&self) -> &Arc<AlertManager> {
        &self.alerts
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Spawn the background tasks. Calling it again is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }

        let cleanup = Arc::clone(&self.cleanup);
        tasks.push(self.periodic("cleanup", self.config.cleanup.interval, move || {
            let cleanup = Arc::clone(&cleanup);
            async move {
                cleanup.run_once(Timestamp::now()).await;
                Ok(())
            }
        }));

        let cleanup = Arc::clone(&self.cleanup);
        tasks.push(self.periodic("memory_watch", self.config.cleanup.memory_check_interval, move || {
            let cleanup = Arc::clone(&cleanup);
            async move {
                cleanup.check_memory_pressure(Timestamp::now()).await;
                Ok(())
            }
        }));

        let alerts = Arc::clone(&self.alerts);
        tasks.push(self.periodic("alert_aggregation", self.config.alerts.aggregation_interval, move || {
            let alerts = Arc::clone(&alerts);
            async move {
                alerts.aggregate();
                Ok(())
            }
        }));

        let alerts = Arc::clone(&self.alerts);
        tasks.push(self.periodic("alert_cleanup", self.config.alerts.cleanup_interval, move || {
            let alerts = Arc::clone(&alerts);
            async move {
                alerts.cleanup(Timestamp::now());
                Ok(())
            }
        }));

        if self.config.sampling.adaptive {
            let sampling = Arc::clone(&self.sampling);
            tasks.push(self.periodic("adaptive_sampling", self.config.sampling.adaptation_interval, move || {
                let sampling = Arc::clone(&sampling);
                async move {
                    let adjusted = sampling.adapt_all(Timestamp::now());
                    if adjusted > 0 {
                        debug!(target: "pulse::sampling", adjusted, "Sampling intervals adapted");
                    }
                    Ok(())
                }
            }));
        }

        let engine: Weak<Self> = Arc::downgrade(self);
        tasks.push(self.periodic("analysis_sweep", self.config.analysis.sweep_interval, move || {
            let engine = Weak::clone(&engine);
            async move {
                match engine.upgrade() {
                    Some(engine) => engine.sweep().await,
                    None => Err(PulseError::ShuttingDown),
                }
            }
        }));

        info!(target: "pulse::engine", tasks = tasks.len(), "Background tasks started");
    }

    fn periodic<F, Fut>(&self, name: &'static str, period: Duration, job: F) -> PeriodicTask
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = PulseResult<()>> + Send + 'static,
    {
        spawn_periodic(name, period, self.cancel.child_token(), Arc::clone(&self.errors), job)
    }

    /// Queue a short-term analysis of every metric not analysed recently
    async fn sweep(&self) -> PulseResult<()> {
        let mut queued = 0usize;
        for metric in self.get_metric_names() {
            match self.request_analysis(&metric, TimeWindow::ShortTerm).await {
                Ok(_) => queued += 1,
                Err(AnalysisError::Throttled { .. }) | Err(AnalysisError::MetricNotFound { .. }) => {}
                // Already logged by the pool; the rest of the sweep waits for the next tick.
                Err(AnalysisError::QueueFull { .. }) => break,
                Err(e) => return Err(e.into()),
            }
        }
        debug!(target: "pulse::engine", queued, "Analysis sweep queued");
        Ok(())
    }

    /// Cancel background tasks and workers, waiting up to the configured
    /// shutdown timeout.
    pub async fn shutdown(&self) -> PulseResult<()> {
        info!(target: "pulse::engine", "Shutting down");
        self.cancel.cancel();

        let timeout = self.config.engine.shutdown_timeout;
        let tasks: Vec<PeriodicTask> = std::mem::take(&mut *self.tasks.lock());
        let joined = tokio::time::timeout(timeout, futures::future::join_all(tasks.into_iter().map(|t| t.join()))).await;
        if joined.is_err() {
            warn!(target: "pulse::engine", timeout_ms = timeout.as_millis() as u64, "Background tasks still running at shutdown deadline");
        }

        let workers_stopped = self.workers.join(timeout).await;
        if joined.is_err() || !workers_stopped {
            return Err(PulseError::ShuttingDown);
        }
        info!(target: "pulse::engine", "Shutdown complete");
        Ok(())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    // ------------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------------

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    pub fn error_stats(&self) -> &ErrorStats {
        &self.errors
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            instance: self.config.engine.instance_name.clone(),
            started_at: self.started_at,
            tracked_metrics: self.history.metric_count(),
            total_points: self.history.total_points(),
            estimated_bytes: self.history.estimated_bytes(),
            sampling_states: self.sampling.tracked_metrics(),
            pending_ingest: self.pending_ingest.load(AtomicOrdering::Acquire),
            analysis_queue_depth: self.workers.queue_depth(),
            samples_accepted: self.metrics.samples_accepted(),
            alerts: self.alerts.stats(),
            errors: self.errors.summary(),
            background_tasks: self.tasks.lock().iter().map(|t| (t.name(), t.stats())).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{AlertOutcome, ChannelSink};
    use crate::types::Severity;
    use tokio::sync::mpsc;

    fn engine_with(config: EngineConfig) -> Arc<MetricsEngine> {
        Arc::new(MetricsEngine::new(config).expect("engine"))
    }

    #[tokio::test]
    async fn test_rejection_reasons() {
        let mut config = EngineConfig::default();
        config.sampling.require_registration = true;
        config.sampling.registered_metrics = vec!["cpu_usage".into()];
        let engine = engine_with(config);
        let t0 = Timestamp::from_secs(1_000_000);

        assert_eq!(
            engine.submit_sample_at("cpu_usage", f64::NAN, Tags::new(), t0).await,
            SubmitOutcome::Rejected(RejectionReason::InvalidValue)
        );
        assert_eq!(
            engine.submit_sample_at("unknown", 1.0, Tags::new(), t0).await,
            SubmitOutcome::Rejected(RejectionReason::UnknownMetric)
        );
        assert!(engine.submit_sample_at("cpu_usage", 1.0, Tags::new(), t0).await.is_accepted());

        // Base interval is one second.
        let early = t0.add_duration(Duration::from_millis(200));
        assert_eq!(
            engine.submit_sample_at("cpu_usage", 2.0, Tags::new(), early).await,
            SubmitOutcome::Rejected(RejectionReason::NotDue {
                next_due: t0.add_duration(Duration::from_secs(1))
            })
        );
        assert_eq!(engine.metrics().samples_rejected("not_due"), 1);
        assert_eq!(engine.metrics().samples_accepted(), 1);
    }

    #[tokio::test]
    async fn test_buffer_full_when_no_ingest_capacity_left() {
        let engine = engine_with(EngineConfig::default());
        let capacity = engine.config.storage.ingest_buffer_capacity;
        engine.pending_ingest.store(capacity, AtomicOrdering::SeqCst);
        assert_eq!(
            engine.submit_sample("cpu_usage", 1.0, Tags::new()).await,
            SubmitOutcome::Rejected(RejectionReason::BufferFull)
        );
        engine.pending_ingest.store(0, AtomicOrdering::SeqCst);
        assert!(engine.submit_sample("cpu_usage", 1.0, Tags::new()).await.is_accepted());
        assert_eq!(engine.pending_ingest.load(AtomicOrdering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_late_sample_accepted_and_stored_in_order() {
        let engine = engine_with(EngineConfig::default());
        let t0 = Timestamp::now().sub_duration(Duration::from_secs(60));

        for (offset, value) in [(0, 1.0), (10, 3.0), (5, 2.0)] {
            let at = t0.add_duration(Duration::from_secs(offset));
            assert_eq!(
                engine.submit_sample_at("disk_io", value, Tags::new(), at).await,
                SubmitOutcome::Accepted
            );
        }

        let points = engine.get_history("disk_io", Duration::from_secs(3_600)).expect("known");
        let values: Vec<f64> = points.iter().map(|p| p.value).collect();
        assert_eq!(values, vec![1.0, 2.0, 3.0]);
        assert!(points.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[tokio::test]
    async fn test_dropped_write_does_not_consume_interval() {
        let mut config = EngineConfig::default();
        config.storage.write_timeout = Duration::from_millis(20);
        let engine = engine_with(config);
        let t0 = Timestamp::now().sub_duration(Duration::from_secs(60));

        assert!(engine.submit_sample_at("queue_len", 1.0, Tags::new(), t0).await.is_accepted());

        engine.history.hold_writers("queue_len").await;
        let dropped = engine
            .submit_sample_at("queue_len", 50.0, Tags::new(), t0.add_duration(Duration::from_secs(2)))
            .await;
        assert_eq!(dropped, SubmitOutcome::Rejected(RejectionReason::BufferFull));
        engine.history.release_writers("queue_len");

        let retry = engine
            .submit_sample_at("queue_len", 2.0, Tags::new(), t0.add_duration(Duration::from_millis(2_500)))
            .await;
        assert_eq!(retry, SubmitOutcome::Accepted);

        let points = engine.get_history("queue_len", Duration::from_secs(3_600)).expect("known");
        assert_eq!(points.len(), 2);
        let recent = engine.sampling.state("queue_len").expect("tracked").recent_values;
        assert!(!recent.contains(&50.0));
    }

    #[tokio::test]
    async fn test_queries() {
        let engine = engine_with(EngineConfig::default());
        let now = Timestamp::now();
        for i in 0..5u64 {
            let at = now.sub_duration(Duration::from_secs(60 * (5 - i)));
            let tags = Tags::from([("host".to_string(), "a".to_string())]);
            assert!(engine.submit_sample_at("mem_used", i as f64, tags, at).await.is_accepted());
        }

        let points = engine.get_history("mem_used", Duration::from_secs(3_600)).expect("known");
        assert_eq!(points.len(), 5);
        assert!(points.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert_eq!(points[0].tags.get("host").map(String::as_str), Some("a"));

        let stats = engine.get_statistics("mem_used", Duration::from_secs(3_600)).expect("known");
        assert_eq!(stats.count, 5);
        assert_eq!(stats.max, 4.0);
        assert_eq!(engine.get_metric_names(), vec!["mem_used".to_string()]);
        assert!(matches!(
            engine.get_history("nope", Duration::from_secs(60)),
            Err(StorageError::MetricNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_analysis_request_throttled_per_tier() {
        let engine = engine_with(EngineConfig::default());
        assert!(matches!(
            engine.request_analysis("ghost", TimeWindow::ShortTerm).await,
            Err(AnalysisError::MetricNotFound { .. })
        ));

        engine.submit_sample("net_rx", 5.0, Tags::new()).await;
        let handle = engine
            .request_analysis("net_rx", TimeWindow::ShortTerm)
            .await
            .expect("queued");
        handle.wait().await.expect("report");

        assert!(matches!(
            engine.request_analysis("net_rx", TimeWindow::ShortTerm).await,
            Err(AnalysisError::Throttled { tier: TimeWindow::ShortTerm, .. })
        ));
        // Other tiers have their own budget.
        assert!(engine.request_analysis("net_rx", TimeWindow::LongTerm).await.is_ok());
        engine.shutdown().await.expect("clean shutdown");
    }

    #[tokio::test]
    async fn test_cpu_spike_end_to_end() {
        let engine = engine_with(EngineConfig::default());
        let (tx, mut rx) = mpsc::channel(8);
        engine
            .subscribe(
                "ops",
                SubscriptionFilter::default().min_severity(Severity::Warning),
                Arc::new(ChannelSink::new("ops", tx)),
            )
            .expect("subscribed");

        // 100 samples of 40±2 over the last ~50 minutes, then a spike.
        let now = Timestamp::now();
        for i in 0..100i64 {
            let at = now.sub_duration(Duration::from_secs(30 * (100 - i) as u64));
            let value = 40.0 + ((i % 5) - 2) as f64;
            assert!(engine.submit_sample_at("cpu_usage", value, Tags::new(), at).await.is_accepted());
        }
        assert!(engine.submit_sample_at("cpu_usage", 95.0, Tags::new(), now).await.is_accepted());

        let report = engine
            .request_analysis("cpu_usage", TimeWindow::ShortTerm)
            .await
            .expect("queued")
            .wait()
            .await
            .expect("report");
        assert!(report.anomaly.is_anomaly);
        assert!(matches!(report.alert_outcome, Some(AlertOutcome::Delivered { recipients: 1 })));

        let alert = rx.recv().await.expect("delivered alert");
        assert_eq!(alert.alert_type, "cpu_usage.anomaly");
        assert!(alert.severity >= Severity::Warning);

        // A second pass inside the throttle window delivers nothing.
        let again = engine
            .pipeline
            .run("cpu_usage", TimeWindow::ShortTerm, CancellationToken::new())
            .await
            .expect("report");
        assert_eq!(again.alert_outcome, Some(AlertOutcome::Throttled));
        assert!(rx.try_recv().is_err());
        assert_eq!(engine.stats().alerts.delivered, 1);

        engine.shutdown().await.expect("clean shutdown");
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_tasks_start_once_and_stop() {
        let mut config = EngineConfig::default();
        config.engine.shutdown_timeout = Duration::from_secs(5);
        let engine = engine_with(config);
        engine.start();
        engine.start();
        assert_eq!(engine.stats().background_tasks.len(), 6);

        tokio::time::sleep(Duration::from_secs(61)).await;
        let stats = engine.stats();
        let aggregation = stats
            .background_tasks
            .iter()
            .find(|(name, _)| *name == "alert_aggregation")
            .map(|(_, s)| *s)
            .expect("aggregation task");
        assert_eq!(aggregation.runs, 1);

        engine.shutdown().await.expect("clean shutdown");
        assert!(engine.is_shutting_down());
        assert!(matches!(
            engine.request_analysis("x", TimeWindow::ShortTerm).await,
            Err(AnalysisError::MetricNotFound { .. })
        ));
    }
}
