// ============================================================================
// BACKGROUND SCHEDULING
// ============================================================================
// Periodic tasks run on their own timers with their own cancellation token.
// A tick that arrives while the previous run is still going is skipped, and
// a run that fails or panics is logged and recorded; the timer keeps going.
//
// The cleanup scheduler is one such job: retention cleanup of every metric,
// eviction of idle sampling state, and compaction of cold data when memory
// is under pressure.
// ============================================================================

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sysinfo::System;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::CleanupConfig;
use crate::error::{ErrorStats, PulseError, PulseResult};
use crate::history::{CleanupResult, MetricHistoryManager};
use crate::sampling::SamplingController;
use crate::telemetry::EngineMetrics;
use crate::types::Timestamp;

const MIN_PERIOD: Duration = Duration::from_millis(1);

// ----------------------------------------------------------------------------
// 11.1 Periodic Tasks
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct TaskCounters {
    runs: AtomicU64,
    failures: AtomicU64,
    skipped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStats {
    pub runs: u64,
    pub failures: u64,
    pub skipped: u64,
}

/// Handle to a spawned periodic task
pub struct PeriodicTask {
    name: &'static str,
    handle: JoinHandle<()>,
    counters: Arc<TaskCounters>,
}

impl PeriodicTask {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn stats(&self) -> TaskStats {
        TaskStats {
            runs: self.counters.runs.load(AtomicOrdering::Relaxed),
            failures: self.counters.failures.load(AtomicOrdering::Relaxed),
            skipped: self.counters.skipped.load(AtomicOrdering::Relaxed),
        }
    }

    /// Wait for the timer loop, and any run it started, to finish after
    /// cancellation
    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            if !e.is_cancelled() {
                error!(target: "pulse::scheduler", task = self.name, error = %e, "Task loop ended abnormally");
            }
        }
    }
}

/// Run `job` every `period` until `cancel` fires. The first run happens one
/// period after spawning.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    cancel: CancellationToken,
    errors: Arc<ErrorStats>,
    job: F,
) -> PeriodicTask
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = PulseResult<()>> + Send + 'static,
{
    let period = period.max(MIN_PERIOD);
    let counters = Arc::new(TaskCounters::default());

    let handle = tokio::spawn({
        let counters = Arc::clone(&counters);
        async move {
            let mut tick = interval_at(Instant::now() + period, period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut in_flight: Option<JoinHandle<()>> = None;
            debug!(target: "pulse::scheduler", task = name, period_ms = period.as_millis() as u64, "Task started");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        if in_flight.as_ref().is_some_and(|run| !run.is_finished()) {
                            counters.skipped.fetch_add(1, AtomicOrdering::Relaxed);
                            debug!(target: "pulse::scheduler", task = name, "Previous run still in progress, tick skipped");
                            continue;
                        }

                        let run = job();
                        let counters = Arc::clone(&counters);
                        let errors = Arc::clone(&errors);
                        in_flight = Some(tokio::spawn(async move {
                            match AssertUnwindSafe(run).catch_unwind().await {
                                Ok(Ok(())) => {
                                    counters.runs.fetch_add(1, AtomicOrdering::Relaxed);
                                }
                                Ok(Err(e)) => {
                                    counters.failures.fetch_add(1, AtomicOrdering::Relaxed);
                                    errors.record(&e);
                                    error!(
                                        target: "pulse::scheduler",
                                        task = name,
                                        error = %e,
                                        category = e.category(),
                                        "Background run failed, retrying next tick"
                                    );
                                }
                                Err(_) => {
                                    counters.failures.fetch_add(1, AtomicOrdering::Relaxed);
                                    errors.record(&PulseError::Internal(format!("task '{name}' panicked")));
                                    error!(target: "pulse::scheduler", task = name, "Background run panicked, retrying next tick");
                                }
                            }
                        }));
                    }
                }
            }

            if let Some(run) = in_flight.filter(|run| !run.is_finished()) {
                debug!(target: "pulse::scheduler", task = name, "Waiting for in-flight run");
                if let Err(e) = run.await {
                    error!(target: "pulse::scheduler", task = name, error = %e, "In-flight run ended abnormally");
                }
            }
            debug!(target: "pulse::scheduler", task = name, "Task stopped");
        }
    });

    PeriodicTask {
        name,
        handle,
        counters,
    }
}

// ----------------------------------------------------------------------------
// 11.2 Cleanup Scheduler
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanupSummary {
    pub retention: CleanupResult,
    pub idle_metrics_evicted: usize,
    pub points_compacted: usize,
    pub memory_pressure: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemoryPressure {
    pub store_bytes: usize,
    /// Host used/total memory, when the host reports it
    pub host_ratio: Option<f64>,
    pub under_pressure: bool,
}

pub struct CleanupScheduler {
    history: Arc<MetricHistoryManager>,
    sampling: Arc<SamplingController>,
    metrics: Arc<EngineMetrics>,
    config: CleanupConfig,
    retention: Duration,
    system: Mutex<System>,
}

impl CleanupScheduler {
    pub fn new(
        history: Arc<MetricHistoryManager>,
        sampling: Arc<SamplingController>,
        metrics: Arc<EngineMetrics>,
        config: CleanupConfig,
        retention: Duration,
    ) -> Self {
        Self {
            history,
            sampling,
            metrics,
            config,
            retention,
            system: Mutex::new(System::new()),
        }
    }

    pub fn memory_pressure(&self) -> MemoryPressure {
        let store_bytes = self.history.estimated_bytes();
        let host_ratio = {
            let mut system = self.system.lock();
            system.refresh_memory();
            let total = system.total_memory();
            (total > 0).then(|| system.used_memory() as f64 / total as f64)
        };
        let under_pressure = store_bytes as u64 > self.config.memory_limit_bytes
            || host_ratio.is_some_and(|r| r > self.config.memory_pressure_ratio);
        MemoryPressure {
            store_bytes,
            host_ratio,
            under_pressure,
        }
    }

    /// One full pass: retention cleanup, idle eviction, and compaction of
    /// cold data when memory is under pressure.
    pub async fn run_once(&self, now: Timestamp) -> CleanupSummary {
        let cutoff = now.sub_duration(self.retention);
        let retention = self.history.cleanup_all(cutoff).await;
        let idle_metrics_evicted = self.sampling.evict_idle(now);

        let pressure = self.memory_pressure();
        let points_compacted = if pressure.under_pressure {
            self.history.compact_cold(self.sampling.downsampling_rules(), now)
        } else {
            0
        };

        self.metrics.record_cleanup(retention.removed_count + points_compacted);
        self.metrics.set_tracked_metrics(self.history.metric_count());

        let summary = CleanupSummary {
            retention,
            idle_metrics_evicted,
            points_compacted,
            memory_pressure: pressure.under_pressure,
        };
        if retention.removed_count > 0 || points_compacted > 0 || idle_metrics_evicted > 0 {
            info!(
                target: "pulse::scheduler",
                removed = retention.removed_count,
                freed_bytes = retention.freed_bytes,
                retired = retention.retired_metrics,
                idle_evicted = idle_metrics_evicted,
                compacted = points_compacted,
                duration_ms = retention.duration.as_millis() as u64,
                "Cleanup completed"
            );
        } else {
            debug!(target: "pulse::scheduler", "Cleanup found nothing to do");
        }
        summary
    }

    /// Run an immediate pass when memory is under pressure
    pub async fn check_memory_pressure(&self, now: Timestamp) -> Option<CleanupSummary> {
        let pressure = self.memory_pressure();
        if !pressure.under_pressure {
            return None;
        }
        warn!(
            target: "pulse::scheduler",
            store_bytes = pressure.store_bytes,
            host_ratio = pressure.host_ratio.unwrap_or_default(),
            "Memory pressure detected, running cleanup"
        );
        Some(self.run_once(now).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SamplingConfig, StorageConfig};
    use crate::types::MetricSample;

    #[tokio::test(start_paused = true)]
    async fn test_periodic_task_runs_until_cancelled() {
        let cancel = CancellationToken::new();
        let errors = Arc::new(ErrorStats::new());
        let count = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&count);

        let task = spawn_periodic("counter", Duration::from_secs(1), cancel.clone(), errors, move || {
            let seen = Arc::clone(&seen);
            async move {
                seen.fetch_add(1, AtomicOrdering::SeqCst);
                Ok(())
            }
        });

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        cancel.cancel();
        let stats = task.stats();
        task.join().await;

        assert_eq!(count.load(AtomicOrdering::SeqCst), 3);
        assert_eq!(stats.runs, 3);
        assert_eq!(stats.failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_and_panics_do_not_stop_the_timer() {
        let cancel = CancellationToken::new();
        let errors = Arc::new(ErrorStats::new());
        let ticks = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&ticks);

        let task = spawn_periodic("flaky", Duration::from_secs(1), cancel.clone(), Arc::clone(&errors), move || {
            let n = seen.fetch_add(1, AtomicOrdering::SeqCst);
            async move {
                match n {
                    0 => Err(PulseError::Internal("first run fails".into())),
                    1 => panic!("second run panics"),
                    _ => Ok(()),
                }
            }
        });

        tokio::time::sleep(Duration::from_millis(4_500)).await;
        cancel.cancel();
        let stats = task.stats();
        task.join().await;

        assert_eq!(stats.failures, 2);
        assert_eq!(stats.runs, 2);
        assert_eq!(errors.total_errors(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_ticks_are_skipped() {
        let cancel = CancellationToken::new();
        let errors = Arc::new(ErrorStats::new());

        let task = spawn_periodic("slow", Duration::from_secs(1), cancel.clone(), errors, || async {
            tokio::time::sleep(Duration::from_millis(2_500)).await;
            Ok(())
        });

        tokio::time::sleep(Duration::from_millis(3_200)).await;
        cancel.cancel();
        let stats = task.stats();
        task.join().await;

        // Tick 1 starts a run lasting until 3.5s; ticks 2 and 3 are skipped.
        assert_eq!(stats.skipped, 2);
        assert_eq!(stats.runs, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_waits_for_in_flight_run() {
        let cancel = CancellationToken::new();
        let errors = Arc::new(ErrorStats::new());
        let finished = Arc::new(AtomicU64::new(0));
        let done = Arc::clone(&finished);

        let task = spawn_periodic("long", Duration::from_secs(1), cancel.clone(), errors, move || {
            let done = Arc::clone(&done);
            async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                done.fetch_add(1, AtomicOrdering::SeqCst);
                Ok(())
            }
        });

        // The first run starts at 1s and is mid-way when cancelled.
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        cancel.cancel();
        task.join().await;

        assert_eq!(finished.load(AtomicOrdering::SeqCst), 1);
    }

    fn scheduler(history: Arc<MetricHistoryManager>, sampling: Arc<SamplingController>) -> CleanupScheduler {
        CleanupScheduler::new(
            history,
            sampling,
            Arc::new(EngineMetrics::new().expect("metrics")),
            CleanupConfig {
                memory_limit_bytes: u64::MAX,
                memory_pressure_ratio: 1.0,
                ..CleanupConfig::default()
            },
            Duration::from_secs(3_600),
        )
    }

    #[tokio::test]
    async fn test_cleanup_pass_applies_retention_and_idle_eviction() {
        let history = Arc::new(MetricHistoryManager::new(StorageConfig {
            cleanup_batch_delay: Duration::ZERO,
            ..StorageConfig::default()
        }));
        let sampling = Arc::new(SamplingController::new(SamplingConfig::default()));

        for i in 0..10 {
            let at = Timestamp::from_secs(i * 600);
            history
                .add_data_point(MetricSample::at("cpu", i as f64, at))
                .await
                .expect("write");
            sampling.record("cpu", i as f64, at);
        }
        sampling.record("stale", 1.0, Timestamp::from_secs(0));

        let scheduler = scheduler(Arc::clone(&history), Arc::clone(&sampling));
        let summary = scheduler.run_once(Timestamp::from_secs(6_000)).await;

        // Cutoff at 2400s: points at 0, 600, 1200 and 1800 go.
        assert_eq!(summary.retention.removed_count, 4);
        assert_eq!(history.total_points(), 6);
        assert_eq!(summary.idle_metrics_evicted, 1);
        assert!(!summary.memory_pressure);
        assert_eq!(summary.points_compacted, 0);
    }

    #[tokio::test]
    async fn test_store_size_limit_triggers_compaction() {
        let history = Arc::new(MetricHistoryManager::new(StorageConfig::default()));
        let sampling = Arc::new(SamplingController::new(SamplingConfig::default()));
        // One point every 10s for two hours.
        for i in 0..720 {
            history
                .add_data_point(MetricSample::at("mem", 50.0, Timestamp::from_secs(i * 10)))
                .await
                .expect("write");
        }

        let scheduler = CleanupScheduler::new(
            Arc::clone(&history),
            sampling,
            Arc::new(EngineMetrics::new().expect("metrics")),
            CleanupConfig {
                memory_limit_bytes: 1,
                memory_pressure_ratio: 1.0,
                ..CleanupConfig::default()
            },
            Duration::from_secs(24 * 3_600),
        );
        let now = Timestamp::from_secs(7_200);
        let summary = scheduler
            .check_memory_pressure(now)
            .await
            .expect("pressure detected");
        assert!(summary.memory_pressure);
        // The first hour (360 points) collapses into 60 one-minute buckets.
        assert_eq!(summary.points_compacted, 300);
        assert_eq!(history.total_points(), 420);
    }
}
