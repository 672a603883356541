// ============================================================================
// METRIC HISTORY MANAGER
// ============================================================================
// Registry of per-metric time-series stores. Each metric has its own writer
// gate, a semaphore with `writer_parallelism` permits, so a burst on one
// metric never serialises writers of another. Readers take copy-on-read
// snapshots and never wait on the gate.
// ============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::RandomState;
use compact_str::CompactString;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, trace};

use crate::config::{DownsamplingRule, StorageConfig};
use crate::error::{StorageError, StorageResult};
use crate::stats::Statistics;
use crate::timeseries::{RetiredSeries, TimeSeriesStore};
use crate::types::{MetricSample, Timestamp};

/// Result of a cleanup run
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanupResult {
    pub removed_count: usize,
    pub freed_bytes: usize,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// Metrics whose store was dropped because nothing was left
    pub retired_metrics: usize,
}

impl CleanupResult {
    fn merge(&mut self, other: CleanupResult) {
        self.removed_count += other.removed_count;
        self.freed_bytes += other.freed_bytes;
        self.retired_metrics += other.retired_metrics;
    }
}

struct MetricSlot {
    store: TimeSeriesStore,
    gate: Semaphore,
}

/// Owner of every metric's time series
pub struct MetricHistoryManager {
    slots: DashMap<CompactString, Arc<MetricSlot>, RandomState>,
    config: StorageConfig,
}

impl MetricHistoryManager {
    pub fn new(config: StorageConfig) -> Self {
        Self {
            slots: DashMap::with_hasher(RandomState::new()),
            config,
        }
    }

    fn slot(&self, metric: &str) -> Option<Arc<MetricSlot>> {
        self.slots.get(metric).map(|s| Arc::clone(s.value()))
    }

    fn slot_or_create(&self, metric: &CompactString) -> Arc<MetricSlot> {
        if let Some(slot) = self.slot(metric) {
            return slot;
        }
        let slot = self.slots.entry(metric.clone()).or_insert_with(|| {
            debug!(target: "pulse::history", metric = %metric, "Tracking new metric");
            Arc::new(MetricSlot {
                store: TimeSeriesStore::new(
                    metric.clone(),
                    self.config.max_points_per_metric,
                    self.config.retention,
                ),
                gate: Semaphore::new(self.config.writer_parallelism),
            })
        });
        Arc::clone(slot.value())
    }

    // ------------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------------

    /// Take every writer permit of `metric` until `release_writers`
    #[cfg(test)]
    pub(crate) async fn hold_writers(&self, metric: &str) {
        let slot = self.slot_or_create(&CompactString::from(metric));
        if let Ok(permits) = slot.gate.acquire_many(self.config.writer_parallelism as u32).await {
            permits.forget();
        };
    }

    #[cfg(test)]
    pub(crate) fn release_writers(&self, metric: &str) {
        if let Some(slot) = self.slot(metric) {
            slot.gate.add_permits(self.config.writer_parallelism);
        }
    }

    /// Append a sample, creating the metric's store on first use.
    ///
    /// Waits at most `write_timeout` for a writer permit. A write that lands
    /// on a store retired by a concurrent cleanup is replayed against a fresh
    /// store, so no accepted sample is lost.
    pub async fn add_data_point(&self, sample: MetricSample) -> StorageResult<()> {
        let mut sample = sample;
        loop {
            let slot = self.slot_or_create(&sample.metric);
            let _permit = match tokio::time::timeout(self.config.write_timeout, slot.gate.acquire()).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => {
                    return Err(StorageError::SeriesRetired {
                        metric: sample.metric.to_string(),
                    })
                }
                Err(_) => {
                    return Err(StorageError::lock_timeout(
                        sample.metric.as_str(),
                        self.config.write_timeout,
                    ))
                }
            };

            match slot.store.add_point(sample) {
                Ok(evicted) => {
                    if evicted > 0 {
                        trace!(target: "pulse::history", metric = %slot.store.metric(), evicted, "Capacity eviction");
                    }
                    return Ok(());
                }
                Err(RetiredSeries(returned)) => {
                    trace!(target: "pulse::history", metric = %returned.metric, "Write raced with retirement, retrying");
                    self.slots
                        .remove_if(returned.metric.as_str(), |_, s| Arc::ptr_eq(s, &slot));
                    sample = returned;
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    /// Points of `metric` within `[now - window, now]`
    pub fn get_data_points(&self, metric: &str, window: Duration, now: Timestamp) -> StorageResult<Vec<MetricSample>> {
        let slot = self
            .slot(metric)
            .ok_or_else(|| StorageError::metric_not_found(metric))?;
        Ok(slot.store.get_points(window, now))
    }

    /// Points of `metric` within `[start, end]`
    pub fn get_data_points_in_range(
        &self,
        metric: &str,
        start: Timestamp,
        end: Timestamp,
    ) -> StorageResult<Vec<MetricSample>> {
        let slot = self
            .slot(metric)
            .ok_or_else(|| StorageError::metric_not_found(metric))?;
        slot.store.get_points_in_range(start, end)
    }

    pub fn latest(&self, metric: &str) -> Option<MetricSample> {
        self.slot(metric).and_then(|s| s.store.latest())
    }

    /// Sorted names of every tracked metric
    pub fn get_all_metric_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.slots.iter().map(|e| e.key().to_string()).collect();
        names.sort_unstable();
        names
    }

    pub fn contains(&self, metric: &str) -> bool {
        self.slots.contains_key(metric)
    }

    pub fn metric_count(&self) -> usize {
        self.slots.len()
    }

    pub fn total_points(&self) -> usize {
        self.slots.iter().map(|e| e.value().store.len()).sum()
    }

    pub fn estimated_bytes(&self) -> usize {
        self.slots.iter().map(|e| e.value().store.estimated_bytes()).sum()
    }

    /// Summary statistics over `[now - window, now]`; zero count when the
    /// window holds no points.
    pub fn get_statistics(&self, metric: &str, window: Duration, now: Timestamp) -> StorageResult<Statistics> {
        let points = self.get_data_points(metric, window, now)?;
        Ok(Statistics::from_samples(&points))
    }

    // ------------------------------------------------------------------------
    // Cleanup
    // ------------------------------------------------------------------------

    /// Remove points older than `cutoff` in batches of `batch_size`, yielding
    /// between batches. An emptied store and its gate are dropped.
    pub async fn cleanup(&self, metric: &str, cutoff: Timestamp, batch_size: usize) -> StorageResult<CleanupResult> {
        let started = Instant::now();
        let slot = self
            .slot(metric)
            .ok_or_else(|| StorageError::metric_not_found(metric))?;

        let mut result = CleanupResult::default();
        loop {
            let (removed, freed) = slot.store.remove_older_than_batch(cutoff, batch_size.max(1));
            result.removed_count += removed;
            result.freed_bytes += freed;
            if removed == 0 || !slot.store.has_points_older_than(cutoff) {
                break;
            }
            if self.config.cleanup_batch_delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(self.config.cleanup_batch_delay).await;
            }
        }

        if slot.store.retire_if_empty() {
            let dropped = self.slots.remove_if(metric, |_, s| Arc::ptr_eq(s, &slot));
            if dropped.is_some() {
                result.retired_metrics = 1;
                debug!(target: "pulse::history", metric, "Dropped empty metric");
            }
        }

        result.duration = started.elapsed();
        Ok(result)
    }

    /// Run `cleanup` over every metric
    pub async fn cleanup_all(&self, cutoff: Timestamp) -> CleanupResult {
        let started = Instant::now();
        let mut total = CleanupResult::default();
        for metric in self.get_all_metric_names() {
            match self.cleanup(&metric, cutoff, self.config.cleanup_batch_size).await {
                Ok(result) => total.merge(result),
                // Removed concurrently, nothing left to clean.
                Err(StorageError::MetricNotFound { .. }) => {}
                Err(e) => debug!(target: "pulse::history", metric = %metric, error = %e, "Cleanup skipped"),
            }
        }
        total.duration = started.elapsed();
        total
    }

    /// Bucket-average cold data of every metric: points older than a rule's
    /// age are compacted to that rule's interval. Returns points removed.
    pub fn compact_cold(&self, rules: &[DownsamplingRule], now: Timestamp) -> usize {
        let slots: Vec<Arc<MetricSlot>> = self.slots.iter().map(|e| Arc::clone(e.value())).collect();
        let mut removed = 0;
        for slot in slots {
            // Coarsest rule first so finer rules never re-split its buckets.
            for rule in rules.iter().rev() {
                let cutoff = now.sub_duration(rule.age);
                removed += slot.store.compact_older_than(rule.interval, cutoff).removed();
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> StorageConfig {
        StorageConfig {
            max_points_per_metric: 1_000,
            retention: Duration::from_secs(24 * 3600),
            writer_parallelism: 2,
            write_timeout: Duration::from_millis(100),
            ingest_buffer_capacity: 100,
            cleanup_batch_size: 3,
            cleanup_batch_delay: Duration::ZERO,
        }
    }

    fn sample(metric: &str, secs: i64, value: f64) -> MetricSample {
        MetricSample::at(metric, value, Timestamp::from_secs(secs))
    }

    #[tokio::test]
    async fn test_lazy_creation_and_queries() {
        let history = MetricHistoryManager::new(config());
        for i in 0..10 {
            history.add_data_point(sample("cpu", i * 60, i as f64)).await.expect("write");
        }
        history.add_data_point(sample("mem", 0, 1.0)).await.expect("write");

        assert_eq!(history.get_all_metric_names(), vec!["cpu".to_string(), "mem".to_string()]);
        let now = Timestamp::from_secs(540);
        let points = history
            .get_data_points("cpu", Duration::from_secs(180), now)
            .expect("known metric");
        assert_eq!(points.len(), 4);
        assert!(points.iter().all(|p| p.timestamp.is_within(Timestamp::from_secs(360), now)));
        assert_eq!(history.latest("cpu").map(|p| p.value), Some(9.0));
    }

    #[tokio::test]
    async fn test_unknown_metric_is_not_found() {
        let history = MetricHistoryManager::new(config());
        let err = history
            .get_statistics("nope", Duration::from_secs(60), Timestamp::from_secs(0))
            .unwrap_err();
        assert!(matches!(err, StorageError::MetricNotFound { .. }));
        assert!(history.cleanup("nope", Timestamp::from_secs(0), 10).await.is_err());
    }

    #[tokio::test]
    async fn test_statistics_over_window() {
        let history = MetricHistoryManager::new(config());
        for i in 1..=100 {
            history.add_data_point(sample("lat", i, i as f64)).await.expect("write");
        }
        let stats = history
            .get_statistics("lat", Duration::from_secs(1_000), Timestamp::from_secs(100))
            .expect("known metric");
        assert_eq!(stats.count, 100);
        assert!((stats.median - 50.5).abs() < 1e-9);
        assert!((stats.p95 - 95.05).abs() < 1e-9);

        let empty = history
            .get_statistics("lat", Duration::from_secs(10), Timestamp::from_secs(10_000))
            .expect("known metric");
        assert_eq!(empty.count, 0);
    }

    #[tokio::test]
    async fn test_cleanup_in_batches_and_retire() {
        let history = MetricHistoryManager::new(config());
        for i in 0..10 {
            history.add_data_point(sample("disk", i, 1.0)).await.expect("write");
        }

        let partial = history
            .cleanup("disk", Timestamp::from_secs(7), 3)
            .await
            .expect("known metric");
        assert_eq!(partial.removed_count, 7);
        assert!(partial.freed_bytes > 0);
        assert_eq!(partial.retired_metrics, 0);
        assert!(history.contains("disk"));

        let full = history
            .cleanup("disk", Timestamp::from_secs(100), 3)
            .await
            .expect("known metric");
        assert_eq!(full.removed_count, 3);
        assert_eq!(full.retired_metrics, 1);
        assert!(!history.contains("disk"));

        // Lazily re-created on the next sample.
        history.add_data_point(sample("disk", 200, 2.0)).await.expect("write");
        assert_eq!(history.latest("disk").map(|p| p.value), Some(2.0));
    }

    #[tokio::test]
    async fn test_cleanup_all_aggregates() {
        let history = MetricHistoryManager::new(config());
        for metric in ["a", "b", "c"] {
            for i in 0..4 {
                history.add_data_point(sample(metric, i, 1.0)).await.expect("write");
            }
        }
        let total = history.cleanup_all(Timestamp::from_secs(2)).await;
        assert_eq!(total.removed_count, 6);
        assert_eq!(history.total_points(), 6);
    }

    #[tokio::test]
    async fn test_concurrent_writers_lose_nothing() {
        let history = Arc::new(MetricHistoryManager::new(config()));
        let mut handles = Vec::new();
        for writer in 0..8 {
            let history = Arc::clone(&history);
            handles.push(tokio::spawn(async move {
                for i in 0..25 {
                    history
                        .add_data_point(sample("shared", writer * 1_000 + i, 1.0))
                        .await
                        .expect("write");
                }
            }));
        }
        for handle in handles {
            handle.await.expect("writer task");
        }
        assert_eq!(history.total_points(), 200);
    }

    #[tokio::test]
    async fn test_compact_cold_follows_rules() {
        let history = MetricHistoryManager::new(config());
        for i in 0..120 {
            history.add_data_point(sample("net", i * 10, 1.0)).await.expect("write");
        }
        let rules = [DownsamplingRule {
            age: Duration::from_secs(600),
            interval: Duration::from_secs(60),
        }];
        let now = Timestamp::from_secs(1_190);
        let removed = history.compact_cold(&rules, now);
        // The cutoff at 590s floors to 540s: 54 points collapse into 9
        // one-minute buckets.
        assert_eq!(removed, 45);
        assert!(history.estimated_bytes() > 0);
    }
}
