// ============================================================================
// TIME-SERIES STORE
// ============================================================================
// One bounded, timestamp-ordered sequence of samples per metric. Every
// mutation and snapshot read goes through one RwLock, so readers always see
// a fully applied update. Capacity is enforced on each insert: first the
// point-count cap (oldest first), then the retention horizon measured from
// the newest point held.
// ============================================================================

use std::collections::VecDeque;
use std::time::Duration;

use compact_str::CompactString;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

use crate::error::{StorageError, StorageResult};
use crate::types::{MetricSample, Timestamp};

// ----------------------------------------------------------------------------
// 6.1 Reports
// ----------------------------------------------------------------------------

/// Returned when a write races with retirement of an emptied series. Carries
/// the sample back so the caller can retry against a fresh store.
#[derive(Debug, Error)]
#[error("time series for '{}' was retired", .0.metric)]
pub struct RetiredSeries(pub MetricSample);

/// Outcome of a bucket-averaging pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionReport {
    pub before: usize,
    pub after: usize,
}

impl CompactionReport {
    pub fn removed(&self) -> usize {
        self.before.saturating_sub(self.after)
    }
}

// ----------------------------------------------------------------------------
// 6.2 Store
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct SeriesState {
    points: VecDeque<MetricSample>,
    bytes: usize,
    retired: bool,
}

impl SeriesState {
    fn pop_front(&mut self) -> Option<MetricSample> {
        let point = self.points.pop_front()?;
        self.bytes = self.bytes.saturating_sub(point.estimated_size());
        Some(point)
    }

    fn recount_bytes(&mut self) {
        self.bytes = self.points.iter().map(MetricSample::estimated_size).sum();
    }
}

/// Bounded time series for a single metric
#[derive(Debug)]
pub struct TimeSeriesStore {
    metric: CompactString,
    max_points: usize,
    retention: Duration,
    state: RwLock<SeriesState>,
}

impl TimeSeriesStore {
    pub fn new(metric: impl Into<CompactString>, max_points: usize, retention: Duration) -> Self {
        Self {
            metric: metric.into(),
            max_points: max_points.max(1),
            retention,
            state: RwLock::new(SeriesState::default()),
        }
    }

    pub fn metric(&self) -> &str {
        &self.metric
    }

    /// Insert a sample at its ordered position and enforce capacity.
    /// Returns the number of points evicted by this insert.
    pub fn add_point(&self, sample: MetricSample) -> Result<usize, RetiredSeries> {
        let mut state = self.state.write();
        if state.retired {
            return Err(RetiredSeries(sample));
        }

        state.bytes += sample.estimated_size();
        let in_order = state
            .points
            .back()
            .map_or(true, |last| last.timestamp <= sample.timestamp);
        if in_order {
            state.points.push_back(sample);
        } else {
            let position = state
                .points
                .iter()
                .rposition(|p| p.timestamp <= sample.timestamp)
                .map_or(0, |i| i + 1);
            trace!(
                target: "pulse::store",
                metric = %self.metric,
                position,
                "Out-of-order sample inserted"
            );
            state.points.insert(position, sample);
        }

        let mut evicted = 0;
        while state.points.len() > self.max_points {
            state.pop_front();
            evicted += 1;
        }

        if let Some(newest) = state.points.back().map(|p| p.timestamp) {
            let cutoff = newest.sub_duration(self.retention);
            while state.points.front().map_or(false, |p| p.timestamp < cutoff) {
                state.pop_front();
                evicted += 1;
            }
        }

        Ok(evicted)
    }

    /// Points within `[now - window, now]`, oldest first
    pub fn get_points(&self, window: Duration, now: Timestamp) -> Vec<MetricSample> {
        self.collect_range(now.sub_duration(window), now)
    }

    /// Points within `[start, end]`, oldest first
    pub fn get_points_in_range(&self, start: Timestamp, end: Timestamp) -> StorageResult<Vec<MetricSample>> {
        if start > end {
            return Err(StorageError::InvalidTimeRange { start, end });
        }
        Ok(self.collect_range(start, end))
    }

    fn collect_range(&self, start: Timestamp, end: Timestamp) -> Vec<MetricSample> {
        let state = self.state.read();
        let first = state.points.partition_point(|p| p.timestamp < start);
        state
            .points
            .range(first..)
            .take_while(|p| p.timestamp <= end)
            .cloned()
            .collect()
    }

    /// Full snapshot of the series
    pub fn snapshot(&self) -> Vec<MetricSample> {
        self.state.read().points.iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<MetricSample> {
        self.state.read().points.back().cloned()
    }

    pub fn first_timestamp(&self) -> Option<Timestamp> {
        self.state.read().points.front().map(|p| p.timestamp)
    }

    pub fn last_timestamp(&self) -> Option<Timestamp> {
        self.state.read().points.back().map(|p| p.timestamp)
    }

    pub fn len(&self) -> usize {
        self.state.read().points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Approximate bytes held by the samples
    pub fn estimated_bytes(&self) -> usize {
        self.state.read().bytes
    }

    /// Remove every point older than `cutoff`
    pub fn remove_older_than(&self, cutoff: Timestamp) -> usize {
        self.remove_older_than_batch(cutoff, usize::MAX).0
    }

    /// Remove at most `max` points older than `cutoff` under one lock
    /// acquisition. Returns (removed, freed_bytes).
    pub fn remove_older_than_batch(&self, cutoff: Timestamp, max: usize) -> (usize, usize) {
        let mut state = self.state.write();
        let before = state.bytes;
        let mut removed = 0;
        while removed < max && state.points.front().map_or(false, |p| p.timestamp < cutoff) {
            state.pop_front();
            removed += 1;
        }
        (removed, before.saturating_sub(state.bytes))
    }

    /// Whether any point is older than `cutoff`
    pub fn has_points_older_than(&self, cutoff: Timestamp) -> bool {
        self.state
            .read()
            .points
            .front()
            .map_or(false, |p| p.timestamp < cutoff)
    }

    /// Replace every multi-point bucket of width `resolution` with one point
    /// at the bucket start carrying the bucket mean. Lossy and irreversible.
    pub fn compact(&self, resolution: Duration) -> CompactionReport {
        self.compact_older_than(resolution, Timestamp::from_nanos(i64::MAX))
    }

    /// Compact only the points older than `cutoff`. The cutoff is floored to
    /// a bucket boundary, so only whole buckets are averaged and a later pass
    /// never mixes an averaged point with raw points of the same bucket.
    pub fn compact_older_than(&self, resolution: Duration, cutoff: Timestamp) -> CompactionReport {
        let cutoff = cutoff.floor_to(resolution);
        let mut state = self.state.write();
        let before = state.points.len();
        if resolution.is_zero() || before < 2 {
            return CompactionReport { before, after: before };
        }

        let cold = state.points.partition_point(|p| p.timestamp < cutoff);
        if cold < 2 {
            return CompactionReport { before, after: before };
        }

        let hot = state.points.split_off(cold);
        let cold_points = std::mem::take(&mut state.points);
        let mut compacted = compact_points(cold_points, resolution);
        compacted.extend(hot);
        state.points = compacted;
        state.recount_bytes();

        let after = state.points.len();
        if after < before {
            trace!(
                target: "pulse::store",
                metric = %self.metric,
                before,
                after,
                "Compacted series"
            );
        }
        CompactionReport { before, after }
    }

    /// Mark the series retired if it holds no points. A retired store rejects
    /// writes so the owner can safely drop it.
    pub fn retire_if_empty(&self) -> bool {
        let mut state = self.state.write();
        if state.points.is_empty() {
            state.retired = true;
        }
        state.retired
    }

    pub fn is_retired(&self) -> bool {
        self.state.read().retired
    }
}

fn compact_points(points: VecDeque<MetricSample>, resolution: Duration) -> VecDeque<MetricSample> {
    let mut out = VecDeque::with_capacity(points.len());
    let mut bucket: Vec<MetricSample> = Vec::new();
    let mut bucket_start = Timestamp::EPOCH;

    for point in points {
        let start = point.timestamp.floor_to(resolution);
        if !bucket.is_empty() && start != bucket_start {
            flush_bucket(&mut out, &mut bucket, bucket_start);
        }
        bucket_start = start;
        bucket.push(point);
    }
    flush_bucket(&mut out, &mut bucket, bucket_start);
    out
}

fn flush_bucket(out: &mut VecDeque<MetricSample>, bucket: &mut Vec<MetricSample>, start: Timestamp) {
    match bucket.len() {
        0 => {}
        1 => out.extend(bucket.drain(..)),
        n => {
            let mean = bucket.iter().map(|p| p.value).sum::<f64>() / n as f64;
            let mut first = bucket.swap_remove(0);
            bucket.clear();
            first.value = mean;
            first.timestamp = start;
            out.push_back(first);
        }
    }
}
