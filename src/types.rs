// ============================================================================
// CORE TYPE SYSTEM
// ============================================================================
// The values that flow between every component of the engine: timestamps,
// metric samples, alert severities and analysis tiers.
// ============================================================================

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use compact_str::CompactString;
use serde::{Deserialize, Serialize};

const NANOS_PER_HOUR: f64 = 3_600_000_000_000.0;

// ----------------------------------------------------------------------------
// 1.1 Timestamp - Nanosecond Precision Time Handling
// ----------------------------------------------------------------------------

/// Timestamp in nanoseconds since the Unix epoch.
/// `i64` covers roughly the years 1677 to 2262.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Zero timestamp (Unix epoch)
    pub const EPOCH: Timestamp = Timestamp(0);

    #[inline]
    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    #[inline]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis * 1_000_000)
    }

    #[inline]
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs * 1_000_000_000)
    }

    /// Current wall-clock time
    #[inline]
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_nanos() as i64)
    }

    #[inline]
    pub const fn as_nanos(&self) -> i64 {
        self.0
    }

    #[inline]
    pub const fn as_millis(&self) -> i64 {
        self.0 / 1_000_000
    }

    #[inline]
    pub const fn as_secs(&self) -> i64 {
        self.0 / 1_000_000_000
    }

    /// Duration between two timestamps, zero if `earlier` is actually later
    #[inline]
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        let nanos = self.0.saturating_sub(earlier.0);
        Duration::from_nanos(nanos.max(0) as u64)
    }

    /// Signed distance to `earlier` in fractional hours
    #[inline]
    pub fn hours_since(&self, earlier: Timestamp) -> f64 {
        (self.0 - earlier.0) as f64 / NANOS_PER_HOUR
    }

    #[inline]
    pub fn add_duration(&self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration_nanos(duration)))
    }

    #[inline]
    pub fn sub_duration(&self, duration: Duration) -> Self {
        Self(self.0.saturating_sub(duration_nanos(duration)))
    }

    /// Inclusive range check
    #[inline]
    pub fn is_within(&self, start: Timestamp, end: Timestamp) -> bool {
        self.0 >= start.0 && self.0 <= end.0
    }

    /// Round down to the start of the enclosing `interval` bucket
    #[inline]
    pub fn floor_to(&self, interval: Duration) -> Self {
        let width = duration_nanos(interval);
        if width <= 0 {
            return *self;
        }
        Self(self.0.div_euclid(width) * width)
    }

    /// Convert to chrono DateTime<Utc>
    #[inline]
    pub fn to_datetime(&self) -> DateTime<Utc> {
        let secs = self.0.div_euclid(1_000_000_000);
        let nanos = self.0.rem_euclid(1_000_000_000) as u32;
        DateTime::from_timestamp(secs, nanos).unwrap_or_default()
    }

    #[inline]
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp_nanos_opt().unwrap_or(0))
    }
}

impl Default for Timestamp {
    #[inline]
    fn default() -> Self {
        Self::now()
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().to_rfc3339())
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self::from_datetime(dt)
    }
}

impl From<SystemTime> for Timestamp {
    fn from(st: SystemTime) -> Self {
        let duration = st.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self(duration.as_nanos() as i64)
    }
}

#[inline]
fn duration_nanos(duration: Duration) -> i64 {
    i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX)
}

/// Fractional hours in a duration
#[inline]
pub fn duration_hours(duration: Duration) -> f64 {
    duration.as_secs_f64() / 3600.0
}

/// Atomic timestamp for lock-free bookkeeping
#[derive(Debug)]
#[repr(transparent)]
pub struct AtomicTimestamp(AtomicI64);

impl AtomicTimestamp {
    #[inline]
    pub const fn new(ts: Timestamp) -> Self {
        Self(AtomicI64::new(ts.0))
    }

    #[inline]
    pub fn load(&self, ordering: AtomicOrdering) -> Timestamp {
        Timestamp(self.0.load(ordering))
    }

    #[inline]
    pub fn store(&self, ts: Timestamp, ordering: AtomicOrdering) {
        self.0.store(ts.0, ordering);
    }

    /// Move the stored value forward, never backward
    #[inline]
    pub fn update_if_newer(&self, new: Timestamp) {
        self.0.fetch_max(new.0, AtomicOrdering::AcqRel);
    }
}

impl Default for AtomicTimestamp {
    fn default() -> Self {
        Self::new(Timestamp::EPOCH)
    }
}

// ----------------------------------------------------------------------------
// 1.2 Metric Samples
// ----------------------------------------------------------------------------

/// Dimensional tags attached to a sample, ordered by key
pub type Tags = BTreeMap<String, String>;

/// One observation of a named scalar metric. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub metric: CompactString,
    pub value: f64,
    pub timestamp: Timestamp,
    #[serde(default)]
    pub tags: Tags,
}

impl MetricSample {
    /// Create a sample stamped with the current time
    pub fn new(metric: impl Into<CompactString>, value: f64) -> Self {
        Self::at(metric, value, Timestamp::now())
    }

    /// Create a sample with an explicit timestamp
    pub fn at(metric: impl Into<CompactString>, value: f64, timestamp: Timestamp) -> Self {
        Self {
            metric: metric.into(),
            value,
            timestamp,
            tags: Tags::new(),
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_tags(mut self, tags: Tags) -> Self {
        self.tags = tags;
        self
    }

    /// Approximate heap + inline footprint, used for memory accounting
    pub fn estimated_size(&self) -> usize {
        let tags: usize = self.tags.iter().map(|(k, v)| k.len() + v.len()).sum();
        std::mem::size_of::<Self>() + self.metric.len() + tags
    }
}

// ----------------------------------------------------------------------------
// 1.3 Severity
// ----------------------------------------------------------------------------

/// Severity level for alerts
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Severity {
    /// Informational - no action needed
    Info = 0,
    /// Something is drifting and deserves a look
    Warning = 1,
    /// Needs attention soon
    High = 2,
    /// Immediate action required
    Critical = 3,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl Default for Severity {
    fn default() -> Self {
        Severity::Info
    }
}

impl Display for Severity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "info" => Ok(Severity::Info),
            "warning" | "warn" => Ok(Severity::Warning),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity '{}'", other)),
        }
    }
}

// ----------------------------------------------------------------------------
// 1.4 Analysis Tiers
// ----------------------------------------------------------------------------

/// Look-back tier of an analysis request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeWindow {
    ShortTerm,
    MediumTerm,
    LongTerm,
}

impl TimeWindow {
    pub const ALL: [TimeWindow; 3] = [
        TimeWindow::ShortTerm,
        TimeWindow::MediumTerm,
        TimeWindow::LongTerm,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TimeWindow::ShortTerm => "short_term",
            TimeWindow::MediumTerm => "medium_term",
            TimeWindow::LongTerm => "long_term",
        }
    }
}

impl Display for TimeWindow {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_arithmetic() {
        let ts = Timestamp::from_secs(1_000);
        let later = ts.add_duration(Duration::from_secs(90));
        assert_eq!(later.as_secs(), 1_090);
        assert_eq!(later.duration_since(ts), Duration::from_secs(90));
        assert_eq!(ts.duration_since(later), Duration::ZERO);
        assert_eq!(later.sub_duration(Duration::from_secs(90)), ts);
        assert!((later.hours_since(ts) - 0.025).abs() < 1e-12);
    }

    #[test]
    fn test_timestamp_floor() {
        let ts = Timestamp::from_secs(125);
        assert_eq!(ts.floor_to(Duration::from_secs(60)), Timestamp::from_secs(120));
        assert_eq!(ts.floor_to(Duration::ZERO), ts);
        let negative = Timestamp::from_secs(-1);
        assert_eq!(negative.floor_to(Duration::from_secs(60)), Timestamp::from_secs(-60));
    }

    #[test]
    fn test_timestamp_datetime_roundtrip() {
        let ts = Timestamp::from_millis(1_700_000_000_123);
        assert_eq!(Timestamp::from_datetime(ts.to_datetime()), ts);
    }

    #[test]
    fn test_atomic_timestamp_only_moves_forward() {
        let ts = AtomicTimestamp::new(Timestamp::from_secs(10));
        ts.update_if_newer(Timestamp::from_secs(5));
        assert_eq!(ts.load(AtomicOrdering::Relaxed), Timestamp::from_secs(10));
        ts.update_if_newer(Timestamp::from_secs(20));
        assert_eq!(ts.load(AtomicOrdering::Relaxed), Timestamp::from_secs(20));
    }

    #[test]
    fn test_severity_ordering_and_parsing() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Warning);
        assert!(Severity::Warning > Severity::Info);
        assert_eq!("WARN".parse::<Severity>(), Ok(Severity::Warning));
        assert!("loud".parse::<Severity>().is_err());
        assert_eq!(Severity::Critical.to_string(), "critical");
    }

    #[test]
    fn test_sample_builder() {
        let sample = MetricSample::at("cpu_usage", 42.0, Timestamp::from_secs(1))
            .with_tag("host", "a");
        assert_eq!(sample.tags.get("host").map(String::as_str), Some("a"));
        assert!(sample.estimated_size() > std::mem::size_of::<MetricSample>());
    }
}
