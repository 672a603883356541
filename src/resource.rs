// ============================================================================
// RESOURCE ANALYZERS
// ============================================================================
// Domain wrappers for percentage-style resource metrics (CPU, memory, disk,
// network). A metric maps to a resource class by name prefix; each analyzer
// classifies the current utilization into fixed bands and turns the rolling
// average and trend slope into prioritised recommendations.
// ============================================================================

use serde::{Deserialize, Serialize};

use crate::config::ResourceConfig;
use crate::stats::StatisticalFunctions;
use crate::types::{MetricSample, Severity};

/// Projected time-to-full below which disk growth becomes urgent
const DISK_URGENT_HOURS: f64 = 24.0;

// ----------------------------------------------------------------------------
// 9.1 Classification
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Cpu,
    Memory,
    Disk,
    Network,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Cpu => "cpu",
            ResourceKind::Memory => "memory",
            ResourceKind::Disk => "disk",
            ResourceKind::Network => "network",
        }
    }

    /// Resource class of a metric by name prefix (case-insensitive)
    pub fn classify(metric: &str, config: &ResourceConfig) -> Option<Self> {
        let name = metric.to_ascii_lowercase();
        let matches = |prefixes: &[String]| {
            prefixes
                .iter()
                .any(|p| name.starts_with(&p.to_ascii_lowercase()))
        };
        if matches(&config.cpu_prefixes) {
            Some(ResourceKind::Cpu)
        } else if matches(&config.memory_prefixes) {
            Some(ResourceKind::Memory)
        } else if matches(&config.disk_prefixes) {
            Some(ResourceKind::Disk)
        } else if matches(&config.network_prefixes) {
            Some(ResourceKind::Network)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UtilizationLevel {
    Unknown,
    Low,
    Normal,
    High,
    Critical,
}

impl UtilizationLevel {
    /// >90 Critical, >80 High, >20 Normal, >0 Low, otherwise Unknown
    pub fn from_percent(percent: f64) -> Self {
        if !percent.is_finite() {
            UtilizationLevel::Unknown
        } else if percent > 90.0 {
            UtilizationLevel::Critical
        } else if percent > 80.0 {
            UtilizationLevel::High
        } else if percent > 20.0 {
            UtilizationLevel::Normal
        } else if percent > 0.0 {
            UtilizationLevel::Low
        } else {
            UtilizationLevel::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UtilizationLevel::Unknown => "unknown",
            UtilizationLevel::Low => "low",
            UtilizationLevel::Normal => "normal",
            UtilizationLevel::High => "high",
            UtilizationLevel::Critical => "critical",
        }
    }

    /// Alert severity for levels worth alerting on
    pub fn severity(&self) -> Option<Severity> {
        match self {
            UtilizationLevel::Critical => Some(Severity::Critical),
            UtilizationLevel::High => Some(Severity::High),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub priority: Priority,
    pub message: String,
}

impl Recommendation {
    fn new(priority: Priority, message: impl Into<String>) -> Self {
        Self {
            priority,
            message: message.into(),
        }
    }
}

/// Inputs shared by every analyzer
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub current: f64,
    pub average: f64,
    pub peak: f64,
    pub slope_per_hour: f64,
}

impl ResourceSnapshot {
    pub fn from_points(points: &[MetricSample], slope_per_hour: f64) -> Option<Self> {
        let current = points.last()?.value;
        let values: Vec<f64> = points.iter().map(|p| p.value).collect();
        Some(Self {
            current,
            average: StatisticalFunctions::mean(&values),
            peak: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            slope_per_hour,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceAssessment {
    pub metric: String,
    pub kind: ResourceKind,
    pub level: UtilizationLevel,
    pub current: f64,
    pub average: f64,
    pub peak: f64,
    pub slope_per_hour: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hours_to_full: Option<f64>,
    pub recommendations: Vec<Recommendation>,
}

// ----------------------------------------------------------------------------
// 9.2 Analyzer Trait & Implementations
// ----------------------------------------------------------------------------

pub trait ResourceAnalyzer: Send + Sync {
    fn kind(&self) -> ResourceKind;

    /// Recommendations specific to this resource class
    fn specific_recommendations(&self, snapshot: &ResourceSnapshot, level: UtilizationLevel) -> Vec<Recommendation>;

    fn hours_to_full(&self, _snapshot: &ResourceSnapshot) -> Option<f64> {
        None
    }
}

pub struct CpuAnalyzer {
    slope_threshold: f64,
}

impl ResourceAnalyzer for CpuAnalyzer {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Cpu
    }

    fn specific_recommendations(&self, snapshot: &ResourceSnapshot, level: UtilizationLevel) -> Vec<Recommendation> {
        let mut out = Vec::new();
        if level == UtilizationLevel::Critical {
            out.push(Recommendation::new(
                Priority::High,
                format!(
                    "CPU saturated at {:.1}%: identify the busiest processes or add capacity",
                    snapshot.current
                ),
            ));
        }
        if snapshot.slope_per_hour > self.slope_threshold {
            out.push(Recommendation::new(
                Priority::Medium,
                format!(
                    "CPU load rising {:.1} points/hour: check for runaway work or scale horizontally",
                    snapshot.slope_per_hour
                ),
            ));
        }
        out
    }
}

pub struct MemoryAnalyzer {
    slope_threshold: f64,
}

impl ResourceAnalyzer for MemoryAnalyzer {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Memory
    }

    fn specific_recommendations(&self, snapshot: &ResourceSnapshot, level: UtilizationLevel) -> Vec<Recommendation> {
        let mut out = Vec::new();
        if level >= UtilizationLevel::High {
            out.push(Recommendation::new(
                Priority::High,
                format!(
                    "Memory at {:.1}%: risk of swapping or OOM kills, free caches or add memory",
                    snapshot.current
                ),
            ));
        }
        if snapshot.slope_per_hour > self.slope_threshold {
            out.push(Recommendation::new(
                Priority::High,
                format!(
                    "Memory growing {:.1} points/hour without release: possible leak",
                    snapshot.slope_per_hour
                ),
            ));
        }
        out
    }
}

pub struct DiskAnalyzer {
    slope_threshold: f64,
}

impl ResourceAnalyzer for DiskAnalyzer {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Disk
    }

    fn specific_recommendations(&self, snapshot: &ResourceSnapshot, level: UtilizationLevel) -> Vec<Recommendation> {
        let mut out = Vec::new();
        if let Some(hours) = self.hours_to_full(snapshot) {
            let priority = if hours < DISK_URGENT_HOURS {
                Priority::High
            } else {
                Priority::Medium
            };
            out.push(Recommendation::new(
                priority,
                format!("Disk projected full in {:.1} hours at the current growth rate", hours),
            ));
        }
        if level >= UtilizationLevel::High {
            out.push(Recommendation::new(
                Priority::High,
                format!(
                    "Disk at {:.1}%: rotate logs, prune old data or expand the volume",
                    snapshot.current
                ),
            ));
        } else if snapshot.slope_per_hour > self.slope_threshold {
            out.push(Recommendation::new(
                Priority::Medium,
                "Disk usage growing quickly: review retention of logs and temporary files",
            ));
        }
        out
    }

    fn hours_to_full(&self, snapshot: &ResourceSnapshot) -> Option<f64> {
        if snapshot.slope_per_hour <= 0.0 || snapshot.current >= 100.0 {
            return None;
        }
        Some((100.0 - snapshot.current) / snapshot.slope_per_hour)
    }
}

pub struct NetworkAnalyzer {
    slope_threshold: f64,
}

impl ResourceAnalyzer for NetworkAnalyzer {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Network
    }

    fn specific_recommendations(&self, snapshot: &ResourceSnapshot, level: UtilizationLevel) -> Vec<Recommendation> {
        let mut out = Vec::new();
        if level >= UtilizationLevel::High {
            out.push(Recommendation::new(
                Priority::High,
                format!(
                    "Link utilization at {:.1}%: expect queueing and packet loss, review bandwidth",
                    snapshot.current
                ),
            ));
        }
        if snapshot.slope_per_hour > self.slope_threshold {
            out.push(Recommendation::new(
                Priority::Medium,
                "Network throughput climbing: plan for additional bandwidth or traffic shaping",
            ));
        }
        out
    }
}

// ----------------------------------------------------------------------------
// 9.3 Registry
// ----------------------------------------------------------------------------

pub struct ResourceAnalyzers {
    config: ResourceConfig,
    analyzers: Vec<Box<dyn ResourceAnalyzer>>,
}

impl ResourceAnalyzers {
    pub fn new(config: ResourceConfig) -> Self {
        let slope_threshold = config.trend_slope_threshold;
        let analyzers: Vec<Box<dyn ResourceAnalyzer>> = vec![
            Box::new(CpuAnalyzer { slope_threshold }),
            Box::new(MemoryAnalyzer { slope_threshold }),
            Box::new(DiskAnalyzer { slope_threshold }),
            Box::new(NetworkAnalyzer { slope_threshold }),
        ];
        Self { config, analyzers }
    }

    pub fn kind_for(&self, metric: &str) -> Option<ResourceKind> {
        ResourceKind::classify(metric, &self.config)
    }

    /// Assess a resource metric from its window; `None` for metrics that are
    /// not resource metrics or have no points.
    pub fn assess(&self, metric: &str, points: &[MetricSample], slope_per_hour: f64) -> Option<ResourceAssessment> {
        let kind = self.kind_for(metric)?;
        let analyzer = self.analyzers.iter().find(|a| a.kind() == kind)?;
        let snapshot = ResourceSnapshot::from_points(points, slope_per_hour)?;
        let level = UtilizationLevel::from_percent(snapshot.current);

        let mut recommendations = analyzer.specific_recommendations(&snapshot, level);
        if snapshot.average > self.config.sustained_average_percent {
            recommendations.push(Recommendation::new(
                Priority::Medium,
                format!(
                    "Sustained {} utilization averaging {:.1}%: start capacity planning",
                    kind.as_str(),
                    snapshot.average
                ),
            ));
        }
        recommendations.sort_by(|a, b| b.priority.cmp(&a.priority));

        Some(ResourceAssessment {
            metric: metric.to_string(),
            kind,
            level,
            current: snapshot.current,
            average: snapshot.average,
            peak: snapshot.peak,
            slope_per_hour: snapshot.slope_per_hour,
            hours_to_full: analyzer.hours_to_full(&snapshot),
            recommendations,
        })
    }
}
