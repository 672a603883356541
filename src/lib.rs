// ============================================================================
// PULSE ENGINE
// ============================================================================
// In-process metrics analysis: bounded time-series storage, adaptive
// sampling, multi-method anomaly detection, trend and seasonality analysis,
// resource assessments and alert management.
//
// Data flow:
//   producers → sampling → history → {anomaly, trend, resource}
//             → alerts → subscribers
// ============================================================================

pub mod alerts;
pub mod anomaly;
pub mod config;
pub mod engine;
pub mod error;
pub mod history;
pub mod logging;
pub mod pipeline;
pub mod resource;
pub mod sampling;
pub mod scheduler;
pub mod stats;
pub mod telemetry;
pub mod timeseries;
pub mod trend;
pub mod types;
pub mod worker;

pub use alerts::{Alert, AlertManager, AlertOutcome, AlertSink, CallbackSink, ChannelSink, SubscriptionFilter, SubscriptionHandle};
pub use anomaly::{AnomalyDetector, AnomalyEngine, AnomalyResult};
pub use config::EngineConfig;
pub use engine::{EngineStats, MetricsEngine, RejectionReason, SubmitOutcome};
pub use error::{AlertError, AnalysisError, ConfigError, PulseError, PulseResult, StorageError};
pub use pipeline::AnalysisReport;
pub use stats::{Baseline, Statistics};
pub use trend::{TrendResult, TrendType};
pub use types::{MetricSample, Severity, Tags, TimeWindow, Timestamp};
pub use worker::AnalysisHandle;

/// Engine version, follows the package version
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ENGINE_NAME: &str = "pulse-engine";
