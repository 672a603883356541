// ============================================================================
// LOGGING & TRACING INFRASTRUCTURE
// ============================================================================
// Structured logging through `tracing`. Every subsystem logs with an explicit
// `pulse::<subsystem>` target so operators can filter with `RUST_LOG`.
// ============================================================================

use std::path::Path;
use std::time::Instant;

use tracing::level_filters::LevelFilter;
use tracing::{info, trace, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{PulseError, PulseResult};

// ----------------------------------------------------------------------------
// 4.1 Logger Initialization
// ----------------------------------------------------------------------------

/// Parse a level name into a filter, falling back to INFO
pub fn parse_level(level: &str) -> LevelFilter {
    match level.to_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" | "warning" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        "off" => LevelFilter::OFF,
        _ => LevelFilter::INFO,
    }
}

/// Install the global subscriber described by `config`.
///
/// When `config.file` is set, output goes through a non-blocking daily-rolling
/// file writer and the returned guard must be kept alive until exit so that
/// buffered lines are flushed. Otherwise logs go to stderr and no guard is
/// returned.
pub fn init_logging(config: &LoggingConfig) -> PulseResult<Option<WorkerGuard>> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(parse_level(&config.level).into())
        .from_env_lossy();

    let (writer, guard, ansi) = match config.file.as_deref() {
        Some(file) => {
            let path = Path::new(file);
            let directory = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .ok_or_else(|| PulseError::Internal(format!("invalid log file path: {}", file)))?;
            let appender = tracing_appender::rolling::daily(directory, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(non_blocking), Some(guard), false)
        }
        None => (BoxMakeWriter::new(std::io::stderr), None, config.colors),
    };

    let installed = match config.format.as_str() {
        "json" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            );
            tracing::subscriber::set_global_default(subscriber)
        }
        "compact" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                fmt::layer()
                    .compact()
                    .with_writer(writer)
                    .with_ansi(ansi)
                    .with_target(true),
            );
            tracing::subscriber::set_global_default(subscriber)
        }
        _ => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                fmt::layer()
                    .pretty()
                    .with_writer(writer)
                    .with_ansi(ansi)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            );
            tracing::subscriber::set_global_default(subscriber)
        }
    };
    installed.map_err(|e| PulseError::Internal(format!("Failed to set logger: {}", e)))?;

    info!(
        target: "pulse::init",
        level = %config.level,
        format = %config.format,
        file = config.file.as_deref().unwrap_or("stderr"),
        "Logging initialized"
    );

    Ok(guard)
}

// ----------------------------------------------------------------------------
// 4.2 Logging Macros
// ----------------------------------------------------------------------------

/// Log a delivered alert
#[macro_export]
macro_rules! log_alert {
    ($severity:expr, $alert_type:expr, $message:expr) => {
        tracing::warn!(
            target: "pulse::alerts",
            severity = %$severity,
            alert_type = %$alert_type,
            message = %$message,
            "Alert raised"
        )
    };
    ($severity:expr, $alert_type:expr, $message:expr, $($field:tt)*) => {
        tracing::warn!(
            target: "pulse::alerts",
            severity = %$severity,
            alert_type = %$alert_type,
            message = %$message,
            $($field)*,
            "Alert raised"
        )
    };
}

/// Log an accepted sample
#[macro_export]
macro_rules! log_sample {
    ($metric:expr, $value:expr) => {
        tracing::trace!(
            target: "pulse::ingest",
            metric = %$metric,
            value = $value,
            "Sample accepted"
        )
    };
    ($metric:expr, $value:expr, $($field:tt)*) => {
        tracing::trace!(
            target: "pulse::ingest",
            metric = %$metric,
            value = $value,
            $($field)*,
            "Sample accepted"
        )
    };
}

/// Log a performance measurement
#[macro_export]
macro_rules! log_perf {
    ($operation:expr, $duration_ms:expr) => {
        tracing::trace!(
            target: "pulse::perf",
            operation = $operation,
            duration_ms = $duration_ms,
            "Performance measurement"
        )
    };
    ($operation:expr, $duration_ms:expr, $($field:tt)*) => {
        tracing::trace!(
            target: "pulse::perf",
            operation = $operation,
            duration_ms = $duration_ms,
            $($field)*,
            "Performance measurement"
        )
    };
}

// ----------------------------------------------------------------------------
// 4.3 Performance Timer
// ----------------------------------------------------------------------------

/// Measures an operation and warns when it runs past a threshold
pub struct PerfTimer {
    name: &'static str,
    start: Instant,
    threshold_ms: u64,
}

impl PerfTimer {
    pub fn with_threshold(name: &'static str, threshold_ms: u64) -> Self {
        Self {
            name,
            start: Instant::now(),
            threshold_ms,
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    pub fn elapsed_secs_f64(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    /// Stop the timer, logging if above threshold, and return elapsed milliseconds
    pub fn stop(self) -> u64 {
        let elapsed = self.elapsed_ms();

        if elapsed > self.threshold_ms {
            warn!(
                target: "pulse::perf",
                operation = self.name,
                elapsed_ms = elapsed,
                threshold_ms = self.threshold_ms,
                "Operation exceeded threshold"
            );
        }

        trace!(
            target: "pulse::perf",
            operation = self.name,
            elapsed_ms = elapsed,
            "Operation completed"
        );

        elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("trace", LevelFilter::TRACE)]
    #[test_case("DEBUG", LevelFilter::DEBUG)]
    #[test_case("warning", LevelFilter::WARN)]
    #[test_case("off", LevelFilter::OFF)]
    #[test_case("verbose", LevelFilter::INFO ; "unknown falls back to info")]
    fn test_parse_level(input: &str, expected: LevelFilter) {
        assert_eq!(parse_level(input), expected);
    }

    #[test]
    fn test_perf_timer_reports_elapsed() {
        let timer = PerfTimer::with_threshold("noop", 10_000);
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(timer.elapsed_secs_f64() > 0.0);
        let elapsed = timer.stop();
        assert!(elapsed < 10_000);
    }

    #[test]
    fn test_macros_expand() {
        crate::log_sample!("cpu", 1.0);
        crate::log_perf!("noop", 1u64, metric = "cpu");
        crate::log_alert!(crate::types::Severity::Warning, "cpu.anomaly", "test");
    }
}
