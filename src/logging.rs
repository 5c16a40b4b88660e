// ============================================================================
// LOGGING & TRACING
// ============================================================================
// Structured logging with json/compact/pretty output, an EnvFilter honouring
// RUST_LOG and a small timer for slow operations.
// ============================================================================

use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{info, trace, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter};

use crate::error::{ObserveError, ObserveResult};

// ----------------------------------------------------------------------------
// 1. Configuration
// ----------------------------------------------------------------------------

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "compact".into()
}

fn default_true() -> bool {
    true
}

fn level_filter(level: &str) -> tracing::level_filters::LevelFilter {
    match level.to_lowercase().as_str() {
        "trace" => tracing::level_filters::LevelFilter::TRACE,
        "debug" => tracing::level_filters::LevelFilter::DEBUG,
        "warn" | "warning" => tracing::level_filters::LevelFilter::WARN,
        "error" => tracing::level_filters::LevelFilter::ERROR,
        _ => tracing::level_filters::LevelFilter::INFO,
    }
}

// ----------------------------------------------------------------------------
// 2. Logger initialization
// ----------------------------------------------------------------------------

/// Initialize the global subscriber based on configuration
pub fn init_logging(config: &LoggingConfig) -> ObserveResult<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter(&config.level).into())
        .from_env_lossy();

    let res = match config.format.as_str() {
        "json" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            );
            tracing::subscriber::set_global_default(subscriber)
        }
        "pretty" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                fmt::layer()
                    .pretty()
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            );
            tracing::subscriber::set_global_default(subscriber)
        }
        _ => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                fmt::layer()
                    .compact()
                    .with_ansi(config.colors)
                    .with_target(true),
            );
            tracing::subscriber::set_global_default(subscriber)
        }
    };
    res.map_err(|e| ObserveError::Internal(format!("Failed to set logger: {}", e)))?;

    info!(
        target: "cerebro::init",
        level = %config.level,
        format = %config.format,
        "Logging initialized"
    );
    Ok(())
}

// ----------------------------------------------------------------------------
// 3. Performance timer
// ----------------------------------------------------------------------------

/// Measures an operation and warns when it exceeds a threshold
pub struct PerfTimer {
    name: &'static str,
    start: Instant,
    threshold_ms: Option<u64>,
}

impl PerfTimer {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            start: Instant::now(),
            threshold_ms: None,
        }
    }

    pub fn with_threshold(name: &'static str, threshold_ms: u64) -> Self {
        Self {
            name,
            start: Instant::now(),
            threshold_ms: Some(threshold_ms),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }

    /// Stop the timer and log if above threshold
    pub fn stop(self) -> u64 {
        let elapsed = self.elapsed_ms();
        if let Some(threshold) = self.threshold_ms {
            if elapsed > threshold {
                warn!(
                    target: "cerebro::perf",
                    operation = self.name,
                    elapsed_ms = elapsed,
                    threshold_ms = threshold,
                    "Operation exceeded threshold"
                );
            }
        }
        trace!(
            target: "cerebro::perf",
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

    #[test_case("trace", tracing::level_filters::LevelFilter::TRACE)]
    #[test_case("DEBUG", tracing::level_filters::LevelFilter::DEBUG)]
    #[test_case("warning", tracing::level_filters::LevelFilter::WARN)]
    #[test_case("bogus", tracing::level_filters::LevelFilter::INFO)]
    fn test_level_filter(level: &str, expected: tracing::level_filters::LevelFilter) {
        assert_eq!(level_filter(level), expected);
    }

    #[test]
    fn test_perf_timer() {
        let timer = PerfTimer::with_threshold("noop", 10_000);
        assert!(timer.stop() < 10_000);
    }

    #[test]
    fn test_config_defaults_from_empty_toml() {
        let config: LoggingConfig = toml::from_str("").unwrap();
        assert_eq!(config.level, "info");
        assert_eq!(config.format, "compact");
        assert!(config.colors);
    }
}
