//! Logging and metrics for the batching scheduler

use serde::{Deserialize, Serialize};

pub mod metrics;
pub mod tracing;

pub use self::metrics::{MetricsReporter, MetricsSink};
pub use self::tracing::{TracingGuard, init_tracing};

/// Monitoring configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Filter directive used when `RUST_LOG` is not set.
    pub log_level: String,
    /// Console output format: `full` or `compact`.
    pub log_format: String,
    /// Directory for daily-rotated log files; console only when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<String>,
    /// Whether scheduler events are forwarded to the `metrics` facade.
    /// Nothing is recorded unless the host process installs a recorder.
    pub metrics_enabled: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "full".to_string(),
            log_dir: None,
            metrics_enabled: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: MonitoringConfig = toml::from_str("log_level = \"debug\"").unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.log_format, "full");
        assert!(config.log_dir.is_none());
        assert!(config.metrics_enabled);
    }
}
