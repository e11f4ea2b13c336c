//! Structured logging and tracing configuration

use anyhow::Result;
use std::io;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use super::MonitoringConfig;

/// Guard that flushes the file writer when dropped
pub struct TracingGuard {
    _file_guard: Option<non_blocking::WorkerGuard>,
}

impl TracingGuard {
    fn new(file_guard: Option<non_blocking::WorkerGuard>) -> Self {
        Self { _file_guard: file_guard }
    }

    /// Whether log lines are also written to a rolling file.
    pub fn has_file_output(&self) -> bool {
        self._file_guard.is_some()
    }
}

/// Initialize structured logging.
///
/// `RUST_LOG` takes precedence over `config.log_level`. Fails if a global
/// subscriber is already installed.
pub fn init_tracing(config: &MonitoringConfig) -> Result<TracingGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let console_layer = match config.log_format.as_str() {
        "compact" => fmt::layer().compact().with_target(true).with_writer(io::stdout).boxed(),
        _ => fmt::layer()
            .with_span_events(FmtSpan::CLOSE)
            .with_thread_names(true)
            .with_target(true)
            .with_writer(io::stdout)
            .boxed(),
    };

    // File output layer with rotation
    let (file_layer, file_guard) = match &config.log_dir {
        Some(dir) => {
            let file_appender = rolling::daily(dir, "dynbatch.log");
            let (file_writer, guard) = non_blocking(file_appender);
            let layer = fmt::layer()
                .with_ansi(false)
                .with_thread_ids(true)
                .with_target(true)
                .with_writer(file_writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    tracing::info!(
        log_level = %config.log_level,
        log_format = %config.log_format,
        log_dir = config.log_dir.as_deref().unwrap_or("-"),
        "Tracing initialized"
    );

    Ok(TracingGuard::new(file_guard))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_with_file_output_only_once() {
        let dir = tempfile::tempdir().unwrap();
        let config = MonitoringConfig {
            log_format: "compact".to_string(),
            log_dir: Some(dir.path().to_string_lossy().into_owned()),
            ..MonitoringConfig::default()
        };

        let guard = init_tracing(&config).unwrap();
        assert!(guard.has_file_output());

        // A global subscriber is already installed.
        assert!(init_tracing(&MonitoringConfig::default()).is_err());
    }
}
