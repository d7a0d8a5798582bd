//! Logging and metrics bootstrap for the server binary.

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogFormat, LoggingConfig, RedactionConfig, SensitiveFieldRedactor};
pub use metrics::{init_metrics, MetricsConfig, OperationTimer, PipelineMetrics};

use serde::Deserialize;

/// The `telemetry` section of the service configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// `service` label on every metric series
    pub service_name: String,
    /// `development` switches JSON logs to pretty output
    pub environment: String,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: env!("CARGO_PKG_NAME").to_string(),
            environment: std::env::var("AUTOAPPLY_ENVIRONMENT").unwrap_or_else(|_| "development".into()),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

/// Logging first, so the metrics exporter can report its own startup.
pub fn init_telemetry(config: &TelemetryConfig) -> anyhow::Result<()> {
    init_logging(&config.logging, &config.environment)?;
    init_metrics(&config.metrics, &config.service_name)
}
