//! Prometheus export of pipeline counters.
//!
//! Call sites never spell metric names; they go through [`PipelineMetrics`].
//!
//! ```rust,no_run
//! use autoapply_core::telemetry::metrics::PipelineMetrics;
//!
//! PipelineMetrics::record_skipped("daily_limit");
//! PipelineMetrics::record_submission(0.42, true);
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

const ADMISSIONS: &str = "autoapply_admissions_total";
const ENQUEUED: &str = "autoapply_jobs_enqueued_total";
const DISPATCHED: &str = "autoapply_jobs_dispatched_total";
const SKIPPED: &str = "autoapply_jobs_skipped_total";
const OUTCOMES: &str = "autoapply_job_outcomes_total";
const CREDITS: &str = "autoapply_credit_movements_total";
const PURGED: &str = "autoapply_jobs_purged_total";
const SUBMISSION_SECONDS: &str = "autoapply_submission_duration_seconds";
const OPERATION_SECONDS: &str = "autoapply_operation_duration_seconds";
const QUEUE_DEPTH: &str = "autoapply_queue_depth";
const WORKERS_BUSY: &str = "autoapply_workers_busy";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    /// Scrape listener; without one the recorder is installed but nothing is served
    pub listen_addr: Option<SocketAddr>,
    /// Histogram buckets, in seconds
    pub buckets: Vec<f64>,
    /// Added to every series
    pub labels: BTreeMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: Some(SocketAddr::from(([0, 0, 0, 0], 9090))),
            // Job boards can take a minute to accept an application.
            buckets: vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0],
            labels: BTreeMap::new(),
        }
    }
}

/// Install the Prometheus recorder. Needs a running Tokio runtime when a
/// listener is configured.
pub fn init_metrics(config: &MetricsConfig, service_name: &str) -> anyhow::Result<()> {
    if !config.enabled {
        tracing::info!("Metrics disabled");
        return Ok(());
    }

    let builder = config
        .labels
        .iter()
        .fold(PrometheusBuilder::new().add_global_label("service", service_name), |b, (k, v)| {
            b.add_global_label(k, v)
        })
        .set_buckets(&config.buckets)?;

    match config.listen_addr {
        Some(addr) => builder.with_http_listener(addr).install()?,
        None => {
            builder.install_recorder()?;
        }
    }

    describe();
    tracing::info!(service = %service_name, listen_addr = ?config.listen_addr, "Metrics exporter installed");
    Ok(())
}

fn describe() {
    describe_counter!("autoapply_errors_total", "Errors raised, by code and category");
    describe_counter!(ADMISSIONS, "Scored postings, by admission result and reject reason");
    describe_counter!(ENQUEUED, "Jobs created");
    describe_counter!(DISPATCHED, "Jobs claimed into processing");
    describe_counter!(SKIPPED, "Queued jobs a dispatch cycle left alone, by reason");
    describe_counter!(OUTCOMES, "Job results, by status and error type");
    describe_counter!(CREDITS, "Credits moved, by credit type and ledger operation");
    describe_counter!(PURGED, "Terminal jobs deleted by retention");
    describe_histogram!(SUBMISSION_SECONDS, "Submission collaborator latency");
    describe_histogram!(OPERATION_SECONDS, "Pipeline operation duration");
    describe_gauge!(QUEUE_DEPTH, "Queued jobs at the last dispatch cycle");
    describe_gauge!(WORKERS_BUSY, "Submissions in flight");
}

/// Recorders for every pipeline metric.
pub struct PipelineMetrics;

impl PipelineMetrics {
    pub fn record_admission(eligible: bool, reason: Option<&str>) {
        let reason = reason.unwrap_or("none").to_string();
        counter!(ADMISSIONS, "eligible" => eligible.to_string(), "reason" => reason).increment(1);
    }

    pub fn record_enqueued(count: u64) {
        counter!(ENQUEUED).increment(count);
    }

    pub fn record_dispatched(count: u64) {
        counter!(DISPATCHED).increment(count);
    }

    pub fn record_skipped(reason: &str) {
        counter!(SKIPPED, "reason" => reason.to_string()).increment(1);
    }

    /// `status` is where the job ended up after a worker run, cancel or refund.
    pub fn record_outcome(status: &str, error_type: Option<&str>) {
        let error_type = error_type.unwrap_or("none").to_string();
        counter!(OUTCOMES, "status" => status.to_string(), "error_type" => error_type).increment(1);
    }

    /// Counts credits, not entries; the sign of `amount` is ignored.
    pub fn record_credit_movement(credit_type: &str, operation: &str, amount: i64) {
        counter!(CREDITS, "credit_type" => credit_type.to_string(), "operation" => operation.to_string())
            .increment(amount.unsigned_abs());
    }

    pub fn record_submission(seconds: f64, accepted: bool) {
        histogram!(SUBMISSION_SECONDS, "success" => accepted.to_string()).record(seconds);
    }

    pub fn record_purged(count: u64) {
        counter!(PURGED).increment(count);
    }

    pub fn set_queue_depth(depth: usize) {
        gauge!(QUEUE_DEPTH).set(depth as f64);
    }

    pub fn worker_started() {
        gauge!(WORKERS_BUSY).increment(1.0);
    }

    pub fn worker_finished() {
        gauge!(WORKERS_BUSY).decrement(1.0);
    }
}

/// Records into the operation histogram on [`OperationTimer::finish`].
#[must_use]
pub struct OperationTimer {
    operation: &'static str,
    started: Instant,
}

impl OperationTimer {
    pub fn start(operation: &'static str) -> Self {
        Self {
            operation,
            started: Instant::now(),
        }
    }

    pub fn finish(self) -> Duration {
        let elapsed = self.started.elapsed();
        histogram!(OPERATION_SECONDS, "operation" => self.operation).record(elapsed.as_secs_f64());
        elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_buckets_ascend() {
        let config = MetricsConfig::default();
        assert!(config.enabled);
        assert_eq!(config.listen_addr.map(|a| a.port()), Some(9090));
        assert!(config.buckets.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_listener_can_be_turned_off() {
        let config: MetricsConfig =
            serde_json::from_value(serde_json::json!({ "listen_addr": null })).unwrap();
        assert!(config.listen_addr.is_none());
        assert!(!config.buckets.is_empty());
    }

    #[test]
    fn test_recording_without_exporter_is_a_noop() {
        PipelineMetrics::record_admission(false, Some("fit_score_below_minimum"));
        PipelineMetrics::record_credit_movement("auto_apply", "deduct", -1);
        PipelineMetrics::set_queue_depth(3);
        PipelineMetrics::worker_started();
        PipelineMetrics::worker_finished();
    }

    #[test]
    fn test_operation_timer() {
        let timer = OperationTimer::start("dispatch_cycle");
        std::thread::sleep(Duration::from_millis(5));
        assert!(timer.finish() >= Duration::from_millis(5));
    }
}
