//! Service configuration.
//!
//! Loaded from an optional file plus `AUTOAPPLY__*` environment variables,
//! e.g. `AUTOAPPLY__DISPATCHER__INTERVAL=5m` or `AUTOAPPLY__BILLING__CHARGE_POLICY=on_dispatch`.

use crate::error::Result;
use crate::telemetry::TelemetryConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Environment variable prefix for every setting.
pub const ENV_PREFIX: &str = "AUTOAPPLY";

/// Main service configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Database configuration. When absent the in-memory store is used.
    #[serde(default)]
    pub database: Option<DatabaseConfig>,

    /// Dispatcher configuration
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// Worker pool configuration
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Retention sweep configuration
    #[serde(default)]
    pub retention: RetentionConfig,

    /// Credit charging configuration
    #[serde(default)]
    pub billing: BillingConfig,

    /// External collaborator endpoints
    #[serde(default)]
    pub collaborators: CollaboratorConfig,

    /// Logging and metrics
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection acquire timeout
    #[serde(default = "default_acquire_timeout", with = "humantime_serde")]
    pub acquire_timeout: Duration,

    /// Run embedded migrations on startup
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatcherConfig {
    /// Time between dispatch cycles
    #[serde(default = "default_dispatch_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Maximum records claimed per cycle
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Upper bound on queued records read per cycle while looking for claimable ones
    #[serde(default = "default_scan_limit")]
    pub scan_limit: usize,

    /// Records left in `processing` longer than this are reclaimed as timeouts
    #[serde(default = "default_stale_after", with = "humantime_serde")]
    pub stale_after: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            interval: default_dispatch_interval(),
            batch_size: default_batch_size(),
            scan_limit: default_scan_limit(),
            stale_after: default_stale_after(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Maximum concurrent submissions
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Upper bound on a single submission attempt
    #[serde(default = "default_attempt_timeout", with = "humantime_serde")]
    pub attempt_timeout: Duration,

    /// Attempts allowed before a job is terminally failed
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            attempt_timeout: default_attempt_timeout(),
            max_attempts: default_max_attempts(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    /// Terminal records older than this are purged
    #[serde(default = "default_retention_period", with = "humantime_serde")]
    pub period: Duration,

    /// Time between retention sweeps
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            period: default_retention_period(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

/// When credits are taken from the wallet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargePolicy {
    /// Debit once the submission succeeded. Retries are never charged.
    #[default]
    OnSuccess,
    /// Debit speculatively when a job enters processing, refund on terminal failure.
    OnDispatch,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BillingConfig {
    /// Credits charged per successful application
    #[serde(default = "default_credit_cost")]
    pub credit_cost: i64,

    /// Debit timing
    #[serde(default)]
    pub charge_policy: ChargePolicy,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            credit_cost: default_credit_cost(),
            charge_policy: ChargePolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CollaboratorConfig {
    /// Base URL of the platform's internal API (profiles, catalog, submission, notifications)
    pub platform_url: Option<String>,

    /// Base URL of the semantic similarity service
    pub similarity_url: Option<String>,

    /// Bearer token for internal calls
    pub api_token: Option<String>,

    /// Per-request timeout for collaborator calls
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for CollaboratorConfig {
    fn default() -> Self {
        Self {
            platform_url: None,
            similarity_url: None,
            api_token: None,
            request_timeout: default_request_timeout(),
        }
    }
}

// Default value functions
fn default_max_connections() -> u32 { 20 }
fn default_min_connections() -> u32 { 2 }
fn default_acquire_timeout() -> Duration { Duration::from_secs(5) }
fn default_run_migrations() -> bool { true }
fn default_dispatch_interval() -> Duration { Duration::from_secs(300) }
fn default_batch_size() -> usize { 100 }
fn default_scan_limit() -> usize { 5_000 }
fn default_stale_after() -> Duration { Duration::from_secs(15 * 60) }
fn default_concurrency() -> usize { 8 }
fn default_attempt_timeout() -> Duration { Duration::from_secs(120) }
fn default_max_attempts() -> u32 { 3 }
fn default_retention_period() -> Duration { Duration::from_secs(30 * 24 * 3600) }
fn default_sweep_interval() -> Duration { Duration::from_secs(3600) }
fn default_credit_cost() -> i64 { 1 }
fn default_request_timeout() -> Duration { Duration::from_secs(30) }

impl Config {
    /// Load configuration from the environment.
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with environment overrides.
    pub fn from_file(path: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        use crate::error::AutoApplyError;

        if self.dispatcher.batch_size == 0 {
            return Err(AutoApplyError::invalid_field("dispatcher.batch_size", "must be at least 1"));
        }
        if self.dispatcher.scan_limit < self.dispatcher.batch_size {
            return Err(AutoApplyError::invalid_field(
                "dispatcher.scan_limit",
                "must be at least dispatcher.batch_size",
            ));
        }
        if self.dispatcher.interval.is_zero() {
            return Err(AutoApplyError::invalid_field("dispatcher.interval", "must be non-zero"));
        }
        if self.worker.concurrency == 0 {
            return Err(AutoApplyError::invalid_field("worker.concurrency", "must be at least 1"));
        }
        if self.worker.max_attempts == 0 {
            return Err(AutoApplyError::invalid_field("worker.max_attempts", "must be at least 1"));
        }
        if self.billing.credit_cost <= 0 {
            return Err(AutoApplyError::invalid_field("billing.credit_cost", "must be positive"));
        }
        Ok(())
    }
}
