//! The crate's single error type.
//!
//! Every failure carries a stable [`ErrorCode`], which fixes its log severity,
//! its HTTP status hint and whether a retry can help. The message is safe to
//! show to the job seeker; upstream error text goes into a separate diagnostic
//! that only reaches the logs.
//!
//! ```rust,ignore
//! use autoapply_core::error::{ErrorContext, Result};
//!
//! let raw = std::fs::read_to_string(path).context("reading candidate profile")?;
//! ```

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::jobs::JobStatus;

pub type Result<T> = std::result::Result<T, AutoApplyError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Stable, machine-readable failure codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Jobs
    JobNotFound,
    DuplicateJob,
    InvalidStateTransition,
    ConcurrentModification,
    NothingToRefund,
    BatchTooLarge,

    // Records owned by other services
    ConfigNotFound,
    ProfileNotFound,
    PostingNotFound,

    // Ledger
    InsufficientCredits,
    InvalidCreditAmount,
    LedgerInconsistency,

    // Submission
    SubmissionFailed,
    SubmissionTimeout,

    // Persistence
    DatabaseError,
    DatabaseConnectionFailed,
    DatabaseQueryFailed,
    RecordNotFound,
    DuplicateRecord,

    // Payloads
    SerializationError,
    DeserializationError,

    // Collaborators
    ExternalServiceError,
    ExternalServiceUnavailable,
    ExternalTimeout,
    RateLimited,
    NetworkError,

    // Input
    ValidationError,
    InvalidInput,

    // Service configuration
    ConfigurationError,
    MissingConfiguration,
    InvalidConfiguration,

    InternalError,
    Timeout,
}

impl ErrorCode {
    /// Numeric form; the hundreds block names the category.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::JobNotFound => 1000,
            Self::DuplicateJob => 1001,
            Self::InvalidStateTransition => 1002,
            Self::ConcurrentModification => 1003,
            Self::NothingToRefund => 1004,
            Self::BatchTooLarge => 1005,
            Self::ConfigNotFound => 1100,
            Self::ProfileNotFound => 1101,
            Self::PostingNotFound => 1102,
            Self::InsufficientCredits => 1200,
            Self::InvalidCreditAmount => 1201,
            Self::LedgerInconsistency => 1202,
            Self::SubmissionFailed => 1300,
            Self::SubmissionTimeout => 1301,
            Self::DatabaseError => 2000,
            Self::DatabaseConnectionFailed => 2001,
            Self::DatabaseQueryFailed => 2002,
            Self::RecordNotFound => 2003,
            Self::DuplicateRecord => 2004,
            Self::SerializationError => 2100,
            Self::DeserializationError => 2101,
            Self::ExternalServiceError => 3000,
            Self::ExternalServiceUnavailable => 3001,
            Self::ExternalTimeout => 3002,
            Self::RateLimited => 3003,
            Self::NetworkError => 3004,
            Self::ValidationError => 4000,
            Self::InvalidInput => 4001,
            Self::ConfigurationError => 5000,
            Self::MissingConfiguration => 5001,
            Self::InvalidConfiguration => 5002,
            Self::InternalError => 9000,
            Self::Timeout => 9001,
        }
    }

    pub const fn category(&self) -> &'static str {
        match self.numeric_code() / 100 {
            10 => "job",
            11 => "record",
            12 => "ledger",
            13 => "submission",
            20 => "database",
            21 => "serialization",
            30 => "external_service",
            40 => "validation",
            50 => "configuration",
            _ => "internal",
        }
    }

    /// Status a REST layer in front of the pipeline should use.
    pub const fn http_status(&self) -> u16 {
        match self {
            Self::JobNotFound
            | Self::ConfigNotFound
            | Self::ProfileNotFound
            | Self::PostingNotFound
            | Self::RecordNotFound => 404,
            Self::DuplicateJob
            | Self::DuplicateRecord
            | Self::InvalidStateTransition
            | Self::ConcurrentModification
            | Self::NothingToRefund => 409,
            Self::BatchTooLarge
            | Self::InvalidCreditAmount
            | Self::ValidationError
            | Self::InvalidInput
            | Self::InvalidConfiguration => 422,
            Self::InsufficientCredits => 402,
            Self::RateLimited => 429,
            Self::SubmissionTimeout | Self::ExternalTimeout | Self::Timeout => 504,
            Self::ExternalServiceUnavailable | Self::DatabaseConnectionFailed => 503,
            Self::SubmissionFailed | Self::ExternalServiceError | Self::NetworkError => 502,
            _ => 500,
        }
    }

    /// Whether repeating the same call can succeed.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConcurrentModification
                | Self::SubmissionTimeout
                | Self::DatabaseConnectionFailed
                | Self::DatabaseQueryFailed
                | Self::ExternalServiceError
                | Self::ExternalServiceUnavailable
                | Self::ExternalTimeout
                | Self::RateLimited
                | Self::NetworkError
                | Self::Timeout
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// How loudly an error is logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Caller mistakes and expected refusals
    Low,
    /// Lost races, throttling, slow collaborators
    Medium,
    /// Infrastructure trouble
    High,
    /// Money or data may be wrong
    Critical,
}

impl ErrorSeverity {
    pub const fn from_code(code: &ErrorCode) -> Self {
        use ErrorCode::*;
        match code {
            LedgerInconsistency | DatabaseConnectionFailed | InternalError => Self::Critical,
            DatabaseError | DatabaseQueryFailed | SerializationError | DeserializationError
            | ExternalServiceError | ExternalServiceUnavailable | NetworkError | ConfigurationError
            | MissingConfiguration => Self::High,
            ConcurrentModification | SubmissionFailed | SubmissionTimeout | RateLimited | ExternalTimeout
            | Timeout => Self::Medium,
            _ => Self::Low,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Structured data attached to an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,

    /// e.g. `auto_apply_job`, `candidate_profile`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    /// Offending field of a rejected settings update
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_action: Option<String>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(value) = serde_json::to_value(value) {
            self.context.insert(key.into(), value);
        }
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggested_action = Some(suggestion.into());
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// AutoApplyError
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Error, Debug)]
pub struct AutoApplyError {
    code: ErrorCode,
    /// Shown to the job seeker
    message: Cow<'static, str>,
    /// Logs only: upstream error text, offending ids
    diagnostic: Option<String>,
    details: ErrorDetails,
    #[source]
    cause: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for AutoApplyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.diagnostic {
            Some(diagnostic) => write!(f, "[{}] {} ({})", self.code, self.message, diagnostic),
            None => write!(f, "[{}] {}", self.code, self.message),
        }
    }
}

impl AutoApplyError {
    /// Every constructor funnels through here, which counts the error.
    pub fn new(code: ErrorCode, message: impl Into<Cow<'static, str>>) -> Self {
        counter!(
            "autoapply_errors_total",
            "code" => code.to_string(),
            "category" => code.category(),
            "retryable" => code.is_retryable().to_string(),
        )
        .increment(1);

        Self {
            code,
            message: message.into(),
            diagnostic: None,
            details: ErrorDetails::default(),
            cause: None,
        }
    }

    /// Wrap a foreign error: its text becomes the diagnostic, the error itself the source.
    fn wrap<E>(code: ErrorCode, message: &'static str, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::new(code, message).with_diagnostic(cause.to_string()).with_source(cause)
    }

    pub fn internal(diagnostic: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, "Something went wrong on our side").with_diagnostic(diagnostic)
    }

    pub fn validation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    /// A rejected settings field.
    pub fn invalid_field(field: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidConfiguration, format!("{}: {}", field, message.into()))
            .with_details(ErrorDetails::new().with_field(field))
    }

    pub fn with_source<E>(mut self, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    pub fn with_diagnostic(mut self, diagnostic: impl Into<String>) -> Self {
        self.diagnostic = Some(diagnostic.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        self.details = std::mem::take(&mut self.details).with_context(key, value);
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn user_message(&self) -> &str {
        &self.message
    }

    pub fn diagnostic(&self) -> Option<&str> {
        self.diagnostic.as_deref()
    }

    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    pub fn http_status(&self) -> u16 {
        self.code.http_status()
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    /// Emit one event at the level matching the severity.
    pub fn log(&self) {
        let diagnostic = self.diagnostic.as_deref().unwrap_or("");
        match self.severity() {
            ErrorSeverity::Critical => error!(
                code = %self.code,
                category = self.code.category(),
                diagnostic,
                details = ?self.details,
                cause = ?self.cause,
                "{}", self.message
            ),
            ErrorSeverity::High => error!(
                code = %self.code,
                category = self.code.category(),
                diagnostic,
                "{}", self.message
            ),
            ErrorSeverity::Medium => warn!(code = %self.code, diagnostic, "{}", self.message),
            ErrorSeverity::Low => debug!(code = %self.code, "{}", self.message),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Context Extension
// ═══════════════════════════════════════════════════════════════════════════════

/// Turn foreign results and missing options into [`AutoApplyError`]s.
pub trait ErrorContext<T> {
    /// Internal error described by `message`.
    fn context(self, message: impl Into<String>) -> Result<T>;

    fn with_error_code(self, code: ErrorCode) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| AutoApplyError::internal(message).with_source(e))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|e| AutoApplyError::new(code, e.to_string()).with_source(e))
    }
}

impl<T> ErrorContext<T> for Option<T> {
    /// A `None` is a missing record.
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| AutoApplyError::new(ErrorCode::RecordNotFound, format!("{} not found", message.into())))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.ok_or_else(|| AutoApplyError::new(code, "Value missing"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Conversions
// ═══════════════════════════════════════════════════════════════════════════════

impl From<sqlx::Error> for AutoApplyError {
    fn from(e: sqlx::Error) -> Self {
        let code = match &e {
            sqlx::Error::RowNotFound => ErrorCode::RecordNotFound,
            sqlx::Error::Database(db) if db.is_unique_violation() => ErrorCode::DuplicateRecord,
            sqlx::Error::Database(_) => ErrorCode::DatabaseQueryFailed,
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                ErrorCode::DatabaseConnectionFailed
            }
            _ => ErrorCode::DatabaseError,
        };
        Self::wrap(code, "Job storage is unavailable", e)
    }
}

impl From<sqlx::migrate::MigrateError> for AutoApplyError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        Self::wrap(ErrorCode::DatabaseError, "Schema migration failed", e)
    }
}

impl From<serde_json::Error> for AutoApplyError {
    fn from(e: serde_json::Error) -> Self {
        let code = if e.is_io() {
            ErrorCode::SerializationError
        } else {
            ErrorCode::DeserializationError
        };
        Self::wrap(code, "Malformed JSON payload", e)
    }
}

impl From<reqwest::Error> for AutoApplyError {
    fn from(e: reqwest::Error) -> Self {
        let code = if e.is_timeout() {
            ErrorCode::ExternalTimeout
        } else if e.is_connect() {
            ErrorCode::NetworkError
        } else {
            match e.status().map(|s| s.as_u16()) {
                Some(404) => ErrorCode::RecordNotFound,
                Some(429) => ErrorCode::RateLimited,
                Some(500..=599) => ErrorCode::ExternalServiceUnavailable,
                Some(_) => ErrorCode::ExternalServiceError,
                None => ErrorCode::NetworkError,
            }
        };
        Self::wrap(code, "A platform service call failed", e)
    }
}

impl From<tokio::sync::AcquireError> for AutoApplyError {
    fn from(e: tokio::sync::AcquireError) -> Self {
        Self::wrap(ErrorCode::InternalError, "Worker pool is shut down", e)
    }
}

impl From<tokio::time::error::Elapsed> for AutoApplyError {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Self::new(ErrorCode::Timeout, "Operation timed out").with_source(e)
    }
}

impl From<std::io::Error> for AutoApplyError {
    fn from(e: std::io::Error) -> Self {
        let code = match e.kind() {
            std::io::ErrorKind::NotFound => ErrorCode::RecordNotFound,
            std::io::ErrorKind::TimedOut => ErrorCode::Timeout,
            _ => ErrorCode::InternalError,
        };
        Self::wrap(code, "I/O failure", e)
    }
}

impl From<anyhow::Error> for AutoApplyError {
    fn from(e: anyhow::Error) -> Self {
        e.downcast::<AutoApplyError>()
            .unwrap_or_else(|other| Self::internal(format!("{:#}", other)))
    }
}

impl From<config::ConfigError> for AutoApplyError {
    fn from(e: config::ConfigError) -> Self {
        let code = match &e {
            config::ConfigError::NotFound(_) => ErrorCode::MissingConfiguration,
            config::ConfigError::FileParse { .. } | config::ConfigError::Type { .. } => {
                ErrorCode::InvalidConfiguration
            }
            _ => ErrorCode::ConfigurationError,
        };
        Self::wrap(code, "Service configuration could not be loaded", e)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Domain Constructors
// ═══════════════════════════════════════════════════════════════════════════════

impl AutoApplyError {
    pub fn job_not_found(job_id: Uuid) -> Self {
        Self::new(ErrorCode::JobNotFound, format!("Auto-apply job not found: {}", job_id))
            .with_details(ErrorDetails::new().with_entity("auto_apply_job", job_id.to_string()))
    }

    /// The (user, posting) pair already has a queued, processing or applied job.
    pub fn duplicate_job(user_id: &str, posting_id: &str) -> Self {
        Self::new(
            ErrorCode::DuplicateJob,
            format!("Posting {} is already queued or applied", posting_id),
        )
        .with_context("user_id", user_id)
        .with_context("posting_id", posting_id)
    }

    pub fn invalid_state_transition(from: JobStatus, to: JobStatus) -> Self {
        Self::new(
            ErrorCode::InvalidStateTransition,
            format!("Job cannot move from {} to {}", from, to),
        )
        .with_context("from_state", from.as_str())
        .with_context("to_state", to.as_str())
    }

    pub fn concurrent_modification(entity_type: &str, entity_id: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::ConcurrentModification,
            format!("{} {} changed underneath us", entity_type, entity_id),
        )
        .with_details(ErrorDetails::new().with_entity(entity_type, entity_id.to_string()))
    }

    pub fn nothing_to_refund(job_id: Uuid) -> Self {
        Self::new(ErrorCode::NothingToRefund, format!("Job {} holds no refundable credits", job_id))
            .with_details(ErrorDetails::new().with_entity("auto_apply_job", job_id.to_string()))
    }

    pub fn batch_too_large(size: usize, max: usize) -> Self {
        Self::new(
            ErrorCode::BatchTooLarge,
            format!("Batch of {} postings exceeds the limit of {}", size, max),
        )
        .with_context("size", size)
        .with_context("max", max)
    }

    pub fn config_not_found(user_id: &str) -> Self {
        Self::new(
            ErrorCode::ConfigNotFound,
            format!("Auto-apply is not configured for user {}", user_id),
        )
        .with_details(ErrorDetails::new().with_entity("auto_apply_config", user_id))
    }

    pub fn profile_not_found(user_id: &str) -> Self {
        Self::new(
            ErrorCode::ProfileNotFound,
            format!("No candidate profile for user {}", user_id),
        )
        .with_details(ErrorDetails::new().with_entity("candidate_profile", user_id))
    }

    pub fn posting_not_found(posting_id: &str) -> Self {
        Self::new(ErrorCode::PostingNotFound, format!("Unknown job posting: {}", posting_id))
            .with_details(ErrorDetails::new().with_entity("job_posting", posting_id))
    }

    pub fn insufficient_credits(balance: i64, requested: i64) -> Self {
        Self::new(
            ErrorCode::InsufficientCredits,
            format!("Not enough credits: balance {}, needed {}", balance, requested),
        )
        .with_details(
            ErrorDetails::new()
                .with_context("balance", balance)
                .with_context("requested", requested)
                .with_suggestion("Top up credits or upgrade the plan"),
        )
    }

    pub fn invalid_credit_amount(amount: i64) -> Self {
        Self::new(
            ErrorCode::InvalidCreditAmount,
            format!("Credit amount must be positive, got {}", amount),
        )
        .with_context("amount", amount)
    }

    pub fn ledger_inconsistency(message: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::LedgerInconsistency,
            "Credit history does not add up to the wallet balance",
        )
        .with_diagnostic(message)
    }

    pub fn external_service(service: &str, message: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::ExternalServiceError,
            format!("{} error: {}", service, message.into()),
        )
        .with_context("service", service)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConfigurationError, message.into())
    }
}
