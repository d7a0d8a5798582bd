//! The auto-apply job record and its state machine.
//!
//! ```text
//!   queued ──► processing ──► applied ──► refunded
//!     │  ▲          │  │                     ▲
//!     │  └─ failed ◄┘  └──► cancelled        │
//!     │       └──────────────────────────────┘
//!     └──► cancelled
//! ```
//!
//! `failed → queued` is only legal while attempts remain. `refunded` and
//! `cancelled` are absorbing. Every `mark_*` method validates its edge and
//! returns [`AutoApplyError::invalid_state_transition`] otherwise; persisting
//! the change is the store's compare-and-set on `version`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{AutoApplyError, Result};

/// Default number of submission attempts per job.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

// ═══════════════════════════════════════════════════════════════════════════════
// Job Status
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a dispatch cycle
    Queued,
    /// Claimed by a dispatcher; exactly one submission may be in flight
    Processing,
    Applied,
    /// Out of attempts or failed with a non-retryable error
    Failed,
    /// Credits returned; absorbing
    Refunded,
    /// Withdrawn by the user; absorbing
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Queued,
        JobStatus::Processing,
        JobStatus::Applied,
        JobStatus::Failed,
        JobStatus::Refunded,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Applied => "applied",
            Self::Failed => "failed",
            Self::Refunded => "refunded",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether the job reached an outcome. Only `failed` may still be re-queued.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Queued | Self::Processing)
    }

    /// Statuses that block enqueueing the same posting again.
    pub fn blocks_duplicate(&self) -> bool {
        matches!(self, Self::Queued | Self::Processing | Self::Applied)
    }

    /// Edge check, ignoring the attempt budget (see [`AutoApplyJob::mark_requeued`]).
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Processing)
                | (Queued, Cancelled)
                | (Processing, Applied)
                | (Processing, Failed)
                | (Processing, Cancelled)
                | (Failed, Queued)
                | (Failed, Refunded)
                | (Applied, Refunded)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = AutoApplyError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| AutoApplyError::validation(format!("Unknown job status: {}", s)))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Classification
// ═══════════════════════════════════════════════════════════════════════════════

/// Classification of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    /// Bad application data, or insufficient credits
    Validation,
    Network,
    RateLimit,
    Timeout,
    /// The board refused automated submission
    TosViolation,
    /// The posting was closed or removed
    JobClosed,
    Unknown,
}

impl ErrorType {
    pub const ALL: [ErrorType; 7] = [
        ErrorType::Validation,
        ErrorType::Network,
        ErrorType::RateLimit,
        ErrorType::Timeout,
        ErrorType::TosViolation,
        ErrorType::JobClosed,
        ErrorType::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Network => "network",
            Self::RateLimit => "rate_limit",
            Self::Timeout => "timeout",
            Self::TosViolation => "tos_violation",
            Self::JobClosed => "job_closed",
            Self::Unknown => "unknown",
        }
    }

    /// Transient errors consume the retry budget; the rest fail immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network | Self::RateLimit | Self::Timeout | Self::Unknown)
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorType {
    type Err = AutoApplyError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| AutoApplyError::validation(format!("Unknown error type: {}", s)))
    }
}

/// What a recorded failure did to the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Back in the queue for the next cycle
    Requeued,
    /// Terminally failed; credits may need refunding
    Failed,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Auto-Apply Job
// ═══════════════════════════════════════════════════════════════════════════════

/// One admitted (user, posting) pair and everything that happened to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoApplyJob {
    pub id: Uuid,
    pub user_id: String,
    /// Posting id in the job catalog
    pub job_id: String,
    pub status: JobStatus,
    /// Higher runs first; defaults to the fit score
    pub priority: i32,
    pub fit_score: u32,
    /// Credits currently charged for this job
    pub credits_used: i64,
    pub credits_refunded: bool,
    pub attempts: u32,
    pub max_attempts: u32,
    pub error_type: Option<ErrorType>,
    pub error_message: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    /// Required before dispatch in apply-assist mode
    pub user_approved: bool,
    /// Reference returned by the submission collaborator
    pub application_reference: Option<String>,
    pub refund_reason: Option<String>,
    /// Optimistic concurrency token, bumped by every store write
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl AutoApplyJob {
    pub fn new(user_id: impl Into<String>, job_id: impl Into<String>, fit_score: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            job_id: job_id.into(),
            status: JobStatus::Queued,
            priority: fit_score as i32,
            fit_score,
            credits_used: 0,
            credits_refunded: false,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            error_type: None,
            error_message: None,
            last_error_at: None,
            user_approved: false,
            application_reference: None,
            refund_reason: None,
            version: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn approved(mut self, approved: bool) -> Self {
        self.user_approved = approved;
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Transitions
    // ─────────────────────────────────────────────────────────────────────────

    fn transition(&mut self, next: JobStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(AutoApplyError::invalid_state_transition(self.status, next));
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// `queued → processing`, stamping `started_at`.
    pub fn mark_processing(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobStatus::Processing, now)?;
        self.started_at = Some(now);
        Ok(())
    }

    /// `processing → applied`.
    pub fn mark_applied(&mut self, reference: Option<String>, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobStatus::Applied, now)?;
        self.application_reference = reference;
        self.completed_at = Some(now);
        self.error_type = None;
        self.error_message = None;
        Ok(())
    }

    /// Record a failed attempt on a processing job.
    ///
    /// Moves to `failed`, then straight back to `queued` when the error is
    /// retryable and attempts remain. Priority is left unchanged.
    pub fn record_failure(
        &mut self,
        error_type: ErrorType,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<FailureDisposition> {
        self.transition(JobStatus::Failed, now)?;
        self.attempts += 1;
        self.error_type = Some(error_type);
        self.error_message = Some(message.into());
        self.last_error_at = Some(now);

        if error_type.is_retryable() && self.attempts < self.max_attempts {
            self.mark_requeued(now)?;
            return Ok(FailureDisposition::Requeued);
        }

        self.completed_at = Some(now);
        Ok(FailureDisposition::Failed)
    }

    /// `failed → queued`, only while the attempt budget allows it.
    pub fn mark_requeued(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.attempts >= self.max_attempts {
            return Err(AutoApplyError::invalid_state_transition(self.status, JobStatus::Queued)
                .with_context("attempts", self.attempts)
                .with_context("max_attempts", self.max_attempts));
        }
        self.transition(JobStatus::Queued, now)?;
        self.started_at = None;
        Ok(())
    }

    /// `failed | applied → refunded`, after the ledger refund was appended.
    pub fn mark_refunded(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobStatus::Refunded, now)?;
        self.credits_refunded = true;
        self.refund_reason = Some(reason.into());
        Ok(())
    }

    /// `queued | processing → cancelled`.
    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobStatus::Cancelled, now)?;
        self.completed_at = Some(now);
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    /// Credits were taken and not yet given back.
    pub fn has_refundable_credits(&self) -> bool {
        self.credits_used > 0 && !self.credits_refunded
    }

    pub fn can_retry(&self) -> bool {
        self.status == JobStatus::Failed && self.attempts < self.max_attempts
    }

    /// Ledger reference used for every charge and refund of this job.
    pub fn ledger_reference(&self) -> String {
        self.id.to_string()
    }

    /// Time spent processing, if finished.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processing_job() -> AutoApplyJob {
        let now = Utc::now();
        let mut job = AutoApplyJob::new("u-1", "posting-1", 80, now);
        job.mark_processing(now).unwrap();
        job
    }

    #[test]
    fn test_transition_table() {
        use JobStatus::*;
        let allowed = [
            (Queued, Processing),
            (Queued, Cancelled),
            (Processing, Applied),
            (Processing, Failed),
            (Processing, Cancelled),
            (Failed, Queued),
            (Failed, Refunded),
            (Applied, Refunded),
        ];
        for from in JobStatus::ALL {
            for to in JobStatus::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_new_job_defaults() {
        let job = AutoApplyJob::new("u-1", "posting-1", 72, Utc::now());
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.priority, 72);
        assert_eq!(job.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(job.credits_used, 0);
        assert!(!job.user_approved);
    }

    #[test]
    fn test_processing_stamps_started_at() {
        let job = processing_job();
        assert_eq!(job.status, JobStatus::Processing);
        assert!(job.started_at.is_some());
    }

    #[test]
    fn test_retryable_failure_requeues_until_budget_spent() {
        let mut job = processing_job().with_priority(55);

        for attempt in 1..=2 {
            let disposition = job.record_failure(ErrorType::Network, "connection reset", Utc::now()).unwrap();
            assert_eq!(disposition, FailureDisposition::Requeued);
            assert_eq!(job.status, JobStatus::Queued);
            assert_eq!(job.attempts, attempt);
            assert_eq!(job.priority, 55);
            job.mark_processing(Utc::now()).unwrap();
        }

        let disposition = job.record_failure(ErrorType::RateLimit, "429", Utc::now()).unwrap();
        assert_eq!(disposition, FailureDisposition::Failed);
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 3);
        assert!(job.mark_requeued(Utc::now()).is_err());
    }

    #[test]
    fn test_non_retryable_failure_skips_budget() {
        let mut job = processing_job();
        let disposition = job
            .record_failure(ErrorType::TosViolation, "automation blocked", Utc::now())
            .unwrap();
        assert_eq!(disposition, FailureDisposition::Failed);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.error_type, Some(ErrorType::TosViolation));
        assert!(job.last_error_at.is_some());
    }

    #[test]
    fn test_absorbing_states() {
        let mut job = processing_job();
        job.mark_cancelled(Utc::now()).unwrap();
        let err = job.mark_processing(Utc::now()).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::InvalidStateTransition);
        assert!(job.mark_refunded("late", Utc::now()).is_err());
    }

    #[test]
    fn test_applied_can_only_be_refunded() {
        let mut job = processing_job();
        job.mark_applied(Some("app-9".into()), Utc::now()).unwrap();
        assert!(job.mark_cancelled(Utc::now()).is_err());
        job.credits_used = 1;
        job.mark_refunded("duplicate application", Utc::now()).unwrap();
        assert!(job.credits_refunded);
        assert_eq!(job.status, JobStatus::Refunded);
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("done".parse::<JobStatus>().is_err());
    }
}
