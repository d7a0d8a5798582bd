//! External systems the pipeline talks to.
//!
//! Each collaborator is an `async_trait` object so the pipeline can run
//! against the platform's HTTP API ([`http`]) or in-process doubles
//! ([`memory`]).

pub mod http;
pub mod memory;

pub use http::{HttpSimilarityModel, PlatformClient};
pub use memory::{
    InMemoryCollaborators, RecordingNotifier, ScriptedOutcome, ScriptedSubmitter, StaticCatalog,
    StaticDirectory, StaticSimilarity, VecRecorder,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::Result;
use crate::jobs::{AutoApplyJob, ErrorType};
use crate::models::{CandidateProfile, JobPosting};
use crate::telemetry::SensitiveFieldRedactor;

// ═══════════════════════════════════════════════════════════════════════════════
// Read-only Sources
// ═══════════════════════════════════════════════════════════════════════════════

#[async_trait]
pub trait ProfileDirectory: Send + Sync {
    /// Candidate profile, or `None` for an unknown user.
    async fn profile(&self, user_id: &str) -> Result<Option<CandidateProfile>>;
}

#[async_trait]
pub trait JobCatalog: Send + Sync {
    /// Posting by id, or `None` when the catalog does not know it.
    async fn posting(&self, job_id: &str) -> Result<Option<JobPosting>>;
}

/// Semantic similarity between two texts.
#[async_trait]
pub trait SimilarityModel: Send + Sync {
    /// A value in `0.0..=1.0`. Out-of-range values are clamped by the scorer.
    async fn similarity(&self, a: &str, b: &str) -> Result<f64>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Submission
// ═══════════════════════════════════════════════════════════════════════════════

/// Everything the submitter needs to file one application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionRequest {
    /// Auto-apply job id; also the idempotency key on the platform side
    pub auto_apply_job_id: Uuid,
    pub user_id: String,
    pub posting_id: String,
    pub resume_id: Option<String>,
    pub cover_letter_id: Option<String>,
    pub generate_cover_letter: bool,
    /// 1-based attempt number
    pub attempt: u32,
}

impl SubmissionRequest {
    /// Build a request for `job`, resolving documents from the profile and settings.
    pub fn for_job(
        job: &AutoApplyJob,
        profile: &CandidateProfile,
        use_default_resume: bool,
        generate_cover_letter: bool,
    ) -> Self {
        Self {
            auto_apply_job_id: job.id,
            user_id: job.user_id.clone(),
            posting_id: job.job_id.clone(),
            resume_id: if use_default_resume {
                profile.default_resume_id.clone()
            } else {
                None
            },
            cover_letter_id: if generate_cover_letter {
                None
            } else {
                profile.default_cover_letter_id.clone()
            },
            generate_cover_letter,
            attempt: job.attempts + 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionReceipt {
    /// Reference assigned by the board or ATS
    pub application_reference: Option<String>,
    pub submitted_at: DateTime<Utc>,
}

/// A typed submission failure.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{error_type}: {message}")]
pub struct SubmissionError {
    pub error_type: ErrorType,
    pub message: String,
}

impl SubmissionError {
    pub fn new(error_type: ErrorType, message: impl Into<String>) -> Self {
        Self {
            error_type,
            message: message.into(),
        }
    }

    pub fn timeout(after: std::time::Duration) -> Self {
        Self::new(
            ErrorType::Timeout,
            format!("submission exceeded {}s", after.as_secs_f64()),
        )
    }
}

#[async_trait]
pub trait ApplicationSubmitter: Send + Sync {
    async fn submit(&self, request: &SubmissionRequest) -> std::result::Result<SubmissionReceipt, SubmissionError>;
}

/// Writes the application record the user sees in their tracker.
#[async_trait]
pub trait ApplicationRecorder: Send + Sync {
    async fn record(&self, job: &AutoApplyJob, receipt: &SubmissionReceipt) -> Result<()>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Notifications
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Applied,
    Failed,
    Refunded,
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Applied => write!(f, "applied"),
            Self::Failed => write!(f, "failed"),
            Self::Refunded => write!(f, "refunded"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub user_id: String,
    pub auto_apply_job_id: Uuid,
    pub posting_id: String,
    pub kind: NotificationKind,
    pub message: String,
}

impl Notification {
    pub fn for_job(job: &AutoApplyJob, kind: NotificationKind, message: impl Into<String>) -> Self {
        Self {
            user_id: job.user_id.clone(),
            auto_apply_job_id: job.id,
            posting_id: job.job_id.clone(),
            kind,
            message: message.into(),
        }
    }
}

/// Fire-and-forget delivery. Callers log failures and move on.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<()>;
}

/// Notifier that only writes a log line. Message text is redacted.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        let message = SensitiveFieldRedactor::global().redact_value(&notification.message);
        tracing::info!(
            user_id = %notification.user_id,
            job_id = %notification.auto_apply_job_id,
            posting_id = %notification.posting_id,
            kind = %notification.kind,
            message = %message,
            "Notification"
        );
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Bundle
// ═══════════════════════════════════════════════════════════════════════════════

/// Collaborator handles shared by the queue service and the worker pool.
#[derive(Clone)]
pub struct Collaborators {
    pub profiles: Arc<dyn ProfileDirectory>,
    pub catalog: Arc<dyn JobCatalog>,
    /// Scoring runs without similarity when absent
    pub similarity: Option<Arc<dyn SimilarityModel>>,
    pub submitter: Arc<dyn ApplicationSubmitter>,
    pub recorder: Arc<dyn ApplicationRecorder>,
    pub notifier: Arc<dyn Notifier>,
}

impl Collaborators {
    /// Route every collaborator through the platform API.
    pub fn platform(client: PlatformClient, similarity: Option<HttpSimilarityModel>) -> Self {
        let client = Arc::new(client);
        Self {
            profiles: client.clone(),
            catalog: client.clone(),
            similarity: similarity.map(|model| Arc::new(model) as Arc<dyn SimilarityModel>),
            submitter: client.clone(),
            recorder: client.clone(),
            notifier: client,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators")
            .field("similarity", &self.similarity.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_resolves_documents() {
        let job = AutoApplyJob::new("u-1", "p-1", 80, Utc::now());
        let mut profile = CandidateProfile::new("u-1").with_default_resume("resume-1");
        profile.default_cover_letter_id = Some("letter-1".into());

        let request = SubmissionRequest::for_job(&job, &profile, true, false);
        assert_eq!(request.resume_id.as_deref(), Some("resume-1"));
        assert_eq!(request.cover_letter_id.as_deref(), Some("letter-1"));
        assert_eq!(request.attempt, 1);

        let request = SubmissionRequest::for_job(&job, &profile, false, true);
        assert!(request.resume_id.is_none());
        assert!(request.cover_letter_id.is_none());
        assert!(request.generate_cover_letter);
    }

    #[test]
    fn test_submission_error_display() {
        let err = SubmissionError::new(ErrorType::RateLimit, "slow down");
        assert_eq!(err.to_string(), "rate_limit: slow down");
        assert_eq!(
            SubmissionError::timeout(std::time::Duration::from_secs(2)).error_type,
            ErrorType::Timeout
        );
    }

    #[tokio::test]
    async fn test_log_notifier_never_fails() {
        let job = AutoApplyJob::new("u-1", "p-1", 80, Utc::now());
        let note = Notification::for_job(&job, NotificationKind::Applied, "sent to jane@example.com");
        assert!(LogNotifier.notify(&note).await.is_ok());
    }
}
