//! In-process collaborators for tests and local runs.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::{
    ApplicationRecorder, ApplicationSubmitter, Collaborators, JobCatalog, Notification, Notifier,
    ProfileDirectory, SimilarityModel, SubmissionError, SubmissionReceipt, SubmissionRequest,
};
use crate::error::{AutoApplyError, Result};
use crate::jobs::{AutoApplyJob, ErrorType};
use crate::models::{CandidateProfile, JobPosting};

// ═══════════════════════════════════════════════════════════════════════════════
// Directory & Catalog
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
pub struct StaticDirectory {
    profiles: RwLock<HashMap<String, CandidateProfile>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, profile: CandidateProfile) {
        self.profiles.write().insert(profile.user_id.clone(), profile);
    }
}

#[async_trait]
impl ProfileDirectory for StaticDirectory {
    async fn profile(&self, user_id: &str) -> Result<Option<CandidateProfile>> {
        Ok(self.profiles.read().get(user_id).cloned())
    }
}

#[derive(Debug, Default)]
pub struct StaticCatalog {
    postings: RwLock<HashMap<String, JobPosting>>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, posting: JobPosting) {
        self.postings.write().insert(posting.job_id.clone(), posting);
    }
}

#[async_trait]
impl JobCatalog for StaticCatalog {
    async fn posting(&self, job_id: &str) -> Result<Option<JobPosting>> {
        Ok(self.postings.read().get(job_id).cloned())
    }
}

/// Returns a fixed similarity, or fails when built with [`StaticSimilarity::unavailable`].
#[derive(Debug, Clone, Copy)]
pub struct StaticSimilarity(Option<f64>);

impl StaticSimilarity {
    pub fn new(value: f64) -> Self {
        Self(Some(value))
    }

    pub fn unavailable() -> Self {
        Self(None)
    }
}

#[async_trait]
impl SimilarityModel for StaticSimilarity {
    async fn similarity(&self, _a: &str, _b: &str) -> Result<f64> {
        self.0
            .ok_or_else(|| AutoApplyError::external_service("similarity", "model unavailable"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Submission
// ═══════════════════════════════════════════════════════════════════════════════

/// One scripted response of [`ScriptedSubmitter`].
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedOutcome {
    Accept,
    Reject(ErrorType),
    /// Sleep, then accept
    Delay(Duration),
}

/// Submitter that plays back scripted outcomes per posting and records every call.
#[derive(Debug)]
pub struct ScriptedSubmitter {
    scripts: Mutex<HashMap<String, VecDeque<ScriptedOutcome>>>,
    fallback: ScriptedOutcome,
    calls: Mutex<Vec<SubmissionRequest>>,
}

impl Default for ScriptedSubmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedSubmitter {
    /// Accepts everything that has no script.
    pub fn new() -> Self {
        Self::with_fallback(ScriptedOutcome::Accept)
    }

    pub fn with_fallback(fallback: ScriptedOutcome) -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            fallback,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Queue outcomes for a posting; once drained the fallback applies.
    pub fn script(&self, posting_id: &str, outcomes: impl IntoIterator<Item = ScriptedOutcome>) {
        self.scripts
            .lock()
            .entry(posting_id.to_string())
            .or_default()
            .extend(outcomes);
    }

    pub fn calls(&self) -> Vec<SubmissionRequest> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self, posting_id: &str) -> usize {
        self.calls.lock().iter().filter(|r| r.posting_id == posting_id).count()
    }
}

#[async_trait]
impl ApplicationSubmitter for ScriptedSubmitter {
    async fn submit(&self, request: &SubmissionRequest) -> std::result::Result<SubmissionReceipt, SubmissionError> {
        self.calls.lock().push(request.clone());
        let outcome = self
            .scripts
            .lock()
            .get_mut(&request.posting_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| self.fallback.clone());

        match outcome {
            ScriptedOutcome::Accept => {}
            ScriptedOutcome::Reject(error_type) => {
                return Err(SubmissionError::new(error_type, "scripted rejection"));
            }
            ScriptedOutcome::Delay(delay) => tokio::time::sleep(delay).await,
        }

        Ok(SubmissionReceipt {
            application_reference: Some(format!("app-{}", request.auto_apply_job_id)),
            submitted_at: Utc::now(),
        })
    }
}

#[derive(Debug, Default)]
pub struct VecRecorder {
    records: Mutex<Vec<(Uuid, SubmissionReceipt)>>,
}

impl VecRecorder {
    pub fn recorded(&self) -> Vec<(Uuid, SubmissionReceipt)> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl ApplicationRecorder for VecRecorder {
    async fn record(&self, job: &AutoApplyJob, receipt: &SubmissionReceipt) -> Result<()> {
        self.records.lock().push((job.id, receipt.clone()));
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Notifications
// ═══════════════════════════════════════════════════════════════════════════════

/// Keeps every notification; can be told to fail delivery.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
    failing: bool,
}

impl RecordingNotifier {
    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            failing: true,
        }
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        if self.failing {
            return Err(AutoApplyError::external_service("notifications", "delivery failed"));
        }
        self.sent.lock().push(notification.clone());
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Bundle
// ═══════════════════════════════════════════════════════════════════════════════

/// Concrete in-memory collaborators, kept typed so callers can seed and inspect them.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCollaborators {
    pub directory: Arc<StaticDirectory>,
    pub catalog: Arc<StaticCatalog>,
    pub similarity: Option<Arc<StaticSimilarity>>,
    pub submitter: Arc<ScriptedSubmitter>,
    pub recorder: Arc<VecRecorder>,
    pub notifier: Arc<RecordingNotifier>,
}

impl InMemoryCollaborators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_similarity(mut self, model: StaticSimilarity) -> Self {
        self.similarity = Some(Arc::new(model));
        self
    }

    pub fn with_submitter(mut self, submitter: ScriptedSubmitter) -> Self {
        self.submitter = Arc::new(submitter);
        self
    }

    pub fn with_notifier(mut self, notifier: RecordingNotifier) -> Self {
        self.notifier = Arc::new(notifier);
        self
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            profiles: self.directory.clone(),
            catalog: self.catalog.clone(),
            similarity: self
                .similarity
                .clone()
                .map(|model| model as Arc<dyn SimilarityModel>),
            submitter: self.submitter.clone(),
            recorder: self.recorder.clone(),
            notifier: self.notifier.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(posting: &str) -> SubmissionRequest {
        SubmissionRequest {
            auto_apply_job_id: Uuid::new_v4(),
            user_id: "u-1".into(),
            posting_id: posting.into(),
            resume_id: None,
            cover_letter_id: None,
            generate_cover_letter: false,
            attempt: 1,
        }
    }

    #[tokio::test]
    async fn test_script_then_fallback() {
        let submitter = ScriptedSubmitter::new();
        submitter.script("p-1", [ScriptedOutcome::Reject(ErrorType::Network)]);

        let first = submitter.submit(&request("p-1")).await;
        assert_eq!(first.unwrap_err().error_type, ErrorType::Network);
        assert!(submitter.submit(&request("p-1")).await.is_ok());
        assert_eq!(submitter.call_count("p-1"), 2);
    }

    #[tokio::test]
    async fn test_unavailable_similarity() {
        assert!(StaticSimilarity::unavailable().similarity("a", "b").await.is_err());
        assert_eq!(StaticSimilarity::new(0.4).similarity("a", "b").await.unwrap(), 0.4);
    }
}
