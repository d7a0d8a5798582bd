//! Queue service: the surface the REST layer calls.
//!
//! Enqueueing scores and admits postings; introspection pages and
//! aggregates a user's jobs; manual transitions (approve, cancel, refund)
//! go through the same compare-and-set and ledger paths as the worker.

use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::billing::JobBilling;
use super::job::{AutoApplyJob, JobStatus, DEFAULT_MAX_ATTEMPTS};
use crate::admission::{self, ApplyMode, AutoApplyConfig, RejectReason};
use crate::collaborators::Collaborators;
use crate::error::{AutoApplyError, ErrorCode, Result};
use crate::ledger::{CreditLedger, CreditType, CreditWallet, LedgerEntry};
use crate::models::JobPosting;
use crate::pagination::{OffsetPagination, Page};
use crate::scoring::{FitIndexResult, FitIndexScorer};
use crate::store::{JobFilter, Stores};
use crate::telemetry::PipelineMetrics;

/// Largest id list accepted by [`QueueService::enqueue_batch`].
pub const MAX_BATCH_SIZE: usize = 50;

/// Catalog lookups in flight per batch.
const CATALOG_CONCURRENCY: usize = 8;

/// A posting that did not pass admission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    pub job_id: String,
    pub fit_score: u32,
    pub reason: RejectReason,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnqueueReport {
    /// Ids of the records created
    pub queued: Vec<Uuid>,
    pub rejected: Vec<Rejection>,
    /// Postings that already have an active or applied record
    pub duplicates: Vec<String>,
    /// Ids the catalog did not know
    pub missing: Vec<String>,
}

/// Aggregate view of one user's queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub total: u64,
    pub counts: BTreeMap<JobStatus, u64>,
    /// applied / (applied + failed + refunded); 0 with no finished jobs
    pub success_rate: f64,
    pub average_fit_score: Option<f64>,
    pub credits_used_today: i64,
    pub credits_used_this_week: i64,
}

#[derive(Debug, Clone)]
pub struct QueueService {
    stores: Stores,
    collaborators: Collaborators,
    scorer: FitIndexScorer,
    billing: JobBilling,
    max_attempts: u32,
}

impl QueueService {
    pub fn new(stores: Stores, collaborators: Collaborators, billing: JobBilling) -> Self {
        Self {
            stores,
            collaborators,
            scorer: FitIndexScorer::new(),
            billing,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_scorer(mut self, scorer: FitIndexScorer) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn ledger(&self) -> &CreditLedger {
        self.billing.ledger()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Settings
    // ─────────────────────────────────────────────────────────────────────────

    /// Validate and persist settings. Quota counters are never taken from the caller.
    pub async fn save_config(&self, config: AutoApplyConfig) -> Result<AutoApplyConfig> {
        config.validate()?;
        let saved = self.stores.configs.put(config, Utc::now()).await?;
        info!(
            user_id = %saved.user_id,
            enabled = saved.enabled,
            mode = %saved.mode,
            "Auto-apply settings saved"
        );
        Ok(saved)
    }

    pub async fn get_config(&self, user_id: &str) -> Result<AutoApplyConfig> {
        self.stores
            .configs
            .get(user_id)
            .await?
            .ok_or_else(|| AutoApplyError::config_not_found(user_id))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Enqueue
    // ─────────────────────────────────────────────────────────────────────────

    /// Score, admit and queue a ranked list of postings.
    pub async fn enqueue(&self, user_id: &str, postings: &[JobPosting]) -> Result<EnqueueReport> {
        self.enqueue_at(user_id, postings, None, Utc::now()).await
    }

    /// Queue up to [`MAX_BATCH_SIZE`] catalog postings with a shared priority.
    pub async fn enqueue_batch(&self, user_id: &str, job_ids: &[String], priority: i32) -> Result<EnqueueReport> {
        if job_ids.len() > MAX_BATCH_SIZE {
            return Err(AutoApplyError::batch_too_large(job_ids.len(), MAX_BATCH_SIZE));
        }

        let catalog = self.collaborators.catalog.clone();
        let lookups: Vec<(String, Result<Option<JobPosting>>)> = stream::iter(job_ids.iter().cloned())
            .map(|id| {
                let catalog = catalog.clone();
                async move {
                    let posting = catalog.posting(&id).await;
                    (id, posting)
                }
            })
            .buffered(CATALOG_CONCURRENCY)
            .collect()
            .await;

        let mut postings = Vec::with_capacity(lookups.len());
        let mut missing = Vec::new();
        for (id, lookup) in lookups {
            match lookup? {
                Some(posting) => postings.push(posting),
                None => missing.push(id),
            }
        }

        let mut report = self.enqueue_at(user_id, &postings, Some(priority), Utc::now()).await?;
        report.missing = missing;
        Ok(report)
    }

    async fn enqueue_at(
        &self,
        user_id: &str,
        postings: &[JobPosting],
        priority: Option<i32>,
        now: DateTime<Utc>,
    ) -> Result<EnqueueReport> {
        let config = self.get_config(user_id).await?;
        let profile = self
            .collaborators
            .profiles
            .profile(user_id)
            .await?
            .ok_or_else(|| AutoApplyError::profile_not_found(user_id))?;

        let mut report = EnqueueReport::default();
        for posting in postings {
            let fit = self.score(&profile, posting).await;
            let decision = admission::admit(&config, posting, &fit, now);
            PipelineMetrics::record_admission(decision.eligible, decision.reason.as_ref().map(RejectReason::as_str));

            if let Some(reason) = decision.reason {
                debug!(
                    user_id = %user_id,
                    posting_id = %posting.job_id,
                    fit_score = fit.score,
                    reason = reason.as_str(),
                    "Posting not admitted"
                );
                report.rejected.push(Rejection {
                    job_id: posting.job_id.clone(),
                    fit_score: fit.score,
                    reason,
                });
                continue;
            }

            let mut job = AutoApplyJob::new(user_id, posting.job_id.clone(), fit.score, now)
                .with_max_attempts(self.max_attempts)
                .approved(config.mode == ApplyMode::AutoApply);
            if let Some(priority) = priority {
                job = job.with_priority(priority);
            }

            match self.stores.jobs.insert(&job).await {
                Ok(()) => report.queued.push(job.id),
                Err(e) if e.code() == ErrorCode::DuplicateJob => report.duplicates.push(posting.job_id.clone()),
                Err(e) => return Err(e),
            }
        }

        PipelineMetrics::record_enqueued(report.queued.len() as u64);
        info!(
            user_id = %user_id,
            queued = report.queued.len(),
            rejected = report.rejected.len(),
            duplicates = report.duplicates.len(),
            "Postings enqueued"
        );
        Ok(report)
    }

    async fn score(&self, profile: &crate::models::CandidateProfile, posting: &JobPosting) -> FitIndexResult {
        match &self.collaborators.similarity {
            Some(model) => self.scorer.score_with_model(model.as_ref(), profile, posting).await,
            None => self.scorer.score(profile, posting, None),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Introspection
    // ─────────────────────────────────────────────────────────────────────────

    /// A job owned by `user_id`. Other users' jobs read as not found.
    pub async fn get_job(&self, user_id: &str, id: Uuid) -> Result<AutoApplyJob> {
        match self.stores.jobs.get(id).await? {
            Some(job) if job.user_id == user_id => Ok(job),
            _ => Err(AutoApplyError::job_not_found(id)),
        }
    }

    pub async fn list_jobs(
        &self,
        user_id: &str,
        filter: &JobFilter,
        pagination: &OffsetPagination,
    ) -> Result<Page<AutoApplyJob>> {
        pagination.validate()?;
        let (jobs, total) = self.stores.jobs.query(user_id, filter, pagination).await?;
        Ok(Page::new(jobs, pagination, total))
    }

    pub async fn stats(&self, user_id: &str, now: DateTime<Utc>) -> Result<QueueStats> {
        let summary = self.stores.jobs.summary(user_id).await?;

        let applied = summary.count(JobStatus::Applied);
        let finished = applied + summary.count(JobStatus::Failed) + summary.count(JobStatus::Refunded);
        let success_rate = if finished == 0 {
            0.0
        } else {
            applied as f64 / finished as f64
        };

        let ledger = self.billing.ledger();
        let credits_used_today = ledger
            .usage_since(user_id, CreditType::AutoApply, start_of_day(now))
            .await?;
        let credits_used_this_week = ledger
            .usage_since(user_id, CreditType::AutoApply, start_of_week(now))
            .await?;

        Ok(QueueStats {
            total: summary.total(),
            counts: summary.counts,
            success_rate,
            average_fit_score: summary.average_fit_score,
            credits_used_today,
            credits_used_this_week,
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Manual Transitions
    // ─────────────────────────────────────────────────────────────────────────

    /// Approve a queued job for dispatch in apply-assist mode.
    pub async fn approve(&self, user_id: &str, id: Uuid) -> Result<AutoApplyJob> {
        let mut job = self.get_job(user_id, id).await?;
        if job.status != JobStatus::Queued {
            return Err(AutoApplyError::invalid_state_transition(job.status, JobStatus::Processing)
                .with_context("operation", "approve"));
        }
        if job.user_approved {
            return Ok(job);
        }

        job.user_approved = true;
        job.updated_at = Utc::now();
        let saved = self.save(&job).await?;
        info!(job_id = %saved.id, user_id = %user_id, "Job approved");
        Ok(saved)
    }

    /// Cancel a queued or processing job, refunding any charge.
    pub async fn cancel(&self, user_id: &str, id: Uuid) -> Result<AutoApplyJob> {
        let now = Utc::now();
        let mut job = self.get_job(user_id, id).await?;
        job.mark_cancelled(now)?;
        let mut job = self.save(&job).await?;

        if self.billing.refund(&mut job, "cancelled by user").await? {
            job.refund_reason = Some("cancelled by user".into());
            job.updated_at = now;
            match self.stores.jobs.save_if_version(&job).await? {
                Some(saved) => job = saved,
                None => warn!(job_id = %job.id, "Cancel refund recorded but job changed concurrently"),
            }
        }

        info!(
            job_id = %job.id,
            user_id = %user_id,
            credits_refunded = job.credits_refunded,
            "Job cancelled"
        );
        PipelineMetrics::record_outcome(JobStatus::Cancelled.as_str(), None);
        Ok(job)
    }

    /// Refund an applied job, or a failed or cancelled one that still holds a charge.
    pub async fn request_refund(&self, user_id: &str, id: Uuid, reason: &str) -> Result<AutoApplyJob> {
        let now = Utc::now();
        let mut job = self.get_job(user_id, id).await?;

        match job.status {
            JobStatus::Applied | JobStatus::Failed => {
                if !self.billing.refund_and_mark(&mut job, reason, now).await? {
                    return Err(AutoApplyError::nothing_to_refund(id));
                }
            }
            JobStatus::Cancelled => {
                if job.credits_refunded || !self.billing.refund(&mut job, reason).await? {
                    return Err(AutoApplyError::nothing_to_refund(id));
                }
                job.refund_reason = Some(reason.to_string());
                job.updated_at = now;
            }
            JobStatus::Refunded => return Err(AutoApplyError::nothing_to_refund(id)),
            status => return Err(AutoApplyError::invalid_state_transition(status, JobStatus::Refunded)),
        }

        let saved = self.save(&job).await?;
        info!(
            job_id = %saved.id,
            user_id = %user_id,
            credits = saved.credits_used,
            reason = %reason,
            "Job refunded"
        );
        PipelineMetrics::record_outcome(JobStatus::Refunded.as_str(), None);
        Ok(saved)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Wallet
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn wallet(&self, user_id: &str, credit_type: CreditType) -> Result<CreditWallet> {
        self.billing.ledger().wallet(user_id, credit_type).await
    }

    pub async fn transactions(
        &self,
        user_id: &str,
        credit_type: CreditType,
        pagination: &OffsetPagination,
    ) -> Result<Page<LedgerEntry>> {
        self.billing.ledger().history_page(user_id, credit_type, pagination).await
    }

    async fn save(&self, job: &AutoApplyJob) -> Result<AutoApplyJob> {
        self.stores
            .jobs
            .save_if_version(job)
            .await?
            .ok_or_else(|| AutoApplyError::concurrent_modification("auto_apply_job", job.id))
    }
}

fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive().and_time(NaiveTime::MIN).and_utc()
}

/// Monday 00:00 UTC of the ISO week containing `now`.
fn start_of_week(now: DateTime<Utc>) -> DateTime<Utc> {
    let days_since_monday = i64::from(now.weekday().num_days_from_monday());
    start_of_day(now) - Duration::days(days_since_monday)
}
