//! Worker pool that submits claimed jobs.
//!
//! Each claimed job gets exactly one submission attempt per dispatch. The
//! outcome is persisted through the store's compare-and-set; a worker that
//! loses the race (for example against the stale reclaimer) discards its
//! result and undoes any charge it made.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::billing::{ChargeOutcome, JobBilling};
use super::job::{AutoApplyJob, ErrorType, FailureDisposition, JobStatus};
use crate::admission::AutoApplyConfig;
use crate::collaborators::{
    Collaborators, Notification, NotificationKind, SubmissionError, SubmissionReceipt, SubmissionRequest,
};
use crate::config::WorkerConfig;
use crate::error::{AutoApplyError, Result};
use crate::store::Stores;
use crate::telemetry::{OperationTimer, PipelineMetrics};

/// What one attempt did to a job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Applied {
        job_id: Uuid,
        reference: Option<String>,
    },
    /// Failed with a retryable error and went back to the queue
    Retrying {
        job_id: Uuid,
        error_type: ErrorType,
        attempts: u32,
    },
    Failed {
        job_id: Uuid,
        error_type: ErrorType,
        refunded: bool,
    },
    /// Another writer changed the record first; the result was thrown away
    Discarded { job_id: Uuid },
}

impl JobOutcome {
    pub fn job_id(&self) -> Uuid {
        match self {
            Self::Applied { job_id, .. }
            | Self::Retrying { job_id, .. }
            | Self::Failed { job_id, .. }
            | Self::Discarded { job_id } => *job_id,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied { .. } => "applied",
            Self::Retrying { .. } => "retrying",
            Self::Failed { .. } => "failed",
            Self::Discarded { .. } => "discarded",
        }
    }
}

/// Running totals across every batch a pool has processed.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    pub processed: Arc<AtomicU64>,
    pub applied: Arc<AtomicU64>,
    pub retried: Arc<AtomicU64>,
    pub failed: Arc<AtomicU64>,
    pub discarded: Arc<AtomicU64>,
    /// Submissions in flight
    pub active: Arc<AtomicU64>,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    pub fn retried(&self) -> u64 {
        self.retried.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    fn record(&self, outcome: &JobOutcome) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            JobOutcome::Applied { .. } => &self.applied,
            JobOutcome::Retrying { .. } => &self.retried,
            JobOutcome::Failed { .. } => &self.failed,
            JobOutcome::Discarded { .. } => &self.discarded,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Worker
// ═══════════════════════════════════════════════════════════════════════════════

/// Processes one claimed job at a time. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Worker {
    stores: Stores,
    collaborators: Collaborators,
    billing: JobBilling,
    settings: WorkerConfig,
}

impl Worker {
    pub fn new(stores: Stores, collaborators: Collaborators, billing: JobBilling, settings: WorkerConfig) -> Self {
        Self {
            stores,
            collaborators,
            billing,
            settings,
        }
    }

    /// Submit a job that the dispatcher moved to `processing`.
    pub async fn process(&self, job: AutoApplyJob) -> Result<JobOutcome> {
        if job.status != JobStatus::Processing {
            return Err(AutoApplyError::invalid_state_transition(job.status, JobStatus::Applied)
                .with_context("job_id", job.id));
        }

        let config = self.stores.configs.get(&job.user_id).await?;
        let Some(config) = config else {
            return self
                .fail(job, None, ErrorType::Validation, "auto-apply settings missing", Utc::now())
                .await;
        };

        let profile = match self.collaborators.profiles.profile(&job.user_id).await {
            Ok(Some(profile)) => profile,
            Ok(None) => {
                return self
                    .fail(job, Some(&config), ErrorType::Validation, "candidate profile not found", Utc::now())
                    .await;
            }
            Err(e) => {
                e.log();
                return self
                    .fail(job, Some(&config), ErrorType::Network, e.user_message().to_string(), Utc::now())
                    .await;
            }
        };

        let request = SubmissionRequest::for_job(
            &job,
            &profile,
            config.use_default_resume,
            config.auto_generate_cover_letter,
        );

        debug!(
            job_id = %job.id,
            user_id = %job.user_id,
            attempt = request.attempt,
            "Submitting application"
        );

        let timer = OperationTimer::start("submission");
        let result = match tokio::time::timeout(
            self.settings.attempt_timeout,
            self.collaborators.submitter.submit(&request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(SubmissionError::timeout(self.settings.attempt_timeout)),
        };
        PipelineMetrics::record_submission(timer.finish().as_secs_f64(), result.is_ok());

        match result {
            Ok(receipt) => self.succeed(job, &config, receipt).await,
            Err(e) => {
                warn!(
                    job_id = %job.id,
                    user_id = %job.user_id,
                    attempt = request.attempt,
                    error_type = %e.error_type,
                    error = %e.message,
                    "Submission failed"
                );
                self.fail(job, Some(&config), e.error_type, e.message, Utc::now()).await
            }
        }
    }

    /// Time out a job left in `processing` by a dead worker.
    pub async fn reclaim(&self, job: AutoApplyJob, now: DateTime<Utc>) -> Result<JobOutcome> {
        let config = self.stores.configs.get(&job.user_id).await?;
        warn!(
            job_id = %job.id,
            user_id = %job.user_id,
            started_at = ?job.started_at,
            "Reclaiming stale processing job"
        );
        self.fail(job, config.as_ref(), ErrorType::Timeout, "processing abandoned", now)
            .await
    }

    async fn succeed(
        &self,
        mut job: AutoApplyJob,
        config: &AutoApplyConfig,
        receipt: SubmissionReceipt,
    ) -> Result<JobOutcome> {
        let now = Utc::now();

        let charged_now = match self.billing.charge(&mut job).await? {
            ChargeOutcome::Charged => true,
            ChargeOutcome::AlreadyCharged => false,
            ChargeOutcome::Insufficient => {
                return self
                    .fail(job, Some(config), ErrorType::Validation, "insufficient auto-apply credits", now)
                    .await;
            }
        };

        job.mark_applied(receipt.application_reference.clone(), now)?;
        let Some(saved) = self.stores.jobs.save_if_version(&job).await? else {
            if charged_now {
                self.release_discarded_charge(&mut job).await?;
            }
            return Ok(self.discarded(&job));
        };

        if let Err(e) = self.collaborators.recorder.record(&saved, &receipt).await {
            warn!(job_id = %saved.id, error = %e, "Failed to record application");
        }

        info!(
            job_id = %saved.id,
            user_id = %saved.user_id,
            posting_id = %saved.job_id,
            attempts = saved.attempts + 1,
            credits_used = saved.credits_used,
            "Application submitted"
        );
        PipelineMetrics::record_outcome(JobStatus::Applied.as_str(), None);

        if config.notify_on_success {
            self.notify(&saved, NotificationKind::Applied, "Application submitted").await;
        }

        Ok(JobOutcome::Applied {
            job_id: saved.id,
            reference: saved.application_reference,
        })
    }

    async fn fail(
        &self,
        mut job: AutoApplyJob,
        config: Option<&AutoApplyConfig>,
        error_type: ErrorType,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<JobOutcome> {
        let message = message.into();
        let disposition = job.record_failure(error_type, message.clone(), now)?;

        let Some(saved) = self.stores.jobs.save_if_version(&job).await? else {
            return Ok(self.discarded(&job));
        };

        if disposition == FailureDisposition::Requeued {
            debug!(
                job_id = %saved.id,
                attempts = saved.attempts,
                max_attempts = saved.max_attempts,
                "Job requeued"
            );
            PipelineMetrics::record_outcome("retrying", Some(error_type.as_str()));
            return Ok(JobOutcome::Retrying {
                job_id: saved.id,
                error_type,
                attempts: saved.attempts,
            });
        }

        let mut job = saved;
        let refunded = self.refund_failed(&mut job, now).await?;

        warn!(
            job_id = %job.id,
            user_id = %job.user_id,
            attempts = job.attempts,
            error_type = %error_type,
            refunded,
            "Job failed"
        );
        PipelineMetrics::record_outcome(JobStatus::Failed.as_str(), Some(error_type.as_str()));

        if config.map_or(false, |c| c.notify_on_failure) {
            let (kind, text) = if refunded {
                (NotificationKind::Refunded, format!("Application failed ({}); credits refunded", error_type))
            } else {
                (NotificationKind::Failed, format!("Application failed: {}", message))
            };
            self.notify(&job, kind, text).await;
        }

        Ok(JobOutcome::Failed {
            job_id: job.id,
            error_type,
            refunded,
        })
    }

    /// Settle the charge of a success whose write lost the race.
    ///
    /// A record that is queued, processing or applied again still owes the
    /// deduction: the next charge for it finds the same ledger entry, and a
    /// later failure or cancel refunds it. Anything else gets it back now.
    async fn release_discarded_charge(&self, job: &mut AutoApplyJob) -> Result<()> {
        let live = self
            .stores
            .jobs
            .get(job.id)
            .await?
            .filter(|c| matches!(c.status, JobStatus::Queued | JobStatus::Processing | JobStatus::Applied));
        if let Some(current) = live {
            debug!(
                job_id = %job.id,
                status = %current.status,
                "Keeping charge for discarded result; job is still live"
            );
            return Ok(());
        }
        self.billing.refund(job, "submission result discarded").await?;
        Ok(())
    }

    /// Refund a terminally failed job and persist `refunded`.
    async fn refund_failed(&self, job: &mut AutoApplyJob, now: DateTime<Utc>) -> Result<bool> {
        let reason = "automatic refund after failed application";
        if !self.billing.refund_and_mark(job, reason, now).await? {
            return Ok(false);
        }

        match self.stores.jobs.save_if_version(job).await? {
            Some(saved) => *job = saved,
            // The ledger already holds the refund; a later manual refund
            // request finds it and completes the transition.
            None => warn!(job_id = %job.id, "Refund recorded but job state changed concurrently"),
        }
        Ok(true)
    }

    async fn notify(&self, job: &AutoApplyJob, kind: NotificationKind, message: impl Into<String>) {
        let notification = Notification::for_job(job, kind, message);
        if let Err(e) = self.collaborators.notifier.notify(&notification).await {
            warn!(job_id = %job.id, kind = %kind, error = %e, "Notification failed");
        }
    }

    fn discarded(&self, job: &AutoApplyJob) -> JobOutcome {
        warn!(
            job_id = %job.id,
            user_id = %job.user_id,
            version = job.version,
            "Job changed concurrently; discarding result"
        );
        JobOutcome::Discarded { job_id: job.id }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Worker Pool
// ═══════════════════════════════════════════════════════════════════════════════

/// Runs claimed jobs with bounded concurrency.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    worker: Arc<Worker>,
    semaphore: Arc<Semaphore>,
    stats: WorkerStats,
}

impl WorkerPool {
    pub fn new(worker: Worker, concurrency: usize) -> Self {
        Self {
            worker: Arc::new(worker),
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            stats: WorkerStats::new(),
        }
    }

    pub fn worker(&self) -> &Worker {
        &self.worker
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Process a batch and wait for every job. Results come back in completion order.
    pub async fn run(&self, jobs: Vec<AutoApplyJob>) -> Vec<(Uuid, Result<JobOutcome>)> {
        let mut set = JoinSet::new();

        for job in jobs {
            let job_id = job.id;
            let worker = self.worker.clone();
            let semaphore = self.semaphore.clone();
            let stats = self.stats.clone();

            set.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => return (job_id, Err(AutoApplyError::from(e))),
                };

                stats.active.fetch_add(1, Ordering::Relaxed);
                PipelineMetrics::worker_started();
                let result = worker.process(job).await;
                PipelineMetrics::worker_finished();
                stats.active.fetch_sub(1, Ordering::Relaxed);

                match &result {
                    Ok(outcome) => stats.record(outcome),
                    Err(e) => e.log(),
                }
                (job_id, result)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => warn!(error = %e, "Worker task aborted"),
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::ApplyMode;
    use crate::collaborators::{InMemoryCollaborators, ScriptedOutcome, ScriptedSubmitter};
    use crate::config::BillingConfig;
    use crate::ledger::{CreditLedger, CreditType, LedgerEntry, LedgerOperation};
    use crate::models::CandidateProfile;
    use std::time::Duration;

    struct Fixture {
        stores: Stores,
        fakes: InMemoryCollaborators,
        worker: Worker,
    }

    async fn fixture(submitter: ScriptedSubmitter, credits: i64) -> Fixture {
        let stores = Stores::memory();
        let fakes = InMemoryCollaborators::new().with_submitter(submitter);
        fakes.directory.insert(CandidateProfile::new("u-1"));

        let config = AutoApplyConfig::new("u-1").enabled(true).with_mode(ApplyMode::AutoApply);
        stores.configs.put(config, Utc::now()).await.unwrap();

        let ledger = CreditLedger::new(stores.ledger.clone());
        if credits > 0 {
            ledger.add("u-1", CreditType::AutoApply, credits, "grant", None).await.unwrap();
        }

        let settings = WorkerConfig {
            attempt_timeout: Duration::from_millis(50),
            ..WorkerConfig::default()
        };
        let worker = Worker::new(
            stores.clone(),
            fakes.collaborators(),
            JobBilling::new(ledger, BillingConfig::default()),
            settings,
        );
        Fixture { stores, fakes, worker }
    }

    async fn claimed(stores: &Stores, posting: &str) -> AutoApplyJob {
        let job = AutoApplyJob::new("u-1", posting, 80, Utc::now());
        stores.jobs.insert(&job).await.unwrap();
        let mut claimed = job.clone();
        claimed.mark_processing(Utc::now()).unwrap();
        stores.jobs.save_if_version(&claimed).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_success_charges_once() {
        let fx = fixture(ScriptedSubmitter::new(), 5).await;
        let job = claimed(&fx.stores, "p-1").await;

        let outcome = fx.worker.process(job.clone()).await.unwrap();
        assert_eq!(outcome.as_str(), "applied");

        let stored = fx.stores.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Applied);
        assert_eq!(stored.credits_used, 1);
        assert_eq!(fx.fakes.recorder.recorded().len(), 1);
        assert_eq!(fx.fakes.notifier.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_requeues() {
        let submitter = ScriptedSubmitter::with_fallback(ScriptedOutcome::Delay(Duration::from_secs(5)));
        let fx = fixture(submitter, 5).await;
        let job = claimed(&fx.stores, "p-1").await;

        let outcome = fx.worker.process(job.clone()).await.unwrap();
        assert!(matches!(
            outcome,
            JobOutcome::Retrying { error_type: ErrorType::Timeout, attempts: 1, .. }
        ));

        let stored = fx.stores.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
        assert_eq!(stored.credits_used, 0);
    }

    #[tokio::test]
    async fn test_insufficient_credits_fails_without_charge() {
        let fx = fixture(ScriptedSubmitter::new(), 0).await;
        let job = claimed(&fx.stores, "p-1").await;

        let outcome = fx.worker.process(job.clone()).await.unwrap();
        assert!(matches!(
            outcome,
            JobOutcome::Failed { error_type: ErrorType::Validation, refunded: false, .. }
        ));
        let stored = fx.stores.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
    }

    fn operations(entries: &[LedgerEntry]) -> Vec<LedgerOperation> {
        entries.iter().map(|e| e.operation).collect()
    }

    #[tokio::test]
    async fn test_late_success_after_requeue_keeps_single_charge() {
        let fx = fixture(ScriptedSubmitter::new(), 5).await;
        let job = claimed(&fx.stores, "p-1").await;

        fx.worker.reclaim(job.clone(), Utc::now()).await.unwrap();
        let late = fx.worker.process(job.clone()).await.unwrap();
        assert_eq!(late, JobOutcome::Discarded { job_id: job.id });

        let requeued = fx.stores.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(requeued.status, JobStatus::Queued);
        let mut retry = requeued.clone();
        retry.mark_processing(Utc::now()).unwrap();
        let retry = fx.stores.jobs.save_if_version(&retry).await.unwrap().unwrap();

        let outcome = fx.worker.process(retry).await.unwrap();
        assert_eq!(outcome.as_str(), "applied");

        let stored = fx.stores.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Applied);
        assert_eq!(stored.credits_used, 1);
        assert!(!stored.credits_refunded);

        let ledger = CreditLedger::new(fx.stores.ledger.clone());
        let history = ledger.history("u-1", CreditType::AutoApply).await.unwrap();
        let ops = operations(&history);
        assert_eq!(ops.iter().filter(|op| **op == LedgerOperation::Deduct).count(), 1);
        assert!(!ops.contains(&LedgerOperation::Refund));
        assert_eq!(ledger.balance("u-1", CreditType::AutoApply).await.unwrap(), 4);
        ledger.verify("u-1", CreditType::AutoApply).await.unwrap();
    }

    #[tokio::test]
    async fn test_late_success_after_terminal_reclaim_is_refunded() {
        let fx = fixture(ScriptedSubmitter::new(), 5).await;
        let job = AutoApplyJob::new("u-1", "p-1", 80, Utc::now()).with_max_attempts(1);
        fx.stores.jobs.insert(&job).await.unwrap();
        let mut job = job;
        job.mark_processing(Utc::now()).unwrap();
        let job = fx.stores.jobs.save_if_version(&job).await.unwrap().unwrap();

        fx.worker.reclaim(job.clone(), Utc::now()).await.unwrap();
        let outcome = fx.worker.process(job.clone()).await.unwrap();
        assert_eq!(outcome, JobOutcome::Discarded { job_id: job.id });

        let stored = fx.stores.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);

        // The compensating refund leaves the wallet whole.
        let ledger = CreditLedger::new(fx.stores.ledger.clone());
        assert_eq!(ledger.balance("u-1", CreditType::AutoApply).await.unwrap(), 5);
        ledger.verify("u-1", CreditType::AutoApply).await.unwrap();
    }

    #[tokio::test]
    async fn test_pool_processes_batch() {
        let fx = fixture(ScriptedSubmitter::new(), 10).await;
        let mut batch = Vec::new();
        for i in 0..4 {
            batch.push(claimed(&fx.stores, &format!("p-{}", i)).await);
        }

        let pool = WorkerPool::new(fx.worker.clone(), 2);
        let results = pool.run(batch).await;
        assert_eq!(results.len(), 4);
        assert!(results.iter().all(|(_, r)| matches!(r, Ok(JobOutcome::Applied { .. }))));
        assert_eq!(pool.stats().applied(), 4);
        assert_eq!(pool.stats().active(), 0);
    }
}
