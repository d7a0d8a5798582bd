//! End-to-end tests for the auto-apply pipeline.
//!
//! Tests cover:
//! - Enqueue, dispatch, submission and charge for an admitted posting
//! - One credit charged per application
//! - Refund after exhausted retries under dispatch-time charging
//! - Daily quota holding work back, including under concurrent cycles
//! - Apply-assist approval, cancellation and manual refunds

use autoapply_core::admission::{ApplyMode, AutoApplyConfig};
use autoapply_core::collaborators::{
    InMemoryCollaborators, NotificationKind, ScriptedOutcome, ScriptedSubmitter, StaticSimilarity,
};
use autoapply_core::config::{ChargePolicy, Config};
use autoapply_core::error::ErrorCode;
use autoapply_core::jobs::{ErrorType, JobOutcome, JobStatus, Pipeline, SkipReason};
use autoapply_core::ledger::{CreditType, LedgerOperation};
use autoapply_core::models::{CandidateProfile, JobPosting};
use autoapply_core::store::Stores;
use chrono::Utc;

const USER: &str = "u-1";

struct Harness {
    pipeline: Pipeline,
    fakes: InMemoryCollaborators,
}

fn candidate() -> CandidateProfile {
    CandidateProfile::new(USER)
        .with_skills(["python", "sql"])
        .with_experience(4.0)
        .with_seniority("senior")
        .with_summary("Backend engineer building data pipelines")
}

fn posting(id: &str) -> JobPosting {
    JobPosting::new(id)
        .with_required_skills(["python", "sql", "aws"])
        .with_experience_range(Some(3.0), Some(5.0))
        .with_seniority("senior")
        .with_description("Data platform role")
}

async fn harness(config: Config, fakes: InMemoryCollaborators, settings: AutoApplyConfig, credits: i64) -> Harness {
    fakes.directory.insert(candidate());
    let pipeline = Pipeline::new(config, Stores::memory(), fakes.collaborators());
    pipeline.queue.save_config(settings).await.unwrap();
    pipeline
        .ledger
        .reset(USER, CreditType::AutoApply, credits, "plan start")
        .await
        .unwrap();
    Harness { pipeline, fakes }
}

fn auto_apply() -> AutoApplyConfig {
    AutoApplyConfig::new(USER).enabled(true).with_mode(ApplyMode::AutoApply)
}

// ============================================================================
// Happy Path
// ============================================================================

#[tokio::test]
async fn test_admitted_posting_is_applied() {
    let fakes = InMemoryCollaborators::new().with_similarity(StaticSimilarity::new(0.6));
    let h = harness(Config::default(), fakes, auto_apply(), 5).await;

    let report = h.pipeline.queue.enqueue(USER, &[posting("job-1")]).await.unwrap();
    assert_eq!(report.queued.len(), 1);
    assert!(report.rejected.is_empty());

    let id = report.queued[0];
    let queued = h.pipeline.queue.get_job(USER, id).await.unwrap();
    assert_eq!(queued.fit_score, 76);
    assert!(queued.user_approved);

    let summary = h.pipeline.scheduler().run_once(Utc::now()).await.unwrap();
    assert_eq!(summary.count("applied"), 1);

    let job = h.pipeline.queue.get_job(USER, id).await.unwrap();
    assert_eq!(job.status, JobStatus::Applied);
    assert_eq!(job.credits_used, 1);
    assert!(job.application_reference.is_some());

    let sent = h.fakes.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind, NotificationKind::Applied);
    assert_eq!(h.fakes.recorder.recorded().len(), 1);
}

#[tokio::test]
async fn test_one_credit_per_application() {
    let h = harness(Config::default(), InMemoryCollaborators::new(), auto_apply(), 5).await;

    let report = h.pipeline.queue.enqueue(USER, &[posting("job-1")]).await.unwrap();
    h.pipeline.scheduler().run_once(Utc::now()).await.unwrap();

    let ledger = &h.pipeline.ledger;
    assert_eq!(ledger.balance(USER, CreditType::AutoApply).await.unwrap(), 4);

    let deducts: Vec<_> = ledger
        .history(USER, CreditType::AutoApply)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.operation == LedgerOperation::Deduct)
        .collect();
    assert_eq!(deducts.len(), 1);
    assert_eq!(deducts[0].amount, -1);
    assert_eq!(deducts[0].balance_after, 4);
    assert_eq!(deducts[0].reference_id.as_deref(), Some(report.queued[0].to_string().as_str()));

    ledger.verify(USER, CreditType::AutoApply).await.unwrap();

    let stats = h.pipeline.queue.stats(USER, Utc::now()).await.unwrap();
    assert_eq!(stats.credits_used_today, 1);
    assert_eq!(stats.success_rate, 1.0);
}

#[tokio::test]
async fn test_duplicate_posting_is_not_requeued() {
    let h = harness(Config::default(), InMemoryCollaborators::new(), auto_apply(), 5).await;

    h.pipeline.queue.enqueue(USER, &[posting("job-1")]).await.unwrap();
    let second = h.pipeline.queue.enqueue(USER, &[posting("job-1")]).await.unwrap();
    assert!(second.queued.is_empty());
    assert_eq!(second.duplicates, vec!["job-1".to_string()]);
}

// ============================================================================
// Retries & Refunds
// ============================================================================

#[tokio::test]
async fn test_exhausted_retries_refund_dispatch_charge() {
    let mut config = Config::default();
    config.billing.charge_policy = ChargePolicy::OnDispatch;
    config.worker.max_attempts = 3;

    let fakes = InMemoryCollaborators::new()
        .with_submitter(ScriptedSubmitter::with_fallback(ScriptedOutcome::Reject(ErrorType::Network)));
    let h = harness(config, fakes, auto_apply(), 5).await;

    let report = h.pipeline.queue.enqueue(USER, &[posting("job-1")]).await.unwrap();
    let id = report.queued[0];
    let scheduler = h.pipeline.scheduler();

    for attempt in 1..=2 {
        let summary = scheduler.run_once(Utc::now()).await.unwrap();
        assert!(matches!(
            summary.outcomes.as_slice(),
            [JobOutcome::Retrying { error_type: ErrorType::Network, attempts, .. }] if *attempts == attempt
        ));
        let job = h.pipeline.queue.get_job(USER, id).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.credits_used, 1);
    }

    let summary = scheduler.run_once(Utc::now()).await.unwrap();
    assert!(matches!(
        summary.outcomes.as_slice(),
        [JobOutcome::Failed { refunded: true, .. }]
    ));

    let job = h.pipeline.queue.get_job(USER, id).await.unwrap();
    assert_eq!(job.status, JobStatus::Refunded);
    assert_eq!(job.attempts, 3);
    assert!(job.credits_refunded);
    assert_eq!(h.fakes.submitter.call_count("job-1"), 3);

    let ledger = &h.pipeline.ledger;
    let ops: Vec<LedgerOperation> = ledger
        .history(USER, CreditType::AutoApply)
        .await
        .unwrap()
        .iter()
        .map(|e| e.operation)
        .collect();
    assert_eq!(
        ops,
        vec![LedgerOperation::Reset, LedgerOperation::Deduct, LedgerOperation::Refund]
    );
    assert_eq!(ledger.balance(USER, CreditType::AutoApply).await.unwrap(), 5);

    let kinds: Vec<NotificationKind> = h.fakes.notifier.sent().iter().map(|n| n.kind).collect();
    assert_eq!(kinds, vec![NotificationKind::Refunded]);
}

#[tokio::test]
async fn test_non_retryable_failure_is_not_charged() {
    let fakes = InMemoryCollaborators::new()
        .with_submitter(ScriptedSubmitter::with_fallback(ScriptedOutcome::Reject(ErrorType::JobClosed)));
    let h = harness(Config::default(), fakes, auto_apply(), 5).await;

    let report = h.pipeline.queue.enqueue(USER, &[posting("job-1")]).await.unwrap();
    h.pipeline.scheduler().run_once(Utc::now()).await.unwrap();

    let job = h.pipeline.queue.get_job(USER, report.queued[0]).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.credits_used, 0);
    assert_eq!(h.pipeline.ledger.balance(USER, CreditType::AutoApply).await.unwrap(), 5);

    let err = h
        .pipeline
        .queue
        .request_refund(USER, job.id, "closed")
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NothingToRefund);
}

#[tokio::test]
async fn test_manual_refund_of_applied_job() {
    let h = harness(Config::default(), InMemoryCollaborators::new(), auto_apply(), 5).await;

    let report = h.pipeline.queue.enqueue(USER, &[posting("job-1")]).await.unwrap();
    h.pipeline.scheduler().run_once(Utc::now()).await.unwrap();

    let id = report.queued[0];
    let job = h.pipeline.queue.request_refund(USER, id, "employer ghosted").await.unwrap();
    assert_eq!(job.status, JobStatus::Refunded);
    assert_eq!(job.refund_reason.as_deref(), Some("employer ghosted"));
    assert_eq!(h.pipeline.ledger.balance(USER, CreditType::AutoApply).await.unwrap(), 5);

    let err = h.pipeline.queue.request_refund(USER, id, "again").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::NothingToRefund);
    assert_eq!(h.pipeline.ledger.balance(USER, CreditType::AutoApply).await.unwrap(), 5);
}

#[tokio::test]
async fn test_cancel_refunds_dispatch_charge() {
    let mut config = Config::default();
    config.billing.charge_policy = ChargePolicy::OnDispatch;

    let fakes = InMemoryCollaborators::new()
        .with_submitter(ScriptedSubmitter::with_fallback(ScriptedOutcome::Reject(ErrorType::RateLimit)));
    let h = harness(config, fakes, auto_apply(), 5).await;

    let report = h.pipeline.queue.enqueue(USER, &[posting("job-1")]).await.unwrap();
    h.pipeline.scheduler().run_once(Utc::now()).await.unwrap();
    assert_eq!(h.pipeline.ledger.balance(USER, CreditType::AutoApply).await.unwrap(), 4);

    let job = h.pipeline.queue.cancel(USER, report.queued[0]).await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.credits_refunded);
    assert_eq!(h.pipeline.ledger.balance(USER, CreditType::AutoApply).await.unwrap(), 5);
}

// ============================================================================
// Quotas
// ============================================================================

#[tokio::test]
async fn test_daily_limit_holds_jobs_in_queue() {
    let settings = auto_apply().with_limits(5, 20);
    let h = harness(Config::default(), InMemoryCollaborators::new(), settings, 10).await;

    let now = Utc::now();
    for _ in 0..5 {
        let decision = h.pipeline.stores().configs.try_consume_quota(USER, now).await.unwrap();
        assert!(decision.is_granted());
    }

    let report = h
        .pipeline
        .queue
        .enqueue(USER, &[posting("job-1"), posting("job-2")])
        .await
        .unwrap();
    assert_eq!(report.queued.len(), 2);

    let summary = h.pipeline.scheduler().run_once(now).await.unwrap();
    assert!(summary.outcomes.is_empty());
    assert_eq!(summary.dispatch.skipped(SkipReason::DailyLimit), 2);

    for id in report.queued {
        let job = h.pipeline.queue.get_job(USER, id).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
    }
    assert!(h.fakes.submitter.calls().is_empty());
    assert_eq!(h.pipeline.ledger.balance(USER, CreditType::AutoApply).await.unwrap(), 10);
}

#[tokio::test]
async fn test_concurrent_cycles_respect_quota() {
    let settings = auto_apply().with_limits(3, 20);
    let h = harness(Config::default(), InMemoryCollaborators::new(), settings, 10).await;

    let postings: Vec<JobPosting> = (0..6).map(|i| posting(&format!("job-{}", i))).collect();
    h.pipeline.queue.enqueue(USER, &postings).await.unwrap();

    let now = Utc::now();
    let (a, b) = tokio::join!(
        h.pipeline.dispatcher.run_cycle(now),
        h.pipeline.dispatcher.run_cycle(now)
    );
    let claimed = a.unwrap().claimed.len() + b.unwrap().claimed.len();
    assert!(claimed <= 3, "claimed {}", claimed);

    let config = h.pipeline.queue.get_config(USER).await.unwrap();
    assert_eq!(config.quota.daily_count as usize, claimed);
}

// ============================================================================
// Apply-Assist
// ============================================================================

#[tokio::test]
async fn test_apply_assist_waits_for_approval() {
    let settings = AutoApplyConfig::new(USER).enabled(true).with_mode(ApplyMode::ApplyAssist);
    let h = harness(Config::default(), InMemoryCollaborators::new(), settings, 5).await;

    let report = h.pipeline.queue.enqueue(USER, &[posting("job-1")]).await.unwrap();
    let id = report.queued[0];
    let scheduler = h.pipeline.scheduler();

    let summary = scheduler.run_once(Utc::now()).await.unwrap();
    assert_eq!(summary.dispatch.skipped(SkipReason::AwaitingApproval), 1);

    h.pipeline.queue.approve(USER, id).await.unwrap();
    let summary = scheduler.run_once(Utc::now()).await.unwrap();
    assert_eq!(summary.count("applied"), 1);

    let job = h.pipeline.queue.get_job(USER, id).await.unwrap();
    assert_eq!(job.status, JobStatus::Applied);
}

#[tokio::test]
async fn test_other_users_jobs_are_hidden() {
    let h = harness(Config::default(), InMemoryCollaborators::new(), auto_apply(), 5).await;

    let report = h.pipeline.queue.enqueue(USER, &[posting("job-1")]).await.unwrap();
    let err = h.pipeline.queue.get_job("u-2", report.queued[0]).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::JobNotFound);
}
