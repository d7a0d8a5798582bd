//! Periodic dispatch: moves eligible queued jobs to `processing`.
//!
//! A cycle pages through queued records in priority order, checks each
//! owner's settings, consumes one unit of daily and weekly quota per claim
//! and claims the record with a compare-and-set. Users whose quota ran out
//! are remembered for the rest of the cycle so their remaining records are
//! skipped without another store round trip.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

use super::billing::{ChargeOutcome, JobBilling};
use super::job::{AutoApplyJob, ErrorType};
use crate::admission::{ApplyMode, AutoApplyConfig, QuotaDecision};
use crate::config::{ChargePolicy, DispatcherConfig};
use crate::error::{ErrorCode, Result};
use crate::store::{QueueCursor, Stores};
use crate::telemetry::PipelineMetrics;

/// Why a queued record stayed in the queue this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    ConfigMissing,
    Disabled,
    Paused,
    AwaitingApproval,
    DailyLimit,
    WeeklyLimit,
    /// Another writer changed the record between read and claim
    Conflict,
    /// A store error; the record is retried next cycle
    Error,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConfigMissing => "config_missing",
            Self::Disabled => "disabled",
            Self::Paused => "paused",
            Self::AwaitingApproval => "awaiting_approval",
            Self::DailyLimit => "daily_limit",
            Self::WeeklyLimit => "weekly_limit",
            Self::Conflict => "conflict",
            Self::Error => "error",
        }
    }

    fn from_quota(decision: QuotaDecision) -> Option<Self> {
        match decision {
            QuotaDecision::Granted => None,
            QuotaDecision::DailyLimitReached => Some(Self::DailyLimit),
            QuotaDecision::WeeklyLimitReached => Some(Self::WeeklyLimit),
        }
    }
}

/// Result of one dispatch cycle.
#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    /// Queued records considered this cycle, across every page
    pub inspected: usize,
    /// Records now in `processing`, ready for the worker pool
    pub claimed: Vec<AutoApplyJob>,
    pub skipped: BTreeMap<SkipReason, usize>,
    /// Records failed at claim time because the wallet could not cover a dispatch charge
    pub unfunded: usize,
}

impl DispatchReport {
    pub fn skipped(&self, reason: SkipReason) -> usize {
        self.skipped.get(&reason).copied().unwrap_or(0)
    }

    pub fn total_skipped(&self) -> usize {
        self.skipped.values().sum()
    }

    fn skip(&mut self, job: &AutoApplyJob, reason: SkipReason) {
        debug!(job_id = %job.id, user_id = %job.user_id, reason = reason.as_str(), "Job skipped");
        PipelineMetrics::record_skipped(reason.as_str());
        *self.skipped.entry(reason).or_insert(0) += 1;
    }
}

enum Claim {
    Claimed(AutoApplyJob),
    Skipped(SkipReason),
    Unfunded,
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    stores: Stores,
    billing: JobBilling,
    settings: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(stores: Stores, billing: JobBilling, settings: DispatcherConfig) -> Self {
        Self {
            stores,
            billing,
            settings,
        }
    }

    pub fn settings(&self) -> &DispatcherConfig {
        &self.settings
    }

    /// Run one cycle at `now`.
    ///
    /// Walks the queue a page at a time until `batch_size` records are
    /// claimed, the queue runs out, or `scan_limit` records have been read,
    /// so owners that cannot be served never hide the records behind them.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<DispatchReport> {
        let batch_size = self.settings.batch_size.max(1);
        let mut report = DispatchReport::default();
        let mut cursor: Option<QueueCursor> = None;
        let mut scanned = 0;

        let mut configs: HashMap<String, Option<AutoApplyConfig>> = HashMap::new();
        let mut exhausted: HashMap<String, SkipReason> = HashMap::new();

        while report.claimed.len() < batch_size && scanned < self.settings.scan_limit {
            let page_size = batch_size.min(self.settings.scan_limit - scanned);
            let page = self.stores.jobs.list_queued(cursor.as_ref(), page_size).await?;
            let Some(last) = page.last() else {
                break;
            };
            cursor = Some(QueueCursor::after(last));
            let drained = page.len() < page_size;
            scanned += page.len();

            for job in page {
                if report.claimed.len() >= batch_size {
                    break;
                }
                report.inspected += 1;
                if let Some(reason) = exhausted.get(&job.user_id) {
                    report.skip(&job, *reason);
                    continue;
                }

                if !configs.contains_key(&job.user_id) {
                    match self.stores.configs.get(&job.user_id).await {
                        Ok(config) => {
                            configs.insert(job.user_id.clone(), config);
                        }
                        Err(e) => {
                            e.log();
                            report.skip(&job, SkipReason::Error);
                            continue;
                        }
                    }
                }

                let config = configs.get(&job.user_id).and_then(Option::as_ref);
                if let Some(reason) = ineligible(config, &job, now) {
                    report.skip(&job, reason);
                    continue;
                }

                match self.claim(job.clone(), now).await {
                    Ok(Claim::Claimed(claimed)) => report.claimed.push(claimed),
                    Ok(Claim::Unfunded) => report.unfunded += 1,
                    Ok(Claim::Skipped(reason)) => {
                        if matches!(reason, SkipReason::DailyLimit | SkipReason::WeeklyLimit) {
                            exhausted.insert(job.user_id.clone(), reason);
                        }
                        report.skip(&job, reason);
                    }
                    Err(e) => {
                        e.log();
                        report.skip(&job, SkipReason::Error);
                    }
                }
            }

            if drained {
                break;
            }
        }

        PipelineMetrics::record_dispatched(report.claimed.len() as u64);
        if let Ok(depth) = self.stores.jobs.count_queued().await {
            PipelineMetrics::set_queue_depth(depth);
        }

        info!(
            inspected = report.inspected,
            claimed = report.claimed.len(),
            skipped = report.total_skipped(),
            unfunded = report.unfunded,
            "Dispatch cycle complete"
        );
        Ok(report)
    }

    /// Processing records whose claim is older than `stale_after`.
    pub async fn stale_jobs(&self, now: DateTime<Utc>) -> Result<Vec<AutoApplyJob>> {
        let stale_after = chrono::Duration::from_std(self.settings.stale_after)
            .unwrap_or_else(|_| chrono::Duration::minutes(15));
        self.stores
            .jobs
            .list_stale_processing(now - stale_after, self.settings.batch_size)
            .await
    }

    async fn claim(&self, job: AutoApplyJob, now: DateTime<Utc>) -> Result<Claim> {
        let decision = match self.stores.configs.try_consume_quota(&job.user_id, now).await {
            Ok(decision) => decision,
            Err(e) if e.code() == ErrorCode::ConfigNotFound => return Ok(Claim::Skipped(SkipReason::ConfigMissing)),
            Err(e) => return Err(e),
        };
        if let Some(reason) = SkipReason::from_quota(decision) {
            return Ok(Claim::Skipped(reason));
        }

        let mut candidate = job;
        candidate.mark_processing(now)?;
        let Some(claimed) = self.stores.jobs.save_if_version(&candidate).await? else {
            self.stores.configs.release_quota(&candidate.user_id, now).await?;
            return Ok(Claim::Skipped(SkipReason::Conflict));
        };

        if self.billing.policy() == ChargePolicy::OnDispatch {
            return self.charge_on_dispatch(claimed, now).await;
        }

        debug!(job_id = %claimed.id, user_id = %claimed.user_id, "Job claimed");
        Ok(Claim::Claimed(claimed))
    }

    async fn charge_on_dispatch(&self, mut job: AutoApplyJob, now: DateTime<Utc>) -> Result<Claim> {
        match self.billing.charge(&mut job).await? {
            ChargeOutcome::Insufficient => {
                job.record_failure(ErrorType::Validation, "insufficient auto-apply credits", now)?;
                if self.stores.jobs.save_if_version(&job).await?.is_none() {
                    warn!(job_id = %job.id, "Job changed concurrently while failing unfunded claim");
                }
                PipelineMetrics::record_outcome("failed", Some(ErrorType::Validation.as_str()));
                Ok(Claim::Unfunded)
            }
            ChargeOutcome::AlreadyCharged => Ok(Claim::Claimed(job)),
            ChargeOutcome::Charged => match self.stores.jobs.save_if_version(&job).await? {
                Some(saved) => Ok(Claim::Claimed(saved)),
                None => {
                    self.billing.refund(&mut job, "dispatch claim lost").await?;
                    Ok(Claim::Skipped(SkipReason::Conflict))
                }
            },
        }
    }
}

fn ineligible(config: Option<&AutoApplyConfig>, job: &AutoApplyJob, now: DateTime<Utc>) -> Option<SkipReason> {
    let Some(config) = config else {
        return Some(SkipReason::ConfigMissing);
    };
    if !config.enabled {
        return Some(SkipReason::Disabled);
    }
    if config.is_paused(now) {
        return Some(SkipReason::Paused);
    }
    if config.mode == ApplyMode::ApplyAssist && !job.user_approved {
        return Some(SkipReason::AwaitingApproval);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BillingConfig;
    use crate::jobs::JobStatus;
    use crate::ledger::{CreditLedger, CreditType};

    fn dispatcher(stores: &Stores, policy: ChargePolicy) -> Dispatcher {
        dispatcher_with(stores, policy, DispatcherConfig::default())
    }

    fn dispatcher_with(stores: &Stores, policy: ChargePolicy, settings: DispatcherConfig) -> Dispatcher {
        let billing = JobBilling::new(
            CreditLedger::new(stores.ledger.clone()),
            BillingConfig {
                charge_policy: policy,
                ..BillingConfig::default()
            },
        );
        Dispatcher::new(stores.clone(), billing, settings)
    }

    async fn enable(stores: &Stores, user: &str, mode: ApplyMode, day: u32, week: u32) {
        let config = AutoApplyConfig::new(user)
            .enabled(true)
            .with_mode(mode)
            .with_limits(day, week);
        stores.configs.put(config, Utc::now()).await.unwrap();
    }

    async fn queue(stores: &Stores, user: &str, posting: &str, approved: bool) -> AutoApplyJob {
        let job = AutoApplyJob::new(user, posting, 80, Utc::now()).approved(approved);
        stores.jobs.insert(&job).await.unwrap();
        job
    }

    async fn queue_at(stores: &Stores, user: &str, posting: &str, priority: i32) {
        let job = AutoApplyJob::new(user, posting, 80, Utc::now()).with_priority(priority);
        stores.jobs.insert(&job).await.unwrap();
    }

    #[tokio::test]
    async fn test_claims_within_daily_limit() {
        let stores = Stores::memory();
        enable(&stores, "u-1", ApplyMode::AutoApply, 2, 50).await;
        for i in 0..4 {
            queue(&stores, "u-1", &format!("p-{}", i), false).await;
        }

        let report = dispatcher(&stores, ChargePolicy::OnSuccess)
            .run_cycle(Utc::now())
            .await
            .unwrap();
        assert_eq!(report.claimed.len(), 2);
        assert_eq!(report.skipped(SkipReason::DailyLimit), 2);
        assert!(report.claimed.iter().all(|j| j.status == JobStatus::Processing));
        assert_eq!(stores.jobs.count_queued().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_skips_ineligible_owners() {
        let stores = Stores::memory();
        enable(&stores, "assist", ApplyMode::ApplyAssist, 10, 50).await;
        stores
            .configs
            .put(AutoApplyConfig::new("off"), Utc::now())
            .await
            .unwrap();

        queue(&stores, "assist", "p-1", false).await;
        queue(&stores, "assist", "p-2", true).await;
        queue(&stores, "off", "p-3", true).await;
        queue(&stores, "ghost", "p-4", true).await;

        let report = dispatcher(&stores, ChargePolicy::OnSuccess)
            .run_cycle(Utc::now())
            .await
            .unwrap();
        assert_eq!(report.claimed.len(), 1);
        assert_eq!(report.claimed[0].job_id, "p-2");
        assert_eq!(report.skipped(SkipReason::AwaitingApproval), 1);
        assert_eq!(report.skipped(SkipReason::Disabled), 1);
        assert_eq!(report.skipped(SkipReason::ConfigMissing), 1);
    }

    #[tokio::test]
    async fn test_on_dispatch_charges_and_fails_unfunded() {
        let stores = Stores::memory();
        enable(&stores, "u-1", ApplyMode::AutoApply, 10, 50).await;
        let ledger = CreditLedger::new(stores.ledger.clone());
        ledger.add("u-1", CreditType::AutoApply, 1, "grant", None).await.unwrap();

        queue(&stores, "u-1", "p-1", false).await;
        queue(&stores, "u-1", "p-2", false).await;

        let report = dispatcher(&stores, ChargePolicy::OnDispatch)
            .run_cycle(Utc::now())
            .await
            .unwrap();
        assert_eq!(report.claimed.len(), 1);
        assert_eq!(report.claimed[0].credits_used, 1);
        assert_eq!(report.unfunded, 1);
        assert_eq!(ledger.balance("u-1", CreditType::AutoApply).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stale_jobs() {
        let stores = Stores::memory();
        enable(&stores, "u-1", ApplyMode::AutoApply, 10, 50).await;
        queue(&stores, "u-1", "p-1", false).await;

        let dispatcher = dispatcher(&stores, ChargePolicy::OnSuccess);
        let claimed_at = Utc::now() - chrono::Duration::hours(1);
        dispatcher.run_cycle(claimed_at).await.unwrap();

        assert_eq!(dispatcher.stale_jobs(Utc::now()).await.unwrap().len(), 1);
        assert!(dispatcher.stale_jobs(claimed_at).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_over_quota_owner_does_not_starve_lower_priority() {
        let stores = Stores::memory();
        enable(&stores, "blocked", ApplyMode::AutoApply, 1, 50).await;
        enable(&stores, "other", ApplyMode::AutoApply, 10, 50).await;
        for i in 0..3 {
            queue_at(&stores, "blocked", &format!("b-{}", i), 99).await;
        }
        queue_at(&stores, "other", "o-1", 50).await;

        let settings = DispatcherConfig {
            batch_size: 2,
            ..DispatcherConfig::default()
        };
        let dispatcher = dispatcher_with(&stores, ChargePolicy::OnSuccess, settings);

        let first = dispatcher.run_cycle(Utc::now()).await.unwrap();
        let owners: Vec<&str> = first.claimed.iter().map(|j| j.user_id.as_str()).collect();
        assert_eq!(owners, vec!["blocked", "other"]);
        assert_eq!(first.skipped(SkipReason::DailyLimit), 2);
        assert_eq!(first.inspected, 4);

        let second = dispatcher.run_cycle(Utc::now()).await.unwrap();
        assert!(second.claimed.is_empty());
        assert_eq!(second.skipped(SkipReason::DailyLimit), 2);
        assert_eq!(stores.jobs.count_queued().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_scan_limit_bounds_a_cycle() {
        let stores = Stores::memory();
        stores
            .configs
            .put(AutoApplyConfig::new("off"), Utc::now())
            .await
            .unwrap();
        enable(&stores, "u-1", ApplyMode::AutoApply, 10, 50).await;
        queue_at(&stores, "off", "p-1", 99).await;
        queue_at(&stores, "off", "p-2", 99).await;
        queue_at(&stores, "u-1", "p-3", 50).await;

        let settings = DispatcherConfig {
            batch_size: 1,
            scan_limit: 2,
            ..DispatcherConfig::default()
        };
        let report = dispatcher_with(&stores, ChargePolicy::OnSuccess, settings)
            .run_cycle(Utc::now())
            .await
            .unwrap();
        assert!(report.claimed.is_empty());
        assert_eq!(report.inspected, 2);
        assert_eq!(report.skipped(SkipReason::Disabled), 2);
    }
}
