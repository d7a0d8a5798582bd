//! Background loop that drives dispatch, stale reclaim and retention.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use super::dispatcher::{DispatchReport, Dispatcher};
use super::worker::{JobOutcome, WorkerPool, WorkerStats};
use crate::config::RetentionConfig;
use crate::error::Result;
use crate::store::JobStore;
use crate::telemetry::PipelineMetrics;

/// Everything one scheduler tick did.
#[derive(Debug, Default)]
pub struct CycleSummary {
    pub reclaimed: usize,
    pub dispatch: DispatchReport,
    pub outcomes: Vec<JobOutcome>,
    /// Jobs whose processing returned an error; they stay in `processing`
    /// until the stale reclaimer picks them up
    pub errors: usize,
}

impl CycleSummary {
    pub fn count(&self, label: &str) -> usize {
        self.outcomes.iter().filter(|o| o.as_str() == label).count()
    }
}

pub struct DispatchScheduler {
    dispatcher: Arc<Dispatcher>,
    pool: WorkerPool,
    jobs: Arc<dyn JobStore>,
    retention: RetentionConfig,
}

impl DispatchScheduler {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        pool: WorkerPool,
        jobs: Arc<dyn JobStore>,
        retention: RetentionConfig,
    ) -> Self {
        Self {
            dispatcher,
            pool,
            jobs,
            retention,
        }
    }

    pub fn stats(&self) -> &WorkerStats {
        self.pool.stats()
    }

    /// Reclaim stale work, then dispatch and process one batch.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<CycleSummary> {
        let reclaimed = self.reclaim_stale(now).await?;
        let mut summary = self.dispatch_and_process(now).await?;
        summary.reclaimed = reclaimed;
        Ok(summary)
    }

    /// Dispatch one batch and wait for the pool to finish it.
    pub async fn dispatch_and_process(&self, now: DateTime<Utc>) -> Result<CycleSummary> {
        let mut dispatch = self.dispatcher.run_cycle(now).await?;
        let claimed = std::mem::take(&mut dispatch.claimed);

        let mut outcomes = Vec::with_capacity(claimed.len());
        let mut errors = 0;
        for (job_id, result) in self.pool.run(claimed).await {
            match result {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    errors += 1;
                    warn!(job_id = %job_id, error = %e, "Job processing errored");
                }
            }
        }

        Ok(CycleSummary {
            reclaimed: 0,
            dispatch,
            outcomes,
            errors,
        })
    }

    /// Fail every job stuck in `processing` past the stale threshold.
    pub async fn reclaim_stale(&self, now: DateTime<Utc>) -> Result<usize> {
        let stale = self.dispatcher.stale_jobs(now).await?;
        let mut reclaimed = 0;
        for job in stale {
            match self.pool.worker().reclaim(job, now).await {
                Ok(JobOutcome::Discarded { .. }) => {}
                Ok(_) => reclaimed += 1,
                Err(e) => e.log(),
            }
        }
        Ok(reclaimed)
    }

    /// Delete terminal jobs older than the retention period.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<u64> {
        let period = chrono::Duration::from_std(self.retention.period)
            .unwrap_or_else(|_| chrono::Duration::days(30));
        let purged = self.jobs.purge_terminal_before(now - period).await?;
        PipelineMetrics::record_purged(purged);
        if purged > 0 {
            info!(purged, "Retention sweep removed terminal jobs");
        }
        Ok(purged)
    }

    /// Run until the returned handle is shut down.
    pub fn start(self, dispatch_interval: Duration) -> SchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let stats = self.pool.stats().clone();
        let sweep_interval = self.retention.sweep_interval;
        let reclaim_interval = self.dispatcher.settings().stale_after;

        let task = tokio::spawn(async move {
            let mut dispatch_tick = tokio::time::interval(dispatch_interval);
            dispatch_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut sweep_tick = tokio::time::interval(sweep_interval);
            sweep_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut reclaim_tick = tokio::time::interval(reclaim_interval);
            reclaim_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

            info!(
                dispatch_interval = ?dispatch_interval,
                sweep_interval = ?sweep_interval,
                reclaim_interval = ?reclaim_interval,
                "Scheduler started"
            );

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            info!("Scheduler shutting down");
                            break;
                        }
                    }
                    _ = dispatch_tick.tick() => {
                        match self.dispatch_and_process(Utc::now()).await {
                            Ok(summary) => info!(
                                claimed = summary.outcomes.len() + summary.errors,
                                applied = summary.count("applied"),
                                retrying = summary.count("retrying"),
                                failed = summary.count("failed"),
                                "Cycle finished"
                            ),
                            Err(e) => error!(error = %e, "Dispatch cycle failed"),
                        }
                    }
                    _ = reclaim_tick.tick() => {
                        match self.reclaim_stale(Utc::now()).await {
                            Ok(0) => {}
                            Ok(reclaimed) => info!(reclaimed, "Reclaimed stale jobs"),
                            Err(e) => error!(error = %e, "Stale reclaim failed"),
                        }
                    }
                    _ = sweep_tick.tick() => {
                        if let Err(e) = self.sweep(Utc::now()).await {
                            error!(error = %e, "Retention sweep failed");
                        }
                    }
                }
            }

            info!("Scheduler stopped");
        });

        SchedulerHandle {
            shutdown: shutdown_tx,
            task,
            stats,
        }
    }
}

impl std::fmt::Debug for DispatchScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchScheduler")
            .field("dispatcher", &self.dispatcher)
            .field("retention", &self.retention)
            .finish_non_exhaustive()
    }
}

/// Handle for controlling a running scheduler.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    stats: WorkerStats,
}

impl SchedulerHandle {
    /// Ask the loop to stop after the current tick.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Signal shutdown and wait for the in-flight tick to finish.
    pub async fn stop(self) {
        self.shutdown();
        if let Err(e) = self.task.await {
            error!(error = %e, "Scheduler task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{ApplyMode, AutoApplyConfig};
    use crate::collaborators::InMemoryCollaborators;
    use crate::config::{BillingConfig, DispatcherConfig, WorkerConfig};
    use crate::jobs::{AutoApplyJob, JobBilling, JobStatus, Worker};
    use crate::ledger::{CreditLedger, CreditType};
    use crate::models::CandidateProfile;
    use crate::store::Stores;

    async fn scheduler(stores: &Stores) -> DispatchScheduler {
        let fakes = InMemoryCollaborators::new();
        fakes.directory.insert(CandidateProfile::new("u-1"));
        let ledger = CreditLedger::new(stores.ledger.clone());
        ledger.add("u-1", CreditType::AutoApply, 10, "grant", None).await.unwrap();
        stores
            .configs
            .put(
                AutoApplyConfig::new("u-1").enabled(true).with_mode(ApplyMode::AutoApply),
                Utc::now(),
            )
            .await
            .unwrap();

        let billing = JobBilling::new(ledger, BillingConfig::default());
        let dispatcher = Dispatcher::new(stores.clone(), billing.clone(), DispatcherConfig::default());
        let worker = Worker::new(stores.clone(), fakes.collaborators(), billing, WorkerConfig::default());
        DispatchScheduler::new(
            Arc::new(dispatcher),
            WorkerPool::new(worker, 2),
            stores.jobs.clone(),
            RetentionConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_run_once_applies_queue() {
        let stores = Stores::memory();
        let scheduler = scheduler(&stores).await;
        for i in 0..3 {
            let job = AutoApplyJob::new("u-1", format!("p-{}", i), 80, Utc::now());
            stores.jobs.insert(&job).await.unwrap();
        }

        let summary = scheduler.run_once(Utc::now()).await.unwrap();
        assert_eq!(summary.count("applied"), 3);
        assert_eq!(summary.errors, 0);
        assert_eq!(stores.jobs.count_queued().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sweep_removes_old_terminal_jobs() {
        let stores = Stores::memory();
        let scheduler = scheduler(&stores).await;
        let job = AutoApplyJob::new("u-1", "p-1", 80, Utc::now());
        stores.jobs.insert(&job).await.unwrap();
        scheduler.run_once(Utc::now()).await.unwrap();

        assert_eq!(scheduler.sweep(Utc::now()).await.unwrap(), 0);
        let later = Utc::now() + chrono::Duration::days(31);
        assert_eq!(scheduler.sweep(later).await.unwrap(), 1);
        assert!(stores.jobs.get(job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reclaim_stale_processing() {
        let stores = Stores::memory();
        let scheduler = scheduler(&stores).await;
        let job = AutoApplyJob::new("u-1", "p-1", 80, Utc::now());
        stores.jobs.insert(&job).await.unwrap();

        let mut stuck = job.clone();
        stuck.mark_processing(Utc::now() - chrono::Duration::hours(2)).unwrap();
        stores.jobs.save_if_version(&stuck).await.unwrap().unwrap();

        assert_eq!(scheduler.reclaim_stale(Utc::now()).await.unwrap(), 1);
        let stored = stores.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
        assert_eq!(stored.attempts, 1);
    }

    #[tokio::test]
    async fn test_handle_stops_loop() {
        let stores = Stores::memory();
        let handle = scheduler(&stores).await.start(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.stop().await;
    }
}
