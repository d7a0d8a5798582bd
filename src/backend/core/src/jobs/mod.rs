//! Auto-apply job pipeline.
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ QueueService │──▶│    Store     │◀──│  Dispatcher  │──▶│  WorkerPool  │
//! │ (score/admit)│   │ (CAS/quota)  │   │ (quota gate) │   │ (submit/pay) │
//! └──────────────┘   └──────────────┘   └──────────────┘   └──────────────┘
//!                                              ▲                  │
//!                                       DispatchScheduler         ▼
//!                                       (interval ticks)     CreditLedger
//! ```
//!
//! The queue service creates `queued` records. Each scheduler tick the
//! dispatcher claims eligible records under the owner's quota and hands them
//! to the worker pool, which submits, charges or refunds, and persists the
//! outcome.

pub mod billing;
pub mod dispatcher;
pub mod job;
pub mod queue;
pub mod scheduler;
pub mod worker;

pub use billing::{ChargeOutcome, JobBilling};
pub use dispatcher::{DispatchReport, Dispatcher, SkipReason};
pub use job::{AutoApplyJob, ErrorType, FailureDisposition, JobStatus, DEFAULT_MAX_ATTEMPTS};
pub use queue::{EnqueueReport, QueueService, QueueStats, Rejection, MAX_BATCH_SIZE};
pub use scheduler::{CycleSummary, DispatchScheduler, SchedulerHandle};
pub use worker::{JobOutcome, Worker, WorkerPool, WorkerStats};

use std::sync::Arc;

use crate::collaborators::Collaborators;
use crate::config::Config;
use crate::ledger::CreditLedger;
use crate::store::Stores;

/// Every pipeline component wired against one set of stores and collaborators.
#[derive(Debug, Clone)]
pub struct Pipeline {
    pub queue: QueueService,
    pub ledger: CreditLedger,
    pub dispatcher: Arc<Dispatcher>,
    pub pool: WorkerPool,
    config: Config,
    stores: Stores,
}

impl Pipeline {
    pub fn new(config: Config, stores: Stores, collaborators: Collaborators) -> Self {
        let ledger = CreditLedger::new(stores.ledger.clone());
        let billing = JobBilling::new(ledger.clone(), config.billing.clone());

        let queue = QueueService::new(stores.clone(), collaborators.clone(), billing.clone())
            .with_max_attempts(config.worker.max_attempts);
        let dispatcher = Arc::new(Dispatcher::new(
            stores.clone(),
            billing.clone(),
            config.dispatcher.clone(),
        ));
        let worker = Worker::new(stores.clone(), collaborators, billing, config.worker.clone());
        let pool = WorkerPool::new(worker, config.worker.concurrency);

        Self {
            queue,
            ledger,
            dispatcher,
            pool,
            config,
            stores,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn scheduler(&self) -> DispatchScheduler {
        DispatchScheduler::new(
            self.dispatcher.clone(),
            self.pool.clone(),
            self.stores.jobs.clone(),
            self.config.retention.clone(),
        )
    }

    /// Start the background loop on the configured dispatch interval.
    pub fn start(&self) -> SchedulerHandle {
        self.scheduler().start(self.config.dispatcher.interval)
    }
}
