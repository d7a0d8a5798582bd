//! Persistence boundary.
//!
//! Every state change the pipeline makes is one atomic call on these traits:
//! job writes are compare-and-set on `version`, quota changes are a single
//! read-modify-write, and ledger appends are serialized per wallet. Two
//! implementations exist: [`MemoryStore`] for tests and single-process use,
//! and [`PgStore`] for PostgreSQL.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::admission::{AutoApplyConfig, QuotaDecision};
use crate::error::Result;
use crate::jobs::{AutoApplyJob, JobStatus};
use crate::ledger::{CreditType, CreditWallet, LedgerEntry, LedgerMutation, LedgerOperation};
use crate::pagination::OffsetPagination;

// ═══════════════════════════════════════════════════════════════════════════════
// Query Types
// ═══════════════════════════════════════════════════════════════════════════════

/// Filters for listing a user's jobs. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobFilter {
    pub statuses: Vec<JobStatus>,
    pub min_fit_score: Option<u32>,
    pub max_fit_score: Option<u32>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

impl JobFilter {
    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.statuses.push(status);
        self
    }

    pub fn with_fit_range(mut self, min: Option<u32>, max: Option<u32>) -> Self {
        self.min_fit_score = min;
        self.max_fit_score = max;
        self
    }

    pub fn created_between(mut self, after: Option<DateTime<Utc>>, before: Option<DateTime<Utc>>) -> Self {
        self.created_after = after;
        self.created_before = before;
        self
    }

    pub fn matches(&self, job: &AutoApplyJob) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&job.status))
            && self.min_fit_score.map_or(true, |min| job.fit_score >= min)
            && self.max_fit_score.map_or(true, |max| job.fit_score <= max)
            && self.created_after.map_or(true, |after| job.created_at >= after)
            && self.created_before.map_or(true, |before| job.created_at < before)
    }
}

/// Position in the dispatch order, taken from the last record of a page.
///
/// Paging by key rather than offset keeps the walk stable while earlier
/// records leave the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueCursor {
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub id: Uuid,
}

impl QueueCursor {
    pub fn after(job: &AutoApplyJob) -> Self {
        Self {
            priority: job.priority,
            created_at: job.created_at,
            id: job.id,
        }
    }

    /// Whether `job` sorts strictly after this position.
    pub fn precedes(&self, job: &AutoApplyJob) -> bool {
        (job.priority, std::cmp::Reverse(job.created_at), std::cmp::Reverse(job.id))
            < (self.priority, std::cmp::Reverse(self.created_at), std::cmp::Reverse(self.id))
    }
}

/// Per-user aggregate over all stored jobs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub counts: BTreeMap<JobStatus, u64>,
    /// `None` when the user has no jobs
    pub average_fit_score: Option<f64>,
}

impl JobSummary {
    pub fn count(&self, status: JobStatus) -> u64 {
        self.counts.get(&status).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }
}

/// Result of a ledger append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    /// A new entry was written
    Recorded(LedgerEntry),
    /// The (reference, operation) pair was already recorded; nothing changed
    AlreadyRecorded(LedgerEntry),
}

impl AppendOutcome {
    pub fn entry(&self) -> &LedgerEntry {
        match self {
            Self::Recorded(entry) | Self::AlreadyRecorded(entry) => entry,
        }
    }

    pub fn into_entry(self) -> LedgerEntry {
        match self {
            Self::Recorded(entry) | Self::AlreadyRecorded(entry) => entry,
        }
    }

    pub fn is_recorded(&self) -> bool {
        matches!(self, Self::Recorded(_))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Store Traits
// ═══════════════════════════════════════════════════════════════════════════════

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job. Fails with `DuplicateJob` while another queued,
    /// processing or applied job exists for the same (user, posting).
    async fn insert(&self, job: &AutoApplyJob) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<AutoApplyJob>>;

    /// Queued jobs by priority (descending), then age (oldest first), then id,
    /// starting after `after` when given.
    async fn list_queued(&self, after: Option<&QueueCursor>, limit: usize) -> Result<Vec<AutoApplyJob>>;

    async fn count_queued(&self) -> Result<usize>;

    /// Persist `job` if the stored version still equals `job.version`.
    ///
    /// Returns the stored copy with the bumped version, or `None` when another
    /// writer got there first.
    async fn save_if_version(&self, job: &AutoApplyJob) -> Result<Option<AutoApplyJob>>;

    /// A page of a user's jobs, newest first, plus the total match count.
    async fn query(
        &self,
        user_id: &str,
        filter: &JobFilter,
        pagination: &OffsetPagination,
    ) -> Result<(Vec<AutoApplyJob>, u64)>;

    async fn summary(&self, user_id: &str) -> Result<JobSummary>;

    /// Processing jobs whose `started_at` is older than `started_before`.
    async fn list_stale_processing(&self, started_before: DateTime<Utc>, limit: usize) -> Result<Vec<AutoApplyJob>>;

    /// Delete terminal jobs last updated before `cutoff`. Returns the count removed.
    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get(&self, user_id: &str) -> Result<Option<AutoApplyConfig>>;

    /// Upsert user-editable fields. Stored quota counters are preserved.
    async fn put(&self, config: AutoApplyConfig, now: DateTime<Utc>) -> Result<AutoApplyConfig>;

    /// Roll, check and increment the user's counters as one atomic step.
    async fn try_consume_quota(&self, user_id: &str, now: DateTime<Utc>) -> Result<QuotaDecision>;

    /// Return a reservation that was not used.
    async fn release_quota(&self, user_id: &str, now: DateTime<Utc>) -> Result<()>;
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Current wallet; an empty wallet when the user has no history.
    async fn wallet(&self, user_id: &str, credit_type: CreditType) -> Result<CreditWallet>;

    /// Price and persist one mutation, serialized per (user, credit type).
    ///
    /// Deducts and refunds carrying a reference are recorded at most once per
    /// (reference, operation); replays return the original entry.
    async fn append(
        &self,
        user_id: &str,
        credit_type: CreditType,
        mutation: &LedgerMutation,
        now: DateTime<Utc>,
    ) -> Result<AppendOutcome>;

    /// Entries in append order, optionally only those created at or after `since`.
    async fn entries(
        &self,
        user_id: &str,
        credit_type: CreditType,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<LedgerEntry>>;

    /// A page of entries, newest first, plus the total count.
    async fn entries_page(
        &self,
        user_id: &str,
        credit_type: CreditType,
        pagination: &OffsetPagination,
    ) -> Result<(Vec<LedgerEntry>, u64)>;

    async fn find_by_reference(
        &self,
        user_id: &str,
        credit_type: CreditType,
        reference_id: &str,
        operation: LedgerOperation,
    ) -> Result<Option<LedgerEntry>>;
}

/// The three store handles the pipeline works with.
#[derive(Clone)]
pub struct Stores {
    pub jobs: Arc<dyn JobStore>,
    pub configs: Arc<dyn ConfigStore>,
    pub ledger: Arc<dyn LedgerStore>,
}

impl Stores {
    pub fn memory() -> Self {
        Self::from_shared(Arc::new(MemoryStore::new()))
    }

    /// Use one backend for every store.
    pub fn from_shared<S>(store: Arc<S>) -> Self
    where
        S: JobStore + ConfigStore + LedgerStore + 'static,
    {
        Self {
            jobs: store.clone(),
            configs: store.clone(),
            ledger: store,
        }
    }
}

impl std::fmt::Debug for Stores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stores").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_matches() {
        let now = Utc::now();
        let job = AutoApplyJob::new("u-1", "p-1", 72, now);

        assert!(JobFilter::default().matches(&job));
        assert!(JobFilter::default().with_status(JobStatus::Queued).matches(&job));
        assert!(!JobFilter::default().with_status(JobStatus::Applied).matches(&job));
        assert!(JobFilter::default().with_fit_range(Some(70), Some(80)).matches(&job));
        assert!(!JobFilter::default().with_fit_range(Some(73), None).matches(&job));
        assert!(!JobFilter::default()
            .created_between(None, Some(now))
            .matches(&job));
    }

    #[test]
    fn test_summary_counts() {
        let mut summary = JobSummary::default();
        summary.counts.insert(JobStatus::Applied, 3);
        summary.counts.insert(JobStatus::Failed, 1);
        assert_eq!(summary.count(JobStatus::Applied), 3);
        assert_eq!(summary.count(JobStatus::Queued), 0);
        assert_eq!(summary.total(), 4);
    }
}
