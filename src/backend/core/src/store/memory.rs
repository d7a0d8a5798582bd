//! In-process store.
//!
//! Jobs and configs sit behind `parking_lot` locks; each wallet has its own
//! mutex in a `DashMap`, so ledger writes for different wallets never contend.
//! No lock is held across an `.await`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use super::{AppendOutcome, ConfigStore, JobFilter, JobStore, JobSummary, LedgerStore, QueueCursor};
use crate::admission::{AutoApplyConfig, QuotaDecision};
use crate::error::{AutoApplyError, Result};
use crate::jobs::{AutoApplyJob, JobStatus};
use crate::ledger::{CreditType, CreditWallet, LedgerEntry, LedgerMutation, LedgerOperation};
use crate::pagination::OffsetPagination;

#[derive(Debug)]
struct WalletState {
    wallet: CreditWallet,
    entries: Vec<LedgerEntry>,
}

type WalletKey = (String, CreditType);

#[derive(Debug, Default)]
pub struct MemoryStore {
    jobs: RwLock<HashMap<Uuid, AutoApplyJob>>,
    configs: Mutex<HashMap<String, AutoApplyConfig>>,
    wallets: DashMap<WalletKey, Arc<Mutex<WalletState>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn wallet_slot(&self, user_id: &str, credit_type: CreditType) -> Arc<Mutex<WalletState>> {
        self.wallets
            .entry((user_id.to_string(), credit_type))
            .or_insert_with(|| {
                Arc::new(Mutex::new(WalletState {
                    wallet: CreditWallet::empty(user_id, credit_type),
                    entries: Vec::new(),
                }))
            })
            .clone()
    }

    fn existing_wallet(&self, user_id: &str, credit_type: CreditType) -> Option<Arc<Mutex<WalletState>>> {
        self.wallets
            .get(&(user_id.to_string(), credit_type))
            .map(|slot| slot.value().clone())
    }
}

fn queue_order(a: &AutoApplyJob, b: &AutoApplyJob) -> std::cmp::Ordering {
    b.priority
        .cmp(&a.priority)
        .then(a.created_at.cmp(&b.created_at))
        .then(a.id.cmp(&b.id))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Jobs
// ═══════════════════════════════════════════════════════════════════════════════

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert(&self, job: &AutoApplyJob) -> Result<()> {
        let mut jobs = self.jobs.write();

        let duplicate = jobs.values().any(|existing| {
            existing.user_id == job.user_id
                && existing.job_id == job.job_id
                && existing.status.blocks_duplicate()
        });
        if duplicate {
            return Err(AutoApplyError::duplicate_job(&job.user_id, &job.job_id));
        }
        if jobs.contains_key(&job.id) {
            return Err(AutoApplyError::concurrent_modification("auto_apply_job", job.id));
        }

        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<AutoApplyJob>> {
        Ok(self.jobs.read().get(&id).cloned())
    }

    async fn list_queued(&self, after: Option<&QueueCursor>, limit: usize) -> Result<Vec<AutoApplyJob>> {
        let mut queued: Vec<AutoApplyJob> = self
            .jobs
            .read()
            .values()
            .filter(|job| job.status == JobStatus::Queued)
            .filter(|job| after.map_or(true, |cursor| cursor.precedes(job)))
            .cloned()
            .collect();
        queued.sort_by(queue_order);
        queued.truncate(limit);
        Ok(queued)
    }

    async fn count_queued(&self) -> Result<usize> {
        Ok(self
            .jobs
            .read()
            .values()
            .filter(|job| job.status == JobStatus::Queued)
            .count())
    }

    async fn save_if_version(&self, job: &AutoApplyJob) -> Result<Option<AutoApplyJob>> {
        let mut jobs = self.jobs.write();
        let Some(current) = jobs.get_mut(&job.id) else {
            return Err(AutoApplyError::job_not_found(job.id));
        };
        if current.version != job.version {
            return Ok(None);
        }

        let mut stored = job.clone();
        stored.version += 1;
        *current = stored.clone();
        Ok(Some(stored))
    }

    async fn query(
        &self,
        user_id: &str,
        filter: &JobFilter,
        pagination: &OffsetPagination,
    ) -> Result<(Vec<AutoApplyJob>, u64)> {
        let mut matching: Vec<AutoApplyJob> = self
            .jobs
            .read()
            .values()
            .filter(|job| job.user_id == user_id && filter.matches(job))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));

        let total = matching.len() as u64;
        Ok((pagination.slice(matching), total))
    }

    async fn summary(&self, user_id: &str) -> Result<JobSummary> {
        let jobs = self.jobs.read();
        let mut summary = JobSummary::default();
        let mut fit_total = 0u64;

        for job in jobs.values().filter(|job| job.user_id == user_id) {
            *summary.counts.entry(job.status).or_default() += 1;
            fit_total += u64::from(job.fit_score);
        }

        let count = summary.total();
        if count > 0 {
            summary.average_fit_score = Some(fit_total as f64 / count as f64);
        }
        Ok(summary)
    }

    async fn list_stale_processing(&self, started_before: DateTime<Utc>, limit: usize) -> Result<Vec<AutoApplyJob>> {
        let mut stale: Vec<AutoApplyJob> = self
            .jobs
            .read()
            .values()
            .filter(|job| {
                job.status == JobStatus::Processing
                    && job.started_at.map_or(true, |started| started < started_before)
            })
            .cloned()
            .collect();
        stale.sort_by_key(|job| job.started_at);
        stale.truncate(limit);
        Ok(stale)
    }

    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut jobs = self.jobs.write();
        let before = jobs.len();
        jobs.retain(|_, job| !(job.status.is_terminal() && job.updated_at < cutoff));
        Ok((before - jobs.len()) as u64)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Configs
// ═══════════════════════════════════════════════════════════════════════════════

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn get(&self, user_id: &str) -> Result<Option<AutoApplyConfig>> {
        Ok(self.configs.lock().get(user_id).cloned())
    }

    async fn put(&self, config: AutoApplyConfig, now: DateTime<Utc>) -> Result<AutoApplyConfig> {
        let mut configs = self.configs.lock();
        let stored = match configs.get_mut(&config.user_id) {
            Some(existing) => {
                existing.merge_user_fields(config, now);
                existing.clone()
            }
            None => {
                let mut fresh = config;
                fresh.quota = Default::default();
                fresh.updated_at = Some(now);
                configs.insert(fresh.user_id.clone(), fresh.clone());
                fresh
            }
        };
        Ok(stored)
    }

    async fn try_consume_quota(&self, user_id: &str, now: DateTime<Utc>) -> Result<QuotaDecision> {
        let mut configs = self.configs.lock();
        let config = configs
            .get_mut(user_id)
            .ok_or_else(|| AutoApplyError::config_not_found(user_id))?;
        Ok(config.try_consume(now))
    }

    async fn release_quota(&self, user_id: &str, now: DateTime<Utc>) -> Result<()> {
        let mut configs = self.configs.lock();
        let config = configs
            .get_mut(user_id)
            .ok_or_else(|| AutoApplyError::config_not_found(user_id))?;
        config.release(now);
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Ledger
// ═══════════════════════════════════════════════════════════════════════════════

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn wallet(&self, user_id: &str, credit_type: CreditType) -> Result<CreditWallet> {
        Ok(self
            .existing_wallet(user_id, credit_type)
            .map(|slot| slot.lock().wallet.clone())
            .unwrap_or_else(|| CreditWallet::empty(user_id, credit_type)))
    }

    async fn append(
        &self,
        user_id: &str,
        credit_type: CreditType,
        mutation: &LedgerMutation,
        now: DateTime<Utc>,
    ) -> Result<AppendOutcome> {
        let slot = self.wallet_slot(user_id, credit_type);
        let mut state = slot.lock();

        if let (true, Some(reference)) = (mutation.operation.is_idempotent(), mutation.reference_id.as_deref()) {
            let replay = state
                .entries
                .iter()
                .find(|e| e.operation == mutation.operation && e.reference_id.as_deref() == Some(reference));
            if let Some(existing) = replay {
                return Ok(AppendOutcome::AlreadyRecorded(existing.clone()));
            }
        }

        let entry = state.wallet.apply(mutation, now)?;
        state.wallet.balance = entry.balance_after;
        state.wallet.updated_at = Some(now);
        state.entries.push(entry.clone());
        Ok(AppendOutcome::Recorded(entry))
    }

    async fn entries(
        &self,
        user_id: &str,
        credit_type: CreditType,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<LedgerEntry>> {
        let Some(slot) = self.existing_wallet(user_id, credit_type) else {
            return Ok(Vec::new());
        };
        let state = slot.lock();
        Ok(state
            .entries
            .iter()
            .filter(|e| since.map_or(true, |since| e.created_at >= since))
            .cloned()
            .collect())
    }

    async fn entries_page(
        &self,
        user_id: &str,
        credit_type: CreditType,
        pagination: &OffsetPagination,
    ) -> Result<(Vec<LedgerEntry>, u64)> {
        let Some(slot) = self.existing_wallet(user_id, credit_type) else {
            return Ok((Vec::new(), 0));
        };
        let state = slot.lock();
        let total = state.entries.len() as u64;
        let page = pagination.slice(state.entries.iter().rev().cloned());
        Ok((page, total))
    }

    async fn find_by_reference(
        &self,
        user_id: &str,
        credit_type: CreditType,
        reference_id: &str,
        operation: LedgerOperation,
    ) -> Result<Option<LedgerEntry>> {
        let Some(slot) = self.existing_wallet(user_id, credit_type) else {
            return Ok(None);
        };
        let state = slot.lock();
        Ok(state
            .entries
            .iter()
            .find(|e| e.operation == operation && e.reference_id.as_deref() == Some(reference_id))
            .cloned())
    }
}
