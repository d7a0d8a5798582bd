//! PostgreSQL store.
//!
//! Job updates are version-guarded `UPDATE`s. Quota and ledger writes lock
//! their row with `SELECT … FOR UPDATE` inside a transaction and reuse
//! the pure bookkeeping from [`AutoApplyConfig`] and [`CreditWallet`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use super::{AppendOutcome, ConfigStore, JobFilter, JobStore, JobSummary, LedgerStore, QueueCursor};
use crate::admission::{AutoApplyConfig, QuotaCounters, QuotaDecision};
use crate::config::DatabaseConfig;
use crate::error::{AutoApplyError, Result};
use crate::jobs::AutoApplyJob;
use crate::ledger::{CreditType, CreditWallet, LedgerEntry, LedgerMutation, LedgerOperation};
use crate::pagination::OffsetPagination;

const ACTIVE_JOB_CONSTRAINT: &str = "auto_apply_jobs_active_unique";

const JOB_COLUMNS: &str = "id, user_id, job_id, status, priority, fit_score, credits_used, \
    credits_refunded, attempts, max_attempts, error_type, error_message, last_error_at, \
    user_approved, application_reference, refund_reason, version, created_at, updated_at, \
    started_at, completed_at";

const CONFIG_COLUMNS: &str =
    "settings, daily_count, weekly_count, last_daily_reset, last_weekly_reset, updated_at";

const LEDGER_COLUMNS: &str =
    "id, user_id, credit_type, amount, balance_after, operation, description, reference_id, created_at";

/// PostgreSQL-backed implementation of every store trait.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Create a connection pool from configuration.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run embedded migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn violates(error: &sqlx::Error, constraint: &str) -> bool {
    match error {
        sqlx::Error::Database(db_err) => db_err.constraint() == Some(constraint),
        _ => false,
    }
}

fn to_i32(value: u32, field: &str) -> Result<i32> {
    i32::try_from(value).map_err(|_| AutoApplyError::invalid_field(field, "value out of range"))
}

/// LIMIT and OFFSET binds; anything past `i64::MAX` already means "all rows".
fn to_i64<T: TryInto<i64>>(value: T) -> i64 {
    value.try_into().unwrap_or(i64::MAX)
}

fn to_u32(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Row Types
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    user_id: String,
    job_id: String,
    status: String,
    priority: i32,
    fit_score: i32,
    credits_used: i64,
    credits_refunded: bool,
    attempts: i32,
    max_attempts: i32,
    error_type: Option<String>,
    error_message: Option<String>,
    last_error_at: Option<DateTime<Utc>>,
    user_approved: bool,
    application_reference: Option<String>,
    refund_reason: Option<String>,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for AutoApplyJob {
    type Error = AutoApplyError;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            user_id: row.user_id,
            job_id: row.job_id,
            status: row.status.parse()?,
            priority: row.priority,
            fit_score: to_u32(row.fit_score),
            credits_used: row.credits_used,
            credits_refunded: row.credits_refunded,
            attempts: to_u32(row.attempts),
            max_attempts: to_u32(row.max_attempts),
            error_type: row.error_type.map(|t| t.parse()).transpose()?,
            error_message: row.error_message,
            last_error_at: row.last_error_at,
            user_approved: row.user_approved,
            application_reference: row.application_reference,
            refund_reason: row.refund_reason,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ConfigRow {
    settings: serde_json::Value,
    daily_count: i32,
    weekly_count: i32,
    last_daily_reset: Option<DateTime<Utc>>,
    last_weekly_reset: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ConfigRow> for AutoApplyConfig {
    type Error = AutoApplyError;

    fn try_from(row: ConfigRow) -> Result<Self> {
        let mut config: AutoApplyConfig = serde_json::from_value(row.settings)?;
        config.quota = QuotaCounters {
            daily_count: to_u32(row.daily_count),
            weekly_count: to_u32(row.weekly_count),
            last_daily_reset: row.last_daily_reset,
            last_weekly_reset: row.last_weekly_reset,
        };
        config.updated_at = Some(row.updated_at);
        Ok(config)
    }
}

/// User-editable settings as stored in the JSONB column; counters live in their own columns.
fn settings_json(config: &AutoApplyConfig) -> Result<serde_json::Value> {
    let mut settings = config.clone();
    settings.quota = QuotaCounters::default();
    settings.updated_at = None;
    Ok(serde_json::to_value(&settings)?)
}

#[derive(Debug, sqlx::FromRow)]
struct LedgerRow {
    id: Uuid,
    user_id: String,
    credit_type: String,
    amount: i64,
    balance_after: i64,
    operation: String,
    description: String,
    reference_id: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<LedgerRow> for LedgerEntry {
    type Error = AutoApplyError;

    fn try_from(row: LedgerRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            user_id: row.user_id,
            credit_type: row.credit_type.parse()?,
            amount: row.amount,
            balance_after: row.balance_after,
            operation: row.operation.parse()?,
            description: row.description,
            reference_id: row.reference_id,
            created_at: row.created_at,
        })
    }
}

fn into_jobs(rows: Vec<JobRow>) -> Result<Vec<AutoApplyJob>> {
    rows.into_iter().map(AutoApplyJob::try_from).collect()
}

fn into_entries(rows: Vec<LedgerRow>) -> Result<Vec<LedgerEntry>> {
    rows.into_iter().map(LedgerEntry::try_from).collect()
}

fn push_job_filter<'a>(builder: &mut QueryBuilder<'a, Postgres>, user_id: &'a str, filter: &JobFilter) {
    builder.push(" WHERE user_id = ").push_bind(user_id);

    if !filter.statuses.is_empty() {
        let statuses: Vec<String> = filter.statuses.iter().map(|s| s.as_str().to_string()).collect();
        builder.push(" AND status = ANY(").push_bind(statuses).push(")");
    }
    if let Some(min) = filter.min_fit_score {
        builder.push(" AND fit_score >= ").push_bind(min as i32);
    }
    if let Some(max) = filter.max_fit_score {
        builder.push(" AND fit_score <= ").push_bind(max as i32);
    }
    if let Some(after) = filter.created_after {
        builder.push(" AND created_at >= ").push_bind(after);
    }
    if let Some(before) = filter.created_before {
        builder.push(" AND created_at < ").push_bind(before);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Jobs
// ═══════════════════════════════════════════════════════════════════════════════

#[async_trait]
impl JobStore for PgStore {
    async fn insert(&self, job: &AutoApplyJob) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO auto_apply_jobs (
                id, user_id, job_id, status, priority, fit_score, credits_used,
                credits_refunded, attempts, max_attempts, error_type, error_message,
                last_error_at, user_approved, application_reference, refund_reason,
                version, created_at, updated_at, started_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21)
            "#,
        )
        .bind(job.id)
        .bind(&job.user_id)
        .bind(&job.job_id)
        .bind(job.status.as_str())
        .bind(job.priority)
        .bind(to_i32(job.fit_score, "fit_score")?)
        .bind(job.credits_used)
        .bind(job.credits_refunded)
        .bind(to_i32(job.attempts, "attempts")?)
        .bind(to_i32(job.max_attempts, "max_attempts")?)
        .bind(job.error_type.map(|t| t.as_str()))
        .bind(&job.error_message)
        .bind(job.last_error_at)
        .bind(job.user_approved)
        .bind(&job.application_reference)
        .bind(&job.refund_reason)
        .bind(job.version)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if violates(&e, ACTIVE_JOB_CONSTRAINT) => {
                Err(AutoApplyError::duplicate_job(&job.user_id, &job.job_id))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<AutoApplyJob>> {
        let sql = format!("SELECT {} FROM auto_apply_jobs WHERE id = $1", JOB_COLUMNS);
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(AutoApplyJob::try_from).transpose()
    }

    async fn list_queued(&self, after: Option<&QueueCursor>, limit: usize) -> Result<Vec<AutoApplyJob>> {
        let mut select = QueryBuilder::<Postgres>::new(format!(
            "SELECT {} FROM auto_apply_jobs WHERE status = 'queued'",
            JOB_COLUMNS
        ));
        if let Some(cursor) = after {
            select
                .push(" AND (priority < ")
                .push_bind(cursor.priority)
                .push(" OR (priority = ")
                .push_bind(cursor.priority)
                .push(" AND (created_at, id) > (")
                .push_bind(cursor.created_at)
                .push(", ")
                .push_bind(cursor.id)
                .push(")))");
        }
        select
            .push(" ORDER BY priority DESC, created_at ASC, id ASC LIMIT ")
            .push_bind(to_i64(limit));
        let rows: Vec<JobRow> = select.build_query_as::<JobRow>().fetch_all(&self.pool).await?;

        into_jobs(rows)
    }

    async fn count_queued(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM auto_apply_jobs WHERE status = 'queued'")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as usize)
    }

    async fn save_if_version(&self, job: &AutoApplyJob) -> Result<Option<AutoApplyJob>> {
        let sql = format!(
            r#"
            UPDATE auto_apply_jobs
            SET status = $3, priority = $4, credits_used = $5, credits_refunded = $6,
                attempts = $7, max_attempts = $8, error_type = $9, error_message = $10,
                last_error_at = $11, user_approved = $12, application_reference = $13,
                refund_reason = $14, updated_at = $15, started_at = $16, completed_at = $17,
                version = version + 1
            WHERE id = $1 AND version = $2
            RETURNING {}
            "#,
            JOB_COLUMNS
        );

        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(job.id)
            .bind(job.version)
            .bind(job.status.as_str())
            .bind(job.priority)
            .bind(job.credits_used)
            .bind(job.credits_refunded)
            .bind(to_i32(job.attempts, "attempts")?)
            .bind(to_i32(job.max_attempts, "max_attempts")?)
            .bind(job.error_type.map(|t| t.as_str()))
            .bind(&job.error_message)
            .bind(job.last_error_at)
            .bind(job.user_approved)
            .bind(&job.application_reference)
            .bind(&job.refund_reason)
            .bind(job.updated_at)
            .bind(job.started_at)
            .bind(job.completed_at)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(row.try_into()?)),
            None if JobStore::get(self, job.id).await?.is_some() => Ok(None),
            None => Err(AutoApplyError::job_not_found(job.id)),
        }
    }

    async fn query(
        &self,
        user_id: &str,
        filter: &JobFilter,
        pagination: &OffsetPagination,
    ) -> Result<(Vec<AutoApplyJob>, u64)> {
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM auto_apply_jobs");
        push_job_filter(&mut count, user_id, filter);
        let total: i64 = count.build_query_scalar::<i64>().fetch_one(&self.pool).await?;

        let mut select = QueryBuilder::<Postgres>::new(format!("SELECT {} FROM auto_apply_jobs", JOB_COLUMNS));
        push_job_filter(&mut select, user_id, filter);
        select
            .push(" ORDER BY created_at DESC, id ASC LIMIT ")
            .push_bind(to_i64(pagination.limit()))
            .push(" OFFSET ")
            .push_bind(to_i64(pagination.offset()));
        let rows: Vec<JobRow> = select.build_query_as::<JobRow>().fetch_all(&self.pool).await?;

        Ok((into_jobs(rows)?, total.max(0) as u64))
    }

    async fn summary(&self, user_id: &str) -> Result<JobSummary> {
        let rows: Vec<(String, i64, i64)> = sqlx::query_as(
            r#"
            SELECT status, COUNT(*), COALESCE(SUM(fit_score), 0)::BIGINT
            FROM auto_apply_jobs
            WHERE user_id = $1
            GROUP BY status
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut summary = JobSummary::default();
        let mut fit_total = 0i64;
        for (status, count, fit_sum) in rows {
            summary.counts.insert(status.parse()?, count.max(0) as u64);
            fit_total += fit_sum;
        }

        let count = summary.total();
        if count > 0 {
            summary.average_fit_score = Some(fit_total as f64 / count as f64);
        }
        Ok(summary)
    }

    async fn list_stale_processing(&self, started_before: DateTime<Utc>, limit: usize) -> Result<Vec<AutoApplyJob>> {
        let sql = format!(
            "SELECT {} FROM auto_apply_jobs \
             WHERE status = 'processing' AND (started_at IS NULL OR started_at < $1) \
             ORDER BY started_at ASC NULLS FIRST LIMIT $2",
            JOB_COLUMNS
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(started_before)
            .bind(to_i64(limit))
            .fetch_all(&self.pool)
            .await?;

        into_jobs(rows)
    }

    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM auto_apply_jobs
            WHERE status IN ('applied', 'failed', 'refunded', 'cancelled')
              AND updated_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Configs
// ═══════════════════════════════════════════════════════════════════════════════

impl PgStore {
    async fn update_counters(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        config: &AutoApplyConfig,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE auto_apply_configs
            SET daily_count = $2, weekly_count = $3, last_daily_reset = $4, last_weekly_reset = $5
            WHERE user_id = $1
            "#,
        )
        .bind(&config.user_id)
        .bind(to_i32(config.quota.daily_count, "daily_count")?)
        .bind(to_i32(config.quota.weekly_count, "weekly_count")?)
        .bind(config.quota.last_daily_reset)
        .bind(config.quota.last_weekly_reset)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    async fn lock_config(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        user_id: &str,
    ) -> Result<AutoApplyConfig> {
        let sql = format!(
            "SELECT {} FROM auto_apply_configs WHERE user_id = $1 FOR UPDATE",
            CONFIG_COLUMNS
        );
        let row = sqlx::query_as::<_, ConfigRow>(&sql)
            .bind(user_id)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or_else(|| AutoApplyError::config_not_found(user_id))?;

        row.try_into()
    }
}

#[async_trait]
impl ConfigStore for PgStore {
    async fn get(&self, user_id: &str) -> Result<Option<AutoApplyConfig>> {
        let sql = format!("SELECT {} FROM auto_apply_configs WHERE user_id = $1", CONFIG_COLUMNS);
        let row = sqlx::query_as::<_, ConfigRow>(&sql)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(AutoApplyConfig::try_from).transpose()
    }

    async fn put(&self, config: AutoApplyConfig, now: DateTime<Utc>) -> Result<AutoApplyConfig> {
        let sql = format!(
            r#"
            INSERT INTO auto_apply_configs (user_id, settings, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id) DO UPDATE
            SET settings = EXCLUDED.settings, updated_at = EXCLUDED.updated_at
            RETURNING {}
            "#,
            CONFIG_COLUMNS
        );
        let row = sqlx::query_as::<_, ConfigRow>(&sql)
            .bind(&config.user_id)
            .bind(settings_json(&config)?)
            .bind(now)
            .fetch_one(&self.pool)
            .await?;

        row.try_into()
    }

    async fn try_consume_quota(&self, user_id: &str, now: DateTime<Utc>) -> Result<QuotaDecision> {
        let mut tx = self.pool.begin().await?;
        let mut config = Self::lock_config(&mut tx, user_id).await?;

        let decision = config.try_consume(now);
        // Persist even on refusal: the roll may have moved the reset stamps.
        Self::update_counters(&mut tx, &config).await?;
        tx.commit().await?;

        Ok(decision)
    }

    async fn release_quota(&self, user_id: &str, now: DateTime<Utc>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let mut config = Self::lock_config(&mut tx, user_id).await?;

        config.release(now);
        Self::update_counters(&mut tx, &config).await?;
        tx.commit().await?;

        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Ledger
// ═══════════════════════════════════════════════════════════════════════════════

#[async_trait]
impl LedgerStore for PgStore {
    async fn wallet(&self, user_id: &str, credit_type: CreditType) -> Result<CreditWallet> {
        let row: Option<(i64, Option<DateTime<Utc>>)> = sqlx::query_as(
            "SELECT balance, updated_at FROM credit_wallets WHERE user_id = $1 AND credit_type = $2",
        )
        .bind(user_id)
        .bind(credit_type.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some((balance, updated_at)) => CreditWallet {
                user_id: user_id.to_string(),
                credit_type,
                balance,
                updated_at,
            },
            None => CreditWallet::empty(user_id, credit_type),
        })
    }

    async fn append(
        &self,
        user_id: &str,
        credit_type: CreditType,
        mutation: &LedgerMutation,
        now: DateTime<Utc>,
    ) -> Result<AppendOutcome> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO credit_wallets (user_id, credit_type) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(user_id)
        .bind(credit_type.as_str())
        .execute(&mut *tx)
        .await?;

        let (balance, updated_at): (i64, Option<DateTime<Utc>>) = sqlx::query_as(
            "SELECT balance, updated_at FROM credit_wallets WHERE user_id = $1 AND credit_type = $2 FOR UPDATE",
        )
        .bind(user_id)
        .bind(credit_type.as_str())
        .fetch_one(&mut *tx)
        .await?;

        if let (true, Some(reference)) = (mutation.operation.is_idempotent(), mutation.reference_id.as_deref()) {
            let sql = format!(
                "SELECT {} FROM credit_ledger \
                 WHERE user_id = $1 AND credit_type = $2 AND reference_id = $3 AND operation = $4",
                LEDGER_COLUMNS
            );
            let existing = sqlx::query_as::<_, LedgerRow>(&sql)
                .bind(user_id)
                .bind(credit_type.as_str())
                .bind(reference)
                .bind(mutation.operation.as_str())
                .fetch_optional(&mut *tx)
                .await?;

            if let Some(row) = existing {
                tx.rollback().await?;
                return Ok(AppendOutcome::AlreadyRecorded(row.try_into()?));
            }
        }

        let wallet = CreditWallet {
            user_id: user_id.to_string(),
            credit_type,
            balance,
            updated_at,
        };
        // Dropping the transaction on error rolls it back.
        let entry = wallet.apply(mutation, now)?;

        sqlx::query(
            r#"
            INSERT INTO credit_ledger (
                id, user_id, credit_type, amount, balance_after, operation,
                description, reference_id, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(entry.id)
        .bind(&entry.user_id)
        .bind(entry.credit_type.as_str())
        .bind(entry.amount)
        .bind(entry.balance_after)
        .bind(entry.operation.as_str())
        .bind(&entry.description)
        .bind(&entry.reference_id)
        .bind(entry.created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE credit_wallets SET balance = $3, updated_at = $4 WHERE user_id = $1 AND credit_type = $2",
        )
        .bind(user_id)
        .bind(credit_type.as_str())
        .bind(entry.balance_after)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(AppendOutcome::Recorded(entry))
    }

    async fn entries(
        &self,
        user_id: &str,
        credit_type: CreditType,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<LedgerEntry>> {
        let sql = format!(
            "SELECT {} FROM credit_ledger \
             WHERE user_id = $1 AND credit_type = $2 AND ($3::TIMESTAMPTZ IS NULL OR created_at >= $3) \
             ORDER BY seq ASC",
            LEDGER_COLUMNS
        );
        let rows = sqlx::query_as::<_, LedgerRow>(&sql)
            .bind(user_id)
            .bind(credit_type.as_str())
            .bind(since)
            .fetch_all(&self.pool)
            .await?;

        into_entries(rows)
    }

    async fn entries_page(
        &self,
        user_id: &str,
        credit_type: CreditType,
        pagination: &OffsetPagination,
    ) -> Result<(Vec<LedgerEntry>, u64)> {
        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM credit_ledger WHERE user_id = $1 AND credit_type = $2",
        )
        .bind(user_id)
        .bind(credit_type.as_str())
        .fetch_one(&self.pool)
        .await?;

        let sql = format!(
            "SELECT {} FROM credit_ledger WHERE user_id = $1 AND credit_type = $2 \
             ORDER BY seq DESC LIMIT $3 OFFSET $4",
            LEDGER_COLUMNS
        );
        let rows = sqlx::query_as::<_, LedgerRow>(&sql)
            .bind(user_id)
            .bind(credit_type.as_str())
            .bind(to_i64(pagination.limit()))
            .bind(to_i64(pagination.offset()))
            .fetch_all(&self.pool)
            .await?;

        Ok((into_entries(rows)?, total.max(0) as u64))
    }

    async fn find_by_reference(
        &self,
        user_id: &str,
        credit_type: CreditType,
        reference_id: &str,
        operation: LedgerOperation,
    ) -> Result<Option<LedgerEntry>> {
        let sql = format!(
            "SELECT {} FROM credit_ledger \
             WHERE user_id = $1 AND credit_type = $2 AND reference_id = $3 AND operation = $4 \
             ORDER BY seq ASC LIMIT 1",
            LEDGER_COLUMNS
        );
        let row = sqlx::query_as::<_, LedgerRow>(&sql)
            .bind(user_id)
            .bind(credit_type.as_str())
            .bind(reference_id)
            .bind(operation.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.map(LedgerEntry::try_from).transpose()
    }
}
