//! Credit ledger.
//!
//! Balances live in per-(user, credit type) wallets; every change is an
//! immutable [`LedgerEntry`] appended through the [`LedgerStore`]. Charges
//! and refunds tied to a job carry its id as reference, which makes replays
//! harmless.

pub mod wallet;

pub use wallet::{
    verify_history, CreditType, CreditWallet, LedgerEntry, LedgerMutation, LedgerOperation, UNLIMITED,
};

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{ErrorCode, Result};
use crate::pagination::{OffsetPagination, Page};
use crate::store::{AppendOutcome, LedgerStore};
use crate::telemetry::PipelineMetrics;

/// Service over the ledger store.
#[derive(Clone)]
pub struct CreditLedger {
    store: Arc<dyn LedgerStore>,
}

impl CreditLedger {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    pub async fn wallet(&self, user_id: &str, credit_type: CreditType) -> Result<CreditWallet> {
        self.store.wallet(user_id, credit_type).await
    }

    /// Current balance, or [`UNLIMITED`].
    pub async fn balance(&self, user_id: &str, credit_type: CreditType) -> Result<i64> {
        Ok(self.store.wallet(user_id, credit_type).await?.balance)
    }

    pub async fn deduct(
        &self,
        user_id: &str,
        credit_type: CreditType,
        amount: i64,
        description: &str,
        reference_id: Option<&str>,
    ) -> Result<AppendOutcome> {
        let mutation = with_optional_reference(LedgerMutation::deduct(amount, description), reference_id);
        self.append(user_id, credit_type, mutation).await
    }

    pub async fn add(
        &self,
        user_id: &str,
        credit_type: CreditType,
        amount: i64,
        description: &str,
        reference_id: Option<&str>,
    ) -> Result<AppendOutcome> {
        let mutation = with_optional_reference(LedgerMutation::add(amount, description), reference_id);
        self.append(user_id, credit_type, mutation).await
    }

    pub async fn refund(
        &self,
        user_id: &str,
        credit_type: CreditType,
        amount: i64,
        description: &str,
        reference_id: Option<&str>,
    ) -> Result<AppendOutcome> {
        let mutation = with_optional_reference(LedgerMutation::refund(amount, description), reference_id);
        self.append(user_id, credit_type, mutation).await
    }

    /// Set the balance outright. `new_balance` may be [`UNLIMITED`].
    pub async fn reset(
        &self,
        user_id: &str,
        credit_type: CreditType,
        new_balance: i64,
        description: &str,
    ) -> Result<LedgerEntry> {
        let outcome = self
            .append(user_id, credit_type, LedgerMutation::reset(new_balance, description))
            .await?;
        Ok(outcome.into_entry())
    }

    /// Give back whatever was deducted under `reference_id`.
    ///
    /// Returns `None` when nothing was charged under that reference. A second
    /// call returns the original refund as [`AppendOutcome::AlreadyRecorded`].
    pub async fn refund_charge(
        &self,
        user_id: &str,
        credit_type: CreditType,
        reference_id: &str,
        description: &str,
    ) -> Result<Option<AppendOutcome>> {
        let Some(charge) = self
            .store
            .find_by_reference(user_id, credit_type, reference_id, LedgerOperation::Deduct)
            .await?
        else {
            return Ok(None);
        };

        let amount = charge.amount.abs();
        let outcome = self
            .refund(user_id, credit_type, amount, description, Some(reference_id))
            .await?;
        Ok(Some(outcome))
    }

    /// Full history in append order.
    pub async fn history(&self, user_id: &str, credit_type: CreditType) -> Result<Vec<LedgerEntry>> {
        self.store.entries(user_id, credit_type, None).await
    }

    /// Newest entries first.
    pub async fn history_page(
        &self,
        user_id: &str,
        credit_type: CreditType,
        pagination: &OffsetPagination,
    ) -> Result<Page<LedgerEntry>> {
        pagination.validate()?;
        let (entries, total) = self.store.entries_page(user_id, credit_type, pagination).await?;
        Ok(Page::new(entries, pagination, total))
    }

    /// Replay the history and compare it with the stored balance.
    pub async fn verify(&self, user_id: &str, credit_type: CreditType) -> Result<()> {
        let wallet = self.store.wallet(user_id, credit_type).await?;
        let entries = self.store.entries(user_id, credit_type, None).await?;

        let result = verify_history(&entries, wallet.balance);
        if let Err(e) = &result {
            e.log();
        }
        result
    }

    /// Credits consumed since `since`: deductions minus refunds.
    pub async fn usage_since(
        &self,
        user_id: &str,
        credit_type: CreditType,
        since: DateTime<Utc>,
    ) -> Result<i64> {
        let entries = self.store.entries(user_id, credit_type, Some(since)).await?;
        let net: i64 = entries
            .iter()
            .filter_map(|e| match e.operation {
                LedgerOperation::Deduct | LedgerOperation::Refund => Some(-e.amount),
                _ => None,
            })
            .sum();
        Ok(net.max(0))
    }

    async fn append(
        &self,
        user_id: &str,
        credit_type: CreditType,
        mutation: LedgerMutation,
    ) -> Result<AppendOutcome> {
        let result = self.store.append(user_id, credit_type, &mutation, Utc::now()).await;

        match &result {
            Ok(AppendOutcome::Recorded(entry)) => {
                PipelineMetrics::record_credit_movement(
                    credit_type.as_str(),
                    entry.operation.as_str(),
                    entry.amount,
                );
                info!(
                    user_id = %user_id,
                    credit_type = %credit_type,
                    operation = %entry.operation,
                    amount = entry.amount,
                    balance_after = entry.balance_after,
                    reference_id = ?entry.reference_id,
                    "Ledger entry recorded"
                );
            }
            Ok(AppendOutcome::AlreadyRecorded(entry)) => {
                debug!(
                    user_id = %user_id,
                    operation = %entry.operation,
                    reference_id = ?entry.reference_id,
                    "Ledger entry already recorded"
                );
            }
            Err(e) if e.code() == ErrorCode::InsufficientCredits => {
                warn!(
                    user_id = %user_id,
                    credit_type = %credit_type,
                    requested = mutation.amount,
                    "Insufficient credits"
                );
            }
            Err(e) => e.log(),
        }

        result
    }
}

fn with_optional_reference(mutation: LedgerMutation, reference_id: Option<&str>) -> LedgerMutation {
    match reference_id {
        Some(reference) => mutation.with_reference(reference),
        None => mutation,
    }
}

impl std::fmt::Debug for CreditLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreditLedger").finish_non_exhaustive()
    }
}
