//! Charging and refunding auto-apply jobs.
//!
//! Every charge and refund of a job uses the job id as ledger reference, so
//! a job is charged at most once and refunded at most once no matter how
//! many times a step is replayed.

use chrono::{DateTime, Utc};

use super::job::AutoApplyJob;
use crate::config::{BillingConfig, ChargePolicy};
use crate::error::{ErrorCode, Result};
use crate::ledger::{CreditLedger, CreditType};

/// What happened when a job was charged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeOutcome {
    /// A new deduction was written
    Charged,
    /// The job had already been charged
    AlreadyCharged,
    /// The wallet could not cover the cost; nothing was written
    Insufficient,
}

#[derive(Debug, Clone)]
pub struct JobBilling {
    ledger: CreditLedger,
    config: BillingConfig,
}

impl JobBilling {
    pub fn new(ledger: CreditLedger, config: BillingConfig) -> Self {
        Self { ledger, config }
    }

    pub fn policy(&self) -> ChargePolicy {
        self.config.charge_policy
    }

    pub fn ledger(&self) -> &CreditLedger {
        &self.ledger
    }

    /// Deduct the application cost for `job` and stamp `credits_used`.
    pub async fn charge(&self, job: &mut AutoApplyJob) -> Result<ChargeOutcome> {
        if job.credits_used > 0 {
            return Ok(ChargeOutcome::AlreadyCharged);
        }

        let description = format!("Auto-apply to {}", job.job_id);
        let reference = job.ledger_reference();
        let result = self
            .ledger
            .deduct(
                &job.user_id,
                CreditType::AutoApply,
                self.config.credit_cost,
                &description,
                Some(&reference),
            )
            .await;

        match result {
            Ok(outcome) => {
                job.credits_used = outcome.entry().amount.abs();
                Ok(if outcome.is_recorded() {
                    ChargeOutcome::Charged
                } else {
                    ChargeOutcome::AlreadyCharged
                })
            }
            Err(e) if e.code() == ErrorCode::InsufficientCredits => Ok(ChargeOutcome::Insufficient),
            Err(e) => Err(e),
        }
    }

    /// Return whatever the ledger holds as charged for `job`.
    ///
    /// Looks the charge up in the ledger rather than trusting `credits_used`,
    /// so a charge written just before a crash is still found. Returns `true`
    /// when a refund exists afterwards.
    pub async fn refund(&self, job: &mut AutoApplyJob, reason: &str) -> Result<bool> {
        let outcome = self
            .ledger
            .refund_charge(&job.user_id, CreditType::AutoApply, &job.ledger_reference(), reason)
            .await?;

        match outcome {
            Some(outcome) => {
                job.credits_used = job.credits_used.max(outcome.entry().amount);
                job.credits_refunded = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Refund and move a failed or applied job to `refunded`.
    pub async fn refund_and_mark(&self, job: &mut AutoApplyJob, reason: &str, now: DateTime<Utc>) -> Result<bool> {
        let refunded = self.refund(job, reason).await?;
        if refunded {
            job.mark_refunded(reason, now)?;
        }
        Ok(refunded)
    }
}
