//! Wallet arithmetic and history auditing.
//!
//! Everything here is pure: stores call [`CreditWallet::apply`] inside their
//! per-wallet critical section and persist the resulting entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{AutoApplyError, Result};

/// Sentinel balance for an unlimited wallet.
pub const UNLIMITED: i64 = -1;

/// Credit buckets. Each user holds one wallet per type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditType {
    /// Spent by successful auto-apply submissions
    AutoApply,
    /// Spent by cover-letter and resume generation
    AiGeneration,
}

impl CreditType {
    pub const ALL: [CreditType; 2] = [CreditType::AutoApply, CreditType::AiGeneration];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AutoApply => "auto_apply",
            Self::AiGeneration => "ai_generation",
        }
    }
}

impl fmt::Display for CreditType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CreditType {
    type Err = AutoApplyError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto_apply" | "auto_apply_credits" => Ok(Self::AutoApply),
            "ai_generation" | "ai_credits" => Ok(Self::AiGeneration),
            other => Err(AutoApplyError::validation(format!("Unknown credit type: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerOperation {
    Deduct,
    Add,
    Refund,
    Reset,
}

impl LedgerOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deduct => "deduct",
            Self::Add => "add",
            Self::Refund => "refund",
            Self::Reset => "reset",
        }
    }

    /// Operations recorded at most once per reference id.
    pub fn is_idempotent(&self) -> bool {
        matches!(self, Self::Deduct | Self::Refund)
    }
}

impl fmt::Display for LedgerOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LedgerOperation {
    type Err = AutoApplyError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "deduct" => Ok(Self::Deduct),
            "add" => Ok(Self::Add),
            "refund" => Ok(Self::Refund),
            "reset" => Ok(Self::Reset),
            other => Err(AutoApplyError::internal(format!("Unknown ledger operation: {}", other))),
        }
    }
}

/// A requested change to a wallet, before it is priced against the balance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerMutation {
    pub operation: LedgerOperation,
    /// Positive credit count, or the new balance for `reset`
    pub amount: i64,
    pub description: String,
    pub reference_id: Option<String>,
}

impl LedgerMutation {
    pub fn deduct(amount: i64, description: impl Into<String>) -> Self {
        Self::new(LedgerOperation::Deduct, amount, description)
    }

    pub fn add(amount: i64, description: impl Into<String>) -> Self {
        Self::new(LedgerOperation::Add, amount, description)
    }

    pub fn refund(amount: i64, description: impl Into<String>) -> Self {
        Self::new(LedgerOperation::Refund, amount, description)
    }

    pub fn reset(new_balance: i64, description: impl Into<String>) -> Self {
        Self::new(LedgerOperation::Reset, new_balance, description)
    }

    fn new(operation: LedgerOperation, amount: i64, description: impl Into<String>) -> Self {
        Self {
            operation,
            amount,
            description: description.into(),
            reference_id: None,
        }
    }

    pub fn with_reference(mut self, reference_id: impl Into<String>) -> Self {
        self.reference_id = Some(reference_id.into());
        self
    }
}

/// Immutable ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub user_id: String,
    pub credit_type: CreditType,
    /// Signed change; negative for deductions
    pub amount: i64,
    pub balance_after: i64,
    pub operation: LedgerOperation,
    pub description: String,
    pub reference_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Current balance of one (user, credit type) wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditWallet {
    pub user_id: String,
    pub credit_type: CreditType,
    /// Non-negative, or [`UNLIMITED`]
    pub balance: i64,
    pub updated_at: Option<DateTime<Utc>>,
}

impl CreditWallet {
    /// A wallet with no history.
    pub fn empty(user_id: impl Into<String>, credit_type: CreditType) -> Self {
        Self {
            user_id: user_id.into(),
            credit_type,
            balance: 0,
            updated_at: None,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.balance == UNLIMITED
    }

    /// Price a mutation against this wallet and build the entry it produces.
    ///
    /// Returns the entry to persist; the wallet's new balance is its `balance_after`.
    /// A deduction past a finite balance fails and leaves nothing to persist.
    pub fn apply(&self, mutation: &LedgerMutation, now: DateTime<Utc>) -> Result<LedgerEntry> {
        let (amount, balance_after) = match mutation.operation {
            LedgerOperation::Deduct => {
                let n = positive(mutation.amount)?;
                if self.is_unlimited() {
                    (-n, UNLIMITED)
                } else if self.balance < n {
                    return Err(AutoApplyError::insufficient_credits(self.balance, n));
                } else {
                    (-n, self.balance - n)
                }
            }
            LedgerOperation::Add | LedgerOperation::Refund => {
                let n = positive(mutation.amount)?;
                if self.is_unlimited() {
                    (n, UNLIMITED)
                } else {
                    let after = self
                        .balance
                        .checked_add(n)
                        .ok_or_else(|| AutoApplyError::invalid_credit_amount(n))?;
                    (n, after)
                }
            }
            LedgerOperation::Reset => {
                let target = mutation.amount;
                if target < UNLIMITED {
                    return Err(AutoApplyError::invalid_credit_amount(target));
                }
                let amount = if self.is_unlimited() || target == UNLIMITED {
                    0
                } else {
                    target - self.balance
                };
                (amount, target)
            }
        };

        Ok(LedgerEntry {
            id: Uuid::new_v4(),
            user_id: self.user_id.clone(),
            credit_type: self.credit_type,
            amount,
            balance_after,
            operation: mutation.operation,
            description: mutation.description.clone(),
            reference_id: mutation.reference_id.clone(),
            created_at: now,
        })
    }
}

fn positive(amount: i64) -> Result<i64> {
    if amount > 0 {
        Ok(amount)
    } else {
        Err(AutoApplyError::invalid_credit_amount(amount))
    }
}

/// Replay a wallet's history and check it against the current balance.
///
/// Each non-reset entry must equal the running sum. Resets re-anchor the
/// running balance; their amount must be the difference when both sides are
/// finite and zero otherwise. Unlimited stretches only require
/// `balance_after == -1`.
pub fn verify_history(entries: &[LedgerEntry], current_balance: i64) -> Result<()> {
    let mut running: i64 = 0;

    for (index, entry) in entries.iter().enumerate() {
        let expected = match entry.operation {
            LedgerOperation::Reset => {
                let expected_amount = if running == UNLIMITED || entry.balance_after == UNLIMITED {
                    0
                } else {
                    entry.balance_after - running
                };
                if entry.amount != expected_amount {
                    return Err(AutoApplyError::ledger_inconsistency(format!(
                        "entry {} ({}): reset amount {} should be {}",
                        index, entry.id, entry.amount, expected_amount
                    )));
                }
                entry.balance_after
            }
            _ if running == UNLIMITED => UNLIMITED,
            _ => running + entry.amount,
        };

        if entry.balance_after != expected || (expected < 0 && expected != UNLIMITED) {
            return Err(AutoApplyError::ledger_inconsistency(format!(
                "entry {} ({}): balance_after {} but history implies {}",
                index, entry.id, entry.balance_after, expected
            )));
        }
        running = expected;
    }

    if running != current_balance {
        return Err(AutoApplyError::ledger_inconsistency(format!(
            "wallet balance {} but history ends at {}",
            current_balance, running
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    fn wallet(balance: i64) -> CreditWallet {
        CreditWallet {
            balance,
            ..CreditWallet::empty("u-1", CreditType::AutoApply)
        }
    }

    fn replay(start: CreditWallet, mutations: &[LedgerMutation]) -> (CreditWallet, Vec<LedgerEntry>) {
        let mut current = start;
        let mut entries = Vec::new();
        for mutation in mutations {
            let entry = current.apply(mutation, Utc::now()).unwrap();
            current.balance = entry.balance_after;
            entries.push(entry);
        }
        (current, entries)
    }

    #[test]
    fn test_deduct_signs_and_balance() {
        let entry = wallet(5).apply(&LedgerMutation::deduct(1, "apply"), Utc::now()).unwrap();
        assert_eq!(entry.amount, -1);
        assert_eq!(entry.balance_after, 4);
    }

    #[test]
    fn test_overdraft_is_rejected() {
        let err = wallet(0).apply(&LedgerMutation::deduct(1, "apply"), Utc::now()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InsufficientCredits);
    }

    #[test]
    fn test_unlimited_stays_unlimited() {
        let w = wallet(UNLIMITED);
        let deduct = w.apply(&LedgerMutation::deduct(3, "apply"), Utc::now()).unwrap();
        assert_eq!((deduct.amount, deduct.balance_after), (-3, UNLIMITED));

        let refund = w.apply(&LedgerMutation::refund(3, "refund"), Utc::now()).unwrap();
        assert_eq!(refund.balance_after, UNLIMITED);
    }

    #[test]
    fn test_reset_amounts() {
        let finite = wallet(7).apply(&LedgerMutation::reset(20, "plan"), Utc::now()).unwrap();
        assert_eq!((finite.amount, finite.balance_after), (13, 20));

        let to_unlimited = wallet(7).apply(&LedgerMutation::reset(UNLIMITED, "plan"), Utc::now()).unwrap();
        assert_eq!((to_unlimited.amount, to_unlimited.balance_after), (0, UNLIMITED));

        let from_unlimited = wallet(UNLIMITED).apply(&LedgerMutation::reset(10, "plan"), Utc::now()).unwrap();
        assert_eq!((from_unlimited.amount, from_unlimited.balance_after), (0, 10));
    }

    #[test]
    fn test_non_positive_amounts_rejected() {
        for mutation in [LedgerMutation::deduct(0, "x"), LedgerMutation::add(-2, "x")] {
            let err = wallet(5).apply(&mutation, Utc::now()).unwrap_err();
            assert_eq!(err.code(), ErrorCode::InvalidCreditAmount);
        }
        let err = wallet(5).apply(&LedgerMutation::reset(-5, "x"), Utc::now()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidCreditAmount);
    }

    #[test]
    fn test_verify_accepts_replayed_history() {
        let (end, entries) = replay(
            wallet(0),
            &[
                LedgerMutation::reset(5, "plan"),
                LedgerMutation::deduct(1, "apply"),
                LedgerMutation::refund(1, "refund"),
                LedgerMutation::reset(UNLIMITED, "upgrade"),
                LedgerMutation::deduct(4, "apply"),
                LedgerMutation::reset(2, "downgrade"),
                LedgerMutation::add(3, "top-up"),
            ],
        );
        assert_eq!(end.balance, 5);
        verify_history(&entries, end.balance).unwrap();
    }

    #[test]
    fn test_verify_detects_tampering() {
        let (end, mut entries) = replay(
            wallet(0),
            &[LedgerMutation::add(5, "grant"), LedgerMutation::deduct(2, "apply")],
        );
        entries[1].balance_after = 4;
        let err = verify_history(&entries, end.balance).unwrap_err();
        assert_eq!(err.code(), ErrorCode::LedgerInconsistency);
    }

    #[test]
    fn test_verify_detects_balance_drift() {
        let (_, entries) = replay(wallet(0), &[LedgerMutation::add(5, "grant")]);
        assert!(verify_history(&entries, 6).is_err());
        assert!(verify_history(&[], 0).is_ok());
    }

    #[test]
    fn test_credit_type_parsing_accepts_column_names() {
        assert_eq!("auto_apply_credits".parse::<CreditType>().unwrap(), CreditType::AutoApply);
        assert_eq!("ai_credits".parse::<CreditType>().unwrap(), CreditType::AiGeneration);
        assert!("gold".parse::<CreditType>().is_err());
    }
}
