//! Per-user auto-apply settings and the quota bookkeeping that rides on them.

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::error::{AutoApplyError, Result};
use crate::models::{EmploymentType, LocationType};
use crate::scoring::SeniorityLevel;

/// Upper bound for `max_per_day`.
pub const MAX_DAILY_LIMIT: u32 = 100;
/// Upper bound for `max_per_week`.
pub const MAX_WEEKLY_LIMIT: u32 = 700;

// ═══════════════════════════════════════════════════════════════════════════════
// Apply Mode
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyMode {
    /// Jobs wait for explicit user approval before dispatch
    #[default]
    ApplyAssist,
    /// Jobs are dispatched as soon as quota allows
    AutoApply,
}

impl fmt::Display for ApplyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ApplyAssist => write!(f, "apply_assist"),
            Self::AutoApply => write!(f, "auto_apply"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Filters
// ═══════════════════════════════════════════════════════════════════════════════

/// Hard filters applied at admission. Empty lists and `None` mean "no filter".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionFilters {
    pub location_types: Vec<LocationType>,
    /// City or region fragments; only checked for non-remote jobs
    pub preferred_locations: Vec<String>,
    pub min_salary: Option<i64>,
    pub max_salary: Option<i64>,
    pub excluded_companies: Vec<String>,
    /// When non-empty, only these companies are admitted
    pub included_companies: Vec<String>,
    pub employment_types: Vec<EmploymentType>,
    pub seniority_levels: Vec<SeniorityLevel>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Quota
// ═══════════════════════════════════════════════════════════════════════════════

/// Dispatch counters. Only the store's atomic quota operations write these.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaCounters {
    pub daily_count: u32,
    pub weekly_count: u32,
    pub last_daily_reset: Option<DateTime<Utc>>,
    pub last_weekly_reset: Option<DateTime<Utc>>,
}

/// Result of trying to reserve one dispatch slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaDecision {
    Granted,
    DailyLimitReached,
    WeeklyLimitReached,
}

impl QuotaDecision {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Granted => "granted",
            Self::DailyLimitReached => "daily_limit",
            Self::WeeklyLimitReached => "weekly_limit",
        }
    }
}

fn iso_week_key(at: DateTime<Utc>) -> (i32, u32) {
    let week = at.iso_week();
    (week.year(), week.week())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Auto-Apply Config
// ═══════════════════════════════════════════════════════════════════════════════

/// One user's auto-apply settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoApplyConfig {
    pub user_id: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub mode: ApplyMode,
    #[serde(default = "default_min_fit_score")]
    pub min_fit_score: u32,
    #[serde(default = "default_max_per_day")]
    pub max_per_day: u32,
    #[serde(default = "default_max_per_week")]
    pub max_per_week: u32,
    #[serde(default)]
    pub filters: AdmissionFilters,
    #[serde(default = "default_true")]
    pub use_default_resume: bool,
    #[serde(default)]
    pub auto_generate_cover_letter: bool,
    #[serde(default = "default_true")]
    pub notify_on_success: bool,
    #[serde(default = "default_true")]
    pub notify_on_failure: bool,
    #[serde(default)]
    pub pause_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub quota: QuotaCounters,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

fn default_min_fit_score() -> u32 { 70 }
fn default_max_per_day() -> u32 { 10 }
fn default_max_per_week() -> u32 { 50 }
fn default_true() -> bool { true }

impl AutoApplyConfig {
    /// Disabled settings in apply-assist mode with default limits.
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            enabled: false,
            mode: ApplyMode::default(),
            min_fit_score: default_min_fit_score(),
            max_per_day: default_max_per_day(),
            max_per_week: default_max_per_week(),
            filters: AdmissionFilters::default(),
            use_default_resume: true,
            auto_generate_cover_letter: false,
            notify_on_success: true,
            notify_on_failure: true,
            pause_until: None,
            quota: QuotaCounters::default(),
            updated_at: None,
        }
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_mode(mut self, mode: ApplyMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_min_fit_score(mut self, score: u32) -> Self {
        self.min_fit_score = score;
        self
    }

    pub fn with_limits(mut self, per_day: u32, per_week: u32) -> Self {
        self.max_per_day = per_day;
        self.max_per_week = per_week;
        self
    }

    pub fn with_filters(mut self, filters: AdmissionFilters) -> Self {
        self.filters = filters;
        self
    }

    pub fn paused_until(mut self, until: DateTime<Utc>) -> Self {
        self.pause_until = Some(until);
        self
    }

    pub fn is_paused(&self, now: DateTime<Utc>) -> bool {
        self.pause_until.is_some_and(|until| until > now)
    }

    /// Whether jobs queued under these settings start out approved.
    pub fn auto_approves(&self) -> bool {
        self.mode == ApplyMode::AutoApply
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Validation
    // ─────────────────────────────────────────────────────────────────────────

    /// Check user-editable fields. Errors name the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.user_id.trim().is_empty() {
            return Err(AutoApplyError::invalid_field("user_id", "must not be empty"));
        }
        if self.min_fit_score > 100 {
            return Err(AutoApplyError::invalid_field("min_fit_score", "must be between 0 and 100"));
        }
        if !(1..=MAX_DAILY_LIMIT).contains(&self.max_per_day) {
            return Err(AutoApplyError::invalid_field(
                "max_per_day",
                format!("must be between 1 and {}", MAX_DAILY_LIMIT),
            ));
        }
        if self.max_per_week < self.max_per_day {
            return Err(AutoApplyError::invalid_field(
                "max_per_week",
                "must be at least max_per_day",
            ));
        }
        if self.max_per_week > MAX_WEEKLY_LIMIT {
            return Err(AutoApplyError::invalid_field(
                "max_per_week",
                format!("must not exceed {}", MAX_WEEKLY_LIMIT),
            ));
        }

        let filters = &self.filters;
        for (field, value) in [("min_salary", filters.min_salary), ("max_salary", filters.max_salary)] {
            if value.is_some_and(|v| v < 0) {
                return Err(AutoApplyError::invalid_field(field, "must not be negative"));
            }
        }
        if let (Some(min), Some(max)) = (filters.min_salary, filters.max_salary) {
            if max < min {
                return Err(AutoApplyError::invalid_field("max_salary", "must be at least min_salary"));
            }
        }

        let excluded: BTreeSet<String> = filters
            .excluded_companies
            .iter()
            .map(|c| c.trim().to_lowercase())
            .collect();
        if let Some(company) = filters
            .included_companies
            .iter()
            .find(|c| excluded.contains(&c.trim().to_lowercase()))
        {
            return Err(AutoApplyError::invalid_field(
                "included_companies",
                format!("'{}' is also excluded", company),
            ));
        }

        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Quota
    // ─────────────────────────────────────────────────────────────────────────

    /// Zero the counters whose window (UTC day, ISO week) has passed.
    pub fn roll_counters(&mut self, now: DateTime<Utc>) {
        let quota = &mut self.quota;

        let daily_stale = quota
            .last_daily_reset
            .map_or(true, |last| last.date_naive() < now.date_naive());
        if daily_stale {
            quota.daily_count = 0;
            quota.last_daily_reset = Some(now);
        }

        let weekly_stale = quota
            .last_weekly_reset
            .map_or(true, |last| iso_week_key(last) < iso_week_key(now));
        if weekly_stale {
            quota.weekly_count = 0;
            quota.last_weekly_reset = Some(now);
        }
    }

    /// Roll, check both limits and reserve one slot when allowed.
    pub fn try_consume(&mut self, now: DateTime<Utc>) -> QuotaDecision {
        self.roll_counters(now);

        if self.quota.daily_count >= self.max_per_day {
            return QuotaDecision::DailyLimitReached;
        }
        if self.quota.weekly_count >= self.max_per_week {
            return QuotaDecision::WeeklyLimitReached;
        }

        self.quota.daily_count += 1;
        self.quota.weekly_count += 1;
        QuotaDecision::Granted
    }

    /// Give back a slot reserved by [`try_consume`](Self::try_consume) that went unused.
    pub fn release(&mut self, now: DateTime<Utc>) {
        self.roll_counters(now);
        self.quota.daily_count = self.quota.daily_count.saturating_sub(1);
        self.quota.weekly_count = self.quota.weekly_count.saturating_sub(1);
    }

    /// Take user-editable fields from `incoming`, keeping the current counters.
    pub fn merge_user_fields(&mut self, incoming: AutoApplyConfig, now: DateTime<Utc>) {
        let quota = std::mem::take(&mut self.quota);
        *self = incoming;
        self.quota = quota;
        self.updated_at = Some(now);
    }
}
