//! Admission control: decides whether a scored (candidate, job) pair is queued.
//!
//! Hard filters run in a fixed order and the first failure wins. A filter on
//! an attribute the posting does not state passes. Rejection is a value, not
//! an error: nothing is persisted for rejected pairs.

pub mod settings;

pub use settings::{
    AdmissionFilters, ApplyMode, AutoApplyConfig, QuotaCounters, QuotaDecision, MAX_DAILY_LIMIT,
    MAX_WEEKLY_LIMIT,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::models::{JobPosting, LocationType};
use crate::scoring::{FitIndexResult, SeniorityLevel};

/// Why a pair was not admitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    FitScoreTooLow { score: u32, minimum: u32 },
    LocationTypeNotAllowed,
    LocationNotPreferred,
    SalaryOutOfRange,
    CompanyExcluded,
    CompanyNotIncluded,
    EmploymentTypeNotAllowed,
    SeniorityNotAllowed,
    Expired,
}

impl RejectReason {
    /// Stable label for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FitScoreTooLow { .. } => "fit_score_too_low",
            Self::LocationTypeNotAllowed => "location_type_not_allowed",
            Self::LocationNotPreferred => "location_not_preferred",
            Self::SalaryOutOfRange => "salary_out_of_range",
            Self::CompanyExcluded => "company_excluded",
            Self::CompanyNotIncluded => "company_not_included",
            Self::EmploymentTypeNotAllowed => "employment_type_not_allowed",
            Self::SeniorityNotAllowed => "seniority_not_allowed",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FitScoreTooLow { score, minimum } => {
                write!(f, "fit score {} is below the minimum of {}", score, minimum)
            }
            other => f.write_str(other.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionDecision {
    pub eligible: bool,
    pub reason: Option<RejectReason>,
}

impl AdmissionDecision {
    pub fn admit() -> Self {
        Self {
            eligible: true,
            reason: None,
        }
    }

    pub fn reject(reason: RejectReason) -> Self {
        Self {
            eligible: false,
            reason: Some(reason),
        }
    }
}

/// Run every hard filter against a scored posting.
pub fn admit(
    config: &AutoApplyConfig,
    job: &JobPosting,
    fit: &FitIndexResult,
    now: DateTime<Utc>,
) -> AdmissionDecision {
    match first_rejection(config, job, fit, now) {
        Some(reason) => AdmissionDecision::reject(reason),
        None => AdmissionDecision::admit(),
    }
}

fn first_rejection(
    config: &AutoApplyConfig,
    job: &JobPosting,
    fit: &FitIndexResult,
    now: DateTime<Utc>,
) -> Option<RejectReason> {
    let filters = &config.filters;

    if fit.score < config.min_fit_score {
        return Some(RejectReason::FitScoreTooLow {
            score: fit.score,
            minimum: config.min_fit_score,
        });
    }

    if let Some(location_type) = job.location_type {
        if !filters.location_types.is_empty() && !filters.location_types.contains(&location_type) {
            return Some(RejectReason::LocationTypeNotAllowed);
        }
    }
    if !location_preferred(&filters.preferred_locations, job) {
        return Some(RejectReason::LocationNotPreferred);
    }

    if !salary_overlaps(filters.min_salary, filters.max_salary, job) {
        return Some(RejectReason::SalaryOutOfRange);
    }

    if let Some(company) = job.company.as_deref() {
        let company = company.trim().to_lowercase();
        let listed = |list: &[String]| list.iter().any(|c| c.trim().to_lowercase() == company);

        if listed(&filters.excluded_companies) {
            return Some(RejectReason::CompanyExcluded);
        }
        if !filters.included_companies.is_empty() && !listed(&filters.included_companies) {
            return Some(RejectReason::CompanyNotIncluded);
        }
    }

    if let Some(employment_type) = job.employment_type {
        if !filters.employment_types.is_empty() && !filters.employment_types.contains(&employment_type) {
            return Some(RejectReason::EmploymentTypeNotAllowed);
        }
    }

    // Labels outside the ladder are treated like a missing seniority.
    if let Some(level) = job.seniority.as_deref().and_then(SeniorityLevel::parse_label) {
        if !filters.seniority_levels.is_empty() && !filters.seniority_levels.contains(&level) {
            return Some(RejectReason::SeniorityNotAllowed);
        }
    }

    if job.is_expired(now) {
        return Some(RejectReason::Expired);
    }

    None
}

fn location_preferred(preferred: &[String], job: &JobPosting) -> bool {
    if preferred.is_empty() || job.location_type == Some(LocationType::Remote) {
        return true;
    }
    let Some(location) = job.location.as_deref() else {
        return true;
    };
    let location = location.to_lowercase();
    preferred
        .iter()
        .map(|p| p.trim().to_lowercase())
        .any(|p| !p.is_empty() && location.contains(&p))
}

fn salary_overlaps(min_wanted: Option<i64>, max_wanted: Option<i64>, job: &JobPosting) -> bool {
    if let (Some(job_max), Some(wanted_min)) = (job.salary_max, min_wanted) {
        if job_max < wanted_min {
            return false;
        }
    }
    if let (Some(job_min), Some(wanted_max)) = (job.salary_min, max_wanted) {
        if job_min > wanted_max {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EmploymentType;
    use crate::scoring::ScoreBreakdown;
    use chrono::Duration;

    fn fit(score: u32) -> FitIndexResult {
        FitIndexResult {
            score,
            breakdown: ScoreBreakdown {
                skill_match: score.min(60),
                experience: score.saturating_sub(60).min(20),
                seniority: score.saturating_sub(80).min(10),
                semantic_similarity: score.saturating_sub(90),
            },
            rationale: Vec::new(),
            skill_matches: Vec::new(),
        }
    }

    fn config() -> AutoApplyConfig {
        AutoApplyConfig::new("u-1").enabled(true).with_min_fit_score(60)
    }

    fn reason(config: &AutoApplyConfig, job: &JobPosting, score: u32) -> Option<RejectReason> {
        admit(config, job, &fit(score), Utc::now()).reason
    }

    #[test]
    fn test_admits_bare_posting() {
        let decision = admit(&config(), &JobPosting::new("p-1"), &fit(75), Utc::now());
        assert!(decision.eligible);
        assert!(decision.reason.is_none());
    }

    #[test]
    fn test_fit_threshold() {
        assert_eq!(
            reason(&config(), &JobPosting::new("p-1"), 59),
            Some(RejectReason::FitScoreTooLow { score: 59, minimum: 60 })
        );
        assert_eq!(reason(&config(), &JobPosting::new("p-1"), 60), None);
    }

    #[test]
    fn test_location_filters() {
        let mut config = config();
        config.filters.location_types = vec![LocationType::Remote, LocationType::Hybrid];
        config.filters.preferred_locations = vec!["Berlin".into()];

        let onsite = JobPosting::new("p-1").with_location(LocationType::Onsite, Some("Berlin"));
        assert_eq!(reason(&config, &onsite, 80), Some(RejectReason::LocationTypeNotAllowed));

        let hybrid_munich = JobPosting::new("p-2").with_location(LocationType::Hybrid, Some("Munich, DE"));
        assert_eq!(reason(&config, &hybrid_munich, 80), Some(RejectReason::LocationNotPreferred));

        let hybrid_berlin = JobPosting::new("p-3").with_location(LocationType::Hybrid, Some("berlin mitte"));
        assert_eq!(reason(&config, &hybrid_berlin, 80), None);

        let remote = JobPosting::new("p-4").with_location(LocationType::Remote, Some("Lisbon"));
        assert_eq!(reason(&config, &remote, 80), None);
    }

    #[test]
    fn test_salary_overlap() {
        let mut config = config();
        config.filters.min_salary = Some(100_000);
        config.filters.max_salary = Some(150_000);

        let low = JobPosting::new("p-1").with_salary(Some(60_000), Some(90_000));
        assert_eq!(reason(&config, &low, 80), Some(RejectReason::SalaryOutOfRange));

        let high = JobPosting::new("p-2").with_salary(Some(160_000), None);
        assert_eq!(reason(&config, &high, 80), Some(RejectReason::SalaryOutOfRange));

        let overlapping = JobPosting::new("p-3").with_salary(Some(90_000), Some(110_000));
        assert_eq!(reason(&config, &overlapping, 80), None);

        let unstated = JobPosting::new("p-4");
        assert_eq!(reason(&config, &unstated, 80), None);
    }

    #[test]
    fn test_company_lists() {
        let mut config = config();
        config.filters.excluded_companies = vec!["Initech".into()];
        let job = JobPosting::new("p-1").with_company("initech ");
        assert_eq!(reason(&config, &job, 80), Some(RejectReason::CompanyExcluded));

        config.filters.excluded_companies.clear();
        config.filters.included_companies = vec!["Acme".into()];
        assert_eq!(reason(&config, &job, 80), Some(RejectReason::CompanyNotIncluded));
        assert_eq!(reason(&config, &JobPosting::new("p-2").with_company("ACME"), 80), None);
    }

    #[test]
    fn test_employment_and_seniority() {
        let mut config = config();
        config.filters.employment_types = vec![EmploymentType::FullTime];
        config.filters.seniority_levels = vec![SeniorityLevel::Senior, SeniorityLevel::Lead];

        let contract = JobPosting::new("p-1").with_employment_type(EmploymentType::Contract);
        assert_eq!(reason(&config, &contract, 80), Some(RejectReason::EmploymentTypeNotAllowed));

        let junior = JobPosting::new("p-2").with_seniority("Junior");
        assert_eq!(reason(&config, &junior, 80), Some(RejectReason::SeniorityNotAllowed));

        let staff = JobPosting::new("p-3").with_seniority("staff");
        assert_eq!(reason(&config, &staff, 80), None);

        let unknown = JobPosting::new("p-4").with_seniority("ninja");
        assert_eq!(reason(&config, &unknown, 80), None);
    }

    #[test]
    fn test_expired_posting() {
        let now = Utc::now();
        let job = JobPosting::new("p-1").with_expiry(now - Duration::hours(1));
        let decision = admit(&config(), &job, &fit(90), now);
        assert_eq!(decision.reason, Some(RejectReason::Expired));
    }

    #[test]
    fn test_first_failure_wins() {
        let mut config = config();
        config.filters.excluded_companies = vec!["Initech".into()];
        let job = JobPosting::new("p-1")
            .with_company("Initech")
            .with_expiry(Utc::now() - Duration::days(1));
        assert!(matches!(
            reason(&config, &job, 10),
            Some(RejectReason::FitScoreTooLow { .. })
        ));
        assert_eq!(reason(&config, &job, 90), Some(RejectReason::CompanyExcluded));
    }
}
