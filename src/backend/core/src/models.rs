//! Read-only records owned by other services: candidate profiles and job postings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A candidate's profile as served by the profile directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateProfile {
    pub user_id: String,
    #[serde(default)]
    pub skills: Vec<String>,
    pub years_experience: Option<f64>,
    /// Free-form seniority label ("Senior", "staff", "entry level", ...)
    pub seniority: Option<String>,
    /// Text compared against the job description for semantic similarity
    pub summary: Option<String>,
    pub default_resume_id: Option<String>,
    pub default_cover_letter_id: Option<String>,
}

impl CandidateProfile {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Default::default()
        }
    }

    pub fn with_skills<I, S>(mut self, skills: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skills = skills.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_experience(mut self, years: f64) -> Self {
        self.years_experience = Some(years);
        self
    }

    pub fn with_seniority(mut self, label: impl Into<String>) -> Self {
        self.seniority = Some(label.into());
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn with_default_resume(mut self, resume_id: impl Into<String>) -> Self {
        self.default_resume_id = Some(resume_id.into());
        self
    }
}

/// Where the work happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationType {
    Remote,
    Hybrid,
    Onsite,
}

impl fmt::Display for LocationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Remote => "remote",
            Self::Hybrid => "hybrid",
            Self::Onsite => "onsite",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmploymentType {
    FullTime,
    PartTime,
    Contract,
    Internship,
    Temporary,
}

impl fmt::Display for EmploymentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::FullTime => "full_time",
            Self::PartTime => "part_time",
            Self::Contract => "contract",
            Self::Internship => "internship",
            Self::Temporary => "temporary",
        };
        write!(f, "{}", s)
    }
}

/// A job posting as served by the job catalog. Everything except the id is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobPosting {
    pub job_id: String,
    pub title: Option<String>,
    pub company: Option<String>,
    #[serde(default)]
    pub required_skills: Vec<String>,
    #[serde(default)]
    pub preferred_skills: Vec<String>,
    pub min_years: Option<f64>,
    pub max_years: Option<f64>,
    pub seniority: Option<String>,
    pub salary_min: Option<i64>,
    pub salary_max: Option<i64>,
    pub location_type: Option<LocationType>,
    pub location: Option<String>,
    pub employment_type: Option<EmploymentType>,
    /// Board or ATS the posting was ingested from
    pub source: Option<String>,
    pub description: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl JobPosting {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            ..Default::default()
        }
    }

    pub fn with_required_skills<I, S>(mut self, skills: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_skills = skills.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_preferred_skills<I, S>(mut self, skills: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.preferred_skills = skills.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_experience_range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min_years = min;
        self.max_years = max;
        self
    }

    pub fn with_seniority(mut self, label: impl Into<String>) -> Self {
        self.seniority = Some(label.into());
        self
    }

    pub fn with_company(mut self, company: impl Into<String>) -> Self {
        self.company = Some(company.into());
        self
    }

    pub fn with_salary(mut self, min: Option<i64>, max: Option<i64>) -> Self {
        self.salary_min = min;
        self.salary_max = max;
        self
    }

    pub fn with_location(mut self, location_type: LocationType, location: Option<&str>) -> Self {
        self.location_type = Some(location_type);
        self.location = location.map(str::to_string);
        self
    }

    pub fn with_employment_type(mut self, employment_type: EmploymentType) -> Self {
        self.employment_type = Some(employment_type);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// True when the posting carries an expiry at or before `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_posting_deserializes_with_missing_fields() {
        let posting: JobPosting = serde_json::from_str(
            r#"{"job_id": "j-1", "location_type": "remote", "employment_type": "full_time"}"#,
        )
        .unwrap();
        assert_eq!(posting.location_type, Some(LocationType::Remote));
        assert_eq!(posting.employment_type, Some(EmploymentType::FullTime));
        assert!(posting.required_skills.is_empty());
        assert!(posting.salary_max.is_none());
    }

    #[test]
    fn test_expiry() {
        let now = Utc::now();
        assert!(!JobPosting::new("a").is_expired(now));
        assert!(JobPosting::new("a").with_expiry(now).is_expired(now));
        assert!(!JobPosting::new("a").with_expiry(now + Duration::days(1)).is_expired(now));
    }
}
