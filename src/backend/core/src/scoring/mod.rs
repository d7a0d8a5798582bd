//! Fit Index scoring.
//!
//! Converts a candidate profile and a job posting into a 0-100 score with an
//! auditable breakdown:
//!
//! | component            | cap | source                                    |
//! |----------------------|-----|-------------------------------------------|
//! | skill match          | 60  | required / preferred skill coverage       |
//! | experience           | 20  | candidate years vs the job's range        |
//! | seniority            | 10  | ladder distance between labels            |
//! | semantic similarity  | 10  | externally supplied 0.0-1.0 similarity    |
//!
//! Scoring never fails. A missing input zeroes its component and adds a note
//! to the rationale.

pub mod seniority;
pub mod skills;

pub use seniority::SeniorityLevel;
pub use skills::{MatchKind, SkillMatch, SkillTaxonomy};

use crate::collaborators::SimilarityModel;
use crate::models::{CandidateProfile, JobPosting};
use serde::{Deserialize, Serialize};

/// Maximum skill-match points.
pub const SKILL_CAP: u32 = 60;
/// Share of the skill cap given to required skills when preferred skills are also listed.
pub const REQUIRED_SKILL_CAP: u32 = 45;
pub const PREFERRED_SKILL_CAP: u32 = SKILL_CAP - REQUIRED_SKILL_CAP;
pub const EXPERIENCE_CAP: u32 = 20;
pub const SENIORITY_CAP: u32 = 10;
pub const SIMILARITY_CAP: u32 = 10;
pub const MAX_SCORE: u32 = 100;

/// Points lost per year below the job's minimum.
const SHORTFALL_PENALTY: f64 = 5.0;
/// Points lost per year above the job's maximum.
const OVERQUALIFIED_PENALTY: f64 = 3.0;

/// Per-component points. Each field is bounded by its cap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub skill_match: u32,
    pub experience: u32,
    pub seniority: u32,
    pub semantic_similarity: u32,
}

impl ScoreBreakdown {
    pub fn total(&self) -> u32 {
        self.skill_match + self.experience + self.seniority + self.semantic_similarity
    }

    /// True when every component respects its cap.
    pub fn within_caps(&self) -> bool {
        self.skill_match <= SKILL_CAP
            && self.experience <= EXPERIENCE_CAP
            && self.seniority <= SENIORITY_CAP
            && self.semantic_similarity <= SIMILARITY_CAP
    }
}

/// Output of one scoring run. Computed on demand and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitIndexResult {
    pub score: u32,
    pub breakdown: ScoreBreakdown,
    /// Ordered notes explaining each component
    pub rationale: Vec<String>,
    pub skill_matches: Vec<SkillMatch>,
}

/// Deterministic, side-effect-free Fit Index scorer.
#[derive(Debug, Clone, Default)]
pub struct FitIndexScorer {
    taxonomy: SkillTaxonomy,
}

impl FitIndexScorer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_taxonomy(mut self, taxonomy: SkillTaxonomy) -> Self {
        self.taxonomy = taxonomy;
        self
    }

    /// Score a candidate against a posting. `similarity` is the externally
    /// computed semantic similarity, if any.
    pub fn score(
        &self,
        candidate: &CandidateProfile,
        job: &JobPosting,
        similarity: Option<f64>,
    ) -> FitIndexResult {
        let mut rationale = Vec::new();

        let skill_matches = self.taxonomy.match_skills(
            &candidate.skills,
            &job.required_skills,
            &job.preferred_skills,
        );

        let breakdown = ScoreBreakdown {
            skill_match: skill_points(&skill_matches, &mut rationale),
            experience: experience_points(candidate, job, &mut rationale),
            seniority: seniority_points(candidate, job, &mut rationale),
            semantic_similarity: similarity_points(similarity, &mut rationale),
        };

        FitIndexResult {
            score: breakdown.total().min(MAX_SCORE),
            breakdown,
            rationale,
            skill_matches,
        }
    }

    /// Score with similarity fetched from `model`. A failing model counts as missing similarity.
    pub async fn score_with_model(
        &self,
        model: &dyn SimilarityModel,
        candidate: &CandidateProfile,
        job: &JobPosting,
    ) -> FitIndexResult {
        let similarity = match (candidate.summary.as_deref(), job.description.as_deref()) {
            (Some(summary), Some(description)) => match model.similarity(summary, description).await {
                Ok(value) => Some(value),
                Err(e) => {
                    tracing::warn!(
                        job_id = %job.job_id,
                        user_id = %candidate.user_id,
                        error = %e,
                        "Similarity model unavailable, scoring without it"
                    );
                    None
                }
            },
            _ => None,
        };

        self.score(candidate, job, similarity)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Components
// ─────────────────────────────────────────────────────────────────────────────

/// `cap * earned / possible`, rounded half-up in integer arithmetic.
fn scaled(cap: u32, earned: u32, possible: u32) -> u32 {
    if possible == 0 {
        return 0;
    }
    (2 * cap * earned + possible) / (2 * possible)
}

fn skill_points(matches: &[SkillMatch], rationale: &mut Vec<String>) -> u32 {
    let (required, preferred): (Vec<&SkillMatch>, Vec<&SkillMatch>) =
        matches.iter().partition(|m| m.required);

    if matches.is_empty() {
        rationale.push("Job lists no skills; skill match not scored".to_string());
        return 0;
    }

    let (required_cap, preferred_cap) = match (required.is_empty(), preferred.is_empty()) {
        (false, true) => (SKILL_CAP, 0),
        (true, false) => (0, SKILL_CAP),
        _ => (REQUIRED_SKILL_CAP, PREFERRED_SKILL_CAP),
    };

    let mut points = 0;
    for (group, cap, label) in [
        (&required, required_cap, "required"),
        (&preferred, preferred_cap, "preferred"),
    ] {
        if group.is_empty() {
            continue;
        }
        let earned: u32 = group.iter().map(|m| m.units()).sum();
        let possible = 2 * group.len() as u32;
        points += scaled(cap, earned, possible);
        rationale.push(describe_coverage(label, group));
    }

    points.min(SKILL_CAP)
}

fn skills_where<'a>(group: &[&'a SkillMatch], keep: impl Fn(&MatchKind) -> bool) -> Vec<&'a str> {
    group
        .iter()
        .filter(|m| keep(&m.kind))
        .map(|m| m.skill.as_str())
        .collect()
}

fn describe_coverage(label: &str, group: &[&SkillMatch]) -> String {
    let exact = skills_where(group, |k| matches!(k, MatchKind::Exact));
    let transferable = skills_where(group, |k| matches!(k, MatchKind::Transferable { .. }));
    let missing = skills_where(group, |k| matches!(k, MatchKind::Missing));

    let mut note = format!("Matched {} of {} {} skills", exact.len(), group.len(), label);
    if !exact.is_empty() {
        note.push_str(&format!(" ({})", exact.join(", ")));
    }
    if !transferable.is_empty() {
        note.push_str(&format!("; transferable: {}", transferable.join(", ")));
    }
    if !missing.is_empty() {
        note.push_str(&format!("; missing: {}", missing.join(", ")));
    }
    note
}

fn experience_points(candidate: &CandidateProfile, job: &JobPosting, rationale: &mut Vec<String>) -> u32 {
    let Some(years) = candidate.years_experience.filter(|y| y.is_finite() && *y >= 0.0) else {
        rationale.push("Candidate experience not provided; experience not scored".to_string());
        return 0;
    };

    if job.min_years.is_none() && job.max_years.is_none() {
        rationale.push("Job states no experience range; experience not scored".to_string());
        return 0;
    }

    let cap = EXPERIENCE_CAP as f64;
    let points = match (job.min_years, job.max_years) {
        (Some(min), _) if years < min => {
            let short = min - years;
            rationale.push(format!("{} years experience, {} short of the {} minimum", years, short, min));
            (cap - SHORTFALL_PENALTY * short).max(0.0)
        }
        (_, Some(max)) if years > max => {
            let over = years - max;
            rationale.push(format!("{} years experience, {} above the {} maximum", years, over, max));
            (cap - OVERQUALIFIED_PENALTY * over).max(0.0)
        }
        _ => {
            rationale.push(format!("{} years experience is within the job's range", years));
            cap
        }
    };

    (points.round() as u32).min(EXPERIENCE_CAP)
}

fn seniority_points(candidate: &CandidateProfile, job: &JobPosting, rationale: &mut Vec<String>) -> u32 {
    let candidate_level = candidate.seniority.as_deref().and_then(SeniorityLevel::parse_label);
    let job_level = job.seniority.as_deref().and_then(SeniorityLevel::parse_label);

    let (Some(have), Some(want)) = (candidate_level, job_level) else {
        rationale.push("Seniority missing or unrecognized; seniority not scored".to_string());
        return 0;
    };

    let points = match have.distance(want) {
        0 => SENIORITY_CAP,
        1 => SENIORITY_CAP / 2,
        _ => 0,
    };
    rationale.push(format!("Seniority {} vs required {}", have, want));
    points
}

fn similarity_points(similarity: Option<f64>, rationale: &mut Vec<String>) -> u32 {
    let Some(value) = similarity.filter(|v| !v.is_nan()) else {
        rationale.push("Semantic similarity unavailable; not scored".to_string());
        return 0;
    };
    let clamped = value.clamp(0.0, 1.0);
    rationale.push(format!("Semantic similarity {:.2}", clamped));
    (clamped * SIMILARITY_CAP as f64).round() as u32
}
