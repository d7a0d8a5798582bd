//! Skill normalization and matching.
//!
//! Skills are compared after lowercasing, trimming and alias resolution
//! (`js` → `javascript`). Two different skills in the same family
//! (`mysql` and `postgresql`) count as a transferable match.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// How a job skill was covered by the candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatchKind {
    /// The candidate lists the skill itself.
    Exact,
    /// The candidate lists a sibling skill from the same family.
    Transferable { via: String },
    Missing,
}

/// One job skill and how the candidate covers it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillMatch {
    pub skill: String,
    pub required: bool,
    #[serde(flatten)]
    pub kind: MatchKind,
}

impl SkillMatch {
    /// Exact matches earn two units, transferable one.
    pub fn units(&self) -> u32 {
        match self.kind {
            MatchKind::Exact => 2,
            MatchKind::Transferable { .. } => 1,
            MatchKind::Missing => 0,
        }
    }
}

const ALIASES: &[(&str, &str)] = &[
    ("js", "javascript"),
    ("ecmascript", "javascript"),
    ("ts", "typescript"),
    ("py", "python"),
    ("python3", "python"),
    ("golang", "go"),
    ("k8s", "kubernetes"),
    ("postgres", "postgresql"),
    ("psql", "postgresql"),
    ("mongo", "mongodb"),
    ("amazon web services", "aws"),
    ("google cloud", "gcp"),
    ("google cloud platform", "gcp"),
    ("ms azure", "azure"),
    ("react.js", "react"),
    ("reactjs", "react"),
    ("vue.js", "vue"),
    ("vuejs", "vue"),
    ("node", "nodejs"),
    ("node.js", "nodejs"),
    ("c sharp", "c#"),
    ("csharp", "c#"),
    ("cpp", "c++"),
    ("ml", "machine learning"),
    ("tf", "tensorflow"),
    ("sklearn", "scikit-learn"),
];

const FAMILIES: &[(&str, &[&str])] = &[
    ("sql_databases", &["sql", "postgresql", "mysql", "sqlite", "mariadb", "sql server", "oracle"]),
    ("document_stores", &["mongodb", "couchdb", "dynamodb", "firestore"]),
    ("cloud", &["aws", "gcp", "azure"]),
    ("containers", &["docker", "kubernetes", "podman", "openshift"]),
    ("frontend_frameworks", &["react", "vue", "angular", "svelte"]),
    ("js_languages", &["javascript", "typescript"]),
    ("jvm_languages", &["java", "kotlin", "scala"]),
    ("systems_languages", &["c", "c++", "rust", "go"]),
    ("scripting_languages", &["python", "ruby", "perl"]),
    ("ml_frameworks", &["tensorflow", "pytorch", "keras", "scikit-learn"]),
    ("ci_cd", &["jenkins", "github actions", "gitlab ci", "circleci"]),
    ("iac", &["terraform", "pulumi", "cloudformation", "ansible"]),
];

/// Alias and family tables used to compare skills.
#[derive(Debug, Clone)]
pub struct SkillTaxonomy {
    aliases: HashMap<String, String>,
    families: HashMap<String, &'static str>,
}

impl Default for SkillTaxonomy {
    fn default() -> Self {
        let aliases = ALIASES
            .iter()
            .map(|(from, to)| (from.to_string(), to.to_string()))
            .collect();
        let families = FAMILIES
            .iter()
            .flat_map(|(family, members)| members.iter().map(move |m| (m.to_string(), *family)))
            .collect();
        Self { aliases, families }
    }
}

impl SkillTaxonomy {
    /// Add or replace an alias. Both sides are normalized.
    pub fn with_alias(mut self, alias: &str, canonical: &str) -> Self {
        let canonical = self.normalize(canonical);
        self.aliases.insert(clean(alias), canonical);
        self
    }

    /// Canonical form of a skill label. Empty after trimming yields an empty string.
    pub fn normalize(&self, raw: &str) -> String {
        let cleaned = clean(raw);
        self.aliases.get(&cleaned).cloned().unwrap_or(cleaned)
    }

    pub fn family_of(&self, skill: &str) -> Option<&'static str> {
        self.families.get(skill).copied()
    }

    /// Match every job skill against the candidate's skills.
    ///
    /// Duplicate job skills (after normalization) are reported once; a skill
    /// listed as both required and preferred counts as required.
    pub fn match_skills(
        &self,
        candidate_skills: &[String],
        required: &[String],
        preferred: &[String],
    ) -> Vec<SkillMatch> {
        let owned: BTreeSet<String> = candidate_skills
            .iter()
            .map(|s| self.normalize(s))
            .filter(|s| !s.is_empty())
            .collect();

        let mut seen = BTreeSet::new();
        let mut matches = Vec::new();

        let tagged = required
            .iter()
            .map(|s| (s, true))
            .chain(preferred.iter().map(|s| (s, false)));

        for (raw, is_required) in tagged {
            let skill = self.normalize(raw);
            if skill.is_empty() || !seen.insert(skill.clone()) {
                continue;
            }

            let kind = if owned.contains(&skill) {
                MatchKind::Exact
            } else if let Some(via) = self.sibling_of(&skill, &owned) {
                MatchKind::Transferable { via }
            } else {
                MatchKind::Missing
            };

            matches.push(SkillMatch {
                skill,
                required: is_required,
                kind,
            });
        }

        matches
    }

    // BTreeSet iteration keeps the chosen sibling deterministic.
    fn sibling_of(&self, skill: &str, owned: &BTreeSet<String>) -> Option<String> {
        let family = self.family_of(skill)?;
        owned
            .iter()
            .find(|candidate| self.family_of(candidate) == Some(family))
            .cloned()
    }
}

fn clean(raw: &str) -> String {
    raw.trim().to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}
