//! The seniority ladder shared by scoring and admission filters.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Ordered seniority levels. Declaration order is the ladder order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeniorityLevel {
    Intern,
    Junior,
    Mid,
    Senior,
    Lead,
    Principal,
    Executive,
}

impl SeniorityLevel {
    /// Map a free-form label onto the ladder. Returns `None` for unknown labels.
    pub fn parse_label(label: &str) -> Option<Self> {
        let normalized = label.trim().to_lowercase().replace(['-', '_'], " ");
        let level = match normalized.as_str() {
            "intern" | "internship" | "trainee" | "apprentice" => Self::Intern,
            "junior" | "jr" | "entry" | "entry level" | "graduate" | "associate" => Self::Junior,
            "mid" | "mid level" | "intermediate" | "regular" => Self::Mid,
            "senior" | "sr" | "experienced" => Self::Senior,
            "lead" | "team lead" | "tech lead" | "staff" | "manager" => Self::Lead,
            "principal" | "distinguished" | "architect" | "director" => Self::Principal,
            "executive" | "vp" | "vice president" | "head" | "cto" | "c level" => Self::Executive,
            _ => return None,
        };
        Some(level)
    }

    fn rank(self) -> i32 {
        self as i32
    }

    /// Number of ladder steps between two levels.
    pub fn distance(self, other: Self) -> u32 {
        (self.rank() - other.rank()).unsigned_abs()
    }
}

impl FromStr for SeniorityLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_label(s).ok_or_else(|| format!("unknown seniority level: {}", s))
    }
}

impl fmt::Display for SeniorityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Intern => "intern",
            Self::Junior => "junior",
            Self::Mid => "mid",
            Self::Senior => "senior",
            Self::Lead => "lead",
            Self::Principal => "principal",
            Self::Executive => "executive",
        };
        write!(f, "{}", s)
    }
}
